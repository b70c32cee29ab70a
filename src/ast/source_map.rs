/// Maps byte offsets to line/column positions within source text.
#[derive(Debug, Clone)]
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.bytes().enumerate().filter(|&(_, b)| b == b'\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line + 1, col + 1)
    }

    /// Returns the text of the given 1-based line, without its line terminator.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self.line_starts.get(line).copied().unwrap_or(source.len());
        source[start..end].trim_end_matches('\n').trim_end_matches('\r')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let src = "let x = 3; print x;";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(4), (1, 5));
        assert_eq!(sm.lookup(11), (1, 12));
    }

    #[test]
    fn multi_line() {
        let src = "let x = 0;\nwhile (x < 3) {\n  x += 1;\n}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(10), (1, 11)); // newline after the let
        assert_eq!(sm.lookup(11), (2, 1));  // 'w' of while
        assert_eq!(sm.lookup(29), (3, 3));  // 'x' inside the body
    }

    #[test]
    fn line_text_lines() {
        let src = "fn f() {\r\n  return 1;\r\n}";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "fn f() {");
        assert_eq!(sm.line_text(src, 2), "  return 1;");
        assert_eq!(sm.line_text(src, 3), "}");
    }

    #[test]
    fn line_text_out_of_bounds() {
        let src = "print 1;";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 9), "");
    }

    #[test]
    fn empty_and_trailing_newline() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));

        let src = "print 1;\n";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "print 1;");
        assert_eq!(sm.line_text(src, 2), "");
    }
}
