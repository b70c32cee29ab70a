use logos::Logos;

use crate::ast::{SourceMap, Span};

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"#[^\n]*", allow_greedy = true))]
pub enum Token {
    // Keywords
    #[token("fn")]
    Fn,
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("while")]
    While,
    #[token("for")]
    For,
    #[token("return")]
    Return,
    #[token("print")]
    Print,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("struct")]
    Struct,
    #[token("impl")]
    Impl,
    #[token("assert")]
    Assert,
    #[token("use")]
    Use,
    #[token("yield")]
    Yield,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    // Punctuation
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token("@")]
    At,
    #[token("->")]
    Arrow,

    // Arithmetic
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("++")]
    PlusPlus,

    // Bitwise and logical
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("!")]
    Bang,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,

    // Comparison
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEq,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEq,

    // Assignment
    #[token("=")]
    Assign,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("*=")]
    StarAssign,
    #[token("/=")]
    SlashAssign,
    #[token("%=")]
    PercentAssign,
    #[token("&=")]
    AmpAssign,
    #[token("|=")]
    PipeAssign,
    #[token("^=")]
    CaretAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,

    // Literals
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

/// Strips the quotes and resolves escapes. `None` on an unknown escape.
fn unescape(raw: &str) -> Option<String> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        out.push(match chars.next()? {
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            '\\' => '\\',
            '"' => '"',
            _ => return None,
        });
    }
    Some(out)
}

/// Pull-based lexer over one source text. Not rewindable; build a new one to restart.
pub struct Lexer<'s> {
    inner: logos::Lexer<'s, Token>,
    source: &'s str,
    map: SourceMap,
}

impl<'s> Lexer<'s> {
    pub fn new(source: &'s str) -> Self {
        Lexer { inner: Token::lexer(source), source, map: SourceMap::new(source) }
    }

    /// Next token with its byte span. `Ok(None)` marks the end of the stream and
    /// keeps being returned once reached.
    pub fn next_token(&mut self) -> Result<Option<(Token, Span)>, LexError> {
        match self.inner.next() {
            None => Ok(None),
            Some(Ok(token)) => {
                let range = self.inner.span();
                Ok(Some((token, Span { start: range.start, end: range.end })))
            }
            Some(Err(())) => {
                let range = self.inner.span();
                let snippet = self.source[range.clone()].to_string();
                let message = if snippet.starts_with('"') {
                    if snippet.len() > 1 && snippet.ends_with('"') {
                        "invalid escape sequence".to_string()
                    } else {
                        "unterminated string".to_string()
                    }
                } else {
                    format!("unexpected character '{}'", snippet)
                };
                Err(LexError {
                    line: self.map.lookup(range.start).0,
                    span: Span { start: range.start, end: range.end },
                    snippet,
                    message,
                })
            }
        }
    }
}

/// Lex source code into a stream of tokens with positions.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token()? {
        tokens.push(tok);
    }
    Ok(tokens)
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} on line {line}")]
pub struct LexError {
    pub line: usize,
    pub span: Span,
    pub snippet: String,
    pub message: String,
}
