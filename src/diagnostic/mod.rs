pub mod ansi;
pub mod json;

use crate::Error;
use crate::ast::Span;

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Pipeline stage that reported the error, printed as the line prefix.
    pub component: &'static str,
    pub message: String,
    pub label: Option<Label>,
    pub notes: Vec<String>,
    pub source: Option<String>,
    pub path: Option<String>,
}

impl Diagnostic {
    pub fn error(component: &'static str, message: impl Into<String>) -> Self {
        Diagnostic {
            component,
            message: message.into(),
            label: None,
            notes: Vec::new(),
            source: None,
            path: None,
        }
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.label = Some(Label { span, message: label.into() });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Attach the root module's text unless the error already points into another file.
    pub fn or_source(self, source: &str, path: &str) -> Self {
        if self.source.is_some() {
            return self;
        }
        self.with_source(source).with_path(path)
    }
}

impl From<&Error> for Diagnostic {
    fn from(e: &Error) -> Self {
        let mut d = Diagnostic::error(e.component(), e.to_string());
        if let Some(span) = e.span() {
            d = d.with_span(span, "here");
        }
        match e {
            Error::Imported { path, text, .. } => {
                let path = path.display().to_string();
                d.with_note(format!("in module '{path}'")).with_source(text.as_str()).with_path(path)
            }
            Error::Runtime(err) => match &err.origin {
                Some(origin) => d.with_source(origin.source.as_str()).with_path(origin.path.display().to_string()),
                None => d,
            },
            Error::Parse(errors) => errors.iter().skip(1).fold(d, |d, extra| d.with_note(extra.message.as_str())),
            _ => d,
        }
    }
}
