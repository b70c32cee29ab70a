use super::Diagnostic;
use crate::ast::SourceMap;

pub fn render(d: &Diagnostic) -> String {
    let mut obj = serde_json::json!({
        "severity": "error",
        "component": d.component,
        "message": d.message,
        "notes": d.notes,
    });

    if let Some(label) = &d.label {
        let mut span = serde_json::json!({
            "start": label.span.start,
            "end": label.span.end,
            "message": label.message,
        });
        if let Some(source) = &d.source {
            let (line, col) = SourceMap::new(source).lookup(label.span.start);
            span["line"] = serde_json::Value::from(line);
            span["col"] = serde_json::Value::from(col);
        }
        obj["span"] = span;
    }

    if let Some(path) = &d.path {
        obj["path"] = serde_json::Value::String(path.clone());
    }

    serde_json::to_string(&obj)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}
