//! Dotted path grammar for addressing components.
//!
//! ```text
//! path    = segment ( "." segment | "[" key "]" )*
//! segment = attribute name (no '.', '[' or ']')
//! key     = raw text without ']' | JSON string literal
//! ```
//!
//! A bracketed key is resolved against the container it lands on: lists parse
//! it as an index, mappings look it up verbatim.

use std::fmt;

use crate::error::{ProgramError, Result};

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// `name` — an attribute of a module.
    Attr(String),
    /// `[key]` — an element of a list or mapping.
    Item(String),
}

impl Segment {
    pub fn index(index: usize) -> Self {
        Segment::Item(index.to_string())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Attr(name) => f.write_str(name),
            Segment::Item(key) => f.write_str(&render_item(key)),
        }
    }
}

/// Append an attribute name to `prefix`.
pub fn join_attr(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Append a bracketed list index or mapping key to `prefix`.
pub fn join_item(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, render_item(key))
}

fn render_item(key: &str) -> String {
    if needs_quoting(key) {
        // serde_json emits a valid literal for any str
        let quoted = serde_json::Value::String(key.to_string()).to_string();
        format!("[{}]", quoted)
    } else {
        format!("[{}]", key)
    }
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.contains(']') || key.starts_with('"')
}

/// True if `name` can appear as an attribute segment.
pub fn is_addressable_attr(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '[', ']'])
}

/// Render parsed segments back into a path string.
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Attr(name) => out = join_attr(&out, name),
            Segment::Item(key) => out = join_item(&out, key),
        }
    }
    out
}

/// Parse a path string into segments.
pub fn parse(path: &str) -> Result<Vec<Segment>> {
    let bytes = path.as_bytes();
    let mut segments = Vec::new();
    let mut pos = 0;

    loop {
        let start = pos;
        while pos < bytes.len() && bytes[pos] != b'.' && bytes[pos] != b'[' {
            if bytes[pos] == b']' {
                return Err(syntax(path, format!("unexpected ']' at byte {}", pos)));
            }
            pos += 1;
        }
        if pos == start {
            return Err(syntax(path, format!("empty attribute name at byte {}", pos)));
        }
        segments.push(Segment::Attr(path[start..pos].to_string()));

        while pos < bytes.len() && bytes[pos] == b'[' {
            let (key, next) = parse_item(path, pos + 1)?;
            segments.push(Segment::Item(key));
            pos = next;
        }

        if pos == bytes.len() {
            return Ok(segments);
        }
        if bytes[pos] != b'.' {
            return Err(syntax(path, format!("expected '.' or '[' at byte {}", pos)));
        }
        pos += 1;
    }
}

/// Parse the key following a `[` at `start`; returns the key and the byte
/// offset just past the closing `]`.
fn parse_item(path: &str, start: usize) -> Result<(String, usize)> {
    let bytes = path.as_bytes();
    if bytes.get(start) == Some(&b'"') {
        let mut pos = start + 1;
        let mut escaped = false;
        while pos < bytes.len() {
            match bytes[pos] {
                b'\\' if !escaped => escaped = true,
                b'"' if !escaped => break,
                _ => escaped = false,
            }
            pos += 1;
        }
        if pos >= bytes.len() {
            return Err(syntax(path, "unterminated quoted key"));
        }
        let key: String = serde_json::from_str(&path[start..=pos])
            .map_err(|err| syntax(path, format!("invalid quoted key: {}", err)))?;
        if bytes.get(pos + 1) != Some(&b']') {
            return Err(syntax(path, "expected ']' after quoted key"));
        }
        return Ok((key, pos + 2));
    }

    match path[start..].find(']') {
        Some(offset) if offset > 0 => Ok((path[start..start + offset].to_string(), start + offset + 1)),
        Some(_) => Err(syntax(path, "empty key")),
        None => Err(syntax(path, "unterminated '['")),
    }
}

fn syntax(path: &str, reason: impl Into<String>) -> ProgramError {
    ProgramError::PathSyntax {
        path: path.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attributes_indices_and_keys() {
        let segments = parse("steps[1].qa[draft].generate").expect("parse");
        assert_eq!(
            segments,
            vec![
                Segment::Attr("steps".to_string()),
                Segment::Item("1".to_string()),
                Segment::Attr("qa".to_string()),
                Segment::Item("draft".to_string()),
                Segment::Attr("generate".to_string()),
            ]
        );
    }

    #[test]
    fn quoted_keys_survive_render_and_parse() {
        let path = join_item("lookup", "a]b");
        assert_eq!(path, r#"lookup["a]b"]"#);
        let segments = parse(&path).expect("parse");
        assert_eq!(segments[1], Segment::Item("a]b".to_string()));
        assert_eq!(render(&segments), path);
    }

    #[test]
    fn keys_may_contain_dots() {
        let segments = parse("models[gpt-4.1].predict").expect("parse");
        assert_eq!(segments[1], Segment::Item("gpt-4.1".to_string()));
        assert_eq!(segments[2], Segment::Attr("predict".to_string()));
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", ".a", "a.", "a..b", "[0]", "a[", "a[]", "a]b", "a[0]b", r#"a["x"y]"#] {
            let err = parse(bad).expect_err(bad);
            assert!(matches!(err, ProgramError::PathSyntax { .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn join_attr_omits_leading_dot() {
        assert_eq!(join_attr("", "a"), "a");
        assert_eq!(join_attr("a[0]", "b"), "a[0].b");
    }
}
