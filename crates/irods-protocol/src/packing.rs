//! Packing instructions
//!
//! iRODS describes every structured payload as a "packing instruction": a
//! root tag named after the struct (`Version_PI`, `CS_NEG_PI`, ...) holding
//! one child tag per field, in declaration order. Only the flat form is
//! needed by the connection core, so nested structs are kept as raw text.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// A flat packing instruction: root tag plus ordered `(tag, value)` fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackInstruction {
    name: String,
    fields: Vec<(String, String)>,
}

impl PackInstruction {
    /// Create an empty instruction with the given root tag
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field (builder style)
    pub fn with(mut self, tag: &str, value: impl fmt::Display) -> Self {
        self.push(tag, value);
        self
    }

    /// Append a field
    pub fn push(&mut self, tag: &str, value: impl fmt::Display) {
        self.fields.push((tag.to_string(), value.to_string()));
    }

    /// Root tag name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields in wire order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value for `tag`, if present
    pub fn get(&self, tag: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == tag)
            .map(|(_, v)| v.as_str())
    }

    /// Value for `tag`, failing when the tag is absent
    pub fn require(&self, tag: &str) -> Result<&str> {
        self.get(tag)
            .ok_or_else(|| ProtocolError::missing(&self.name, tag))
    }

    /// Parse the value of `tag` into a number (or any `FromStr` type)
    pub fn require_parsed<T: FromStr>(&self, tag: &str) -> Result<T> {
        let raw = self.require(tag)?;
        raw.trim().parse::<T>().map_err(|_| ProtocolError::InvalidValue {
            tag: tag.to_string(),
            value: raw.to_string(),
        })
    }

    /// Fail unless the root tag is `expected`
    pub fn expect_name(self, expected: &str) -> Result<Self> {
        if self.name == expected {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedMessage {
                expected: expected.to_string(),
                actual: self.name,
            })
        }
    }

    /// Render as packed XML, one field per line
    pub fn to_xml(&self) -> String {
        let mut out = String::with_capacity(64 + self.fields.len() * 32);
        out.push('<');
        out.push_str(&self.name);
        out.push_str(">\n");
        for (tag, value) in &self.fields {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            out.push_str(&escape(value));
            out.push_str("</");
            out.push_str(tag);
            out.push_str(">\n");
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push_str(">\n");
        out
    }

    /// Render as wire bytes
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_xml())
    }

    /// Parse packed XML. Trailing NUL padding sent by some servers is ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| ProtocolError::InvalidFormat(format!("not UTF-8: {}", e)))?;
        let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());

        let (name, mut rest) = open_tag(text)?;
        let mut fields = Vec::new();

        loop {
            rest = rest.trim_start();
            if let Some(closing) = rest.strip_prefix("</") {
                let end = closing
                    .find('>')
                    .ok_or_else(|| ProtocolError::InvalidFormat("unterminated close tag".into()))?;
                if &closing[..end] != name {
                    return Err(ProtocolError::InvalidFormat(format!(
                        "mismatched close tag </{}> for <{}>",
                        &closing[..end],
                        name
                    )));
                }
                break;
            }
            if rest.is_empty() {
                return Err(ProtocolError::InvalidFormat(format!(
                    "missing </{}>",
                    name
                )));
            }

            let (tag, after_open) = open_tag(rest)?;
            let close = format!("</{}>", tag);
            let end = after_open.find(&close).ok_or_else(|| {
                ProtocolError::InvalidFormat(format!("missing </{}>", tag))
            })?;
            fields.push((tag.to_string(), unescape(&after_open[..end])));
            rest = &after_open[end + close.len()..];
        }

        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Peek at the root tag name of packed XML without parsing the fields
    pub fn root_name(data: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(data).ok()?;
        let (name, _) = open_tag(text.trim_start()).ok()?;
        Some(name.to_string())
    }
}

impl fmt::Display for PackInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

/// Split `<name>rest` into `(name, rest)`
fn open_tag(s: &str) -> Result<(&str, &str)> {
    let inner = s
        .strip_prefix('<')
        .ok_or_else(|| ProtocolError::InvalidFormat(format!("expected tag at '{}'", preview(s))))?;
    let end = inner
        .find('>')
        .ok_or_else(|| ProtocolError::InvalidFormat("unterminated open tag".into()))?;
    let name = &inner[..end];
    if name.is_empty() || name.starts_with('/') || name.contains(char::is_whitespace) {
        return Err(ProtocolError::InvalidFormat(format!(
            "invalid tag name '{}'",
            name
        )));
    }
    Ok((name, &inner[end + 1..]))
}

fn preview(s: &str) -> &str {
    match s.char_indices().nth(24) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Escape a field value. The server carries the backtick as `&apos;`.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '`' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse of [`escape`]
pub fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "`")
        .replace("&amp;", "&")
}
