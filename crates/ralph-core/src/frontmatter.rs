//! YAML frontmatter handling for loop artifacts.
//!
//! Structured artifacts start with a `---` delimited YAML header followed by a
//! free-form markdown body. Reads go through `serde_yaml`; writes edit the
//! header line by line so the rest of the file is preserved byte for byte.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_yaml::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrontmatterError {
    #[error("missing frontmatter")]
    Missing,
    #[error("unterminated frontmatter")]
    Unterminated,
    #[error("invalid YAML in frontmatter: {0}")]
    InvalidYaml(String),
}

/// Location of the header inside a document, as byte offsets.
struct Span {
    /// Start of the header text (after the opening delimiter line).
    header_start: usize,
    /// End of the header text (start of the closing delimiter line).
    header_end: usize,
    /// Start of the body (after the closing delimiter line).
    body_start: usize,
}

fn locate(content: &str) -> Result<Span, FrontmatterError> {
    let leading = content.len() - content.trim_start().len();
    let rest = &content[leading..];
    let Some(after_open) = rest.strip_prefix("---") else {
        return Err(FrontmatterError::Missing);
    };
    let header_start = if after_open.starts_with("\r\n") {
        leading + 5
    } else if after_open.starts_with('\n') {
        leading + 4
    } else {
        return Err(FrontmatterError::Missing);
    };

    let mut offset = header_start;
    for line in content[header_start..].split_inclusive('\n') {
        if line.trim_end() == "---" {
            return Ok(Span {
                header_start,
                header_end: offset,
                body_start: offset + line.len(),
            });
        }
        offset += line.len();
    }
    Err(FrontmatterError::Unterminated)
}

/// Parsed frontmatter key/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    fields: BTreeMap<String, Value>,
}

impl Frontmatter {
    /// Parse the header of `content`, returning it with the body.
    pub fn parse(content: &str) -> Result<(Self, &str), FrontmatterError> {
        let span = locate(content)?;
        let header = &content[span.header_start..span.header_end];
        let body = &content[span.body_start..];

        if header.trim().is_empty() {
            return Ok((Self::default(), body));
        }
        let fields: BTreeMap<String, Value> =
            serde_yaml::from_str(header).map_err(|e| FrontmatterError::InvalidYaml(e.to_string()))?;
        Ok((Self { fields }, body))
    }

    /// Like [`Frontmatter::parse`], but a document without a header yields an
    /// empty frontmatter and the whole content as body.
    pub fn parse_optional(content: &str) -> Result<(Self, &str), FrontmatterError> {
        match Self::parse(content) {
            Err(FrontmatterError::Missing) => Ok((Self::default(), content)),
            other => other,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.get(key).is_some_and(|v| !v.is_null())
    }

    /// String value; numbers and booleans are rendered, null is absent.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Non-empty string value.
    pub fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get_str(key).filter(|s| !s.trim().is_empty())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.fields.get(key)? {
            Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.fields.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_u64().map(|v| v != 0),
            _ => None,
        }
    }

    /// Timestamp value. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and bare dates.
    pub fn get_datetime(&self, key: &str) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.get_str(key)?)
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Set `key` to the YAML scalar `value` in the header of `content`.
///
/// An existing `key:` line is replaced in place; otherwise the field is
/// appended to the header. A document without a header gets one.
pub fn set_field(content: &str, key: &str, value: &str) -> Result<String, FrontmatterError> {
    let span = match locate(content) {
        Ok(span) => span,
        Err(FrontmatterError::Missing) => {
            return Ok(format!("---\n{key}: {value}\n---\n{content}"));
        }
        Err(e) => return Err(e),
    };

    let header = &content[span.header_start..span.header_end];
    let prefix = format!("{key}:");
    let mut replaced = false;
    let mut new_header = String::with_capacity(header.len() + key.len() + value.len() + 4);
    for line in header.lines() {
        if !replaced && line.starts_with(&prefix) {
            new_header.push_str(&format!("{key}: {value}\n"));
            replaced = true;
        } else {
            new_header.push_str(line);
            new_header.push('\n');
        }
    }
    if !replaced {
        new_header.push_str(&format!("{key}: {value}\n"));
    }

    let mut out = String::with_capacity(content.len() + key.len() + value.len() + 4);
    out.push_str(&content[..span.header_start]);
    out.push_str(&new_header);
    out.push_str(&content[span.header_end..]);
    Ok(out)
}
