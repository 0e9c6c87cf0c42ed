//! Glob matching with Redis `MATCH` semantics.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[a-z]`, `[^x]`) and
//! backslash escapes. The memory and file backends and the in-process
//! pub/sub bus use this so that pattern scans behave the same as they do
//! against Redis.

use regex::Regex;

use crate::error::{StoreError, StoreResult};

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> StoreResult<Self> {
        let translated = translate(pattern);
        let regex = Regex::new(&translated)
            .map_err(|e| StoreError::InvalidKey(format!("bad pattern `{pattern}`: {e}")))?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 8);
    out.push_str("(?s)^");

    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '\\' if i + 1 < chars.len() => {
                i += 1;
                push_literal(&mut out, chars[i]);
            }
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    push_class(&mut out, &chars[i + 1..end]);
                    i = end;
                }
                None => push_literal(&mut out, '['),
            },
            c => push_literal(&mut out, c),
        }
        i += 1;
    }

    out.push('$');
    out
}

/// Index of the `]` closing the class opened at `start`.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            ']' if i > start + 1 => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn push_class(out: &mut String, body: &[char]) {
    out.push('[');
    let mut i = 0;
    if body.first() == Some(&'^') {
        out.push('^');
        i = 1;
    }
    while i < body.len() {
        let c = body[i];
        if c == '\\' && i + 1 < body.len() {
            i += 1;
            push_class_literal(out, body[i]);
        } else if c == '-' && i > 0 && i + 1 < body.len() {
            out.push('-');
        } else {
            push_class_literal(out, c);
        }
        i += 1;
    }
    out.push(']');
}

fn push_class_literal(out: &mut String, c: char) {
    if c.is_alphanumeric() || c == '_' {
        out.push(c);
    } else {
        out.push('\\');
        out.push(c);
    }
}

fn push_literal(out: &mut String, c: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}
