//! Stable identity for learned entity data.
//!
//! Everything the store learns is keyed by `(name, level)`, never by the
//! runtime instance id, so knowledge carries across encounters and sessions.

use serde::{Deserialize, Serialize};
use std::fmt;

const SEPARATOR: char = '_';
const EMPTY_NAME: &str = "npc";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Display name, trimmed but otherwise as observed
    pub name: String,
    pub level: i32,
    /// Normalized lookup key: `sanitized#level`
    pub key: String,
}

impl EntityKey {
    pub fn of(raw_name: &str, level: i32) -> Self {
        let name = raw_name.trim().to_string();
        let key = format!("{}#{}", sanitize_name(&name), level);
        Self { name, level, key }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Lowercase, keep alphanumerics, collapse every other run into one separator.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_separator = false;

    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push(SEPARATOR);
            }
            pending_separator = false;
            out.push(c);
        } else {
            pending_separator = true;
        }
    }

    if out.is_empty() {
        out.push_str(EMPTY_NAME);
    }
    out
}
