//! Versioned persisted form of the store.
//!
//! ```json
//! {"version": 2, "profiles": {"zulrah#725": {...}}, "recording": {"zulrah#725": {"5069": {...}}}}
//! ```
//!
//! Missing fields load as empty collections. Any other version is coerced
//! to the current one; the layout has only ever grown by optional fields.

use crate::profile::EntityProfile;
use crate::recording::SignalRows;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Current document format version
pub const DOCUMENT_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub version: u32,
    pub profiles: BTreeMap<String, EntityProfile>,
    pub recording: BTreeMap<String, SignalRows>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            profiles: BTreeMap::new(),
            recording: BTreeMap::new(),
        }
    }
}

/// Errors that can occur while reading or writing a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    Empty,
    Malformed(String),
    SerializationFailed(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Document is empty"),
            Self::Malformed(e) => write!(f, "Malformed document: {}", e),
            Self::SerializationFailed(e) => write!(f, "Serialization failed: {}", e),
        }
    }
}

impl std::error::Error for DocumentError {}

impl Document {
    pub fn new(
        profiles: BTreeMap<String, EntityProfile>,
        recording: BTreeMap<String, SignalRows>,
    ) -> Self {
        Self {
            version: DOCUMENT_VERSION,
            profiles,
            recording,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty() && self.recording.is_empty()
    }

    pub fn from_json(text: &str) -> Result<Self, DocumentError> {
        if text.trim().is_empty() {
            return Err(DocumentError::Empty);
        }
        let mut doc: Document =
            serde_json::from_str(text).map_err(|e| DocumentError::Malformed(e.to_string()))?;
        doc.normalize();
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<String, DocumentError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| DocumentError::SerializationFailed(e.to_string()))
    }

    /// Coerce the version and repair entries that disagree with their map keys.
    pub fn normalize(&mut self) {
        if self.version != DOCUMENT_VERSION {
            warn!(
                found = self.version,
                current = DOCUMENT_VERSION,
                "Coercing document version"
            );
            self.version = DOCUMENT_VERSION;
        }

        for (key, profile) in self.profiles.iter_mut() {
            profile.normalize(key);
        }

        for rows in self.recording.values_mut() {
            rows.retain(|&signal, _| signal > 0);
            for (&signal, row) in rows.iter_mut() {
                row.normalize(signal);
            }
        }
        self.recording.retain(|_, rows| !rows.is_empty());
    }
}
