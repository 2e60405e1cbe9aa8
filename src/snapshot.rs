use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::SyncError;

/// An opaque serialization of the entire application state.
///
/// The sync layer compares snapshots, it never interprets them: the
/// business schema behind the blob is irrelevant here. Equality is
/// structural (JSON value equality), so re-serialization differences like
/// key order or whitespace never register as a change.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    value: Value,
}

/// Which side of a sync cycle a snapshot (or a conflict) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    Memory,
    LocalFile,
    RemoteDrive,
}

impl std::fmt::Display for SyncSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncSource::Memory => write!(f, "memory"),
            SyncSource::LocalFile => write!(f, "local file"),
            SyncSource::RemoteDrive => write!(f, "remote drive"),
        }
    }
}

impl Snapshot {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let value =
            serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(Self { value })
    }

    pub fn from_str(text: &str) -> Result<Self, SyncError> {
        Self::from_slice(text.as_bytes())
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Renders the snapshot the way it is written to external stores.
    /// Pretty-printed so the data file stays human-inspectable.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec_pretty(&self.value).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Short content fingerprint for log lines. Never used to decide
    /// equality; that is always the structural comparison.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(&self.value).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let full = hex::encode(hasher.finalize());
        full[..12].to_string()
    }
}
