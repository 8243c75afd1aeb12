//! Per-session frame change cache.

use std::fmt;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// 128-bit content fingerprint of a frame.
///
/// Truncated SHA-256. Used for change detection only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn of(frame: &[u8]) -> Self {
        let digest = Sha256::digest(frame);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// Fingerprint of the last frame emitted for each session.
///
/// Ephemeral: entries are lost on restart, which costs one redundant frame.
/// Each entry is written only by the loop streaming that session.
#[derive(Debug, Default)]
pub struct FrameCache {
    entries: DashMap<String, Fingerprint>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Fingerprint> {
        self.entries.get(session_id).map(|entry| *entry.value())
    }

    pub fn set(&self, session_id: &str, fingerprint: Fingerprint) {
        self.entries.insert(session_id.to_string(), fingerprint);
    }

    pub fn remove(&self, session_id: &str) -> Option<Fingerprint> {
        self.entries.remove(session_id).map(|(_, fp)| fp)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
