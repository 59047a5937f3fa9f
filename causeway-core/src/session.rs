//! Session identity types

use std::fmt;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate a random session ID
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create from raw value
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Convert to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Create from bytes (big-endian)
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SessionId> for u64 {
    fn from(sid: SessionId) -> Self {
        sid.0
    }
}

/// Length of a session key in bytes
pub const SESSION_KEY_LEN: usize = 16;

/// Fixed-length session secret issued by the access authority.
///
/// Comparisons against untrusted input go through [`SessionKey::ct_eq`],
/// which runs in constant time. The key material is never printed.
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Create a key from raw bytes
    pub const fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, if it has the right length
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Generate a random key
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Constant-time comparison against untrusted key material
    pub fn ct_eq(&self, other: &[u8]) -> bool {
        if other.len() != SESSION_KEY_LEN {
            return false;
        }
        self.0.as_slice().ct_eq(other).into()
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.ct_eq(&other.0)
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(..)")
    }
}
