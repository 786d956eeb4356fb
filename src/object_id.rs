//! Canonical fixed-width object identifiers.
//!
//! Callers hand us short textual tokens such as `42`; the store only knows
//! fixed-width keys. Tokens are right-justified to the configured width with
//! a fill character, so `42` becomes `00000000000000000042` under the default
//! configuration. Lookups always happen on the normalized form.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// Default canonical width in bytes.
pub const DEFAULT_ID_WIDTH: usize = 20;

/// Default fill character for short tokens.
pub const DEFAULT_ID_PAD: char = '0';

/// Widest identifier the store accepts.
pub const MAX_ID_WIDTH: usize = 64;

/// A store key of canonical width.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(Vec<u8>);

impl ObjectId {
    /// Wrap bytes that are already canonical.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Raw bytes as a byte-string literal, e.g. `b"00000000000000000042"`.
    pub fn escaped(&self) -> String {
        let mut out = String::with_capacity(self.0.len() + 3);
        out.push_str("b\"");
        for &b in self.as_bytes() {
            out.extend(std::ascii::escape_default(b).map(char::from));
        }
        out.push('"');
        out
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.escaped())
    }
}

/// How tokens map onto canonical identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    pub width: usize,
    pub pad: char,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_ID_WIDTH,
            pad: DEFAULT_ID_PAD,
        }
    }
}

impl IdentifierConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.width > MAX_ID_WIDTH {
            anyhow::bail!(
                "identifier width must be between 1 and {}, got {}",
                MAX_ID_WIDTH,
                self.width
            );
        }
        if !self.pad.is_ascii() {
            anyhow::bail!("identifier pad must be an ASCII character, got {:?}", self.pad);
        }
        Ok(())
    }

    /// Right-justify `token` to the canonical width.
    pub fn normalize(&self, token: &str) -> Result<ObjectId, FetchError> {
        let raw = token.as_bytes();
        if raw.len() > self.width {
            return Err(FetchError::InvalidIdentifier {
                token: token.to_string(),
                len: raw.len(),
                width: self.width,
            });
        }

        let mut bytes = Vec::with_capacity(self.width);
        bytes.resize(self.width - raw.len(), self.pad as u8);
        bytes.extend_from_slice(raw);
        Ok(ObjectId::from_bytes(bytes))
    }

    /// Random alphanumeric token exactly `width` characters long, so it
    /// names an object without padding.
    pub fn random_token(&self) -> String {
        rand::thread_rng()
            .sample_iter(Alphanumeric)
            .take(self.width)
            .map(char::from)
            .collect()
    }
}
