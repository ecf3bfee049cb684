use crate::error::CacheError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

use strata_core::RootUrl;

/// A stable SHA-256 fingerprint stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the SHA-256 fingerprint of an arbitrary byte slice.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a sequence of parts, each terminated so `["ab", "c"]` and
    /// `["a", "bc"]` differ.
    pub fn from_parts<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part.as_ref());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self, CacheError> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Directory-name-safe fingerprint of a root URL.
    pub fn for_root(root: &RootUrl) -> Self {
        Self::from_bytes(root.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
