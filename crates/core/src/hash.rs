//! Content-addressed blob references and SHA-256 hashing

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE64;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;
use thiserror::Error;

/// Errors produced while parsing or constructing a [`BlobRef`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefError {
    #[error("unknown hash algorithm: {0:?}")]
    UnknownAlgorithm(String),

    #[error("invalid hash length for {algo}: expected {expected} bytes, got {actual}")]
    BadLength {
        algo: Algorithm,
        expected: usize,
        actual: usize,
    },

    #[error("malformed hash encoding: {0}")]
    Malformed(String),

    #[error("missing algorithm suffix in {0:?}")]
    MissingAlgorithm(String),
}

/// Hash algorithm a blob is addressed by
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Algorithm {
    Sha256,
}

impl Algorithm {
    /// Tag used in the string form and as the top-level store directory
    pub const fn tag(self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
        }
    }

    /// Digest size in bytes
    pub const fn digest_len(self) -> usize {
        match self {
            Algorithm::Sha256 => 32,
        }
    }

    /// All algorithms this build recognizes
    pub const ALL: [Algorithm; 1] = [Algorithm::Sha256];
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Algorithm {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|a| a.tag() == s)
            .ok_or_else(|| RefError::UnknownAlgorithm(s.to_string()))
    }
}

/// Reference to a blob: the algorithm and the digest of its content
///
/// Fields are private and every constructor checks the digest length, so a
/// `BlobRef` that exists is always valid.
///
/// String form is `<lowercase-hex>.<algorithm>`. Parsing also accepts the
/// sigil form `&<base64>.<algorithm>` that log messages use for blob links.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct BlobRef {
    algo: Algorithm,
    hash: SmallVec<[u8; 32]>,
}

impl BlobRef {
    /// Build a reference from raw digest bytes
    pub fn new(algo: Algorithm, hash: &[u8]) -> Result<Self, RefError> {
        if hash.len() != algo.digest_len() {
            return Err(RefError::BadLength {
                algo,
                expected: algo.digest_len(),
                actual: hash.len(),
            });
        }
        Ok(Self {
            algo,
            hash: SmallVec::from_slice(hash),
        })
    }

    /// Reference of a SHA-256 digest
    pub fn sha256(hash: [u8; 32]) -> Self {
        Self {
            algo: Algorithm::Sha256,
            hash: SmallVec::from_buf(hash),
        }
    }

    /// Hash `data` in one shot
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = RefHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn algo(&self) -> Algorithm {
        self.algo
    }

    pub fn hash(&self) -> &[u8] {
        &self.hash
    }

    /// Lowercase hex of the digest
    pub fn to_hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Sigil form used inside log messages: `&<base64>.<algorithm>`
    pub fn to_sigil(&self) -> String {
        format!("&{}.{}", BASE64.encode(&self.hash), self.algo)
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.to_hex(), self.algo)
    }
}

impl fmt::Debug for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobRef({})", self)
    }
}

impl FromStr for BlobRef {
    type Err = RefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (encoded, algo) = s
            .rsplit_once('.')
            .ok_or_else(|| RefError::MissingAlgorithm(s.to_string()))?;
        let algo: Algorithm = algo.parse()?;

        let bytes = match encoded.strip_prefix('&') {
            Some(b64) => BASE64
                .decode(b64.as_bytes())
                .map_err(|e| RefError::Malformed(e.to_string()))?,
            None => hex::decode(encoded).map_err(|e| RefError::Malformed(e.to_string()))?,
        };

        BlobRef::new(algo, &bytes)
    }
}

impl Serialize for BlobRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BlobRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher producing a [`BlobRef`]
pub struct RefHasher {
    inner: Sha256,
}

impl RefHasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
        }
    }

    /// Feed more content
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish hashing and return the reference of everything fed so far
    pub fn finalize(self) -> BlobRef {
        BlobRef::sha256(self.inner.finalize().into())
    }
}

impl Default for RefHasher {
    fn default() -> Self {
        Self::new()
    }
}
