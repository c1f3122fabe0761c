use crate::error::{MirrorError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Content-derived blob identifier of the form `<algorithm>-<hexdigest>`,
/// e.g. `sha256-b94d27b9...`. Two blobs with equal content have equal
/// references; the string form is the canonical sort key for enumeration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef(String);

impl BlobRef {
    /// Parse and validate a reference string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, digest) = s
            .split_once('-')
            .ok_or_else(|| MirrorError::InvalidRef(s.to_string()))?;

        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
        let valid_digest = !digest.is_empty()
            && digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

        if !valid_algorithm || !valid_digest {
            return Err(MirrorError::InvalidRef(s.to_string()));
        }

        Ok(Self(s.to_string()))
    }

    /// Compute the SHA-256 reference for a byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(format!("sha256-{}", hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        // Validated at construction; the separator is always present.
        self.0.split_once('-').map(|(a, _)| a).unwrap_or(&self.0)
    }

    pub fn digest(&self) -> &str {
        self.0.split_once('-').map(|(_, d)| d).unwrap_or("")
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobRef {
    type Error = MirrorError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BlobRef> for String {
    fn from(value: BlobRef) -> Self {
        value.0
    }
}

/// A blob reference paired with the byte length of the blob's content as
/// reported by a particular backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SizedBlobRef {
    pub blob_ref: BlobRef,
    pub size: u64,
}

impl SizedBlobRef {
    pub fn new(blob_ref: BlobRef, size: u64) -> Self {
        Self { blob_ref, size }
    }
}

impl fmt::Display for SizedBlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.blob_ref, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes() {
        let blob = BlobRef::from_bytes(b"hello world");
        assert_eq!(
            blob.as_str(),
            "sha256-b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(blob.algorithm(), "sha256");
        assert_eq!(blob.digest().len(), 64);
    }

    #[test]
    fn test_equal_content_equal_refs() {
        assert_eq!(BlobRef::from_bytes(b"abc"), BlobRef::from_bytes(b"abc"));
        assert_ne!(BlobRef::from_bytes(b"abc"), BlobRef::from_bytes(b"abd"));
    }

    #[test]
    fn test_parse_round_trip() {
        let blob = BlobRef::from_bytes(b"data");
        let parsed = BlobRef::parse(blob.as_str()).unwrap();
        assert_eq!(parsed, blob);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(BlobRef::parse("").is_err());
        assert!(BlobRef::parse("sha256").is_err());
        assert!(BlobRef::parse("sha256-").is_err());
        assert!(BlobRef::parse("-abcdef").is_err());
        assert!(BlobRef::parse("sha256-XYZ").is_err());
        assert!(BlobRef::parse("SHA256-abcdef").is_err());
    }

    #[test]
    fn test_canonical_order_is_lexicographic() {
        let a = BlobRef::parse("sha256-aa").unwrap();
        let b = BlobRef::parse("sha256-ab").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_string_form() {
        let blob = BlobRef::from_bytes(b"x");
        let json = serde_json::to_string(&blob).unwrap();
        let back: BlobRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, blob);

        let bad: std::result::Result<BlobRef, _> = serde_json::from_str("\"not a ref\"");
        assert!(bad.is_err());
    }
}
