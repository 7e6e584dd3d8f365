//! Node identity keys.
//!
//! A node's identity is an ed25519 secret key; the derived public key is
//! the node's identifier on the overlay. Keys come from one of two
//! sources: a key already held in memory, or a file written by
//! out-of-band tooling.

use std::path::PathBuf;

use iroh::SecretKey;

use crate::error::Error;

/// Where a node's identity key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// A key already held in memory.
    Static(SecretKey),
    /// A file containing exactly 32 raw key bytes.
    File(PathBuf),
}

impl KeySource {
    /// A fresh random in-memory key, for ephemeral nodes and tests.
    pub fn generate() -> Self {
        Self::Static(SecretKey::generate(&mut rand::rng()))
    }

    /// Resolve the source into a usable secret key.
    pub fn resolve(&self) -> Result<SecretKey, Error> {
        match self {
            Self::Static(key) => Ok(key.clone()),
            Self::File(path) => {
                let bytes = std::fs::read(path)
                    .map_err(|e| Error::Key(format!("reading {}: {e}", path.display())))?;
                let raw: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Key(format!(
                        "{} holds {} bytes, expected 32",
                        path.display(),
                        bytes.len()
                    ))
                })?;
                Ok(SecretKey::from_bytes(&raw))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_key_resolves_deterministically() {
        let source = KeySource::generate();
        let first = source.resolve().expect("resolve");
        let second = source.resolve().expect("resolve");
        assert_eq!(first.public(), second.public());
        assert!(!first.public().to_string().is_empty());
    }

    #[test]
    fn distinct_generated_keys() {
        let a = KeySource::generate().resolve().expect("resolve");
        let b = KeySource::generate().resolve().expect("resolve");
        assert_ne!(a.public(), b.public());
    }

    #[test]
    fn file_key_round_trips() {
        let key = SecretKey::generate(&mut rand::rng());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("node.key");
        std::fs::write(&path, key.to_bytes()).expect("write key");

        let resolved = KeySource::File(path).resolve().expect("resolve");
        assert_eq!(resolved.public(), key.public());
    }

    #[test]
    fn file_key_wrong_length_is_key_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.key");
        std::fs::write(&path, [0u8; 7]).expect("write key");

        let err = KeySource::File(path).resolve().unwrap_err();
        assert!(matches!(err, Error::Key(_)));
    }

    #[test]
    fn missing_file_is_key_error() {
        let err = KeySource::File(PathBuf::from("/nonexistent/node.key"))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, Error::Key(_)));
    }
}
