//! Hashing primitives shared by the rest of the engine.

use std::path::Path;

use color_eyre::Result;
use color_eyre::eyre::Context;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

/// A blake3 digest, rendered as a lowercase hex string.
///
/// This is the atom every cache key (`tchash`, `rhash`, blob keys) is built
/// from: it's deliberately opaque outside of [`Digest::as_str`] so that
/// callers always go through the sharding helpers in [`crate::store`]
/// instead of poking at the bytes directly.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize)]
pub struct Digest(String);

impl Digest {
    /// Hash the contents of the file at the given path.
    #[instrument(name = "Digest::from_file")]
    pub fn from_file(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).with_context(|| format!("open file: {path:?}"))?;
        let mut reader = std::io::BufReader::new(file);
        let mut hasher = blake3::Hasher::new();
        let bytes = std::io::copy(&mut reader, &mut hasher)
            .with_context(|| format!("hash file: {path:?}"))?;

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?path, ?hash, ?bytes, "hashed file");
        Ok(Self(hash))
    }

    /// Hash a single buffer.
    #[instrument(skip_all, name = "Digest::from_buffer")]
    pub fn from_buffer(buffer: impl AsRef<[u8]>) -> Self {
        let buffer = buffer.as_ref();
        let hash = hex::encode(blake3::hash(buffer).as_bytes());
        trace!(?hash, bytes = buffer.len(), "hashed buffer");
        Self(hash)
    }

    /// Hash a sequence of fields in order, without allocating an
    /// intermediate concatenated buffer.
    ///
    /// Each field is length-prefixed before being folded in, so two
    /// sequences of fields that concatenate to the same bytes (`["ab",
    /// "c"]` vs `["a", "bc"]`) still hash differently.
    #[instrument(skip_all, name = "Digest::from_fields")]
    pub fn from_fields(fields: impl IntoIterator<Item = impl AsRef<[u8]>>) -> Self {
        let mut hasher = blake3::Hasher::new();
        let mut bytes = 0;
        for field in fields {
            let field = field.as_ref();
            bytes += field.len();
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }

        let hash = hex::encode(hasher.finalize().as_bytes());
        trace!(?hash, ?bytes, "hashed fields");
        Self(hash)
    }

    /// Parse a digest back out of its hex representation.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// View the digest as its hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split the digest into a two-character shard prefix and the rest,
    /// the sharding scheme used by every on-disk namespace (§3, §6).
    pub fn shard(&self) -> (&str, &str) {
        self.0.split_at(2)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}
