//! Beat metadata and cache key derivation.
//!
//! A Beat is read-only metadata supplied by the beats API. The cache key is
//! derived from the owner and the stored file name so it survives signed URL
//! rotation.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{PlayerError, Result};

/// A beat record as served by the metadata service.
///
/// The player never mutates these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    /// Beat identifier. Numeric ids from the API are kept as strings.
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,

    /// Owner of the uploaded file.
    #[serde(alias = "userId", deserialize_with = "id_from_string_or_number")]
    pub user_id: String,

    /// Stored file name in object storage.
    #[serde(alias = "fileName")]
    pub audio: String,

    /// Duration in seconds, if the API knows it.
    #[serde(default)]
    pub duration: Option<f32>,

    /// Display title.
    #[serde(default)]
    pub title: String,
}

impl Beat {
    /// Creates a beat record.
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        audio: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            audio: audio.into(),
            duration: None,
            title: title.into(),
        }
    }

    /// Derives the cache key for this beat.
    ///
    /// Fails when the owner or file name is missing, since such a beat cannot
    /// be fetched or cached.
    pub fn cache_key(&self) -> Result<CacheKey> {
        if self.user_id.trim().is_empty() {
            return Err(PlayerError::invalid_request(format!(
                "Beat {} has no user_id",
                self.id
            )));
        }
        if self.audio.trim().is_empty() {
            return Err(PlayerError::invalid_request(format!(
                "Beat {} has no audio file name",
                self.id
            )));
        }
        Ok(CacheKey::new(&self.user_id, &self.audio))
    }
}

/// Identifies one audio asset regardless of which signed URL points to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Owner of the file.
    pub user_id: String,
    /// Stored file name.
    pub file_name: String,
    /// Opaque key: 16 hex characters.
    id: String,
}

impl CacheKey {
    /// Creates a key from its two components.
    pub fn new(user_id: &str, file_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            file_name: file_name.to_string(),
            id: compute_cache_id(user_id, file_name),
        }
    }

    /// Returns the opaque key used by both cache tiers.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Computes the opaque cache id for a `(user_id, file_name)` pair.
///
/// The id is the first 16 hex characters of the SHA256 hash of
/// `{user_id}:{file_name}`.
pub fn compute_cache_id(user_id: &str, file_name: &str) -> String {
    let input = format!("{}:{}", user_id, file_name);
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}
