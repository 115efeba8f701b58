//! Signed URL resolution.
//!
//! Audio lives in object storage behind time-limited signed URLs handed out
//! by the beats API. URLs are memoized per cache key until their TTL runs
//! out or recovery asks for a fresh one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use super::fetcher::status_error;
use crate::error::{ErrorCode, PlayerError, Result};
use crate::types::CacheKey;

/// Resolves cache keys to fetchable URLs.
pub trait SignedUrlProvider: Send + Sync {
    /// Returns a signed URL for the asset.
    fn signed_url<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<String>>;

    /// Forgets any memoized URL for the asset.
    fn invalidate(&self, key: &CacheKey);
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    signed_url: String,
}

/// Memo of signed URLs with a fixed time to live.
#[derive(Debug)]
pub struct UrlMemo {
    ttl: Duration,
    urls: Mutex<HashMap<String, (String, Instant)>>,
}

impl UrlMemo {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            urls: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a memoized URL that has not expired.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        let mut urls = self.urls.lock().unwrap_or_else(|e| e.into_inner());
        match urls.get(key.id()) {
            Some((url, at)) if at.elapsed() < self.ttl => Some(url.clone()),
            Some(_) => {
                urls.remove(key.id());
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: &CacheKey, url: String) {
        self.urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.id().to_string(), (url, Instant::now()));
    }

    pub fn remove(&self, key: &CacheKey) {
        self.urls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key.id());
    }
}

/// Fetches signed URLs from `GET {api}/beats/{file}/signed-url?userId=`.
pub struct HttpSignedUrlProvider {
    client: reqwest::Client,
    api_base_url: String,
    memo: UrlMemo,
}

impl HttpSignedUrlProvider {
    pub fn new(client: reqwest::Client, api_base_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            memo: UrlMemo::new(ttl),
        }
    }

    /// Endpoint for one asset. The file name is encoded as a single path
    /// segment.
    pub fn endpoint(&self, key: &CacheKey) -> Result<reqwest::Url> {
        let invalid = || {
            PlayerError::invalid_request(format!("invalid API base URL: {}", self.api_base_url))
        };
        let mut url = reqwest::Url::parse(&self.api_base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(["beats", key.file_name.as_str(), "signed-url"]);
        Ok(url)
    }

    async fn request(&self, key: &CacheKey) -> Result<String> {
        if let Some(url) = self.memo.get(key) {
            return Ok(url);
        }

        let response = self
            .client
            .get(self.endpoint(key)?)
            .query(&[("userId", key.user_id.as_str())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let body: SignedUrlResponse = response.json().await.map_err(|e| {
            PlayerError::with_source(
                ErrorCode::NetworkError,
                "malformed signed URL response",
                e,
            )
        })?;

        debug!(key = %key, "signed URL resolved");
        self.memo.insert(key, body.signed_url.clone());
        Ok(body.signed_url)
    }
}

impl SignedUrlProvider for HttpSignedUrlProvider {
    fn signed_url<'a>(&'a self, key: &'a CacheKey) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.request(key))
    }

    fn invalidate(&self, key: &CacheKey) {
        self.memo.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_returns_fresh_urls_only() {
        let key = CacheKey::new("u1", "a.mp3");
        let memo = UrlMemo::new(Duration::from_secs(60));
        assert!(memo.get(&key).is_none());
        memo.insert(&key, "https://signed/a".to_string());
        assert_eq!(memo.get(&key).as_deref(), Some("https://signed/a"));
        memo.remove(&key);
        assert!(memo.get(&key).is_none());

        let expired = UrlMemo::new(Duration::ZERO);
        expired.insert(&key, "https://signed/a".to_string());
        assert!(expired.get(&key).is_none());
    }

    #[test]
    fn endpoint_uses_file_name() {
        let provider = HttpSignedUrlProvider::new(
            reqwest::Client::new(),
            "http://localhost:5000/api/",
            Duration::from_secs(60),
        );
        let key = CacheKey::new("42", "beat.mp3");
        assert_eq!(
            provider.endpoint(&key).unwrap().as_str(),
            "http://localhost:5000/api/beats/beat.mp3/signed-url"
        );
    }

    #[test]
    fn endpoint_encodes_reserved_characters() {
        let provider = HttpSignedUrlProvider::new(
            reqwest::Client::new(),
            "http://localhost:5000",
            Duration::from_secs(60),
        );
        let key = CacheKey::new("42", "late night/take #2?.mp3");
        let url = provider.endpoint(&key).unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
        assert_eq!(
            url.as_str(),
            "http://localhost:5000/beats/late%20night%2Ftake%20%232%3F.mp3/signed-url"
        );
    }

    #[test]
    fn endpoint_rejects_bad_base() {
        let provider = HttpSignedUrlProvider::new(
            reqwest::Client::new(),
            "not a url",
            Duration::from_secs(60),
        );
        let err = provider.endpoint(&CacheKey::new("42", "a.mp3")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn response_is_camel_case() {
        let body: SignedUrlResponse =
            serde_json::from_str(r#"{"signedUrl":"https://b2/x?sig=1"}"#).unwrap();
        assert_eq!(body.signed_url, "https://b2/x?sig=1");
    }
}
