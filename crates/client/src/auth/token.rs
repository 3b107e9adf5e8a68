//! Bearer tokens and the JSON token cache file

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Where a token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenSource {
    Provider,
    CacheFile,
}

/// A bearer token with its absolute expiry
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub source: TokenSource,
}

// Keeps the secret out of logs.
impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("source", &self.source)
            .finish()
    }
}

impl BearerToken {
    /// True while `now < expires_at - buffer`
    pub fn is_usable(&self, buffer: Duration, now: DateTime<Utc>) -> bool {
        let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::MAX);
        match self.expires_at.checked_sub_signed(buffer) {
            Some(deadline) => now < deadline,
            None => false,
        }
    }
}

/// A token handed out by an injected provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// Token valid for `lifetime` from now
    pub fn expiring_in(access_token: impl Into<String>, lifetime: Duration) -> Self {
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(lifetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::new(access_token, expires_at)
    }

    pub(crate) fn into_bearer(self, source: TokenSource) -> BearerToken {
        BearerToken {
            value: self.access_token,
            expires_at: self.expires_at,
            source,
        }
    }
}

/// Timestamps in the cache file are either epoch seconds or RFC 3339
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Timestamp {
    Epoch(f64),
    Text(String),
}

impl Timestamp {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Epoch(secs) => {
                let millis = (secs * 1000.0).round() as i64;
                Utc.timestamp_millis_opt(millis).single()
            }
            Timestamp::Text(text) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
                    return Some(dt.with_timezone(&Utc));
                }
                text.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|secs| Timestamp::Epoch(secs).to_datetime())
            }
        }
    }
}

/// On-disk token cache: `{access_token, expires_in | expires_at, created_at}`
#[derive(Debug, Deserialize)]
struct TokenCacheFile {
    access_token: String,
    #[serde(default)]
    expires_in: Option<f64>,
    #[serde(default)]
    expires_at: Option<Timestamp>,
    #[serde(default)]
    created_at: Option<Timestamp>,
}

impl TokenCacheFile {
    /// Absolute expiry: `expires_at` wins, else `created_at + expires_in`
    fn expiry(&self) -> Result<DateTime<Utc>, String> {
        if let Some(at) = &self.expires_at {
            return at
                .to_datetime()
                .ok_or_else(|| "unreadable expires_at".to_string());
        }
        match (self.expires_in, &self.created_at) {
            (Some(expires_in), Some(created_at)) => {
                let created = created_at
                    .to_datetime()
                    .ok_or_else(|| "unreadable created_at".to_string())?;
                let lifetime = chrono::Duration::milliseconds((expires_in * 1000.0).round() as i64);
                created
                    .checked_add_signed(lifetime)
                    .ok_or_else(|| "expires_in out of range".to_string())
            }
            (Some(_), None) => Err("expires_in without created_at".to_string()),
            _ => Err("no expires_at or expires_in".to_string()),
        }
    }
}

/// Read a token from the cache file and check it against its own expiry
pub async fn load_cache_file(path: &Path, buffer: Duration) -> Result<BearerToken, AuthError> {
    let cache_error = |reason: String| AuthError::CacheFile {
        path: path.display().to_string(),
        reason,
    };

    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| cache_error(e.to_string()))?;
    let file: TokenCacheFile =
        serde_json::from_str(&raw).map_err(|e| cache_error(format!("invalid JSON: {}", e)))?;
    if file.access_token.is_empty() {
        return Err(cache_error("empty access_token".to_string()));
    }
    let expires_at = file.expiry().map_err(cache_error)?;

    let token = BearerToken {
        value: file.access_token,
        expires_at,
        source: TokenSource::CacheFile,
    };
    if !token.is_usable(buffer, Utc::now()) {
        return Err(cache_error(format!("token expired at {}", expires_at)));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_cache(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn usable_respects_buffer() {
        let now = Utc::now();
        let token = BearerToken {
            value: "t".into(),
            expires_at: now + chrono::Duration::seconds(30),
            source: TokenSource::Provider,
        };
        assert!(token.is_usable(Duration::from_secs(10), now));
        assert!(!token.is_usable(Duration::from_secs(30), now));
        assert!(!token.is_usable(Duration::from_secs(60), now));
    }

    #[test]
    fn debug_output_hides_secret() {
        let token = IssuedToken::expiring_in("super-secret", Duration::from_secs(60))
            .into_bearer(TokenSource::Provider);
        assert!(!format!("{:?}", token).contains("super-secret"));
    }

    #[tokio::test]
    async fn loads_expires_in_relative_to_created_at() {
        let created = Utc::now().timestamp();
        let file = write_cache(&format!(
            r#"{{"access_token": "abc", "expires_in": 3600, "created_at": {}}}"#,
            created
        ));

        let token = load_cache_file(file.path(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(token.value, "abc");
        assert_eq!(token.source, TokenSource::CacheFile);
        assert_eq!(token.expires_at.timestamp(), created + 3600);
    }

    #[tokio::test]
    async fn loads_rfc3339_expires_at() {
        let expires = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let file = write_cache(&format!(
            r#"{{"access_token": "abc", "expires_at": "{}"}}"#,
            expires
        ));
        assert!(load_cache_file(file.path(), Duration::from_secs(60)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_expired_and_incomplete_files() {
        let expired = write_cache(&format!(
            r#"{{"access_token": "abc", "expires_at": {}}}"#,
            Utc::now().timestamp() - 10
        ));
        let err = load_cache_file(expired.path(), Duration::from_secs(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CacheFile { .. }));

        let no_created = write_cache(r#"{"access_token": "abc", "expires_in": 3600}"#);
        assert!(load_cache_file(no_created.path(), Duration::from_secs(0)).await.is_err());

        let missing = std::path::PathBuf::from("/nonexistent/token.json");
        assert!(load_cache_file(&missing, Duration::from_secs(0)).await.is_err());
    }
}
