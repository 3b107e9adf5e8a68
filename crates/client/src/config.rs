//! Client configuration

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{FhirClientError, Result};
use crate::transport::retry::Jitter;

/// Client configuration, loaded from environment variables or built in code
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// FHIR base URL including the mount path, e.g. `https://host/fhir/r4`
    pub base_url: Url,
    /// JSON token cache file, used when no provider is injected (or as fallback)
    pub token_cache_path: Option<PathBuf>,
    /// Per-call HTTP timeout
    pub request_timeout: Duration,
    /// Attempt budget for retriable outcomes (initial try included)
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub retry_base_delay: Duration,
    /// Cap for a single backoff sleep
    pub retry_max_delay: Duration,
    pub jitter: Jitter,
    /// A token is not used once `now >= expires_at - token_expiry_buffer`
    pub token_expiry_buffer: Duration,
    /// Maximum number of resource types fetched in parallel
    pub concurrency_limit: usize,
    /// Default `_count` for searches
    pub page_size: u32,
    /// Optional client-side pacing (requests per second across all workers)
    pub rate_limit_rps: Option<u32>,
}

impl ClientConfig {
    /// Configuration with defaults for everything but the base URL
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: parse_base_url(base_url)?,
            token_cache_path: None,
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            jitter: Jitter::Equal,
            token_expiry_buffer: Duration::from_secs(60),
            concurrency_limit: 3,
            page_size: 100,
            rate_limit_rps: None,
        })
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("FHIR_BASE_URL")
            .map_err(|_| FhirClientError::Config("FHIR_BASE_URL is not set".to_string()))?;
        let mut config = Self::new(&base_url)?;

        if let Ok(path) = std::env::var("FHIR_TOKEN_CACHE") {
            config.token_cache_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = env_number::<u64>("FHIR_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_number::<u32>("FHIR_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }
        if let Some(ms) = env_number::<u64>("FHIR_RETRY_BASE_DELAY_MS")? {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_number::<u64>("FHIR_TOKEN_EXPIRY_BUFFER_SECS")? {
            config.token_expiry_buffer = Duration::from_secs(secs);
        }
        if let Some(limit) = env_number::<usize>("FHIR_CONCURRENCY_LIMIT")? {
            config.concurrency_limit = limit;
        }
        if let Some(size) = env_number::<u32>("FHIR_PAGE_SIZE")? {
            config.page_size = size;
        }
        config.rate_limit_rps = env_number::<u32>("FHIR_RATE_LIMIT_RPS")?;

        config.validate()?;
        Ok(config)
    }

    pub fn with_token_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_cache_path = Some(path.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_token_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.token_expiry_buffer = buffer;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_rate_limit_rps(mut self, rps: u32) -> Self {
        self.rate_limit_rps = Some(rps);
        self
    }

    /// Reject values the client cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(FhirClientError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.concurrency_limit == 0 {
            return Err(FhirClientError::Config(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(FhirClientError::Config(
                "page_size must be at least 1".to_string(),
            ));
        }
        if self.rate_limit_rps == Some(0) {
            return Err(FhirClientError::Config(
                "rate_limit_rps must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse the base URL and make sure its path ends with `/`, so that
/// `Url::join("Patient")` appends instead of replacing the last segment.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if url.cannot_be_a_base() {
        return Err(FhirClientError::Config(format!(
            "{} cannot be used as a base URL",
            raw
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                FhirClientError::Config(format!("{} is not a valid number: {}", name, raw))
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_trailing_slash() {
        let config = ClientConfig::new("https://example.org/fhir/r4").unwrap();
        assert_eq!(config.base_url.as_str(), "https://example.org/fhir/r4/");
        assert_eq!(
            config.base_url.join("Patient").unwrap().as_str(),
            "https://example.org/fhir/r4/Patient"
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ClientConfig::new("https://example.org/fhir").unwrap();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.concurrency_limit, 3);
        assert!(config.rate_limit_rps.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_budgets() {
        let config = ClientConfig::new("https://example.org/fhir")
            .unwrap()
            .with_max_attempts(0);
        assert!(matches!(config.validate(), Err(FhirClientError::Config(_))));

        let config = ClientConfig::new("https://example.org/fhir")
            .unwrap()
            .with_concurrency_limit(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unparseable_base_url() {
        assert!(ClientConfig::new("not a url").is_err());
        assert!(ClientConfig::new("mailto:someone@example.org").is_err());
    }
}
