//! Shared bearer-token cache with single-flight refresh

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::token::{BearerToken, IssuedToken, TokenSource, load_cache_file};
use crate::error::AuthError;
use crate::telemetry::MetricsRegistry;

/// Injected token source (OAuth client, secret manager, test stub, ...)
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<IssuedToken, AuthError>;
}

#[async_trait]
impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<IssuedToken, AuthError>> + Send,
{
    async fn fetch_token(&self) -> Result<IssuedToken, AuthError> {
        (self)().await
    }
}

/// Which configured source is consulted first on refresh.
///
/// When both sources are configured and disagree, `ProviderFirst` means the
/// provider's token wins; the cache file is only read if the provider fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SourcePrecedence {
    #[default]
    ProviderFirst,
    CacheFileFirst,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<BearerToken, AuthError>>>;

/// Owns the current bearer token and refreshes it at most once at a time.
///
/// Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct TokenStore {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Option<Arc<dyn TokenProvider>>,
    cache_path: Option<PathBuf>,
    precedence: SourcePrecedence,
    expiry_buffer: Duration,
    current: RwLock<Option<BearerToken>>,
    /// In-flight refresh, tagged with its sequence number
    inflight: Mutex<Option<(u64, RefreshFuture)>>,
    started: AtomicU64,
    /// Bumped after every successful refresh
    completed: AtomicU64,
    metrics: Arc<MetricsRegistry>,
}

/// Builder for [`TokenStore`]
pub struct TokenStoreBuilder {
    provider: Option<Arc<dyn TokenProvider>>,
    cache_path: Option<PathBuf>,
    precedence: SourcePrecedence,
    expiry_buffer: Duration,
    initial: Option<BearerToken>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Default for TokenStoreBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            cache_path: None,
            precedence: SourcePrecedence::default(),
            expiry_buffer: Duration::from_secs(60),
            initial: None,
            metrics: None,
        }
    }
}

impl TokenStoreBuilder {
    pub fn provider(mut self, provider: impl TokenProvider + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn shared_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn cache_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn precedence(mut self, precedence: SourcePrecedence) -> Self {
        self.precedence = precedence;
        self
    }

    pub fn expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Seed the cache, e.g. with a token obtained out of band
    pub fn initial_token(mut self, token: BearerToken) -> Self {
        self.initial = Some(token);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> TokenStore {
        TokenStore {
            inner: Arc::new(Inner {
                provider: self.provider,
                cache_path: self.cache_path,
                precedence: self.precedence,
                expiry_buffer: self.expiry_buffer,
                current: RwLock::new(self.initial),
                inflight: Mutex::new(None),
                started: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                metrics: self.metrics.unwrap_or_else(MetricsRegistry::global),
            }),
        }
    }
}

impl TokenStore {
    pub fn builder() -> TokenStoreBuilder {
        TokenStoreBuilder::default()
    }

    /// Return a usable token, refreshing when the cached one is missing,
    /// inside the expiry buffer, or `force_refresh` is set.
    ///
    /// Concurrent callers that need a refresh all await the same one.
    pub async fn get_token(&self, force_refresh: bool) -> Result<BearerToken, AuthError> {
        let seen = self.inner.completed.load(Ordering::Acquire);
        if !force_refresh {
            if let Some(token) = self.inner.cached_usable() {
                return Ok(token);
            }
        }
        self.refresh_after(seen).await
    }

    /// Replacement for a token the server just rejected with 401.
    ///
    /// If another caller already swapped in a different usable token, that
    /// one is returned without I/O; otherwise one forced refresh runs.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<BearerToken, AuthError> {
        let seen = self.inner.completed.load(Ordering::Acquire);
        if let Some(token) = self.inner.cached_usable() {
            if token.value != rejected {
                debug!("Rejected token already replaced");
                return Ok(token);
            }
        }
        self.refresh_after(seen).await
    }

    /// Currently cached token, usable or not
    pub fn cached(&self) -> Option<BearerToken> {
        self.inner.current.read().clone()
    }

    /// Number of refreshes that completed successfully
    pub fn refresh_count(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Join the in-flight refresh, or start one unless a refresh completed
    /// since the caller looked at the cache (`seen`).
    async fn refresh_after(&self, seen: u64) -> Result<BearerToken, AuthError> {
        let (id, refresh) = {
            let mut slot = self.inner.inflight.lock();
            match slot.as_ref() {
                Some((id, refresh)) => (*id, refresh.clone()),
                None => {
                    if self.inner.completed.load(Ordering::Acquire) != seen {
                        if let Some(token) = self.inner.cached_usable() {
                            return Ok(token);
                        }
                    }
                    let id = self.inner.started.fetch_add(1, Ordering::AcqRel) + 1;
                    let inner = Arc::clone(&self.inner);
                    let refresh = async move { inner.load_fresh().await }.boxed().shared();
                    *slot = Some((id, refresh.clone()));
                    (id, refresh)
                }
            }
        };

        let result = refresh.await;

        let mut slot = self.inner.inflight.lock();
        if matches!(slot.as_ref(), Some((current, _)) if *current == id) {
            *slot = None;
        }
        result
    }
}

impl Inner {
    fn cached_usable(&self) -> Option<BearerToken> {
        self.current
            .read()
            .as_ref()
            .filter(|t| t.is_usable(self.expiry_buffer, Utc::now()))
            .cloned()
    }

    fn source_order(&self) -> [TokenSource; 2] {
        match self.precedence {
            SourcePrecedence::ProviderFirst => [TokenSource::Provider, TokenSource::CacheFile],
            SourcePrecedence::CacheFileFirst => [TokenSource::CacheFile, TokenSource::Provider],
        }
    }

    async fn load_fresh(&self) -> Result<BearerToken, AuthError> {
        let mut failures = Vec::new();
        let mut configured = false;

        for source in self.source_order() {
            let attempt = match source {
                TokenSource::Provider => match &self.provider {
                    Some(provider) => provider
                        .fetch_token()
                        .await
                        .map(|issued| issued.into_bearer(TokenSource::Provider))
                        .and_then(|token| self.check_expiry(token)),
                    None => continue,
                },
                TokenSource::CacheFile => match &self.cache_path {
                    Some(path) => load_cache_file(path, self.expiry_buffer).await,
                    None => continue,
                },
            };
            configured = true;

            match attempt {
                Ok(token) => {
                    info!(
                        source = ?token.source,
                        expires_at = %token.expires_at,
                        "Bearer token refreshed"
                    );
                    *self.current.write() = Some(token.clone());
                    self.completed.fetch_add(1, Ordering::AcqRel);
                    self.metrics.record_token_refresh();
                    return Ok(token);
                }
                Err(e) => {
                    warn!(source = ?source, error = %e, "Token source failed");
                    failures.push(e.to_string());
                }
            }
        }

        if !configured {
            return Err(AuthError::NoSource);
        }
        Err(AuthError::Exhausted(failures.join("; ")))
    }

    fn check_expiry(&self, token: BearerToken) -> Result<BearerToken, AuthError> {
        if token.is_usable(self.expiry_buffer, Utc::now()) {
            Ok(token)
        } else {
            Err(AuthError::Expired(token.expires_at.to_rfc3339()))
        }
    }
}
