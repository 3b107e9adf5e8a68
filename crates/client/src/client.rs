//! `FhirClient`: the facade most callers use

use std::sync::Arc;

use fhir_core::{Bundle, BundleType, CapabilityStatement, FhirError};
use reqwest::Method;
use serde_json::Value as JsonValue;
use tracing::info;

use crate::auth::TokenStore;
use crate::config::ClientConfig;
use crate::error::{FhirClientError, Result};
use crate::fetch::{ConcurrentFetchCoordinator, FetchRequest, FetchResult};
use crate::search::{CollapseMountPath, LinkRewriter, PaginationWalker, SearchRequest};
use crate::telemetry::MetricsRegistry;
use crate::transport::RequestExecutor;

/// FHIR REST client bound to one server.
///
/// Every operation goes through one shared [`RequestExecutor`], so the token
/// cache, retry budget and pacing are shared by searches and fan-out fetches.
#[derive(Clone)]
pub struct FhirClient {
    executor: Arc<RequestExecutor>,
    rewriter: Arc<dyn LinkRewriter>,
    config: ClientConfig,
}

/// Builder for [`FhirClient`]
pub struct FhirClientBuilder {
    config: ClientConfig,
    tokens: Option<TokenStore>,
    metrics: Option<Arc<MetricsRegistry>>,
    rewriter: Option<Arc<dyn LinkRewriter>>,
}

impl FhirClientBuilder {
    pub fn tokens(mut self, tokens: TokenStore) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the default [`CollapseMountPath`] next-link repair
    pub fn link_rewriter(mut self, rewriter: impl LinkRewriter + 'static) -> Self {
        self.rewriter = Some(Arc::new(rewriter));
        self
    }

    /// Build the client. Without an explicit token store, one is created
    /// from `config.token_cache_path`.
    pub fn build(self) -> Result<FhirClient> {
        let metrics = self.metrics.unwrap_or_else(MetricsRegistry::global);

        let tokens = match (self.tokens, &self.config.token_cache_path) {
            (Some(tokens), _) => tokens,
            (None, Some(path)) => TokenStore::builder()
                .cache_file(path.clone())
                .expiry_buffer(self.config.token_expiry_buffer)
                .metrics(Arc::clone(&metrics))
                .build(),
            (None, None) => {
                return Err(FhirClientError::Config(
                    "No token store given and no token cache path configured".to_string(),
                ));
            }
        };

        let executor = RequestExecutor::new(&self.config, tokens, metrics)?;
        info!(base_url = %self.config.base_url, "FHIR client ready");

        Ok(FhirClient {
            executor: Arc::new(executor),
            rewriter: self
                .rewriter
                .unwrap_or_else(|| Arc::new(CollapseMountPath)),
            config: self.config,
        })
    }
}

impl FhirClient {
    pub fn builder(config: ClientConfig) -> FhirClientBuilder {
        FhirClientBuilder {
            config,
            tokens: None,
            metrics: None,
            rewriter: None,
        }
    }

    pub fn new(config: ClientConfig, tokens: TokenStore) -> Result<Self> {
        Self::builder(config).tokens(tokens).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &Arc<RequestExecutor> {
        &self.executor
    }

    pub fn tokens(&self) -> &TokenStore {
        self.executor.tokens()
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.executor.metrics()
    }

    /// Read one resource: `GET {base}/{type}/{id}`
    pub async fn get_resource(&self, resource_type: &str, id: &str) -> Result<JsonValue> {
        if resource_type.is_empty() || id.is_empty() || id.contains('/') {
            return Err(FhirClientError::Config(format!(
                "Invalid resource reference {}/{}",
                resource_type, id
            )));
        }

        let resource = self
            .executor
            .send(Method::GET, &format!("{}/{}", resource_type, id), &[], None)
            .await?;

        match fhir_core::resource_type_of(&resource) {
            Some(found) if found == resource_type => Ok(resource),
            Some(found) => Err(FhirError::UnexpectedResourceType {
                expected: resource_type.to_string(),
                found: found.to_string(),
            }
            .into()),
            None => Err(FhirError::MissingResourceType.into()),
        }
    }

    /// Lazily walk a search. Nothing is sent until the first page is pulled.
    pub fn search(&self, request: SearchRequest) -> PaginationWalker {
        PaginationWalker::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.rewriter),
            request,
        )
    }

    /// Search with the configured default page size
    pub fn search_type(&self, resource_type: &str, params: &[(&str, &str)]) -> PaginationWalker {
        let mut request = SearchRequest::new(resource_type, self.config.page_size);
        for (name, value) in params {
            request = request.param(*name, *value);
        }
        self.search(request)
    }

    /// `GET {base}/metadata`
    pub async fn metadata(&self) -> Result<CapabilityStatement> {
        let value = self.executor.send(Method::GET, "metadata", &[], None).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// POST a `batch` Bundle to the base URL and return the response Bundle
    pub async fn batch(&self, bundle: &Bundle) -> Result<Bundle> {
        if bundle.bundle_type != BundleType::Batch {
            return Err(FhirClientError::Config(format!(
                "Expected a batch bundle, got {:?}",
                bundle.bundle_type
            )));
        }

        let body = serde_json::to_value(bundle)?;
        let url = self.executor.base_url().clone();
        let value = self
            .executor
            .send_url(Method::POST, url, &[], Some(&body))
            .await?;
        Ok(Bundle::from_value(value)?)
    }

    /// Coordinator sharing this client's executor and link rewriter
    pub fn coordinator(&self) -> ConcurrentFetchCoordinator {
        ConcurrentFetchCoordinator::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.rewriter),
            self.config.concurrency_limit,
        )
    }

    /// Fetch every page of each resource type for one patient
    pub async fn fetch_many<S: AsRef<str>>(
        &self,
        patient_id: &str,
        resource_types: &[S],
        page_size: u32,
    ) -> Result<FetchResult> {
        self.coordinator()
            .fetch_many(patient_id, resource_types, page_size)
            .await
    }

    pub async fn fetch_many_with(&self, request: FetchRequest) -> Result<FetchResult> {
        self.coordinator().fetch_many_with(request).await
    }
}
