//! One authenticated FHIR call: token, headers, retry, classification

use std::num::NonZeroU32;
use std::sync::Arc;

use fhir_core::FHIR_JSON;
use governor::{Quota, RateLimiter, clock::DefaultClock, state::InMemoryState};
use parking_lot::Mutex;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value as JsonValue;
use tracing::{debug, error};
use url::Url;
use uuid::Uuid;

use super::classify::{ClassifiedOutcome, classify, classify_transport_error};
use super::retry::{Attempt, AttemptError, RetryPolicy};
use crate::auth::TokenStore;
use crate::config::ClientConfig;
use crate::error::{FhirClientError, Result};
use crate::telemetry::MetricsRegistry;

/// Header carrying the per-request correlation id
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Client-side pacer shared by every worker of one client
pub type SharedPacer = Arc<RateLimiter<governor::state::NotKeyed, InMemoryState, DefaultClock>>;

/// Performs authenticated requests against one FHIR base URL
pub struct RequestExecutor {
    http: reqwest::Client,
    base_url: Url,
    tokens: TokenStore,
    retry: RetryPolicy,
    metrics: Arc<MetricsRegistry>,
    pacer: Option<SharedPacer>,
}

impl RequestExecutor {
    pub fn new(
        config: &ClientConfig,
        tokens: TokenStore,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| FhirClientError::Config(format!("HTTP client: {}", e)))?;

        let pacer = config
            .rate_limit_rps
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            tokens,
            retry: RetryPolicy::from_config(config, Arc::clone(&metrics)),
            metrics,
            pacer,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Absolute URL for an endpoint: absolute URLs pass through, anything
    /// else is resolved below the base URL
    pub fn resolve(&self, endpoint: &str) -> Result<Url> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(Url::parse(endpoint)?);
        }
        Ok(self.base_url.join(endpoint.trim_start_matches('/'))?)
    }

    /// Send one logical request and return the parsed JSON body
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<JsonValue> {
        let url = self.resolve(endpoint)?;
        self.send_url(method, url, params, body).await
    }

    /// Like [`send`](Self::send) with an already-resolved URL
    pub async fn send_url(
        &self,
        method: Method,
        url: Url,
        params: &[(String, String)],
        body: Option<&JsonValue>,
    ) -> Result<JsonValue> {
        let request_id = Uuid::new_v4().to_string();
        let payload = body.map(serde_json::to_vec).transpose()?;
        let last_token: Mutex<Option<String>> = Mutex::new(None);

        let result = self
            .retry
            .execute(|attempt| {
                self.attempt(
                    attempt,
                    &method,
                    &url,
                    params,
                    payload.as_deref(),
                    &request_id,
                    &last_token,
                )
            })
            .await;

        if let Err(err) = &result {
            self.metrics.record_error();
            error!(
                request_id = %request_id,
                method = %method,
                url = %url,
                error = %err,
                "FHIR request failed"
            );
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        attempt: Attempt,
        method: &Method,
        url: &Url,
        params: &[(String, String)],
        payload: Option<&[u8]>,
        request_id: &str,
        last_token: &Mutex<Option<String>>,
    ) -> std::result::Result<JsonValue, AttemptError> {
        self.metrics.record_request();

        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        let rejected = if attempt.force_refresh {
            last_token.lock().clone()
        } else {
            None
        };
        let token = match rejected {
            Some(rejected) => self.tokens.refresh_rejected(&rejected).await,
            None => self.tokens.get_token(attempt.force_refresh).await,
        }
        .map_err(FhirClientError::from)?;
        *last_token.lock() = Some(token.value.clone());

        debug!(
            request_id = %request_id,
            attempt = attempt.number,
            method = %method,
            url = %url,
            "Sending FHIR request"
        );

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(&token.value)
            .header(ACCEPT, FHIR_JSON)
            .header(REQUEST_ID_HEADER, request_id);
        if !params.is_empty() {
            request = request.query(params);
        }
        if let Some(payload) = payload {
            request = request
                .header(CONTENT_TYPE, FHIR_JSON)
                .body(payload.to_vec());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(classify_transport_error(&e).into()),
        };
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return Err(classify_transport_error(&e).into()),
        };

        match classify(status, &headers, &bytes) {
            ClassifiedOutcome::Success => {
                debug!(
                    request_id = %request_id,
                    status = status.as_u16(),
                    "FHIR request succeeded"
                );
                if bytes.is_empty() {
                    return Ok(JsonValue::Null);
                }
                serde_json::from_slice(&bytes).map_err(|e| {
                    AttemptError::Abort(FhirClientError::Parse(format!(
                        "Malformed JSON from {}: {}",
                        url, e
                    )))
                })
            }
            outcome => Err(outcome.into()),
        }
    }
}
