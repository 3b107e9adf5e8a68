//! Fan-out of patient-scoped searches across resource types
//!
//! Each resource type is walked by its own task; a semaphore bounds how many
//! walks hit the server at once. Failures stay with their resource type and
//! never abort the siblings.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use fhir_core::Bundle;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{FhirClientError, Result};
use crate::search::{LinkRewriter, PaginationWalker, SearchLimits, SearchRequest};
use crate::transport::RequestExecutor;

/// Lab results are the default slice of Observation
pub const DEFAULT_OBSERVATION_CATEGORY: &str = "laboratory";

/// Search request for one resource type of a patient.
///
/// `Patient` is filtered by `_id`, everything else by `patient`. Observation
/// searches default to `category=laboratory`. `overrides` win over every
/// default with the same name.
pub fn patient_search_request(
    patient_id: &str,
    resource_type: &str,
    page_size: u32,
    overrides: &[(String, String)],
) -> SearchRequest {
    let overridden = |name: &str| overrides.iter().any(|(k, _)| k == name);
    let mut request = SearchRequest::new(resource_type, page_size);

    let scope = if resource_type == "Patient" { "_id" } else { "patient" };
    if !overridden(scope) {
        request = request.param(scope, patient_id);
    }
    if resource_type == "Observation" && !overridden("category") {
        request = request.param("category", DEFAULT_OBSERVATION_CATEGORY);
    }

    request.params.extend(overrides.iter().cloned());
    request
}

/// Everything one `fetch_many` call needs
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub patient_id: String,
    pub resource_types: Vec<String>,
    pub page_size: u32,
    /// Extra search parameters per resource type
    pub params: HashMap<String, Vec<(String, String)>>,
    pub limits: SearchLimits,
    /// Wall-clock budget for the whole fetch
    pub deadline: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl FetchRequest {
    pub fn new<I, S>(patient_id: impl Into<String>, resource_types: I, page_size: u32) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patient_id: patient_id.into(),
            resource_types: resource_types.into_iter().map(Into::into).collect(),
            page_size,
            params: HashMap::new(),
            limits: SearchLimits::default(),
            deadline: None,
            cancel: None,
        }
    }

    pub fn param(
        mut self,
        resource_type: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.params
            .entry(resource_type.into())
            .or_default()
            .push((name.into(), value.into()));
        self
    }

    pub fn with_limits(mut self, limits: SearchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Requested types in first-seen order, without repeats
    fn unique_resource_types(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.resource_types
            .iter()
            .filter(|rt| seen.insert(rt.as_str()))
            .cloned()
            .collect()
    }

    fn search_request(&self, resource_type: &str) -> SearchRequest {
        let overrides = self
            .params
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default();
        patient_search_request(&self.patient_id, resource_type, self.page_size, overrides)
    }
}

/// Runs one paginated search per resource type under a concurrency bound
pub struct ConcurrentFetchCoordinator {
    executor: Arc<RequestExecutor>,
    rewriter: Arc<dyn LinkRewriter>,
    concurrency_limit: usize,
}

struct WalkReport {
    resource_type: String,
    pages: Vec<Bundle>,
    error: Option<FhirClientError>,
}

impl ConcurrentFetchCoordinator {
    pub fn new(
        executor: Arc<RequestExecutor>,
        rewriter: Arc<dyn LinkRewriter>,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            executor,
            rewriter,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Fetch every page of each resource type for one patient
    pub async fn fetch_many<S: AsRef<str>>(
        &self,
        patient_id: &str,
        resource_types: &[S],
        page_size: u32,
    ) -> Result<super::FetchResult> {
        let request = FetchRequest::new(
            patient_id,
            resource_types.iter().map(|rt| rt.as_ref().to_string()),
            page_size,
        );
        self.fetch_many_with(request).await
    }

    /// Fetch with per-type parameters, limits and cancellation.
    ///
    /// Only a failure to obtain a token before any search starts is returned
    /// as `Err` (`Auth`, or `Cancelled` when the deadline or cancellation wins
    /// that wait); everything later lands in
    /// [`FetchResult::errors`](super::FetchResult).
    pub async fn fetch_many_with(&self, request: FetchRequest) -> Result<super::FetchResult> {
        let mut result = super::FetchResult::default();
        let resource_types = request.unique_resource_types();
        if resource_types.is_empty() {
            return Ok(result);
        }

        let cancel = request.cancel.clone().unwrap_or_default();
        // a budget too large to represent is no deadline at all
        let deadline = request
            .deadline
            .and_then(|budget| Instant::now().checked_add(budget));

        tokio::select! {
            _ = stopped(&cancel, deadline) => return Err(stop_reason(&cancel, "Token")),
            token = self.executor.tokens().get_token(false) => {
                token?;
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));

        info!(
            patient_id = %request.patient_id,
            resource_types = ?resource_types,
            concurrency = self.concurrency_limit,
            "Starting multi-resource fetch"
        );

        let mut workers = JoinSet::new();
        for resource_type in resource_types {
            let walker = PaginationWalker::new(
                Arc::clone(&self.executor),
                Arc::clone(&self.rewriter),
                request.search_request(&resource_type),
            )
            .with_limits(request.limits);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            workers.spawn(async move {
                let walk = walk_resource_type(walker, semaphore, &cancel, deadline);
                match AssertUnwindSafe(walk).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => WalkReport {
                        resource_type: resource_type.clone(),
                        pages: vec![],
                        error: Some(FhirClientError::Cancelled(format!(
                            "{} worker panicked",
                            resource_type
                        ))),
                    },
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    match &report.error {
                        Some(error) => warn!(
                            resource_type = %report.resource_type,
                            pages = report.pages.len(),
                            error = %error,
                            "Resource type fetch failed"
                        ),
                        None => info!(
                            resource_type = %report.resource_type,
                            pages = report.pages.len(),
                            "Resource type fetch complete"
                        ),
                    }
                    result.record(report.resource_type, report.pages, report.error);
                }
                Err(join_error) => {
                    warn!(error = %join_error, "Fetch worker did not finish");
                }
            }
        }

        info!(
            patient_id = %request.patient_id,
            resources = result.total_resources(),
            failed = result.errors.len(),
            "Multi-resource fetch finished"
        );
        Ok(result)
    }
}

/// Resolves once the fetch is cancelled or its deadline has passed
async fn stopped(cancel: &CancellationToken, deadline: Option<Instant>) {
    match deadline {
        Some(at) => {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep_until(at) => {}
            }
        }
        None => cancel.cancelled().await,
    }
}

fn stop_reason(cancel: &CancellationToken, resource_type: &str) -> FhirClientError {
    if cancel.is_cancelled() {
        FhirClientError::Cancelled(format!("{} fetch cancelled", resource_type))
    } else {
        FhirClientError::Cancelled(format!("{} fetch hit the deadline", resource_type))
    }
}

async fn walk_resource_type(
    mut walker: PaginationWalker,
    semaphore: Arc<Semaphore>,
    cancel: &CancellationToken,
    deadline: Option<Instant>,
) -> WalkReport {
    let resource_type = walker.request().resource_type.clone();
    let mut pages = Vec::new();

    let permit = tokio::select! {
        _ = stopped(cancel, deadline) => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        let error = stop_reason(cancel, &resource_type);
        return WalkReport {
            resource_type,
            pages,
            error: Some(error),
        };
    };

    let error = loop {
        tokio::select! {
            _ = stopped(cancel, deadline) => break Some(stop_reason(cancel, &resource_type)),
            page = walker.next_page() => match page {
                Ok(Some(bundle)) => pages.push(bundle),
                Ok(None) => break None,
                Err(error) => break Some(error),
            },
        }
    };

    WalkReport {
        resource_type,
        pages,
        error,
    }
}
