//! Page-by-page search following `next` links

use std::collections::HashSet;
use std::sync::Arc;

use fhir_core::Bundle;
use futures::Stream;
use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use super::links::{LinkRewriter, next_page_request, request_key, set_param};
use crate::error::{FhirClientError, Result};
use crate::transport::RequestExecutor;

/// One logical search: resource type, filters and page size
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub resource_type: String,
    pub params: Vec<(String, String)>,
    pub page_size: u32,
}

impl SearchRequest {
    pub fn new(resource_type: impl Into<String>, page_size: u32) -> Self {
        Self {
            resource_type: resource_type.into(),
            params: vec![],
            page_size,
        }
    }

    /// Add a search parameter, builder style
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k == name)
    }

    /// Query for the first page: the filters with `_count=page_size`
    pub fn first_page_params(&self) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        set_param(&mut params, "_count", &self.page_size.to_string());
        params
    }
}

/// Early stop conditions for a walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchLimits {
    /// Stop after this many pages
    pub max_pages: Option<usize>,
    /// Stop once this many resources were delivered. Checked between
    /// pages, so the walk may overshoot by one page.
    pub max_resources: Option<usize>,
}

#[derive(Debug)]
enum WalkState {
    Start,
    Next {
        url: Url,
        params: Vec<(String, String)>,
    },
    Done,
}

/// Lazily walks the pages of one search in server `next` order.
///
/// Holds its own cursor; start a fresh walker to restart a search.
pub struct PaginationWalker {
    executor: Arc<RequestExecutor>,
    rewriter: Arc<dyn LinkRewriter>,
    request: SearchRequest,
    limits: SearchLimits,
    state: WalkState,
    visited: HashSet<String>,
    pages: usize,
    resources: usize,
}

impl PaginationWalker {
    pub fn new(
        executor: Arc<RequestExecutor>,
        rewriter: Arc<dyn LinkRewriter>,
        request: SearchRequest,
    ) -> Self {
        Self {
            executor,
            rewriter,
            request,
            limits: SearchLimits::default(),
            state: WalkState::Start,
            visited: HashSet::new(),
            pages: 0,
            resources: 0,
        }
    }

    pub fn with_limits(mut self, limits: SearchLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn resources_fetched(&self) -> usize {
        self.resources
    }

    fn limit_reached(&self) -> bool {
        self.limits.max_pages.is_some_and(|max| self.pages >= max)
            || self.limits.max_resources.is_some_and(|max| self.resources >= max)
    }

    /// Fetch the next page, or `None` once the walk is over.
    ///
    /// After an error the walker is finished.
    pub async fn next_page(&mut self) -> Result<Option<Bundle>> {
        if self.limit_reached() {
            debug!(
                resource_type = %self.request.resource_type,
                pages = self.pages,
                resources = self.resources,
                "Search limit reached"
            );
            self.state = WalkState::Done;
        }

        let (url, params) = match std::mem::replace(&mut self.state, WalkState::Done) {
            WalkState::Done => return Ok(None),
            WalkState::Start => {
                let url = self.executor.resolve(&self.request.resource_type)?;
                let params = self.request.first_page_params();
                self.visited.insert(request_key(&url, &params));
                (url, params)
            }
            WalkState::Next { url, params } => (url, params),
        };

        let value = self
            .executor
            .send_url(Method::GET, url.clone(), &params, None)
            .await?;
        let bundle = Bundle::from_value(value)?;

        self.pages += 1;
        self.resources += bundle.entry.len();
        debug!(
            resource_type = %self.request.resource_type,
            page = self.pages,
            entries = bundle.entry.len(),
            "Fetched search page"
        );

        if let Some(next) = bundle.next_link() {
            let (next_url, next_params) = next_page_request(
                self.executor.base_url(),
                &url,
                next,
                self.request.page_size,
                self.rewriter.as_ref(),
            )
            .map_err(|e| FhirClientError::Parse(format!("Invalid next link {}: {}", next, e)))?;
            if self.visited.insert(request_key(&next_url, &next_params)) {
                self.state = WalkState::Next {
                    url: next_url,
                    params: next_params,
                };
            } else {
                warn!(
                    resource_type = %self.request.resource_type,
                    next = %next,
                    "Server repeated a next link, stopping search"
                );
            }
        }

        Ok(Some(bundle))
    }

    /// Fetch every remaining page
    pub async fn collect_pages(&mut self) -> Result<Vec<Bundle>> {
        let mut pages = Vec::new();
        while let Some(page) = self.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    /// The walk as a stream of pages; ends after the first error
    pub fn into_stream(self) -> impl Stream<Item = Result<Bundle>> {
        futures::stream::try_unfold(self, |mut walker| async move {
            let page = walker.next_page().await?;
            Ok::<_, FhirClientError>(page.map(|page| (page, walker)))
        })
    }
}
