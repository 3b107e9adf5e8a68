//! fhir-client library crate
//!
//! A FHIR R4 REST client built for flaky servers: bearer tokens with
//! single-flight refresh, OperationOutcome-aware retry, paginated search
//! with "next" link repair, and bounded-concurrency fetches of several
//! resource types for one patient.
//!
//! The `fhir-fetch` binary in `main.rs` wires this up from environment
//! variables and writes NDJSON.

pub mod auth;
mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod search;
pub mod telemetry;
pub mod transport;

pub use auth::{BearerToken, IssuedToken, SourcePrecedence, TokenProvider, TokenStore};
pub use client::{FhirClient, FhirClientBuilder};
pub use config::ClientConfig;
pub use error::{AuthError, FhirClientError, Result};
pub use fetch::{ConcurrentFetchCoordinator, FetchRequest, FetchResult};
pub use search::{PaginationWalker, SearchLimits, SearchRequest};
pub use telemetry::{MetricsRegistry, MetricsSnapshot};
pub use transport::{ClassifiedOutcome, Jitter, RequestExecutor, RetryPolicy};
