//! Client error taxonomy

use fhir_core::OperationOutcomeIssue;
use thiserror::Error;

/// Why no usable bearer token could be obtained.
///
/// Cloneable so one single-flight refresh result can be handed to every
/// waiting caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No token source configured")]
    NoSource,

    #[error("Token provider failed: {0}")]
    Provider(String),

    #[error("Token cache file {path}: {reason}")]
    CacheFile { path: String, reason: String },

    #[error("Token expired at {0}")]
    Expired(String),

    #[error("No valid token obtainable: {0}")]
    Exhausted(String),
}

/// Errors surfaced by the FHIR client
#[derive(Debug, Error)]
pub enum FhirClientError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Rate limited by server (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("Retriable protocol error{}: {message}", fmt_status(.status))]
    Retriable {
        status: Option<u16>,
        message: String,
        issues: Vec<OperationOutcomeIssue>,
    },

    #[error("Fatal protocol error ({status}): {message}")]
    Fatal {
        status: u16,
        message: String,
        issues: Vec<OperationOutcomeIssue>,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Fetch cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl FhirClientError {
    /// True for errors a caller may reasonably retry later
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            FhirClientError::RateLimited { .. } | FhirClientError::Retriable { .. }
        )
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            FhirClientError::Fatal { status, .. } => Some(*status),
            FhirClientError::Retriable { status, .. } => *status,
            FhirClientError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<fhir_core::FhirError> for FhirClientError {
    fn from(err: fhir_core::FhirError) -> Self {
        FhirClientError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for FhirClientError {
    fn from(err: serde_json::Error) -> Self {
        FhirClientError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for FhirClientError {
    fn from(err: url::ParseError) -> Self {
        FhirClientError::Config(format!("Invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FhirClientError>;
