use thiserror::Error;

/// Errors raised while decoding FHIR wire payloads
#[derive(Debug, Error)]
pub enum FhirError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing resourceType")]
    MissingResourceType,

    #[error("Expected resourceType '{expected}', got '{found}'")]
    UnexpectedResourceType { expected: String, found: String },
}
