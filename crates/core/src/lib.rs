//! fhir-core: Shared FHIR R4 wire types
//!
//! This crate provides the JSON shapes the client exchanges with a FHIR
//! server: Bundle, OperationOutcome and CapabilityStatement. Resources
//! themselves stay untyped (`serde_json::Value`).

pub mod bundle;
pub mod capability;
pub mod error;
pub mod outcome;

pub use bundle::{Bundle, BundleEntry, BundleEntryRequest, BundleLink, BundleType};
pub use capability::{CapabilityResource, CapabilityRest, CapabilityStatement};
pub use error::FhirError;
pub use outcome::{IssueSeverity, IssueType, OperationOutcome, OperationOutcomeIssue};

/// MIME type for FHIR JSON payloads
pub const FHIR_JSON: &str = "application/fhir+json";

/// Read the `resourceType` of an untyped resource
pub fn resource_type_of(resource: &serde_json::Value) -> Option<&str> {
    resource.get("resourceType").and_then(|v| v.as_str())
}
