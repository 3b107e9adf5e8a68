use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::FhirError;

/// FHIR Bundle types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BundleType {
    Searchset,
    History,
    Collection,
    Document,
    Message,
    Transaction,
    TransactionResponse,
    Batch,
    BatchResponse,
}

/// FHIR Bundle resource (the subset a client needs to page and batch)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub resource_type: String,

    #[serde(rename = "type")]
    pub bundle_type: BundleType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub link: Vec<BundleLink>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry: Vec<BundleEntry>,
}

/// Bundle link (pagination relations such as `self` and `next`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleLink {
    pub relation: String,
    pub url: String,
}

/// Bundle entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<BundleEntryRequest>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<JsonValue>,
}

/// Request line of a batch/transaction entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleEntryRequest {
    pub method: String,
    pub url: String,
}

impl BundleEntry {
    pub fn new(full_url: Option<String>, resource: JsonValue) -> Self {
        Self {
            full_url,
            resource: Some(resource),
            request: None,
            response: None,
        }
    }

    /// Entry for a batch bundle: `method url`, with an optional body
    pub fn request(method: &str, url: impl Into<String>, resource: Option<JsonValue>) -> Self {
        Self {
            full_url: None,
            resource,
            request: Some(BundleEntryRequest {
                method: method.to_string(),
                url: url.into(),
            }),
            response: None,
        }
    }
}

impl Bundle {
    /// Decode a bundle from an untyped JSON document
    pub fn from_value(value: JsonValue) -> Result<Self, FhirError> {
        match value.get("resourceType").and_then(|v| v.as_str()) {
            Some("Bundle") => Ok(serde_json::from_value(value)?),
            Some(other) => Err(FhirError::UnexpectedResourceType {
                expected: "Bundle".to_string(),
                found: other.to_string(),
            }),
            None => Err(FhirError::MissingResourceType),
        }
    }

    /// Create a searchset bundle
    pub fn searchset(total: u32, entries: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: BundleType::Searchset,
            total: Some(total),
            link: vec![],
            entry: entries,
        }
    }

    /// Create a batch bundle from request entries
    pub fn batch(entries: Vec<BundleEntry>) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            bundle_type: BundleType::Batch,
            total: None,
            link: vec![],
            entry: entries,
        }
    }

    /// Add a link, builder style
    pub fn with_link(mut self, relation: &str, url: impl Into<String>) -> Self {
        self.link.push(BundleLink {
            relation: relation.to_string(),
            url: url.into(),
        });
        self
    }

    /// URL of the first link with the given relation
    pub fn link_url(&self, relation: &str) -> Option<&str> {
        self.link
            .iter()
            .find(|l| l.relation == relation)
            .map(|l| l.url.as_str())
    }

    /// URL of the `next` page, if any
    pub fn next_link(&self) -> Option<&str> {
        self.link_url("next")
    }

    /// Resources carried by the entries, in entry order
    pub fn resources(&self) -> impl Iterator<Item = &JsonValue> {
        self.entry.iter().filter_map(|e| e.resource.as_ref())
    }

    /// Logical ids of the entry resources, in entry order
    pub fn resource_ids(&self) -> Vec<String> {
        self.resources()
            .filter_map(|r| r.get("id").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect()
    }
}
