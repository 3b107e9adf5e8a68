use serde::{Deserialize, Serialize};

/// FHIR CapabilityStatement as returned by `GET {base}/metadata` (simplified).
///
/// Servers vary widely in what they fill in, so everything beyond
/// `resourceType` is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityStatement {
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,
    #[serde(default)]
    pub format: Vec<String>,
    #[serde(default)]
    pub rest: Vec<CapabilityRest>,
}

/// REST capability declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRest {
    pub mode: String,
    #[serde(default)]
    pub resource: Vec<CapabilityResource>,
}

/// Per-resource capability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub interaction: Vec<CapabilityInteraction>,
}

/// A supported interaction (`read`, `search-type`, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityInteraction {
    pub code: String,
}

impl CapabilityStatement {
    /// Server-mode resource declarations
    fn server_resources(&self) -> impl Iterator<Item = &CapabilityResource> {
        self.rest
            .iter()
            .filter(|r| r.mode == "server")
            .flat_map(|r| r.resource.iter())
    }

    /// Resource types the server declares in server mode
    pub fn resource_types(&self) -> Vec<&str> {
        self.server_resources()
            .map(|r| r.resource_type.as_str())
            .collect()
    }

    /// True when the server declares `search-type` for the resource type
    pub fn supports_search(&self, resource_type: &str) -> bool {
        self.server_resources()
            .filter(|r| r.resource_type == resource_type)
            .any(|r| r.interaction.iter().any(|i| i.code == "search-type"))
    }
}
