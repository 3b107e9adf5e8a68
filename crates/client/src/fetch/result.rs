//! Merged outcome of a multi-resource fetch

use std::collections::BTreeMap;
use std::io::Write;

use fhir_core::Bundle;
use serde_json::Value as JsonValue;

use crate::error::FhirClientError;

/// Pages gathered per resource type, plus per-type failures.
///
/// A resource type can appear in both maps when it failed (or was
/// cancelled) after some pages had already arrived.
#[derive(Debug, Default)]
pub struct FetchResult {
    pub by_resource_type: BTreeMap<String, Vec<Bundle>>,
    pub errors: BTreeMap<String, FhirClientError>,
}

impl FetchResult {
    /// True when every requested resource type finished without error
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn pages(&self, resource_type: &str) -> &[Bundle] {
        self.by_resource_type
            .get(resource_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Entry resources of one type, in page order
    pub fn resources<'a>(
        &'a self,
        resource_type: &str,
    ) -> impl Iterator<Item = &'a JsonValue> + 'a {
        self.pages(resource_type).iter().flat_map(Bundle::resources)
    }

    pub fn total_resources(&self) -> usize {
        self.by_resource_type
            .values()
            .flatten()
            .map(|bundle| bundle.resources().count())
            .sum()
    }

    /// Write every resource as one JSON document per line, grouped by
    /// resource type. Returns the number of lines written.
    pub fn write_ndjson<W: Write>(&self, mut writer: W) -> std::io::Result<usize> {
        let mut lines = 0;
        for bundles in self.by_resource_type.values() {
            for resource in bundles.iter().flat_map(Bundle::resources) {
                serde_json::to_writer(&mut writer, resource)?;
                writer.write_all(b"\n")?;
                lines += 1;
            }
        }
        writer.flush()?;
        Ok(lines)
    }

    pub(crate) fn record(
        &mut self,
        resource_type: String,
        pages: Vec<Bundle>,
        error: Option<FhirClientError>,
    ) {
        match error {
            Some(error) => {
                if !pages.is_empty() {
                    self.by_resource_type.insert(resource_type.clone(), pages);
                }
                self.errors.insert(resource_type, error);
            }
            None => {
                self.by_resource_type.insert(resource_type, pages);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fhir_core::BundleEntry;
    use serde_json::json;

    fn page(ids: &[&str]) -> Bundle {
        let entries = ids
            .iter()
            .map(|id| BundleEntry::new(None, json!({"resourceType": "Observation", "id": id})))
            .collect();
        Bundle::searchset(ids.len() as u32, entries)
    }

    #[test]
    fn partial_failures_keep_their_pages() {
        let mut result = FetchResult::default();
        result.record("Observation".into(), vec![page(&["a", "b"]), page(&["c"])], None);
        result.record(
            "Encounter".into(),
            vec![],
            Some(FhirClientError::Cancelled("deadline".into())),
        );
        result.record(
            "Condition".into(),
            vec![page(&["d"])],
            Some(FhirClientError::Cancelled("deadline".into())),
        );

        assert!(!result.is_complete());
        assert_eq!(result.total_resources(), 4);
        assert!(result.pages("Encounter").is_empty());
        assert!(!result.by_resource_type.contains_key("Encounter"));
        assert_eq!(result.pages("Condition").len(), 1);
        let ids: Vec<_> = result
            .resources("Observation")
            .filter_map(|r| r["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn ndjson_is_one_resource_per_line() {
        let mut result = FetchResult::default();
        result.record("Observation".into(), vec![page(&["a", "b"])], None);

        let mut out = Vec::new();
        let lines = result.write_ndjson(&mut out).unwrap();
        assert_eq!(lines, 2);

        let text = String::from_utf8(out).unwrap();
        let parsed: Vec<JsonValue> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(parsed[1]["id"], "b");
    }
}
