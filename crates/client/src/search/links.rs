//! "next" link handling
//!
//! Some servers hand back `next` links whose path repeats the mount path of
//! the base URL (`/fhir/r4/fhir/r4/Observation?...`) and drop `_count`.
//! The repair is a compatibility shim behind [`LinkRewriter`] so it can be
//! swapped out or disabled per client.

use url::Url;

/// Rewrites an absolute `next` URL before it is requested
pub trait LinkRewriter: Send + Sync {
    fn rewrite(&self, base: &Url, next: Url) -> Url;
}

/// Collapse a repeated mount-path prefix to a single occurrence
#[derive(Debug, Clone, Copy, Default)]
pub struct CollapseMountPath;

/// Leave links untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl LinkRewriter for CollapseMountPath {
    fn rewrite(&self, base: &Url, mut next: Url) -> Url {
        if let Some(path) = collapse_mount_path(base.path(), next.path()) {
            next.set_path(&path);
        }
        next
    }
}

impl LinkRewriter for PassThrough {
    fn rewrite(&self, _base: &Url, next: Url) -> Url {
        next
    }
}

/// `/fhir/r4/fhir/r4/Patient` -> `/fhir/r4/Patient` for mount `/fhir/r4/`.
///
/// Returns `None` when the path carries no duplicated prefix.
pub fn collapse_mount_path(base_path: &str, path: &str) -> Option<String> {
    let mount = base_path.trim_end_matches('/');
    if mount.is_empty() {
        return None;
    }

    let doubled = format!("{mount}{mount}");
    let is_doubled = |p: &str| {
        p.strip_prefix(doubled.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    };
    if !is_doubled(path) {
        return None;
    }

    let mut collapsed = path;
    while is_doubled(collapsed) {
        collapsed = &collapsed[mount.len()..];
    }
    Some(collapsed.to_string())
}

/// Endpoint and query parameters for a `next` link.
///
/// Relative links resolve against `current`, the endpoint of the page that
/// carried the link. The query is re-extracted from the URL and `_count` is
/// re-asserted to `page_size`.
pub fn next_page_request(
    base: &Url,
    current: &Url,
    next: &str,
    page_size: u32,
    rewriter: &dyn LinkRewriter,
) -> Result<(Url, Vec<(String, String)>), url::ParseError> {
    let absolute = current.join(next)?;
    let mut endpoint = rewriter.rewrite(base, absolute);

    let mut params: Vec<(String, String)> = endpoint.query_pairs().into_owned().collect();
    set_param(&mut params, "_count", &page_size.to_string());

    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok((endpoint, params))
}

/// Replace every value of `name` with a single `value`, keeping position
pub fn set_param(params: &mut Vec<(String, String)>, name: &str, value: &str) {
    match params.iter().position(|(k, _)| k == name) {
        Some(first) => {
            params[first].1 = value.to_string();
            let mut index = 0;
            params.retain(|(k, _)| {
                let keep = k != name || index == first;
                index += 1;
                keep
            });
        }
        None => params.push((name.to_string(), value.to_string())),
    }
}

/// Order-insensitive identity of a request, used to detect link loops
pub fn request_key(endpoint: &Url, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort();
    let query = sorted
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}?{query}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://sandbox.example.org/fhir/r4/").unwrap()
    }

    #[test]
    fn collapses_doubled_mount_path() {
        assert_eq!(
            collapse_mount_path("/fhir/r4/", "/fhir/r4/fhir/r4/Observation").as_deref(),
            Some("/fhir/r4/Observation")
        );
        assert_eq!(
            collapse_mount_path("/fhir/r4/", "/fhir/r4/fhir/r4/fhir/r4/Observation").as_deref(),
            Some("/fhir/r4/Observation")
        );
    }

    #[test]
    fn leaves_clean_paths_alone() {
        assert_eq!(collapse_mount_path("/fhir/r4/", "/fhir/r4/Observation"), None);
        assert_eq!(collapse_mount_path("/", "/Observation"), None);
        // only whole segments count
        assert_eq!(collapse_mount_path("/fhir/", "/fhir/fhirstore/Patient"), None);
    }

    fn page_url(resource_type: &str) -> Url {
        base().join(resource_type).unwrap()
    }

    #[test]
    fn next_link_is_repaired_and_count_reasserted() {
        let next = "https://sandbox.example.org/fhir/r4/fhir/r4/Observation?patient=pt1&_getpages=abc&_getpagesoffset=100";
        let (endpoint, params) = next_page_request(
            &base(),
            &page_url("Observation"),
            next,
            100,
            &CollapseMountPath,
        )
        .unwrap();

        assert_eq!(
            endpoint.as_str(),
            "https://sandbox.example.org/fhir/r4/Observation"
        );
        assert_eq!(
            params,
            vec![
                ("patient".to_string(), "pt1".to_string()),
                ("_getpages".to_string(), "abc".to_string()),
                ("_getpagesoffset".to_string(), "100".to_string()),
                ("_count".to_string(), "100".to_string()),
            ]
        );
    }

    #[test]
    fn pass_through_keeps_the_quirk() {
        let next = "https://sandbox.example.org/fhir/r4/fhir/r4/Observation?page=2";
        let (endpoint, _) = next_page_request(
            &base(),
            &page_url("Observation"),
            next,
            10,
            &PassThrough,
        )
        .unwrap();
        assert_eq!(
            endpoint.as_str(),
            "https://sandbox.example.org/fhir/r4/fhir/r4/Observation"
        );
    }

    #[test]
    fn relative_links_resolve_against_current_page() {
        let current = page_url("Patient");
        let (resolved, params) = next_page_request(
            &base(),
            &current,
            "Patient?page=2&_count=5",
            50,
            &CollapseMountPath,
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "https://sandbox.example.org/fhir/r4/Patient");
        assert_eq!(
            params,
            vec![
                ("page".to_string(), "2".to_string()),
                ("_count".to_string(), "50".to_string()),
            ]
        );
    }

    #[test]
    fn query_only_link_keeps_current_path() {
        let current = page_url("Patient");
        let (resolved, params) =
            next_page_request(&base(), &current, "?page=2", 20, &CollapseMountPath).unwrap();
        assert_eq!(resolved.as_str(), "https://sandbox.example.org/fhir/r4/Patient");
        assert_eq!(
            params,
            vec![
                ("page".to_string(), "2".to_string()),
                ("_count".to_string(), "20".to_string()),
            ]
        );

        let (resolved, _) = next_page_request(
            &base(),
            &current,
            "/fhir/r4/Encounter?page=3",
            20,
            &PassThrough,
        )
        .unwrap();
        assert_eq!(resolved.as_str(), "https://sandbox.example.org/fhir/r4/Encounter");
    }

    #[test]
    fn set_param_deduplicates() {
        let mut params = vec![
            ("_count".to_string(), "1".to_string()),
            ("a".to_string(), "b".to_string()),
            ("_count".to_string(), "2".to_string()),
        ];
        set_param(&mut params, "_count", "9");
        assert_eq!(
            params,
            vec![
                ("_count".to_string(), "9".to_string()),
                ("a".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn request_key_ignores_param_order() {
        let url = base().join("Patient").unwrap();
        let a = vec![("x".to_string(), "1".to_string()), ("y".to_string(), "2".to_string())];
        let b = vec![("y".to_string(), "2".to_string()), ("x".to_string(), "1".to_string())];
        assert_eq!(request_key(&url, &a), request_key(&url, &b));
    }
}
