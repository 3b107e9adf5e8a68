//! Response classification
//!
//! Maps one HTTP exchange onto a [`ClassifiedOutcome`]. Status codes that
//! carry their own retry semantics (429, 401) are decided before the body
//! is looked at.

use fhir_core::{IssueType, OperationOutcome, OperationOutcomeIssue};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Wait applied when a 429 carries no usable `Retry-After`
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 10;


/// Outcome of one HTTP attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedOutcome {
    Success,
    RateLimited {
        retry_after_secs: u64,
    },
    AuthExpired,
    RetriableOperationOutcome {
        status: u16,
        issues: Vec<OperationOutcomeIssue>,
    },
    FatalOperationOutcome {
        status: u16,
        issues: Vec<OperationOutcomeIssue>,
    },
    FatalHttpError {
        status: u16,
        detail: String,
    },
    ConnectionError(String),
}

impl ClassifiedOutcome {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClassifiedOutcome::Success => "success",
            ClassifiedOutcome::RateLimited { .. } => "rate_limited",
            ClassifiedOutcome::AuthExpired => "auth_expired",
            ClassifiedOutcome::RetriableOperationOutcome { .. } => "retriable_outcome",
            ClassifiedOutcome::FatalOperationOutcome { .. } => "fatal_outcome",
            ClassifiedOutcome::FatalHttpError { .. } => "fatal_http",
            ClassifiedOutcome::ConnectionError(_) => "connection",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClassifiedOutcome::FatalOperationOutcome { .. }
                | ClassifiedOutcome::FatalHttpError { .. }
        )
    }
}

/// Classify a received response
pub fn classify(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> ClassifiedOutcome {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ClassifiedOutcome::RateLimited {
            retry_after_secs: retry_after_secs(headers),
        };
    }
    if status == StatusCode::UNAUTHORIZED {
        return ClassifiedOutcome::AuthExpired;
    }

    let outcome = OperationOutcome::from_body(body);

    if let Some(outcome) = outcome.as_ref().filter(|o| o.has_failures()) {
        let issues: Vec<OperationOutcomeIssue> = outcome.failures().cloned().collect();
        let code = status.as_u16();
        return if issues.iter().any(|i| is_retriable_code(&i.code)) {
            ClassifiedOutcome::RetriableOperationOutcome {
                status: code,
                issues,
            }
        } else {
            ClassifiedOutcome::FatalOperationOutcome {
                status: code,
                issues,
            }
        };
    }

    if status.is_success() {
        return ClassifiedOutcome::Success;
    }

    let detail = match outcome {
        Some(outcome) => outcome.summary(),
        None => body_snippet(body),
    };
    ClassifiedOutcome::FatalHttpError {
        status: status.as_u16(),
        detail,
    }
}

/// Classify a transport-level failure (no response received)
pub fn classify_transport_error(err: &reqwest::Error) -> ClassifiedOutcome {
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "transport"
    };
    ClassifiedOutcome::ConnectionError(format!("{}: {}", kind, err))
}

/// Substring match against the transient issue types, case-insensitive
fn is_retriable_code(code: &str) -> bool {
    let code = code.to_ascii_lowercase();
    IssueType::TRANSIENT
        .iter()
        .any(|t| code.contains(t.as_code()))
}

/// `Retry-After` in delta-seconds; anything else falls back to the default
fn retry_after_secs(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn body_snippet(body: &[u8]) -> String {
    const MAX: usize = 200;
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.chars().count() > MAX {
        format!("{}...", text.chars().take(MAX).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use serde_json::json;

    fn outcome_body(issues: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"resourceType": "OperationOutcome", "issue": issues})).unwrap()
    }

    #[test]
    fn plain_success() {
        let body = br#"{"resourceType":"Patient","id":"123"}"#;
        assert_eq!(
            classify(StatusCode::OK, &HeaderMap::new(), body),
            ClassifiedOutcome::Success
        );
    }

    #[test]
    fn rate_limit_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("5"));
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &headers, b""),
            ClassifiedOutcome::RateLimited { retry_after_secs: 5 }
        );
    }

    #[test]
    fn rate_limit_defaults_when_header_unusable() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &headers, b""),
            ClassifiedOutcome::RateLimited { retry_after_secs: 10 }
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), b""),
            ClassifiedOutcome::RateLimited { retry_after_secs: 10 }
        );
    }

    #[test]
    fn unauthorized_wins_over_body() {
        let body = outcome_body(json!([{"severity": "error", "code": "login"}]));
        assert_eq!(
            classify(StatusCode::UNAUTHORIZED, &HeaderMap::new(), &body),
            ClassifiedOutcome::AuthExpired
        );
    }

    #[test]
    fn invalid_outcome_is_fatal() {
        let body = outcome_body(json!([{"severity": "error", "code": "invalid"}]));
        let outcome = classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), &body);
        assert!(matches!(
            outcome,
            ClassifiedOutcome::FatalOperationOutcome { status: 400, .. }
        ));
    }

    #[test]
    fn transient_codes_are_retriable_case_insensitively() {
        for code in ["timeout", "TOO-COSTLY", "Transient", "throttled"] {
            let body = outcome_body(json!([
                {"severity": "warning", "code": "informational"},
                {"severity": "fatal", "code": code}
            ]));
            let outcome = classify(StatusCode::INTERNAL_SERVER_ERROR, &HeaderMap::new(), &body);
            match outcome {
                ClassifiedOutcome::RetriableOperationOutcome { status, issues } => {
                    assert_eq!(status, 500);
                    assert_eq!(issues.len(), 1);
                }
                other => panic!("{code}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn error_outcome_on_2xx_is_not_success() {
        let body = outcome_body(json!([{"severity": "error", "code": "timeout"}]));
        assert!(matches!(
            classify(StatusCode::OK, &HeaderMap::new(), &body),
            ClassifiedOutcome::RetriableOperationOutcome { status: 200, .. }
        ));
    }

    #[test]
    fn malformed_sibling_issue_does_not_hide_transient_one() {
        let body = outcome_body(json!([
            {"severity": "unexpected", "code": "processing"},
            {"severity": "error", "diagnostics": "no code"},
            {"severity": "error", "code": "transient"}
        ]));
        match classify(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new(), &body) {
            ClassifiedOutcome::RetriableOperationOutcome { status, issues } => {
                assert_eq!(status, 503);
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].code, "transient");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn warnings_only_do_not_fail() {
        let body = outcome_body(json!([{"severity": "warning", "code": "too-costly"}]));
        assert_eq!(
            classify(StatusCode::OK, &HeaderMap::new(), &body),
            ClassifiedOutcome::Success
        );
        // ...but a non-2xx status is still a failure
        assert!(matches!(
            classify(StatusCode::BAD_REQUEST, &HeaderMap::new(), &body),
            ClassifiedOutcome::FatalHttpError { status: 400, .. }
        ));
    }

    #[test]
    fn other_statuses_are_fatal_http_errors() {
        let outcome = classify(StatusCode::NOT_FOUND, &HeaderMap::new(), b"not here");
        assert_eq!(
            outcome,
            ClassifiedOutcome::FatalHttpError {
                status: 404,
                detail: "not here".to_string()
            }
        );
        assert!(outcome.is_fatal());
    }
}
