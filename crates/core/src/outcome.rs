use serde::{Deserialize, Serialize};

/// Severity of the issue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    /// `error` and `fatal` issues mean the operation failed
    pub fn is_failure(self) -> bool {
        matches!(self, IssueSeverity::Fatal | IssueSeverity::Error)
    }
}

/// Type of issue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IssueType {
    Invalid,
    Structure,
    Required,
    Value,
    Invariant,
    Security,
    Login,
    Unknown,
    Expired,
    Forbidden,
    Suppressed,
    Processing,
    NotSupported,
    Duplicate,
    NotFound,
    TooLong,
    CodeInvalid,
    Extension,
    TooCostly,
    BusinessRule,
    Conflict,
    Incomplete,
    Transient,
    LockError,
    NoStore,
    Exception,
    Timeout,
    Throttled,
    Informational,
}

impl IssueType {
    /// Issue types a server reports for conditions that may clear on retry
    pub const TRANSIENT: [IssueType; 4] = [
        IssueType::Timeout,
        IssueType::TooCostly,
        IssueType::Transient,
        IssueType::Throttled,
    ];

    /// Wire code of this issue type
    pub fn as_code(self) -> &'static str {
        match self {
            IssueType::Invalid => "invalid",
            IssueType::Structure => "structure",
            IssueType::Required => "required",
            IssueType::Value => "value",
            IssueType::Invariant => "invariant",
            IssueType::Security => "security",
            IssueType::Login => "login",
            IssueType::Unknown => "unknown",
            IssueType::Expired => "expired",
            IssueType::Forbidden => "forbidden",
            IssueType::Suppressed => "suppressed",
            IssueType::Processing => "processing",
            IssueType::NotSupported => "not-supported",
            IssueType::Duplicate => "duplicate",
            IssueType::NotFound => "not-found",
            IssueType::TooLong => "too-long",
            IssueType::CodeInvalid => "code-invalid",
            IssueType::Extension => "extension",
            IssueType::TooCostly => "too-costly",
            IssueType::BusinessRule => "business-rule",
            IssueType::Conflict => "conflict",
            IssueType::Incomplete => "incomplete",
            IssueType::Transient => "transient",
            IssueType::LockError => "lock-error",
            IssueType::NoStore => "no-store",
            IssueType::Exception => "exception",
            IssueType::Timeout => "timeout",
            IssueType::Throttled => "throttled",
            IssueType::Informational => "informational",
        }
    }
}

/// A single issue within an OperationOutcome.
///
/// `code` stays a plain string: servers emit codes outside the R4 value set
/// and the client must still be able to read them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationOutcomeIssue {
    pub severity: IssueSeverity,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// FHIR OperationOutcome resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub resource_type: String,
    #[serde(default)]
    pub issue: Vec<OperationOutcomeIssue>,
}

impl OperationOutcome {
    /// Parse a response body as an OperationOutcome.
    ///
    /// Returns `None` when the body is not JSON or is some other resource.
    /// Issues that don't decode (unknown severity, missing code) are skipped
    /// so the remaining ones can still be classified.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
        if value.get("resourceType").and_then(|v| v.as_str()) != Some("OperationOutcome") {
            return None;
        }
        let issue = match value.get_mut("issue").map(serde_json::Value::take) {
            Some(serde_json::Value::Array(raw)) => raw
                .into_iter()
                .filter_map(|i| serde_json::from_value(i).ok())
                .collect(),
            _ => vec![],
        };
        Some(Self {
            resource_type: "OperationOutcome".to_string(),
            issue,
        })
    }

    /// Issues with severity `error` or `fatal`
    pub fn failures(&self) -> impl Iterator<Item = &OperationOutcomeIssue> {
        self.issue.iter().filter(|i| i.severity.is_failure())
    }

    /// True when at least one issue is `error` or `fatal`
    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }

    /// Diagnostics of all issues joined into one line
    pub fn summary(&self) -> String {
        self.issue
            .iter()
            .map(|i| match &i.diagnostics {
                Some(d) => format!("{} ({}): {}", i.code, severity_label(i.severity), d),
                None => format!("{} ({})", i.code, severity_label(i.severity)),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn severity_label(severity: IssueSeverity) -> &'static str {
    match severity {
        IssueSeverity::Fatal => "fatal",
        IssueSeverity::Error => "error",
        IssueSeverity::Warning => "warning",
        IssueSeverity::Information => "information",
    }
}
