use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::QueueError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    #[default]
    New,
    PrSubmitted,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PrSubmitted => "pr-submitted",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::New)
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Self::New),
            "pr-submitted" => Ok(Self::PrSubmitted),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A queued natural-language change request.
///
/// `pr_url` is set only when `status` is `PrSubmitted` and `error` only when
/// it is `Error`; the `mark_*` methods keep that invariant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancementRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    pub summary: String,
    pub details: String,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl EnhancementRequest {
    pub fn new(summary: impl Into<String>, details: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_request_id(),
            summary: summary.into(),
            details: details.into(),
            status: RequestStatus::New,
            pr_url: None,
            error: None,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Required-field check applied at intake and again before processing.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.summary.trim().is_empty() {
            return Err(QueueError::Validation { field: "summary" });
        }
        if self.details.trim().is_empty() {
            return Err(QueueError::Validation { field: "details" });
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self, pr_url: String) {
        self.status = RequestStatus::PrSubmitted;
        self.pr_url = Some(pr_url);
        self.error = None;
        self.updated_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = RequestStatus::Error;
        self.error = Some(error);
        self.pr_url = None;
        self.updated_at = Some(Utc::now());
    }

    /// Put a terminal request back in the queue for the next cycle.
    pub fn requeue(&mut self) {
        self.status = RequestStatus::New;
        self.pr_url = None;
        self.error = None;
        self.updated_at = Some(Utc::now());
    }
}

/// Intake payload: what a caller supplies to enqueue a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEnhancement {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: String,
}

impl From<NewEnhancement> for EnhancementRequest {
    fn from(value: NewEnhancement) -> Self {
        EnhancementRequest::new(value.summary, value.details)
    }
}

/// One file in a generated change; `content` replaces the file in full.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

/// Structured result of a code-generation run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneratedChange {
    pub files: Vec<GeneratedFile>,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
}

/// Outcome of publishing a change for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedChange {
    pub branch: String,
    pub pr_url: String,
    /// False when the commit was skipped because nothing changed
    pub committed: bool,
    /// True when an existing pull request was reused
    pub reused_pr: bool,
}

/// Counts for one orchestrator cycle.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub submitted: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&RequestStatus::PrSubmitted).unwrap();
        assert_eq!(json, "\"pr-submitted\"");
        let parsed: RequestStatus = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, RequestStatus::Error);
    }

    #[test]
    fn test_status_from_str_matches_as_str() {
        for status in [
            RequestStatus::New,
            RequestStatus::PrSubmitted,
            RequestStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("done".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_legacy_record_without_id_or_status() {
        let json = r#"{"summary": "Add cache", "details": "LRU for lookups"}"#;
        let req: EnhancementRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.status, RequestStatus::New);
        assert!(!req.id.is_empty());
        assert!(req.pr_url.is_none());
        assert!(req.error.is_none());
    }

    #[test]
    fn test_validate_rejects_blank_fields() {
        let req = EnhancementRequest::new("  ", "details");
        assert!(matches!(
            req.validate(),
            Err(QueueError::Validation { field: "summary" })
        ));
        let req = EnhancementRequest::new("summary", "");
        assert!(matches!(
            req.validate(),
            Err(QueueError::Validation { field: "details" })
        ));
        assert!(EnhancementRequest::new("s", "d").validate().is_ok());
    }

    #[test]
    fn test_mark_methods_keep_invariant() {
        let mut req = EnhancementRequest::new("s", "d");
        req.mark_failed("AgentRunError: failed".into());
        assert_eq!(req.status, RequestStatus::Error);
        assert!(req.error.is_some() && req.pr_url.is_none());

        req.requeue();
        assert_eq!(req.status, RequestStatus::New);
        assert!(req.error.is_none() && req.pr_url.is_none());

        req.mark_submitted("https://github.com/o/r/pull/1".into());
        assert_eq!(req.status, RequestStatus::PrSubmitted);
        assert!(req.pr_url.is_some() && req.error.is_none());
    }

    #[test]
    fn test_optional_fields_omitted_when_absent() {
        let req = EnhancementRequest::new("s", "d");
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("pr_url").is_none());
        assert!(value.get("error").is_none());
        assert_eq!(value["status"], "new");
    }

    #[test]
    fn test_generated_change_requires_all_keys() {
        let json = r#"{"commit_message": "m", "pr_title": "t", "pr_body": "b"}"#;
        assert!(serde_json::from_str::<GeneratedChange>(json).is_err());
    }
}
