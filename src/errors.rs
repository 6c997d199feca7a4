//! Typed error hierarchy for the enhancement automation.
//!
//! Four enums cover the subsystems:
//! - `QueueError` - intake validation and queue file storage
//! - `AgentError` - remote code-generation runs and response parsing
//! - `RepoError` - checkout sync, branch, commit, push, and pull request steps
//! - `CycleError` - failures that stop a whole cycle before any item runs
//!
//! `ItemError` wraps the per-item failures so the orchestrator can record
//! them on the queue entry without losing the step that failed.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Field '{field}' is required and must not be empty")]
    Validation { field: &'static str },

    #[error("Queue file {path} is unreadable: {message}")]
    Storage { path: PathBuf, message: String },

    #[error("Failed to access queue file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Enhancement request {id} not found")]
    NotFound { id: String },

    #[error("Queue task failed: {0}")]
    Task(String),
}

/// Errors from a single code-generation run.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent service call '{operation}' failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },

    #[error("Agent run ended with status '{status}'")]
    RunFailed { status: String },

    #[error("Agent run did not finish within {seconds}s (last status '{last_status}')")]
    Timeout { seconds: u64, last_status: String },

    #[error("Agent response is not a valid change set: {0}")]
    MalformedResponse(String),

    #[error("Agent run completed without an assistant text message")]
    NoResponse,

    #[error("Agent is not configured: {0}")]
    NotConfigured(String),
}

impl AgentError {
    /// Taxonomy name recorded on failed queue items.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Api { .. } => "AgentApiError",
            AgentError::RunFailed { .. } => "AgentRunError",
            AgentError::Timeout { .. } => "TimeoutError",
            AgentError::MalformedResponse(_) => "MalformedResponseError",
            AgentError::NoResponse => "NoResponseError",
            AgentError::NotConfigured(_) => "AgentConfigError",
        }
    }
}

/// Errors from repository automation. One variant per step so the failing
/// step survives into the recorded message.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Failed to sync checkout at {path}: {message}")]
    Sync { path: PathBuf, message: String },

    #[error("Failed to prepare branch {branch}: {message}")]
    Branch { branch: String, message: String },

    #[error("Refusing to write '{path}': paths must be relative and stay inside the checkout")]
    UnsafePath { path: String },

    #[error("Failed to write {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to commit on {branch}: {message}")]
    Commit { branch: String, message: String },

    #[error("Push of {branch} was rejected: {message}")]
    Push { branch: String, message: String },

    #[error("Failed to open pull request for {branch}: {message}")]
    PullRequest { branch: String, message: String },

    #[error("Branch {branch} has no changes against {base}; nothing to submit")]
    NoChanges { branch: String, base: String },

    #[error("Repository task failed: {0}")]
    Task(String),
}

impl RepoError {
    /// Taxonomy name recorded on failed queue items.
    pub fn kind(&self) -> &'static str {
        match self {
            RepoError::Sync { .. } => "RepoSyncError",
            RepoError::Branch { .. } => "BranchError",
            RepoError::UnsafePath { .. } | RepoError::Materialize { .. } => "MaterializeError",
            RepoError::Commit { .. } => "CommitError",
            RepoError::Push { .. } => "PushError",
            RepoError::PullRequest { .. } => "PullRequestError",
            RepoError::NoChanges { .. } => "NoChangesError",
            RepoError::Task(_) => "RepoTaskError",
        }
    }
}

/// A failure while processing one queue item. Never escapes the item.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Validation(QueueError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl ItemError {
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::Validation(_) => "ValidationError",
            ItemError::Agent(e) => e.kind(),
            ItemError::Repo(e) => e.kind(),
        }
    }

    /// Human-readable message plus the `caused by` chain, as stored in the
    /// item's `error` field.
    pub fn describe(&self) -> String {
        let mut out = format!("{}: {}", self.kind(), self);
        // Variants are transparent, so the first source is already one level down.
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&err.to_string());
            source = err.source();
        }
        out
    }
}

/// Errors that abort a cycle before items are processed.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Cannot load the enhancement queue: {0}")]
    Queue(#[from] QueueError),

    #[error("An enhancement cycle is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_field() {
        let err = QueueError::Validation { field: "summary" };
        assert!(err.to_string().contains("summary"));
    }

    #[test]
    fn agent_error_kinds_match_taxonomy() {
        assert_eq!(AgentError::NoResponse.kind(), "NoResponseError");
        assert_eq!(
            AgentError::RunFailed {
                status: "failed".into()
            }
            .kind(),
            "AgentRunError"
        );
        assert_eq!(
            AgentError::Timeout {
                seconds: 120,
                last_status: "in_progress".into()
            }
            .kind(),
            "TimeoutError"
        );
        assert_eq!(
            AgentError::MalformedResponse("x".into()).kind(),
            "MalformedResponseError"
        );
    }

    #[test]
    fn repo_error_kinds_match_taxonomy() {
        let push = RepoError::Push {
            branch: "feature/x".into(),
            message: "non-fast-forward".into(),
        };
        assert_eq!(push.kind(), "PushError");
        let sync = RepoError::Sync {
            path: PathBuf::from("/tmp/checkout"),
            message: "auth".into(),
        };
        assert_eq!(sync.kind(), "RepoSyncError");
        let pr = RepoError::PullRequest {
            branch: "feature/x".into(),
            message: "422".into(),
        };
        assert_eq!(pr.kind(), "PullRequestError");
    }

    #[test]
    fn item_error_describe_starts_with_kind() {
        let err: ItemError = AgentError::RunFailed {
            status: "cancelled".into(),
        }
        .into();
        let text = err.describe();
        assert!(text.starts_with("AgentRunError: "), "got: {text}");
        assert!(text.contains("cancelled"));
        assert!(!text.contains("caused by"));
    }

    #[test]
    fn item_error_describe_includes_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err: ItemError = RepoError::Materialize {
            path: PathBuf::from("src/a.rs"),
            source: io,
        }
        .into();
        let text = err.describe();
        assert!(text.starts_with("MaterializeError: "));
        assert!(text.contains("caused by: read-only fs"), "got: {text}");
    }

    #[test]
    fn item_error_describe_names_no_changes() {
        let err: ItemError = RepoError::NoChanges {
            branch: "feature/touch-readme".into(),
            base: "main".into(),
        }
        .into();
        let text = err.describe();
        assert!(text.starts_with("NoChangesError: "), "got: {text}");
        assert!(text.contains("feature/touch-readme"));
        assert!(text.contains("nothing to submit"));
    }

    #[test]
    fn cycle_error_converts_from_queue_error() {
        let err: CycleError = QueueError::Storage {
            path: PathBuf::from("q.json"),
            message: "expected array".into(),
        }
        .into();
        assert!(matches!(err, CycleError::Queue(QueueError::Storage { .. })));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&QueueError::NotFound { id: "x".into() });
        assert_std_error(&AgentError::NoResponse);
        assert_std_error(&RepoError::Task("x".into()));
        assert_std_error(&CycleError::AlreadyRunning);
    }
}
