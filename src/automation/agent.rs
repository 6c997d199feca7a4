use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::models::{EnhancementRequest, GeneratedChange};
use crate::errors::AgentError;
use crate::util::{http_client, preview, strip_code_fence};

/// Consecutive failed status polls tolerated before the run is abandoned.
const MAX_CONSECUTIVE_POLL_ERRORS: u32 = 3;

/// Messages fetched when looking for the newest assistant reply.
const MESSAGE_PAGE_SIZE: u32 = 20;

pub const SYSTEM_INSTRUCTION: &str = r#"You are an autonomous software engineer making one focused change to a Git repository.

You MUST respond with exactly one JSON object (no markdown, no explanation, no text before or after) matching this schema:
{
  "files": [
    {"path": "relative/path/from/repository/root", "content": "the complete new file content"}
  ],
  "commit_message": "Imperative one-line commit message",
  "pr_title": "Short pull request title",
  "pr_body": "Markdown description of what changed and why"
}

Rules:
- Each file's content replaces the whole file. Always include the entire file, never a diff or excerpt.
- Paths are relative to the repository root and must not start with "/" or contain "..".
- Only include files you create or modify.
- Keep the change minimal and consistent with the existing code style.
"#;

/// Produces a change set for a request. Real implementation: `CodeGenClient`.
#[async_trait]
pub trait ChangeGenerator: Send + Sync {
    async fn generate(&self, request: &EnhancementRequest) -> Result<GeneratedChange, AgentError>;
}

/// Status of a remote run as reported by the agent service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }

    /// Terminal statuses end polling. `RequiresAction` is terminal here
    /// because no tools are registered that could satisfy it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Expired
                | Self::Incomplete
                | Self::RequiresAction
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunInfo {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextValue {
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

impl ThreadMessage {
    /// Concatenated text parts, or `None` when the message has no text.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| match c {
                MessageContent::Text { text } => Some(text.value.as_str()),
                MessageContent::Other => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// The thread/run protocol of the agent service.
/// Real implementation: `OpenAiAssistants`. Tests use scripted fakes.
#[async_trait]
pub trait AssistantApi: Send + Sync {
    async fn create_thread(&self) -> Result<String, AgentError>;

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<(), AgentError>;

    async fn create_run(&self, thread_id: &str, instructions: &str) -> Result<RunInfo, AgentError>;

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunInfo, AgentError>;

    /// Messages in the thread, newest first.
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AgentError>;
}

/// HTTP client for an OpenAI-compatible Assistants endpoint.
pub struct OpenAiAssistants {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    assistant_id: String,
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Deserialize)]
struct MessageList {
    data: Vec<ThreadMessage>,
}

impl OpenAiAssistants {
    pub fn new(
        api_base: &str,
        api_key: &str,
        assistant_id: &str,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client(request_timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            assistant_id: assistant_id.to_string(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
            .header("User-Agent", "enhancer")
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AgentError> {
        let api_err = |message: String| AgentError::Api { operation, message };
        let resp = request.send().await.map_err(|e| api_err(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_err(format!("HTTP {}: {}", status, preview(&body, 300))));
        }
        resp.json::<T>().await.map_err(|e| api_err(e.to_string()))
    }
}

#[async_trait]
impl AssistantApi for OpenAiAssistants {
    async fn create_thread(&self) -> Result<String, AgentError> {
        let req = self.request(reqwest::Method::POST, "/threads").json(&json!({}));
        let thread: IdOnly = self.send("thread-create", req).await?;
        Ok(thread.id)
    }

    async fn add_user_message(&self, thread_id: &str, content: &str) -> Result<(), AgentError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/threads/{}/messages", thread_id))
            .json(&json!({"role": "user", "content": content}));
        let _: IdOnly = self.send("message-append", req).await?;
        Ok(())
    }

    async fn create_run(&self, thread_id: &str, instructions: &str) -> Result<RunInfo, AgentError> {
        let req = self
            .request(reqwest::Method::POST, &format!("/threads/{}/runs", thread_id))
            .json(&json!({
                "assistant_id": self.assistant_id,
                "instructions": instructions,
            }));
        self.send("run-create", req).await
    }

    async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<RunInfo, AgentError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("/threads/{}/runs/{}", thread_id, run_id),
        );
        self.send("run-retrieve", req).await
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, AgentError> {
        let req = self
            .request(reqwest::Method::GET, &format!("/threads/{}/messages", thread_id))
            .query(&[
                ("order", "desc".to_string()),
                ("limit", MESSAGE_PAGE_SIZE.to_string()),
            ]);
        let list: MessageList = self.send("message-list", req).await?;
        Ok(list.data)
    }
}

/// Bounded polling schedule: the delay grows by `backoff` up to
/// `max_interval`, and the whole wait never exceeds `timeout`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff: f64,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            backoff: 1.5,
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        let factor = if self.backoff.is_finite() && self.backoff >= 1.0 {
            self.backoff
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_interval.max(self.initial_interval))
    }
}

/// Build the user turn for a request.
pub fn build_prompt(request: &EnhancementRequest) -> String {
    format!(
        "Implement the following enhancement.\n\nSummary: {}\n\nDetails:\n{}\n",
        request.summary.trim(),
        request.details.trim()
    )
}

/// Parse the assistant's reply into a change set. An optional code fence
/// around the JSON is tolerated; anything else is malformed.
pub fn parse_generated_change(text: &str) -> Result<GeneratedChange, AgentError> {
    let body = strip_code_fence(text);
    serde_json::from_str::<GeneratedChange>(body).map_err(|e| {
        AgentError::MalformedResponse(format!("{} (response began: {})", e, preview(body, 120)))
    })
}

/// Drives one thread/run per request to a `GeneratedChange`.
pub struct CodeGenClient {
    api: Arc<dyn AssistantApi>,
    policy: PollPolicy,
}

impl CodeGenClient {
    pub fn new(api: Arc<dyn AssistantApi>, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    fn timed_out(&self, last_status: &str) -> AgentError {
        AgentError::Timeout {
            seconds: self.policy.timeout.as_secs(),
            last_status: last_status.to_string(),
        }
    }

    /// Await one service call, giving up at `deadline`. `stage` is reported
    /// as the last status when it times out.
    async fn within<T, F>(&self, deadline: Instant, stage: &str, call: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        tokio::time::timeout_at(deadline, call)
            .await
            .map_err(|_| self.timed_out(stage))?
    }

    /// Poll until the run reaches a terminal status or `deadline` passes.
    async fn wait_for_run(
        &self,
        thread_id: &str,
        run: RunInfo,
        deadline: Instant,
    ) -> Result<RunInfo, AgentError> {
        let mut interval = self.policy.initial_interval;
        let mut current = run;
        let mut poll_errors = 0u32;

        loop {
            if current.status.is_terminal() {
                return Ok(current);
            }
            let timed_out = || self.timed_out(current.status.as_str());

            let now = Instant::now();
            if now >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = self.policy.next_interval(interval);

            let remaining = deadline.saturating_duration_since(Instant::now());
            let polled =
                tokio::time::timeout(remaining, self.api.retrieve_run(thread_id, &current.id))
                    .await;
            match polled {
                Err(_) => return Err(timed_out()),
                Ok(Ok(run)) => {
                    poll_errors = 0;
                    if run.status != current.status {
                        debug!(run_id = %run.id, status = run.status.as_str(), "run status changed");
                    }
                    current = run;
                }
                Ok(Err(e)) => {
                    poll_errors += 1;
                    if poll_errors >= MAX_CONSECUTIVE_POLL_ERRORS {
                        return Err(e);
                    }
                    warn!(run_id = %current.id, attempt = poll_errors, "run status poll failed: {}", e);
                }
            }
        }
    }
}

#[async_trait]
impl ChangeGenerator for CodeGenClient {
    async fn generate(&self, request: &EnhancementRequest) -> Result<GeneratedChange, AgentError> {
        // One deadline covers every call, not just status polling.
        let deadline = Instant::now() + self.policy.timeout;
        let thread_id = self
            .within(deadline, "thread_create", self.api.create_thread())
            .await?;
        let prompt = build_prompt(request);
        self.within(
            deadline,
            "message_append",
            self.api.add_user_message(&thread_id, &prompt),
        )
        .await?;
        let run = self
            .within(
                deadline,
                "run_create",
                self.api.create_run(&thread_id, SYSTEM_INSTRUCTION),
            )
            .await?;
        info!(thread_id = %thread_id, run_id = %run.id, "agent run started");

        let run = self.wait_for_run(&thread_id, run, deadline).await?;
        if run.status != RunStatus::Completed {
            if let Some(err) = &run.last_error {
                warn!(
                    run_id = %run.id,
                    code = err.code.as_deref().unwrap_or(""),
                    "agent run ended: {}",
                    err.message.as_deref().unwrap_or("no message")
                );
            }
            return Err(AgentError::RunFailed {
                status: run.status.as_str().to_string(),
            });
        }

        let messages = self
            .within(deadline, "message_list", self.api.list_messages(&thread_id))
            .await?;
        let text = messages
            .iter()
            .find(|m| m.role == "assistant")
            .and_then(ThreadMessage::text)
            .ok_or(AgentError::NoResponse)?;

        let change = parse_generated_change(&text)?;
        info!(run_id = %run.id, files = change.files.len(), "agent produced change set");
        Ok(change)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted stand-in for the agent service.
    pub(crate) struct ScriptedApi {
        statuses: Mutex<VecDeque<RunStatus>>,
        /// Status returned once the script runs out
        pub(crate) final_status: RunStatus,
        pub(crate) messages: Vec<ThreadMessage>,
        pub(crate) prompts: Mutex<Vec<String>>,
        pub(crate) polls: Mutex<u32>,
    }

    impl ScriptedApi {
        pub(crate) fn new(statuses: &[RunStatus], final_status: RunStatus) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                final_status,
                messages: Vec::new(),
                prompts: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            }
        }

        pub(crate) fn with_messages(mut self, messages: Vec<ThreadMessage>) -> Self {
            self.messages = messages;
            self
        }

        fn next_status(&self) -> RunStatus {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.final_status)
        }
    }

    pub(crate) fn text_message(role: &str, text: &str) -> ThreadMessage {
        ThreadMessage {
            role: role.to_string(),
            content: vec![MessageContent::Text {
                text: TextValue {
                    value: text.to_string(),
                },
            }],
        }
    }

    #[async_trait]
    impl AssistantApi for ScriptedApi {
        async fn create_thread(&self) -> Result<String, AgentError> {
            Ok("thread_1".to_string())
        }

        async fn add_user_message(&self, _thread_id: &str, content: &str) -> Result<(), AgentError> {
            self.prompts.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn create_run(&self, _thread_id: &str, _instructions: &str) -> Result<RunInfo, AgentError> {
            Ok(RunInfo {
                id: "run_1".to_string(),
                status: RunStatus::Queued,
                last_error: None,
            })
        }

        async fn retrieve_run(&self, _thread_id: &str, run_id: &str) -> Result<RunInfo, AgentError> {
            *self.polls.lock().unwrap() += 1;
            Ok(RunInfo {
                id: run_id.to_string(),
                status: self.next_status(),
                last_error: None,
            })
        }

        async fn list_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, AgentError> {
            Ok(self.messages.clone())
        }
    }

    pub(crate) fn fast_policy() -> PollPolicy {
        PollPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            backoff: 2.0,
            timeout: Duration::from_millis(500),
        }
    }

    const VALID_CHANGE: &str = r#"{"files":[{"path":"a.txt","content":"ok"}],"commit_message":"add metric","pr_title":"Add health metric","pr_body":"..."}"#;

    fn request() -> EnhancementRequest {
        EnhancementRequest::new("Add health metric", "expose uptime")
    }

    #[test]
    fn test_run_status_deserializes_unknown() {
        let status: RunStatus = serde_json::from_str("\"something_new\"").unwrap();
        assert_eq!(status, RunStatus::Unknown);
        assert!(!status.is_terminal());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(!RunStatus::Cancelling.is_terminal());
    }

    #[test]
    fn test_poll_policy_backoff_is_capped() {
        let policy = PollPolicy::default();
        let mut interval = policy.initial_interval;
        for _ in 0..10 {
            interval = policy.next_interval(interval);
        }
        assert_eq!(interval, policy.max_interval);
    }

    #[test]
    fn test_poll_policy_ignores_shrinking_backoff() {
        let policy = PollPolicy {
            backoff: 0.5,
            ..PollPolicy::default()
        };
        assert_eq!(
            policy.next_interval(Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_build_prompt_embeds_summary_and_details() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("Summary: Add health metric"));
        assert!(prompt.contains("expose uptime"));
    }

    #[test]
    fn test_parse_generated_change_fenced() {
        let text = format!("```json\n{}\n```", VALID_CHANGE);
        let change = parse_generated_change(&text).unwrap();
        assert_eq!(change.files.len(), 1);
        assert_eq!(change.files[0].path, "a.txt");
        assert_eq!(change.pr_title, "Add health metric");
    }

    #[test]
    fn test_parse_generated_change_missing_files() {
        let text = r#"{"commit_message":"m","pr_title":"t","pr_body":"b"}"#;
        let err = parse_generated_change(text).unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
        assert!(err.to_string().contains("files"));
    }

    #[test]
    fn test_parse_generated_change_prose() {
        let err = parse_generated_change("Sure! Here is the change you asked for.").unwrap_err();
        assert!(matches!(err, AgentError::MalformedResponse(_)));
    }

    #[test]
    fn test_message_list_deserializes_mixed_content() {
        let json = r#"{"data": [
            {"role": "assistant", "content": [
                {"type": "image_file", "image_file": {"file_id": "f"}},
                {"type": "text", "text": {"value": "hello", "annotations": []}}
            ]}
        ]}"#;
        let list: MessageList = serde_json::from_str(json).unwrap();
        assert_eq!(list.data[0].text().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_generate_completed_run() {
        let api = ScriptedApi::new(
            &[RunStatus::InProgress, RunStatus::InProgress],
            RunStatus::Completed,
        )
        .with_messages(vec![
            text_message("assistant", VALID_CHANGE),
            text_message("user", "ignored"),
        ]);
        let api = Arc::new(api);
        let client = CodeGenClient::new(api.clone(), fast_policy());

        let change = client.generate(&request()).await.unwrap();
        assert_eq!(change.commit_message, "add metric");
        assert_eq!(*api.polls.lock().unwrap(), 3);
        assert!(api.prompts.lock().unwrap()[0].contains("Add health metric"));
    }

    #[tokio::test]
    async fn test_generate_failed_run() {
        let api = Arc::new(ScriptedApi::new(&[RunStatus::InProgress], RunStatus::Failed));
        let client = CodeGenClient::new(api, fast_policy());
        let err = client.generate(&request()).await.unwrap_err();
        match err {
            AgentError::RunFailed { status } => assert_eq!(status, "failed"),
            other => panic!("Expected RunFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_cancelled_run() {
        let api = Arc::new(ScriptedApi::new(&[], RunStatus::Cancelled));
        let client = CodeGenClient::new(api, fast_policy());
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::RunFailed { ref status } if status == "cancelled"));
    }

    #[tokio::test]
    async fn test_generate_times_out() {
        let api = Arc::new(ScriptedApi::new(&[], RunStatus::InProgress));
        let policy = PollPolicy {
            timeout: Duration::from_millis(60),
            ..fast_policy()
        };
        let client = CodeGenClient::new(api, policy);

        let started = std::time::Instant::now();
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }), "got {:?}", err);
        assert_eq!(err.kind(), "TimeoutError");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// Service that accepts the thread and message but never answers run creation.
    struct StalledRunApi;

    #[async_trait]
    impl AssistantApi for StalledRunApi {
        async fn create_thread(&self) -> Result<String, AgentError> {
            Ok("thread_1".to_string())
        }

        async fn add_user_message(&self, _thread_id: &str, _content: &str) -> Result<(), AgentError> {
            Ok(())
        }

        async fn create_run(&self, _thread_id: &str, _instructions: &str) -> Result<RunInfo, AgentError> {
            std::future::pending().await
        }

        async fn retrieve_run(&self, _thread_id: &str, _run_id: &str) -> Result<RunInfo, AgentError> {
            std::future::pending().await
        }

        async fn list_messages(&self, _thread_id: &str) -> Result<Vec<ThreadMessage>, AgentError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_generate_deadline_covers_unanswered_calls() {
        let policy = PollPolicy {
            timeout: Duration::from_millis(60),
            ..fast_policy()
        };
        let client = CodeGenClient::new(Arc::new(StalledRunApi), policy);

        let outcome =
            tokio::time::timeout(Duration::from_secs(2), client.generate(&request())).await;
        let err = outcome
            .expect("generate should give up at its own deadline")
            .unwrap_err();
        match err {
            AgentError::Timeout { last_status, .. } => assert_eq!(last_status, "run_create"),
            other => panic!("Expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_generate_no_assistant_message() {
        let api = ScriptedApi::new(&[], RunStatus::Completed)
            .with_messages(vec![text_message("user", "prompt")]);
        let client = CodeGenClient::new(Arc::new(api), fast_policy());
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::NoResponse));
    }

    #[tokio::test]
    async fn test_generate_only_newest_assistant_message_counts() {
        let newest_without_text = ThreadMessage {
            role: "assistant".to_string(),
            content: vec![MessageContent::Other],
        };
        let api = ScriptedApi::new(&[], RunStatus::Completed).with_messages(vec![
            newest_without_text,
            text_message("assistant", VALID_CHANGE),
        ]);
        let client = CodeGenClient::new(Arc::new(api), fast_policy());
        let err = client.generate(&request()).await.unwrap_err();
        assert!(matches!(err, AgentError::NoResponse));
    }
}
