//! Suggestion intake: ask a chat model to propose enhancements for a code
//! directory and queue what it returns.

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::models::{EnhancementRequest, NewEnhancement};
use super::queue::QueueHandle;
use crate::util::{http_client, preview, strip_code_fence};

/// Most suggestions queued from one response.
pub const MAX_SUGGESTIONS: usize = 5;

/// Characters of each file sent to the model.
const MAX_FILE_CHARS: usize = 6000;

const SUGGEST_INSTRUCTION: &str = "You review source code and propose concrete, self-contained \
improvements. Respond with a JSON array (no markdown, no commentary) of at most 5 objects, each \
with a short \"summary\" (one line, imperative) and \"details\" (what to change and why, precise \
enough for another engineer to implement).";

/// A one-shot text completion. Real implementation: `OpenAiChat`.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Chat-completions client for an OpenAI-compatible endpoint.
pub struct OpenAiChat {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl OpenAiChat {
    pub fn new(
        api_base: &str,
        api_key: &str,
        model: &str,
        request_timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(request_timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let resp: ChatResponse = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "temperature": 0.2,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": user},
                ],
            }))
            .send()
            .await
            .context("Failed to send chat completion request")?
            .error_for_status()
            .context("Chat completion API returned error status")?
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Chat completion returned no content")
    }
}

/// Read up to `max_files` files under `code_dir` matching `include`, sorted by
/// path. Hidden directories and `target/` are skipped, as are files that are
/// not UTF-8.
pub fn collect_code(code_dir: &Path, include: &str, max_files: usize) -> Result<Vec<(String, String)>> {
    let pattern = code_dir.join(include);
    let pattern = pattern
        .to_str()
        .with_context(|| format!("Code directory is not valid UTF-8: {}", code_dir.display()))?;

    let mut files = Vec::new();
    for entry in glob::glob(pattern).with_context(|| format!("Invalid include pattern '{}'", include))? {
        if files.len() >= max_files {
            break;
        }
        let Ok(path) = entry else { continue };
        if !path.is_file() {
            continue;
        }
        let Ok(rel) = path.strip_prefix(code_dir) else {
            continue;
        };
        let skipped = rel.components().any(|c| match c {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                part.starts_with('.') || part == "target"
            }
            _ => false,
        });
        if skipped {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => files.push((rel.to_string_lossy().into_owned(), content)),
            Err(e) => debug!(path = %path.display(), "skipping unreadable file: {}", e),
        }
    }
    Ok(files)
}

pub fn build_suggestion_prompt(files: &[(String, String)]) -> String {
    let mut prompt = String::from("Suggest enhancements for this code.\n");
    for (path, content) in files {
        prompt.push_str(&format!(
            "\n--- {} ---\n{}\n",
            path,
            preview(content, MAX_FILE_CHARS)
        ));
    }
    prompt
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<NewEnhancement>),
    One(NewEnhancement),
}

/// Parse the model's reply. A single object counts as a one-element list;
/// anything past `MAX_SUGGESTIONS` is dropped.
pub fn parse_suggestions(text: &str) -> Result<Vec<NewEnhancement>> {
    let body = strip_code_fence(text);
    let parsed: OneOrMany = serde_json::from_str(body)
        .with_context(|| format!("Suggestions are not valid JSON: {}", preview(body, 120)))?;
    let mut suggestions = match parsed {
        OneOrMany::Many(list) => list,
        OneOrMany::One(single) => vec![single],
    };
    suggestions.truncate(MAX_SUGGESTIONS);
    Ok(suggestions)
}

pub struct Suggester {
    model: Arc<dyn CompletionModel>,
    queue: QueueHandle,
}

impl Suggester {
    pub fn new(model: Arc<dyn CompletionModel>, queue: QueueHandle) -> Self {
        Self { model, queue }
    }

    /// Collect code, ask for suggestions, and append each valid one.
    /// Returns how many were queued.
    pub async fn suggest_and_enqueue(
        &self,
        code_dir: &Path,
        include: &str,
        max_files: usize,
    ) -> Result<usize> {
        let dir = code_dir.to_path_buf();
        let include_owned = include.to_string();
        let files = tokio::task::spawn_blocking(move || collect_code(&dir, &include_owned, max_files))
            .await
            .context("Code collection task failed")??;
        if files.is_empty() {
            warn!(dir = %code_dir.display(), include, "no source files matched; nothing to suggest");
            return Ok(0);
        }
        info!(files = files.len(), "requesting enhancement suggestions");

        let reply = self
            .model
            .complete(SUGGEST_INSTRUCTION, &build_suggestion_prompt(&files))
            .await?;
        let suggestions = parse_suggestions(&reply)?;

        let mut queued = 0;
        for suggestion in suggestions {
            let request = EnhancementRequest::from(suggestion);
            match self.queue.append(request).await {
                Ok(request) => {
                    info!(id = %request.id, summary = %request.summary, "queued suggestion");
                    queued += 1;
                }
                Err(crate::errors::QueueError::Validation { field }) => {
                    warn!(field, "skipping suggestion with empty field");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::queue::QueueStore;
    use std::sync::Mutex;

    struct CannedModel {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionModel for CannedModel {
        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            Ok(self.reply.clone())
        }
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_parse_suggestions_array_and_single() {
        let list = parse_suggestions(
            r#"```json
[{"summary": "Add cache", "details": "LRU"}, {"summary": "Log errors", "details": "tracing"}]
```"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].summary, "Log errors");

        let single = parse_suggestions(r#"{"summary": "One", "details": "only"}"#).unwrap();
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn test_parse_suggestions_caps_count() {
        let items: Vec<_> = (0..8)
            .map(|i| json!({"summary": format!("s{}", i), "details": "d"}))
            .collect();
        let text = serde_json::to_string(&items).unwrap();
        assert_eq!(parse_suggestions(&text).unwrap().len(), MAX_SUGGESTIONS);
    }

    #[test]
    fn test_parse_suggestions_rejects_prose() {
        assert!(parse_suggestions("I would add caching.").is_err());
    }

    #[test]
    fn test_collect_code_respects_limits_and_skips() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.rs", "fn a() {}");
        write(dir.path(), "src/b.rs", "fn b() {}");
        write(dir.path(), "src/c.rs", "fn c() {}");
        write(dir.path(), "target/debug/gen.rs", "generated");
        write(dir.path(), "notes.md", "# notes");

        let files = collect_code(dir.path(), "**/*.rs", 10).unwrap();
        let paths: Vec<&str> = files.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["src/a.rs", "src/b.rs", "src/c.rs"]);

        let limited = collect_code(dir.path(), "**/*.rs", 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_suggest_and_enqueue_skips_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/lib.rs", "pub fn lib() {}");
        let queue = QueueHandle::new(QueueStore::open(dir.path().join("queue.json")));
        let model = Arc::new(CannedModel {
            reply: r#"[{"summary": "Add docs", "details": "document lib"},
                       {"summary": "", "details": "no summary"}]"#
                .to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let suggester = Suggester::new(model.clone(), queue.clone());

        let queued = suggester
            .suggest_and_enqueue(dir.path(), "**/*.rs", 5)
            .await
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(queue.load().await.unwrap()[0].summary, "Add docs");
        assert!(model.prompts.lock().unwrap()[0].contains("--- src/lib.rs ---"));
    }

    #[tokio::test]
    async fn test_suggest_with_no_files_queues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let queue = QueueHandle::new(QueueStore::open(dir.path().join("queue.json")));
        let model = Arc::new(CannedModel {
            reply: "[]".to_string(),
            prompts: Mutex::new(Vec::new()),
        });
        let suggester = Suggester::new(model.clone(), queue);
        assert_eq!(
            suggester.suggest_and_enqueue(dir.path(), "**/*.rs", 5).await.unwrap(),
            0
        );
        assert!(model.prompts.lock().unwrap().is_empty());
    }
}
