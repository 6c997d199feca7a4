//! Suggestion intake command - `enhancer suggest`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};

use enhancer::automation::queue::{QueueHandle, QueueStore};
use enhancer::automation::suggest::{OpenAiChat, Suggester};
use enhancer::config::EnhancerConfig;

pub async fn cmd_suggest(
    config: &EnhancerConfig,
    code_dir: Option<PathBuf>,
    max_files: Option<usize>,
) -> Result<()> {
    let agent = &config.toml.agent;
    let suggest = &config.toml.suggest;
    let api_key = agent
        .api_key
        .as_deref()
        .ok_or_else(|| anyhow!("agent.api_key is not set (export OPENAI_API_KEY)"))?;

    let model = OpenAiChat::new(
        &agent.api_base,
        api_key,
        &suggest.model,
        config.agent_request_timeout(),
    )?;
    let queue = QueueHandle::new(QueueStore::open(config.queue_path()));
    let suggester = Suggester::new(Arc::new(model), queue);

    let code_dir = code_dir.unwrap_or_else(|| config.project_dir.clone());
    let queued = suggester
        .suggest_and_enqueue(
            &code_dir,
            &suggest.include,
            max_files.unwrap_or(suggest.max_files),
        )
        .await?;
    println!("Queued {} suggestion(s)", queued);
    Ok(())
}
