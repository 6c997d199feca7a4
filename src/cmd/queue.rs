//! Queue commands - `enhancer enqueue`, `enhancer list`, `enhancer requeue`.

use std::str::FromStr;

use anyhow::{Result, anyhow};

use enhancer::automation::models::{EnhancementRequest, RequestStatus};
use enhancer::automation::queue::{QueueHandle, QueueStore};
use enhancer::config::EnhancerConfig;
use enhancer::util::preview;

fn queue(config: &EnhancerConfig) -> QueueHandle {
    QueueHandle::new(QueueStore::open(config.queue_path()))
}

pub async fn cmd_enqueue(config: &EnhancerConfig, summary: &str, details: &str) -> Result<()> {
    let request = queue(config)
        .append(EnhancementRequest::new(summary, details))
        .await?;
    println!("Queued {} ({})", request.id, request.summary);
    Ok(())
}

pub async fn cmd_list(config: &EnhancerConfig, status: Option<&str>, json: bool) -> Result<()> {
    let status = status
        .map(RequestStatus::from_str)
        .transpose()
        .map_err(|e| anyhow!(e))?;
    let requests = queue(config).list(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }
    if requests.is_empty() {
        println!("No enhancement requests.");
        return Ok(());
    }
    for request in &requests {
        let outcome = match (&request.pr_url, &request.error) {
            (Some(url), _) => url.clone(),
            (None, Some(error)) => preview(error.lines().next().unwrap_or(""), 80),
            (None, None) => String::new(),
        };
        println!(
            "{}  {:<12}  {:<40}  {}",
            request.id,
            request.status.as_str(),
            preview(&request.summary, 40),
            outcome
        );
    }
    Ok(())
}

pub async fn cmd_requeue(config: &EnhancerConfig, id: &str) -> Result<()> {
    let request = queue(config).requeue(id.to_string()).await?;
    println!("Requeued {} ({})", request.id, request.summary);
    Ok(())
}
