use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use super::agent::{ChangeGenerator, CodeGenClient, OpenAiAssistants};
use super::github::GitHubClient;
use super::models::{CycleReport, EnhancementRequest, PublishedChange, RequestStatus};
use super::queue::{QueueHandle, QueueStore};
use super::repo::{ChangePublisher, RepoAutomation};
use crate::config::EnhancerConfig;
use crate::errors::{AgentError, CycleError, ItemError};

/// Runs queued requests through generation and publishing.
pub struct Orchestrator {
    queue: QueueHandle,
    generator: Arc<dyn ChangeGenerator>,
    publisher: Arc<dyn ChangePublisher>,
}

/// Totals across a `drain`.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DrainReport {
    pub cycles: usize,
    pub totals: CycleReport,
    /// `new` items still queued when draining stopped
    pub remaining: usize,
}

impl Orchestrator {
    pub fn new(
        queue: QueueHandle,
        generator: Arc<dyn ChangeGenerator>,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            queue,
            generator,
            publisher,
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn from_config(config: &EnhancerConfig) -> anyhow::Result<Self> {
        let agent = &config.toml.agent;
        let api_key = agent
            .api_key
            .as_deref()
            .ok_or_else(|| AgentError::NotConfigured("agent.api_key (OPENAI_API_KEY)".into()))?;
        let assistant_id = agent.assistant_id.as_deref().ok_or_else(|| {
            AgentError::NotConfigured("agent.assistant_id (ENHANCER_ASSISTANT_ID)".into())
        })?;
        let generator = CodeGenClient::new(
            Arc::new(OpenAiAssistants::new(
                &agent.api_base,
                api_key,
                assistant_id,
                config.agent_request_timeout(),
            )?),
            config.poll_policy(),
        );

        let owner_repo = config.github_repo().ok_or_else(|| {
            anyhow::anyhow!("github.repo is not set and cannot be derived from repository.remote_url")
        })?;
        let token = config.toml.repository.token.as_deref().ok_or_else(|| {
            anyhow::anyhow!("repository.token is not set (export BOT_GH_TOKEN)")
        })?;
        let host = GitHubClient::new(
            &config.toml.github.api_base,
            &owner_repo,
            token,
            config.github_request_timeout(),
        )?;
        let publisher = RepoAutomation::from_config(config, Arc::new(host))?;

        Ok(Self::new(
            QueueHandle::new(QueueStore::open(config.queue_path())),
            Arc::new(generator),
            Arc::new(publisher),
        ))
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    async fn process(&self, request: &EnhancementRequest) -> Result<PublishedChange, ItemError> {
        request.validate().map_err(ItemError::Validation)?;
        let change = self.generator.generate(request).await?;
        let published = self.publisher.publish(&request.summary, &change).await?;
        Ok(published)
    }

    /// One pass over every `new` request, in queue order.
    ///
    /// Item failures are recorded on the item and never stop the cycle. The
    /// results are written back once, merged by id, after the last item.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let pending: Vec<EnhancementRequest> = self
            .queue
            .load()
            .await?
            .into_iter()
            .filter(|r| r.status == RequestStatus::New)
            .collect();

        let mut report = CycleReport::default();
        if pending.is_empty() {
            info!("no pending enhancement requests");
            return Ok(report);
        }
        info!(pending = pending.len(), "starting enhancement cycle");

        let mut updates = Vec::with_capacity(pending.len());
        for mut request in pending {
            let span = info_span!("enhancement", id = %request.id, summary = %request.summary);
            let outcome = self.process(&request).instrument(span.clone()).await;

            report.processed += 1;
            span.in_scope(|| match outcome {
                Ok(published) => {
                    info!(
                        branch = %published.branch,
                        pr_url = %published.pr_url,
                        reused_pr = published.reused_pr,
                        "enhancement submitted"
                    );
                    request.mark_submitted(published.pr_url);
                    report.submitted += 1;
                }
                Err(e) => {
                    warn!(kind = e.kind(), "enhancement failed: {}", e);
                    request.mark_failed(e.describe());
                    report.failed += 1;
                }
            });
            updates.push(request);
        }

        self.queue.apply_updates(updates).await?;
        info!(
            processed = report.processed,
            submitted = report.submitted,
            failed = report.failed,
            "enhancement cycle finished"
        );
        Ok(report)
    }

    /// Run cycles until nothing is `new` or `max_cycles` is reached,
    /// sleeping `interval` between cycles.
    pub async fn drain(
        &self,
        max_cycles: usize,
        interval: Duration,
    ) -> Result<DrainReport, CycleError> {
        let mut drained = DrainReport {
            remaining: self.queue.list(Some(RequestStatus::New)).await?.len(),
            ..DrainReport::default()
        };

        while drained.remaining > 0 && drained.cycles < max_cycles {
            if drained.cycles > 0 {
                tokio::time::sleep(interval).await;
            }
            let report = self.run_cycle().await?;
            drained.cycles += 1;
            drained.totals.processed += report.processed;
            drained.totals.submitted += report.submitted;
            drained.totals.failed += report.failed;
            drained.remaining = self.queue.list(Some(RequestStatus::New)).await?.len();
        }

        if drained.remaining > 0 {
            warn!(remaining = drained.remaining, cycles = drained.cycles, "drain stopped with pending requests");
        }
        Ok(drained)
    }
}

/// Observable state of the most recent cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStatus {
    pub running: bool,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct LastOutcome {
    report: Option<CycleReport>,
    error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

/// Single-flight wrapper around `Orchestrator::run_cycle`.
///
/// At most one cycle runs at a time; a second request while one is in flight
/// gets `CycleError::AlreadyRunning` instead of queueing behind it.
#[derive(Clone)]
pub struct CycleRunner {
    orchestrator: Arc<Orchestrator>,
    gate: Arc<tokio::sync::Mutex<()>>,
    running: Arc<AtomicBool>,
    last: Arc<Mutex<LastOutcome>>,
}

impl CycleRunner {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            last: Arc::new(Mutex::new(LastOutcome::default())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn record(last: &Mutex<LastOutcome>, result: &Result<CycleReport, CycleError>) {
        let mut last = last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match result {
            Ok(report) => {
                last.report = Some(*report);
                last.error = None;
            }
            Err(e) => last.error = Some(e.to_string()),
        }
        last.finished_at = Some(Utc::now());
    }

    /// Start a cycle in the background and return immediately.
    pub fn trigger(&self) -> Result<tokio::task::JoinHandle<()>, CycleError> {
        let guard = Arc::clone(&self.gate)
            .try_lock_owned()
            .map_err(|_| CycleError::AlreadyRunning)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let last = Arc::clone(&self.last);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        Ok(tokio::spawn(async move {
            let result = orchestrator.run_cycle().await;
            if let Err(e) = &result {
                tracing::error!("enhancement cycle failed: {}", e);
            }
            Self::record(&last, &result);
            running.store(false, Ordering::SeqCst);
            drop(guard);
        }))
    }

    /// Run a cycle on the current task.
    pub async fn run_now(&self) -> Result<CycleReport, CycleError> {
        let _guard = Arc::clone(&self.gate)
            .try_lock_owned()
            .map_err(|_| CycleError::AlreadyRunning)?;
        self.running.store(true, Ordering::SeqCst);
        let result = self.orchestrator.run_cycle().await;
        Self::record(&self.last, &result);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    pub fn status(&self) -> CycleStatus {
        let running = self.running.load(Ordering::SeqCst);
        let last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        CycleStatus {
            running,
            last_report: last.report,
            last_error: last.error.clone(),
            last_finished_at: last.finished_at,
        }
    }
}
