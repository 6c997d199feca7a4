use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState, SharedState, SuggestDefaults};
use super::orchestrator::{CycleRunner, Orchestrator};
use super::suggest::{OpenAiChat, Suggester};
use crate::config::EnhancerConfig;

/// Configuration for the HTTP server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5005,
            dev_mode: false,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &EnhancerConfig, dev_mode: bool) -> Self {
        let server = &config.toml.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            dev_mode,
        }
    }
}

/// Build the shared state: queue, cycle runner, and (when credentials are
/// present) the suggestion model.
pub fn build_state(config: &EnhancerConfig) -> Result<SharedState> {
    let orchestrator = Orchestrator::from_config(config)
        .context("Failed to set up the enhancement pipeline")?;
    let queue = orchestrator.queue().clone();

    let agent = &config.toml.agent;
    let suggest = &config.toml.suggest;
    let suggester = agent
        .api_key
        .as_deref()
        .map(|key| -> Result<Suggester> {
            let model = OpenAiChat::new(
                &agent.api_base,
                key,
                &suggest.model,
                config.agent_request_timeout(),
            )?;
            Ok(Suggester::new(Arc::new(model), queue.clone()))
        })
        .transpose()?;

    let secret = config.toml.server.secret.clone();
    if secret.is_none() {
        warn!("server.secret is not set; /api routes accept unauthenticated requests");
    }

    Ok(Arc::new(AppState {
        queue,
        runner: CycleRunner::new(Arc::new(orchestrator)),
        suggester,
        suggest_defaults: SuggestDefaults {
            code_dir: config.project_dir.clone(),
            include: suggest.include.clone(),
            max_files: suggest.max_files,
        },
        secret,
    }))
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router(&state).with_state(state)
}

/// Serve until Ctrl-C.
pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("enhancer listening on http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnhancerToml;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn configured(dir: &tempfile::TempDir) -> EnhancerConfig {
        let mut toml = EnhancerToml::default();
        toml.agent.api_key = Some("sk-test".into());
        toml.agent.assistant_id = Some("asst_1".into());
        toml.repository.remote_url = Some("https://github.com/octo/app.git".into());
        toml.repository.token = Some("ghp_test".into());
        toml.server.secret = Some("s3cret".into());
        EnhancerConfig::from_toml(dir.path().to_path_buf(), toml)
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 5005);
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.dev_mode);
    }

    #[test]
    fn test_build_state_requires_agent_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnhancerConfig::from_toml(dir.path().to_path_buf(), EnhancerToml::default());
        let err = build_state(&config).err().unwrap();
        assert!(format!("{:#}", err).contains("api_key"));
    }

    #[tokio::test]
    async fn test_full_router_mounts_api_behind_secret() {
        let dir = tempfile::tempdir().unwrap();
        let state = build_state(&configured(&dir)).unwrap();
        assert!(state.suggester.is_some());
        let app = build_router(state);

        let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(health).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let list = Request::builder()
            .uri("/api/enhancements")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(list).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
