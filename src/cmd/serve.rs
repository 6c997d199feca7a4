//! HTTP server command - `enhancer serve`.

use anyhow::Result;

use enhancer::automation::server::{ServerConfig, build_state, start_server};
use enhancer::config::EnhancerConfig;

pub async fn cmd_serve(config: &EnhancerConfig, dev: bool) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    let state = build_state(config)?;
    start_server(ServerConfig::from_config(config, dev), state).await
}
