//! Configuration view and validation commands - `enhancer config`.

use anyhow::Result;

use enhancer::config::{EnhancerConfig, EnhancerToml};

use super::super::ConfigCommands;

const MASK: &str = "********";

fn masked(toml: &EnhancerToml) -> EnhancerToml {
    let mut shown = toml.clone();
    let mask = |value: &mut Option<String>| {
        if value.is_some() {
            *value = Some(MASK.to_string());
        }
    };
    mask(&mut shown.agent.api_key);
    mask(&mut shown.repository.token);
    mask(&mut shown.server.secret);
    shown
}

pub fn cmd_config(config: &EnhancerConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_path;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No enhancer.toml at {} (using defaults)", config_path.display());
            }
            println!("Effective values (with .env and environment overrides):");
            println!();
            println!("{}", toml::to_string_pretty(&masked(&config.toml))?);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("enhancer.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            EnhancerToml::default().save(config_path)?;

            println!("Created enhancer.toml at {}", config_path.display());
            println!();
            println!("Secrets are read from the environment or .env:");
            println!("  OPENAI_API_KEY, ENHANCER_ASSISTANT_ID, BOT_GH_TOKEN, ENHANCER_SECRET");
            println!();
        }
    }

    Ok(())
}
