//! Configuration view and validation commands: `assistant-gateway config`.

use std::path::Path;

use anyhow::Result;

use assistant_gateway::config::{DEFAULT_CONFIG_FILE, GatewayConfig};

use super::super::ConfigCommands;

pub fn cmd_config(
    config: &GatewayConfig,
    config_path: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let source = match config_path {
        Some(path) => path.display().to_string(),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => DEFAULT_CONFIG_FILE.to_string(),
        None => "(defaults)".to_string(),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Gateway Configuration");
            println!("=====================");
            println!();
            println!("Source: {} (with environment overrides)", source);
            println!();
            print!("{}", config.to_toml()?);

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!();
                println!("Warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration from {}...", source);
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
    }

    Ok(())
}
