//! check-config command - print the effective configuration

use anyhow::{Context, Result};
use console::style;
use tern_config::TernConfig;

/// Print the loaded configuration, after file and environment overrides, as TOML
pub fn execute(config: &TernConfig) -> Result<()> {
    let rendered = config
        .to_toml_string()
        .context("Failed to render configuration")?;

    println!("{}", style("Effective configuration").bold().cyan());
    println!("{}", style("=".repeat(50)).dim());
    println!("{rendered}");
    println!("{}", style("Configuration is valid").green());
    Ok(())
}
