use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use gwdeploy_core::config::{Config, WarnLevel};
use gwdeploy_core::paths;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration with defaults filled in
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        print_json(&config)
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
        Ok(())
    }
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let findings = config.validate();
    let errors = findings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({
            "valid": errors == 0,
            "warnings": findings,
        }))?;
    } else if findings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &findings {
            let tag = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{tag}] {}", w.message);
        }
        println!(
            "\n{} error(s), {} warning(s) in {}",
            errors,
            findings.len() - errors,
            paths::CONFIG_FILE
        );
    }

    if errors > 0 {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
