pub mod config;
pub mod deploy;
pub mod history;
pub mod init;
pub mod logs;
pub mod status;
pub mod stop;

use anyhow::Context;
use gwdeploy_core::config::{Config, WarnLevel};
use gwdeploy_core::exec::{Exec, SystemExec};
use gwdeploy_core::runtime::ComposeRuntime;
use std::path::Path;
use std::sync::Arc;

/// Load `gwdeploy.yaml`, log warnings and refuse configs with errors.
pub fn load_config(root: &Path) -> anyhow::Result<Config> {
    let config = Config::load(root).context("failed to load gwdeploy.yaml")?;
    let mut errors = Vec::new();
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => errors.push(w.message),
        }
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid gwdeploy.yaml: {}", errors.join("; "));
    }
    Ok(config)
}

pub fn system_exec() -> Arc<dyn Exec> {
    Arc::new(SystemExec)
}

pub fn compose_runtime(root: &Path, config: &Config, exec: Arc<dyn Exec>) -> ComposeRuntime {
    ComposeRuntime::new(root, &config.gateway, &config.timeouts, exec)
}
