use anyhow::Context;
use chrono::Utc;
use gwdeploy_core::{
    exec::require_binary, orchestrator::HostLedger, paths, runtime::ServiceRuntime,
};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::cmd::{compose_runtime, load_config, system_exec};
use crate::output::print_json;

/// Stop the gateway. Takes the host lease so it cannot interleave with a
/// running deployment.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    require_binary("docker")?;

    let holder = Uuid::new_v4();
    let ttl = Duration::from_secs(config.timeouts.stop_secs + 60);
    let ledger_path = paths::ledger_path(root);
    HostLedger::open(&ledger_path)?
        .acquire(holder, "stop", ttl, Utc::now())
        .context("cannot stop while a deployment is running")?;

    let mut runtime = compose_runtime(root, &config, system_exec());
    let stopped = runtime.stop();
    HostLedger::open(&ledger_path)?.release(holder)?;
    stopped?;

    if json {
        print_json(&serde_json::json!({ "stopped": true }))?;
    } else {
        println!("gateway stopped");
    }
    Ok(())
}
