use gwdeploy_core::{
    health::{probe_from_config, HealthChecker, SystemClock},
    orchestrator::HostLedger,
    paths,
    runtime::ServiceRuntime,
    types::HealthStatus,
};
use std::path::Path;
use std::sync::Arc;

use crate::cmd::{compose_runtime, load_config, system_exec};
use crate::output::{print_fields, print_json};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let exec = system_exec();
    let runtime = compose_runtime(root, &config, exec.clone());

    let running = runtime.current_version()?;
    let containers = runtime.ps()?;
    let endpoint = config.health.probe.endpoint();
    let health = if running.is_some() {
        let probe = probe_from_config(&config.health.probe, exec, config.health.interval())?;
        HealthChecker::new(probe, Arc::new(SystemClock::new())).probe_once(&endpoint)
    } else {
        HealthStatus::Unknown
    };

    let ledger_path = paths::ledger_path(root);
    let (lease, last, last_good) = if ledger_path.exists() {
        let ledger = HostLedger::open(&ledger_path)?;
        (
            ledger.current_lease()?,
            ledger.history(1)?.into_iter().next(),
            ledger.last_success()?,
        )
    } else {
        (None, None, None)
    };

    if json {
        return print_json(&serde_json::json!({
            "running": running,
            "health": health,
            "endpoint": endpoint,
            "lease": lease,
            "last_attempt": last,
            "last_success": last_good,
            "containers": containers,
        }));
    }

    let mut fields = vec![
        (
            "running",
            running
                .map(|v| format!("{}:{v}", config.gateway.image))
                .unwrap_or_else(|| "(nothing)".into()),
        ),
        ("health", format!("{health} ({endpoint})")),
    ];
    if let Some(lease) = lease {
        fields.push((
            "deploying",
            format!(
                "{} (attempt {}, pid {}, lease until {})",
                lease.target,
                lease.holder,
                lease.pid,
                lease.expires_at.to_rfc3339()
            ),
        ));
    }
    if let Some(last) = last {
        let outcome = last
            .outcome()
            .map(|o| o.to_string())
            .unwrap_or_else(|| "unfinished".into());
        fields.push((
            "last deploy",
            format!(
                "{} {outcome} at {}",
                last.target,
                last.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ));
    }
    if let Some(good) = last_good {
        fields.push((
            "last good",
            format!(
                "{} at {}",
                good.target,
                good.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
        ));
    }
    println!("gateway status");
    print_fields(&fields);
    if !containers.is_empty() {
        println!("\n{containers}");
    }
    Ok(())
}
