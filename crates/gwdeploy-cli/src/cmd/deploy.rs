use anyhow::Context;
use gwdeploy_core::{
    cancel::CancelToken,
    config::Config,
    exec::require_binary,
    health::{probe_from_config, Clock, HealthChecker, SystemClock},
    migrate::{load_migrations, MigrationRunner, SqlMigrationRunner},
    orchestrator::{deploy_exclusive, DeploySettings, DeploymentReport, HostLedger, Orchestrator},
    paths,
    runtime::ServiceRuntime,
    secrets::{provider_binary, provider_from_config},
    types::{DeployState, Outcome, VersionTag},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cmd::{compose_runtime, load_config, system_exec};
use crate::output::{print_fields, print_json};

// ---------------------------------------------------------------------------
// DeployExit
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum DeployExit {
    RolledBack {
        target: String,
        stage: Option<DeployState>,
        error: String,
    },
    Failed {
        target: String,
        error: String,
    },
}

impl DeployExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployExit::RolledBack { .. } => 2,
            DeployExit::Failed { .. } => 3,
        }
    }

    fn from_report(report: &DeploymentReport) -> Option<Self> {
        let target = report.attempt.target.to_string();
        let error = report.attempt.error.clone().unwrap_or_default();
        match report.outcome() {
            Outcome::Success => None,
            Outcome::RolledBack => Some(DeployExit::RolledBack {
                target,
                stage: report.attempt.failed_stage,
                error,
            }),
            Outcome::Failed => Some(DeployExit::Failed { target, error }),
        }
    }
}

impl std::fmt::Display for DeployExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployExit::RolledBack {
                target,
                stage,
                error,
            } => {
                let stage = stage.map(|s| s.as_str()).unwrap_or("unknown");
                write!(f, "deploy of {target} rolled back (failed in {stage}): {error}")
            }
            DeployExit::Failed { target, error } => {
                write!(f, "deploy of {target} failed, manual intervention required: {error}")
            }
        }
    }
}

impl std::error::Error for DeployExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub fn run(
    root: &Path,
    tag: &str,
    skip_migrations: bool,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<()> {
    let target = VersionTag::parse(tag)?;
    let config = load_config(root)?;

    if dry_run {
        return plan(root, &config, &target, skip_migrations, json);
    }

    for binary in ["docker", provider_binary(&config.secrets.provider)] {
        require_binary(binary)?;
    }

    let exec = system_exec();
    let secrets = provider_from_config(
        &config.secrets.provider,
        root,
        exec.clone(),
        Duration::from_secs(config.timeouts.secrets_secs),
    )?;
    let migrations: Option<Box<dyn MigrationRunner>> = if skip_migrations {
        tracing::info!("--skip-migrations set, migration step disabled");
        None
    } else if !config.migrations.enabled {
        None
    } else {
        Some(Box::new(SqlMigrationRunner::new(
            paths::resolve(root, &config.migrations.dir),
            Duration::from_secs(config.timeouts.migrations_secs),
        )))
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let probe = probe_from_config(&config.health.probe, exec.clone(), config.health.interval())?;

    let cancel = CancelToken::new();
    install_interrupt_handler(cancel.clone());

    let mut orchestrator = Orchestrator::new(
        DeploySettings::from_config(&config, root),
        secrets,
        migrations,
        Box::new(compose_runtime(root, &config, exec)),
        HealthChecker::new(probe, clock.clone()),
        clock,
    )
    .with_cancel(cancel);

    let report = deploy_exclusive(
        &paths::ledger_path(root),
        config.lease_ttl(),
        &mut orchestrator,
        &target,
    )
    .context("deployment did not start")?;

    print_report(&report, json)?;
    match DeployExit::from_report(&report) {
        None => Ok(()),
        Some(exit) => Err(exit.into()),
    }
}

/// First Ctrl-C cancels the deployment and lets rollback finish; a second
/// one exits immediately.
fn install_interrupt_handler(cancel: CancelToken) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!(error = %e, "could not install interrupt handler");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling deployment (press again to abort)");
                cancel.cancel();
            }
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("aborted");
                std::process::exit(130);
            }
        });
    });
}

fn print_report(report: &DeploymentReport, json: bool) -> anyhow::Result<()> {
    let a = &report.attempt;
    if json {
        return print_json(&serde_json::json!({
            "outcome": report.outcome(),
            "final_state": report.final_state,
            "attempt": a,
        }));
    }

    println!("deploy {}: {}", a.target, report.outcome());
    let mut fields = vec![
        ("attempt", a.id.to_string()),
        (
            "previous",
            a.previous
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "(none)".into()),
        ),
        ("migrations", format!("{} applied", a.migrations_applied)),
        ("probes", a.health_probes.to_string()),
    ];
    if let Some(secs) = a.duration_secs() {
        fields.push(("duration", format!("{secs}s")));
    }
    if let Some(stage) = a.failed_stage {
        fields.push(("failed in", stage.to_string()));
    }
    print_fields(&fields);
    Ok(())
}

// ---------------------------------------------------------------------------
// --dry-run
// ---------------------------------------------------------------------------

fn plan(
    root: &Path,
    config: &Config,
    target: &VersionTag,
    skip_migrations: bool,
    json: bool,
) -> anyhow::Result<()> {
    let runtime = compose_runtime(root, config, system_exec());
    let current = match runtime.current_version() {
        Ok(Some(v)) => v.to_string(),
        Ok(None) => "(none)".to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "could not query running version");
            "unknown".to_string()
        }
    };

    let migrations_enabled = config.migrations.enabled && !skip_migrations;
    let migrations: Vec<String> = if migrations_enabled {
        load_migrations(&paths::resolve(root, &config.migrations.dir))?
            .into_iter()
            .map(|m| m.id)
            .collect()
    } else {
        Vec::new()
    };

    let ledger_path = paths::ledger_path(root);
    let lease = if ledger_path.exists() {
        HostLedger::open(&ledger_path)?.current_lease()?
    } else {
        None
    };

    let secret_names: Vec<String> = config.secret_names().into_iter().collect();
    let image = format!("{}:{}", config.gateway.image, target);
    let endpoint = config.health.probe.endpoint();

    if json {
        return print_json(&serde_json::json!({
            "target": target,
            "image": image,
            "current": current,
            "secrets": secret_names,
            "migrations_enabled": migrations_enabled,
            "migrations": migrations,
            "health_endpoint": endpoint,
            "deadline_secs": config.deploy_budget().as_secs(),
            "lease": lease,
        }));
    }

    println!("plan: deploy {image}");
    let migrations_line = if migrations_enabled {
        format!("{} file(s) considered: {}", migrations.len(), migrations.join(", "))
    } else {
        "skipped".to_string()
    };
    print_fields(&[
        ("running", current),
        ("secrets", secret_names.join(", ")),
        ("migrations", migrations_line),
        ("health", endpoint),
        ("deadline", format!("{}s", config.deploy_budget().as_secs())),
        (
            "lease",
            lease
                .map(|l| format!("held by {} until {}", l.holder, l.expires_at.to_rfc3339()))
                .unwrap_or_else(|| "free".into()),
        ),
    ]);
    Ok(())
}
