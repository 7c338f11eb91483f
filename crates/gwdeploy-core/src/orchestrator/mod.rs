//! Deployment state machine.
//!
//! One [`Orchestrator::deploy`] call moves the host from "previous version
//! running" to "target version running and healthy", or puts the previous
//! version back:
//!
//! ```text
//! Idle -> SecretsFetched -> MigrationsApplied -> RuntimeRestarted -> HealthVerified
//!                                  |                    |
//!                                  +---> RollingBack <--+---> RolledBack | Failed
//! ```
//!
//! Step failures are tagged with the stage they happened in
//! ([`StepFailure`]); only failures in `MigrationsApplied` or
//! `RuntimeRestarted` trigger a rollback. Nothing escapes `deploy()`: every
//! error ends up in the returned [`DeploymentReport`].

pub mod attempt;
pub mod ledger;

pub use attempt::{DeploymentAttempt, DeploymentReport, StepFailure};
pub use ledger::{HostLedger, Lease, LeaseHeartbeat};

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{Config, GatewayConfig, StoreConfig};
use crate::error::{DeployError, Result};
use crate::health::{Clock, HealthChecker};
use crate::migrate::{ConnectionInfo, MigrationRunner};
use crate::runtime::{ServiceRuntime, ServiceSpec};
use crate::secrets::{SecretBundle, SecretProvider};
use crate::types::{DeployState, Outcome, VersionTag};

// ---------------------------------------------------------------------------
// DeploySettings
// ---------------------------------------------------------------------------

/// The parts of the configuration the state machine reads.
#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub root: PathBuf,
    pub gateway: GatewayConfig,
    /// Service environment variable -> secret name.
    pub env_map: BTreeMap<String, String>,
    pub secret_names: BTreeSet<String>,
    pub store: StoreConfig,
    pub endpoint: String,
    pub health_timeout: Duration,
    pub health_interval: Duration,
    pub verify_rollback: bool,
    /// Overall budget for the forward path.
    pub deadline: Duration,
}

impl DeploySettings {
    pub fn from_config(config: &Config, root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            gateway: config.gateway.clone(),
            env_map: config.secrets.env.clone(),
            secret_names: config.secret_names(),
            store: config.migrations.store.clone(),
            endpoint: config.health.probe.endpoint(),
            health_timeout: config.health.timeout(),
            health_interval: config.health.interval(),
            verify_rollback: config.health.verify_rollback,
            deadline: config.deploy_budget(),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: DeploySettings,
    secrets: Box<dyn SecretProvider>,
    /// `None` skips the migration step.
    migrations: Option<Box<dyn MigrationRunner>>,
    runtime: Box<dyn ServiceRuntime>,
    health: HealthChecker,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    state: DeployState,
}

impl Orchestrator {
    pub fn new(
        settings: DeploySettings,
        secrets: Box<dyn SecretProvider>,
        migrations: Option<Box<dyn MigrationRunner>>,
        runtime: Box<dyn ServiceRuntime>,
        health: HealthChecker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            secrets,
            migrations,
            runtime,
            health,
            clock,
            cancel: CancelToken::new(),
            state: DeployState::Idle,
        }
    }

    /// Share a cancel token with the caller (e.g. a Ctrl-C handler).
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.health = self.health.with_cancel(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    pub fn deploy(&mut self, target: &VersionTag) -> DeploymentReport {
        self.deploy_with_id(Uuid::new_v4(), target)
    }

    pub fn deploy_with_id(&mut self, id: Uuid, target: &VersionTag) -> DeploymentReport {
        let mut attempt = DeploymentAttempt::new(id, target.clone());
        let started = self.clock.now();
        self.state = DeployState::Idle;
        tracing::info!(attempt = %id, %target, "deployment started");

        let (bundle, spec) = match self.fetch_secrets(target, started) {
            Ok(fetched) => fetched,
            Err(failure) => return self.conclude(attempt, Err(failure), None),
        };
        attempt.secrets_version = Some(bundle.version().to_string());

        let result = self.forward(&mut attempt, &bundle, &spec, started);
        self.conclude(attempt, result, Some(&bundle))
    }

    fn forward(
        &mut self,
        attempt: &mut DeploymentAttempt,
        bundle: &SecretBundle,
        spec: &ServiceSpec,
        started: Duration,
    ) -> std::result::Result<(), StepFailure> {
        self.apply_migrations(attempt, bundle, started)?;
        self.restart_runtime(spec, started)?;
        self.verify_health(attempt, started)
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn transition(&mut self, next: DeployState) {
        tracing::info!(from = %self.state, to = %next, "stage complete");
        self.state = next;
    }

    /// Cancellation and deadline check, attributed to `stage`.
    fn guard(&self, stage: DeployState, started: Duration) -> std::result::Result<(), StepFailure> {
        if self.cancel.is_cancelled() {
            return Err(StepFailure::new(stage, DeployError::Cancelled));
        }
        if self.clock.now().saturating_sub(started) > self.settings.deadline {
            return Err(StepFailure::new(
                stage,
                DeployError::DeadlineExceeded(self.settings.deadline.as_secs()),
            ));
        }
        Ok(())
    }

    fn remaining(&self, started: Duration) -> Duration {
        self.settings
            .deadline
            .saturating_sub(self.clock.now().saturating_sub(started))
    }

    /// Idle -> SecretsFetched. Also builds the target's service spec, so a
    /// bundle that cannot satisfy the environment mapping fails here.
    fn fetch_secrets(
        &mut self,
        target: &VersionTag,
        started: Duration,
    ) -> std::result::Result<(SecretBundle, ServiceSpec), StepFailure> {
        let stage = DeployState::Idle;
        self.guard(stage, started)?;
        let fail = |e: DeployError| StepFailure::new(stage, e);

        let bundle = self.secrets.fetch(&self.settings.secret_names).map_err(fail)?;
        let spec = ServiceSpec::build(
            &self.settings.gateway,
            &self.settings.env_map,
            &bundle,
            target,
        )
        .map_err(fail)?;
        tracing::info!(version = %bundle.version(), count = bundle.len(), "secrets fetched");
        self.transition(DeployState::SecretsFetched);
        Ok((bundle, spec))
    }

    /// SecretsFetched -> MigrationsApplied. Records the running version
    /// before anything changes.
    fn apply_migrations(
        &mut self,
        attempt: &mut DeploymentAttempt,
        bundle: &SecretBundle,
        started: Duration,
    ) -> std::result::Result<(), StepFailure> {
        let stage = DeployState::SecretsFetched;
        self.guard(stage, started)?;
        let fail = |e: DeployError| StepFailure::new(stage, e);

        attempt.previous = self.runtime.current_version().map_err(fail)?;
        match &attempt.previous {
            Some(previous) => tracing::info!(%previous, "current version recorded"),
            None => tracing::info!("no version running"),
        }

        match &self.migrations {
            Some(runner) => {
                let info = ConnectionInfo::resolve(&self.settings.store, bundle, &self.settings.root)
                    .map_err(fail)?;
                attempt.migrations_applied = runner.apply(&info).map_err(fail)?;
                tracing::info!(applied = attempt.migrations_applied, "migrations up to date");
            }
            None => tracing::info!("migrations skipped"),
        }

        // Last point where the host is untouched.
        self.guard(stage, started)?;
        self.transition(DeployState::MigrationsApplied);
        Ok(())
    }

    /// MigrationsApplied -> RuntimeRestarted. The runtime's commands are
    /// bounded by what is left of the deadline.
    fn restart_runtime(
        &mut self,
        spec: &ServiceSpec,
        started: Duration,
    ) -> std::result::Result<(), StepFailure> {
        let fail = |e: DeployError| StepFailure::new(DeployState::MigrationsApplied, e);
        self.runtime.set_deadline(Some(self.remaining(started)));
        self.runtime.stop().map_err(fail)?;
        self.runtime.start(spec).map_err(fail)?;
        self.transition(DeployState::RuntimeRestarted);
        Ok(())
    }

    /// RuntimeRestarted -> HealthVerified.
    fn verify_health(
        &mut self,
        attempt: &mut DeploymentAttempt,
        started: Duration,
    ) -> std::result::Result<(), StepFailure> {
        let stage = DeployState::RuntimeRestarted;
        self.guard(stage, started)?;

        let timeout = self.settings.health_timeout.min(self.remaining(started));
        let result = self.health.wait_healthy(
            &self.settings.endpoint,
            timeout,
            self.settings.health_interval,
        );
        match result {
            Ok(probes) => {
                attempt.health_probes = probes;
                self.transition(DeployState::HealthVerified);
                Ok(())
            }
            Err(e) => {
                if let DeployError::HealthCheckTimeout { probes, .. } = &e {
                    attempt.health_probes = *probes;
                }
                Err(StepFailure::new(stage, e))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Outcome and rollback
    // -----------------------------------------------------------------------

    fn conclude(
        &mut self,
        mut attempt: DeploymentAttempt,
        result: std::result::Result<(), StepFailure>,
        bundle: Option<&SecretBundle>,
    ) -> DeploymentReport {
        let failure = match result {
            Ok(()) => {
                attempt.finish(Outcome::Success, None);
                tracing::info!(
                    attempt = %attempt.id,
                    version = %attempt.target,
                    "deployment succeeded"
                );
                return DeploymentReport {
                    attempt,
                    error: None,
                    final_state: self.state,
                };
            }
            Err(failure) => failure,
        };

        let stage = failure.stage;
        let (outcome, error) = if failure.needs_rollback() {
            self.roll_back(failure.error, attempt.previous.as_ref(), bundle)
        } else {
            (Outcome::Failed, failure.error)
        };
        self.state = match outcome {
            Outcome::RolledBack => DeployState::RolledBack,
            _ => DeployState::Failed,
        };
        attempt.finish(outcome, Some((stage, error.to_string())));

        if outcome == Outcome::RolledBack {
            tracing::warn!(
                attempt = %attempt.id,
                %stage,
                error = %error,
                restored = ?attempt.previous.as_ref().map(VersionTag::as_str),
                "deployment rolled back"
            );
        } else {
            tracing::error!(
                attempt = %attempt.id,
                %stage,
                error = %error,
                "deployment failed, operator attention required"
            );
        }

        DeploymentReport {
            attempt,
            error: Some(error),
            final_state: self.state,
        }
    }

    /// Stop the new version and restart `previous`. Returns the outcome
    /// and the error to report.
    fn roll_back(
        &mut self,
        cause: DeployError,
        previous: Option<&VersionTag>,
        bundle: Option<&SecretBundle>,
    ) -> (Outcome, DeployError) {
        self.state = DeployState::RollingBack;
        tracing::warn!(error = %cause, "rolling back");
        // Restoring the previous version is not bounded by the forward
        // deadline; the step timeouts still apply.
        self.runtime.set_deadline(None);

        if let Err(e) = self.runtime.stop() {
            return (Outcome::Failed, rollback_failed(cause, e));
        }

        let (Some(previous), Some(bundle)) = (previous, bundle) else {
            tracing::warn!("no previous version to restore, runtime left stopped");
            return (Outcome::Failed, cause);
        };

        let spec = match ServiceSpec::build(
            &self.settings.gateway,
            &self.settings.env_map,
            bundle,
            previous,
        ) {
            Ok(spec) => spec,
            Err(e) => return (Outcome::Failed, rollback_failed(cause, e)),
        };
        if let Err(e) = self.runtime.start(&spec) {
            return (Outcome::Failed, rollback_failed(cause, e));
        }

        if self.settings.verify_rollback {
            if let Err(e) = self.health.recheck(
                &self.settings.endpoint,
                self.settings.health_timeout,
                self.settings.health_interval,
            ) {
                return (Outcome::Failed, rollback_failed(cause, e));
            }
        }

        tracing::info!(%previous, "previous version restored");
        (Outcome::RolledBack, cause)
    }
}

fn rollback_failed(cause: DeployError, rollback: DeployError) -> DeployError {
    DeployError::RollbackFailed {
        cause: Box::new(cause),
        rollback: Box::new(rollback),
    }
}

// ---------------------------------------------------------------------------
// Host-exclusive deployment
// ---------------------------------------------------------------------------

/// Run one deployment under the host lease in the ledger at `ledger_path`,
/// then append the attempt to the audit log and release the lease.
///
/// Fails with `DeployInProgress` without touching anything if another live
/// lease exists. The lease is renewed while the deployment runs. Once the
/// deployment has run, the report is returned even if the ledger cannot be
/// updated; that failure is logged and the lease left to expire.
pub fn deploy_exclusive(
    ledger_path: &Path,
    lease_ttl: Duration,
    orchestrator: &mut Orchestrator,
    target: &VersionTag,
) -> Result<DeploymentReport> {
    let id = Uuid::new_v4();
    // The ledger is closed while the deployment runs.
    HostLedger::open(ledger_path)?.acquire(id, target.as_str(), lease_ttl, Utc::now())?;
    let heartbeat = LeaseHeartbeat::start(ledger_path, id, lease_ttl);

    let report = orchestrator.deploy_with_id(id, target);
    heartbeat.stop();

    if let Err(e) = close_attempt(ledger_path, id, &report.attempt) {
        tracing::error!(
            attempt = %id,
            outcome = %report.outcome(),
            error = %e,
            "deployment finished but the ledger could not be updated"
        );
    }
    Ok(report)
}

fn close_attempt(ledger_path: &Path, id: Uuid, attempt: &DeploymentAttempt) -> Result<()> {
    let ledger = HostLedger::open(ledger_path)?;
    let recorded = ledger.record(attempt);
    let released = ledger.release(id);
    recorded?;
    released.map(|_| ())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
