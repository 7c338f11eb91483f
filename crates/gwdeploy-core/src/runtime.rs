//! Container lifecycle for the gateway's service set.
//!
//! [`ServiceRuntime`] is the only component that changes what is live on the
//! host. `start` is all-or-nothing: if any declared service is not running
//! afterwards, everything that did start is torn down before the error is
//! returned. `stop` is idempotent.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{GatewayConfig, TimeoutsConfig};
use crate::error::{DeployError, Result};
use crate::exec::{CommandOutput, CommandSpec, Exec};
use crate::secrets::{SecretBundle, SecretValue};
use crate::types::{ImageRef, VersionTag};

// ---------------------------------------------------------------------------
// ServiceSpec
// ---------------------------------------------------------------------------

/// What to run for one version: image, secret-derived environment and
/// network bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub image: ImageRef,
    pub env: BTreeMap<String, SecretValue>,
    pub bindings: BTreeMap<String, String>,
}

impl ServiceSpec {
    /// Build the spec for `version`, mapping each `env` entry
    /// (variable -> secret name) through the bundle.
    pub fn build(
        gateway: &GatewayConfig,
        env_map: &BTreeMap<String, String>,
        bundle: &SecretBundle,
        version: &VersionTag,
    ) -> Result<Self> {
        let mut env = BTreeMap::new();
        for (var, secret) in env_map {
            env.insert(var.clone(), SecretValue::new(bundle.require(secret)?));
        }
        Ok(Self {
            image: ImageRef::new(gateway.image.clone(), version.clone()),
            env,
            bindings: gateway.bindings.clone(),
        })
    }

    pub fn version(&self) -> &VersionTag {
        &self.image.tag
    }
}

// ---------------------------------------------------------------------------
// ServiceRuntime
// ---------------------------------------------------------------------------

pub trait ServiceRuntime {
    /// Version of the running gateway service, `None` if nothing runs.
    fn current_version(&self) -> Result<Option<VersionTag>>;

    /// Pull and start every declared service for `spec`.
    fn start(&mut self, spec: &ServiceSpec) -> Result<()>;

    /// Stop every service. Succeeds trivially when already stopped.
    fn stop(&mut self) -> Result<()>;

    /// Bound every later `start`/`stop` to `remaining` from now, on top of
    /// the per-step timeouts. `None` lifts the bound.
    fn set_deadline(&mut self, _remaining: Option<Duration>) {}
}

// ---------------------------------------------------------------------------
// ComposeRuntime
// ---------------------------------------------------------------------------

/// Drives `docker compose` in the gateway working directory.
pub struct ComposeRuntime {
    workdir: PathBuf,
    compose_file: PathBuf,
    project: Option<String>,
    service: String,
    image_env: String,
    default_image: String,
    bindings: BTreeMap<String, String>,
    stop_grace_secs: u64,
    start_timeout: Duration,
    stop_timeout: Duration,
    query_timeout: Duration,
    exec: Arc<dyn Exec>,
    /// Interpolation environment of the last `start`, reused by `stop` so
    /// the compose file resolves the same way it did at `up` time.
    last_env: Option<Vec<(String, String)>>,
    deadline: Option<Instant>,
}

impl ComposeRuntime {
    pub fn new(
        workdir: &Path,
        gateway: &GatewayConfig,
        timeouts: &TimeoutsConfig,
        exec: Arc<dyn Exec>,
    ) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            compose_file: crate::paths::resolve(workdir, &gateway.compose_file),
            project: gateway.project.clone(),
            service: gateway.service.clone(),
            image_env: gateway.image_env.clone(),
            default_image: format!("{}:latest", gateway.image),
            bindings: gateway.bindings.clone(),
            stop_grace_secs: gateway.stop_grace_secs,
            start_timeout: Duration::from_secs(timeouts.start_secs),
            stop_timeout: Duration::from_secs(timeouts.stop_secs),
            query_timeout: Duration::from_secs(30),
            exec,
            last_env: None,
            deadline: None,
        }
    }

    /// End of a step window of `step` starting now, clipped to the deadline.
    fn window(&self, step: Duration) -> Instant {
        let end = Instant::now() + step;
        match self.deadline {
            Some(deadline) => end.min(deadline),
            None => end,
        }
    }

    /// Time left until `until`, capped at `cap`. Errors once it has passed.
    fn left(until: Instant, cap: Duration) -> std::result::Result<Duration, String> {
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err("deployment deadline reached".to_string());
        }
        Ok(left.min(cap))
    }

    fn compose<I, S>(&self, args: I, env: &[(String, String)], timeout: Duration) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = CommandSpec::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(self.compose_file.to_string_lossy().into_owned());
        if let Some(project) = &self.project {
            cmd = cmd.args(["-p", project.as_str()]);
        }
        let mut cmd = cmd.args(args).current_dir(&self.workdir).timeout(timeout);
        cmd.env.extend(env.iter().cloned());
        cmd
    }

    fn spec_env(&self, spec: &ServiceSpec) -> Vec<(String, String)> {
        let mut env = vec![(self.image_env.clone(), spec.image.to_string())];
        env.extend(spec.bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(
            spec.env
                .iter()
                .map(|(k, v)| (k.clone(), v.expose().to_string())),
        );
        env
    }

    fn idle_env(&self) -> Vec<(String, String)> {
        if let Some(env) = &self.last_env {
            return env.clone();
        }
        let mut env = vec![(self.image_env.clone(), self.default_image.clone())];
        env.extend(self.bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    fn run_checked(&self, cmd: &CommandSpec) -> std::result::Result<CommandOutput, String> {
        match self.exec.run(cmd) {
            Ok(out) if out.success => Ok(out),
            Ok(out) => Err(format!("`{}` failed: {}", cmd.display(), out.combined())),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Tail of the gateway service's logs.
    pub fn logs(&self, lines: u32) -> Result<String> {
        let cmd = self.compose(
            [
                "logs".to_string(),
                "--no-color".to_string(),
                "--tail".to_string(),
                lines.to_string(),
                self.service.clone(),
            ],
            &self.idle_env(),
            self.query_timeout,
        );
        self.run_checked(&cmd)
            .map(|out| out.combined())
            .map_err(DeployError::RuntimeQuery)
    }

    /// `docker compose ps` output, for status reporting.
    pub fn ps(&self) -> Result<String> {
        let cmd = self.compose(["ps"], &self.idle_env(), self.query_timeout);
        self.run_checked(&cmd)
            .map(|out| out.stdout.trim_end().to_string())
            .map_err(DeployError::RuntimeQuery)
    }

    fn declared_services(
        &self,
        env: &[(String, String)],
        timeout: Duration,
    ) -> std::result::Result<BTreeSet<String>, String> {
        let cmd = self.compose(["config", "--services"], env, timeout);
        Ok(lines(&self.run_checked(&cmd)?.stdout))
    }

    fn running_services(
        &self,
        env: &[(String, String)],
        timeout: Duration,
    ) -> std::result::Result<BTreeSet<String>, String> {
        let cmd = self.compose(["ps", "--status", "running", "--services"], env, timeout);
        Ok(lines(&self.run_checked(&cmd)?.stdout))
    }

    /// `up` plus the all-running check, all inside the window ending at
    /// `until`.
    fn bring_up(
        &self,
        env: &[(String, String)],
        until: Instant,
    ) -> std::result::Result<(), String> {
        let up = self.compose(
            ["up", "-d", "--wait"],
            env,
            Self::left(until, self.start_timeout)?,
        );
        self.run_checked(&up)?;

        let declared = self.declared_services(env, Self::left(until, self.query_timeout)?)?;
        let running = self.running_services(env, Self::left(until, self.query_timeout)?)?;
        let missing: Vec<&str> = declared
            .difference(&running)
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("services not running: {}", missing.join(", ")));
        }
        Ok(())
    }

    fn down(&self, env: &[(String, String)], timeout: Duration) -> std::result::Result<(), String> {
        let cmd = self.compose(
            [
                "down".to_string(),
                "--timeout".to_string(),
                self.stop_grace_secs.to_string(),
            ],
            env,
            timeout,
        );
        self.run_checked(&cmd).map(|_| ())
    }
}

fn lines(s: &str) -> BTreeSet<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

impl ServiceRuntime for ComposeRuntime {
    fn current_version(&self) -> Result<Option<VersionTag>> {
        let ps = self.compose(
            ["ps".to_string(), "-q".to_string(), self.service.clone()],
            &self.idle_env(),
            self.query_timeout,
        );
        let out = self.run_checked(&ps).map_err(DeployError::RuntimeQuery)?;
        let Some(container) = out.stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(None);
        };

        let inspect = CommandSpec::new("docker")
            .args(["inspect", "--format", "{{.Config.Image}}", container])
            .timeout(self.query_timeout);
        let out = self.run_checked(&inspect).map_err(DeployError::RuntimeQuery)?;
        let image = out.stdout.trim();
        ImageRef::parse(image).map(|r| Some(r.tag)).ok_or_else(|| {
            DeployError::RuntimeQuery(format!(
                "cannot determine version from image '{image}'"
            ))
        })
    }

    fn start(&mut self, spec: &ServiceSpec) -> Result<()> {
        let env = self.spec_env(spec);
        tracing::info!(image = %spec.image, "starting services");

        // One window covers pull, up and the running check.
        let until = self.window(self.start_timeout);
        let pull = self.compose(
            ["pull"],
            &env,
            Self::left(until, self.start_timeout).map_err(DeployError::RuntimeStart)?,
        );
        self.run_checked(&pull).map_err(DeployError::RuntimeStart)?;

        if let Err(reason) = self.bring_up(&env, until) {
            tracing::warn!(%reason, "start failed, tearing down partially started services");
            // Teardown keeps its full timeout even past the deadline.
            if let Err(teardown) = self.down(&env, self.stop_timeout) {
                tracing::error!(%teardown, "teardown after failed start also failed");
                return Err(DeployError::RuntimeStart(format!(
                    "{reason}; teardown failed: {teardown}"
                )));
            }
            return Err(DeployError::RuntimeStart(reason));
        }

        self.last_env = Some(env);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        tracing::info!("stopping services");
        let timeout = Self::left(self.window(self.stop_timeout), self.stop_timeout)
            .map_err(DeployError::RuntimeStop)?;
        self.down(&self.idle_env(), timeout)
            .map_err(DeployError::RuntimeStop)
    }

    fn set_deadline(&mut self, remaining: Option<Duration>) {
        self.deadline = remaining.map(|r| Instant::now() + r);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
