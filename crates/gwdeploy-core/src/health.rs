//! Readiness polling.
//!
//! [`HealthChecker::wait_healthy`] probes at a fixed interval until one probe
//! succeeds or the elapsed time reaches the timeout. Individual probe
//! failures are expected while the gateway boots and are only logged at
//! debug. Time is read through [`Clock`] so the loop is deterministic under
//! test.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::ProbeConfig;
use crate::error::{DeployError, Result};
use crate::exec::{CommandSpec, Exec};
use crate::types::HealthStatus;

/// Upper bound for a single HTTP probe.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

pub trait Probe: Send + Sync {
    /// One readiness check. Any error means "not healthy yet".
    fn check(&self, endpoint: &str) -> Result<()>;
}

/// GET the endpoint; any 2xx status is healthy.
pub struct HttpProbe {
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout.min(MAX_PROBE_TIMEOUT).max(Duration::from_millis(100)))
            .build()
            .map_err(|e| DeployError::InvalidConfig(format!("http probe: {e}")))?;
        Ok(Self { client })
    }
}

impl Probe for HttpProbe {
    fn check(&self, endpoint: &str) -> Result<()> {
        let resp = self
            .client
            .get(endpoint)
            .send()
            .map_err(|e| DeployError::RuntimeQuery(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(DeployError::RuntimeQuery(format!(
                "{endpoint} returned {}",
                resp.status()
            )))
        }
    }
}

/// Run a fixed argv; exit status 0 is healthy. The endpoint string is only
/// used for logging.
pub struct CommandProbe {
    argv: Vec<String>,
    exec: Arc<dyn Exec>,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(argv: Vec<String>, exec: Arc<dyn Exec>, timeout: Duration) -> Self {
        Self {
            argv,
            exec,
            timeout,
        }
    }
}

impl Probe for CommandProbe {
    fn check(&self, _endpoint: &str) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(DeployError::InvalidConfig("empty probe command".into()));
        };
        let out = self.exec.run(
            &CommandSpec::new(program.as_str())
                .args(args.iter().cloned())
                .timeout(self.timeout),
        )?;
        if out.success {
            Ok(())
        } else {
            Err(DeployError::RuntimeQuery(out.combined()))
        }
    }
}

/// Build the configured probe. `interval` sizes the per-probe timeout.
pub fn probe_from_config(
    config: &ProbeConfig,
    exec: Arc<dyn Exec>,
    interval: Duration,
) -> Result<Box<dyn Probe>> {
    match config {
        ProbeConfig::Http { .. } => Ok(Box::new(HttpProbe::new(interval)?)),
        ProbeConfig::Command { argv } => Ok(Box::new(CommandProbe::new(
            argv.clone(),
            exec,
            interval.max(MAX_PROBE_TIMEOUT),
        ))),
    }
}

// ---------------------------------------------------------------------------
// HealthChecker
// ---------------------------------------------------------------------------

pub struct HealthChecker {
    probe: Box<dyn Probe>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    last: HealthStatus,
}

impl HealthChecker {
    pub fn new(probe: Box<dyn Probe>, clock: Arc<dyn Clock>) -> Self {
        Self {
            probe,
            clock,
            cancel: CancelToken::new(),
            last: HealthStatus::Unknown,
        }
    }

    /// Stop polling early once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Status derived from the most recent probe.
    pub fn last_status(&self) -> HealthStatus {
        self.last
    }

    /// A single probe, for status reporting.
    pub fn probe_once(&mut self, endpoint: &str) -> HealthStatus {
        self.last = match self.probe.check(endpoint) {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                tracing::debug!(endpoint, error = %e, "probe failed");
                HealthStatus::Unhealthy
            }
        };
        self.last
    }

    /// Poll until healthy. Returns the number of probes it took.
    pub fn wait_healthy(
        &mut self,
        endpoint: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<u32> {
        self.poll(endpoint, timeout, interval, true)
    }

    /// Like [`wait_healthy`](Self::wait_healthy) but ignores cancellation.
    /// Used to confirm a restored version after rollback.
    pub fn recheck(&mut self, endpoint: &str, timeout: Duration, interval: Duration) -> Result<u32> {
        self.poll(endpoint, timeout, interval, false)
    }

    fn poll(
        &mut self,
        endpoint: &str,
        timeout: Duration,
        interval: Duration,
        cancellable: bool,
    ) -> Result<u32> {
        let start = self.clock.now();
        let mut probes = 0u32;
        self.last = HealthStatus::Unknown;

        loop {
            if cancellable && self.cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            let elapsed = self.clock.now().saturating_sub(start);
            if probes > 0 && elapsed >= timeout {
                tracing::debug!(endpoint, probes, "health check gave up");
                return Err(DeployError::HealthCheckTimeout {
                    endpoint: endpoint.to_string(),
                    probes,
                    elapsed_secs: elapsed.as_secs(),
                });
            }

            probes += 1;
            if self.probe_once(endpoint) == HealthStatus::Healthy {
                tracing::info!(endpoint, probes, "gateway healthy");
                return Ok(probes);
            }

            let elapsed = self.clock.now().saturating_sub(start);
            let remaining = timeout.saturating_sub(elapsed);
            self.clock.sleep(interval.min(remaining));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Time only moves when something sleeps or calls `advance`.
    #[derive(Default)]
    pub struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advance(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }
    }

    /// Replays a fixed sequence of probe results; the last one repeats.
    /// An empty script is always unhealthy.
    pub struct ScriptedProbe {
        results: Mutex<VecDeque<bool>>,
        pub calls: Arc<Mutex<u32>>,
    }

    impl ScriptedProbe {
        pub fn new(results: Vec<bool>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Arc::new(Mutex::new(0)),
            }
        }

        pub fn always(healthy: bool) -> Self {
            Self::new(vec![healthy])
        }
    }

    impl Probe for ScriptedProbe {
        fn check(&self, endpoint: &str) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            let mut results = self.results.lock().unwrap();
            let healthy = if results.len() > 1 {
                results.pop_front().unwrap_or(false)
            } else {
                results.front().copied().unwrap_or(false)
            };
            if healthy {
                Ok(())
            } else {
                Err(DeployError::RuntimeQuery(format!("{endpoint} refused")))
            }
        }
    }
}
