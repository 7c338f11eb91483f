//! Bounded external command execution.
//!
//! Every collaborator that touches the host (Compose, the secret store CLI,
//! `age`, command probes) goes through the [`Exec`] trait so its argv sequence
//! can be scripted in tests. [`SystemExec`] is the real implementation, built
//! on `tokio::process`: output is collected concurrently and a child that
//! outlives its timeout is killed when its handle is dropped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::{DeployError, Result};

/// Cap for captured output; the tail is kept.
const MAX_OUTPUT: usize = 10 * 1024;

// ---------------------------------------------------------------------------
// CommandSpec
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment for the child. Values may be credentials and are
    /// never printed.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program arg1 arg2 ...`, safe to log.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &env_keys)
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Combined stdout/stderr, trimmed and capped to the last 10KB.
    pub fn combined(&self) -> String {
        let output = match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        };
        if output.len() > MAX_OUTPUT {
            let mut start = output.len() - MAX_OUTPUT;
            while !output.is_char_boundary(start) {
                start += 1;
            }
            output[start..].to_string()
        } else {
            output
        }
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

pub trait Exec: Send + Sync {
    /// Run a command to completion. A non-zero exit is reported through
    /// `CommandOutput::success`, not as an error; errors mean the command
    /// could not be run or exceeded its timeout.
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Locate a binary on `PATH`.
pub fn require_binary(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|_| DeployError::BinaryNotFound(name.to_string()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExec;

impl Exec for SystemExec {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %spec.display(), "exec");
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(run_child(spec))
    }
}

/// Spawn `spec` and collect its output. The child is owned by the future, so
/// dropping it on timeout kills the process through its handle.
async fn run_child(spec: &CommandSpec) -> Result<CommandOutput> {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }

    let child = cmd.spawn().map_err(|e| DeployError::CommandSpawn {
        program: spec.program.clone(),
        reason: e.to_string(),
    })?;

    let output = match spec.timeout {
        None => child.wait_with_output().await?,
        Some(limit) => match timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(DeployError::CommandTimeout {
                    program: spec.program.clone(),
                    secs: limit.as_secs(),
                })
            }
        },
    };

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned outputs keyed by argv prefix and records every call.
    #[derive(Default)]
    pub struct ScriptedExec {
        rules: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
        pub calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedExec {
        pub fn new() -> Self {
            Self::default()
        }

        /// Responses for any command whose display string starts with
        /// `prefix`. The last response repeats once the queue drains.
        pub fn on(self, prefix: &str, outputs: Vec<CommandOutput>) -> Self {
            self.rules
                .lock()
                .unwrap()
                .push((prefix.to_string(), outputs.into()));
            self
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(CommandSpec::display)
                .collect()
        }
    }

    impl Exec for ScriptedExec {
        fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(cmd.clone());
            let line = cmd.display();
            let mut rules = self.rules.lock().unwrap();
            let rule = rules
                .iter_mut()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len());
            match rule {
                Some((_, queue)) if queue.len() > 1 => Ok(queue.pop_front().unwrap()),
                Some((_, queue)) => Ok(queue.front().cloned().unwrap_or_default()),
                None => Ok(CommandOutput::ok("")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_env_values() {
        let spec = CommandSpec::new("docker")
            .args(["compose", "up"])
            .env("POSTGRES_PASSWORD", "hunter2");
        let debug = format!("{spec:?}");
        assert!(debug.contains("POSTGRES_PASSWORD"));
        assert!(!debug.contains("hunter2"));
        assert_eq!(spec.display(), "docker compose up");
    }

    #[test]
    fn combined_output_keeps_tail() {
        let out = CommandOutput {
            success: false,
            code: Some(1),
            stdout: "x".repeat(MAX_OUTPUT + 100),
            stderr: String::new(),
        };
        assert_eq!(out.combined().len(), MAX_OUTPUT);
    }

    #[cfg(unix)]
    #[test]
    fn system_exec_reports_exit_status() {
        let ok = SystemExec
            .run(&CommandSpec::new("sh").args(["-c", "echo hello"]))
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hello");

        let fail = SystemExec
            .run(&CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 3"]))
            .unwrap();
        assert!(!fail.success);
        assert_eq!(fail.code, Some(3));
        assert_eq!(fail.combined(), "boom");
    }

    #[cfg(unix)]
    #[test]
    fn system_exec_passes_env_to_child() {
        let out = SystemExec
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "printf %s \"$GW_TEST_VALUE\""])
                    .env("GW_TEST_VALUE", "abc"),
            )
            .unwrap();
        assert_eq!(out.stdout, "abc");
    }

    #[cfg(unix)]
    #[test]
    fn system_exec_times_out() {
        let err = SystemExec
            .run(
                &CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(200)),
            )
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandTimeout { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_returns_even_when_a_grandchild_holds_the_pipes() {
        let started = std::time::Instant::now();
        let err = SystemExec
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "sleep 20 & sleep 20"])
                    .timeout(Duration::from_millis(300)),
            )
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timed_out_child_is_killed() {
        let dir = tempfile::TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        SystemExec
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", script.as_str()])
                    .timeout(Duration::from_millis(500)),
            )
            .unwrap_err();

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = format!("/proc/{}/stat", pid.trim());
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        loop {
            // Gone, or a zombie waiting to be reaped.
            let alive = std::fs::read_to_string(&stat)
                .map(|s| !s.contains(") Z "))
                .unwrap_or(false);
            if !alive {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "child still running");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = SystemExec
            .run(&CommandSpec::new("gwdeploy-definitely-missing-binary"))
            .unwrap_err();
        assert!(matches!(err, DeployError::CommandSpawn { .. }));
    }
}
