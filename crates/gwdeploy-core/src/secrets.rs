//! Credential retrieval.
//!
//! A [`SecretProvider`] is a pure read against a remote store. It fails
//! closed: if any requested name is missing, or the store cannot be reached,
//! no bundle is returned at all. Retry policy belongs to the caller.
//!
//! Values live only in memory. [`SecretValue`] redacts itself in `Debug`
//! and `Display` so a stray `{:?}` in a log line cannot leak a password.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::SecretSource;
use crate::error::{DeployError, Result};
use crate::exec::{CommandSpec, Exec};

// ---------------------------------------------------------------------------
// SecretValue / SecretBundle
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Credentials for one deployment attempt plus the store's version id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretBundle {
    version: String,
    values: BTreeMap<String, SecretValue>,
}

impl SecretBundle {
    pub fn new(version: impl Into<String>, values: BTreeMap<String, SecretValue>) -> Self {
        Self {
            version: version.into(),
            values,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(SecretValue::expose)
    }

    /// Like [`get`](Self::get), but a missing name is a `SecretUnavailable`.
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| DeployError::SecretUnavailable(format!("'{name}' not in bundle")))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Keep exactly `names` from `all`, or fail naming every missing key.
fn select(
    version: String,
    mut all: BTreeMap<String, String>,
    names: &BTreeSet<String>,
) -> Result<SecretBundle> {
    let missing: Vec<&str> = names
        .iter()
        .filter(|n| !all.contains_key(n.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(DeployError::SecretUnavailable(format!(
            "missing: {}",
            missing.join(", ")
        )));
    }
    let values = names
        .iter()
        .filter_map(|n| all.remove(n).map(|v| (n.clone(), SecretValue::new(v))))
        .collect();
    Ok(SecretBundle::new(version, values))
}

// ---------------------------------------------------------------------------
// SecretProvider
// ---------------------------------------------------------------------------

pub trait SecretProvider {
    fn fetch(&self, names: &BTreeSet<String>) -> Result<SecretBundle>;
}

// ---------------------------------------------------------------------------
// AWS Secrets Manager (via the aws CLI)
// ---------------------------------------------------------------------------

/// Reads a JSON secret through `aws secretsmanager get-secret-value`.
/// Credentials come from the host's instance identity, never from config.
pub struct AwsSecretProvider {
    secret_id: String,
    region: Option<String>,
    exec: Arc<dyn Exec>,
    timeout: Duration,
}

impl AwsSecretProvider {
    pub fn new(
        secret_id: impl Into<String>,
        region: Option<String>,
        exec: Arc<dyn Exec>,
        timeout: Duration,
    ) -> Self {
        Self {
            secret_id: secret_id.into(),
            region,
            exec,
            timeout,
        }
    }

    fn command(&self) -> CommandSpec {
        let mut cmd = CommandSpec::new("aws").args([
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            self.secret_id.as_str(),
            "--output",
            "json",
        ]);
        if let Some(region) = &self.region {
            cmd = cmd.args(["--region", region.as_str()]);
        }
        cmd.timeout(self.timeout)
    }
}

#[derive(serde::Deserialize)]
struct GetSecretValueOutput {
    #[serde(rename = "SecretString")]
    secret_string: Option<String>,
    #[serde(rename = "VersionId")]
    version_id: Option<String>,
}

impl SecretProvider for AwsSecretProvider {
    fn fetch(&self, names: &BTreeSet<String>) -> Result<SecretBundle> {
        let output = self
            .exec
            .run(&self.command())
            .map_err(|e| DeployError::SecretUnavailable(format!("{}: {e}", self.secret_id)))?;
        if !output.success {
            return Err(DeployError::SecretUnavailable(format!(
                "{}: {}",
                self.secret_id,
                output.combined()
            )));
        }

        let parsed: GetSecretValueOutput = serde_json::from_str(&output.stdout).map_err(|e| {
            DeployError::SecretUnavailable(format!("{}: unreadable response: {e}", self.secret_id))
        })?;
        let secret_string = parsed.secret_string.ok_or_else(|| {
            DeployError::SecretUnavailable(format!("{}: no SecretString", self.secret_id))
        })?;
        let all = parse_json_object(&secret_string).map_err(|reason| {
            DeployError::SecretUnavailable(format!("{}: {reason}", self.secret_id))
        })?;

        let version = parsed.version_id.unwrap_or_else(|| "unknown".to_string());
        let bundle = select(version, all, names)?;
        tracing::debug!(
            secret_id = %self.secret_id,
            version = %bundle.version(),
            count = bundle.len(),
            "fetched secrets"
        );
        Ok(bundle)
    }
}

/// Flatten a JSON object of scalars into strings. Nested values are
/// rejected. Errors never echo values.
fn parse_json_object(raw: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|_| "SecretString is not JSON".to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| "SecretString is not a JSON object".to_string())?;
    let mut out = BTreeMap::new();
    for (key, value) in object {
        let s = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => return Err(format!("'{key}' is not a scalar")),
        };
        out.insert(key.clone(), s);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// age-encrypted env file
// ---------------------------------------------------------------------------

/// Decrypts a `KEY=VALUE` file with the `age` binary.
pub struct AgeSecretProvider {
    path: PathBuf,
    identity: PathBuf,
    exec: Arc<dyn Exec>,
    timeout: Duration,
}

impl AgeSecretProvider {
    pub fn new(path: PathBuf, identity: PathBuf, exec: Arc<dyn Exec>, timeout: Duration) -> Self {
        Self {
            path,
            identity,
            exec,
            timeout,
        }
    }

    /// Version of an env file is its modification time.
    fn version(&self) -> String {
        self.path
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Default decryption identity: `~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`.
pub fn default_identity() -> Option<PathBuf> {
    let home = home::home_dir()?;
    [
        home.join(".ssh").join("id_ed25519"),
        home.join(".ssh").join("id_rsa"),
    ]
    .into_iter()
    .find(|p| p.exists())
}

impl SecretProvider for AgeSecretProvider {
    fn fetch(&self, names: &BTreeSet<String>) -> Result<SecretBundle> {
        if !self.path.exists() {
            return Err(DeployError::SecretUnavailable(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        let cmd = CommandSpec::new("age")
            .args([
                "--decrypt".to_string(),
                "--identity".to_string(),
                path_arg(&self.identity),
                path_arg(&self.path),
            ])
            .timeout(self.timeout);
        let output = self
            .exec
            .run(&cmd)
            .map_err(|e| DeployError::SecretUnavailable(e.to_string()))?;
        if !output.success {
            return Err(DeployError::SecretUnavailable(format!(
                "age: {}",
                output.stderr.trim()
            )));
        }
        select(self.version(), parse_env_content(&output.stdout), names)
    }
}

/// Build the configured provider. Relative paths resolve against `root`.
pub fn provider_from_config(
    source: &SecretSource,
    root: &Path,
    exec: Arc<dyn Exec>,
    timeout: Duration,
) -> Result<Box<dyn SecretProvider>> {
    match source {
        SecretSource::Aws { secret_id, region } => Ok(Box::new(AwsSecretProvider::new(
            secret_id.clone(),
            region.clone(),
            exec,
            timeout,
        ))),
        SecretSource::Age { path, identity } => {
            let identity = match identity {
                Some(id) => crate::paths::resolve(root, id),
                None => default_identity().ok_or_else(|| {
                    DeployError::SecretUnavailable(
                        "no age identity configured and none found in ~/.ssh".into(),
                    )
                })?,
            };
            Ok(Box::new(AgeSecretProvider::new(
                crate::paths::resolve(root, path),
                identity,
                exec,
                timeout,
            )))
        }
    }
}

/// The binary a provider shells out to.
pub fn provider_binary(source: &SecretSource) -> &'static str {
    match source {
        SecretSource::Aws { .. } => "aws",
        SecretSource::Age { .. } => "age",
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped; a
/// value wrapped in matching quotes is unquoted.
pub fn parse_env_content(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .filter(|(k, _)| !k.trim().is_empty())
        .map(|(k, v)| (k.trim().to_string(), unquote(v.trim()).to_string()))
        .collect()
}

fn unquote(v: &str) -> &str {
    for q in ['"', '\''] {
        if v.len() >= 2 && v.starts_with(q) && v.ends_with(q) {
            return &v[1..v.len() - 1];
        }
    }
    v
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::ScriptedExec;
    use crate::exec::CommandOutput;
    use tempfile::TempDir;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn aws_response(secret: &str) -> CommandOutput {
        CommandOutput::ok(
            serde_json::json!({
                "Name": "kong/db-credentials",
                "SecretString": secret,
                "VersionId": "v-123",
            })
            .to_string(),
        )
    }

    fn aws(exec: ScriptedExec) -> (Arc<ScriptedExec>, AwsSecretProvider) {
        let exec = Arc::new(exec);
        let provider = AwsSecretProvider::new(
            "kong/db-credentials",
            Some("us-east-2".to_string()),
            exec.clone(),
            Duration::from_secs(5),
        );
        (exec, provider)
    }

    #[test]
    fn aws_fetch_returns_requested_names_only() {
        let secret = r#"{"username":"kong","password":"s3cret","port":5432,"extra":"x"}"#;
        let (exec, provider) =
            aws(ScriptedExec::new().on("aws secretsmanager", vec![aws_response(secret)]));

        let bundle = provider
            .fetch(&names(&["username", "password", "port"]))
            .unwrap();
        assert_eq!(bundle.version(), "v-123");
        assert_eq!(bundle.get("port"), Some("5432"));
        assert_eq!(bundle.get("password"), Some("s3cret"));
        assert_eq!(bundle.get("extra"), None);

        let cmds = exec.commands();
        assert_eq!(
            cmds,
            vec!["aws secretsmanager get-secret-value --secret-id kong/db-credentials --output json --region us-east-2"]
        );
    }

    #[test]
    fn aws_fetch_fails_closed_on_missing_name() {
        let (_, provider) = aws(ScriptedExec::new().on(
            "aws",
            vec![aws_response(r#"{"username":"kong","password":"s3cret"}"#)],
        ));
        let err = provider
            .fetch(&names(&["username", "password", "dbname"]))
            .unwrap_err();
        match err {
            DeployError::SecretUnavailable(msg) => {
                assert!(msg.contains("dbname"), "{msg}");
                assert!(!msg.contains("s3cret"));
            }
            other => panic!("expected SecretUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn aws_cli_failure_is_unavailable() {
        let (_, provider) = aws(ScriptedExec::new().on(
            "aws",
            vec![CommandOutput::failed(
                254,
                "An error occurred (ResourceNotFoundException)",
            )],
        ));
        let err = provider.fetch(&names(&["username"])).unwrap_err();
        assert!(matches!(err, DeployError::SecretUnavailable(ref m) if m.contains("ResourceNotFound")));
    }

    #[test]
    fn aws_rejects_nested_values() {
        let (_, provider) = aws(
            ScriptedExec::new().on("aws", vec![aws_response(r#"{"username":{"a":1}}"#)]),
        );
        assert!(matches!(
            provider.fetch(&names(&["username"])),
            Err(DeployError::SecretUnavailable(_))
        ));
    }

    #[test]
    fn age_fetch_parses_env_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prod.age");
        std::fs::write(&path, b"ciphertext").unwrap();
        let exec = Arc::new(ScriptedExec::new().on(
            "age --decrypt",
            vec![CommandOutput::ok(
                "# kong\nusername=kong\npassword=\"p@ss=word\"\n\nport=5432\n",
            )],
        ));
        let provider = AgeSecretProvider::new(
            path,
            dir.path().join("id_ed25519"),
            exec.clone(),
            Duration::from_secs(5),
        );
        let bundle = provider.fetch(&names(&["username", "password"])).unwrap();
        assert_eq!(bundle.get("password"), Some("p@ss=word"));
        assert_eq!(bundle.len(), 2);
        assert_ne!(bundle.version(), "unknown");
    }

    #[test]
    fn provider_from_config_resolves_age_paths() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("prod.age"), b"ciphertext").unwrap();
        let exec = Arc::new(ScriptedExec::new().on("age", vec![CommandOutput::ok("username=kong\n")]));
        let source = SecretSource::Age {
            path: PathBuf::from("prod.age"),
            identity: Some(PathBuf::from("keys/host.key")),
        };
        let provider =
            provider_from_config(&source, dir.path(), exec.clone(), Duration::from_secs(5)).unwrap();
        provider.fetch(&names(&["username"])).unwrap();

        let cmd = exec.commands().remove(0);
        assert!(cmd.contains(&format!("--identity {}", dir.path().join("keys/host.key").display())));
        assert!(cmd.ends_with(&dir.path().join("prod.age").display().to_string()));
        assert_eq!(provider_binary(&source), "age");
    }

    #[test]
    fn age_missing_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let provider = AgeSecretProvider::new(
            dir.path().join("missing.age"),
            dir.path().join("id"),
            Arc::new(ScriptedExec::new()),
            Duration::from_secs(5),
        );
        assert!(matches!(
            provider.fetch(&names(&["username"])),
            Err(DeployError::SecretUnavailable(_))
        ));
    }

    #[test]
    fn bundle_debug_redacts_values() {
        let bundle = select(
            "v1".to_string(),
            [("password".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
            &names(&["password"]),
        )
        .unwrap();
        let debug = format!("{bundle:?}");
        assert!(debug.contains("password"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn parse_env_content_skips_comments_and_blank_lines() {
        let parsed = parse_env_content("# c\n\nA=1\nB='two'\n=bad\nnoequals\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["A"], "1");
        assert_eq!(parsed["B"], "two");
    }
}
