use crate::error::{DeployError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// GatewayConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Image repository; the version tag is supplied per deployment.
    #[serde(default = "default_image")]
    pub image: String,
    /// Compose service whose running image defines the current version.
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Compose project name (`-p`). Defaults to Compose's own choice.
    #[serde(default)]
    pub project: Option<String>,
    /// Variable the compose file interpolates for the gateway image.
    #[serde(default = "default_image_env")]
    pub image_env: String,
    /// Network and port bindings exported to Compose as variables.
    #[serde(default)]
    pub bindings: BTreeMap<String, String>,
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

fn default_image() -> String {
    "kong".to_string()
}

fn default_service() -> String {
    "kong".to_string()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_image_env() -> String {
    "GATEWAY_IMAGE".to_string()
}

fn default_stop_grace() -> u64 {
    30
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            service: default_service(),
            compose_file: default_compose_file(),
            project: None,
            image_env: default_image_env(),
            bindings: BTreeMap::new(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

// ---------------------------------------------------------------------------
// SecretsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretSource {
    /// AWS Secrets Manager through the `aws` CLI and the host's instance role.
    Aws {
        #[serde(default = "default_secret_id")]
        secret_id: String,
        #[serde(default = "default_region")]
        region: Option<String>,
    },
    /// An `age`-encrypted KEY=VALUE file decrypted with a host identity.
    Age {
        path: PathBuf,
        #[serde(default)]
        identity: Option<PathBuf>,
    },
}

fn default_secret_id() -> String {
    "kong/db-credentials".to_string()
}

fn default_region() -> Option<String> {
    Some("us-east-2".to_string())
}

fn default_secret_source() -> SecretSource {
    SecretSource::Aws {
        secret_id: default_secret_id(),
        region: default_region(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_secret_source")]
    pub provider: SecretSource,
    /// Names that must be present for the fetch to succeed.
    #[serde(default = "default_required_secrets")]
    pub required: Vec<String>,
    /// Service environment variable -> secret name.
    #[serde(default = "default_secret_env")]
    pub env: BTreeMap<String, String>,
}

fn default_required_secrets() -> Vec<String> {
    ["username", "password", "host", "port", "dbname"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_secret_env() -> BTreeMap<String, String> {
    [
        ("POSTGRES_HOST", "host"),
        ("POSTGRES_PORT", "port"),
        ("POSTGRES_USER", "username"),
        ("POSTGRES_PASSWORD", "password"),
        ("POSTGRES_DB", "dbname"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: default_secret_source(),
            required: default_required_secrets(),
            env: default_secret_env(),
        }
    }
}

// ---------------------------------------------------------------------------
// MigrationsConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Connection parameters are read from the secret bundle by key name.
    Postgres {
        #[serde(default = "default_host_key")]
        host_key: String,
        #[serde(default = "default_port_key")]
        port_key: String,
        #[serde(default = "default_user_key")]
        user_key: String,
        #[serde(default = "default_password_key")]
        password_key: String,
        #[serde(default = "default_database_key")]
        database_key: String,
        /// Reach the database through a different address than the one the
        /// gateway containers use (e.g. a private IP from the host).
        #[serde(default)]
        host_override: Option<String>,
    },
    Sqlite { path: PathBuf },
}

fn default_host_key() -> String {
    "host".to_string()
}

fn default_port_key() -> String {
    "port".to_string()
}

fn default_user_key() -> String {
    "username".to_string()
}

fn default_password_key() -> String {
    "password".to_string()
}

fn default_database_key() -> String {
    "dbname".to_string()
}

fn default_store() -> StoreConfig {
    StoreConfig::Postgres {
        host_key: default_host_key(),
        port_key: default_port_key(),
        user_key: default_user_key(),
        password_key: default_password_key(),
        database_key: default_database_key(),
        host_override: None,
    }
}

impl StoreConfig {
    /// Secret names this store needs to connect.
    pub fn secret_names(&self) -> Vec<&str> {
        match self {
            StoreConfig::Postgres {
                host_key,
                port_key,
                user_key,
                password_key,
                database_key,
                host_override,
            } => {
                let mut names = vec![
                    port_key.as_str(),
                    user_key.as_str(),
                    password_key.as_str(),
                    database_key.as_str(),
                ];
                if host_override.is_none() {
                    names.push(host_key.as_str());
                }
                names
            }
            StoreConfig::Sqlite { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_store")]
    pub store: StoreConfig,
}

fn default_true() -> bool {
    true
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from(paths::MIGRATIONS_DIR)
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_migrations_dir(),
            store: default_store(),
        }
    }
}

// ---------------------------------------------------------------------------
// HealthConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// GET the endpoint; any 2xx is healthy.
    Http {
        #[serde(default = "default_endpoint")]
        endpoint: String,
    },
    /// Run argv; exit status 0 is healthy.
    Command {
        #[serde(default = "default_probe_argv")]
        argv: Vec<String>,
    },
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8001/status".to_string()
}

fn default_probe_argv() -> Vec<String> {
    ["docker", "exec", "kong", "kong", "status"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_probe() -> ProbeConfig {
    ProbeConfig::Http {
        endpoint: default_endpoint(),
    }
}

impl ProbeConfig {
    /// The target string handed to the probe, used in logs and errors.
    pub fn endpoint(&self) -> String {
        match self {
            ProbeConfig::Http { endpoint } => endpoint.clone(),
            ProbeConfig::Command { argv } => argv.join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe")]
    pub probe: ProbeConfig,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    /// Probe the restored version after a rollback before reporting
    /// `rolled_back`. Off by default: the previous version is trusted.
    #[serde(default)]
    pub verify_rollback: bool,
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: default_probe(),
            timeout_secs: default_health_timeout(),
            interval_secs: default_health_interval(),
            verify_rollback: false,
        }
    }
}

impl HealthConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// ---------------------------------------------------------------------------
// TimeoutsConfig
// ---------------------------------------------------------------------------

/// Per-step budgets. Their sum (plus the health timeout) is the overall
/// deployment deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_secrets_secs")]
    pub secrets_secs: u64,
    #[serde(default = "default_migrations_secs")]
    pub migrations_secs: u64,
    #[serde(default = "default_stop_secs")]
    pub stop_secs: u64,
    #[serde(default = "default_start_secs")]
    pub start_secs: u64,
}

fn default_secrets_secs() -> u64 {
    30
}

fn default_migrations_secs() -> u64 {
    300
}

fn default_stop_secs() -> u64 {
    60
}

fn default_start_secs() -> u64 {
    300
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            secrets_secs: default_secrets_secs(),
            migrations_secs: default_migrations_secs(),
            stop_secs: default_stop_secs(),
            start_secs: default_start_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            gateway: GatewayConfig::default(),
            secrets: SecretsConfig::default(),
            migrations: MigrationsConfig::default(),
            health: HealthConfig::default(),
            timeouts: TimeoutsConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(DeployError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Every secret name a deployment needs: the explicit required list, the
    /// names mapped into the service environment, and the store's
    /// connection keys when migrations are enabled.
    pub fn secret_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.secrets.required.iter().cloned().collect();
        names.extend(self.secrets.env.values().cloned());
        if self.migrations.enabled {
            names.extend(
                self.migrations
                    .store
                    .secret_names()
                    .into_iter()
                    .map(str::to_string),
            );
        }
        names
    }

    /// Overall deployment deadline: the sum of every step budget.
    pub fn deploy_budget(&self) -> Duration {
        let t = &self.timeouts;
        let migrations = if self.migrations.enabled {
            t.migrations_secs
        } else {
            0
        };
        Duration::from_secs(
            t.secrets_secs
                + migrations
                + t.stop_secs
                + t.start_secs
                + self.health.timeout_secs,
        )
    }

    /// How long a host lease stays valid before another run may take it over.
    pub fn lease_ttl(&self) -> Duration {
        self.deploy_budget() + Duration::from_secs(60)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.version != 1 {
            error(format!("unsupported config version {}", self.version));
        }
        if self.gateway.image.trim().is_empty() {
            error("gateway.image is empty".to_string());
        }
        if self.gateway.image_env.trim().is_empty() {
            error("gateway.image_env is empty".to_string());
        }
        if self.secrets.env.contains_key(&self.gateway.image_env) {
            error(format!(
                "secrets.env maps '{}', which is reserved for the gateway image",
                self.gateway.image_env
            ));
        }
        if self.health.interval_secs == 0 {
            error("health.interval_secs must be greater than zero".to_string());
        }
        match &self.health.probe {
            ProbeConfig::Http { endpoint } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    error(format!("health endpoint '{endpoint}' is not an http(s) URL"));
                }
            }
            ProbeConfig::Command { argv } => {
                if argv.is_empty() {
                    error("health.probe.argv is empty".to_string());
                }
            }
        }

        if self.health.interval_secs > self.health.timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "health.interval_secs ({}) exceeds health.timeout_secs ({}): only one probe will run",
                    self.health.interval_secs, self.health.timeout_secs
                ),
            });
        }

        for (var, secret) in &self.secrets.env {
            if !self.secrets.required.contains(secret) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "secrets.env.{var} uses '{secret}', which is not in secrets.required"
                    ),
                });
            }
            if self.gateway.bindings.contains_key(var) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("'{var}' is set by both secrets.env and gateway.bindings"),
                });
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
