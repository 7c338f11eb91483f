use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("not initialized: run 'gwdeploy init'")]
    NotInitialized,

    #[error("invalid version tag '{0}': must match [A-Za-z0-9_][A-Za-z0-9_.-]{{0,127}}")]
    InvalidVersionTag(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("migration '{id}' failed: {reason}")]
    Migration { id: String, reason: String },

    #[error("migration store error: {0}")]
    MigrationStore(String),

    #[error("runtime failed to start: {0}")]
    RuntimeStart(String),

    #[error("runtime failed to stop: {0}")]
    RuntimeStop(String),

    #[error("runtime query failed: {0}")]
    RuntimeQuery(String),

    #[error("health check on {endpoint} timed out after {elapsed_secs}s ({probes} probe(s))")]
    HealthCheckTimeout {
        endpoint: String,
        probes: u32,
        elapsed_secs: u64,
    },

    #[error("rollback failed after '{cause}': {rollback}")]
    RollbackFailed {
        cause: Box<DeployError>,
        rollback: Box<DeployError>,
    },

    #[error("deployment deadline of {0}s exceeded")]
    DeadlineExceeded(u64),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("another deployment holds the host lease until {expires_at} (attempt {holder})")]
    DeployInProgress { holder: String, expires_at: String },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("required binary not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("failed to spawn '{program}': {reason}")]
    CommandSpawn { program: String, reason: String },

    #[error("'{program}' timed out after {secs}s")]
    CommandTimeout { program: String, secs: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeployError>;
