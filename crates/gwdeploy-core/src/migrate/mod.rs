//! Forward-only schema migrations.
//!
//! A migration is a `*.sql` file in the migrations directory; its identifier
//! is the file stem and pending migrations run in lexical identifier order.
//! The target store keeps the applied identifiers in
//! `gwdeploy_schema_migrations`. Each change commits together with its record
//! row, so the record never disagrees with the schema. A failed change stops
//! the run; earlier changes stay committed and a re-run resumes at the first
//! identifier not in the record.

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{DeployError, Result};
use crate::secrets::{SecretBundle, SecretValue};

pub const RECORD_TABLE: &str = "gwdeploy_schema_migrations";

// ---------------------------------------------------------------------------
// Migration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub id: String,
    pub sql: String,
}

impl Migration {
    pub fn new(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sql: sql.into(),
        }
    }
}

/// Load every `*.sql` file in `dir`, sorted by identifier. A missing
/// directory holds no migrations.
pub fn load_migrations(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        tracing::warn!(dir = %dir.display(), "migrations directory does not exist");
        return Ok(Vec::new());
    }
    let mut migrations = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        migrations.push(Migration::new(id, std::fs::read_to_string(&path)?));
    }
    migrations.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(migrations)
}

// ---------------------------------------------------------------------------
// ConnectionInfo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInfo {
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: SecretValue,
        database: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl ConnectionInfo {
    /// Resolve the configured store against this attempt's secrets.
    pub fn resolve(store: &StoreConfig, bundle: &SecretBundle, root: &Path) -> Result<Self> {
        match store {
            StoreConfig::Postgres {
                host_key,
                port_key,
                user_key,
                password_key,
                database_key,
                host_override,
            } => {
                let host = match host_override {
                    Some(h) => h.clone(),
                    None => bundle.require(host_key)?.to_string(),
                };
                let raw_port = bundle.require(port_key)?;
                let port = raw_port.trim().parse::<u16>().map_err(|_| {
                    DeployError::MigrationStore(format!(
                        "secret '{port_key}' is not a valid port"
                    ))
                })?;
                Ok(ConnectionInfo::Postgres {
                    host,
                    port,
                    user: bundle.require(user_key)?.to_string(),
                    password: SecretValue::new(bundle.require(password_key)?),
                    database: bundle.require(database_key)?.to_string(),
                })
            }
            StoreConfig::Sqlite { path } => Ok(ConnectionInfo::Sqlite {
                path: crate::paths::resolve(root, path),
            }),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ConnectionInfo::Postgres {
                host,
                port,
                database,
                ..
            } => format!("postgres://{host}:{port}/{database}"),
            ConnectionInfo::Sqlite { path } => format!("sqlite://{}", path.display()),
        }
    }
}

// ---------------------------------------------------------------------------
// SchemaStore
// ---------------------------------------------------------------------------

/// A relational store that can hold the migration record.
pub trait SchemaStore {
    /// Exclude other runners for the duration of a run.
    fn lock(&mut self) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Applied identifiers in the order they were applied.
    fn applied(&mut self) -> Result<Vec<String>>;

    /// Run the change and append its identifier in one transaction.
    /// Returns `false` without running anything if the identifier is
    /// already recorded.
    fn apply(&mut self, migration: &Migration) -> Result<bool>;
}

/// Apply every migration not yet in the store's record. Returns how many
/// were applied by this call.
pub fn apply_pending(store: &mut dyn SchemaStore, migrations: &[Migration]) -> Result<usize> {
    store.lock()?;
    let result = apply_locked(store, migrations);
    let unlocked = store.unlock();
    let count = result?;
    unlocked?;
    Ok(count)
}

fn apply_locked(store: &mut dyn SchemaStore, migrations: &[Migration]) -> Result<usize> {
    let applied: HashSet<String> = store.applied()?.into_iter().collect();
    let mut ordered: Vec<&Migration> = migrations.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    let mut count = 0;
    for migration in ordered {
        if applied.contains(&migration.id) {
            continue;
        }
        if store.apply(migration)? {
            tracing::info!(id = %migration.id, "applied migration");
            count += 1;
        } else {
            tracing::debug!(id = %migration.id, "migration already recorded");
        }
    }
    Ok(count)
}

// ---------------------------------------------------------------------------
// MigrationRunner
// ---------------------------------------------------------------------------

pub trait MigrationRunner {
    fn apply(&self, store: &ConnectionInfo) -> Result<usize>;
}

/// Runs the `*.sql` files of a directory against Postgres or SQLite.
pub struct SqlMigrationRunner {
    dir: PathBuf,
    timeout: Duration,
}

impl SqlMigrationRunner {
    pub fn new(dir: PathBuf, timeout: Duration) -> Self {
        Self { dir, timeout }
    }
}

impl MigrationRunner for SqlMigrationRunner {
    fn apply(&self, store: &ConnectionInfo) -> Result<usize> {
        let migrations = load_migrations(&self.dir)?;
        tracing::info!(
            store = %store.describe(),
            available = migrations.len(),
            "applying migrations"
        );
        let mut schema: Box<dyn SchemaStore> = match store {
            ConnectionInfo::Postgres {
                host,
                port,
                user,
                password,
                database,
            } => Box::new(PostgresStore::connect(
                host,
                *port,
                user,
                password.expose(),
                database,
                self.timeout,
            )?),
            ConnectionInfo::Sqlite { path } => Box::new(SqliteStore::open(path)?),
        };
        apply_pending(schema.as_mut(), &migrations)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
