use std::future::Future;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tokio::runtime::Runtime;

use super::{Migration, SchemaStore, RECORD_TABLE};
use crate::error::{DeployError, Result};

/// Advisory lock key shared by every gwdeploy runner ("gwdeploy" in ASCII).
const LOCK_KEY: i64 = 0x6777_6465_706c_6f79;

/// Migration record kept in the gateway's Postgres database.
///
/// The rest of the crate is synchronous; sqlx calls are driven on a private
/// current-thread runtime and every call is bounded by the step timeout.
pub struct PostgresStore {
    rt: Runtime,
    conn: PgConnection,
    timeout: Duration,
}

fn store_err(e: sqlx::Error) -> DeployError {
    DeployError::MigrationStore(e.to_string())
}

fn bounded<T, F>(rt: &Runtime, timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    rt.block_on(async {
        tokio::time::timeout(timeout, fut).await.map_err(|_| {
            DeployError::MigrationStore(format!("{what} timed out after {}s", timeout.as_secs()))
        })?
    })
}

impl PostgresStore {
    pub fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(user)
            .password(password)
            .database(database);

        let mut conn = bounded(&rt, timeout, "connect", async {
            PgConnection::connect_with(&options).await.map_err(store_err)
        })?;
        bounded(&rt, timeout, "create record table", async {
            sqlx::query(&format!(
                "CREATE TABLE IF NOT EXISTS {RECORD_TABLE} (
                    seq        BIGSERIAL PRIMARY KEY,
                    id         TEXT NOT NULL UNIQUE,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )"
            ))
            .execute(&mut conn)
            .await
            .map_err(store_err)
        })?;
        Ok(Self { rt, conn, timeout })
    }
}

impl SchemaStore for PostgresStore {
    fn lock(&mut self) -> Result<()> {
        let Self { rt, conn, timeout } = self;
        bounded(rt, *timeout, "acquire migration lock", async {
            sqlx::query("SELECT pg_advisory_lock($1)")
                .bind(LOCK_KEY)
                .execute(&mut *conn)
                .await
                .map_err(store_err)
        })?;
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        let Self { rt, conn, timeout } = self;
        bounded(rt, *timeout, "release migration lock", async {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(LOCK_KEY)
                .execute(&mut *conn)
                .await
                .map_err(store_err)
        })?;
        Ok(())
    }

    fn applied(&mut self) -> Result<Vec<String>> {
        let Self { rt, conn, timeout } = self;
        bounded(rt, *timeout, "read migration record", async {
            sqlx::query_scalar::<_, String>(&format!(
                "SELECT id FROM {RECORD_TABLE} ORDER BY seq"
            ))
            .fetch_all(&mut *conn)
            .await
            .map_err(store_err)
        })
    }

    fn apply(&mut self, migration: &Migration) -> Result<bool> {
        let Self { rt, conn, timeout } = self;
        bounded(rt, *timeout, &format!("migration '{}'", migration.id), async {
            let mut tx = conn.begin().await.map_err(store_err)?;

            let recorded: Option<i32> = sqlx::query_scalar(&format!(
                "SELECT 1 FROM {RECORD_TABLE} WHERE id = $1"
            ))
            .bind(&migration.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
            if recorded.is_some() {
                tx.commit().await.map_err(store_err)?;
                return Ok(false);
            }

            sqlx::raw_sql(&migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| DeployError::Migration {
                    id: migration.id.clone(),
                    reason: e.to_string(),
                })?;
            sqlx::query(&format!("INSERT INTO {RECORD_TABLE} (id) VALUES ($1)"))
                .bind(&migration.id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            tx.commit().await.map_err(store_err)?;
            Ok(true)
        })
    }
}
