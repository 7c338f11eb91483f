//! Host ledger: the deployment lease and the attempt audit log, in one redb
//! file under `.gwdeploy/`.
//!
//! # Table design
//!
//! `LEASE` holds at most one row under the key `"host"`. `ATTEMPTS` uses a
//! 24-byte composite key:
//! ```text
//! [ started_at_ms: u64 big-endian (8 bytes) | attempt uuid: 16 bytes ]
//! ```
//! so iteration order is start-time order.
//!
//! redb takes an exclusive file lock while a `Database` is open. Callers keep
//! the ledger open only around lease and audit operations, never for the
//! length of a deployment, so a concurrent run can still open it and see
//! the lease. A [`LeaseHeartbeat`] keeps the lease alive while the
//! deployment runs.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, DatabaseError, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attempt::DeploymentAttempt;
use crate::error::{DeployError, Result};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const LEASE: TableDefinition<&str, &[u8]> = TableDefinition::new("lease");
const ATTEMPTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("attempts");

const LEASE_KEY: &str = "host";

const OPEN_RETRIES: u32 = 50;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);

fn ledger_err(e: impl std::fmt::Display) -> DeployError {
    DeployError::Ledger(e.to_string())
}

fn attempt_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Lease
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: Uuid,
    pub pid: u32,
    pub target: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// HostLedger
// ---------------------------------------------------------------------------

pub struct HostLedger {
    db: Database,
}

impl HostLedger {
    /// Open or create the ledger at `path`, waiting briefly if another
    /// process has it open.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::io::ensure_dir(parent)?;
        }
        let mut attempts = 0;
        let db = loop {
            match Database::create(path) {
                Ok(db) => break db,
                Err(DatabaseError::DatabaseAlreadyOpen) if attempts < OPEN_RETRIES => {
                    attempts += 1;
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(e) => return Err(ledger_err(e)),
            }
        };

        let wt = db.begin_write().map_err(ledger_err)?;
        wt.open_table(LEASE).map_err(ledger_err)?;
        wt.open_table(ATTEMPTS).map_err(ledger_err)?;
        wt.commit().map_err(ledger_err)?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Lease
    // -----------------------------------------------------------------------

    /// Take the host lease for `holder`. Fails with `DeployInProgress` while
    /// another holder's lease is live; an expired lease is taken over.
    pub fn acquire(
        &self,
        holder: Uuid,
        target: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Lease> {
        let ttl = chrono::Duration::from_std(ttl).map_err(ledger_err)?;
        let lease = Lease {
            holder,
            pid: std::process::id(),
            target: target.to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        let value = serde_json::to_vec(&lease)?;

        let wt = self.db.begin_write().map_err(ledger_err)?;
        let conflict = {
            let mut table = wt.open_table(LEASE).map_err(ledger_err)?;
            let existing = match table.get(LEASE_KEY).map_err(ledger_err)? {
                Some(v) => Some(serde_json::from_slice::<Lease>(v.value())?),
                None => None,
            };
            match existing {
                Some(current) if current.holder != holder && !current.is_expired(now) => {
                    Some(current)
                }
                existing => {
                    if let Some(stale) = existing.filter(|l| l.holder != holder) {
                        tracing::warn!(
                            stale_holder = %stale.holder,
                            pid = stale.pid,
                            expired_at = %stale.expires_at,
                            "taking over expired deployment lease"
                        );
                    }
                    table
                        .insert(LEASE_KEY, value.as_slice())
                        .map_err(ledger_err)?;
                    None
                }
            }
        };
        if let Some(current) = conflict {
            wt.abort().map_err(ledger_err)?;
            return Err(DeployError::DeployInProgress {
                holder: current.holder.to_string(),
                expires_at: current.expires_at.to_rfc3339(),
            });
        }
        wt.commit().map_err(ledger_err)?;
        tracing::debug!(%holder, expires_at = %lease.expires_at, "lease acquired");
        Ok(lease)
    }

    /// Drop the lease if `holder` still owns it. Returns whether it did.
    pub fn release(&self, holder: Uuid) -> Result<bool> {
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let released = {
            let mut table = wt.open_table(LEASE).map_err(ledger_err)?;
            let owned = match table.get(LEASE_KEY).map_err(ledger_err)? {
                Some(v) => serde_json::from_slice::<Lease>(v.value())?.holder == holder,
                None => false,
            };
            if owned {
                table.remove(LEASE_KEY).map_err(ledger_err)?;
            }
            owned
        };
        wt.commit().map_err(ledger_err)?;
        Ok(released)
    }

    /// Push the expiry of `holder`'s lease to `now + ttl`. Returns false,
    /// changing nothing, when `holder` no longer owns the lease.
    pub fn renew(&self, holder: Uuid, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
        let ttl = chrono::Duration::from_std(ttl).map_err(ledger_err)?;
        let wt = self.db.begin_write().map_err(ledger_err)?;
        let renewed = {
            let mut table = wt.open_table(LEASE).map_err(ledger_err)?;
            let current = match table.get(LEASE_KEY).map_err(ledger_err)? {
                Some(v) => Some(serde_json::from_slice::<Lease>(v.value())?),
                None => None,
            };
            match current {
                Some(mut lease) if lease.holder == holder => {
                    lease.expires_at = now + ttl;
                    let value = serde_json::to_vec(&lease)?;
                    table
                        .insert(LEASE_KEY, value.as_slice())
                        .map_err(ledger_err)?;
                    true
                }
                _ => false,
            }
        };
        wt.commit().map_err(ledger_err)?;
        Ok(renewed)
    }

    pub fn current_lease(&self) -> Result<Option<Lease>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(LEASE).map_err(ledger_err)?;
        match table.get(LEASE_KEY).map_err(ledger_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub fn record(&self, attempt: &DeploymentAttempt) -> Result<()> {
        let key = attempt_key(attempt.started_at, attempt.id);
        let value = serde_json::to_vec(attempt)?;
        let wt = self.db.begin_write().map_err(ledger_err)?;
        {
            let mut table = wt.open_table(ATTEMPTS).map_err(ledger_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(ledger_err)?;
        }
        wt.commit().map_err(ledger_err)?;
        Ok(())
    }

    /// Attempts newest first, at most `limit`.
    pub fn history(&self, limit: usize) -> Result<Vec<DeploymentAttempt>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(ledger_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(ledger_err)?.rev() {
            if result.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(ledger_err)?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    /// Most recent successful attempt, if any.
    pub fn last_success(&self) -> Result<Option<DeploymentAttempt>> {
        let rt = self.db.begin_read().map_err(ledger_err)?;
        let table = rt.open_table(ATTEMPTS).map_err(ledger_err)?;
        for entry in table.iter().map_err(ledger_err)?.rev() {
            let (_, v) = entry.map_err(ledger_err)?;
            let attempt: DeploymentAttempt = serde_json::from_slice(v.value())?;
            if attempt.outcome() == Some(crate::types::Outcome::Success) {
                return Ok(Some(attempt));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// LeaseHeartbeat
// ---------------------------------------------------------------------------

/// Background thread renewing a held lease every third of its TTL, so the
/// lease outlives a deployment that runs past the TTL.
///
/// The ledger is opened only for each renewal. The thread exits on
/// [`LeaseHeartbeat::stop`], on drop, or once the lease is found to belong
/// to someone else.
pub struct LeaseHeartbeat {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LeaseHeartbeat {
    pub fn start(path: &Path, holder: Uuid, ttl: Duration) -> Self {
        let path: PathBuf = path.to_path_buf();
        let every = (ttl / 3).max(MIN_RENEW_INTERVAL);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match rx.recv_timeout(every) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            match HostLedger::open(&path).and_then(|l| l.renew(holder, ttl, Utc::now())) {
                Ok(true) => tracing::debug!(%holder, "lease renewed"),
                Ok(false) => {
                    tracing::error!(%holder, "deployment lease lost to another holder");
                    break;
                }
                Err(e) => tracing::warn!(%holder, error = %e, "lease renewal failed"),
            }
        });
        Self {
            stop: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stop renewing and wait for the thread to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("lease heartbeat thread panicked");
            }
        }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Outcome, VersionTag};
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, HostLedger) {
        let dir = TempDir::new().unwrap();
        let ledger = HostLedger::open(&dir.path().join(".gwdeploy/ledger.redb")).unwrap();
        (dir, ledger)
    }

    const TTL: Duration = Duration::from_secs(600);

    #[test]
    fn second_holder_is_rejected_while_lease_is_live() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        let first = Uuid::new_v4();
        ledger.acquire(first, "3.6.1", TTL, now).unwrap();

        let err = ledger
            .acquire(Uuid::new_v4(), "3.7.0", TTL, now + CDur::seconds(5))
            .unwrap_err();
        match err {
            DeployError::DeployInProgress { holder, .. } => assert_eq!(holder, first.to_string()),
            other => panic!("expected DeployInProgress, got {other:?}"),
        }
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        ledger.acquire(Uuid::new_v4(), "3.6.1", TTL, now).unwrap();

        let later = now + CDur::seconds(601);
        let second = Uuid::new_v4();
        let lease = ledger.acquire(second, "3.7.0", TTL, later).unwrap();
        assert_eq!(lease.holder, second);
        assert_eq!(ledger.current_lease().unwrap().unwrap().holder, second);
    }

    #[test]
    fn release_only_by_holder() {
        let (_dir, ledger) = open_tmp();
        let holder = Uuid::new_v4();
        ledger.acquire(holder, "3.6.1", TTL, Utc::now()).unwrap();

        assert!(!ledger.release(Uuid::new_v4()).unwrap());
        assert!(ledger.current_lease().unwrap().is_some());
        assert!(ledger.release(holder).unwrap());
        assert!(ledger.current_lease().unwrap().is_none());
        // Released lease can be taken immediately.
        ledger
            .acquire(Uuid::new_v4(), "3.7.0", TTL, Utc::now())
            .unwrap();
    }

    #[test]
    fn lease_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        let holder = Uuid::new_v4();
        {
            let ledger = HostLedger::open(&path).unwrap();
            ledger.acquire(holder, "3.6.1", TTL, Utc::now()).unwrap();
        }
        let ledger = HostLedger::open(&path).unwrap();
        assert!(matches!(
            ledger.acquire(Uuid::new_v4(), "3.6.2", TTL, Utc::now()),
            Err(DeployError::DeployInProgress { .. })
        ));
    }

    #[test]
    fn renew_extends_only_the_holders_lease() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        let holder = Uuid::new_v4();
        ledger.acquire(holder, "3.6.1", TTL, now).unwrap();

        let later = now + CDur::seconds(500);
        assert!(ledger.renew(holder, TTL, later).unwrap());
        let lease = ledger.current_lease().unwrap().unwrap();
        assert_eq!(lease.expires_at, later + CDur::seconds(600));
        assert_eq!(lease.acquired_at, now);

        assert!(!ledger.renew(Uuid::new_v4(), TTL, later).unwrap());
        assert_eq!(ledger.current_lease().unwrap().unwrap().holder, holder);

        ledger.release(holder).unwrap();
        assert!(!ledger.renew(holder, TTL, later).unwrap());
        assert!(ledger.current_lease().unwrap().is_none());
    }

    #[test]
    fn heartbeat_keeps_lease_live_past_its_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        let holder = Uuid::new_v4();
        let ttl = Duration::from_millis(300);
        HostLedger::open(&path)
            .unwrap()
            .acquire(holder, "3.6.1", ttl, Utc::now())
            .unwrap();

        let heartbeat = LeaseHeartbeat::start(&path, holder, ttl);
        std::thread::sleep(Duration::from_millis(900));
        let err = HostLedger::open(&path)
            .unwrap()
            .acquire(Uuid::new_v4(), "3.7.0", ttl, Utc::now())
            .unwrap_err();
        assert!(matches!(err, DeployError::DeployInProgress { .. }));
        heartbeat.stop();

        // Without renewals the lease lapses.
        std::thread::sleep(Duration::from_millis(400));
        HostLedger::open(&path)
            .unwrap()
            .acquire(Uuid::new_v4(), "3.7.0", ttl, Utc::now())
            .unwrap();
    }

    #[test]
    fn heartbeat_never_creates_a_lease() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.redb");
        let holder = Uuid::new_v4();
        let ttl = Duration::from_millis(150);
        let heartbeat = LeaseHeartbeat::start(&path, holder, ttl);

        // Never acquired by `holder`, so the first renewal finds nothing.
        std::thread::sleep(Duration::from_millis(200));
        assert!(HostLedger::open(&path).unwrap().current_lease().unwrap().is_none());
        heartbeat.stop();
    }

    fn finished(tag: &str, started: DateTime<Utc>, outcome: Outcome) -> DeploymentAttempt {
        let mut a = DeploymentAttempt::new(Uuid::new_v4(), VersionTag::parse(tag).unwrap());
        a.started_at = started;
        a.finish(outcome, None);
        a
    }

    #[test]
    fn history_is_newest_first_and_limited() {
        let (_dir, ledger) = open_tmp();
        let now = Utc::now();
        // Recorded out of order on purpose.
        ledger
            .record(&finished("v2", now - CDur::minutes(1), Outcome::RolledBack))
            .unwrap();
        ledger
            .record(&finished("v1", now - CDur::minutes(5), Outcome::Success))
            .unwrap();
        ledger
            .record(&finished("v3", now, Outcome::Failed))
            .unwrap();

        let all = ledger.history(10).unwrap();
        let tags: Vec<&str> = all.iter().map(|a| a.target.as_str()).collect();
        assert_eq!(tags, vec!["v3", "v2", "v1"]);

        assert_eq!(ledger.history(2).unwrap().len(), 2);
        assert_eq!(
            ledger.last_success().unwrap().unwrap().target.as_str(),
            "v1"
        );
    }

    #[test]
    fn empty_ledger() {
        let (_dir, ledger) = open_tmp();
        assert!(ledger.history(10).unwrap().is_empty());
        assert!(ledger.last_success().unwrap().is_none());
        assert!(ledger.current_lease().unwrap().is_none());
    }
}
