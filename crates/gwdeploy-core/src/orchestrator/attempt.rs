//! Deployment attempt data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeployError;
use crate::types::{DeployState, Outcome, VersionTag};

// ---------------------------------------------------------------------------
// StepFailure
// ---------------------------------------------------------------------------

/// A step error tagged with the state the machine was in when it failed.
/// Whether to roll back depends only on `stage`.
#[derive(Debug)]
pub struct StepFailure {
    pub stage: DeployState,
    pub error: DeployError,
}

impl StepFailure {
    pub fn new(stage: DeployState, error: DeployError) -> Self {
        Self { stage, error }
    }

    pub fn needs_rollback(&self) -> bool {
        self.stage.failure_needs_rollback()
    }
}

// ---------------------------------------------------------------------------
// DeploymentAttempt
// ---------------------------------------------------------------------------

/// One call to `deploy()`. The outcome is written exactly once; after that
/// the attempt is a read-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentAttempt {
    pub id: Uuid,
    pub target: VersionTag,
    /// Version running before anything was changed. `None` on a first deploy.
    pub previous: Option<VersionTag>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    outcome: Option<Outcome>,
    /// Stage the machine was in when the originating failure happened.
    pub failed_stage: Option<DeployState>,
    pub error: Option<String>,
    pub secrets_version: Option<String>,
    #[serde(default)]
    pub migrations_applied: usize,
    #[serde(default)]
    pub health_probes: u32,
}

impl DeploymentAttempt {
    pub fn new(id: Uuid, target: VersionTag) -> Self {
        Self {
            id,
            target,
            previous: None,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            failed_stage: None,
            error: None,
            secrets_version: None,
            migrations_applied: 0,
            health_probes: 0,
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    /// Set the terminal outcome. Returns `false` and changes nothing if the
    /// outcome was already set.
    pub fn finish(&mut self, outcome: Outcome, failure: Option<(DeployState, String)>) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        if let Some((stage, error)) = failure {
            self.failed_stage = Some(stage);
            self.error = Some(error);
        }
        true
    }

    pub fn duration_secs(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_seconds())
    }
}

// ---------------------------------------------------------------------------
// DeploymentReport
// ---------------------------------------------------------------------------

/// What `deploy()` returns: the finished attempt, the originating error
/// (or `RollbackFailed` wrapping it) and the state the machine ended in.
#[derive(Debug)]
pub struct DeploymentReport {
    pub attempt: DeploymentAttempt,
    pub error: Option<DeployError>,
    pub final_state: DeployState,
}

impl DeploymentReport {
    pub fn outcome(&self) -> Outcome {
        self.attempt.outcome().unwrap_or(Outcome::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == Outcome::Success
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> DeploymentAttempt {
        DeploymentAttempt::new(Uuid::new_v4(), VersionTag::parse("3.6.1").unwrap())
    }

    #[test]
    fn outcome_is_set_once() {
        let mut a = attempt();
        assert!(!a.is_finished());
        assert!(a.finish(
            Outcome::RolledBack,
            Some((DeployState::RuntimeRestarted, "health".into()))
        ));
        assert!(!a.finish(Outcome::Success, None));
        assert_eq!(a.outcome(), Some(Outcome::RolledBack));
        assert_eq!(a.failed_stage, Some(DeployState::RuntimeRestarted));
        assert!(a.finished_at.is_some());
    }

    #[test]
    fn rollback_decision_follows_stage() {
        let cases = [
            (DeployState::Idle, false),
            (DeployState::SecretsFetched, false),
            (DeployState::MigrationsApplied, true),
            (DeployState::RuntimeRestarted, true),
        ];
        for (stage, expected) in cases {
            let f = StepFailure::new(stage, DeployError::Cancelled);
            assert_eq!(f.needs_rollback(), expected, "stage {stage}");
        }
    }

    #[test]
    fn attempt_json_round_trips_outcome() {
        let mut a = attempt();
        a.finish(Outcome::Success, None);
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"outcome\":\"success\""));
        let back: DeploymentAttempt = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
