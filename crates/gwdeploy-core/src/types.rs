use crate::error::DeployError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// VersionTag
// ---------------------------------------------------------------------------

static TAG_RE: OnceLock<Regex> = OnceLock::new();

fn tag_re() -> &'static Regex {
    TAG_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]{0,127}$").unwrap())
}

/// A container image tag identifying one version of the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionTag(String);

impl VersionTag {
    pub fn parse(s: &str) -> Result<Self, DeployError> {
        if !tag_re().is_match(s) {
            return Err(DeployError::InvalidVersionTag(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for VersionTag {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionTag::parse(s)
    }
}

impl TryFrom<String> for VersionTag {
    type Error = DeployError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        VersionTag::parse(&s)
    }
}

impl From<VersionTag> for String {
    fn from(tag: VersionTag) -> Self {
        tag.0
    }
}

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub repository: String,
    pub tag: VersionTag,
}

impl ImageRef {
    pub fn new(repository: impl Into<String>, tag: VersionTag) -> Self {
        Self {
            repository: repository.into(),
            tag,
        }
    }

    /// Parse `repo[:port]/name[:tag][@digest]`. A reference without a tag
    /// means `latest`, as it does for docker. Returns `None` for digest-only
    /// references, since no tag can be recovered from them.
    pub fn parse(reference: &str) -> Option<Self> {
        let reference = reference.trim();
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (reference, None),
        };
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], &name[last_slash + i + 1..]),
            None if digest.is_some() => return None,
            None => (name, DEFAULT_TAG),
        };
        if repository.is_empty() {
            return None;
        }
        Some(Self::new(repository, VersionTag::parse(tag).ok()?))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

// ---------------------------------------------------------------------------
// DeployState
// ---------------------------------------------------------------------------

/// Position of the deployment state machine.
///
/// Happy path: `Idle → SecretsFetched → MigrationsApplied → RuntimeRestarted →
/// HealthVerified`. Failures exit to `RollingBack → RolledBack`, or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployState {
    Idle,
    SecretsFetched,
    MigrationsApplied,
    RuntimeRestarted,
    HealthVerified,
    RollingBack,
    RolledBack,
    Failed,
}

impl DeployState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeployState::Idle => "idle",
            DeployState::SecretsFetched => "secrets_fetched",
            DeployState::MigrationsApplied => "migrations_applied",
            DeployState::RuntimeRestarted => "runtime_restarted",
            DeployState::HealthVerified => "health_verified",
            DeployState::RollingBack => "rolling_back",
            DeployState::RolledBack => "rolled_back",
            DeployState::Failed => "failed",
        }
    }

    /// Whether a step failing while the machine sits in this state has
    /// touched the runtime and therefore must be rolled back.
    pub fn failure_needs_rollback(self) -> bool {
        matches!(
            self,
            DeployState::MigrationsApplied | DeployState::RuntimeRestarted
        )
    }
}

impl fmt::Display for DeployState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// The new version was abandoned and the previous one restored.
    RolledBack,
    /// Manual intervention required.
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RolledBack => "rolled_back",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// HealthStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_tags() {
        for tag in ["3.6", "v2", "latest", "3.6.1-ubuntu", "build_42"] {
            VersionTag::parse(tag).unwrap_or_else(|_| panic!("expected valid: {tag}"));
        }
    }

    #[test]
    fn invalid_tags() {
        for tag in ["", "-v1", ".hidden", "has space", "a/b", "x:y"] {
            assert!(VersionTag::parse(tag).is_err(), "expected invalid: {tag}");
        }
    }

    #[test]
    fn image_ref_with_registry_port() {
        let r = ImageRef::parse("registry.local:5000/kong/kong-gateway:3.6.1").unwrap();
        assert_eq!(r.repository, "registry.local:5000/kong/kong-gateway");
        assert_eq!(r.tag.as_str(), "3.6.1");
    }

    #[test]
    fn image_ref_without_tag_is_latest() {
        let r = ImageRef::parse("registry.local:5000/kong").unwrap();
        assert_eq!(r.repository, "registry.local:5000/kong");
        assert_eq!(r.tag.as_str(), "latest");
        assert_eq!(ImageRef::parse("kong").unwrap().to_string(), "kong:latest");
    }

    #[test]
    fn image_ref_digest() {
        let r = ImageRef::parse("kong:3.6.1@sha256:abcdef").unwrap();
        assert_eq!(r.tag.as_str(), "3.6.1");
        assert!(ImageRef::parse("kong@sha256:abcdef").is_none());
        assert!(ImageRef::parse("").is_none());
        assert!(ImageRef::parse(":3.6").is_none());
    }

    #[test]
    fn rollback_classification_depends_only_on_state() {
        assert!(!DeployState::Idle.failure_needs_rollback());
        assert!(!DeployState::SecretsFetched.failure_needs_rollback());
        assert!(DeployState::MigrationsApplied.failure_needs_rollback());
        assert!(DeployState::RuntimeRestarted.failure_needs_rollback());
    }

    #[test]
    fn version_tag_deserialize_validates() {
        let ok: VersionTag = serde_yaml::from_str("\"3.6\"").unwrap();
        assert_eq!(ok.as_str(), "3.6");
        assert!(serde_yaml::from_str::<VersionTag>("\"bad tag\"").is_err());
    }
}
