use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// HostId
// ============================================================================

/// Identifier of one provisioned execution target. Every cloud resource
/// created for the host carries this id in its name and tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

/// Azure resource names derived from the id (`<id>-public-ip`) must stay well
/// under the 64/80 char limits.
pub const MAX_HOST_ID_LEN: usize = 32;

impl HostId {
    /// Generate a fresh id of the form `<prefix>-<8 hex>`.
    pub fn generate(prefix: &str) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self::normalize(&format!("{}-{}", prefix, &suffix[..8]))
    }

    /// Lowercase, replace `_` with `-` and truncate to [`MAX_HOST_ID_LEN`].
    pub fn normalize(raw: &str) -> Self {
        let mut id: String = raw
            .trim()
            .to_lowercase()
            .replace('_', "-")
            .chars()
            .take(MAX_HOST_ID_LEN)
            .collect();
        while id.ends_with('-') {
            id.pop();
        }
        Self(id)
    }

    /// Name of a host that already exists in the cloud, kept as given.
    pub fn existing(name: &str) -> Self {
        Self(name.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self::existing(s)
    }
}

// ============================================================================
// Lifecycle state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Requested,
    Creating,
    Ready,
    InUse,
    Destroying,
    Destroyed,
    /// Absorbing failure state. A failed host may still be torn down.
    Failed,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid host transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: HostState,
    pub to: HostState,
}

impl HostState {
    pub const ALL: [HostState; 7] = [
        HostState::Requested,
        HostState::Creating,
        HostState::Ready,
        HostState::InUse,
        HostState::Destroying,
        HostState::Destroyed,
        HostState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, HostState::Destroyed | HostState::Failed)
    }

    pub fn can_transition_to(self, next: HostState) -> bool {
        use HostState::*;
        match (self, next) {
            (Requested, Creating) => true,
            (Creating, Ready) => true,
            (Ready, InUse) | (InUse, Ready) => true,
            (Ready, Destroying) | (InUse, Destroying) => true,
            (Destroying, Destroyed) => true,
            // cleanup attempt on a host whose creation or teardown failed
            (Failed, Destroying) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn readiness(self) -> Readiness {
        match self {
            HostState::Requested | HostState::Creating => Readiness::Provisioning,
            HostState::Ready | HostState::InUse => Readiness::Ready,
            HostState::Failed => Readiness::Unreachable,
            HostState::Destroying | HostState::Destroyed => Readiness::Destroyed,
        }
    }
}

/// Coarse readiness view exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Provisioning,
    Ready,
    Unreachable,
    Destroyed,
}

// ============================================================================
// Host
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    /// Public address, known once the network resources exist.
    pub address: Option<String>,
    pub username: String,
    /// Private key used to reach the host. Never the key material itself.
    pub key_path: PathBuf,
    pub state: HostState,
}

impl Host {
    pub fn new(id: HostId, username: impl Into<String>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            address: None,
            username: username.into(),
            key_path: key_path.into(),
            state: HostState::Requested,
        }
    }

    pub fn readiness(&self) -> Readiness {
        self.state.readiness()
    }

    pub fn transition(&mut self, next: HostState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("Host {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Home directory of the login user on the host.
    pub fn home_dir(&self) -> String {
        if self.username == "root" {
            "/root".to_string()
        } else {
            format!("/home/{}", self.username)
        }
    }
}
