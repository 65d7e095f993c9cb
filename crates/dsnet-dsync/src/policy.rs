//! Accept/reject policy for incoming pushes.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::messages::{PushRequest, RejectReason};

/// Policy a receiving node applies to pushes.
///
/// Passed explicitly to [`RemoteSessionCoordinator::new`]; there is no
/// process-wide policy.
///
/// [`RemoteSessionCoordinator::new`]: crate::RemoteSessionCoordinator::new
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Accept pushes at all.
    pub enabled: bool,
    /// Skip the size and allow-list checks. Does not bypass `enabled` or
    /// `max_sessions`.
    pub always_accept: bool,
    /// Largest manifest total size accepted, in bytes.
    pub max_payload_bytes: Option<u64>,
    /// Owners (`username`) or datasets (`username/name`) allowed to push.
    /// `None` allows everyone.
    pub allow_list: Option<Vec<String>>,
    /// Allow remote head removal.
    pub allow_removes: bool,
    /// Lifetime of an unfinished session (ms).
    pub session_timeout_ms: u64,
    /// How long a completed session is kept for retried `Complete` calls (ms).
    pub completed_retention_ms: u64,
    /// Concurrent non-terminal sessions.
    pub max_sessions: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            always_accept: false,
            max_payload_bytes: None,
            allow_list: None,
            allow_removes: false,
            session_timeout_ms: 5 * 60 * 1000,
            completed_retention_ms: 60 * 1000,
            max_sessions: 64,
        }
    }
}

impl PolicyConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_millis(self.completed_retention_ms)
    }

    /// Whether `username/name` passes the allow list.
    pub fn allows(&self, username: &str, name: &str) -> bool {
        match &self.allow_list {
            None => true,
            Some(list) => {
                let full = format!("{}/{}", username, name);
                list.iter().any(|entry| entry == username || *entry == full)
            }
        }
    }

    /// Static checks for a push. Session count is checked by the coordinator.
    pub fn check(&self, request: &PushRequest) -> Option<RejectReason> {
        if !self.enabled {
            return Some(RejectReason::Disabled);
        }
        if self.always_accept {
            return None;
        }
        if !self.allows(&request.username, &request.name) {
            return Some(RejectReason::NotAllowed);
        }
        if let Some(limit) = self.max_payload_bytes {
            let size = request.manifest.total_size();
            if size > limit {
                return Some(RejectReason::SizePolicy { size, limit });
            }
        }
        None
    }

    /// Checks for history or a head move on the lineage `username/name`,
    /// using the names this node's log holds rather than what a pusher
    /// claims.
    pub fn check_owner(&self, username: &str, name: &str) -> Option<RejectReason> {
        if !self.enabled {
            return Some(RejectReason::Disabled);
        }
        if !self.always_accept && !self.allows(username, name) {
            return Some(RejectReason::NotAllowed);
        }
        None
    }

    /// Whether a remote head removal for `username/name` is permitted.
    pub fn check_remove(&self, username: &str, name: &str) -> Option<RejectReason> {
        if !self.allow_removes {
            return Some(RejectReason::Disabled);
        }
        if !self.always_accept && !self.allows(username, name) {
            return Some(RejectReason::NotAllowed);
        }
        None
    }
}
