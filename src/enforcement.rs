//! Enforcement monitor (C6): turn-ordering and timeout detection.
//!
//! The monitor performs no network I/O and holds no mutable reference into
//! the engine's state; it observes a snapshot view and returns evidence for
//! the core to apply. This keeps the monitor safe to drive from a
//! cooperative timer task without ever sharing `&mut` state across an
//! await point (see spec.md §5 and §9's "background monitor thread" design
//! note).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::evidence::{CheatEvidence, CheatKind};

/// A local action awaiting the counterparty's response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Opaque identifier the application assigned to this action.
    pub id: String,
    /// Application-declared action type.
    pub action_type: String,
    /// Action payload.
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch when the action started.
    pub started_at: u64,
    /// Deadline, in milliseconds, after which a non-response is a stall.
    pub timeout_ms: u64,
}

/// A read-only view of the protocol state the monitor needs to detect
/// violations. Constructed fresh by the engine on each tick; never aliases
/// engine-owned mutable state.
#[derive(Debug, Clone)]
pub struct MonitorView<'a> {
    /// The peer's `participant_id`, who would be accused of a stall.
    pub peer_id: &'a str,
    /// The action the peer owes a response to, if any.
    pub pending_action: Option<&'a PendingAction>,
    /// Current wall-clock time in milliseconds.
    pub now: u64,
}

/// Cooperative turn/timeout monitor.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    allowed_actions: Option<HashSet<String>>,
}

impl Monitor {
    /// Construct a monitor with no action-type allowlist configured (all
    /// action types accepted until one is set).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict accepted peer action types to `actions`.
    pub fn set_allowed_actions(&mut self, actions: HashSet<String>) {
        self.allowed_actions = Some(actions);
    }

    /// Returns `Some(evidence)` if `action_type` is outside the configured
    /// allowlist (no-op, returns `None`, if no allowlist was configured).
    #[must_use]
    pub fn check_action_allowed(
        &self,
        accused: &str,
        action_type: &str,
        at: u64,
    ) -> Option<CheatEvidence> {
        let allowed = self.allowed_actions.as_ref()?;
        if allowed.contains(action_type) {
            None
        } else {
            warn!(accused, action_type, "action type outside allowlist");
            Some(CheatEvidence::new(
                CheatKind::InvalidMove,
                accused,
                serde_json::json!({ "action_type": action_type }),
                at,
            ))
        }
    }

    /// One monitor tick: inspect `view` and return evidence if the peer has
    /// let a pending action exceed its deadline.
    #[must_use]
    pub fn tick(&self, view: &MonitorView<'_>) -> Option<CheatEvidence> {
        let pending = view.pending_action?;
        if view.now.saturating_sub(pending.started_at) > pending.timeout_ms {
            warn!(peer = view.peer_id, action = %pending.id, "timeout stall detected");
            Some(CheatEvidence::new(
                CheatKind::TimeoutStall,
                view.peer_id,
                pending,
                view.now,
            ))
        } else {
            None
        }
    }
}
