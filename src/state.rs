//! Synchronization lifecycle.
//!
//! ```text
//!   Disconnected --Start--> Connecting --Subscribed--> Syncing
//!   Syncing --SnapshotApplied--> Synced
//!   Syncing | Synced | Resyncing --ConnectionLost / Resync--> Resyncing
//!   Resyncing --Resubscribed--> Syncing
//!   (any) --Stop--> Disconnected
//! ```

use std::fmt;

use serde::Serialize;

use crate::error::{Result, SyncError};

/// Where the book is in its synchronization lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No subscription. The store is empty.
    Disconnected,
    /// Subscription requested, not yet acknowledged.
    Connecting,
    /// Subscribed and waiting for a snapshot; diffs are buffered.
    Syncing,
    /// Snapshot applied; diffs go straight into the store.
    Synced,
    /// Re-establishing a snapshot. Readers still see the last book.
    Resyncing,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Resyncing => "resyncing",
        }
    }

    /// Whether the book reflects the live feed.
    pub fn is_ready(&self) -> bool {
        matches!(self, SyncState::Synced)
    }

    /// Whether a subscription exists or is being established.
    pub fn is_active(&self) -> bool {
        !matches!(self, SyncState::Disconnected)
    }

    /// Whether diffs for the live subscription are accepted (buffered or applied).
    pub fn accepts_updates(&self) -> bool {
        matches!(self, SyncState::Syncing | SyncState::Synced)
    }

    /// The last-known book is still served but no longer tracks the feed.
    pub fn is_stale(&self) -> bool {
        matches!(self, SyncState::Resyncing)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Subscribed,
    SnapshotApplied,
    ConnectionLost,
    Resync,
    Resubscribed,
    Stop,
}

#[derive(Debug)]
pub struct SyncStateMachine {
    state: SyncState,
}

impl SyncStateMachine {
    pub fn new() -> Self {
        Self {
            state: SyncState::Disconnected,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Target state for `transition` from the current state, if legal.
    pub fn target(&self, transition: Transition) -> Option<SyncState> {
        use SyncState::*;
        use Transition::*;

        match (self.state, transition) {
            (_, Stop) => Some(Disconnected),
            (Disconnected, Start) => Some(Connecting),
            (Connecting, Subscribed) => Some(Syncing),
            (Syncing | Synced, SnapshotApplied) => Some(Synced),
            (Syncing | Synced | Resyncing, ConnectionLost | Resync) => Some(Resyncing),
            (Resyncing, Resubscribed) => Some(Syncing),
            _ => None,
        }
    }

    /// Move to the next state, returning it.
    pub fn apply(&mut self, transition: Transition) -> Result<SyncState> {
        let next = self
            .target(transition)
            .ok_or(SyncError::InvalidTransition {
                from: self.state,
                transition,
            })?;
        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, ?transition, "sync state transition");
        }
        self.state = next;
        Ok(next)
    }
}

impl Default for SyncStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_in(path: &[Transition]) -> SyncStateMachine {
        let mut machine = SyncStateMachine::new();
        for t in path {
            machine.apply(*t).unwrap();
        }
        machine
    }

    #[test]
    fn starts_disconnected() {
        assert_eq!(SyncStateMachine::new().state(), SyncState::Disconnected);
    }

    #[test]
    fn happy_path_reaches_synced() {
        let machine = machine_in(&[
            Transition::Start,
            Transition::Subscribed,
            Transition::SnapshotApplied,
        ]);
        assert_eq!(machine.state(), SyncState::Synced);
    }

    #[test]
    fn resync_cycle_returns_to_synced() {
        let mut machine = machine_in(&[
            Transition::Start,
            Transition::Subscribed,
            Transition::SnapshotApplied,
        ]);
        assert_eq!(machine.apply(Transition::ConnectionLost), Ok(SyncState::Resyncing));
        assert_eq!(machine.apply(Transition::Resubscribed), Ok(SyncState::Syncing));
        assert_eq!(machine.apply(Transition::SnapshotApplied), Ok(SyncState::Synced));
    }

    #[test]
    fn stop_is_legal_from_every_state() {
        let paths: &[&[Transition]] = &[
            &[],
            &[Transition::Start],
            &[Transition::Start, Transition::Subscribed],
            &[Transition::Start, Transition::Subscribed, Transition::SnapshotApplied],
            &[
                Transition::Start,
                Transition::Subscribed,
                Transition::SnapshotApplied,
                Transition::Resync,
            ],
        ];
        for path in paths {
            let mut machine = machine_in(path);
            assert_eq!(machine.apply(Transition::Stop), Ok(SyncState::Disconnected));
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut machine = SyncStateMachine::new();
        assert_eq!(
            machine.apply(Transition::SnapshotApplied),
            Err(SyncError::InvalidTransition {
                from: SyncState::Disconnected,
                transition: Transition::SnapshotApplied,
            })
        );
        assert_eq!(machine.state(), SyncState::Disconnected);

        let mut machine = machine_in(&[Transition::Start]);
        assert!(machine.apply(Transition::Resync).is_err());
        assert!(machine.apply(Transition::Start).is_err());
        assert_eq!(machine.state(), SyncState::Connecting);
    }

    #[test]
    fn state_predicates() {
        assert!(!SyncState::Disconnected.accepts_updates());
        assert!(!SyncState::Connecting.accepts_updates());
        assert!(SyncState::Syncing.accepts_updates());
        assert!(SyncState::Synced.accepts_updates());
        assert!(!SyncState::Resyncing.accepts_updates());

        assert!(SyncState::Synced.is_ready());
        assert!(SyncState::Resyncing.is_stale());
        assert!(!SyncState::Disconnected.is_active());
        assert!(SyncState::Connecting.is_active());
    }
}
