//! The seam between the exploration algorithms and the system they explore.
//!
//! Checkers only talk to a [`Session`]: the checked process behind a
//! [`ModelChecker`](stepwise_mc::ModelChecker) in production
//! ([`RemoteSession`](crate::remote_session::RemoteSession)), or a small
//! in-process model in tests.

use std::fmt;

use serde::{Deserialize, Serialize};
use stepwise_mc::{CommInfo, McError, Simcall, SnapshotConfig};

use crate::config::CheckerConfig;

/// One step of the exploration: run the pending simcall of `pid`, with
/// `argument` selecting among its outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub pid: u64,
    pub argument: i32,
}

impl Transition {
    pub fn new(pid: u64, argument: i32) -> Self {
        Self { pid, argument }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument == 0 {
            write!(f, "{}", self.pid)
        } else {
            write!(f, "{}/{}", self.pid, self.argument)
        }
    }
}

/// A live actor and the simcall it is blocked on.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorInfo {
    pub pid: u64,
    pub name: String,
    pub host: String,
    pub simcall: Simcall,
}

/// A system the checkers can step, snapshot and compare.
pub trait Session {
    type Snapshot;

    /// Run the system to its first decision point and remember that point
    /// as the initial state.
    fn initialize(&mut self) -> Result<(), McError>;

    /// Live actors in pid order.
    fn actors(&mut self) -> Result<Vec<ActorInfo>, McError>;

    fn actor_is_enabled(&mut self, pid: u64) -> Result<bool, McError>;

    /// Execute one transition, stopping right after it.
    fn handle_simcall(&mut self, transition: Transition) -> Result<(), McError>;

    /// Let every actor run to its next decision point.
    fn wait_for_requests(&mut self) -> Result<(), McError>;

    /// [`handle_simcall`](Self::handle_simcall) then
    /// [`wait_for_requests`](Self::wait_for_requests).
    fn execute(&mut self, transition: Transition) -> Result<(), McError> {
        self.handle_simcall(transition)?;
        self.wait_for_requests()
    }

    /// Some actor is blocked and none can run.
    fn check_deadlock(&mut self) -> Result<bool, McError>;

    fn take_snapshot(&mut self, num: u64) -> Result<Self::Snapshot, McError>;

    fn restore_snapshot(&mut self, snapshot: &Self::Snapshot) -> Result<(), McError>;

    fn restore_initial_state(&mut self) -> Result<(), McError>;

    fn snapshot_equal(&self, s1: &Self::Snapshot, s2: &Self::Snapshot) -> bool;

    /// Sort key of visited states: actor count and heap bytes in use.
    fn snapshot_key(&self, snapshot: &Self::Snapshot) -> (usize, u64);

    /// Names of the propositions the system registered.
    fn proposition_names(&self) -> Vec<String>;

    fn proposition_value(&mut self, name: &str) -> Result<bool, McError>;

    /// Outcome of the simcall `pid` executed last, if the actor still
    /// exists: the comm created by an isend/irecv.
    fn last_result(&mut self, pid: u64) -> Result<Option<u64>, McError>;

    fn read_comm(&mut self, address: u64) -> Result<CommInfo, McError>;

    fn read_bytes(&mut self, address: u64, size: u64) -> Result<Vec<u8>, McError>;
}

/// What snapshots must hold for a given exploration.
pub fn snapshot_config(config: &CheckerConfig) -> SnapshotConfig {
    SnapshotConfig {
        sparse_checkpoint: config.sparse_checkpoint,
        capture_stacks: config.max_visited_states > 0
            || config.property_file.is_some()
            || config.termination,
        hash: config.hash,
        snapshot_fds: config.snapshot_fds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_display_omits_zero_argument() {
        assert_eq!(Transition::new(3, 0).to_string(), "3");
        assert_eq!(Transition::new(2, 1).to_string(), "2/1");
        assert_eq!(Transition::new(2, -1).to_string(), "2/-1");
    }

    #[test]
    fn stacks_are_captured_only_when_states_are_compared() {
        let config = CheckerConfig::default();
        assert!(!snapshot_config(&config).capture_stacks);

        let visited = CheckerConfig {
            max_visited_states: 10,
            ..CheckerConfig::default()
        };
        assert!(snapshot_config(&visited).capture_stacks);

        let termination = CheckerConfig {
            termination: true,
            hash: true,
            ..CheckerConfig::default()
        };
        let snapshot = snapshot_config(&termination);
        assert!(snapshot.capture_stacks);
        assert!(snapshot.hash);
    }
}
