//! [`Session`] over a checked process driven by a [`ModelChecker`].

use std::ffi::OsStr;

use log::debug;
use stepwise_mc::{
    launch, snapshot_equal, CommInfo, McError, ModelChecker, Simcall, Snapshot, SnapshotConfig,
};

use crate::config::CheckerConfig;
use crate::session::{snapshot_config, ActorInfo, Session, Transition};

pub struct RemoteSession {
    checker: ModelChecker,
    snapshot_config: SnapshotConfig,
    /// State right after the first `wait_for_requests`.
    initial: Option<Snapshot>,
}

impl RemoteSession {
    pub fn new(checker: ModelChecker, config: &CheckerConfig) -> Self {
        Self {
            checker,
            snapshot_config: snapshot_config(config),
            initial: None,
        }
    }

    /// Start `program` under the checker.
    pub fn launch<A: AsRef<OsStr>>(
        program: &str,
        args: &[A],
        config: &CheckerConfig,
    ) -> Result<Self, McError> {
        Ok(Self::new(launch(program, args)?, config))
    }

    pub fn checker(&self) -> &ModelChecker {
        &self.checker
    }

    pub fn shutdown(&mut self) {
        self.checker.shutdown();
    }
}

impl Session for RemoteSession {
    type Snapshot = Snapshot;

    fn initialize(&mut self) -> Result<(), McError> {
        self.checker.wait_for_requests()?;
        let snapshot = self.checker.take_snapshot(0, &self.snapshot_config)?;
        debug!(
            "initial state: {} enabled actors, {} heap bytes",
            snapshot.enabled_processes.len(),
            snapshot.heap_bytes_used
        );
        self.initial = Some(snapshot);
        Ok(())
    }

    fn actors(&mut self) -> Result<Vec<ActorInfo>, McError> {
        let actors = self.checker.process_mut().actors()?.to_vec();
        let process = self.checker.process();
        actors
            .into_iter()
            .map(|actor| -> Result<ActorInfo, McError> {
                Ok(ActorInfo {
                    pid: actor.pid(),
                    simcall: Simcall::read(process, &actor.record.simcall)?,
                    name: actor.name,
                    host: actor.hostname,
                })
            })
            .collect()
    }

    fn actor_is_enabled(&mut self, pid: u64) -> Result<bool, McError> {
        self.checker.actor_is_enabled(pid)
    }

    fn handle_simcall(&mut self, transition: Transition) -> Result<(), McError> {
        self.checker.handle_simcall(transition.pid, transition.argument)
    }

    fn wait_for_requests(&mut self) -> Result<(), McError> {
        self.checker.wait_for_requests()
    }

    fn check_deadlock(&mut self) -> Result<bool, McError> {
        self.checker.check_deadlock()
    }

    fn take_snapshot(&mut self, num: u64) -> Result<Snapshot, McError> {
        self.checker.take_snapshot(num, &self.snapshot_config)
    }

    fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), McError> {
        self.checker.restore_snapshot(snapshot)
    }

    fn restore_initial_state(&mut self) -> Result<(), McError> {
        let Some(initial) = self.initial.as_ref() else {
            return Err(McError::Inconsistent("session was never initialized".into()));
        };
        self.checker.restore_snapshot(initial)
    }

    fn snapshot_equal(&self, s1: &Snapshot, s2: &Snapshot) -> bool {
        snapshot_equal(
            self.checker.process().object_infos(),
            s1,
            s2,
            self.snapshot_config.hash,
        )
    }

    fn snapshot_key(&self, snapshot: &Snapshot) -> (usize, u64) {
        (snapshot.enabled_processes.len(), snapshot.heap_bytes_used)
    }

    fn proposition_names(&self) -> Vec<String> {
        self.checker
            .propositions()
            .iter()
            .map(|p| p.name.clone())
            .collect()
    }

    fn proposition_value(&mut self, name: &str) -> Result<bool, McError> {
        self.checker.proposition_value(name)
    }

    fn last_result(&mut self, pid: u64) -> Result<Option<u64>, McError> {
        let process = self.checker.process_mut();
        if let Some(actor) = process.actors()?.iter().find(|a| a.pid() == pid) {
            return Ok(Some(actor.record.simcall.result));
        }
        Ok(process
            .dead_actors()?
            .iter()
            .find(|a| a.pid() == pid)
            .map(|a| a.record.simcall.result))
    }

    fn read_comm(&mut self, address: u64) -> Result<CommInfo, McError> {
        Ok(CommInfo::read(self.checker.process(), address)?)
    }

    fn read_bytes(&mut self, address: u64, size: u64) -> Result<Vec<u8>, McError> {
        Ok(self.checker.process().read_buffer(address, size)?)
    }
}
