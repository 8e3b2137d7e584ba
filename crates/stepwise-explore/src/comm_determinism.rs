//! Communication determinism: does every actor send (and receive) the same
//! messages, in the same order, whatever the interleaving?
//!
//! The first complete path records, per actor, the list of communications
//! it takes part in. Every later path compares each communication with
//! the recorded one at the same position.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use log::{debug, info, warn};
use stepwise_mc::{CommKind, McError, Simcall};
use stepwise_protocol::layout::SimcallCall;

use crate::checker::{classify, deadlock_report, Checker, ExploreError};
use crate::config::CheckerConfig;
use crate::dot::DotOutput;
use crate::report::{ExplorationStats, ViolationKind, ViolationReport};
use crate::request::{request_get_dot_output, request_to_string, ActorNames};
use crate::session::{Session, Transition};
use crate::state::{record_trace, textual_trace, State};
use crate::visited::{VisitedState, VisitedStates};

/// First field in which two communications differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommPatternDifference {
    Type,
    Rdv,
    Tag,
    SrcProc,
    DstProc,
    DataSize,
    Data,
}

impl fmt::Display for CommPatternDifference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Type => "type",
            Self::Rdv => "rdv",
            Self::Tag => "tag",
            Self::SrcProc => "source",
            Self::DstProc => "destination",
            Self::DataSize => "data size",
            Self::Data => "data",
        })
    }
}

/// One communication as seen by one of its endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternCommunication {
    /// Position in the actor's communication list.
    pub index: usize,
    pub kind: CommKind,
    pub comm_addr: u64,
    pub rdv: u64,
    pub src_proc: Option<u64>,
    pub dst_proc: Option<u64>,
    pub tag: u64,
    pub data: Vec<u8>,
}

pub fn compare_comm_pattern(
    reference: &PatternCommunication,
    comm: &PatternCommunication,
) -> Option<CommPatternDifference> {
    if reference.kind != comm.kind {
        Some(CommPatternDifference::Type)
    } else if reference.rdv != comm.rdv {
        Some(CommPatternDifference::Rdv)
    } else if reference.src_proc != comm.src_proc {
        Some(CommPatternDifference::SrcProc)
    } else if reference.dst_proc != comm.dst_proc {
        Some(CommPatternDifference::DstProc)
    } else if reference.tag != comm.tag {
        Some(CommPatternDifference::Tag)
    } else if reference.data.len() != comm.data.len() {
        Some(CommPatternDifference::DataSize)
    } else if reference.data != comm.data {
        Some(CommPatternDifference::Data)
    } else {
        None
    }
}

/// `The send communications pattern of the actor 2 is different! ...`
pub fn determinism_message(
    diff: CommPatternDifference,
    pid: u64,
    kind: CommKind,
    position: usize,
) -> String {
    let direction = match kind {
        CommKind::Send => "send",
        CommKind::Receive => "recv",
    };
    format!(
        "The {direction} communications pattern of the actor {pid} is different! \
         Different {diff} for communication #{position}"
    )
}

/// Where each actor stands in its communication list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternCursor {
    /// Completed communications per actor.
    pub index_comm: BTreeMap<u64, usize>,
    /// Started but not yet completed communications per actor.
    pub incomplete: BTreeMap<u64, Vec<PatternCommunication>>,
}

impl PatternCursor {
    fn index(&self, pid: u64) -> usize {
        self.index_comm.get(&pid).copied().unwrap_or(0)
    }
}

pub struct CommDeterminismChecker<'a, S: Session> {
    session: &'a mut S,
    config: CheckerConfig,
    stack: Vec<State<S::Snapshot>>,
    /// Cursor saved with each state that has a snapshot, by state number.
    saved_cursors: BTreeMap<u64, PatternCursor>,
    visited: VisitedStates<Rc<S::Snapshot>>,
    visited_state: Option<u64>,
    /// Communications of the first complete path, per actor.
    initial_patterns: BTreeMap<u64, Vec<PatternCommunication>>,
    initial_done: bool,
    cursor: PatternCursor,
    send_deterministic: bool,
    recv_deterministic: bool,
    send_diff: Option<String>,
    recv_diff: Option<String>,
    expanded_states: u64,
    visited_states: u64,
    executed_transitions: u64,
    names: ActorNames,
    dot: DotOutput,
}

impl<'a, S: Session> CommDeterminismChecker<'a, S> {
    pub fn new(session: &'a mut S, config: &CheckerConfig) -> Result<Self, ExploreError> {
        info!("Check communication determinism");
        let dot = DotOutput::open(config.dot_output.as_deref())?;
        session.initialize()?;
        let mut names = ActorNames::new();
        names.learn(&session.actors()?);

        let mut checker = Self {
            session,
            config: config.clone(),
            stack: Vec::new(),
            saved_cursors: BTreeMap::new(),
            visited: VisitedStates::new(config.max_visited_states),
            visited_state: None,
            initial_patterns: BTreeMap::new(),
            initial_done: false,
            cursor: PatternCursor::default(),
            send_deterministic: true,
            recv_deterministic: true,
            send_diff: None,
            recv_diff: None,
            expanded_states: 0,
            visited_states: 0,
            executed_transitions: 0,
            names,
            dot,
        };

        debug!("********* Start communication determinism verification *********");
        checker.expanded_states += 1;
        let mut initial = State::new(checker.expanded_states);
        if checker.checkpoint_due(initial.num) {
            initial.snapshot = Some(Rc::new(checker.session.take_snapshot(initial.num)?));
            checker.saved_cursors.insert(initial.num, checker.cursor.clone());
        }
        initial.interleave_enabled(checker.session, false)?;
        checker.stack.push(initial);
        Ok(checker)
    }

    fn checkpoint_due(&self, num: u64) -> bool {
        self.config.checkpoint > 0 && num % self.config.checkpoint == 0
    }

    fn explore(&mut self) -> Result<(), ExploreError> {
        while !self.stack.is_empty() {
            let depth = self.stack.len();
            self.visited_states += 1;

            let chosen = if depth <= self.config.max_depth && self.visited_state.is_none() {
                match self.stack.last_mut() {
                    Some(state) => state.choose_request(self.session)?,
                    None => None,
                }
            } else {
                None
            };

            match chosen {
                Some(transition) => self.step(transition)?,
                None => {
                    if depth > self.config.max_depth {
                        warn!("/!\\ Max depth reached! /!\\ ");
                    } else if let Some(origin) = self.visited_state {
                        debug!(
                            "State already visited (equal to state {origin}), exploration stopped on this path."
                        );
                    } else {
                        debug!("There are no more processes to interleave. (depth {depth})");
                    }
                    self.initial_done = true;
                    self.backtrack()?;
                }
            }
        }

        self.log_verdict();
        self.stats().log();
        Ok(())
    }

    fn step(&mut self, transition: Transition) -> Result<(), ExploreError> {
        let Some(state) = self.stack.last() else {
            return Ok(());
        };
        let from = state.num;
        let executed = state
            .executed_req
            .clone()
            .unwrap_or_else(|| Simcall::none(transition.pid));
        debug!(
            "Execute: {}",
            request_to_string(&executed, transition.argument, &self.names)
        );
        let label = if self.dot.is_enabled() {
            request_get_dot_output(&executed, transition.argument, &self.names)
        } else {
            String::new()
        };

        self.executed_transitions += 1;
        self.execute(transition, &executed, false)?;

        self.expanded_states += 1;
        let num = self.expanded_states;
        let mut next = State::new(num);
        if self.checkpoint_due(num) || self.config.max_visited_states > 0 {
            next.snapshot = Some(Rc::new(self.session.take_snapshot(num)?));
            self.saved_cursors.insert(num, self.cursor.clone());
        }

        self.visited_state = None;
        if self.config.max_visited_states > 0 {
            if let Some(snapshot) = next.snapshot.clone() {
                // Paths with communications still in flight cannot be cut
                // before the reference pattern is complete.
                let compare = self.initial_done;
                let key = self.session.snapshot_key(&snapshot);
                let session = &*self.session;
                self.visited_state = self
                    .visited
                    .add_state(VisitedState::new(num, key, snapshot), |a, b| {
                        compare && session.snapshot_equal(a, b)
                    })
                    .map(|old| old.origin());
            }
        }

        match self.visited_state {
            None => {
                next.interleave_enabled(self.session, false)?;
                self.dot.edge(from, num, &label)?;
            }
            Some(origin) => self.dot.edge(from, origin, &label)?,
        }
        self.stack.push(next);
        Ok(())
    }

    /// Execute `transition`, recording the communication it starts or
    /// completes before the actors move on.
    fn execute(
        &mut self,
        transition: Transition,
        executed: &Simcall,
        backtracking: bool,
    ) -> Result<(), ExploreError> {
        match self.answer(transition, executed, backtracking) {
            Ok(()) => {
                self.names.learn(&self.session.actors()?);
                Ok(())
            }
            Err(ExploreError::Mc(e)) => Err(classify(
                e,
                textual_trace(&self.stack, &self.names),
                record_trace(&self.stack),
            )),
            Err(e) => Err(e),
        }
    }

    fn answer(
        &mut self,
        transition: Transition,
        executed: &Simcall,
        backtracking: bool,
    ) -> Result<(), ExploreError> {
        self.session.handle_simcall(transition)?;
        self.handle_comm_pattern(executed, transition.argument, backtracking)?;
        self.session.wait_for_requests()?;
        Ok(())
    }

    fn handle_comm_pattern(
        &mut self,
        executed: &Simcall,
        value: i32,
        backtracking: bool,
    ) -> Result<(), ExploreError> {
        match executed.call {
            SimcallCall::CommIsend | SimcallCall::CommIrecv => self.get_comm_pattern(executed),
            SimcallCall::CommWait => {
                self.complete_comm_pattern(executed.comm, executed.issuer, backtracking)
            }
            SimcallCall::CommWaitany => {
                let comm = usize::try_from(value)
                    .ok()
                    .and_then(|i| executed.comms.get(i))
                    .copied()
                    .ok_or_else(|| {
                        McError::Inconsistent(format!(
                            "waitany of actor {} has no comm at index {value}",
                            executed.issuer
                        ))
                    })?;
                self.complete_comm_pattern(comm, executed.issuer, backtracking)
            }
            _ => Ok(()),
        }
    }

    /// Record the communication an isend/irecv just created.
    fn get_comm_pattern(&mut self, executed: &Simcall) -> Result<(), ExploreError> {
        let issuer = executed.issuer;
        let comm_addr = self
            .session
            .last_result(issuer)?
            .filter(|&addr| addr != 0)
            .ok_or_else(|| {
                McError::Inconsistent(format!("actor {issuer} created no communication"))
            })?;
        let comm = self.session.read_comm(comm_addr)?;

        let started = self.cursor.incomplete.get(&issuer).map_or(0, Vec::len);
        let mut pattern = PatternCommunication {
            index: self.cursor.index(issuer) + started,
            kind: CommKind::Send,
            comm_addr,
            rdv: comm.mailbox,
            src_proc: None,
            dst_proc: None,
            tag: comm.tag,
            data: Vec::new(),
        };
        if executed.call == SimcallCall::CommIsend {
            pattern.src_proc = comm.src_actor;
            if comm.src_buff != 0 {
                pattern.data = self.session.read_bytes(comm.src_buff, comm.data_size)?;
            }
        } else {
            pattern.kind = CommKind::Receive;
            pattern.dst_proc = comm.dst_actor;
        }

        debug!(
            "Insert incomplete comm pattern {:#x} for actor {issuer}",
            pattern.comm_addr
        );
        self.cursor.incomplete.entry(issuer).or_default().push(pattern);
        Ok(())
    }

    /// Finish the pattern of `comm_addr` once `issuer` waited for it.
    fn complete_comm_pattern(
        &mut self,
        comm_addr: u64,
        issuer: u64,
        backtracking: bool,
    ) -> Result<(), ExploreError> {
        let incomplete = self.cursor.incomplete.entry(issuer).or_default();
        let position = incomplete
            .iter()
            .position(|p| p.comm_addr == comm_addr)
            .ok_or_else(|| {
                McError::Inconsistent(format!(
                    "communication {comm_addr:#x} of actor {issuer} not found"
                ))
            })?;
        let mut pattern = incomplete.remove(position);
        debug!("Remove incomplete comm pattern for actor {issuer} at cursor {position}");

        let comm = self.session.read_comm(comm_addr)?;
        pattern.src_proc = comm.src_actor;
        pattern.dst_proc = comm.dst_actor;
        if pattern.data.is_empty() && comm.src_buff != 0 {
            pattern.data = self.session.read_bytes(comm.src_buff, comm.data_size)?;
        }

        if self.initial_done {
            if !backtracking {
                self.deterministic_comm_pattern(issuer, &pattern)?;
            }
            *self.cursor.index_comm.entry(issuer).or_default() += 1;
        } else if !backtracking {
            self.initial_patterns.entry(issuer).or_default().push(pattern);
        }
        Ok(())
    }

    fn deterministic_comm_pattern(
        &mut self,
        issuer: u64,
        comm: &PatternCommunication,
    ) -> Result<(), ExploreError> {
        let index = self.cursor.index(issuer);
        let diff = match self.initial_patterns.get(&issuer).and_then(|list| list.get(index)) {
            Some(reference) => compare_comm_pattern(reference, comm),
            // More communications than on the reference path.
            None => Some(CommPatternDifference::Type),
        };
        let Some(diff) = diff else {
            return Ok(());
        };

        let message = determinism_message(diff, issuer, comm.kind, index + 1);
        match comm.kind {
            CommKind::Send => {
                self.send_deterministic = false;
                self.send_diff = Some(message);
            }
            CommKind::Receive => {
                self.recv_deterministic = false;
                self.recv_diff = Some(message);
            }
        }

        let headline = if self.config.send_determinism && !self.send_deterministic {
            "***** Non-send-deterministic communications pattern *****"
        } else if self.config.comms_determinism
            && !self.send_deterministic
            && !self.recv_deterministic
        {
            "****** Non-deterministic communications pattern ******"
        } else {
            return Ok(());
        };

        let mut details = Vec::new();
        details.extend(self.send_diff.clone());
        if !self.config.send_determinism {
            details.extend(self.recv_diff.clone());
        }
        let report = ViolationReport::new(ViolationKind::NonDeterminism, headline)
            .with_details(details)
            .with_trace(textual_trace(&self.stack, &self.names))
            .with_record_path(record_trace(&self.stack));
        report.log();
        self.stats().log();
        Err(ExploreError::Violation(Box::new(report)))
    }

    fn backtrack(&mut self) -> Result<(), ExploreError> {
        if let Some(state) = self.stack.pop() {
            debug!("Delete state {} at depth {}", state.num, self.stack.len() + 1);
            self.saved_cursors.remove(&state.num);
        }
        self.visited_state = None;

        if self.session.check_deadlock()? {
            let trace = textual_trace(&self.stack, &self.names);
            let path = record_trace(&self.stack);
            let err = deadlock_report(self.session, &mut self.names, trace, path)?;
            self.stats().log();
            return Err(err);
        }

        while let Some(state) = self.stack.pop() {
            if state.interleave_size() > 0 && self.stack.len() < self.config.max_depth {
                debug!("Back-tracking to state {} at depth {}", state.num, self.stack.len() + 1);
                self.stack.push(state);
                self.restore_state()?;
                break;
            }
            debug!("Delete state {} at depth {}", state.num, self.stack.len() + 1);
            self.saved_cursors.remove(&state.num);
        }
        Ok(())
    }

    fn restore_state(&mut self) -> Result<(), ExploreError> {
        let Some(last) = self.stack.last() else {
            return Ok(());
        };
        if let Some(snapshot) = last.snapshot.clone() {
            self.session.restore_snapshot(&snapshot)?;
            self.cursor = self.saved_cursors.get(&last.num).cloned().unwrap_or_default();
            return Ok(());
        }

        self.session.restore_initial_state()?;
        self.cursor = PatternCursor::default();
        let replay: Vec<(Transition, Simcall)> = self.stack[..self.stack.len() - 1]
            .iter()
            .filter_map(|s| Some((s.transition?, s.executed_req.clone()?)))
            .collect();
        for (transition, executed) in replay {
            self.execute(transition, &executed, true)?;
            self.visited_states += 1;
            self.executed_transitions += 1;
        }
        Ok(())
    }

    fn log_verdict(&self) {
        if !self.config.comms_determinism {
            return;
        }
        if self.send_deterministic && !self.recv_deterministic {
            info!("*******************************************************");
            info!("**** Only-send-deterministic communication pattern ****");
            info!("*******************************************************");
            if let Some(diff) = &self.recv_diff {
                info!("{diff}");
            }
        }
        if !self.send_deterministic && self.recv_deterministic {
            info!("*******************************************************");
            info!("**** Only-recv-deterministic communication pattern ****");
            info!("*******************************************************");
            if let Some(diff) = &self.send_diff {
                info!("{diff}");
            }
        }
    }
}

impl<S: Session> Checker for CommDeterminismChecker<'_, S> {
    fn run(&mut self) -> Result<(), ExploreError> {
        let outcome = self.explore();
        let last = match &outcome {
            Err(ExploreError::Violation(_)) => self.stack.last().map(|s| s.num),
            _ => None,
        };
        self.dot.close(last)?;
        outcome
    }

    fn stats(&self) -> ExplorationStats {
        ExplorationStats {
            expanded_states: self.expanded_states,
            visited_states: self.visited_states,
            executed_transitions: self.executed_transitions,
            send_deterministic: Some(self.send_deterministic),
            recv_deterministic: self.config.comms_determinism.then_some(self.recv_deterministic),
            ..ExplorationStats::default()
        }
    }

    fn name(&self) -> &'static str {
        "communication determinism"
    }
}
