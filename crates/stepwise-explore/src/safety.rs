//! Depth-first exploration of safety properties, with optional DPOR.
//!
//! The exploration stack holds one [`State`] per executed transition.  The
//! loop picks a transition from the top state, executes it, and pushes the
//! resulting state; when the top state has nothing left to explore it
//! backtracks. Under DPOR each new state interleaves a single actor, and
//! backtracking adds the issuer of a popped transition to the nearest
//! ancestor whose transition depends on it.
//!
//! Restoring an ancestor uses its snapshot when it has one, otherwise the
//! initial state plus a replay of every transition down to it.

use std::rc::Rc;

use log::{debug, info, log_enabled, warn, Level};
use stepwise_protocol::layout::SimcallCall;

use crate::checker::{classify, deadlock_report, Checker, ExploreError};
use crate::config::{CheckerConfig, Reduction};
use crate::dot::DotOutput;
use crate::report::{ExplorationStats, ViolationKind, ViolationReport};
use crate::request::{request_depend, request_get_dot_output, request_to_string, ActorNames};
use crate::session::{Session, Transition};
use crate::state::{record_trace, textual_trace, State};
use crate::visited::{VisitedState, VisitedStates};

pub struct SafetyChecker<'a, S: Session> {
    session: &'a mut S,
    config: CheckerConfig,
    reduction: Reduction,
    stack: Vec<State<S::Snapshot>>,
    visited: VisitedStates<Rc<S::Snapshot>>,
    /// Earlier state equal to the top of the stack, if any.
    visited_state: Option<u64>,
    expanded_states: u64,
    visited_states: u64,
    executed_transitions: u64,
    names: ActorNames,
    dot: DotOutput,
}

impl<'a, S: Session> SafetyChecker<'a, S> {
    pub fn new(session: &'a mut S, config: &CheckerConfig) -> Result<Self, ExploreError> {
        let reduction = config.reduction();
        if config.termination {
            info!("Check non progressive cycles");
        } else {
            info!("Check a safety property. Reduction is: {reduction}.");
        }
        let dot = DotOutput::open(config.dot_output.as_deref())?;

        session.initialize()?;
        let mut names = ActorNames::new();
        names.learn(&session.actors()?);

        let mut checker = Self {
            session,
            config: config.clone(),
            reduction,
            stack: Vec::new(),
            visited: VisitedStates::new(config.max_visited_states),
            visited_state: None,
            expanded_states: 0,
            visited_states: 0,
            executed_transitions: 0,
            names,
            dot,
        };

        debug!("Starting the safety algorithm");
        checker.expanded_states += 1;
        let mut initial = State::new(checker.expanded_states);
        if checker.checkpoint_due(initial.num) {
            initial.snapshot = Some(Rc::new(checker.session.take_snapshot(initial.num)?));
        }
        initial.interleave_enabled(checker.session, reduction != Reduction::None)?;
        checker.stack.push(initial);
        Ok(checker)
    }

    fn checkpoint_due(&self, num: u64) -> bool {
        (self.config.checkpoint > 0 && num % self.config.checkpoint == 0) || self.config.termination
    }

    fn explore(&mut self) -> Result<(), ExploreError> {
        while !self.stack.is_empty() {
            let depth = self.stack.len();
            self.visited_states += 1;

            if depth > self.config.max_depth {
                warn!("/!\\ Max depth reached ! /!\\ ");
                self.backtrack()?;
                continue;
            }

            if let Some(origin) = self.visited_state.take() {
                debug!(
                    "State already visited (equal to state {origin}), exploration stopped on this path."
                );
                self.backtrack()?;
                continue;
            }

            let Some(state) = self.stack.last_mut() else {
                break;
            };
            debug!(
                "Exploration depth={depth} (state {})({} interleave)",
                state.num,
                state.interleave_size()
            );
            let Some(transition) = state.choose_request(self.session)? else {
                debug!("There are no more processes to interleave. (depth {})", depth + 1);
                self.backtrack()?;
                continue;
            };

            let from = state.num;
            let mut label = String::new();
            if let Some(req) = state.executed_req.as_ref() {
                debug!(
                    "Execute: {}",
                    request_to_string(req, transition.argument, &self.names)
                );
                if self.dot.is_enabled() {
                    label = request_get_dot_output(req, transition.argument, &self.names);
                }
            }

            self.executed_transitions += 1;
            self.execute(transition)?;

            self.expanded_states += 1;
            let num = self.expanded_states;
            let mut next = State::new(num);
            if self.checkpoint_due(num) || self.config.max_visited_states > 0 {
                next.snapshot = Some(Rc::new(self.session.take_snapshot(num)?));
            }

            if self.config.termination {
                self.check_non_termination(&next)?;
            }

            if self.config.max_visited_states > 0 {
                if let Some(snapshot) = next.snapshot.clone() {
                    let key = self.session.snapshot_key(&snapshot);
                    let session = &*self.session;
                    self.visited_state = self
                        .visited
                        .add_state(VisitedState::new(num, key, snapshot), |a, b| {
                            session.snapshot_equal(a, b)
                        })
                        .map(|old| old.origin());
                }
            }

            match self.visited_state {
                None => {
                    next.interleave_enabled(self.session, self.reduction == Reduction::Dpor)?;
                    self.dot.edge(from, num, &label)?;
                }
                Some(origin) => self.dot.edge(from, origin, &label)?,
            }

            self.stack.push(next);
        }

        info!("No property violation found.");
        self.stats().log();
        Ok(())
    }

    fn execute(&mut self, transition: Transition) -> Result<(), ExploreError> {
        if let Err(e) = self.session.execute(transition) {
            return Err(classify(
                e,
                textual_trace(&self.stack, &self.names),
                record_trace(&self.stack),
            ));
        }
        self.names.learn(&self.session.actors()?);
        Ok(())
    }

    /// Fail when `next` is equal to a state on the exploration stack.
    fn check_non_termination(&self, next: &State<S::Snapshot>) -> Result<(), ExploreError> {
        let Some(current) = next.snapshot.as_ref() else {
            return Ok(());
        };
        for state in self.stack.iter().rev() {
            let Some(snapshot) = state.snapshot.as_ref() else {
                continue;
            };
            if self.session.snapshot_equal(snapshot, current) {
                let report = ViolationReport::new(
                    ViolationKind::NonTermination,
                    "*** NON-PROGRESSIVE CYCLE DETECTED ***",
                )
                .with_details(vec![format!(
                    "Non-progressive cycle: state {} -> state {}",
                    state.num, next.num
                )])
                .with_trace(textual_trace(&self.stack, &self.names))
                .with_record_path(record_trace(&self.stack));
                report.log();
                self.stats().log();
                return Err(ExploreError::Violation(Box::new(report)));
            }
        }
        Ok(())
    }

    fn backtrack(&mut self) -> Result<(), ExploreError> {
        self.stack.pop();

        if self.session.check_deadlock()? {
            let trace = textual_trace(&self.stack, &self.names);
            let path = record_trace(&self.stack);
            let err = deadlock_report(self.session, &mut self.names, trace, path)?;
            self.stats().log();
            return Err(err);
        }

        // Pop states until one still has actors to explore, updating the
        // interleave sets of the ancestors on the way.
        while let Some(state) = self.stack.pop() {
            if self.reduction == Reduction::Dpor {
                self.update_ancestors(&state)?;
            }

            if state.interleave_size() > 0 && self.stack.len() < self.config.max_depth {
                debug!("Back-tracking to state {} at depth {}", state.num, self.stack.len() + 1);
                self.stack.push(state);
                self.restore_state()?;
                break;
            }
            debug!("Delete state {} at depth {}", state.num, self.stack.len() + 1);
        }
        Ok(())
    }

    /// Ask the nearest ancestor whose transition depends on the one that
    /// left `state` to also explore its issuer.
    fn update_ancestors(&mut self, state: &State<S::Snapshot>) -> Result<(), ExploreError> {
        let Some(req) = state.internal_req.as_ref() else {
            return Ok(());
        };
        if matches!(req.call, SimcallCall::MutexLock | SimcallCall::MutexTrylock) {
            return Err(ExploreError::Unsupported(
                "Mutex is currently not supported with DPOR, use --reduction none".into(),
            ));
        }

        let issuer = req.issuer;
        for prev in self.stack.iter_mut().rev() {
            let Some(prev_req) = prev.internal_req.as_ref() else {
                continue;
            };
            if request_depend(req, prev_req) {
                if log_enabled!(Level::Debug) {
                    debug!("Dependent Transitions:");
                    for (s, label) in [(&*prev, "prev"), (state, "popped")] {
                        if let (Some(t), Some(r)) = (s.transition, s.executed_req.as_ref()) {
                            debug!(
                                "{} (state={}, {label})",
                                request_to_string(r, t.argument, &self.names),
                                s.num
                            );
                        }
                    }
                }
                if prev.is_done(issuer) {
                    debug!("Actor {issuer} is in done set");
                } else {
                    prev.add_interleaving_set(issuer);
                }
                break;
            } else if req.issuer == prev_req.issuer {
                debug!("Simcall {:?} and {:?} with same issuer", req.call, prev_req.call);
                break;
            } else {
                debug!(
                    "Simcall {:?}, actor {} (state {}) and simcall {:?}, actor {} (state {}) are independent",
                    req.call, req.issuer, state.num, prev_req.call, prev_req.issuer, prev.num
                );
            }
        }
        Ok(())
    }

    /// Bring the checked system back to the top state of the stack.
    fn restore_state(&mut self) -> Result<(), ExploreError> {
        let Some(last) = self.stack.last() else {
            return Ok(());
        };
        if let Some(snapshot) = last.snapshot.clone() {
            self.session.restore_snapshot(&snapshot)?;
            return Ok(());
        }

        self.session.restore_initial_state()?;
        let replay: Vec<Transition> = self.stack[..self.stack.len() - 1]
            .iter()
            .filter_map(|s| s.transition)
            .collect();
        for transition in replay {
            self.execute(transition)?;
            self.visited_states += 1;
            self.executed_transitions += 1;
        }
        Ok(())
    }
}

impl<S: Session> Checker for SafetyChecker<'_, S> {
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
            ..ExplorationStats::default()
        }
    }

    fn name(&self) -> &'static str {
        if self.config.termination {
            "non-termination"
        } else {
            "safety"
        }
    }
}
