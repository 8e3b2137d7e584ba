//! Liveness checking: nested depth-first search over the product of the
//! checked system and the Büchi automaton of the negated property.
//!
//! Every pair on the stack holds an automaton state and the system state
//! reached by the transitions below it. Accepting pairs met on the way
//! are remembered; meeting an equal accepting pair again while searching
//! for a cycle closes an accepting cycle, which is a counter-example.

use std::rc::Rc;

use log::{debug, info, warn};
use stepwise_mc::McError;

use crate::automaton::{Automaton, AutomatonError};
use crate::checker::{classify, Checker, ExploreError};
use crate::config::CheckerConfig;
use crate::dot::DotOutput;
use crate::record::RecordTrace;
use crate::report::{ExplorationStats, ViolationKind, ViolationReport};
use crate::request::{request_get_dot_output, request_to_string, ActorNames};
use crate::session::Session;
use crate::state::State;
use crate::visited::{VisitedState, VisitedStates};

/// A node of the product graph.
struct Pair<S> {
    num: u64,
    automaton_state: usize,
    graph_state: State<S>,
    /// Proposition values when the pair was created.
    propositions: Rc<Vec<bool>>,
    /// Transitions left to explore from here.
    requests: usize,
    search_cycle: bool,
    exploration_started: bool,
    depth: usize,
}

/// What two pairs must share to be equal.
struct PairContent<S> {
    automaton_state: usize,
    propositions: Rc<Vec<bool>>,
    snapshot: Rc<S>,
}

pub struct LivenessChecker<'a, S: Session> {
    session: &'a mut S,
    config: CheckerConfig,
    automaton: Automaton,
    stack: Vec<Pair<S::Snapshot>>,
    acceptance_pairs: VisitedStates<PairContent<S::Snapshot>>,
    visited_pairs: VisitedStates<PairContent<S::Snapshot>>,
    expanded_pairs: u64,
    visited_pairs_count: u64,
    expanded_states: u64,
    executed_transitions: u64,
    previous_pair: u64,
    previous_request: String,
    names: ActorNames,
    dot: DotOutput,
}

impl<'a, S: Session> LivenessChecker<'a, S> {
    pub fn new(session: &'a mut S, config: &CheckerConfig) -> Result<Self, ExploreError> {
        let Some(path) = config.property_file.as_deref() else {
            return Err(ExploreError::Config("liveness needs a property file".into()));
        };
        info!("Check the liveness property {}", path.display());
        let automaton = Automaton::load(path)?;
        let dot = DotOutput::open(config.dot_output.as_deref())?;

        debug!("Starting the liveness algorithm");
        session.initialize()?;
        let registered = session.proposition_names();
        if let Some(missing) = automaton
            .propositions()
            .iter()
            .find(|p| !registered.contains(p))
        {
            return Err(AutomatonError::UnknownProposition(missing.clone()).into());
        }
        let mut names = ActorNames::new();
        names.learn(&session.actors()?);

        let mut checker = Self {
            session,
            config: config.clone(),
            automaton,
            stack: Vec::new(),
            acceptance_pairs: VisitedStates::new(usize::MAX),
            visited_pairs: VisitedStates::new(config.visited_pairs),
            expanded_pairs: 0,
            visited_pairs_count: 0,
            expanded_states: 0,
            executed_transitions: 0,
            previous_pair: 0,
            previous_request: String::new(),
            names,
            dot,
        };

        let propositions = checker.proposition_values()?;
        let snapshot = checker.snapshot()?;
        let initial: Vec<usize> = checker.automaton.initial_states().collect();
        for automaton_state in initial {
            let pair = checker.create_pair(None, automaton_state, &propositions, &snapshot)?;
            checker.stack.push(pair);
        }
        Ok(checker)
    }

    fn proposition_values(&mut self) -> Result<Rc<Vec<bool>>, McError> {
        let mut values = Vec::with_capacity(self.automaton.propositions().len());
        for name in self.automaton.propositions() {
            values.push(self.session.proposition_value(name)?);
        }
        Ok(Rc::new(values))
    }

    fn snapshot(&mut self) -> Result<Rc<S::Snapshot>, McError> {
        let num = self.expanded_pairs + 1;
        Ok(Rc::new(self.session.take_snapshot(num)?))
    }

    fn create_pair(
        &mut self,
        parent: Option<(usize, bool)>,
        automaton_state: usize,
        propositions: &Rc<Vec<bool>>,
        snapshot: &Rc<S::Snapshot>,
    ) -> Result<Pair<S::Snapshot>, McError> {
        self.expanded_pairs += 1;
        self.expanded_states += 1;
        let mut graph_state = State::new(self.expanded_states);
        graph_state.snapshot = Some(Rc::clone(snapshot));
        graph_state.interleave_enabled(self.session, false)?;

        let (depth, parent_cycle) = parent.map_or((1, false), |(depth, cycle)| (depth + 1, cycle));
        Ok(Pair {
            num: self.expanded_pairs,
            automaton_state,
            requests: graph_state.interleave_size(),
            graph_state,
            propositions: Rc::clone(propositions),
            search_cycle: self.automaton.state(automaton_state).accepting || parent_cycle,
            exploration_started: false,
            depth,
        })
    }

    fn content(pair: &Pair<S::Snapshot>) -> Option<PairContent<S::Snapshot>> {
        Some(PairContent {
            automaton_state: pair.automaton_state,
            propositions: Rc::clone(&pair.propositions),
            snapshot: Rc::clone(pair.graph_state.snapshot.as_ref()?),
        })
    }

    fn pairs_equal(session: &S, a: &PairContent<S::Snapshot>, b: &PairContent<S::Snapshot>) -> bool {
        a.automaton_state == b.automaton_state
            && a.propositions == b.propositions
            && session.snapshot_equal(&a.snapshot, &b.snapshot)
    }

    fn explore(&mut self) -> Result<(), ExploreError> {
        while let Some(top) = self.stack.last() {
            debug!(
                "********************* ( Depth = {}, search_cycle = {}, interleave size = {}, pair_num = {}, requests = {})",
                top.depth,
                top.search_cycle,
                top.graph_state.interleave_size(),
                top.num,
                top.requests
            );

            if top.requests == 0 {
                self.backtrack()?;
                continue;
            }
            if top.depth > self.config.max_depth {
                warn!("/!\\ Max depth reached ! /!\\ ");
                self.set_top_requests(0);
                self.backtrack()?;
                continue;
            }

            let accepting = self.automaton.state(top.automaton_state).accepting;
            if accepting && !top.exploration_started {
                self.insert_acceptance_pair()?;
            }

            if !self.stack.last().is_some_and(|p| p.exploration_started)
                && self.insert_visited_pair()?
            {
                self.set_top_requests(0);
                self.backtrack()?;
                continue;
            }

            self.step()?;
        }

        info!("No property violation found.");
        self.stats().log();
        Ok(())
    }

    fn set_top_requests(&mut self, requests: usize) {
        if let Some(top) = self.stack.last_mut() {
            top.requests = requests;
        }
    }

    /// Remember the accepting pair on top of the stack; finding an equal
    /// one while searching for a cycle is a violation.
    fn insert_acceptance_pair(&mut self) -> Result<(), ExploreError> {
        let Some(top) = self.stack.last() else {
            return Ok(());
        };
        let Some(content) = Self::content(top) else {
            return Ok(());
        };
        let (num, depth, search_cycle) = (top.num, top.depth, top.search_cycle);
        let key = self.session.snapshot_key(&content.snapshot);
        let session = &*self.session;
        let reached = self.acceptance_pairs.insert_unless_present(
            VisitedState::new(num, key, content),
            |a, b| search_cycle && Self::pairs_equal(session, a, b),
        );
        let Some(other) = reached else {
            return Ok(());
        };

        self.stack.pop();
        self.dot.edge(self.previous_pair, other, &self.previous_request)?;

        let report = ViolationReport::new(ViolationKind::Liveness, "*** PROPERTY NOT VALID ***")
            .with_details(vec![
                format!("Pair {num} already reached (equal to pair {other}) !"),
                format!("Counter-example depth: {depth}"),
            ])
            .with_trace(self.textual_trace())
            .with_record_path(self.record_trace());
        report.log();
        self.stats().log();
        Err(ExploreError::Violation(Box::new(report)))
    }

    /// Whether the pair on top of the stack equals a visited pair.
    fn insert_visited_pair(&mut self) -> Result<bool, ExploreError> {
        if self.config.visited_pairs == 0 {
            return Ok(false);
        }
        let Some(top) = self.stack.last() else {
            return Ok(false);
        };
        let Some(content) = Self::content(top) else {
            return Ok(false);
        };
        let num = top.num;
        let key = self.session.snapshot_key(&content.snapshot);
        let session = &*self.session;
        let Some(old) = self
            .visited_pairs
            .add_state(VisitedState::new(num, key, content), |a, b| {
                Self::pairs_equal(session, a, b)
            })
        else {
            return Ok(false);
        };

        let origin = old.origin();
        debug!("Pair {num} already visited ! (equal to pair {origin})");
        self.dot.edge(self.previous_pair, origin, &self.previous_request)?;
        Ok(true)
    }

    fn step(&mut self) -> Result<(), ExploreError> {
        let Some(top) = self.stack.last_mut() else {
            return Ok(());
        };
        let Some(transition) = top.graph_state.choose_request(self.session)? else {
            top.requests = 0;
            return self.backtrack();
        };
        let (num, search_cycle, started) = (top.num, top.search_cycle, top.exploration_started);
        let executed = top.graph_state.executed_req.clone();

        if let Some(req) = executed.as_ref() {
            if self.dot.is_enabled() {
                if self.previous_pair != 0 && self.previous_pair != num {
                    self.dot.edge(self.previous_pair, num, &self.previous_request)?;
                }
                self.previous_pair = num;
                self.previous_request = request_get_dot_output(req, transition.argument, &self.names);
                if search_cycle {
                    self.dot.node(num, "shape=doublecircle")?;
                }
            }
            debug!(
                "Execute: {}",
                request_to_string(req, transition.argument, &self.names)
            );
        }

        self.executed_transitions += 1;
        if !started {
            self.visited_pairs_count += 1;
        }
        if let Err(e) = self.session.execute(transition) {
            return Err(classify(e, self.textual_trace(), self.record_trace()));
        }
        self.names.learn(&self.session.actors()?);

        let (automaton_state, depth) = match self.stack.last_mut() {
            Some(top) => {
                top.requests = top.requests.saturating_sub(1);
                top.exploration_started = true;
                (top.automaton_state, top.depth)
            }
            None => return Ok(()),
        };

        let propositions = self.proposition_values()?;
        let snapshot = self.snapshot()?;
        let targets: Vec<usize> = {
            let value = |name: &str| {
                self.automaton
                    .propositions()
                    .iter()
                    .position(|p| p == name)
                    .and_then(|i| propositions.get(i).copied())
                    .unwrap_or(false)
            };
            self.automaton
                .outgoing(automaton_state)
                .rev()
                .filter(|t| t.label.eval(&value))
                .map(|t| t.dst)
                .collect()
        };
        for dst in targets {
            let pair = self.create_pair(Some((depth, search_cycle)), dst, &propositions, &snapshot)?;
            self.stack.push(pair);
        }
        Ok(())
    }

    fn backtrack(&mut self) -> Result<(), ExploreError> {
        while let Some(pair) = self.stack.pop() {
            if pair.requests > 0 {
                debug!("Backtracking to depth {}", pair.depth);
                self.stack.push(pair);
                self.replay()?;
                debug!("Backtracking done");
                break;
            }
            debug!("Delete pair {} at depth {}", pair.num, pair.depth);
            if self.automaton.state(pair.automaton_state).accepting {
                self.acceptance_pairs.remove(pair.num);
            }
        }
        Ok(())
    }

    /// Bring the system back to the pair on top of the stack.
    fn replay(&mut self) -> Result<(), ExploreError> {
        debug!("**** Begin Replay ****");
        if self.config.checkpoint > 0 {
            if let Some(snapshot) = self.stack.last().and_then(|p| p.graph_state.snapshot.clone()) {
                self.session.restore_snapshot(&snapshot)?;
                return Ok(());
            }
        }

        self.session.restore_initial_state()?;
        let below = self.stack.len().saturating_sub(1);
        let replay: Vec<Option<_>> = self.stack[..below]
            .iter()
            .map(|pair| {
                pair.exploration_started
                    .then_some(pair.graph_state.transition)
                    .flatten()
            })
            .collect();
        for (depth, transition) in replay.into_iter().enumerate() {
            if let Some(transition) = transition {
                debug!("Replay (depth = {}) : {transition}", depth + 1);
                if let Err(e) = self.session.execute(transition) {
                    return Err(classify(e, self.textual_trace(), self.record_trace()));
                }
            }
            self.visited_pairs_count += 1;
            self.executed_transitions += 1;
        }
        debug!("**** End Replay ****");
        Ok(())
    }

    fn textual_trace(&self) -> Vec<String> {
        self.stack
            .iter()
            .filter_map(|pair| {
                let transition = pair.graph_state.transition?;
                let req = pair.graph_state.executed_req.as_ref()?;
                Some(request_to_string(req, transition.argument, &self.names))
            })
            .collect()
    }

    fn record_trace(&self) -> RecordTrace {
        RecordTrace::new(
            self.stack
                .iter()
                .filter_map(|pair| pair.graph_state.transition)
                .collect(),
        )
    }
}

impl<S: Session> Checker for LivenessChecker<'_, S> {
    fn run(&mut self) -> Result<(), ExploreError> {
        let outcome = self.explore();
        let last = match &outcome {
            Err(ExploreError::Violation(_)) => self.stack.last().map(|p| p.num),
            _ => None,
        };
        self.dot.close(last)?;
        outcome
    }

    fn stats(&self) -> ExplorationStats {
        ExplorationStats {
            expanded_states: self.expanded_states,
            expanded_pairs: Some(self.expanded_pairs),
            visited_pairs: Some(self.visited_pairs_count),
            executed_transitions: self.executed_transitions,
            ..ExplorationStats::default()
        }
    }

    fn name(&self) -> &'static str {
        "liveness"
    }
}
