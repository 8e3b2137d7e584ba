//! Nodes of the exploration graph.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::trace;
use stepwise_mc::{McError, Simcall};
use stepwise_protocol::layout::SimcallCall;

use crate::record::RecordTrace;
use crate::request::{request_to_string, ActorNames};
use crate::session::{ActorInfo, Session, Transition};

/// Whether an actor still has to be explored from a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interleaving {
    /// Not considered for exploration from this state.
    #[default]
    Disabled,
    /// Waiting to be explored.
    Todo,
    /// Every outcome of its simcall has been explored.
    Done,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ActorState {
    pub state: Interleaving,
    /// Outcomes of a multi-valued simcall tried so far.
    pub times_considered: u32,
}

impl ActorState {
    pub fn consider(&mut self) {
        self.state = Interleaving::Todo;
        self.times_considered = 0;
    }

    pub fn set_done(&mut self) {
        self.state = Interleaving::Done;
    }

    pub fn is_todo(&self) -> bool {
        self.state == Interleaving::Todo
    }

    pub fn is_done(&self) -> bool {
        self.state == Interleaving::Done
    }
}

/// One state of the exploration, plus the transition taken out of it.
#[derive(Debug)]
pub struct State<S> {
    pub num: u64,
    pub actor_states: BTreeMap<u64, ActorState>,
    /// Transition taken from this state, once chosen.
    pub transition: Option<Transition>,
    /// The simcall behind [`transition`](Self::transition), as issued.
    pub executed_req: Option<Simcall>,
    /// The same simcall in the form the dependency relation understands.
    pub internal_req: Option<Simcall>,
    pub snapshot: Option<Rc<S>>,
}

impl<S> State<S> {
    pub fn new(num: u64) -> Self {
        Self {
            num,
            actor_states: BTreeMap::new(),
            transition: None,
            executed_req: None,
            internal_req: None,
            snapshot: None,
        }
    }

    /// Actors still waiting to be explored from here.
    pub fn interleave_size(&self) -> usize {
        self.actor_states.values().filter(|a| a.is_todo()).count()
    }

    pub fn add_interleaving_set(&mut self, pid: u64) {
        self.actor_states.entry(pid).or_default().consider();
    }

    pub fn is_done(&self, pid: u64) -> bool {
        self.actor_states.get(&pid).is_some_and(ActorState::is_done)
    }

    /// Mark the enabled actors for exploration: only the first one when
    /// `first_only`, all of them otherwise.
    pub fn interleave_enabled<T: Session>(
        &mut self,
        session: &mut T,
        first_only: bool,
    ) -> Result<(), McError> {
        for actor in session.actors()? {
            if session.actor_is_enabled(actor.pid)? {
                self.add_interleaving_set(actor.pid);
                if first_only {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Pick the next transition to explore from this state.
    ///
    /// Walks actors in pid order and takes the first one marked for
    /// exploration whose simcall can run, updating its bookkeeping so the
    /// next call yields the next outcome.
    pub fn choose_request<T: Session>(
        &mut self,
        session: &mut T,
    ) -> Result<Option<Transition>, McError> {
        self.transition = None;
        self.executed_req = None;
        self.internal_req = None;

        for actor in session.actors()? {
            if !self.actor_states.get(&actor.pid).is_some_and(ActorState::is_todo) {
                continue;
            }
            if !session.actor_is_enabled(actor.pid)? {
                continue;
            }
            if let Some(transition) = self.choose_for_actor(&actor)? {
                return Ok(Some(transition));
            }
        }
        Ok(None)
    }

    /// The next outcome of `actor`'s simcall, if one is left.
    pub fn choose_for_actor(
        &mut self,
        actor: &ActorInfo,
    ) -> Result<Option<Transition>, McError> {
        let req = &actor.simcall;
        let procstate = self.actor_states.entry(actor.pid).or_default();

        let argument = match req.call {
            SimcallCall::CommWaitany | SimcallCall::CommTestany => {
                let start = procstate.times_considered;
                let mut argument = None;
                while (procstate.times_considered as usize) < req.comms.len() {
                    let idx = procstate.times_considered as usize;
                    procstate.times_considered += 1;
                    if req.comms_info.get(idx).is_some_and(|c| c.is_matched()) {
                        argument = Some(idx as i32);
                        break;
                    }
                }
                if procstate.times_considered as usize >= req.comms.len() {
                    procstate.set_done();
                }
                match argument {
                    Some(idx) => idx,
                    // A testany may also report that nothing is ready.
                    None if req.call == SimcallCall::CommTestany && start == 0 => -1,
                    None => return Ok(None),
                }
            }
            SimcallCall::CommWait => {
                procstate.set_done();
                // A detached send completes without a receiver.
                if req
                    .comm_info
                    .is_some_and(|c| c.is_matched() || c.is_detached_ready())
                {
                    0
                } else {
                    -1
                }
            }
            SimcallCall::Random => {
                let value = req.min.saturating_add(i64::from(procstate.times_considered));
                let argument = i32::try_from(value).map_err(|_| {
                    McError::Inconsistent(format!(
                        "random value {value} of actor {} is out of range",
                        actor.pid
                    ))
                })?;
                procstate.times_considered += 1;
                if value >= req.max {
                    procstate.set_done();
                }
                argument
            }
            _ => {
                procstate.set_done();
                0
            }
        };

        let transition = Transition::new(actor.pid, argument);
        trace!("state {}: chose {transition}", self.num);
        self.transition = Some(transition);
        self.executed_req = Some(req.clone());
        self.internal_req = Some(internal_request(req, argument));
        Ok(Some(transition))
    }
}

/// The executed simcalls of `stack`, rendered for a counter-example.
pub fn textual_trace<S>(stack: &[State<S>], names: &ActorNames) -> Vec<String> {
    stack
        .iter()
        .filter_map(|state| {
            let transition = state.transition?;
            let req = state.executed_req.as_ref()?;
            Some(request_to_string(req, transition.argument, names))
        })
        .collect()
}

/// The transitions of `stack` as a replayable path.
pub fn record_trace<S>(stack: &[State<S>]) -> RecordTrace {
    RecordTrace::new(stack.iter().filter_map(|state| state.transition).collect())
}

/// Rewrite waitany/testany as a wait/test on the comm they picked.
pub fn internal_request(req: &Simcall, argument: i32) -> Simcall {
    let picked = usize::try_from(argument).ok();
    match req.call {
        SimcallCall::CommWaitany => {
            let comm = picked.and_then(|i| req.comms.get(i)).copied().unwrap_or(0);
            let comm_info = picked.and_then(|i| req.comms_info.get(i)).copied();
            Simcall {
                call: SimcallCall::CommWait,
                comm,
                comm_info,
                comms: Vec::new(),
                comms_info: Vec::new(),
                timeout: 0.0,
                ..req.clone()
            }
        }
        SimcallCall::CommTestany => {
            let comm = picked.and_then(|i| req.comms.get(i)).copied().unwrap_or(0);
            let comm_info = picked.and_then(|i| req.comms_info.get(i)).copied();
            Simcall {
                call: SimcallCall::CommTest,
                comm,
                comm_info,
                comms: Vec::new(),
                comms_info: Vec::new(),
                ..req.clone()
            }
        }
        _ => req.clone(),
    }
}
