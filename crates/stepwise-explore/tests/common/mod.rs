//! An in-process actor system implementing [`Session`], so the checkers can
//! be driven without spawning a checked program.
//!
//! Each actor runs a fixed list of [`Op`]s. Simcall ops stop the actor until
//! the checker executes them; local ops run as soon as the actor reaches
//! them, inside `wait_for_requests`.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use stepwise_explore::config::CheckerConfig;
use stepwise_explore::session::{ActorInfo, Session, Transition};
use stepwise_explore::{explore, ExplorationReport, ExploreError};
use stepwise_mc::{CommInfo, CommKind, CommState, McError, Simcall};
use stepwise_protocol::layout::SimcallCall;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Isend { mailbox: u64, data: u8 },
    Irecv { mailbox: u64 },
    /// Wait for the comm started last.
    Wait,
    /// Wait for any comm started and not yet waited for.
    WaitAny,
    Random { min: i64, max: i64 },
    Lock(u64),
    Unlock(u64),

    /// Fail unless the bytes received so far are exactly these.
    AssertReceived(Vec<u8>),
    /// Set a registered proposition.
    Set(&'static str, bool),
    /// Jump to another op.
    Goto(usize),
}

impl Op {
    fn is_local(&self) -> bool {
        matches!(self, Op::AssertReceived(_) | Op::Set(..) | Op::Goto(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Comm {
    kind: CommKind,
    mailbox: u64,
    src: Option<u64>,
    dst: Option<u64>,
    src_buff: u64,
    dst_buff: u64,
    data: u8,
    done: bool,
}

#[derive(Debug, Clone, PartialEq)]
struct Actor {
    pid: u64,
    program: Rc<Vec<Op>>,
    pc: usize,
    /// Comms started and not yet waited for, oldest first.
    pending: Vec<u64>,
    last_result: u64,
    received: Vec<u8>,
    random: Option<i64>,
}

impl Actor {
    fn op(&self) -> Option<&Op> {
        self.program.get(self.pc)
    }

    fn is_finished(&self) -> bool {
        self.pc >= self.program.len()
    }

    fn buffer(&self) -> u64 {
        0x10_0000 + self.pid * 0x1000 + self.pc as u64 * 0x10
    }
}

/// Everything that makes up a state; doubles as its snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct World {
    actors: Vec<Actor>,
    comms: BTreeMap<u64, Comm>,
    /// Unmatched comms of each mailbox, oldest first.
    mailboxes: BTreeMap<u64, VecDeque<u64>>,
    mutexes: BTreeMap<u64, u64>,
    props: BTreeMap<String, bool>,
    next_comm: u64,
}

pub struct ToySession {
    programs: Vec<Rc<Vec<Op>>>,
    propositions: Vec<String>,
    world: World,
    initial: Option<World>,
    pub snapshots_taken: u64,
}

impl ToySession {
    /// Actor `i` of `programs` gets pid `i + 1`.
    pub fn new(programs: Vec<Vec<Op>>) -> Self {
        Self {
            programs: programs.into_iter().map(Rc::new).collect(),
            propositions: Vec::new(),
            world: World::default(),
            initial: None,
            snapshots_taken: 0,
        }
    }

    pub fn with_propositions(mut self, names: &[&str]) -> Self {
        self.propositions = names.iter().map(|n| (*n).to_owned()).collect();
        self
    }

    fn actor(&self, pid: u64) -> Result<&Actor, McError> {
        self.world
            .actors
            .iter()
            .find(|a| a.pid == pid && !a.is_finished())
            .ok_or_else(|| McError::Inconsistent(format!("no live actor {pid}")))
    }

    fn actor_mut(&mut self, pid: u64) -> Result<&mut Actor, McError> {
        self.world
            .actors
            .iter_mut()
            .find(|a| a.pid == pid && !a.is_finished())
            .ok_or_else(|| McError::Inconsistent(format!("no live actor {pid}")))
    }

    fn comm_info(&self, address: u64) -> CommInfo {
        let comm = &self.world.comms[&address];
        let state = if comm.done {
            CommState::Done
        } else if comm.src.is_some() && comm.dst.is_some() {
            CommState::Ready
        } else {
            CommState::Waiting
        };
        CommInfo {
            address,
            kind: comm.kind,
            state,
            mailbox: comm.mailbox,
            src_actor: comm.src,
            dst_actor: comm.dst,
            src_buff: comm.src_buff,
            dst_buff: comm.dst_buff,
            data_size: 1,
            tag: 0,
            detached: false,
        }
    }

    fn is_matched(&self, address: u64) -> bool {
        self.world
            .comms
            .get(&address)
            .is_some_and(|c| c.src.is_some() && c.dst.is_some())
    }

    fn simcall(&self, actor: &Actor) -> Simcall {
        let mut simcall = Simcall::none(actor.pid);
        let Some(op) = actor.op() else {
            return simcall;
        };
        match op {
            Op::Isend { mailbox, .. } => {
                simcall.call = SimcallCall::CommIsend;
                simcall.mailbox = *mailbox;
                simcall.buffer = actor.buffer();
                simcall.buffer_size = 1;
            }
            Op::Irecv { mailbox } => {
                simcall.call = SimcallCall::CommIrecv;
                simcall.mailbox = *mailbox;
                simcall.buffer = actor.buffer();
                simcall.buffer_size = 1;
            }
            Op::Wait => {
                simcall.call = SimcallCall::CommWait;
                if let Some(&comm) = actor.pending.last() {
                    simcall.comm = comm;
                    simcall.comm_info = Some(self.comm_info(comm));
                }
            }
            Op::WaitAny => {
                simcall.call = SimcallCall::CommWaitany;
                simcall.comms = actor.pending.clone();
                simcall.comms_info = actor.pending.iter().map(|&c| self.comm_info(c)).collect();
            }
            Op::Random { min, max } => {
                simcall.call = SimcallCall::Random;
                simcall.min = *min;
                simcall.max = *max;
            }
            Op::Lock(mutex) => {
                simcall.call = SimcallCall::MutexLock;
                simcall.mutex = *mutex;
            }
            Op::Unlock(mutex) => {
                simcall.call = SimcallCall::MutexUnlock;
                simcall.mutex = *mutex;
            }
            Op::AssertReceived(_) | Op::Set(..) | Op::Goto(_) => {}
        }
        simcall
    }

    /// Match a new comm against the oldest opposite one on its mailbox, or
    /// queue it there.
    fn start_comm(&mut self, pid: u64, kind: CommKind, mailbox: u64, buffer: u64, data: u8) -> u64 {
        let queue = self.world.mailboxes.entry(mailbox).or_default();
        let matching = queue
            .iter()
            .position(|c| self.world.comms.get(c).is_some_and(|c| c.kind != kind));
        if let Some(position) = matching {
            if let Some(address) = queue.remove(position) {
                if let Some(comm) = self.world.comms.get_mut(&address) {
                    match kind {
                        CommKind::Send => {
                            comm.src = Some(pid);
                            comm.src_buff = buffer;
                            comm.data = data;
                        }
                        CommKind::Receive => {
                            comm.dst = Some(pid);
                            comm.dst_buff = buffer;
                        }
                    }
                }
                return address;
            }
        }

        self.world.next_comm += 1;
        let address = 0x1000 + self.world.next_comm * 0x40;
        let (src, dst, src_buff, dst_buff) = match kind {
            CommKind::Send => (Some(pid), None, buffer, 0),
            CommKind::Receive => (None, Some(pid), 0, buffer),
        };
        self.world.comms.insert(
            address,
            Comm {
                kind,
                mailbox,
                src,
                dst,
                src_buff,
                dst_buff,
                data,
                done: false,
            },
        );
        queue.push_back(address);
        address
    }

    fn finish_comm(&mut self, pid: u64, address: u64) -> Result<(), McError> {
        let comm = self
            .world
            .comms
            .get_mut(&address)
            .ok_or_else(|| McError::Inconsistent(format!("no comm {address:#x}")))?;
        comm.done = true;
        let delivered = (comm.dst == Some(pid)).then_some(comm.data);
        if let Some(byte) = delivered {
            self.actor_mut(pid)?.received.push(byte);
        }
        Ok(())
    }

    fn run_local_ops(&mut self) -> Result<(), McError> {
        let World { actors, props, .. } = &mut self.world;
        for actor in actors.iter_mut() {
            while let Some(op) = actor.op().filter(|op| op.is_local()).cloned() {
                actor.pc += 1;
                match op {
                    Op::AssertReceived(expected) => {
                        if actor.received != expected {
                            return Err(McError::AssertionFailed);
                        }
                    }
                    Op::Set(name, value) => {
                        props.insert(name.to_owned(), value);
                    }
                    Op::Goto(target) => actor.pc = target,
                    _ => unreachable!(),
                }
            }
        }
        Ok(())
    }
}

impl Session for ToySession {
    type Snapshot = World;

    fn initialize(&mut self) -> Result<(), McError> {
        self.world = World {
            actors: self
                .programs
                .iter()
                .enumerate()
                .map(|(i, program)| Actor {
                    pid: i as u64 + 1,
                    program: Rc::clone(program),
                    pc: 0,
                    pending: Vec::new(),
                    last_result: 0,
                    received: Vec::new(),
                    random: None,
                })
                .collect(),
            props: self
                .propositions
                .iter()
                .map(|name| (name.clone(), false))
                .collect(),
            ..World::default()
        };
        self.run_local_ops()?;
        self.initial = Some(self.world.clone());
        Ok(())
    }

    fn actors(&mut self) -> Result<Vec<ActorInfo>, McError> {
        Ok(self
            .world
            .actors
            .iter()
            .filter(|a| !a.is_finished())
            .map(|a| ActorInfo {
                pid: a.pid,
                name: format!("actor{}", a.pid),
                host: format!("node{}", a.pid),
                simcall: self.simcall(a),
            })
            .collect())
    }

    fn actor_is_enabled(&mut self, pid: u64) -> Result<bool, McError> {
        let actor = self.actor(pid)?;
        Ok(match actor.op() {
            Some(Op::Wait) => actor.pending.last().is_some_and(|&c| self.is_matched(c)),
            Some(Op::WaitAny) => actor.pending.iter().any(|&c| self.is_matched(c)),
            Some(Op::Lock(mutex)) => self
                .world
                .mutexes
                .get(mutex)
                .map_or(true, |&owner| owner == pid),
            _ => true,
        })
    }

    fn handle_simcall(&mut self, transition: Transition) -> Result<(), McError> {
        let pid = transition.pid;
        if !self.actor_is_enabled(pid)? {
            return Err(McError::Inconsistent(format!("actor {pid} is not enabled")));
        }
        let actor = self.actor(pid)?;
        let op = actor.op().cloned();
        let buffer = actor.buffer();

        let mut result = 0;
        match op {
            Some(Op::Isend { mailbox, data }) => {
                result = self.start_comm(pid, CommKind::Send, mailbox, buffer, data);
                self.actor_mut(pid)?.pending.push(result);
            }
            Some(Op::Irecv { mailbox }) => {
                result = self.start_comm(pid, CommKind::Receive, mailbox, buffer, 0);
                self.actor_mut(pid)?.pending.push(result);
            }
            Some(Op::Wait) => {
                let comm = self.actor_mut(pid)?.pending.pop();
                if let Some(comm) = comm {
                    self.finish_comm(pid, comm)?;
                }
            }
            Some(Op::WaitAny) => {
                let actor = self.actor_mut(pid)?;
                let index = usize::try_from(transition.argument)
                    .ok()
                    .filter(|&i| i < actor.pending.len())
                    .ok_or_else(|| {
                        McError::Inconsistent(format!("bad waitany index {}", transition.argument))
                    })?;
                let comm = actor.pending.remove(index);
                self.finish_comm(pid, comm)?;
            }
            Some(Op::Random { .. }) => {
                self.actor_mut(pid)?.random = Some(i64::from(transition.argument));
            }
            Some(Op::Lock(mutex)) => {
                self.world.mutexes.insert(mutex, pid);
            }
            Some(Op::Unlock(mutex)) => {
                self.world.mutexes.remove(&mutex);
            }
            _ => return Err(McError::Inconsistent(format!("actor {pid} has no simcall"))),
        }

        let actor = self.actor_mut(pid)?;
        actor.last_result = result;
        actor.pc += 1;
        Ok(())
    }

    fn wait_for_requests(&mut self) -> Result<(), McError> {
        self.run_local_ops()
    }

    fn check_deadlock(&mut self) -> Result<bool, McError> {
        let live: Vec<u64> = self
            .world
            .actors
            .iter()
            .filter(|a| !a.is_finished())
            .map(|a| a.pid)
            .collect();
        if live.is_empty() {
            return Ok(false);
        }
        for pid in live {
            if self.actor_is_enabled(pid)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn take_snapshot(&mut self, _num: u64) -> Result<World, McError> {
        self.snapshots_taken += 1;
        Ok(self.world.clone())
    }

    fn restore_snapshot(&mut self, snapshot: &World) -> Result<(), McError> {
        self.world = snapshot.clone();
        Ok(())
    }

    fn restore_initial_state(&mut self) -> Result<(), McError> {
        let initial = self
            .initial
            .clone()
            .ok_or_else(|| McError::Inconsistent("not initialized".into()))?;
        self.world = initial;
        Ok(())
    }

    fn snapshot_equal(&self, s1: &World, s2: &World) -> bool {
        s1 == s2
    }

    fn snapshot_key(&self, snapshot: &World) -> (usize, u64) {
        let live = snapshot.actors.iter().filter(|a| !a.is_finished()).count();
        let pending = snapshot.actors.iter().map(|a| a.pending.len() as u64).sum();
        (live, pending)
    }

    fn proposition_names(&self) -> Vec<String> {
        self.propositions.clone()
    }

    fn proposition_value(&mut self, name: &str) -> Result<bool, McError> {
        self.world
            .props
            .get(name)
            .copied()
            .ok_or_else(|| McError::Inconsistent(format!("unknown proposition {name}")))
    }

    fn last_result(&mut self, pid: u64) -> Result<Option<u64>, McError> {
        Ok(self
            .world
            .actors
            .iter()
            .find(|a| a.pid == pid)
            .map(|a| a.last_result))
    }

    fn read_comm(&mut self, address: u64) -> Result<CommInfo, McError> {
        if !self.world.comms.contains_key(&address) {
            return Err(McError::Inconsistent(format!("no comm {address:#x}")));
        }
        Ok(self.comm_info(address))
    }

    fn read_bytes(&mut self, address: u64, size: u64) -> Result<Vec<u8>, McError> {
        let comm = self
            .world
            .comms
            .values()
            .find(|c| c.src_buff == address)
            .ok_or_else(|| McError::Inconsistent(format!("no buffer at {address:#x}")))?;
        Ok(vec![comm.data; size as usize])
    }
}

/// Explore `programs` with `config`.
pub fn check(programs: Vec<Vec<Op>>, config: &CheckerConfig) -> Result<ExplorationReport, ExploreError> {
    let mut session = ToySession::new(programs);
    explore(&mut session, config)
}

/// Actor that receives twice on mailbox 0 and expects `[1, 2]`, against two
/// senders of `1` and `2`.
pub fn racing_senders() -> Vec<Vec<Op>> {
    vec![
        vec![
            Op::Irecv { mailbox: 0 },
            Op::Wait,
            Op::Irecv { mailbox: 0 },
            Op::Wait,
            Op::AssertReceived(vec![1, 2]),
        ],
        vec![Op::Isend { mailbox: 0, data: 1 }, Op::Wait],
        vec![Op::Isend { mailbox: 0, data: 2 }, Op::Wait],
    ]
}
