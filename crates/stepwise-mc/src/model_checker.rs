//! Supervision of the checked process and its control channel.
//!
//! The checked process runs until it reaches a decision point, announced
//! with a `WAITING` message.  Everything it sends before that (ignored
//! regions, stacks, propositions) is applied to the [`RemoteSimulation`].
//! Process-level events arrive through a `signalfd` for `SIGCHLD` and are
//! drained with `waitpid`.

use std::cell::RefCell;
use std::fmt;
use std::os::fd::AsFd;
use std::rc::Rc;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::ptrace;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use stepwise_protocol::layout::{SavedContext, CONTEXT_WRAPPER_SYMBOL};
use stepwise_protocol::{ExitStatus, Message, ProtocolError, MESSAGE_LENGTH};
use thiserror::Error;

use crate::address::remote;
use crate::channel::{Received, TransportError};
use crate::remote::{RemoteError, RemoteSimulation};
use crate::snapshot::stack::unwind;
use crate::snapshot::{PageStore, Snapshot, SnapshotConfig, SnapshotError};

#[derive(Error, Debug)]
pub enum McError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("process control failed: {0}")]
    Errno(#[from] Errno),

    #[error("the checked process crashed: {0}")]
    ProcessCrashed(Crash),

    #[error("an assertion failed in the checked process")]
    AssertionFailed,

    #[error("received {got} while expecting {expected}")]
    UnexpectedMessage {
        got: &'static str,
        expected: &'static str,
    },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("cannot start {program}: {source}")]
    StartFailed {
        program: String,
        source: std::io::Error,
    },
}

/// How the checked process died.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Crash {
    pub signal: Option<Signal>,
    pub exit_code: Option<i32>,
    pub core_dumped: bool,
    /// Function names of each registered stack, innermost frame first.
    pub stacks: Vec<Vec<String>>,
}

impl fmt::Display for Crash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.signal, self.exit_code) {
            (Some(signal), _) => write!(f, "killed by signal {signal}")?,
            (None, Some(code)) => write!(f, "exited with code {code}")?,
            (None, None) => write!(f, "terminated")?,
        }
        if self.core_dumped {
            write!(f, " (core dumped)")?;
        }
        Ok(())
    }
}

/// A named boolean read from the checked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposition {
    pub name: String,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCheckerStats {
    pub executed_transitions: u64,
    pub messages: u64,
}

pub struct ModelChecker {
    process: RemoteSimulation,
    page_store: Rc<RefCell<PageStore>>,
    signal_fd: Option<SignalFd>,
    propositions: Vec<Proposition>,
    stats: ModelCheckerStats,
    /// The process is our child and is killed with us.
    owns_process: bool,
}

impl ModelChecker {
    /// Supervise an already attached process.
    pub fn new(process: RemoteSimulation) -> Self {
        Self {
            process,
            page_store: Rc::new(RefCell::new(PageStore::new(500))),
            signal_fd: None,
            propositions: Vec::new(),
            stats: ModelCheckerStats::default(),
            owns_process: false,
        }
    }

    pub(crate) fn for_child(process: RemoteSimulation) -> Self {
        let mut checker = Self::new(process);
        checker.owns_process = true;
        checker
    }

    pub fn process(&self) -> &RemoteSimulation {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut RemoteSimulation {
        &mut self.process
    }

    pub fn page_store(&self) -> &Rc<RefCell<PageStore>> {
        &self.page_store
    }

    pub fn propositions(&self) -> &[Proposition] {
        &self.propositions
    }

    pub fn stats(&self) -> ModelCheckerStats {
        self.stats
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Lifecycle
    // ═══════════════════════════════════════════════════════════════════

    /// Take control of a freshly launched child.
    ///
    /// The child requested tracing before exec, so it first stops on the exec
    /// trap, then stops itself with `SIGSTOP` once connected.
    pub fn start(&mut self) -> Result<(), McError> {
        let pid = self.process.pid();
        self.signal_fd = Some(sigchld_fd()?);

        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL))? {
                WaitStatus::Stopped(_, Signal::SIGSTOP) => break,
                WaitStatus::Stopped(_, Signal::SIGTRAP) => ptrace::cont(pid, None)?,
                WaitStatus::Stopped(_, signal) => ptrace::cont(pid, Some(signal))?,
                WaitStatus::Exited(_, code) => {
                    self.process.terminate();
                    return Err(McError::ProcessCrashed(Crash {
                        exit_code: Some(code),
                        ..Crash::default()
                    }));
                }
                WaitStatus::Signaled(_, signal, core_dumped) => {
                    self.process.terminate();
                    return Err(McError::ProcessCrashed(Crash {
                        signal: Some(signal),
                        core_dumped,
                        ..Crash::default()
                    }));
                }
                _ => {}
            }
        }

        self.process.init()?;
        self.setup_ignore();

        ptrace::setoptions(pid, ptrace::Options::PTRACE_O_TRACEEXIT)?;
        ptrace::cont(pid, None)?;
        info!("checking process {pid}");
        Ok(())
    }

    /// Locals and globals that only hold bookkeeping.
    fn setup_ignore(&mut self) {
        for local in ["e", "_log_ev", "start_time"] {
            self.process.ignore_local_variable(local, "*");
        }
        self.process.ignore_global_variable("counter");
    }

    /// Kill the child if it is still around.
    pub fn shutdown(&mut self) {
        if !self.owns_process || !self.process.running() {
            return;
        }
        let pid = self.process.pid();
        debug!("killing process {pid}");
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("cannot kill process {pid}: {e}"),
        }
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => debug!("process {pid} reaped: {status:?}"),
            Err(e) => debug!("cannot reap process {pid}: {e}"),
        }
        self.process.terminate();
    }

    /// Kill the checked process and exit with `status`.
    pub fn exit(&mut self, status: ExitStatus) -> ! {
        self.shutdown();
        std::process::exit(status.code())
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Stepping
    // ═══════════════════════════════════════════════════════════════════

    pub fn resume(&mut self) -> Result<(), McError> {
        self.process.channel().send(&Message::Continue)?;
        self.process.clear_cache();
        Ok(())
    }

    /// Let the checked process run to its next decision point.
    pub fn wait_for_requests(&mut self) -> Result<(), McError> {
        self.resume()?;
        self.dispatch()
    }

    /// Execute one transition: the pending simcall of `pid` with `value`.
    pub fn handle_simcall(&mut self, pid: u64, value: i32) -> Result<(), McError> {
        self.process
            .channel()
            .send(&Message::SimcallHandle { pid, value })?;
        self.process.clear_cache();
        self.stats.executed_transitions += 1;
        self.dispatch()
    }

    /// Whether no actor can run anymore while some are still alive.
    pub fn check_deadlock(&mut self) -> Result<bool, McError> {
        match self.request(&Message::DeadlockCheck)? {
            Message::DeadlockCheckReply { deadlock } => Ok(deadlock),
            other => Err(McError::UnexpectedMessage {
                got: other.message_type().name(),
                expected: "DEADLOCK_CHECK_REPLY",
            }),
        }
    }

    /// Whether the pending simcall of `aid` can be executed.
    pub fn actor_is_enabled(&mut self, aid: u64) -> Result<bool, McError> {
        match self.request(&Message::ActorEnabled { aid })? {
            Message::ActorEnabledReply { enabled } => Ok(enabled),
            other => Err(McError::UnexpectedMessage {
                got: other.message_type().name(),
                expected: "ACTOR_ENABLED_REPLY",
            }),
        }
    }

    fn request(&mut self, message: &Message) -> Result<Message, McError> {
        let channel = self.process.channel();
        channel.send(message)?;
        let mut buf = [0u8; MESSAGE_LENGTH];
        match channel.receive(&mut buf, true)? {
            Received::Record(len) => Ok(Message::decode(&buf[..len])?),
            Received::WouldBlock => Err(McError::Inconsistent(
                "blocking receive returned without data".into(),
            )),
        }
    }

    pub fn take_snapshot(
        &mut self,
        num_state: u64,
        config: &SnapshotConfig,
    ) -> Result<Snapshot, McError> {
        Ok(Snapshot::take(
            &mut self.process,
            &self.page_store,
            num_state,
            config,
        )?)
    }

    pub fn restore_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), McError> {
        snapshot.restore(&mut self.process)?;
        Ok(())
    }

    /// Current value of a registered proposition.
    pub fn proposition_value(&self, name: &str) -> Result<bool, McError> {
        let proposition = self
            .propositions
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| RemoteError::SymbolNotFound(name.to_owned()))?;
        let value: i32 = self.process.read(remote(proposition.address))?;
        Ok(value != 0)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Event loop
    // ═══════════════════════════════════════════════════════════════════

    /// Handle events until the checked process waits or goes away.
    fn dispatch(&mut self) -> Result<(), McError> {
        let mut buf = [0u8; MESSAGE_LENGTH];
        while self.process.running() {
            let (socket_ready, signal_ready) = self.poll_events()?;
            if socket_ready {
                match self.process.channel().receive(&mut buf, false) {
                    Ok(Received::Record(len)) => {
                        if !self.handle_message(&buf[..len])? {
                            return Ok(());
                        }
                    }
                    Ok(Received::WouldBlock) => {}
                    Err(TransportError::Closed) => {
                        debug!("channel closed by the checked process");
                        return self.wait_for_exit();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            if signal_ready {
                self.drain_signals();
                self.handle_waitpid()?;
            }
        }
        Ok(())
    }

    fn poll_events(&self) -> Result<(bool, bool), McError> {
        let mut fds = vec![PollFd::new(self.process.channel().as_fd(), PollFlags::POLLIN)];
        if let Some(signal_fd) = &self.signal_fd {
            fds.push(PollFd::new(signal_fd.as_fd(), PollFlags::POLLIN));
        }
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
        Ok((ready(&fds[0]), fds.get(1).is_some_and(ready)))
    }

    fn drain_signals(&mut self) {
        if let Some(signal_fd) = &mut self.signal_fd {
            while let Ok(Some(_)) = signal_fd.read_signal() {}
        }
    }

    /// The channel is gone: only process events remain.
    fn wait_for_exit(&mut self) -> Result<(), McError> {
        if self.signal_fd.is_none() {
            self.handle_waitpid()?;
            if self.process.running() {
                return Err(TransportError::Closed.into());
            }
            return Ok(());
        }
        while self.process.running() {
            let (_, signal_ready) = self.poll_events()?;
            if signal_ready {
                self.drain_signals();
                self.handle_waitpid()?;
            }
        }
        Ok(())
    }

    /// Apply one message.  Returns `false` once the process waits.
    fn handle_message(&mut self, bytes: &[u8]) -> Result<bool, McError> {
        let message = Message::decode(bytes)?;
        self.stats.messages += 1;
        match message {
            Message::IgnoreHeap(region) => self.process.ignore_heap(region),
            Message::UnignoreHeap { address, size } => self.process.unignore_heap(address, size),
            Message::IgnoreMemory { address, size } => self.process.ignore_region(address, size),
            Message::StackRegion(region) => self.process.add_stack_area(region),
            Message::RegisterSymbol {
                name,
                callback,
                data,
            } => {
                if callback != 0 {
                    return Err(McError::Unsupported(
                        "propositions evaluated by callback".into(),
                    ));
                }
                let name = name
                    .as_str()
                    .ok_or_else(|| McError::Inconsistent("proposition name is not UTF-8".into()))?
                    .to_owned();
                debug!("new proposition {name} at {data:#x}");
                self.propositions.push(Proposition {
                    name,
                    address: data,
                });
            }
            Message::Waiting => return Ok(false),
            Message::AssertionFailed => return Err(McError::AssertionFailed),
            other => {
                return Err(McError::UnexpectedMessage {
                    got: other.message_type().name(),
                    expected: "a notification from the checked process",
                })
            }
        }
        Ok(true)
    }

    /// Drain pending child status changes.
    pub fn handle_waitpid(&mut self) -> Result<(), McError> {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
        loop {
            let status = match waitpid(Pid::from_raw(-1), Some(flags)) {
                Ok(WaitStatus::StillAlive) => return Ok(()),
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    if self.process.running() {
                        return Err(McError::Inconsistent(
                            "no child process while the checked process is running".into(),
                        ));
                    }
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            let Some(pid) = status.pid() else {
                continue;
            };
            if pid != self.process.pid() {
                debug!("ignoring status of unrelated child {pid}");
                continue;
            }

            match status {
                WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_EXIT => {
                    let raw = ptrace::getevent(pid)? as i32;
                    if libc::WIFSIGNALED(raw) {
                        let crash = Crash {
                            signal: Signal::try_from(libc::WTERMSIG(raw)).ok(),
                            exit_code: None,
                            core_dumped: libc::WCOREDUMP(raw),
                            stacks: self.dump_stacks(),
                        };
                        error!("checked process {pid} is dying: {crash}");
                        self.shutdown();
                        self.process.terminate();
                        return Err(McError::ProcessCrashed(crash));
                    }
                    ptrace::cont(pid, None)?;
                }
                WaitStatus::PtraceEvent(_, _, _) => ptrace::cont(pid, None)?,
                WaitStatus::Stopped(_, signal) => {
                    debug!("reinjecting {signal} into {pid}");
                    ptrace::cont(pid, Some(signal))?;
                }
                WaitStatus::Signaled(_, signal, core_dumped) => {
                    self.process.terminate();
                    return Err(McError::ProcessCrashed(Crash {
                        signal: Some(signal),
                        core_dumped,
                        ..Crash::default()
                    }));
                }
                WaitStatus::Exited(_, code) => {
                    self.process.terminate();
                    if code != 0 {
                        return Err(McError::ProcessCrashed(Crash {
                            exit_code: Some(code),
                            ..Crash::default()
                        }));
                    }
                    info!("checked process {pid} exited");
                }
                _ => {}
            }
        }
    }

    /// Best-effort function names of every registered stack.
    pub fn dump_stacks(&self) -> Vec<Vec<String>> {
        let mut stacks = Vec::new();
        #[cfg(target_arch = "x86_64")]
        if let Ok(regs) = ptrace::getregs(self.process.pid()) {
            let context = SavedContext {
                ip: regs.rip,
                sp: regs.rsp,
                fp: regs.rbp,
            };
            stacks.push(self.frame_names(context));
        }
        for area in self.process.stack_areas() {
            match self.process.read::<SavedContext>(remote(area.context)) {
                Ok(context) => stacks.push(self.frame_names(context)),
                Err(e) => debug!("cannot read context of stack {:#x}: {e}", area.address),
            }
        }
        stacks
    }

    fn frame_names(&self, context: SavedContext) -> Vec<String> {
        match unwind(&self.process, context, None) {
            Ok(frames) => frames
                .into_iter()
                .map(|f| {
                    if f.frame_name.is_empty() {
                        format!("{:#x}", f.ip)
                    } else if f.frame_name == CONTEXT_WRAPPER_SYMBOL {
                        f.frame_name
                    } else {
                        format!("{} ({:#x})", f.frame_name, f.ip)
                    }
                })
                .collect(),
            Err(e) => vec![format!("<unwind failed: {e}>")],
        }
    }
}

impl Drop for ModelChecker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ModelChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelChecker")
            .field("process", &self.process)
            .field("propositions", &self.propositions)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn sigchld_fd() -> Result<SignalFd, Errno> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block()?;
    SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use nix::unistd::getpid;
    use stepwise_protocol::{StackRegion, SymbolName};
    use stepwise_sdk::heap::HeapArena;

    fn checker() -> (ModelChecker, Channel) {
        let (ours, peer) = Channel::pair().unwrap();
        let process = RemoteSimulation::new(getpid(), ours).unwrap();
        (ModelChecker::new(process), peer)
    }

    fn next_message(peer: &Channel) -> Message {
        let mut buf = [0u8; MESSAGE_LENGTH];
        let Received::Record(len) = peer.receive(&mut buf, true).unwrap() else {
            panic!("expected a record");
        };
        Message::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn resume_sends_continue_and_clears_cache() {
        let (mut mc, peer) = checker();
        let arena = HeapArena::new(2).unwrap();
        mc.process_mut()
            .set_heap_address(remote(arena.descriptor_address()));
        mc.process_mut().get_heap().unwrap();
        assert_ne!(mc.process().cache_flags(), 0);

        mc.resume().unwrap();
        assert_eq!(next_message(&peer), Message::Continue);
        assert_eq!(mc.process().cache_flags(), 0);
    }

    #[test]
    fn declarations_are_applied_until_waiting() {
        let (mut mc, peer) = checker();
        let flag = Box::new(1i32);
        peer.send(&Message::IgnoreMemory {
            address: 0x1000,
            size: 8,
        })
        .unwrap();
        peer.send(&Message::StackRegion(StackRegion {
            address: 0x7000,
            size: 0x1000,
            ..Default::default()
        }))
        .unwrap();
        peer.send(&Message::RegisterSymbol {
            name: SymbolName::new("ready"),
            callback: 0,
            data: &*flag as *const i32 as u64,
        })
        .unwrap();
        peer.send(&Message::Waiting).unwrap();

        mc.wait_for_requests().unwrap();
        assert_eq!(next_message(&peer), Message::Continue);
        assert_eq!(mc.process().ignored_regions().len(), 1);
        assert_eq!(mc.process().stack_areas().len(), 1);
        assert_eq!(mc.propositions()[0].name, "ready");
        assert!(mc.proposition_value("ready").unwrap());
        assert!(mc.proposition_value("missing").is_err());
        assert_eq!(mc.stats().messages, 4);
    }

    #[test]
    fn handle_simcall_sends_the_transition() {
        let (mut mc, peer) = checker();
        peer.send(&Message::Waiting).unwrap();
        mc.handle_simcall(3, 1).unwrap();
        assert_eq!(next_message(&peer), Message::SimcallHandle { pid: 3, value: 1 });
        assert_eq!(mc.stats().executed_transitions, 1);
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let (mut mc, peer) = checker();
        peer.send_bytes(&[0xff, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            mc.wait_for_requests(),
            Err(McError::Protocol(ProtocolError::UnknownTag(0xff)))
        ));
    }

    #[test]
    fn wrong_size_is_a_protocol_error() {
        let (mut mc, peer) = checker();
        let mut bytes = [0u8; 16];
        bytes[0] = 9;
        peer.send_bytes(&bytes).unwrap();
        assert!(matches!(
            mc.wait_for_requests(),
            Err(McError::Protocol(ProtocolError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn assertion_failure_stops_dispatch() {
        let (mut mc, peer) = checker();
        peer.send(&Message::AssertionFailed).unwrap();
        assert!(matches!(
            mc.wait_for_requests(),
            Err(McError::AssertionFailed)
        ));
    }

    #[test]
    fn checker_side_messages_are_rejected() {
        let (mut mc, peer) = checker();
        peer.send(&Message::Continue).unwrap();
        assert!(matches!(
            mc.wait_for_requests(),
            Err(McError::UnexpectedMessage { got: "CONTINUE", .. })
        ));
    }

    #[test]
    fn callback_propositions_are_unsupported() {
        let (mut mc, peer) = checker();
        peer.send(&Message::RegisterSymbol {
            name: SymbolName::new("p"),
            callback: 0x1234,
            data: 0,
        })
        .unwrap();
        assert!(matches!(
            mc.wait_for_requests(),
            Err(McError::Unsupported(_))
        ));
    }

    #[test]
    fn deadlock_check_reads_one_reply() {
        let (mut mc, peer) = checker();
        peer.send(&Message::DeadlockCheckReply { deadlock: true })
            .unwrap();
        assert!(mc.check_deadlock().unwrap());
        assert_eq!(next_message(&peer), Message::DeadlockCheck);

        peer.send(&Message::Waiting).unwrap();
        assert!(matches!(
            mc.check_deadlock(),
            Err(McError::UnexpectedMessage { .. })
        ));
    }

    #[test]
    fn actor_enabled_query() {
        let (mut mc, peer) = checker();
        peer.send(&Message::ActorEnabledReply { enabled: false })
            .unwrap();
        assert!(!mc.actor_is_enabled(2).unwrap());
        assert_eq!(next_message(&peer), Message::ActorEnabled { aid: 2 });
    }

    #[test]
    fn shutdown_leaves_foreign_processes_alone() {
        let (mut mc, _peer) = checker();
        mc.shutdown();
        assert!(mc.process().running());
    }

    #[test]
    fn shutdown_kills_and_reaps_owned_child() {
        let child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        let (ours, _peer) = Channel::pair().unwrap();
        let mut mc = ModelChecker::for_child(RemoteSimulation::new(pid, ours).unwrap());
        assert!(mc.owns_process);

        mc.shutdown();
        assert!(!mc.process().running());
        assert_eq!(kill(pid, None::<Signal>), Err(Errno::ESRCH));
    }

    #[test]
    fn crash_descriptions() {
        let crash = Crash {
            signal: Some(Signal::SIGSEGV),
            core_dumped: true,
            ..Crash::default()
        };
        assert_eq!(crash.to_string(), "killed by signal SIGSEGV (core dumped)");
        let exit = Crash {
            exit_code: Some(3),
            ..Crash::default()
        };
        assert_eq!(exit.to_string(), "exited with code 3");
    }
}
