//! The checked process's end of the control channel.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::signal::{raise, Signal};
use nix::sys::socket::{recv, send, MsgFlags};
use stepwise_protocol::{Message, ProtocolError, MESSAGE_LENGTH, SOCKET_FD_ENV};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("{env} is not set: not running under the model checker", env = SOCKET_FD_ENV)]
    NotUnderChecker,

    #[error("invalid socket {0:?} in {env}", env = SOCKET_FD_ENV)]
    InvalidSocket(String),

    #[error("the model checker closed the channel")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("unexpected message {0} from the model checker")]
    Unexpected(&'static str),

    #[error("{0:#x} is not in a busy heap allocation")]
    NotInHeap(u64),

    #[error("channel I/O error: {0}")]
    Os(#[from] Errno),
}

/// What the client needs from the simulation it runs.
pub trait Simulation {
    /// Run every actor that can progress without a decision, until each
    /// one is blocked on a simcall or finished.
    fn run(&mut self);

    /// Some actor is blocked and none can be scheduled.
    fn is_deadlocked(&self) -> bool;

    /// The pending simcall of `aid` may be executed now.
    fn actor_enabled(&self, aid: u64) -> bool;

    /// Execute the pending simcall of `aid`, with `value` selecting among
    /// its outcomes (waitany index, random value).
    fn execute(&mut self, aid: u64, value: i32);

    /// Map privatization segment `index`.  Simulations without private
    /// segments have nothing to do.
    fn restore_segment(&mut self, index: i32) {
        debug!("ignoring restore of segment {index}");
    }
}

/// Parse the socket number exported by the checker.
pub fn socket_from_env(value: Option<&str>) -> Result<RawFd, ClientError> {
    let value = value.ok_or(ClientError::NotUnderChecker)?;
    match value.trim().parse::<RawFd>() {
        Ok(fd) if fd >= 0 => Ok(fd),
        _ => Err(ClientError::InvalidSocket(value.to_owned())),
    }
}

#[derive(Debug)]
pub struct Client {
    socket: OwnedFd,
}

impl Client {
    pub fn from_fd(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// Take over the socket named by the environment, without stopping.
    pub fn connect() -> Result<Self, ClientError> {
        let value = std::env::var(SOCKET_FD_ENV).ok();
        let fd = socket_from_env(value.as_deref())?;
        // SAFETY: F_GETFD only inspects the descriptor.
        if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
            return Err(ClientError::InvalidSocket(fd.to_string()));
        }
        // SAFETY: the checker handed this descriptor to us and nothing else
        // in the process owns it.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self::from_fd(socket))
    }

    /// Connect, stop so the checker can inspect us, and wait for the first
    /// CONTINUE.
    pub fn initialize() -> Result<Self, ClientError> {
        let client = Self::connect()?;
        debug!("connected to the model checker, stopping");
        raise(Signal::SIGSTOP)?;
        loop {
            match client.receive()? {
                Message::Continue => break,
                other => return Err(ClientError::Unexpected(other.message_type().name())),
            }
        }
        Ok(client)
    }

    pub fn send(&self, message: &Message) -> Result<(), ClientError> {
        let mut buf = [0u8; MESSAGE_LENGTH];
        let len = message.encode(&mut buf);
        trace!("client send {}", message.message_type().name());
        loop {
            match send(self.socket.as_raw_fd(), &buf[..len], MsgFlags::MSG_NOSIGNAL) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => return Err(ClientError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block for the next message.
    pub fn receive(&self) -> Result<Message, ClientError> {
        let mut buf = [0u8; MESSAGE_LENGTH];
        loop {
            match recv(self.socket.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                Ok(0) => return Err(ClientError::Closed),
                Ok(n) => return Ok(Message::decode(&buf[..n])?),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(ClientError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Serve the checker until it goes away.
    ///
    /// Each round runs the simulation to its next decision point, reports
    /// WAITING, then answers queries until told to go on, either with
    /// CONTINUE or by a SIMCALL_HANDLE that was just executed.
    pub fn main_loop<S: Simulation>(&self, simulation: &mut S) -> Result<(), ClientError> {
        match self.serve(simulation) {
            Err(ClientError::Closed) => {
                debug!("model checker gone, leaving the main loop");
                Ok(())
            }
            other => other,
        }
    }

    fn serve<S: Simulation>(&self, simulation: &mut S) -> Result<(), ClientError> {
        loop {
            simulation.run();
            self.send(&Message::Waiting)?;
            loop {
                match self.receive()? {
                    Message::DeadlockCheck => {
                        let deadlock = simulation.is_deadlocked();
                        self.send(&Message::DeadlockCheckReply { deadlock })?;
                    }
                    Message::ActorEnabled { aid } => {
                        let enabled = simulation.actor_enabled(aid);
                        self.send(&Message::ActorEnabledReply { enabled })?;
                    }
                    Message::Restore { index } => simulation.restore_segment(index),
                    Message::SimcallHandle { pid, value } => {
                        simulation.execute(pid, value);
                        break;
                    }
                    Message::Continue => break,
                    other => return Err(ClientError::Unexpected(other.message_type().name())),
                }
            }
        }
    }
}
