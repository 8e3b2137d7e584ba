//! Message-boundary-preserving transport to the checked process.

use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

use log::trace;
use nix::errno::Errno;
use nix::sys::socket::{recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType};
use stepwise_protocol::{Message, MESSAGE_LENGTH};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("channel closed by peer")]
    Closed,

    #[error("short write on channel: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("channel I/O error: {0}")]
    Os(#[from] Errno),
}

/// Outcome of a receive that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// One record of this many bytes.
    Record(usize),
    /// Non-blocking receive with nothing pending.
    WouldBlock,
}

/// One end of a `SOCK_SEQPACKET` socket.
///
/// Moving a `Channel` moves the descriptor; dropping it closes it.
#[derive(Debug)]
pub struct Channel {
    socket: OwnedFd,
}

impl Channel {
    pub fn new(socket: OwnedFd) -> Self {
        Self { socket }
    }

    /// A connected pair, both ends close-on-exec.
    pub fn pair() -> Result<(Channel, Channel), TransportError> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Channel::new(a), Channel::new(b)))
    }

    pub fn send(&self, message: &Message) -> Result<(), TransportError> {
        let mut buf = [0u8; MESSAGE_LENGTH];
        let len = message.encode(&mut buf);
        trace!("channel send {:?}", message.message_type());
        self.send_bytes(&buf[..len])
    }

    /// Send one raw record.
    pub fn send_bytes(&self, bytes: &[u8]) -> Result<(), TransportError> {
        match send(self.socket.as_raw_fd(), bytes, MsgFlags::MSG_NOSIGNAL) {
            Ok(n) if n == bytes.len() => Ok(()),
            Ok(n) => Err(TransportError::ShortWrite {
                written: n,
                expected: bytes.len(),
            }),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => Err(TransportError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    /// Receive one record into `buf`.
    ///
    /// A zero-length read means the peer is gone and is reported as
    /// [`TransportError::Closed`].
    pub fn receive(&self, buf: &mut [u8], blocking: bool) -> Result<Received, TransportError> {
        let flags = if blocking {
            MsgFlags::empty()
        } else {
            MsgFlags::MSG_DONTWAIT
        };
        loop {
            match recv(self.socket.as_raw_fd(), buf, flags) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => return Ok(Received::Record(n)),
                Err(Errno::EAGAIN) if !blocking => return Ok(Received::WouldBlock),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECONNRESET) => return Err(TransportError::Closed),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}
