//! Wire protocol between the stepwise model checker and the checked process.
//!
//! This crate defines the message tags, the fixed-size record encoding used
//! on the control socket, the exit statuses of the checker, and (in
//! [`layout`]) the `repr(C)` structures the checked process publishes in its
//! own memory for the checker to read.  It is `no_std`-compatible with zero
//! dependencies.
//!
//! # Transport
//!
//! Both sides share one end each of a `SOCK_SEQPACKET` socketpair, so every
//! `send` is delivered as exactly one record:
//!
//! 1. The checker launches the program with the child's socket number in
//!    [`SOCKET_FD_ENV`] and tracing requested.
//! 2. The checked process raises `SIGSTOP` once connected.
//! 3. The checker sends [`Message::Continue`]; the process runs until every
//!    actor is blocked on a simcall and answers [`Message::Waiting`].
//! 4. The checker picks a transition and sends [`Message::SimcallHandle`];
//!    the process executes it and answers [`Message::Waiting`] again.
//!
//! Every record is `[u32 tag][u32 reserved][payload]`, little-endian, and its
//! total length is a function of the tag alone.  A record whose length does
//! not match its tag, or whose tag is unknown, means the two sides are out
//! of sync.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod layout;

use core::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Constants
// ═══════════════════════════════════════════════════════════════════════

/// Size of the receive buffer; no record is ever larger.
pub const MESSAGE_LENGTH: usize = 512;

/// Bytes reserved for a proposition name in `REGISTER_SYMBOL`.
pub const SYMBOL_NAME_LENGTH: usize = 128;

/// Environment variable holding the checked process's socket number.
pub const SOCKET_FD_ENV: &str = "STEPWISE_MC_SOCKET_FD";

/// Length of the record header (tag + reserved word).
pub const HEADER_LENGTH: usize = 8;

// ═══════════════════════════════════════════════════════════════════════
//  Message types
// ═══════════════════════════════════════════════════════════════════════

/// Tag of a control message.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    None = 0,
    Continue = 1,
    IgnoreHeap = 2,
    UnignoreHeap = 3,
    IgnoreMemory = 4,
    StackRegion = 5,
    RegisterSymbol = 6,
    DeadlockCheck = 7,
    DeadlockCheckReply = 8,
    Waiting = 9,
    SimcallHandle = 10,
    AssertionFailed = 11,
    ActorEnabled = 12,
    ActorEnabledReply = 13,
    Restore = 14,
}

impl MessageType {
    /// Decode a raw tag.
    pub const fn from_u32(tag: u32) -> Option<Self> {
        Some(match tag {
            0 => Self::None,
            1 => Self::Continue,
            2 => Self::IgnoreHeap,
            3 => Self::UnignoreHeap,
            4 => Self::IgnoreMemory,
            5 => Self::StackRegion,
            6 => Self::RegisterSymbol,
            7 => Self::DeadlockCheck,
            8 => Self::DeadlockCheckReply,
            9 => Self::Waiting,
            10 => Self::SimcallHandle,
            11 => Self::AssertionFailed,
            12 => Self::ActorEnabled,
            13 => Self::ActorEnabledReply,
            14 => Self::Restore,
            _ => return None,
        })
    }

    /// Diagnostic name, as used in protocol error messages.
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Continue => "CONTINUE",
            Self::IgnoreHeap => "IGNORE_HEAP",
            Self::UnignoreHeap => "UNIGNORE_HEAP",
            Self::IgnoreMemory => "IGNORE_MEMORY",
            Self::StackRegion => "STACK_REGION",
            Self::RegisterSymbol => "REGISTER_SYMBOL",
            Self::DeadlockCheck => "DEADLOCK_CHECK",
            Self::DeadlockCheckReply => "DEADLOCK_CHECK_REPLY",
            Self::Waiting => "WAITING",
            Self::SimcallHandle => "SIMCALL_HANDLE",
            Self::AssertionFailed => "ASSERTION_FAILED",
            Self::ActorEnabled => "ACTOR_ENABLED",
            Self::ActorEnabledReply => "ACTOR_ENABLED_REPLY",
            Self::Restore => "RESTORE",
        }
    }

    /// Exact encoded length of a record carrying this tag.
    pub const fn encoded_len(self) -> usize {
        HEADER_LENGTH
            + match self {
                Self::None
                | Self::Continue
                | Self::DeadlockCheck
                | Self::Waiting
                | Self::AssertionFailed => 0,
                Self::DeadlockCheckReply | Self::ActorEnabled | Self::ActorEnabledReply => 8,
                Self::IgnoreHeap => 24,
                Self::UnignoreHeap | Self::IgnoreMemory => 16,
                Self::StackRegion => 40,
                Self::RegisterSymbol => SYMBOL_NAME_LENGTH + 16,
                Self::SimcallHandle => 16,
                Self::Restore => 8,
            }
    }
}

/// Name of a raw tag, `"?"` when unknown.
pub fn message_type_name(tag: u32) -> &'static str {
    match MessageType::from_u32(tag) {
        Some(kind) => kind.name(),
        None => "?",
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Payloads
// ═══════════════════════════════════════════════════════════════════════

/// A heap block or fragment whose content must never be compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IgnoredHeapRegion {
    pub block: i32,
    pub fragment: i32,
    pub address: u64,
    pub size: u64,
}

/// One actor execution stack, declared by the checked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackRegion {
    /// Lowest address of the stack mapping.
    pub address: u64,
    /// Address of the saved [`layout::SavedContext`] used to unwind it.
    pub context: u64,
    pub size: u64,
    /// Heap block holding the stack, when it was allocated on the heap.
    pub block: u64,
    /// Privatization segment of the owning actor, `-1` when shared.
    pub process_index: i32,
}

/// NUL-padded proposition name.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SymbolName([u8; SYMBOL_NAME_LENGTH]);

impl SymbolName {
    /// Build a name, truncating to fit the fixed field (one byte is kept for
    /// the terminating NUL).
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; SYMBOL_NAME_LENGTH];
        let mut len = name.len().min(SYMBOL_NAME_LENGTH - 1);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMBOL_NAME_LENGTH] {
        &self.0
    }

    /// The name up to the first NUL; invalid UTF-8 yields `None`.
    pub fn as_str(&self) -> Option<&str> {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SYMBOL_NAME_LENGTH);
        core::str::from_utf8(&self.0[..end]).ok()
    }
}

impl fmt::Debug for SymbolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(name) => write!(f, "{name:?}"),
            None => write!(f, "<invalid utf-8>"),
        }
    }
}

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    None,
    Continue,
    IgnoreHeap(IgnoredHeapRegion),
    UnignoreHeap { address: u64, size: u64 },
    IgnoreMemory { address: u64, size: u64 },
    StackRegion(StackRegion),
    RegisterSymbol { name: SymbolName, callback: u64, data: u64 },
    DeadlockCheck,
    DeadlockCheckReply { deadlock: bool },
    Waiting,
    SimcallHandle { pid: u64, value: i32 },
    AssertionFailed,
    ActorEnabled { aid: u64 },
    ActorEnabledReply { enabled: bool },
    Restore { index: i32 },
}

impl Message {
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::None => MessageType::None,
            Self::Continue => MessageType::Continue,
            Self::IgnoreHeap(_) => MessageType::IgnoreHeap,
            Self::UnignoreHeap { .. } => MessageType::UnignoreHeap,
            Self::IgnoreMemory { .. } => MessageType::IgnoreMemory,
            Self::StackRegion(_) => MessageType::StackRegion,
            Self::RegisterSymbol { .. } => MessageType::RegisterSymbol,
            Self::DeadlockCheck => MessageType::DeadlockCheck,
            Self::DeadlockCheckReply { .. } => MessageType::DeadlockCheckReply,
            Self::Waiting => MessageType::Waiting,
            Self::SimcallHandle { .. } => MessageType::SimcallHandle,
            Self::AssertionFailed => MessageType::AssertionFailed,
            Self::ActorEnabled { .. } => MessageType::ActorEnabled,
            Self::ActorEnabledReply { .. } => MessageType::ActorEnabledReply,
            Self::Restore { .. } => MessageType::Restore,
        }
    }

    /// Encode into `buf`, returning the record length.
    pub fn encode(&self, buf: &mut [u8; MESSAGE_LENGTH]) -> usize {
        let kind = self.message_type();
        let len = kind.encoded_len();
        buf[..len].fill(0);
        let mut w = Writer { buf: &mut buf[..len], offset: 0 };
        w.u32(kind as u32);
        w.u32(0);
        match *self {
            Self::None
            | Self::Continue
            | Self::DeadlockCheck
            | Self::Waiting
            | Self::AssertionFailed => {}
            Self::IgnoreHeap(region) => {
                w.i32(region.block);
                w.i32(region.fragment);
                w.u64(region.address);
                w.u64(region.size);
            }
            Self::UnignoreHeap { address, size } | Self::IgnoreMemory { address, size } => {
                w.u64(address);
                w.u64(size);
            }
            Self::StackRegion(stack) => {
                w.u64(stack.address);
                w.u64(stack.context);
                w.u64(stack.size);
                w.u64(stack.block);
                w.i32(stack.process_index);
            }
            Self::RegisterSymbol { name, callback, data } => {
                w.bytes(name.as_bytes());
                w.u64(callback);
                w.u64(data);
            }
            Self::DeadlockCheckReply { deadlock: flag }
            | Self::ActorEnabledReply { enabled: flag } => w.u64(flag as u64),
            Self::ActorEnabled { aid } => w.u64(aid),
            Self::SimcallHandle { pid, value } => {
                w.u64(pid);
                w.i32(value);
            }
            Self::Restore { index } => w.i32(index),
        }
        len
    }

    /// Decode one record, checking that its length matches its tag exactly.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(ProtocolError::Truncated { len: bytes.len() });
        }
        let tag = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let kind = MessageType::from_u32(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        if bytes.len() != kind.encoded_len() {
            return Err(ProtocolError::SizeMismatch {
                kind,
                expected: kind.encoded_len(),
                actual: bytes.len(),
            });
        }

        let mut r = Reader { buf: bytes, offset: HEADER_LENGTH };
        Ok(match kind {
            MessageType::None => Self::None,
            MessageType::Continue => Self::Continue,
            MessageType::DeadlockCheck => Self::DeadlockCheck,
            MessageType::Waiting => Self::Waiting,
            MessageType::AssertionFailed => Self::AssertionFailed,
            MessageType::IgnoreHeap => Self::IgnoreHeap(IgnoredHeapRegion {
                block: r.i32(),
                fragment: r.i32(),
                address: r.u64(),
                size: r.u64(),
            }),
            MessageType::UnignoreHeap => Self::UnignoreHeap {
                address: r.u64(),
                size: r.u64(),
            },
            MessageType::IgnoreMemory => Self::IgnoreMemory {
                address: r.u64(),
                size: r.u64(),
            },
            MessageType::StackRegion => Self::StackRegion(StackRegion {
                address: r.u64(),
                context: r.u64(),
                size: r.u64(),
                block: r.u64(),
                process_index: r.i32(),
            }),
            MessageType::RegisterSymbol => {
                let mut name = [0u8; SYMBOL_NAME_LENGTH];
                name.copy_from_slice(r.bytes(SYMBOL_NAME_LENGTH));
                Self::RegisterSymbol {
                    name: SymbolName(name),
                    callback: r.u64(),
                    data: r.u64(),
                }
            }
            MessageType::DeadlockCheckReply => Self::DeadlockCheckReply {
                deadlock: r.u64() != 0,
            },
            MessageType::SimcallHandle => Self::SimcallHandle {
                pid: r.u64(),
                value: r.i32(),
            },
            MessageType::ActorEnabled => Self::ActorEnabled { aid: r.u64() },
            MessageType::ActorEnabledReply => Self::ActorEnabledReply {
                enabled: r.u64() != 0,
            },
            MessageType::Restore => Self::Restore { index: r.i32() },
        })
    }
}

/// Little-endian cursor over a record whose length was validated up front.
struct Writer<'a> {
    buf: &'a mut [u8],
    offset: usize,
}

impl Writer<'_> {
    fn bytes(&mut self, data: &[u8]) {
        self.buf[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, len: usize) -> &'a [u8] {
        let out = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        out
    }

    fn i32(&mut self) -> i32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(4));
        i32::from_le_bytes(raw)
    }

    fn u64(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8));
        u64::from_le_bytes(raw)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Errors
// ═══════════════════════════════════════════════════════════════════════

/// A record that cannot belong to a well-formed conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// Shorter than a record header.
    Truncated { len: usize },
    UnknownTag(u32),
    SizeMismatch {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },
    /// A well-formed message arrived where another one was required.
    Unexpected {
        kind: MessageType,
        expected: MessageType,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "broken message: {len} bytes is shorter than a header"),
            Self::UnknownTag(tag) => write!(f, "unexpected message from the peer: unknown tag {tag}"),
            Self::SizeMismatch { kind, expected, actual } => write!(
                f,
                "broken message: {} ({}) has {actual} bytes, expected {expected}",
                kind.name(),
                *kind as u32
            ),
            Self::Unexpected { kind, expected } => write!(
                f,
                "received unexpected message {} ({}), expected {} ({})",
                kind.name(),
                *kind as u32,
                expected.name(),
                *expected as u32
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ProtocolError {}

// ═══════════════════════════════════════════════════════════════════════
//  Exit statuses
// ═══════════════════════════════════════════════════════════════════════

/// Process exit status of the checker, one per verdict.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Success = 0,
    Safety = 1,
    Liveness = 2,
    Deadlock = 3,
    NonTermination = 4,
    NonDeterminism = 5,
    ProgramCrash = 6,
    Error = 63,
}

impl ExitStatus {
    pub const fn code(self) -> i32 {
        self as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let mut buf = [0u8; MESSAGE_LENGTH];
        let len = message.encode(&mut buf);
        assert_eq!(len, message.message_type().encoded_len());
        Message::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn every_record_fits_the_receive_buffer() {
        for tag in 0..=14 {
            let kind = MessageType::from_u32(tag).unwrap();
            assert!(kind.encoded_len() <= MESSAGE_LENGTH, "{}", kind.name());
            assert_eq!(kind as u32, tag);
        }
        assert_eq!(MessageType::from_u32(15), None);
    }

    #[test]
    fn header_only_messages() {
        for message in [
            Message::Continue,
            Message::Waiting,
            Message::DeadlockCheck,
            Message::AssertionFailed,
        ] {
            assert_eq!(roundtrip(message), message);
        }
    }

    #[test]
    fn ignore_heap_payload() {
        let region = IgnoredHeapRegion {
            block: 12,
            fragment: -1,
            address: 0x7f00_0000_1000,
            size: 48,
        };
        assert_eq!(roundtrip(Message::IgnoreHeap(region)), Message::IgnoreHeap(region));
    }

    #[test]
    fn stack_region_payload() {
        let stack = StackRegion {
            address: 0x1000,
            context: 0x2000,
            size: 8192,
            block: 3,
            process_index: -1,
        };
        assert_eq!(roundtrip(Message::StackRegion(stack)), Message::StackRegion(stack));
    }

    #[test]
    fn register_symbol_keeps_name() {
        let decoded = roundtrip(Message::RegisterSymbol {
            name: SymbolName::new("cs"),
            callback: 0,
            data: 0xdead_beef,
        });
        match decoded {
            Message::RegisterSymbol { name, callback, data } => {
                assert_eq!(name.as_str(), Some("cs"));
                assert_eq!(callback, 0);
                assert_eq!(data, 0xdead_beef);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn symbol_name_truncates_on_char_boundary() {
        let long = "é".repeat(100);
        let name = SymbolName::new(&long);
        let s = name.as_str().unwrap();
        assert!(s.len() < SYMBOL_NAME_LENGTH);
        assert!(s.chars().all(|c| c == 'é'));
    }

    #[test]
    fn simcall_handle_negative_value() {
        let message = Message::SimcallHandle { pid: 7, value: -3 };
        assert_eq!(roundtrip(message), message);
    }

    #[test]
    fn replies_carry_booleans() {
        assert_eq!(
            roundtrip(Message::DeadlockCheckReply { deadlock: true }),
            Message::DeadlockCheckReply { deadlock: true }
        );
        assert_eq!(
            roundtrip(Message::ActorEnabledReply { enabled: false }),
            Message::ActorEnabledReply { enabled: false }
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = [0u8; 16];
        buf[..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(Message::decode(&buf), Err(ProtocolError::UnknownTag(99)));
    }

    #[test]
    fn wrong_size_is_rejected() {
        let mut buf = [0u8; MESSAGE_LENGTH];
        let len = Message::Waiting.encode(&mut buf);
        let err = Message::decode(&buf[..len + 8]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::SizeMismatch {
                kind: MessageType::Waiting,
                expected: 8,
                actual: 16,
            }
        );
    }

    #[test]
    fn short_record_is_truncated() {
        assert_eq!(
            Message::decode(&[1, 0, 0]),
            Err(ProtocolError::Truncated { len: 3 })
        );
    }

    #[test]
    fn names_for_diagnostics() {
        assert_eq!(message_type_name(9), "WAITING");
        assert_eq!(message_type_name(1000), "?");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            ExitStatus::Success,
            ExitStatus::Safety,
            ExitStatus::Liveness,
            ExitStatus::Deadlock,
            ExitStatus::NonTermination,
            ExitStatus::NonDeterminism,
            ExitStatus::ProgramCrash,
            ExitStatus::Error,
        ]
        .map(ExitStatus::code);
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(ExitStatus::Deadlock.code(), 3);
    }
}
