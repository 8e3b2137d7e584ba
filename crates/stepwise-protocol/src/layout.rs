//! Structures the checked process keeps in its own memory for the checker.
//!
//! The checker never shares pointers with the checked process: it finds
//! these records through well-known symbols and copies them out of the
//! foreign address space byte for byte.  Every record is `repr(C)`, made of
//! integers only (explicit padding fields, no implicit holes), so any byte
//! pattern read remotely is a valid value.
//!
//! ```text
//! stepwise_heap ──► HeapDescriptor ──► [MallocInfo; heaplimit + 1]   (block 0 unused)
//! stepwise_actors ─► ActorTable ──► [ActorRecord] ──► SimcallRecord ──► CommRecord
//! STACK_REGION.context ──► SavedContext { ip, sp, fp }
//! ```

use core::mem::size_of;

// ═══════════════════════════════════════════════════════════════════════
//  Well-known symbols
// ═══════════════════════════════════════════════════════════════════════

/// Heap descriptor of the checked process's allocator.
pub const HEAP_SYMBOL: &str = "stepwise_heap";

/// Actor table of the checked process.
pub const ACTORS_SYMBOL: &str = "stepwise_actors";

/// Array of [`PrivatizationRegion`], one per replica.
pub const PRIVATIZATION_REGIONS_SYMBOL: &str = "stepwise_privatization_regions";

/// Number of replicas (an `i32`).
pub const PROCESS_COUNT_SYMBOL: &str = "stepwise_process_count";

/// Index of the replica currently mapped at the nominal data address (an `i32`).
pub const LOADED_SEGMENT_SYMBOL: &str = "stepwise_loaded_segment";

/// Frame that marks the bottom of every actor stack; unwinding stops there.
pub const CONTEXT_WRAPPER_SYMBOL: &str = "stepwise_context_wrapper";

// ═══════════════════════════════════════════════════════════════════════
//  Plain records
// ═══════════════════════════════════════════════════════════════════════

/// A `repr(C)` record for which every bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain only integer or float fields
/// (arrays included), and have no implicit padding.
pub unsafe trait Plain: Copy + 'static {
    /// Copy a value out of the first `size_of::<Self>()` bytes.
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above; `Plain` guarantees every bit pattern is valid.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }

    /// Raw bytes of the value.
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: `Plain` types have no padding, so every byte is initialised.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

macro_rules! plain_primitives {
    ($($t:ty),*) => {
        // SAFETY: primitive integers and floats accept every bit pattern.
        $(unsafe impl Plain for $t {})*
    };
}

plain_primitives!(u8, u16, u32, u64, i8, i16, i32, i64, f64);

// ═══════════════════════════════════════════════════════════════════════
//  Heap
// ═══════════════════════════════════════════════════════════════════════

/// Allocation granule of the heap.
pub const BLOCKSIZE: usize = 4096;

/// log2 of the smallest fragment.
pub const MIN_FRAGMENT_SHIFT: i32 = 4;

/// log2 of the block size; fragment shifts stay below it.
pub const MAX_FRAGMENT_SHIFT: i32 = BLOCKSIZE.trailing_zeros() as i32;

/// Upper bound of fragments in one block.
pub const MAX_FRAGMENT_PER_BLOCK: usize = BLOCKSIZE >> MIN_FRAGMENT_SHIFT;

/// `MallocInfo::kind` of a free block.
pub const MALLOC_FREE: i32 = -1;

/// `MallocInfo::kind` of a busy, unfragmented block.
pub const MALLOC_BLOCK: i32 = 0;

/// Location and extent of the checked process's heap.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapDescriptor {
    /// Address of block 1.
    pub heapbase: u64,
    /// Number of blocks managed.
    pub heaplimit: u64,
    /// First byte past the used part of the heap.
    pub breakval: u64,
    /// Address of the block table (`heaplimit + 1` entries).
    pub heapinfo: u64,
    /// Bytes handed out to callers.
    pub bytes_used: u64,
}

// SAFETY: repr(C), five u64 fields.
unsafe impl Plain for HeapDescriptor {}

/// One block table entry.
///
/// `kind` is [`MALLOC_FREE`], [`MALLOC_BLOCK`], or the fragment shift of a
/// fragmented block.  For busy blocks, `size` is the number of blocks of the
/// allocation on its first block and `0` on continuation blocks; `busy_size`
/// is the requested size.  For free blocks, `size` is the length of the free
/// run.  Fragment sizes are `-1` for free fragments.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MallocInfo {
    pub kind: i32,
    pub ignore: i32,
    pub size: u64,
    pub busy_size: u64,
    pub nfree: u64,
    pub frag_size: [i16; MAX_FRAGMENT_PER_BLOCK],
    pub frag_ignore: [u8; MAX_FRAGMENT_PER_BLOCK],
}

// SAFETY: repr(C), integer fields and arrays, no padding (checked below).
unsafe impl Plain for MallocInfo {}

const _: () = assert!(size_of::<MallocInfo>() == 32 + 3 * MAX_FRAGMENT_PER_BLOCK);

impl MallocInfo {
    pub const fn free(size: u64) -> Self {
        Self {
            kind: MALLOC_FREE,
            ignore: 0,
            size,
            busy_size: 0,
            nfree: 0,
            frag_size: [-1; MAX_FRAGMENT_PER_BLOCK],
            frag_ignore: [0; MAX_FRAGMENT_PER_BLOCK],
        }
    }

    pub const fn is_free(&self) -> bool {
        self.kind < 0
    }

    pub const fn is_fragmented(&self) -> bool {
        self.kind > 0
    }

    /// Free, a full block, or a fragment shift between
    /// [`MIN_FRAGMENT_SHIFT`] and half a block.
    pub const fn has_valid_kind(&self) -> bool {
        self.kind <= MALLOC_BLOCK
            || (self.kind >= MIN_FRAGMENT_SHIFT && self.kind < MAX_FRAGMENT_SHIFT)
    }

    /// Fragments in this block (0 when unfragmented or when `kind` is out
    /// of range).
    pub const fn fragment_count(&self) -> usize {
        if self.is_fragmented() && self.has_valid_kind() {
            BLOCKSIZE >> self.kind
        } else {
            0
        }
    }
}

impl Default for MallocInfo {
    fn default() -> Self {
        Self::free(0)
    }
}

impl core::fmt::Debug for MallocInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MallocInfo")
            .field("kind", &self.kind)
            .field("ignore", &self.ignore)
            .field("size", &self.size)
            .field("busy_size", &self.busy_size)
            .field("nfree", &self.nfree)
            .finish_non_exhaustive()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Actors and simcalls
// ═══════════════════════════════════════════════════════════════════════

/// Kind of a pending simcall.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SimcallCall {
    #[default]
    None = 0,
    CommIsend = 1,
    CommIrecv = 2,
    CommWait = 3,
    CommTest = 4,
    CommWaitany = 5,
    CommTestany = 6,
    MutexLock = 7,
    MutexTrylock = 8,
    MutexUnlock = 9,
    Random = 10,
    Execute = 11,
}

impl SimcallCall {
    pub const fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::CommIsend,
            2 => Self::CommIrecv,
            3 => Self::CommWait,
            4 => Self::CommTest,
            5 => Self::CommWaitany,
            6 => Self::CommTestany,
            7 => Self::MutexLock,
            8 => Self::MutexTrylock,
            9 => Self::MutexUnlock,
            10 => Self::Random,
            11 => Self::Execute,
            _ => return None,
        })
    }
}

/// Location of the actor lists.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActorTable {
    pub actors: u64,
    pub actor_count: u64,
    pub dead_actors: u64,
    pub dead_actor_count: u64,
}

// SAFETY: repr(C), four u64 fields.
unsafe impl Plain for ActorTable {}

/// The simcall an actor is blocked on.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimcallRecord {
    /// Raw [`SimcallCall`].
    pub call: u32,
    pub _pad: u32,
    /// Pid of the issuing actor.
    pub issuer: u64,
    pub mailbox: u64,
    /// Comm waited on or tested.
    pub comm: u64,
    /// Array of comm addresses for waitany/testany.
    pub comms: u64,
    pub comm_count: u64,
    /// Wait timeout in seconds, negative for none.
    pub timeout: f64,
    pub buffer: u64,
    pub buffer_size: u64,
    pub min: i64,
    pub max: i64,
    pub mutex: u64,
    /// Outcome of the actor's last executed simcall: the comm created by
    /// isend/irecv, or the outcome of a test.  Carried over when the actor
    /// blocks on its next simcall.
    pub result: u64,
}

// SAFETY: repr(C), 4-byte pair then 8-byte fields, no padding.
unsafe impl Plain for SimcallRecord {}

/// One actor control block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ActorRecord {
    pub pid: u64,
    /// NUL-terminated name, `0` when anonymous.
    pub name: u64,
    /// NUL-terminated host name, `0` when unknown.
    pub host: u64,
    pub simcall: SimcallRecord,
}

// SAFETY: repr(C) of Plain fields with 8-byte alignment throughout.
unsafe impl Plain for ActorRecord {}

/// `CommRecord::kind` of a comm posted by a sender.
pub const COMM_SEND: u32 = 0;
/// `CommRecord::kind` of a comm posted by a receiver.
pub const COMM_RECEIVE: u32 = 1;

/// `CommRecord::state`: posted, no peer yet.
pub const COMM_WAITING: u32 = 0;
/// `CommRecord::state`: both endpoints known.
pub const COMM_READY: u32 = 1;
/// `CommRecord::state`: data transferred.
pub const COMM_DONE: u32 = 2;

/// A communication between two actors.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommRecord {
    pub kind: u32,
    pub state: u32,
    pub mailbox: u64,
    /// Pid of the sender, `0` when not matched yet.
    pub src_actor: u64,
    /// Pid of the receiver, `0` when not matched yet.
    pub dst_actor: u64,
    pub src_buff: u64,
    pub dst_buff: u64,
    pub data_size: u64,
    pub tag: u64,
    /// Non-zero for a send nobody waits on.
    pub detached: u32,
    pub _pad: u32,
}

// SAFETY: repr(C), no padding.
unsafe impl Plain for CommRecord {}

// ═══════════════════════════════════════════════════════════════════════
//  Privatization and contexts
// ═══════════════════════════════════════════════════════════════════════

/// Private copy of the data segment of one replica.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivatizationRegion {
    pub address: u64,
    pub file_descriptor: i32,
    pub _pad: i32,
}

// SAFETY: repr(C), no padding.
unsafe impl Plain for PrivatizationRegion {}

/// Registers saved when an actor yields, enough for frame-pointer unwinding.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavedContext {
    pub ip: u64,
    pub sp: u64,
    pub fp: u64,
}

// SAFETY: repr(C), three u64 fields.
unsafe impl Plain for SavedContext {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_roundtrip_through_bytes() {
        let desc = HeapDescriptor {
            heapbase: 0x1000,
            heaplimit: 16,
            breakval: 0x5000,
            heapinfo: 0x9000,
            bytes_used: 42,
        };
        let back = HeapDescriptor::from_bytes(desc.as_bytes()).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn from_bytes_rejects_short_input() {
        assert!(SavedContext::from_bytes(&[0u8; 16]).is_none());
    }

    #[test]
    fn fragment_counts() {
        let mut info = MallocInfo::free(1);
        assert!(info.is_free());
        assert_eq!(info.fragment_count(), 0);
        info.kind = 5;
        assert!(info.is_fragmented());
        assert_eq!(info.fragment_count(), 128);
        info.kind = MIN_FRAGMENT_SHIFT;
        assert_eq!(info.fragment_count(), MAX_FRAGMENT_PER_BLOCK);
    }

    #[test]
    fn out_of_range_kinds_have_no_fragments() {
        let mut info = MallocInfo::free(1);
        for kind in [1, MIN_FRAGMENT_SHIFT - 1, MAX_FRAGMENT_SHIFT, 64, i32::MAX] {
            info.kind = kind;
            assert!(!info.has_valid_kind(), "kind {kind}");
            assert_eq!(info.fragment_count(), 0, "kind {kind}");
        }
        info.kind = MAX_FRAGMENT_SHIFT - 1;
        assert!(info.has_valid_kind());
        assert_eq!(info.fragment_count(), 2);
    }

    #[test]
    fn record_sizes_are_stable() {
        assert_eq!(size_of::<SimcallRecord>(), 104);
        assert_eq!(size_of::<ActorRecord>(), 128);
        assert_eq!(size_of::<CommRecord>(), 72);
        assert_eq!(size_of::<MallocInfo>(), 800);
    }

    #[test]
    fn simcall_call_decoding() {
        assert_eq!(SimcallCall::from_u32(1), Some(SimcallCall::CommIsend));
        assert_eq!(SimcallCall::from_u32(11), Some(SimcallCall::Execute));
        assert_eq!(SimcallCall::from_u32(12), None);
    }
}
