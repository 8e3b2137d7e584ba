//! Checker-side core of stepwise.
//!
//! This crate controls a separate, checked process: it stops and resumes it
//! over a control channel, reads and writes its memory, captures snapshots
//! of that memory and decides whether two snapshots describe the same state.
//!
//! # Architecture
//!
//! ```text
//! ModelChecker ──► RemoteSimulation ──► /proc/<pid>/mem
//!      │                 │
//!      │ Channel         └── object infos, stacks, ignore lists,
//!      │ (SEQPACKET)         lazily mirrored heap and actor table
//!      ▼
//! checked process (stepwise-sdk client)
//!
//! Snapshot::take ──► RegionSnapshot (flat / chunked / privatized)
//!                         └── PageStore (deduplicated pages)
//! compare::snapshot_equal ──► HeapComparator (pointer-graph isomorphism)
//! ```
//!
//! # Module Structure
//!
//! - [`address`] — Typed addresses in the checked process
//! - [`channel`] — Fixed-size message transport
//! - [`memory_map`] — `/proc/<pid>/maps` parsing
//! - [`object_info`] — Segments, symbols, variables and types of loaded objects
//! - [`heap`] — Local mirror of the checked allocator's block table
//! - [`remote`] — The checked process's memory and cached mirrors
//! - [`simcall`] — Pending simcalls and communications of the actors
//! - [`snapshot`] — Capture and restore of process memory
//! - [`compare`] — Semantic equality of snapshots
//! - [`model_checker`] — Event loop and process supervision
//! - [`launch`] — Spawning a traced program
//!
//! # Cache discipline
//!
//! Every message that lets the checked process run clears the mirrors kept
//! by [`RemoteSimulation`]; reads after that always go back to the process.

#[cfg(not(target_os = "linux"))]
compile_error!("stepwise-mc needs ptrace, signalfd and /proc: only Linux is supported");

pub mod address;
pub mod channel;
pub mod compare;
pub mod heap;
pub mod launch;
pub mod memory_map;
pub mod model_checker;
pub mod object_info;
pub mod remote;
pub mod simcall;
pub mod snapshot;

// Re-export main types for convenience
pub use address::{remote, RemotePtr};
pub use channel::{Channel, Received, TransportError};
pub use compare::{snapshot_equal, Comparison, HeapComparator};
pub use heap::HeapLayout;
pub use launch::launch;
pub use model_checker::{Crash, McError, ModelChecker, ModelCheckerStats, Proposition};
pub use object_info::{ObjectInformation, Type, TypeKind, Variable};
pub use remote::{ActorInformation, ProcessIndex, RemoteError, RemoteSimulation};
pub use simcall::{CommInfo, CommKind, CommState, Simcall};
pub use snapshot::{PageStore, RegionSnapshot, Snapshot, SnapshotConfig, SnapshotError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _ = PageStore::new(1);
        let _ = SnapshotConfig::default();
        let _ = ObjectInformation::new("a.out");
        let _ = RemotePtr::<u8>::null();
        assert!(!Comparison::Unknown.is_equal());
    }
}
