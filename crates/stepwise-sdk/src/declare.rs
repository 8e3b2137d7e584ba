//! Declarations sent to the checker before and between steps.

use std::sync::atomic::AtomicI32;

use stepwise_protocol::layout::SavedContext;
use stepwise_protocol::{Message, StackRegion, SymbolName};

use crate::client::{Client, ClientError};
use crate::heap::HeapArena;

impl Client {
    /// Register an actor stack of `size` bytes starting at `address`.
    ///
    /// `context` must stay valid for the life of the actor; the checker
    /// reads it whenever it unwinds the stack.
    pub fn declare_stack(
        &self,
        address: u64,
        size: u64,
        context: &'static SavedContext,
    ) -> Result<(), ClientError> {
        self.send(&Message::StackRegion(StackRegion {
            address,
            context: context as *const SavedContext as u64,
            size,
            block: 0,
            process_index: -1,
        }))
    }

    /// Exclude `size` bytes of global memory from snapshots and comparisons.
    pub fn ignore_memory(&self, address: u64, size: u64) -> Result<(), ClientError> {
        self.send(&Message::IgnoreMemory { address, size })
    }

    /// Exclude part of a heap allocation from comparisons.
    pub fn ignore_heap(
        &self,
        arena: &mut HeapArena,
        address: u64,
        size: u64,
    ) -> Result<(), ClientError> {
        let region = arena
            .ignore(address, size)
            .ok_or(ClientError::NotInHeap(address))?;
        self.send(&Message::IgnoreHeap(region))
    }

    pub fn unignore_heap(
        &self,
        arena: &mut HeapArena,
        address: u64,
        size: u64,
    ) -> Result<(), ClientError> {
        arena.unignore(address);
        self.send(&Message::UnignoreHeap { address, size })
    }

    /// Expose `value` as the atomic proposition `name`; non-zero is true.
    pub fn declare_symbol(&self, name: &str, value: &'static AtomicI32) -> Result<(), ClientError> {
        self.send(&Message::RegisterSymbol {
            name: SymbolName::new(name),
            callback: 0,
            data: value.as_ptr() as u64,
        })
    }

    /// Tell the checker a safety property does not hold.  The checker
    /// reports the trace and kills the process.
    pub fn report_assertion_failure(&self) -> Result<(), ClientError> {
        log::info!("assertion failed, reporting to the model checker");
        self.send(&Message::AssertionFailed)
    }

    /// [`report_assertion_failure`](Self::report_assertion_failure) unless
    /// `condition` holds.
    pub fn assert(&self, condition: bool) -> Result<(), ClientError> {
        if condition {
            Ok(())
        } else {
            self.report_assertion_failure()
        }
    }
}
