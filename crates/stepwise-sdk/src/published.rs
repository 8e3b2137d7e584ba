//! Well-known symbols the checker looks up in the checked binary.
//!
//! Each one is a `#[no_mangle]` static whose address is the value itself,
//! so the checker can find it in the symbol table and read it remotely.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::ptr;

use stepwise_protocol::layout::ActorTable;

/// A value published at a fixed address for the checker to read.
///
/// The checked process is single-threaded at the point where it talks to
/// the checker; writes are volatile so they are never elided.
#[repr(transparent)]
pub struct Published<T: Copy>(UnsafeCell<T>);

// SAFETY: values are plain data written by one thread at a time.
unsafe impl<T: Copy + Send> Sync for Published<T> {}

impl<T: Copy> Published<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub fn get(&self) -> T {
        // SAFETY: the cell is always initialised.
        unsafe { ptr::read_volatile(self.0.get()) }
    }

    pub fn set(&self, value: T) {
        // SAFETY: see the `Sync` impl.
        unsafe { ptr::write_volatile(self.0.get(), value) }
    }

    pub fn address(&self) -> u64 {
        self.0.get() as u64
    }
}

/// Address of the heap descriptor, `0` while no arena is published.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static stepwise_heap: Published<u64> = Published::new(0);

/// Live and dead actor lists.
#[no_mangle]
#[allow(non_upper_case_globals)]
pub static stepwise_actors: Published<ActorTable> = Published::new(ActorTable {
    actors: 0,
    actor_count: 0,
    dead_actors: 0,
    dead_actor_count: 0,
});

/// Bottom frame of every actor stack: the checker stops unwinding here.
///
/// Simulations that run actors on their own stacks should enter actor code
/// through this function.
#[no_mangle]
#[inline(never)]
pub extern "C" fn stepwise_context_wrapper(entry: extern "C" fn(*mut c_void), argument: *mut c_void) {
    entry(argument);
}
