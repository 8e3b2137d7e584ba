//! Block/fragment heap whose metadata the checker can read.
//!
//! One anonymous mapping holds, in order, the [`HeapDescriptor`], the block
//! table (`capacity + 1` [`MallocInfo`] entries, entry 0 unused) and the
//! blocks themselves:
//!
//! ```text
//! ┌────────────┬──────────────────────┬─────────┬─────────┬───
//! │ descriptor │ block table          │ block 1 │ block 2 │ ...
//! └────────────┴──────────────────────┴─────────┴─────────┴───
//!                                     ^ heapbase           ^ breakval
//! ```
//!
//! Requests up to half a block are served from fragmented blocks (fragment
//! size is the next power of two, at least 16 bytes); larger requests take
//! a first-fit run of whole blocks.  `breakval` only grows, up to the
//! highest block ever handed out, so the checker never copies untouched
//! blocks.
//!
//! All allocator state lives in the mapping, never in [`HeapArena`]
//! itself: when the checker restores a snapshot the allocator comes back
//! with the heap.

use std::alloc::{GlobalAlloc, Layout};
use std::io;
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use log::warn;
use stepwise_protocol::layout::{
    HeapDescriptor, MallocInfo, BLOCKSIZE, MALLOC_BLOCK, MIN_FRAGMENT_SHIFT,
};
use stepwise_protocol::IgnoredHeapRegion;

use crate::published::stepwise_heap;

/// Largest request served from a fragment.
const MAX_FRAGMENT: usize = BLOCKSIZE / 2;

fn round_up(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// log2 of the fragment size used for a request of `size` bytes.
fn fragment_shift(size: usize) -> i32 {
    let bits = usize::BITS - size.saturating_sub(1).leading_zeros();
    (bits as i32).max(MIN_FRAGMENT_SHIFT)
}

pub struct HeapArena {
    mapping: NonNull<u8>,
    mapping_len: usize,
    descriptor: NonNull<HeapDescriptor>,
    table: NonNull<MallocInfo>,
    capacity: usize,
}

// SAFETY: the arena owns its mapping; nothing in it is tied to a thread.
unsafe impl Send for HeapArena {}

impl HeapArena {
    /// Map an arena of `capacity` blocks.
    pub fn new(capacity: usize) -> io::Result<Self> {
        if capacity == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty heap arena"));
        }
        let table_len = (capacity + 1) * size_of::<MallocInfo>();
        let meta_len = round_up(size_of::<HeapDescriptor>() + table_len, BLOCKSIZE);
        let mapping_len = meta_len + capacity * BLOCKSIZE;

        // SAFETY: fresh private anonymous mapping, checked below.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let mapping = NonNull::new(raw as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        let descriptor = mapping.cast::<HeapDescriptor>();
        // SAFETY: both offsets are inside the mapping and suitably aligned
        // (the descriptor is a multiple of 8 bytes long).
        let table = unsafe { NonNull::new_unchecked(mapping.as_ptr().add(size_of::<HeapDescriptor>())) }
            .cast::<MallocInfo>();
        let heapbase = mapping.as_ptr() as u64 + meta_len as u64;

        let mut arena = Self {
            mapping,
            mapping_len,
            descriptor,
            table,
            capacity,
        };
        *arena.descriptor_mut() = HeapDescriptor {
            heapbase,
            heaplimit: capacity as u64,
            breakval: heapbase,
            heapinfo: table.as_ptr() as u64,
            bytes_used: 0,
        };
        for block in 0..=capacity {
            // SAFETY: `block <= capacity`, inside the table.
            unsafe { table.as_ptr().add(block).write(MallocInfo::free(0)) };
        }
        arena.coalesce();
        Ok(arena)
    }

    /// Address of the heap descriptor, as the checker expects it.
    pub fn descriptor_address(&self) -> u64 {
        self.descriptor.as_ptr() as u64
    }

    /// Make this arena the one the checker inspects.
    pub fn publish(&self) {
        stepwise_heap.set(self.descriptor_address());
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn base(&self) -> u64 {
        self.descriptor().heapbase
    }

    pub fn bytes_used(&self) -> u64 {
        self.descriptor().bytes_used
    }

    /// First byte past the highest block handed out so far.
    pub fn breakval(&self) -> u64 {
        self.descriptor().breakval
    }

    pub fn info(&self, block: usize) -> Option<&MallocInfo> {
        if block == 0 || block > self.capacity {
            return None;
        }
        // SAFETY: bounds checked above.
        Some(unsafe { &*self.table.as_ptr().add(block) })
    }

    fn descriptor(&self) -> &HeapDescriptor {
        // SAFETY: the descriptor lives as long as the mapping.
        unsafe { self.descriptor.as_ref() }
    }

    fn descriptor_mut(&mut self) -> &mut HeapDescriptor {
        // SAFETY: as above, and `&mut self` is exclusive.
        unsafe { self.descriptor.as_mut() }
    }

    fn info_mut(&mut self, block: usize) -> &mut MallocInfo {
        debug_assert!(block >= 1 && block <= self.capacity);
        // SAFETY: callers only pass block numbers in 1..=capacity.
        unsafe { &mut *self.table.as_ptr().add(block) }
    }

    fn block_address(&self, block: usize) -> u64 {
        self.base() + ((block - 1) * BLOCKSIZE) as u64
    }

    fn block_of(&self, address: u64) -> Option<usize> {
        let base = self.base();
        if address < base {
            return None;
        }
        let block = ((address - base) / BLOCKSIZE as u64) as usize + 1;
        (block <= self.capacity).then_some(block)
    }

    fn pointer(&self, address: u64) -> Option<NonNull<u8>> {
        NonNull::new(address as *mut u8)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Allocation
    // ═══════════════════════════════════════════════════════════════════

    /// Allocate `size` bytes; `None` when the arena is exhausted.
    ///
    /// Fragments are aligned on their size, whole blocks on `BLOCKSIZE`.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let size = size.max(1);
        let address = if size <= MAX_FRAGMENT {
            self.alloc_fragment(size)?
        } else {
            self.alloc_blocks(size)?
        };
        self.descriptor_mut().bytes_used += size as u64;
        self.pointer(address)
    }

    fn alloc_fragment(&mut self, size: usize) -> Option<u64> {
        let shift = fragment_shift(size);
        let block = match (1..=self.capacity)
            .find(|&b| self.info(b).is_some_and(|i| i.kind == shift && i.nfree > 0))
        {
            Some(block) => block,
            None => {
                let block = self.find_free_run(1)?;
                let info = self.info_mut(block);
                *info = MallocInfo::free(0);
                info.kind = shift;
                info.nfree = info.fragment_count() as u64;
                self.grow_break(block);
                self.coalesce();
                block
            }
        };
        let info = self.info_mut(block);
        let count = info.fragment_count();
        let fragment = info.frag_size[..count].iter().position(|&s| s < 0)?;
        info.frag_size[fragment] = size as i16;
        info.frag_ignore[fragment] = 0;
        info.nfree -= 1;
        Some(self.block_address(block) + ((fragment as u64) << shift))
    }

    fn alloc_blocks(&mut self, size: usize) -> Option<u64> {
        let count = size.div_ceil(BLOCKSIZE);
        let first = self.find_free_run(count)?;
        for block in first..first + count {
            let info = self.info_mut(block);
            *info = MallocInfo::free(0);
            info.kind = MALLOC_BLOCK;
        }
        let head = self.info_mut(first);
        head.size = count as u64;
        head.busy_size = size as u64;
        self.grow_break(first + count - 1);
        self.coalesce();
        Some(self.block_address(first))
    }

    /// First block of the lowest run of `count` free blocks.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut block = 1;
        while block + count - 1 <= self.capacity {
            let info = self.info(block)?;
            if info.is_free() && info.size as usize >= count {
                return Some(block);
            }
            block += (info.size as usize).max(1);
        }
        None
    }

    fn grow_break(&mut self, last_block: usize) {
        let end = self.block_address(last_block) + BLOCKSIZE as u64;
        let descriptor = self.descriptor_mut();
        descriptor.breakval = descriptor.breakval.max(end);
    }

    /// Busy runs keep their head size; free blocks get the length of the
    /// free run they start.
    fn coalesce(&mut self) {
        let mut run = 0u64;
        for block in (1..=self.capacity).rev() {
            let info = self.info_mut(block);
            if info.is_free() {
                run += 1;
                info.size = run;
            } else {
                run = 0;
            }
        }
    }

    /// Release an allocation.  Pointers this arena did not hand out are
    /// logged and left alone.
    pub fn free(&mut self, pointer: NonNull<u8>) {
        let address = pointer.as_ptr() as u64;
        let Some(block) = self.block_of(address) else {
            warn!("free of {address:#x} outside the heap arena");
            return;
        };
        let info = *self.info_mut(block);
        if info.is_fragmented() {
            let offset = address - self.block_address(block);
            let fragment = (offset >> info.kind) as usize;
            let size = info.frag_size[fragment];
            if offset & ((1 << info.kind) - 1) != 0 || size < 0 {
                warn!("free of {address:#x}: not a busy fragment");
                return;
            }
            let count = info.fragment_count() as u64;
            let entry = self.info_mut(block);
            entry.frag_size[fragment] = -1;
            entry.frag_ignore[fragment] = 0;
            entry.nfree += 1;
            if entry.nfree == count {
                *entry = MallocInfo::free(0);
                self.coalesce();
            }
            self.descriptor_mut().bytes_used -= size as u64;
        } else if info.kind == MALLOC_BLOCK && info.size > 0 && address == self.block_address(block) {
            for b in block..block + info.size as usize {
                *self.info_mut(b) = MallocInfo::free(0);
            }
            self.coalesce();
            self.descriptor_mut().bytes_used -= info.busy_size;
        } else {
            warn!("free of {address:#x}: not the start of a busy block");
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Ignored areas
    // ═══════════════════════════════════════════════════════════════════

    /// First block of the allocation containing `block`.
    fn allocation_head(&self, mut block: usize) -> Option<usize> {
        loop {
            let info = self.info(block)?;
            if info.kind != MALLOC_BLOCK {
                return None;
            }
            if info.size > 0 {
                return Some(block);
            }
            block -= 1;
        }
    }

    /// Mark `size` bytes at `address` as never compared, and return the
    /// region to declare to the checker.  `None` when `address` is not in
    /// a busy allocation.
    pub fn ignore(&mut self, address: u64, size: u64) -> Option<IgnoredHeapRegion> {
        let block = self.block_of(address)?;
        let info = self.info(block)?;
        if info.is_fragmented() {
            let fragment = ((address - self.block_address(block)) >> info.kind) as usize;
            if info.frag_size[fragment] < 0 {
                return None;
            }
            let entry = self.info_mut(block);
            entry.frag_ignore[fragment] = entry.frag_ignore[fragment].saturating_add(1);
            Some(IgnoredHeapRegion {
                block: block as i32,
                fragment: fragment as i32,
                address,
                size,
            })
        } else {
            let head = self.allocation_head(block)?;
            self.info_mut(head).ignore += 1;
            Some(IgnoredHeapRegion {
                block: head as i32,
                fragment: -1,
                address,
                size,
            })
        }
    }

    /// Undo one [`ignore`](Self::ignore) covering `address`.
    pub fn unignore(&mut self, address: u64) -> bool {
        let Some(block) = self.block_of(address) else {
            return false;
        };
        let Some(info) = self.info(block) else {
            return false;
        };
        if info.is_fragmented() {
            let fragment = ((address - self.block_address(block)) >> info.kind) as usize;
            let entry = self.info_mut(block);
            if entry.frag_ignore[fragment] == 0 {
                return false;
            }
            entry.frag_ignore[fragment] -= 1;
            true
        } else {
            let Some(head) = self.allocation_head(block) else {
                return false;
            };
            let entry = self.info_mut(head);
            if entry.ignore == 0 {
                return false;
            }
            entry.ignore -= 1;
            true
        }
    }
}

impl Drop for HeapArena {
    fn drop(&mut self) {
        if stepwise_heap.get() == self.descriptor_address() {
            stepwise_heap.set(0);
        }
        // SAFETY: the mapping was created in `new` with this length.
        unsafe { libc::munmap(self.mapping.as_ptr() as *mut libc::c_void, self.mapping_len) };
    }
}

impl std::fmt::Debug for HeapArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapArena")
            .field("descriptor", self.descriptor())
            .field("capacity", &self.capacity)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Global allocator
// ═══════════════════════════════════════════════════════════════════════

/// A [`HeapArena`] usable as `#[global_allocator]`, so every Rust
/// allocation of the checked process lands in memory the checker captures.
///
/// ```ignore
/// #[global_allocator]
/// static HEAP: ArenaAllocator = ArenaAllocator::new(4096);
/// ```
///
/// The arena is mapped and published on first use.  Alignments above
/// `BLOCKSIZE` are refused.
pub struct ArenaAllocator {
    capacity: usize,
    arena: Mutex<Option<HeapArena>>,
}

impl ArenaAllocator {
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            arena: Mutex::new(None),
        }
    }

    /// Run `f` on the arena, mapping it first if needed.
    ///
    /// `f` must not allocate: the allocator lock is held.
    pub fn with_arena<R>(&self, f: impl FnOnce(&mut HeapArena) -> R) -> Option<R> {
        let mut guard = self.arena.lock().ok()?;
        if guard.is_none() {
            let arena = HeapArena::new(self.capacity).ok()?;
            arena.publish();
            *guard = Some(arena);
        }
        guard.as_mut().map(f)
    }
}

// SAFETY: every request is served under the mutex; fragments of size
// 2^k sit at multiples of 2^k inside page-aligned blocks, so rounding the
// size up to the alignment gives an aligned result.
unsafe impl GlobalAlloc for ArenaAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > BLOCKSIZE {
            return ptr::null_mut();
        }
        let size = layout.size().max(layout.align());
        self.with_arena(|arena| arena.alloc(size))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, pointer: *mut u8, _layout: Layout) {
        if let Some(pointer) = NonNull::new(pointer) {
            self.with_arena(|arena| arena.free(pointer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_arena_is_one_free_run() {
        let arena = HeapArena::new(4).unwrap();
        assert_eq!(arena.base() % BLOCKSIZE as u64, 0);
        assert_eq!(arena.breakval(), arena.base());
        assert_eq!(arena.bytes_used(), 0);
        let first = arena.info(1).unwrap();
        assert!(first.is_free());
        assert_eq!(first.size, 4);
        assert_eq!(arena.info(4).unwrap().size, 1);
        assert!(arena.info(0).is_none());
        assert!(arena.info(5).is_none());
        assert!(HeapArena::new(0).is_err());
    }

    #[test]
    fn small_requests_share_a_fragmented_block() {
        let mut arena = HeapArena::new(4).unwrap();
        let a = arena.alloc(10).unwrap();
        let b = arena.alloc(16).unwrap();
        assert_eq!(a.as_ptr() as u64, arena.base());
        assert_eq!(b.as_ptr() as u64, arena.base() + 16);

        let info = arena.info(1).unwrap();
        assert_eq!(info.kind, 4);
        assert_eq!(info.frag_size[0], 10);
        assert_eq!(info.frag_size[1], 16);
        assert_eq!(info.frag_size[2], -1);
        assert_eq!(info.nfree, 254);
        assert_eq!(arena.bytes_used(), 26);
        assert_eq!(arena.breakval(), arena.base() + BLOCKSIZE as u64);

        // Other sizes get their own block.
        let c = arena.alloc(100).unwrap();
        assert_eq!(c.as_ptr() as u64, arena.base() + BLOCKSIZE as u64);
        assert_eq!(arena.info(2).unwrap().kind, 7);
    }

    #[test]
    fn freeing_the_last_fragment_frees_the_block() {
        let mut arena = HeapArena::new(4).unwrap();
        let a = arena.alloc(32).unwrap();
        let b = arena.alloc(32).unwrap();
        arena.free(a);
        assert!(arena.info(1).unwrap().is_fragmented());
        assert_eq!(arena.info(1).unwrap().frag_size[0], -1);
        // Freed fragments are reused first.
        let again = arena.alloc(20).unwrap();
        assert_eq!(again, a);
        arena.free(again);
        arena.free(b);
        assert!(arena.info(1).unwrap().is_free());
        assert_eq!(arena.info(1).unwrap().size, 4);
        assert_eq!(arena.bytes_used(), 0);
    }

    #[test]
    fn large_requests_take_whole_blocks() {
        let mut arena = HeapArena::new(8).unwrap();
        let big = arena.alloc(5000).unwrap();
        assert_eq!(big.as_ptr() as u64, arena.base());
        let head = arena.info(1).unwrap();
        assert_eq!((head.kind, head.size, head.busy_size), (MALLOC_BLOCK, 2, 5000));
        let next = arena.info(2).unwrap();
        assert_eq!((next.kind, next.size, next.busy_size), (MALLOC_BLOCK, 0, 0));
        assert_eq!(arena.info(3).unwrap().size, 6);

        let other = arena.alloc(3000).unwrap();
        assert_eq!(other.as_ptr() as u64, arena.base() + 2 * BLOCKSIZE as u64);
        arena.free(big);
        assert!(arena.info(2).unwrap().is_free());
        assert_eq!(arena.info(1).unwrap().size, 2);
        assert_eq!(arena.bytes_used(), 3000);
        // The break never moves back.
        assert_eq!(arena.breakval(), arena.base() + 3 * BLOCKSIZE as u64);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut arena = HeapArena::new(2).unwrap();
        assert!(arena.alloc(3 * BLOCKSIZE).is_none());
        assert!(arena.alloc(2 * BLOCKSIZE).is_some());
        assert!(arena.alloc(1).is_none());
    }

    #[test]
    fn bogus_frees_are_ignored() {
        let mut arena = HeapArena::new(2).unwrap();
        let a = arena.alloc(64).unwrap();
        let inside = NonNull::new(unsafe { a.as_ptr().add(8) }).unwrap();
        arena.free(inside);
        arena.free(NonNull::dangling());
        assert_eq!(arena.bytes_used(), 64);
    }

    #[test]
    fn ignore_counts_per_fragment_and_per_block() {
        let mut arena = HeapArena::new(4).unwrap();
        let small = arena.alloc(16).unwrap().as_ptr() as u64;
        let region = arena.ignore(small + 8, 8).unwrap();
        assert_eq!((region.block, region.fragment, region.size), (1, 0, 8));
        assert_eq!(arena.info(1).unwrap().frag_ignore[0], 1);

        let big = arena.alloc(6000).unwrap().as_ptr() as u64;
        let region = arena.ignore(big + 5000, 4).unwrap();
        assert_eq!((region.block, region.fragment), (2, -1));
        assert_eq!(arena.info(2).unwrap().ignore, 1);

        assert!(arena.unignore(big + 5000));
        assert!(!arena.unignore(big + 5000));
        assert!(arena.unignore(small + 8));
        assert_eq!(arena.info(1).unwrap().frag_ignore[0], 0);

        // Nothing allocated there.
        assert!(arena.ignore(arena.base() + 3 * BLOCKSIZE as u64, 8).is_none());
    }

    #[test]
    fn fragment_shift_rounds_up() {
        assert_eq!(fragment_shift(1), MIN_FRAGMENT_SHIFT);
        assert_eq!(fragment_shift(16), 4);
        assert_eq!(fragment_shift(17), 5);
        assert_eq!(fragment_shift(2048), 11);
    }

    #[test]
    fn allocator_honours_alignment() {
        let allocator = ArenaAllocator::new(8);
        let layout = Layout::from_size_align(24, 64).unwrap();
        let pointer = unsafe { allocator.alloc(layout) };
        assert!(!pointer.is_null());
        assert_eq!(pointer as usize % 64, 0);
        unsafe { allocator.dealloc(pointer, layout) };
        assert_eq!(allocator.with_arena(|a| a.bytes_used()), Some(0));
        let huge = Layout::from_size_align(8, 2 * BLOCKSIZE).unwrap();
        assert!(unsafe { allocator.alloc(huge) }.is_null());
    }
}
