//! Local mirror of the checked process's allocator metadata.

use stepwise_protocol::layout::{HeapDescriptor, MallocInfo, BLOCKSIZE};

/// Heap descriptor plus a copy of the block table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapLayout {
    pub descriptor: HeapDescriptor,
    /// Indexed by block number; entry 0 is unused.
    pub infos: Vec<MallocInfo>,
}

impl HeapLayout {
    pub fn base(&self) -> u64 {
        self.descriptor.heapbase
    }

    pub fn end(&self) -> u64 {
        self.descriptor.breakval
    }

    /// Number of blocks, also the highest valid block number.
    pub fn heaplimit(&self) -> usize {
        self.descriptor.heaplimit as usize
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base() && address < self.end()
    }

    /// Block number of `address`, counted from 1.
    pub fn block_of(&self, address: u64) -> Option<usize> {
        if address < self.base() {
            return None;
        }
        let block = ((address - self.base()) / BLOCKSIZE as u64) as usize + 1;
        (block <= self.heaplimit() && block < self.infos.len()).then_some(block)
    }

    pub fn block_address(&self, block: usize) -> u64 {
        self.base() + (block as u64 - 1) * BLOCKSIZE as u64
    }

    pub fn info(&self, block: usize) -> Option<&MallocInfo> {
        if block == 0 {
            return None;
        }
        self.infos.get(block)
    }

    /// Fragment of `address` inside fragmented block `block`.
    pub fn fragment_of(&self, block: usize, address: u64) -> Option<usize> {
        let info = self.info(block)?;
        if !info.is_fragmented() || !info.has_valid_kind() {
            return None;
        }
        Some(((address - self.block_address(block)) >> info.kind) as usize)
    }

    pub fn fragment_address(&self, block: usize, fragment: usize) -> Option<u64> {
        let info = self.info(block)?;
        (info.is_fragmented() && info.has_valid_kind())
            .then(|| self.block_address(block) + ((fragment as u64) << info.kind))
    }

    /// Bytes in use according to the block table.
    pub fn bytes_used(&self) -> u64 {
        let mut total = 0u64;
        for info in self.infos.iter().skip(1).take(self.heaplimit()) {
            if info.kind == 0 {
                total += info.busy_size;
            } else if info.kind > 0 {
                for &size in &info.frag_size[..info.fragment_count()] {
                    if size > 0 {
                        total += size as u64;
                    }
                }
            }
        }
        total
    }
}
