//! Cheap fingerprint of a snapshot.
//!
//! Covers only what `snapshot_equal` requires to be identical, so equal
//! snapshots always hash equal.

use super::Snapshot;

pub fn hash_snapshot(snapshot: &Snapshot) -> u64 {
    let mut hash = Djb::default();
    hash.write_u64(snapshot.enabled_processes.len() as u64);
    for pid in &snapshot.enabled_processes {
        hash.write_u64(*pid);
    }
    hash.write_u64(snapshot.heap_bytes_used);
    for (stack, size) in snapshot.stacks.iter().zip(&snapshot.stack_sizes) {
        hash.write_u64(*size);
        hash.write_u64(stack.frames.len() as u64);
        for frame in &stack.frames {
            hash.write(frame.frame_name.as_bytes());
        }
    }
    hash.0
}

struct Djb(u64);

impl Default for Djb {
    fn default() -> Self {
        Self(5381)
    }
}

impl Djb {
    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 = (self.0 << 5).wrapping_add(self.0).wrapping_add(b as u64);
        }
    }

    fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }
}
