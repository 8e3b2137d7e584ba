//! Point-in-time copies of the checked process's memory.
//!
//! A [`Snapshot`] holds one [`RegionSnapshot`] per loaded object's data
//! segment followed by one for the heap, always in that order.  Heap pages
//! go through the shared [`PageStore`] when sparse capture is enabled, so
//! unchanged pages cost a reference count instead of a copy.
//!
//! Globally ignored regions are zeroed in the checked process for the
//! duration of the capture and written back right after, so their content
//! never reaches a snapshot or a comparison.

pub mod hash;
pub mod page_store;
pub mod region;
pub mod stack;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::mem::size_of;
use std::rc::Rc;

use log::debug;
use nix::unistd::Pid;
use stepwise_protocol::layout::{HeapDescriptor, MallocInfo, Plain, LOADED_SEGMENT_SYMBOL};
use stepwise_protocol::{IgnoredHeapRegion, Message, StackRegion};
use thiserror::Error;

use crate::address::remote;
use crate::channel::TransportError;
use crate::heap::HeapLayout;
use crate::remote::{ProcessIndex, RemoteError, RemoteSimulation};

pub use page_store::{PageStore, PAGE_SIZE};
pub use region::{RegionSnapshot, RegionStorage, RegionType, StorageType};
pub use stack::{LocalVariable, StackFrame, StackSnapshot};

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("cannot restore a region with {0:?} storage")]
    UnsupportedStorage(StorageType),

    #[error("FD snapshot not implemented in client/server mode")]
    FdRestoreUnsupported,

    #[error("region at {0:#x} is not at the beginning of a page")]
    Unaligned(u64),

    #[error("{size} bytes at {address:#x} are outside the region")]
    OutOfRegion { address: u64, size: usize },

    #[error("address {0:#x} is in no captured region")]
    NotInSnapshot(u64),

    #[error("region at {0:#x} holds no data")]
    NoData(u64),

    #[error("missing process index for privatized address {0:#x}")]
    MissingProcessIndex(u64),

    #[error("no replica {0} in privatized region")]
    InvalidReplica(usize),

    #[error("unexpected end of stack at ip {ip:#x}")]
    UnexpectedEndOfStack { ip: u64 },

    #[error("error while unwinding stack: {0}")]
    Unwind(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to capture besides the memory regions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Page-deduplicated storage for page-aligned regions.
    pub sparse_checkpoint: bool,
    /// Unwind stacks (needed for state comparison).
    pub capture_stacks: bool,
    pub hash: bool,
    pub snapshot_fds: bool,
}

/// A regular file open in the checked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptorInfo {
    pub number: i32,
    pub path: String,
    pub offset: u64,
    pub flags: i32,
}

/// Saved content of a globally ignored region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredData {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Snapshot {
    pub num_state: u64,
    pub enabled_processes: BTreeSet<u64>,
    pub hash: u64,
    /// Replica mapped at the nominal address, for privatized processes.
    pub privatization_index: Option<i32>,
    pub regions: Vec<RegionSnapshot>,
    /// Heap descriptor and block table, restored with the heap but never compared.
    pub allocator: Vec<RegionSnapshot>,
    pub heap: Option<HeapLayout>,
    pub heap_bytes_used: u64,
    pub stacks: Vec<StackSnapshot>,
    pub stack_sizes: Vec<u64>,
    pub stack_areas: Vec<StackRegion>,
    pub to_ignore: Vec<IgnoredHeapRegion>,
    pub ignored_data: Vec<IgnoredData>,
    pub fds: Vec<FileDescriptorInfo>,
}

impl Snapshot {
    pub fn take(
        process: &mut RemoteSimulation,
        store: &Rc<RefCell<PageStore>>,
        num_state: u64,
        config: &SnapshotConfig,
    ) -> Result<Self, SnapshotError> {
        let enabled_processes = process.actors()?.iter().map(|a| a.pid()).collect();
        let heap = process.heap_layout()?;

        let ignored_data = handle_ignore(process)?;
        let captured = capture_regions(process, store, heap.as_ref(), config);
        let restored = ignore_restore(process, &ignored_data);
        let regions = captured?;
        restored?;
        let allocator = capture_allocator(process, heap.as_ref())?;

        let fds = if config.snapshot_fds {
            current_fds(process.pid())?
        } else {
            Vec::new()
        };
        let privatization_index = if process.privatized() && process.process_count()? > 0 {
            Some(process.read_variable::<i32>(LOADED_SEGMENT_SYMBOL)?)
        } else {
            None
        };
        let (stacks, stack_sizes) = if config.capture_stacks {
            stack::take_stacks(process)?
        } else {
            (Vec::new(), Vec::new())
        };

        let mut snapshot = Self {
            num_state,
            enabled_processes,
            hash: 0,
            privatization_index,
            regions,
            allocator,
            heap_bytes_used: heap.as_ref().map_or(0, HeapLayout::bytes_used),
            heap,
            stacks,
            stack_sizes,
            stack_areas: process.stack_areas().to_vec(),
            to_ignore: process.ignored_heap().to_vec(),
            ignored_data,
            fds,
        };
        if config.capture_stacks && config.hash {
            snapshot.hash = hash::hash_snapshot(&snapshot);
        }
        debug!(
            "snapshot {}: {} regions, {} heap bytes, hash {:#x}",
            num_state,
            snapshot.regions.len(),
            snapshot.heap_bytes_used,
            snapshot.hash
        );
        Ok(snapshot)
    }

    /// Put the checked process back in the captured state.
    pub fn restore(&self, process: &mut RemoteSimulation) -> Result<(), SnapshotError> {
        if !self.fds.is_empty() {
            return Err(SnapshotError::FdRestoreUnsupported);
        }
        for region in self.regions.iter().chain(&self.allocator) {
            region.restore(process)?;
        }
        if let Some(index) = self.privatization_index {
            process.channel().send(&Message::Restore { index })?;
        }
        ignore_restore(process, &self.ignored_data)?;
        process.clear_cache();
        Ok(())
    }

    pub fn region_for(&self, address: u64) -> Option<&RegionSnapshot> {
        self.regions.iter().find(|r| r.contains(address))
    }

    pub fn heap_region(&self) -> Option<&RegionSnapshot> {
        self.regions.iter().find(|r| r.region_type == RegionType::Heap)
    }

    pub fn read_bytes(
        &self,
        address: u64,
        buf: &mut [u8],
        index: ProcessIndex,
    ) -> Result<(), SnapshotError> {
        self.region_for(address)
            .ok_or(SnapshotError::NotInSnapshot(address))?
            .read(address, buf, index)
    }

    pub fn read<T: Plain>(&self, address: u64, index: ProcessIndex) -> Result<T, SnapshotError> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.read_bytes(address, &mut buf, index)?;
        T::from_bytes(&buf).ok_or(SnapshotError::OutOfRegion {
            address,
            size: buf.len(),
        })
    }

    pub fn read_u64(&self, address: u64, index: ProcessIndex) -> Result<u64, SnapshotError> {
        self.read::<u64>(address, index)
    }

    pub fn heap_end(&self) -> u64 {
        self.heap.as_ref().map_or(0, HeapLayout::end)
    }

    pub fn in_stack(&self, address: u64) -> bool {
        self.stack_areas
            .iter()
            .any(|s| address >= s.address && address < s.address + s.size)
    }
}

fn capture_regions(
    process: &RemoteSimulation,
    store: &Rc<RefCell<PageStore>>,
    heap: Option<&HeapLayout>,
    config: &SnapshotConfig,
) -> Result<Vec<RegionSnapshot>, SnapshotError> {
    let sparse = config.sparse_checkpoint;
    let mut regions = Vec::new();
    for (i, info) in process.object_infos().iter().enumerate() {
        if info.end_rw <= info.start_rw {
            continue;
        }
        let size = (info.end_rw - info.start_rw) as usize;
        let replicas = if info.privatized {
            process.privatization_regions()?
        } else {
            Vec::new()
        };
        let region = if replicas.is_empty() {
            RegionSnapshot::capture(
                store,
                process,
                RegionType::Data,
                info.start_rw,
                info.start_rw,
                size,
                sparse,
            )?
        } else {
            let data = replicas
                .iter()
                .map(|r| {
                    RegionSnapshot::capture(
                        store,
                        process,
                        RegionType::Data,
                        info.start_rw,
                        r.address,
                        size,
                        sparse,
                    )
                })
                .collect::<Result<Vec<_>, _>>()?;
            RegionSnapshot::privatized(RegionType::Data, info.start_rw, info.start_rw, size, data)
        };
        regions.push(region.with_object(i));
    }

    if let Some(heap) = heap {
        let size = heap.end().saturating_sub(heap.base()) as usize;
        regions.push(RegionSnapshot::capture(
            store,
            process,
            RegionType::Heap,
            heap.base(),
            heap.base(),
            size,
            sparse,
        )?);
    }
    Ok(regions)
}

fn capture_allocator(
    process: &RemoteSimulation,
    heap: Option<&HeapLayout>,
) -> Result<Vec<RegionSnapshot>, SnapshotError> {
    let (Some(heap), Some(descriptor)) = (heap, process.heap_address()) else {
        return Ok(Vec::new());
    };
    let table = heap.infos.len() * size_of::<MallocInfo>();
    Ok(vec![
        RegionSnapshot::flat(
            process,
            RegionType::Heap,
            descriptor.address(),
            descriptor.address(),
            size_of::<HeapDescriptor>(),
        )?,
        RegionSnapshot::flat(
            process,
            RegionType::Heap,
            heap.descriptor.heapinfo,
            heap.descriptor.heapinfo,
            table,
        )?,
    ])
}

/// Save then zero every globally ignored region.
fn handle_ignore(process: &RemoteSimulation) -> Result<Vec<IgnoredData>, SnapshotError> {
    let mut saved = Vec::with_capacity(process.ignored_regions().len());
    for region in process.ignored_regions() {
        let mut data = vec![0u8; region.size as usize];
        process.read_bytes(&mut data, remote::<u8>(region.address), ProcessIndex::Disabled)?;
        saved.push(IgnoredData {
            address: region.address,
            data,
        });
    }
    for region in process.ignored_regions() {
        process.clear_bytes(remote::<u8>(region.address), region.size as usize)?;
    }
    Ok(saved)
}

fn ignore_restore(process: &RemoteSimulation, saved: &[IgnoredData]) -> Result<(), SnapshotError> {
    for ignored in saved {
        process.write_bytes(&ignored.data, remote::<u8>(ignored.address))?;
    }
    Ok(())
}

/// Regular files open in `pid`; pipes, sockets and devices are skipped.
fn current_fds(pid: Pid) -> Result<Vec<FileDescriptorInfo>, SnapshotError> {
    let mut fds = Vec::new();
    for entry in fs::read_dir(format!("/proc/{pid}/fd"))? {
        let entry = entry?;
        let Ok(number) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(link) = fs::read_link(entry.path()) else {
            continue;
        };
        let path = link.to_string_lossy().into_owned();
        if !path.starts_with('/') || path.starts_with("/dev/") || path.starts_with("/proc/") {
            continue;
        }
        let Ok(info) = fs::read_to_string(format!("/proc/{pid}/fdinfo/{number}")) else {
            continue;
        };
        let mut offset = 0;
        let mut flags = 0;
        for line in info.lines() {
            if let Some(value) = line.strip_prefix("pos:") {
                offset = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = line.strip_prefix("flags:") {
                flags = i32::from_str_radix(value.trim(), 8).unwrap_or(0);
            }
        }
        fds.push(FileDescriptorInfo {
            number,
            path,
            offset,
            flags,
        });
    }
    fds.sort_by_key(|fd| fd.number);
    Ok(fds)
}
