//! The checked process as seen from the checker.
//!
//! [`RemoteSimulation`] is the only way to touch the checked process's
//! memory.  Reads go through `/proc/<pid>/mem`; allocator metadata and the
//! actor table are mirrored locally and refreshed lazily, one cache bit per
//! mirror.  Every resume of the checked process must call
//! [`RemoteSimulation::clear_cache`], otherwise the mirrors go stale.

use std::fs::{self, File, OpenOptions};
use std::mem::size_of;
use std::os::unix::fs::FileExt;

use log::{debug, warn};
use nix::unistd::Pid;
use stepwise_protocol::layout::{
    ActorRecord, ActorTable, HeapDescriptor, MallocInfo, Plain, PrivatizationRegion,
    ACTORS_SYMBOL, HEAP_SYMBOL, PRIVATIZATION_REGIONS_SYMBOL, PROCESS_COUNT_SYMBOL,
};
use stepwise_protocol::{IgnoredHeapRegion, StackRegion};
use thiserror::Error;

use crate::address::{remote, RemotePtr};
use crate::channel::Channel;
use crate::heap::HeapLayout;
use crate::memory_map::{read_maps, MapsError, VmMap};
use crate::object_info::{Frame, ObjectError, ObjectInformation, Variable};

/// Heap descriptor mirror is valid.
pub const CACHE_HEAP: u32 = 1;
/// Block table mirror is valid.
pub const CACHE_MALLOC: u32 = 2;
/// Actor table mirror is valid.
pub const CACHE_ACTORS: u32 = 4;

const MAX_ACTORS: u64 = 1 << 20;
/// 64 GiB of 4 KiB blocks.
const MAX_HEAP_BLOCKS: u64 = 1 << 24;
/// Largest single buffer copied out of the checked process.
pub const MAX_REMOTE_BUFFER: u64 = 1 << 26;
const STRING_CHUNK: usize = 64;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("cannot access {size} bytes at {address:#x} in process {pid}: {source}")]
    MemoryAccess {
        pid: Pid,
        address: u64,
        size: usize,
        source: std::io::Error,
    },

    #[error("cannot open the memory of process {pid}: {source}")]
    OpenMemory { pid: Pid, source: std::io::Error },

    #[error("symbol {0} not found in the checked process")]
    SymbolNotFound(String),

    #[error("missing process index for privatized address {0:#x}")]
    MissingProcessIndex(u64),

    #[error("invalid process index {index} (process count {count})")]
    InvalidProcessIndex { index: usize, count: usize },

    #[error("inconsistent remote state: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Maps(#[from] MapsError),

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which replica of a privatized data segment an access targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessIndex {
    /// No replica known; accessing a privatized address is an error.
    Missing,
    /// Use the nominal address, whatever replica is mapped there.
    Disabled,
    Index(usize),
}

impl ProcessIndex {
    /// From the wire encoding: negative means missing.
    pub fn from_raw(raw: i32) -> Self {
        if raw < 0 {
            Self::Missing
        } else {
            Self::Index(raw as usize)
        }
    }
}

/// A global memory range excluded from snapshots and comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IgnoredRegion {
    pub address: u64,
    pub size: u64,
}

/// Refresh counters of the lazy mirrors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub heap_refreshes: u64,
    pub malloc_info_refreshes: u64,
    pub actor_refreshes: u64,
}

/// Local copy of one actor control block.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorInformation {
    pub address: RemotePtr<ActorRecord>,
    pub record: ActorRecord,
    pub name: String,
    pub hostname: String,
}

impl ActorInformation {
    pub fn pid(&self) -> u64 {
        self.record.pid
    }
}

pub struct RemoteSimulation {
    pid: Pid,
    running: bool,
    channel: Channel,
    memory: File,
    object_infos: Vec<ObjectInformation>,
    maestro_stack: Option<(u64, u64)>,
    stack_areas: Vec<StackRegion>,
    ignored_regions: Vec<IgnoredRegion>,
    ignored_heap: Vec<IgnoredHeapRegion>,
    heap_address: Option<RemotePtr<HeapDescriptor>>,
    actors_address: Option<RemotePtr<ActorTable>>,
    privatized: bool,
    cache_flags: u32,
    heap: Option<HeapDescriptor>,
    heap_info: Vec<MallocInfo>,
    actors: Vec<ActorInformation>,
    dead_actors: Vec<ActorInformation>,
    stats: CacheStats,
}

impl RemoteSimulation {
    /// Attach to `pid`; call [`init`](Self::init) before reading symbols.
    pub fn new(pid: Pid, channel: Channel) -> Result<Self, RemoteError> {
        let memory = OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!("/proc/{pid}/mem"))
            .map_err(|source| RemoteError::OpenMemory { pid, source })?;
        Ok(Self {
            pid,
            running: true,
            channel,
            memory,
            object_infos: Vec::new(),
            maestro_stack: None,
            stack_areas: Vec::new(),
            ignored_regions: Vec::new(),
            ignored_heap: Vec::new(),
            heap_address: None,
            actors_address: None,
            privatized: false,
            cache_flags: 0,
            heap: None,
            heap_info: Vec::new(),
            actors: Vec::new(),
            dead_actors: Vec::new(),
            stats: CacheStats::default(),
        })
    }

    /// First-time discovery of the loaded objects and well-known symbols.
    pub fn init(&mut self) -> Result<(), RemoteError> {
        let maps = read_maps(self.pid)?;
        let exe = fs::read_link(format!("/proc/{}/exe", self.pid))?;
        let exe = exe.to_string_lossy().into_owned();

        self.maestro_stack = maps
            .iter()
            .find(|m| m.pathname == "[stack]")
            .map(|m| (m.start_addr, m.end_addr));

        let mut names = vec![exe.clone()];
        for map in &maps {
            if map.is_file_backed()
                && !is_system_object(&map.pathname)
                && !names.contains(&map.pathname)
            {
                names.push(map.pathname.clone());
            }
        }
        for name in names {
            let info = load_object(&name, &maps)?;
            self.object_infos.push(info);
        }

        self.heap_address = match self.find_variable(HEAP_SYMBOL).and_then(Variable::address) {
            Some(address) => {
                let pointer: u64 = self.read(remote(address))?;
                (pointer != 0).then(|| remote(pointer))
            }
            None => None,
        };
        self.actors_address = self
            .find_variable(ACTORS_SYMBOL)
            .and_then(Variable::address)
            .map(remote);

        if self.process_count()? > 0 {
            self.privatized = true;
            if let Some(info) = self.object_infos.first_mut() {
                info.privatized = true;
            }
        }

        debug!(
            "process {}: {} objects, heap {:?}, actors {:?}, privatized {}",
            self.pid,
            self.object_infos.len(),
            self.heap_address,
            self.actors_address,
            self.privatized
        );
        Ok(())
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// The checked process is gone.
    pub fn terminate(&mut self) {
        self.running = false;
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Raw memory
    // ═══════════════════════════════════════════════════════════════════

    /// Copy `buf.len()` bytes from the checked process.
    pub fn read_bytes<T>(
        &self,
        buf: &mut [u8],
        address: RemotePtr<T>,
        index: ProcessIndex,
    ) -> Result<(), RemoteError> {
        let real = self.translate(address.address(), index)?;
        self.memory
            .read_exact_at(buf, real)
            .map_err(|source| RemoteError::MemoryAccess {
                pid: self.pid,
                address: real,
                size: buf.len(),
                source,
            })
    }

    /// Raw read at the nominal address; unreadable bytes are left zero.
    pub fn read_bytes_unchecked<T>(&self, buf: &mut [u8], address: RemotePtr<T>) -> usize {
        buf.fill(0);
        let mut done = 0;
        while done < buf.len() {
            match self.memory.read_at(&mut buf[done..], address.address() + done as u64) {
                Ok(0) | Err(_) => break,
                Ok(n) => done += n,
            }
        }
        done
    }

    /// Owned copy of a buffer whose size comes from the checked process.
    pub fn read_buffer(&self, address: u64, size: u64) -> Result<Vec<u8>, RemoteError> {
        if size > MAX_REMOTE_BUFFER {
            return Err(RemoteError::Inconsistent(format!(
                "buffer of {size} bytes at {address:#x}"
            )));
        }
        let mut buf = vec![0u8; size as usize];
        self.read_bytes(&mut buf, remote::<u8>(address), ProcessIndex::Disabled)?;
        Ok(buf)
    }

    pub fn read<T: Plain>(&self, address: RemotePtr<T>) -> Result<T, RemoteError> {
        self.read_indexed(address, ProcessIndex::Disabled)
    }

    pub fn read_indexed<T: Plain>(
        &self,
        address: RemotePtr<T>,
        index: ProcessIndex,
    ) -> Result<T, RemoteError> {
        let mut buf = vec![0u8; size_of::<T>()];
        self.read_bytes(&mut buf, address, index)?;
        T::from_bytes(&buf).ok_or_else(|| RemoteError::Inconsistent("short record".into()))
    }

    /// Read `count` consecutive records.
    pub fn read_array<T: Plain>(
        &self,
        address: RemotePtr<T>,
        count: usize,
    ) -> Result<Vec<T>, RemoteError> {
        let size = size_of::<T>();
        let mut buf = vec![0u8; size * count];
        self.read_bytes(&mut buf, address, ProcessIndex::Disabled)?;
        Ok(buf
            .chunks_exact(size)
            .filter_map(T::from_bytes)
            .collect())
    }

    /// Read a NUL-terminated string.
    pub fn read_string(&self, address: RemotePtr<u8>) -> Result<String, RemoteError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; STRING_CHUNK];
        loop {
            let at = address.address() + out.len() as u64;
            let n = self
                .memory
                .read_at(&mut chunk, at)
                .map_err(|source| RemoteError::MemoryAccess {
                    pid: self.pid,
                    address: at,
                    size: chunk.len(),
                    source,
                })?;
            if n == 0 {
                return Err(RemoteError::MemoryAccess {
                    pid: self.pid,
                    address: at,
                    size: chunk.len(),
                    source: std::io::ErrorKind::UnexpectedEof.into(),
                });
            }
            if let Some(end) = chunk[..n].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..end]);
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Write into the checked process; only snapshot restore does this.
    pub fn write_bytes<T>(&self, data: &[u8], address: RemotePtr<T>) -> Result<(), RemoteError> {
        self.memory
            .write_all_at(data, address.address())
            .map_err(|source| RemoteError::MemoryAccess {
                pid: self.pid,
                address: address.address(),
                size: data.len(),
                source,
            })
    }

    pub fn clear_bytes<T>(&self, address: RemotePtr<T>, size: usize) -> Result<(), RemoteError> {
        self.write_bytes(&vec![0u8; size], address)
    }

    fn translate(&self, address: u64, index: ProcessIndex) -> Result<u64, RemoteError> {
        if !self.privatized || index == ProcessIndex::Disabled {
            return Ok(address);
        }
        let Some(info) = self.find_object_info_rw(address) else {
            return Ok(address);
        };
        if !info.privatized {
            return Ok(address);
        }
        match index {
            ProcessIndex::Disabled => Ok(address),
            ProcessIndex::Missing => Err(RemoteError::MissingProcessIndex(address)),
            ProcessIndex::Index(i) => {
                let regions = self.privatization_regions()?;
                let region = regions.get(i).ok_or(RemoteError::InvalidProcessIndex {
                    index: i,
                    count: regions.len(),
                })?;
                Ok(region.address + (address - info.start_rw))
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Symbols and objects
    // ═══════════════════════════════════════════════════════════════════

    pub fn object_infos(&self) -> &[ObjectInformation] {
        &self.object_infos
    }

    pub fn add_object_info(&mut self, info: ObjectInformation) {
        self.object_infos.push(info);
    }

    pub fn find_object_info(&self, address: u64) -> Option<&ObjectInformation> {
        self.object_infos.iter().find(|o| o.contains(address))
    }

    pub fn find_object_info_exec(&self, address: u64) -> Option<&ObjectInformation> {
        self.object_infos.iter().find(|o| o.contains_exec(address))
    }

    pub fn find_object_info_rw(&self, address: u64) -> Option<&ObjectInformation> {
        self.object_infos.iter().find(|o| o.contains_rw(address))
    }

    pub fn find_function(&self, ip: u64) -> Option<&Frame> {
        self.find_object_info_exec(ip)?.find_function(ip)
    }

    /// Look up a global variable, executable first.
    pub fn find_variable(&self, name: &str) -> Option<&Variable> {
        self.object_infos.iter().find_map(|o| o.find_variable(name))
    }

    pub fn read_variable<T: Plain>(&self, name: &str) -> Result<T, RemoteError> {
        let address = self
            .find_variable(name)
            .and_then(Variable::address)
            .ok_or_else(|| RemoteError::SymbolNotFound(name.to_string()))?;
        self.read(remote(address))
    }

    pub fn privatized(&self) -> bool {
        self.privatized
    }

    /// Number of replicas, `0` when the process is not privatized.
    pub fn process_count(&self) -> Result<usize, RemoteError> {
        if self.find_variable(PROCESS_COUNT_SYMBOL).is_none() {
            return Ok(0);
        }
        let count: i32 = self.read_variable(PROCESS_COUNT_SYMBOL)?;
        Ok(count.max(0) as usize)
    }

    pub fn privatization_regions(&self) -> Result<Vec<PrivatizationRegion>, RemoteError> {
        let count = self.process_count()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let array: u64 = self.read_variable(PRIVATIZATION_REGIONS_SYMBOL)?;
        self.read_array(remote(array), count)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Stacks and ignore lists
    // ═══════════════════════════════════════════════════════════════════

    pub fn stack_areas(&self) -> &[StackRegion] {
        &self.stack_areas
    }

    pub fn add_stack_area(&mut self, region: StackRegion) {
        self.stack_areas.push(region);
    }

    /// Inside an actor stack or the main thread's stack.
    pub fn in_stack(&self, address: u64) -> bool {
        self.stack_areas
            .iter()
            .any(|s| address >= s.address && address < s.address + s.size)
            || self
                .maestro_stack
                .is_some_and(|(start, end)| address >= start && address < end)
    }

    pub fn ignored_regions(&self) -> &[IgnoredRegion] {
        &self.ignored_regions
    }

    /// Keep the list sorted by (address, size) without duplicates.
    pub fn ignore_region(&mut self, address: u64, size: u64) {
        let region = IgnoredRegion { address, size };
        if let Err(pos) = self.ignored_regions.binary_search(&region) {
            self.ignored_regions.insert(pos, region);
        }
    }

    pub fn ignored_heap(&self) -> &[IgnoredHeapRegion] {
        &self.ignored_heap
    }

    pub fn ignore_heap(&mut self, region: IgnoredHeapRegion) {
        if let Err(pos) = self
            .ignored_heap
            .binary_search_by_key(&region.address, |r| r.address)
        {
            self.ignored_heap.insert(pos, region);
        }
    }

    pub fn unignore_heap(&mut self, address: u64, _size: u64) {
        if let Ok(pos) = self
            .ignored_heap
            .binary_search_by_key(&address, |r| r.address)
        {
            self.ignored_heap.remove(pos);
        }
    }

    pub fn ignore_global_variable(&mut self, name: &str) {
        for info in &mut self.object_infos {
            info.remove_global_variable(name);
        }
    }

    /// `frame` of `"*"` means every function.
    pub fn ignore_local_variable(&mut self, name: &str, frame: &str) {
        let frame = (frame != "*").then_some(frame);
        for info in &mut self.object_infos {
            info.remove_local_variable(name, frame);
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Lazy mirrors
    // ═══════════════════════════════════════════════════════════════════

    pub fn heap_address(&self) -> Option<RemotePtr<HeapDescriptor>> {
        self.heap_address
    }

    pub fn set_heap_address(&mut self, address: RemotePtr<HeapDescriptor>) {
        self.heap_address = Some(address);
        self.clear_cache();
    }

    pub fn set_actors_address(&mut self, address: RemotePtr<ActorTable>) {
        self.actors_address = Some(address);
        self.clear_cache();
    }

    /// Heap descriptor, `None` when the process has no published heap.
    pub fn get_heap(&mut self) -> Result<Option<HeapDescriptor>, RemoteError> {
        let Some(address) = self.heap_address else {
            return Ok(None);
        };
        if self.cache_flags & CACHE_HEAP == 0 {
            self.heap = Some(self.read(address)?);
            self.cache_flags |= CACHE_HEAP;
            self.stats.heap_refreshes += 1;
        }
        Ok(self.heap)
    }

    /// Block table, indexed by block number (entry 0 unused).
    pub fn get_malloc_info(&mut self) -> Result<&[MallocInfo], RemoteError> {
        if self.cache_flags & CACHE_MALLOC == 0 {
            let Some(heap) = self.get_heap()? else {
                return Ok(&[]);
            };
            if heap.heaplimit > MAX_HEAP_BLOCKS {
                return Err(RemoteError::Inconsistent(format!(
                    "heap claims {} blocks",
                    heap.heaplimit
                )));
            }
            let infos: Vec<MallocInfo> =
                self.read_array(remote(heap.heapinfo), heap.heaplimit as usize + 1)?;
            if let Some((block, info)) =
                infos.iter().enumerate().skip(1).find(|(_, i)| !i.has_valid_kind())
            {
                return Err(RemoteError::Inconsistent(format!(
                    "block {block} has kind {}",
                    info.kind
                )));
            }
            self.heap_info = infos;
            self.cache_flags |= CACHE_MALLOC;
            self.stats.malloc_info_refreshes += 1;
        }
        Ok(&self.heap_info)
    }

    /// Owned copy of the heap metadata, for snapshots.
    pub fn heap_layout(&mut self) -> Result<Option<HeapLayout>, RemoteError> {
        let Some(descriptor) = self.get_heap()? else {
            return Ok(None);
        };
        let infos = self.get_malloc_info()?.to_vec();
        Ok(Some(HeapLayout { descriptor, infos }))
    }

    pub fn actors(&mut self) -> Result<&[ActorInformation], RemoteError> {
        self.refresh_simix()?;
        Ok(&self.actors)
    }

    pub fn dead_actors(&mut self) -> Result<&[ActorInformation], RemoteError> {
        self.refresh_simix()?;
        Ok(&self.dead_actors)
    }

    pub fn refresh_simix(&mut self) -> Result<(), RemoteError> {
        if self.cache_flags & CACHE_ACTORS != 0 {
            return Ok(());
        }
        let (actors, dead) = match self.actors_address {
            Some(address) => {
                let table = self.read(address)?;
                (
                    self.read_actors(table.actors, table.actor_count)?,
                    self.read_actors(table.dead_actors, table.dead_actor_count)?,
                )
            }
            None => (Vec::new(), Vec::new()),
        };
        self.actors = actors;
        self.dead_actors = dead;
        self.cache_flags |= CACHE_ACTORS;
        self.stats.actor_refreshes += 1;
        Ok(())
    }

    fn read_actors(&self, array: u64, count: u64) -> Result<Vec<ActorInformation>, RemoteError> {
        if count > MAX_ACTORS {
            return Err(RemoteError::Inconsistent(format!(
                "actor table claims {count} actors"
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let base: RemotePtr<ActorRecord> = remote(array);
        let records = self.read_array(base, count as usize)?;
        records
            .into_iter()
            .enumerate()
            .map(|(i, record)| {
                let name = self.read_optional_string(record.name)?;
                let hostname = self.read_optional_string(record.host)?;
                Ok(ActorInformation {
                    address: base.element(i as u64),
                    record,
                    name,
                    hostname,
                })
            })
            .collect()
    }

    fn read_optional_string(&self, address: u64) -> Result<String, RemoteError> {
        if address == 0 {
            Ok(String::new())
        } else {
            self.read_string(remote(address))
        }
    }

    /// Drop every mirror.  Call whenever the checked process runs.
    pub fn clear_cache(&mut self) {
        self.cache_flags = 0;
    }

    pub fn cache_flags(&self) -> u32 {
        self.cache_flags
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }
}

impl std::fmt::Debug for RemoteSimulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSimulation")
            .field("pid", &self.pid)
            .field("running", &self.running)
            .field("objects", &self.object_infos.len())
            .field("stacks", &self.stack_areas.len())
            .field("cache_flags", &self.cache_flags)
            .finish_non_exhaustive()
    }
}

fn load_object(name: &str, maps: &[VmMap]) -> Result<ObjectInformation, RemoteError> {
    let mut info = ObjectInformation::new(name);
    info.locate_segments(maps)?;
    match fs::read(name) {
        Ok(bytes) => info.load_symbols(&bytes)?,
        Err(e) => warn!("cannot read {name} for symbols: {e}"),
    }
    Ok(info)
}

/// Libraries whose data never holds simulation state.
fn is_system_object(path: &str) -> bool {
    const PREFIXES: [&str; 4] = ["/lib/", "/lib64/", "/usr/lib/", "/usr/lib64/"];
    PREFIXES.iter().any(|p| path.starts_with(p))
        || path
            .rsplit('/')
            .next()
            .is_some_and(|file| file.starts_with("ld-linux") || file.starts_with("linux-vdso"))
}
