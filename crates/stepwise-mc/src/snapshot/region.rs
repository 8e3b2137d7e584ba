//! One captured memory region.

use std::cell::RefCell;
use std::rc::Rc;

use crate::address::remote;
use crate::remote::{ProcessIndex, RemoteSimulation};

use super::page_store::{PageIndex, PageStore, PAGE_SIZE};
use super::SnapshotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Heap,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    NoData,
    Flat,
    Chunked,
    Privatized,
}

/// Page references into the shared [`PageStore`].
///
/// Cloning takes one more reference on every page, dropping releases them.
#[derive(Debug)]
pub struct ChunkedData {
    store: Rc<RefCell<PageStore>>,
    pagenos: Vec<PageIndex>,
}

impl ChunkedData {
    /// Capture `size` bytes starting at `address`, one page at a time.
    pub fn capture(
        store: &Rc<RefCell<PageStore>>,
        process: &RemoteSimulation,
        address: u64,
        size: usize,
    ) -> Result<Self, SnapshotError> {
        if address % PAGE_SIZE as u64 != 0 {
            return Err(SnapshotError::Unaligned(address));
        }
        let mut data = Self {
            store: Rc::clone(store),
            pagenos: Vec::with_capacity(size.div_ceil(PAGE_SIZE)),
        };
        let mut buffer = vec![0u8; PAGE_SIZE];
        let mut offset = 0;
        while offset < size {
            let len = PAGE_SIZE.min(size - offset);
            buffer.fill(0);
            process.read_bytes(
                &mut buffer[..len],
                remote::<u8>(address + offset as u64),
                ProcessIndex::Disabled,
            )?;
            let page = store.borrow_mut().store_page(&buffer);
            data.pagenos.push(page);
            offset += PAGE_SIZE;
        }
        Ok(data)
    }

    pub fn page_count(&self) -> usize {
        self.pagenos.len()
    }

    pub fn pagenos(&self) -> &[PageIndex] {
        &self.pagenos
    }

    fn read(&self, offset: usize, buf: &mut [u8]) {
        let store = self.store.borrow();
        let mut done = 0;
        while done < buf.len() {
            let at = offset + done;
            let page = store.get_page(self.pagenos[at / PAGE_SIZE]);
            let start = at % PAGE_SIZE;
            let len = (PAGE_SIZE - start).min(buf.len() - done);
            buf[done..done + len].copy_from_slice(&page[start..start + len]);
            done += len;
        }
    }
}

impl Clone for ChunkedData {
    fn clone(&self) -> Self {
        let mut store = self.store.borrow_mut();
        for &page in &self.pagenos {
            store.ref_page(page);
        }
        Self {
            store: Rc::clone(&self.store),
            pagenos: self.pagenos.clone(),
        }
    }
}

impl Drop for ChunkedData {
    fn drop(&mut self) {
        let mut store = self.store.borrow_mut();
        for &page in &self.pagenos {
            store.unref_page(page);
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegionStorage {
    NoData,
    Flat(Vec<u8>),
    Chunked(ChunkedData),
    /// One sub-region per replica.
    Privatized(Vec<RegionSnapshot>),
}

/// A region captured at `permanent_address` and addressed as `start_address`.
///
/// The two differ for privatized replicas, whose content lives elsewhere but
/// is read through the nominal data segment address.
#[derive(Debug, Clone)]
pub struct RegionSnapshot {
    pub region_type: RegionType,
    /// Index of the owning object in the process's object list.
    pub object_index: Option<usize>,
    pub start_address: u64,
    pub permanent_address: u64,
    pub size: usize,
    pub storage: RegionStorage,
}

impl RegionSnapshot {
    pub fn no_data(region_type: RegionType, start: u64, permanent: u64, size: usize) -> Self {
        Self {
            region_type,
            object_index: None,
            start_address: start,
            permanent_address: permanent,
            size,
            storage: RegionStorage::NoData,
        }
    }

    pub fn flat(
        process: &RemoteSimulation,
        region_type: RegionType,
        start: u64,
        permanent: u64,
        size: usize,
    ) -> Result<Self, SnapshotError> {
        let mut data = vec![0u8; size];
        process.read_bytes(&mut data, remote::<u8>(permanent), ProcessIndex::Disabled)?;
        Ok(Self {
            storage: RegionStorage::Flat(data),
            ..Self::no_data(region_type, start, permanent, size)
        })
    }

    pub fn chunked(
        store: &Rc<RefCell<PageStore>>,
        process: &RemoteSimulation,
        region_type: RegionType,
        start: u64,
        permanent: u64,
        size: usize,
    ) -> Result<Self, SnapshotError> {
        let data = ChunkedData::capture(store, process, permanent, size)?;
        Ok(Self {
            storage: RegionStorage::Chunked(data),
            ..Self::no_data(region_type, start, permanent, size)
        })
    }

    /// Chunked when sparse capture is wanted and the region is page-aligned,
    /// flat otherwise.
    pub fn capture(
        store: &Rc<RefCell<PageStore>>,
        process: &RemoteSimulation,
        region_type: RegionType,
        start: u64,
        permanent: u64,
        size: usize,
        sparse: bool,
    ) -> Result<Self, SnapshotError> {
        if sparse && permanent % PAGE_SIZE as u64 == 0 {
            Self::chunked(store, process, region_type, start, permanent, size)
        } else {
            Self::flat(process, region_type, start, permanent, size)
        }
    }

    pub fn privatized(
        region_type: RegionType,
        start: u64,
        permanent: u64,
        size: usize,
        replicas: Vec<RegionSnapshot>,
    ) -> Self {
        Self {
            storage: RegionStorage::Privatized(replicas),
            ..Self::no_data(region_type, start, permanent, size)
        }
    }

    pub fn with_object(mut self, index: usize) -> Self {
        self.object_index = Some(index);
        self
    }

    pub fn storage_type(&self) -> StorageType {
        match self.storage {
            RegionStorage::NoData => StorageType::NoData,
            RegionStorage::Flat(_) => StorageType::Flat,
            RegionStorage::Chunked(_) => StorageType::Chunked,
            RegionStorage::Privatized(_) => StorageType::Privatized,
        }
    }

    pub fn end_address(&self) -> u64 {
        self.start_address + self.size as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start_address && address < self.end_address()
    }

    /// Copy captured bytes at nominal `address` into `buf`.
    pub fn read(
        &self,
        address: u64,
        buf: &mut [u8],
        index: ProcessIndex,
    ) -> Result<(), SnapshotError> {
        if !self.contains(address) || address + buf.len() as u64 > self.end_address() {
            return Err(SnapshotError::OutOfRegion {
                address,
                size: buf.len(),
            });
        }
        let offset = (address - self.start_address) as usize;
        match &self.storage {
            RegionStorage::NoData => Err(SnapshotError::NoData(self.start_address)),
            RegionStorage::Flat(data) => {
                buf.copy_from_slice(&data[offset..offset + buf.len()]);
                Ok(())
            }
            RegionStorage::Chunked(data) => {
                data.read(offset, buf);
                Ok(())
            }
            RegionStorage::Privatized(replicas) => match index {
                ProcessIndex::Index(i) => replicas
                    .get(i)
                    .ok_or(SnapshotError::InvalidReplica(i))?
                    .read(address, buf, index),
                ProcessIndex::Missing | ProcessIndex::Disabled => {
                    Err(SnapshotError::MissingProcessIndex(address))
                }
            },
        }
    }

    /// Write the captured content back at its permanent address.
    pub fn restore(&self, process: &RemoteSimulation) -> Result<(), SnapshotError> {
        match &self.storage {
            RegionStorage::NoData => Err(SnapshotError::UnsupportedStorage(StorageType::NoData)),
            RegionStorage::Flat(data) => {
                process.write_bytes(data, remote::<u8>(self.permanent_address))?;
                Ok(())
            }
            RegionStorage::Chunked(data) => {
                let store = data.store.borrow();
                for (i, &page) in data.pagenos.iter().enumerate() {
                    let offset = i * PAGE_SIZE;
                    let len = PAGE_SIZE.min(self.size - offset);
                    process.write_bytes(
                        &store.get_page(page)[..len],
                        remote::<u8>(self.permanent_address + offset as u64),
                    )?;
                }
                Ok(())
            }
            RegionStorage::Privatized(replicas) => {
                for replica in replicas {
                    replica.restore(process)?;
                }
                Ok(())
            }
        }
    }
}
