//! Content-addressed store of memory pages shared by every snapshot.
//!
//! Identical pages are stored once and reference counted; a page slot is
//! recycled only when its count drops to zero.

use std::collections::HashMap;

pub const PAGE_SIZE: usize = 4096;

pub type PageIndex = usize;

#[derive(Debug, Default)]
pub struct PageStore {
    memory: Vec<u8>,
    page_counts: Vec<u64>,
    free_pages: Vec<PageIndex>,
    hash_index: HashMap<u64, Vec<PageIndex>>,
}

impl PageStore {
    pub fn new(capacity_hint: usize) -> Self {
        Self {
            memory: Vec::with_capacity(capacity_hint * PAGE_SIZE),
            page_counts: Vec::with_capacity(capacity_hint),
            free_pages: Vec::new(),
            hash_index: HashMap::new(),
        }
    }

    /// Store a page (or find an identical one) and take a reference to it.
    pub fn store_page(&mut self, page: &[u8]) -> PageIndex {
        debug_assert_eq!(page.len(), PAGE_SIZE);
        let hash = hash_page(page);
        if let Some(candidates) = self.hash_index.get(&hash) {
            for &index in candidates {
                if self.get_page(index) == page {
                    self.page_counts[index] += 1;
                    return index;
                }
            }
        }

        let index = self.alloc_page();
        let start = index * PAGE_SIZE;
        self.memory[start..start + PAGE_SIZE].copy_from_slice(page);
        self.page_counts[index] = 1;
        self.hash_index.entry(hash).or_default().push(index);
        index
    }

    pub fn ref_page(&mut self, index: PageIndex) {
        self.page_counts[index] += 1;
    }

    pub fn unref_page(&mut self, index: PageIndex) {
        let count = &mut self.page_counts[index];
        *count -= 1;
        if *count == 0 {
            self.remove_page(index);
        }
    }

    pub fn get_page(&self, index: PageIndex) -> &[u8] {
        &self.memory[index * PAGE_SIZE..(index + 1) * PAGE_SIZE]
    }

    pub fn get_ref(&self, index: PageIndex) -> u64 {
        self.page_counts[index]
    }

    /// Pages currently referenced.
    pub fn size(&self) -> usize {
        self.page_counts.len() - self.free_pages.len()
    }

    /// Page slots ever allocated.
    pub fn capacity(&self) -> usize {
        self.page_counts.len()
    }

    fn alloc_page(&mut self) -> PageIndex {
        if let Some(index) = self.free_pages.pop() {
            return index;
        }
        let index = self.page_counts.len();
        self.page_counts.push(0);
        self.memory.resize((index + 1) * PAGE_SIZE, 0);
        index
    }

    fn remove_page(&mut self, index: PageIndex) {
        let hash = hash_page(self.get_page(index));
        if let Some(candidates) = self.hash_index.get_mut(&hash) {
            candidates.retain(|&i| i != index);
            if candidates.is_empty() {
                self.hash_index.remove(&hash);
            }
        }
        self.free_pages.push(index);
    }
}

/// djb2 over 64-bit words.
fn hash_page(page: &[u8]) -> u64 {
    page.chunks_exact(8).fold(5381u64, |hash, word| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(word);
        (hash << 5).wrapping_add(hash).wrapping_add(u64::from_ne_bytes(bytes))
    })
}
