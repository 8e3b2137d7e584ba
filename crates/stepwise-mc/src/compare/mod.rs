//! Semantic equality of two snapshots.
//!
//! Two states are equal when their pointer graphs are isomorphic, not when
//! their bytes match: heap blocks are matched pairwise, and a pointer into
//! the heap is compared by recursing into what it points to.  Matched pairs
//! are memoized per top-level comparison so cyclic structures terminate.
//!
//! Results are ternary.  [`Comparison::Unknown`] (sizes that cannot be
//! reconciled with the declared type) never counts as equal.

mod heap;

use std::collections::{HashMap, HashSet};

use log::debug;
use stepwise_protocol::layout::HeapDescriptor;

use crate::heap::HeapLayout;
use crate::object_info::{ObjectInformation, Type, TypeId, TypeKind};
use crate::remote::ProcessIndex;
use crate::snapshot::{RegionStorage, RegionType, Snapshot, StackSnapshot};

pub use heap::HeapLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    Different,
    /// Cannot be decided; treated as different.
    Unknown,
}

impl Comparison {
    pub fn is_equal(self) -> bool {
        self == Self::Equal
    }

    fn differs_if(different: bool) -> Self {
        if different {
            Self::Different
        } else {
            Self::Equal
        }
    }
}

/// A type together with the object that declares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub object: usize,
    pub id: TypeId,
}

/// Pairs of heap locations assumed equal while one comparison is running.
pub type HeapLocationPairs = HashSet<(HeapLocation, HeapLocation)>;

/// Comparison state for one pair of snapshots.
///
/// Create one per top-level comparison; the match tables it accumulates are
/// only valid for that pair.
pub struct HeapComparator<'a> {
    objects: &'a [ObjectInformation],
    s1: &'a Snapshot,
    s2: &'a Snapshot,
    heap1: &'a HeapLayout,
    heap2: &'a HeapLayout,
    equals_to1: HashMap<(usize, usize), HeapLocation>,
    equals_to2: HashMap<(usize, usize), HeapLocation>,
    types1: HashMap<(usize, usize), TypeRef>,
    types2: HashMap<(usize, usize), TypeRef>,
    compared_pointers: HashSet<(u64, u64)>,
}

static EMPTY_HEAP: HeapLayout = HeapLayout {
    descriptor: HeapDescriptor {
        heapbase: 0,
        heaplimit: 0,
        breakval: 0,
        heapinfo: 0,
        bytes_used: 0,
    },
    infos: Vec::new(),
};

impl<'a> HeapComparator<'a> {
    pub fn new(objects: &'a [ObjectInformation], s1: &'a Snapshot, s2: &'a Snapshot) -> Self {
        Self {
            objects,
            s1,
            s2,
            heap1: s1.heap.as_ref().unwrap_or(&EMPTY_HEAP),
            heap2: s2.heap.as_ref().unwrap_or(&EMPTY_HEAP),
            equals_to1: HashMap::new(),
            equals_to2: HashMap::new(),
            types1: HashMap::new(),
            types2: HashMap::new(),
            compared_pointers: HashSet::new(),
        }
    }

    fn ty(&self, r: TypeRef) -> Option<&'a Type> {
        self.objects.get(r.object)?.get_type(r.id)
    }

    fn sub(&self, r: TypeRef) -> Option<TypeRef> {
        self.ty(r)?.subtype.map(|id| TypeRef { object: r.object, id })
    }

    /// Follow forward declarations to the complete type.
    fn full(&self, r: TypeRef) -> TypeRef {
        match self.ty(r).and_then(|t| t.full_type) {
            Some(id) => TypeRef { object: r.object, id },
            None => r,
        }
    }

    /// Byte-compare `size` bytes at the same kind of location in both snapshots.
    fn memcmp(&self, index: ProcessIndex, a1: u64, a2: u64, size: u64) -> Comparison {
        let mut b1 = vec![0u8; size as usize];
        let mut b2 = vec![0u8; size as usize];
        if self.s1.read_bytes(a1, &mut b1, index).is_err()
            || self.s2.read_bytes(a2, &mut b2, index).is_err()
        {
            return Comparison::Different;
        }
        Comparison::differs_if(b1 != b2)
    }

    fn read_pointers(&self, index: ProcessIndex, a1: u64, a2: u64) -> Option<(u64, u64)> {
        Some((
            self.s1.read_u64(a1, index).ok()?,
            self.s2.read_u64(a2, index).ok()?,
        ))
    }

    fn both_in_heap(&self, p1: u64, p2: u64) -> bool {
        self.heap1.contains(p1) && self.heap2.contains(p2)
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Globals and locals
    // ═══════════════════════════════════════════════════════════════════

    /// Typed comparison of a global or local area (outside the heap).
    pub fn compare_areas_with_type(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        ty: TypeRef,
        pointer_level: u32,
    ) -> Comparison {
        let mut ty = ty;
        loop {
            let Some(t) = self.ty(ty) else {
                return Comparison::Unknown;
            };
            match t.kind {
                TypeKind::Unspecified => return Comparison::Different,
                TypeKind::Base | TypeKind::Enumeration | TypeKind::Union => {
                    return self.memcmp(index, area1, area2, t.byte_size);
                }
                TypeKind::Typedef | TypeKind::Const | TypeKind::Volatile => match self.sub(ty) {
                    Some(sub) => ty = sub,
                    None => return Comparison::Unknown,
                },
                TypeKind::Array => {
                    let Some(element) = self.sub(ty) else {
                        return Comparison::Unknown;
                    };
                    let Some(elm_size) = self.element_size(element) else {
                        return Comparison::Different;
                    };
                    for i in 0..t.element_count {
                        let off = i * elm_size;
                        let r = self.compare_areas_with_type(
                            index,
                            area1 + off,
                            area2 + off,
                            element,
                            pointer_level,
                        );
                        if r != Comparison::Equal {
                            return r;
                        }
                    }
                    return Comparison::Equal;
                }
                TypeKind::Pointer | TypeKind::Reference | TypeKind::RvalueReference => {
                    return self.compare_pointer_areas(index, area1, area2, ty, pointer_level);
                }
                TypeKind::Structure | TypeKind::Class => {
                    let full = self.full(ty);
                    let Some(t) = self.ty(full) else {
                        return Comparison::Unknown;
                    };
                    for member in &t.members {
                        let member_type = TypeRef {
                            object: full.object,
                            id: member.type_id,
                        };
                        let r = self.compare_areas_with_type(
                            index,
                            area1 + member.offset,
                            area2 + member.offset,
                            member_type,
                            pointer_level,
                        );
                        if r != Comparison::Equal {
                            return r;
                        }
                    }
                    return Comparison::Equal;
                }
                TypeKind::Subroutine => return Comparison::Equal,
            }
        }
    }

    fn compare_pointer_areas(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        ty: TypeRef,
        pointer_level: u32,
    ) -> Comparison {
        let Some((p1, p2)) = self.read_pointers(index, area1, area2) else {
            return Comparison::Different;
        };
        let pointee = self.sub(ty);
        if pointee.and_then(|p| self.ty(p)).is_some_and(|t| t.kind == TypeKind::Subroutine) {
            return Comparison::differs_if(p1 != p2);
        }
        if p1 == 0 && p2 == 0 {
            return Comparison::Equal;
        }
        if p1 == 0 || p2 == 0 {
            return Comparison::Different;
        }
        if !self.compared_pointers.insert((p1, p2)) {
            return Comparison::Equal;
        }

        if self.heap1.contains(p1) {
            if !self.heap2.contains(p2) {
                return Comparison::Different;
            }
            return self.compare_heap_area(index, p1, p2, None, pointee, pointer_level + 1);
        }
        let same_data_region = match (self.s1.region_for(p1), self.s2.region_for(p2)) {
            (Some(r1), Some(r2)) => {
                r1.region_type == RegionType::Data && r1.start_address == r2.start_address
            }
            _ => false,
        };
        match (same_data_region, pointee) {
            (true, Some(pointee)) => {
                self.compare_areas_with_type(index, p1, p2, pointee, pointer_level + 1)
            }
            _ => Comparison::differs_if(p1 != p2),
        }
    }

    /// Size of one array element, looking through qualifiers.
    fn element_size(&self, element: TypeRef) -> Option<u64> {
        let mut r = element;
        loop {
            let t = self.ty(self.full(r))?;
            if t.kind.is_qualifier() {
                r = self.sub(r)?;
                continue;
            }
            return Some(t.byte_size);
        }
    }

    /// Pointer-aware bytewise comparison of a whole data region.
    fn compare_region_bytes(
        &mut self,
        index: ProcessIndex,
        start: u64,
        size: usize,
    ) -> Comparison {
        let mut b1 = vec![0u8; size];
        let mut b2 = vec![0u8; size];
        if self.s1.read_bytes(start, &mut b1, index).is_err()
            || self.s2.read_bytes(start, &mut b2, index).is_err()
        {
            return Comparison::Different;
        }
        let mut i = 0;
        while i < size {
            if b1[i] == b2[i] {
                i += 1;
                continue;
            }
            let align = i / 8 * 8;
            if align + 8 > size {
                return Comparison::Different;
            }
            let p1 = word(&b1, align);
            let p2 = word(&b2, align);
            if self.s1.in_stack(p1) && self.s2.in_stack(p2) {
                i = align + 8;
                continue;
            }
            if self.both_in_heap(p1, p2) {
                let r = self.compare_heap_area(index, p1, p2, None, None, 0);
                if r != Comparison::Equal {
                    return r;
                }
                i = align + 8;
                continue;
            }
            return Comparison::Different;
        }
        Comparison::Equal
    }

    fn compare_global_variables(&mut self, region_index: usize) -> Comparison {
        let r1 = &self.s1.regions[region_index];
        let Some(object_index) = r1.object_index else {
            return Comparison::Equal;
        };
        let Some(info) = self.objects.get(object_index) else {
            return Comparison::Different;
        };
        let indices: Vec<ProcessIndex> = match &r1.storage {
            RegionStorage::Privatized(replicas) => {
                (0..replicas.len()).map(ProcessIndex::Index).collect()
            }
            _ => vec![ProcessIndex::Disabled],
        };

        for index in indices {
            let r = if info.has_typed_globals() {
                let mut result = Comparison::Equal;
                for variable in info.global_variables() {
                    let (Some(id), Some(address)) = (variable.type_id, variable.address()) else {
                        continue;
                    };
                    if !info.contains_rw(address) {
                        continue;
                    }
                    let ty = TypeRef {
                        object: object_index,
                        id,
                    };
                    result = self.compare_areas_with_type(index, address, address, ty, 0);
                    if result != Comparison::Equal {
                        debug!("global variable {} differs", variable.name);
                        break;
                    }
                }
                result
            } else {
                self.compare_region_bytes(index, r1.start_address, r1.size)
            };
            if r != Comparison::Equal {
                return r;
            }
        }
        Comparison::Equal
    }

    fn compare_local_variables(
        &mut self,
        stack1: &StackSnapshot,
        stack2: &StackSnapshot,
    ) -> Comparison {
        if stack1.frames.len() != stack2.frames.len()
            || stack1
                .frames
                .iter()
                .zip(&stack2.frames)
                .any(|(f1, f2)| f1.frame_name != f2.frame_name)
        {
            debug!("different call stacks");
            return Comparison::Different;
        }
        if stack1.local_variables.len() != stack2.local_variables.len() {
            debug!("different number of local variables");
            return Comparison::Different;
        }
        for (v1, v2) in stack1.local_variables.iter().zip(&stack2.local_variables) {
            if v1.name != v2.name || v1.subprogram != v2.subprogram || v1.ip != v2.ip {
                debug!(
                    "different name of variable ({} - {}) or frame or ip ({:#x} - {:#x})",
                    v1.name, v2.name, v1.ip, v2.ip
                );
                return Comparison::Different;
            }
            let r = match (v1.type_id, v1.object_index) {
                (Some(id), Some(object)) => self.compare_areas_with_type(
                    stack1.process_index,
                    v1.address,
                    v2.address,
                    TypeRef { object, id },
                    0,
                ),
                _ if v1.size == 0 => Comparison::Equal,
                _ => self.memcmp(stack1.process_index, v1.address, v2.address, v1.size),
            };
            if r != Comparison::Equal {
                debug!("local variable {} differs", v1.name);
                return r;
            }
        }
        Comparison::Equal
    }
}

fn word(bytes: &[u8], at: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(w)
}

/// Full state equality, stopping at the first difference.
pub fn snapshot_equal(
    objects: &[ObjectInformation],
    s1: &Snapshot,
    s2: &Snapshot,
    use_hash: bool,
) -> bool {
    if use_hash && s1.hash != s2.hash {
        debug!("different hashes: {:#x} vs {:#x}", s1.hash, s2.hash);
        return false;
    }
    if s1.enabled_processes != s2.enabled_processes {
        debug!("different actors");
        return false;
    }
    if s1.heap_bytes_used != s2.heap_bytes_used {
        debug!("different heap usage");
        return false;
    }
    if s1.stack_sizes != s2.stack_sizes || s1.stacks.len() != s2.stacks.len() {
        debug!("different stack sizes");
        return false;
    }
    match (&s1.heap, &s2.heap) {
        (None, None) => {}
        (Some(h1), Some(h2))
            if h1.base() == h2.base() && h1.heaplimit() == h2.heaplimit() => {}
        _ => {
            debug!("different heap layouts");
            return false;
        }
    }
    if s1.regions.len() != s2.regions.len() {
        return false;
    }

    let mut comparator = HeapComparator::new(objects, s1, s2);

    for (stack1, stack2) in s1.stacks.iter().zip(&s2.stacks) {
        if !comparator.compare_local_variables(stack1, stack2).is_equal() {
            return false;
        }
    }

    for (i, (r1, r2)) in s1.regions.iter().zip(&s2.regions).enumerate() {
        if r1.region_type != RegionType::Data {
            continue;
        }
        if r1.start_address != r2.start_address || r1.size != r2.size {
            return false;
        }
        if !comparator.compare_global_variables(i).is_equal() {
            debug!("global variables differ in region {i}");
            return false;
        }
    }

    let heap = comparator.compare_heap();
    if !heap.is_equal() {
        debug!("heaps differ");
    }
    heap.is_equal()
}

#[cfg(test)]
mod tests;
