//! Heap side of the comparison: block matching and pointer-chasing.

use log::{debug, trace};
use stepwise_protocol::layout::MALLOC_BLOCK;
use stepwise_protocol::IgnoredHeapRegion;

use super::{word, Comparison, HeapComparator, HeapLocationPairs, TypeRef};
use crate::heap::HeapLayout;
use crate::object_info::TypeKind;
use crate::remote::ProcessIndex;

/// A whole block, or one fragment of a fragmented block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapLocation {
    pub block: usize,
    pub fragment: Option<usize>,
}

impl HeapLocation {
    pub const fn block(block: usize) -> Self {
        Self {
            block,
            fragment: None,
        }
    }

    pub const fn fragment(block: usize, fragment: usize) -> Self {
        Self {
            block,
            fragment: Some(fragment),
        }
    }

    fn key(self) -> (usize, usize) {
        (self.block, self.fragment.unwrap_or(0))
    }
}

/// Size of the ignored region starting exactly at `address`.
fn ignore_size(regions: &[IgnoredHeapRegion], address: u64) -> Option<u64> {
    regions
        .binary_search_by_key(&address, |r| r.address)
        .ok()
        .map(|i| regions[i].size)
}

/// First block of the allocation covering `block`.
fn allocation_start(heap: &HeapLayout, mut block: usize) -> usize {
    while block > 1 {
        match heap.info(block) {
            Some(info) if info.kind == MALLOC_BLOCK && info.size == 0 => block -= 1,
            _ => break,
        }
    }
    block
}

impl HeapComparator<'_> {
    fn is_stack_block(&self, block: usize) -> bool {
        block != 0 && self.s1.stack_areas.iter().any(|s| s.block as usize == block)
    }

    fn blocks_equal(&self, b1: usize, b2: usize) -> bool {
        self.equals_to1.get(&(b1, 0)) == Some(&HeapLocation::block(b2))
            && self.equals_to2.get(&(b2, 0)) == Some(&HeapLocation::block(b1))
    }

    fn fragments_equal(&self, b1: usize, f1: usize, b2: usize, f2: usize) -> bool {
        self.equals_to1.get(&(b1, f1)) == Some(&HeapLocation::fragment(b2, f2))
            && self.equals_to2.get(&(b2, f2)) == Some(&HeapLocation::fragment(b1, f1))
    }

    /// Commit the pairs found by a successful top-level comparison.
    fn match_equals(&mut self, pairs: &HeapLocationPairs) {
        for &(l1, l2) in pairs {
            self.equals_to1.insert(l1.key(), l2);
            self.equals_to2.insert(l2.key(), l1);
        }
    }

    /// Skip zero-sized wrappers around the real type.
    fn strip_sizeless(&self, mut ty: TypeRef) -> TypeRef {
        while let Some(t) = self.ty(ty) {
            match (t.byte_size, self.sub(ty)) {
                (0, Some(sub)) => ty = sub,
                _ => break,
            }
        }
        ty
    }

    /// Compare the heap objects at `area1` and `area2`.
    ///
    /// With `previous` absent this is a top-level call: pairs are collected
    /// locally and committed to the match tables only if the areas are equal.
    pub fn compare_heap_area(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        previous: Option<&mut HeapLocationPairs>,
        ty: Option<TypeRef>,
        pointer_level: u32,
    ) -> Comparison {
        let mut local = HeapLocationPairs::new();
        let top_level = previous.is_none();
        let previous = match previous {
            Some(p) => p,
            None => &mut local,
        };
        let result = self.heap_area(index, area1, area2, previous, ty, pointer_level);
        if top_level && result == Comparison::Equal {
            self.match_equals(previous);
        }
        result
    }

    fn heap_area(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        previous: &mut HeapLocationPairs,
        ty: Option<TypeRef>,
        pointer_level: u32,
    ) -> Comparison {
        let (heap1, heap2) = (self.heap1, self.heap2);
        let (Some(block1), Some(block2)) = (heap1.block_of(area1), heap2.block_of(area2)) else {
            return Comparison::Different;
        };

        if self.is_stack_block(block1) && self.is_stack_block(block2) {
            previous.insert((HeapLocation::block(block1), HeapLocation::block(block2)));
            return Comparison::Equal;
        }

        let (Some(info1), Some(info2)) = (heap1.info(block1), heap2.info(block2)) else {
            return Comparison::Different;
        };
        if info1.is_free() && info2.is_free() {
            return Comparison::Equal;
        }
        if info1.is_free() || info2.is_free() {
            return Comparison::Different;
        }

        let ty = ty.map(|t| self.strip_sizeless(t));
        let declared = ty.and_then(|t| self.ty(t));
        let type_size = declared.and_then(|t| {
            let untracked = t.kind.is_pointer() || (t.kind == TypeKind::Base && t.name == "char");
            (!untracked).then_some(t.byte_size)
        });

        if info1.kind == MALLOC_BLOCK && info2.kind == MALLOC_BLOCK {
            let start1 = allocation_start(heap1, block1);
            let start2 = allocation_start(heap2, block2);
            let (Some(info1), Some(info2)) = (heap1.info(start1), heap2.info(start2)) else {
                return Comparison::Different;
            };
            let base1 = heap1.block_address(start1);
            let base2 = heap2.block_address(start2);
            let (offset1, offset2) = (area1 - base1, area2 - base2);

            if offset1 == offset2 && self.blocks_equal(start1, start2) {
                return Comparison::Equal;
            }
            if let Some(size) = type_size {
                let unnamed = declared.is_some_and(|t| t.name.is_empty());
                if size != info1.busy_size && size != info2.busy_size && unnamed {
                    return Comparison::Unknown;
                }
            }
            if info1.size != info2.size || info1.busy_size != info2.busy_size {
                return Comparison::Different;
            }
            if offset1 != offset2 && ty.is_none() {
                return Comparison::Different;
            }
            let whole = offset1 == 0 && offset2 == 0;
            if (whole || ty.is_none())
                && !previous.insert((HeapLocation::block(start1), HeapLocation::block(start2)))
            {
                return Comparison::Equal;
            }
            if let Some(t) = ty {
                if offset1 == 0 {
                    self.types1.insert((start1, 0), t);
                }
                if offset2 == 0 {
                    self.types2.insert((start2, 0), t);
                }
            }
            if info1.busy_size == 0 {
                return Comparison::Equal;
            }
            let check_ignore = if info1.ignore > 0 && info1.ignore == info2.ignore {
                info1.ignore as u32
            } else {
                0
            };
            let ty = ty.or_else(|| {
                whole
                    .then(|| self.types1.get(&(start1, 0)).or(self.types2.get(&(start2, 0))))
                    .flatten()
                    .copied()
            });
            return match ty {
                Some(t) => self.heap_area_with_type(
                    index,
                    area1,
                    area2,
                    previous,
                    t,
                    Some(info1.busy_size.saturating_sub(offset1)),
                    check_ignore,
                    pointer_level,
                ),
                None => self.heap_area_without_type(
                    index,
                    base1,
                    base2,
                    previous,
                    info1.busy_size,
                    check_ignore,
                ),
            };
        }

        if info1.is_fragmented() && info2.is_fragmented() {
            let (Some(frag1), Some(frag2)) = (
                heap1.fragment_of(block1, area1),
                heap2.fragment_of(block2, area2),
            ) else {
                return Comparison::Different;
            };
            let (Some(addr1), Some(addr2)) = (
                heap1.fragment_address(block1, frag1),
                heap2.fragment_address(block2, frag2),
            ) else {
                return Comparison::Different;
            };
            let size1 = info1.frag_size[frag1];
            let size2 = info2.frag_size[frag2];
            if size1 < 0 && size2 < 0 {
                return Comparison::Equal;
            }
            if size1 < 0 || size2 < 0 {
                return Comparison::Different;
            }
            if let Some(size) = type_size {
                if size != size1 as u64 || size != size2 as u64 {
                    return Comparison::Unknown;
                }
            }
            let (offset1, offset2) = (area1 - addr1, area2 - addr2);
            if offset1 == offset2 && self.fragments_equal(block1, frag1, block2, frag2) {
                return Comparison::Equal;
            }
            if size1 != size2 {
                return if type_size.is_none() {
                    Comparison::Unknown
                } else {
                    Comparison::Different
                };
            }
            if offset1 != offset2 && ty.is_none() {
                return Comparison::Different;
            }
            let whole = offset1 == 0 && offset2 == 0;
            let pair = (
                HeapLocation::fragment(block1, frag1),
                HeapLocation::fragment(block2, frag2),
            );
            if (whole || ty.is_none()) && !previous.insert(pair) {
                return Comparison::Equal;
            }
            if let Some(t) = ty {
                if offset1 == 0 {
                    self.types1.insert((block1, frag1), t);
                }
                if offset2 == 0 {
                    self.types2.insert((block2, frag2), t);
                }
            }
            let size = size1 as u64;
            if size == 0 {
                return Comparison::Equal;
            }
            let ignore1 = info1.frag_ignore[frag1];
            let check_ignore = if ignore1 > 0 && ignore1 == info2.frag_ignore[frag2] {
                u32::from(ignore1)
            } else {
                0
            };
            let ty = ty.or_else(|| {
                whole
                    .then(|| {
                        self.types1
                            .get(&(block1, frag1))
                            .or(self.types2.get(&(block2, frag2)))
                    })
                    .flatten()
                    .copied()
            });
            return match ty {
                Some(t) => self.heap_area_with_type(
                    index,
                    area1,
                    area2,
                    previous,
                    t,
                    Some(size.saturating_sub(offset1)),
                    check_ignore,
                    pointer_level,
                ),
                None => {
                    self.heap_area_without_type(index, addr1, addr2, previous, size, check_ignore)
                }
            };
        }

        trace!("blocks {block1} and {block2} have different kinds");
        Comparison::Different
    }

    /// Bytewise comparison that follows words which look like heap pointers.
    fn heap_area_without_type(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        previous: &mut HeapLocationPairs,
        size: u64,
        mut check_ignore: u32,
    ) -> Comparison {
        let size = size as usize;
        let mut b1 = vec![0u8; size];
        let mut b2 = vec![0u8; size];
        if self.s1.read_bytes(area1, &mut b1, index).is_err()
            || self.s2.read_bytes(area2, &mut b2, index).is_err()
        {
            return Comparison::Different;
        }

        let mut i = 0;
        while i < size {
            if check_ignore > 0 {
                let at1 = area1 + i as u64;
                let at2 = area2 + i as u64;
                if let Some(ignored) = ignore_size(&self.s1.to_ignore, at1) {
                    if ignore_size(&self.s2.to_ignore, at2) == Some(ignored) {
                        i += (ignored as usize).max(1);
                        check_ignore -= 1;
                        continue;
                    }
                }
            }

            if b1[i] != b2[i] {
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
                    let r = self.compare_heap_area(index, p1, p2, Some(previous), None, 0);
                    if r != Comparison::Equal {
                        return r;
                    }
                    i = align + 8;
                    continue;
                }
                return Comparison::Different;
            }
            i += 1;
        }
        Comparison::Equal
    }

    #[allow(clippy::too_many_arguments)]
    fn heap_area_with_type(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        previous: &mut HeapLocationPairs,
        ty: TypeRef,
        area_size: Option<u64>,
        check_ignore: u32,
        pointer_level: u32,
    ) -> Comparison {
        let mut ty = ty;
        loop {
            if self.s1.in_stack(area1) && self.s2.in_stack(area2) {
                return Comparison::Equal;
            }
            if check_ignore > 0 {
                if let Some(ignored) = ignore_size(&self.s1.to_ignore, area1) {
                    if ignore_size(&self.s2.to_ignore, area2) == Some(ignored) {
                        return Comparison::Equal;
                    }
                }
            }

            let Some(t) = self.ty(ty) else {
                return Comparison::Unknown;
            };
            match t.kind {
                TypeKind::Unspecified => return Comparison::Different,
                TypeKind::Base if t.name == "char" => {
                    if area1 == area2 {
                        return Comparison::Unknown;
                    }
                    let size = area_size.unwrap_or(t.byte_size);
                    return self.memcmp(index, area1, area2, size);
                }
                TypeKind::Base | TypeKind::Enumeration => {
                    if area_size.is_some_and(|s| s != t.byte_size) {
                        return Comparison::Unknown;
                    }
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
                        return Comparison::Unknown;
                    };
                    for i in 0..t.element_count {
                        let off = i * elm_size;
                        let r = self.heap_area_with_type(
                            index,
                            area1 + off,
                            area2 + off,
                            previous,
                            element,
                            Some(elm_size),
                            check_ignore,
                            pointer_level,
                        );
                        if r != Comparison::Equal {
                            return r;
                        }
                    }
                    return Comparison::Equal;
                }
                TypeKind::Pointer | TypeKind::Reference | TypeKind::RvalueReference => {
                    return self.heap_pointers(
                        index,
                        area1,
                        area2,
                        previous,
                        ty,
                        area_size,
                        pointer_level,
                    );
                }
                TypeKind::Structure | TypeKind::Class => {
                    let full = self.full(ty);
                    let Some(t) = self.ty(full) else {
                        return Comparison::Unknown;
                    };
                    if let Some(size) = area_size.filter(|&s| s != t.byte_size) {
                        if t.byte_size == 0 || size < t.byte_size || size % t.byte_size != 0 {
                            return Comparison::Unknown;
                        }
                        for i in 0..size / t.byte_size {
                            let off = i * t.byte_size;
                            let r = self.heap_area_with_type(
                                index,
                                area1 + off,
                                area2 + off,
                                previous,
                                full,
                                None,
                                check_ignore,
                                pointer_level,
                            );
                            if r != Comparison::Equal {
                                return r;
                            }
                        }
                        return Comparison::Equal;
                    }
                    for member in &t.members {
                        let member_type = TypeRef {
                            object: full.object,
                            id: member.type_id,
                        };
                        let r = self.heap_area_with_type(
                            index,
                            area1 + member.offset,
                            area2 + member.offset,
                            previous,
                            member_type,
                            None,
                            check_ignore,
                            0,
                        );
                        if r != Comparison::Equal {
                            return r;
                        }
                    }
                    return Comparison::Equal;
                }
                TypeKind::Union => {
                    return self.heap_area_without_type(
                        index,
                        area1,
                        area2,
                        previous,
                        t.byte_size,
                        check_ignore,
                    );
                }
                TypeKind::Subroutine => return Comparison::Equal,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn heap_pointers(
        &mut self,
        index: ProcessIndex,
        area1: u64,
        area2: u64,
        previous: &mut HeapLocationPairs,
        ty: TypeRef,
        area_size: Option<u64>,
        pointer_level: u32,
    ) -> Comparison {
        let pointee = self.sub(ty);
        let to_code = pointee
            .and_then(|p| self.ty(p))
            .is_some_and(|t| t.kind == TypeKind::Subroutine);
        let level = pointer_level + 1;

        let slots = if to_code || level <= 1 {
            1
        } else {
            (area_size.unwrap_or(8) / 8).max(1)
        };
        for slot in 0..slots {
            let off = slot * 8;
            let Some((p1, p2)) = self.read_pointers(index, area1 + off, area2 + off) else {
                return Comparison::Different;
            };
            if !to_code && self.both_in_heap(p1, p2) {
                let r = self.compare_heap_area(index, p1, p2, Some(previous), pointee, level);
                if r != Comparison::Equal {
                    return r;
                }
            } else if p1 != p2 {
                return Comparison::Different;
            }
        }
        Comparison::Equal
    }

    // ═══════════════════════════════════════════════════════════════════
    //  Whole heap
    // ═══════════════════════════════════════════════════════════════════

    /// Match every busy block and fragment of one heap with one of the other.
    pub fn compare_heap(&mut self) -> Comparison {
        let (heap1, heap2) = (self.heap1, self.heap2);
        if heap1.base() != heap2.base() || heap1.heaplimit() != heap2.heaplimit() {
            return Comparison::Different;
        }
        let limit = heap1
            .heaplimit()
            .min(heap1.infos.len().saturating_sub(1))
            .min(heap2.infos.len().saturating_sub(1));
        let index = ProcessIndex::Missing;

        let mut i1 = 1;
        while i1 <= limit {
            let info1 = &heap1.infos[i1];
            if info1.is_free() {
                i1 += 1;
                continue;
            }

            if info1.kind == MALLOC_BLOCK {
                if info1.size == 0 {
                    i1 += 1;
                    continue;
                }
                let span = info1.size as usize;

                if self.is_stack_block(i1) {
                    for k in 0..span {
                        self.equals_to1.insert((i1 + k, 0), HeapLocation::block(i1));
                    }
                    let span2 = heap2.infos[i1].size as usize;
                    for k in 0..span2.max(1) {
                        self.equals_to2.insert((i1 + k, 0), HeapLocation::block(i1));
                    }
                    i1 += span;
                    continue;
                }
                if self.equals_to1.contains_key(&(i1, 0)) {
                    i1 += span;
                    continue;
                }

                let addr1 = heap1.block_address(i1);
                let is_candidate = |this: &Self, i2: usize| {
                    let info2 = &heap2.infos[i2];
                    info2.kind == MALLOC_BLOCK
                        && info2.size > 0
                        && !this.equals_to2.contains_key(&(i2, 0))
                };

                let mut found = is_candidate(self, i1)
                    && self
                        .compare_heap_area(index, addr1, heap2.block_address(i1), None, None, 0)
                        .is_equal();
                let mut i2 = 1;
                while !found && i2 <= limit {
                    if i2 != i1 && is_candidate(self, i2) {
                        found = self
                            .compare_heap_area(index, addr1, heap2.block_address(i2), None, None, 0)
                            .is_equal();
                    }
                    i2 += 1;
                }
                if !found {
                    debug!("block {i1} not found (size {})", info1.busy_size);
                    return Comparison::Different;
                }
                i1 += span;
                continue;
            }

            for j1 in 0..info1.fragment_count() {
                if info1.frag_size[j1] < 0 || self.equals_to1.contains_key(&(i1, j1)) {
                    continue;
                }
                let Some(addr1) = heap1.fragment_address(i1, j1) else {
                    continue;
                };

                let same = &heap2.infos[i1];
                let mut found = same.kind == info1.kind
                    && same.frag_size[j1] >= 0
                    && !self.equals_to2.contains_key(&(i1, j1))
                    && heap2.fragment_address(i1, j1).is_some_and(|addr2| {
                        self.compare_heap_area(index, addr1, addr2, None, None, 0)
                            .is_equal()
                    });

                let mut i2 = 1;
                'search: while !found && i2 <= limit {
                    let info2 = &heap2.infos[i2];
                    if info2.is_fragmented() {
                        for j2 in 0..info2.fragment_count() {
                            if (i2 == i1 && j2 == j1)
                                || info2.frag_size[j2] < 0
                                || self.equals_to2.contains_key(&(i2, j2))
                            {
                                continue;
                            }
                            let Some(addr2) = heap2.fragment_address(i2, j2) else {
                                continue;
                            };
                            if self
                                .compare_heap_area(index, addr1, addr2, None, None, 0)
                                .is_equal()
                            {
                                found = true;
                                break 'search;
                            }
                        }
                    }
                    i2 += 1;
                }
                if !found {
                    debug!("fragment {j1} of block {i1} not found");
                    return Comparison::Different;
                }
            }
            i1 += 1;
        }

        for (heap, equals_to) in [(heap1, &self.equals_to1), (heap2, &self.equals_to2)] {
            for i in 1..=limit {
                let info = &heap.infos[i];
                if info.kind == MALLOC_BLOCK
                    && info.size > 0
                    && info.busy_size > 0
                    && !equals_to.contains_key(&(i, 0))
                {
                    debug!("block {i} left unmatched");
                    return Comparison::Different;
                }
                if info.is_fragmented() {
                    for j in 0..info.fragment_count() {
                        if info.frag_size[j] > 0 && !equals_to.contains_key(&(i, j)) {
                            debug!("fragment {j} of block {i} left unmatched");
                            return Comparison::Different;
                        }
                    }
                }
            }
        }
        Comparison::Equal
    }
}
