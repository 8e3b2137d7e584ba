use std::cell::RefCell;
use std::ptr;
use std::rc::Rc;

use nix::unistd::getpid;
use stepwise_sdk::heap::HeapArena;

use super::*;
use crate::address::remote;
use crate::channel::Channel;
use crate::object_info::Variable;
use crate::remote::RemoteSimulation;
use crate::snapshot::{PageStore, SnapshotConfig};

#[repr(C)]
struct Node {
    next: *mut Node,
    value: u64,
}

struct Fixture {
    process: RemoteSimulation,
    _peer: Channel,
    arena: HeapArena,
    store: Rc<RefCell<PageStore>>,
}

impl Fixture {
    fn new() -> Self {
        let (ours, peer) = Channel::pair().unwrap();
        let mut process = RemoteSimulation::new(getpid(), ours).unwrap();
        let arena = HeapArena::new(8).unwrap();
        process.set_heap_address(remote(arena.descriptor_address()));
        Self {
            process,
            _peer: peer,
            arena,
            store: Rc::new(RefCell::new(PageStore::new(16))),
        }
    }

    fn node(&mut self, value: u64) -> *mut Node {
        let node = self.arena.alloc(16).unwrap().as_ptr() as *mut Node;
        unsafe {
            node.write(Node {
                next: ptr::null_mut(),
                value,
            })
        };
        node
    }

    /// Two nodes pointing at each other.
    fn cycle(&mut self, v1: u64, v2: u64) -> (*mut Node, *mut Node) {
        let a = self.node(v1);
        let b = self.node(v2);
        unsafe {
            (*a).next = b;
            (*b).next = a;
        }
        (a, b)
    }

    fn free(&mut self, node: *mut Node) {
        self.arena.free(ptr::NonNull::new(node as *mut u8).unwrap());
    }

    /// The process "ran" since the last snapshot, so the mirrors are stale.
    fn snapshot(&mut self, num: u64) -> Snapshot {
        self.process.clear_cache();
        Snapshot::take(&mut self.process, &self.store, num, &SnapshotConfig::default()).unwrap()
    }

    fn equal(&self, s1: &Snapshot, s2: &Snapshot) -> bool {
        snapshot_equal(self.process.object_infos(), s1, s2, false)
    }

    /// `head` as a typed global pointing to a `struct node`.
    fn declare_head(&mut self, head: *mut u64) {
        let address = head as u64;
        let mut info = ObjectInformation::new("globals");
        info.start_rw = address;
        info.end_rw = address + 8;
        info.add_type(Type::new(1, TypeKind::Base, "unsigned long", 8));
        info.add_type(
            Type::new(2, TypeKind::Structure, "node", 16)
                .with_member("next", 0, 3)
                .with_member("value", 8, 1),
        );
        info.add_type(Type::new(3, TypeKind::Pointer, "", 8).with_subtype(2));
        info.add_global_variable(Variable::global("head", address, 8).with_type(3));
        self.process.add_object_info(info);
    }
}

#[test]
fn snapshot_equals_itself() {
    let mut fx = Fixture::new();
    fx.cycle(1, 2);
    let s = fx.snapshot(1);
    assert!(fx.equal(&s, &s));
}

#[test]
fn isomorphic_cycles_at_other_addresses_are_equal() {
    let mut fx = Fixture::new();
    let (a, b) = fx.cycle(1, 2);
    let s1 = fx.snapshot(1);

    fx.cycle(1, 2);
    fx.free(a);
    fx.free(b);
    let s2 = fx.snapshot(2);

    assert_eq!(s1.heap_bytes_used, s2.heap_bytes_used);
    assert!(fx.equal(&s1, &s2));
    assert!(fx.equal(&s2, &s1));
}

#[test]
fn changed_payload_is_different() {
    let mut fx = Fixture::new();
    let (a, b) = fx.cycle(1, 2);
    let s1 = fx.snapshot(1);

    fx.cycle(1, 3);
    fx.free(a);
    fx.free(b);
    let s2 = fx.snapshot(2);

    assert!(!fx.equal(&s1, &s2));
}

#[test]
fn ignored_heap_bytes_do_not_count() {
    let mut fx = Fixture::new();
    let a = fx.node(5);
    let value = unsafe { ptr::addr_of!((*a).value) } as u64;
    let region = fx.arena.ignore(value, 8).unwrap();
    fx.process.ignore_heap(region);
    let s1 = fx.snapshot(1);

    unsafe { (*a).value = 6 };
    let s2 = fx.snapshot(2);
    assert!(fx.equal(&s1, &s2));
}

#[test]
fn ignored_global_region_does_not_count() {
    let mut fx = Fixture::new();
    let counter = Box::into_raw(Box::new(1u64));
    let address = counter as u64;
    let mut info = ObjectInformation::new("globals");
    info.start_rw = address;
    info.end_rw = address + 8;
    info.add_type(Type::new(1, TypeKind::Base, "unsigned long", 8));
    info.add_global_variable(Variable::global("counter", address, 8).with_type(1));
    fx.process.add_object_info(info);

    let s1 = fx.snapshot(1);
    unsafe { ptr::write_volatile(counter, 2) };
    let s2 = fx.snapshot(2);
    assert!(!fx.equal(&s1, &s2));

    fx.process.ignore_region(address, 8);
    let s3 = fx.snapshot(3);
    unsafe { ptr::write_volatile(counter, 3) };
    let s4 = fx.snapshot(4);
    assert!(fx.equal(&s3, &s4));
    assert_eq!(unsafe { ptr::read_volatile(counter) }, 3);
    drop(unsafe { Box::from_raw(counter) });
}

#[test]
fn heap_usage_mismatch_is_different() {
    let mut fx = Fixture::new();
    fx.node(1);
    let s1 = fx.snapshot(1);
    fx.node(1);
    let s2 = fx.snapshot(2);
    assert!(!fx.equal(&s1, &s2));
}

#[test]
fn large_blocks_match_at_other_positions() {
    let mut fx = Fixture::new();
    let first = fx.arena.alloc(5000).unwrap();
    unsafe { first.as_ptr().write_bytes(0x5a, 5000) };
    let s1 = fx.snapshot(1);

    let second = fx.arena.alloc(5000).unwrap();
    unsafe { second.as_ptr().write_bytes(0x5a, 5000) };
    fx.arena.free(first);
    let s2 = fx.snapshot(2);
    assert_ne!(first, second);
    assert!(fx.equal(&s1, &s2));

    unsafe { second.as_ptr().add(4500).write(0) };
    let s3 = fx.snapshot(3);
    assert!(!fx.equal(&s1, &s3));
}

#[test]
fn typed_global_follows_pointers_into_heap() {
    let mut fx = Fixture::new();
    let head = Box::into_raw(Box::new(0u64));
    fx.declare_head(head);

    let (a, b) = fx.cycle(1, 2);
    unsafe { ptr::write_volatile(head, a as u64) };
    let s1 = fx.snapshot(1);

    let (c, _) = fx.cycle(1, 2);
    unsafe { ptr::write_volatile(head, c as u64) };
    fx.free(a);
    fx.free(b);
    let s2 = fx.snapshot(2);

    assert_eq!(s1.regions.len(), 2);
    assert!(fx.equal(&s1, &s2));
    drop(unsafe { Box::from_raw(head) });
}

#[test]
fn typed_global_sees_changes_behind_pointers() {
    let mut fx = Fixture::new();
    let head = Box::into_raw(Box::new(0u64));
    fx.declare_head(head);

    let (a, b) = fx.cycle(1, 2);
    unsafe { ptr::write_volatile(head, a as u64) };
    let s1 = fx.snapshot(1);

    let (c, _) = fx.cycle(1, 9);
    unsafe { ptr::write_volatile(head, c as u64) };
    fx.free(a);
    fx.free(b);
    let s2 = fx.snapshot(2);

    assert!(!fx.equal(&s1, &s2));
    drop(unsafe { Box::from_raw(head) });
}

#[test]
fn different_hashes_short_circuit() {
    let mut fx = Fixture::new();
    let s1 = fx.snapshot(1);
    let mut s2 = fx.snapshot(2);
    s2.hash = 1;
    assert!(fx.equal(&s1, &s2));
    assert!(!snapshot_equal(fx.process.object_infos(), &s1, &s2, true));
}

#[test]
fn unknown_is_not_equal() {
    assert!(!Comparison::Unknown.is_equal());
    assert!(!Comparison::Different.is_equal());
    assert!(Comparison::Equal.is_equal());
}
