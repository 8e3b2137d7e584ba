//! Addresses in the checked process's address space.

use std::fmt;
use std::marker::PhantomData;

/// An address in the checked process, typed by what it points to.
///
/// Never convertible to a local pointer: every access goes through
/// [`RemoteSimulation`](crate::remote::RemoteSimulation) or a snapshot.
pub struct RemotePtr<T> {
    address: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemotePtr<T> {
    pub const fn new(address: u64) -> Self {
        Self {
            address,
            _marker: PhantomData,
        }
    }

    pub const fn null() -> Self {
        Self::new(0)
    }

    pub const fn address(self) -> u64 {
        self.address
    }

    pub const fn is_null(self) -> bool {
        self.address == 0
    }

    /// Same address, different pointee.
    pub const fn cast<U>(self) -> RemotePtr<U> {
        RemotePtr::new(self.address)
    }

    /// Byte offset; wraps like pointer arithmetic on the remote side.
    pub const fn byte_add(self, offset: u64) -> Self {
        Self::new(self.address.wrapping_add(offset))
    }

    /// The `index`-th element of an array starting here.
    pub const fn element(self, index: u64) -> Self {
        Self::new(
            self.address
                .wrapping_add(index.wrapping_mul(std::mem::size_of::<T>() as u64)),
        )
    }
}

impl<T> Clone for RemotePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RemotePtr<T> {}

impl<T> PartialEq for RemotePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for RemotePtr<T> {}

impl<T> PartialOrd for RemotePtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for RemotePtr<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl<T> std::hash::Hash for RemotePtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl<T> fmt::Debug for RemotePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "remote({:#x})", self.address)
    }
}

impl<T> fmt::Display for RemotePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

/// Shorthand constructor.
pub const fn remote<T>(address: u64) -> RemotePtr<T> {
    RemotePtr::new(address)
}
