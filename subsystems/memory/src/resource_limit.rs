//! # Resource Limits
//!
//! Quota accounting consumed by the page table, and a scoped reservation
//! that gives the quota back unless it is committed.

use core::sync::atomic::{AtomicU64, Ordering};

/// Kinds of quota a process is charged for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitableResource {
    /// Bytes of physical memory
    PhysicalMemory,
    /// Thread objects
    Threads,
    /// Event objects
    Events,
    /// Transfer memory objects
    TransferMemory,
    /// Session objects
    Sessions,
}

impl LimitableResource {
    /// Number of resource kinds
    pub const COUNT: usize = 5;

    /// Index of the kind
    pub const fn index(self) -> usize {
        match self {
            Self::PhysicalMemory => 0,
            Self::Threads => 1,
            Self::Events => 2,
            Self::TransferMemory => 3,
            Self::Sessions => 4,
        }
    }
}

/// Resource limit trait
pub trait ResourceLimit: Send + Sync {
    /// Try to charge `amount`; returns `false` if the limit would be exceeded
    fn reserve(&self, kind: LimitableResource, amount: u64) -> bool;

    /// Give back `amount` previously reserved
    fn release(&self, kind: LimitableResource, amount: u64);

    /// Amount currently charged
    fn current_value(&self, kind: LimitableResource) -> u64;

    /// Configured limit
    fn limit_value(&self, kind: LimitableResource) -> u64;
}

/// Atomic counter-based resource limit
#[derive(Debug, Default)]
pub struct CountingResourceLimit {
    limits: [AtomicU64; LimitableResource::COUNT],
    current: [AtomicU64; LimitableResource::COUNT],
    peak: [AtomicU64; LimitableResource::COUNT],
}

impl CountingResourceLimit {
    /// Create a limit object with every limit at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit for one kind
    pub fn with_limit(self, kind: LimitableResource, value: u64) -> Self {
        self.set_limit(kind, value);
        self
    }

    /// Set the limit for one kind
    pub fn set_limit(&self, kind: LimitableResource, value: u64) {
        self.limits[kind.index()].store(value, Ordering::SeqCst);
    }

    /// Highest amount ever charged
    pub fn peak_value(&self, kind: LimitableResource) -> u64 {
        self.peak[kind.index()].load(Ordering::Relaxed)
    }
}

impl ResourceLimit for CountingResourceLimit {
    fn reserve(&self, kind: LimitableResource, amount: u64) -> bool {
        let limit = self.limits[kind.index()].load(Ordering::SeqCst);
        let current = &self.current[kind.index()];

        let reserved = current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |value| {
                value.checked_add(amount).filter(|&next| next <= limit)
            });

        match reserved {
            Ok(previous) => {
                self.peak[kind.index()].fetch_max(previous + amount, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    fn release(&self, kind: LimitableResource, amount: u64) {
        let previous = self.current[kind.index()].fetch_sub(amount, Ordering::SeqCst);
        assert!(previous >= amount, "releasing more {:?} than reserved", kind);
    }

    fn current_value(&self, kind: LimitableResource) -> u64 {
        self.current[kind.index()].load(Ordering::SeqCst)
    }

    fn limit_value(&self, kind: LimitableResource) -> u64 {
        self.limits[kind.index()].load(Ordering::SeqCst)
    }
}

/// Quota reservation that is released on drop unless committed
#[must_use = "dropping a reservation releases it immediately"]
pub struct ScopedResourceReservation<'a> {
    limit: &'a dyn ResourceLimit,
    kind: LimitableResource,
    amount: u64,
    succeeded: bool,
    committed: bool,
}

impl<'a> ScopedResourceReservation<'a> {
    /// Try to reserve `amount` of `kind`
    pub fn new(limit: &'a dyn ResourceLimit, kind: LimitableResource, amount: u64) -> Self {
        let succeeded = limit.reserve(kind, amount);
        Self {
            limit,
            kind,
            amount,
            succeeded,
            committed: false,
        }
    }

    /// Whether the reservation was granted
    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Keep the reservation past this scope
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl core::fmt::Debug for ScopedResourceReservation<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScopedResourceReservation")
            .field("kind", &self.kind)
            .field("amount", &self.amount)
            .field("succeeded", &self.succeeded)
            .field("committed", &self.committed)
            .finish()
    }
}

impl Drop for ScopedResourceReservation<'_> {
    fn drop(&mut self) {
        if self.succeeded && !self.committed {
            self.limit.release(self.kind, self.amount);
        }
    }
}
