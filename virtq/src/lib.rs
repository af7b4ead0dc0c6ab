//! Split virtqueue ring.
//!
//! The driver half of the virtio bulk-transport protocol: a lock-free,
//! shared-memory ring over which a guest driver exchanges scatter-gather
//! buffer chains with a virtual device backend. One [`SplitQueue`] is one
//! queue of one device; multi-queue devices hold several, fully
//! independent of each other.
//!
//! # Architecture
//!
//! - `layout`: bit-exact wire structures and ring geometry
//! - `queue`: descriptor allocator, enqueue/dequeue, shutdown, teardown
//! - `notify`: doorbell suppression protocols and interrupt control
//! - `sync`: optional `spin::Mutex` wrapper for the standard locking
//!   discipline
//! - `sim`: device-side model used by the tests
//!
//! The queue never allocates ring memory itself; the environment hands it
//! a zeroed, aligned block sized by [`ring_size`], plus a doorbell
//! callback and physical addresses for every buffer. Transport discovery,
//! interrupt wiring, and device-class command formats live with the
//! owning driver, not here.
//!
//! # References
//!
//! - VirtIO Specification 1.1+, 2.6 "Split Virtqueues"

#![no_std]

extern crate alloc;

pub mod layout;
pub mod notify;
pub mod queue;
pub mod sim;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

pub use layout::{ring_size, DescFlags, Descriptor, RingGeometry, RingMem, LEGACY_ALIGN, MODERN_ALIGN};
pub use notify::{need_event, Notify, NotifyMode};
pub use queue::{IndirectTable, SplitQueue};
pub use sync::SyncRing;

/// Ring error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtqError {
    /// Descriptor count or alignment unusable at creation. Fatal; the
    /// caller must not use the queue.
    Config,
    /// Not enough free descriptors for a direct chain. Recoverable:
    /// retry after a completion, or resubmit with an indirect table.
    CapacityExhausted,
    /// Null token, empty or inconsistent segment list, or an oversized
    /// indirect request. Nothing was mutated.
    InvalidArgument,
    /// The far side broke the ring protocol.
    ProtocolViolation,
}

/// One physically contiguous buffer segment.
///
/// The ring stores addresses exactly as given; resolving buffers to
/// physical addresses is the caller's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical address of the segment.
    pub addr: u64,
    /// Length in bytes.
    pub len: u32,
}
