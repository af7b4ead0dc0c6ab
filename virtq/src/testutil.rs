//! Shared test fixtures: one ring with a simulated device attached.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::layout::{RingGeometry, RingMem, MODERN_ALIGN};
use crate::notify::NotifyMode;
use crate::queue::SplitQueue;
use crate::sim::SimDevice;
use crate::Segment;

pub(crate) struct TestRing {
    pub queue: SplitQueue,
    pub device: SimDevice,
    /// Times the queue rang the doorbell.
    pub doorbells: Arc<AtomicU32>,
    pub _mem: RingMem,
}

/// A queue and its far side over one freshly allocated ring block.
pub(crate) fn test_ring(size: u16, mode: NotifyMode) -> TestRing {
    let geo = RingGeometry::new(size, MODERN_ALIGN).unwrap();
    let mem = RingMem::new(&geo).unwrap();
    let doorbells = Arc::new(AtomicU32::new(0));
    let counter = doorbells.clone();
    let queue = unsafe {
        SplitQueue::new(mem.as_mut_ptr(), size, MODERN_ALIGN, mode, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap()
    };
    let device = unsafe { SimDevice::attach(mem.as_mut_ptr(), size, MODERN_ALIGN, mode).unwrap() };
    TestRing {
        queue,
        device,
        doorbells,
        _mem: mem,
    }
}

pub(crate) fn seg(addr: u64, len: u32) -> Segment {
    Segment { addr, len }
}
