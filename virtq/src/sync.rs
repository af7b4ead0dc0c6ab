//! Locked convenience wrapper.
//!
//! The core [`SplitQueue`] is deliberately unsynchronized; drivers
//! usually guard it with one lock on the submission path (`add_buf` +
//! `kick`) and one on the completion path (`get_buf`), which may be the
//! same lock. [`SyncRing`] packages the single-lock version of that
//! discipline for callers that want it ready-made. Independent rings
//! need no coordination between each other.

use spin::{Mutex, MutexGuard};

use crate::queue::{IndirectTable, SplitQueue};
use crate::{Segment, VirtqError};

/// A split queue behind a `spin::Mutex`.
pub struct SyncRing {
    queue: Mutex<SplitQueue>,
}

impl SyncRing {
    /// Take ownership of a queue.
    pub fn new(queue: SplitQueue) -> Self {
        SyncRing {
            queue: Mutex::new(queue),
        }
    }

    /// Publish one request and kick the device, under the lock.
    pub fn submit(
        &self,
        sg: &[Segment],
        out: usize,
        token: usize,
        indirect: Option<&IndirectTable>,
    ) -> Result<usize, VirtqError> {
        let mut queue = self.queue.lock();
        let free = queue.add_buf(sg, out, token, indirect)?;
        queue.kick();
        Ok(free)
    }

    /// Pop one completion, under the lock.
    pub fn complete(&self) -> Option<(usize, u32)> {
        self.queue.lock().get_buf()
    }

    /// Lock the queue for anything else (interrupt control, shutdown,
    /// teardown draining).
    pub fn lock(&self) -> MutexGuard<'_, SplitQueue> {
        self.queue.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{RingGeometry, RingMem, MODERN_ALIGN};
    use crate::notify::NotifyMode;
    use crate::sim::SimDevice;

    #[test]
    fn test_submit_complete_through_lock() {
        let geo = RingGeometry::new(8, MODERN_ALIGN).unwrap();
        let mem = RingMem::new(&geo).unwrap();
        let queue = unsafe {
            SplitQueue::new(mem.as_mut_ptr(), 8, MODERN_ALIGN, NotifyMode::Legacy, || {}).unwrap()
        };
        let mut device =
            unsafe { SimDevice::attach(mem.as_mut_ptr(), 8, MODERN_ALIGN, NotifyMode::Legacy).unwrap() };
        let ring = SyncRing::new(queue);

        let buf = [0u8; 32];
        ring.submit(&[Segment { addr: buf.as_ptr() as u64, len: 32 }], 1, 0x5, None)
            .unwrap();
        device.poll();
        device.complete_next(32);

        assert_eq!(ring.complete(), Some((0x5, 32)));
        assert_eq!(ring.lock().num_free(), 8);

        ring.lock().shutdown();
        assert_eq!(ring.complete(), None);
    }
}
