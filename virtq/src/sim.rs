//! Device-side ring model.
//!
//! [`SimDevice`] plays the hypervisor's half of the protocol against the
//! same shared memory a [`crate::SplitQueue`] drives: it consumes the
//! avail ring, walks descriptor chains (direct and indirect), completes
//! them through the used ring in any order, and exercises both
//! notification-suppression protocols. The crate's own tests run against
//! it; it also serves as an executable description of what the far side
//! is expected to do.
//!
//! Addresses in descriptors are interpreted identity-mapped, as raw
//! host pointers. That is the simulation's contract, not the ring's; a
//! real device backend resolves guest physical addresses instead.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use alloc::collections::VecDeque;

use crate::layout::{AvailFlags, DescFlags, Descriptor, RingGeometry, UsedElem, UsedFlags};
use crate::notify::{need_event, NotifyMode};
use crate::VirtqError;

/// One avail-ring entry as the device saw it.
#[derive(Debug, Clone, Copy)]
pub struct SimChain {
    /// Main-table head index (what completion must echo back).
    pub head: u16,
    /// Segments in the chain, following indirection.
    pub descs: usize,
    /// Total device-readable bytes.
    pub readable: u32,
    /// Total device-writable bytes.
    pub writable: u32,
}

/// The far side of one split ring.
pub struct SimDevice {
    mem: *mut u8,
    geo: RingGeometry,
    mode: NotifyMode,
    /// Device's read cursor into the avail ring.
    last_avail: u16,
    pending: VecDeque<SimChain>,
    irq_pending: bool,
}

impl SimDevice {
    /// Attach to ring memory already initialized by the driver side.
    ///
    /// # Safety
    ///
    /// `mem` must be the same block, size, and alignment the paired
    /// `SplitQueue` was built over, valid for the simulator's lifetime.
    pub unsafe fn attach(
        mem: *mut u8,
        size: u16,
        align: usize,
        mode: NotifyMode,
    ) -> Result<Self, VirtqError> {
        Ok(SimDevice {
            mem,
            geo: RingGeometry::new(size, align)?,
            mode,
            last_avail: 0,
            pending: VecDeque::new(),
            irq_pending: false,
        })
    }

    /// Consume newly published avail entries. Returns how many arrived.
    pub fn poll(&mut self) -> usize {
        fence(Ordering::SeqCst);
        let avail_idx = unsafe { ptr::read_volatile(self.geo.avail_idx(self.mem)) };
        // Index read gates the slot reads.
        fence(Ordering::SeqCst);

        let mut picked = 0;
        while self.last_avail != avail_idx {
            let slot = self.geo.wrap(self.last_avail);
            let head = unsafe { ptr::read_volatile(self.geo.avail_ring(self.mem, slot)) };
            self.pending.push_back(self.walk_chain(head));
            self.last_avail = self.last_avail.wrapping_add(1);
            picked += 1;
        }

        if self.mode == NotifyMode::EventIndex {
            // Ask to be kicked at the next publish.
            self.set_avail_event(self.last_avail);
        }
        picked
    }

    /// Chains consumed but not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Inspect a pending chain without completing it.
    pub fn pending_chain(&self, index: usize) -> Option<&SimChain> {
        self.pending.get(index)
    }

    /// Complete the oldest pending chain, reporting `len` bytes written.
    pub fn complete_next(&mut self, len: u32) -> Option<u16> {
        let chain = self.pending.pop_front()?;
        self.write_used(u32::from(chain.head), len);
        Some(chain.head)
    }

    /// Complete an arbitrary pending chain; devices are not obliged to
    /// finish in submission order.
    pub fn complete_at(&mut self, index: usize, len: u32) -> Option<u16> {
        let chain = self.pending.remove(index)?;
        self.write_used(u32::from(chain.head), len);
        Some(chain.head)
    }

    /// Publish a used entry for a chain that was never submitted. Only a
    /// broken device does this; tests use it to probe the driver's
    /// defenses.
    pub fn complete_bogus(&mut self, id: u32, len: u32) {
        self.write_used(id, len);
    }

    /// Set or clear the legacy NO_NOTIFY doorbell-suppression flag.
    pub fn suppress_notify(&mut self, on: bool) {
        let raw = unsafe { ptr::read_volatile(self.geo.used_flags(self.mem)) };
        let mut flags = UsedFlags::from_bits_retain(raw);
        flags.set(UsedFlags::NO_NOTIFY, on);
        unsafe { ptr::write_volatile(self.geo.used_flags(self.mem), flags.bits()) };
        fence(Ordering::SeqCst);
    }

    /// Publish the avail position at which the device wants its next
    /// doorbell (event-index mode).
    pub fn set_avail_event(&mut self, at: u16) {
        unsafe { ptr::write_volatile(self.geo.avail_event(self.mem), at) };
        fence(Ordering::SeqCst);
    }

    /// Driver-published interrupt threshold (event-index mode).
    pub fn read_used_event(&self) -> u16 {
        fence(Ordering::SeqCst);
        unsafe { ptr::read_volatile(self.geo.used_event(self.mem)) }
    }

    /// Whether the driver currently wants completion interrupts at all
    /// (legacy flag check).
    pub fn interrupt_wanted(&self) -> bool {
        fence(Ordering::SeqCst);
        let raw = unsafe { ptr::read_volatile(self.geo.avail_flags(self.mem)) };
        !AvailFlags::from_bits_retain(raw).contains(AvailFlags::NO_INTERRUPT)
    }

    /// Whether any completion since the last call crossed the driver's
    /// interrupt threshold.
    pub fn take_interrupt(&mut self) -> bool {
        core::mem::take(&mut self.irq_pending)
    }

    fn walk_chain(&self, head: u16) -> SimChain {
        let mut chain = SimChain {
            head,
            descs: 0,
            readable: 0,
            writable: 0,
        };
        let mut idx = head;
        loop {
            let d = unsafe { ptr::read_volatile(self.geo.desc(self.mem, idx)) };
            if d.flags.contains(DescFlags::INDIRECT) {
                let count = d.len as usize / core::mem::size_of::<Descriptor>();
                let table = d.addr as usize as *const Descriptor;
                for i in 0..count {
                    let ind = unsafe { ptr::read_volatile(table.add(i)) };
                    self.tally(&mut chain, &ind);
                }
                break;
            }
            self.tally(&mut chain, &d);
            if !d.flags.contains(DescFlags::NEXT) {
                break;
            }
            idx = d.next;
        }
        chain
    }

    fn tally(&self, chain: &mut SimChain, d: &Descriptor) {
        chain.descs += 1;
        if d.flags.contains(DescFlags::WRITE) {
            chain.writable += d.len;
        } else {
            chain.readable += d.len;
        }
    }

    fn write_used(&mut self, id: u32, len: u32) {
        let old_idx = unsafe { ptr::read_volatile(self.geo.used_idx(self.mem)) };
        let slot = self.geo.wrap(old_idx);
        unsafe { ptr::write_volatile(self.geo.used_ring(self.mem, slot), UsedElem { id, len }) };
        // Element before index, index before the interrupt decision.
        fence(Ordering::SeqCst);
        let new_idx = old_idx.wrapping_add(1);
        unsafe { ptr::write_volatile(self.geo.used_idx(self.mem), new_idx) };
        fence(Ordering::SeqCst);

        let wanted = match self.mode {
            NotifyMode::Legacy => self.interrupt_wanted(),
            NotifyMode::EventIndex => need_event(self.read_used_event(), new_idx, old_idx),
        };
        self.irq_pending |= wanted;
    }
}
