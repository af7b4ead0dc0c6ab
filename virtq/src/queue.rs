//! Driver-side split virtqueue.
//!
//! [`SplitQueue`] owns the guest half of one ring: the free-list
//! descriptor allocator, the token table mapping chain heads back to
//! caller context, and the avail/used cursors. The device half is
//! whoever sits on the other side of the shared memory (a hypervisor in
//! production, [`crate::sim::SimDevice`] in tests).
//!
//! Nothing here locks or blocks. The caller serializes access to one
//! queue instance; cross-party ordering against the device is handled
//! with memory fences at the documented publish points, never a lock.

use core::num::NonZeroUsize;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::layout::{DescFlags, Descriptor, RingGeometry, INDIRECT_MAX};
use crate::notify::{Notify, NotifyMode};
use crate::{Segment, VirtqError};

/// Caller-provided memory for an indirect descriptor table.
///
/// Supplying one to [`SplitQueue::add_buf`] packs the whole scatter-gather
/// list into this side table and consumes a single main-table slot.
pub struct IndirectTable {
    ptr: *mut Descriptor,
    capacity: usize,
    phys: u64,
}

impl IndirectTable {
    /// Wrap a caller-allocated descriptor array and its physical address.
    ///
    /// Capacity is capped at one page's worth of descriptors
    /// ([`INDIRECT_MAX`]).
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `capacity` descriptors, writable by
    /// the driver and readable by the device at physical address `phys`,
    /// and must stay valid until every chain submitted through this table
    /// has been completed or detached.
    pub unsafe fn new(
        ptr: *mut Descriptor,
        capacity: usize,
        phys: u64,
    ) -> Result<Self, VirtqError> {
        if capacity == 0 || capacity > INDIRECT_MAX {
            return Err(VirtqError::InvalidArgument);
        }
        Ok(IndirectTable {
            ptr,
            capacity,
            phys,
        })
    }

    /// Number of descriptors the table can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Guest side of one split virtqueue.
pub struct SplitQueue {
    pub(crate) mem: *mut u8,
    pub(crate) geo: RingGeometry,
    pub(crate) mode: NotifyMode,
    pub(crate) doorbell: Box<dyn Notify + Send>,

    /// Head of the free list threaded through descriptor `next` fields.
    free_head: u16,
    num_free: u16,
    /// Shadow of the published avail index.
    pub(crate) avail_idx: u16,
    /// Entries written to the avail ring but not yet index-committed.
    pub(crate) num_added: u16,
    pub(crate) last_used_idx: u16,
    pub(crate) intr_enabled: bool,
    protocol_errors: u64,

    /// Chain-head index -> caller token. Occupied exactly while the
    /// chain is in flight.
    data: Vec<Option<NonZeroUsize>>,
}

// The queue owns the guest side of its ring memory exclusively; the raw
// pointers alias nothing else in the guest. Drivers submit from one
// context and complete from another, so the handle must be movable; the
// caller still serializes all access per the concurrency contract.
unsafe impl Send for SplitQueue {}

impl SplitQueue {
    /// Build a queue over caller-provided backing memory.
    ///
    /// `notify` is the doorbell rung when [`SplitQueue::kick`] decides the
    /// device needs waking.
    ///
    /// # Safety
    ///
    /// `mem` must point to at least [`crate::ring_size`]`(size, align)`
    /// bytes, `align`-aligned, zeroed, not accessed by any other guest
    /// code, and valid for the queue's whole lifetime.
    pub unsafe fn new(
        mem: *mut u8,
        size: u16,
        align: usize,
        mode: NotifyMode,
        notify: impl Notify + Send + 'static,
    ) -> Result<Self, VirtqError> {
        let geo = RingGeometry::new(size, align)?;
        let mut queue = SplitQueue {
            mem,
            geo,
            mode,
            doorbell: Box::new(notify),
            free_head: 0,
            num_free: size,
            avail_idx: 0,
            num_added: 0,
            last_used_idx: 0,
            intr_enabled: true,
            protocol_errors: 0,
            data: vec![None; size as usize],
        };
        queue.init_free_list();
        log::debug!(
            "[VirtQ] ring up: {} descriptors, {:?} notification",
            size,
            mode
        );
        Ok(queue)
    }

    /// Thread descriptors 0..size-1 into the free list. The memory is
    /// otherwise pristine (zeroed), so only the links need writing.
    fn init_free_list(&mut self) {
        for i in 0..self.geo.size() - 1 {
            self.write_desc(
                i,
                Descriptor {
                    next: i + 1,
                    ..Descriptor::default()
                },
            );
        }
    }

    /// Descriptor count fixed at creation.
    pub fn capacity(&self) -> u16 {
        self.geo.size()
    }

    /// Descriptors currently on the free list.
    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Notification protocol fixed at creation.
    pub fn mode(&self) -> NotifyMode {
        self.mode
    }

    /// Used entries the far side published that broke the protocol and
    /// were dropped.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }

    /// Fresh check whether completions are waiting in the used ring.
    pub fn has_pending(&self) -> bool {
        fence(Ordering::SeqCst);
        unsafe { ptr::read_volatile(self.geo.used_idx(self.mem)) != self.last_used_idx }
    }

    pub(crate) fn read_desc(&self, i: u16) -> Descriptor {
        unsafe { ptr::read_volatile(self.geo.desc(self.mem, i)) }
    }

    fn write_desc(&mut self, i: u16, d: Descriptor) {
        unsafe { ptr::write_volatile(self.geo.desc(self.mem, i), d) };
    }

    /// Pop one slot off the free list. Caller has already checked
    /// `num_free`.
    fn alloc_slot(&mut self) -> u16 {
        let head = self.free_head;
        self.free_head = self.read_desc(head).next;
        self.num_free -= 1;
        head
    }

    /// Return the NEXT-linked chain at `head` to the free list, scrubbing
    /// payloads. Returns the chain length.
    fn free_chain(&mut self, head: u16) -> u16 {
        let mut count = 0u16;
        let mut idx = head;
        loop {
            count += 1;
            let d = self.read_desc(idx);
            let last = !d.flags.contains(DescFlags::NEXT);
            // Linkage is guest-written; a walk longer than the table or a
            // link past it means local state is corrupt. Stop rather than
            // loop forever.
            if !last && (d.next >= self.geo.size() || count >= self.geo.size()) {
                log::warn!("[VirtQ] corrupt chain at {}: next {}", idx, d.next);
                self.protocol_errors += 1;
                self.write_desc(
                    idx,
                    Descriptor {
                        next: self.free_head,
                        ..Descriptor::default()
                    },
                );
                break;
            }
            self.write_desc(
                idx,
                Descriptor {
                    next: if last { self.free_head } else { d.next },
                    ..Descriptor::default()
                },
            );
            if last {
                break;
            }
            idx = d.next;
        }
        self.free_head = head;
        self.num_free += count;
        count
    }

    /// Publish one scatter-gather request.
    ///
    /// The first `out` segments are device-readable, the rest
    /// device-writable; `token` is the caller's non-zero completion
    /// cookie, handed back by [`SplitQueue::get_buf`]. With `indirect`
    /// supplied the request occupies a single main-table slot regardless
    /// of segment count.
    ///
    /// Descriptors and the avail-ring slot are written immediately; the
    /// avail index itself is committed at the next kick, so the device
    /// never observes a half-published batch.
    ///
    /// Returns the remaining free-descriptor count.
    pub fn add_buf(
        &mut self,
        sg: &[Segment],
        out: usize,
        token: usize,
        indirect: Option<&IndirectTable>,
    ) -> Result<usize, VirtqError> {
        let token = NonZeroUsize::new(token).ok_or(VirtqError::InvalidArgument)?;
        if sg.is_empty() || out > sg.len() {
            return Err(VirtqError::InvalidArgument);
        }

        let head = match indirect {
            Some(table) => self.add_indirect(sg, out, table)?,
            None => self.add_direct(sg, out)?,
        };

        self.data[head as usize] = Some(token);
        let slot = self.geo.wrap(self.avail_idx.wrapping_add(self.num_added));
        unsafe { ptr::write_volatile(self.geo.avail_ring(self.mem, slot), head) };
        self.num_added += 1;

        Ok(self.num_free as usize)
    }

    fn add_direct(&mut self, sg: &[Segment], out: usize) -> Result<u16, VirtqError> {
        if sg.len() > self.num_free as usize {
            // Anti-stall nudge: flush whatever is already published so
            // the device can start draining, then report exhaustion.
            if out > 0 {
                self.kick();
            }
            return Err(VirtqError::CapacityExhausted);
        }

        let head = self.free_head;
        for (i, seg) in sg.iter().enumerate() {
            let idx = self.alloc_slot();
            let mut flags = if i < out {
                DescFlags::empty()
            } else {
                DescFlags::WRITE
            };
            if i + 1 < sg.len() {
                flags |= DescFlags::NEXT;
            }
            // The free-list successor doubles as the chain link; the
            // tail keeps its stale link with NEXT clear.
            self.write_desc(
                idx,
                Descriptor {
                    addr: seg.addr,
                    len: seg.len,
                    flags,
                    next: self.free_head,
                },
            );
        }
        Ok(head)
    }

    fn add_indirect(
        &mut self,
        sg: &[Segment],
        out: usize,
        table: &IndirectTable,
    ) -> Result<u16, VirtqError> {
        if sg.len() > table.capacity() {
            return Err(VirtqError::InvalidArgument);
        }
        if self.num_free == 0 {
            if out > 0 {
                self.kick();
            }
            return Err(VirtqError::CapacityExhausted);
        }

        for (i, seg) in sg.iter().enumerate() {
            let last = i + 1 == sg.len();
            let mut flags = if i < out {
                DescFlags::empty()
            } else {
                DescFlags::WRITE
            };
            if !last {
                flags |= DescFlags::NEXT;
            }
            let d = Descriptor {
                addr: seg.addr,
                len: seg.len,
                flags,
                next: if last { 0 } else { (i + 1) as u16 },
            };
            unsafe { ptr::write_volatile(table.ptr.add(i), d) };
        }

        let head = self.alloc_slot();
        self.write_desc(
            head,
            Descriptor {
                addr: table.phys,
                len: (sg.len() * core::mem::size_of::<Descriptor>()) as u32,
                flags: DescFlags::INDIRECT,
                next: self.free_head,
            },
        );
        Ok(head)
    }

    /// Pop one completed chain off the used ring.
    ///
    /// Returns the submitting caller's token and the byte count the
    /// device wrote, or `None` when no completion is waiting. Used
    /// entries that violate the protocol (id out of range, or naming a
    /// slot with no chain in flight) are logged, counted, and skipped;
    /// they never reach the free list.
    pub fn get_buf(&mut self) -> Option<(usize, u32)> {
        loop {
            let used_idx = unsafe { ptr::read_volatile(self.geo.used_idx(self.mem)) };
            if used_idx == self.last_used_idx {
                return None;
            }
            // The index read gates the payload read on the far side's
            // element store.
            fence(Ordering::SeqCst);

            let slot = self.geo.wrap(self.last_used_idx);
            let elem = unsafe { ptr::read_volatile(self.geo.used_ring(self.mem, slot)) };
            self.last_used_idx = self.last_used_idx.wrapping_add(1);
            if self.intr_enabled && self.mode == NotifyMode::EventIndex {
                self.publish_used_event(self.last_used_idx);
            }

            if elem.id >= u32::from(self.geo.size()) {
                log::warn!("[VirtQ] used id {} out of range, dropping", elem.id);
                self.protocol_errors += 1;
                continue;
            }
            let head = elem.id as u16;
            let token = match self.data[head as usize].take() {
                Some(token) => token,
                None => {
                    log::warn!("[VirtQ] used id {} names an idle slot, dropping", elem.id);
                    self.protocol_errors += 1;
                    continue;
                }
            };
            self.free_chain(head);
            return Some((token.get(), elem.len));
        }
    }

    pub(crate) fn publish_used_event(&mut self, at: u16) {
        unsafe { ptr::write_volatile(self.geo.used_event(self.mem), at) };
        // The far side must see the new threshold before it next checks
        // whether to interrupt.
        fence(Ordering::SeqCst);
    }

    /// Reclaim one chain that was submitted but never completed.
    ///
    /// For teardown, with the device known quiescent: returns each
    /// outstanding token exactly once, rolling back its published avail
    /// entry, then `None` when the queue is drained.
    pub fn detach_unused_buf(&mut self) -> Option<usize> {
        for head in 0..self.geo.size() {
            let token = match self.data[head as usize].take() {
                Some(token) => token,
                None => continue,
            };
            self.free_chain(head);
            // Compensate the published-but-uncompleted avail entry:
            // uncommitted entries live in num_added, committed ones in
            // the published index.
            if self.num_added > 0 {
                self.num_added -= 1;
            } else {
                self.avail_idx = self.avail_idx.wrapping_sub(1);
                unsafe { ptr::write_volatile(self.geo.avail_idx(self.mem), self.avail_idx) };
            }
            log::trace!("[VirtQ] detached unused chain at head {}", head);
            return Some(token.get());
        }
        None
    }

    /// Reset the ring to its post-creation state in place.
    ///
    /// Same memory, same size, same notification mode, same doorbell;
    /// used on power-down where the pages persist but logical state must
    /// return to pristine. Outstanding tokens are forgotten, so drain
    /// with [`SplitQueue::detach_unused_buf`] first if the caller still
    /// owns buffers.
    pub fn shutdown(&mut self) {
        unsafe { ptr::write_bytes(self.mem, 0, self.geo.total_size()) };
        self.init_free_list();
        self.free_head = 0;
        self.num_free = self.geo.size();
        self.avail_idx = 0;
        self.num_added = 0;
        self.last_used_idx = 0;
        self.intr_enabled = true;
        self.protocol_errors = 0;
        self.data.fill(None);
        log::debug!("[VirtQ] ring reset: {} descriptors", self.geo.size());
    }
}
