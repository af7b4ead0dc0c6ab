//! Doorbells and interrupt-wanted control.
//!
//! Both directions of notification can be suppressed. The device tells
//! the driver to skip doorbells either with the legacy NO_NOTIFY flag or,
//! under event index, by publishing the avail position it wants the next
//! kick at. The driver symmetrically suppresses completion interrupts
//! with NO_INTERRUPT or the used-event slot. Which protocol a queue
//! speaks is fixed at creation as a [`NotifyMode`]; everything
//! layout-visible about the difference is confined to here and the
//! initializer.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::layout::{AvailFlags, UsedFlags};
use crate::queue::SplitQueue;

/// The doorbell side effect, supplied by the transport: an MMIO write, a
/// port write, or a hypercall. No return value, no failure.
pub trait Notify {
    /// Wake the far side.
    fn notify(&mut self);
}

impl<F: FnMut()> Notify for F {
    fn notify(&mut self) {
        self()
    }
}

/// Notification-suppression protocol, fixed when the queue is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMode {
    /// Flag-based: each side sets a flag when it wants no notifications.
    Legacy,
    /// Event index: each side publishes the ring position at which it
    /// wants the next notification.
    EventIndex,
}

/// Wraparound-safe "does crossing `old_idx` -> `new_idx` pass
/// `event_idx`" test.
///
/// All three values are free-running 16-bit cursors. The far side asked
/// to be notified when the index moves past `event_idx`; this returns
/// whether the window (`old_idx`, `new_idx`] contains that position.
pub fn need_event(event_idx: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event_idx).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

impl SplitQueue {
    /// Commit pending avail entries and ring the doorbell if the device
    /// wants it.
    pub fn kick(&mut self) {
        let old_idx = self.avail_idx;
        self.flush_avail();

        let wanted = match self.mode {
            NotifyMode::Legacy => {
                let flags = unsafe { ptr::read_volatile(self.geo.used_flags(self.mem)) };
                !UsedFlags::from_bits_retain(flags).contains(UsedFlags::NO_NOTIFY)
            }
            NotifyMode::EventIndex => {
                let event = unsafe { ptr::read_volatile(self.geo.avail_event(self.mem)) };
                need_event(event, self.avail_idx, old_idx)
            }
        };
        if wanted {
            self.doorbell.notify();
        }
    }

    /// Commit pending avail entries and ring unconditionally.
    pub fn kick_always(&mut self) {
        self.flush_avail();
        self.doorbell.notify();
    }

    /// Advance the published avail index over everything added since the
    /// last flush.
    fn flush_avail(&mut self) {
        // Store-store: descriptor and ring-slot writes must be visible
        // before the index moves.
        fence(Ordering::SeqCst);
        self.avail_idx = self.avail_idx.wrapping_add(self.num_added);
        self.num_added = 0;
        unsafe { ptr::write_volatile(self.geo.avail_idx(self.mem), self.avail_idx) };
        // The new index must be visible before we read the far side's
        // suppression state.
        fence(Ordering::SeqCst);
    }

    /// Ask for completion interrupts again.
    pub fn enable_interrupts(&mut self) {
        match self.mode {
            NotifyMode::Legacy => self.set_no_interrupt(false),
            NotifyMode::EventIndex => {
                let at = self.last_used_idx;
                self.publish_used_event(at);
            }
        }
        self.intr_enabled = true;
    }

    /// Tell the device to stop interrupting.
    ///
    /// Under event index this only records the wish locally; the stale
    /// used-event threshold already stops mattering once the driver quits
    /// republishing it.
    pub fn disable_interrupts(&mut self) {
        if self.mode == NotifyMode::Legacy {
            self.set_no_interrupt(true);
        }
        self.intr_enabled = false;
    }

    /// Re-enable interrupts, then recheck for completions that raced in.
    ///
    /// Returns `false` (with interrupts disabled again) when new used
    /// entries arrived in the window; the caller must poll instead of
    /// blocking.
    pub fn restart(&mut self) -> bool {
        self.enable_interrupts();
        if self.has_pending() {
            self.disable_interrupts();
            return false;
        }
        true
    }

    /// Ask for one interrupt roughly 3/4 of the way through the current
    /// backlog instead of at the next completion. Coalescing heuristic
    /// under load; correctness does not depend on it.
    pub fn delay_interrupts(&mut self) {
        match self.mode {
            NotifyMode::Legacy => self.enable_interrupts(),
            NotifyMode::EventIndex => {
                let backlog = self
                    .avail_idx
                    .wrapping_add(self.num_added)
                    .wrapping_sub(self.last_used_idx);
                let skip = ((backlog as u32) * 3 / 4) as u16;
                let at = self.last_used_idx.wrapping_add(skip);
                self.publish_used_event(at);
                self.intr_enabled = true;
            }
        }
    }

    fn set_no_interrupt(&mut self, on: bool) {
        let raw = unsafe { ptr::read_volatile(self.geo.avail_flags(self.mem)) };
        let mut flags = AvailFlags::from_bits_retain(raw);
        flags.set(AvailFlags::NO_INTERRUPT, on);
        unsafe { ptr::write_volatile(self.geo.avail_flags(self.mem), flags.bits()) };
        fence(Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::Ordering;

    use super::*;
    use crate::testutil::{seg, test_ring};

    #[test]
    fn test_need_event_window() {
        // Just-published entry at the requested position: notify.
        assert!(need_event(0, 1, 0));
        // Far side asked for position 5; not there yet.
        assert!(!need_event(5, 1, 0));
        // Wraparound: crossing 65535 -> 1 passes a request at 65535.
        assert!(need_event(65535, 1, 65535));
        // Nothing new published: never notify.
        assert!(!need_event(3, 7, 7));
    }

    #[test]
    fn test_legacy_flag_suppression() {
        let mut t = test_ring(8, NotifyMode::Legacy);
        t.device.suppress_notify(true);

        t.queue.add_buf(&[seg(0x1000, 16)], 1, 0x1, None).unwrap();
        t.queue.kick();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), 0);

        // kick_always ignores the flag.
        t.queue.kick_always();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), 1);

        t.device.suppress_notify(false);
        t.queue.add_buf(&[seg(0x2000, 16)], 1, 0x2, None).unwrap();
        t.queue.kick();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_event_index_suppression() {
        let mut t = test_ring(8, NotifyMode::EventIndex);

        // Device wants a kick at position 0: publishing entry 1 crosses it.
        t.device.set_avail_event(0);
        t.queue.add_buf(&[seg(0x1000, 16)], 1, 0x1, None).unwrap();
        t.queue.kick();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), 1);

        // Device parked its event far ahead: no doorbell.
        t.device.set_avail_event(5);
        t.queue.add_buf(&[seg(0x2000, 16)], 1, 0x2, None).unwrap();
        t.queue.kick();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_event_index_wraparound_kick() {
        let mut t = test_ring(2, NotifyMode::EventIndex);

        // Drive the avail cursor all the way around to 65535.
        for round in 0..65535u32 {
            t.queue
                .add_buf(&[seg(0x3000, 8)], 1, 1 + round as usize, None)
                .unwrap();
            t.queue.kick();
            t.device.poll();
            t.device.complete_next(0);
            t.queue.get_buf().unwrap();
        }

        // old = 65535, new = 1, event = 65535: the window wraps and the
        // doorbell must still ring.
        t.device.set_avail_event(65535);
        let before = t.doorbells.load(Ordering::Relaxed);
        t.queue.add_buf(&[seg(0x3000, 8)], 1, 0x10000, None).unwrap();
        t.queue.add_buf(&[seg(0x3040, 8)], 1, 0x10001, None).unwrap();
        t.queue.kick();
        assert_eq!(t.doorbells.load(Ordering::Relaxed), before + 1);
    }

    #[test]
    fn test_restart_detects_raced_completion() {
        let mut t = test_ring(8, NotifyMode::EventIndex);
        t.queue.disable_interrupts();

        t.queue.add_buf(&[seg(0x4000, 16)], 1, 0x9, None).unwrap();
        t.queue.kick();
        t.device.poll();
        t.device.complete_next(16);

        // A completion landed while interrupts were off: restart loses
        // the race and reports it.
        assert!(!t.queue.restart());
        assert_eq!(t.queue.get_buf(), Some((0x9, 16)));

        // Queue drained: restart wins and interrupts stay enabled.
        assert!(t.queue.restart());
    }

    #[test]
    fn test_dequeue_republishes_used_event() {
        let mut t = test_ring(8, NotifyMode::EventIndex);
        for token in 1..=3usize {
            t.queue.add_buf(&[seg(0x5000, 16)], 1, token, None).unwrap();
        }
        t.queue.kick();
        t.device.poll();
        t.device.complete_next(1);
        t.device.complete_next(2);

        t.queue.get_buf().unwrap();
        assert_eq!(t.device.read_used_event(), 1);
        t.queue.get_buf().unwrap();
        assert_eq!(t.device.read_used_event(), 2);

        // With interrupts off the threshold stops moving.
        t.queue.disable_interrupts();
        t.device.complete_next(3);
        t.queue.get_buf().unwrap();
        assert_eq!(t.device.read_used_event(), 2);
    }

    #[test]
    fn test_delay_interrupts_parks_event_in_backlog() {
        let mut t = test_ring(16, NotifyMode::EventIndex);
        for token in 1..=8usize {
            t.queue.add_buf(&[seg(0x6000, 16)], 1, token, None).unwrap();
        }
        t.queue.kick();

        // Backlog of 8 outstanding: park the event 6 completions out.
        t.queue.delay_interrupts();
        assert_eq!(t.device.read_used_event(), 6);

        // The device-side check agrees: quiet until the used index
        // crosses the threshold, which happens on the 7th completion.
        t.device.poll();
        for _ in 0..6 {
            t.device.complete_next(4);
        }
        assert!(!t.device.take_interrupt());
        t.device.complete_next(4);
        assert!(t.device.take_interrupt());
    }

    #[test]
    fn test_legacy_interrupt_flag() {
        let mut t = test_ring(8, NotifyMode::Legacy);
        t.queue.disable_interrupts();
        assert!(!t.device.interrupt_wanted());
        t.queue.enable_interrupts();
        assert!(t.device.interrupt_wanted());
    }
}
