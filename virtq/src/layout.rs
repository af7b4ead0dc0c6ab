//! Split virtqueue wire layout.
//!
//! The split ring is three regions carved out of one contiguous,
//! caller-provided memory block:
//!
//! - Descriptor table: `n` fixed 16-byte descriptors
//! - Available ring: driver tells the device which chains are ready
//! - Used ring: device tells the driver which chains are finished
//!
//! The used ring must start on a transport-specific alignment boundary
//! (a full page for legacy transports, a cache line for modern ones), so
//! padding is inserted between the available and used rings. All layout
//! arithmetic lives in [`RingGeometry`] so the size calculation and the
//! accessors can never disagree.
//!
//! # References
//!
//! - VirtIO Specification 1.1+, 2.6 "Split Virtqueues"

use core::alloc::Layout;
use core::mem;
use core::ptr::NonNull;

use alloc::alloc::{alloc_zeroed, dealloc};
use bitflags::bitflags;

use crate::VirtqError;

/// Used-ring alignment required by legacy (pre-1.0) transports.
pub const LEGACY_ALIGN: usize = 4096;

/// Used-ring alignment sufficient for modern transports.
pub const MODERN_ALIGN: usize = 64;

/// Largest descriptor count any transport allows.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Most descriptors one indirect table may hold (one page's worth).
pub const INDIRECT_MAX: usize = 4096 / mem::size_of::<Descriptor>();

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Chain continues via the `next` field.
        const NEXT = 1;
        /// Buffer is device-writable (driver-readable otherwise).
        const WRITE = 2;
        /// Buffer holds a table of indirect descriptors.
        const INDIRECT = 4;
    }
}

bitflags! {
    /// Available-ring flags, written by the driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvailFlags: u16 {
        /// Driver does not want completion interrupts (legacy suppression).
        const NO_INTERRUPT = 1;
    }
}

bitflags! {
    /// Used-ring flags, written by the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsedFlags: u16 {
        /// Device does not want availability notifications (legacy suppression).
        const NO_NOTIFY = 1;
    }
}

/// One descriptor table entry.
///
/// Lives in memory shared with the device; 16 bytes, native byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    /// Physical address of the buffer segment.
    pub addr: u64,
    /// Length of the segment in bytes.
    pub len: u32,
    /// Descriptor flags.
    pub flags: DescFlags,
    /// Next descriptor index when NEXT is set; free-list link otherwise.
    pub next: u16,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor {
            addr: 0,
            len: 0,
            flags: DescFlags::empty(),
            next: 0,
        }
    }
}

/// One used-ring element, written by the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct UsedElem {
    /// Head index of the completed descriptor chain.
    pub id: u32,
    /// Total bytes the device wrote into the chain.
    pub len: u32,
}

/// Byte layout of one split ring: region offsets plus total size.
///
/// Shared by the queue (driver side) and the simulator (device side) so
/// both ends address the exact same fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    size: u16,
    align: usize,
    avail_offset: usize,
    used_offset: usize,
    total_size: usize,
}

impl RingGeometry {
    /// Compute the layout for `size` descriptors with the used ring
    /// starting `align`-aligned.
    pub fn new(size: u16, align: usize) -> Result<Self, VirtqError> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(VirtqError::Config);
        }
        // u32 fields in the used ring need at least 4-byte alignment.
        if align < 4 || !align.is_power_of_two() {
            return Err(VirtqError::Config);
        }

        let n = size as usize;
        let desc_size = n * mem::size_of::<Descriptor>();
        // flags + idx + ring[n] + trailing used-event slot
        let avail_size = 2 + 2 + n * 2 + 2;
        // flags + idx + ring[n] + trailing avail-event slot
        let used_size = 2 + 2 + n * mem::size_of::<UsedElem>() + 2;

        let used_offset = (desc_size + avail_size + align - 1) & !(align - 1);

        Ok(RingGeometry {
            size,
            align,
            avail_offset: desc_size,
            used_offset,
            total_size: used_offset + used_size,
        })
    }

    /// Descriptor count.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Used-ring alignment this layout was computed for.
    pub fn align(&self) -> usize {
        self.align
    }

    /// Byte offset of the available ring.
    pub fn avail_offset(&self) -> usize {
        self.avail_offset
    }

    /// Byte offset of the used ring.
    pub fn used_offset(&self) -> usize {
        self.used_offset
    }

    /// Total bytes covered by all three regions.
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Index mask; valid because the size is a power of two.
    pub fn wrap(&self, idx: u16) -> usize {
        (idx & (self.size - 1)) as usize
    }

    // Field accessors. All take the ring base pointer the layout was
    // computed for; callers go through read_volatile/write_volatile since
    // the far side accesses the same memory.

    /// Pointer to descriptor `i`.
    ///
    /// # Safety
    ///
    /// `base` must point to a ring block of at least `total_size()` bytes
    /// laid out by this geometry, and `i` must be below `size()`.
    pub unsafe fn desc(&self, base: *mut u8, i: u16) -> *mut Descriptor {
        (base as *mut Descriptor).add(i as usize)
    }

    /// Pointer to the available-ring flags word.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn avail_flags(&self, base: *mut u8) -> *mut u16 {
        base.add(self.avail_offset) as *mut u16
    }

    /// Pointer to the available-ring producer index.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn avail_idx(&self, base: *mut u8) -> *mut u16 {
        base.add(self.avail_offset + 2) as *mut u16
    }

    /// Pointer to available-ring slot `i`.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn avail_ring(&self, base: *mut u8, i: usize) -> *mut u16 {
        base.add(self.avail_offset + 4 + i * 2) as *mut u16
    }

    /// Pointer to the used-event slot (trailing the available ring).
    ///
    /// The driver publishes here the used index at which it wants the
    /// next interrupt.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn used_event(&self, base: *mut u8) -> *mut u16 {
        base.add(self.avail_offset + 4 + self.size as usize * 2) as *mut u16
    }

    /// Pointer to the used-ring flags word.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn used_flags(&self, base: *mut u8) -> *mut u16 {
        base.add(self.used_offset) as *mut u16
    }

    /// Pointer to the used-ring consumer index.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn used_idx(&self, base: *mut u8) -> *mut u16 {
        base.add(self.used_offset + 2) as *mut u16
    }

    /// Pointer to used-ring element `i`.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn used_ring(&self, base: *mut u8, i: usize) -> *mut UsedElem {
        base.add(self.used_offset + 4 + i * mem::size_of::<UsedElem>()) as *mut UsedElem
    }

    /// Pointer to the avail-event slot (trailing the used ring).
    ///
    /// The device publishes here the avail index at which it wants the
    /// next doorbell.
    ///
    /// # Safety
    ///
    /// Same contract as [`RingGeometry::desc`].
    pub unsafe fn avail_event(&self, base: *mut u8) -> *mut u16 {
        base.add(self.used_offset + 4 + self.size as usize * mem::size_of::<UsedElem>())
            as *mut u16
    }
}

/// Byte size of a ring with `size` descriptors and an `align`-aligned
/// used ring. Pure; rejects zero, non-power-of-two, and oversized counts.
pub fn ring_size(size: u16, align: usize) -> Result<usize, VirtqError> {
    RingGeometry::new(size, align).map(|g| g.total_size())
}

/// Owned, zeroed, alignment-honoring backing memory for one ring.
///
/// Convenience for hosted callers and tests; drivers with their own DMA
/// allocator hand the queue raw memory instead.
pub struct RingMem {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RingMem {
    /// Allocate zeroed backing memory for `geometry`.
    pub fn new(geometry: &RingGeometry) -> Result<Self, VirtqError> {
        let layout = Layout::from_size_align(geometry.total_size(), geometry.align())
            .map_err(|_| VirtqError::Config)?;
        // Zeroed allocation is part of the ring contract: the queue
        // initializer expects pristine memory.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(VirtqError::Config)?;
        Ok(RingMem { ptr, layout })
    }

    /// Base pointer of the block.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for RingMem {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_struct_sizes() {
        assert_eq!(mem::size_of::<Descriptor>(), 16);
        assert_eq!(mem::size_of::<UsedElem>(), 8);
    }

    #[test]
    fn test_geometry_covers_all_regions() {
        for shift in 1..=10 {
            let n: u16 = 1 << shift;
            let geo = RingGeometry::new(n, MODERN_ALIGN).unwrap();
            let n = n as usize;

            assert_eq!(geo.avail_offset(), n * 16);
            // Available ring (with event slot) fits before the used ring.
            assert!(geo.used_offset() >= geo.avail_offset() + 6 + n * 2);
            assert_eq!(geo.used_offset() % MODERN_ALIGN, 0);
            assert_eq!(geo.total_size(), geo.used_offset() + 6 + n * 8);
            assert_eq!(ring_size(geo.size(), MODERN_ALIGN).unwrap(), geo.total_size());
        }
    }

    #[test]
    fn test_legacy_alignment() {
        let geo = RingGeometry::new(256, LEGACY_ALIGN).unwrap();
        assert_eq!(geo.used_offset() % LEGACY_ALIGN, 0);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert_eq!(ring_size(0, MODERN_ALIGN), Err(VirtqError::Config));
        assert_eq!(ring_size(3, MODERN_ALIGN), Err(VirtqError::Config));
        assert_eq!(ring_size(6, MODERN_ALIGN), Err(VirtqError::Config));
        // One past the transport maximum (32768 itself is fine).
        assert!(ring_size(32768, MODERN_ALIGN).is_ok());
        assert_eq!(ring_size(33000, MODERN_ALIGN), Err(VirtqError::Config));
    }

    #[test]
    fn test_rejects_bad_alignment() {
        assert_eq!(ring_size(8, 0), Err(VirtqError::Config));
        assert_eq!(ring_size(8, 2), Err(VirtqError::Config));
        assert_eq!(ring_size(8, 48), Err(VirtqError::Config));
    }

    #[test]
    fn test_ring_mem_is_aligned() {
        let geo = RingGeometry::new(16, LEGACY_ALIGN).unwrap();
        let mem = RingMem::new(&geo).unwrap();
        assert_eq!(mem.as_mut_ptr() as usize % LEGACY_ALIGN, 0);
    }
}
