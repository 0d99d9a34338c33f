//! Coherent DMA memory.
//!
//! The engine only ever sees bus addresses; the CPU only ever sees virtual
//! pointers. A [`CoherentRegion`] pairs the two for one block of memory that
//! both sides observe identically, without cache maintenance.
//!
//! Where the memory comes from is up to the platform, through the
//! [`DmaAllocator`] trait. [`RegionAllocator`] is the common case: a reserved
//! carve-out split into fixed-size slots.
use alloc::sync::Arc;
use core::{
    fmt,
    ptr::{self, NonNull},
};

use portable_atomic::{AtomicU64, Ordering::*};

/// An address as seen by the DMA engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct BusAddr(u32);

/// A block of coherent memory handed out by a [`DmaAllocator`].
#[derive(Debug)]
pub struct CoherentRegion {
    bus: BusAddr,
    virt: NonNull<u8>,
    len: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocError {
    /// A zero-byte allocation was requested.
    ZeroSize,
    /// The request does not fit in a single allocation.
    TooLarge { requested: usize, max: usize },
    /// No coherent memory is left.
    OutOfMemory,
    /// The reserved region handed to the allocator is unusable.
    InvalidRegion,
}

/// Source of coherent DMA memory.
pub trait DmaAllocator: Send + Sync {
    /// Allocates a zeroed, physically contiguous region of at least `size`
    /// bytes.
    fn alloc_coherent(&self, size: usize) -> Result<CoherentRegion, AllocError>;

    /// Returns `region` to the allocator.
    ///
    /// # Safety
    ///
    /// `region` must have come from this allocator's
    /// [`alloc_coherent`](Self::alloc_coherent), and the engine must no
    /// longer be able to access it.
    unsafe fn free_coherent(&self, region: CoherentRegion);
}

/// Splits a reserved coherent carve-out into fixed-size slots.
///
/// Slot occupancy is a single atomic bitmap, so there are at most 64 slots.
pub struct RegionAllocator {
    virt: NonNull<u8>,
    bus: BusAddr,
    slot_size: usize,
    slots: u8,
    used: AtomicU64,
}

/// A coherent buffer owned by a session.
///
/// Shared by the session and the transfer in flight (if any). The region goes
/// back to its allocator once the last reference is dropped, so the engine
/// never writes into memory that has been handed out again.
pub struct CoherentBuffer {
    region: CoherentRegion,
    len: usize,
    alloc: Arc<dyn DmaAllocator>,
}

/// An uncached view of a [`CoherentBuffer`].
///
/// Every access is a volatile byte access, since the engine may write the
/// buffer at any time.
#[derive(Debug)]
pub struct Mapping<'buf> {
    buf: &'buf CoherentBuffer,
    len: usize,
}

// === impl BusAddr ===

impl BusAddr {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address `offset` bytes past `self`, or `None` if that does
    /// not fit in the 32-bit bus address space.
    #[must_use]
    pub fn checked_add(self, offset: usize) -> Option<Self> {
        let offset = u32::try_from(offset).ok()?;
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

// === impl CoherentRegion ===

// Safety: a region is a plain description of memory; access to the memory
// itself is synchronized by its owner.
unsafe impl Send for CoherentRegion {}
unsafe impl Sync for CoherentRegion {}

impl CoherentRegion {
    /// # Safety
    ///
    /// `virt` must point to `len` bytes of coherent memory that the engine
    /// reaches at `bus`, and that stay valid until the region is freed.
    #[must_use]
    pub unsafe fn new(bus: BusAddr, virt: NonNull<u8>, len: usize) -> Self {
        Self { bus, virt, len }
    }

    #[must_use]
    pub fn bus_addr(&self) -> BusAddr {
        self.bus
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// === impl AllocError ===

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::ZeroSize => f.write_str("zero-sized allocation"),
            AllocError::TooLarge { requested, max } => {
                write!(f, "{requested} bytes requested, at most {max} available")
            }
            AllocError::OutOfMemory => f.write_str("out of coherent memory"),
            AllocError::InvalidRegion => f.write_str("invalid coherent region"),
        }
    }
}

// === impl RegionAllocator ===

// Safety: the carve-out is only touched through slots claimed in the atomic
// bitmap.
unsafe impl Send for RegionAllocator {}
unsafe impl Sync for RegionAllocator {}

impl RegionAllocator {
    const PAGE_SIZE: usize = 4096;
    const MAX_SLOTS: usize = u64::BITS as usize;

    /// Carves the `len` bytes at `virt` (bus address `bus`) into slots of
    /// `slot_size` bytes, rounded up to a whole page.
    ///
    /// # Safety
    ///
    /// `virt` must point to `len` bytes of coherent memory, reachable by the
    /// engine at `bus`, that nothing else uses for as long as the allocator
    /// lives.
    pub unsafe fn new(
        virt: *mut u8,
        bus: BusAddr,
        len: usize,
        slot_size: usize,
    ) -> Result<Self, AllocError> {
        let virt = NonNull::new(virt).ok_or(AllocError::InvalidRegion)?;
        if bus.is_null() || slot_size == 0 {
            return Err(AllocError::InvalidRegion);
        }

        let slot_size = slot_size
            .checked_add(Self::PAGE_SIZE - 1)
            .ok_or(AllocError::InvalidRegion)?
            & !(Self::PAGE_SIZE - 1);
        let slots = core::cmp::min(len / slot_size, Self::MAX_SLOTS);
        if slots == 0 {
            return Err(AllocError::InvalidRegion);
        }
        // the last slot's bus address must still be addressable
        bus.checked_add(slots * slot_size - 1)
            .ok_or(AllocError::InvalidRegion)?;

        tracing::debug!(%bus, slot_size, slots, "coherent region allocator");
        Ok(Self {
            virt,
            bus,
            slot_size,
            slots: slots as u8,
            used: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots as usize
    }

    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.used.load(Acquire).count_ones() as usize
    }

    fn claim(&self) -> Option<usize> {
        let mut bitmap = self.used.load(Acquire);
        loop {
            let idx = (!bitmap).trailing_zeros() as usize;
            if idx >= self.slots as usize {
                return None;
            }
            match self
                .used
                .compare_exchange_weak(bitmap, bitmap | (1 << idx), AcqRel, Acquire)
            {
                Ok(_) => return Some(idx),
                Err(actual) => bitmap = actual,
            }
        }
    }
}

impl DmaAllocator for RegionAllocator {
    fn alloc_coherent(&self, size: usize) -> Result<CoherentRegion, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        if size > self.slot_size {
            return Err(AllocError::TooLarge {
                requested: size,
                max: self.slot_size,
            });
        }

        let idx = self.claim().ok_or(AllocError::OutOfMemory)?;
        let offset = idx * self.slot_size;
        // Safety: `offset` is inside the carve-out, and the slot is ours
        // until it is freed.
        let region = unsafe {
            let virt = NonNull::new_unchecked(self.virt.as_ptr().add(offset));
            ptr::write_bytes(virt.as_ptr(), 0, self.slot_size);
            let bus = BusAddr(self.bus.0 + offset as u32);
            CoherentRegion::new(bus, virt, self.slot_size)
        };
        tracing::trace!(slot = idx, bus = %region.bus, "claimed coherent slot");
        Ok(region)
    }

    unsafe fn free_coherent(&self, region: CoherentRegion) {
        let offset = (region.bus.0 - self.bus.0) as usize;
        let idx = offset / self.slot_size;
        debug_assert!(idx < self.slots as usize, "region {region:?} not from this allocator");
        debug_assert_eq!(offset % self.slot_size, 0);
        tracing::trace!(slot = idx, bus = %region.bus, "released coherent slot");
        self.used.fetch_and(!(1 << idx), Release);
    }
}

impl fmt::Debug for RegionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionAllocator")
            .field("bus", &format_args!("{}", self.bus))
            .field("slot_size", &self.slot_size)
            .field("slots", &self.slots)
            .field("used", &format_args!("{:#b}", self.used.load(Relaxed)))
            .finish()
    }
}

// === impl CoherentBuffer ===

impl CoherentBuffer {
    /// Allocates a `len`-byte buffer from `alloc`.
    pub fn allocate(alloc: &Arc<dyn DmaAllocator>, len: usize) -> Result<Self, AllocError> {
        let region = alloc.alloc_coherent(len)?;
        if region.len < len {
            // Safety: it came from `alloc` a moment ago and was never
            // handed to the engine.
            unsafe { alloc.free_coherent(region) };
            return Err(AllocError::OutOfMemory);
        }
        Ok(Self {
            region,
            len,
            alloc: alloc.clone(),
        })
    }

    #[must_use]
    pub fn bus_addr(&self) -> BusAddr {
        self.region.bus
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maps the first `len` bytes, or `None` if the buffer is shorter than
    /// that.
    #[must_use]
    pub fn map(&self, len: usize) -> Option<Mapping<'_>> {
        (len <= self.len).then_some(Mapping { buf: self, len })
    }
}

impl Drop for CoherentBuffer {
    fn drop(&mut self) {
        let region = CoherentRegion {
            bus: self.region.bus,
            virt: self.region.virt,
            len: self.region.len,
        };
        // Safety: the region came from `self.alloc`, and the last reference
        // is gone, so no transfer can still target it.
        unsafe { self.alloc.free_coherent(region) }
    }
}

impl fmt::Debug for CoherentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoherentBuffer")
            .field("bus", &format_args!("{}", self.region.bus))
            .field("len", &self.len)
            .finish()
    }
}

// === impl Mapping ===

impl Mapping<'_> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[track_caller]
    #[must_use]
    pub fn read(&self, offset: usize) -> u8 {
        assert!(offset < self.len, "offset {offset} outside a {}-byte mapping", self.len);
        // Safety: bounds checked against the mapping, which never outgrows
        // the buffer.
        unsafe { ptr::read_volatile(self.buf.region.virt.as_ptr().add(offset)) }
    }

    #[track_caller]
    pub fn write(&self, offset: usize, value: u8) {
        assert!(offset < self.len, "offset {offset} outside a {}-byte mapping", self.len);
        // Safety: see `read`.
        unsafe { ptr::write_volatile(self.buf.region.virt.as_ptr().add(offset), value) }
    }

    /// Copies `src` to the start of the mapping.
    #[track_caller]
    pub fn fill_from(&self, src: &[u8]) {
        assert!(src.len() <= self.len, "{} bytes do not fit a {}-byte mapping", src.len(), self.len);
        for (i, &byte) in src.iter().enumerate() {
            self.write(i, byte);
        }
    }

    /// Copies the start of the mapping into `dst`.
    #[track_caller]
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.len, "{} bytes do not fit a {}-byte mapping", dst.len(), self.len);
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.read(i);
        }
    }
}
