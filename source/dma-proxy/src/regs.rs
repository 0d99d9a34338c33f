//! AXI DMA register layout and raw register access.
//!
//! Offsets and bit positions follow the AXI DMA product guide (direct
//! register mode, no scatter-gather).
// Unusual groupings are used in binary literals in this file in order to
// separate the bits by which field they represent, rather than by their byte.
#![allow(clippy::unusual_byte_groupings)]

use alloc::sync::Arc;
use core::{
    fmt,
    ptr::{self, NonNull},
};

use mycelium_bitfield::bitfield;

use crate::{
    settings::{ProxySettings, AXI_DMA_ADDR_SZ, AXI_DMA_BASE_ADDR},
    Error,
};

pub const MM2S_DMACR: usize = 0x00;
pub const MM2S_DMASR: usize = 0x04;
pub const MM2S_SA: usize = 0x18;
pub const MM2S_LENGTH: usize = 0x28;

pub const S2MM_DMACR: usize = 0x30;
pub const S2MM_DMASR: usize = 0x34;
pub const S2MM_DA: usize = 0x48;
pub const S2MM_LENGTH: usize = 0x58;

/// Bytes of register space the driver touches, from the window base.
pub const REGISTER_SPAN: usize = S2MM_LENGTH + 4;

bitfield! {
    /// A channel's `DMACR` (DMA control) register.
    ///
    /// The `MM2S` and `S2MM` control registers share this layout.
    #[derive(PartialEq, Eq)]
    pub struct DmaCr<u32> {
        /// Run/stop. Setting this bit starts the channel.
        pub const RS: bool;
        const _RESERVED_0 = 1;
        /// Soft reset. Self-clearing once the reset completes.
        pub const RESET: bool;
        const _RESERVED_1 = 9;
        /// Interrupt on complete enable.
        pub const IOC_IRQ_EN: bool;
        /// Delay timer interrupt enable.
        pub const DLY_IRQ_EN: bool;
        /// Error interrupt enable.
        pub const ERR_IRQ_EN: bool;
    }
}

bitfield! {
    /// A channel's `DMASR` (DMA status) register.
    #[derive(PartialEq, Eq)]
    pub struct DmaSr<u32> {
        /// The channel is halted (run/stop is clear and outstanding
        /// transfers have drained).
        pub const HALTED: bool;
        /// The channel has finished its current transfer.
        pub const IDLE: bool;
        const _RESERVED_0 = 2;
        pub const DMA_INT_ERR: bool;
        pub const DMA_SLV_ERR: bool;
        pub const DMA_DEC_ERR: bool;
        const _RESERVED_1 = 5;
        /// Interrupt on complete. Set when a transfer finishes, whether or
        /// not the interrupt is enabled.
        pub const IOC_IRQ: bool;
        pub const DLY_IRQ: bool;
        pub const ERR_IRQ: bool;
    }
}

impl DmaCr {
    /// Control value that starts a channel with every interrupt source
    /// enabled. The driver never services those interrupts; it polls `DMASR`.
    #[must_use]
    pub fn run_with_irqs() -> Self {
        Self::new()
            .with(Self::RS, true)
            .with(Self::IOC_IRQ_EN, true)
            .with(Self::DLY_IRQ_EN, true)
            .with(Self::ERR_IRQ_EN, true)
    }

    #[must_use]
    pub fn reset() -> Self {
        Self::new().with(Self::RESET, true)
    }
}

impl DmaSr {
    /// Returns `true` once the channel is idle *and* has flagged completion.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.get(Self::IDLE) && self.get(Self::IOC_IRQ)
    }

    #[inline]
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.get(Self::DMA_INT_ERR) || self.get(Self::DMA_SLV_ERR) || self.get(Self::DMA_DEC_ERR)
    }
}

/// One of the engine's two channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Channel {
    /// Memory to stream: the transmit channel.
    Mm2s,
    /// Stream to memory: the receive channel.
    S2mm,
}

/// The registers belonging to one [`Channel`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChannelRegs {
    pub control: usize,
    pub status: usize,
    pub address: usize,
    pub length: usize,
}

impl Channel {
    pub const MM2S: ChannelRegs = ChannelRegs {
        control: MM2S_DMACR,
        status: MM2S_DMASR,
        address: MM2S_SA,
        length: MM2S_LENGTH,
    };

    pub const S2MM: ChannelRegs = ChannelRegs {
        control: S2MM_DMACR,
        status: S2MM_DMASR,
        address: S2MM_DA,
        length: S2MM_LENGTH,
    };

    #[must_use]
    pub const fn regs(self) -> ChannelRegs {
        match self {
            Channel::Mm2s => Self::MM2S,
            Channel::S2mm => Self::S2MM,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Mm2s => f.write_str("MM2S"),
            Channel::S2mm => f.write_str("S2MM"),
        }
    }
}

/// 32-bit register access at byte offsets from the engine's base address.
///
/// Implementations must not reorder accesses relative to each other; the
/// channel sequences depend on e.g. the length write landing *after* the
/// address and control writes.
pub trait RegisterWindow: Send + Sync {
    fn read(&self, offset: usize) -> u32;

    fn write(&self, offset: usize, value: u32);

    /// Returns `false` if there is no mapped engine behind this window. Reads
    /// from an unmapped window return zero and writes are dropped.
    fn is_mapped(&self) -> bool {
        true
    }
}

impl<R: RegisterWindow + ?Sized> RegisterWindow for Arc<R> {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }

    #[inline]
    fn is_mapped(&self) -> bool {
        (**self).is_mapped()
    }
}

/// Volatile access to a mapped AXI-Lite register window.
pub struct MmioWindow {
    base: Option<NonNull<u32>>,
    len: usize,
}

// Safety: all access goes through volatile reads/writes of whole registers.
unsafe impl Send for MmioWindow {}
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    /// Wraps the register window starting at `base`, `len` bytes long.
    ///
    /// A null `base` produces an unmapped window.
    ///
    /// # Safety
    ///
    /// If `base` is non-null, it must point to `len` bytes of device memory
    /// that stays mapped for as long as the returned `MmioWindow` lives, and
    /// it must be 4-byte aligned.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self {
            base: NonNull::new(base.cast::<u32>()),
            len,
        }
    }

    /// Returns a window with no engine behind it.
    #[must_use]
    pub const fn unmapped() -> Self {
        Self { base: None, len: 0 }
    }

    /// Wraps the register window at [`AXI_DMA_BASE_ADDR`], the fixed base
    /// used when the platform has no dynamic device discovery.
    ///
    /// # Safety
    ///
    /// The default base must be identity mapped (or otherwise accessible at
    /// that address) on this platform.
    pub unsafe fn at_default_base() -> Self {
        Self::new(AXI_DMA_BASE_ADDR as *mut u8, AXI_DMA_ADDR_SZ)
    }

    /// Wraps the register window described by `settings`.
    ///
    /// # Safety
    ///
    /// `settings.base_addr` must be accessible at that address on this
    /// platform, as for [`MmioWindow::new`].
    pub unsafe fn from_settings(settings: &ProxySettings) -> Result<Self, Error> {
        settings.validate()?;
        Ok(Self::new(settings.base_addr as *mut u8, settings.window_size))
    }

    #[inline]
    fn reg(&self, offset: usize) -> Option<*mut u32> {
        let base = self.base?;
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "register offset {offset:#x} outside of a {:#x}-byte window",
            self.len
        );
        // Safety: bounds checked above.
        Some(unsafe { base.as_ptr().add(offset / 4) })
    }
}

impl RegisterWindow for MmioWindow {
    fn read(&self, offset: usize) -> u32 {
        match self.reg(offset) {
            // Safety: `reg` guarantees the pointer is in bounds of the mapping.
            Some(reg) => unsafe { ptr::read_volatile(reg) },
            None => 0,
        }
    }

    fn write(&self, offset: usize, value: u32) {
        if let Some(reg) = self.reg(offset) {
            // Safety: `reg` guarantees the pointer is in bounds of the mapping.
            unsafe { ptr::write_volatile(reg, value) }
        }
    }

    fn is_mapped(&self) -> bool {
        self.base.is_some()
    }
}

impl fmt::Debug for MmioWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmioWindow")
            .field("base", &self.base)
            .field("len", &format_args!("{:#x}", self.len))
            .finish()
    }
}
