//! Hardware collaborator traits.
//!
//! The disk backends never touch registers; everything
//! platform-specific is reached through the traits in this module,
//! implemented by the board support layer (and by in-memory fakes in
//! the tests). Completion of DMA transfers is reported through the
//! device's [`TransferFlag`](crate::utils::transfer::TransferFlag),
//! which the board layer signals from its interrupt handlers.

use crate::utils::error::{DiskError, DiskResult};

/// Monotonic time base used for bounded waits.
///
/// `now_ms` must never go backwards. `delay_ms` parks the calling
/// thread for at least the given time; it is only used for the short
/// settle pauses flash commands require.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn delay_ms(&self, ms: u64);
}

/// Serial bus transport below the flash backend.
///
/// One command sequence is framed by `chip_select(true)` ..
/// `chip_select(false)`. The `*_dma` methods only start the transfer
/// and return; the caller waits on its transfer flag before touching
/// the buffer again or deselecting the device. At most one DMA
/// transfer may be in flight per transport.
pub trait SpiTransport: Send {
    fn chip_select(&mut self, active: bool);

    /// Blocking write of a short command frame.
    fn transmit(&mut self, bytes: &[u8]) -> DiskResult<()>;

    /// Blocking full-duplex exchange, in place. Used for the short
    /// identification and status frames.
    fn exchange(&mut self, frame: &mut [u8]) -> DiskResult<()>;

    /// Blocking receive of a few bytes while selected. Used by the
    /// status busy-poll.
    fn receive(&mut self, buf: &mut [u8]) -> DiskResult<()>;

    /// Start a DMA receive into `buf`; completion is signaled through
    /// the device's transfer flag.
    fn receive_dma(&mut self, buf: &mut [u8]) -> DiskResult<()>;

    /// Start a DMA transmit of `bytes`; completion is signaled through
    /// the device's transfer flag.
    fn transmit_dma(&mut self, bytes: &[u8]) -> DiskResult<()>;
}

/// Geometry reported by the card controller after initialization.
#[derive(Debug, Clone, Copy)]
pub struct CardInfo {
    /// Addressable logical blocks.
    pub block_count: u32,
    /// Logical block size in bytes.
    pub block_size: u16,
    /// Erase unit, in logical blocks.
    pub erase_sectors: u32,
}

/// SD/MMC host controller below the card backend.
///
/// The controller moves whole sectors by DMA and signals completion
/// (or failure) through the device's transfer flag from interrupt
/// context.
pub trait SdHost: Send {
    /// Card-detect switch.
    fn card_present(&mut self) -> bool;

    /// Full controller + card bring-up (reset, clock, identification).
    fn reset(&mut self) -> DiskResult<()>;

    /// Switch the data bus to 4-bit mode.
    fn set_wide_bus(&mut self) -> DiskResult<()>;

    /// Poll the card's state machine. `WouldBlock` while the card is
    /// still busy with a previous operation, `Ok` once it is back in
    /// transfer state.
    fn poll_transfer(&mut self) -> nb::Result<(), DiskError>;

    /// Start a DMA read of `count` sectors beginning at `sector`.
    fn read_dma(&mut self, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()>;

    /// Start a DMA write of `count` sectors beginning at `sector`.
    fn write_dma(&mut self, buf: &[u8], sector: u32, count: u16) -> DiskResult<()>;

    /// Card geometry; only meaningful after a successful `reset`.
    fn info(&mut self) -> CardInfo;
}
