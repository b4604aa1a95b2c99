//! Block disk trait definition
//!
//! Defines the uniform contract both physical backends implement and
//! the status/ioctl vocabulary shared with the filesystem library.

use num_enum::TryFromPrimitive;

use crate::utils::error::DiskResult;

bitflags! {
    /// Drive status bits, in the filesystem library's encoding.
    /// An empty set means the drive is ready.
    pub struct DiskStatus: u8 {
        /// Device has not been initialized (or initialization failed).
        const NOINIT  = 0x01;
        /// No medium in the slot.
        const NODISK  = 0x02;
        /// Medium is write protected.
        const PROTECT = 0x04;
    }
}

impl DiskStatus {
    #[inline]
    pub fn is_ready(&self) -> bool {
        !self.contains(DiskStatus::NOINIT)
    }
}

/// Control command codes as the filesystem library issues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum IoctlCmd {
    /// Flush any pending write-back state to the medium.
    Sync = 0,
    /// Report the number of addressable sectors (u32).
    GetSectorCount = 1,
    /// Report the sector size in bytes (u16).
    GetSectorSize = 2,
    /// Report the erase block size in sectors (u32).
    GetBlockSize = 3,
    /// Erase one physical block, by block index (flash only).
    SectorErase = 4,
    /// Erase the whole device (flash only).
    DiskErase = 5,
}

/// A decoded control request. Out-parameters are written by the
/// backend before it returns.
#[derive(Debug, PartialEq, Eq)]
pub enum IoctlReq {
    Sync,
    SectorCount(u32),
    SectorSize(u16),
    BlockSize(u32),
    SectorErase(u32),
    DiskErase,
}

/// Uniform disk backend contract.
///
/// `read`/`write` operate on runs of contiguous 512-byte sectors. The
/// dispatch table validates the run length (`1..=128`) and the buffer
/// size before delegating, so implementations may assume both. A run
/// is processed atomically with respect to other requests on the same
/// device; each backend serializes through its own lease.
pub trait BlockDisk: Send + Sync {
    /// Bring the device up. Idempotent: an already-initialized device
    /// reports its status without redoing the work.
    fn initialize(&self) -> DiskStatus;

    /// Current status; may actively re-probe the medium.
    fn status(&self) -> DiskStatus;

    /// Read `count` sectors starting at `sector` into `buf`.
    fn read(&self, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()>;

    /// Write `count` sectors starting at `sector` from `buf`.
    #[cfg(feature = "write")]
    fn write(&self, buf: &[u8], sector: u32, count: u16) -> DiskResult<()>;

    /// Control operations. Backends answer `ParamError` for commands
    /// they do not support.
    fn ioctl(&self, req: &mut IoctlReq) -> DiskResult<()>;
}
