//! Block device backends and the drive dispatch table.
//!
//! The filesystem library addresses drives by index; [`DiskManager`]
//! routes each call to the backend registered for that index and
//! performs the argument validation the backends rely on. The raw
//! `*_raw` entry point mirrors the byte-oriented control interface the
//! filesystem library speaks.

#[cfg(feature = "write")]
mod block_cache;
mod block_dev;
pub mod flash_cmd;
pub mod flash_id;
mod sd_card;
mod spi_flash;

pub use block_dev::{BlockDisk, DiskStatus, IoctlCmd, IoctlReq};
pub use flash_id::FlashId;
pub use sd_card::SdCardDisk;
#[cfg(feature = "write")]
pub use spi_flash::FlushPolicy;
pub use spi_flash::SpiFlashDisk;

use alloc::sync::Arc;

use crate::config::{MAX_SECTOR_RUN, SECTOR_SIZE};
use crate::utils::error::{DiskError, DiskResult};

/// Drive slots the dispatch table can hold.
pub const MAX_DRIVES: usize = 4;

struct DriveSlot {
    dev: Arc<dyn BlockDisk>,
    initialized: bool,
}

/// Drive-index dispatch table.
///
/// Owned by whoever assembles the system (one per volume set, no
/// global state), so independent device stacks can coexist and tests
/// can build as many as they need.
pub struct DiskManager {
    drives: [Option<DriveSlot>; MAX_DRIVES],
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            drives: core::array::from_fn(|_| None),
        }
    }

    /// Attach a backend to a drive index. Re-registering a drive
    /// clears its initialized latch.
    pub fn register(&mut self, drive: usize, dev: Arc<dyn BlockDisk>) -> DiskResult<()> {
        let slot = self.drives.get_mut(drive).ok_or(DiskError::ParamError)?;
        *slot = Some(DriveSlot {
            dev,
            initialized: false,
        });
        Ok(())
    }

    fn slot(&self, drive: usize) -> DiskResult<&DriveSlot> {
        self.drives
            .get(drive)
            .and_then(|s| s.as_ref())
            .ok_or(DiskError::NotReady)
    }

    /// Run-length and buffer validation done once here; backends
    /// assume both hold.
    fn check_run(len: usize, count: u16) -> DiskResult<()> {
        if count == 0 || count > MAX_SECTOR_RUN || len != count as usize * SECTOR_SIZE {
            return Err(DiskError::ParamError);
        }
        Ok(())
    }

    /// Initialize a drive once; later calls just report status.
    pub fn initialize(&mut self, drive: usize) -> DiskStatus {
        let slot = match self.drives.get_mut(drive).and_then(|s| s.as_mut()) {
            Some(slot) => slot,
            None => return DiskStatus::NOINIT | DiskStatus::NODISK,
        };
        if slot.initialized {
            return slot.dev.status();
        }
        let status = slot.dev.initialize();
        if status.is_ready() {
            slot.initialized = true;
        }
        status
    }

    pub fn status(&self, drive: usize) -> DiskStatus {
        match self.slot(drive) {
            Ok(slot) => slot.dev.status(),
            Err(_) => DiskStatus::NOINIT | DiskStatus::NODISK,
        }
    }

    pub fn read(&self, drive: usize, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()> {
        let slot = self.slot(drive)?;
        Self::check_run(buf.len(), count)?;
        slot.dev.read(buf, sector, count)
    }

    #[cfg(feature = "write")]
    pub fn write(&self, drive: usize, buf: &[u8], sector: u32, count: u16) -> DiskResult<()> {
        let slot = self.slot(drive)?;
        Self::check_run(buf.len(), count)?;
        slot.dev.write(buf, sector, count)
    }

    pub fn ioctl(&self, drive: usize, req: &mut IoctlReq) -> DiskResult<()> {
        self.slot(drive)?.dev.ioctl(req)
    }

    /// Byte-oriented control entry point: decode the command code,
    /// dispatch, then marshal any result back into `buf` in native
    /// byte order (the filesystem library reads it as a plain
    /// integer).
    pub fn ioctl_raw(&self, drive: usize, cmd: u8, buf: &mut [u8]) -> DiskResult<()> {
        let cmd = IoctlCmd::try_from(cmd).map_err(|_| DiskError::ParamError)?;
        let mut req = match cmd {
            IoctlCmd::Sync => IoctlReq::Sync,
            IoctlCmd::GetSectorCount => IoctlReq::SectorCount(0),
            IoctlCmd::GetSectorSize => IoctlReq::SectorSize(0),
            IoctlCmd::GetBlockSize => IoctlReq::BlockSize(0),
            IoctlCmd::SectorErase => IoctlReq::SectorErase(read_u32(buf)?),
            IoctlCmd::DiskErase => IoctlReq::DiskErase,
        };
        self.ioctl(drive, &mut req)?;
        match req {
            IoctlReq::SectorCount(v) | IoctlReq::BlockSize(v) => write_u32(buf, v)?,
            IoctlReq::SectorSize(v) => write_u16(buf, v)?,
            _ => {}
        }
        Ok(())
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(buf: &[u8]) -> DiskResult<u32> {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(buf.get(..4).ok_or(DiskError::ParamError)?);
    Ok(u32::from_ne_bytes(bytes))
}

fn write_u32(buf: &mut [u8], v: u32) -> DiskResult<()> {
    buf.get_mut(..4)
        .ok_or(DiskError::ParamError)?
        .copy_from_slice(&v.to_ne_bytes());
    Ok(())
}

fn write_u16(buf: &mut [u8], v: u16) -> DiskResult<()> {
    buf.get_mut(..2)
        .ok_or(DiskError::ParamError)?
        .copy_from_slice(&v.to_ne_bytes());
    Ok(())
}
