//! SD card disk backend.
//!
//! The card controller moves whole 512-byte sectors by DMA and raises
//! an interrupt when a transfer finishes, so every read/write is
//! issue-then-wait on the device's transfer flag, bracketed by polls
//! of the card's state machine (a card acknowledges the DMA completion
//! before it is actually back in transfer state).
//!
//! Buffers that the DMA engine cannot use directly (not 32-bit
//! aligned) are staged sector-by-sector through an aligned scratch
//! buffer instead of failing the request.

use alloc::sync::Arc;
use core::hint::spin_loop;

use spin::Mutex;

use crate::config::{SD_TIMEOUT_MS, SECTOR_SIZE};
use crate::drivers::block::block_dev::{BlockDisk, DiskStatus, IoctlReq};
use crate::hal::{Clock, SdHost};
use crate::utils::error::{DiskError, DiskResult};
use crate::utils::transfer::TransferFlag;

/// DMA staging buffer; the controller requires word alignment.
#[repr(align(4))]
struct Scratch([u8; SECTOR_SIZE]);

#[inline]
fn dma_misaligned(ptr: *const u8) -> bool {
    ptr as usize % core::mem::align_of::<u32>() != 0
}

/// SD card backend over an [`SdHost`] controller.
pub struct SdCardDisk<H: SdHost> {
    inner: Mutex<SdInner<H>>,
}

struct SdInner<H: SdHost> {
    host: H,
    signal: Arc<TransferFlag>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
    status: DiskStatus,
    scratch: Scratch,
}

impl<H: SdHost> SdCardDisk<H> {
    pub fn new(host: H, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(SdInner {
                host,
                signal: Arc::new(TransferFlag::new()),
                clock,
                timeout_ms: SD_TIMEOUT_MS,
                status: DiskStatus::NOINIT,
                scratch: Scratch([0; SECTOR_SIZE]),
            }),
        }
    }

    /// Override the per-operation timeout.
    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        self.inner.lock().timeout_ms = timeout_ms;
        self
    }

    /// Completion flag for this device; the board layer signals it
    /// from the controller's transfer-complete and error interrupts.
    pub fn completion(&self) -> Arc<TransferFlag> {
        Arc::clone(&self.inner.lock().signal)
    }
}

impl<H: SdHost> SdInner<H> {
    /// Busy-poll the card state machine until it reports transfer
    /// state, bounded by the device timeout.
    fn wait_ready(&mut self) -> DiskResult<()> {
        let deadline = self.clock.now_ms().saturating_add(self.timeout_ms);
        loop {
            match self.host.poll_transfer() {
                Ok(()) => return Ok(()),
                Err(nb::Error::Other(e)) => return Err(e),
                Err(nb::Error::WouldBlock) => {
                    if self.clock.now_ms() > deadline {
                        return Err(DiskError::Timeout);
                    }
                    spin_loop();
                }
            }
        }
    }

    fn bring_up(&mut self) -> DiskResult<()> {
        self.host.reset()?;
        self.host.set_wide_bus()?;
        self.wait_ready()
    }

    fn do_read(&mut self, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()> {
        self.wait_ready()?;
        if dma_misaligned(buf.as_ptr()) {
            for (i, chunk) in buf.chunks_mut(SECTOR_SIZE).enumerate() {
                self.signal.start();
                self.host
                    .read_dma(&mut self.scratch.0, sector + i as u32, 1)?;
                self.signal.wait(&*self.clock, self.timeout_ms)?;
                self.wait_ready()?;
                chunk.copy_from_slice(&self.scratch.0);
            }
        } else {
            self.signal.start();
            self.host.read_dma(buf, sector, count)?;
            self.signal.wait(&*self.clock, self.timeout_ms)?;
            self.wait_ready()?;
        }
        Ok(())
    }

    #[cfg(feature = "write")]
    fn do_write(&mut self, buf: &[u8], sector: u32, count: u16) -> DiskResult<()> {
        self.wait_ready()?;
        if dma_misaligned(buf.as_ptr()) {
            for (i, chunk) in buf.chunks(SECTOR_SIZE).enumerate() {
                self.scratch.0.copy_from_slice(chunk);
                self.signal.start();
                self.host.write_dma(&self.scratch.0, sector + i as u32, 1)?;
                self.signal.wait(&*self.clock, self.timeout_ms)?;
                self.wait_ready()?;
            }
        } else {
            self.signal.start();
            self.host.write_dma(buf, sector, count)?;
            self.signal.wait(&*self.clock, self.timeout_ms)?;
            self.wait_ready()?;
        }
        Ok(())
    }
}

impl<H: SdHost> BlockDisk for SdCardDisk<H> {
    fn initialize(&self) -> DiskStatus {
        let mut inner = self.inner.lock();
        if inner.status.is_ready() && inner.host.card_present() {
            return inner.status;
        }
        inner.status = DiskStatus::NOINIT;
        if !inner.host.card_present() {
            inner.status |= DiskStatus::NODISK;
            return inner.status;
        }
        match inner.bring_up() {
            Ok(()) => inner.status = DiskStatus::empty(),
            Err(e) => log::warn!("sd: initialization failed: {}", e),
        }
        inner.status
    }

    fn status(&self) -> DiskStatus {
        let mut inner = self.inner.lock();
        match inner.host.poll_transfer() {
            Ok(()) => inner.status.remove(DiskStatus::NOINIT),
            Err(_) if inner.status.is_ready() => {
                // Believed ready but the card is not answering; give it
                // the full timeout before declaring it gone.
                if inner.wait_ready().is_err() {
                    log::warn!("sd: lost card");
                    inner.status.insert(DiskStatus::NOINIT);
                }
            }
            Err(_) => {}
        }
        inner.status
    }

    fn read(&self, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        if !inner.status.is_ready() {
            return Err(DiskError::NotReady);
        }
        let res = inner.do_read(buf, sector, count);
        if let Err(e) = res {
            log::error!("sd: read {} x{} failed: {}", sector, count, e);
        }
        res
    }

    #[cfg(feature = "write")]
    fn write(&self, buf: &[u8], sector: u32, count: u16) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        if !inner.status.is_ready() {
            return Err(DiskError::NotReady);
        }
        let res = inner.do_write(buf, sector, count);
        if let Err(e) = res {
            log::error!("sd: write {} x{} failed: {}", sector, count, e);
        }
        res
    }

    fn ioctl(&self, req: &mut IoctlReq) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        if !inner.status.is_ready() {
            return Err(DiskError::NotReady);
        }
        match req {
            IoctlReq::Sync => Ok(()),
            IoctlReq::SectorCount(out) => {
                *out = inner.host.info().block_count;
                Ok(())
            }
            IoctlReq::SectorSize(out) => {
                *out = inner.host.info().block_size;
                Ok(())
            }
            IoctlReq::BlockSize(out) => {
                *out = inner.host.info().erase_sectors;
                Ok(())
            }
            // Erase commands are flash-backend specific.
            IoctlReq::SectorErase(_) | IoctlReq::DiskErase => Err(DiskError::ParamError),
        }
    }
}
