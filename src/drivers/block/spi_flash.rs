//! SPI NOR flash disk backend.
//!
//! Presents 512-byte logical sectors over a medium that erases in
//! 4 KiB blocks and programs in 256-byte pages. Sector writes are
//! staged in the write-back shadow from `block_cache`; this module
//! owns the wire protocol (identify, erase, page program, verify) and
//! the backend contract.
//!
//! All bus work for one logical operation happens under the device
//! lease (`spin::Mutex`), including the erase + program + verify
//! sequence of a cache flush, so no other thread can observe a block
//! between its erase and its reprogram.

use alloc::sync::Arc;

use spin::Mutex;

use crate::config::{
    BLOCK_SIZE, BUSY_POLL_LIMIT, CHIP_ERASE_SETTLE_MS, PAGE_SIZE, RESET_SETTLE_MS, SECTORS_PER_BLOCK,
    SECTOR_SIZE, SPI_TIMEOUT_MS,
};
#[cfg(feature = "write")]
use crate::drivers::block::block_cache::{split_lba, BlockShadow, FlashBlockIo};
use crate::drivers::block::block_dev::{BlockDisk, DiskStatus, IoctlReq};
use crate::drivers::block::flash_cmd::{frame_addr, frame_fast_read, Command, STATUS_BUSY};
use crate::drivers::block::flash_id::{capacity_kib, vendor_name, FlashId};
use crate::hal::{Clock, SpiTransport};
use crate::utils::error::{DiskError, DiskResult};
use crate::utils::transfer::TransferFlag;

/// When staged sector writes are pushed back to the medium.
#[cfg(feature = "write")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Flush at the end of every write call that left dirty sectors.
    Immediate,
    /// Flush once no further write has arrived for `quiet_ms`. The
    /// check runs on the next backend entry after the deadline; an
    /// explicit SYNC flushes regardless.
    Deferred { quiet_ms: u64 },
}

/// Serial flash backend over a [`SpiTransport`].
pub struct SpiFlashDisk<T: SpiTransport> {
    inner: Mutex<FlashInner<T>>,
}

struct FlashInner<T: SpiTransport> {
    link: FlashLink<T>,
    /// Device capacity in bytes; zero until initialization succeeds.
    capacity: u32,
    #[cfg(feature = "write")]
    cache: BlockShadow,
    #[cfg(feature = "write")]
    policy: FlushPolicy,
    #[cfg(feature = "write")]
    flush_due: Option<u64>,
}

/// Bus-facing half of the backend: command protocol plus the transfer
/// synchronizer. Split from the cache so both can be borrowed at once.
struct FlashLink<T: SpiTransport> {
    bus: T,
    signal: Arc<TransferFlag>,
    clock: Arc<dyn Clock>,
    timeout_ms: u64,
}

impl<T: SpiTransport> FlashLink<T> {
    /// Run one command sequence with the device selected; the select
    /// line is released on every exit path.
    fn selected<R>(&mut self, f: impl FnOnce(&mut Self) -> DiskResult<R>) -> DiskResult<R> {
        self.bus.chip_select(true);
        let res = f(self);
        self.bus.chip_select(false);
        res
    }

    fn command(&mut self, cmd: Command) -> DiskResult<()> {
        self.selected(|l| l.bus.transmit(&[cmd as u8]))
    }

    /// Write-enable must precede every program or erase; the part
    /// needs a moment before it accepts the next command.
    fn write_enable(&mut self) -> DiskResult<()> {
        self.command(Command::WriteEnable)?;
        self.clock.delay_ms(1);
        Ok(())
    }

    fn read_identification(&mut self) -> DiskResult<FlashId> {
        let mut frame = [Command::ReadIdentification as u8, 0, 0, 0];
        self.selected(|l| l.bus.exchange(&mut frame))?;
        Ok(FlashId::new(frame[1], frame[2], frame[3]))
    }

    fn read_status(&mut self) -> DiskResult<u8> {
        let mut frame = [Command::ReadStatus as u8, 0];
        self.selected(|l| l.bus.exchange(&mut frame))?;
        Ok(frame[1])
    }

    /// Poll the status register until the write-in-progress bit
    /// clears. Exhausting the attempt budget is fatal, not transient.
    fn wait_write_finished(&mut self) -> DiskResult<()> {
        self.selected(|l| {
            l.bus.transmit(&[Command::ReadStatus as u8])?;
            let mut status = [STATUS_BUSY];
            for _ in 0..BUSY_POLL_LIMIT {
                l.bus.receive(&mut status)?;
                if status[0] & STATUS_BUSY == 0 {
                    return Ok(());
                }
            }
            log::error!("flash: busy poll exhausted waiting for write to finish");
            Err(DiskError::Timeout)
        })
    }

    fn reset_device(&mut self) -> DiskResult<()> {
        self.command(Command::ResetEnable)?;
        self.command(Command::Reset)?;
        self.clock.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    /// Fast-read `buf.len()` bytes starting at byte address `addr`,
    /// transferred by DMA.
    fn read_bytes(&mut self, addr: u32, buf: &mut [u8]) -> DiskResult<()> {
        let frame = frame_fast_read(addr);
        let res = self.selected(|l| {
            l.bus.transmit(&frame)?;
            l.signal.start();
            l.bus.receive_dma(buf)?;
            l.signal.wait(&*l.clock, l.timeout_ms)
        });
        if let Err(e) = res {
            log::error!("flash: read at {:#x} failed: {}", addr, e);
        }
        res
    }

    /// Program one page (at most [`PAGE_SIZE`] bytes, not crossing a
    /// page boundary) and wait for the device to finish it.
    #[cfg(feature = "write")]
    fn program_page(&mut self, addr: u32, page: &[u8]) -> DiskResult<()> {
        self.write_enable()?;
        let res = self.selected(|l| {
            l.bus.transmit(&frame_addr(Command::PageProgram, addr))?;
            l.signal.start();
            l.bus.transmit_dma(page)?;
            l.signal.wait(&*l.clock, l.timeout_ms)
        });
        if let Err(e) = res {
            log::error!("flash: program at {:#x} failed: {}", addr, e);
            return Err(e);
        }
        self.wait_write_finished()
    }

    /// Read the freshly programmed region back and compare it with the
    /// source. A mismatch means the medium holds wrong data, which is
    /// reported apart from transport failures. Stops at the first bad
    /// chunk.
    #[cfg(feature = "write")]
    fn verify(&mut self, addr: u32, data: &[u8]) -> DiskResult<()> {
        let frame = frame_fast_read(addr);
        self.selected(|l| {
            l.bus.transmit(&frame)?;
            let mut page = [0u8; PAGE_SIZE];
            for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
                let readback = &mut page[..chunk.len()];
                readback.fill(0x55);
                l.signal.start();
                l.bus.receive_dma(readback)?;
                l.signal.wait(&*l.clock, l.timeout_ms)?;
                if readback != chunk {
                    log::error!(
                        "flash: verify mismatch at {:#x}",
                        addr + (i * PAGE_SIZE) as u32
                    );
                    return Err(DiskError::VerifyMismatch);
                }
            }
            Ok(())
        })
    }

    /// Erase the 4 KiB block containing byte address `addr`.
    fn erase_block_at(&mut self, addr: u32) -> DiskResult<()> {
        self.write_enable()?;
        self.selected(|l| l.bus.transmit(&frame_addr(Command::SectorErase, addr)))?;
        self.wait_write_finished()
    }

    /// Erase the entire device. Slow; the settle delay comes before
    /// the busy poll so the poll budget is spent on the tail end.
    fn chip_erase(&mut self) -> DiskResult<()> {
        self.write_enable()?;
        self.command(Command::ChipErase)?;
        self.clock.delay_ms(CHIP_ERASE_SETTLE_MS);
        self.wait_write_finished()
    }
}

#[cfg(feature = "write")]
impl<T: SpiTransport> FlashBlockIo for FlashLink<T> {
    fn load_block(&mut self, block: u32, buf: &mut [u8]) -> DiskResult<()> {
        self.read_bytes(block * BLOCK_SIZE as u32, buf)
    }

    fn erase_block(&mut self, block: u32) -> DiskResult<()> {
        self.erase_block_at(block * BLOCK_SIZE as u32)
    }

    fn program_block(&mut self, block: u32, buf: &[u8]) -> DiskResult<()> {
        let base = block * BLOCK_SIZE as u32;
        for (i, page) in buf.chunks(PAGE_SIZE).enumerate() {
            self.program_page(base + (i * PAGE_SIZE) as u32, page)?;
        }
        self.verify(base, buf)
    }
}

impl<T: SpiTransport> SpiFlashDisk<T> {
    pub fn new(bus: T, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(FlashInner {
                link: FlashLink {
                    bus,
                    signal: Arc::new(TransferFlag::new()),
                    clock,
                    timeout_ms: SPI_TIMEOUT_MS,
                },
                capacity: 0,
                #[cfg(feature = "write")]
                cache: BlockShadow::new(),
                #[cfg(feature = "write")]
                policy: FlushPolicy::Immediate,
                #[cfg(feature = "write")]
                flush_due: None,
            }),
        }
    }

    /// Override the per-operation transport timeout.
    pub fn with_timeout(self, timeout_ms: u64) -> Self {
        self.inner.lock().link.timeout_ms = timeout_ms;
        self
    }

    #[cfg(feature = "write")]
    pub fn with_flush_policy(self, policy: FlushPolicy) -> Self {
        self.inner.lock().policy = policy;
        self
    }

    /// Completion flag for this device; the board layer signals it
    /// from the transfer-complete and transfer-error interrupts.
    pub fn completion(&self) -> Arc<TransferFlag> {
        Arc::clone(&self.inner.lock().link.signal)
    }
}

impl<T: SpiTransport> FlashInner<T> {
    fn check_ready(&self) -> DiskResult<()> {
        if self.capacity == 0 {
            Err(DiskError::NotReady)
        } else {
            Ok(())
        }
    }

    fn bring_up(&mut self) -> DiskResult<()> {
        let id = self.link.read_identification()?;
        if self.link.read_status()? & STATUS_BUSY != 0 {
            log::info!("flash: device busy at identify, resetting");
            self.link.reset_device()?;
        }
        let kib = capacity_kib(&id);
        if kib == 0 {
            log::warn!(
                "flash: unknown device (ID {:#04x},{:#04x},{:#04x})",
                id.manufacturer,
                id.memory_type,
                id.capacity_code
            );
            return Err(DiskError::NotReady);
        }
        match vendor_name(id.manufacturer) {
            Some(vendor) if kib < 1024 => log::info!("flash: found {} {} KiB device", vendor, kib),
            Some(vendor) => log::info!("flash: found {} {} MiB device", vendor, kib / 1024),
            None => log::info!("flash: found unlisted vendor {:#04x} device", id.manufacturer),
        }
        self.capacity = kib * 1024;
        Ok(())
    }

    /// Flush triggered by write completion, honoring the policy.
    #[cfg(feature = "write")]
    fn note_write_done(&mut self) -> DiskResult<()> {
        if !self.cache.is_dirty() {
            return Ok(());
        }
        match self.policy {
            FlushPolicy::Immediate => {
                self.flush_due = None;
                self.cache.flush(&mut self.link)
            }
            FlushPolicy::Deferred { quiet_ms } => {
                self.flush_due = Some(self.link.clock.now_ms().saturating_add(quiet_ms));
                Ok(())
            }
        }
    }

    /// Deferred-policy deadline check, run on every backend entry.
    #[cfg(feature = "write")]
    fn run_deferred_flush(&mut self) -> DiskResult<()> {
        if let Some(due) = self.flush_due {
            if self.link.clock.now_ms() >= due {
                self.flush_due = None;
                self.cache.flush(&mut self.link)?;
            }
        }
        Ok(())
    }

    #[cfg(feature = "write")]
    fn sync(&mut self) -> DiskResult<()> {
        self.flush_due = None;
        self.cache.flush(&mut self.link)
    }
}

impl<T: SpiTransport> BlockDisk for SpiFlashDisk<T> {
    fn initialize(&self) -> DiskStatus {
        let mut inner = self.inner.lock();
        if inner.capacity != 0 {
            return DiskStatus::empty();
        }
        match inner.bring_up() {
            Ok(()) => DiskStatus::empty(),
            Err(e) => {
                log::warn!("flash: initialization failed: {}", e);
                DiskStatus::NOINIT
            }
        }
    }

    fn status(&self) -> DiskStatus {
        let mut inner = self.inner.lock();
        #[cfg(feature = "write")]
        if let Err(e) = inner.run_deferred_flush() {
            log::error!("flash: deferred flush failed: {}", e);
        }
        if inner.capacity == 0 {
            DiskStatus::NOINIT
        } else {
            DiskStatus::empty()
        }
    }

    fn read(&self, buf: &mut [u8], sector: u32, count: u16) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_ready()?;
        #[cfg(feature = "write")]
        inner.run_deferred_flush()?;
        for i in 0..u32::from(count) {
            let lba = sector + i;
            let chunk = &mut buf[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
            #[cfg(feature = "write")]
            {
                let (block, _) = split_lba(lba);
                let FlashInner { link, cache, .. } = &mut *inner;
                if cache.block() == Some(block) {
                    cache.read_sector(link, lba, chunk)?;
                    continue;
                }
                if cache.is_dirty() {
                    cache.flush(link)?;
                }
            }
            inner.link.read_bytes(lba * SECTOR_SIZE as u32, chunk)?;
        }
        Ok(())
    }

    #[cfg(feature = "write")]
    fn write(&self, buf: &[u8], sector: u32, count: u16) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        inner.check_ready()?;
        for i in 0..u32::from(count) {
            let lba = sector + i;
            let chunk = &buf[i as usize * SECTOR_SIZE..][..SECTOR_SIZE];
            let FlashInner { link, cache, .. } = &mut *inner;
            cache.write_sector(link, lba, chunk)?;
        }
        inner.note_write_done()
    }

    fn ioctl(&self, req: &mut IoctlReq) -> DiskResult<()> {
        let mut inner = self.inner.lock();
        match req {
            IoctlReq::Sync => {
                #[cfg(feature = "write")]
                inner.sync()?;
                Ok(())
            }
            IoctlReq::SectorCount(out) => {
                inner.check_ready()?;
                *out = inner.capacity / SECTOR_SIZE as u32;
                Ok(())
            }
            IoctlReq::SectorSize(out) => {
                *out = SECTOR_SIZE as u16;
                Ok(())
            }
            IoctlReq::BlockSize(out) => {
                *out = SECTORS_PER_BLOCK;
                Ok(())
            }
            IoctlReq::SectorErase(block) => {
                inner.check_ready()?;
                let block = *block;
                #[cfg(feature = "write")]
                if inner.cache.block() == Some(block) {
                    inner.cache.discard();
                }
                inner.link.erase_block_at(block * BLOCK_SIZE as u32)
            }
            IoctlReq::DiskErase => {
                inner.check_ready()?;
                #[cfg(feature = "write")]
                inner.cache.discard();
                inner.link.chip_erase()
            }
        }
    }
}
