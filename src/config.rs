//! Disk geometry and timing constants.
//!
//! The geometry matches small serial NOR parts (4 KiB erase blocks
//! programmed in 256-byte pages) exposed to the filesystem as 512-byte
//! sectors. Timeouts are the per-device defaults; both backends accept
//! overrides at construction time.

/// Logical sector size presented to the filesystem, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Minimum erasable unit of the flash medium, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Sectors per erase block.
pub const SECTORS_PER_BLOCK: u32 = (BLOCK_SIZE / SECTOR_SIZE) as u32;

/// Maximum bytes one page-program command may carry.
pub const PAGE_SIZE: usize = 256;

/// Upper bound on the sector run of a single read/write call.
pub const MAX_SECTOR_RUN: u16 = 128;

/// Default bound on any single flash transport operation.
pub const SPI_TIMEOUT_MS: u64 = 5_000;

/// Default bound on any single card operation, including the readiness
/// poll after a transfer.
pub const SD_TIMEOUT_MS: u64 = 30_000;

/// Status-register polls allowed before a program/erase is declared
/// stuck.
pub const BUSY_POLL_LIMIT: u32 = 100_000;

/// Settle time after a software reset of the flash device.
pub const RESET_SETTLE_MS: u64 = 1;

/// Settle time after issuing a whole-chip erase, before polling busy.
pub const CHIP_ERASE_SETTLE_MS: u64 = 25_000;
