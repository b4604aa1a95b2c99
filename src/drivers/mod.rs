//! Device drivers
//!
//! This module provides the block device backends and their dispatch
//! table:
//! - SPI NOR flash disk (write-back block cache over erase blocks)
//! - SD card disk (DMA transfers completed from interrupt context)

pub mod block;

pub use block::{BlockDisk, DiskManager};
