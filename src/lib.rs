//! Block-storage backends for a FAT filesystem library.
//!
//! This crate provides the disk layer that sits between a filesystem
//! and the physical media:
//! - an SPI NOR flash backend that hides the erase-block/program-page
//!   granularity behind a fixed 512-byte sector interface, using a
//!   single-slot write-back block cache
//! - an SD card backend driven by DMA transfers completed from
//!   interrupt context
//! - a drive dispatch table routing the filesystem's calls to the
//!   registered backend
//!
//! Bus transports, card controllers and the time base are taken as
//! traits (see [`hal`]); board support crates implement them.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod config;
pub mod drivers;
pub mod hal;
pub mod utils;

pub use drivers::block::{
    BlockDisk, DiskManager, DiskStatus, IoctlCmd, IoctlReq, SdCardDisk, SpiFlashDisk,
};
#[cfg(feature = "write")]
pub use drivers::block::FlushPolicy;
pub use utils::error::{DiskError, DiskResult};
pub use utils::transfer::TransferFlag;
