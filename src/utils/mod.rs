//! Utility modules shared by the disk backends:
//! - Error taxonomy (`error`)
//! - Transfer completion signaling (`transfer`)

pub mod error;
pub mod transfer;

pub use error::{DiskError, DiskResult};
pub use transfer::TransferFlag;
