//! Disk-layer result and error types.
//!
//! Every failure a backend can produce reduces to one of the variants
//! below; the filesystem library maps them onto its own error space at
//! the dispatch boundary. Nothing in this crate retries on error; a
//! failed command propagates unchanged to the caller.

use core::fmt::{self, Display, Formatter};

/// Result type used throughout the disk layer.
pub type DiskResult<T> = Result<T, DiskError>;

/// Disk-layer error enumeration.
///
/// `VerifyMismatch` is kept apart from `Transport` on purpose: a failed
/// readback comparison means the medium holds wrong data, while a
/// transport error only means a command did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    /// Medium absent or the device has not been initialized.
    NotReady,
    /// A bounded wait elapsed without the expected completion.
    Timeout,
    /// A command or transfer failed at the bus level.
    Transport,
    /// Post-program readback differs from the data written.
    VerifyMismatch,
    /// Unsupported control command or invalid argument.
    ParamError,
}

impl DiskError {
    /// True for errors that indicate the medium itself is suspect
    /// rather than the request.
    #[inline]
    pub const fn is_media_error(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transport | Self::VerifyMismatch)
    }
}

impl Display for DiskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "device not ready"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Transport => write!(f, "transport error"),
            Self::VerifyMismatch => write!(f, "readback verify mismatch"),
            Self::ParamError => write!(f, "invalid parameter"),
        }
    }
}
