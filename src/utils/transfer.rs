//! One-shot completion signal between a DMA/interrupt context and the
//! thread that issued the transfer.
//!
//! Each device owns exactly one [`TransferFlag`]; only one transfer may
//! be outstanding on a device at a time (enforced by the device lease,
//! not by this type). The issuing thread calls [`TransferFlag::start`]
//! before handing the buffer to the hardware, then blocks in
//! [`TransferFlag::wait`]. The completion handler, running in
//! interrupt context, calls [`TransferFlag::complete`] or
//! [`TransferFlag::fail`], both of which are a single atomic store and
//! never block. Error and abort paths must signal too, so the waiter
//! can never hang on a transfer the hardware gave up on.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::hal::Clock;
use crate::utils::error::{DiskError, DiskResult};

const IDLE: u8 = 0;
const DONE: u8 = 1;
const FAILED: u8 = 2;

/// Binary completion flag, signal-safe on the producer side.
pub struct TransferFlag(AtomicU8);

impl TransferFlag {
    pub const fn new() -> Self {
        Self(AtomicU8::new(IDLE))
    }

    /// Arm the flag for a new transfer. Clears any stale completion
    /// left behind by a predecessor that timed out after its signal
    /// was already in flight.
    #[inline]
    pub fn start(&self) {
        self.0.store(IDLE, Ordering::Release);
    }

    /// Signal successful completion. Callable from interrupt context.
    #[inline]
    pub fn complete(&self) {
        self.0.store(DONE, Ordering::Release);
    }

    /// Signal a failed or aborted transfer. Callable from interrupt
    /// context.
    #[inline]
    pub fn fail(&self) {
        self.0.store(FAILED, Ordering::Release);
    }

    /// Block until the flag is signaled or `timeout_ms` elapses,
    /// consuming the signal. Must only be called from the thread that
    /// holds the device lease.
    pub fn wait(&self, clock: &dyn Clock, timeout_ms: u64) -> DiskResult<()> {
        let deadline = clock.now_ms().saturating_add(timeout_ms);
        loop {
            match self.0.swap(IDLE, Ordering::AcqRel) {
                DONE => return Ok(()),
                FAILED => return Err(DiskError::Transport),
                _ => {
                    if clock.now_ms() > deadline {
                        return Err(DiskError::Timeout);
                    }
                    spin_loop();
                }
            }
        }
    }
}

impl Default for TransferFlag {
    fn default() -> Self {
        Self::new()
    }
}
