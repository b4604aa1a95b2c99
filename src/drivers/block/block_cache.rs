//! Single-slot write-back cache over one flash erase block.
//!
//! The flash medium erases in whole blocks and programs in pages, so a
//! 512-byte sector can never be rewritten in place. The shadow below
//! holds exactly one erase block in memory, accumulates sector writes
//! into it, and writes the block back (erase, then program) only when
//! a different block is needed or a flush is forced. Rewriting a
//! sector with identical bytes does not mark it dirty, so metadata
//! rewrites common in FAT updates cost no erase cycles.
//!
//! The cache does not talk to the bus itself; it drives a
//! [`FlashBlockIo`] so the eviction ordering can be tested against a
//! fake device.

use alloc::boxed::Box;

use crate::config::{BLOCK_SIZE, SECTORS_PER_BLOCK, SECTOR_SIZE};
use crate::utils::error::DiskResult;

/// Whole-block operations the cache needs from the protocol layer.
pub trait FlashBlockIo {
    /// Read one erase block into `buf`.
    fn load_block(&mut self, block: u32, buf: &mut [u8]) -> DiskResult<()>;

    /// Erase one block; afterwards every byte reads 0xFF.
    fn erase_block(&mut self, block: u32) -> DiskResult<()>;

    /// Program one previously-erased block from `buf` and verify it.
    fn program_block(&mut self, block: u32, buf: &[u8]) -> DiskResult<()>;
}

/// Split an LBA into its erase block and the sector offset inside it.
#[inline]
pub fn split_lba(lba: u32) -> (u32, usize) {
    (
        lba / SECTORS_PER_BLOCK,
        (lba % SECTORS_PER_BLOCK) as usize,
    )
}

/// In-memory shadow of one erase block plus per-sector dirty bits.
pub struct BlockShadow {
    block: Option<u32>,
    dirty: u32,
    buf: Box<[u8; BLOCK_SIZE]>,
}

impl BlockShadow {
    pub fn new() -> Self {
        Self {
            block: None,
            dirty: 0,
            buf: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    /// Block currently shadowed, if any.
    #[inline]
    pub fn block(&self) -> Option<u32> {
        self.block
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    /// Make `target` the shadowed block.
    ///
    /// A dirty shadow of a different block is written back first
    /// (erase, program, clear dirty bits); failures propagate and are
    /// fatal for that block. `None` forces the write-back without
    /// loading a replacement; the shadow stays resident and clean, so
    /// a following access to the same block needs no reload.
    pub fn ensure_block(
        &mut self,
        io: &mut dyn FlashBlockIo,
        target: Option<u32>,
    ) -> DiskResult<()> {
        if target.is_some() && target == self.block {
            return Ok(());
        }
        if self.dirty != 0 {
            if let Some(current) = self.block {
                io.erase_block(current)?;
                io.program_block(current, &self.buf[..])?;
            }
            self.dirty = 0;
        }
        if let Some(block) = target {
            io.load_block(block, &mut self.buf[..])?;
            self.block = Some(block);
        }
        Ok(())
    }

    /// Copy one sector out of the shadow, loading its block first if
    /// necessary. Never returns data older than the last write.
    pub fn read_sector(
        &mut self,
        io: &mut dyn FlashBlockIo,
        lba: u32,
        out: &mut [u8],
    ) -> DiskResult<()> {
        let (block, slot) = split_lba(lba);
        self.ensure_block(io, Some(block))?;
        let off = slot * SECTOR_SIZE;
        out.copy_from_slice(&self.buf[off..off + SECTOR_SIZE]);
        Ok(())
    }

    /// Stage one sector write in the shadow. Identical content is
    /// skipped without touching the dirty mask.
    pub fn write_sector(
        &mut self,
        io: &mut dyn FlashBlockIo,
        lba: u32,
        data: &[u8],
    ) -> DiskResult<()> {
        let (block, slot) = split_lba(lba);
        self.ensure_block(io, Some(block))?;
        let off = slot * SECTOR_SIZE;
        let sector = &mut self.buf[off..off + SECTOR_SIZE];
        if sector != data {
            sector.copy_from_slice(data);
            self.dirty |= 1 << slot;
        }
        Ok(())
    }

    /// Force any dirty sectors back to the medium.
    pub fn flush(&mut self, io: &mut dyn FlashBlockIo) -> DiskResult<()> {
        self.ensure_block(io, None)
    }

    /// Drop the shadow without writing it back. Used after the caller
    /// erased the underlying block explicitly, when the shadow content
    /// is obsolete by definition.
    pub fn discard(&mut self) {
        self.block = None;
        self.dirty = 0;
    }
}

impl Default for BlockShadow {
    fn default() -> Self {
        Self::new()
    }
}
