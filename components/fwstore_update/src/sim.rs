//! In-memory block device model.
//!
//! Backs the update-store tests with a RAM block device that can simulate
//! power loss: a write budget can be armed so that the next block write past
//! the budget fails, leaving earlier blocks of the same transfer persisted —
//! exactly the torn-write shape the metadata scheme must survive.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec;
use alloc::vec::Vec;

use fwstore::error::{EfiError, Result};
use fwstore_block::{BlockIo, BlockIoMedia};

/// Simulated block device.
pub struct SimBlockDevice {
    media: BlockIoMedia,
    memory: Vec<u8>,
    /// Successful block writes remaining before writes start failing;
    /// `None` disables the failure injection.
    write_limit: Option<usize>,
    /// Total block writes performed.
    pub writes: usize,
}

impl SimBlockDevice {
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let media = BlockIoMedia {
            media_id: 0,
            removable_media: false,
            media_present: true,
            read_only: false,
            block_size,
            io_align: 4,
            last_block: block_count - 1,
        };
        Self {
            media,
            memory: vec![0xff; block_size as usize * block_count as usize],
            write_limit: None,
            writes: 0,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Arm the power-loss simulation: allow `count` more block writes, then
    /// fail every write until [`clear_write_limit`](Self::clear_write_limit).
    pub fn fail_after_writes(&mut self, count: usize) {
        self.write_limit = Some(count);
    }

    pub fn clear_write_limit(&mut self) {
        self.write_limit = None;
    }

    fn check_transfer(&self, lba: u64, len: usize) -> Result<()> {
        let block_size = self.media.block_size as usize;
        if len == 0 || len % block_size != 0 {
            Err(EfiError::BadBufferSize)?;
        }
        if lba + (len / block_size) as u64 - 1 > self.media.last_block {
            Err(EfiError::InvalidParameter)?;
        }
        Ok(())
    }
}

impl BlockIo for SimBlockDevice {
    fn media(&self) -> &BlockIoMedia {
        &self.media
    }

    fn reset(&mut self, _extended_verification: bool) -> Result<()> {
        Ok(())
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()> {
        self.check_transfer(lba, buffer.len())?;
        let start = lba as usize * self.media.block_size as usize;
        buffer.copy_from_slice(&self.memory[start..start + buffer.len()]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()> {
        self.check_transfer(lba, buffer.len())?;
        let block_size = self.media.block_size as usize;

        // One block at a time so an armed failure tears multi-block writes.
        for (index, chunk) in buffer.chunks_exact(block_size).enumerate() {
            if let Some(remaining) = self.write_limit {
                if remaining == 0 {
                    return Err(EfiError::DeviceError);
                }
                self.write_limit = Some(remaining - 1);
            }
            let start = (lba as usize + index) * block_size;
            self.memory[start..start + block_size].copy_from_slice(chunk);
            self.writes += 1;
        }
        Ok(())
    }

    fn flush_blocks(&mut self) -> Result<()> {
        Ok(())
    }
}
