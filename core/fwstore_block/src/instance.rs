//! Block-addressable flash region instance.
//!
//! Wraps one classified region of a probed SPI-NOR device as a
//! fixed-block-size random-access device. One erase-block-sized shadow
//! buffer per instance backs read-modify-write of requests that are not
//! erase aligned.
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
use fwstore_hal::Delay;
use fwstore_nor::SpiNor;
use fwstore_spi::SpiMaster;

/// Geometry and state of a block device.
#[derive(Debug, Clone, Copy)]
pub struct BlockIoMedia {
    pub media_id: u32,
    pub removable_media: bool,
    pub media_present: bool,
    pub read_only: bool,
    pub block_size: u32,
    pub io_align: u32,
    pub last_block: u64,
}

/// Block-device surface: all transfer sizes are whole multiples of
/// `media().block_size`.
pub trait BlockIo {
    fn media(&self) -> &BlockIoMedia;

    fn reset(&mut self, extended_verification: bool) -> Result<()>;

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()>;

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()>;

    fn flush_blocks(&mut self) -> Result<()>;
}

/// One flash region exposed as a block device.
pub struct NorFlashInstance<B: SpiMaster, D: Delay> {
    nor: SpiNor<B, D>,
    region_base: u32,
    size: u64,
    media: BlockIoMedia,
    shadow: Vec<u8>,
}

impl<B: SpiMaster, D: Delay> NorFlashInstance<B, D> {
    /// Create an instance covering `[region_base, region_base + size)` of
    /// the device behind `nor`.
    ///
    /// `block_size` must be a multiple of the device erase granularity and
    /// must evenly divide `size`.
    pub fn new(
        nor: SpiNor<B, D>,
        region_base: u32,
        size: u64,
        block_size: u32,
        media_id: u32,
    ) -> Result<Self> {
        let erase_size = nor.erase_size();
        if block_size == 0 || block_size % erase_size != 0 || size == 0 || size % block_size as u64 != 0 {
            log::error!(
                "nor-flash: bad geometry: region {size:#x} bytes, block {block_size:#x}, erase {erase_size:#x}"
            );
            Err(EfiError::InvalidParameter)?;
        }
        if region_base as u64 + size > nor.size() {
            log::error!("nor-flash: region {region_base:#x}+{size:#x} exceeds device size {:#x}", nor.size());
            Err(EfiError::InvalidParameter)?;
        }

        let media = BlockIoMedia {
            media_id,
            removable_media: false,
            media_present: true,
            read_only: false,
            block_size,
            io_align: 4,
            last_block: size / block_size as u64 - 1,
        };
        let shadow = vec![0u8; erase_size as usize];

        Ok(Self { nor, region_base, size, media, shadow })
    }

    pub fn nor(&mut self) -> &mut SpiNor<B, D> {
        &mut self.nor
    }

    pub fn region_base(&self) -> u32 {
        self.region_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<()> {
        if offset + length as u64 > self.size {
            Err(EfiError::InvalidParameter)?;
        }
        Ok(())
    }

    /// Read bytes at a region-relative offset.
    pub fn read_bytes(&mut self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        self.check_range(offset, buffer.len())?;
        self.nor.read_data(self.region_base + offset as u32, buffer)
    }

    /// Program bytes at a region-relative offset. The target range must be
    /// in the erased state; programming only clears bits.
    pub fn program_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        self.nor.write_data(self.region_base + offset as u32, data)
    }

    /// Erase a region-relative range; offset and length carry the codec's
    /// erase-granularity alignment requirements.
    pub fn erase_range(&mut self, offset: u64, length: u64) -> Result<()> {
        self.check_range(offset, length as usize)?;
        self.nor.erase(self.region_base + offset as u32, length as u32)
    }

    /// Replace bytes at an arbitrary offset, preserving the rest of each
    /// touched erase block through the shadow buffer.
    pub fn update_bytes(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;

        let erase_size = self.nor.erase_size() as u64;
        let mut remaining = data;
        let mut offset = offset;

        while !remaining.is_empty() {
            let block_start = offset / erase_size * erase_size;
            let within = (offset - block_start) as usize;
            let chunk = remaining.len().min(erase_size as usize - within);

            let mut shadow = core::mem::take(&mut self.shadow);
            let result = (|| {
                self.read_bytes(block_start, &mut shadow)?;
                shadow[within..within + chunk].copy_from_slice(&remaining[..chunk]);
                self.erase_range(block_start, erase_size)?;
                self.program_bytes(block_start, &shadow)
            })();
            self.shadow = shadow;
            result?;

            remaining = &remaining[chunk..];
            offset += chunk as u64;
        }

        Ok(())
    }

    fn check_blocks(&self, lba: u64, buffer_len: usize) -> Result<()> {
        let block_size = self.media.block_size as usize;
        if buffer_len == 0 || buffer_len % block_size != 0 {
            log::error!("nor-flash: transfer size {buffer_len:#x} is not a multiple of the block size");
            Err(EfiError::BadBufferSize)?;
        }
        let blocks = (buffer_len / block_size) as u64;
        if lba + blocks - 1 > self.media.last_block {
            log::error!("nor-flash: requested blocks are beyond the last block {:#x}", self.media.last_block);
            Err(EfiError::InvalidParameter)?;
        }
        Ok(())
    }
}

impl<B: SpiMaster, D: Delay> BlockIo for NorFlashInstance<B, D> {
    fn media(&self) -> &BlockIoMedia {
        &self.media
    }

    fn reset(&mut self, _extended_verification: bool) -> Result<()> {
        self.nor.soft_reset()
    }

    fn read_blocks(&mut self, lba: u64, buffer: &mut [u8]) -> Result<()> {
        self.check_blocks(lba, buffer.len())?;
        self.read_bytes(lba * self.media.block_size as u64, buffer)
    }

    fn write_blocks(&mut self, lba: u64, buffer: &[u8]) -> Result<()> {
        self.check_blocks(lba, buffer.len())?;

        let offset = lba * self.media.block_size as u64;
        self.erase_range(offset, buffer.len() as u64)?;
        self.program_bytes(offset, buffer)
    }

    fn flush_blocks(&mut self) -> Result<()> {
        // All writes are synchronous; nothing is buffered at this level.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fwstore_hal::NullDelay;
    use fwstore_nor::sim::SimFlash;

    const BLOCK: u64 = 0x1000;

    fn instance() -> NorFlashInstance<SimFlash, NullDelay> {
        let mut nor = SpiNor::probe(SimFlash::new(0x40000, 0x1000, [0xef, 0x40, 0x18]), NullDelay).unwrap();
        nor.init().unwrap();
        NorFlashInstance::new(nor, 0x10000, 0x20000, BLOCK as u32, 0).unwrap()
    }

    #[test]
    fn geometry_is_derived_from_region() {
        let instance = instance();
        assert_eq!(instance.media().block_size, BLOCK as u32);
        assert_eq!(instance.media().last_block, 0x20000 / BLOCK - 1);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        let make_nor = || {
            let mut nor =
                SpiNor::probe(SimFlash::new(0x40000, 0x1000, [0xef, 0x40, 0x18]), NullDelay).unwrap();
            nor.init().unwrap();
            nor
        };

        // Block size smaller than the erase granularity.
        assert!(NorFlashInstance::new(make_nor(), 0, 0x20000, 0x800, 0).is_err());
        // Region size not a multiple of the block size.
        assert!(NorFlashInstance::new(make_nor(), 0, 0x20800, 0x1000, 0).is_err());
        // Region extends past the device.
        assert!(NorFlashInstance::new(make_nor(), 0, 1 << 40, 0x1000, 0).is_err());
    }

    #[test]
    fn block_round_trip() {
        let mut instance = instance();
        let pattern: Vec<u8> = (0..BLOCK as usize * 2).map(|i| i as u8).collect();

        instance.write_blocks(3, &pattern).unwrap();

        let mut readback = vec![0u8; pattern.len()];
        instance.read_blocks(3, &mut readback).unwrap();
        assert_eq!(readback, pattern);
    }

    #[test]
    fn rewriting_a_block_replaces_old_data() {
        let mut instance = instance();

        instance.write_blocks(0, &vec![0x0f; BLOCK as usize]).unwrap();
        // Without the implicit erase this would program 0xf0 over 0x0f and
        // read back zero.
        instance.write_blocks(0, &vec![0xf0; BLOCK as usize]).unwrap();

        let mut readback = vec![0u8; BLOCK as usize];
        instance.read_blocks(0, &mut readback).unwrap();
        assert!(readback.iter().all(|&b| b == 0xf0));
    }

    #[test]
    fn transfers_must_be_block_multiples_and_in_range() {
        let mut instance = instance();
        let mut small = [0u8; 0x800];
        assert_eq!(instance.read_blocks(0, &mut small), Err(EfiError::BadBufferSize));
        assert_eq!(instance.read_blocks(0, &mut []), Err(EfiError::BadBufferSize));

        let mut block = vec![0u8; BLOCK as usize];
        let last = instance.media().last_block;
        assert_eq!(instance.read_blocks(last + 1, &mut block), Err(EfiError::InvalidParameter));
        assert!(instance.read_blocks(last, &mut block).is_ok());
    }

    #[test]
    fn update_bytes_preserves_the_rest_of_the_block() {
        let mut instance = instance();
        instance.write_blocks(0, &vec![0x11; BLOCK as usize]).unwrap();

        instance.update_bytes(0x100, &[0xaa; 0x20]).unwrap();

        let mut readback = vec![0u8; BLOCK as usize];
        instance.read_blocks(0, &mut readback).unwrap();
        assert!(readback[..0x100].iter().all(|&b| b == 0x11));
        assert!(readback[0x100..0x120].iter().all(|&b| b == 0xaa));
        assert!(readback[0x120..].iter().all(|&b| b == 0x11));
    }

    #[test]
    fn update_bytes_spans_erase_blocks() {
        let mut instance = instance();
        instance.write_blocks(0, &vec![0x33; BLOCK as usize * 2]).unwrap();

        let data = vec![0x44u8; 0x200];
        instance.update_bytes(BLOCK - 0x100, &data).unwrap();

        let mut readback = vec![0u8; BLOCK as usize * 2];
        instance.read_blocks(0, &mut readback).unwrap();
        let start = (BLOCK - 0x100) as usize;
        assert!(readback[..start].iter().all(|&b| b == 0x33));
        assert!(readback[start..start + 0x200].iter().all(|&b| b == 0x44));
        assert!(readback[start + 0x200..].iter().all(|&b| b == 0x33));
    }
}
