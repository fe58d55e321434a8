//! Firmware Volume Block surface for the variable-storage region.
//!
//! The variable store lives in a firmware-volume-formatted slice of flash:
//! an FV header, a block map, and a variable-store header ahead of the
//! variable data. On first use the on-flash headers are validated; an
//! invalid volume is not a hard failure — the reserved range is erased and
//! fresh default headers are written so variable services can start with an
//! empty store.
//!
//! Reads are served from a RAM copy of the region; writes go to flash first
//! and then update the copy.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use bitflags::bitflags;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use fwstore::error::{EfiError, Result};
use fwstore_hal::Delay;
use fwstore_spi::SpiMaster;

use crate::instance::{BlockIo, NorFlashInstance};
use crate::region::FlashLayout;

/// ASCII "_FVH".
const FVH_SIGNATURE: u32 = u32::from_le_bytes(*b"_FVH");
const FVH_REVISION: u8 = 2;

const VARIABLE_STORE_FORMATTED: u8 = 0x5a;
const VARIABLE_STORE_HEALTHY: u8 = 0xfe;

/// gEfiSystemNvDataFvGuid
const SYSTEM_NV_DATA_FV_GUID: [u8; 16] =
    [0x8d, 0x2b, 0xf1, 0xff, 0x96, 0x76, 0x8b, 0x4c, 0xa9, 0x85, 0x27, 0x47, 0x07, 0x5b, 0x4f, 0x50];

/// gEfiAuthenticatedVariableGuid
const AUTHENTICATED_VARIABLE_GUID: [u8; 16] =
    [0x78, 0x2c, 0xf3, 0xaa, 0x7b, 0x94, 0x9a, 0x43, 0xa1, 0x80, 0x2e, 0x14, 0x4e, 0xc3, 0x77, 0x92];

/// gEfiVariableGuid
const VARIABLE_GUID: [u8; 16] =
    [0x16, 0x36, 0xcf, 0xdd, 0x75, 0x32, 0x64, 0x41, 0x98, 0xb6, 0xfe, 0x85, 0x70, 0x7f, 0xfe, 0x7d];

bitflags! {
    /// Firmware volume block attributes (`EFI_FVB_ATTRIBUTES_2` subset).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FvbAttributes: u32 {
        const READ_ENABLED_CAP = 0x0000_0002;
        const READ_STATUS = 0x0000_0004;
        const WRITE_ENABLED_CAP = 0x0000_0010;
        const WRITE_STATUS = 0x0000_0020;
        const STICKY_WRITE = 0x0000_0200;
        const ERASE_POLARITY = 0x0000_0800;
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
struct FirmwareVolumeHeader {
    zero_vector: [u8; 16],
    file_system_guid: [u8; 16],
    fv_length: U64,
    signature: U32,
    attributes: U32,
    header_length: U16,
    checksum: U16,
    ext_header_offset: U16,
    reserved: u8,
    revision: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
struct BlockMapEntry {
    num_blocks: U32,
    length: U32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
struct VariableStoreHeader {
    signature: [u8; 16],
    size: U32,
    format: u8,
    state: u8,
    reserved: U16,
    reserved1: U32,
}

/// Header length: FV header plus the block map and its terminator entry.
const FV_HEADER_LENGTH: usize = mem::size_of::<FirmwareVolumeHeader>() + 2 * mem::size_of::<BlockMapEntry>();

fn checksum16(bytes: &[u8]) -> u16 {
    bytes
        .chunks_exact(2)
        .fold(0u16, |sum, value| sum.wrapping_add(u16::from_le_bytes(value.try_into().unwrap())))
}

/// Firmware Volume Block device over the variable-storage region.
pub struct FvbDevice<B: SpiMaster, D: Delay> {
    instance: NorFlashInstance<B, D>,
    /// Region-relative offset of the firmware volume.
    fvb_offset: u64,
    fvb_size: u32,
    variable_size: u32,
    cache: Vec<u8>,
}

impl<B: SpiMaster, D: Delay> FvbDevice<B, D> {
    /// Open the firmware volume at device offset `fvb_offset`, validating
    /// or self-healing its headers.
    ///
    /// `force_default` discards the current contents unconditionally, for
    /// boots that must come up with default settings.
    pub fn new(
        mut instance: NorFlashInstance<B, D>,
        fvb_offset: u64,
        layout: &FlashLayout,
        force_default: bool,
    ) -> Result<Self> {
        let block_size = instance.media().block_size;
        let fvb_size = layout.variable_fv_size();

        for size in [layout.variable_size, layout.ftw_working_size, layout.ftw_spare_size] {
            if size == 0 || size / block_size == 0 {
                log::error!("fvb: storage area size {size:#x} is less than one block");
                Err(EfiError::InvalidParameter)?;
            }
        }
        if fvb_offset % block_size as u64 != 0 {
            log::error!("fvb: volume base {fvb_offset:#x} is not block aligned");
            Err(EfiError::InvalidParameter)?;
        }

        let region_base = instance.region_base() as u64;
        if fvb_offset < region_base || fvb_offset + fvb_size as u64 > region_base + instance.size() {
            log::error!("fvb: volume {fvb_offset:#x}+{fvb_size:#x} outside the instance region");
            Err(EfiError::InvalidParameter)?;
        }

        let mut cache = vec![0u8; fvb_size as usize];
        instance.read_bytes(fvb_offset - region_base, &mut cache)?;

        let mut device = Self {
            instance,
            fvb_offset: fvb_offset - region_base,
            fvb_size,
            variable_size: layout.variable_size,
            cache,
        };

        if force_default || device.validate_fv_header().is_err() {
            log::warn!("fvb: volume header is not valid, installing a fresh one");
            device.initialize_headers()?;
        }

        Ok(device)
    }

    pub fn instance_mut(&mut self) -> &mut NorFlashInstance<B, D> {
        &mut self.instance
    }

    fn block_size(&self) -> u32 {
        self.instance.media().block_size
    }

    /// Last logical block of the firmware volume.
    pub fn last_block(&self) -> u64 {
        (self.fvb_size / self.block_size()) as u64 - 1
    }

    /// Check the integrity of the on-flash volume header.
    pub fn validate_fv_header(&self) -> Result<()> {
        let header = FirmwareVolumeHeader::read_from_bytes(
            &self.cache[..mem::size_of::<FirmwareVolumeHeader>()],
        )
        .unwrap();

        if header.revision != FVH_REVISION
            || header.signature.get() != FVH_SIGNATURE
            || header.fv_length.get() != self.fvb_size as u64
            || (header.header_length.get() as usize) < mem::size_of::<FirmwareVolumeHeader>()
            || header.header_length.get() as usize > self.cache.len()
        {
            log::error!("fvb: no firmware volume header present");
            Err(EfiError::NotFound)?;
        }

        if header.file_system_guid != SYSTEM_NV_DATA_FV_GUID {
            log::error!("fvb: firmware volume guid non-compatible");
            Err(EfiError::NotFound)?;
        }

        let header_length = header.header_length.get() as usize;
        if checksum16(&self.cache[..header_length]) != 0 {
            log::error!("fvb: firmware volume checksum is invalid");
            Err(EfiError::NotFound)?;
        }

        let store = VariableStoreHeader::read_from_bytes(
            &self.cache[header_length..header_length + mem::size_of::<VariableStoreHeader>()],
        )
        .unwrap();

        if store.signature != VARIABLE_GUID && store.signature != AUTHENTICATED_VARIABLE_GUID {
            log::error!("fvb: variable store guid non-compatible");
            Err(EfiError::NotFound)?;
        }

        if store.size.get() != self.variable_size - header_length as u32 {
            log::error!("fvb: variable store length does not match");
            Err(EfiError::NotFound)?;
        }

        Ok(())
    }

    /// Erase the reserved range and write fresh FV and variable-store
    /// headers supporting variable operations.
    fn initialize_headers(&mut self) -> Result<()> {
        let block_size = self.block_size();

        let attributes = FvbAttributes::READ_ENABLED_CAP
            | FvbAttributes::READ_STATUS
            | FvbAttributes::STICKY_WRITE
            | FvbAttributes::ERASE_POLARITY
            | FvbAttributes::WRITE_STATUS
            | FvbAttributes::WRITE_ENABLED_CAP;

        let mut fv_header = FirmwareVolumeHeader {
            zero_vector: [0; 16],
            file_system_guid: SYSTEM_NV_DATA_FV_GUID,
            fv_length: U64::new(self.fvb_size as u64),
            signature: U32::new(FVH_SIGNATURE),
            attributes: U32::new(attributes.bits()),
            header_length: U16::new(FV_HEADER_LENGTH as u16),
            checksum: U16::new(0),
            ext_header_offset: U16::new(0),
            reserved: 0,
            revision: FVH_REVISION,
        };

        let block_map = [
            BlockMapEntry {
                num_blocks: U32::new(self.fvb_size / block_size),
                length: U32::new(block_size),
            },
            BlockMapEntry { num_blocks: U32::new(0), length: U32::new(0) },
        ];

        let store_header = VariableStoreHeader {
            signature: AUTHENTICATED_VARIABLE_GUID,
            size: U32::new(self.variable_size - FV_HEADER_LENGTH as u32),
            format: VARIABLE_STORE_FORMATTED,
            state: VARIABLE_STORE_HEALTHY,
            reserved: U16::new(0),
            reserved1: U32::new(0),
        };

        let mut headers = Vec::with_capacity(FV_HEADER_LENGTH + mem::size_of::<VariableStoreHeader>());
        headers.extend_from_slice(fv_header.as_bytes());
        headers.extend_from_slice(block_map[0].as_bytes());
        headers.extend_from_slice(block_map[1].as_bytes());

        fv_header.checksum = U16::new(0u16.wrapping_sub(checksum16(&headers)));
        headers[..mem::size_of::<FirmwareVolumeHeader>()].copy_from_slice(fv_header.as_bytes());
        debug_assert_eq!(checksum16(&headers), 0);

        headers.extend_from_slice(store_header.as_bytes());

        // Erase the entire range reserved for variable storage, then
        // install the combined super-header.
        self.instance.erase_range(self.fvb_offset, self.fvb_size as u64)?;
        self.cache.fill(0xff);

        self.write(0, 0, &headers)
    }

    /// The volume attributes recorded in the on-flash header.
    pub fn get_attributes(&self) -> FvbAttributes {
        let header =
            FirmwareVolumeHeader::read_from_bytes(&self.cache[..mem::size_of::<FirmwareVolumeHeader>()])
                .unwrap();
        FvbAttributes::from_bits_truncate(header.attributes.get())
    }

    /// Attribute changes are not supported on this volume.
    pub fn set_attributes(&mut self, attributes: FvbAttributes) -> Result<()> {
        log::warn!("fvb: set_attributes({:#x}) is not supported", attributes.bits());
        Err(EfiError::Unsupported)
    }

    /// Device offset of the volume, for callers that address flash
    /// directly.
    pub fn get_physical_address(&self) -> u64 {
        self.instance.region_base() as u64 + self.fvb_offset
    }

    /// Size of `lba` and the number of consecutive same-sized blocks from
    /// it to the end of the volume.
    pub fn get_block_size(&self, lba: u64) -> Result<(u32, u64)> {
        if lba > self.last_block() {
            log::error!("fvb: lba {lba} is beyond the last block {}", self.last_block());
            Err(EfiError::InvalidParameter)?;
        }
        Ok((self.block_size(), self.last_block() - lba + 1))
    }

    fn check_span(&self, lba: u64, offset: usize, len: usize) -> Result<()> {
        if lba > self.last_block() {
            Err(EfiError::InvalidParameter)?;
        }
        let block_size = self.block_size() as usize;
        // Each bound is checked on its own; summing two large values first
        // could overflow.
        if offset >= block_size || len > block_size || offset + len > block_size {
            log::error!("fvb: request {offset:#x}+{len:#x} spans past the block boundary");
            Err(EfiError::BadBufferSize)?;
        }
        if len == 0 {
            Err(EfiError::BadBufferSize)?;
        }
        Ok(())
    }

    /// Read bytes within one block of the volume.
    pub fn read(&mut self, lba: u64, offset: usize, buffer: &mut [u8]) -> Result<()> {
        self.check_span(lba, offset, buffer.len())?;

        let start = lba as usize * self.block_size() as usize + offset;
        buffer.copy_from_slice(&self.cache[start..start + buffer.len()]);
        Ok(())
    }

    /// Write bytes within one block of the volume.
    ///
    /// The volume is sticky-write: the target range must have been erased
    /// first, or the result is unpredictable. Data reaches flash before the
    /// RAM copy is updated.
    pub fn write(&mut self, lba: u64, offset: usize, data: &[u8]) -> Result<()> {
        self.check_span(lba, offset, data.len())?;

        let start = lba as usize * self.block_size() as usize + offset;
        self.instance.program_bytes(self.fvb_offset + start as u64, data).inspect_err(|e| {
            log::error!("fvb: failed to do flash write: {e:?}");
        })?;

        self.cache[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Erase the listed `(first_lba, num_blocks)` ranges.
    ///
    /// The entire list is validated before any block is touched; one bad
    /// range rejects the whole request without modifying the volume.
    pub fn erase_blocks(&mut self, ranges: &[(u64, u64)]) -> Result<()> {
        for &(start, count) in ranges {
            if count == 0 || start + count - 1 > self.last_block() {
                log::error!("fvb: requested blocks {start}+{count} are beyond the last block");
                Err(EfiError::InvalidParameter)?;
            }
        }

        let block_size = self.block_size() as u64;
        for &(start, count) in ranges {
            for lba in start..start + count {
                self.instance.erase_range(self.fvb_offset + lba * block_size, block_size).inspect_err(
                    |e| {
                        log::error!("fvb: erase of lba {lba} failed: {e:?}");
                    },
                )?;

                let begin = (lba * block_size) as usize;
                self.cache[begin..begin + block_size as usize].fill(0xff);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fwstore_hal::NullDelay;
    use fwstore_nor::sim::SimFlash;
    use fwstore_nor::SpiNor;

    const BLOCK: u32 = 0x1000;
    const REGION_BASE: u32 = 0x10000;
    const FVB_OFFSET: u64 = 0x12000;

    fn layout() -> FlashLayout {
        FlashLayout {
            variable_base: 0,
            variable_base64: FVB_OFFSET,
            variable_size: 0x4000,
            ftw_working_size: 0x1000,
            ftw_spare_size: 0x3000,
            fwu_base: 0,
            fwu_base64: 0,
            fwu_size: 0,
        }
    }

    fn instance() -> NorFlashInstance<SimFlash, NullDelay> {
        let mut nor = SpiNor::probe(SimFlash::new(0x40000, 0x1000, [0xef, 0x40, 0x18]), NullDelay).unwrap();
        nor.init().unwrap();
        NorFlashInstance::new(nor, REGION_BASE, 0x20000, BLOCK, 0).unwrap()
    }

    fn device() -> FvbDevice<SimFlash, NullDelay> {
        FvbDevice::new(instance(), FVB_OFFSET, &layout(), false).unwrap()
    }

    #[test]
    fn fresh_flash_self_heals_to_a_valid_volume() {
        let mut device = device();
        device.validate_fv_header().unwrap();

        // The installed header starts with the zero vector then the NV FV
        // filesystem guid.
        let mut head = [0u8; 32];
        device.read(0, 0, &mut head).unwrap();
        assert_eq!(&head[16..32], &SYSTEM_NV_DATA_FV_GUID);
    }

    #[test]
    fn corrupted_volume_is_reinitialized() {
        let mut inst = instance();
        // Plant garbage where the header goes.
        inst.update_bytes(FVB_OFFSET - REGION_BASE as u64, &[0x5a; 64]).unwrap();

        let device = FvbDevice::new(inst, FVB_OFFSET, &layout(), false).unwrap();
        device.validate_fv_header().unwrap();
    }

    #[test]
    fn valid_volume_survives_reopen_without_reformat() {
        let mut device = device();

        // Write a marker past the headers, then reopen the same flash.
        device.write(1, 0x20, &[0xa7; 4]).unwrap();
        let inst = device.instance;
        let mut device = FvbDevice::new(inst, FVB_OFFSET, &layout(), false).unwrap();

        let mut marker = [0u8; 4];
        device.read(1, 0x20, &mut marker).unwrap();
        assert_eq!(marker, [0xa7; 4]);
    }

    #[test]
    fn force_default_discards_contents() {
        let mut device = device();
        device.write(1, 0x20, &[0x00; 4]).unwrap();

        let inst = device.instance;
        let mut device = FvbDevice::new(inst, FVB_OFFSET, &layout(), true).unwrap();

        let mut marker = [0u8; 4];
        device.read(1, 0x20, &mut marker).unwrap();
        assert_eq!(marker, [0xff; 4]);
    }

    #[test]
    fn reads_and_writes_must_stay_inside_one_block() {
        let mut device = device();
        let mut buffer = [0u8; 0x10];

        assert_eq!(device.read(0, BLOCK as usize, &mut buffer), Err(EfiError::BadBufferSize));
        assert_eq!(device.read(0, BLOCK as usize - 8, &mut buffer), Err(EfiError::BadBufferSize));
        assert_eq!(device.read(0, 0, &mut []), Err(EfiError::BadBufferSize));
        assert_eq!(device.write(99, 0, &buffer), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn write_goes_through_to_flash_and_cache() {
        let mut device = device();
        device.erase_blocks(&[(2, 1)]).unwrap();
        device.write(2, 0x100, &[0x42; 8]).unwrap();

        // Cache view.
        let mut cached = [0u8; 8];
        device.read(2, 0x100, &mut cached).unwrap();
        assert_eq!(cached, [0x42; 8]);

        // Physical view, bypassing the cache.
        let mut physical = [0u8; 8];
        let rel = FVB_OFFSET - REGION_BASE as u64 + 2 * BLOCK as u64 + 0x100;
        device.instance_mut().read_bytes(rel, &mut physical).unwrap();
        assert_eq!(physical, [0x42; 8]);
    }

    #[test]
    fn erase_blocks_validates_the_whole_list_first() {
        let mut device = device();
        device.erase_blocks(&[(1, 1)]).unwrap();
        device.write(1, 0, &[0x21; 4]).unwrap();

        // Second range is invalid: nothing may be erased, including the
        // valid first range.
        let last = device.last_block();
        assert_eq!(device.erase_blocks(&[(1, 1), (last, 2)]), Err(EfiError::InvalidParameter));
        assert_eq!(device.erase_blocks(&[(1, 0)]), Err(EfiError::InvalidParameter));

        let mut marker = [0u8; 4];
        device.read(1, 0, &mut marker).unwrap();
        assert_eq!(marker, [0x21; 4]);
    }

    #[test]
    fn attributes_and_geometry_queries() {
        let device = device();
        assert!(device.get_attributes().contains(FvbAttributes::ERASE_POLARITY));
        assert_eq!(device.get_physical_address(), FVB_OFFSET);

        let (size, remaining) = device.get_block_size(0).unwrap();
        assert_eq!(size, BLOCK);
        assert_eq!(remaining, device.last_block() + 1);
        assert!(device.get_block_size(device.last_block() + 1).is_err());
    }

    #[test]
    fn set_attributes_is_unsupported() {
        let mut device = device();
        assert_eq!(device.set_attributes(FvbAttributes::READ_STATUS), Err(EfiError::Unsupported));
    }
}
