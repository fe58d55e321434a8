//! On-flash partition directory scan.
//!
//! The first-stage loader leaves a directory of magic-tagged records at a
//! fixed flash address, mapping named images to flash offsets. This module
//! walks the directory to locate the variable-store image; a corrupt or
//! absent directory degrades to a computed default offset so the firmware
//! still boots.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::mem;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use fwstore::error::Result;
use fwstore_hal::Delay;
use fwstore_spi::SpiMaster;

use crate::nor::SpiNor;

/// Directory record magic.
pub const DPT_MAGIC: u32 = 0x55aa_55aa;

/// Image name suffix identifying the variable-store image.
const IMAGE_SUFFIX: &str = ".fd";

/// One on-flash partition directory record.
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
#[repr(C)]
pub struct PartitionEntry {
    pub magic: U32,
    pub name: [u8; 32],
    pub offset: U32,
    pub size: U32,
    pub reserve: [u8; 4],
    pub load_address: U64,
}

impl PartitionEntry {
    /// The record name up to the first NUL, if it is valid ASCII.
    pub fn name(&self) -> Option<&str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).ok()
    }
}

/// Where the directory lives and what to fall back to without one.
#[derive(Debug, Clone, Copy)]
pub struct PartitionTableConfig {
    /// Flash address of the first directory record.
    pub table_address: u32,
    /// Flash offset of the boot firmware image, used when the directory is
    /// absent or corrupt.
    pub fd_offset: u32,
    /// Size of the early-boot firmware volume that precedes the variable
    /// store inside the image.
    pub dxe_fv_size: u32,
}

impl<B: SpiMaster, D: Delay> SpiNor<B, D> {
    /// Locate the variable store by scanning the partition directory.
    ///
    /// Records are read sequentially from the configured address until the
    /// first one whose name carries the variable-store suffix. A record with
    /// a bad magic terminates the scan: nothing past it is read, and the
    /// computed default offset is returned instead of an error.
    pub fn variable_store_offset(&mut self, config: &PartitionTableConfig) -> Result<u64> {
        let mut address = config.table_address;
        let mut raw = [0u8; mem::size_of::<PartitionEntry>()];

        loop {
            self.read_data(address, &mut raw).inspect_err(|e| {
                log::error!("spi-nor: read partition table: {e:?}");
            })?;

            let entry = PartitionEntry::read_from_bytes(&raw).unwrap();

            if entry.magic.get() != DPT_MAGIC {
                log::warn!("spi-nor: bad partition table magic, using default variable offset");
                return Ok(config.fd_offset as u64 + config.dxe_fv_size as u64);
            }

            if let Some(name) = entry.name() {
                if name.ends_with(IMAGE_SUFFIX) {
                    log::info!(
                        "spi-nor: {} found at flash offset {:#x}, load address {:#x}, size {:#x}",
                        name,
                        entry.offset.get(),
                        entry.load_address.get(),
                        entry.size.get()
                    );
                    return Ok(entry.offset.get() as u64 + config.dxe_fv_size as u64);
                }
            }

            address += mem::size_of::<PartitionEntry>() as u32;
        }
    }
}
