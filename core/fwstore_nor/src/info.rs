//! Known SPI-NOR device table keyed by JEDEC ID.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use bitflags::bitflags;
use fwstore::error::{EfiError, Result};

bitflags! {
    /// Device capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NorFlashFlags: u8 {
        /// Device supports 4 KiB block erase.
        const ERASE_4K = 1 << 0;
        /// Device supports 32 KiB block erase.
        const ERASE_32K = 1 << 1;
        /// Device requires 4-byte addressing.
        const ADDR_4B = 1 << 2;
    }
}

/// Geometry and capabilities of one SPI-NOR part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NorFlashInfo {
    pub name: &'static str,
    pub id: [u8; 3],
    /// Program page size in bytes.
    pub page_size: u32,
    /// Uniform sector size in bytes.
    pub sector_size: u32,
    pub sector_count: u32,
    pub flags: NorFlashFlags,
}

impl NorFlashInfo {
    /// Total device size in bytes.
    pub fn size(&self) -> u64 {
        self.sector_size as u64 * self.sector_count as u64
    }

    /// Smallest erase granularity the device supports.
    pub fn erase_size(&self) -> u32 {
        if self.flags.contains(NorFlashFlags::ERASE_4K) {
            0x1000
        } else if self.flags.contains(NorFlashFlags::ERASE_32K) {
            0x8000
        } else {
            self.sector_size
        }
    }
}

const F: NorFlashFlags = NorFlashFlags::empty();
const E4K: NorFlashFlags = NorFlashFlags::ERASE_4K;
const A4B: NorFlashFlags = NorFlashFlags::ADDR_4B;

#[rustfmt::skip]
static NOR_FLASH_IDS: &[NorFlashInfo] = &[
    NorFlashInfo { name: "gd25q64b",     id: [0xc8, 0x40, 0x17], page_size: 256, sector_size: 0x10000, sector_count: 128,  flags: E4K },
    NorFlashInfo { name: "gd25q128b",    id: [0xc8, 0x40, 0x18], page_size: 256, sector_size: 0x10000, sector_count: 256,  flags: E4K },
    NorFlashInfo { name: "gd25lb512me",  id: [0xc8, 0x67, 0x1a], page_size: 256, sector_size: 0x10000, sector_count: 1024, flags: E4K.union(A4B) },
    NorFlashInfo { name: "w25q64cv",     id: [0xef, 0x40, 0x17], page_size: 256, sector_size: 0x10000, sector_count: 128,  flags: E4K },
    NorFlashInfo { name: "w25q128bv",    id: [0xef, 0x40, 0x18], page_size: 256, sector_size: 0x10000, sector_count: 256,  flags: E4K },
    NorFlashInfo { name: "w25q256",      id: [0xef, 0x40, 0x19], page_size: 256, sector_size: 0x10000, sector_count: 512,  flags: E4K.union(A4B) },
    NorFlashInfo { name: "mx25l25635e",  id: [0xc2, 0x20, 0x19], page_size: 256, sector_size: 0x10000, sector_count: 512,  flags: A4B },
    NorFlashInfo { name: "n25q256a",     id: [0x20, 0xba, 0x19], page_size: 256, sector_size: 0x10000, sector_count: 512,  flags: E4K.union(A4B) },
    NorFlashInfo { name: "is25lp256",    id: [0x9d, 0x60, 0x19], page_size: 256, sector_size: 0x10000, sector_count: 512,  flags: A4B },
    NorFlashInfo { name: "s25fl116k",    id: [0x01, 0x40, 0x15], page_size: 256, sector_size: 0x10000, sector_count: 32,   flags: F },
];

/// Look up device info for the JEDEC ID bytes returned by RDID.
///
/// Only the first three bytes (manufacturer + device) participate in the
/// match; extended ID bytes are ignored.
pub fn lookup(id: &[u8]) -> Result<&'static NorFlashInfo> {
    if id.len() < 3 {
        Err(EfiError::InvalidParameter)?;
    }
    NOR_FLASH_IDS.iter().find(|info| info.id == id[..3]).ok_or(EfiError::NotFound)
}
