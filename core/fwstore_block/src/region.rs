//! Flash region classification.
//!
//! Regions are classified purely by containment against the configured
//! variable-storage and firmware-update geometry. A region matches at most
//! one classification; anything else is skipped without creating an
//! instance.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Configured flash geometry for the platform.
///
/// Each storage area carries both a 32-bit and a 64-bit base; the 64-bit
/// value wins when non-zero. Sizes of zero disable the area.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashLayout {
    pub variable_base: u32,
    pub variable_base64: u64,
    pub variable_size: u32,
    pub ftw_working_size: u32,
    pub ftw_spare_size: u32,
    pub fwu_base: u32,
    pub fwu_base64: u64,
    pub fwu_size: u32,
}

impl FlashLayout {
    pub fn variable_storage_base(&self) -> u64 {
        if self.variable_base64 != 0 { self.variable_base64 } else { self.variable_base as u64 }
    }

    pub fn firmware_update_base(&self) -> u64 {
        if self.fwu_base64 != 0 { self.fwu_base64 } else { self.fwu_base as u64 }
    }

    /// Total size of the variable firmware volume: variable store plus both
    /// fault-tolerant-write areas, laid out contiguously.
    pub fn variable_fv_size(&self) -> u32 {
        self.variable_size + self.ftw_working_size + self.ftw_spare_size
    }
}

/// Role of one flash region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    VariableStorage,
    FirmwareUpdate,
    /// No recognized classification; the region gets no instance.
    Unknown,
}

/// Check whether the region contains the variable storage area.
pub fn is_variable_storage_region(layout: &FlashLayout, region_base: u64, size: u64) -> bool {
    let base = layout.variable_storage_base();
    region_base <= base && base + layout.variable_fv_size() as u64 <= region_base + size
}

/// Check whether the region contains the firmware update storage area.
pub fn is_firmware_update_storage_region(layout: &FlashLayout, region_base: u64, size: u64) -> bool {
    let base = layout.firmware_update_base();
    region_base <= base && base + layout.fwu_size as u64 <= region_base + size
}

/// Classify one region. Unrecognized regions are reported once in the log
/// and otherwise skipped; this never surfaces as an error.
pub fn classify(layout: &FlashLayout, region_base: u64, size: u64) -> RegionKind {
    if is_variable_storage_region(layout, region_base, size) {
        RegionKind::VariableStorage
    } else if is_firmware_update_storage_region(layout, region_base, size) {
        RegionKind::FirmwareUpdate
    } else {
        log::warn!("nor-flash: region {region_base:#x}+{size:#x} matches no storage classification, skipping");
        RegionKind::Unknown
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn layout() -> FlashLayout {
        FlashLayout {
            variable_base: 0,
            variable_base64: 0x10_0000,
            variable_size: 0x10000,
            ftw_working_size: 0x10000,
            ftw_spare_size: 0x20000,
            fwu_base: 0,
            fwu_base64: 0x40_0000,
            fwu_size: 0x80000,
        }
    }

    #[test]
    fn containment_classifies_each_region_once() {
        let layout = layout();
        assert_eq!(classify(&layout, 0x10_0000, 0x40000), RegionKind::VariableStorage);
        assert_eq!(classify(&layout, 0x40_0000, 0x80000), RegionKind::FirmwareUpdate);
        assert_eq!(classify(&layout, 0x80_0000, 0x10000), RegionKind::Unknown);
    }

    #[test]
    fn classifications_are_disjoint_for_disjoint_layouts() {
        let layout = layout();
        // Sweep a grid of candidate regions; no region may satisfy both
        // predicates when the configured areas do not overlap.
        for base in (0u64..0x100_0000).step_by(0x4_0000) {
            for size in [0x1_0000u64, 0x8_0000, 0x10_0000] {
                let var = is_variable_storage_region(&layout, base, size);
                let fwu = is_firmware_update_storage_region(&layout, base, size);
                assert!(!(var && fwu), "region {base:#x}+{size:#x} classified twice");
            }
        }
    }

    #[test]
    fn thirty_two_bit_base_is_used_when_wide_base_is_zero() {
        let mut layout = layout();
        layout.variable_base64 = 0;
        layout.variable_base = 0x20_0000;
        assert_eq!(classify(&layout, 0x20_0000, 0x40000), RegionKind::VariableStorage);
        assert_eq!(classify(&layout, 0x10_0000, 0x40000), RegionKind::Unknown);
    }

    #[test]
    fn undersized_region_is_not_classified() {
        let layout = layout();
        // Region starts at the right base but cannot contain the whole area.
        assert_eq!(classify(&layout, 0x10_0000, 0x1000), RegionKind::Unknown);
    }
}
