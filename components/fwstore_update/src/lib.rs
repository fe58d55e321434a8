//! A/B firmware-update storage manager.
//!
//! Firmware images live in two redundant banks on a block device. Updates
//! are written to the inactive bank and become the boot target only when the
//! update transaction commits; a trial boot from the new bank must be
//! explicitly accepted before it is trusted, and rollback restores the
//! previous bank at any point. The metadata recording bank state is itself
//! stored ping-pong with a sequence number and CRC so a torn write can never
//! take out the last known-good configuration — a failed commit leaves the
//! previously verified bank bootable, which is the invariant everything else
//! here exists to protect.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod device;
pub mod dirty;
pub mod metadata;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use device::{FwsConfig, FwsDevice, ImageFile, OpType, ReleaseProgress, VendorFlags};
pub use metadata::{FwsMetadata, ImageType};
