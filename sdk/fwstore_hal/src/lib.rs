//! Hardware access seams for the fwstore storage stack.
//!
//! The flash transports only touch hardware through the traits in this
//! crate: memory-mapped register access, a microsecond stall, and a
//! monotonic clock for bounded-time commits. Production firmware supplies
//! [`PhysMmio`] (raw volatile access at identity-mapped physical addresses);
//! tests supply mocks or register models.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

/// Memory-mapped register access at physical addresses.
///
/// Reads and writes are strongly ordered with respect to subsequent accesses
/// of the same address; implementations must not cache or reorder them.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Mmio {
    fn read8(&self, address: usize) -> u8;
    fn read16(&self, address: usize) -> u16;
    fn read32(&self, address: usize) -> u32;
    fn write8(&self, address: usize, value: u8);
    fn write16(&self, address: usize, value: u16);
    fn write32(&self, address: usize, value: u32);
}

/// Busy-wait stall with microsecond granularity.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Delay {
    fn stall_us(&self, microseconds: u32);
}

/// Monotonic time source used for cooperative time-slice budgets.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait Clock {
    fn nanoseconds(&self) -> u64;
}

/// Volatile register access at identity-mapped physical addresses.
///
/// This is the production implementation used when the stack runs in a
/// firmware environment where device registers are mapped 1:1.
#[derive(Debug, Default, Clone, Copy)]
pub struct PhysMmio;

impl Mmio for PhysMmio {
    fn read8(&self, address: usize) -> u8 {
        // Safety: caller guarantees the address maps a device register.
        unsafe { core::ptr::read_volatile(address as *const u8) }
    }

    fn read16(&self, address: usize) -> u16 {
        unsafe { core::ptr::read_volatile(address as *const u16) }
    }

    fn read32(&self, address: usize) -> u32 {
        unsafe { core::ptr::read_volatile(address as *const u32) }
    }

    fn write8(&self, address: usize, value: u8) {
        unsafe { core::ptr::write_volatile(address as *mut u8, value) }
    }

    fn write16(&self, address: usize, value: u16) {
        unsafe { core::ptr::write_volatile(address as *mut u16, value) }
    }

    fn write32(&self, address: usize, value: u32) {
        unsafe { core::ptr::write_volatile(address as *mut u32, value) }
    }
}

/// A [`Delay`] that spins without sleeping. Suitable for hosts where the
/// poll interval already dominates, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDelay;

impl Delay for NullDelay {
    fn stall_us(&self, _microseconds: u32) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phys_mmio_round_trips_through_memory() {
        let mut word: u32 = 0;
        let address = &mut word as *mut u32 as usize;
        let mmio = PhysMmio;

        mmio.write32(address, 0xa5a5_5a5a);
        assert_eq!(mmio.read32(address), 0xa5a5_5a5a);
        mmio.write8(address, 0xff);
        assert_eq!(mmio.read8(address), 0xff);
    }

    #[test]
    fn mock_mmio_records_expectations() {
        let mut mmio = MockMmio::new();
        mmio.expect_read32().withf(|addr| *addr == 0x1000).return_const(7u32);
        assert_eq!(mmio.read32(0x1000), 7);
    }
}
