//! In-memory SPI-NOR flash model.
//!
//! Implements [`SpiMaster`] over a plain byte vector with real NOR
//! semantics: erase sets bits, programming only clears them, and mutating
//! operations silently do nothing unless the write-enable latch is set.
//! The codec's bracketing bugs therefore show up as data corruption or
//! failed latch verification instead of passing silently.
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
use fwstore_spi::{OpConfig, SpiMaster};

use crate::ops;
use crate::ops::StatusRegister;

const ERASED: u8 = 0xff;

/// Simulated flash device.
pub struct SimFlash {
    memory: Vec<u8>,
    status: StatusRegister,
    id: [u8; 3],
    erase_size: usize,
    wp_level_high: bool,
    four_byte_mode: bool,
    /// Opcode trace of every command and data operation issued, in order.
    pub history: Vec<u8>,
    /// Test knob: ignore WREN so the latch never sets.
    pub fail_write_enable: bool,
    /// Test knob: silently drop status-register writes.
    pub fail_status_writes: bool,
    /// Test knob: report WIP forever.
    pub stuck_busy: bool,
}

impl SimFlash {
    pub fn new(size: usize, erase_size: usize, id: [u8; 3]) -> Self {
        Self {
            memory: vec![ERASED; size],
            status: StatusRegister::empty(),
            id,
            erase_size,
            wp_level_high: false,
            four_byte_mode: false,
            history: Vec::new(),
            fail_write_enable: false,
            fail_status_writes: false,
            stuck_busy: false,
        }
    }

    pub fn contents(&self) -> &[u8] {
        &self.memory
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn status(&self) -> StatusRegister {
        self.status
    }

    pub fn four_byte_mode(&self) -> bool {
        self.four_byte_mode
    }

    fn status_locked(&self) -> bool {
        self.status.contains(StatusRegister::SRP0) && !self.wp_level_high
    }

    fn check_range(&self, offset: u32, len: usize) -> Result<()> {
        if offset as usize + len > self.memory.len() {
            Err(EfiError::DeviceError)?;
        }
        Ok(())
    }
}

impl SpiMaster for SimFlash {
    fn read_register(&mut self, opcode: u8, buffer: &mut [u8]) -> Result<()> {
        match opcode {
            ops::RDID => {
                for (index, byte) in buffer.iter_mut().enumerate() {
                    *byte = *self.id.get(index).unwrap_or(&0);
                }
            }
            ops::RDSR => {
                let mut status = self.status;
                if self.stuck_busy {
                    status |= StatusRegister::WIP;
                }
                buffer.fill(0);
                if let Some(first) = buffer.first_mut() {
                    *first = status.bits();
                }
            }
            _ => buffer.fill(0),
        }
        Ok(())
    }

    fn write_register(&mut self, opcode: u8, buffer: &[u8]) -> Result<()> {
        self.history.push(opcode);
        match opcode {
            ops::WREN => {
                if !self.fail_write_enable {
                    self.status |= StatusRegister::WEL;
                }
            }
            ops::WRDI => {
                self.status -= StatusRegister::WEL;
            }
            ops::WRSR => {
                if self.status.contains(StatusRegister::WEL)
                    && !self.status_locked()
                    && !self.fail_status_writes
                {
                    let value = StatusRegister::from_bits_truncate(*buffer.first().unwrap_or(&0));
                    self.status = value - StatusRegister::WIP - StatusRegister::WEL;
                }
                // The latch auto-clears when the write cycle completes.
                self.status -= StatusRegister::WEL;
            }
            ops::EN4B => self.four_byte_mode = true,
            ops::EX4B => self.four_byte_mode = false,
            _ => {}
        }
        Ok(())
    }

    fn read_data(&mut self, _op: &OpConfig, from: u32, buffer: &mut [u8]) -> Result<()> {
        self.check_range(from, buffer.len())?;
        let from = from as usize;
        buffer.copy_from_slice(&self.memory[from..from + buffer.len()]);
        Ok(())
    }

    fn write_data(&mut self, op: &OpConfig, to: u32, buffer: &[u8]) -> Result<()> {
        self.history.push(op.program_opcode);
        self.check_range(to, buffer.len())?;
        if !self.status.contains(StatusRegister::WEL) {
            // A program without the latch set is ignored by the device.
            return Ok(());
        }
        let to = to as usize;
        for (cell, byte) in self.memory[to..to + buffer.len()].iter_mut().zip(buffer) {
            *cell &= *byte;
        }
        self.status -= StatusRegister::WEL;
        Ok(())
    }

    fn erase_sector(&mut self, op: &OpConfig, offset: u32) -> Result<()> {
        self.history.push(op.erase_opcode);
        if !self.status.contains(StatusRegister::WEL) {
            return Ok(());
        }
        if op.erase_opcode == ops::CHIP_ERASE {
            self.memory.fill(ERASED);
        } else {
            self.check_range(offset, self.erase_size)?;
            let offset = offset as usize;
            self.memory[offset..offset + self.erase_size].fill(ERASED);
        }
        self.status -= StatusRegister::WEL;
        Ok(())
    }

    fn set_write_protect(&mut self, level_high: bool) -> Result<()> {
        self.wp_level_high = level_high;
        Ok(())
    }
}
