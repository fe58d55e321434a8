//! SPI-NOR device codec.
//!
//! Every mutating operation follows the same bracket:
//!
//! ```text
//! WRITE_ENABLE -> verify WEL set -> opcode -> poll WIP clear -> WRITE_DISABLE -> verify WEL clear
//! ```
//!
//! A latch-verification failure is a `DeviceError`; an expired ready-poll is
//! a `Timeout`. Transfers split at page boundaries with the bracket repeated
//! per chunk so one failed chunk never leaves more than a page in doubt.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use fwstore::error::{EfiError, Result};
use fwstore_hal::Delay;
use fwstore_spi::{AddrWidth, OpConfig, SpiMaster};

use crate::info::{self, NorFlashFlags, NorFlashInfo};
use crate::ops;
use crate::ops::StatusRegister;

/// Status register poll interval, in us.
const CHECK_INTERVAL_US: u32 = 100;

/// Maximum 4K sector erase time of GD25LB512ME is 700 ms in -40 ~ 125
/// celsius. 2 seconds covers slower parts with margin.
const MAX_READY_WAIT_US: u32 = 2_000_000;

/// Whole-chip erase runs minutes on large parts.
const CHIP_ERASE_WAIT_US: u32 = 240_000_000;

/// One probed SPI-NOR device bound to its transport.
///
/// The device exclusively owns its transport handle; all access to the chip
/// goes through this codec.
pub struct SpiNor<B: SpiMaster, D: Delay> {
    bus: B,
    delay: D,
    info: &'static NorFlashInfo,
    op: OpConfig,
}

impl<B: SpiMaster, D: Delay> SpiNor<B, D> {
    /// Read the JEDEC ID and bind the transport to the matching device
    /// entry. Fails with `NotFound` for an unrecognized ID.
    pub fn probe(mut bus: B, delay: D) -> Result<Self> {
        let mut id = [0u8; ops::MAX_ID_LEN];
        bus.read_register(ops::RDID, &mut id).inspect_err(|e| {
            log::error!("spi-nor: error while reading id: {e:?}");
        })?;

        let info = info::lookup(&id).inspect_err(|_| {
            log::error!("spi-nor: unrecognized JEDEC id bytes: {:02x}{:02x}{:02x}", id[0], id[1], id[2]);
        })?;

        let op = OpConfig {
            addr_width: AddrWidth::Three,
            read_opcode: ops::READ,
            program_opcode: ops::PP,
            erase_opcode: erase_opcode(info.flags, false),
            read_dummy: 0,
            page_size: info.page_size,
        };

        Ok(Self { bus, delay, info, op })
    }

    /// Select the addressing mode and opcode set, then initialize the
    /// status register. Runs once after [`probe`](Self::probe).
    pub fn init(&mut self) -> Result<()> {
        if self.info.flags.contains(NorFlashFlags::ADDR_4B) {
            self.bus.write_register(ops::EN4B, &[]).inspect_err(|e| {
                log::error!("spi-nor: enter 4-byte mode: {e:?}");
            })?;

            self.op.addr_width = AddrWidth::Four;
            self.op.read_opcode = ops::READ_4B;
            self.op.program_opcode = ops::PP_4B;
            self.op.erase_opcode = erase_opcode(self.info.flags, true);
        }

        // Clear the block-protect bits so the device is writable.
        self.write_status(&[0])?;

        Ok(())
    }

    pub fn info(&self) -> &'static NorFlashInfo {
        self.info
    }

    pub fn op_config(&self) -> &OpConfig {
        &self.op
    }

    /// Total device size in bytes.
    pub fn size(&self) -> u64 {
        self.info.size()
    }

    /// Erase granularity for [`erase`](Self::erase).
    pub fn erase_size(&self) -> u32 {
        self.info.erase_size()
    }

    /// Raw JEDEC ID bytes.
    pub fn read_id(&mut self) -> Result<[u8; ops::MAX_ID_LEN]> {
        let mut id = [0u8; ops::MAX_ID_LEN];
        self.bus.read_register(ops::RDID, &mut id)?;
        Ok(id)
    }

    pub fn read_status(&mut self) -> Result<StatusRegister> {
        let mut sr = [0u8; 1];
        self.bus.read_register(ops::RDSR, &mut sr).inspect_err(|e| {
            log::error!("spi-nor: read the status register: {e:?}");
        })?;
        Ok(StatusRegister::from_bits_truncate(sr[0]))
    }

    /// Wait for a predefined amount of time for the flash to be ready, or
    /// timeout occurs.
    fn wait_till_ready_budget(&mut self, budget_us: u32) -> Result<()> {
        for _ in 0..=budget_us / CHECK_INTERVAL_US {
            self.delay.stall_us(CHECK_INTERVAL_US);

            if !self.read_status()?.contains(StatusRegister::WIP) {
                return Ok(());
            }
        }
        log::error!("spi-nor: flash is not ready for new commands");
        Err(EfiError::Timeout)
    }

    fn wait_till_ready(&mut self) -> Result<()> {
        self.wait_till_ready_budget(MAX_READY_WAIT_US)
    }

    fn write_enable(&mut self) -> Result<()> {
        self.bus.write_register(ops::WREN, &[]).inspect_err(|e| {
            log::error!("spi-nor: error while write enable: {e:?}");
        })?;

        let status = self.read_status()?;
        if !status.contains(StatusRegister::WEL) {
            log::error!("spi-nor: write enable failed, get status: {:#x}", status.bits());
            Err(EfiError::DeviceError)?;
        }
        Ok(())
    }

    fn write_disable(&mut self) -> Result<()> {
        self.bus.write_register(ops::WRDI, &[]).inspect_err(|e| {
            log::error!("spi-nor: error while write disable: {e:?}");
        })?;

        let status = self.read_status()?;
        if status.contains(StatusRegister::WEL) {
            log::error!("spi-nor: write disable failed, get status: {:#x}", status.bits());
            Err(EfiError::DeviceError)?;
        }
        Ok(())
    }

    /// Write the status register with the full enable/poll/disable bracket.
    pub fn write_status(&mut self, value: &[u8]) -> Result<()> {
        self.write_enable()?;
        self.bus.write_register(ops::WRSR, value).inspect_err(|e| {
            log::error!("spi-nor: write status register: {e:?}");
        })?;
        self.wait_till_ready()?;
        self.write_disable()?;
        Ok(())
    }

    /// Read `buffer.len()` bytes starting at `offset`, split at page
    /// boundaries.
    pub fn read_data(&mut self, offset: u32, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() {
            log::error!("spi-nor: read length is zero");
            Err(EfiError::InvalidParameter)?;
        }

        let page_size = self.info.page_size;
        let mut index = 0;
        while index < buffer.len() {
            let address = offset + index as u32;
            let page_offset = address % page_size;
            let page_remain = ((page_size - page_offset) as usize).min(buffer.len() - index);

            self.bus.read_data(&self.op, address, &mut buffer[index..index + page_remain]).inspect_err(
                |e| {
                    log::error!("spi-nor: read data from flash memory: {e:?}");
                },
            )?;

            index += page_remain;
        }

        Ok(())
    }

    /// Program `buffer` starting at `offset`. Each page-sized chunk is
    /// independently write-enabled, programmed and polled ready, so a chunk
    /// failure bounds the damage to one page.
    pub fn write_data(&mut self, offset: u32, buffer: &[u8]) -> Result<()> {
        if buffer.is_empty() {
            log::error!("spi-nor: write length is zero");
            Err(EfiError::InvalidParameter)?;
        }

        let page_size = self.info.page_size;
        let mut index = 0;
        while index < buffer.len() {
            let address = offset + index as u32;
            let page_offset = address % page_size;
            let page_remain = ((page_size - page_offset) as usize).min(buffer.len() - index);

            self.write_enable()?;

            self.bus.write_data(&self.op, address, &buffer[index..index + page_remain]).inspect_err(|e| {
                log::error!("spi-nor: write data: {e:?}");
            })?;

            self.wait_till_ready()?;

            index += page_remain;
        }

        self.write_disable()?;

        Ok(())
    }

    /// Erase `length` bytes starting at `offset`. Both must be aligned to
    /// the erase granularity; a misaligned request fails with
    /// `InvalidParameter` before any hardware operation.
    pub fn erase(&mut self, offset: u32, length: u32) -> Result<()> {
        if length == 0 {
            log::error!("spi-nor: erase length is zero");
            Err(EfiError::InvalidParameter)?;
        }

        let erase_size = self.erase_size();
        if offset % erase_size != 0 || length % erase_size != 0 {
            log::error!("spi-nor: erase offset/length not aligned to the erase sector size ({erase_size:#x})");
            Err(EfiError::InvalidParameter)?;
        }

        let sectors = length / erase_size;
        log::debug!("spi-nor: start erasing {sectors} sectors, each {erase_size} bytes");

        for sector in 0..sectors {
            let address = offset + sector * erase_size;

            self.write_enable()?;

            self.bus.erase_sector(&self.op, address).inspect_err(|e| {
                log::error!("spi-nor: erase sector: {e:?}");
            })?;

            self.wait_till_ready()?;
        }

        self.write_disable()?;

        Ok(())
    }

    /// Single whole-device erase with a much longer timeout budget.
    pub fn erase_chip(&mut self) -> Result<()> {
        let saved = self.op.erase_opcode;
        self.op.erase_opcode = ops::CHIP_ERASE;

        let result = (|| {
            self.write_enable()?;
            self.bus.erase_sector(&self.op, 0).inspect_err(|e| {
                log::error!("spi-nor: chip erase: {e:?}");
            })?;
            self.wait_till_ready_budget(CHIP_ERASE_WAIT_US)?;
            self.write_disable()
        })();

        self.op.erase_opcode = saved;
        result
    }

    /// Issue the soft-reset sequence.
    pub fn soft_reset(&mut self) -> Result<()> {
        self.bus.write_register(ops::SRSTEN, &[]).inspect_err(|e| {
            log::error!("spi-nor: enable soft reset: {e:?}");
        })?;
        self.bus.write_register(ops::SRST, &[]).inspect_err(|e| {
            log::error!("spi-nor: soft reset: {e:?}");
        })?;

        // Reset is not instant and the time varies from flash to flash;
        // most parts settle somewhere below 100 microseconds.
        self.delay.stall_us(200);

        Ok(())
    }

    /// Protect or unprotect the whole device.
    ///
    /// Combines the block-protect and status-register-protect bits with the
    /// external write-protect pin, and re-reads the status register after
    /// every change. A readback mismatch — including a protection setup the
    /// device silently ignored — is a `DeviceError`.
    pub fn set_protect_all(&mut self, protect: bool) -> Result<()> {
        let protect_bits = StatusRegister::BP2 | StatusRegister::BP3 | StatusRegister::SRP0;

        // Raise the WP pin level to unlock the status register.
        self.bus.set_write_protect(true)?;

        let status = self.read_status()?;

        if protect {
            let mut locked_value = status;
            if !status.contains(protect_bits) {
                // BP2+BP3 protect all blocks; SRP0 arms hardware protection
                // of the status register itself.
                locked_value = status | protect_bits;
                self.write_status(&[locked_value.bits()])?;

                let readback = self.read_status()?;
                if readback != locked_value {
                    log::error!("spi-nor: write status register fail");
                    Err(EfiError::DeviceError)?;
                }
            }

            // Drop the WP pin. With SRP0 set and WP low the status register
            // must reject writes; prove it with a clearing attempt.
            self.bus.set_write_protect(false)?;

            let probe = locked_value - protect_bits;
            self.write_status(&[probe.bits()])?;

            let readback = self.read_status()?;
            if readback != locked_value {
                log::error!(
                    "spi-nor: status register lock test fail, changed from {:#x} to {:#x}",
                    locked_value.bits(),
                    readback.bits()
                );
                Err(EfiError::DeviceError)?;
            }
        } else if status.intersects(protect_bits) {
            let cleared = status - protect_bits;
            self.write_status(&[cleared.bits()])?;

            let readback = self.read_status()?;
            if readback != cleared {
                log::error!("spi-nor: status register clear fail");
                Err(EfiError::DeviceError)?;
            }
        }

        Ok(())
    }
}

fn erase_opcode(flags: NorFlashFlags, four_byte: bool) -> u8 {
    if flags.contains(NorFlashFlags::ERASE_4K) {
        if four_byte { ops::BE_4K_4B } else { ops::BE_4K }
    } else if flags.contains(NorFlashFlags::ERASE_32K) && !four_byte {
        ops::BE_32K
    } else if four_byte {
        ops::SE_4B
    } else {
        ops::SE
    }
}
