//! Cadence-style QSPI transport with indirect read/write engine.
//!
//! Short register transfers go through the software-triggered (STIG) command
//! path, which moves up to eight bytes through a pair of data registers.
//! Bulk transfers use the indirect engine: a trigger register starts a
//! hardware FSM that streams data between the flash and an internal SRAM
//! exposed through an AHB window, while the driver polls the SRAM fill level
//! and copies chunks in or out.
//!
//! The read-data-capture delay is board and clock dependent and is derived at
//! setup time by [`CadenceQspi::calibrate`], not hardcoded.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use fwstore::error::{EfiError, Result};
use fwstore_hal::{Delay, Mmio};

use crate::{LockPolicy, OpConfig, SpiMaster};

mod regs {
    pub const CONFIG: usize = 0x00;
    pub const CONFIG_ENABLE: u32 = 1 << 0;
    pub const CONFIG_BAUD_LSB: u32 = 19;
    pub const CONFIG_BAUD_MASK: u32 = 0xf;
    pub const CONFIG_IDLE_LSB: u32 = 31;

    pub const RD_INSTR: usize = 0x04;
    pub const RD_INSTR_OPCODE_LSB: u32 = 0;
    pub const RD_INSTR_DUMMY_LSB: u32 = 24;

    pub const WR_INSTR: usize = 0x08;
    pub const WR_INSTR_OPCODE_LSB: u32 = 0;

    pub const DELAY: usize = 0x0c;
    pub const DELAY_TSLCH_LSB: u32 = 0;
    pub const DELAY_TCHSH_LSB: u32 = 8;
    pub const DELAY_TSD2D_LSB: u32 = 16;
    pub const DELAY_TSHSL_LSB: u32 = 24;
    pub const DELAY_FIELD_MASK: u32 = 0xff;

    pub const RD_DATA_CAPTURE: usize = 0x10;
    pub const RD_DATA_CAPTURE_BYPASS: u32 = 1 << 0;
    pub const RD_DATA_CAPTURE_DELAY_LSB: u32 = 1;
    pub const RD_DATA_CAPTURE_DELAY_MASK: u32 = 0xf;

    pub const SIZE: usize = 0x14;
    pub const SIZE_ADDRESS_MASK: u32 = 0xf;

    pub const SDRAMLEVEL: usize = 0x2c;
    pub const SDRAMLEVEL_RD_LSB: u32 = 0;
    pub const SDRAMLEVEL_RD_MASK: u32 = 0xffff;
    pub const SDRAMLEVEL_WR_LSB: u32 = 16;
    pub const SDRAMLEVEL_WR_MASK: u32 = 0xffff;

    pub const INDIRECTRD: usize = 0x60;
    pub const INDIRECTRD_START: u32 = 1 << 0;
    pub const INDIRECTRD_CANCEL: u32 = 1 << 1;
    pub const INDIRECTRD_DONE: u32 = 1 << 5;

    pub const INDIRECTRDSTARTADDR: usize = 0x68;
    pub const INDIRECTRDBYTES: usize = 0x6c;

    pub const INDIRECTWR: usize = 0x70;
    pub const INDIRECTWR_START: u32 = 1 << 0;
    pub const INDIRECTWR_CANCEL: u32 = 1 << 1;
    pub const INDIRECTWR_DONE: u32 = 1 << 5;

    pub const INDIRECTWRSTARTADDR: usize = 0x78;
    pub const INDIRECTWRBYTES: usize = 0x7c;

    pub const CMDCTRL: usize = 0x90;
    pub const CMDCTRL_EXECUTE: u32 = 1 << 0;
    pub const CMDCTRL_INPROGRESS: u32 = 1 << 1;
    pub const CMDCTRL_WR_BYTES_LSB: u32 = 12;
    pub const CMDCTRL_WR_BYTES_MASK: u32 = 0x7;
    pub const CMDCTRL_WR_EN_LSB: u32 = 15;
    pub const CMDCTRL_RD_BYTES_LSB: u32 = 20;
    pub const CMDCTRL_RD_BYTES_MASK: u32 = 0x7;
    pub const CMDCTRL_RD_EN_LSB: u32 = 23;
    pub const CMDCTRL_OPCODE_LSB: u32 = 24;

    pub const CMDREADDATALOWER: usize = 0xa0;
    pub const CMDREADDATAUPPER: usize = 0xa4;
    pub const CMDWRITEDATALOWER: usize = 0xa8;
    pub const CMDWRITEDATAUPPER: usize = 0xac;
}

const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Maximum payload of one STIG command transfer.
const STIG_DATA_LEN_MAX: usize = 8;

/// Consecutive idle observations required before the controller is
/// considered really idle.
const POLL_IDLE_RETRY: u32 = 3;

const REG_RETRY: u32 = 10_000;
const IDLE_TIMEOUT_STEPS: u32 = 5_000_000;

const MIN_HZ: u32 = 1_000_000;
const MAX_HZ: u32 = 100_000_000;

/// Read-capture delay values to probe during calibration.
const READ_CAPTURE_MAX_DELAY: u32 = 16;

/// Calibration reads the JEDEC ID; the transport owns this opcode because
/// the sweep runs before any flash device has been probed.
const OP_RDID: u8 = 0x9f;
const CALIBRATION_ID_LEN: usize = 3;

fn div_round_up(n: u32, d: u32) -> u32 {
    n.div_ceil(d)
}

/// Chip-select and inter-frame timing budgets, in nanoseconds, plus the
/// controller reference clock.
#[derive(Debug, Clone, Copy)]
pub struct QspiTiming {
    pub ref_clk_hz: u32,
    pub tshsl_ns: u32,
    pub tchsh_ns: u32,
    pub tslch_ns: u32,
    pub tsd2d_ns: u32,
}

/// Cadence-style QSPI controller instance.
pub struct CadenceQspi<M: Mmio, D: Delay> {
    mmio: M,
    delay: D,
    reg_base: usize,
    ahb_base: usize,
    fifo_width: u32,
    timing: QspiTiming,
    write_delay_ns: u32,
    policy: LockPolicy,
    lock: spin::Mutex<()>,
}

impl<M: Mmio, D: Delay> CadenceQspi<M, D> {
    pub fn new(
        mmio: M,
        delay: D,
        reg_base: usize,
        ahb_base: usize,
        fifo_width: u32,
        timing: QspiTiming,
        policy: LockPolicy,
    ) -> Self {
        // The QSPI module needs time to synchronize internally after an
        // indirect write trigger; 50 reference clock periods is enough.
        let write_delay_ns = 50 * div_round_up(NSEC_PER_SEC, timing.ref_clk_hz);
        Self {
            mmio,
            delay,
            reg_base,
            ahb_base,
            fifo_width,
            timing,
            write_delay_ns,
            policy,
            lock: spin::Mutex::new(()),
        }
    }

    /// Run the read-capture calibration and leave the controller at the
    /// target clock. Must be called once before any data-path transfer.
    pub fn setup(&mut self) -> Result<u32> {
        self.calibrate()
    }

    fn maybe_lock(&self) -> Option<spin::MutexGuard<'_, ()>> {
        match self.policy {
            LockPolicy::Shared => Some(self.lock.lock()),
            LockPolicy::Isolated => None,
        }
    }

    fn controller_enable(&self) {
        let reg = self.mmio.read32(self.reg_base + regs::CONFIG);
        self.mmio.write32(self.reg_base + regs::CONFIG, reg | regs::CONFIG_ENABLE);
    }

    fn controller_disable(&self) {
        let reg = self.mmio.read32(self.reg_base + regs::CONFIG);
        self.mmio.write32(self.reg_base + regs::CONFIG, reg & !regs::CONFIG_ENABLE);
    }

    /// Program the baud divisor and chip-select timing for `sclk_hz`.
    pub fn set_clock_speed(&mut self, sclk_hz: u32) {
        self.controller_disable();

        let mut reg = self.mmio.read32(self.reg_base + regs::CONFIG);
        reg &= !(regs::CONFIG_BAUD_MASK << regs::CONFIG_BAUD_LSB);

        let div = (div_round_up(self.timing.ref_clk_hz, sclk_hz * 2) - 1).min(regs::CONFIG_BAUD_MASK);
        log::debug!(
            "qspi: ref {} Hz sclk {} Hz div {:#x}, actual {} Hz",
            self.timing.ref_clk_hz,
            sclk_hz,
            div,
            self.timing.ref_clk_hz / (2 * (div + 1))
        );
        reg |= div << regs::CONFIG_BAUD_LSB;
        self.mmio.write32(self.reg_base + regs::CONFIG, reg);

        let ref_clk_ns = div_round_up(NSEC_PER_SEC, self.timing.ref_clk_hz);
        let sclk_ns = div_round_up(NSEC_PER_SEC, sclk_hz);

        // The controller adds a fixed number of clocks on top of the
        // programmed values; subtract them so the budgets are not doubled.
        let tshsl_ns = self.timing.tshsl_ns.saturating_sub(sclk_ns + ref_clk_ns);
        let tchsh_ns = self.timing.tchsh_ns.saturating_sub(sclk_ns + 3 * ref_clk_ns);

        let tshsl = div_round_up(tshsl_ns, ref_clk_ns) & regs::DELAY_FIELD_MASK;
        let tchsh = div_round_up(tchsh_ns, ref_clk_ns) & regs::DELAY_FIELD_MASK;
        let tslch = div_round_up(self.timing.tslch_ns, ref_clk_ns) & regs::DELAY_FIELD_MASK;
        let tsd2d = div_round_up(self.timing.tsd2d_ns, ref_clk_ns) & regs::DELAY_FIELD_MASK;

        let reg = (tshsl << regs::DELAY_TSHSL_LSB)
            | (tchsh << regs::DELAY_TCHSH_LSB)
            | (tslch << regs::DELAY_TSLCH_LSB)
            | (tsd2d << regs::DELAY_TSD2D_LSB);
        self.mmio.write32(self.reg_base + regs::DELAY, reg);

        self.controller_enable();
    }

    fn configure_read_capture(&self, bypass: bool, delay: u32) {
        self.controller_disable();

        let mut reg = self.mmio.read32(self.reg_base + regs::RD_DATA_CAPTURE);
        if bypass {
            reg |= regs::RD_DATA_CAPTURE_BYPASS;
        } else {
            reg &= !regs::RD_DATA_CAPTURE_BYPASS;
        }
        reg &= !(regs::RD_DATA_CAPTURE_DELAY_MASK << regs::RD_DATA_CAPTURE_DELAY_LSB);
        reg |= (delay & regs::RD_DATA_CAPTURE_DELAY_MASK) << regs::RD_DATA_CAPTURE_DELAY_LSB;
        self.mmio.write32(self.reg_base + regs::RD_DATA_CAPTURE, reg);

        self.controller_enable();
    }

    /// The controller must be observed idle several times in a row before
    /// a new transaction may start.
    fn wait_idle(&self) -> Result<()> {
        let mut count = 0;
        for _ in 0..IDLE_TIMEOUT_STEPS {
            let idle = (self.mmio.read32(self.reg_base + regs::CONFIG) >> regs::CONFIG_IDLE_LSB) & 0x1;
            count = if idle != 0 { count + 1 } else { 0 };
            if count >= POLL_IDLE_RETRY {
                return Ok(());
            }
            self.delay.stall_us(1);
        }
        Err(EfiError::Timeout)
    }

    fn exec_flash_cmd(&self, reg: u32) -> Result<()> {
        self.mmio.write32(self.reg_base + regs::CMDCTRL, reg);
        self.mmio.write32(self.reg_base + regs::CMDCTRL, reg | regs::CMDCTRL_EXECUTE);

        let mut done = false;
        for _ in 0..REG_RETRY {
            let status = self.mmio.read32(self.reg_base + regs::CMDCTRL);
            if status & regs::CMDCTRL_INPROGRESS == 0 {
                done = true;
                break;
            }
            self.delay.stall_us(1);
        }
        if !done {
            log::error!("qspi: flash command execution timed out");
            return Err(EfiError::Timeout);
        }

        self.wait_idle()
    }

    fn wait_for_bit(&self, reg: usize, mask: u32, set: bool, timeout_ms: u32) -> Result<()> {
        for _ in 0..timeout_ms * 1000 {
            let mut value = self.mmio.read32(self.reg_base + reg);
            if !set {
                value = !value;
            }
            if value & mask == mask {
                return Ok(());
            }
            self.delay.stall_us(1);
        }
        log::error!("qspi: timeout waiting for reg {reg:#x} mask {mask:#x} set {set}");
        Err(EfiError::Timeout)
    }

    fn read_sram_level(&self) -> u32 {
        (self.mmio.read32(self.reg_base + regs::SDRAMLEVEL) >> regs::SDRAMLEVEL_RD_LSB)
            & regs::SDRAMLEVEL_RD_MASK
    }

    fn wait_for_data(&self) -> Result<u32> {
        for _ in 0..REG_RETRY {
            let level = self.read_sram_level();
            if level != 0 {
                return Ok(level);
            }
            self.delay.stall_us(1);
        }
        Err(EfiError::Timeout)
    }

    fn stig_read(&self, opcode: u8, buffer: &mut [u8]) -> Result<()> {
        if buffer.is_empty() || buffer.len() > STIG_DATA_LEN_MAX {
            log::error!("qspi: invalid STIG read length {}", buffer.len());
            return Err(EfiError::InvalidParameter);
        }

        let mut reg = (opcode as u32) << regs::CMDCTRL_OPCODE_LSB;
        reg |= 1 << regs::CMDCTRL_RD_EN_LSB;
        // 0 means 1 byte.
        reg |= ((buffer.len() as u32 - 1) & regs::CMDCTRL_RD_BYTES_MASK) << regs::CMDCTRL_RD_BYTES_LSB;
        self.exec_flash_cmd(reg)?;

        let lower = self.mmio.read32(self.reg_base + regs::CMDREADDATALOWER);
        let take = buffer.len().min(4);
        buffer[..take].copy_from_slice(&lower.to_le_bytes()[..take]);

        if buffer.len() > 4 {
            let upper = self.mmio.read32(self.reg_base + regs::CMDREADDATAUPPER);
            let rest = buffer.len() - 4;
            buffer[4..].copy_from_slice(&upper.to_le_bytes()[..rest]);
        }

        Ok(())
    }

    fn stig_write(&self, opcode: u8, data: &[u8]) -> Result<()> {
        if data.len() > STIG_DATA_LEN_MAX {
            log::error!("qspi: invalid STIG write length {}", data.len());
            return Err(EfiError::InvalidParameter);
        }

        let mut reg = (opcode as u32) << regs::CMDCTRL_OPCODE_LSB;

        if !data.is_empty() {
            reg |= 1 << regs::CMDCTRL_WR_EN_LSB;
            reg |= ((data.len() as u32 - 1) & regs::CMDCTRL_WR_BYTES_MASK) << regs::CMDCTRL_WR_BYTES_LSB;

            let mut lower = [0u8; 4];
            let take = data.len().min(4);
            lower[..take].copy_from_slice(&data[..take]);
            self.mmio.write32(self.reg_base + regs::CMDWRITEDATALOWER, u32::from_le_bytes(lower));

            if data.len() > 4 {
                let mut upper = [0u8; 4];
                upper[..data.len() - 4].copy_from_slice(&data[4..]);
                self.mmio.write32(self.reg_base + regs::CMDWRITEDATAUPPER, u32::from_le_bytes(upper));
            }
        }

        self.exec_flash_cmd(reg)
    }

    /// Copy one chunk out of the AHB data window.
    fn drain_window(&self, buffer: &mut [u8]) {
        let mut index = 0;
        if buffer.len() >= 4 {
            while index + 4 <= buffer.len() {
                let word = self.mmio.read32(self.ahb_base);
                buffer[index..index + 4].copy_from_slice(&word.to_le_bytes());
                index += 4;
            }
        }
        while index < buffer.len() {
            buffer[index] = self.mmio.read8(self.ahb_base);
            index += 1;
        }
    }

    /// Copy one chunk into the AHB data window.
    fn fill_window(&self, buffer: &[u8]) {
        let mut index = 0;
        while index + 4 <= buffer.len() {
            let word = u32::from_le_bytes(buffer[index..index + 4].try_into().unwrap());
            self.mmio.write32(self.ahb_base, word);
            index += 4;
        }
        while index < buffer.len() {
            self.mmio.write8(self.ahb_base, buffer[index]);
            index += 1;
        }
    }

    /// Calibrate the read-data-capture delay against the flash JEDEC ID.
    ///
    /// Reads the ID once at a clock slow enough to be correct for any delay
    /// value, then sweeps the capture delay at the target clock and records
    /// which values still return the same ID. The midpoint of the widest
    /// matching window is programmed. Fails with `Aborted` when no delay
    /// value produces a matching ID.
    pub fn calibrate(&mut self) -> Result<u32> {
        let mut reference = [0u8; CALIBRATION_ID_LEN];
        let mut probe = [0u8; CALIBRATION_ID_LEN];

        self.set_clock_speed(MIN_HZ);
        self.configure_read_capture(true, 0);

        if self.stig_read(OP_RDID, &mut reference).is_err() {
            log::error!("qspi: calibration failed (reference id read)");
            return Err(EfiError::Aborted);
        }

        self.set_clock_speed(MAX_HZ);

        let mut best: Option<(u32, u32)> = None;
        let mut current: Option<(u32, u32)> = None;

        for delay in 0..READ_CAPTURE_MAX_DELAY {
            self.configure_read_capture(true, delay);

            if self.stig_read(OP_RDID, &mut probe).is_err() {
                log::error!("qspi: calibration failed (probe read)");
                return Err(EfiError::Aborted);
            }

            if probe == reference {
                current = match current {
                    Some((low, _)) => Some((low, delay)),
                    None => Some((delay, delay)),
                };
                if current.map(|(low, high)| high - low) >= best.map(|(low, high)| high - low) {
                    best = current;
                }
            } else {
                current = None;
            }
        }

        let Some((low, high)) = best else {
            log::error!("qspi: calibration found no stable read-capture window");
            return Err(EfiError::Aborted);
        };

        let chosen = (low + high) / 2;
        self.configure_read_capture(true, chosen);
        log::info!("qspi: read data capture delay calibrated to {chosen} ({low} - {high})");

        Ok(chosen)
    }
}

impl<M: Mmio, D: Delay> SpiMaster for CadenceQspi<M, D> {
    fn read_register(&mut self, opcode: u8, buffer: &mut [u8]) -> Result<()> {
        let _guard = self.maybe_lock();
        self.stig_read(opcode, buffer)
    }

    fn write_register(&mut self, opcode: u8, buffer: &[u8]) -> Result<()> {
        let _guard = self.maybe_lock();
        self.stig_write(opcode, buffer)
    }

    fn read_data(&mut self, op: &OpConfig, from: u32, buffer: &mut [u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        self.mmio.write32(self.reg_base + regs::INDIRECTRDSTARTADDR, from);
        self.mmio
            .write32(self.reg_base + regs::RD_INSTR, (op.read_opcode as u32) << regs::RD_INSTR_OPCODE_LSB
                | (op.read_dummy as u32) << regs::RD_INSTR_DUMMY_LSB);

        let mut size = self.mmio.read32(self.reg_base + regs::SIZE);
        size &= !regs::SIZE_ADDRESS_MASK;
        size |= op.addr_width.nbytes() - 1;
        self.mmio.write32(self.reg_base + regs::SIZE, size);

        self.mmio.write32(self.reg_base + regs::INDIRECTRDBYTES, buffer.len() as u32);
        self.mmio.write32(self.reg_base + regs::INDIRECTRD, regs::INDIRECTRD_START);

        let result = (|| {
            let mut offset = 0;
            while offset < buffer.len() {
                let mut level = self.wait_for_data()?;
                while level != 0 && offset < buffer.len() {
                    let chunk = ((level * self.fifo_width) as usize).min(buffer.len() - offset);
                    self.drain_window(&mut buffer[offset..offset + chunk]);
                    offset += chunk;
                    level = self.read_sram_level();
                }
            }

            self.wait_for_bit(regs::INDIRECTRD, regs::INDIRECTRD_DONE, true, 10)
        })();

        match result {
            Ok(()) => {
                // Acknowledge completion.
                self.mmio.write32(self.reg_base + regs::INDIRECTRD, regs::INDIRECTRD_DONE);
                Ok(())
            }
            Err(e) => {
                log::error!("qspi: indirect read failed: {e:?}");
                self.mmio.write32(self.reg_base + regs::INDIRECTRD, regs::INDIRECTRD_CANCEL);
                Err(e)
            }
        }
    }

    fn write_data(&mut self, op: &OpConfig, to: u32, buffer: &[u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        self.mmio
            .write32(self.reg_base + regs::WR_INSTR, (op.program_opcode as u32) << regs::WR_INSTR_OPCODE_LSB);
        self.mmio.write32(self.reg_base + regs::INDIRECTWRSTARTADDR, to);

        let mut size = self.mmio.read32(self.reg_base + regs::SIZE);
        size &= !regs::SIZE_ADDRESS_MASK;
        size |= op.addr_width.nbytes() - 1;
        self.mmio.write32(self.reg_base + regs::SIZE, size);

        self.mmio.write32(self.reg_base + regs::INDIRECTWRBYTES, buffer.len() as u32);
        self.mmio.write32(self.reg_base + regs::INDIRECTWR, regs::INDIRECTWR_START);

        self.delay.stall_us(div_round_up(self.write_delay_ns, 1000));

        let result = (|| {
            let mut offset = 0;
            while offset < buffer.len() {
                let chunk = (op.page_size as usize).min(buffer.len() - offset);
                self.fill_window(&buffer[offset..offset + chunk]);

                self.wait_for_bit(
                    regs::SDRAMLEVEL,
                    regs::SDRAMLEVEL_WR_MASK << regs::SDRAMLEVEL_WR_LSB,
                    false,
                    10,
                )?;

                offset += chunk;
            }

            self.wait_for_bit(regs::INDIRECTWR, regs::INDIRECTWR_DONE, true, 10)
        })();

        match result {
            Ok(()) => {
                self.mmio.write32(self.reg_base + regs::INDIRECTWR, regs::INDIRECTWR_DONE);
                Ok(())
            }
            Err(e) => {
                log::error!("qspi: indirect write failed: {e:?}");
                self.mmio.write32(self.reg_base + regs::INDIRECTWR, regs::INDIRECTWR_CANCEL);
                Err(e)
            }
        }
    }

    fn erase_sector(&mut self, op: &OpConfig, offset: u32) -> Result<()> {
        let _guard = self.maybe_lock();

        // Address-only command: the address travels as write data, most
        // significant byte first.
        let bytes = offset.to_be_bytes();
        let skip = 4 - op.addr_width.nbytes() as usize;
        self.stig_write(op.erase_opcode, &bytes[skip..])
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::AddrWidth;
    use fwstore_hal::NullDelay;
    use std::cell::RefCell;
    use std::collections::HashMap;

    const REG_BASE: usize = 0x2100_0000;
    const AHB_BASE: usize = 0x2200_0000;

    const GOOD_ID: [u8; 3] = [0xef, 0x40, 0x18];
    const BAD_ID: [u8; 3] = [0xff, 0x00, 0xff];

    /// Register model: STIG commands complete immediately, the controller is
    /// always idle, and the JEDEC ID served depends on clock and capture
    /// delay the way a marginal board behaves.
    struct FakeQspi {
        regs: RefCell<HashMap<usize, u32>>,
        window: core::ops::RangeInclusive<u32>,
        ahb_data: RefCell<Vec<u8>>,
        ahb_written: RefCell<Vec<u8>>,
        sram_words: RefCell<u32>,
    }

    impl FakeQspi {
        fn new(window: core::ops::RangeInclusive<u32>) -> Self {
            Self {
                regs: RefCell::new(HashMap::new()),
                window,
                ahb_data: RefCell::new(Vec::new()),
                ahb_written: RefCell::new(Vec::new()),
                sram_words: RefCell::new(0),
            }
        }

        fn reg(&self, offset: usize) -> u32 {
            *self.regs.borrow().get(&offset).unwrap_or(&0)
        }

        fn slow_clock(&self) -> bool {
            // 500 MHz reference: the 1 MHz calibration clock clamps the
            // divisor to the mask value; the target clock does not.
            (self.reg(regs::CONFIG) >> regs::CONFIG_BAUD_LSB) & regs::CONFIG_BAUD_MASK
                == regs::CONFIG_BAUD_MASK
        }

        fn capture_delay(&self) -> u32 {
            (self.reg(regs::RD_DATA_CAPTURE) >> regs::RD_DATA_CAPTURE_DELAY_LSB)
                & regs::RD_DATA_CAPTURE_DELAY_MASK
        }

        fn current_id(&self) -> [u8; 3] {
            if self.slow_clock() || self.window.contains(&self.capture_delay()) {
                GOOD_ID
            } else {
                BAD_ID
            }
        }
    }

    impl Mmio for &FakeQspi {
        fn read8(&self, address: usize) -> u8 {
            assert_eq!(address, AHB_BASE);
            self.ahb_data.borrow_mut().remove(0)
        }

        fn read16(&self, _address: usize) -> u16 {
            unimplemented!()
        }

        fn read32(&self, address: usize) -> u32 {
            if address == AHB_BASE {
                let mut data = self.ahb_data.borrow_mut();
                let word: Vec<u8> = data.drain(..4).collect();
                let mut words = self.sram_words.borrow_mut();
                *words = words.saturating_sub(1);
                return u32::from_le_bytes(word.try_into().unwrap());
            }
            match address - REG_BASE {
                regs::CONFIG => self.reg(regs::CONFIG) | 1 << regs::CONFIG_IDLE_LSB,
                regs::CMDCTRL => 0,
                regs::CMDREADDATALOWER => {
                    let id = self.current_id();
                    u32::from_le_bytes([id[0], id[1], id[2], 0])
                }
                regs::SDRAMLEVEL => *self.sram_words.borrow(),
                regs::INDIRECTRD => regs::INDIRECTRD_DONE,
                regs::INDIRECTWR => regs::INDIRECTWR_DONE,
                offset => self.reg(offset),
            }
        }

        fn write8(&self, address: usize, value: u8) {
            assert_eq!(address, AHB_BASE);
            self.ahb_written.borrow_mut().push(value);
        }

        fn write16(&self, _address: usize, _value: u16) {
            unimplemented!()
        }

        fn write32(&self, address: usize, value: u32) {
            if address == AHB_BASE {
                self.ahb_written.borrow_mut().extend(value.to_le_bytes());
                return;
            }
            self.regs.borrow_mut().insert(address - REG_BASE, value);
        }
    }

    fn timing() -> QspiTiming {
        QspiTiming { ref_clk_hz: 500_000_000, tshsl_ns: 50, tchsh_ns: 4, tslch_ns: 4, tsd2d_ns: 255 }
    }

    fn qspi(fake: &FakeQspi) -> CadenceQspi<&FakeQspi, NullDelay> {
        CadenceQspi::new(fake, NullDelay, REG_BASE, AHB_BASE, 4, timing(), LockPolicy::Shared)
    }

    fn op_config() -> OpConfig {
        OpConfig {
            addr_width: AddrWidth::Three,
            read_opcode: 0x03,
            program_opcode: 0x02,
            erase_opcode: 0xd8,
            read_dummy: 0,
            page_size: 256,
        }
    }

    #[test]
    fn calibration_selects_midpoint_of_stable_window() {
        let fake = FakeQspi::new(4..=11);
        let mut qspi = qspi(&fake);
        assert_eq!(qspi.calibrate(), Ok(7));
        assert_eq!(fake.capture_delay(), 7);
    }

    #[test]
    fn calibration_single_delay_window() {
        let fake = FakeQspi::new(9..=9);
        let mut qspi = qspi(&fake);
        assert_eq!(qspi.calibrate(), Ok(9));
    }

    #[test]
    fn calibration_prefers_widest_window() {
        // Two windows would require a non-contiguous model; emulate the
        // degenerate case where the whole sweep matches.
        let fake = FakeQspi::new(0..=15);
        let mut qspi = qspi(&fake);
        assert_eq!(qspi.calibrate(), Ok(7));
    }

    #[test]
    fn calibration_with_no_stable_delay_aborts() {
        let fake = FakeQspi::new(17..=17);
        let mut qspi = qspi(&fake);
        assert_eq!(qspi.calibrate(), Err(EfiError::Aborted));
    }

    #[test]
    fn stig_read_rejects_oversized_transfers() {
        let fake = FakeQspi::new(0..=15);
        let mut qspi = qspi(&fake);
        let mut buffer = [0u8; 9];
        assert_eq!(qspi.read_register(0x9f, &mut buffer), Err(EfiError::InvalidParameter));
        assert_eq!(qspi.read_register(0x9f, &mut []), Err(EfiError::InvalidParameter));
    }

    #[test]
    fn indirect_read_drains_sram_in_chunks() {
        let fake = FakeQspi::new(0..=15);
        fake.ahb_data.borrow_mut().extend([1, 2, 3, 4, 5, 6, 7, 8]);
        *fake.sram_words.borrow_mut() = 2;

        let mut qspi = qspi(&fake);
        let mut buffer = [0u8; 8];
        qspi.read_data(&op_config(), 0x100, &mut buffer).unwrap();

        assert_eq!(buffer, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(fake.reg(regs::INDIRECTRDSTARTADDR), 0x100);
        assert_eq!(fake.reg(regs::INDIRECTRDBYTES), 8);
    }

    #[test]
    fn indirect_write_streams_through_window() {
        let fake = FakeQspi::new(0..=15);
        let mut qspi = qspi(&fake);
        let data = [0x11u8, 0x22, 0x33, 0x44, 0x55];
        qspi.write_data(&op_config(), 0x2000, &data).unwrap();

        assert_eq!(fake.ahb_written.borrow().as_slice(), &data);
        assert_eq!(fake.reg(regs::INDIRECTWRSTARTADDR), 0x2000);
        assert_eq!(fake.reg(regs::INDIRECTWRBYTES), 5);
    }

    #[test]
    fn erase_sends_address_as_write_data() {
        let fake = FakeQspi::new(0..=15);
        let mut qspi = qspi(&fake);
        qspi.erase_sector(&op_config(), 0x0104_00).unwrap();

        let lower = fake.reg(regs::CMDWRITEDATALOWER);
        assert_eq!(lower.to_le_bytes()[..3], [0x01, 0x04, 0x00]);
    }
}
