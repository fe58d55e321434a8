//! SPI Flash Master Controller (SPIFMC) transport.
//!
//! A FIFO-pumped controller: the driver writes the opcode, address bytes and
//! payload through a single FIFO port register, then sets GO_BUSY and polls
//! the interrupt status register for completion. The AHB bus can only do
//! 32-bit accesses to the FIFO, which forces a couple of documented
//! workarounds on the register path.
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
    pub const CTRL: usize = 0x00;
    pub const CTRL_WP_OL: u32 = 1 << 15;
    pub const CTRL_SRST: u32 = 1 << 21;
    pub const CTRL_SCK_DIV_MASK: u32 = 0x7ff;

    pub const CE_CTRL: usize = 0x04;
    pub const DMMR: usize = 0x0c;

    pub const TRAN_CSR: usize = 0x10;
    pub const TRAN_CSR_TRAN_MODE_MASK: u32 = 0x0003;
    pub const TRAN_CSR_TRAN_MODE_RX: u32 = 1 << 0;
    pub const TRAN_CSR_TRAN_MODE_TX: u32 = 1 << 1;
    pub const TRAN_CSR_CNTNS_READ: u32 = 1 << 2;
    pub const TRAN_CSR_FAST_MODE: u32 = 1 << 3;
    pub const TRAN_CSR_BUS_WIDTH_1_BIT: u32 = 0x00 << 4;
    pub const TRAN_CSR_BUS_WIDTH_2_BIT: u32 = 0x01 << 4;
    pub const TRAN_CSR_BUS_WIDTH_4_BIT: u32 = 0x02 << 4;
    pub const TRAN_CSR_DMA_EN: u32 = 1 << 6;
    pub const TRAN_CSR_ADDR_BYTES_MASK: u32 = 0x0700;
    pub const TRAN_CSR_ADDR_BYTES_SHIFT: u32 = 8;
    pub const TRAN_CSR_WITH_CMD: u32 = 1 << 11;
    pub const TRAN_CSR_FIFO_TRG_LVL_MASK: u32 = 0x3000;
    pub const TRAN_CSR_FIFO_TRG_LVL_1_BYTE: u32 = 0x00 << 12;
    pub const TRAN_CSR_FIFO_TRG_LVL_4_BYTE: u32 = 0x02 << 12;
    pub const TRAN_CSR_FIFO_TRG_LVL_8_BYTE: u32 = 0x03 << 12;
    pub const TRAN_CSR_GO_BUSY: u32 = 1 << 15;

    pub const TRAN_NUM: usize = 0x14;
    pub const FIFO_PORT: usize = 0x18;
    pub const FIFO_PT: usize = 0x20;

    pub const INT_STS: usize = 0x28;
    pub const INT_TRAN_DONE: u32 = 1 << 0;
    pub const INT_RD_FIFO: u32 = 1 << 2;

    pub const OPT: usize = 0x30;

    pub const MAX_FIFO_DEPTH: usize = 8;
}

// Writing the status register uses this opcode; the controller needs the
// RX+TX transfer mode combination for it to flush the output correctly.
const OP_WRSR: u8 = 0x01;

// Interrupt-status poll budget, in 1 us steps.
const INT_WAIT_TIMEOUT_US: u32 = 1_000_000;

// FIFO drain budget on the write path: 10 us steps, 300 ms total.
const FIFO_WAIT_STEP_US: u32 = 10;
const FIFO_WAIT_MAX_STEPS: u32 = 30_000;

/// SPIFMC controller instance.
///
/// One instance per controller found; the codec owns it exclusively through
/// the [`SpiMaster`] trait.
pub struct Spifmc<M: Mmio, D: Delay> {
    mmio: M,
    delay: D,
    base: usize,
    policy: LockPolicy,
    lock: spin::Mutex<()>,
}

impl<M: Mmio, D: Delay> Spifmc<M, D> {
    pub fn new(mmio: M, delay: D, base: usize, policy: LockPolicy) -> Self {
        Self { mmio, delay, base, policy, lock: spin::Mutex::new(()) }
    }

    /// Reset the controller and program the default transfer setup.
    ///
    /// Disables direct memory-mapped read so all accesses go through the
    /// FIFO, soft-resets the transfer engine and selects the SCK divisor
    /// (SCK = HCLK / (2 * (div + 1))).
    pub fn init(&mut self) -> Result<()> {
        let _guard = self.maybe_lock();

        self.mmio.write32(self.base + regs::DMMR, 0);

        let mut ctrl = self.mmio.read32(self.base + regs::CTRL);
        ctrl &= !regs::CTRL_SCK_DIV_MASK;
        ctrl |= regs::CTRL_SRST;
        ctrl |= 0x3;
        self.mmio.write32(self.base + regs::CTRL, ctrl);

        // Hardware CE control; the soft reset does not touch this register.
        self.mmio.write32(self.base + regs::CE_CTRL, 0);

        let csr = (3 << regs::TRAN_CSR_ADDR_BYTES_SHIFT)
            | regs::TRAN_CSR_FIFO_TRG_LVL_4_BYTE
            | regs::TRAN_CSR_WITH_CMD;
        self.mmio.write32(self.base + regs::TRAN_CSR, csr);

        Ok(())
    }

    fn maybe_lock(&self) -> Option<spin::MutexGuard<'_, ()>> {
        match self.policy {
            LockPolicy::Shared => Some(self.lock.lock()),
            LockPolicy::Isolated => None,
        }
    }

    /// Transfer setup template with all mode fields cleared.
    fn init_reg(&self) -> u32 {
        let mut reg = self.mmio.read32(self.base + regs::TRAN_CSR);
        reg &= !(regs::TRAN_CSR_TRAN_MODE_MASK
            | regs::TRAN_CSR_CNTNS_READ
            | regs::TRAN_CSR_FAST_MODE
            | regs::TRAN_CSR_BUS_WIDTH_2_BIT
            | regs::TRAN_CSR_BUS_WIDTH_4_BIT
            | regs::TRAN_CSR_DMA_EN
            | regs::TRAN_CSR_ADDR_BYTES_MASK
            | regs::TRAN_CSR_WITH_CMD
            | regs::TRAN_CSR_FIFO_TRG_LVL_MASK);
        reg
    }

    fn wait_int(&self, int_type: u32) -> Result<()> {
        for _ in 0..INT_WAIT_TIMEOUT_US {
            if self.mmio.read32(self.base + regs::INT_STS) & int_type != 0 {
                return Ok(());
            }
            self.delay.stall_us(1);
        }
        log::error!("spifmc: wait for interrupt status {int_type:#x} timed out");
        Err(EfiError::Timeout)
    }

    /// Spin until the FIFO fill level equals `level`.
    fn wait_fifo_level(&self, level: usize) -> Result<()> {
        for _ in 0..INT_WAIT_TIMEOUT_US {
            if (self.mmio.read32(self.base + regs::FIFO_PT) as usize & 0xf) == level {
                return Ok(());
            }
        }
        log::error!("spifmc: FIFO level {level} never reached");
        Err(EfiError::Timeout)
    }

    fn push_address(&self, op: &OpConfig, address: u32) {
        for index in (0..op.addr_width.nbytes()).rev() {
            self.mmio.write8(self.base + regs::FIFO_PORT, (address >> (index * 8)) as u8);
        }
    }

    /// Drive the external write-protect pin through the controller.
    pub fn set_wp_level(&mut self, level_high: bool) {
        let mut ctrl = self.mmio.read32(self.base + regs::CTRL);
        if level_high {
            ctrl |= regs::CTRL_WP_OL;
        } else {
            ctrl &= !regs::CTRL_WP_OL;
        }
        self.mmio.write32(self.base + regs::CTRL, ctrl);
    }
}

impl<M: Mmio, D: Delay> SpiMaster for Spifmc<M, D> {
    /// The AHB bus can only do 32-bit accesses to the FIFO, so a command
    /// without a 3-byte address leaves 3 bytes of stale data in the FIFO.
    /// Setting both RX and TX transfer modes marks those bytes to be sent
    /// out instead of polluting the read data.
    fn read_register(&mut self, opcode: u8, buffer: &mut [u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        let mut reg = self.init_reg();
        reg |= regs::TRAN_CSR_BUS_WIDTH_1_BIT;
        reg |= regs::TRAN_CSR_FIFO_TRG_LVL_1_BYTE;
        reg |= regs::TRAN_CSR_WITH_CMD;
        reg |= regs::TRAN_CSR_TRAN_MODE_RX | regs::TRAN_CSR_TRAN_MODE_TX;

        // OPT bit[1]: disable the no-address command FIFO flush.
        self.mmio.write32(self.base + regs::OPT, 2);
        self.mmio.write32(self.base + regs::FIFO_PT, 0);
        self.mmio.write8(self.base + regs::FIFO_PORT, opcode);
        for _ in 0..buffer.len() {
            self.mmio.write8(self.base + regs::FIFO_PORT, 0);
        }

        self.mmio.write32(self.base + regs::INT_STS, 0);
        self.mmio.write32(self.base + regs::TRAN_NUM, buffer.len() as u32);
        reg |= regs::TRAN_CSR_GO_BUSY;
        self.mmio.write32(self.base + regs::TRAN_CSR, reg);

        self.wait_int(regs::INT_TRAN_DONE)?;

        for byte in buffer.iter_mut() {
            *byte = self.mmio.read8(self.base + regs::FIFO_PORT);
        }
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        Ok(())
    }

    fn write_register(&mut self, opcode: u8, buffer: &[u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        let mut reg = self.init_reg();
        reg |= regs::TRAN_CSR_FIFO_TRG_LVL_1_BYTE;
        reg |= regs::TRAN_CSR_WITH_CMD;

        // Status-register writes need the same RX+TX setup as the register
        // read path for the controller to flush the value out.
        if opcode == OP_WRSR {
            reg |= regs::TRAN_CSR_TRAN_MODE_RX | regs::TRAN_CSR_TRAN_MODE_TX;
            self.mmio.write32(self.base + regs::TRAN_NUM, buffer.len() as u32);
        }

        self.mmio.write32(self.base + regs::FIFO_PT, 0);
        self.mmio.write8(self.base + regs::FIFO_PORT, opcode);
        for byte in buffer {
            self.mmio.write8(self.base + regs::FIFO_PORT, *byte);
        }

        self.mmio.write32(self.base + regs::INT_STS, 0);
        reg |= regs::TRAN_CSR_GO_BUSY;
        self.mmio.write32(self.base + regs::TRAN_CSR, reg);

        self.wait_int(regs::INT_TRAN_DONE)?;
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        Ok(())
    }

    fn read_data(&mut self, op: &OpConfig, from: u32, buffer: &mut [u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        let mut reg = self.init_reg();
        reg |= op.addr_width.nbytes() << regs::TRAN_CSR_ADDR_BYTES_SHIFT;
        reg |= regs::TRAN_CSR_FIFO_TRG_LVL_8_BYTE;
        reg |= regs::TRAN_CSR_WITH_CMD;
        reg |= regs::TRAN_CSR_TRAN_MODE_RX;

        self.mmio.write32(self.base + regs::FIFO_PT, 0);
        self.mmio.write8(self.base + regs::FIFO_PORT, op.read_opcode);
        self.push_address(op, from);

        // The RD_FIFO interrupt never fires for a transfer shorter than the
        // FIFO trigger level, so short reads are padded to the FIFO depth
        // and the excess drained past the end of the caller's buffer.
        let padded = buffer.len().max(regs::MAX_FIFO_DEPTH);

        self.mmio.write32(self.base + regs::INT_STS, 0);
        self.mmio.write32(self.base + regs::TRAN_NUM, padded as u32);
        reg |= regs::TRAN_CSR_GO_BUSY;
        self.mmio.write32(self.base + regs::TRAN_CSR, reg);

        self.wait_int(regs::INT_RD_FIFO)?;

        let mut offset = 0;
        while offset < padded {
            let xfer = regs::MAX_FIFO_DEPTH.min(padded - offset);
            self.wait_fifo_level(xfer)?;
            for index in 0..xfer {
                let byte = self.mmio.read8(self.base + regs::FIFO_PORT);
                if offset + index < buffer.len() {
                    buffer[offset + index] = byte;
                }
            }
            offset += xfer;
        }

        self.wait_int(regs::INT_TRAN_DONE)?;
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        Ok(())
    }

    fn write_data(&mut self, op: &OpConfig, to: u32, buffer: &[u8]) -> Result<()> {
        let _guard = self.maybe_lock();

        let mut reg = self.init_reg();
        reg |= op.addr_width.nbytes() << regs::TRAN_CSR_ADDR_BYTES_SHIFT;
        reg |= regs::TRAN_CSR_FIFO_TRG_LVL_8_BYTE;
        reg |= regs::TRAN_CSR_WITH_CMD;
        reg |= regs::TRAN_CSR_TRAN_MODE_TX;

        self.mmio.write32(self.base + regs::FIFO_PT, 0);
        self.mmio.write8(self.base + regs::FIFO_PORT, op.program_opcode);
        self.push_address(op, to);

        self.mmio.write32(self.base + regs::INT_STS, 0);
        self.mmio.write32(self.base + regs::TRAN_NUM, buffer.len() as u32);
        reg |= regs::TRAN_CSR_GO_BUSY;
        self.mmio.write32(self.base + regs::TRAN_CSR, reg);

        self.wait_fifo_level(0)?;
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        let mut offset = 0;
        while offset < buffer.len() {
            let xfer = regs::MAX_FIFO_DEPTH.min(buffer.len() - offset);

            let mut waited = 0;
            while (self.mmio.read32(self.base + regs::FIFO_PT) & 0xf) != 0 {
                waited += 1;
                self.delay.stall_us(FIFO_WAIT_STEP_US);
                if waited > FIFO_WAIT_MAX_STEPS {
                    log::error!("spifmc: wait for FIFO empty timed out");
                    return Err(EfiError::Timeout);
                }
            }

            for byte in &buffer[offset..offset + xfer] {
                self.mmio.write8(self.base + regs::FIFO_PORT, *byte);
            }
            offset += xfer;
        }

        self.wait_int(regs::INT_TRAN_DONE)?;
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        Ok(())
    }

    fn erase_sector(&mut self, op: &OpConfig, offset: u32) -> Result<()> {
        let _guard = self.maybe_lock();

        let mut reg = self.init_reg();
        reg |= op.addr_width.nbytes() << regs::TRAN_CSR_ADDR_BYTES_SHIFT;
        reg |= regs::TRAN_CSR_FIFO_TRG_LVL_1_BYTE;
        reg |= regs::TRAN_CSR_WITH_CMD;

        self.mmio.write32(self.base + regs::FIFO_PT, 0);
        self.mmio.write8(self.base + regs::FIFO_PORT, op.erase_opcode);
        self.push_address(op, offset);

        self.mmio.write32(self.base + regs::INT_STS, 0);
        reg |= regs::TRAN_CSR_GO_BUSY;
        self.mmio.write32(self.base + regs::TRAN_CSR, reg);

        self.wait_int(regs::INT_TRAN_DONE)?;
        self.mmio.write32(self.base + regs::FIFO_PT, 0);

        Ok(())
    }

    fn set_write_protect(&mut self, level_high: bool) -> Result<()> {
        self.set_wp_level(level_high);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::AddrWidth;
    use fwstore_hal::NullDelay;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    const BASE: usize = 0x1000_0000;

    /// Register model for the FIFO paths: captures writes, serves a scripted
    /// FIFO and reports a scripted fill level / interrupt status.
    #[derive(Default)]
    struct FakeRegs {
        regs: RefCell<std::collections::HashMap<usize, u32>>,
        fifo_out: RefCell<VecDeque<u8>>,
        fifo_in: RefCell<Vec<u8>>,
        fifo_level: RefCell<VecDeque<u32>>,
        int_sts: u32,
    }

    impl FakeRegs {
        fn with_int_status(int_sts: u32) -> Self {
            Self { int_sts, ..Default::default() }
        }
    }

    impl Mmio for &FakeRegs {
        fn read8(&self, address: usize) -> u8 {
            assert_eq!(address, BASE + regs::FIFO_PORT);
            self.fifo_out.borrow_mut().pop_front().unwrap_or(0)
        }

        fn read16(&self, _address: usize) -> u16 {
            unimplemented!()
        }

        fn read32(&self, address: usize) -> u32 {
            match address - BASE {
                regs::INT_STS => self.int_sts,
                regs::FIFO_PT => self.fifo_level.borrow_mut().pop_front().unwrap_or(0),
                offset => *self.regs.borrow().get(&offset).unwrap_or(&0),
            }
        }

        fn write8(&self, address: usize, value: u8) {
            assert_eq!(address, BASE + regs::FIFO_PORT);
            self.fifo_in.borrow_mut().push(value);
        }

        fn write16(&self, _address: usize, _value: u16) {
            unimplemented!()
        }

        fn write32(&self, address: usize, value: u32) {
            self.regs.borrow_mut().insert(address - BASE, value);
        }
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
    fn read_register_pushes_opcode_and_drains_fifo() {
        let fake = FakeRegs::with_int_status(regs::INT_TRAN_DONE);
        fake.fifo_out.borrow_mut().extend([0xc8, 0x40, 0x19]);

        let mut spifmc = Spifmc::new(&fake, NullDelay, BASE, LockPolicy::Shared);
        let mut id = [0u8; 3];
        spifmc.read_register(0x9f, &mut id).unwrap();

        assert_eq!(id, [0xc8, 0x40, 0x19]);
        // Opcode first, then one dummy byte pushed per expected byte.
        assert_eq!(fake.fifo_in.borrow().as_slice(), &[0x9f, 0, 0, 0]);
        assert_eq!(fake.regs.borrow()[&regs::TRAN_NUM], 3);
        // No-address command workaround must be armed.
        assert_eq!(fake.regs.borrow()[&regs::OPT], 2);
    }

    #[test]
    fn erase_sends_big_endian_address() {
        let fake = FakeRegs::with_int_status(regs::INT_TRAN_DONE);
        let mut spifmc = Spifmc::new(&fake, NullDelay, BASE, LockPolicy::Shared);

        spifmc.erase_sector(&op_config(), 0x0123_45).unwrap();

        assert_eq!(fake.fifo_in.borrow().as_slice(), &[0xd8, 0x01, 0x23, 0x45]);
        let csr = fake.regs.borrow()[&regs::TRAN_CSR];
        assert_eq!(csr & regs::TRAN_CSR_ADDR_BYTES_MASK, 3 << regs::TRAN_CSR_ADDR_BYTES_SHIFT);
        assert_ne!(csr & regs::TRAN_CSR_GO_BUSY, 0);
    }

    #[test]
    fn short_read_is_padded_to_fifo_depth_without_overrunning_buffer() {
        let fake = FakeRegs::with_int_status(regs::INT_TRAN_DONE | regs::INT_RD_FIFO);
        fake.fifo_out.borrow_mut().extend([0xa5, 0x5a, 0, 0, 0, 0, 0, 0]);
        fake.fifo_level.borrow_mut().push_back(8);

        let mut spifmc = Spifmc::new(&fake, NullDelay, BASE, LockPolicy::Shared);
        let mut buffer = [0u8; 2];
        spifmc.read_data(&op_config(), 0, &mut buffer).unwrap();

        assert_eq!(buffer, [0xa5, 0x5a]);
        // The transfer count was padded to the FIFO depth.
        assert_eq!(fake.regs.borrow()[&regs::TRAN_NUM], 8);
    }

    #[test]
    fn transaction_done_timeout_is_reported() {
        let fake = FakeRegs::with_int_status(0);
        let mut spifmc = Spifmc::new(&fake, NullDelay, BASE, LockPolicy::Shared);
        assert_eq!(spifmc.write_register(0x06, &[]), Err(EfiError::Timeout));
    }

    #[test]
    fn wp_pin_toggles_ctrl_bit() {
        let fake = FakeRegs::with_int_status(0);
        let mut spifmc = Spifmc::new(&fake, NullDelay, BASE, LockPolicy::Isolated);

        spifmc.set_write_protect(true).unwrap();
        assert_ne!(fake.regs.borrow()[&regs::CTRL] & regs::CTRL_WP_OL, 0);
        spifmc.set_write_protect(false).unwrap();
        assert_eq!(fake.regs.borrow()[&regs::CTRL] & regs::CTRL_WP_OL, 0);
    }
}
