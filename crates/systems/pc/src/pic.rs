//! Interrupt controller pair (8259A master/slave) at its interface boundary
//!
//! The CPU core only needs the narrow contract from the execution loop: "is
//! an unmasked request pending, and if so, which vector" - evaluated once per
//! outer-loop iteration. This models the request and mask registers and the
//! master/slave cascade on IRQ2; full 8259 features (priority rotation,
//! polling, specific EOI) belong to the host's device layer.

use x86emu_core::logging::{log, LogCategory, LogLevel};

/// One 8259 channel: request register, mask register and vector base
#[derive(Debug, Clone)]
struct PicChip {
    /// Interrupt request register (one bit per line)
    irr: u8,
    /// Interrupt mask register (1 = masked)
    imr: u8,
    /// Vector number for line 0
    vector_base: u8,
    /// Initialization sequence state (expecting ICW2 after ICW1)
    expect_icw2: bool,
}

impl PicChip {
    fn new(vector_base: u8) -> Self {
        Self {
            irr: 0,
            imr: 0,
            vector_base,
            expect_icw2: false,
        }
    }

    fn pending(&self) -> u8 {
        self.irr & !self.imr
    }

    /// Claim the highest-priority pending line (lowest line number wins)
    fn take(&mut self) -> Option<u8> {
        let pending = self.pending();
        if pending == 0 {
            return None;
        }
        let line = pending.trailing_zeros() as u8;
        self.irr &= !(1 << line);
        Some(line)
    }
}

/// Master/slave 8259 pair with the slave cascaded on master line 2
#[derive(Debug, Clone)]
pub struct DualPic {
    master: PicChip,
    slave: PicChip,
}

impl DualPic {
    pub fn new() -> Self {
        Self {
            master: PicChip::new(0x08),
            slave: PicChip::new(0x70),
        }
    }

    /// Latch an interrupt request on IRQ 0-15
    pub fn raise_irq(&mut self, line: u8) {
        log(LogCategory::Interrupts, LogLevel::Trace, || {
            format!("IRQ {} raised", line)
        });
        if line < 8 {
            self.master.irr |= 1 << line;
        } else {
            self.slave.irr |= 1 << (line - 8);
            // Cascade into the master
            self.master.irr |= 1 << 2;
        }
    }

    /// True when any unmasked request is pending
    pub fn has_pending(&self) -> bool {
        let master_pending = self.master.pending();
        if master_pending & !(1 << 2) != 0 {
            return true;
        }
        // A cascade request only counts if the slave still has one to offer
        master_pending & (1 << 2) != 0 && self.slave.pending() != 0
    }

    /// Return the highest-priority pending vector and clear its request bit
    pub fn next_interrupt(&mut self) -> Option<u8> {
        let pending = self.master.pending();
        if pending == 0 {
            return None;
        }
        let line = pending.trailing_zeros() as u8;
        if line == 2 {
            // Cascaded: resolve through the slave
            if let Some(slave_line) = self.slave.take() {
                if self.slave.pending() == 0 {
                    self.master.irr &= !(1 << 2);
                }
                return Some(self.slave.vector_base + slave_line);
            }
            self.master.irr &= !(1 << 2);
            return self.next_interrupt();
        }
        self.master.irr &= !(1 << line);
        Some(self.master.vector_base + line)
    }

    /// Port interface: 0x20/0x21 master, 0xA0/0xA1 slave
    pub fn io_read(&mut self, port: u16) -> u8 {
        match port {
            0x21 => self.master.imr,
            0xA1 => self.slave.imr,
            // Command-port reads report the request register
            0x20 => self.master.irr,
            0xA0 => self.slave.irr,
            _ => 0xFF,
        }
    }

    pub fn io_write(&mut self, port: u16, val: u8) {
        let chip = match port {
            0x20 | 0x21 => &mut self.master,
            _ => &mut self.slave,
        };
        match port {
            0x20 | 0xA0 => {
                if val & 0x10 != 0 {
                    // ICW1: restart initialization, ICW2 carries the base
                    chip.expect_icw2 = true;
                    chip.imr = 0;
                }
                // OCW2/OCW3 (EOI etc.): no in-service tracking needed here
            }
            _ => {
                if chip.expect_icw2 {
                    chip.vector_base = val & 0xF8;
                    chip.expect_icw2 = false;
                } else {
                    chip.imr = val;
                }
            }
        }
    }
}

impl Default for DualPic {
    fn default() -> Self {
        Self::new()
    }
}
