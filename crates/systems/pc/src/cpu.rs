//! PC CPU wrapper
//!
//! This module wraps the core x86 CPU with PC-specific power-on state.

use crate::bus::PcBus;
use x86emu_core::cpu_x86::{CpuModel, CpuX86, IntCallback, SegmentRegister, REG_ESP, SEG_CS, SEG_SS};

/// PC CPU wrapper
pub struct PcCpu {
    cpu: CpuX86<PcBus>,
}

impl PcCpu {
    /// Create a new PC CPU with the given bus and model
    pub fn new(bus: PcBus, model: CpuModel) -> Self {
        let mut cpu = CpuX86::with_model(bus, model);
        Self::apply_boot_state(&mut cpu);
        Self { cpu }
    }

    /// IBM PC boots at CS:IP = 0xFFFF:0x0000 (physical address 0xFFFF0),
    /// the BIOS entry point
    fn apply_boot_state(cpu: &mut CpuX86<PcBus>) {
        cpu.segs[SEG_CS] = SegmentRegister::real_mode(0xFFFF);
        cpu.eip = 0;
        cpu.segs[SEG_SS] = SegmentRegister::real_mode(0);
        cpu.regs[REG_ESP] = 0xFFFE;
    }

    /// Reset the CPU and restore PC boot state
    pub fn reset(&mut self) {
        self.cpu.reset();
        Self::apply_boot_state(&mut self.cpu);
    }

    /// Execute one instruction, returning cycles consumed
    pub fn step(&mut self) -> u32 {
        self.cpu.step()
    }

    /// Run up to `count` instructions, returning the number retired
    pub fn exec(&mut self, count: u32) -> u32 {
        self.cpu.exec(count)
    }

    /// Install a native handler for a real-mode software interrupt
    pub fn register_int_callback(&mut self, vector: u8, callback: IntCallback<PcBus>) {
        self.cpu.register_int_callback(vector, callback);
    }

    /// Get a reference to the bus
    pub fn bus(&self) -> &PcBus {
        &self.cpu.memory
    }

    /// Get a mutable reference to the bus
    pub fn bus_mut(&mut self) -> &mut PcBus {
        &mut self.cpu.memory
    }

    /// Get a reference to the CPU core
    pub fn core(&self) -> &CpuX86<PcBus> {
        &self.cpu
    }

    /// Get a mutable reference to the CPU core
    pub fn core_mut(&mut self) -> &mut CpuX86<PcBus> {
        &mut self.cpu
    }
}
