//! IBM PC/AT machine integration for the x86 core
//!
//! Couples the CPU core to the PC memory bus (conventional/video/EMS/UMB/HMA
//! regions, A20 gate, interrupt controller pair) and provides machine-level
//! configuration and save-state plumbing. Peripheral device logic beyond the
//! port contract lives with the embedding host.

pub mod bus;
pub mod cpu;
pub mod ems;
pub mod pic;

use crate::bus::PcBus;
use crate::cpu::PcCpu;
use serde_json::{json, Value};
use thiserror::Error;
use x86emu_core::cpu_x86::CpuModel;

/// Machine-level errors (host configuration and state handling, never
/// guest-visible faults)
#[derive(Error, Debug)]
pub enum PcError {
    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),
    #[error("incompatible save state: {0}")]
    StateFormat(String),
    #[error("state serialization failed: {0}")]
    StateSerde(#[from] serde_json::Error),
}

/// Machine configuration
#[derive(Debug, Clone)]
pub struct PcConfig {
    /// Conventional memory in KB (max 640)
    pub conventional_kb: u32,
    /// Extended memory in KB (mapped from 1MB; the first 64KB is the HMA)
    pub extended_kb: u32,
    /// Expanded (EMS) memory in KB, bank-switched through the page frame
    pub ems_kb: u32,
    /// Provide RAM-backed upper memory blocks at 0xC0000-0xDFFFF
    pub umb: bool,
    /// CPU model
    pub model: CpuModel,
}

impl Default for PcConfig {
    fn default() -> Self {
        Self {
            conventional_kb: 640,
            extended_kb: 1024,
            ems_kb: 0,
            umb: true,
            model: CpuModel::Intel80386,
        }
    }
}

/// Save-state format version
const STATE_VERSION: u32 = 1;

/// A complete PC machine: CPU core plus memory bus
pub struct PcMachine {
    cpu: PcCpu,
}

impl PcMachine {
    /// Build a machine from a configuration
    pub fn new(config: PcConfig) -> Result<Self, PcError> {
        if config.conventional_kb == 0 || config.conventional_kb > 640 {
            return Err(PcError::InvalidConfig(format!(
                "conventional memory must be 1-640 KB, got {}",
                config.conventional_kb
            )));
        }
        if config.ems_kb % 16 != 0 {
            return Err(PcError::InvalidConfig(format!(
                "EMS size must be a multiple of 16 KB, got {}",
                config.ems_kb
            )));
        }
        let bus = PcBus::with_memory(
            config.conventional_kb,
            config.extended_kb,
            config.ems_kb,
            config.umb,
        );
        Ok(Self {
            cpu: PcCpu::new(bus, config.model),
        })
    }

    /// Default 386 machine with 640KB + 1MB extended
    pub fn default_machine() -> Self {
        Self::new(PcConfig::default()).expect("default configuration is valid")
    }

    /// Reset the machine to power-on state
    pub fn reset(&mut self) {
        self.cpu.reset();
    }

    /// Run up to `count` instructions; returns the number retired (fewer when
    /// the CPU halts with no interrupt pending)
    pub fn exec(&mut self, count: u32) -> u32 {
        self.cpu.exec(count)
    }

    /// Access the CPU wrapper
    pub fn cpu(&self) -> &PcCpu {
        &self.cpu
    }

    /// Mutable access to the CPU wrapper
    pub fn cpu_mut(&mut self) -> &mut PcCpu {
        &mut self.cpu
    }

    /// Serialize the CPU-visible architectural state
    ///
    /// Memory contents are not included; image save/restore is the host's
    /// concern and layers on top of the bus accessors.
    pub fn save_state(&self) -> Result<Value, PcError> {
        let core = self.cpu.core();
        Ok(json!({
            "version": STATE_VERSION,
            "model": serde_json::to_value(core.model())?,
            "regs": core.regs,
            "segs": serde_json::to_value(core.segs)?,
            "eip": core.eip,
            "flags": serde_json::to_value(core.flags)?,
            "protected": serde_json::to_value(&core.protected_mode)?,
            "fpu": serde_json::to_value(&core.fpu)?,
            "a20": self.cpu.bus().is_a20_enabled(),
        }))
    }

    /// Restore state produced by `save_state`
    pub fn load_state(&mut self, state: &Value) -> Result<(), PcError> {
        let version = state
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| PcError::StateFormat("missing version".into()))?;
        if version != STATE_VERSION as u64 {
            return Err(PcError::StateFormat(format!(
                "unsupported version {}",
                version
            )));
        }

        let field = |name: &str| -> Result<&Value, PcError> {
            state
                .get(name)
                .ok_or_else(|| PcError::StateFormat(format!("missing field {}", name)))
        };

        let regs: [u32; 8] = serde_json::from_value(field("regs")?.clone())?;
        let segs = serde_json::from_value(field("segs")?.clone())?;
        let eip = field("eip")?
            .as_u64()
            .ok_or_else(|| PcError::StateFormat("eip must be a number".into()))?;
        let flags = serde_json::from_value(field("flags")?.clone())?;
        let protected = serde_json::from_value(field("protected")?.clone())?;
        let fpu = serde_json::from_value(field("fpu")?.clone())?;
        let a20 = field("a20")?.as_bool().unwrap_or(false);

        let core = self.cpu.core_mut();
        core.regs = regs;
        core.segs = segs;
        core.eip = eip as u32;
        core.flags = flags;
        core.protected_mode = protected;
        core.fpu = fpu;
        self.cpu.bus_mut().set_a20(a20);
        Ok(())
    }
}
