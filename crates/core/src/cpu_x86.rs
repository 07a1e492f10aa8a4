//! x86 CPU core implementation (8086 through 80386)
//!
//! This module provides a reusable, generic x86 CPU implementation that can be
//! used by any system (IBM PC, AT, embedded re-creations, etc.) by implementing
//! the `MemoryX86` trait.
//!
//! The core executes the full real-mode instruction set plus the 80286/80386
//! protected-mode extensions: 32-bit registers and addressing, descriptor-table
//! protection, hardware task switching, paging and virtual-8086 mode. All
//! memory writes performed by an instruction are deferred in a write cache and
//! only committed once the instruction is known not to fault, so a faulting
//! instruction has no observable memory side effect.
//!
//! Protected-mode and paging logic lives in `cpu_x86_protected` and
//! `cpu_x86_mem`; the x87 FPU lives in `cpu_x86_fpu`.

use crate::cpu_x86_fpu::Fpu;
use crate::cpu_x86_mem::WriteCache;
use crate::cpu_x86_protected::ProtectedState;
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// CPU model/variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    /// Intel 8086 (1978) - Original 16-bit x86 processor
    Intel8086,
    /// Intel 80186 (1982) - Enhanced 8086 with additional instructions
    Intel80186,
    /// Intel 80286 (1982) - Protected mode support, 24-bit addressing
    Intel80286,
    /// Intel 80386 (1985) - 32-bit processor with paging and virtual-8086 mode
    #[default]
    Intel80386,
}

impl CpuModel {
    /// Returns true if this CPU model supports 80186+ instructions
    pub fn supports_80186_instructions(&self) -> bool {
        !matches!(self, CpuModel::Intel8086)
    }

    /// Returns true if this CPU model supports 80286+ instructions
    pub fn supports_80286_instructions(&self) -> bool {
        matches!(self, CpuModel::Intel80286 | CpuModel::Intel80386)
    }

    /// Returns true if this CPU model supports 80386+ instructions
    pub fn supports_80386_instructions(&self) -> bool {
        matches!(self, CpuModel::Intel80386)
    }

    /// Returns the name of the CPU model as a string
    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel8086 => "Intel 8086",
            CpuModel::Intel80186 => "Intel 80186",
            CpuModel::Intel80286 => "Intel 80286",
            CpuModel::Intel80386 => "Intel 80386",
        }
    }
}

/// Memory and I/O interface trait for the x86 CPU
///
/// Systems using the core must implement this trait to provide physical
/// memory. Port I/O and the interrupt-controller hookup have default stub
/// implementations so simple hosts (and tests) only need the two memory
/// functions; a real machine overrides them to dispatch to its devices.
pub trait MemoryX86 {
    /// Read a byte from physical memory at the given address
    fn read(&self, addr: u32) -> u8;

    /// Write a byte to physical memory at the given address
    fn write(&mut self, addr: u32, val: u8);

    /// Read a byte from an I/O port (default: open bus)
    fn io_read(&mut self, _port: u16) -> u8 {
        0xFF
    }

    /// Write a byte to an I/O port (default: no device claims it)
    fn io_write(&mut self, _port: u16, _val: u8) {}

    /// Return the highest-priority pending, unmasked interrupt vector and
    /// clear its request, or `None` when nothing is pending.
    ///
    /// The core only calls this at instruction boundaries and only while the
    /// interrupt flag is set.
    fn pending_interrupt(&mut self) -> Option<u8> {
        None
    }
}

// Segment register indices (x86 sreg encoding order)
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;

// General register indices (x86 reg encoding order)
pub const REG_EAX: usize = 0;
pub const REG_ECX: usize = 1;
pub const REG_EDX: usize = 2;
pub const REG_EBX: usize = 3;
pub const REG_ESP: usize = 4;
pub const REG_EBP: usize = 5;
pub const REG_ESI: usize = 6;
pub const REG_EDI: usize = 7;

// Exception vectors
pub const INT_DIVIDE_ERROR: u8 = 0x00;
pub const INT_DEBUG: u8 = 0x01;
pub const INT_NMI: u8 = 0x02;
pub const INT_BREAKPOINT: u8 = 0x03;
pub const INT_OVERFLOW: u8 = 0x04;
pub const INT_BOUND_RANGE: u8 = 0x05;
pub const INT_INVALID_OPCODE: u8 = 0x06;
pub const INT_NO_COPROCESSOR: u8 = 0x07;
pub const INT_DOUBLE_FAULT: u8 = 0x08;
pub const INT_INVALID_TSS: u8 = 0x0A;
pub const INT_SEGMENT_NOT_PRESENT: u8 = 0x0B;
pub const INT_STACK_FAULT: u8 = 0x0C;
pub const INT_GENERAL_PROTECTION: u8 = 0x0D;
pub const INT_PAGE_FAULT: u8 = 0x0E;
pub const INT_FPU_ERROR: u8 = 0x10;

/// A CPU exception raised while executing an instruction
///
/// Opcode handlers return `Result<_, Exception>`; the first raise propagates
/// out of the handler, so an exception is reported at most once per
/// instruction attempt. The execution loop discards the write cache, rolls the
/// architectural state back to the pre-instruction snapshot and then delivers
/// the exception through the interrupt mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// Exception vector number
    pub vector: u8,
    /// Error code pushed for vectors 8, 10-14 and 17
    pub error_code: Option<u16>,
}

impl Exception {
    /// Exception without an error code
    pub fn new(vector: u8) -> Self {
        Self {
            vector,
            error_code: None,
        }
    }

    /// Exception carrying an error code
    pub fn with_error(vector: u8, error_code: u16) -> Self {
        Self {
            vector,
            error_code: Some(error_code),
        }
    }

    /// General-protection fault with the faulting selector as error code
    pub fn gp(selector_error: u16) -> Self {
        Self::with_error(INT_GENERAL_PROTECTION, selector_error)
    }

    /// Invalid-opcode fault
    pub fn ud() -> Self {
        Self::new(INT_INVALID_OPCODE)
    }
}

/// Individual CPU status and control flags
///
/// Flags are stored as separate fields rather than a packed word; `pack` and
/// `unpack` convert to/from the EFLAGS image used by PUSHF/POPF, IRET and
/// interrupt dispatch. Reserved bit 1 is always set in the packed form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    pub carry: bool,
    pub parity: bool,
    pub adjust: bool,
    pub zero: bool,
    pub sign: bool,
    pub trap: bool,
    pub interrupt: bool,
    pub direction: bool,
    pub overflow: bool,
    /// I/O privilege level (bits 12-13)
    pub iopl: u8,
    pub nested_task: bool,
    pub resume: bool,
    /// Virtual-8086 mode (bit 17)
    pub v86: bool,
    pub alignment_check: bool,
    pub virtual_interrupt: bool,
    pub virtual_interrupt_pending: bool,
    pub id: bool,
}

impl Flags {
    /// Pack the individual flags into a 32-bit EFLAGS image
    pub fn pack(&self) -> u32 {
        let mut value: u32 = 0x0000_0002; // Reserved bit 1 is always set
        if self.carry {
            value |= 0x0000_0001;
        }
        if self.parity {
            value |= 0x0000_0004;
        }
        if self.adjust {
            value |= 0x0000_0010;
        }
        if self.zero {
            value |= 0x0000_0040;
        }
        if self.sign {
            value |= 0x0000_0080;
        }
        if self.trap {
            value |= 0x0000_0100;
        }
        if self.interrupt {
            value |= 0x0000_0200;
        }
        if self.direction {
            value |= 0x0000_0400;
        }
        if self.overflow {
            value |= 0x0000_0800;
        }
        value |= ((self.iopl & 3) as u32) << 12;
        if self.nested_task {
            value |= 0x0000_4000;
        }
        if self.resume {
            value |= 0x0001_0000;
        }
        if self.v86 {
            value |= 0x0002_0000;
        }
        if self.alignment_check {
            value |= 0x0004_0000;
        }
        if self.virtual_interrupt {
            value |= 0x0008_0000;
        }
        if self.virtual_interrupt_pending {
            value |= 0x0010_0000;
        }
        if self.id {
            value |= 0x0020_0000;
        }
        value
    }

    /// Unpack every flag bit from an EFLAGS image, with no privilege checks
    ///
    /// Used by reset, task switching and interrupt return paths where the full
    /// image is architecturally loaded.
    pub fn unpack_all(&mut self, value: u32) {
        self.carry = (value & 0x0000_0001) != 0;
        self.parity = (value & 0x0000_0004) != 0;
        self.adjust = (value & 0x0000_0010) != 0;
        self.zero = (value & 0x0000_0040) != 0;
        self.sign = (value & 0x0000_0080) != 0;
        self.trap = (value & 0x0000_0100) != 0;
        self.interrupt = (value & 0x0000_0200) != 0;
        self.direction = (value & 0x0000_0400) != 0;
        self.overflow = (value & 0x0000_0800) != 0;
        self.iopl = ((value >> 12) & 3) as u8;
        self.nested_task = (value & 0x0000_4000) != 0;
        self.resume = (value & 0x0001_0000) != 0;
        self.v86 = (value & 0x0002_0000) != 0;
        self.alignment_check = (value & 0x0004_0000) != 0;
        self.virtual_interrupt = (value & 0x0008_0000) != 0;
        self.virtual_interrupt_pending = (value & 0x0010_0000) != 0;
        self.id = (value & 0x0020_0000) != 0;
    }

    /// Unpack an EFLAGS image with POPF privilege restrictions
    ///
    /// IOPL only changes at CPL 0; IF only changes when CPL <= IOPL. VM and RF
    /// are never loaded from a popped word.
    pub fn unpack(&mut self, value: u32, cpl: u8) {
        let old_iopl = self.iopl;
        let old_if = self.interrupt;
        let old_vm = self.v86;
        let old_rf = self.resume;
        self.unpack_all(value);
        self.v86 = old_vm;
        self.resume = old_rf;
        if cpl != 0 {
            self.iopl = old_iopl;
            if cpl > old_iopl {
                self.interrupt = old_if;
            }
        }
    }
}

/// Cached segment register state
///
/// The selector is what software sees; base/limit/attributes are the shadow
/// copy recomputed by `load_segment` every time the selector is written. In
/// real mode the base is always `selector << 4`; in protected mode it comes
/// from the descriptor table. Nothing else mutates the cache, which keeps the
/// selector and its shadow state consistent by construction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentRegister {
    /// Visible 16-bit selector
    pub selector: u16,
    /// Cached linear base address
    pub base: u32,
    /// Cached segment limit (byte granularity, already scaled)
    pub limit: u32,
    /// Default operand/address size is 32-bit (D/B bit)
    pub default_32: bool,
    /// Expand-down data segment
    pub expand_down: bool,
}

impl SegmentRegister {
    /// Real-mode segment with the given selector
    pub fn real_mode(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            default_32: false,
            expand_down: false,
        }
    }
}

impl Default for SegmentRegister {
    fn default() -> Self {
        Self::real_mode(0)
    }
}

/// Repeat prefix kind for string instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rep {
    /// REP/REPE/REPZ (0xF3)
    Rep,
    /// REPNE/REPNZ (0xF2)
    RepNe,
}

/// Per-instruction decode scratch state
///
/// Collected while consuming prefix bytes and the ModRM/SIB/displacement
/// fields, then threaded explicitly through the opcode handlers. A fresh value
/// is built for every instruction; nothing here survives across instructions.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Instr {
    /// Linear-fetch EIP of the first prefix byte, used by REP re-dispatch
    pub start_eip: u32,
    /// Segment override prefix, if any
    pub seg_override: Option<usize>,
    /// Effective operand size is 32-bit (CS default xor 0x66)
    pub operand_32: bool,
    /// Effective address size is 32-bit (CS default xor 0x67)
    pub address_32: bool,
    /// Repeat prefix for string instructions
    pub rep: Option<Rep>,
    /// Raw ModRM byte
    pub modrm: u8,
    /// ModRM mode field (bits 6-7)
    pub mode: u8,
    /// ModRM reg field (bits 3-5)
    pub reg: u8,
    /// ModRM rm field (bits 0-2)
    pub rm: u8,
    /// Resolved linear address for a memory operand
    pub ea: u32,
    /// Segment-relative offset of the memory operand (LEA uses this)
    pub ea_off: u32,
    /// Segment the memory operand resolved through
    pub ea_seg: usize,
}

impl Instr {
    fn new(start_eip: u32, code_32: bool) -> Self {
        Self {
            start_eip,
            seg_override: None,
            operand_32: code_32,
            address_32: code_32,
            rep: None,
            modrm: 0,
            mode: 0,
            reg: 0,
            rm: 0,
            ea: 0,
            ea_off: 0,
            ea_seg: SEG_DS,
        }
    }
}

/// Host callback installed for a real-mode software interrupt vector
///
/// Used for BIOS-call shortcuts: when present, the callback runs instead of
/// the default real-mode vector dispatch.
pub type IntCallback<M> = fn(&mut CpuX86<M>);

/// Snapshot of the architectural state taken at instruction entry
///
/// Restored wholesale when the instruction faults, so a faulting instruction
/// leaves no trace beyond the fault's own side effects (CR2 for page faults).
#[derive(Clone)]
pub(crate) struct CpuSnapshot {
    regs: [u32; 8],
    segs: [SegmentRegister; 6],
    eip: u32,
    flags: Flags,
    protected: ProtectedState,
    fpu: Fpu,
    halted: bool,
}

/// x86 CPU state and execution engine
///
/// This is a generic, reusable x86 implementation that works with any system
/// through the `MemoryX86` trait.
#[derive(Debug)]
pub struct CpuX86<M: MemoryX86> {
    /// General-purpose register file, indexed by x86 reg encoding
    /// (EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI). 16-bit and 8-bit views are
    /// provided by the accessor functions; a narrow write never disturbs the
    /// remaining bits of the register.
    pub regs: [u32; 8],

    /// Segment registers with cached base/limit/attributes,
    /// indexed ES, CS, SS, DS, FS, GS
    pub segs: [SegmentRegister; 6],

    /// Instruction pointer (low 16 bits are IP in 16-bit code)
    pub eip: u32,

    /// Status and control flags
    pub flags: Flags,

    /// Protected-mode state: control registers, descriptor-table registers,
    /// task register, current privilege level
    pub protected_mode: ProtectedState,

    /// x87 floating-point unit
    pub fpu: Fpu,

    /// Total cycles executed
    pub cycles: u64,

    /// Memory interface
    pub memory: M,

    /// Halt flag (HLT executed, waiting for an interrupt)
    halted: bool,

    /// CPU model
    model: CpuModel,

    /// Deferred memory writes for the in-flight instruction
    pub(crate) write_cache: WriteCache,

    /// Host-installed real-mode interrupt callbacks
    int_callbacks: [Option<IntCallback<M>>; 256],
}

impl<M: MemoryX86> CpuX86<M> {
    /// Create a new CPU (80386 model) with the given memory interface
    pub fn new(memory: M) -> Self {
        Self::with_model(memory, CpuModel::Intel80386)
    }

    /// Create a new CPU with a specific model
    pub fn with_model(memory: M, model: CpuModel) -> Self {
        let mut cpu = Self {
            regs: [0; 8],
            segs: [SegmentRegister::default(); 6],
            eip: 0,
            flags: Flags::default(),
            protected_mode: ProtectedState::new(),
            fpu: Fpu::new(),
            cycles: 0,
            memory,
            halted: false,
            model,
            write_cache: WriteCache::new(),
            int_callbacks: [None; 256],
        };
        cpu.reset_state();
        cpu
    }

    /// Get the CPU model
    pub fn model(&self) -> CpuModel {
        self.model
    }

    /// Set the CPU model
    pub fn set_model(&mut self, model: CpuModel) {
        self.model = model;
    }

    /// Check if the CPU is halted
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Set the CPU halted state
    ///
    /// When halted, the CPU will not execute instructions until an unmasked
    /// interrupt arrives or it is unhalted explicitly.
    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Install a native handler for a real-mode software interrupt
    ///
    /// The callback takes priority over the default real-mode vector dispatch
    /// for INT instructions; hardware interrupts and protected-mode dispatch
    /// are unaffected.
    pub fn register_int_callback(&mut self, vector: u8, callback: IntCallback<M>) {
        self.int_callbacks[vector as usize] = Some(callback);
    }

    /// Remove a previously installed interrupt callback
    pub fn clear_int_callback(&mut self, vector: u8) {
        self.int_callbacks[vector as usize] = None;
    }

    pub(crate) fn int_callback(&self, vector: u8) -> Option<IntCallback<M>> {
        self.int_callbacks[vector as usize]
    }

    /// Reset the CPU to power-on state (preserves memory, model and callbacks)
    fn reset_state(&mut self) {
        self.regs = [0; 8];
        self.segs = [SegmentRegister::default(); 6];
        self.segs[SEG_CS] = SegmentRegister::real_mode(0xFFFF);
        self.eip = 0;
        self.flags = Flags::default();
        self.cycles = 0;
        self.halted = false;
        self.write_cache.discard();
        self.protected_mode.reset();
        self.fpu.reset();
    }

    // ------------------------------------------------------------------
    // Register file accessors
    //
    // The backing store is eight 32-bit registers; 16-bit aliases are the low
    // half, 8-bit aliases follow the AL/CL/DL/BL/AH/CH/DH/BH encoding (index
    // 0-3 = low byte of regs[0..4], index 4-7 = second byte of regs[0..4]).
    // ------------------------------------------------------------------

    /// Get an 8-bit register by x86 encoding
    #[inline]
    pub fn get_reg8(&self, reg: u8) -> u8 {
        debug_assert!(reg < 8, "Invalid 8-bit register index: {}", reg);
        let reg = reg as usize;
        if reg < 4 {
            (self.regs[reg] & 0xFF) as u8
        } else {
            ((self.regs[reg - 4] >> 8) & 0xFF) as u8
        }
    }

    /// Set an 8-bit register by x86 encoding
    #[inline]
    pub fn set_reg8(&mut self, reg: u8, val: u8) {
        debug_assert!(reg < 8, "Invalid 8-bit register index: {}", reg);
        let reg = reg as usize;
        if reg < 4 {
            self.regs[reg] = (self.regs[reg] & 0xFFFF_FF00) | (val as u32);
        } else {
            self.regs[reg - 4] = (self.regs[reg - 4] & 0xFFFF_00FF) | ((val as u32) << 8);
        }
    }

    /// Get a 16-bit register by x86 encoding
    #[inline]
    pub fn get_reg16(&self, reg: u8) -> u16 {
        debug_assert!(reg < 8, "Invalid 16-bit register index: {}", reg);
        (self.regs[reg as usize] & 0xFFFF) as u16
    }

    /// Set a 16-bit register, preserving the upper half of the 32-bit register
    #[inline]
    pub fn set_reg16(&mut self, reg: u8, val: u16) {
        debug_assert!(reg < 8, "Invalid 16-bit register index: {}", reg);
        let reg = reg as usize;
        self.regs[reg] = (self.regs[reg] & 0xFFFF_0000) | (val as u32);
    }

    /// Get a 32-bit register by x86 encoding
    #[inline]
    pub fn get_reg32(&self, reg: u8) -> u32 {
        debug_assert!(reg < 8, "Invalid 32-bit register index: {}", reg);
        self.regs[reg as usize]
    }

    /// Set a 32-bit register by x86 encoding
    #[inline]
    pub fn set_reg32(&mut self, reg: u8, val: u32) {
        debug_assert!(reg < 8, "Invalid 32-bit register index: {}", reg);
        self.regs[reg as usize] = val;
    }

    /// Read a register at the instruction's operand size
    #[inline]
    pub(crate) fn get_reg(&self, reg: u8, size_32: bool) -> u32 {
        if size_32 {
            self.get_reg32(reg)
        } else {
            self.get_reg16(reg) as u32
        }
    }

    /// Write a register at the instruction's operand size
    #[inline]
    pub(crate) fn set_reg(&mut self, reg: u8, val: u32, size_32: bool) {
        if size_32 {
            self.set_reg32(reg, val);
        } else {
            self.set_reg16(reg, val as u16);
        }
    }

    // ------------------------------------------------------------------
    // Flag helpers
    // ------------------------------------------------------------------

    /// Calculate parity (true if even number of 1 bits in low byte)
    #[inline]
    pub(crate) fn calc_parity(val: u8) -> bool {
        val.count_ones() % 2 == 0
    }

    /// Update SF/ZF/PF after an 8-bit operation
    #[inline]
    pub(crate) fn update_flags_szp8(&mut self, result: u8) {
        self.flags.zero = result == 0;
        self.flags.sign = (result & 0x80) != 0;
        self.flags.parity = Self::calc_parity(result);
    }

    /// Update SF/ZF/PF after a 16-bit operation
    #[inline]
    pub(crate) fn update_flags_szp16(&mut self, result: u16) {
        self.flags.zero = result == 0;
        self.flags.sign = (result & 0x8000) != 0;
        self.flags.parity = Self::calc_parity((result & 0xFF) as u8);
    }

    /// Update SF/ZF/PF after a 32-bit operation
    #[inline]
    pub(crate) fn update_flags_szp32(&mut self, result: u32) {
        self.flags.zero = result == 0;
        self.flags.sign = (result & 0x8000_0000) != 0;
        self.flags.parity = Self::calc_parity((result & 0xFF) as u8);
    }

    /// Check condition code for Jcc/SETcc/conditional instructions
    ///
    /// Condition codes: 0=O, 1=NO, 2=B/C, 3=NB/NC, 4=E/Z, 5=NE/NZ, 6=BE,
    /// 7=NBE, 8=S, 9=NS, A=P, B=NP, C=L, D=NL, E=LE, F=NLE
    #[inline]
    pub(crate) fn check_condition(&self, condition: u8) -> bool {
        let f = &self.flags;
        match condition & 0xF {
            0x0 => f.overflow,
            0x1 => !f.overflow,
            0x2 => f.carry,
            0x3 => !f.carry,
            0x4 => f.zero,
            0x5 => !f.zero,
            0x6 => f.carry || f.zero,
            0x7 => !f.carry && !f.zero,
            0x8 => f.sign,
            0x9 => !f.sign,
            0xA => f.parity,
            0xB => !f.parity,
            0xC => f.sign != f.overflow,
            0xD => f.sign == f.overflow,
            0xE => f.zero || (f.sign != f.overflow),
            _ => !f.zero && (f.sign == f.overflow),
        }
    }

    // ------------------------------------------------------------------
    // Instruction fetch
    // ------------------------------------------------------------------

    /// Advance EIP, wrapping at 64K in 16-bit code segments
    #[inline]
    fn advance_eip(&mut self, by: u32) {
        if self.segs[SEG_CS].default_32 {
            self.eip = self.eip.wrapping_add(by);
        } else {
            self.eip = self.eip.wrapping_add(by) & 0xFFFF;
        }
    }

    /// Fetch the next code byte at CS:EIP
    #[inline]
    pub(crate) fn fetch_u8(&mut self) -> Result<u8, Exception> {
        let linear = self.segs[SEG_CS].base.wrapping_add(self.eip);
        let val = self.cpu_read(linear)?;
        self.advance_eip(1);
        Ok(val)
    }

    /// Fetch a 16-bit immediate (little-endian)
    #[inline]
    pub(crate) fn fetch_u16(&mut self) -> Result<u16, Exception> {
        let low = self.fetch_u8()? as u16;
        let high = self.fetch_u8()? as u16;
        Ok((high << 8) | low)
    }

    /// Fetch a 32-bit immediate (little-endian)
    #[inline]
    pub(crate) fn fetch_u32(&mut self) -> Result<u32, Exception> {
        let low = self.fetch_u16()? as u32;
        let high = self.fetch_u16()? as u32;
        Ok((high << 16) | low)
    }

    /// Fetch a 16- or 32-bit immediate at the instruction's operand size
    #[inline]
    pub(crate) fn fetch_imm(&mut self, size_32: bool) -> Result<u32, Exception> {
        if size_32 {
            self.fetch_u32()
        } else {
            Ok(self.fetch_u16()? as u32)
        }
    }

    // ------------------------------------------------------------------
    // Addressing-mode resolver (ModRM/SIB decode)
    // ------------------------------------------------------------------

    /// Fetch and decode the ModRM byte, resolving a memory operand's linear
    /// address when mode != 3
    pub(crate) fn fetch_modrm(&mut self, instr: &mut Instr) -> Result<(), Exception> {
        let modrm = self.fetch_u8()?;
        instr.modrm = modrm;
        instr.mode = modrm >> 6;
        instr.reg = (modrm >> 3) & 7;
        instr.rm = modrm & 7;
        if instr.mode != 3 {
            self.resolve_ea(instr)?;
        }
        Ok(())
    }

    /// Compute the effective address for a memory operand
    ///
    /// Honors the address-size attribute (16- vs 32-bit effective-address
    /// arithmetic) and the default-segment rule: BP/ESP/EBP-based forms
    /// address the stack segment unless a segment override is present.
    fn resolve_ea(&mut self, instr: &mut Instr) -> Result<(), Exception> {
        let (offset, default_seg) = if instr.address_32 {
            self.resolve_ea32(instr)?
        } else {
            self.resolve_ea16(instr)?
        };
        let seg = instr.seg_override.unwrap_or(default_seg);
        instr.ea_seg = seg;
        instr.ea_off = offset;
        instr.ea = self.segs[seg].base.wrapping_add(offset);
        Ok(())
    }

    /// 16-bit effective-address forms (BX+SI, BP+DI, disp16, ...)
    fn resolve_ea16(&mut self, instr: &Instr) -> Result<(u32, usize), Exception> {
        let disp: u16 = match instr.mode {
            0 => {
                if instr.rm == 6 {
                    // mode 0, rm 6 is a bare disp16 with no base register
                    let disp = self.fetch_u16()?;
                    return Ok((disp as u32, SEG_DS));
                }
                0
            }
            1 => self.fetch_u8()? as i8 as i16 as u16,
            _ => self.fetch_u16()?,
        };

        let bx = self.get_reg16(REG_EBX as u8);
        let bp = self.get_reg16(REG_EBP as u8);
        let si = self.get_reg16(REG_ESI as u8);
        let di = self.get_reg16(REG_EDI as u8);

        let (base, seg) = match instr.rm {
            0 => (bx.wrapping_add(si), SEG_DS),
            1 => (bx.wrapping_add(di), SEG_DS),
            2 => (bp.wrapping_add(si), SEG_SS),
            3 => (bp.wrapping_add(di), SEG_SS),
            4 => (si, SEG_DS),
            5 => (di, SEG_DS),
            6 => (bp, SEG_SS),
            _ => (bx, SEG_DS),
        };
        Ok(((base.wrapping_add(disp)) as u32, seg))
    }

    /// 32-bit effective-address forms, including the SIB byte
    fn resolve_ea32(&mut self, instr: &Instr) -> Result<(u32, usize), Exception> {
        let mut seg = SEG_DS;
        let mut offset: u32;

        if instr.rm == 4 {
            // SIB byte: scale*index + base
            let sib = self.fetch_u8()?;
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let base = sib & 7;

            offset = if index == 4 {
                0
            } else {
                self.get_reg32(index) << scale
            };

            if base == 5 && instr.mode == 0 {
                offset = offset.wrapping_add(self.fetch_u32()?);
            } else {
                if base == 4 || base == 5 {
                    seg = SEG_SS;
                }
                offset = offset.wrapping_add(self.get_reg32(base));
            }
        } else if instr.rm == 5 && instr.mode == 0 {
            offset = self.fetch_u32()?;
        } else {
            if instr.rm == 5 {
                seg = SEG_SS;
            }
            offset = self.get_reg32(instr.rm);
        }

        match instr.mode {
            1 => offset = offset.wrapping_add(self.fetch_u8()? as i8 as i32 as u32),
            2 => offset = offset.wrapping_add(self.fetch_u32()?),
            _ => {}
        }
        Ok((offset, seg))
    }

    // ------------------------------------------------------------------
    // ModRM operand access
    // ------------------------------------------------------------------

    /// Read the r/m operand as a byte
    #[inline]
    pub(crate) fn read_rm8(&mut self, instr: &Instr) -> Result<u8, Exception> {
        if instr.mode == 3 {
            Ok(self.get_reg8(instr.rm))
        } else {
            self.cpu_read(instr.ea)
        }
    }

    /// Write the r/m operand as a byte
    #[inline]
    pub(crate) fn write_rm8(&mut self, instr: &Instr, val: u8) -> Result<(), Exception> {
        if instr.mode == 3 {
            self.set_reg8(instr.rm, val);
            Ok(())
        } else {
            self.cpu_write(instr.ea, val)
        }
    }

    /// Read the r/m operand as a word
    #[inline]
    pub(crate) fn read_rm16(&mut self, instr: &Instr) -> Result<u16, Exception> {
        if instr.mode == 3 {
            Ok(self.get_reg16(instr.rm))
        } else {
            self.cpu_read_u16(instr.ea)
        }
    }

    /// Write the r/m operand as a word
    #[inline]
    pub(crate) fn write_rm16(&mut self, instr: &Instr, val: u16) -> Result<(), Exception> {
        if instr.mode == 3 {
            self.set_reg16(instr.rm, val);
            Ok(())
        } else {
            self.cpu_write_u16(instr.ea, val)
        }
    }

    /// Read the r/m operand as a dword
    #[inline]
    pub(crate) fn read_rm32(&mut self, instr: &Instr) -> Result<u32, Exception> {
        if instr.mode == 3 {
            Ok(self.get_reg32(instr.rm))
        } else {
            self.cpu_read_u32(instr.ea)
        }
    }

    /// Write the r/m operand as a dword
    #[inline]
    pub(crate) fn write_rm32(&mut self, instr: &Instr, val: u32) -> Result<(), Exception> {
        if instr.mode == 3 {
            self.set_reg32(instr.rm, val);
            Ok(())
        } else {
            self.cpu_write_u32(instr.ea, val)
        }
    }

    /// Read the r/m operand at the instruction's operand size
    #[inline]
    pub(crate) fn read_rm(&mut self, instr: &Instr) -> Result<u32, Exception> {
        if instr.operand_32 {
            self.read_rm32(instr)
        } else {
            Ok(self.read_rm16(instr)? as u32)
        }
    }

    /// Write the r/m operand at the instruction's operand size
    #[inline]
    pub(crate) fn write_rm(&mut self, instr: &Instr, val: u32) -> Result<(), Exception> {
        if instr.operand_32 {
            self.write_rm32(instr, val)
        } else {
            self.write_rm16(instr, val as u16)
        }
    }

    // ------------------------------------------------------------------
    // Stack operations
    //
    // The stack-pointer width follows the SS descriptor's D/B bit (ESP in
    // 32-bit stacks, SP in 16-bit stacks); the pushed width follows the
    // instruction's operand size.
    // ------------------------------------------------------------------

    #[inline]
    fn stack_ptr(&self) -> u32 {
        if self.segs[SEG_SS].default_32 {
            self.regs[REG_ESP]
        } else {
            self.regs[REG_ESP] & 0xFFFF
        }
    }

    #[inline]
    fn set_stack_ptr(&mut self, sp: u32) {
        if self.segs[SEG_SS].default_32 {
            self.regs[REG_ESP] = sp;
        } else {
            self.set_reg16(REG_ESP as u8, sp as u16);
        }
    }

    /// Push a word onto the stack
    pub(crate) fn push16(&mut self, val: u16) -> Result<(), Exception> {
        let sp = self.stack_ptr().wrapping_sub(2) & self.stack_mask();
        self.write_virt16(SEG_SS, sp, val)?;
        self.set_stack_ptr(sp);
        Ok(())
    }

    /// Push a dword onto the stack
    pub(crate) fn push32(&mut self, val: u32) -> Result<(), Exception> {
        let sp = self.stack_ptr().wrapping_sub(4) & self.stack_mask();
        self.write_virt32(SEG_SS, sp, val)?;
        self.set_stack_ptr(sp);
        Ok(())
    }

    /// Pop a word from the stack
    pub(crate) fn pop16(&mut self) -> Result<u16, Exception> {
        let sp = self.stack_ptr();
        let val = self.read_virt16(SEG_SS, sp)?;
        self.set_stack_ptr(sp.wrapping_add(2) & self.stack_mask());
        Ok(val)
    }

    /// Pop a dword from the stack
    pub(crate) fn pop32(&mut self) -> Result<u32, Exception> {
        let sp = self.stack_ptr();
        let val = self.read_virt32(SEG_SS, sp)?;
        self.set_stack_ptr(sp.wrapping_add(4) & self.stack_mask());
        Ok(val)
    }

    #[inline]
    fn stack_mask(&self) -> u32 {
        if self.segs[SEG_SS].default_32 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Push at the instruction's operand size
    #[inline]
    pub(crate) fn push_sized(&mut self, val: u32, size_32: bool) -> Result<(), Exception> {
        if size_32 {
            self.push32(val)
        } else {
            self.push16(val as u16)
        }
    }

    /// Pop at the instruction's operand size
    #[inline]
    pub(crate) fn pop_sized(&mut self, size_32: bool) -> Result<u32, Exception> {
        if size_32 {
            self.pop32()
        } else {
            Ok(self.pop16()? as u32)
        }
    }

    // ------------------------------------------------------------------
    // Snapshot / rollback
    // ------------------------------------------------------------------

    pub(crate) fn snapshot(&self) -> CpuSnapshot {
        CpuSnapshot {
            regs: self.regs,
            segs: self.segs,
            eip: self.eip,
            flags: self.flags,
            protected: self.protected_mode.clone(),
            fpu: self.fpu.clone(),
            halted: self.halted,
        }
    }

    pub(crate) fn restore(&mut self, snapshot: &CpuSnapshot) {
        self.regs = snapshot.regs;
        self.segs = snapshot.segs;
        self.eip = snapshot.eip;
        self.flags = snapshot.flags;
        self.protected_mode = snapshot.protected.clone();
        self.fpu = snapshot.fpu.clone();
        self.halted = snapshot.halted;
    }

    // ------------------------------------------------------------------
    // Execution loop
    // ------------------------------------------------------------------

    /// Execute a single instruction, committing or rolling back its effects
    ///
    /// Returns the cycles consumed. A halted CPU consumes one idle cycle.
    pub fn step(&mut self) -> u32 {
        if self.halted {
            self.cycles += 1;
            return 1;
        }

        // TF is sampled before the instruction; the trap is delivered after
        // the instruction completes, unless the instruction itself cleared TF
        // (INT does this, so handlers are not traced).
        let trap_pending = self.flags.trap;

        let snapshot = self.snapshot();
        let cycles = match self.execute_one() {
            Ok(cycles) => {
                self.commit_writes();
                cycles
            }
            Err(exception) => {
                log(LogCategory::Cpu, LogLevel::Debug, || {
                    format!(
                        "exception {:02X} (error {:?}) at {:04X}:{:08X}",
                        exception.vector, exception.error_code, self.segs[SEG_CS].selector, snapshot.eip
                    )
                });
                self.write_cache.discard();
                // CR2 is a side effect of the fault itself and survives the
                // rollback.
                let cr2 = self.protected_mode.cr2;
                self.restore(&snapshot);
                self.protected_mode.cr2 = cr2;
                self.handle_exception(exception);
                16
            }
        };

        if trap_pending && self.flags.trap {
            self.handle_exception(Exception::new(INT_DEBUG));
        }

        self.cycles += cycles as u64;
        cycles
    }

    /// Run up to `count` instructions
    ///
    /// Checks the external interrupt controller once per iteration (never
    /// mid-instruction) and stops early when the CPU is halted with no
    /// interrupt pending. Returns the number of instructions retired.
    pub fn exec(&mut self, count: u32) -> u32 {
        let mut executed = 0;
        while executed < count {
            if self.flags.interrupt {
                if let Some(vector) = self.memory.pending_interrupt() {
                    log(LogCategory::Interrupts, LogLevel::Trace, || {
                        format!("hardware interrupt {:02X}", vector)
                    });
                    self.halted = false;
                    self.deliver_hardware_interrupt(vector);
                }
            }
            if self.halted {
                break;
            }
            self.step();
            executed += 1;
        }
        executed
    }

    /// Reset the CPU to initial power-on state (preserves memory and model)
    pub fn reset(&mut self) {
        self.reset_state();
    }

    /// Fetch prefixes and dispatch one opcode
    fn execute_one(&mut self) -> Result<u32, Exception> {
        let code_32 = self.segs[SEG_CS].default_32;
        let mut instr = Instr::new(self.eip, code_32);

        loop {
            let byte = self.fetch_u8()?;
            match byte {
                0x26 => instr.seg_override = Some(SEG_ES),
                0x2E => instr.seg_override = Some(SEG_CS),
                0x36 => instr.seg_override = Some(SEG_SS),
                0x3E => instr.seg_override = Some(SEG_DS),
                0x64 if self.model.supports_80386_instructions() => {
                    instr.seg_override = Some(SEG_FS)
                }
                0x65 if self.model.supports_80386_instructions() => {
                    instr.seg_override = Some(SEG_GS)
                }
                0x66 if self.model.supports_80386_instructions() => {
                    instr.operand_32 = !code_32
                }
                0x67 if self.model.supports_80386_instructions() => {
                    instr.address_32 = !code_32
                }
                // LOCK prefix: single-core model, bus locking is a no-op
                0xF0 => {}
                0xF2 => instr.rep = Some(Rep::RepNe),
                0xF3 => instr.rep = Some(Rep::Rep),
                opcode => return self.execute(opcode, &mut instr),
            }
        }
    }

    /// Commit the write cache to memory in insertion order
    pub(crate) fn commit_writes(&mut self) {
        for i in 0..self.write_cache.len() {
            let (addr, val) = self.write_cache.entry(i);
            self.memory.write(addr, val);
        }
        self.write_cache.discard();
    }

    /// Deliver a hardware interrupt at an instruction boundary
    fn deliver_hardware_interrupt(&mut self, vector: u8) {
        let snapshot = self.snapshot();
        match self.dispatch_interrupt(vector, false, true, None) {
            Ok(()) => self.commit_writes(),
            Err(exception) => {
                self.write_cache.discard();
                self.restore(&snapshot);
                self.handle_exception(exception);
            }
        }
    }

    /// Deliver a CPU exception, escalating to double fault and reset
    ///
    /// The faulting instruction's state has already been rolled back; dispatch
    /// failures escalate to a double fault, and a failing double fault resets
    /// the CPU (triple-fault behavior).
    pub(crate) fn handle_exception(&mut self, exception: Exception) {
        let snapshot = self.snapshot();
        match self.dispatch_interrupt(exception.vector, false, true, exception.error_code) {
            Ok(()) => {
                self.commit_writes();
                return;
            }
            Err(second) => {
                log(LogCategory::Interrupts, LogLevel::Warn, || {
                    format!(
                        "double fault: vector {:02X} raised {:02X} during delivery",
                        exception.vector, second.vector
                    )
                });
                self.write_cache.discard();
                self.restore(&snapshot);
            }
        }
        match self.dispatch_interrupt(INT_DOUBLE_FAULT, false, true, Some(0)) {
            Ok(()) => self.commit_writes(),
            Err(_) => {
                log(LogCategory::Cpu, LogLevel::Error, || {
                    "triple fault: resetting CPU".to_string()
                });
                self.write_cache.discard();
                self.reset_state();
            }
        }
    }
}

impl<M: MemoryX86> crate::Cpu for CpuX86<M> {
    fn reset(&mut self) {
        CpuX86::reset(self);
    }

    fn step(&mut self) -> u32 {
        CpuX86::step(self)
    }
}

/// Simple flat memory used by tests and benchmarks
///
/// Backs the full 16 MB 80286-style physical space with a plain byte array;
/// out-of-range accesses behave like unmapped memory (reads 0xFF, writes
/// dropped).
#[derive(Debug)]
pub struct ArrayMemory {
    ram: Vec<u8>,
}

impl ArrayMemory {
    /// 16 MB flat memory, zero-filled
    pub fn new() -> Self {
        Self {
            ram: vec![0; 0x100_0000],
        }
    }

    /// Copy a program image to the given physical address
    pub fn load_program(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        self.ram[start..start + data.len()].copy_from_slice(data);
    }
}

impl Default for ArrayMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryX86 for ArrayMemory {
    fn read(&self, addr: u32) -> u8 {
        self.ram.get(addr as usize).copied().unwrap_or(0xFF)
    }

    fn write(&mut self, addr: u32, val: u8) {
        if let Some(slot) = self.ram.get_mut(addr as usize) {
            *slot = val;
        }
    }
}

#[cfg(test)]
mod tests_alu;
#[cfg(test)]
mod tests_flags;
#[cfg(test)]
mod tests_fpu;
#[cfg(test)]
mod tests_interrupts;
#[cfg(test)]
mod tests_mem;
#[cfg(test)]
mod tests_protected;
#[cfg(test)]
mod tests_string;
