//! x87 floating-point unit
//!
//! An 8-deep circular register stack with per-slot tags, executing the
//! 0xD8-0xDF escape opcodes against the CPU's linear-memory interface. The
//! backing representation is `f64`; the 80-bit extended format used by memory
//! operands is packed and unpacked manually since no host type represents it.
//!
//! Stack overflow/underflow and the IEEE special cases (division by zero,
//! indeterminate forms) set the sticky status-word bits and produce
//! infinities or NaNs - they never raise a host floating-point trap.

use crate::cpu_x86::{CpuX86, Exception, Instr, MemoryX86, INT_NO_COPROCESSOR, REG_EAX};
use crate::cpu_x86_protected::{CR0_EM, CR0_TS};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

// Status-word bits
pub const FSW_IE: u16 = 0x0001; // invalid operation
pub const FSW_DE: u16 = 0x0002; // denormalized operand
pub const FSW_ZE: u16 = 0x0004; // zero divide
pub const FSW_OE: u16 = 0x0008; // overflow
pub const FSW_UE: u16 = 0x0010; // underflow
pub const FSW_PE: u16 = 0x0020; // precision
pub const FSW_SF: u16 = 0x0040; // stack fault
pub const FSW_ES: u16 = 0x0080; // error summary
pub const FSW_C0: u16 = 0x0100;
pub const FSW_C1: u16 = 0x0200;
pub const FSW_C2: u16 = 0x0400;
pub const FSW_C3: u16 = 0x4000;
const FSW_TOP_MASK: u16 = 0x3800;

/// Power-on control word: all exceptions masked, extended precision,
/// round-to-nearest
const FCW_DEFAULT: u16 = 0x037F;

/// Per-slot register tag
///
/// A slot's tag and value are only ever updated together (`set_phys` is the
/// single mutator), so the tag word can never disagree with the registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FpuTag {
    Valid = 0,
    Zero = 1,
    Special = 2,
    Empty = 3,
}

/// x87 FPU state: the register stack, tags and control/status words
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fpu {
    regs: [f64; 8],
    tags: [FpuTag; 8],
    pub control: u16,
    pub status: u16,
}

impl Fpu {
    pub fn new() -> Self {
        Self {
            regs: [0.0; 8],
            tags: [FpuTag::Empty; 8],
            control: FCW_DEFAULT,
            status: 0,
        }
    }

    /// FINIT: reset control/status/tags to power-on state
    pub fn reset(&mut self) {
        self.regs = [0.0; 8];
        self.tags = [FpuTag::Empty; 8];
        self.control = FCW_DEFAULT;
        self.status = 0;
    }

    /// Current top-of-stack pointer (0-7, encoded in the status word)
    #[inline]
    pub fn top(&self) -> usize {
        ((self.status & FSW_TOP_MASK) >> 11) as usize
    }

    #[inline]
    fn set_top(&mut self, top: usize) {
        self.status = (self.status & !FSW_TOP_MASK) | (((top & 7) as u16) << 11);
    }

    /// Physical slot index of st(i)
    #[inline]
    fn phys(&self, sti: usize) -> usize {
        (self.top() + sti) & 7
    }

    fn tag_for(val: f64) -> FpuTag {
        if val == 0.0 {
            FpuTag::Zero
        } else if val.is_nan() || val.is_infinite() {
            FpuTag::Special
        } else {
            FpuTag::Valid
        }
    }

    /// Store a value and its tag into a physical slot (the only slot mutator)
    #[inline]
    fn set_phys(&mut self, slot: usize, val: f64, tag: FpuTag) {
        self.regs[slot] = val;
        self.tags[slot] = tag;
    }

    /// Tag of st(i)
    pub fn tag(&self, sti: usize) -> FpuTag {
        self.tags[self.phys(sti)]
    }

    /// Read st(i); an empty slot is a stack underflow yielding indefinite NaN
    pub fn get_st(&mut self, sti: usize) -> f64 {
        let slot = self.phys(sti);
        if self.tags[slot] == FpuTag::Empty {
            self.status |= FSW_IE | FSW_SF;
            return f64::NAN;
        }
        self.regs[slot]
    }

    /// Write st(i), retagging from the value
    pub fn set_st(&mut self, sti: usize, val: f64) {
        let slot = self.phys(sti);
        self.set_phys(slot, val, Self::tag_for(val));
    }

    /// Push a value; pushing onto a full slot is a stack overflow
    pub fn push(&mut self, val: f64) {
        let new_top = (self.top().wrapping_sub(1)) & 7;
        if self.tags[new_top] != FpuTag::Empty {
            self.status |= FSW_IE | FSW_SF | FSW_C1;
            self.set_top(new_top);
            self.set_phys(new_top, f64::NAN, FpuTag::Special);
            return;
        }
        self.set_top(new_top);
        self.set_phys(new_top, val, Self::tag_for(val));
    }

    /// Pop the stack, freeing the old top slot
    pub fn pop(&mut self) {
        let top = self.top();
        self.set_phys(top, 0.0, FpuTag::Empty);
        self.set_top((top + 1) & 7);
    }

    /// Mark st(i) empty (FFREE)
    pub fn free(&mut self, sti: usize) {
        let slot = self.phys(sti);
        self.set_phys(slot, 0.0, FpuTag::Empty);
    }

    /// Pack the per-slot tags into the 16-bit tag word (physical slot order)
    pub fn tag_word(&self) -> u16 {
        let mut word = 0u16;
        for (i, tag) in self.tags.iter().enumerate() {
            word |= (*tag as u16) << (i * 2);
        }
        word
    }

    /// Load the per-slot tags from a 16-bit tag word
    pub fn set_tag_word(&mut self, word: u16) {
        for i in 0..8 {
            self.tags[i] = match (word >> (i * 2)) & 3 {
                0 => FpuTag::Valid,
                1 => FpuTag::Zero,
                2 => FpuTag::Special,
                _ => FpuTag::Empty,
            };
        }
    }

    fn set_cc(&mut self, c0: bool, c2: bool, c3: bool) {
        self.status &= !(FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3);
        if c0 {
            self.status |= FSW_C0;
        }
        if c2 {
            self.status |= FSW_C2;
        }
        if c3 {
            self.status |= FSW_C3;
        }
    }

    // ------------------------------------------------------------------
    // Arithmetic with x87 special-case handling
    //
    // Host f64 arithmetic already yields the right infinities and NaNs
    // without trapping; these wrappers add the sticky status bits for the
    // indeterminate forms.
    // ------------------------------------------------------------------

    pub fn add(&mut self, a: f64, b: f64) -> f64 {
        if a.is_infinite() && b.is_infinite() && a.is_sign_positive() != b.is_sign_positive() {
            self.status |= FSW_IE;
            return f64::NAN;
        }
        a + b
    }

    pub fn sub(&mut self, a: f64, b: f64) -> f64 {
        if a.is_infinite() && b.is_infinite() && a.is_sign_positive() == b.is_sign_positive() {
            self.status |= FSW_IE;
            return f64::NAN;
        }
        a - b
    }

    pub fn mul(&mut self, a: f64, b: f64) -> f64 {
        if (a == 0.0 && b.is_infinite()) || (a.is_infinite() && b == 0.0) {
            self.status |= FSW_IE;
            return f64::NAN;
        }
        a * b
    }

    pub fn div(&mut self, a: f64, b: f64) -> f64 {
        if (a == 0.0 && b == 0.0) || (a.is_infinite() && b.is_infinite()) {
            self.status |= FSW_IE;
            return f64::NAN;
        }
        if b == 0.0 && !a.is_nan() {
            self.status |= FSW_ZE;
        }
        a / b
    }

    /// Compare and set C0/C2/C3 (FCOM semantics; unordered sets all three)
    pub fn compare(&mut self, a: f64, b: f64) {
        if a.is_nan() || b.is_nan() {
            self.status |= FSW_IE;
            self.set_cc(true, true, true);
        } else if a > b {
            self.set_cc(false, false, false);
        } else if a < b {
            self.set_cc(true, false, false);
        } else {
            self.set_cc(false, false, true);
        }
    }

    /// FXAM: classify st(0) into C0/C2/C3, sign into C1
    pub fn examine(&mut self) {
        let top = self.top();
        let empty = self.tags[top] == FpuTag::Empty;
        let val = self.regs[top];
        self.status &= !(FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3);
        if val.is_sign_negative() {
            self.status |= FSW_C1;
        }
        if empty {
            self.status |= FSW_C0 | FSW_C3;
        } else if val.is_nan() {
            self.status |= FSW_C0;
        } else if val.is_infinite() {
            self.status |= FSW_C0 | FSW_C2;
        } else if val == 0.0 {
            self.status |= FSW_C3;
        } else {
            self.status |= FSW_C2;
        }
    }

    /// Round per the control word's RC field (FIST/FRNDINT)
    pub fn round(&self, val: f64) -> f64 {
        match (self.control >> 10) & 3 {
            0 => {
                // Round to nearest even
                let floor = val.floor();
                let diff = val - floor;
                if diff > 0.5 {
                    floor + 1.0
                } else if diff < 0.5 {
                    floor
                } else if (floor as i64) % 2 == 0 {
                    floor
                } else {
                    floor + 1.0
                }
            }
            1 => val.floor(),
            2 => val.ceil(),
            _ => val.trunc(),
        }
    }
}

impl Default for Fpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Pack an f64 into the 80-bit extended format: (mantissa, sign+exponent)
pub fn f64_to_f80(val: f64) -> (u64, u16) {
    let bits = val.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7FF) as i32;
    let frac = bits & 0x000F_FFFF_FFFF_FFFF;

    if exp == 0x7FF {
        // Infinity keeps a bare integer bit; NaN payloads shift up
        return (0x8000_0000_0000_0000 | (frac << 11), sign | 0x7FFF);
    }
    if exp == 0 {
        if frac == 0 {
            return (0, sign);
        }
        // Subnormal: normalize the fraction into the explicit integer bit
        let lz = frac.leading_zeros();
        let mantissa = frac << lz;
        let e80 = 15372 - lz as i32;
        return (mantissa, sign | (e80 as u16));
    }
    // Normal: explicit integer bit plus rebias 1023 -> 16383
    let mantissa = 0x8000_0000_0000_0000 | (frac << 11);
    let e80 = exp + 15360;
    (mantissa, sign | (e80 as u16))
}

/// Unpack the 80-bit extended format into an f64 (rounding the 64-bit
/// mantissa to 53 bits; overflow and underflow saturate to infinity/zero)
pub fn f80_to_f64(mantissa: u64, sign_exp: u16) -> f64 {
    let negative = sign_exp & 0x8000 != 0;
    let exp = (sign_exp & 0x7FFF) as i32;
    let magnitude = if exp == 0x7FFF {
        if mantissa << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if mantissa == 0 {
        0.0
    } else {
        (mantissa as f64) * 2.0f64.powi(exp - 16383 - 63)
    };
    if negative {
        -magnitude
    } else {
        magnitude
    }
}

impl<M: MemoryX86> CpuX86<M> {
    /// Execute one x87 escape opcode (0xD8-0xDF)
    ///
    /// Dispatch is two-level: the low three opcode bits select the group, then
    /// the ModRM mode (memory vs register operand) and reg field select the
    /// operation, mirroring the base CPU's opcode-table pattern.
    pub(crate) fn execute_fpu(&mut self, opcode: u8, instr: &mut Instr) -> Result<u32, Exception> {
        // With EM or TS set the OS gets a chance to emulate or restore context
        if self.protected_mode.cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Exception::new(INT_NO_COPROCESSOR));
        }

        self.fetch_modrm(instr)?;
        let group = opcode & 7;
        if instr.mode != 3 {
            self.execute_fpu_mem(group, instr)
        } else {
            self.execute_fpu_reg(group, instr)
        }
    }

    /// Memory-operand forms
    fn execute_fpu_mem(&mut self, group: u8, instr: &mut Instr) -> Result<u32, Exception> {
        let ea = instr.ea;
        match (group, instr.reg) {
            // D8: single-precision arithmetic
            (0, op) => {
                let val = f32::from_bits(self.cpu_read_u32(ea)?) as f64;
                self.fpu_arith_st0(op, val);
                Ok(14)
            }
            // D9: single-precision load/store, environment, control word
            (1, 0) => {
                let val = f32::from_bits(self.cpu_read_u32(ea)?) as f64;
                self.fpu.push(val);
                Ok(9)
            }
            (1, 2) | (1, 3) => {
                let val = self.fpu.get_st(0) as f32;
                self.cpu_write_u32(ea, val.to_bits())?;
                if instr.reg == 3 {
                    self.fpu.pop();
                }
                Ok(12)
            }
            (1, 4) => self.fldenv(ea, instr.operand_32).map(|_| 20),
            (1, 5) => {
                self.fpu.control = self.cpu_read_u16(ea)?;
                Ok(7)
            }
            (1, 6) => self.fstenv(ea, instr.operand_32).map(|_| 20),
            (1, 7) => {
                self.cpu_write_u16(ea, self.fpu.control)?;
                Ok(7)
            }
            // DA: 32-bit integer arithmetic
            (2, op) => {
                let val = self.cpu_read_u32(ea)? as i32 as f64;
                self.fpu_arith_st0(op, val);
                Ok(19)
            }
            // DB: 32-bit integer load/store, 80-bit load/store
            (3, 0) => {
                let val = self.cpu_read_u32(ea)? as i32 as f64;
                self.fpu.push(val);
                Ok(10)
            }
            (3, 2) | (3, 3) => {
                let st0 = self.fpu.get_st(0);
                let val = self.fpu_to_int(st0, i32::MIN as f64, i32::MAX as f64) as i32;
                self.cpu_write_u32(ea, val as u32)?;
                if instr.reg == 3 {
                    self.fpu.pop();
                }
                Ok(16)
            }
            (3, 5) => {
                let mantissa = self.cpu_read_u64(ea)?;
                let sign_exp = self.cpu_read_u16(ea.wrapping_add(8))?;
                self.fpu.push(f80_to_f64(mantissa, sign_exp));
                Ok(12)
            }
            (3, 7) => {
                let (mantissa, sign_exp) = f64_to_f80(self.fpu.get_st(0));
                self.cpu_write_u64(ea, mantissa)?;
                self.cpu_write_u16(ea.wrapping_add(8), sign_exp)?;
                self.fpu.pop();
                Ok(16)
            }
            // DC: double-precision arithmetic
            (4, op) => {
                let val = f64::from_bits(self.cpu_read_u64(ea)?);
                self.fpu_arith_st0(op, val);
                Ok(14)
            }
            // DD: double-precision load/store, save/restore, status word
            (5, 0) => {
                let val = f64::from_bits(self.cpu_read_u64(ea)?);
                self.fpu.push(val);
                Ok(10)
            }
            (5, 2) | (5, 3) => {
                let val = self.fpu.get_st(0);
                self.cpu_write_u64(ea, val.to_bits())?;
                if instr.reg == 3 {
                    self.fpu.pop();
                }
                Ok(12)
            }
            (5, 4) => self.frstor(ea, instr.operand_32).map(|_| 70),
            (5, 6) => self.fsave(ea, instr.operand_32).map(|_| 70),
            (5, 7) => {
                self.cpu_write_u16(ea, self.fpu.status)?;
                Ok(7)
            }
            // DE: 16-bit integer arithmetic
            (6, op) => {
                let val = self.cpu_read_u16(ea)? as i16 as f64;
                self.fpu_arith_st0(op, val);
                Ok(20)
            }
            // DF: 16/64-bit integer load/store, packed BCD
            (7, 0) => {
                let val = self.cpu_read_u16(ea)? as i16 as f64;
                self.fpu.push(val);
                Ok(13)
            }
            (7, 2) | (7, 3) => {
                let st0 = self.fpu.get_st(0);
                let val = self.fpu_to_int(st0, i16::MIN as f64, i16::MAX as f64) as i16;
                self.cpu_write_u16(ea, val as u16)?;
                if instr.reg == 3 {
                    self.fpu.pop();
                }
                Ok(18)
            }
            (7, 4) => {
                let val = self.fbld(ea)?;
                self.fpu.push(val);
                Ok(45)
            }
            (7, 5) => {
                let val = self.cpu_read_u64(ea)? as i64 as f64;
                self.fpu.push(val);
                Ok(12)
            }
            (7, 6) => {
                let st0 = self.fpu.get_st(0);
                self.fbstp(ea, st0)?;
                self.fpu.pop();
                Ok(50)
            }
            (7, 7) => {
                let st0 = self.fpu.get_st(0);
                let val = self.fpu_to_int(st0, i64::MIN as f64, i64::MAX as f64) as i64;
                self.cpu_write_u64(ea, val as u64)?;
                self.fpu.pop();
                Ok(18)
            }
            _ => {
                log(LogCategory::Fpu, LogLevel::Warn, || {
                    format!("unimplemented FPU memory op D{:X} /{}", 0x8 + group, instr.reg)
                });
                Err(Exception::ud())
            }
        }
    }

    /// Register-operand forms
    fn execute_fpu_reg(&mut self, group: u8, instr: &mut Instr) -> Result<u32, Exception> {
        let sti = instr.rm as usize;
        match (group, instr.reg) {
            // D8: st(0) <- st(0) op st(i)
            (0, op) => {
                let val = self.fpu.get_st(sti);
                self.fpu_arith_st0(op, val);
                Ok(10)
            }
            // D9 C0+i: FLD st(i)
            (1, 0) => {
                let val = self.fpu.get_st(sti);
                self.fpu.push(val);
                Ok(4)
            }
            // D9 C8+i: FXCH st(i)
            (1, 1) => {
                let a = self.fpu.get_st(0);
                let b = self.fpu.get_st(sti);
                self.fpu.set_st(0, b);
                self.fpu.set_st(sti, a);
                Ok(4)
            }
            // D9 D0: FNOP
            (1, 2) if sti == 0 => Ok(3),
            (1, 4) => self.fpu_unary(sti),
            (1, 5) => self.fpu_constant(sti),
            (1, 6) => self.fpu_transcendental_f0(sti),
            (1, 7) => self.fpu_transcendental_f8(sti),
            // DA E9: FUCOMPP
            (2, 5) if sti == 1 => {
                let a = self.fpu.get_st(0);
                let b = self.fpu.get_st(1);
                self.fpu.compare(a, b);
                self.fpu.pop();
                self.fpu.pop();
                Ok(5)
            }
            // DB E2: FNCLEX
            (3, 4) if sti == 2 => {
                self.fpu.status &= !(FSW_IE
                    | FSW_DE
                    | FSW_ZE
                    | FSW_OE
                    | FSW_UE
                    | FSW_PE
                    | FSW_SF
                    | FSW_ES);
                Ok(5)
            }
            // DB E3: FNINIT
            (3, 4) if sti == 3 => {
                self.fpu.reset();
                Ok(5)
            }
            // DC: st(i) <- st(i) op st(0)
            (4, op) => {
                self.fpu_arith_sti(op, sti, false);
                Ok(10)
            }
            // DD C0+i: FFREE
            (5, 0) => {
                self.fpu.free(sti);
                Ok(3)
            }
            // DD D0+i / D8+i: FST/FSTP st(i)
            (5, 2) | (5, 3) => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(sti, val);
                if instr.reg == 3 {
                    self.fpu.pop();
                }
                Ok(3)
            }
            // DD E0+i / E8+i: FUCOM/FUCOMP
            (5, 4) | (5, 5) => {
                let a = self.fpu.get_st(0);
                let b = self.fpu.get_st(sti);
                self.fpu.compare(a, b);
                if instr.reg == 5 {
                    self.fpu.pop();
                }
                Ok(5)
            }
            // DE D9: FCOMPP
            (6, 3) if sti == 1 => {
                let a = self.fpu.get_st(0);
                let b = self.fpu.get_st(1);
                self.fpu.compare(a, b);
                self.fpu.pop();
                self.fpu.pop();
                Ok(5)
            }
            // DE: st(i) <- st(i) op st(0), pop
            (6, op) => {
                self.fpu_arith_sti(op, sti, true);
                Ok(10)
            }
            // DF E0: FNSTSW AX
            (7, 4) if sti == 0 => {
                self.set_reg16(REG_EAX as u8, self.fpu.status);
                Ok(5)
            }
            _ => {
                log(LogCategory::Fpu, LogLevel::Warn, || {
                    format!("unimplemented FPU register op D{:X} /{} rm {}", 0x8 + group, instr.reg, sti)
                });
                Err(Exception::ud())
            }
        }
    }

    /// st(0) <- st(0) op val (the D8/DA/DC/DE memory-arithmetic pattern)
    fn fpu_arith_st0(&mut self, op: u8, val: f64) {
        let st0 = self.fpu.get_st(0);
        match op {
            0 => {
                let r = self.fpu.add(st0, val);
                self.fpu.set_st(0, r);
            }
            1 => {
                let r = self.fpu.mul(st0, val);
                self.fpu.set_st(0, r);
            }
            2 => self.fpu.compare(st0, val),
            3 => {
                self.fpu.compare(st0, val);
                self.fpu.pop();
            }
            4 => {
                let r = self.fpu.sub(st0, val);
                self.fpu.set_st(0, r);
            }
            5 => {
                let r = self.fpu.sub(val, st0);
                self.fpu.set_st(0, r);
            }
            6 => {
                let r = self.fpu.div(st0, val);
                self.fpu.set_st(0, r);
            }
            _ => {
                let r = self.fpu.div(val, st0);
                self.fpu.set_st(0, r);
            }
        }
    }

    /// st(i) <- st(i) op st(0), optionally popping (DC/DE register forms)
    ///
    /// The reversed-operand encodings swap relative to the memory forms.
    fn fpu_arith_sti(&mut self, op: u8, sti: usize, pop: bool) {
        let st0 = self.fpu.get_st(0);
        let stv = self.fpu.get_st(sti);
        let result = match op {
            0 => self.fpu.add(stv, st0),
            1 => self.fpu.mul(stv, st0),
            2 => {
                self.fpu.compare(st0, stv);
                stv
            }
            3 => {
                self.fpu.compare(st0, stv);
                self.fpu.pop();
                return;
            }
            4 => self.fpu.sub(st0, stv),
            5 => self.fpu.sub(stv, st0),
            6 => self.fpu.div(st0, stv),
            _ => self.fpu.div(stv, st0),
        };
        self.fpu.set_st(sti, result);
        if pop {
            self.fpu.pop();
        }
    }

    /// D9 E0-E5: FCHS/FABS/FTST/FXAM
    fn fpu_unary(&mut self, sti: usize) -> Result<u32, Exception> {
        match sti {
            0 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, -val);
                Ok(3)
            }
            1 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.abs());
                Ok(3)
            }
            4 => {
                let val = self.fpu.get_st(0);
                self.fpu.compare(val, 0.0);
                Ok(4)
            }
            5 => {
                self.fpu.examine();
                Ok(4)
            }
            _ => Err(Exception::ud()),
        }
    }

    /// D9 E8-EE: load constant
    fn fpu_constant(&mut self, sti: usize) -> Result<u32, Exception> {
        let val = match sti {
            0 => 1.0,
            1 => 10.0f64.log2(),
            2 => std::f64::consts::E.log2(),
            3 => std::f64::consts::PI,
            4 => 2.0f64.log10(),
            5 => std::f64::consts::LN_2,
            6 => 0.0,
            _ => return Err(Exception::ud()),
        };
        self.fpu.push(val);
        Ok(4)
    }

    /// D9 F0-F7: F2XM1/FYL2X/FPTAN/FPATAN/FXTRACT/FPREM1/FDECSTP/FINCSTP
    fn fpu_transcendental_f0(&mut self, sti: usize) -> Result<u32, Exception> {
        match sti {
            0 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.exp2() - 1.0);
            }
            1 => {
                let x = self.fpu.get_st(0);
                let y = self.fpu.get_st(1);
                self.fpu.set_st(1, y * x.log2());
                self.fpu.pop();
            }
            2 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.tan());
                self.fpu.push(1.0);
                self.fpu.status &= !FSW_C2;
            }
            3 => {
                let x = self.fpu.get_st(0);
                let y = self.fpu.get_st(1);
                self.fpu.set_st(1, y.atan2(x));
                self.fpu.pop();
            }
            4 => {
                // FXTRACT: split into exponent and significand
                let val = self.fpu.get_st(0);
                let exponent = if val == 0.0 {
                    f64::NEG_INFINITY
                } else {
                    val.abs().log2().floor()
                };
                let significand = if val == 0.0 {
                    val
                } else {
                    val / exponent.exp2()
                };
                self.fpu.set_st(0, exponent);
                self.fpu.push(significand);
            }
            5 => self.fprem(),
            6 => {
                let top = self.fpu.top();
                self.fpu.set_top((top.wrapping_sub(1)) & 7);
            }
            7 => {
                let top = self.fpu.top();
                self.fpu.set_top((top + 1) & 7);
            }
            _ => unreachable!(),
        }
        Ok(30)
    }

    /// D9 F8-FF: FPREM/FYL2XP1/FSQRT/FSINCOS/FRNDINT/FSCALE/FSIN/FCOS
    fn fpu_transcendental_f8(&mut self, sti: usize) -> Result<u32, Exception> {
        match sti {
            0 => self.fprem(),
            1 => {
                let x = self.fpu.get_st(0);
                let y = self.fpu.get_st(1);
                self.fpu.set_st(1, y * (x + 1.0).log2());
                self.fpu.pop();
            }
            2 => {
                let val = self.fpu.get_st(0);
                if val < 0.0 {
                    self.fpu.status |= FSW_IE;
                }
                self.fpu.set_st(0, val.sqrt());
            }
            3 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.sin());
                self.fpu.push(val.cos());
                self.fpu.status &= !FSW_C2;
            }
            4 => {
                let val = self.fpu.get_st(0);
                let rounded = self.fpu.round(val);
                self.fpu.set_st(0, rounded);
            }
            5 => {
                // FSCALE: st(0) * 2^trunc(st(1))
                let scale = self.fpu.get_st(1).trunc();
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val * scale.exp2());
            }
            6 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.sin());
                self.fpu.status &= !FSW_C2;
            }
            7 => {
                let val = self.fpu.get_st(0);
                self.fpu.set_st(0, val.cos());
                self.fpu.status &= !FSW_C2;
            }
            _ => unreachable!(),
        }
        Ok(30)
    }

    /// FPREM/FPREM1: partial remainder with quotient bits in C0/C1/C3
    fn fprem(&mut self) {
        let st0 = self.fpu.get_st(0);
        let st1 = self.fpu.get_st(1);
        let quotient = (st0 / st1).trunc();
        let remainder = st0 - quotient * st1;
        self.fpu.set_st(0, remainder);
        self.fpu.status &= !(FSW_C0 | FSW_C1 | FSW_C2 | FSW_C3);
        let q = quotient.abs() as u64;
        if q & 1 != 0 {
            self.fpu.status |= FSW_C1;
        }
        if q & 2 != 0 {
            self.fpu.status |= FSW_C3;
        }
        if q & 4 != 0 {
            self.fpu.status |= FSW_C0;
        }
    }

    /// Convert to integer per the control-word rounding mode, saturating to
    /// the x87 integer-indefinite on overflow
    fn fpu_to_int(&mut self, val: f64, min: f64, max: f64) -> i64 {
        if val.is_nan() || val < min || val > max {
            self.fpu.status |= FSW_IE;
            // Integer indefinite: most negative representable value
            return min as i64;
        }
        self.fpu.round(val) as i64
    }

    /// FBLD: load an 18-digit packed BCD value
    fn fbld(&mut self, ea: u32) -> Result<f64, Exception> {
        let mut val = 0.0f64;
        for i in (0..9).rev() {
            let byte = self.cpu_read(ea.wrapping_add(i))?;
            val = val * 100.0 + ((byte >> 4) * 10 + (byte & 0xF)) as f64;
        }
        let sign = self.cpu_read(ea.wrapping_add(9))?;
        Ok(if sign & 0x80 != 0 { -val } else { val })
    }

    /// FBSTP: store as 18-digit packed BCD
    fn fbstp(&mut self, ea: u32, val: f64) -> Result<(), Exception> {
        let rounded = self.fpu.round(val);
        let negative = rounded < 0.0;
        let mut remaining = rounded.abs();
        if remaining >= 1e18 {
            self.fpu.status |= FSW_IE;
            remaining = 0.0;
        }
        let mut remaining = remaining as u64;
        for i in 0..9 {
            let low = (remaining % 10) as u8;
            remaining /= 10;
            let high = (remaining % 10) as u8;
            remaining /= 10;
            self.cpu_write(ea.wrapping_add(i), (high << 4) | low)?;
        }
        self.cpu_write(ea.wrapping_add(9), if negative { 0x80 } else { 0x00 })
    }

    // ------------------------------------------------------------------
    // Environment and full-state save/restore
    // ------------------------------------------------------------------

    /// FSTENV: control/status/tag words plus zeroed instruction pointers
    fn fstenv(&mut self, ea: u32, op_32: bool) -> Result<(), Exception> {
        if op_32 {
            self.cpu_write_u32(ea, self.fpu.control as u32)?;
            self.cpu_write_u32(ea.wrapping_add(4), self.fpu.status as u32)?;
            self.cpu_write_u32(ea.wrapping_add(8), self.fpu.tag_word() as u32)?;
            for i in 3..7 {
                self.cpu_write_u32(ea.wrapping_add(i * 4), 0)?;
            }
        } else {
            self.cpu_write_u16(ea, self.fpu.control)?;
            self.cpu_write_u16(ea.wrapping_add(2), self.fpu.status)?;
            self.cpu_write_u16(ea.wrapping_add(4), self.fpu.tag_word())?;
            for i in 3..7 {
                self.cpu_write_u16(ea.wrapping_add(i * 2), 0)?;
            }
        }
        Ok(())
    }

    /// FLDENV: reload control/status/tag words
    fn fldenv(&mut self, ea: u32, op_32: bool) -> Result<(), Exception> {
        if op_32 {
            self.fpu.control = self.cpu_read_u32(ea)? as u16;
            self.fpu.status = self.cpu_read_u32(ea.wrapping_add(4))? as u16;
            let tags = self.cpu_read_u32(ea.wrapping_add(8))? as u16;
            self.fpu.set_tag_word(tags);
        } else {
            self.fpu.control = self.cpu_read_u16(ea)?;
            self.fpu.status = self.cpu_read_u16(ea.wrapping_add(2))?;
            let tags = self.cpu_read_u16(ea.wrapping_add(4))?;
            self.fpu.set_tag_word(tags);
        }
        Ok(())
    }

    /// FSAVE: environment plus all eight registers in 80-bit format, then
    /// reinitialize the FPU (historical FSAVE side effect)
    fn fsave(&mut self, ea: u32, op_32: bool) -> Result<(), Exception> {
        self.fstenv(ea, op_32)?;
        let env_size: u32 = if op_32 { 28 } else { 14 };
        for i in 0..8 {
            let val = if self.fpu.tag(i) == FpuTag::Empty {
                0.0
            } else {
                self.fpu.get_st(i)
            };
            let (mantissa, sign_exp) = f64_to_f80(val);
            let slot = ea.wrapping_add(env_size + (i as u32) * 10);
            self.cpu_write_u64(slot, mantissa)?;
            self.cpu_write_u16(slot.wrapping_add(8), sign_exp)?;
        }
        self.fpu.reset();
        Ok(())
    }

    /// FRSTOR: reload the environment and all eight registers
    fn frstor(&mut self, ea: u32, op_32: bool) -> Result<(), Exception> {
        self.fldenv(ea, op_32)?;
        let env_size: u32 = if op_32 { 28 } else { 14 };
        let tags = self.fpu.tag_word();
        for i in 0..8 {
            let slot = ea.wrapping_add(env_size + (i as u32) * 10);
            let mantissa = self.cpu_read_u64(slot)?;
            let sign_exp = self.cpu_read_u16(slot.wrapping_add(8))?;
            let val = f80_to_f64(mantissa, sign_exp);
            // Values land in physical slot order; tags came from the
            // environment image
            let top = self.fpu.top();
            let phys = (top + i) & 7;
            self.fpu.regs[phys] = val;
        }
        self.fpu.set_tag_word(tags);
        Ok(())
    }
}
