//! Opcode dispatch and ALU semantics
//!
//! One handler arm per opcode in two `match` maps: the one-byte map and the
//! 0F-prefixed extended map. Binary arithmetic derives CF/OF/AF from the
//! widened result and the XOR overflow identities so every width is explicit;
//! shifts and rotates run bit-at-a-time to reproduce the per-step carry
//! semantics; string instructions execute one element and re-dispatch
//! themselves through the saved fetch address while a repeat prefix is active,
//! so interrupts and faults land on element boundaries.

use crate::cpu_x86::{
    CpuX86, Exception, Instr, MemoryX86, Rep, INT_BOUND_RANGE, INT_BREAKPOINT, INT_DEBUG,
    INT_DIVIDE_ERROR, INT_NO_COPROCESSOR, INT_OVERFLOW, REG_EAX, REG_EBP, REG_EBX, REG_ECX,
    REG_EDI, REG_EDX, REG_ESI, REG_ESP, SEG_CS, SEG_DS, SEG_ES, SEG_FS, SEG_GS, SEG_SS,
};
use crate::cpu_x86_protected::{CR0_MP, CR0_PE, CR0_TS};
use crate::logging::{log, LogCategory, LogLevel};

impl<M: MemoryX86> CpuX86<M> {
    // ==================================================================
    // ALU primitives
    //
    // Each width is a separate function with explicit widening: the carry
    // comes from the widened result, the overflow from the sign-bit XOR
    // identity, the adjust flag from the low-nibble XOR.
    // ==================================================================

    pub(crate) fn alu_add8(&mut self, a: u8, b: u8, carry_in: bool) -> u8 {
        let wide = a as u16 + b as u16 + carry_in as u16;
        let result = wide as u8;
        self.flags.carry = wide > 0xFF;
        self.flags.overflow = ((a ^ result) & (b ^ result) & 0x80) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp8(result);
        result
    }

    pub(crate) fn alu_add16(&mut self, a: u16, b: u16, carry_in: bool) -> u16 {
        let wide = a as u32 + b as u32 + carry_in as u32;
        let result = wide as u16;
        self.flags.carry = wide > 0xFFFF;
        self.flags.overflow = ((a ^ result) & (b ^ result) & 0x8000) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp16(result);
        result
    }

    pub(crate) fn alu_add32(&mut self, a: u32, b: u32, carry_in: bool) -> u32 {
        let wide = a as u64 + b as u64 + carry_in as u64;
        let result = wide as u32;
        self.flags.carry = wide > 0xFFFF_FFFF;
        self.flags.overflow = ((a ^ result) & (b ^ result) & 0x8000_0000) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp32(result);
        result
    }

    pub(crate) fn alu_sub8(&mut self, a: u8, b: u8, borrow_in: bool) -> u8 {
        let subtrahend = b as u16 + borrow_in as u16;
        let result = (a as u16).wrapping_sub(subtrahend) as u8;
        self.flags.carry = (a as u16) < subtrahend;
        self.flags.overflow = ((a ^ b) & (a ^ result) & 0x80) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp8(result);
        result
    }

    pub(crate) fn alu_sub16(&mut self, a: u16, b: u16, borrow_in: bool) -> u16 {
        let subtrahend = b as u32 + borrow_in as u32;
        let result = (a as u32).wrapping_sub(subtrahend) as u16;
        self.flags.carry = (a as u32) < subtrahend;
        self.flags.overflow = ((a ^ b) & (a ^ result) & 0x8000) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp16(result);
        result
    }

    pub(crate) fn alu_sub32(&mut self, a: u32, b: u32, borrow_in: bool) -> u32 {
        let subtrahend = b as u64 + borrow_in as u64;
        let result = ((a as u64).wrapping_sub(subtrahend)) as u32;
        self.flags.carry = (a as u64) < subtrahend;
        self.flags.overflow = ((a ^ b) & (a ^ result) & 0x8000_0000) != 0;
        self.flags.adjust = ((a ^ b ^ result) & 0x10) != 0;
        self.update_flags_szp32(result);
        result
    }

    fn logic_flags8(&mut self, result: u8) {
        self.flags.carry = false;
        self.flags.overflow = false;
        self.update_flags_szp8(result);
    }

    fn logic_flags16(&mut self, result: u16) {
        self.flags.carry = false;
        self.flags.overflow = false;
        self.update_flags_szp16(result);
    }

    fn logic_flags32(&mut self, result: u32) {
        self.flags.carry = false;
        self.flags.overflow = false;
        self.update_flags_szp32(result);
    }

    /// Apply a group-1 ALU operation at byte width; returns (result, writeback)
    fn alu_apply8(&mut self, op: u8, a: u8, b: u8) -> (u8, bool) {
        match op & 7 {
            0 => (self.alu_add8(a, b, false), true),
            1 => {
                let r = a | b;
                self.logic_flags8(r);
                (r, true)
            }
            2 => {
                let carry = self.flags.carry;
                (self.alu_add8(a, b, carry), true)
            }
            3 => {
                let borrow = self.flags.carry;
                (self.alu_sub8(a, b, borrow), true)
            }
            4 => {
                let r = a & b;
                self.logic_flags8(r);
                (r, true)
            }
            5 => (self.alu_sub8(a, b, false), true),
            6 => {
                let r = a ^ b;
                self.logic_flags8(r);
                (r, true)
            }
            _ => (self.alu_sub8(a, b, false), false), // CMP discards
        }
    }

    /// Apply a group-1 ALU operation at the instruction's operand size
    fn alu_apply(&mut self, op: u8, a: u32, b: u32, size_32: bool) -> (u32, bool) {
        if size_32 {
            match op & 7 {
                0 => (self.alu_add32(a, b, false), true),
                1 => {
                    let r = a | b;
                    self.logic_flags32(r);
                    (r, true)
                }
                2 => {
                    let carry = self.flags.carry;
                    (self.alu_add32(a, b, carry), true)
                }
                3 => {
                    let borrow = self.flags.carry;
                    (self.alu_sub32(a, b, borrow), true)
                }
                4 => {
                    let r = a & b;
                    self.logic_flags32(r);
                    (r, true)
                }
                5 => (self.alu_sub32(a, b, false), true),
                6 => {
                    let r = a ^ b;
                    self.logic_flags32(r);
                    (r, true)
                }
                _ => (self.alu_sub32(a, b, false), false),
            }
        } else {
            let (r, wb) = match op & 7 {
                0 => (self.alu_add16(a as u16, b as u16, false), true),
                1 => {
                    let r = (a as u16) | (b as u16);
                    self.logic_flags16(r);
                    (r, true)
                }
                2 => {
                    let carry = self.flags.carry;
                    (self.alu_add16(a as u16, b as u16, carry), true)
                }
                3 => {
                    let borrow = self.flags.carry;
                    (self.alu_sub16(a as u16, b as u16, borrow), true)
                }
                4 => {
                    let r = (a as u16) & (b as u16);
                    self.logic_flags16(r);
                    (r, true)
                }
                5 => (self.alu_sub16(a as u16, b as u16, false), true),
                6 => {
                    let r = (a as u16) ^ (b as u16);
                    self.logic_flags16(r);
                    (r, true)
                }
                _ => (self.alu_sub16(a as u16, b as u16, false), false),
            };
            (r as u32, wb)
        }
    }

    /// INC preserves CF; everything else follows addition
    fn inc_sized(&mut self, val: u32, size_32: bool) -> u32 {
        let carry = self.flags.carry;
        let r = if size_32 {
            self.alu_add32(val, 1, false)
        } else {
            self.alu_add16(val as u16, 1, false) as u32
        };
        self.flags.carry = carry;
        r
    }

    /// DEC preserves CF; everything else follows subtraction
    fn dec_sized(&mut self, val: u32, size_32: bool) -> u32 {
        let carry = self.flags.carry;
        let r = if size_32 {
            self.alu_sub32(val, 1, false)
        } else {
            self.alu_sub16(val as u16, 1, false) as u32
        };
        self.flags.carry = carry;
        r
    }

    // ==================================================================
    // Shift/rotate group (GRP2)
    //
    // Every shift runs one bit at a time so CF tracks each intermediate bit
    // exactly as hardware does, and the count==1 OF rules apply to the final
    // state. `bits` selects the 8/16/32-bit width.
    // ==================================================================

    pub(crate) fn shift_rotate(&mut self, val: u32, op: u8, count: u8, bits: u32) -> u32 {
        let count = count & 0x1F;
        if count == 0 {
            return val;
        }
        let msb = 1u32 << (bits - 1);
        let mask = if bits == 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << bits) - 1
        };
        let mut result = val & mask;

        match op & 7 {
            // ROL
            0 => {
                for _ in 0..count {
                    let carry_out = result & msb != 0;
                    result = ((result << 1) | carry_out as u32) & mask;
                    self.flags.carry = carry_out;
                }
                if count == 1 {
                    self.flags.overflow = (result & msb != 0) != self.flags.carry;
                }
            }
            // ROR
            1 => {
                for _ in 0..count {
                    let carry_out = result & 1 != 0;
                    result = (result >> 1) | if carry_out { msb } else { 0 };
                    self.flags.carry = carry_out;
                }
                if count == 1 {
                    let top = result & msb != 0;
                    let next = result & (msb >> 1) != 0;
                    self.flags.overflow = top != next;
                }
            }
            // RCL
            2 => {
                for _ in 0..count {
                    let carry_in = self.flags.carry as u32;
                    let carry_out = result & msb != 0;
                    result = ((result << 1) | carry_in) & mask;
                    self.flags.carry = carry_out;
                }
                if count == 1 {
                    self.flags.overflow = (result & msb != 0) != self.flags.carry;
                }
            }
            // RCR
            3 => {
                if count == 1 {
                    self.flags.overflow = (result & msb != 0) != self.flags.carry;
                }
                for _ in 0..count {
                    let carry_in = if self.flags.carry { msb } else { 0 };
                    let carry_out = result & 1 != 0;
                    result = (result >> 1) | carry_in;
                    self.flags.carry = carry_out;
                }
            }
            // SHL/SAL
            4 | 6 => {
                for _ in 0..count {
                    self.flags.carry = result & msb != 0;
                    result = (result << 1) & mask;
                }
                if count == 1 {
                    self.flags.overflow = (result & msb != 0) != self.flags.carry;
                }
                self.shift_result_flags(result, bits);
            }
            // SHR
            5 => {
                if count == 1 {
                    self.flags.overflow = result & msb != 0;
                }
                for _ in 0..count {
                    self.flags.carry = result & 1 != 0;
                    result >>= 1;
                }
                self.shift_result_flags(result, bits);
            }
            // SAR
            _ => {
                let sign = result & msb;
                for _ in 0..count {
                    self.flags.carry = result & 1 != 0;
                    result = (result >> 1) | sign;
                }
                if count == 1 {
                    self.flags.overflow = false;
                }
                self.shift_result_flags(result, bits);
            }
        }
        result
    }

    fn shift_result_flags(&mut self, result: u32, bits: u32) {
        match bits {
            8 => self.update_flags_szp8(result as u8),
            16 => self.update_flags_szp16(result as u16),
            _ => self.update_flags_szp32(result),
        }
    }

    // ==================================================================
    // One-byte opcode map
    // ==================================================================

    pub(crate) fn execute(&mut self, opcode: u8, instr: &mut Instr) -> Result<u32, Exception> {
        match opcode {
            // ADD/OR/ADC/SBB/AND/SUB/XOR/CMP rm8, r8
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {
                let op = opcode >> 3;
                self.fetch_modrm(instr)?;
                let a = self.read_rm8(instr)?;
                let b = self.get_reg8(instr.reg);
                let (r, writeback) = self.alu_apply8(op, a, b);
                if writeback {
                    self.write_rm8(instr, r)?;
                }
                Ok(if instr.mode == 3 { 3 } else { 16 })
            }
            // ALU rm16/32, r16/32
            0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 => {
                let op = opcode >> 3;
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.get_reg(instr.reg, instr.operand_32);
                let (r, writeback) = self.alu_apply(op, a, b, instr.operand_32);
                if writeback {
                    self.write_rm(instr, r)?;
                }
                Ok(if instr.mode == 3 { 3 } else { 16 })
            }
            // ALU r8, rm8
            0x02 | 0x0A | 0x12 | 0x1A | 0x22 | 0x2A | 0x32 | 0x3A => {
                let op = opcode >> 3;
                self.fetch_modrm(instr)?;
                let a = self.get_reg8(instr.reg);
                let b = self.read_rm8(instr)?;
                let (r, writeback) = self.alu_apply8(op, a, b);
                if writeback {
                    self.set_reg8(instr.reg, r);
                }
                Ok(if instr.mode == 3 { 3 } else { 9 })
            }
            // ALU r16/32, rm16/32
            0x03 | 0x0B | 0x13 | 0x1B | 0x23 | 0x2B | 0x33 | 0x3B => {
                let op = opcode >> 3;
                self.fetch_modrm(instr)?;
                let a = self.get_reg(instr.reg, instr.operand_32);
                let b = self.read_rm(instr)?;
                let (r, writeback) = self.alu_apply(op, a, b, instr.operand_32);
                if writeback {
                    self.set_reg(instr.reg, r, instr.operand_32);
                }
                Ok(if instr.mode == 3 { 3 } else { 9 })
            }
            // ALU AL, imm8
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let op = opcode >> 3;
                let a = self.get_reg8(0);
                let b = self.fetch_u8()?;
                let (r, writeback) = self.alu_apply8(op, a, b);
                if writeback {
                    self.set_reg8(0, r);
                }
                Ok(4)
            }
            // ALU eAX, imm16/32
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let op = opcode >> 3;
                let a = self.get_reg(0, instr.operand_32);
                let b = self.fetch_imm(instr.operand_32)?;
                let (r, writeback) = self.alu_apply(op, a, b, instr.operand_32);
                if writeback {
                    self.set_reg(0, r, instr.operand_32);
                }
                Ok(4)
            }

            // PUSH/POP segment registers
            0x06 => {
                self.push_sized(self.segs[SEG_ES].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0x07 => {
                let sel = self.pop_sized(instr.operand_32)? as u16;
                self.load_segment(SEG_ES, sel)?;
                Ok(8)
            }
            0x0E => {
                self.push_sized(self.segs[SEG_CS].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0x16 => {
                self.push_sized(self.segs[SEG_SS].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0x17 => {
                let sel = self.pop_sized(instr.operand_32)? as u16;
                self.load_segment(SEG_SS, sel)?;
                Ok(8)
            }
            0x1E => {
                self.push_sized(self.segs[SEG_DS].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0x1F => {
                let sel = self.pop_sized(instr.operand_32)? as u16;
                self.load_segment(SEG_DS, sel)?;
                Ok(8)
            }

            // Extended opcode map
            0x0F if self.model().supports_80286_instructions() => self.execute_0f(instr),

            // BCD adjustments
            0x27 => {
                self.op_daa();
                Ok(4)
            }
            0x2F => {
                self.op_das();
                Ok(4)
            }
            0x37 => {
                self.op_aaa();
                Ok(8)
            }
            0x3F => {
                self.op_aas();
                Ok(8)
            }

            // INC/DEC r16/32
            0x40..=0x47 => {
                let reg = opcode & 7;
                let val = self.get_reg(reg, instr.operand_32);
                let r = self.inc_sized(val, instr.operand_32);
                self.set_reg(reg, r, instr.operand_32);
                Ok(3)
            }
            0x48..=0x4F => {
                let reg = opcode & 7;
                let val = self.get_reg(reg, instr.operand_32);
                let r = self.dec_sized(val, instr.operand_32);
                self.set_reg(reg, r, instr.operand_32);
                Ok(3)
            }

            // PUSH/POP r16/32
            0x50..=0x57 => {
                let val = self.get_reg(opcode & 7, instr.operand_32);
                self.push_sized(val, instr.operand_32)?;
                Ok(11)
            }
            0x58..=0x5F => {
                let val = self.pop_sized(instr.operand_32)?;
                self.set_reg(opcode & 7, val, instr.operand_32);
                Ok(8)
            }

            // PUSHA/POPA (80186+)
            0x60 if self.model().supports_80186_instructions() => {
                let sp = self.get_reg(REG_ESP as u8, instr.operand_32);
                for reg in [REG_EAX, REG_ECX, REG_EDX, REG_EBX] {
                    let val = self.get_reg(reg as u8, instr.operand_32);
                    self.push_sized(val, instr.operand_32)?;
                }
                self.push_sized(sp, instr.operand_32)?;
                for reg in [REG_EBP, REG_ESI, REG_EDI] {
                    let val = self.get_reg(reg as u8, instr.operand_32);
                    self.push_sized(val, instr.operand_32)?;
                }
                Ok(19)
            }
            0x61 if self.model().supports_80186_instructions() => {
                for reg in [REG_EDI, REG_ESI, REG_EBP] {
                    let val = self.pop_sized(instr.operand_32)?;
                    self.set_reg(reg as u8, val, instr.operand_32);
                }
                let _discarded_sp = self.pop_sized(instr.operand_32)?;
                for reg in [REG_EBX, REG_EDX, REG_ECX, REG_EAX] {
                    let val = self.pop_sized(instr.operand_32)?;
                    self.set_reg(reg as u8, val, instr.operand_32);
                }
                Ok(19)
            }

            // BOUND r16/32, m16/32&16/32 (80186+)
            0x62 if self.model().supports_80186_instructions() => {
                self.fetch_modrm(instr)?;
                if instr.mode == 3 {
                    return Err(Exception::ud());
                }
                if instr.operand_32 {
                    let index = self.get_reg32(instr.reg) as i32;
                    let lower = self.cpu_read_u32(instr.ea)? as i32;
                    let upper = self.cpu_read_u32(instr.ea.wrapping_add(4))? as i32;
                    if index < lower || index > upper {
                        return Err(Exception::new(INT_BOUND_RANGE));
                    }
                } else {
                    let index = self.get_reg16(instr.reg) as i16;
                    let lower = self.cpu_read_u16(instr.ea)? as i16;
                    let upper = self.cpu_read_u16(instr.ea.wrapping_add(2))? as i16;
                    if index < lower || index > upper {
                        return Err(Exception::new(INT_BOUND_RANGE));
                    }
                }
                Ok(13)
            }

            // ARPL rm16, r16 (80286+ protected mode only)
            0x63 if self.model().supports_80286_instructions() && self.in_protected_mode() => {
                self.fetch_modrm(instr)?;
                let dest = self.read_rm16(instr)?;
                let src = self.get_reg16(instr.reg);
                if dest & 3 < src & 3 {
                    self.flags.zero = true;
                    self.write_rm16(instr, (dest & 0xFFFC) | (src & 3))?;
                } else {
                    self.flags.zero = false;
                }
                Ok(10)
            }

            // PUSH imm16/32, PUSH imm8 (80186+)
            0x68 if self.model().supports_80186_instructions() => {
                let val = self.fetch_imm(instr.operand_32)?;
                self.push_sized(val, instr.operand_32)?;
                Ok(10)
            }
            0x6A if self.model().supports_80186_instructions() => {
                let val = self.fetch_u8()? as i8 as i32 as u32;
                self.push_sized(val, instr.operand_32)?;
                Ok(10)
            }
            // IMUL r16/32, rm16/32, imm (80186+)
            0x69 if self.model().supports_80186_instructions() => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.fetch_imm(instr.operand_32)?;
                let r = self.imul_sized(a, b, instr.operand_32);
                self.set_reg(instr.reg, r, instr.operand_32);
                Ok(22)
            }
            0x6B if self.model().supports_80186_instructions() => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.fetch_u8()? as i8 as i32 as u32;
                let r = self.imul_sized(a, b, instr.operand_32);
                self.set_reg(instr.reg, r, instr.operand_32);
                Ok(22)
            }

            // INS/OUTS/MOVS/CMPS/STOS/LODS/SCAS string operations
            0x6C..=0x6F if self.model().supports_80186_instructions() => {
                self.string_op(opcode, instr)
            }
            0xA4..=0xA7 | 0xAA..=0xAF => self.string_op(opcode, instr),

            // Jcc rel8
            0x70..=0x7F => {
                let rel = self.fetch_u8()? as i8 as i32;
                if self.check_condition(opcode & 0xF) {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(16)
                } else {
                    Ok(4)
                }
            }

            // Group 1: ALU rm, imm
            0x80 | 0x82 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm8(instr)?;
                let b = self.fetch_u8()?;
                let (r, writeback) = self.alu_apply8(instr.reg, a, b);
                if writeback {
                    self.write_rm8(instr, r)?;
                }
                Ok(if instr.mode == 3 { 4 } else { 17 })
            }
            0x81 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.fetch_imm(instr.operand_32)?;
                let (r, writeback) = self.alu_apply(instr.reg, a, b, instr.operand_32);
                if writeback {
                    self.write_rm(instr, r)?;
                }
                Ok(if instr.mode == 3 { 4 } else { 17 })
            }
            0x83 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.fetch_u8()? as i8 as i32 as u32;
                let (r, writeback) = self.alu_apply(instr.reg, a, b, instr.operand_32);
                if writeback {
                    self.write_rm(instr, r)?;
                }
                Ok(if instr.mode == 3 { 4 } else { 17 })
            }

            // TEST rm, r
            0x84 => {
                self.fetch_modrm(instr)?;
                let r = self.read_rm8(instr)? & self.get_reg8(instr.reg);
                self.logic_flags8(r);
                Ok(5)
            }
            0x85 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.get_reg(instr.reg, instr.operand_32);
                if instr.operand_32 {
                    self.logic_flags32(a & b);
                } else {
                    self.logic_flags16((a & b) as u16);
                }
                Ok(5)
            }

            // XCHG rm, r
            0x86 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm8(instr)?;
                let b = self.get_reg8(instr.reg);
                self.write_rm8(instr, b)?;
                self.set_reg8(instr.reg, a);
                Ok(if instr.mode == 3 { 4 } else { 17 })
            }
            0x87 => {
                self.fetch_modrm(instr)?;
                let a = self.read_rm(instr)?;
                let b = self.get_reg(instr.reg, instr.operand_32);
                self.write_rm(instr, b)?;
                self.set_reg(instr.reg, a, instr.operand_32);
                Ok(if instr.mode == 3 { 4 } else { 17 })
            }

            // MOV
            0x88 => {
                self.fetch_modrm(instr)?;
                let val = self.get_reg8(instr.reg);
                self.write_rm8(instr, val)?;
                Ok(if instr.mode == 3 { 2 } else { 9 })
            }
            0x89 => {
                self.fetch_modrm(instr)?;
                let val = self.get_reg(instr.reg, instr.operand_32);
                self.write_rm(instr, val)?;
                Ok(if instr.mode == 3 { 2 } else { 9 })
            }
            0x8A => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm8(instr)?;
                self.set_reg8(instr.reg, val);
                Ok(if instr.mode == 3 { 2 } else { 8 })
            }
            0x8B => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm(instr)?;
                self.set_reg(instr.reg, val, instr.operand_32);
                Ok(if instr.mode == 3 { 2 } else { 8 })
            }
            // MOV rm16, sreg
            0x8C => {
                self.fetch_modrm(instr)?;
                if instr.reg > 5 {
                    return Err(Exception::ud());
                }
                let sel = self.segs[instr.reg as usize].selector;
                if instr.mode == 3 && instr.operand_32 {
                    self.set_reg32(instr.rm, sel as u32);
                } else {
                    self.write_rm16(instr, sel)?;
                }
                Ok(if instr.mode == 3 { 2 } else { 9 })
            }
            // LEA r16/32, m
            0x8D => {
                self.fetch_modrm(instr)?;
                if instr.mode == 3 {
                    return Err(Exception::ud());
                }
                let off = if instr.address_32 {
                    instr.ea_off
                } else {
                    instr.ea_off & 0xFFFF
                };
                self.set_reg(instr.reg, off, instr.operand_32);
                Ok(2)
            }
            // MOV sreg, rm16
            0x8E => {
                self.fetch_modrm(instr)?;
                if instr.reg > 5 || instr.reg as usize == SEG_CS {
                    return Err(Exception::ud());
                }
                let sel = self.read_rm16(instr)?;
                self.load_segment(instr.reg as usize, sel)?;
                Ok(if instr.mode == 3 { 2 } else { 8 })
            }
            // POP rm
            0x8F => {
                self.fetch_modrm(instr)?;
                let val = self.pop_sized(instr.operand_32)?;
                self.write_rm(instr, val)?;
                Ok(if instr.mode == 3 { 8 } else { 17 })
            }

            // NOP / XCHG eAX, r
            0x90 => Ok(3),
            0x91..=0x97 => {
                let reg = opcode & 7;
                let a = self.get_reg(0, instr.operand_32);
                let b = self.get_reg(reg, instr.operand_32);
                self.set_reg(0, b, instr.operand_32);
                self.set_reg(reg, a, instr.operand_32);
                Ok(3)
            }

            // CBW/CWDE
            0x98 => {
                if instr.operand_32 {
                    let val = self.get_reg16(0) as i16 as i32;
                    self.set_reg32(0, val as u32);
                } else {
                    let val = self.get_reg8(0) as i8 as i16;
                    self.set_reg16(0, val as u16);
                }
                Ok(2)
            }
            // CWD/CDQ
            0x99 => {
                if instr.operand_32 {
                    let sign = if self.get_reg32(0) & 0x8000_0000 != 0 {
                        0xFFFF_FFFF
                    } else {
                        0
                    };
                    self.set_reg32(REG_EDX as u8, sign);
                } else {
                    let sign = if self.get_reg16(0) & 0x8000 != 0 {
                        0xFFFF
                    } else {
                        0
                    };
                    self.set_reg16(REG_EDX as u8, sign);
                }
                Ok(5)
            }

            // CALL far ptr16:16/32
            0x9A => {
                let offset = self.fetch_imm(instr.operand_32)?;
                let selector = self.fetch_u16()?;
                self.far_call(selector, offset, instr.operand_32)?;
                Ok(28)
            }

            // WAIT: fault if the FPU context needs OS attention
            0x9B => {
                let cr0 = self.protected_mode.cr0;
                if cr0 & CR0_TS != 0 && cr0 & CR0_MP != 0 {
                    return Err(Exception::new(INT_NO_COPROCESSOR));
                }
                Ok(4)
            }

            // PUSHF/POPF
            0x9C => {
                if self.flags.v86 && self.flags.iopl < 3 {
                    return Err(Exception::gp(0));
                }
                let image = self.flags.pack();
                if instr.operand_32 {
                    // VM and RF never appear in a pushed image
                    self.push32(image & !0x0003_0000)?;
                } else {
                    self.push16(image as u16)?;
                }
                Ok(10)
            }
            0x9D => {
                if self.flags.v86 && self.flags.iopl < 3 {
                    return Err(Exception::gp(0));
                }
                let cpl = self.protected_mode.cpl;
                if instr.operand_32 {
                    let val = self.pop32()?;
                    self.flags.unpack(val, cpl);
                } else {
                    let val = self.pop16()? as u32;
                    let keep = self.flags.pack() & 0xFFFF_0000;
                    self.flags.unpack(keep | val, cpl);
                }
                Ok(8)
            }

            // SAHF/LAHF
            0x9E => {
                let ah = self.get_reg8(4);
                self.flags.carry = ah & 0x01 != 0;
                self.flags.parity = ah & 0x04 != 0;
                self.flags.adjust = ah & 0x10 != 0;
                self.flags.zero = ah & 0x40 != 0;
                self.flags.sign = ah & 0x80 != 0;
                Ok(4)
            }
            0x9F => {
                let val = (self.flags.pack() & 0xFF) as u8;
                self.set_reg8(4, val);
                Ok(4)
            }

            // MOV AL/eAX, moffs and back
            0xA0 => {
                let off = self.fetch_moffs(instr)?;
                let seg = instr.seg_override.unwrap_or(SEG_DS);
                let val = self.read_virt8(seg, off)?;
                self.set_reg8(0, val);
                Ok(10)
            }
            0xA1 => {
                let off = self.fetch_moffs(instr)?;
                let seg = instr.seg_override.unwrap_or(SEG_DS);
                let val = if instr.operand_32 {
                    self.read_virt32(seg, off)?
                } else {
                    self.read_virt16(seg, off)? as u32
                };
                self.set_reg(0, val, instr.operand_32);
                Ok(10)
            }
            0xA2 => {
                let off = self.fetch_moffs(instr)?;
                let seg = instr.seg_override.unwrap_or(SEG_DS);
                let val = self.get_reg8(0);
                self.write_virt8(seg, off, val)?;
                Ok(10)
            }
            0xA3 => {
                let off = self.fetch_moffs(instr)?;
                let seg = instr.seg_override.unwrap_or(SEG_DS);
                if instr.operand_32 {
                    let val = self.get_reg32(0);
                    self.write_virt32(seg, off, val)?;
                } else {
                    let val = self.get_reg16(0);
                    self.write_virt16(seg, off, val)?;
                }
                Ok(10)
            }

            // TEST AL/eAX, imm
            0xA8 => {
                let r = self.get_reg8(0) & self.fetch_u8()?;
                self.logic_flags8(r);
                Ok(4)
            }
            0xA9 => {
                let a = self.get_reg(0, instr.operand_32);
                let b = self.fetch_imm(instr.operand_32)?;
                if instr.operand_32 {
                    self.logic_flags32(a & b);
                } else {
                    self.logic_flags16((a & b) as u16);
                }
                Ok(4)
            }

            // MOV r8, imm8
            0xB0..=0xB7 => {
                let val = self.fetch_u8()?;
                self.set_reg8(opcode & 7, val);
                Ok(4)
            }
            // MOV r16/32, imm
            0xB8..=0xBF => {
                let val = self.fetch_imm(instr.operand_32)?;
                self.set_reg(opcode & 7, val, instr.operand_32);
                Ok(4)
            }

            // Group 2: shift/rotate rm, imm8 (80186+)
            0xC0 if self.model().supports_80186_instructions() => {
                self.fetch_modrm(instr)?;
                let count = self.fetch_u8()?;
                let val = self.read_rm8(instr)?;
                let r = self.shift_rotate(val as u32, instr.reg, count, 8);
                self.write_rm8(instr, r as u8)?;
                Ok(if instr.mode == 3 { 5 } else { 17 })
            }
            0xC1 if self.model().supports_80186_instructions() => {
                self.fetch_modrm(instr)?;
                let count = self.fetch_u8()?;
                let val = self.read_rm(instr)?;
                let bits = if instr.operand_32 { 32 } else { 16 };
                let r = self.shift_rotate(val, instr.reg, count, bits);
                self.write_rm(instr, r)?;
                Ok(if instr.mode == 3 { 5 } else { 17 })
            }

            // RET near
            0xC2 => {
                let adjust = self.fetch_u16()?;
                let target = self.pop_sized(instr.operand_32)?;
                self.adjust_sp_by(adjust as u32);
                self.set_ip(target, instr.operand_32);
                Ok(20)
            }
            0xC3 => {
                let target = self.pop_sized(instr.operand_32)?;
                self.set_ip(target, instr.operand_32);
                Ok(16)
            }

            // LES/LDS r16/32, m16:16/32
            0xC4 => self.load_far_pointer(instr, SEG_ES).map(|_| 16),
            0xC5 => self.load_far_pointer(instr, SEG_DS).map(|_| 16),

            // MOV rm, imm
            0xC6 => {
                self.fetch_modrm(instr)?;
                let val = self.fetch_u8()?;
                self.write_rm8(instr, val)?;
                Ok(if instr.mode == 3 { 4 } else { 10 })
            }
            0xC7 => {
                self.fetch_modrm(instr)?;
                let val = self.fetch_imm(instr.operand_32)?;
                self.write_rm(instr, val)?;
                Ok(if instr.mode == 3 { 4 } else { 10 })
            }

            // ENTER imm16, imm8 (80186+)
            0xC8 if self.model().supports_80186_instructions() => {
                let frame_size = self.fetch_u16()?;
                let nesting = self.fetch_u8()? & 0x1F;
                let bp = self.get_reg(REG_EBP as u8, instr.operand_32);
                self.push_sized(bp, instr.operand_32)?;
                let frame_ptr = self.get_reg(REG_ESP as u8, instr.operand_32);
                if nesting > 0 {
                    let step: u32 = if instr.operand_32 { 4 } else { 2 };
                    let mut base = bp;
                    for _ in 1..nesting {
                        base = base.wrapping_sub(step);
                        let inner = if instr.operand_32 {
                            self.read_virt32(SEG_SS, base)?
                        } else {
                            self.read_virt16(SEG_SS, base & 0xFFFF)? as u32
                        };
                        self.push_sized(inner, instr.operand_32)?;
                    }
                    self.push_sized(frame_ptr, instr.operand_32)?;
                }
                self.set_reg(REG_EBP as u8, frame_ptr, instr.operand_32);
                self.adjust_sp_by_signed(-(frame_size as i32));
                Ok(15)
            }
            // LEAVE (80186+)
            0xC9 if self.model().supports_80186_instructions() => {
                let bp = self.get_reg(REG_EBP as u8, instr.operand_32);
                if self.segs[SEG_SS].default_32 {
                    self.regs[REG_ESP] = bp;
                } else {
                    self.set_reg16(REG_ESP as u8, bp as u16);
                }
                let val = self.pop_sized(instr.operand_32)?;
                self.set_reg(REG_EBP as u8, val, instr.operand_32);
                Ok(8)
            }

            // RET far
            0xCA => {
                let adjust = self.fetch_u16()?;
                self.far_return(instr.operand_32, adjust)?;
                Ok(25)
            }
            0xCB => {
                self.far_return(instr.operand_32, 0)?;
                Ok(25)
            }

            // INT3/INT imm8/INTO/IRET
            0xCC => {
                self.dispatch_interrupt(INT_BREAKPOINT, true, false, None)?;
                Ok(26)
            }
            0xCD => {
                let vector = self.fetch_u8()?;
                self.dispatch_interrupt(vector, true, false, None)?;
                Ok(26)
            }
            0xCE => {
                if self.flags.overflow {
                    self.dispatch_interrupt(INT_OVERFLOW, true, false, None)?;
                    Ok(26)
                } else {
                    Ok(4)
                }
            }
            0xCF => {
                self.do_iret(instr.operand_32)?;
                Ok(32)
            }

            // Group 2: shift/rotate rm, 1 / CL
            0xD0 => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm8(instr)?;
                let r = self.shift_rotate(val as u32, instr.reg, 1, 8);
                self.write_rm8(instr, r as u8)?;
                Ok(if instr.mode == 3 { 2 } else { 15 })
            }
            0xD1 => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm(instr)?;
                let bits = if instr.operand_32 { 32 } else { 16 };
                let r = self.shift_rotate(val, instr.reg, 1, bits);
                self.write_rm(instr, r)?;
                Ok(if instr.mode == 3 { 2 } else { 15 })
            }
            0xD2 => {
                self.fetch_modrm(instr)?;
                let count = self.get_reg8(1); // CL
                let val = self.read_rm8(instr)?;
                let r = self.shift_rotate(val as u32, instr.reg, count, 8);
                self.write_rm8(instr, r as u8)?;
                Ok(if instr.mode == 3 { 8 } else { 20 })
            }
            0xD3 => {
                self.fetch_modrm(instr)?;
                let count = self.get_reg8(1); // CL
                let val = self.read_rm(instr)?;
                let bits = if instr.operand_32 { 32 } else { 16 };
                let r = self.shift_rotate(val, instr.reg, count, bits);
                self.write_rm(instr, r)?;
                Ok(if instr.mode == 3 { 8 } else { 20 })
            }

            // AAM/AAD
            0xD4 => {
                let divisor = self.fetch_u8()?;
                if divisor == 0 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                let al = self.get_reg8(0);
                self.set_reg8(4, al / divisor);
                let al = al % divisor;
                self.set_reg8(0, al);
                self.update_flags_szp8(al);
                Ok(83)
            }
            0xD5 => {
                let multiplier = self.fetch_u8()?;
                let al = self
                    .get_reg8(0)
                    .wrapping_add(self.get_reg8(4).wrapping_mul(multiplier));
                self.set_reg8(0, al);
                self.set_reg8(4, 0);
                self.update_flags_szp8(al);
                Ok(60)
            }

            // SALC (undocumented, used by copy-protection era code)
            0xD6 => {
                self.set_reg8(0, if self.flags.carry { 0xFF } else { 0x00 });
                Ok(3)
            }

            // XLAT
            0xD7 => {
                let seg = instr.seg_override.unwrap_or(SEG_DS);
                let base = if instr.address_32 {
                    self.get_reg32(REG_EBX as u8)
                } else {
                    self.get_reg16(REG_EBX as u8) as u32
                };
                let off = base.wrapping_add(self.get_reg8(0) as u32);
                let off = if instr.address_32 { off } else { off & 0xFFFF };
                let val = self.read_virt8(seg, off)?;
                self.set_reg8(0, val);
                Ok(11)
            }

            // FPU escape opcodes
            0xD8..=0xDF => self.execute_fpu(opcode, instr),

            // LOOPNZ/LOOPZ/LOOP/JCXZ
            0xE0 => {
                let rel = self.fetch_u8()? as i8 as i32;
                let count = self.dec_count_reg(instr.address_32);
                if count != 0 && !self.flags.zero {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(19)
                } else {
                    Ok(5)
                }
            }
            0xE1 => {
                let rel = self.fetch_u8()? as i8 as i32;
                let count = self.dec_count_reg(instr.address_32);
                if count != 0 && self.flags.zero {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(18)
                } else {
                    Ok(6)
                }
            }
            0xE2 => {
                let rel = self.fetch_u8()? as i8 as i32;
                let count = self.dec_count_reg(instr.address_32);
                if count != 0 {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(17)
                } else {
                    Ok(5)
                }
            }
            0xE3 => {
                let rel = self.fetch_u8()? as i8 as i32;
                let count = if instr.address_32 {
                    self.get_reg32(REG_ECX as u8)
                } else {
                    self.get_reg16(REG_ECX as u8) as u32
                };
                if count == 0 {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(18)
                } else {
                    Ok(6)
                }
            }

            // IN/OUT with immediate port
            0xE4 => {
                let port = self.fetch_u8()? as u16;
                let val = self.memory.io_read(port);
                self.set_reg8(0, val);
                Ok(10)
            }
            0xE5 => {
                let port = self.fetch_u8()? as u16;
                let val = self.io_read_sized(port, instr.operand_32);
                self.set_reg(0, val, instr.operand_32);
                Ok(10)
            }
            0xE6 => {
                let port = self.fetch_u8()? as u16;
                let val = self.get_reg8(0);
                self.memory.io_write(port, val);
                Ok(10)
            }
            0xE7 => {
                let port = self.fetch_u8()? as u16;
                let val = self.get_reg(0, instr.operand_32);
                self.io_write_sized(port, val, instr.operand_32);
                Ok(10)
            }

            // CALL rel16/32
            0xE8 => {
                let rel = self.fetch_rel(instr.operand_32)?;
                self.push_sized(self.eip, instr.operand_32)?;
                self.jump_relative(rel, instr.operand_32);
                Ok(19)
            }
            // JMP rel16/32
            0xE9 => {
                let rel = self.fetch_rel(instr.operand_32)?;
                self.jump_relative(rel, instr.operand_32);
                Ok(15)
            }
            // JMP far ptr16:16/32
            0xEA => {
                let offset = self.fetch_imm(instr.operand_32)?;
                let selector = self.fetch_u16()?;
                self.far_jump(selector, offset, instr.operand_32)?;
                Ok(15)
            }
            // JMP rel8
            0xEB => {
                let rel = self.fetch_u8()? as i8 as i32;
                self.jump_relative(rel, instr.operand_32);
                Ok(15)
            }

            // IN/OUT with DX port
            0xEC => {
                let port = self.get_reg16(REG_EDX as u8);
                let val = self.memory.io_read(port);
                self.set_reg8(0, val);
                Ok(8)
            }
            0xED => {
                let port = self.get_reg16(REG_EDX as u8);
                let val = self.io_read_sized(port, instr.operand_32);
                self.set_reg(0, val, instr.operand_32);
                Ok(8)
            }
            0xEE => {
                let port = self.get_reg16(REG_EDX as u8);
                let val = self.get_reg8(0);
                self.memory.io_write(port, val);
                Ok(8)
            }
            0xEF => {
                let port = self.get_reg16(REG_EDX as u8);
                let val = self.get_reg(0, instr.operand_32);
                self.io_write_sized(port, val, instr.operand_32);
                Ok(8)
            }

            // INT1 (ICEBP)
            0xF1 => {
                self.dispatch_interrupt(INT_DEBUG, true, false, None)?;
                Ok(26)
            }

            // HLT
            0xF4 => {
                if self.flags.v86 || (self.in_protected_mode() && self.protected_mode.cpl != 0) {
                    return Err(Exception::gp(0));
                }
                self.set_halted(true);
                Ok(2)
            }

            // CMC/CLC/STC/CLI/STI/CLD/STD
            0xF5 => {
                self.flags.carry = !self.flags.carry;
                Ok(2)
            }
            0xF8 => {
                self.flags.carry = false;
                Ok(2)
            }
            0xF9 => {
                self.flags.carry = true;
                Ok(2)
            }
            0xFA => {
                self.check_iopl()?;
                self.flags.interrupt = false;
                Ok(2)
            }
            0xFB => {
                self.check_iopl()?;
                self.flags.interrupt = true;
                Ok(2)
            }
            0xFC => {
                self.flags.direction = false;
                Ok(2)
            }
            0xFD => {
                self.flags.direction = true;
                Ok(2)
            }

            // Group 3: TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
            0xF6 => self.group3_8(instr),
            0xF7 => self.group3(instr),

            // Group 4: INC/DEC rm8
            0xFE => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm8(instr)?;
                let carry = self.flags.carry;
                let r = match instr.reg {
                    0 => self.alu_add8(val, 1, false),
                    1 => self.alu_sub8(val, 1, false),
                    _ => return Err(Exception::ud()),
                };
                self.flags.carry = carry;
                self.write_rm8(instr, r)?;
                Ok(if instr.mode == 3 { 3 } else { 15 })
            }
            // Group 5: INC/DEC/CALL/JMP/PUSH rm
            0xFF => self.group5(instr),

            _ => {
                log(LogCategory::Cpu, LogLevel::Debug, || {
                    format!(
                        "invalid opcode {:02X} at {:04X}:{:08X}",
                        opcode, self.segs[SEG_CS].selector, instr.start_eip
                    )
                });
                Err(Exception::ud())
            }
        }
    }

    // ==================================================================
    // Helpers shared by the opcode handlers
    // ==================================================================

    /// Relative branch: result is truncated to 16 bits in 16-bit operand size
    pub(crate) fn jump_relative(&mut self, rel: i32, op_32: bool) {
        let target = self.eip.wrapping_add(rel as u32);
        self.eip = if op_32 { target } else { target & 0xFFFF };
    }

    pub(crate) fn set_ip(&mut self, target: u32, op_32: bool) {
        self.eip = if op_32 { target } else { target & 0xFFFF };
    }

    fn fetch_rel(&mut self, op_32: bool) -> Result<i32, Exception> {
        if op_32 {
            Ok(self.fetch_u32()? as i32)
        } else {
            Ok(self.fetch_u16()? as i16 as i32)
        }
    }

    /// Fetch the moffs direct address at the instruction's address size
    fn fetch_moffs(&mut self, instr: &Instr) -> Result<u32, Exception> {
        if instr.address_32 {
            self.fetch_u32()
        } else {
            Ok(self.fetch_u16()? as u32)
        }
    }

    fn adjust_sp_by(&mut self, bytes: u32) {
        if self.segs[SEG_SS].default_32 {
            self.regs[REG_ESP] = self.regs[REG_ESP].wrapping_add(bytes);
        } else {
            let sp = (self.regs[REG_ESP] as u16).wrapping_add(bytes as u16);
            self.set_reg16(REG_ESP as u8, sp);
        }
    }

    fn adjust_sp_by_signed(&mut self, bytes: i32) {
        self.adjust_sp_by(bytes as u32);
    }

    /// Decrement CX or ECX per the address size, returning the new count
    fn dec_count_reg(&mut self, addr_32: bool) -> u32 {
        if addr_32 {
            let count = self.get_reg32(REG_ECX as u8).wrapping_sub(1);
            self.set_reg32(REG_ECX as u8, count);
            count
        } else {
            let count = self.get_reg16(REG_ECX as u8).wrapping_sub(1);
            self.set_reg16(REG_ECX as u8, count);
            count as u32
        }
    }

    /// CLI/STI privilege rule: IOPL gates interrupt-flag changes
    fn check_iopl(&mut self) -> Result<(), Exception> {
        if self.flags.v86 {
            if self.flags.iopl < 3 {
                return Err(Exception::gp(0));
            }
        } else if self.in_protected_mode() && self.protected_mode.cpl > self.flags.iopl {
            return Err(Exception::gp(0));
        }
        Ok(())
    }

    /// Word/dword port access built from byte accesses
    fn io_read_sized(&mut self, port: u16, size_32: bool) -> u32 {
        let low = self.memory.io_read(port) as u32;
        let high = self.memory.io_read(port.wrapping_add(1)) as u32;
        let mut val = (high << 8) | low;
        if size_32 {
            let b2 = self.memory.io_read(port.wrapping_add(2)) as u32;
            let b3 = self.memory.io_read(port.wrapping_add(3)) as u32;
            val |= (b2 << 16) | (b3 << 24);
        }
        val
    }

    fn io_write_sized(&mut self, port: u16, val: u32, size_32: bool) {
        self.memory.io_write(port, (val & 0xFF) as u8);
        self.memory.io_write(port.wrapping_add(1), ((val >> 8) & 0xFF) as u8);
        if size_32 {
            self.memory
                .io_write(port.wrapping_add(2), ((val >> 16) & 0xFF) as u8);
            self.memory
                .io_write(port.wrapping_add(3), ((val >> 24) & 0xFF) as u8);
        }
    }

    /// LES/LDS/LSS/LFS/LGS: load a far pointer from memory into reg + segment
    fn load_far_pointer(&mut self, instr: &mut Instr, seg: usize) -> Result<(), Exception> {
        self.fetch_modrm(instr)?;
        if instr.mode == 3 {
            return Err(Exception::ud());
        }
        let (offset, sel_at) = if instr.operand_32 {
            (self.cpu_read_u32(instr.ea)?, instr.ea.wrapping_add(4))
        } else {
            (self.cpu_read_u16(instr.ea)? as u32, instr.ea.wrapping_add(2))
        };
        let selector = self.cpu_read_u16(sel_at)?;
        self.load_segment(seg, selector)?;
        self.set_reg(instr.reg, offset, instr.operand_32);
        Ok(())
    }

    /// Two-operand IMUL result with CF/OF signalling a truncated product
    fn imul_sized(&mut self, a: u32, b: u32, size_32: bool) -> u32 {
        if size_32 {
            let wide = (a as i32 as i64) * (b as i32 as i64);
            let result = wide as i32;
            let overflow = wide != result as i64;
            self.flags.carry = overflow;
            self.flags.overflow = overflow;
            result as u32
        } else {
            let wide = (a as u16 as i16 as i32) * (b as u16 as i16 as i32);
            let result = wide as i16;
            let overflow = wide != result as i32;
            self.flags.carry = overflow;
            self.flags.overflow = overflow;
            result as u16 as u32
        }
    }

    // ==================================================================
    // BCD adjustments
    // ==================================================================

    fn op_daa(&mut self) {
        let old_al = self.get_reg8(0);
        let old_cf = self.flags.carry;
        let mut al = old_al;
        if old_al & 0x0F > 9 || self.flags.adjust {
            al = al.wrapping_add(6);
            self.flags.carry = old_cf || old_al > 0xF9;
            self.flags.adjust = true;
        } else {
            self.flags.adjust = false;
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_add(0x60);
            self.flags.carry = true;
        } else {
            self.flags.carry = false;
        }
        self.set_reg8(0, al);
        self.update_flags_szp8(al);
    }

    fn op_das(&mut self) {
        let old_al = self.get_reg8(0);
        let old_cf = self.flags.carry;
        let mut al = old_al;
        if old_al & 0x0F > 9 || self.flags.adjust {
            al = al.wrapping_sub(6);
            self.flags.carry = old_cf || old_al < 6;
            self.flags.adjust = true;
        } else {
            self.flags.adjust = false;
        }
        if old_al > 0x99 || old_cf {
            al = al.wrapping_sub(0x60);
            self.flags.carry = true;
        }
        self.set_reg8(0, al);
        self.update_flags_szp8(al);
    }

    fn op_aaa(&mut self) {
        if self.get_reg8(0) & 0x0F > 9 || self.flags.adjust {
            let al = self.get_reg8(0).wrapping_add(6);
            let ah = self.get_reg8(4).wrapping_add(1);
            self.set_reg8(0, al & 0x0F);
            self.set_reg8(4, ah);
            self.flags.adjust = true;
            self.flags.carry = true;
        } else {
            self.set_reg8(0, self.get_reg8(0) & 0x0F);
            self.flags.adjust = false;
            self.flags.carry = false;
        }
    }

    fn op_aas(&mut self) {
        if self.get_reg8(0) & 0x0F > 9 || self.flags.adjust {
            let al = self.get_reg8(0).wrapping_sub(6);
            let ah = self.get_reg8(4).wrapping_sub(1);
            self.set_reg8(0, al & 0x0F);
            self.set_reg8(4, ah);
            self.flags.adjust = true;
            self.flags.carry = true;
        } else {
            self.set_reg8(0, self.get_reg8(0) & 0x0F);
            self.flags.adjust = false;
            self.flags.carry = false;
        }
    }

    // ==================================================================
    // Group 3 (F6/F7): TEST/NOT/NEG/MUL/IMUL/DIV/IDIV
    //
    // Divide-by-zero and quotient overflow are guest-visible CPU exceptions,
    // never host arithmetic errors.
    // ==================================================================

    fn group3_8(&mut self, instr: &mut Instr) -> Result<u32, Exception> {
        self.fetch_modrm(instr)?;
        let val = self.read_rm8(instr)?;
        match instr.reg {
            0 | 1 => {
                let imm = self.fetch_u8()?;
                self.logic_flags8(val & imm);
                Ok(5)
            }
            2 => {
                self.write_rm8(instr, !val)?;
                Ok(3)
            }
            3 => {
                let r = self.alu_sub8(0, val, false);
                self.write_rm8(instr, r)?;
                Ok(3)
            }
            4 => {
                let product = self.get_reg8(0) as u16 * val as u16;
                self.set_reg16(0, product);
                let upper_set = product & 0xFF00 != 0;
                self.flags.carry = upper_set;
                self.flags.overflow = upper_set;
                Ok(70)
            }
            5 => {
                let product = (self.get_reg8(0) as i8 as i16) * (val as i8 as i16);
                self.set_reg16(0, product as u16);
                let truncated = product as i8 as i16 != product;
                self.flags.carry = truncated;
                self.flags.overflow = truncated;
                Ok(80)
            }
            6 => {
                if val == 0 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                let dividend = self.get_reg16(0);
                let quotient = dividend / val as u16;
                if quotient > 0xFF {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                self.set_reg8(0, quotient as u8);
                self.set_reg8(4, (dividend % val as u16) as u8);
                Ok(80)
            }
            _ => {
                if val == 0 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                let dividend = self.get_reg16(0) as i16;
                let divisor = val as i8 as i16;
                let quotient = dividend.wrapping_div(divisor);
                if quotient > 127 || quotient < -128 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                self.set_reg8(0, quotient as u8);
                self.set_reg8(4, dividend.wrapping_rem(divisor) as u8);
                Ok(101)
            }
        }
    }

    fn group3(&mut self, instr: &mut Instr) -> Result<u32, Exception> {
        self.fetch_modrm(instr)?;
        let op_32 = instr.operand_32;
        let val = self.read_rm(instr)?;
        match instr.reg {
            0 | 1 => {
                let imm = self.fetch_imm(op_32)?;
                if op_32 {
                    self.logic_flags32(val & imm);
                } else {
                    self.logic_flags16((val & imm) as u16);
                }
                Ok(5)
            }
            2 => {
                self.write_rm(instr, !val)?;
                Ok(3)
            }
            3 => {
                let r = if op_32 {
                    self.alu_sub32(0, val, false)
                } else {
                    self.alu_sub16(0, val as u16, false) as u32
                };
                self.write_rm(instr, r)?;
                Ok(3)
            }
            4 => {
                if op_32 {
                    let product = self.get_reg32(0) as u64 * val as u64;
                    self.set_reg32(0, product as u32);
                    self.set_reg32(REG_EDX as u8, (product >> 32) as u32);
                    let upper_set = product >> 32 != 0;
                    self.flags.carry = upper_set;
                    self.flags.overflow = upper_set;
                } else {
                    let product = self.get_reg16(0) as u32 * val as u32;
                    self.set_reg16(0, product as u16);
                    self.set_reg16(REG_EDX as u8, (product >> 16) as u16);
                    let upper_set = product >> 16 != 0;
                    self.flags.carry = upper_set;
                    self.flags.overflow = upper_set;
                }
                Ok(120)
            }
            5 => {
                if op_32 {
                    let product = (self.get_reg32(0) as i32 as i64) * (val as i32 as i64);
                    self.set_reg32(0, product as u32);
                    self.set_reg32(REG_EDX as u8, (product >> 32) as u32);
                    let truncated = product as i32 as i64 != product;
                    self.flags.carry = truncated;
                    self.flags.overflow = truncated;
                } else {
                    let product = (self.get_reg16(0) as i16 as i32) * (val as u16 as i16 as i32);
                    self.set_reg16(0, product as u16);
                    self.set_reg16(REG_EDX as u8, (product >> 16) as u16);
                    let truncated = product as i16 as i32 != product;
                    self.flags.carry = truncated;
                    self.flags.overflow = truncated;
                }
                Ok(130)
            }
            6 => {
                if val == 0 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                if op_32 {
                    let dividend =
                        ((self.get_reg32(REG_EDX as u8) as u64) << 32) | self.get_reg32(0) as u64;
                    let quotient = dividend / val as u64;
                    if quotient > 0xFFFF_FFFF {
                        return Err(Exception::new(INT_DIVIDE_ERROR));
                    }
                    self.set_reg32(0, quotient as u32);
                    self.set_reg32(REG_EDX as u8, (dividend % val as u64) as u32);
                } else {
                    let dividend =
                        ((self.get_reg16(REG_EDX as u8) as u32) << 16) | self.get_reg16(0) as u32;
                    let quotient = dividend / val;
                    if quotient > 0xFFFF {
                        return Err(Exception::new(INT_DIVIDE_ERROR));
                    }
                    self.set_reg16(0, quotient as u16);
                    self.set_reg16(REG_EDX as u8, (dividend % val) as u16);
                }
                Ok(150)
            }
            _ => {
                if val == 0 {
                    return Err(Exception::new(INT_DIVIDE_ERROR));
                }
                if op_32 {
                    let dividend = (((self.get_reg32(REG_EDX as u8) as u64) << 32)
                        | self.get_reg32(0) as u64) as i64;
                    let divisor = val as i32 as i64;
                    let quotient = dividend.wrapping_div(divisor);
                    if quotient > i32::MAX as i64 || quotient < i32::MIN as i64 {
                        return Err(Exception::new(INT_DIVIDE_ERROR));
                    }
                    self.set_reg32(0, quotient as u32);
                    self.set_reg32(REG_EDX as u8, dividend.wrapping_rem(divisor) as u32);
                } else {
                    let dividend = (((self.get_reg16(REG_EDX as u8) as u32) << 16)
                        | self.get_reg16(0) as u32) as i32;
                    let divisor = val as u16 as i16 as i32;
                    let quotient = dividend.wrapping_div(divisor);
                    if quotient > i16::MAX as i32 || quotient < i16::MIN as i32 {
                        return Err(Exception::new(INT_DIVIDE_ERROR));
                    }
                    self.set_reg16(0, quotient as u16);
                    self.set_reg16(REG_EDX as u8, dividend.wrapping_rem(divisor) as u16);
                }
                Ok(170)
            }
        }
    }

    // ==================================================================
    // Group 5 (FF): INC/DEC/CALL/CALL far/JMP/JMP far/PUSH
    // ==================================================================

    fn group5(&mut self, instr: &mut Instr) -> Result<u32, Exception> {
        self.fetch_modrm(instr)?;
        match instr.reg {
            0 => {
                let val = self.read_rm(instr)?;
                let r = self.inc_sized(val, instr.operand_32);
                self.write_rm(instr, r)?;
                Ok(if instr.mode == 3 { 3 } else { 15 })
            }
            1 => {
                let val = self.read_rm(instr)?;
                let r = self.dec_sized(val, instr.operand_32);
                self.write_rm(instr, r)?;
                Ok(if instr.mode == 3 { 3 } else { 15 })
            }
            // CALL rm (near indirect)
            2 => {
                let target = self.read_rm(instr)?;
                self.push_sized(self.eip, instr.operand_32)?;
                self.set_ip(target, instr.operand_32);
                Ok(16)
            }
            // CALL m16:16/32 (far indirect)
            3 => {
                if instr.mode == 3 {
                    return Err(Exception::ud());
                }
                let (offset, selector) = self.read_far_operand(instr)?;
                self.far_call(selector, offset, instr.operand_32)?;
                Ok(37)
            }
            // JMP rm (near indirect)
            4 => {
                let target = self.read_rm(instr)?;
                self.set_ip(target, instr.operand_32);
                Ok(11)
            }
            // JMP m16:16/32 (far indirect)
            5 => {
                if instr.mode == 3 {
                    return Err(Exception::ud());
                }
                let (offset, selector) = self.read_far_operand(instr)?;
                self.far_jump(selector, offset, instr.operand_32)?;
                Ok(24)
            }
            // PUSH rm
            6 => {
                let val = self.read_rm(instr)?;
                self.push_sized(val, instr.operand_32)?;
                Ok(if instr.mode == 3 { 11 } else { 16 })
            }
            _ => Err(Exception::ud()),
        }
    }

    fn read_far_operand(&mut self, instr: &Instr) -> Result<(u32, u16), Exception> {
        if instr.operand_32 {
            let offset = self.cpu_read_u32(instr.ea)?;
            let selector = self.cpu_read_u16(instr.ea.wrapping_add(4))?;
            Ok((offset, selector))
        } else {
            let offset = self.cpu_read_u16(instr.ea)? as u32;
            let selector = self.cpu_read_u16(instr.ea.wrapping_add(2))?;
            Ok((offset, selector))
        }
    }

    // ==================================================================
    // String instructions
    //
    // One element per dispatch: with a repeat prefix the handler rewinds EIP
    // to the first prefix byte so the instruction re-enters the fetch loop,
    // which is what lets hardware interrupts and page faults land between
    // elements with consistent register state.
    // ==================================================================

    fn string_op(&mut self, opcode: u8, instr: &mut Instr) -> Result<u32, Exception> {
        let addr_32 = instr.address_32;

        if instr.rep.is_some() {
            let count = if addr_32 {
                self.get_reg32(REG_ECX as u8)
            } else {
                self.get_reg16(REG_ECX as u8) as u32
            };
            if count == 0 {
                return Ok(2);
            }
        }

        let wide = opcode & 1 != 0;
        let size: u32 = if !wide {
            1
        } else if instr.operand_32 {
            4
        } else {
            2
        };
        let src_seg = instr.seg_override.unwrap_or(SEG_DS);

        let si = if addr_32 {
            self.get_reg32(REG_ESI as u8)
        } else {
            self.get_reg16(REG_ESI as u8) as u32
        };
        let di = if addr_32 {
            self.get_reg32(REG_EDI as u8)
        } else {
            self.get_reg16(REG_EDI as u8) as u32
        };

        let mut step_si = false;
        let mut step_di = false;
        let mut compared = false;

        match opcode {
            // INSB/INSW/INSD
            0x6C | 0x6D => {
                let port = self.get_reg16(REG_EDX as u8);
                let val = if size == 1 {
                    self.memory.io_read(port) as u32
                } else {
                    self.io_read_sized(port, size == 4)
                };
                self.write_string_element(SEG_ES, di, val, size)?;
                step_di = true;
            }
            // OUTSB/OUTSW/OUTSD
            0x6E | 0x6F => {
                let val = self.read_string_element(src_seg, si, size)?;
                let port = self.get_reg16(REG_EDX as u8);
                if size == 1 {
                    self.memory.io_write(port, val as u8);
                } else {
                    self.io_write_sized(port, val, size == 4);
                }
                step_si = true;
            }
            // MOVSB/MOVSW/MOVSD
            0xA4 | 0xA5 => {
                let val = self.read_string_element(src_seg, si, size)?;
                self.write_string_element(SEG_ES, di, val, size)?;
                step_si = true;
                step_di = true;
            }
            // CMPSB/CMPSW/CMPSD
            0xA6 | 0xA7 => {
                let a = self.read_string_element(src_seg, si, size)?;
                let b = self.read_string_element(SEG_ES, di, size)?;
                self.string_compare(a, b, size);
                step_si = true;
                step_di = true;
                compared = true;
            }
            // STOSB/STOSW/STOSD
            0xAA | 0xAB => {
                let val = self.get_reg(0, instr.operand_32) & Self::size_mask(size);
                self.write_string_element(SEG_ES, di, val, size)?;
                step_di = true;
            }
            // LODSB/LODSW/LODSD
            0xAC | 0xAD => {
                let val = self.read_string_element(src_seg, si, size)?;
                if size == 1 {
                    self.set_reg8(0, val as u8);
                } else {
                    self.set_reg(0, val, size == 4);
                }
                step_si = true;
            }
            // SCASB/SCASW/SCASD
            _ => {
                let a = self.get_reg(0, instr.operand_32) & Self::size_mask(size);
                let b = self.read_string_element(SEG_ES, di, size)?;
                self.string_compare(a, b, size);
                step_di = true;
                compared = true;
            }
        }

        let delta = if self.flags.direction {
            (size as i32).wrapping_neg() as u32
        } else {
            size
        };
        if step_si {
            let new_si = si.wrapping_add(delta);
            if addr_32 {
                self.set_reg32(REG_ESI as u8, new_si);
            } else {
                self.set_reg16(REG_ESI as u8, new_si as u16);
            }
        }
        if step_di {
            let new_di = di.wrapping_add(delta);
            if addr_32 {
                self.set_reg32(REG_EDI as u8, new_di);
            } else {
                self.set_reg16(REG_EDI as u8, new_di as u16);
            }
        }

        if let Some(rep) = instr.rep {
            let remaining = self.dec_count_reg(addr_32);
            let terminated = compared
                && match rep {
                    Rep::Rep => !self.flags.zero,
                    Rep::RepNe => self.flags.zero,
                };
            if remaining != 0 && !terminated {
                // Re-dispatch from the saved fetch address; interrupts are
                // sampled at the loop boundary like hardware does
                self.eip = instr.start_eip;
            }
        }
        Ok(if wide { 17 } else { 13 })
    }

    fn size_mask(size: u32) -> u32 {
        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    fn read_string_element(&mut self, seg: usize, off: u32, size: u32) -> Result<u32, Exception> {
        match size {
            1 => Ok(self.read_virt8(seg, off)? as u32),
            2 => Ok(self.read_virt16(seg, off)? as u32),
            _ => self.read_virt32(seg, off),
        }
    }

    fn write_string_element(
        &mut self,
        seg: usize,
        off: u32,
        val: u32,
        size: u32,
    ) -> Result<(), Exception> {
        match size {
            1 => self.write_virt8(seg, off, val as u8),
            2 => self.write_virt16(seg, off, val as u16),
            _ => self.write_virt32(seg, off, val),
        }
    }

    fn string_compare(&mut self, a: u32, b: u32, size: u32) {
        match size {
            1 => {
                self.alu_sub8(a as u8, b as u8, false);
            }
            2 => {
                self.alu_sub16(a as u16, b as u16, false);
            }
            _ => {
                self.alu_sub32(a, b, false);
            }
        }
    }

    // ==================================================================
    // 0F-prefixed extended opcode map
    // ==================================================================

    fn execute_0f(&mut self, instr: &mut Instr) -> Result<u32, Exception> {
        let opcode = self.fetch_u8()?;
        match opcode {
            // Group 6: SLDT/STR/LLDT/LTR/VERR/VERW
            0x00 => {
                if !self.in_protected_mode() {
                    return Err(Exception::ud());
                }
                self.fetch_modrm(instr)?;
                match instr.reg {
                    0 => {
                        let sel = self.protected_mode.ldtr.selector;
                        self.write_rm16(instr, sel)?;
                        Ok(2)
                    }
                    1 => {
                        let sel = self.protected_mode.tss.selector;
                        self.write_rm16(instr, sel)?;
                        Ok(2)
                    }
                    2 => {
                        self.require_supervisor()?;
                        let sel = self.read_rm16(instr)?;
                        self.load_ldt(sel)?;
                        Ok(20)
                    }
                    3 => {
                        self.require_supervisor()?;
                        let sel = self.read_rm16(instr)?;
                        self.load_tr(sel)?;
                        Ok(20)
                    }
                    4 | 5 => {
                        let sel = self.read_rm16(instr)?;
                        self.flags.zero = self.verify_segment(sel, instr.reg == 5);
                        Ok(14)
                    }
                    _ => Err(Exception::ud()),
                }
            }
            // Group 7: SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG
            0x01 => {
                self.fetch_modrm(instr)?;
                match instr.reg {
                    0 | 1 => {
                        if instr.mode == 3 {
                            return Err(Exception::ud());
                        }
                        let table = if instr.reg == 0 {
                            self.protected_mode.gdtr
                        } else {
                            self.protected_mode.idtr
                        };
                        self.cpu_write_u16(instr.ea, table.limit)?;
                        self.cpu_write_u32(instr.ea.wrapping_add(2), table.base)?;
                        Ok(9)
                    }
                    2 | 3 => {
                        if instr.mode == 3 {
                            return Err(Exception::ud());
                        }
                        self.require_supervisor()?;
                        let limit = self.cpu_read_u16(instr.ea)?;
                        let mut base = self.cpu_read_u32(instr.ea.wrapping_add(2))?;
                        if !instr.operand_32 {
                            // 16-bit form only loads 24 bits of base
                            base &= 0x00FF_FFFF;
                        }
                        if instr.reg == 2 {
                            self.protected_mode.gdtr =
                                crate::cpu_x86_protected::DescriptorTableRegister { base, limit };
                        } else {
                            self.protected_mode.idtr =
                                crate::cpu_x86_protected::DescriptorTableRegister { base, limit };
                        }
                        Ok(11)
                    }
                    4 => {
                        let msw = (self.protected_mode.cr0 & 0xFFFF) as u16;
                        self.write_rm16(instr, msw)?;
                        Ok(2)
                    }
                    6 => {
                        self.require_supervisor()?;
                        let msw = self.read_rm16(instr)? as u32;
                        // LMSW can set PE but never clear it
                        let pe_locked = self.protected_mode.cr0 & CR0_PE;
                        let new_cr0 =
                            (self.protected_mode.cr0 & !0x0000_000F) | (msw & 0x000F) | pe_locked;
                        self.set_cr0(new_cr0);
                        Ok(10)
                    }
                    7 => {
                        if instr.mode == 3 {
                            return Err(Exception::ud());
                        }
                        self.require_supervisor()?;
                        // No TLB is kept; every translation re-walks the tables
                        Ok(10)
                    }
                    _ => Err(Exception::ud()),
                }
            }
            // LAR/LSL
            0x02 => {
                if !self.in_protected_mode() {
                    return Err(Exception::ud());
                }
                self.fetch_modrm(instr)?;
                let sel = self.read_rm16(instr)?;
                match self.load_access_rights(sel) {
                    Some(rights) => {
                        self.flags.zero = true;
                        let val = if instr.operand_32 {
                            rights
                        } else {
                            rights & 0xFFFF
                        };
                        self.set_reg(instr.reg, val, instr.operand_32);
                    }
                    None => self.flags.zero = false,
                }
                Ok(14)
            }
            0x03 => {
                if !self.in_protected_mode() {
                    return Err(Exception::ud());
                }
                self.fetch_modrm(instr)?;
                let sel = self.read_rm16(instr)?;
                match self.load_segment_limit(sel) {
                    Some(limit) => {
                        self.flags.zero = true;
                        self.set_reg(instr.reg, limit, instr.operand_32);
                    }
                    None => self.flags.zero = false,
                }
                Ok(14)
            }
            // CLTS
            0x06 => {
                self.require_supervisor()?;
                self.protected_mode.cr0 &= !CR0_TS;
                Ok(5)
            }
            // INVD/WBINVD: no cache model
            0x08 | 0x09 => {
                self.require_supervisor()?;
                Ok(4)
            }
            // UD2
            0x0B => Err(Exception::ud()),

            // MOV r32, CRn / MOV CRn, r32
            0x20 if self.model().supports_80386_instructions() => {
                self.require_supervisor()?;
                self.fetch_modrm(instr)?;
                let val = match instr.reg {
                    0 => self.protected_mode.cr0,
                    2 => self.protected_mode.cr2,
                    3 => self.protected_mode.cr3,
                    _ => return Err(Exception::ud()),
                };
                self.set_reg32(instr.rm, val);
                Ok(6)
            }
            0x22 if self.model().supports_80386_instructions() => {
                self.require_supervisor()?;
                self.fetch_modrm(instr)?;
                let val = self.get_reg32(instr.rm);
                match instr.reg {
                    0 => self.set_cr0(val),
                    2 => self.protected_mode.cr2 = val,
                    3 => self.protected_mode.cr3 = val,
                    _ => return Err(Exception::ud()),
                }
                Ok(10)
            }
            // MOV r32, DRn / MOV DRn, r32: debug registers are not modeled
            0x21 if self.model().supports_80386_instructions() => {
                self.require_supervisor()?;
                self.fetch_modrm(instr)?;
                self.set_reg32(instr.rm, 0);
                Ok(6)
            }
            0x23 if self.model().supports_80386_instructions() => {
                self.require_supervisor()?;
                self.fetch_modrm(instr)?;
                Ok(6)
            }

            // Jcc rel16/32
            0x80..=0x8F => {
                let rel = self.fetch_rel(instr.operand_32)?;
                if self.check_condition(opcode & 0xF) {
                    self.jump_relative(rel, instr.operand_32);
                    Ok(16)
                } else {
                    Ok(4)
                }
            }
            // SETcc rm8
            0x90..=0x9F => {
                self.fetch_modrm(instr)?;
                let val = self.check_condition(opcode & 0xF) as u8;
                self.write_rm8(instr, val)?;
                Ok(4)
            }

            // PUSH/POP FS/GS
            0xA0 => {
                self.push_sized(self.segs[SEG_FS].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0xA1 => {
                let sel = self.pop_sized(instr.operand_32)? as u16;
                self.load_segment(SEG_FS, sel)?;
                Ok(8)
            }
            0xA8 => {
                self.push_sized(self.segs[SEG_GS].selector as u32, instr.operand_32)?;
                Ok(10)
            }
            0xA9 => {
                let sel = self.pop_sized(instr.operand_32)? as u16;
                self.load_segment(SEG_GS, sel)?;
                Ok(8)
            }

            // BT/BTS/BTR/BTC rm, r
            0xA3 => self.bit_op(instr, 0),
            0xAB => self.bit_op(instr, 1),
            0xB3 => self.bit_op(instr, 2),
            0xBB => self.bit_op(instr, 3),
            // Group 8: BT/BTS/BTR/BTC rm, imm8
            0xBA => {
                self.fetch_modrm(instr)?;
                if instr.reg < 4 {
                    return Err(Exception::ud());
                }
                let imm = self.fetch_u8()?;
                self.bit_op_resolved(instr, instr.reg - 4, imm as u32, false)
            }

            // SHLD/SHRD
            0xA4 => {
                self.fetch_modrm(instr)?;
                let count = self.fetch_u8()?;
                self.double_shift(instr, count, true)
            }
            0xA5 => {
                self.fetch_modrm(instr)?;
                let count = self.get_reg8(1);
                self.double_shift(instr, count, true)
            }
            0xAC => {
                self.fetch_modrm(instr)?;
                let count = self.fetch_u8()?;
                self.double_shift(instr, count, false)
            }
            0xAD => {
                self.fetch_modrm(instr)?;
                let count = self.get_reg8(1);
                self.double_shift(instr, count, false)
            }

            // IMUL r, rm
            0xAF => {
                self.fetch_modrm(instr)?;
                let a = self.get_reg(instr.reg, instr.operand_32);
                let b = self.read_rm(instr)?;
                let r = self.imul_sized(a, b, instr.operand_32);
                self.set_reg(instr.reg, r, instr.operand_32);
                Ok(22)
            }

            // LSS/LFS/LGS
            0xB2 => self.load_far_pointer(instr, SEG_SS).map(|_| 16),
            0xB4 => self.load_far_pointer(instr, SEG_FS).map(|_| 16),
            0xB5 => self.load_far_pointer(instr, SEG_GS).map(|_| 16),

            // MOVZX r, rm8/rm16
            0xB6 => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm8(instr)? as u32;
                self.set_reg(instr.reg, val, instr.operand_32);
                Ok(3)
            }
            0xB7 => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm16(instr)? as u32;
                self.set_reg(instr.reg, val, instr.operand_32);
                Ok(3)
            }
            // MOVSX r, rm8/rm16
            0xBE => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm8(instr)? as i8 as i32 as u32;
                self.set_reg(instr.reg, val, instr.operand_32);
                Ok(3)
            }
            0xBF => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm16(instr)? as i16 as i32 as u32;
                self.set_reg(instr.reg, val, instr.operand_32);
                Ok(3)
            }

            // BSF/BSR
            0xBC => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm(instr)?;
                if val == 0 {
                    self.flags.zero = true;
                } else {
                    self.flags.zero = false;
                    self.set_reg(instr.reg, val.trailing_zeros(), instr.operand_32);
                }
                Ok(10)
            }
            0xBD => {
                self.fetch_modrm(instr)?;
                let val = self.read_rm(instr)?;
                if val == 0 {
                    self.flags.zero = true;
                } else {
                    self.flags.zero = false;
                    let index = 31 - val.leading_zeros();
                    let index = if instr.operand_32 { index } else { index.min(15) };
                    self.set_reg(instr.reg, index, instr.operand_32);
                }
                Ok(10)
            }

            _ => {
                log(LogCategory::Cpu, LogLevel::Debug, || {
                    format!("invalid extended opcode 0F {:02X}", opcode)
                });
                Err(Exception::ud())
            }
        }
    }

    /// Privileged-instruction gate: ring 0 or real mode only
    fn require_supervisor(&self) -> Result<(), Exception> {
        if self.flags.v86 || (self.in_protected_mode() && self.protected_mode.cpl != 0) {
            Err(Exception::gp(0))
        } else {
            Ok(())
        }
    }

    /// BT/BTS/BTR/BTC with the bit offset taken from a register
    ///
    /// For memory operands the bit offset is a signed bit-string displacement
    /// relative to the decoded address.
    fn bit_op(&mut self, instr: &mut Instr, kind: u8) -> Result<u32, Exception> {
        self.fetch_modrm(instr)?;
        let offset = self.get_reg(instr.reg, instr.operand_32);
        self.bit_op_resolved(instr, kind, offset, true)
    }

    fn bit_op_resolved(
        &mut self,
        instr: &Instr,
        kind: u8,
        bit_offset: u32,
        from_register: bool,
    ) -> Result<u32, Exception> {
        let bits: u32 = if instr.operand_32 { 32 } else { 16 };

        let (val, mem_addr) = if instr.mode == 3 {
            (self.get_reg(instr.rm, instr.operand_32), None)
        } else if from_register {
            // Register-sourced offsets address an unbounded bit string
            let signed = bit_offset as i32;
            let byte_disp = signed.div_euclid(8);
            let addr = instr.ea.wrapping_add(byte_disp as u32);
            let val = if instr.operand_32 {
                self.cpu_read_u32(addr)?
            } else {
                self.cpu_read_u16(addr)? as u32
            };
            (val, Some(addr))
        } else {
            (self.read_rm(instr)?, Some(instr.ea))
        };

        let bit = if instr.mode == 3 || !from_register {
            bit_offset % bits
        } else {
            (bit_offset as i32).rem_euclid(8) as u32
        };
        let mask = 1u32 << bit;
        self.flags.carry = val & mask != 0;

        let new_val = match kind {
            0 => return Ok(6), // BT only reads
            1 => val | mask,
            2 => val & !mask,
            _ => val ^ mask,
        };

        match mem_addr {
            None => self.set_reg(instr.rm, new_val, instr.operand_32),
            Some(addr) => {
                if instr.operand_32 {
                    self.cpu_write_u32(addr, new_val)?;
                } else {
                    self.cpu_write_u16(addr, new_val as u16)?;
                }
            }
        }
        Ok(8)
    }

    /// SHLD/SHRD: double-precision shift through a second register
    fn double_shift(&mut self, instr: &Instr, count: u8, left: bool) -> Result<u32, Exception> {
        let count = (count & 0x1F) as u32;
        if count == 0 {
            return Ok(3);
        }
        let bits: u32 = if instr.operand_32 { 32 } else { 16 };
        let dest = self.read_rm(instr)?;
        let src = self.get_reg(instr.reg, instr.operand_32);

        let (result, carry) = if left {
            let wide = ((dest as u64) << bits) | src as u64;
            // The last bit shifted out of the destination's top position
            let carry = (wide >> (2 * bits - count)) & 1 != 0;
            let result = ((wide << count) >> bits) as u32 & Self::size_mask_bits(bits);
            (result, carry)
        } else {
            let wide = ((src as u64) << bits) | dest as u64;
            let carry = (wide >> (count - 1)) & 1 != 0;
            let result = (wide >> count) as u32 & Self::size_mask_bits(bits);
            (result, carry)
        };

        self.flags.carry = carry;
        if count == 1 {
            let msb = 1u32 << (bits - 1);
            self.flags.overflow = (result & msb != 0) != (dest & msb != 0);
        }
        if instr.operand_32 {
            self.update_flags_szp32(result);
        } else {
            self.update_flags_szp16(result as u16);
        }
        self.write_rm(instr, result)?;
        Ok(7)
    }

    fn size_mask_bits(bits: u32) -> u32 {
        if bits == 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << bits) - 1
        }
    }
}
