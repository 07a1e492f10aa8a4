//! Tests for ALU operations and flag semantics across operand widths

use crate::cpu_x86::{ArrayMemory, CpuX86, SegmentRegister, REG_EAX, REG_EDX, SEG_CS};

/// Build a CPU executing `program` in real mode at 0x0500:0x0000
fn cpu_with(program: &[u8]) -> CpuX86<ArrayMemory> {
    let mut mem = ArrayMemory::new();
    mem.load_program(0x5000, program);
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x0500);
    cpu.eip = 0;
    cpu
}

#[test]
fn test_add8_signed_overflow_boundary() {
    // ADD AL, 1 with AL=0x7F: positive overflow
    let mut cpu = cpu_with(&[0x04, 0x01]);
    cpu.set_reg8(0, 0x7F);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x80);
    assert!(cpu.flags.overflow);
    assert!(cpu.flags.sign);
    assert!(!cpu.flags.carry);
    assert!(cpu.flags.adjust);
    assert!(!cpu.flags.zero);
}

#[test]
fn test_add8_unsigned_carry_boundary() {
    // ADD AL, 1 with AL=0xFF: wrap to zero with carry
    let mut cpu = cpu_with(&[0x04, 0x01]);
    cpu.set_reg8(0, 0xFF);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x00);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.zero);
    assert!(!cpu.flags.overflow);
    assert!(cpu.flags.parity);
}

#[test]
fn test_add16_boundaries() {
    // ADD AX, 1 with AX=0x7FFF
    let mut cpu = cpu_with(&[0x05, 0x01, 0x00]);
    cpu.set_reg16(0, 0x7FFF);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x8000);
    assert!(cpu.flags.overflow);
    assert!(cpu.flags.sign);
    assert!(!cpu.flags.carry);

    // ADD AX, 1 with AX=0xFFFF
    let mut cpu = cpu_with(&[0x05, 0x01, 0x00]);
    cpu.set_reg16(0, 0xFFFF);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.zero);
    assert!(!cpu.flags.overflow);
}

#[test]
fn test_add32_wrap_to_zero() {
    // ADD EAX, 1 (operand-size prefix in 16-bit code) with EAX=0xFFFFFFFF
    let mut cpu = cpu_with(&[0x66, 0x05, 0x01, 0x00, 0x00, 0x00]);
    cpu.regs[REG_EAX] = 0xFFFF_FFFF;
    cpu.step();
    assert_eq!(cpu.regs[REG_EAX], 0);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.zero);
    assert!(!cpu.flags.overflow);
}

#[test]
fn test_add32_signed_boundary() {
    // ADD EAX, 1 with EAX=0x7FFFFFFF
    let mut cpu = cpu_with(&[0x66, 0x05, 0x01, 0x00, 0x00, 0x00]);
    cpu.regs[REG_EAX] = 0x7FFF_FFFF;
    cpu.step();
    assert_eq!(cpu.regs[REG_EAX], 0x8000_0000);
    assert!(cpu.flags.overflow);
    assert!(cpu.flags.sign);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_sub8_borrow_and_overflow() {
    // SUB AL, 1 with AL=0x80: signed overflow, no borrow
    let mut cpu = cpu_with(&[0x2C, 0x01]);
    cpu.set_reg8(0, 0x80);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x7F);
    assert!(cpu.flags.overflow);
    assert!(!cpu.flags.carry);
    assert!(!cpu.flags.sign);

    // SUB AL, 0x10 with AL=0x05: borrow
    let mut cpu = cpu_with(&[0x2C, 0x10]);
    cpu.set_reg8(0, 0x05);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0xF5);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.sign);
    assert!(!cpu.flags.overflow);
}

#[test]
fn test_cmp_discards_result() {
    // CMP AL, 0x10 leaves AL intact, sets flags like SUB
    let mut cpu = cpu_with(&[0x3C, 0x10]);
    cpu.set_reg8(0, 0x10);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x10);
    assert!(cpu.flags.zero);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_adc_sbb_carry_chain() {
    // STC; ADC AL, 0
    let mut cpu = cpu_with(&[0xF9, 0x14, 0x00]);
    cpu.set_reg8(0, 0x01);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x02);

    // STC; SBB AL, 0
    let mut cpu = cpu_with(&[0xF9, 0x1C, 0x00]);
    cpu.set_reg8(0, 0x05);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x04);
}

#[test]
fn test_logic_ops_clear_carry_overflow() {
    // STC; AND AL, 0x0F
    let mut cpu = cpu_with(&[0xF9, 0x24, 0x0F]);
    cpu.set_reg8(0, 0xF5);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x05);
    assert!(!cpu.flags.carry);
    assert!(!cpu.flags.overflow);

    // XOR AX, AX zeroes and sets ZF/PF
    let mut cpu = cpu_with(&[0x31, 0xC0]);
    cpu.set_reg16(0, 0x55AA);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0);
    assert!(cpu.flags.zero);
    assert!(cpu.flags.parity);
}

#[test]
fn test_inc_dec_preserve_carry() {
    // STC; INC AX with AX=0xFFFF: wraps, CF stays set, ZF set
    let mut cpu = cpu_with(&[0xF9, 0x40]);
    cpu.set_reg16(0, 0xFFFF);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.zero);

    // CLC; DEC AX with AX=0: wraps, CF stays clear
    let mut cpu = cpu_with(&[0xF8, 0x48]);
    cpu.set_reg16(0, 0);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0xFFFF);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_neg_sets_carry_for_nonzero() {
    // NEG AL (F6 /3, modrm D8)
    let mut cpu = cpu_with(&[0xF6, 0xD8]);
    cpu.set_reg8(0, 0x01);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0xFF);
    assert!(cpu.flags.carry);

    let mut cpu = cpu_with(&[0xF6, 0xD8]);
    cpu.set_reg8(0, 0x00);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x00);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_shl_single_bit_carry_out() {
    // SHL AL, 1 with AL=0x80: bit shifts into CF, result zero
    let mut cpu = cpu_with(&[0xD0, 0xE0]);
    cpu.set_reg8(0, 0x80);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x00);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.zero);
    // result MSB (0) differs from CF (1)
    assert!(cpu.flags.overflow);
}

#[test]
fn test_shr_and_sar() {
    // SHR AL, 1 with AL=0x81
    let mut cpu = cpu_with(&[0xD0, 0xE8]);
    cpu.set_reg8(0, 0x81);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x40);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.overflow); // original MSB was set

    // SAR AL, 1 with AL=0x81: sign-fill
    let mut cpu = cpu_with(&[0xD0, 0xF8]);
    cpu.set_reg8(0, 0x81);
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0xC0);
    assert!(cpu.flags.carry);
    assert!(!cpu.flags.overflow);
}

#[test]
fn test_rotate_through_carry() {
    // STC; RCL AL, 1 with AL=0x80: carry rotates in, MSB rotates out
    let mut cpu = cpu_with(&[0xF9, 0xD0, 0xD0]);
    cpu.set_reg8(0, 0x80);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x01);
    assert!(cpu.flags.carry);

    // CLC; RCR AL, 1 with AL=0x01
    let mut cpu = cpu_with(&[0xF8, 0xD0, 0xD8]);
    cpu.set_reg8(0, 0x01);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x00);
    assert!(cpu.flags.carry);
}

#[test]
fn test_rol_by_count() {
    // MOV CL, 4; ROL AL, CL with AL=0xF0
    let mut cpu = cpu_with(&[0xB1, 0x04, 0xD2, 0xC0]);
    cpu.set_reg8(0, 0xF0);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x0F);
    assert!(cpu.flags.carry); // last bit rotated out was 1
}

#[test]
fn test_shift32_through_prefix() {
    // SHL EAX, 4 (66 C1 E0 04)
    let mut cpu = cpu_with(&[0x66, 0xC1, 0xE0, 0x04]);
    cpu.regs[REG_EAX] = 0x1234_5678;
    cpu.step();
    assert_eq!(cpu.regs[REG_EAX], 0x2345_6780);
}

#[test]
fn test_mul_sets_carry_when_upper_half_used() {
    // MUL AH? No - MUL r/m8 uses AL. F6 /4 with modrm E3 = MUL BL
    let mut cpu = cpu_with(&[0xF6, 0xE3]);
    cpu.set_reg8(0, 0x80); // AL
    cpu.set_reg8(3, 0x02); // BL
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x0100);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.overflow);

    let mut cpu = cpu_with(&[0xF6, 0xE3]);
    cpu.set_reg8(0, 0x08);
    cpu.set_reg8(3, 0x02);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x0010);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_mul16_result_in_dx_ax() {
    // MUL BX (F7 /4, modrm E3)
    let mut cpu = cpu_with(&[0xF7, 0xE3]);
    cpu.set_reg16(0, 0x1234);
    cpu.set_reg16(3, 0x0100);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x3400);
    assert_eq!(cpu.get_reg16(REG_EDX as u8), 0x0012);
}

#[test]
fn test_imul_truncation_flags() {
    // IMUL BL: -1 * -1 = 1, fits in AL
    let mut cpu = cpu_with(&[0xF6, 0xEB]);
    cpu.set_reg8(0, 0xFF);
    cpu.set_reg8(3, 0xFF);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x0001);
    assert!(!cpu.flags.carry);

    // IMUL BL: 100 * 2 = 200 does not fit in a signed byte
    let mut cpu = cpu_with(&[0xF6, 0xEB]);
    cpu.set_reg8(0, 100);
    cpu.set_reg8(3, 2);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 200);
    assert!(cpu.flags.carry);
    assert!(cpu.flags.overflow);
}

#[test]
fn test_div16() {
    // DIV BX: DX:AX / BX
    let mut cpu = cpu_with(&[0xF7, 0xF3]);
    cpu.set_reg16(0, 0x5678);
    cpu.set_reg16(REG_EDX as u8, 0x0012);
    cpu.set_reg16(3, 0x1000);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x0125); // quotient
    assert_eq!(cpu.get_reg16(REG_EDX as u8), 0x0678); // remainder
}

#[test]
fn test_movzx_movsx() {
    // MOVZX AX, BL (0F B6 C3)
    let mut cpu = cpu_with(&[0x0F, 0xB6, 0xC3]);
    cpu.set_reg8(3, 0x80);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x0080);

    // MOVSX AX, BL (0F BE C3)
    let mut cpu = cpu_with(&[0x0F, 0xBE, 0xC3]);
    cpu.set_reg8(3, 0x80);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0xFF80);
}

#[test]
fn test_bt_and_btc() {
    // BT AX, CX (0F A3 C8) with bit set
    let mut cpu = cpu_with(&[0x0F, 0xA3, 0xC8]);
    cpu.set_reg16(0, 0x0010);
    cpu.set_reg16(1, 4);
    cpu.step();
    assert!(cpu.flags.carry);

    // BTC AX, CX flips the bit
    let mut cpu = cpu_with(&[0x0F, 0xBB, 0xC8]);
    cpu.set_reg16(0, 0x0010);
    cpu.set_reg16(1, 4);
    cpu.step();
    assert!(cpu.flags.carry);
    assert_eq!(cpu.get_reg16(0), 0x0000);
}

#[test]
fn test_bsf_bsr() {
    // BSF AX, BX (0F BC C3)
    let mut cpu = cpu_with(&[0x0F, 0xBC, 0xC3]);
    cpu.set_reg16(3, 0x0048);
    cpu.step();
    assert!(!cpu.flags.zero);
    assert_eq!(cpu.get_reg16(0), 3);

    // BSR AX, BX
    let mut cpu = cpu_with(&[0x0F, 0xBD, 0xC3]);
    cpu.set_reg16(3, 0x0048);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 6);

    // Zero source sets ZF and leaves the destination alone
    let mut cpu = cpu_with(&[0x0F, 0xBC, 0xC3]);
    cpu.set_reg16(0, 0x1111);
    cpu.set_reg16(3, 0);
    cpu.step();
    assert!(cpu.flags.zero);
    assert_eq!(cpu.get_reg16(0), 0x1111);
}

#[test]
fn test_shld() {
    // SHLD AX, BX, 4 (0F A4 D8 04)
    let mut cpu = cpu_with(&[0x0F, 0xA4, 0xD8, 0x04]);
    cpu.set_reg16(0, 0x1234);
    cpu.set_reg16(3, 0xABCD);
    cpu.step();
    assert_eq!(cpu.get_reg16(0), 0x234A);
    assert!(cpu.flags.carry); // bit 12 of 0x1234 shifted out last
}

#[test]
fn test_daa() {
    // ADD AL, BL; DAA with packed BCD 0x15 + 0x27 = 0x42
    let mut cpu = cpu_with(&[0x00, 0xD8, 0x27]);
    cpu.set_reg8(0, 0x15);
    cpu.set_reg8(3, 0x27);
    cpu.step();
    cpu.step();
    assert_eq!(cpu.get_reg8(0), 0x42);
    assert!(!cpu.flags.carry);
}

#[test]
fn test_aam_divide_error_on_zero() {
    let mut mem = ArrayMemory::new();
    // IVT vector 0 -> 0x0060:0x0000
    mem.load_program(0, &[0x00, 0x00, 0x60, 0x00]);
    mem.load_program(0x5000, &[0xD4, 0x00]); // AAM 0
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x0500);
    cpu.eip = 0;
    cpu.regs[crate::cpu_x86::REG_ESP] = 0x1000;
    cpu.step();
    assert_eq!(cpu.segs[SEG_CS].selector, 0x0060);
    assert_eq!(cpu.eip, 0);
}
