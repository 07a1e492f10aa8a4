//! Tests for the flags model: pack/unpack round trips and POPF privileges

use crate::cpu_x86::{ArrayMemory, CpuX86, Flags, SegmentRegister, REG_ESP, SEG_CS, SEG_SS};

/// Mask of bits the packed image can represent (reserved bits normalized:
/// bit 1 set, bits 3/5/15 and 22+ clear)
const IMPLEMENTED_MASK: u32 = 0x003F_7FD5;

fn normalize(word: u32) -> u32 {
    (word & IMPLEMENTED_MASK) | 0x0002
}

#[test]
fn test_pack_unpack_round_trip() {
    for &word in &[
        0x0000_0002u32,
        0x0000_0001,
        0x0000_0246,
        0x0000_0AD7,
        0x0000_3246,
        0x0003_7202,
        0x003F_7FD5,
        0x0000_F000,
        0xDEAD_BEEF,
    ] {
        let normalized = normalize(word);
        let mut flags = Flags::default();
        flags.unpack_all(normalized);
        assert_eq!(
            flags.pack(),
            normalized,
            "round trip failed for {:08X}",
            word
        );
    }
}

#[test]
fn test_unpack_reproduces_individual_bits() {
    let mut flags = Flags::default();
    flags.carry = true;
    flags.zero = true;
    flags.sign = true;
    flags.overflow = true;
    flags.direction = true;
    flags.interrupt = true;
    flags.trap = true;
    flags.adjust = true;
    flags.parity = true;
    flags.iopl = 3;
    flags.nested_task = true;

    let packed = flags.pack();
    let mut other = Flags::default();
    other.unpack_all(packed);
    assert_eq!(other, flags);
    assert_eq!(other.pack(), packed);
}

#[test]
fn test_bit_positions() {
    let mut flags = Flags::default();
    flags.carry = true;
    assert_eq!(flags.pack() & 0x0001, 0x0001);
    flags.carry = false;
    flags.zero = true;
    assert_eq!(flags.pack() & 0x0040, 0x0040);
    flags.zero = false;
    flags.sign = true;
    assert_eq!(flags.pack() & 0x0080, 0x0080);
    flags.sign = false;
    flags.overflow = true;
    assert_eq!(flags.pack() & 0x0800, 0x0800);
    flags.overflow = false;
    flags.iopl = 2;
    assert_eq!(flags.pack() & 0x3000, 0x2000);
    flags.iopl = 0;
    flags.v86 = true;
    assert_eq!(flags.pack() & 0x0002_0000, 0x0002_0000);
}

#[test]
fn test_reserved_bit_always_set() {
    let flags = Flags::default();
    assert_eq!(flags.pack() & 0x0002, 0x0002);
}

#[test]
fn test_unpack_privileged_fields_restricted() {
    // At CPL 3 with IOPL 0: IF and IOPL must not change
    let mut flags = Flags::default();
    flags.iopl = 0;
    flags.interrupt = false;
    flags.unpack(0x0000_3200, 3); // attempts IOPL=3, IF=1
    assert_eq!(flags.iopl, 0);
    assert!(!flags.interrupt);

    // At CPL 0 everything is loaded
    let mut flags = Flags::default();
    flags.unpack(0x0000_3200, 0);
    assert_eq!(flags.iopl, 3);
    assert!(flags.interrupt);

    // At CPL 1 with IOPL 2: IF may change, IOPL may not
    let mut flags = Flags::default();
    flags.iopl = 2;
    flags.unpack(0x0000_0200, 1);
    assert!(flags.interrupt);
    assert_eq!(flags.iopl, 2);
}

#[test]
fn test_unpack_never_sets_vm_rf() {
    let mut flags = Flags::default();
    flags.unpack(0x0003_0000, 0); // VM | RF
    assert!(!flags.v86);
    assert!(!flags.resume);
}

fn cpu_with(program: &[u8]) -> CpuX86<ArrayMemory> {
    let mut mem = ArrayMemory::new();
    mem.load_program(0x5000, program);
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x0500);
    cpu.eip = 0;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0);
    cpu.regs[REG_ESP] = 0x2000;
    cpu
}

#[test]
fn test_pushf_popf_round_trip() {
    // STC; STD; PUSHF; CLC; CLD; POPF
    let mut cpu = cpu_with(&[0xF9, 0xFD, 0x9C, 0xF8, 0xFC, 0x9D]);
    for _ in 0..6 {
        cpu.step();
    }
    assert!(cpu.flags.carry);
    assert!(cpu.flags.direction);
}

#[test]
fn test_lahf_sahf() {
    // STC; LAHF; CLC; SAHF
    let mut cpu = cpu_with(&[0xF9, 0x9F, 0xF8, 0x9E]);
    for _ in 0..4 {
        cpu.step();
    }
    assert!(cpu.flags.carry);
    // LAHF image has bit 1 set
    assert_eq!(cpu.get_reg8(4) & 0x02, 0x02);
}

#[test]
fn test_cmc() {
    let mut cpu = cpu_with(&[0xF5, 0xF5]);
    cpu.flags.carry = false;
    cpu.step();
    assert!(cpu.flags.carry);
    cpu.step();
    assert!(!cpu.flags.carry);
}
