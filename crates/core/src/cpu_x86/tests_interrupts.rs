//! Tests for interrupt dispatch: real-mode vectors, callbacks, traps, HLT

use crate::cpu_x86::{
    ArrayMemory, CpuX86, MemoryX86, SegmentRegister, REG_ESP, SEG_CS, SEG_SS,
};

fn read_u16(cpu: &CpuX86<ArrayMemory>, addr: u32) -> u16 {
    cpu.memory.read(addr) as u16 | ((cpu.memory.read(addr + 1) as u16) << 8)
}

fn write_vector(mem: &mut ArrayMemory, vector: u8, seg: u16, off: u16) {
    let entry = vector as u32 * 4;
    mem.load_program(
        entry,
        &[
            (off & 0xFF) as u8,
            (off >> 8) as u8,
            (seg & 0xFF) as u8,
            (seg >> 8) as u8,
        ],
    );
}

#[test]
fn test_int_21_real_mode_frame() {
    // INT 21h at 0x1000:0x100 with vector table entry 0x2000:0x0050
    let mut mem = ArrayMemory::new();
    write_vector(&mut mem, 0x21, 0x2000, 0x0050);
    mem.load_program(0x10100, &[0xCD, 0x21]);
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;
    cpu.flags.interrupt = true;
    let flags_before = cpu.flags.pack() as u16;

    cpu.step();

    assert_eq!(cpu.segs[SEG_CS].selector, 0x2000);
    assert_eq!(cpu.segs[SEG_CS].base, 0x20000);
    assert_eq!(cpu.eip, 0x0050);
    // Stack frame: FLAGS, CS, then the IP after the 2-byte instruction
    let stack = 0x3000 + 0x0100;
    assert_eq!(read_u16(&cpu, stack - 2), flags_before);
    assert_eq!(read_u16(&cpu, stack - 4), 0x1000);
    assert_eq!(read_u16(&cpu, stack - 6), 0x102);
    // IF and TF cleared by the dispatch
    assert!(!cpu.flags.interrupt);
    assert!(!cpu.flags.trap);
}

#[test]
fn test_iret_restores_interrupted_context() {
    let mut mem = ArrayMemory::new();
    write_vector(&mut mem, 0x21, 0x2000, 0x0000);
    mem.load_program(0x10100, &[0xCD, 0x21]); // INT 21h
    mem.load_program(0x20000, &[0xCF]); // IRET
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;
    cpu.flags.interrupt = true;
    cpu.flags.carry = true;

    cpu.step(); // INT
    assert!(!cpu.flags.interrupt);
    cpu.step(); // IRET

    assert_eq!(cpu.segs[SEG_CS].selector, 0x1000);
    assert_eq!(cpu.eip, 0x102);
    assert!(cpu.flags.interrupt);
    assert!(cpu.flags.carry);
    assert_eq!(cpu.regs[REG_ESP], 0x0100);
}

#[test]
fn test_int_callback_takes_priority() {
    let mut mem = ArrayMemory::new();
    write_vector(&mut mem, 0x21, 0x2000, 0x0000);
    mem.load_program(0x10100, &[0xCD, 0x21]);
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;
    cpu.register_int_callback(0x21, |cpu| {
        cpu.set_reg16(0, 0xCAFE);
    });

    cpu.step();

    // The native handler ran instead of the vector dispatch
    assert_eq!(cpu.get_reg16(0), 0xCAFE);
    assert_eq!(cpu.segs[SEG_CS].selector, 0x1000);
    assert_eq!(cpu.eip, 0x102);
    assert_eq!(cpu.regs[REG_ESP], 0x0100); // nothing pushed
}

#[test]
fn test_into_only_dispatches_on_overflow() {
    let mut mem = ArrayMemory::new();
    write_vector(&mut mem, 4, 0x2100, 0x0000);
    mem.load_program(0x10100, &[0xCE, 0xCE]); // INTO; INTO
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;

    cpu.flags.overflow = false;
    cpu.step();
    assert_eq!(cpu.segs[SEG_CS].selector, 0x1000); // fell through

    cpu.flags.overflow = true;
    cpu.step();
    assert_eq!(cpu.segs[SEG_CS].selector, 0x2100);
}

#[test]
fn test_trap_flag_single_steps() {
    let mut mem = ArrayMemory::new();
    write_vector(&mut mem, 1, 0x2200, 0x0000);
    mem.load_program(0x10100, &[0x90]); // NOP
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;
    cpu.flags.trap = true;

    cpu.step();

    // The NOP executed, then the single-step trap fired
    assert_eq!(cpu.segs[SEG_CS].selector, 0x2200);
    // The pushed IP points past the NOP
    assert_eq!(read_u16(&cpu, 0x3100 - 6), 0x101);
    assert!(!cpu.flags.trap); // cleared for the handler
}

/// Memory with an injectable pending interrupt, standing in for the
/// interrupt-controller collaborator
struct IrqMemory {
    ram: ArrayMemory,
    pending: Option<u8>,
}

impl crate::cpu_x86::MemoryX86 for IrqMemory {
    fn read(&self, addr: u32) -> u8 {
        self.ram.read(addr)
    }

    fn write(&mut self, addr: u32, val: u8) {
        self.ram.write(addr, val);
    }

    fn pending_interrupt(&mut self) -> Option<u8> {
        self.pending.take()
    }
}

#[test]
fn test_hardware_interrupt_wakes_halted_cpu() {
    let mut ram = ArrayMemory::new();
    write_vector(&mut ram, 0x08, 0x2300, 0x0000);
    ram.load_program(0x10100, &[0xF4]); // HLT
    ram.load_program(0x23000, &[0xCF]); // IRET
    let mut cpu = CpuX86::new(IrqMemory { ram, pending: None });
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.segs[SEG_SS] = SegmentRegister::real_mode(0x0300);
    cpu.regs[REG_ESP] = 0x0100;
    cpu.flags.interrupt = true;

    // Halt, then confirm exec() returns early with nothing pending
    assert_eq!(cpu.exec(4), 1);
    assert!(cpu.is_halted());

    // A pending IRQ resumes execution through the handler
    cpu.memory.pending = Some(0x08);
    let executed = cpu.exec(1);
    assert_eq!(executed, 1);
    assert!(!cpu.is_halted());
    assert_eq!(cpu.segs[SEG_CS].selector, 0x1000); // IRET returned
    assert_eq!(cpu.eip, 0x101);
}

#[test]
fn test_hardware_interrupt_blocked_by_if() {
    let mut ram = ArrayMemory::new();
    write_vector(&mut ram, 0x08, 0x2300, 0x0000);
    ram.load_program(0x10100, &[0x90, 0x90]);
    let mut cpu = CpuX86::new(IrqMemory {
        ram,
        pending: Some(0x08),
    });
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x1000);
    cpu.eip = 0x100;
    cpu.flags.interrupt = false;

    cpu.exec(1);

    // The request was never consumed
    assert_eq!(cpu.memory.pending, Some(0x08));
    assert_eq!(cpu.segs[SEG_CS].selector, 0x1000);
}
