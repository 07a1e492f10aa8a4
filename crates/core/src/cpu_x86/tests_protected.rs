//! Tests for protected mode: segment loading, gates, privilege transitions,
//! paging-free descriptor machinery and task switching

use crate::cpu_x86::{
    ArrayMemory, CpuX86, MemoryX86, SegmentRegister, INT_GENERAL_PROTECTION,
    INT_SEGMENT_NOT_PRESENT, REG_EAX, REG_ESP, SEG_CS, SEG_DS, SEG_SS,
};
use crate::cpu_x86_protected::{DescriptorTableRegister, TaskRegister, CR0_PE};

const GDT_BASE: u32 = 0x0001_0000;
const IDT_BASE: u32 = 0x0001_8000;
const TSS_BASE: u32 = 0x0003_0000;

// Selectors laid out by `protected_cpu`
const CODE32_R0: u16 = 0x08;
const DATA32_R0: u16 = 0x10;
const CODE32_R3: u16 = 0x1B; // index 3, RPL 3
const DATA32_R3: u16 = 0x23; // index 4, RPL 3
const TSS_SEL: u16 = 0x28;
const NOT_PRESENT_SEL: u16 = 0x30;
const TASK_TSS_SEL: u16 = 0x38;

/// Encode an 8-byte segment descriptor
fn descriptor(base: u32, limit: u32, access: u8, flags: u8) -> [u8; 8] {
    [
        (limit & 0xFF) as u8,
        ((limit >> 8) & 0xFF) as u8,
        (base & 0xFF) as u8,
        ((base >> 8) & 0xFF) as u8,
        ((base >> 16) & 0xFF) as u8,
        access,
        (((limit >> 16) & 0x0F) as u8) | (flags << 4),
        ((base >> 24) & 0xFF) as u8,
    ]
}

/// Encode an 8-byte interrupt/trap gate
fn gate(selector: u16, offset: u32, type_byte: u8) -> [u8; 8] {
    [
        (offset & 0xFF) as u8,
        ((offset >> 8) & 0xFF) as u8,
        (selector & 0xFF) as u8,
        (selector >> 8) as u8,
        0,
        type_byte,
        ((offset >> 16) & 0xFF) as u8,
        ((offset >> 24) & 0xFF) as u8,
    ]
}

fn write_u32(mem: &mut ArrayMemory, addr: u32, val: u32) {
    mem.load_program(
        addr,
        &[
            (val & 0xFF) as u8,
            ((val >> 8) & 0xFF) as u8,
            ((val >> 16) & 0xFF) as u8,
            ((val >> 24) & 0xFF) as u8,
        ],
    );
}

/// A CPU already running 32-bit ring-0 protected-mode code at linear 0x5000
fn protected_cpu() -> CpuX86<ArrayMemory> {
    let mut mem = ArrayMemory::new();

    // GDT: null, code0, data0, code3, data3, TSS, not-present data, spare TSS
    mem.load_program(GDT_BASE + 8, &descriptor(0, 0xFFFFF, 0x9A, 0xC));
    mem.load_program(GDT_BASE + 16, &descriptor(0, 0xFFFFF, 0x92, 0xC));
    mem.load_program(GDT_BASE + 24, &descriptor(0, 0xFFFFF, 0xFA, 0xC));
    mem.load_program(GDT_BASE + 32, &descriptor(0, 0xFFFFF, 0xF2, 0xC));
    mem.load_program(GDT_BASE + 40, &descriptor(TSS_BASE, 0x67, 0x89, 0x0));
    mem.load_program(GDT_BASE + 48, &descriptor(0, 0xFFFFF, 0x12, 0xC)); // P=0
    mem.load_program(GDT_BASE + 56, &descriptor(TSS_BASE + 0x100, 0x67, 0x89, 0x0));

    // TSS: ring-0 stack at DATA32_R0:0x7000
    let mut cpu_mem = mem;
    write_u32(&mut cpu_mem, TSS_BASE + 4, 0x7000);
    write_u32(&mut cpu_mem, TSS_BASE + 8, DATA32_R0 as u32);

    let mut cpu = CpuX86::new(cpu_mem);
    cpu.protected_mode.gdtr = DescriptorTableRegister {
        base: GDT_BASE,
        limit: 0xFF,
    };
    cpu.protected_mode.idtr = DescriptorTableRegister {
        base: IDT_BASE,
        limit: 0x7FF,
    };
    cpu.protected_mode.cr0 |= CR0_PE;
    cpu.load_segment(SEG_CS, CODE32_R0).unwrap();
    cpu.load_segment(SEG_SS, DATA32_R0).unwrap();
    cpu.load_segment(SEG_DS, DATA32_R0).unwrap();
    cpu.regs[REG_ESP] = 0x6000;
    cpu.eip = 0x5000;
    cpu
}

// ------------------------------------------------------------------
// Segment loading
// ------------------------------------------------------------------

#[test]
fn test_real_mode_segment_load() {
    let mut cpu = CpuX86::new(ArrayMemory::new());
    cpu.load_segment(SEG_DS, 0x1234).unwrap();
    assert_eq!(cpu.segs[SEG_DS].selector, 0x1234);
    assert_eq!(cpu.segs[SEG_DS].base, 0x12340);
    assert_eq!(cpu.segs[SEG_DS].limit, 0xFFFF);
}

#[test]
fn test_real_mode_cs_load_never_changes_cpl() {
    let mut cpu = CpuX86::new(ArrayMemory::new());
    cpu.load_segment(SEG_CS, 0x1003).unwrap(); // RPL bits set
    assert_eq!(cpu.protected_mode.cpl, 0);
    assert_eq!(cpu.segs[SEG_CS].base, 0x10030);
}

#[test]
fn test_protected_segment_load_caches_descriptor() {
    let mut cpu = protected_cpu();
    cpu.load_segment(SEG_DS, DATA32_R0).unwrap();
    assert_eq!(cpu.segs[SEG_DS].selector, DATA32_R0);
    assert_eq!(cpu.segs[SEG_DS].base, 0);
    // G=1 limit 0xFFFFF scales to 4GB-1
    assert_eq!(cpu.segs[SEG_DS].limit, 0xFFFF_FFFF);
    assert!(cpu.segs[SEG_DS].default_32);
}

#[test]
fn test_protected_cs_load_updates_cpl() {
    let mut cpu = protected_cpu();
    assert_eq!(cpu.protected_mode.cpl, 0);
    cpu.load_segment(SEG_CS, CODE32_R3).unwrap();
    assert_eq!(cpu.protected_mode.cpl, 3);
}

#[test]
fn test_selector_beyond_table_limit_faults() {
    let mut cpu = protected_cpu();
    cpu.protected_mode.gdtr.limit = 0x17; // only null + 2 entries
    let err = cpu.load_segment(SEG_DS, CODE32_R3).unwrap_err();
    assert_eq!(err.vector, INT_GENERAL_PROTECTION);
    assert_eq!(err.error_code, Some(CODE32_R3 & 0xFFFC));
}

#[test]
fn test_not_present_segment_faults() {
    let mut cpu = protected_cpu();
    let err = cpu.load_segment(SEG_DS, NOT_PRESENT_SEL).unwrap_err();
    assert_eq!(err.vector, INT_SEGMENT_NOT_PRESENT);
    assert_eq!(err.error_code, Some(NOT_PRESENT_SEL as u16));

    // The same selector in SS raises a stack fault instead
    let err = cpu.load_segment(SEG_SS, NOT_PRESENT_SEL).unwrap_err();
    assert_eq!(err.vector, crate::cpu_x86::INT_STACK_FAULT);
}

#[test]
fn test_null_selector_rules() {
    let mut cpu = protected_cpu();
    // Null DS is legal and caches an empty segment
    cpu.load_segment(SEG_DS, 0).unwrap();
    assert_eq!(cpu.segs[SEG_DS].base, 0);
    assert_eq!(cpu.segs[SEG_DS].limit, 0);
    // Null CS/SS are protection violations
    assert_eq!(
        cpu.load_segment(SEG_CS, 0).unwrap_err().vector,
        INT_GENERAL_PROTECTION
    );
    assert_eq!(
        cpu.load_segment(SEG_SS, 0).unwrap_err().vector,
        INT_GENERAL_PROTECTION
    );
}

#[test]
fn test_lar_lsl_verify() {
    let mut cpu = protected_cpu();
    let rights = cpu.load_access_rights(DATA32_R0).unwrap();
    assert_eq!((rights >> 8) & 0xFF, 0x92);
    let limit = cpu.load_segment_limit(DATA32_R0).unwrap();
    assert_eq!(limit, 0xFFFF_FFFF);
    assert!(cpu.load_access_rights(0).is_none());

    // Writable data verifies for read and write; ring-3 access to it is
    // blocked by DPL
    assert!(cpu.verify_segment(DATA32_R0, true));
    assert!(cpu.verify_segment(DATA32_R0, false));
    cpu.protected_mode.cpl = 3;
    assert!(!cpu.verify_segment(DATA32_R0, true));
}

// ------------------------------------------------------------------
// Gate dispatch
// ------------------------------------------------------------------

#[test]
fn test_interrupt_gate_same_level_frame() {
    let mut cpu = protected_cpu();
    let handler = 0x9000u32;
    cpu.memory
        .load_program(IDT_BASE + 0x40 * 8, &gate(CODE32_R0, handler, 0x8E));
    cpu.flags.interrupt = true;
    let old_flags = cpu.flags.pack();
    let old_esp = cpu.regs[REG_ESP];

    cpu.dispatch_interrupt(0x40, true, false, None).unwrap();
    cpu.commit_writes();

    assert_eq!(cpu.eip, handler);
    assert_eq!(cpu.segs[SEG_CS].selector, CODE32_R0);
    // Interrupt gate clears IF
    assert!(!cpu.flags.interrupt);
    // Same-level frame: EFLAGS, CS, EIP (12 bytes)
    assert_eq!(cpu.regs[REG_ESP], old_esp - 12);
    let read32 = |cpu: &CpuX86<ArrayMemory>, a: u32| -> u32 {
        (0..4).fold(0u32, |acc, i| acc | (cpu.memory.read(a + i) as u32) << (8 * i))
    };
    assert_eq!(read32(&cpu, old_esp - 4), old_flags);
    assert_eq!(read32(&cpu, old_esp - 8), CODE32_R0 as u32);
    assert_eq!(read32(&cpu, old_esp - 12), 0x5000);
}

#[test]
fn test_trap_gate_keeps_if() {
    let mut cpu = protected_cpu();
    cpu.memory
        .load_program(IDT_BASE + 0x41 * 8, &gate(CODE32_R0, 0x9000, 0x8F));
    cpu.flags.interrupt = true;
    cpu.dispatch_interrupt(0x41, true, false, None).unwrap();
    assert!(cpu.flags.interrupt);
}

#[test]
fn test_software_int_dpl_check() {
    let mut cpu = protected_cpu();
    // Gate DPL 0, caller CPL 3: INT n must fault with the vector encoded
    cpu.memory
        .load_program(IDT_BASE + 0x42 * 8, &gate(CODE32_R0, 0x9000, 0x8E));
    cpu.protected_mode.tss = TaskRegister {
        selector: TSS_SEL,
        base: TSS_BASE,
        limit: 0x67,
        ty: 9,
    };
    cpu.load_segment(SEG_CS, CODE32_R3).unwrap();
    cpu.load_segment(SEG_SS, DATA32_R3).unwrap();
    let err = cpu.dispatch_interrupt(0x42, true, false, None).unwrap_err();
    assert_eq!(err.vector, INT_GENERAL_PROTECTION);
    assert_eq!(err.error_code, Some((0x42 << 3) | 2));

    // A hardware-style dispatch of the same vector is allowed
    assert!(cpu.dispatch_interrupt(0x42, false, true, None).is_ok());
}

#[test]
fn test_ring3_to_ring0_stack_switch() {
    let mut cpu = protected_cpu();
    cpu.protected_mode.tss = TaskRegister {
        selector: TSS_SEL,
        base: TSS_BASE,
        limit: 0x67,
        ty: 9,
    };
    cpu.memory
        .load_program(IDT_BASE + 0x40 * 8, &gate(CODE32_R0, 0x9000, 0xEE)); // DPL 3
    cpu.load_segment(SEG_CS, CODE32_R3).unwrap();
    cpu.load_segment(SEG_SS, DATA32_R3).unwrap();
    cpu.regs[REG_ESP] = 0x4000;
    cpu.eip = 0x1234;

    cpu.dispatch_interrupt(0x40, true, false, None).unwrap();
    cpu.commit_writes();

    // Now on the TSS-supplied ring-0 stack
    assert_eq!(cpu.protected_mode.cpl, 0);
    assert_eq!(cpu.segs[SEG_SS].selector, DATA32_R0);
    // Outer frame: SS, ESP, EFLAGS, CS, EIP
    assert_eq!(cpu.regs[REG_ESP], 0x7000 - 20);
    let read32 = |cpu: &CpuX86<ArrayMemory>, a: u32| -> u32 {
        (0..4).fold(0u32, |acc, i| acc | (cpu.memory.read(a + i) as u32) << (8 * i))
    };
    assert_eq!(read32(&cpu, 0x7000 - 4), DATA32_R3 as u32);
    assert_eq!(read32(&cpu, 0x7000 - 8), 0x4000);
    assert_eq!(read32(&cpu, 0x7000 - 16), CODE32_R3 as u32);
    assert_eq!(read32(&cpu, 0x7000 - 20), 0x1234);

    // IRET unwinds back to ring 3 with the old stack
    cpu.do_iret(true).unwrap();
    cpu.commit_writes();
    assert_eq!(cpu.protected_mode.cpl, 3);
    assert_eq!(cpu.segs[SEG_SS].selector, DATA32_R3);
    assert_eq!(cpu.regs[REG_ESP], 0x4000);
    assert_eq!(cpu.eip, 0x1234);
}

#[test]
fn test_error_code_pushed_for_gp() {
    let mut cpu = protected_cpu();
    cpu.memory
        .load_program(IDT_BASE + 13 * 8, &gate(CODE32_R0, 0xA000, 0x8E));
    let old_esp = cpu.regs[REG_ESP];

    cpu.dispatch_interrupt(13, false, true, Some(0x1234)).unwrap();
    cpu.commit_writes();

    // EFLAGS, CS, EIP, error code
    assert_eq!(cpu.regs[REG_ESP], old_esp - 16);
    let low = cpu.memory.read(old_esp - 16) as u16
        | ((cpu.memory.read(old_esp - 15) as u16) << 8);
    assert_eq!(low, 0x1234);
}

// ------------------------------------------------------------------
// Mode transitions and instructions
// ------------------------------------------------------------------

#[test]
fn test_enter_protected_mode_via_instructions() {
    let mut mem = ArrayMemory::new();
    // GDT with a 16-bit code segment covering low memory
    mem.load_program(GDT_BASE + 8, &descriptor(0, 0xFFFF, 0x9A, 0x0));
    mem.load_program(GDT_BASE + 16, &descriptor(0, 0xFFFF, 0x92, 0x0));
    // GDTR image at 0x0600: limit, base
    mem.load_program(0x600, &[0xFF, 0x00, 0x00, 0x00, 0x01, 0x00]);
    // At 0x0500: LGDT [0x0600]; MOV EAX,CR0; OR AL,1; MOV CR0,EAX;
    //            JMP far 0x0008:0x0520
    mem.load_program(
        0x500,
        &[
            0x0F, 0x01, 0x16, 0x00, 0x06, // LGDT [0x0600]
            0x0F, 0x20, 0xC0, // MOV EAX, CR0
            0x0C, 0x01, // OR AL, 1
            0x0F, 0x22, 0xC0, // MOV CR0, EAX
            0xEA, 0x20, 0x05, 0x08, 0x00, // JMP FAR 0008:0520
        ],
    );
    mem.load_program(0x520, &[0xF4]); // HLT
    let mut cpu = CpuX86::new(mem);
    cpu.segs[SEG_CS] = SegmentRegister::real_mode(0x0050);
    cpu.eip = 0;

    for _ in 0..5 {
        cpu.step();
    }

    assert!(cpu.protected_mode.is_protected());
    assert_eq!(cpu.protected_mode.gdtr.base, 0x10000);
    assert_eq!(cpu.protected_mode.gdtr.limit, 0xFF);
    assert_eq!(cpu.segs[SEG_CS].selector, 0x0008);
    assert_eq!(cpu.eip, 0x520);
    cpu.step();
    assert!(cpu.is_halted());
}

#[test]
fn test_smsw_reflects_pe() {
    let mut cpu = protected_cpu();
    // SMSW AX (0F 01 E0)
    cpu.memory.load_program(0x5000, &[0x0F, 0x01, 0xE0]);
    cpu.step();
    assert_eq!(cpu.get_reg16(REG_EAX as u8) & 1, 1);
}

#[test]
fn test_privileged_instruction_faults_at_cpl3() {
    let mut cpu = protected_cpu();
    cpu.memory
        .load_program(IDT_BASE + 13 * 8, &gate(CODE32_R0, 0xA000, 0x8E));
    cpu.protected_mode.tss = TaskRegister {
        selector: TSS_SEL,
        base: TSS_BASE,
        limit: 0x67,
        ty: 9,
    };
    cpu.load_segment(SEG_CS, CODE32_R3).unwrap();
    cpu.load_segment(SEG_SS, DATA32_R3).unwrap();
    cpu.regs[REG_ESP] = 0x4000;
    // HLT at ring 3
    cpu.memory.load_program(0x5000, &[0xF4]);
    cpu.eip = 0x5000;
    cpu.step();
    // Dispatched to the GP handler at ring 0
    assert_eq!(cpu.eip, 0xA000);
    assert_eq!(cpu.protected_mode.cpl, 0);
    assert!(!cpu.is_halted());
}

// ------------------------------------------------------------------
// Task switching
// ------------------------------------------------------------------

#[test]
fn test_task_switch_via_far_jump() {
    let mut cpu = protected_cpu();
    cpu.protected_mode.tss = TaskRegister {
        selector: TSS_SEL,
        base: TSS_BASE,
        limit: 0x67,
        ty: 9,
    };

    // Incoming task image at TSS_BASE+0x100
    let inc = TSS_BASE + 0x100;
    let mut fill = |offset: u32, val: u32| {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&val.to_le_bytes());
        cpu.memory.load_program(inc + offset, &bytes);
    };
    fill(0x20, 0xB000); // EIP
    fill(0x24, 0x0202); // EFLAGS (IF set)
    fill(0x28, 0x1111_2222); // EAX
    fill(0x38, 0x5000); // ESP
    fill(0x4C, CODE32_R0 as u32); // CS
    fill(0x50, DATA32_R0 as u32); // SS
    fill(0x54, DATA32_R0 as u32); // DS

    cpu.task_switch(TASK_TSS_SEL, crate::cpu_x86_protected::TaskSwitchSource::Jump)
        .unwrap();
    cpu.commit_writes();

    assert_eq!(cpu.protected_mode.tss.selector, TASK_TSS_SEL);
    assert_eq!(cpu.eip, 0xB000);
    assert_eq!(cpu.regs[REG_EAX], 0x1111_2222);
    assert_eq!(cpu.regs[REG_ESP], 0x5000);
    assert_eq!(cpu.segs[SEG_CS].selector, CODE32_R0);
    assert!(cpu.flags.interrupt);

    // Outgoing context was saved into the old TSS
    let read32 = |cpu: &CpuX86<ArrayMemory>, a: u32| -> u32 {
        (0..4).fold(0u32, |acc, i| acc | (cpu.memory.read(a + i) as u32) << (8 * i))
    };
    assert_eq!(read32(&cpu, TSS_BASE + 0x20), 0x5000); // saved EIP
    // Incoming descriptor is now marked busy (type 0xB)
    let access = cpu.memory.read(GDT_BASE + 56 + 5);
    assert_eq!(access & 0x0F, 0x0B);
}
