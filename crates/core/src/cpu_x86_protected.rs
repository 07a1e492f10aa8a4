//! Protected-mode support: descriptors, gates, task switching, interrupts
//!
//! This module implements the 80286/80386 protection machinery:
//! - Control registers (CR0/CR2/CR3) with the PE/WP/PG bits
//! - Global, Local and Interrupt Descriptor Tables (GDT/LDT/IDT)
//! - Segment loading with descriptor validation and privilege tracking
//! - Gate dispatch (interrupt, trap and task gates) with stack switching
//! - Far control transfers (CALL/JMP/RET/IRET) across privilege levels
//! - Hardware task switching via the TSS, including virtual-8086 transitions
//!
//! Segment caches are recomputed here and only here: `load_segment` is the
//! single mutator for a segment register, so the visible selector and the
//! cached base/limit/attributes can never drift apart.

use crate::cpu_x86::{
    CpuX86, Exception, MemoryX86, SegmentRegister, INT_INVALID_TSS, INT_SEGMENT_NOT_PRESENT,
    INT_STACK_FAULT, REG_EAX, REG_EBP, REG_EBX, REG_ECX, REG_EDI, REG_EDX, REG_ESI, REG_ESP,
    SEG_CS, SEG_DS, SEG_ES, SEG_FS, SEG_GS, SEG_SS,
};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

// CR0 bits
pub const CR0_PE: u32 = 0x0000_0001;
pub const CR0_MP: u32 = 0x0000_0002;
pub const CR0_EM: u32 = 0x0000_0004;
pub const CR0_TS: u32 = 0x0000_0008;
pub const CR0_ET: u32 = 0x0000_0010;
pub const CR0_WP: u32 = 0x0001_0000;
pub const CR0_PG: u32 = 0x8000_0000;

/// Descriptor Table Register (GDTR/IDTR): linear base and limit
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u16,
}

/// Cached LDT register state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LdtRegister {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
}

/// Cached task register state
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskRegister {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// Descriptor system type (9/11 for 32-bit TSS)
    pub ty: u8,
}

/// Protected-mode CPU state
///
/// Groups the control registers, descriptor-table registers, task register
/// and current privilege level. Lives inside `CpuX86` and is snapshotted and
/// rolled back together with the rest of the architectural state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedState {
    /// Control register 0 (PE, MP, EM, TS, WP, PG)
    pub cr0: u32,
    /// Page-fault linear address
    pub cr2: u32,
    /// Page-directory base register
    pub cr3: u32,
    /// Global descriptor table register
    pub gdtr: DescriptorTableRegister,
    /// Interrupt descriptor table register
    pub idtr: DescriptorTableRegister,
    /// Local descriptor table register
    pub ldtr: LdtRegister,
    /// Task register (current TSS)
    pub tss: TaskRegister,
    /// Current privilege level (ring 0-3)
    pub cpl: u8,
}

impl ProtectedState {
    pub fn new() -> Self {
        let mut state = Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister::default(),
            ldtr: LdtRegister::default(),
            tss: TaskRegister::default(),
            cpl: 0,
        };
        state.reset();
        state
    }

    /// Restore power-on defaults
    pub fn reset(&mut self) {
        self.cr0 = CR0_ET;
        self.cr2 = 0;
        self.cr3 = 0;
        self.gdtr = DescriptorTableRegister { base: 0, limit: 0xFFFF };
        // Real-mode IVT: 256 four-byte vectors at linear 0
        self.idtr = DescriptorTableRegister { base: 0, limit: 0x03FF };
        self.ldtr = LdtRegister::default();
        self.tss = TaskRegister::default();
        self.cpl = 0;
    }

    /// Check if the PE bit is set
    #[inline]
    pub fn is_protected(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }
}

impl Default for ProtectedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed 8-byte segment descriptor
#[derive(Debug, Clone, Copy)]
pub struct SegmentDescriptor {
    /// 32-bit linear base address
    pub base: u32,
    /// Byte-granular limit (already scaled when G is set)
    pub limit: u32,
    /// Access-rights byte (P, DPL, S, type)
    pub access: u8,
    /// Flags nibble (G, D/B, L, AVL)
    pub flags: u8,
}

impl SegmentDescriptor {
    /// Decode the packed descriptor format
    pub fn from_raw(low: u32, high: u32) -> Self {
        let base = (low >> 16) | ((high & 0xFF) << 16) | (high & 0xFF00_0000);
        let raw_limit = (low & 0xFFFF) | (high & 0x000F_0000);
        let flags = ((high >> 20) & 0xF) as u8;
        let limit = if flags & 0x8 != 0 {
            // Page granularity: low 12 bits read as ones
            (raw_limit << 12) | 0xFFF
        } else {
            raw_limit
        };
        Self {
            base,
            limit,
            access: ((high >> 8) & 0xFF) as u8,
            flags,
        }
    }

    #[inline]
    pub fn present(&self) -> bool {
        self.access & 0x80 != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    /// System descriptor (S bit clear): TSS, LDT or gate
    #[inline]
    pub fn is_system(&self) -> bool {
        self.access & 0x10 == 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        !self.is_system() && self.access & 0x08 != 0
    }

    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && self.access & 0x04 != 0
    }

    #[inline]
    pub fn is_expand_down(&self) -> bool {
        !self.is_system() && self.access & 0x08 == 0 && self.access & 0x04 != 0
    }

    /// D/B bit: 32-bit default operand/address size
    #[inline]
    pub fn default_32(&self) -> bool {
        self.flags & 0x4 != 0
    }

    /// System type field (TSS/LDT/gate kinds)
    #[inline]
    pub fn system_type(&self) -> u8 {
        self.access & 0x0F
    }
}

/// Parsed 8-byte gate descriptor (interrupt/trap/call/task gate)
#[derive(Debug, Clone, Copy)]
pub struct GateDescriptor {
    pub offset: u32,
    pub selector: u16,
    /// Gate type (5=task, 6/7=16-bit int/trap, C=call32, E/F=32-bit int/trap)
    pub ty: u8,
    pub dpl: u8,
    pub present: bool,
    /// Call-gate parameter count
    pub param_count: u8,
}

impl GateDescriptor {
    pub fn from_raw(low: u32, high: u32) -> Self {
        Self {
            offset: (low & 0xFFFF) | (high & 0xFFFF_0000),
            selector: (low >> 16) as u16,
            ty: ((high >> 8) & 0x0F) as u8,
            dpl: ((high >> 13) & 3) as u8,
            present: high & 0x8000 != 0,
            param_count: (high & 0x1F) as u8,
        }
    }
}

/// How a task switch was initiated; controls busy-bit and back-link handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskSwitchSource {
    /// JMP to a TSS: outgoing marked non-busy, no back link
    Jump,
    /// CALL to a TSS or dispatch through a task gate: outgoing stays busy,
    /// incoming records the back link and NT
    Gate,
    /// IRET with NT set: return along the back link, incoming already busy
    Iret,
}

// 32-bit TSS field offsets
const TSS_BACK_LINK: u32 = 0x00;
const TSS_CR3: u32 = 0x1C;
const TSS_EIP: u32 = 0x20;
const TSS_EFLAGS: u32 = 0x24;
const TSS_EAX: u32 = 0x28;
const TSS_ECX: u32 = 0x2C;
const TSS_EDX: u32 = 0x30;
const TSS_EBX: u32 = 0x34;
const TSS_ESP: u32 = 0x38;
const TSS_EBP: u32 = 0x3C;
const TSS_ESI: u32 = 0x40;
const TSS_EDI: u32 = 0x44;
const TSS_ES: u32 = 0x48;
const TSS_CS: u32 = 0x4C;
const TSS_SS: u32 = 0x50;
const TSS_DS: u32 = 0x54;
const TSS_FS: u32 = 0x58;
const TSS_GS: u32 = 0x5C;
const TSS_LDT: u32 = 0x60;

impl<M: MemoryX86> CpuX86<M> {
    /// True when executing with protected-mode segmentation (PE set, not V86)
    #[inline]
    pub(crate) fn in_protected_mode(&self) -> bool {
        self.protected_mode.is_protected() && !self.flags.v86
    }

    /// Read and parse a descriptor from the GDT or LDT
    pub(crate) fn read_descriptor(&mut self, selector: u16) -> Result<SegmentDescriptor, Exception> {
        let (low, high) = self.read_descriptor_raw(selector)?;
        Ok(SegmentDescriptor::from_raw(low, high))
    }

    fn descriptor_addr(&self, selector: u16) -> Result<u32, Exception> {
        let index = (selector & 0xFFF8) as u32;
        if selector & 0x4 != 0 {
            if index + 7 > self.protected_mode.ldtr.limit {
                return Err(Exception::gp(selector & 0xFFFC));
            }
            Ok(self.protected_mode.ldtr.base.wrapping_add(index))
        } else {
            if index + 7 > self.protected_mode.gdtr.limit as u32 {
                return Err(Exception::gp(selector & 0xFFFC));
            }
            Ok(self.protected_mode.gdtr.base.wrapping_add(index))
        }
    }

    fn read_descriptor_raw(&mut self, selector: u16) -> Result<(u32, u32), Exception> {
        if selector & 0xFFFC == 0 {
            return Err(Exception::gp(0));
        }
        let addr = self.descriptor_addr(selector)?;
        let low = self.cpu_read_u32(addr)?;
        let high = self.cpu_read_u32(addr.wrapping_add(4))?;
        Ok((low, high))
    }

    /// Load a segment register, recomputing the cached base/limit/attributes
    ///
    /// This is the only function that mutates a segment register. Real mode
    /// and virtual-8086 mode derive the base arithmetically; protected mode
    /// validates the selector against the owning descriptor table and raises
    /// the appropriate fault with the selector as error code. Loading CS
    /// updates the current privilege level from the selector's RPL (forced to
    /// 3 in virtual-8086 mode).
    pub(crate) fn load_segment(&mut self, seg: usize, selector: u16) -> Result<(), Exception> {
        if !self.in_protected_mode() {
            self.segs[seg] = SegmentRegister::real_mode(selector);
            if seg == SEG_CS {
                self.protected_mode.cpl = if self.flags.v86 { 3 } else { 0 };
            }
            return Ok(());
        }

        if selector & 0xFFFC == 0 {
            // Null selector: legal to hold in a data segment register (any
            // later use would fault on real hardware); never legal for CS/SS.
            if seg == SEG_CS || seg == SEG_SS {
                return Err(Exception::gp(0));
            }
            self.segs[seg] = SegmentRegister {
                selector,
                base: 0,
                limit: 0,
                default_32: false,
                expand_down: false,
            };
            return Ok(());
        }

        let desc = self.read_descriptor(selector)?;
        let err = selector & 0xFFFC;
        if desc.is_system() {
            return Err(Exception::gp(err));
        }
        if seg == SEG_CS && !desc.is_code() {
            return Err(Exception::gp(err));
        }
        if seg == SEG_SS && desc.is_code() {
            return Err(Exception::gp(err));
        }
        if !desc.present() {
            return Err(if seg == SEG_SS {
                Exception::with_error(INT_STACK_FAULT, err)
            } else {
                Exception::with_error(INT_SEGMENT_NOT_PRESENT, err)
            });
        }

        self.segs[seg] = SegmentRegister {
            selector,
            base: desc.base,
            limit: desc.limit,
            default_32: desc.default_32(),
            expand_down: desc.is_expand_down(),
        };
        if seg == SEG_CS {
            self.protected_mode.cpl = (selector & 3) as u8;
        }
        Ok(())
    }

    /// Write CR0, handling real/protected transitions
    pub(crate) fn set_cr0(&mut self, value: u32) {
        let was_protected = self.protected_mode.is_protected();
        self.protected_mode.cr0 = value | CR0_ET;
        if was_protected && !self.protected_mode.is_protected() {
            // Returning to real mode: drop the 32-bit segment attributes and
            // privilege so subsequent execution uses real-mode semantics.
            log(LogCategory::Cpu, LogLevel::Info, || {
                "leaving protected mode".to_string()
            });
            for seg in self.segs.iter_mut() {
                seg.default_32 = false;
                seg.expand_down = false;
            }
            self.protected_mode.cpl = 0;
        } else if !was_protected && self.protected_mode.is_protected() {
            log(LogCategory::Cpu, LogLevel::Info, || {
                "entering protected mode".to_string()
            });
        }
    }

    // ------------------------------------------------------------------
    // Interrupt and exception dispatch
    // ------------------------------------------------------------------

    /// Route an interrupt through the real-mode IVT or the protected IDT
    ///
    /// `software` marks INT/INTO/INT3/INT1 (subject to the gate DPL check and
    /// the host callback shortcut); `external` marks hardware IRQs and CPU
    /// exceptions (sets the EXT bit in pushed error codes).
    pub(crate) fn dispatch_interrupt(
        &mut self,
        vector: u8,
        software: bool,
        external: bool,
        error_code: Option<u16>,
    ) -> Result<(), Exception> {
        if !self.protected_mode.is_protected() {
            self.dispatch_interrupt_real(vector, software)
        } else {
            self.dispatch_interrupt_protected(vector, software, external, error_code)
        }
    }

    /// Real-mode vector dispatch: push FLAGS/CS/IP, load CS:IP from the IVT
    fn dispatch_interrupt_real(&mut self, vector: u8, software: bool) -> Result<(), Exception> {
        if software {
            if let Some(callback) = self.int_callback(vector) {
                callback(self);
                return Ok(());
            }
        }

        self.push16(self.flags.pack() as u16)?;
        self.push16(self.segs[SEG_CS].selector)?;
        self.push16(self.eip as u16)?;

        let entry = (vector as u32) * 4;
        let new_ip = self.cpu_read_u16(entry)?;
        let new_cs = self.cpu_read_u16(entry + 2)?;

        self.flags.interrupt = false;
        self.flags.trap = false;

        self.segs[SEG_CS] = SegmentRegister::real_mode(new_cs);
        self.eip = new_ip as u32;
        Ok(())
    }

    /// Protected-mode dispatch through the IDT
    fn dispatch_interrupt_protected(
        &mut self,
        vector: u8,
        software: bool,
        external: bool,
        error_code: Option<u16>,
    ) -> Result<(), Exception> {
        // INT n in virtual-8086 mode requires I/O privilege
        if software && self.flags.v86 && self.flags.iopl < 3 {
            return Err(Exception::gp(0));
        }

        let ext: u16 = if external { 1 } else { 0 };
        let idt_err = ((vector as u16) << 3) | 2 | ext;

        let entry = (vector as u32) * 8;
        if entry + 7 > self.protected_mode.idtr.limit as u32 {
            return Err(Exception::gp(idt_err));
        }
        let base = self.protected_mode.idtr.base;
        let low = self.cpu_read_u32(base.wrapping_add(entry))?;
        let high = self.cpu_read_u32(base.wrapping_add(entry + 4))?;
        let gate = GateDescriptor::from_raw(low, high);

        // Software interrupts honor the gate DPL so user code cannot invoke
        // supervisor-only vectors
        if software && self.protected_mode.cpl > gate.dpl {
            return Err(Exception::gp(((vector as u16) << 3) | 2));
        }
        if !gate.present {
            return Err(Exception::with_error(INT_SEGMENT_NOT_PRESENT, idt_err));
        }

        match gate.ty {
            0x5 => {
                self.task_switch(gate.selector, TaskSwitchSource::Gate)?;
                if let Some(code) = error_code {
                    let push_32 = self.segs[SEG_CS].default_32;
                    self.push_sized(code as u32, push_32)?;
                }
                Ok(())
            }
            0x6 | 0x7 | 0xE | 0xF => {
                let gate_32 = gate.ty & 0x8 != 0;
                let clear_if = gate.ty & 0x1 == 0; // interrupt gates mask IRQs
                self.interrupt_gate_dispatch(gate, gate_32, clear_if, error_code)
            }
            _ => Err(Exception::gp(idt_err)),
        }
    }

    /// Transfer through a 16/32-bit interrupt or trap gate
    fn interrupt_gate_dispatch(
        &mut self,
        gate: GateDescriptor,
        gate_32: bool,
        clear_if: bool,
        error_code: Option<u16>,
    ) -> Result<(), Exception> {
        let target_err = gate.selector & 0xFFFC;
        let desc = self.read_descriptor(gate.selector)?;
        if !desc.is_code() {
            return Err(Exception::gp(target_err));
        }
        if !desc.present() {
            return Err(Exception::with_error(INT_SEGMENT_NOT_PRESENT, target_err));
        }

        let cpl = self.protected_mode.cpl;
        let target_dpl = if desc.is_conforming() { cpl } else { desc.dpl() };
        let from_v86 = self.flags.v86;

        let old_flags = self.flags.pack();
        let old_cs = self.segs[SEG_CS].selector;
        let old_eip = self.eip;

        if target_dpl < cpl {
            // Inter-privilege: switch to the inner stack from the TSS
            let (new_ss, new_esp) = self.tss_stack_pointer(target_dpl)?;
            let old_ss = self.segs[SEG_SS].selector;
            let old_esp = self.regs[REG_ESP];

            // Leaving virtual-8086 mode: the data segments are part of the
            // interrupted context and are pushed before the stack pointer pair
            self.flags.v86 = false;
            self.protected_mode.cpl = target_dpl;
            self.load_segment(SEG_SS, new_ss)?;
            self.regs[REG_ESP] = new_esp;

            if from_v86 {
                self.push_sized(self.segs[SEG_GS].selector as u32, gate_32)?;
                self.push_sized(self.segs[SEG_FS].selector as u32, gate_32)?;
                self.push_sized(self.segs[SEG_DS].selector as u32, gate_32)?;
                self.push_sized(self.segs[SEG_ES].selector as u32, gate_32)?;
            }
            self.push_sized(old_ss as u32, gate_32)?;
            self.push_sized(old_esp, gate_32)?;
            self.push_sized(old_flags, gate_32)?;
            self.push_sized(old_cs as u32, gate_32)?;
            self.push_sized(old_eip, gate_32)?;

            if from_v86 {
                // The handler runs with flat-null data segments
                self.load_segment(SEG_DS, 0)?;
                self.load_segment(SEG_ES, 0)?;
                self.load_segment(SEG_FS, 0)?;
                self.load_segment(SEG_GS, 0)?;
            }
        } else {
            if from_v86 {
                // A V86 interrupt must raise privilege; a same-level target is
                // a protection violation
                return Err(Exception::gp(target_err));
            }
            self.push_sized(old_flags, gate_32)?;
            self.push_sized(old_cs as u32, gate_32)?;
            self.push_sized(old_eip, gate_32)?;
        }

        if let Some(code) = error_code {
            self.push_sized(code as u32, gate_32)?;
        }

        self.load_segment(SEG_CS, gate.selector)?;
        self.eip = if gate_32 {
            gate.offset
        } else {
            gate.offset & 0xFFFF
        };

        self.flags.trap = false;
        self.flags.nested_task = false;
        self.flags.resume = false;
        if clear_if {
            self.flags.interrupt = false;
        }
        Ok(())
    }

    /// Fetch the inner-stack SS:ESP pair for a privilege level from the TSS
    pub(crate) fn tss_stack_pointer(&mut self, level: u8) -> Result<(u16, u32), Exception> {
        let tss = self.protected_mode.tss;
        let err = tss.selector & 0xFFFC;
        if tss.ty & 0x8 != 0 {
            // 32-bit TSS: {esp, ss} pairs of 8 bytes starting at offset 4
            let offset = 4 + (level as u32) * 8;
            if offset + 7 > tss.limit {
                return Err(Exception::with_error(INT_INVALID_TSS, err));
            }
            let esp = self.cpu_read_u32(tss.base.wrapping_add(offset))?;
            let ss = self.cpu_read_u16(tss.base.wrapping_add(offset + 4))?;
            Ok((ss, esp))
        } else {
            // 16-bit TSS: {sp, ss} pairs of 4 bytes starting at offset 2
            let offset = 2 + (level as u32) * 4;
            if offset + 3 > tss.limit {
                return Err(Exception::with_error(INT_INVALID_TSS, err));
            }
            let sp = self.cpu_read_u16(tss.base.wrapping_add(offset))?;
            let ss = self.cpu_read_u16(tss.base.wrapping_add(offset + 2))?;
            Ok((ss, sp as u32))
        }
    }

    // ------------------------------------------------------------------
    // Far control transfers
    // ------------------------------------------------------------------

    /// Far jump to selector:offset, possibly through a gate or TSS
    pub(crate) fn far_jump(&mut self, selector: u16, offset: u32, op_32: bool) -> Result<(), Exception> {
        if !self.in_protected_mode() {
            self.load_segment(SEG_CS, selector)?;
            self.eip = if op_32 { offset } else { offset & 0xFFFF };
            return Ok(());
        }

        let desc = self.read_descriptor(selector)?;
        if desc.is_system() {
            return match desc.system_type() {
                0x5 => {
                    let target = self.gate_target(selector)?;
                    self.task_switch(target, TaskSwitchSource::Jump)
                }
                0x9 | 0xB => self.task_switch(selector, TaskSwitchSource::Jump),
                _ => Err(Exception::gp(selector & 0xFFFC)),
            };
        }
        if !desc.is_code() {
            return Err(Exception::gp(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::with_error(
                INT_SEGMENT_NOT_PRESENT,
                selector & 0xFFFC,
            ));
        }
        // Keep the current privilege: the selector's RPL is replaced by CPL
        let cpl = self.protected_mode.cpl;
        self.load_segment(SEG_CS, (selector & 0xFFFC) | cpl as u16)?;
        self.eip = if op_32 { offset } else { offset & 0xFFFF };
        Ok(())
    }

    /// Far call to selector:offset, handling call gates and TSS targets
    pub(crate) fn far_call(&mut self, selector: u16, offset: u32, op_32: bool) -> Result<(), Exception> {
        if !self.in_protected_mode() {
            self.push_sized(self.segs[SEG_CS].selector as u32, op_32)?;
            self.push_sized(self.eip, op_32)?;
            self.load_segment(SEG_CS, selector)?;
            self.eip = if op_32 { offset } else { offset & 0xFFFF };
            return Ok(());
        }

        let desc = self.read_descriptor(selector)?;
        if desc.is_system() {
            return match desc.system_type() {
                0x4 | 0xC => self.call_gate_transfer(selector, desc.system_type() == 0xC),
                0x5 => {
                    let target = self.gate_target(selector)?;
                    self.task_switch(target, TaskSwitchSource::Gate)
                }
                0x9 | 0xB => self.task_switch(selector, TaskSwitchSource::Gate),
                _ => Err(Exception::gp(selector & 0xFFFC)),
            };
        }
        if !desc.is_code() {
            return Err(Exception::gp(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::with_error(
                INT_SEGMENT_NOT_PRESENT,
                selector & 0xFFFC,
            ));
        }

        self.push_sized(self.segs[SEG_CS].selector as u32, op_32)?;
        self.push_sized(self.eip, op_32)?;
        let cpl = self.protected_mode.cpl;
        self.load_segment(SEG_CS, (selector & 0xFFFC) | cpl as u16)?;
        self.eip = if op_32 { offset } else { offset & 0xFFFF };
        Ok(())
    }

    /// Selector held in a task/call gate descriptor
    fn gate_target(&mut self, gate_selector: u16) -> Result<u16, Exception> {
        let (low, _high) = self.read_descriptor_raw(gate_selector)?;
        Ok((low >> 16) as u16)
    }

    /// Control transfer through a call gate, switching stacks when the target
    /// code segment is more privileged
    fn call_gate_transfer(&mut self, gate_selector: u16, gate_32: bool) -> Result<(), Exception> {
        let (low, high) = self.read_descriptor_raw(gate_selector)?;
        let gate = GateDescriptor::from_raw(low, high);
        let err = gate_selector & 0xFFFC;

        if self.protected_mode.cpl > gate.dpl {
            return Err(Exception::gp(err));
        }
        if !gate.present {
            return Err(Exception::with_error(INT_SEGMENT_NOT_PRESENT, err));
        }

        let target = gate.selector;
        let desc = self.read_descriptor(target)?;
        if !desc.is_code() {
            return Err(Exception::gp(target & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::with_error(
                INT_SEGMENT_NOT_PRESENT,
                target & 0xFFFC,
            ));
        }

        let cpl = self.protected_mode.cpl;
        let target_dpl = desc.dpl();
        if !desc.is_conforming() && target_dpl < cpl {
            // More privileged: switch to the inner stack and copy parameters
            let (new_ss, new_esp) = self.tss_stack_pointer(target_dpl)?;
            let old_ss = self.segs[SEG_SS].selector;
            let old_esp = self.regs[REG_ESP];

            let param_count = (gate.param_count & 0x1F) as u32;
            let param_size: u32 = if gate_32 { 4 } else { 2 };
            let mut params = [0u32; 32];
            for i in 0..param_count {
                let offset = old_esp.wrapping_add(i * param_size);
                params[i as usize] = if gate_32 {
                    self.read_virt32(SEG_SS, offset)?
                } else {
                    self.read_virt16(SEG_SS, offset)? as u32
                };
            }

            self.protected_mode.cpl = target_dpl;
            self.load_segment(SEG_SS, new_ss)?;
            self.regs[REG_ESP] = new_esp;

            self.push_sized(old_ss as u32, gate_32)?;
            self.push_sized(old_esp, gate_32)?;
            for i in (0..param_count).rev() {
                self.push_sized(params[i as usize], gate_32)?;
            }
            self.push_sized(self.segs[SEG_CS].selector as u32, gate_32)?;
            self.push_sized(self.eip, gate_32)?;
            self.load_segment(SEG_CS, (target & 0xFFFC) | target_dpl as u16)?;
        } else {
            // Same privilege through the gate
            self.push_sized(self.segs[SEG_CS].selector as u32, gate_32)?;
            self.push_sized(self.eip, gate_32)?;
            self.load_segment(SEG_CS, (target & 0xFFFC) | cpl as u16)?;
        }
        self.eip = if gate_32 {
            gate.offset
        } else {
            gate.offset & 0xFFFF
        };
        Ok(())
    }

    /// Far return, popping CS:IP and unwinding a privileged call's stack
    pub(crate) fn far_return(&mut self, op_32: bool, stack_adjust: u16) -> Result<(), Exception> {
        let new_eip = self.pop_sized(op_32)?;
        let new_cs = self.pop_sized(op_32)? as u16;

        if self.in_protected_mode() {
            let rpl = (new_cs & 3) as u8;
            let cpl = self.protected_mode.cpl;
            if rpl < cpl {
                return Err(Exception::gp(new_cs & 0xFFFC));
            }
            if rpl > cpl {
                // Return to outer privilege: the caller's stack pointer pair
                // sits above the (adjusted) parameters
                self.adjust_stack(stack_adjust as u32);
                let new_esp = self.pop_sized(op_32)?;
                let new_ss = self.pop_sized(op_32)? as u16;
                self.protected_mode.cpl = rpl;
                self.load_segment(SEG_CS, new_cs)?;
                self.load_segment(SEG_SS, new_ss)?;
                self.regs[REG_ESP] = new_esp;
                self.eip = if op_32 { new_eip } else { new_eip & 0xFFFF };
                return Ok(());
            }
            self.load_segment(SEG_CS, new_cs)?;
        } else {
            self.load_segment(SEG_CS, new_cs)?;
        }
        self.adjust_stack(stack_adjust as u32);
        self.eip = if op_32 { new_eip } else { new_eip & 0xFFFF };
        Ok(())
    }

    fn adjust_stack(&mut self, bytes: u32) {
        if self.segs[SEG_SS].default_32 {
            self.regs[REG_ESP] = self.regs[REG_ESP].wrapping_add(bytes);
        } else {
            let sp = (self.regs[REG_ESP] as u16).wrapping_add(bytes as u16);
            self.set_reg16(REG_ESP as u8, sp);
        }
    }

    /// Interrupt return: real-mode pop, V86 pop, task return via NT, or
    /// protected-mode return with optional privilege-level and V86 transitions
    pub(crate) fn do_iret(&mut self, op_32: bool) -> Result<(), Exception> {
        if !self.protected_mode.is_protected() {
            let new_eip = self.pop_sized(op_32)?;
            let new_cs = self.pop_sized(op_32)? as u16;
            let new_flags = self.pop_sized(op_32)?;
            self.segs[SEG_CS] = SegmentRegister::real_mode(new_cs);
            self.eip = if op_32 { new_eip } else { new_eip & 0xFFFF };
            if op_32 {
                self.flags.unpack(new_flags, 0);
            } else {
                let keep_high = self.flags.pack() & 0xFFFF_0000;
                self.flags.unpack(keep_high | (new_flags & 0xFFFF), 0);
            }
            return Ok(());
        }

        if self.flags.v86 {
            // IRET inside a V86 task needs I/O privilege; the monitor traps it
            // through the GP handler otherwise
            if self.flags.iopl < 3 {
                return Err(Exception::gp(0));
            }
            let new_eip = self.pop_sized(op_32)?;
            let new_cs = self.pop_sized(op_32)? as u16;
            let new_flags = self.pop_sized(op_32)?;
            self.load_segment(SEG_CS, new_cs)?;
            self.eip = if op_32 { new_eip } else { new_eip & 0xFFFF };
            let keep = self.flags.pack();
            let merged = if op_32 {
                new_flags
            } else {
                (keep & 0xFFFF_0000) | (new_flags & 0xFFFF)
            };
            self.flags.unpack(merged, 3);
            return Ok(());
        }

        if self.flags.nested_task {
            // Task return: follow the back link in the current TSS
            let link = self.cpu_read_u16(self.protected_mode.tss.base + TSS_BACK_LINK)?;
            return self.task_switch(link, TaskSwitchSource::Iret);
        }

        let new_eip = self.pop_sized(op_32)?;
        let new_cs = self.pop_sized(op_32)? as u16;
        let new_flags = self.pop_sized(op_32)?;

        if op_32 && new_flags & 0x0002_0000 != 0 && self.protected_mode.cpl == 0 {
            // Resuming a virtual-8086 context: the frame continues with the
            // V86 stack pointer and data segments
            let new_esp = self.pop32()?;
            let new_ss = self.pop32()? as u16;
            let new_es = self.pop32()? as u16;
            let new_ds = self.pop32()? as u16;
            let new_fs = self.pop32()? as u16;
            let new_gs = self.pop32()? as u16;

            self.flags.unpack_all(new_flags);
            self.segs[SEG_CS] = SegmentRegister::real_mode(new_cs);
            self.segs[SEG_SS] = SegmentRegister::real_mode(new_ss);
            self.segs[SEG_ES] = SegmentRegister::real_mode(new_es);
            self.segs[SEG_DS] = SegmentRegister::real_mode(new_ds);
            self.segs[SEG_FS] = SegmentRegister::real_mode(new_fs);
            self.segs[SEG_GS] = SegmentRegister::real_mode(new_gs);
            self.eip = new_eip & 0xFFFF;
            self.regs[REG_ESP] = new_esp;
            self.protected_mode.cpl = 3;
            return Ok(());
        }

        let rpl = (new_cs & 3) as u8;
        let cpl = self.protected_mode.cpl;
        if rpl < cpl {
            return Err(Exception::gp(new_cs & 0xFFFC));
        }

        if rpl > cpl {
            // Return to outer level: restore the interrupted stack
            let new_esp = self.pop_sized(op_32)?;
            let new_ss = self.pop_sized(op_32)? as u16;
            self.protected_mode.cpl = rpl;
            self.load_segment(SEG_CS, new_cs)?;
            self.load_segment(SEG_SS, new_ss)?;
            self.regs[REG_ESP] = new_esp;
        } else {
            self.load_segment(SEG_CS, new_cs)?;
        }
        self.eip = if op_32 { new_eip } else { new_eip & 0xFFFF };

        let keep = self.flags.pack();
        let merged = if op_32 {
            new_flags
        } else {
            (keep & 0xFFFF_0000) | (new_flags & 0xFFFF)
        };
        self.flags.unpack(merged, cpl);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hardware task switching
    // ------------------------------------------------------------------

    /// Switch to the task whose TSS is named by `selector`
    ///
    /// Saves the outgoing task's registers, segments and EIP/EFLAGS into its
    /// TSS, then loads the incoming task's context (including CR3 and LDT).
    /// Busy-bit maintenance follows the initiation kind: JMP clears the
    /// outgoing busy bit, CALL/gate entry leaves it set and records the back
    /// link with NT, IRET return clears the outgoing bit and expects the
    /// incoming task to already be busy.
    pub(crate) fn task_switch(
        &mut self,
        selector: u16,
        source: TaskSwitchSource,
    ) -> Result<(), Exception> {
        let err = selector & 0xFFFC;
        if selector & 0x4 != 0 {
            // TSS descriptors live in the GDT only
            return Err(Exception::with_error(INT_INVALID_TSS, err));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_system() {
            return Err(Exception::with_error(INT_INVALID_TSS, err));
        }
        match (desc.system_type(), source) {
            (0x9, TaskSwitchSource::Jump) | (0x9, TaskSwitchSource::Gate) => {}
            (0xB, TaskSwitchSource::Iret) => {}
            // 16-bit TSS types (1/3) are not supported by this core
            _ => return Err(Exception::with_error(INT_INVALID_TSS, err)),
        }
        if !desc.present() {
            return Err(Exception::with_error(INT_SEGMENT_NOT_PRESENT, err));
        }
        if desc.limit < 0x67 {
            return Err(Exception::with_error(INT_INVALID_TSS, err));
        }

        log(LogCategory::Cpu, LogLevel::Debug, || {
            format!(
                "task switch {:04X} -> {:04X} ({:?})",
                self.protected_mode.tss.selector, selector, source
            )
        });

        // Save the outgoing context into its TSS
        let old_tss = self.protected_mode.tss;
        let old_flags = if source == TaskSwitchSource::Iret {
            // The NT flag saved for the outgoing task is cleared so a later
            // re-entry does not immediately chain back
            let mut flags = self.flags;
            flags.nested_task = false;
            flags.pack()
        } else {
            self.flags.pack()
        };
        let base = old_tss.base;
        self.cpu_write_u32(base + TSS_CR3, self.protected_mode.cr3)?;
        self.cpu_write_u32(base + TSS_EIP, self.eip)?;
        self.cpu_write_u32(base + TSS_EFLAGS, old_flags)?;
        self.cpu_write_u32(base + TSS_EAX, self.regs[REG_EAX])?;
        self.cpu_write_u32(base + TSS_ECX, self.regs[REG_ECX])?;
        self.cpu_write_u32(base + TSS_EDX, self.regs[REG_EDX])?;
        self.cpu_write_u32(base + TSS_EBX, self.regs[REG_EBX])?;
        self.cpu_write_u32(base + TSS_ESP, self.regs[REG_ESP])?;
        self.cpu_write_u32(base + TSS_EBP, self.regs[REG_EBP])?;
        self.cpu_write_u32(base + TSS_ESI, self.regs[REG_ESI])?;
        self.cpu_write_u32(base + TSS_EDI, self.regs[REG_EDI])?;
        self.cpu_write_u16(base + TSS_ES, self.segs[SEG_ES].selector)?;
        self.cpu_write_u16(base + TSS_CS, self.segs[SEG_CS].selector)?;
        self.cpu_write_u16(base + TSS_SS, self.segs[SEG_SS].selector)?;
        self.cpu_write_u16(base + TSS_DS, self.segs[SEG_DS].selector)?;
        self.cpu_write_u16(base + TSS_FS, self.segs[SEG_FS].selector)?;
        self.cpu_write_u16(base + TSS_GS, self.segs[SEG_GS].selector)?;

        // Outgoing busy bit: cleared unless the switch nests (CALL/gate)
        if source != TaskSwitchSource::Gate && old_tss.selector & 0xFFFC != 0 {
            self.set_tss_busy(old_tss.selector, false)?;
        }

        // Load the incoming context
        let new_base = desc.base;
        let link = old_tss.selector;
        let new_cr3 = self.cpu_read_u32(new_base + TSS_CR3)?;
        let new_eip = self.cpu_read_u32(new_base + TSS_EIP)?;
        let mut new_flags = self.cpu_read_u32(new_base + TSS_EFLAGS)?;
        let new_regs = [
            self.cpu_read_u32(new_base + TSS_EAX)?,
            self.cpu_read_u32(new_base + TSS_ECX)?,
            self.cpu_read_u32(new_base + TSS_EDX)?,
            self.cpu_read_u32(new_base + TSS_EBX)?,
            self.cpu_read_u32(new_base + TSS_ESP)?,
            self.cpu_read_u32(new_base + TSS_EBP)?,
            self.cpu_read_u32(new_base + TSS_ESI)?,
            self.cpu_read_u32(new_base + TSS_EDI)?,
        ];
        let new_es = self.cpu_read_u16(new_base + TSS_ES)?;
        let new_cs = self.cpu_read_u16(new_base + TSS_CS)?;
        let new_ss = self.cpu_read_u16(new_base + TSS_SS)?;
        let new_ds = self.cpu_read_u16(new_base + TSS_DS)?;
        let new_fs = self.cpu_read_u16(new_base + TSS_FS)?;
        let new_gs = self.cpu_read_u16(new_base + TSS_GS)?;
        let new_ldt = self.cpu_read_u16(new_base + TSS_LDT)?;

        if source == TaskSwitchSource::Gate {
            self.cpu_write_u16(new_base + TSS_BACK_LINK, link)?;
            new_flags |= 0x0000_4000; // NT in the incoming task
            self.set_tss_busy(selector, true)?;
        } else if source == TaskSwitchSource::Jump {
            self.set_tss_busy(selector, true)?;
        }

        self.protected_mode.tss = TaskRegister {
            selector,
            base: desc.base,
            limit: desc.limit,
            ty: desc.system_type(),
        };
        self.protected_mode.cr3 = new_cr3;
        self.regs = new_regs;
        self.flags.unpack_all(new_flags);
        self.eip = new_eip;

        self.load_ldt(new_ldt)?;
        if self.flags.v86 {
            for (seg, sel) in [
                (SEG_ES, new_es),
                (SEG_CS, new_cs),
                (SEG_SS, new_ss),
                (SEG_DS, new_ds),
                (SEG_FS, new_fs),
                (SEG_GS, new_gs),
            ] {
                self.segs[seg] = SegmentRegister::real_mode(sel);
            }
            self.protected_mode.cpl = 3;
        } else {
            self.protected_mode.cpl = (new_cs & 3) as u8;
            self.load_segment(SEG_CS, new_cs)?;
            self.load_segment(SEG_SS, new_ss)?;
            self.load_segment(SEG_ES, new_es)?;
            self.load_segment(SEG_DS, new_ds)?;
            self.load_segment(SEG_FS, new_fs)?;
            self.load_segment(SEG_GS, new_gs)?;
        }

        // A task switch always marks the FPU context as stale
        self.protected_mode.cr0 |= CR0_TS;
        Ok(())
    }

    /// Flip the busy bit (type 9 <-> B) in a TSS descriptor in the GDT
    fn set_tss_busy(&mut self, selector: u16, busy: bool) -> Result<(), Exception> {
        let addr = self.descriptor_addr(selector)?;
        let access = self.cpu_read(addr.wrapping_add(5))?;
        let access = if busy { access | 0x02 } else { access & !0x02 };
        self.cpu_write(addr.wrapping_add(5), access)
    }

    /// Load the LDT register from a selector (LLDT and task switches)
    pub(crate) fn load_ldt(&mut self, selector: u16) -> Result<(), Exception> {
        if selector & 0xFFFC == 0 {
            self.protected_mode.ldtr = LdtRegister {
                selector,
                base: 0,
                limit: 0,
            };
            return Ok(());
        }
        if selector & 0x4 != 0 {
            return Err(Exception::gp(selector & 0xFFFC));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_system() || desc.system_type() != 0x2 {
            return Err(Exception::gp(selector & 0xFFFC));
        }
        if !desc.present() {
            return Err(Exception::with_error(
                INT_SEGMENT_NOT_PRESENT,
                selector & 0xFFFC,
            ));
        }
        self.protected_mode.ldtr = LdtRegister {
            selector,
            base: desc.base,
            limit: desc.limit,
        };
        Ok(())
    }

    /// Load the task register from a selector (LTR)
    pub(crate) fn load_tr(&mut self, selector: u16) -> Result<(), Exception> {
        let err = selector & 0xFFFC;
        if err == 0 || selector & 0x4 != 0 {
            return Err(Exception::gp(err));
        }
        let desc = self.read_descriptor(selector)?;
        if !desc.is_system() || !matches!(desc.system_type(), 0x1 | 0x9) {
            return Err(Exception::gp(err));
        }
        if !desc.present() {
            return Err(Exception::with_error(INT_SEGMENT_NOT_PRESENT, err));
        }
        self.set_tss_busy(selector, true)?;
        self.protected_mode.tss = TaskRegister {
            selector,
            base: desc.base,
            limit: desc.limit,
            ty: desc.system_type() | 0x2,
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descriptor inspection instructions (LAR/LSL/VERR/VERW)
    // ------------------------------------------------------------------

    /// LAR: load access rights; returns None (ZF=0) for invalid selectors
    pub(crate) fn load_access_rights(&mut self, selector: u16) -> Option<u32> {
        let (_, high) = self.try_read_descriptor(selector)?;
        Some(high & 0x00FB_FF00)
    }

    /// LSL: load segment limit; returns None (ZF=0) for invalid selectors
    pub(crate) fn load_segment_limit(&mut self, selector: u16) -> Option<u32> {
        let (low, high) = self.try_read_descriptor(selector)?;
        Some(SegmentDescriptor::from_raw(low, high).limit)
    }

    /// VERR/VERW: verify a segment for reading or writing
    pub(crate) fn verify_segment(&mut self, selector: u16, for_write: bool) -> bool {
        let Some((_, high)) = self.try_read_descriptor(selector) else {
            return false;
        };
        let desc = SegmentDescriptor::from_raw(0, high);
        if desc.is_system() || !desc.present() {
            return false;
        }
        let rpl = (selector & 3) as u8;
        if !desc.is_conforming() && (rpl > desc.dpl() || self.protected_mode.cpl > desc.dpl()) {
            return false;
        }
        if for_write {
            // Writable data segment
            !desc.is_code() && desc.access & 0x02 != 0
        } else {
            // Any data segment, or readable code segment
            !desc.is_code() || desc.access & 0x02 != 0
        }
    }

    fn try_read_descriptor(&mut self, selector: u16) -> Option<(u32, u32)> {
        self.read_descriptor_raw(selector).ok()
    }
}
