use libc::{user, user_regs_struct};
use memoffset::offset_of;
use nix::sys::signal::Signal;
use tracing::trace;

use crate::arch::{Arch, CallbackFrame, FrameStage, StopAction, StopContext};
use crate::breakpoint::VirtualAddress;
use crate::errors::{ServerCommandError, ServerResult};
use crate::trace::TracedProcess;

/// `int3`.
pub const BREAKPOINT_INSTRUCTION: [u8; 1] = [0xCC];

/// Bytes the ABI guarantees below the stack pointer; skipped before any
/// injected call so leaf-function locals survive the invocation.
const RED_ZONE_SIZE: u64 = 128;

/// Number of address debug registers (DR0..DR3).
const DEBUG_REG_SLOTS: usize = 4;

/// Snapshot of the general-purpose register file at a stop.
#[derive(Clone, Copy)]
pub struct RegisterSnapshot {
    pub regs: user_regs_struct,
}

impl RegisterSnapshot {
    pub fn new(regs: user_regs_struct) -> Self {
        Self { regs }
    }

    pub fn pc(&self) -> u64 {
        self.regs.rip
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.regs.rip = pc;
    }

    pub fn stack_pointer(&self) -> u64 {
        self.regs.rsp
    }

    pub fn set_stack_pointer(&mut self, sp: u64) {
        self.regs.rsp = sp;
    }

    pub fn frame_pointer(&self) -> u64 {
        self.regs.rbp
    }

    /// Up to two result words of a completed call.
    pub fn result_words(&self) -> (u64, u64) {
        (self.regs.rax, self.regs.rdx)
    }

    /// The three words the notification trampoline was called with.
    pub fn notification_args(&self) -> (u64, u64, u64) {
        (self.regs.rdi, self.regs.rsi, self.regs.rdx)
    }

    /// Byte view, for bit-for-bit comparisons.
    pub fn as_bytes(&self) -> &[u8] {
        let len = size_of::<user_regs_struct>();
        // SAFETY: plain-data struct reinterpreted as bytes for comparison only.
        unsafe { std::slice::from_raw_parts((&self.regs as *const user_regs_struct).cast(), len) }
    }
}

impl PartialEq for RegisterSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

/// Argument registers in SysV order, as `mov r64, imm64` opcode bytes
/// following the REX.W prefix.
const ARG_MOV_OPCODES: [u8; 4] = [
    0xBF, // rdi
    0xBE, // rsi
    0xBA, // rdx
    0xB9, // rcx
];

fn debug_reg_offset(index: usize) -> usize {
    offset_of!(user, u_debugreg) + index * size_of::<u64>()
}

pub struct X86Arch {
    /// Registers at the most recent stop.
    current: Option<RegisterSnapshot>,
    /// Stack for the explicit push/pop register commands.
    pushed_regs: Vec<RegisterSnapshot>,
    /// Invocation frames, innermost last.
    frames: Vec<CallbackFrame>,
    /// Armed hardware breakpoint addresses, by debug register slot.
    hw_slots: [Option<u64>; DEBUG_REG_SLOTS],
    frame_completed: bool,
}

impl X86Arch {
    pub fn new() -> Self {
        Self {
            current: None,
            pushed_regs: Vec::new(),
            frames: Vec::new(),
            hw_slots: [None; DEBUG_REG_SLOTS],
            frame_completed: false,
        }
    }

    /// Which armed slot, if any, fired according to DR6.
    fn triggered_hw_slot(&self, trace: &TracedProcess) -> ServerResult<Option<usize>> {
        let dr6 = trace.read_user_word(debug_reg_offset(6))?;
        for (slot, armed) in self.hw_slots.iter().enumerate() {
            if armed.is_some() && dr6 & (1 << slot) != 0 {
                // Reset the status bits so the next trap reads clean.
                trace.write_user_word(debug_reg_offset(6), 0)?;
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }
}

impl Arch for X86Arch {
    fn breakpoint_instruction(&self) -> &'static [u8] {
        &BREAKPOINT_INSTRUCTION
    }

    fn child_stopped(
        &mut self,
        ctx: &mut StopContext<'_>,
        stopsig: i32,
    ) -> ServerResult<StopAction> {
        let mut regs = RegisterSnapshot::new(ctx.trace.get_registers()?);
        self.current = Some(regs);

        if stopsig == Signal::SIGSTOP as i32 && ctx.inferior.interrupt_requested {
            ctx.inferior.interrupt_requested = false;
            return Ok(StopAction::Interrupted);
        }

        if stopsig != 0 && stopsig != Signal::SIGTRAP as i32 {
            return Ok(StopAction::Stopped);
        }

        let pc = regs.pc();

        // Did the trailing trap of the innermost invocation stub fire?
        if let Some(frame) = self.frames.last() {
            if pc == frame.call_address {
                let (data1, data2) = regs.result_words();
                let arg = frame.callback_arg;
                self.frame_completed = true;
                return Ok(match frame.stage {
                    FrameStage::Rti => StopAction::RtiDone { arg, data1, data2 },
                    FrameStage::NotificationPending => {
                        StopAction::Notification { arg, data1, data2 }
                    }
                    FrameStage::Completing => StopAction::Callback { arg, data1, data2 },
                    FrameStage::Running => StopAction::CallbackCompleted { arg, data1, data2 },
                });
            }
        }

        // The managed runtime's notification trampoline traps one byte in.
        if let Some(runtime) = ctx.runtime {
            if pc.wrapping_sub(1) == runtime.notification_address {
                let (arg, data1, data2) = regs.notification_args();
                return Ok(StopAction::Notification { arg, data1, data2 });
            }
        }

        // Software breakpoint: int3 leaves the PC one past the patched byte.
        let bp_addr = VirtualAddress::new(pc.wrapping_sub(1));
        let software_hit = ctx
            .breakpoints
            .lock()
            .unwrap()
            .enabled_software_at(bp_addr)
            .map(|bp| bp.id());
        if let Some(id) = software_hit {
            regs.set_pc(bp_addr.addr());
            ctx.trace.set_registers(regs.regs)?;
            self.current = Some(regs);
            trace!(pid = %ctx.trace.pid(), ?id, addr = %bp_addr, "software breakpoint");
            return Ok(StopAction::BreakpointHit { id });
        }

        // Hardware breakpoint: the trap reports the PC unadjusted.
        if let Some(slot) = self.triggered_hw_slot(ctx.trace)? {
            let armed = self.hw_slots[slot].expect("triggered slot is armed");
            let hw_hit = ctx
                .breakpoints
                .lock()
                .unwrap()
                .enabled_hardware_at(VirtualAddress::new(armed))
                .map(|bp| bp.id());
            if let Some(id) = hw_hit {
                return Ok(StopAction::BreakpointHit { id });
            }
        }

        Ok(StopAction::Stopped)
    }

    fn current_registers(&self) -> Option<&RegisterSnapshot> {
        self.current.as_ref()
    }

    fn set_current_registers(&mut self, regs: RegisterSnapshot) {
        self.current = Some(regs);
    }

    fn push_registers(&mut self, trace: &TracedProcess) -> ServerResult<u64> {
        let regs = trace.get_registers()?;
        self.pushed_regs.push(RegisterSnapshot::new(regs));

        let mut scratch = regs;
        scratch.rsp = (scratch.rsp - RED_ZONE_SIZE) & !0xf;
        trace.set_registers(scratch)?;
        self.current = Some(RegisterSnapshot::new(scratch));
        Ok(scratch.rsp)
    }

    fn pop_registers(&mut self, trace: &TracedProcess) -> ServerResult<()> {
        let snapshot = self
            .pushed_regs
            .pop()
            .expect("pop_registers without a matching push");
        trace.set_registers(snapshot.regs)?;
        self.current = Some(snapshot);
        Ok(())
    }

    fn push_frame(&mut self, frame: CallbackFrame) {
        if let Some(hook) = frame.pre_hook {
            hook(&frame);
        }
        self.frames.push(frame);
    }

    fn pop_frame(&mut self) -> Option<CallbackFrame> {
        self.frames.pop()
    }

    fn top_frame(&self) -> Option<&CallbackFrame> {
        self.frames.last()
    }

    fn top_frame_mut(&mut self) -> Option<&mut CallbackFrame> {
        self.frames.last_mut()
    }

    fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    fn find_frame_below(&self, sp: u64) -> Option<&CallbackFrame> {
        self.frames.iter().rev().find(|f| f.stack_pointer > sp)
    }

    fn contains_frame(&self, callback_arg: u64) -> bool {
        self.frames.iter().any(|f| f.callback_arg == callback_arg)
    }

    fn take_frame_completed(&mut self) -> bool {
        std::mem::take(&mut self.frame_completed)
    }

    fn insert_hw_breakpoint(
        &mut self,
        trace: &TracedProcess,
        addr: VirtualAddress,
    ) -> ServerResult<u32> {
        let slot = self
            .hw_slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(ServerCommandError::InternalError)?;

        trace.write_user_word(debug_reg_offset(slot), addr.addr())?;

        let mut dr7 = trace.read_user_word(debug_reg_offset(7))?;
        dr7 |= 1 << (slot * 2); // local enable
        dr7 &= !(0b1111u64 << (16 + slot * 4)); // break on execution, length 1
        trace.write_user_word(debug_reg_offset(7), dr7)?;

        self.hw_slots[slot] = Some(addr.addr());
        Ok(slot as u32)
    }

    fn remove_hw_breakpoint(&mut self, trace: &TracedProcess, slot: u32) -> ServerResult<()> {
        let slot = slot as usize;
        if slot >= DEBUG_REG_SLOTS || self.hw_slots[slot].is_none() {
            return Err(ServerCommandError::InternalError);
        }

        let mut dr7 = trace.read_user_word(debug_reg_offset(7))?;
        dr7 &= !(1u64 << (slot * 2));
        trace.write_user_word(debug_reg_offset(7), dr7)?;
        trace.write_user_word(debug_reg_offset(slot), 0)?;

        self.hw_slots[slot] = None;
        Ok(())
    }

    fn assemble_call(&self, entry: u64, args: &[u64]) -> (Vec<u8>, u64) {
        assert!(args.len() <= ARG_MOV_OPCODES.len(), "too many stub arguments");

        let mut code = Vec::with_capacity(args.len() * 10 + 13);
        for (opcode, arg) in ARG_MOV_OPCODES.iter().zip(args) {
            code.push(0x48); // REX.W
            code.push(*opcode);
            code.extend_from_slice(&arg.to_le_bytes());
        }
        code.push(0x48); // mov rax, entry
        code.push(0xB8);
        code.extend_from_slice(&entry.to_le_bytes());
        code.push(0xFF); // call rax
        code.push(0xD0);
        code.push(0xCC); // int3

        let trap_pc = code.len() as u64;
        (code, trap_pc)
    }

    fn assemble_insn(&self, insn: &[u8]) -> (Vec<u8>, u64) {
        let mut code = Vec::with_capacity(insn.len() + 1);
        code.extend_from_slice(insn);
        code.push(0xCC);
        (code, insn.len() as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_stub_loads_arguments_then_traps() {
        let arch = X86Arch::new();
        let (code, trap_pc) = arch.assemble_call(0x1122334455667788, &[0xAA, 0xBB]);

        // mov rdi / mov rsi / mov rax / call rax / int3
        assert_eq!(&code[0..2], &[0x48, 0xBF]);
        assert_eq!(&code[10..12], &[0x48, 0xBE]);
        assert_eq!(&code[20..22], &[0x48, 0xB8]);
        assert_eq!(&code[22..30], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&code[30..32], &[0xFF, 0xD0]);
        assert_eq!(*code.last().unwrap(), 0xCC);
        // PC after the trap executed is one past the int3 byte.
        assert_eq!(trap_pc, code.len() as u64);
    }

    #[test]
    fn insn_stub_appends_trap() {
        let arch = X86Arch::new();
        let (code, trap_pc) = arch.assemble_insn(&[0x90, 0x90]);
        assert_eq!(code, vec![0x90, 0x90, 0xCC]);
        assert_eq!(trap_pc, 3);
    }
}
