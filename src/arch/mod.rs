//! Architecture backend: breakpoint instruction choice, stop-site decoding,
//! register snapshots and the callback-frame stack.
//!
//! Only the arch backend knows how a completed invocation or a runtime
//! notification looks at the instruction level, so the frame stack lives in
//! arch state and everything else talks to it through the [`Arch`] trait.

use std::sync::Mutex;

use crate::breakpoint::{BreakpointId, BreakpointManager, VirtualAddress};
use crate::errors::ServerResult;
use crate::runtime::{CodeChunk, RuntimeInfo};
use crate::server::Inferior;
use crate::trace::TracedProcess;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{BREAKPOINT_INSTRUCTION, RegisterSnapshot, X86Arch};

/// Verdict on what a stop at the current PC means.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopAction {
    /// Unhandled; hand the stop to the user.
    Stopped,
    /// The user-requested stop handshake completed.
    Interrupted,
    BreakpointHit {
        id: BreakpointId,
    },
    /// An invocation frame with a completion hook finished.
    Callback {
        arg: u64,
        data1: u64,
        data2: u64,
    },
    CallbackCompleted {
        arg: u64,
        data1: u64,
        data2: u64,
    },
    /// The runtime told us something through its notification trampoline, or
    /// a frame requested notification-style completion.
    Notification {
        arg: u64,
        data1: u64,
        data2: u64,
    },
    /// A frame marked as a runtime-invoke boundary finished.
    RtiDone {
        arg: u64,
        data1: u64,
        data2: u64,
    },
    InternalError,
}

/// Stage of an invocation frame; decides which message its completion turns
/// into.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameStage {
    /// Plain frame; completes as `CallbackCompleted`.
    Running,
    /// Frame with a debugger-side completion hook; completes as `Callback`.
    Completing,
    /// Completes as `Notification` (the stub signals a multi-step event).
    NotificationPending,
    /// Runtime-invoke boundary; completes as `RtiDone`.
    Rti,
}

/// Debugger-side hook run when a frame completes or is created.
pub type FrameHook = fn(&CallbackFrame);

/// Saved context for one in-inferior invocation.
pub struct CallbackFrame {
    pub saved_regs: RegisterSnapshot,
    /// PC the inferior will report when the stub's trailing trap fires.
    pub call_address: u64,
    /// Stack pointer at frame entry; used to find frames while unwinding.
    pub stack_pointer: u64,
    /// Opaque id chosen by the caller, echoed in the completion message.
    pub callback_arg: u64,
    pub stage: FrameStage,
    /// Arena chunk holding the stub; freed when the frame dies.
    pub chunk: Option<CodeChunk>,
    /// Address of the exception out-slot for runtime-invoke frames.
    pub exc_slot: Option<u64>,
    /// Bytes to advance the restored PC by (`execute_instruction` with
    /// `update_ip`).
    pub restore_ip_adjust: u64,
    pub pre_hook: Option<FrameHook>,
    pub post_hook: Option<FrameHook>,
}

/// Borrowed view of the controller state `child_stopped` needs to reach.
pub struct StopContext<'a> {
    pub trace: &'a TracedProcess,
    pub inferior: &'a mut Inferior,
    pub breakpoints: &'a Mutex<BreakpointManager>,
    pub runtime: Option<&'a RuntimeInfo>,
}

pub trait Arch {
    /// The software breakpoint instruction for this instruction set.
    fn breakpoint_instruction(&self) -> &'static [u8];

    /// The central decision point: given the signal that caused a stop,
    /// decode the architectural state at the stop site into a verdict.
    fn child_stopped(&mut self, ctx: &mut StopContext<'_>, stopsig: i32)
    -> ServerResult<StopAction>;

    /// Register snapshot taken at the last stop, if any.
    fn current_registers(&self) -> Option<&RegisterSnapshot>;
    fn set_current_registers(&mut self, regs: RegisterSnapshot);

    /// Save the register file and carve out scratch stack below the red zone.
    /// Returns the adjusted stack pointer.
    fn push_registers(&mut self, trace: &TracedProcess) -> ServerResult<u64>;
    /// Restore the most recently pushed register file bit-for-bit.
    fn pop_registers(&mut self, trace: &TracedProcess) -> ServerResult<()>;

    fn push_frame(&mut self, frame: CallbackFrame);
    fn pop_frame(&mut self) -> Option<CallbackFrame>;
    fn top_frame(&self) -> Option<&CallbackFrame>;
    fn top_frame_mut(&mut self) -> Option<&mut CallbackFrame>;
    fn frame_depth(&self) -> usize;
    /// Find the innermost frame whose entry stack pointer sits above the
    /// given one (i.e. the frame a stack walk starting at `sp` runs into).
    fn find_frame_below(&self, sp: u64) -> Option<&CallbackFrame>;
    fn contains_frame(&self, callback_arg: u64) -> bool;
    /// Consumed by the invocation engine after `child_stopped` reported a
    /// frame completion.
    fn take_frame_completed(&mut self) -> bool;

    /// Arm a hardware breakpoint; returns the slot index or fails with
    /// `InternalError` when no slot is free.
    fn insert_hw_breakpoint(
        &mut self,
        trace: &TracedProcess,
        addr: VirtualAddress,
    ) -> ServerResult<u32>;
    fn remove_hw_breakpoint(&mut self, trace: &TracedProcess, slot: u32) -> ServerResult<()>;

    /// Assemble a stub that loads `args` into the argument registers, calls
    /// `entry` and traps. Returns the bytes and the PC expected at the trap
    /// (relative to the stub base).
    fn assemble_call(&self, entry: u64, args: &[u64]) -> (Vec<u8>, u64);
    /// Assemble a stub that executes `insn` in place and traps.
    fn assemble_insn(&self, insn: &[u8]) -> (Vec<u8>, u64);
}

/// Construct the arch backend for the compilation target.
#[cfg(target_arch = "x86_64")]
pub fn initialize() -> Box<dyn Arch + Send> {
    Box::new(X86Arch::new())
}
