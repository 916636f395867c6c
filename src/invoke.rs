//! In-inferior invocation engine.
//!
//! Executes runtime entry points inside the inferior by writing a small stub
//! into the executable-code arena, hijacking the PC, and catching the
//! trailing trap. Saved contexts form a stack, so invocations nest to
//! arbitrary depth.

use tracing::trace;

use crate::arch::{CallbackFrame, FrameStage, RegisterSnapshot};
use crate::errors::{ServerCommandError, ServerResult};
use crate::message::MessageKind;
use crate::server::{InferiorState, Server};

/// One argument slot of an invocation stub.
enum InvokeArg<'a> {
    Word(u64),
    /// UTF-8 + NUL copied into the stub's data area; the argument register
    /// receives its address.
    Str(&'a str),
    /// Zeroed out-slot in the data area for the exception reference; the
    /// argument register receives its address.
    ExcSlot,
}

impl Server {
    /// Execute `entry(callback_id)`-style zero-argument entry points.
    pub fn call_method(&mut self, entry: u64, callback_arg: u64) -> ServerResult<()> {
        self.begin_invoke(entry, &[], callback_arg)
    }

    pub fn call_method_1(&mut self, entry: u64, arg1: u64, callback_arg: u64) -> ServerResult<()> {
        self.begin_invoke(entry, &[InvokeArg::Word(arg1)], callback_arg)
    }

    pub fn call_method_2(
        &mut self,
        entry: u64,
        arg1: u64,
        arg2: u64,
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.begin_invoke(
            entry,
            &[InvokeArg::Word(arg1), InvokeArg::Word(arg2)],
            callback_arg,
        )
    }

    pub fn call_method_3(
        &mut self,
        entry: u64,
        arg1: u64,
        arg2: u64,
        arg3: u64,
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.begin_invoke(
            entry,
            &[
                InvokeArg::Word(arg1),
                InvokeArg::Word(arg2),
                InvokeArg::Word(arg3),
            ],
            callback_arg,
        )
    }

    /// Entry points taking two words and a string (method descriptors, class
    /// names, assembly paths). The string lives in the stub's data area.
    pub fn call_method_string(
        &mut self,
        entry: u64,
        arg1: u64,
        arg2: u64,
        text: &str,
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.begin_invoke(
            entry,
            &[
                InvokeArg::Word(arg1),
                InvokeArg::Word(arg2),
                InvokeArg::Str(text),
            ],
            callback_arg,
        )
    }

    /// Runtime-invoke: `invoke(method, obj, params, &exc)`. The exception
    /// out-slot is read back when the frame completes.
    pub fn call_method_invoke(
        &mut self,
        entry: u64,
        method: u64,
        object: u64,
        params: u64,
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.begin_invoke(
            entry,
            &[
                InvokeArg::Word(method),
                InvokeArg::Word(object),
                InvokeArg::Word(params),
                InvokeArg::ExcSlot,
            ],
            callback_arg,
        )
    }

    /// Execute one instruction remotely. With `update_ip` the restored PC
    /// advances past the instruction, as if it had run in place.
    pub fn execute_instruction(
        &mut self,
        insn: &[u8],
        update_ip: bool,
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;

        let (code, trap_pc) = self.arch.assemble_insn(insn);
        let chunk = self.allocate_chunk(code.len())?;
        if let Err(e) = traced.write_memory(chunk.address, &code) {
            self.free_chunk(chunk);
            return Err(e);
        }

        let saved = RegisterSnapshot::new(traced.get_registers()?);
        if let Err(e) = self.redirect_to(chunk.address, saved) {
            self.free_chunk(chunk);
            return Err(e);
        }

        self.arch.push_frame(CallbackFrame {
            saved_regs: saved,
            call_address: chunk.address + trap_pc,
            stack_pointer: saved.stack_pointer(),
            callback_arg,
            stage: FrameStage::Running,
            chunk: Some(chunk),
            exc_slot: None,
            restore_ip_adjust: if update_ip { insn.len() as u64 } else { 0 },
            pre_hook: None,
            post_hook: None,
        });
        self.resume_for_invoke()
    }

    /// Flag the innermost frame as a runtime-invoke boundary so completion
    /// reports `RuntimeInvokeDone`.
    pub fn mark_rti_frame(&mut self) -> ServerResult<()> {
        let frame = self
            .arch
            .top_frame_mut()
            .ok_or(ServerCommandError::InternalError)?;
        frame.stage = FrameStage::Rti;
        Ok(())
    }

    /// Ask that the innermost frame's completion surface as a notification
    /// instead of `CallbackCompleted`.
    pub fn request_notification_completion(&mut self) -> ServerResult<()> {
        let frame = self
            .arch
            .top_frame_mut()
            .ok_or(ServerCommandError::InternalError)?;
        frame.stage = FrameStage::NotificationPending;
        Ok(())
    }

    /// Unwind to and including the frame with the given callback id without
    /// running its completion.
    pub fn abort_invoke(&mut self, callback_arg: u64) -> ServerResult<()> {
        if !self.arch.contains_frame(callback_arg) {
            return Err(ServerCommandError::InternalError);
        }
        let traced = self.trace_handle()?;

        loop {
            let frame = self.arch.pop_frame().expect("frame presence checked");
            if let Some(chunk) = frame.chunk {
                self.free_chunk(chunk);
            }
            if frame.callback_arg == callback_arg {
                traced.set_registers(frame.saved_regs.regs)?;
                self.arch.set_current_registers(frame.saved_regs);
                self.inferior.state = InferiorState::Stopped;
                trace!(callback_arg, "aborted invocation");
                return Ok(());
            }
        }
    }

    /// Finish the innermost frame after its trap fired: read the exception
    /// out-slot, restore registers, release the stub chunk. Returns the two
    /// result words for the completion message.
    pub(crate) fn complete_top_frame(&mut self) -> ServerResult<(u64, u64)> {
        let traced = self.trace_handle()?;
        let frame = self
            .arch
            .pop_frame()
            .expect("frame completion reported without a frame");

        let (result, second_word) = self
            .arch
            .current_registers()
            .map(|r| r.result_words())
            .unwrap_or((0, 0));
        let data2 = match frame.exc_slot {
            Some(slot) => traced.peek_word(slot)?,
            None => second_word,
        };

        let mut regs = frame.saved_regs;
        if frame.restore_ip_adjust != 0 {
            regs.set_pc(regs.pc() + frame.restore_ip_adjust);
        }
        traced.set_registers(regs.regs)?;
        self.arch.set_current_registers(regs);

        if let Some(chunk) = frame.chunk {
            self.free_chunk(chunk);
        }
        if let Some(hook) = frame.post_hook {
            hook(&frame);
        }

        trace!(callback_arg = frame.callback_arg, "invocation completed");
        Ok((result, data2))
    }

    /// Synchronous driver: resume until the invocation with this callback id
    /// completes, handing back its result words. Unrelated stops are resumed
    /// past; a terminal event is an internal error.
    pub fn wait_for_callback(&mut self, callback_arg: u64) -> ServerResult<(u64, u64)> {
        loop {
            let status = self.wait_for_event()?;
            let msg = self.dispatch_event(status);
            match msg.kind {
                MessageKind::ChildCallbackCompleted
                | MessageKind::ChildCallback
                | MessageKind::RuntimeInvokeDone
                    if msg.arg == callback_arg =>
                {
                    return Ok((msg.data1, msg.data2));
                }
                MessageKind::ChildExited
                | MessageKind::ChildSignaled
                | MessageKind::InternalError
                | MessageKind::UnknownError => {
                    return Err(ServerCommandError::InternalError);
                }
                other => {
                    trace!(kind = %other, "event while waiting for invocation result");
                    self.resume()?;
                }
            }
        }
    }

    fn begin_invoke(
        &mut self,
        entry: u64,
        args: &[InvokeArg<'_>],
        callback_arg: u64,
    ) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;

        // Stub length only depends on the argument count, so a dry run pins
        // down where the data area starts.
        let placeholder: Vec<u64> = vec![0; args.len()];
        let (dry, _) = self.arch.assemble_call(entry, &placeholder);
        let code_len = dry.len();

        let mut data = Vec::new();
        let mut exc_slot = None;
        let chunk = self.allocate_chunk(code_len)?;
        let data_base = chunk.address + code_len as u64;

        let mut words = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                InvokeArg::Word(w) => words.push(*w),
                InvokeArg::Str(s) => {
                    words.push(data_base + data.len() as u64);
                    data.extend_from_slice(s.as_bytes());
                    data.push(0);
                }
                InvokeArg::ExcSlot => {
                    let slot = data_base + data.len() as u64;
                    words.push(slot);
                    data.extend_from_slice(&0u64.to_le_bytes());
                    exc_slot = Some(slot);
                }
            }
        }

        let (code, trap_pc) = self.arch.assemble_call(entry, &words);
        debug_assert_eq!(code.len(), code_len);

        if code.len() + data.len() > chunk.size as usize {
            self.free_chunk(chunk);
            return Err(ServerCommandError::InternalError);
        }

        let mut stub = code;
        stub.extend_from_slice(&data);
        if let Err(e) = traced.write_memory(chunk.address, &stub) {
            self.free_chunk(chunk);
            return Err(e);
        }

        let saved = RegisterSnapshot::new(traced.get_registers()?);
        if let Err(e) = self.redirect_to(chunk.address, saved) {
            self.free_chunk(chunk);
            return Err(e);
        }

        self.arch.push_frame(CallbackFrame {
            saved_regs: saved,
            call_address: chunk.address + trap_pc,
            stack_pointer: saved.stack_pointer(),
            callback_arg,
            stage: FrameStage::Running,
            chunk: Some(chunk),
            exc_slot,
            restore_ip_adjust: 0,
            pre_hook: None,
            post_hook: None,
        });
        self.resume_for_invoke()
    }

    fn free_chunk(&mut self, chunk: crate::runtime::CodeChunk) {
        if let Some(runtime) = self.runtime.as_mut() {
            runtime.executable_code.free(chunk);
        }
    }

    fn allocate_chunk(&mut self, min_len: usize) -> ServerResult<crate::runtime::CodeChunk> {
        let runtime = self
            .runtime
            .as_mut()
            .ok_or(ServerCommandError::InternalError)?;
        if min_len > runtime.executable_code.chunk_size() as usize {
            return Err(ServerCommandError::InternalError);
        }
        runtime
            .executable_code
            .allocate()
            .ok_or(ServerCommandError::InternalError)
    }

    /// Point the PC at the stub, with a fresh 16-byte-aligned stack below the
    /// red zone.
    fn redirect_to(&mut self, stub_address: u64, saved: RegisterSnapshot) -> ServerResult<()> {
        let traced = self.trace_handle()?;
        let mut regs = saved;
        regs.set_pc(stub_address);
        regs.set_stack_pointer((regs.stack_pointer() - 256) & !0xf);
        traced.set_registers(regs.regs)?;
        self.arch.set_current_registers(regs);
        Ok(())
    }

    fn resume_for_invoke(&mut self) -> ServerResult<()> {
        let traced = self.trace_handle()?;
        traced.cont(None)?;
        self.inferior.state = InferiorState::Running;
        self.inferior.wants_to_run = true;
        Ok(())
    }
}
