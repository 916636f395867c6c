//! Per-inferior controller: owns the trace handle, the arch state and a share
//! of the breakpoint table, and drives the running/stopped state machine.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid, chdir, dup2_stderr, dup2_stdout, execv, execve, fork, pipe, setsid};
use strum::Display;
use tracing::{trace, warn};

use crate::arch::{self, Arch, RegisterSnapshot, StopAction, StopContext};
use crate::breakpoint::{BreakpointId, BreakpointKind, BreakpointManager, VirtualAddress};
use crate::dispatch;
use crate::errors::{ServerCommandError, ServerResult};
use crate::message::StatusMessage;
use crate::runtime::RuntimeInfo;
use crate::trace::TracedProcess;

pub mod io_worker;

pub use io_worker::ChildOutput;

/// Bound on the waits that expect a specific stop to arrive shortly
/// (spawn/attach/fork handshakes). Exceeding it is an internal error.
const WAIT_ATTEMPTS: u32 = 5000;
const WAIT_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum InferiorState {
    /// Controller exists but no process is traced yet.
    New,
    Running,
    Stopped,
    Exited,
    Signaled,
    Detached,
}

/// The controller's view of one traced process or thread.
pub struct Inferior {
    pub tid: u64,
    pub is_thread: bool,
    /// Signal delivered at the last stop; forwarded on the next resume unless
    /// the stop was consumed internally. Zero means swallowed.
    pub last_signal: i32,
    /// Resume as single-step instead of continue.
    pub stepping: bool,
    pub redirect_fds: bool,
    /// Set by `stop`; makes the next SIGSTOP read as the interrupt handshake.
    pub interrupt_requested: bool,
    /// Hint that a resume was requested and the stop is transient.
    pub wants_to_run: bool,
    pub state: InferiorState,
}

impl Inferior {
    fn new() -> Self {
        Self {
            tid: 0,
            is_thread: false,
            last_signal: 0,
            stepping: false,
            redirect_fds: false,
            interrupt_requested: false,
            wants_to_run: false,
            state: InferiorState::New,
        }
    }
}

/// What kind of backend this is; the frontend keys protocol quirks off it.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ServerType {
    LinuxPtrace,
}

pub const CAPABILITY_THREAD_EVENTS: u32 = 1 << 0;
pub const CAPABILITY_CAN_DETACH: u32 = 1 << 1;
pub const CAPABILITY_HAS_SIGNALS: u32 = 1 << 2;

/// Word sizes and byte order of the traced target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetInfo {
    pub int_size: u32,
    pub long_size: u32,
    pub address_size: u32,
    pub is_bigendian: bool,
}

/// Signal numbers the frontend needs to interpret events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignalInfo {
    pub sigkill: i32,
    pub sigstop: i32,
    pub sigint: i32,
    pub sigchld: i32,
    pub sigfpe: i32,
    pub sigquit: i32,
    pub sigabrt: i32,
    pub sigsegv: i32,
    pub sigill: i32,
    pub sigbus: i32,
    pub sigwinch: i32,
    pub kernel_sigrtmin: i32,
    pub thread_abort: i32,
}

/// PC/SP/FP triple at the current stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackFrame {
    pub address: u64,
    pub stack_pointer: u64,
    pub frame_address: u64,
}

/// Exe path, working directory and command line of the inferior.
#[derive(Clone, Debug)]
pub struct ApplicationInfo {
    pub executable: PathBuf,
    pub cwd: PathBuf,
    pub cmdline: Vec<String>,
}

/// View of an invocation frame handed to the frontend.
#[derive(Clone)]
pub struct CallbackFrameInfo {
    pub callback_arg: u64,
    pub call_address: u64,
    pub stack_pointer: u64,
    pub saved_registers: RegisterSnapshot,
}

/// One-time process-wide setup.
pub fn global_init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        trace!("trace backend initialized");
    });
}

pub struct Server {
    traced: Option<TracedProcess>,
    pub(crate) arch: Box<dyn Arch + Send>,
    breakpoints: Arc<Mutex<BreakpointManager>>,
    pub(crate) inferior: Inferior,
    pub(crate) runtime: Option<RuntimeInfo>,
    /// Event consumed internally (initial trap, death during a hidden step)
    /// to be handed out on the next wait.
    pending_status: Option<WaitStatus>,
    /// Breakpoint unpatched for a user-level single step; re-armed at the
    /// next stop.
    pending_rearm: Option<BreakpointId>,
    io_receiver: Option<Receiver<ChildOutput>>,
    io_shutdown: Option<crossbeam_channel::Sender<()>>,
    io_thread: Option<JoinHandle<()>>,
}

impl Server {
    /// Create a controller sharing `breakpoints` with the other threads of
    /// the same address space.
    pub fn new(breakpoints: Arc<Mutex<BreakpointManager>>) -> Self {
        Self {
            traced: None,
            arch: arch::initialize(),
            breakpoints,
            inferior: Inferior::new(),
            runtime: None,
            pending_status: None,
            pending_rearm: None,
            io_receiver: None,
            io_shutdown: None,
            io_thread: None,
        }
    }

    /// Convenience constructor owning a fresh breakpoint table.
    pub fn create() -> Self {
        let insn = arch::initialize().breakpoint_instruction().to_vec();
        Self::new(Arc::new(Mutex::new(BreakpointManager::new(insn))))
    }

    pub fn breakpoints(&self) -> &Mutex<BreakpointManager> {
        &self.breakpoints
    }

    pub fn share_breakpoints(&self) -> Arc<Mutex<BreakpointManager>> {
        Arc::clone(&self.breakpoints)
    }

    pub fn trace_handle(&self) -> ServerResult<TracedProcess> {
        self.traced.ok_or(ServerCommandError::UnknownError)
    }

    pub fn pid(&self) -> Option<Pid> {
        self.traced.map(|t| t.pid())
    }

    pub fn state(&self) -> InferiorState {
        self.inferior.state
    }

    pub fn set_stepping(&mut self, stepping: bool) {
        self.inferior.stepping = stepping;
    }

    pub fn set_runtime_info(&mut self, runtime: RuntimeInfo) {
        self.runtime = Some(runtime);
    }

    pub fn runtime_info(&self) -> Option<&RuntimeInfo> {
        self.runtime.as_ref()
    }

    pub fn runtime_info_mut(&mut self) -> Option<&mut RuntimeInfo> {
        self.runtime.as_mut()
    }

    pub(crate) fn require_stopped(&self) -> ServerResult<()> {
        if self.inferior.state != InferiorState::Stopped {
            return Err(ServerCommandError::NotStopped);
        }
        Ok(())
    }

    /// Fork and exec the target, tracing it from the first instruction.
    ///
    /// The child reports exec failure over a synchronization pipe: a nonzero
    /// length word followed by the message. A zero-length read means exec
    /// succeeded and the initial trap is on its way.
    pub fn spawn(
        &mut self,
        working_dir: Option<&Path>,
        argv: &[String],
        envp: &[String],
        redirect_fds: bool,
    ) -> ServerResult<Pid> {
        if argv.is_empty() {
            return Err(ServerCommandError::cannot_start("empty argv"));
        }

        let filename = CString::new(argv[0].as_bytes())
            .map_err(|_| ServerCommandError::cannot_start("argv[0] contains NUL"))?;
        let c_argv: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|_| ServerCommandError::cannot_start("argv contains NUL"))?;
        let c_envp: Vec<CString> = envp
            .iter()
            .map(|e| CString::new(e.as_bytes()))
            .collect::<Result<_, _>>()
            .map_err(|_| ServerCommandError::cannot_start("envp contains NUL"))?;

        let io_pipes = if redirect_fds {
            let stdout = pipe().map_err(|e| ServerCommandError::cannot_start(e.to_string()))?;
            let stderr = pipe().map_err(|e| ServerCommandError::cannot_start(e.to_string()))?;
            Some((stdout, stderr))
        } else {
            None
        };
        let (sync_read, sync_write) =
            pipe().map_err(|e| ServerCommandError::cannot_start(e.to_string()))?;

        self.inferior.redirect_fds = redirect_fds;

        match unsafe { fork() }.map_err(|e| ServerCommandError::cannot_start(e.to_string()))? {
            ForkResult::Child => {
                let out_err = io_pipes
                    .as_ref()
                    .map(|((_, out_w), (_, err_w))| (out_w, err_w));
                spawn_child(working_dir, &filename, &c_argv, &c_envp, out_err, sync_write)
            }
            ForkResult::Parent { child } => {
                drop(sync_write);
                let io_read_ends = io_pipes.map(|((out_r, out_w), (err_r, err_w))| {
                    drop(out_w);
                    drop(err_w);
                    (out_r, err_r)
                });

                if let Some(message) = read_exec_error(sync_read) {
                    return Err(ServerCommandError::CannotStartTarget { message });
                }

                let traced = TracedProcess::new(child);
                self.traced = Some(traced);
                self.wait_for_new_thread()?;
                self.setup_inferior()?;

                if let Some((out_r, err_r)) = io_read_ends {
                    self.start_io_worker(out_r, err_r);
                }

                trace!(pid = %child, "spawned inferior");
                Ok(child)
            }
        }
    }

    /// Attach to a process that is already running.
    pub fn attach(&mut self, pid: Pid) -> ServerResult<()> {
        let traced = TracedProcess::attach(pid)?;
        self.traced = Some(traced);
        self.inferior.is_thread = true;
        self.wait_for_new_thread()?;
        self.setup_inferior()?;
        trace!(%pid, "attached to inferior");
        Ok(())
    }

    /// Re-run process setup (trace options, breakpoint re-insertion) for an
    /// inferior that is already stopped under our control.
    pub fn initialize_process(&mut self) -> ServerResult<()> {
        self.require_stopped()?;
        self.setup_inferior()
    }

    /// Adopt a thread reported through a clone event.
    pub fn initialize_thread(&mut self, pid: Pid, wait: bool) -> ServerResult<()> {
        self.traced = Some(TracedProcess::new(pid));
        self.inferior.is_thread = true;
        self.inferior.tid = pid.as_raw() as u64;
        if wait {
            self.wait_for_new_thread()?;
        } else {
            self.inferior.state = InferiorState::Stopped;
        }
        self.setup_inferior()
    }

    /// Bounded wait for the initial stop of a freshly traced process.
    fn wait_for_new_thread(&mut self) -> ServerResult<()> {
        let traced = self.trace_handle()?;
        for _ in 0..WAIT_ATTEMPTS {
            if let Some(status) = traced.try_wait()? {
                self.pending_status = Some(status);
                self.inferior.state = InferiorState::Stopped;
                return Ok(());
            }
            thread::sleep(WAIT_INTERVAL);
        }
        warn!(pid = ?traced.pid(), "timed out waiting for the initial stop");
        Err(ServerCommandError::InternalError)
    }

    /// Common setup once the inferior reported its first stop.
    fn setup_inferior(&mut self) -> ServerResult<()> {
        let traced = self.trace_handle()?;
        traced.set_trace_options()?;
        // Bookkeeping survives re-execution: entries inserted before this
        // address space existed are re-read and re-patched.
        self.breakpoints.lock().unwrap().reinsert_all(&traced)?;
        let regs = traced.get_registers()?;
        self.arch.set_current_registers(RegisterSnapshot::new(regs));
        Ok(())
    }

    fn start_io_worker(&mut self, stdout: OwnedFd, stderr: OwnedFd) {
        let (tx, rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        let handle = thread::spawn(move || {
            io_worker::forward_child_output(stdout, stderr, tx, shutdown_rx);
        });
        self.io_receiver = Some(rx);
        self.io_shutdown = Some(shutdown_tx);
        self.io_thread = Some(handle);
    }

    /// Stream of redirected stdout/stderr chunks, when spawned with
    /// redirection.
    pub fn output_channel(&self) -> Option<&Receiver<ChildOutput>> {
        self.io_receiver.as_ref()
    }

    fn take_resume_signal(&mut self) -> Option<Signal> {
        let sig = std::mem::take(&mut self.inferior.last_signal);
        if sig == 0 {
            return None;
        }
        Signal::try_from(sig).ok()
    }

    pub fn program_counter(&self) -> ServerResult<u64> {
        let regs = self.trace_handle()?.get_registers()?;
        Ok(RegisterSnapshot::new(regs).pc())
    }

    /// Resume as `step` or `continue` depending on the stepping flag.
    pub fn resume(&mut self) -> ServerResult<()> {
        if self.inferior.stepping { self.step() } else { self.cont() }
    }

    pub fn cont(&mut self) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;

        self.step_over_breakpoint(&traced)?;
        if self.pending_status.is_some() {
            // The inferior produced a terminal event during the hidden step;
            // it becomes the next reported event.
            return Ok(());
        }

        let signal = self.take_resume_signal();
        traced.cont(signal)?;
        self.inferior.state = InferiorState::Running;
        self.inferior.wants_to_run = true;
        Ok(())
    }

    pub fn step(&mut self) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;

        // Stepping off a patched byte: restore it for this one instruction
        // and re-arm at the next stop. A disabled breakpoint needs nothing.
        let pc = VirtualAddress::new(self.program_counter()?);
        let covered = {
            let bpm = self.breakpoints.lock().unwrap();
            bpm.enabled_software_at(pc).map(|b| b.id())
        };
        if let Some(id) = covered {
            self.breakpoints.lock().unwrap().unpatch_for_step(&traced, id)?;
            self.pending_rearm = Some(id);
        }

        let signal = self.take_resume_signal();
        traced.single_step(signal)?;
        self.inferior.state = InferiorState::Running;
        self.inferior.wants_to_run = true;
        Ok(())
    }

    /// Continue-from-breakpoint discipline: restore the byte, step the one
    /// instruction, re-arm, and swallow the intermediate stop.
    fn step_over_breakpoint(&mut self, traced: &TracedProcess) -> ServerResult<()> {
        let pc = VirtualAddress::new(self.program_counter()?);
        let covered = {
            let bpm = self.breakpoints.lock().unwrap();
            bpm.enabled_software_at(pc).map(|b| b.id())
        };
        let Some(id) = covered else {
            return Ok(());
        };

        self.breakpoints.lock().unwrap().unpatch_for_step(traced, id)?;
        let signal = self.take_resume_signal();
        traced.single_step(signal)?;
        let status = traced.wait_for_event()?;

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                // The internal single-step stop; never reported.
                self.breakpoints.lock().unwrap().repatch_after_step(traced, id);
            }
            WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..) => {
                self.breakpoints.lock().unwrap().repatch_after_step(traced, id);
                self.pending_status = Some(status);
            }
            terminal => {
                self.pending_status = Some(terminal);
            }
        }
        Ok(())
    }

    /// Out-of-band interrupt. The resulting stop is reported as
    /// `ChildInterrupted`. A stop on an already-stopped inferior is a no-op.
    pub fn stop(&mut self) -> ServerResult<()> {
        if self.inferior.state != InferiorState::Running {
            return Ok(());
        }
        self.inferior.interrupt_requested = true;
        self.trace_handle()?.send_signal(Signal::SIGSTOP)?;
        Ok(())
    }

    pub fn stop_and_wait(&mut self) -> ServerResult<StatusMessage> {
        if self.inferior.state != InferiorState::Running {
            return Err(ServerCommandError::AlreadyStopped);
        }
        self.stop()?;
        let status = self.wait_for_event()?;
        Ok(self.dispatch_event(status))
    }

    /// Blocking wait for this inferior's next event.
    pub fn wait_for_event(&mut self) -> ServerResult<WaitStatus> {
        if let Some(status) = self.pending_status.take() {
            return Ok(status);
        }
        self.trace_handle()?.wait_for_event()
    }

    pub fn dispatch_event(&mut self, status: WaitStatus) -> StatusMessage {
        dispatch::dispatch_event(self, status)
    }

    /// Decode the architectural state at a stop into a verdict, re-arming any
    /// breakpoint left unpatched by a user-level step.
    pub(crate) fn child_stopped(&mut self, stopsig: i32) -> ServerResult<StopAction> {
        let traced = self.trace_handle()?;
        if let Some(id) = self.pending_rearm.take() {
            self.breakpoints.lock().unwrap().repatch_after_step(&traced, id);
        }

        let mut ctx = StopContext {
            trace: &traced,
            inferior: &mut self.inferior,
            breakpoints: &*self.breakpoints,
            runtime: self.runtime.as_ref(),
        };
        self.arch.child_stopped(&mut ctx, stopsig)
    }

    pub fn kill(&mut self) -> ServerResult<()> {
        let Ok(traced) = self.trace_handle() else {
            return Ok(());
        };
        let _ = traced.send_signal(Signal::SIGKILL);

        for _ in 0..WAIT_ATTEMPTS {
            match traced.wait_for_event() {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => {
                    let _ = traced.cont(None);
                }
            }
        }
        self.inferior.state = InferiorState::Exited;
        self.shutdown_io_worker();
        Ok(())
    }

    /// Stop if needed, restore every breakpoint, then let the inferior go.
    /// A breakpoint that cannot be restored is logged but does not block the
    /// detach.
    pub fn detach(&mut self) -> ServerResult<()> {
        let traced = self.trace_handle()?;

        if self.inferior.state == InferiorState::Running {
            self.stop()?;
            let _ = traced.wait_for_event()?;
            // The stop was consumed here, not dispatched.
            self.inferior.interrupt_requested = false;
            self.inferior.state = InferiorState::Stopped;
        }

        self.breakpoints.lock().unwrap().restore_all(&traced);
        let signal = self.take_resume_signal();
        traced.detach(signal)?;
        self.inferior.state = InferiorState::Detached;
        trace!(pid = %traced.pid(), "detached");
        Ok(())
    }

    /// Release the child of a fork event: clean our traps out of its copied
    /// address space and let it run untraced.
    pub fn detach_after_fork(&mut self, new_pid: Pid) -> ServerResult<()> {
        let child = TracedProcess::new(new_pid);

        let mut stopped = false;
        for _ in 0..WAIT_ATTEMPTS {
            match child.try_wait()? {
                Some(WaitStatus::Stopped(..)) | Some(WaitStatus::PtraceEvent(..)) => {
                    stopped = true;
                    break;
                }
                Some(_) => return Ok(()), // already gone
                None => thread::sleep(WAIT_INTERVAL),
            }
        }
        if !stopped {
            return Err(ServerCommandError::InternalError);
        }

        self.breakpoints.lock().unwrap().restore_all(&child);
        child.detach(None)?;
        trace!(pid = %new_pid, "detached forked child");
        Ok(())
    }

    /// Tear down the controller; kills the inferior if it is still ours.
    pub fn finalize(&mut self) -> ServerResult<()> {
        match self.inferior.state {
            InferiorState::Running | InferiorState::Stopped => self.kill()?,
            _ => {}
        }
        self.shutdown_io_worker();
        Ok(())
    }

    fn shutdown_io_worker(&mut self) {
        if let Some(tx) = self.io_shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }

    // --- memory and registers -------------------------------------------

    pub fn read_memory(&self, addr: u64, len: usize) -> ServerResult<Vec<u8>> {
        self.require_stopped()?;
        self.trace_handle()?.read_memory(addr, len)
    }

    pub fn write_memory(&self, addr: u64, bytes: &[u8]) -> ServerResult<()> {
        self.require_stopped()?;
        self.trace_handle()?.write_memory(addr, bytes)
    }

    pub fn peek_word(&self, addr: u64) -> ServerResult<u64> {
        self.require_stopped()?;
        self.trace_handle()?.peek_word(addr)
    }

    pub fn get_registers(&self) -> ServerResult<RegisterSnapshot> {
        self.require_stopped()?;
        Ok(RegisterSnapshot::new(self.trace_handle()?.get_registers()?))
    }

    pub fn set_registers(&mut self, regs: RegisterSnapshot) -> ServerResult<()> {
        self.require_stopped()?;
        self.trace_handle()?.set_registers(regs.regs)?;
        self.arch.set_current_registers(regs);
        Ok(())
    }

    pub fn push_registers(&mut self) -> ServerResult<u64> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        self.arch.push_registers(&traced)
    }

    pub fn pop_registers(&mut self) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        self.arch.pop_registers(&traced)
    }

    pub fn get_frame(&self) -> ServerResult<StackFrame> {
        self.require_stopped()?;
        let regs = RegisterSnapshot::new(self.trace_handle()?.get_registers()?);
        Ok(StackFrame {
            address: regs.pc(),
            stack_pointer: regs.stack_pointer(),
            frame_address: regs.frame_pointer(),
        })
    }

    pub fn get_callback_frame(&self, stack_pointer: u64) -> Option<CallbackFrameInfo> {
        self.arch.find_frame_below(stack_pointer).map(|f| CallbackFrameInfo {
            callback_arg: f.callback_arg,
            call_address: f.call_address,
            stack_pointer: f.stack_pointer,
            saved_registers: f.saved_regs,
        })
    }

    // --- breakpoints ----------------------------------------------------

    pub fn insert_breakpoint(&mut self, addr: u64) -> ServerResult<BreakpointId> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        self.breakpoints.lock().unwrap().insert_software(
            &traced,
            VirtualAddress::new(addr),
            BreakpointKind::SoftwareUser,
            None,
        )
    }

    pub fn insert_hw_breakpoint(&mut self, addr: u64) -> ServerResult<BreakpointId> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        let arch = self.arch.as_mut();
        let mut bpm = self.breakpoints.lock().unwrap();
        bpm.insert_hardware(&traced, arch, VirtualAddress::new(addr))
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        let arch = self.arch.as_mut();
        let mut bpm = self.breakpoints.lock().unwrap();
        bpm.remove(&traced, arch, id)
    }

    pub fn enable_breakpoint(&mut self, id: BreakpointId) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        let arch = self.arch.as_mut();
        let mut bpm = self.breakpoints.lock().unwrap();
        bpm.enable(&traced, arch, id)
    }

    pub fn disable_breakpoint(&mut self, id: BreakpointId) -> ServerResult<()> {
        self.require_stopped()?;
        let traced = self.trace_handle()?;
        let arch = self.arch.as_mut();
        let mut bpm = self.breakpoints.lock().unwrap();
        bpm.disable(&traced, arch, id)
    }

    pub fn get_breakpoints(&self) -> Vec<BreakpointId> {
        self.breakpoints.lock().unwrap().ids()
    }

    pub fn current_insn_is_bpt(&self) -> ServerResult<bool> {
        self.require_stopped()?;
        let pc = VirtualAddress::new(self.program_counter()?);
        Ok(self.breakpoints.lock().unwrap().enabled_software_at(pc).is_some())
    }

    // --- signals --------------------------------------------------------

    /// Either deliver `sig` out of band, or queue it for the next resume.
    pub fn set_signal(&mut self, sig: i32, send_it: bool) -> ServerResult<()> {
        if send_it {
            let signal = Signal::try_from(sig).map_err(|_| ServerCommandError::UnknownError)?;
            self.trace_handle()?.send_signal(signal)?;
        } else {
            self.inferior.last_signal = sig;
        }
        Ok(())
    }

    pub fn get_pending_signal(&self) -> i32 {
        self.inferior.last_signal
    }

    pub fn get_signal_info(&self) -> SignalInfo {
        let kernel_sigrtmin = libc::SIGRTMIN();
        SignalInfo {
            sigkill: libc::SIGKILL,
            sigstop: libc::SIGSTOP,
            sigint: libc::SIGINT,
            sigchld: libc::SIGCHLD,
            sigfpe: libc::SIGFPE,
            sigquit: libc::SIGQUIT,
            sigabrt: libc::SIGABRT,
            sigsegv: libc::SIGSEGV,
            sigill: libc::SIGILL,
            sigbus: libc::SIGBUS,
            sigwinch: libc::SIGWINCH,
            kernel_sigrtmin,
            thread_abort: kernel_sigrtmin + 1,
        }
    }

    // --- introspection --------------------------------------------------

    pub fn get_threads(&self) -> ServerResult<Vec<Pid>> {
        let pid = self.pid().ok_or(ServerCommandError::UnknownError)?;
        let task_dir = format!("/proc/{pid}/task");
        let entries = std::fs::read_dir(task_dir).map_err(|_| ServerCommandError::UnknownError)?;

        let mut threads = Vec::new();
        for entry in entries.flatten() {
            if let Some(tid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<i32>().ok())
            {
                threads.push(Pid::from_raw(tid));
            }
        }
        Ok(threads)
    }

    pub fn get_application(&self) -> ServerResult<ApplicationInfo> {
        let pid = self.pid().ok_or(ServerCommandError::UnknownError)?;
        let executable = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map_err(|_| ServerCommandError::UnknownError)?;
        let cwd = std::fs::read_link(format!("/proc/{pid}/cwd"))
            .map_err(|_| ServerCommandError::UnknownError)?;
        let raw = std::fs::read(format!("/proc/{pid}/cmdline"))
            .map_err(|_| ServerCommandError::UnknownError)?;
        let cmdline = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        Ok(ApplicationInfo {
            executable,
            cwd,
            cmdline,
        })
    }

    pub fn get_target_info(&self) -> TargetInfo {
        TargetInfo {
            int_size: size_of::<u32>() as u32,
            long_size: size_of::<u64>() as u32,
            address_size: size_of::<usize>() as u32,
            is_bigendian: cfg!(target_endian = "big"),
        }
    }

    pub fn get_capabilities(&self) -> u32 {
        CAPABILITY_THREAD_EVENTS | CAPABILITY_CAN_DETACH | CAPABILITY_HAS_SIGNALS
    }

    pub fn server_type(&self) -> ServerType {
        ServerType::LinuxPtrace
    }

    pub fn get_current_pid() -> u32 {
        std::process::id()
    }

    pub fn get_current_thread() -> u64 {
        // SAFETY: pthread_self has no preconditions.
        unsafe { libc::pthread_self() as u64 }
    }

    /// Core files are served by a different backend; the live-ptrace server
    /// has nothing to offer here.
    pub fn get_registers_from_core_file(&self, _core_file: &Path) -> ServerResult<RegisterSnapshot> {
        warn!("register recovery from core files is not supported by the ptrace backend");
        Err(ServerCommandError::UnknownError)
    }

    /// Resume after a runtime notification was processed.
    pub fn restart_notification(&mut self) -> ServerResult<()> {
        self.cont()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_io_worker();
    }
}

/// Child side of spawn. Never returns: either execs or reports the failure
/// over the sync pipe and exits.
fn spawn_child(
    working_dir: Option<&Path>,
    filename: &CStr,
    argv: &[CString],
    envp: &[CString],
    redirect: Option<(&OwnedFd, &OwnedFd)>,
    sync_write: OwnedFd,
) -> ! {
    use std::io::Write;

    let _ = setsid();

    // Everything from fd 3 up dies on exec; the sync pipe rides along and
    // closes by itself when exec succeeds.
    // SAFETY: plain fcntl/sysconf/setrlimit calls between fork and exec.
    unsafe {
        let open_max = libc::sysconf(libc::_SC_OPEN_MAX);
        for fd in 3..open_max as i32 {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    // No core dumps from the inferior while we hold it.
    if let Ok((_, hard)) = getrlimit(Resource::RLIMIT_CORE) {
        let _ = setrlimit(Resource::RLIMIT_CORE, 0, hard);
    }

    if let Some(dir) = working_dir {
        let _ = chdir(dir);
    }

    let exec_error = (|| -> nix::Result<()> {
        if let Some((out_w, err_w)) = redirect {
            dup2_stdout(out_w)?;
            dup2_stderr(err_w)?;
        }

        nix::sys::ptrace::traceme()?;

        let arg_refs: Vec<&CStr> = argv.iter().map(|a| a.as_c_str()).collect();
        if envp.is_empty() {
            execv(filename, &arg_refs)?;
        } else {
            let env_refs: Vec<&CStr> = envp.iter().map(|e| e.as_c_str()).collect();
            execve(filename, &arg_refs, &env_refs)?;
        }
        Ok(())
    })()
    .expect_err("exec returned without error");

    let message = format!(
        "Cannot exec `{}': {}",
        filename.to_string_lossy(),
        exec_error
    );
    let mut pipe_file = File::from(sync_write);
    let _ = pipe_file.write_all(&(message.len() as u32).to_ne_bytes());
    let _ = pipe_file.write_all(message.as_bytes());
    let _ = pipe_file.flush();

    // SAFETY: terminating the forked child without running atexit handlers.
    unsafe { libc::_exit(1) }
}

/// Parent side of the spawn synchronization pipe. `None` means exec
/// succeeded.
fn read_exec_error(sync_read: OwnedFd) -> Option<String> {
    let mut file = File::from(sync_read);

    let mut len_bytes = [0u8; 4];
    if file.read_exact(&mut len_bytes).is_err() {
        // Zero-length read: the pipe closed on successful exec.
        return None;
    }

    let len = u32::from_ne_bytes(len_bytes) as usize;
    let mut message = vec![0u8; len];
    if file.read_exact(&mut message).is_err() {
        return Some("target failed to start (truncated error report)".to_string());
    }
    Some(String::from_utf8_lossy(&message).into_owned())
}
