//! Uniform layer over the host tracing primitive (`ptrace(2)` on Linux).
//!
//! Everything above this module speaks in addresses, byte slices and wait
//! statuses; the word-size games ptrace forces on us stay in here.

use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::trace;

use libc::user_regs_struct;

use crate::errors::{ServerCommandError, ServerResult};

const WORD_SIZE: usize = size_of::<libc::c_long>();

/// Handle to one traced process or thread.
///
/// Owns nothing but the pid; the kernel tracks the actual tracing
/// relationship, which is why this type is freely copyable.
#[derive(Clone, Copy, Debug)]
pub struct TracedProcess {
    pid: Pid,
}

impl TracedProcess {
    /// Wrap a pid that is already traced (spawned with `traceme` or a thread
    /// reported through a clone event).
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// Attach to a running process.
    pub fn attach(pid: Pid) -> ServerResult<Self> {
        ptrace::attach(pid).map_err(|e| {
            ServerCommandError::cannot_start(format!("cannot attach to {pid}: {e}"))
        })?;
        Ok(Self { pid })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ask for the extended stop events we translate in the dispatcher.
    pub fn set_trace_options(&self) -> ServerResult<()> {
        let options = Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_TRACEEXIT;
        ptrace::setoptions(self.pid, options)?;
        Ok(())
    }

    pub fn cont(&self, signal: Option<Signal>) -> ServerResult<()> {
        trace!(pid = %self.pid, ?signal, "continue");
        ptrace::cont(self.pid, signal)?;
        Ok(())
    }

    pub fn single_step(&self, signal: Option<Signal>) -> ServerResult<()> {
        trace!(pid = %self.pid, ?signal, "single step");
        ptrace::step(self.pid, signal)?;
        Ok(())
    }

    pub fn detach(&self, signal: Option<Signal>) -> ServerResult<()> {
        ptrace::detach(self.pid, signal)?;
        Ok(())
    }

    pub fn kill(&self) -> ServerResult<()> {
        ptrace::kill(self.pid)?;
        Ok(())
    }

    pub fn send_signal(&self, signal: Signal) -> ServerResult<()> {
        kill(self.pid, signal)?;
        Ok(())
    }

    /// Read `len` bytes of inferior memory, faithful at byte granularity.
    pub fn read_memory(&self, addr: u64, len: usize) -> ServerResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }

        let word_start = addr & !(WORD_SIZE as u64 - 1);
        let skip = (addr - word_start) as usize;

        let mut raw = Vec::with_capacity(skip + len + WORD_SIZE);
        let mut cursor = word_start;
        while raw.len() < skip + len {
            let word = ptrace::read(self.pid, cursor as _)?;
            raw.extend_from_slice(&word.to_ne_bytes());
            cursor += WORD_SIZE as u64;
        }

        Ok(raw[skip..skip + len].to_vec())
    }

    /// Write bytes into inferior memory. Unaligned edges are read back first
    /// so only the requested bytes change.
    pub fn write_memory(&self, addr: u64, bytes: &[u8]) -> ServerResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let word_start = addr & !(WORD_SIZE as u64 - 1);
        let skip = (addr - word_start) as usize;
        let span = (skip + bytes.len()).div_ceil(WORD_SIZE) * WORD_SIZE;

        let mut raw = self.read_memory(word_start, span)?;
        raw[skip..skip + bytes.len()].copy_from_slice(bytes);

        let mut cursor = word_start;
        for chunk in raw.chunks_exact(WORD_SIZE) {
            let word = libc::c_long::from_ne_bytes(chunk.try_into().expect("exact chunk"));
            ptrace::write(self.pid, cursor as _, word)?;
            cursor += WORD_SIZE as u64;
        }

        Ok(())
    }

    pub fn peek_word(&self, addr: u64) -> ServerResult<u64> {
        let bytes = self.read_memory(addr, size_of::<u64>())?;
        Ok(u64::from_ne_bytes(bytes.try_into().expect("word read")))
    }

    pub fn get_registers(&self) -> ServerResult<user_regs_struct> {
        let regs = ptrace::getregset::<ptrace::regset::NT_PRSTATUS>(self.pid)?;
        Ok(regs)
    }

    pub fn set_registers(&self, regs: user_regs_struct) -> ServerResult<()> {
        ptrace::setregset::<ptrace::regset::NT_PRSTATUS>(self.pid, regs)?;
        Ok(())
    }

    /// Read one word from the tracee's `user` area (debug registers live there).
    pub fn read_user_word(&self, offset: usize) -> ServerResult<u64> {
        let word = ptrace::read_user(self.pid, offset as _)?;
        Ok(word as u64)
    }

    pub fn write_user_word(&self, offset: usize, value: u64) -> ServerResult<()> {
        ptrace::write_user(self.pid, offset as _, value as _)?;
        Ok(())
    }

    /// Block until this inferior reports an event.
    pub fn wait_for_event(&self) -> ServerResult<WaitStatus> {
        let status = waitpid(self.pid, Some(WaitPidFlag::__WALL))?;
        Ok(status)
    }

    /// Nonblocking variant, used by the bounded waits during spawn/attach.
    pub fn try_wait(&self) -> ServerResult<Option<WaitStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::__WALL | WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(Some(status)),
        }
    }

    /// Recover the secondary word attached to an extended stop (cloned pid,
    /// forked pid, exit code).
    pub fn get_event_detail(&self) -> ServerResult<u64> {
        let detail = ptrace::getevent(self.pid)?;
        Ok(detail as u64)
    }
}

/// Block until any traced inferior reports an event.
pub fn global_wait() -> ServerResult<(Pid, WaitStatus)> {
    let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))?;
    let pid = status.pid().ok_or(ServerCommandError::UnknownError)?;
    Ok((pid, status))
}

#[cfg(test)]
mod tests {
    use super::WORD_SIZE;

    #[test]
    fn word_span_covers_unaligned_writes() {
        // A 3-byte write at offset 6 of a word must touch two words.
        let addr = 0x1006u64;
        let word_start = addr & !(WORD_SIZE as u64 - 1);
        let skip = (addr - word_start) as usize;
        let span = (skip + 3).div_ceil(WORD_SIZE) * WORD_SIZE;
        assert_eq!(word_start, 0x1000);
        assert_eq!(span, 2 * WORD_SIZE);
    }
}
