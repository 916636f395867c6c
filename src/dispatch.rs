//! Translation of raw wait statuses into typed frontend messages.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use tracing::warn;

use crate::arch::StopAction;
use crate::message::{MessageKind, StatusMessage};
use crate::server::{InferiorState, Server};

/// Full translation: extended ptrace events, arch verdicts, exits and
/// signals. Needs a live controller for the arch consultation.
pub fn dispatch_event(server: &mut Server, status: WaitStatus) -> StatusMessage {
    match status {
        WaitStatus::PtraceEvent(_, _, event) => dispatch_extended(server, event),
        WaitStatus::Stopped(_, signal) => dispatch_stop(server, signal),
        WaitStatus::Exited(_, code) => {
            server.inferior.state = InferiorState::Exited;
            StatusMessage::simple(MessageKind::ChildExited, code as u64)
        }
        WaitStatus::Signaled(_, signal, _) => {
            // A SIGKILL'd (or trap-killed) inferior died on our account;
            // report it as a plain exit.
            if matches!(signal, Signal::SIGKILL | Signal::SIGTRAP) {
                server.inferior.state = InferiorState::Exited;
                StatusMessage::simple(MessageKind::ChildExited, 0)
            } else {
                server.inferior.state = InferiorState::Signaled;
                StatusMessage::simple(MessageKind::ChildSignaled, signal as i32 as u64)
            }
        }
        other => {
            warn!(?other, "unrecognized wait status");
            StatusMessage::simple(MessageKind::UnknownError, 0)
        }
    }
}

fn dispatch_extended(server: &mut Server, event: i32) -> StatusMessage {
    server.inferior.state = InferiorState::Stopped;

    let detail = || -> Option<u64> {
        let traced = server.trace_handle().ok()?;
        traced.get_event_detail().ok()
    };

    match event {
        libc::PTRACE_EVENT_CLONE => match detail() {
            Some(new_pid) => StatusMessage::simple(MessageKind::ChildCreatedThread, new_pid),
            None => StatusMessage::simple(MessageKind::UnknownError, 0),
        },
        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => match detail() {
            Some(new_pid) => StatusMessage::simple(MessageKind::ChildForked, new_pid),
            None => StatusMessage::simple(MessageKind::UnknownError, 0),
        },
        libc::PTRACE_EVENT_EXEC => {
            // The address space was replaced; our trap bytes are gone.
            if let Ok(traced) = server.trace_handle() {
                if let Err(e) = server.breakpoints().lock().unwrap().reinsert_all(&traced) {
                    warn!(error = %e, "failed to re-insert breakpoints after exec");
                }
            }
            StatusMessage::simple(MessageKind::ChildExecd, 0)
        }
        libc::PTRACE_EVENT_EXIT => {
            // The exit code is available here, but the frontend learns it
            // from the real exit event that follows.
            let _ = detail();
            StatusMessage::simple(MessageKind::ChildCalledExit, 0)
        }
        other => {
            warn!(event = other, "unknown extended stop");
            StatusMessage::simple(MessageKind::UnknownError, 0)
        }
    }
}

fn dispatch_stop(server: &mut Server, signal: Signal) -> StatusMessage {
    let mut stopsig = signal as i32;
    if stopsig == Signal::SIGCONT as i32 {
        stopsig = 0;
    }

    server.inferior.state = InferiorState::Stopped;
    server.inferior.wants_to_run = false;

    let action = match server.child_stopped(stopsig) {
        Ok(action) => action,
        Err(e) => {
            warn!(error = %e, "arch backend failed to decode the stop");
            return StatusMessage::simple(MessageKind::InternalError, 0);
        }
    };

    // Signal policy: any stop we consumed internally swallows the signal.
    if action != StopAction::Stopped {
        server.inferior.last_signal = 0;
    }

    // Completed invocation frames are unwound before the message goes out;
    // the corrected result words replace what the registers said.
    let frame_data = if server.arch.take_frame_completed() {
        match server.complete_top_frame() {
            Ok(data) => Some(data),
            Err(e) => {
                warn!(error = %e, "failed to complete invocation frame");
                return StatusMessage::simple(MessageKind::InternalError, 0);
            }
        }
    } else {
        None
    };

    match action {
        StopAction::Stopped => {
            if stopsig == Signal::SIGTRAP as i32 {
                server.inferior.last_signal = 0;
                StatusMessage::simple(MessageKind::ChildStopped, 0)
            } else {
                server.inferior.last_signal = stopsig;
                StatusMessage::simple(MessageKind::ChildStopped, stopsig as u64)
            }
        }
        StopAction::Interrupted => StatusMessage::simple(MessageKind::ChildInterrupted, 0),
        StopAction::BreakpointHit { id } => {
            StatusMessage::simple(MessageKind::ChildHitBreakpoint, u64::from(id.value()))
        }
        StopAction::Callback { arg, data1, data2 } => {
            let (data1, data2) = frame_data.unwrap_or((data1, data2));
            StatusMessage::with_data(MessageKind::ChildCallback, arg, data1, data2)
        }
        StopAction::CallbackCompleted { arg, data1, data2 } => {
            let (data1, data2) = frame_data.unwrap_or((data1, data2));
            StatusMessage::with_data(MessageKind::ChildCallbackCompleted, arg, data1, data2)
        }
        StopAction::Notification { arg, data1, data2 } => {
            let (data1, data2) = frame_data.unwrap_or((data1, data2));
            StatusMessage::with_data(MessageKind::ChildNotification, arg, data1, data2)
        }
        StopAction::RtiDone { arg, data1, data2 } => {
            let (data1, data2) = frame_data.unwrap_or((data1, data2));
            StatusMessage::with_data(MessageKind::RuntimeInvokeDone, arg, data1, data2)
        }
        StopAction::InternalError => StatusMessage::simple(MessageKind::InternalError, 0),
    }
}

/// Startup variant used before a full controller exists: only stop/exit/
/// signal events, with SIGSTOP and SIGTRAP swallowed.
pub fn dispatch_simple(status: WaitStatus) -> StatusMessage {
    match status {
        WaitStatus::Stopped(_, signal) => {
            let stopsig = match signal {
                Signal::SIGSTOP | Signal::SIGTRAP => 0,
                other => other as i32,
            };
            StatusMessage::simple(MessageKind::ChildStopped, stopsig as u64)
        }
        WaitStatus::Exited(_, code) => StatusMessage::simple(MessageKind::ChildExited, code as u64),
        WaitStatus::Signaled(_, signal, _) => {
            if matches!(signal, Signal::SIGKILL | Signal::SIGTRAP) {
                StatusMessage::simple(MessageKind::ChildExited, 0)
            } else {
                StatusMessage::simple(MessageKind::ChildSignaled, signal as i32 as u64)
            }
        }
        _ => StatusMessage::simple(MessageKind::UnknownError, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn pid() -> Pid {
        Pid::from_raw(1234)
    }

    #[test]
    fn normal_exit_reports_the_wait_code() {
        let msg = dispatch_simple(WaitStatus::Exited(pid(), 7));
        assert_eq!(msg.kind, MessageKind::ChildExited);
        assert_eq!(msg.arg, 7);
    }

    #[test]
    fn sigkill_termination_degrades_to_exit_zero() {
        let msg = dispatch_simple(WaitStatus::Signaled(pid(), Signal::SIGKILL, false));
        assert_eq!(msg.kind, MessageKind::ChildExited);
        assert_eq!(msg.arg, 0);
    }

    #[test]
    fn sigtrap_termination_degrades_to_exit_zero() {
        let msg = dispatch_simple(WaitStatus::Signaled(pid(), Signal::SIGTRAP, true));
        assert_eq!(msg.kind, MessageKind::ChildExited);
        assert_eq!(msg.arg, 0);
    }

    #[test]
    fn other_signals_report_the_signal_number() {
        let msg = dispatch_simple(WaitStatus::Signaled(pid(), Signal::SIGSEGV, true));
        assert_eq!(msg.kind, MessageKind::ChildSignaled);
        assert_eq!(msg.arg, Signal::SIGSEGV as i32 as u64);
    }

    #[test]
    fn startup_stops_swallow_sigstop_and_sigtrap() {
        for sig in [Signal::SIGSTOP, Signal::SIGTRAP] {
            let msg = dispatch_simple(WaitStatus::Stopped(pid(), sig));
            assert_eq!(msg.kind, MessageKind::ChildStopped);
            assert_eq!(msg.arg, 0);
        }

        let msg = dispatch_simple(WaitStatus::Stopped(pid(), Signal::SIGUSR1));
        assert_eq!(msg.kind, MessageKind::ChildStopped);
        assert_eq!(msg.arg, Signal::SIGUSR1 as i32 as u64);
    }

    #[test]
    fn unknown_statuses_are_flagged() {
        let msg = dispatch_simple(WaitStatus::StillAlive);
        assert_eq!(msg.kind, MessageKind::UnknownError);
    }
}
