#![cfg(target_os = "linux")]

mod fixtures;

use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use nix::sys::signal::Signal;

use mdb_server::dispatch;
use mdb_server::errors::ServerCommandError;
use mdb_server::message::{MessageKind, StatusMessage};
use mdb_server::runtime::RuntimeInfo;
use mdb_server::server::{InferiorState, Server};

/// Wrapper around a `Server` whose `Drop` guarantees the inferior is reaped
/// even when an assertion fails mid-test.
struct ServerGuard {
    server: Option<Server>,
}

impl ServerGuard {
    fn new(server: Server) -> Self {
        Self {
            server: Some(server),
        }
    }

    fn get_mut(&mut self) -> &mut Server {
        self.server.as_mut().expect("server should still be available")
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        if let Some(mut server) = self.server.take() {
            let _ = server.finalize();
        }
    }
}

/// Spawn the fixture and consume the initial exec trap.
fn spawn_fixture(args: &[&str], redirect: bool) -> Result<ServerGuard> {
    let fixture = fixtures::inferior_fixture_path();
    let mut argv = vec![fixture.to_string_lossy().into_owned()];
    argv.extend(args.iter().map(|a| a.to_string()));

    let mut server = Server::create();
    server
        .spawn(None, &argv, &[], redirect)
        .map_err(|e| anyhow!("spawn failed: {e}"))?;

    let status = server.wait_for_event().map_err(|e| anyhow!("{e}"))?;
    let first = dispatch::dispatch_simple(status);
    assert_eq!(first.kind, MessageKind::ChildStopped, "expected the initial trap");
    assert_eq!(first.arg, 0, "initial trap must be swallowed");

    Ok(ServerGuard::new(server))
}

fn next_event(server: &mut Server) -> StatusMessage {
    let status = server.wait_for_event().expect("wait should succeed");
    server.dispatch_event(status)
}

/// Resume past the fixture's banner until it parks itself with SIGSTOP, then
/// clear the pending signal so the next resume does not re-deliver it.
fn run_until_sigstop(server: &mut Server) {
    server.resume().expect("resume should succeed");
    let msg = next_event(server);
    assert_eq!(msg.kind, MessageKind::ChildStopped);
    assert_eq!(msg.arg, Signal::SIGSTOP as i32 as u64);
    server.set_signal(0, false).expect("clearing the signal");
}

fn run_to_exit(server: &mut Server) -> u64 {
    for _ in 0..64 {
        server.resume().expect("resume should succeed");
        let msg = next_event(server);
        match msg.kind {
            MessageKind::ChildExited => return msg.arg,
            MessageKind::ChildSignaled => panic!("inferior died on signal {}", msg.arg),
            _ => {}
        }
    }
    panic!("inferior did not exit");
}

/// Collect redirected output until every marker showed up.
fn gather_output(server: &Server, markers: &[&str], stderr_marker: &str) -> (String, String) {
    let rx = server.output_channel().expect("redirection was requested");
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut stdout = String::new();
    let mut stderr = String::new();

    loop {
        let have_all = markers.iter().all(|m| stdout.contains(m)) && stderr.contains(stderr_marker);
        if have_all {
            return (stdout, stderr);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            !remaining.is_zero(),
            "timed out waiting for fixture output; stdout so far: {stdout:?}"
        );
        let chunk = rx
            .recv_timeout(remaining)
            .expect("fixture output should arrive");
        let text = String::from_utf8_lossy(&chunk.data).into_owned();
        if chunk.is_stderr {
            stderr.push_str(&text);
        } else {
            stdout.push_str(&text);
        }
    }
}

fn parse_marker(output: &str, marker: &str) -> u64 {
    let line = output
        .lines()
        .find(|l| l.starts_with(marker))
        .unwrap_or_else(|| panic!("marker {marker} missing in {output:?}"));
    let hex = line
        .split('=')
        .nth(1)
        .expect("marker line has a value")
        .trim_start_matches("0x");
    u64::from_str_radix(hex, 16).expect("marker value parses as hex")
}

/// Spawn `/bin/true`: initial trap reported as a zero stop, then a clean
/// exit with code 0.
#[test]
fn spawn_reports_initial_stop_then_exit() -> Result<()> {
    let mut server = Server::create();
    server
        .spawn(None, &["/bin/true".to_string()], &[], false)
        .map_err(|e| anyhow!("{e}"))?;

    let status = server.wait_for_event().map_err(|e| anyhow!("{e}"))?;
    let first = dispatch::dispatch_simple(status);
    assert_eq!(first.kind, MessageKind::ChildStopped);
    assert_eq!(first.arg, 0);

    let mut guard = ServerGuard::new(server);
    let code = run_to_exit(guard.get_mut());
    assert_eq!(code, 0);
    assert_eq!(guard.get_mut().state(), InferiorState::Exited);
    Ok(())
}

#[test]
fn spawn_failure_surfaces_the_exec_error() {
    let mut server = Server::create();
    let err = server
        .spawn(
            None,
            &["/definitely/not/a/real/binary".to_string()],
            &[],
            false,
        )
        .expect_err("spawn of a missing binary must fail");

    match err {
        ServerCommandError::CannotStartTarget { message } => {
            assert!(
                message.contains("Cannot exec"),
                "unexpected error message: {message}"
            );
        }
        other => panic!("expected CannotStartTarget, got {other:?}"),
    }
}

/// Breakpoint round trip: patch byte visible, duplicate insert reuses the id,
/// removal restores the original byte, hits are reported with the PC rewound
/// and without surfacing the hidden re-arm step.
#[test]
fn breakpoint_lifecycle_against_live_inferior() -> Result<()> {
    let mut guard = spawn_fixture(&[], true)?;
    let server = guard.get_mut();
    run_until_sigstop(server);

    let (stdout, stderr) = gather_output(
        server,
        &["POKE_ADDR=", "ADD_ADDR=", "ARENA_ADDR="],
        "HELLO_FROM_STDERR",
    );
    assert!(stderr.contains("HELLO_FROM_STDERR"));
    let poke = parse_marker(&stdout, "POKE_ADDR=");

    let original = server.read_memory(poke, 1).map_err(|e| anyhow!("{e}"))?;
    let id = server.insert_breakpoint(poke).map_err(|e| anyhow!("{e}"))?;
    assert_eq!(server.read_memory(poke, 1).map_err(|e| anyhow!("{e}"))?, vec![0xCC]);

    // Identical insert covers the same address: same id, memory untouched.
    let again = server.insert_breakpoint(poke).map_err(|e| anyhow!("{e}"))?;
    assert_eq!(again, id);
    assert_eq!(server.read_memory(poke, 1).map_err(|e| anyhow!("{e}"))?, vec![0xCC]);

    server.remove_breakpoint(id).map_err(|e| anyhow!("{e}"))?;
    assert_eq!(server.read_memory(poke, 1).map_err(|e| anyhow!("{e}"))?, original);
    assert!(matches!(
        server.remove_breakpoint(id),
        Err(ServerCommandError::NoSuchBreakpoint)
    ));

    let id = server.insert_breakpoint(poke).map_err(|e| anyhow!("{e}"))?;

    // First call into poke().
    server.resume().map_err(|e| anyhow!("{e}"))?;
    let msg = next_event(server);
    assert_eq!(msg.kind, MessageKind::ChildHitBreakpoint);
    assert_eq!(msg.arg, u64::from(id.value()));
    assert_eq!(
        server.get_frame().map_err(|e| anyhow!("{e}"))?.address,
        poke,
        "PC must be rewound to the breakpoint address"
    );
    assert!(server.current_insn_is_bpt().map_err(|e| anyhow!("{e}"))?);

    // Second call re-hits; the single-step used to carry the PC past the
    // patched byte must not be visible as an event.
    server.resume().map_err(|e| anyhow!("{e}"))?;
    let msg = next_event(server);
    assert_eq!(msg.kind, MessageKind::ChildHitBreakpoint);
    assert_eq!(msg.arg, u64::from(id.value()));

    // Disabled breakpoint: memory is clean and a step is a plain step.
    server.disable_breakpoint(id).map_err(|e| anyhow!("{e}"))?;
    assert_eq!(server.read_memory(poke, 1).map_err(|e| anyhow!("{e}"))?, original);
    server.set_stepping(true);
    server.resume().map_err(|e| anyhow!("{e}"))?;
    let msg = next_event(server);
    assert_eq!(msg.kind, MessageKind::ChildStopped);
    assert_eq!(msg.arg, 0);
    server.set_stepping(false);

    let code = run_to_exit(server);
    assert_eq!(code, 0);
    Ok(())
}

/// Drive a real in-inferior invocation through the arena: the stub calls the
/// fixture's `add_words`, the completion carries the callback id and result,
/// registers are restored bit-for-bit and the chunk is released.
#[test]
fn invocation_runs_code_inside_the_inferior() -> Result<()> {
    let mut guard = spawn_fixture(&[], true)?;
    let server = guard.get_mut();
    run_until_sigstop(server);

    let (stdout, _) = gather_output(
        server,
        &["POKE_ADDR=", "ADD_ADDR=", "ARENA_ADDR="],
        "HELLO_FROM_STDERR",
    );
    let add_words = parse_marker(&stdout, "ADD_ADDR=");
    let arena = parse_marker(&stdout, "ARENA_ADDR=");

    server.set_runtime_info(RuntimeInfo::new(8, 0, arena, 64 * 1024, 0, 0));

    let before = server.get_registers().map_err(|e| anyhow!("{e}"))?;
    server
        .call_method_2(add_words, 40, 2, 42)
        .map_err(|e| anyhow!("{e}"))?;
    let (result, _) = server.wait_for_callback(42).map_err(|e| anyhow!("{e}"))?;
    assert_eq!(result, 42, "add_words(40, 2) must come back through rax");

    let after = server.get_registers().map_err(|e| anyhow!("{e}"))?;
    assert_eq!(
        before.as_bytes(),
        after.as_bytes(),
        "registers must be restored bit-for-bit after the invocation"
    );
    assert_eq!(
        server
            .runtime_info()
            .expect("runtime info was set")
            .executable_code
            .chunks_in_use(),
        0,
        "completion must release the stub chunk"
    );

    let code = run_to_exit(server);
    assert_eq!(code, 0);
    Ok(())
}

#[test]
fn push_pop_registers_round_trips_bit_for_bit() -> Result<()> {
    let mut server = Server::create();
    server
        .spawn(None, &["/bin/true".to_string()], &[], false)
        .map_err(|e| anyhow!("{e}"))?;
    let _ = server.wait_for_event().map_err(|e| anyhow!("{e}"))?;
    let mut guard = ServerGuard::new(server);
    let server = guard.get_mut();

    let before = server.get_registers().map_err(|e| anyhow!("{e}"))?;

    let outer_sp = server.push_registers().map_err(|e| anyhow!("{e}"))?;
    assert!(outer_sp < before.stack_pointer(), "push must carve out stack");
    let inner_sp = server.push_registers().map_err(|e| anyhow!("{e}"))?;
    assert!(inner_sp < outer_sp);

    // Scribble over the register file in between.
    let mut scratch = server.get_registers().map_err(|e| anyhow!("{e}"))?;
    scratch.set_pc(scratch.pc().wrapping_add(0x40));
    server.set_registers(scratch).map_err(|e| anyhow!("{e}"))?;

    server.pop_registers().map_err(|e| anyhow!("{e}"))?;
    server.pop_registers().map_err(|e| anyhow!("{e}"))?;

    let after = server.get_registers().map_err(|e| anyhow!("{e}"))?;
    assert_eq!(before.as_bytes(), after.as_bytes());
    Ok(())
}

/// `stop` on a running inferior surfaces as `ChildInterrupted`; on a stopped
/// one it is a no-op.
#[test]
fn interrupt_handshake_reports_interrupted() -> Result<()> {
    let mut guard = spawn_fixture(&["spin"], false)?;
    let server = guard.get_mut();

    // Already stopped: nothing happens, no event is produced.
    server.stop().map_err(|e| anyhow!("{e}"))?;
    assert_eq!(server.state(), InferiorState::Stopped);

    server.resume().map_err(|e| anyhow!("{e}"))?;
    std::thread::sleep(Duration::from_millis(100));
    server.stop().map_err(|e| anyhow!("{e}"))?;

    let msg = next_event(server);
    assert_eq!(msg.kind, MessageKind::ChildInterrupted);
    assert_eq!(msg.arg, 0);
    assert_eq!(server.state(), InferiorState::Stopped);
    Ok(())
}

#[test]
fn detach_releases_the_inferior() -> Result<()> {
    let mut server = Server::create();
    server
        .spawn(None, &["/bin/true".to_string()], &[], false)
        .map_err(|e| anyhow!("{e}"))?;
    let _ = server.wait_for_event().map_err(|e| anyhow!("{e}"))?;

    server.detach().map_err(|e| anyhow!("{e}"))?;
    assert_eq!(server.state(), InferiorState::Detached);
    Ok(())
}
