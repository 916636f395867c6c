use anyhow::{Result, anyhow};
use clap::Parser;
use nix::unistd::Pid;
use tracing::{error, trace};
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mdb_server::dispatch;
use mdb_server::message::MessageKind;
use mdb_server::options::{Options, parse_address};
use mdb_server::server::{Server, global_init};

use std::fs;
use std::path::Path;

fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, "mdb-server.log");
    let (file_writer, guard) = non_blocking(file_appender);
    let file_layer = fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn drain_child_output(server: &Server) {
    if let Some(rx) = server.output_channel() {
        while let Ok(chunk) = rx.try_recv() {
            let text = String::from_utf8_lossy(&chunk.data);
            for line in text.lines() {
                if chunk.is_stderr {
                    eprintln!("[inferior] {line}");
                } else {
                    println!("[inferior] {line}");
                }
            }
        }
    }
}

fn main() -> Result<()> {
    let options = Options::parse();
    options.validate()?;

    let _guard = init_logging(&options.log_dir)?;
    global_init();

    let mut server = Server::create();

    match (&options.executable, options.pid) {
        (Some(executable), None) => {
            let mut argv = vec![executable.to_string_lossy().into_owned()];
            argv.extend(options.args.iter().cloned());
            let pid = server
                .spawn(options.cwd.as_deref(), &argv, &[], options.redirect)
                .map_err(|e| anyhow!("{e}"))?;
            println!("spawned {} as pid {pid}", executable.display());
        }
        (None, Some(pid)) => {
            server
                .attach(Pid::from_raw(pid))
                .map_err(|e| anyhow!("{e}"))?;
            println!("attached to pid {pid}");
        }
        _ => unreachable!("validated above"),
    }

    // The initial trap is pending; report it through the startup dispatcher.
    let status = server.wait_for_event().map_err(|e| anyhow!("{e}"))?;
    let first = dispatch::dispatch_simple(status);
    println!("event: {} arg={}", first.kind, first.arg);

    for spec in &options.breakpoints {
        let addr = parse_address(spec)?;
        match server.insert_breakpoint(addr) {
            Ok(id) => println!("breakpoint {id} at {addr:#x}"),
            Err(e) => error!(%addr, error = %e, "cannot insert breakpoint"),
        }
    }

    loop {
        if let Err(e) = server.resume() {
            error!(error = %e, "resume failed");
            break;
        }

        let status = match server.wait_for_event() {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "wait failed");
                break;
            }
        };
        trace!(?status, "raw wait status");

        let msg = server.dispatch_event(status);
        drain_child_output(&server);
        match msg.kind {
            MessageKind::ChildExited => {
                println!("inferior exited with code {}", msg.arg);
                break;
            }
            MessageKind::ChildSignaled => {
                println!("inferior killed by signal {}", msg.arg);
                break;
            }
            MessageKind::ChildHitBreakpoint => {
                println!("breakpoint {} hit", msg.arg);
            }
            kind => {
                println!("event: {kind} arg={} data1={:#x} data2={:#x}", msg.arg, msg.data1, msg.data2);
            }
        }
    }

    drain_child_output(&server);
    server.finalize().map_err(|e| anyhow!("{e}"))?;
    Ok(())
}
