//! Worker thread draining the inferior's redirected stdout/stderr pipes.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::FromRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::{error, trace};

const STDOUT: Token = Token(0);
const STDERR: Token = Token(1);

/// One chunk of redirected child output.
#[derive(Clone, Debug)]
pub struct ChildOutput {
    pub is_stderr: bool,
    pub data: Vec<u8>,
}

/// Poll both pipe ends and forward whatever the inferior writes. Hangup or
/// error on either end closes both and ends the worker; the fds die with it.
pub fn forward_child_output(
    stdout_fd: OwnedFd,
    stderr_fd: OwnedFd,
    send_channel: Sender<ChildOutput>,
    shutdown_channel: Receiver<()>,
) {
    let mut poll = match Poll::new() {
        Ok(p) => p,
        Err(e) => {
            error!(?e, "cannot create poll instance for child output");
            return;
        }
    };
    let mut events = Events::with_capacity(16);

    let mut stdout_source = SourceFd(&stdout_fd.as_raw_fd());
    let mut stderr_source = SourceFd(&stderr_fd.as_raw_fd());
    if let Err(e) = poll
        .registry()
        .register(&mut stdout_source, STDOUT, Interest::READABLE)
        .and_then(|_| poll.registry().register(&mut stderr_source, STDERR, Interest::READABLE))
    {
        error!(?e, "cannot register child output pipes");
        return;
    }

    // SAFETY: the Files only borrow the fds for reading; the OwnedFds stay
    // alive for the whole function and are the sole owners.
    let mut stdout_file =
        std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(stdout_fd.as_raw_fd()) });
    let mut stderr_file =
        std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(stderr_fd.as_raw_fd()) });

    let mut buffer = [0u8; 4096];

    loop {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(42))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(?e, "poll failed in child output worker");
            return;
        }

        for event in events.iter() {
            let (file, is_stderr): (&mut std::fs::File, bool) = match event.token() {
                STDOUT => (&mut *stdout_file, false),
                STDERR => (&mut *stderr_file, true),
                _ => continue,
            };

            if event.is_readable() {
                match file.read(&mut buffer) {
                    Ok(0) => {
                        trace!(is_stderr, "child output pipe reached EOF");
                        return;
                    }
                    Ok(n) => {
                        let chunk = ChildOutput {
                            is_stderr,
                            data: buffer[..n].to_vec(),
                        };
                        if send_channel.send(chunk).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        error!(?e, is_stderr, "error reading child output");
                        return;
                    }
                }
            }

            if event.is_read_closed() {
                // Drain whatever is left, then shut down both ends.
                while let Ok(n) = file.read(&mut buffer) {
                    if n == 0 {
                        break;
                    }
                    let chunk = ChildOutput {
                        is_stderr,
                        data: buffer[..n].to_vec(),
                    };
                    if send_channel.send(chunk).is_err() {
                        break;
                    }
                }
                return;
            }
        }

        match shutdown_channel.try_recv() {
            Ok(_) | Err(TryRecvError::Disconnected) => {
                trace!("shutdown signal received at child output worker");
                return;
            }
            Err(TryRecvError::Empty) => {}
        }
    }
}
