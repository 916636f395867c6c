use nix::errno::Errno;
use strum::Display;

/// Result alias used by every backend command.
pub type ServerResult<T> = Result<T, ServerCommandError>;

/// Error taxonomy surfaced to the frontend. Success is `Ok(())`, so there is
/// no explicit "none" variant.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ServerCommandError {
    #[strum(to_string = "unknown error")]
    UnknownError,
    /// The target could not be spawned or attached; carries the reason so the
    /// frontend can show it to the user.
    #[strum(to_string = "cannot start target: {message}")]
    CannotStartTarget { message: String },
    #[strum(to_string = "internal error")]
    InternalError,
    #[strum(to_string = "no such breakpoint")]
    NoSuchBreakpoint,
    #[strum(to_string = "inferior is already stopped")]
    AlreadyStopped,
    #[strum(to_string = "inferior is not stopped")]
    NotStopped,
    #[strum(to_string = "permission denied")]
    PermissionDenied,
}

impl std::error::Error for ServerCommandError {}

impl ServerCommandError {
    pub fn cannot_start(message: impl Into<String>) -> Self {
        ServerCommandError::CannotStartTarget {
            message: message.into(),
        }
    }
}

impl From<Errno> for ServerCommandError {
    fn from(errno: Errno) -> Self {
        match errno {
            // ptrace reports unmapped or unwritable tracee memory as EIO/EFAULT.
            Errno::EPERM | Errno::EACCES | Errno::EIO | Errno::EFAULT => {
                ServerCommandError::PermissionDenied
            }
            _ => ServerCommandError::UnknownError,
        }
    }
}
