//! Out-of-process debugger backend for a managed-code runtime, built on the
//! host tracing primitive.
//!
//! A [`server::Server`] drives one traced inferior: spawning or attaching,
//! stepping and continuing, patching breakpoints, and forcing the inferior to
//! execute managed-runtime entry points. Raw stop events are translated by
//! [`dispatch`] into the typed messages a debugger frontend consumes; the
//! [`runtime`] module speaks the cooperation contract the managed runtime
//! publishes through its debugger info block.

pub mod arch;
pub mod breakpoint;
pub mod dispatch;
pub mod errors;
pub mod invoke;
pub mod message;
pub mod options;
pub mod runtime;
pub mod server;
pub mod trace;

pub use errors::{ServerCommandError, ServerResult};
pub use message::{MessageKind, StatusMessage};
pub use server::Server;
