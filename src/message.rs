use strum::Display;

/// Typed event reported to the frontend after translating a raw wait status.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MessageKind {
    ChildStopped,
    ChildInterrupted,
    ChildHitBreakpoint,
    ChildCallback,
    ChildCallbackCompleted,
    ChildNotification,
    RuntimeInvokeDone,
    ChildCreatedThread,
    ChildForked,
    ChildExecd,
    ChildCalledExit,
    ChildExited,
    ChildSignaled,
    InternalError,
    UnknownError,
}

/// One event toward the frontend.
///
/// Payload convention: `arg` is a small integer (signal number, breakpoint id
/// or callback id), `data1`/`data2` carry up to two result words. `opt_data`
/// is used for the rare variable-length payloads (signal info blobs).
#[derive(Clone, Debug)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub arg: u64,
    pub data1: u64,
    pub data2: u64,
    pub opt_data: Option<Vec<u8>>,
}

impl StatusMessage {
    pub fn simple(kind: MessageKind, arg: u64) -> Self {
        Self {
            kind,
            arg,
            data1: 0,
            data2: 0,
            opt_data: None,
        }
    }

    pub fn with_data(kind: MessageKind, arg: u64, data1: u64, data2: u64) -> Self {
        Self {
            kind,
            arg,
            data1,
            data2,
            opt_data: None,
        }
    }
}
