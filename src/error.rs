use thiserror::Error;

/// The error type used in this crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Another kernel-debugger session is already active in this process")]
    SessionActive,

    #[error("The emulator rejected a code breakpoint at {addr:#010x}")]
    BreakpointRejected { addr: u32 },

    #[error("The emulator rejected a watchpoint at {addr:#010x} with length {len}")]
    WatchpointRejected { addr: u32, len: u8 },
}
