use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

use crate::dispatch::LoopState;
use crate::registry::RegistryError;
use crate::types::{ProcessId, ThreadId};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not spawn debuggee = {program:?}")]
    SpawnFailed {
        program: PathBuf,
        source: io::Error,
    },

    #[error("Could not attach to debuggee = {pid}")]
    AttachFailed {
        pid: ProcessId,
        source: nix::Error,
    },

    #[error("Could not terminate debuggee = {pid}")]
    TerminateFailed {
        pid: ProcessId,
        source: nix::Error,
    },

    #[error("Could not detach from debuggee = {pid}: {reason}")]
    DetachFailed {
        pid: ProcessId,
        reason: String,
    },

    #[error("Unknown or malformed debug event, code = {code}")]
    UnknownEventKind { code: u32 },

    #[error("Invalid session operation `{op}` in state {from:?}")]
    InvalidStateTransition {
        from: LoopState,
        op: &'static str,
    },

    #[error("Could not resume debuggee = {pid}, thread = {tid}")]
    Resume {
        pid: ProcessId,
        tid: ThreadId,
        #[source]
        source: Box<Error>,
    },

    #[error("Could not wait for the next debug event")]
    Wait(#[source] Box<Error>),

    #[error("Debuggee task died while assumed stopped, pid = {pid}")]
    DebuggeeGone {
        pid: ProcessId,
        source: nix::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Input/output error")]
    Io(#[from] io::Error),

    #[error("OS error")]
    Os(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// `true` if the error was caused by a debuggee task disappearing underneath us.
    pub fn debuggee_gone(&self) -> bool {
        match self {
            Error::DebuggeeGone { .. } => true,
            Error::Resume { source, .. } | Error::Wait(source) => source.debuggee_gone(),
            _ => false,
        }
    }

    /// `true` if the error ends a running session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Resume { .. } | Error::Wait(..) | Error::Internal(..))
    }
}

pub(crate) trait ResultExt<T> {
    /// Map an `ESRCH` from a ptrace request on `pid` to [`Error::DebuggeeGone`].
    fn died_if_esrch(self, pid: nix::unistd::Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: nix::unistd::Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::DebuggeeGone { pid: pid.into(), source },
            source => Error::Os(source),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err(crate::error::Error::Internal($msg.into()))
    };
}
