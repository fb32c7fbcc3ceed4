//! Boundary with the operating system.

use std::ffi::OsString;
use std::path::Path;

use crate::error::Result;
use crate::event::ContinuationDisposition;
use crate::raw::RawDebugEvent;
use crate::types::{OsHandle, ProcessId, ThreadId};


/// Identity of a freshly spawned or attached root debuggee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Launched {
    pub process_id: ProcessId,
    pub thread_id: ThreadId,
    pub process_handle: OsHandle,
    pub thread_handle: OsHandle,
}

/// OS debugging primitives consumed by the dispatch loop.
///
/// Every event returned by [`Backend::wait_event()`] leaves its thread halted until the
/// matching [`Backend::resume()`].
pub trait Backend {
    /// Create `program` as a debuggee.
    fn spawn(&mut self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> Result<Launched>;

    /// Start debugging a running process.
    fn attach(&mut self, pid: ProcessId) -> Result<Launched>;

    /// Block until the next debug event.
    fn wait_event(&mut self) -> Result<RawDebugEvent>;

    /// Resume the thread halted by the last event from `pid`/`tid`.
    fn resume(&mut self, pid: ProcessId, tid: ThreadId, disposition: ContinuationDisposition) -> Result<()>;

    /// Terminate a debuggee. Its exit is still reported as an event.
    fn terminate(&mut self, pid: ProcessId) -> Result<()>;

    /// Stop debugging `pid` without killing it.
    fn detach(&mut self, pid: ProcessId) -> Result<()>;

    fn close_handle(&mut self, handle: OsHandle);
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn spawn(&mut self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> Result<Launched> {
        (**self).spawn(program, args, cwd)
    }

    fn attach(&mut self, pid: ProcessId) -> Result<Launched> {
        (**self).attach(pid)
    }

    fn wait_event(&mut self) -> Result<RawDebugEvent> {
        (**self).wait_event()
    }

    fn resume(&mut self, pid: ProcessId, tid: ThreadId, disposition: ContinuationDisposition) -> Result<()> {
        (**self).resume(pid, tid, disposition)
    }

    fn terminate(&mut self, pid: ProcessId) -> Result<()> {
        (**self).terminate(pid)
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()> {
        (**self).detach(pid)
    }

    fn close_handle(&mut self, handle: OsHandle) {
        (**self).close_handle(handle)
    }
}
