//! A backend that replays a fixed script of raw debug events.
//!
//! Useful for exercising [`Hooks`](crate::Hooks) implementations without a live debuggee.
//! Every backend call is recorded, so tests can check what the loop asked of the OS.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use tracing::trace;

use crate::backend::{Backend, Launched};
use crate::error::{Error, Result};
use crate::event::ContinuationDisposition;
use crate::raw::{RawDebugEvent, RawExit};
use crate::types::{OsHandle, ProcessId, ThreadId};


/// A backend request, as recorded by [`ScriptedBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    Spawn(PathBuf),
    Attach(ProcessId),
    Wait,
    Resume(ProcessId, ThreadId, ContinuationDisposition),
    Terminate(ProcessId),
    Detach(ProcessId),
    CloseHandle(OsHandle),
}

#[derive(Clone, Debug)]
pub struct ScriptedBackend {
    launched: Launched,
    script: VecDeque<RawDebugEvent>,
    calls: Vec<Call>,
    fail_spawn: bool,
    fail_attach: bool,
    fail_terminate: bool,
    fail_detach: bool,
    fail_resume_after: Option<usize>,
    resumes: usize,
}

impl ScriptedBackend {
    /// Script a root debuggee `pid` whose main thread is `tid`.
    pub fn new(pid: u32, tid: u32) -> Self {
        let launched = Launched {
            process_id: ProcessId(pid),
            thread_id: ThreadId(tid),
            process_handle: OsHandle(pid as u64),
            thread_handle: OsHandle(tid as u64),
        };

        Self {
            launched,
            script: VecDeque::new(),
            calls: vec![],
            fail_spawn: false,
            fail_attach: false,
            fail_terminate: false,
            fail_detach: false,
            fail_resume_after: None,
            resumes: 0,
        }
    }

    pub fn event(mut self, event: RawDebugEvent) -> Self {
        self.script.push_back(event);
        self
    }

    pub fn events(mut self, events: impl IntoIterator<Item = RawDebugEvent>) -> Self {
        self.script.extend(events);
        self
    }

    pub fn fail_spawn(mut self) -> Self {
        self.fail_spawn = true;
        self
    }

    pub fn fail_attach(mut self) -> Self {
        self.fail_attach = true;
        self
    }

    pub fn fail_terminate(mut self) -> Self {
        self.fail_terminate = true;
        self
    }

    pub fn fail_detach(mut self) -> Self {
        self.fail_detach = true;
        self
    }

    /// Fail every resume after the first `n` succeed.
    pub fn fail_resume_after(mut self, n: usize) -> Self {
        self.fail_resume_after = Some(n);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn resumed(&self) -> Vec<ContinuationDisposition> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Resume(_, _, disposition) => Some(*disposition),
                _ => None,
            })
            .collect()
    }

    pub fn closed_handles(&self) -> Vec<OsHandle> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::CloseHandle(handle) => Some(*handle),
                _ => None,
            })
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl Backend for ScriptedBackend {
    fn spawn(&mut self, program: &Path, _args: &[OsString], _cwd: Option<&Path>) -> Result<Launched> {
        self.calls.push(Call::Spawn(program.to_owned()));

        if self.fail_spawn {
            let source = io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure");
            return Err(Error::SpawnFailed { program: program.to_owned(), source });
        }

        Ok(self.launched)
    }

    fn attach(&mut self, pid: ProcessId) -> Result<Launched> {
        self.calls.push(Call::Attach(pid));

        if self.fail_attach {
            return Err(Error::AttachFailed { pid, source: Errno::EPERM });
        }

        self.launched.process_id = pid;
        Ok(self.launched)
    }

    fn wait_event(&mut self) -> Result<RawDebugEvent> {
        self.calls.push(Call::Wait);

        match self.script.pop_front() {
            Some(event) => {
                trace!(code = event.code, pid = event.process_id, "replaying scripted event");
                Ok(event)
            },
            None => internal_error!("debug event script exhausted"),
        }
    }

    fn resume(&mut self, pid: ProcessId, tid: ThreadId, disposition: ContinuationDisposition) -> Result<()> {
        self.calls.push(Call::Resume(pid, tid, disposition));
        self.resumes += 1;

        match self.fail_resume_after {
            Some(n) if self.resumes > n => Err(Error::DebuggeeGone { pid, source: Errno::ESRCH }),
            _ => Ok(()),
        }
    }

    // Like a real kill: events already queued for `pid` are lost, and its exit follows.
    fn terminate(&mut self, pid: ProcessId) -> Result<()> {
        self.calls.push(Call::Terminate(pid));

        if self.fail_terminate {
            return Err(Error::TerminateFailed { pid, source: Errno::EPERM });
        }

        self.script.retain(|event| event.process_id != pid.as_raw());

        let exit = RawExit::signaled(Signal::SIGKILL as i32, false);
        let tid = if pid == self.launched.process_id {
            self.launched.thread_id.as_raw()
        } else {
            pid.as_raw()
        };
        self.script.push_front(RawDebugEvent::exit_process(pid.as_raw(), tid, exit));

        Ok(())
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()> {
        self.calls.push(Call::Detach(pid));

        if self.fail_detach {
            return Err(Error::DetachFailed {
                pid,
                reason: "scripted detach failure".into(),
            });
        }

        self.script.retain(|event| event.process_id != pid.as_raw());
        Ok(())
    }

    fn close_handle(&mut self, handle: OsHandle) {
        self.calls.push(Call::CloseHandle(handle));
    }
}
