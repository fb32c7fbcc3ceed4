//! Typed debug events.

use std::path::PathBuf;

use nix::sys::signal::Signal;

use crate::types::{Address, ExitReason, OsHandle, ProcessId, ThreadId};

/// A translated debug event, with the process and thread it originated from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebugEvent {
    pub process_id: ProcessId,
    pub thread_id: ThreadId,
    pub event: Event,
}

impl DebugEvent {
    pub fn new(process_id: ProcessId, thread_id: ThreadId, event: Event) -> Self {
        Self { process_id, thread_id, event }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    ProcessCreated(ProcessCreated),
    ProcessExited(ProcessExited),
    ThreadCreated(ThreadCreated),
    ThreadExited(ThreadExited),
    ModuleLoaded(ModuleLoaded),
    ModuleUnloaded(ModuleUnloaded),
    ExceptionRaised(ExceptionInfo),
    DebugOutput(DebugOutput),
    FatalSystemEvent(FatalSystemEvent),
}

/// Fieldless tag of an [`Event`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    ProcessCreated,
    ProcessExited,
    ThreadCreated,
    ThreadExited,
    ModuleLoaded,
    ModuleUnloaded,
    ExceptionRaised,
    DebugOutput,
    FatalSystemEvent,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ProcessCreated(_) => EventKind::ProcessCreated,
            Event::ProcessExited(_) => EventKind::ProcessExited,
            Event::ThreadCreated(_) => EventKind::ThreadCreated,
            Event::ThreadExited(_) => EventKind::ThreadExited,
            Event::ModuleLoaded(_) => EventKind::ModuleLoaded,
            Event::ModuleUnloaded(_) => EventKind::ModuleUnloaded,
            Event::ExceptionRaised(_) => EventKind::ExceptionRaised,
            Event::DebugOutput(_) => EventKind::DebugOutput,
            Event::FatalSystemEvent(_) => EventKind::FatalSystemEvent,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessCreated {
    pub process_handle: OsHandle,
    pub thread_handle: OsHandle,
    pub base_address: Address,
    pub start_address: Option<Address>,
    pub image_path: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessExited {
    pub reason: ExitReason,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadCreated {
    pub handle: OsHandle,
    pub start_address: Option<Address>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ThreadExited {
    pub reason: ExitReason,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ModuleLoaded {
    pub path: Option<PathBuf>,
    pub base_address: Address,
    pub size: Option<u64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ModuleUnloaded {
    pub base_address: Address,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DebugOutput {
    pub message: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FatalSystemEvent {
    pub error: u32,
    pub severity: Severity,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    Unspecified,
    Error,
    MinorError,
    Warning,
}

/// An exception raised in the debuggee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExceptionInfo {
    /// Raw exception code, as reported by the backend.
    pub code: u32,
    pub kind: ExceptionKind,
    /// Faulting or trapping address, if known.
    pub address: Address,
    /// `false` if the debuggee already had a chance to handle it.
    pub first_chance: bool,
    pub parameters: Vec<u64>,
}

/// Classification of an exception code.
///
/// This does not imply any continuation policy. Every exception is reported as
/// [`ContinuationDisposition::NotHandled`] unless a hook marks it handled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExceptionKind {
    Breakpoint,
    SingleStep,
    AccessViolation,
    IllegalInstruction,
    DivideByZero,
    Signal(Signal),
    Other,
}

/// What the OS should do with a halted thread when it is resumed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContinuationDisposition {
    /// The event was handled; resume without propagating it to the debuggee.
    Continue,

    /// The exception was not handled; let the debuggee see it.
    NotHandled,
}

impl Default for ContinuationDisposition {
    fn default() -> Self {
        ContinuationDisposition::Continue
    }
}
