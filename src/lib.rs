//! A debug-event dispatch loop, with a live model of the processes, threads, and modules
//! of everything being debugged.
//!
//! A [`Session`] pulls raw events from a [`Backend`], translates them, keeps the
//! [`ProcessRegistry`] current, and hands each event to user [`Hooks`].

#[macro_use]
pub mod error;

pub mod backend;
pub mod dispatch;
pub mod event;
pub mod hooks;
pub mod options;
pub mod raw;
pub mod registry;
pub mod scripted;
pub mod session;
pub mod translate;
pub mod types;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub mod procfs;
#[cfg(target_os = "linux")]
pub mod ptracer;

pub use backend::{Backend, Launched};
pub use dispatch::{Dispatched, Dispatcher, LoopState};
pub use error::{Error, Result};
pub use event::{
    ContinuationDisposition,
    DebugEvent,
    DebugOutput,
    Event,
    EventKind,
    ExceptionInfo,
    ExceptionKind,
    FatalSystemEvent,
    ModuleLoaded,
    ModuleUnloaded,
    ProcessCreated,
    ProcessExited,
    Severity,
    ThreadCreated,
    ThreadExited,
};
pub use hooks::{Context, Hooks, Requests};
pub use options::Options;
pub use raw::RawDebugEvent;
pub use registry::{ModuleRecord, ProcessRegistry, ProcessState, RegistryError, ThreadState};
pub use scripted::ScriptedBackend;
pub use session::{args, Session, SessionControl};
pub use types::{Address, ExitReason, OsHandle, ProcessId, ThreadId};

#[cfg(target_os = "linux")]
pub use linux::PtraceBackend;

pub use nix::sys::signal::Signal;
