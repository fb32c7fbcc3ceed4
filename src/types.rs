//! Identifier newtypes shared by the registries, events, and backends.

use std::fmt;

use nix::sys::signal::Signal;

/// OS identifier of a debuggee process.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ProcessId(pub u32);

/// OS identifier of a debuggee thread.
///
/// Thread identifiers are unique across processes for as long as the thread lives.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThreadId(pub u32);

/// Virtual address in a debuggee's address space.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Address(pub u64);

/// Opaque OS handle minted by a [`Backend`](crate::backend::Backend).
///
/// The core never interprets handle values. It only hands them back to the backend
/// that issued them, to be closed when the owning record is destroyed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct OsHandle(pub u64);

impl OsHandle {
    /// Placeholder for records the OS did not supply a handle for.
    pub const INVALID: OsHandle = OsHandle(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl ProcessId {
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl ThreadId {
    pub fn as_raw(self) -> u32 {
        self.0
    }
}

impl Address {
    pub fn as_raw(self) -> u64 {
        self.0
    }

    pub fn checked_add(self, off: u64) -> Option<Address> {
        self.0.checked_add(off).map(Address)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        ProcessId(pid.as_raw() as u32)
    }
}

impl From<nix::unistd::Pid> for ThreadId {
    fn from(pid: nix::unistd::Pid) -> Self {
        ThreadId(pid.as_raw() as u32)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// How a process or thread ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    /// Normal exit with the given code.
    Code(i32),

    /// Terminated by a signal.
    Signaled { signal: Signal, core_dumped: bool },
}

impl ExitReason {
    pub fn code(self) -> Option<i32> {
        match self {
            ExitReason::Code(code) => Some(code),
            ExitReason::Signaled { .. } => None,
        }
    }

    pub fn success(self) -> bool {
        self == ExitReason::Code(0)
    }
}
