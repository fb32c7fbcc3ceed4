//! Raw debug-event records, as delivered by a backend.
//!
//! A record pairs a numeric event `code` with a payload. The two are carried separately
//! because the OS stream is not trusted to agree with itself: the translator checks
//! that they match before producing a typed [`Event`](crate::event::Event).

use std::path::PathBuf;

/// Numeric debug-event codes.
pub mod code {
    pub const EXCEPTION: u32 = 1;
    pub const CREATE_THREAD: u32 = 2;
    pub const CREATE_PROCESS: u32 = 3;
    pub const EXIT_THREAD: u32 = 4;
    pub const EXIT_PROCESS: u32 = 5;
    pub const LOAD_MODULE: u32 = 6;
    pub const UNLOAD_MODULE: u32 = 7;
    pub const OUTPUT_STRING: u32 = 8;
    pub const FATAL: u32 = 9;
}

/// Exception codes carried by [`RawException::code`].
pub mod exception {
    pub const BREAKPOINT: u32 = 0x8000_0003;
    pub const SINGLE_STEP: u32 = 0x8000_0004;
    pub const ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
    pub const INTEGER_DIVIDE_BY_ZERO: u32 = 0xC000_0094;

    /// Base for exceptions that are plain POSIX signals. The low byte is the signal number.
    pub const SIGNAL_BASE: u32 = 0xE000_0000;

    pub fn from_signal(signo: i32) -> u32 {
        SIGNAL_BASE | (signo as u32 & 0xff)
    }
}

/// Severity of a fatal system event.
pub mod severity {
    pub const UNSPECIFIED: u32 = 0;
    pub const ERROR: u32 = 1;
    pub const MINOR_ERROR: u32 = 2;
    pub const WARNING: u32 = 3;
}

/// One debug-event record, exactly as the backend observed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawDebugEvent {
    pub code: u32,
    pub process_id: u32,
    pub thread_id: u32,
    pub info: RawEventInfo,
}

impl RawDebugEvent {
    pub fn new(code: u32, process_id: u32, thread_id: u32, info: RawEventInfo) -> Self {
        Self { code, process_id, thread_id, info }
    }

    pub fn create_process(pid: u32, tid: u32, process_handle: u64, base_address: u64, image_path: Option<PathBuf>) -> Self {
        let info = RawEventInfo::CreateProcess {
            process_handle,
            thread_handle: tid as u64,
            base_address,
            start_address: 0,
            image_path,
        };
        Self::new(code::CREATE_PROCESS, pid, tid, info)
    }

    pub fn exit_process(pid: u32, tid: u32, exit: RawExit) -> Self {
        Self::new(code::EXIT_PROCESS, pid, tid, RawEventInfo::ExitProcess(exit))
    }

    pub fn create_thread(pid: u32, tid: u32) -> Self {
        let info = RawEventInfo::CreateThread { handle: tid as u64, start_address: 0 };
        Self::new(code::CREATE_THREAD, pid, tid, info)
    }

    pub fn exit_thread(pid: u32, tid: u32, exit: RawExit) -> Self {
        Self::new(code::EXIT_THREAD, pid, tid, RawEventInfo::ExitThread(exit))
    }

    pub fn load_module(pid: u32, tid: u32, path: impl Into<PathBuf>, base_address: u64, size: u64) -> Self {
        let info = RawEventInfo::LoadModule { path: Some(path.into()), base_address, size };
        Self::new(code::LOAD_MODULE, pid, tid, info)
    }

    pub fn unload_module(pid: u32, tid: u32, base_address: u64) -> Self {
        Self::new(code::UNLOAD_MODULE, pid, tid, RawEventInfo::UnloadModule { base_address })
    }

    pub fn exception(pid: u32, tid: u32, code: u32, address: u64) -> Self {
        let info = RawEventInfo::Exception(RawException {
            code,
            address,
            first_chance: true,
            parameters: vec![],
        });
        Self::new(self::code::EXCEPTION, pid, tid, info)
    }

    pub fn output(pid: u32, tid: u32, message: &str) -> Self {
        let info = RawEventInfo::OutputString { data: message.as_bytes().to_vec(), unicode: false };
        Self::new(code::OUTPUT_STRING, pid, tid, info)
    }

    pub fn fatal(pid: u32, tid: u32, error: u32, severity: u32) -> Self {
        Self::new(code::FATAL, pid, tid, RawEventInfo::Fatal { error, severity })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawEventInfo {
    Exception(RawException),
    CreateThread {
        handle: u64,
        start_address: u64,
    },
    CreateProcess {
        process_handle: u64,
        thread_handle: u64,
        base_address: u64,
        start_address: u64,
        image_path: Option<PathBuf>,
    },
    ExitThread(RawExit),
    ExitProcess(RawExit),
    LoadModule {
        path: Option<PathBuf>,
        base_address: u64,
        size: u64,
    },
    UnloadModule {
        base_address: u64,
    },
    OutputString {
        data: Vec<u8>,
        unicode: bool,
    },
    Fatal {
        error: u32,
        severity: u32,
    },
    /// No payload. Never valid for a known event code.
    Empty,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawException {
    pub code: u32,
    pub address: u64,
    pub first_chance: bool,
    pub parameters: Vec<u64>,
}

/// Exit details. `signal` is zero for a normal exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RawExit {
    pub code: i32,
    pub signal: i32,
    pub core_dumped: bool,
}

impl RawExit {
    pub fn code(code: i32) -> Self {
        Self { code, signal: 0, core_dumped: false }
    }

    pub fn signaled(signal: i32, core_dumped: bool) -> Self {
        Self { code: 0, signal, core_dumped }
    }
}
