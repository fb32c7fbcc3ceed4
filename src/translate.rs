//! Conversion of raw debug-event records into typed [`DebugEvent`]s.

use std::convert::TryFrom;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};
use crate::event::*;
use crate::raw::{code, exception, severity, RawDebugEvent, RawEventInfo, RawException, RawExit};
use crate::types::{Address, ExitReason, OsHandle, ProcessId, ThreadId};


/// Translate one raw record into exactly one typed event.
///
/// Fails with [`Error::UnknownEventKind`] if the code is unknown, or if the payload does
/// not match the code. Never blocks.
pub fn translate(raw: RawDebugEvent) -> Result<DebugEvent> {
    let RawDebugEvent { code, process_id, thread_id, info } = raw;
    let unknown = || Error::UnknownEventKind { code };

    let event = match (code, info) {
        (code::EXCEPTION, RawEventInfo::Exception(exc)) => {
            Event::ExceptionRaised(exception_info(exc))
        },
        (code::CREATE_THREAD, RawEventInfo::CreateThread { handle, start_address }) => {
            Event::ThreadCreated(ThreadCreated {
                handle: OsHandle(handle),
                start_address: nonzero(start_address),
            })
        },
        (code::CREATE_PROCESS, RawEventInfo::CreateProcess {
            process_handle,
            thread_handle,
            base_address,
            start_address,
            image_path,
        }) => {
            Event::ProcessCreated(ProcessCreated {
                process_handle: OsHandle(process_handle),
                thread_handle: OsHandle(thread_handle),
                base_address: Address(base_address),
                start_address: nonzero(start_address),
                image_path,
            })
        },
        (code::EXIT_THREAD, RawEventInfo::ExitThread(exit)) => {
            let reason = exit_reason(exit).ok_or_else(unknown)?;
            Event::ThreadExited(ThreadExited { reason })
        },
        (code::EXIT_PROCESS, RawEventInfo::ExitProcess(exit)) => {
            let reason = exit_reason(exit).ok_or_else(unknown)?;
            Event::ProcessExited(ProcessExited { reason })
        },
        (code::LOAD_MODULE, RawEventInfo::LoadModule { path, base_address, size }) => {
            Event::ModuleLoaded(ModuleLoaded {
                path,
                base_address: Address(base_address),
                size: if size == 0 { None } else { Some(size) },
            })
        },
        (code::UNLOAD_MODULE, RawEventInfo::UnloadModule { base_address }) => {
            Event::ModuleUnloaded(ModuleUnloaded { base_address: Address(base_address) })
        },
        (code::OUTPUT_STRING, RawEventInfo::OutputString { data, unicode }) => {
            Event::DebugOutput(DebugOutput { message: decode_output(&data, unicode) })
        },
        (code::FATAL, RawEventInfo::Fatal { error, severity }) => {
            Event::FatalSystemEvent(FatalSystemEvent {
                error,
                severity: severity_of(severity),
            })
        },
        _ => return Err(unknown()),
    };

    Ok(DebugEvent::new(ProcessId(process_id), ThreadId(thread_id), event))
}

fn nonzero(addr: u64) -> Option<Address> {
    if addr == 0 {
        None
    } else {
        Some(Address(addr))
    }
}

fn exit_reason(exit: RawExit) -> Option<ExitReason> {
    if exit.signal == 0 {
        return Some(ExitReason::Code(exit.code));
    }

    let signal = Signal::try_from(exit.signal).ok()?;
    Some(ExitReason::Signaled { signal, core_dumped: exit.core_dumped })
}

fn exception_info(exc: RawException) -> ExceptionInfo {
    let RawException { code, address, first_chance, parameters } = exc;

    let kind = match code {
        exception::BREAKPOINT => ExceptionKind::Breakpoint,
        exception::SINGLE_STEP => ExceptionKind::SingleStep,
        exception::ACCESS_VIOLATION => ExceptionKind::AccessViolation,
        exception::ILLEGAL_INSTRUCTION => ExceptionKind::IllegalInstruction,
        exception::INTEGER_DIVIDE_BY_ZERO => ExceptionKind::DivideByZero,
        code if code & 0xffff_ff00 == exception::SIGNAL_BASE => {
            match Signal::try_from((code & 0xff) as i32) {
                Ok(signal) => ExceptionKind::Signal(signal),
                Err(_) => ExceptionKind::Other,
            }
        },
        _ => ExceptionKind::Other,
    };

    ExceptionInfo {
        code,
        kind,
        address: Address(address),
        first_chance,
        parameters,
    }
}

fn severity_of(raw: u32) -> Severity {
    match raw {
        severity::ERROR => Severity::Error,
        severity::MINOR_ERROR => Severity::MinorError,
        severity::WARNING => Severity::Warning,
        _ => Severity::Unspecified,
    }
}

// Debug output is NUL-terminated in practice. Stop at the first terminator.
fn decode_output(data: &[u8], unicode: bool) -> String {
    if unicode {
        let units: Vec<u16> = data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        String::from_utf8_lossy(&data[..end]).into_owned()
    }
}
