use anyhow::Result;
use pretty_assertions::assert_eq;
use tether::raw::{code, exception, severity, RawEventInfo, RawExit};
use tether::scripted::Call;
use tether::*;

#[allow(unused_macros)]
#[macro_use]
mod support;
use support::*;

use ContinuationDisposition::{Continue, NotHandled};

const APP: &str = "/opt/app/bin/app";

fn create_root() -> RawDebugEvent {
    RawDebugEvent::create_process(100, 1, 100, 0x40_0000, Some(APP.into()))
}

fn exit_root(code: i32) -> RawDebugEvent {
    RawDebugEvent::exit_process(100, 1, RawExit::code(code))
}

fn session<H: Hooks>(backend: ScriptedBackend, hooks: H) -> Result<Session<ScriptedBackend, H>> {
    let mut session = Session::new(backend, hooks);
    session.init(APP, &[], None)?;
    Ok(session)
}

#[test]
fn test_breakpoint_in_second_thread() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::create_thread(100, 2),
        RawDebugEvent::load_module(100, 1, "/lib/libc.so.6", 0x7000_0000, 0x1000),
        RawDebugEvent::exception(100, 2, exception::BREAKPOINT, 0x40_1000),
        RawDebugEvent::exit_thread(100, 2, RawExit::code(0)),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![
        seen!(100, 1, ProcessCreated),
        seen!(100, 2, ThreadCreated),
        seen!(100, 1, ModuleLoaded),
        seen!(100, 2, ExceptionRaised),
        seen!(100, 2, ThreadExited),
        seen!(100, 1, ProcessExited),
    ]);

    // Each hook sees the registry after the event was applied.
    assert_eq!(session.hooks().registered, vec![true, true, true, true, true, false]);

    let exc = &session.hooks().exceptions[0];
    assert_eq!(exc.kind, ExceptionKind::Breakpoint);
    assert_eq!(exc.address, Address(0x40_1000));
    assert!(exc.first_chance);

    assert_eq!(session.backend().resumed(), vec![Continue, Continue, Continue, NotHandled, Continue, Continue]);
    assert_eq!(session.backend().closed_handles(), vec![OsHandle(2), OsHandle(1), OsHandle(100)]);
    assert_eq!(session.hooks().exits, vec![(100, ExitReason::Code(0))]);

    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());
    assert_eq!(session.backend().remaining(), 0);

    Ok(())
}

#[test]
fn test_registry_follows_every_event() -> Result<()> {
    // Per hook call: event kind, process count, thread count, and whether thread 2 is
    // visible.
    #[derive(Default)]
    struct Census(Vec<(EventKind, usize, usize, bool)>);

    impl Census {
        fn count(&mut self, ctx: &Context<'_>, kind: EventKind) {
            let registry = ctx.registry();
            let visible = registry.lookup_thread(ThreadId(2)).is_some();
            self.0.push((kind, registry.len(), registry.thread_count(), visible));
        }
    }

    impl Hooks for Census {
        fn process_created(&mut self, ctx: &mut Context<'_>, _info: &ProcessCreated) {
            self.count(ctx, EventKind::ProcessCreated);
        }

        fn process_exited(&mut self, ctx: &mut Context<'_>, _info: &ProcessExited) {
            self.count(ctx, EventKind::ProcessExited);
        }

        fn thread_created(&mut self, ctx: &mut Context<'_>, _info: &ThreadCreated) {
            self.count(ctx, EventKind::ThreadCreated);
        }

        fn thread_exited(&mut self, ctx: &mut Context<'_>, _info: &ThreadExited) {
            self.count(ctx, EventKind::ThreadExited);
        }

        fn exception(&mut self, ctx: &mut Context<'_>, _info: &ExceptionInfo) {
            self.count(ctx, EventKind::ExceptionRaised);
        }
    }

    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::create_thread(100, 2),
        RawDebugEvent::exit_thread(100, 2, RawExit::code(0)),
        RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0x40_1000),
        exit_root(0),
    ]);

    let mut session = session(backend, Census::default())?;
    session.start()?;

    assert_eq!(session.hooks().0, vec![
        (EventKind::ProcessCreated, 1, 1, false),
        (EventKind::ThreadCreated, 1, 2, true),
        (EventKind::ThreadExited, 1, 1, false),
        (EventKind::ExceptionRaised, 1, 1, false),
        (EventKind::ProcessExited, 0, 0, false),
    ]);

    assert_eq!(session.backend().resumed(), vec![Continue, Continue, Continue, NotHandled, Continue]);
    assert!(session.registry().lookup_thread(ThreadId(2)).is_none());
    assert!(session.registry().is_empty());
    assert_eq!(session.state(), LoopState::Terminated);

    Ok(())
}

#[test]
fn test_handled_exception_continues() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::exception(100, 1, exception::ACCESS_VIOLATION, 0xdead_0000),
        RawDebugEvent::exception(100, 1, exception::from_signal(Signal::SIGUSR1 as i32), 0),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::handling_exceptions())?;
    session.start()?;

    assert_eq!(session.backend().resumed(), vec![Continue, Continue, Continue, Continue]);

    let kinds: Vec<ExceptionKind> = session.hooks().exceptions.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ExceptionKind::AccessViolation, ExceptionKind::Signal(Signal::SIGUSR1)]);

    Ok(())
}

#[test]
fn test_hook_sees_current_process_and_thread() -> Result<()> {
    struct Inspect(Vec<(Option<u32>, Option<u32>, bool)>);

    impl Hooks for Inspect {
        fn exception(&mut self, ctx: &mut Context<'_>, _info: &ExceptionInfo) {
            let process = ctx.current_process().map(|p| p.id.as_raw());
            let thread = ctx.current_thread().map(|t| t.id.as_raw());
            self.0.push((process, thread, ctx.is_root()));
        }
    }

    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::create_process(200, 7, 200, 0x40_0000, None),
        RawDebugEvent::exception(200, 7, exception::BREAKPOINT, 0),
        RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0),
        exit_root(0),
    ]);

    let mut session = session(backend, Inspect(vec![]))?;
    session.start()?;

    assert_eq!(session.hooks().0, vec![(Some(200), Some(7), false), (Some(100), Some(1), true)]);

    Ok(())
}

#[test]
fn test_stop_requested_from_hook() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::stopping_on(EventKind::ProcessCreated))?;
    session.hooks_mut().control = Some(session.control());
    session.start()?;

    assert_equivalent(&session.hooks().seen, &[
        seen!(100, 1, ProcessCreated),
        seen!(100, 1, ProcessExited),
    ]);
    assert_eq!(session.hooks().states, vec![LoopState::Running, LoopState::Stopping]);

    let killed = ExitReason::Signaled { signal: Signal::SIGKILL, core_dumped: false };
    assert_eq!(session.hooks().exits, vec![(100, killed)]);

    let terminates = session
        .backend()
        .calls()
        .iter()
        .filter(|call| **call == Call::Terminate(ProcessId(100)))
        .count();
    assert_eq!(terminates, 1);

    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
fn test_stop_failure_keeps_debugging() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1)
        .events(vec![
            create_root(),
            RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0),
            exit_root(0),
        ])
        .fail_terminate();

    let mut session = session(backend, Recorder::stopping_on(EventKind::ProcessCreated))?;
    session.hooks_mut().control = Some(session.control());
    session.start()?;

    assert_eq!(session.hooks().seen, vec![
        seen!(100, 1, ProcessCreated),
        seen!(100, 1, ExceptionRaised),
        seen!(100, 1, ProcessExited),
    ]);

    // The loop fell back to running once the terminate request failed.
    assert_eq!(session.hooks().states, vec![LoopState::Running; 3]);
    assert_eq!(session.hooks().exits, vec![(100, ExitReason::Code(0))]);

    let calls = session.backend().calls();
    assert_eq!(&calls[..4], &[
        Call::Spawn(APP.into()),
        Call::Wait,
        Call::Resume(ProcessId(100), ThreadId(1), Continue),
        Call::Terminate(ProcessId(100)),
    ]);
    assert_eq!(calls.iter().filter(|call| matches!(call, Call::Terminate(_))).count(), 1);
    assert_eq!(session.backend().resumed(), vec![Continue, NotHandled, Continue]);

    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
fn test_stop_reports_terminate_failure() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1)
        .events(vec![create_root(), exit_root(0)])
        .fail_terminate();

    let mut session = session(backend, Recorder::new())?;

    let err = session.stop().unwrap_err();
    assert!(matches!(err, Error::TerminateFailed { pid: ProcessId(100), .. }));

    // Nothing changed, so the session still runs to the root's own exit.
    assert_eq!(session.state(), LoopState::Idle);
    session.start()?;

    assert_eq!(session.hooks().exits, vec![(100, ExitReason::Code(0))]);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
fn test_detach_requested_from_hook() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::create_thread(100, 2),
        RawDebugEvent::exception(100, 2, exception::BREAKPOINT, 0),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::detaching_on(EventKind::ThreadCreated))?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessCreated), seen!(100, 2, ThreadCreated)]);

    let calls = session.backend().calls();
    assert!(calls.contains(&Call::Detach(ProcessId(100))));
    assert!(!calls.contains(&Call::Terminate(ProcessId(100))));

    assert_eq!(session.backend().closed_handles(), vec![OsHandle(1), OsHandle(2), OsHandle(100)]);
    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
fn test_failed_detach_keeps_debugging() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1)
        .events(vec![create_root(), exit_root(3)])
        .fail_detach();

    let mut session = session(backend, Recorder::detaching_on(EventKind::ProcessCreated))?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessCreated), seen!(100, 1, ProcessExited)]);
    assert_eq!(session.hooks().exits, vec![(100, ExitReason::Code(3))]);
    assert_eq!(session.state(), LoopState::Terminated);

    Ok(())
}

#[test]
fn test_start_requires_root() {
    let mut session = Session::new(ScriptedBackend::new(100, 1), ());

    let err = session.start().unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { from: LoopState::Idle, op: "start" }));
}

#[test]
fn test_failed_init_leaves_session_unstartable() {
    let backend = ScriptedBackend::new(100, 1).event(create_root()).fail_spawn();
    let mut session = Session::new(backend, Recorder::new());

    let err = session.init(APP, &args(["--flag"]), None).unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { .. }));
    assert!(session.root().is_none());

    let err = session.start().unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
    assert!(session.hooks().seen.is_empty());
}

#[test]
fn test_failed_attach_leaves_session_unstartable() {
    let backend = ScriptedBackend::new(100, 1).fail_attach();
    let mut session = Session::new(backend, ());

    let err = session.attach(ProcessId(300)).unwrap_err();
    assert!(matches!(err, Error::AttachFailed { .. }));
    assert!(session.start().is_err());
}

#[test]
fn test_attach_then_start() -> Result<()> {
    let backend = ScriptedBackend::new(300, 300).events(vec![
        RawDebugEvent::create_process(300, 300, 300, 0x40_0000, None),
        RawDebugEvent::create_thread(300, 301),
        RawDebugEvent::exit_thread(300, 301, RawExit::code(0)),
        RawDebugEvent::exit_process(300, 300, RawExit::code(0)),
    ]);

    let mut session = Session::new(backend, Recorder::new());
    session.attach(ProcessId(300))?;
    assert_eq!(session.root().map(|r| r.process_id), Some(ProcessId(300)));

    session.start()?;

    assert_eq!(session.hooks().seen.len(), 4);
    assert_eq!(session.backend().calls()[0], Call::Attach(ProcessId(300)));

    Ok(())
}

#[test]
fn test_unknown_and_malformed_events_are_skipped() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::new(42, 100, 1, RawEventInfo::Empty),
        RawDebugEvent::new(code::EXCEPTION, 100, 1, RawEventInfo::Empty),
        RawDebugEvent::exit_thread(100, 1, RawExit::signaled(1000, false)),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessCreated), seen!(100, 1, ProcessExited)]);
    assert_eq!(session.backend().resumed(), vec![Continue; 5]);

    Ok(())
}

#[test]
fn test_resume_failure_ends_session() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1)
        .events(vec![
            create_root(),
            RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0),
            exit_root(0),
        ])
        .fail_resume_after(1);

    let mut session = session(backend, Recorder::new())?;
    let err = session.start().unwrap_err();

    assert!(matches!(err, Error::Resume { .. }));
    assert!(err.is_fatal());
    assert!(err.debuggee_gone());

    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    // Leftovers are killed by default.
    assert!(session.backend().calls().contains(&Call::Terminate(ProcessId(100))));

    Ok(())
}

#[test]
fn test_wait_failure_ends_session() -> Result<()> {
    // The script runs dry before the root exits.
    let backend = ScriptedBackend::new(100, 1).event(create_root());

    let mut session = session(backend, Recorder::new())?;
    let err = session.start().unwrap_err();

    assert!(matches!(err, Error::Wait(..)));
    assert_eq!(session.state(), LoopState::Terminated);

    Ok(())
}

#[test]
fn test_repeated_module_unload_is_harmless() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::load_module(100, 1, "/lib/libm.so.6", 0x7100_0000, 0x2000),
        RawDebugEvent::unload_module(100, 1, 0x7100_0000),
        RawDebugEvent::unload_module(100, 1, 0x7100_0000),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    let unloads = session
        .hooks()
        .seen
        .iter()
        .filter(|s| s.kind == EventKind::ModuleUnloaded)
        .count();
    assert_eq!(unloads, 2);
    assert_eq!(session.hooks().modules[0].size, Some(0x2000));

    Ok(())
}

#[test]
fn test_module_lookup_from_hook() -> Result<()> {
    struct Lookup(Vec<Option<String>>);

    impl Hooks for Lookup {
        fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {
            let module = ctx
                .current_process()
                .and_then(|p| p.modules().containing(info.address))
                .and_then(|m| m.path.as_ref())
                .map(|path| path.display().to_string());
            self.0.push(module);
        }
    }

    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::load_module(100, 1, "/lib/libz.so.1", 0x7200_0000, 0x1000),
        RawDebugEvent::exception(100, 1, exception::ACCESS_VIOLATION, 0x7200_0800),
        RawDebugEvent::exception(100, 1, exception::ACCESS_VIOLATION, 0x7200_1000),
        exit_root(0),
    ]);

    let mut session = session(backend, Lookup(vec![]))?;
    session.start()?;

    assert_eq!(session.hooks().0, vec![Some("/lib/libz.so.1".to_owned()), None]);

    Ok(())
}

#[test]
fn test_fatal_event_ends_session_without_resume() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::fatal(100, 1, 5, severity::ERROR),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessCreated), seen!(100, 1, FatalSystemEvent)]);
    assert_eq!(session.backend().resumed(), vec![Continue]);
    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
fn test_debug_output_is_decoded() -> Result<()> {
    let utf16: Vec<u8> = "wide\0junk".encode_utf16().flat_map(u16::to_le_bytes).collect();

    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::output(100, 1, "hello\0"),
        RawDebugEvent::new(code::OUTPUT_STRING, 100, 1, RawEventInfo::OutputString { data: utf16, unicode: true }),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert_eq!(session.hooks().output, vec!["hello".to_owned(), "wide".to_owned()]);

    Ok(())
}

#[test]
fn test_stop_from_another_thread() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::exception(100, 1, exception::BREAKPOINT, 0),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    let control = session.control();

    std::thread::spawn(move || control.request_stop()).join().expect("control thread panicked");

    let control = session.control();
    session.start()?;

    // The stop is observed before the first event is fetched.
    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessExited)]);
    assert_eq!(control.state(), LoopState::Terminated);

    Ok(())
}

#[test]
fn test_child_exit_keeps_session_running() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![
        create_root(),
        RawDebugEvent::create_process(200, 5, 200, 0x40_0000, Some(APP.into())),
        RawDebugEvent::exit_process(200, 5, RawExit::code(7)),
        exit_root(0),
    ]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert_eq!(session.hooks().exits, vec![(200, ExitReason::Code(7)), (100, ExitReason::Code(0))]);
    assert_eq!(session.hooks().registered.last(), Some(&false));

    Ok(())
}

#[test]
fn test_leftover_children_are_killed_or_detached() -> Result<()> {
    for kill_on_exit in [true, false] {
        let backend = ScriptedBackend::new(100, 1).events(vec![
            create_root(),
            RawDebugEvent::create_process(200, 5, 200, 0x40_0000, None),
            exit_root(0),
        ]);

        let mut options = Options::new();
        options.set_kill_on_exit(kill_on_exit);

        let mut session = Session::with_options(backend, Recorder::new(), options);
        session.init(APP, &[], None)?;
        session.start()?;

        let calls = session.backend().calls();
        assert_eq!(calls.contains(&Call::Terminate(ProcessId(200))), kill_on_exit);
        assert_eq!(calls.contains(&Call::Detach(ProcessId(200))), !kill_on_exit);

        assert_eq!(session.backend().closed_handles(), vec![OsHandle(1), OsHandle(100), OsHandle(5), OsHandle(200)]);
        assert!(session.registry().is_empty());
    }

    Ok(())
}

#[test]
fn test_stop_before_start() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![create_root(), exit_root(0)]);

    let mut session = session(backend, Recorder::new())?;
    session.stop()?;
    session.start()?;

    assert_eq!(session.hooks().seen, vec![seen!(100, 1, ProcessExited)]);

    // Never registered, so the launched handles are closed by the session.
    assert_eq!(session.backend().closed_handles(), vec![OsHandle(100), OsHandle(1)]);

    Ok(())
}

#[test]
fn test_detach_before_start() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![create_root(), exit_root(0)]);

    let mut session = session(backend, ())?;
    session.detach()?;

    assert!(session.root().is_none());
    assert_eq!(session.state(), LoopState::Idle);
    assert_eq!(session.backend().remaining(), 0);
    assert_eq!(session.backend().closed_handles(), vec![OsHandle(100), OsHandle(1)]);

    assert!(session.start().is_err());

    Ok(())
}

#[test]
fn test_session_operations_after_termination() -> Result<()> {
    let backend = ScriptedBackend::new(100, 1).events(vec![create_root(), exit_root(0), create_root(), exit_root(1)]);

    let mut session = session(backend, Recorder::new())?;
    session.start()?;

    assert!(matches!(session.stop(), Err(Error::InvalidStateTransition { from: LoopState::Terminated, .. })));
    assert!(matches!(session.detach(), Err(Error::InvalidStateTransition { from: LoopState::Terminated, .. })));
    assert!(session.start().is_err());

    // A terminated session can be reused for a new root.
    session.init(APP, &[], None)?;
    assert_eq!(session.state(), LoopState::Idle);
    session.start()?;

    assert_eq!(session.hooks().exits, vec![(100, ExitReason::Code(0)), (100, ExitReason::Code(1))]);

    Ok(())
}
