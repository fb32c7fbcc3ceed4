#![cfg(target_os = "linux")]

use std::process::Command;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use tether::*;

#[allow(unused_macros)]
#[macro_use]
mod support;
use support::*;

fn spawn<H: Hooks>(hooks: H, program: &str, argv: &[&str]) -> Result<Session<PtraceBackend, H>> {
    spawn_with(Options::new(), hooks, program, argv)
}

fn spawn_with<H: Hooks>(options: Options, hooks: H, program: &str, argv: &[&str]) -> Result<Session<PtraceBackend, H>> {
    let backend = PtraceBackend::with_options(options.clone());
    let mut session = Session::with_options(backend, hooks, options);
    session.init(program, &args(argv.iter().copied()), None)?;
    Ok(session)
}

fn count(recorder: &Recorder, kind: EventKind) -> usize {
    recorder.seen.iter().filter(|s| s.kind == kind).count()
}

#[test]
#[timeout(2000)]
fn test_spawn_and_exit() -> Result<()> {
    let mut session = spawn(Recorder::new(), "true", &[])?;
    let root = session.root().map(|r| r.process_id.as_raw()).unwrap_or_default();

    session.start()?;

    assert_equivalent(&session.hooks().lifecycle(), &[
        seen!(0, 0, ProcessCreated),
        seen!(0, 0, ProcessExited),
    ]);
    assert_eq!(session.hooks().exits, vec![(root, ExitReason::Code(0))]);

    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_exit_code_is_reported() -> Result<()> {
    let mut session = spawn(Recorder::new(), "/bin/bash", &["-c", "exit 7"])?;
    session.start()?;

    let reasons: Vec<ExitReason> = session.hooks().exits.iter().map(|(_, reason)| *reason).collect();
    assert_eq!(reasons, vec![ExitReason::Code(7)]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_spawn_in_working_directory() -> Result<()> {
    let backend = PtraceBackend::new();
    let mut session = Session::new(backend, Recorder::new());
    session.init("/bin/bash", &args(["-c", "test \"$PWD\" = /"]), Some("/".as_ref()))?;
    session.start()?;

    let reasons: Vec<ExitReason> = session.hooks().exits.iter().map(|(_, reason)| *reason).collect();
    assert_eq!(reasons, vec![ExitReason::Code(0)]);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_spawn_failure() {
    let mut session = Session::new(PtraceBackend::new(), ());

    let err = session.init("/nonexistent/program", &[], None).unwrap_err();
    assert!(matches!(err, Error::SpawnFailed { .. }));

    let err = session.start().unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }));
}

#[test]
#[timeout(5000)]
fn test_forked_child_is_followed() -> Result<()> {
    let mut session = spawn(Recorder::new(), "/bin/bash", &["-c", "/bin/true; exit 0"])?;
    let root = session.root().map(|r| r.process_id.as_raw()).unwrap_or_default();

    session.start()?;

    let hooks = session.hooks();
    assert_eq!(count(hooks, EventKind::ProcessCreated), 2);
    assert_eq!(count(hooks, EventKind::ProcessExited), 2);

    // The child's exit is seen first, and the session keeps going until the root exits.
    assert_eq!(hooks.exits.len(), 2);
    assert_ne!(hooks.exits[0].0, root);
    assert_eq!(hooks.exits[1], (root, ExitReason::Code(0)));

    // Nothing handled it, so bash still saw its SIGCHLD.
    assert!(hooks.exceptions.iter().any(|e| e.kind == ExceptionKind::Signal(Signal::SIGCHLD)));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_children_not_followed() -> Result<()> {
    let mut options = Options::new();
    options.set_follow_children(false);

    let mut session = spawn_with(options, Recorder::new(), "/bin/bash", &["-c", "/bin/true; exit 0"])?;
    session.start()?;

    assert_eq!(count(session.hooks(), EventKind::ProcessCreated), 1);
    assert_eq!(count(session.hooks(), EventKind::ProcessExited), 1);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_unhandled_signal_is_delivered() -> Result<()> {
    let mut session = spawn(Recorder::new(), "/bin/bash", &["-c", "kill -USR1 $$; exit 0"])?;
    session.start()?;

    let hooks = session.hooks();
    assert_eq!(hooks.exceptions.len(), 1);
    assert_eq!(hooks.exceptions[0].kind, ExceptionKind::Signal(Signal::SIGUSR1));

    let signaled = ExitReason::Signaled { signal: Signal::SIGUSR1, core_dumped: false };
    assert_eq!(hooks.exits.last().map(|(_, reason)| *reason), Some(signaled));

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_handled_signal_is_suppressed() -> Result<()> {
    let mut session = spawn(Recorder::handling_exceptions(), "/bin/bash", &["-c", "kill -USR1 $$; exit 0"])?;
    session.start()?;

    let hooks = session.hooks();
    assert_eq!(hooks.exceptions.len(), 1);
    assert_eq!(hooks.exits.last().map(|(_, reason)| *reason), Some(ExitReason::Code(0)));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_stop_kills_root() -> Result<()> {
    let mut session = spawn(Recorder::stopping_on(EventKind::ProcessCreated), "sleep", &["60"])?;
    session.start()?;

    let killed = ExitReason::Signaled { signal: Signal::SIGKILL, core_dumped: false };
    assert_eq!(session.hooks().exits.last().map(|(_, reason)| *reason), Some(killed));
    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_detach_leaves_root_running() -> Result<()> {
    let mut session = spawn(Recorder::detaching_on(EventKind::ProcessCreated), "sleep", &["1"])?;
    session.start()?;

    let lifecycle = session.hooks().lifecycle();
    assert_eq!(lifecycle.len(), 1);
    assert_eq!(lifecycle[0].kind, EventKind::ProcessCreated);
    assert!(session.hooks().exits.is_empty());
    assert_eq!(session.state(), LoopState::Terminated);
    assert!(session.registry().is_empty());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_attach_to_running_process() -> Result<()> {
    let mut child = Command::new("sleep").arg("60").spawn()?;
    let pid = ProcessId(child.id());

    let mut session = Session::new(PtraceBackend::new(), Recorder::stopping_on(EventKind::ProcessCreated));
    session.attach(pid)?;
    session.start()?;

    assert_eq!(session.hooks().seen[0], seen!(pid.as_raw(), pid.as_raw(), ProcessCreated));

    let killed = ExitReason::Signaled { signal: Signal::SIGKILL, core_dumped: false };
    assert_eq!(session.hooks().exits, vec![(pid.as_raw(), killed)]);

    // Reaped here, unless the tracer already consumed its status.
    drop(session);
    let _ = child.wait();

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_attach_right_after_spawn() -> Result<()> {
    // The target may still be inside `execve()` when we attach.
    for _ in 0..5 {
        let mut child = Command::new("sleep").arg("60").spawn()?;
        let pid = ProcessId(child.id());

        let mut session = Session::new(PtraceBackend::new(), Recorder::stopping_on(EventKind::ProcessCreated));
        session.attach(pid)?;
        session.start()?;

        let hooks = session.hooks();
        assert_eq!(hooks.seen[0], seen!(pid.as_raw(), pid.as_raw(), ProcessCreated));
        assert!(hooks.exceptions.is_empty());

        // Only the exit hook runs after its process is gone.
        for (seen, &registered) in hooks.seen.iter().zip(&hooks.registered) {
            assert_eq!(registered, seen.kind != EventKind::ProcessExited, "{:?}", seen);
        }

        let killed = ExitReason::Signaled { signal: Signal::SIGKILL, core_dumped: false };
        assert_eq!(hooks.exits, vec![(pid.as_raw(), killed)]);

        drop(session);
        let _ = child.wait();
    }

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_attach_failure() {
    let mut session = Session::new(PtraceBackend::new(), ());

    // Never a valid pid.
    let err = session.attach(ProcessId(u32::MAX >> 1)).unwrap_err();
    assert!(matches!(err, Error::AttachFailed { .. }));
    assert!(session.root().is_none());
}

#[cfg(feature = "test-programs")]
#[test]
#[timeout(5000)]
fn test_thread_lifecycle() -> Result<()> {
    let program = "test-programs/spawn-threads/target/release/spawn-threads";
    let mut session = spawn(Recorder::new(), program, &["3"])?;
    session.start()?;

    let hooks = session.hooks();
    assert_eq!(count(hooks, EventKind::ProcessCreated), 1);
    assert_eq!(count(hooks, EventKind::ThreadCreated), 3);
    assert_eq!(count(hooks, EventKind::ThreadExited), 3);
    assert_eq!(hooks.exits.last().map(|(_, reason)| *reason), Some(ExitReason::Code(0)));

    // Every thread event is attributed to the root process.
    let root = hooks.seen[0].pid;
    assert!(hooks.seen.iter().all(|s| s.pid == root));

    Ok(())
}
