//! Low-level ptrace(2) tracer: spawning and attaching tasks, waiting for their stops, and
//! restarting or detaching them.

use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::ffi::OsString;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::time::Duration;

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal::{self, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result, ResultExt};

pub use nix::sys::ptrace::Options;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// Options always set on tracees.
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_TRACECLONE);

/// Options added when following forked children.
pub const FOLLOW_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK);

// Upper bound on foreign stops absorbed while waiting to detach a task.
const DETACH_STOP_LIMIT: usize = 64;

// `si_code` of a signal sent by `kill()`.
const SI_USER: i32 = 0;

/// Why a task is stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
    /// First stop of a spawned task, after its `execve()`.
    Spawned,

    /// First stop of a newly attached or auto-attached task.
    Attach,

    // signal-delivery-stop
    SignalDelivery { signal: Signal },

    // group-stop
    Group { signal: Signal },

    // ptrace-event-stops
    Clone { new: Pid },
    Fork { new: Pid },
    Vfork { new: Pid },
    VforkDone { new: Pid },
    Exec { old: Pid },
    Exiting { exit_code: i32 },
    Signaling { signal: Signal, core_dumped: bool },
    Seccomp { data: u16 },

    /// The task terminated without a preceding exit stop. It is already gone, and must
    /// not be restarted.
    Vanished(ExitType),
}

/// Task in ptrace-stop, with an optional pending signal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tracee {
    pub pid: Pid,
    pub pending: Option<Signal>,
    pub stop: Stop,
}

impl Tracee {
    pub fn new(pid: Pid, pending: impl Into<Option<Signal>>, stop: Stop) -> Self {
        Self { pid, pending: pending.into(), stop }
    }

    pub fn siginfo(&self) -> Result<Option<Siginfo>> {
        let info = if let Stop::SignalDelivery { .. } = self.stop {
            Some(ptrace::getsiginfo(self.pid).died_if_esrch(self.pid)?)
        } else {
            None
        };

        Ok(info)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Attached, no expectations for next stop.
    Running,

    // Newly-attached, expecting a SIGSTOP.
    Attaching,

    // Self-attached, via `spawn()` with a pre-exec `TRACEME` request.
    Spawned,

    // Stopped in an exit stop. Detached on next restart.
    Exiting,

    // Detached after its exit stop, pending confirmed termination via a WIFEXITED or
    // WIFSIGNALED status. Could still be resurrected by an off-leader exec.
    Exited,
}

/// Tracer for a set of Linux tasks.
#[derive(Debug)]
pub struct Tracer {
    options: Options,
    poll_delay: Duration,
    max_poll_delay: Duration,
    tasks: BTreeMap<i32, State>,

    // Signals that arrived before a task's first reported stop, delivered on its first
    // restart.
    held: BTreeMap<i32, Signal>,
}

impl Tracer {
    pub fn new(options: Options, poll_delay: Duration, max_poll_delay: Duration) -> Self {
        let options = options | REQUIRED_OPTIONS;
        let tasks = BTreeMap::new();
        let held = BTreeMap::new();

        Self { options, poll_delay, max_poll_delay, tasks, held }
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn `program` as a tracee.
    ///
    /// The child requests `PTRACE_TRACEME` after `fork()` and before `exec()`, so its
    /// first stop is the post-exec `SIGTRAP`.
    pub fn spawn(&mut self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> io::Result<Child> {
        let mut cmd = Command::new(program);
        cmd.args(args);

        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        // SAFETY: the hook only makes a single async-signal-safe syscall.
        unsafe {
            cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
        };

        let child = cmd.spawn()?;

        let pid = Pid::from_raw(child.id() as i32);
        self.set_state(pid, State::Spawned);

        Ok(child)
    }

    /// Attach to a running task. It will report an attach-stop.
    pub fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::attach(pid)?;
        self.mark_attaching(pid);
        Ok(())
    }

    /// Set the tracer's options on a stopped task.
    pub fn apply_options(&self, pid: Pid) -> Result<()> {
        ptrace::setoptions(pid, self.options).died_if_esrch(pid)
    }

    /// Resume a stopped task, delivering `signal`.
    pub fn restart(&mut self, tracee: Tracee, signal: Option<Signal>) -> Result<()> {
        let pid = tracee.pid;

        if let Stop::Vanished(..) = tracee.stop {
            return Ok(());
        }

        let signal = self.with_held(pid, signal);

        let res = match self.state(pid) {
            Some(State::Exiting) => {
                // Mark as tentatively terminated. See `prune_exited()`.
                self.set_state(pid, State::Exited);
                ptrace::detach(pid, signal)
            },
            _ => ptrace::cont(pid, signal),
        };

        res.died_if_esrch(pid)
    }

    /// Detach a task that is not known to be stopped.
    ///
    /// A running task is first stopped with a thread-directed `SIGSTOP`. A task still due
    /// its first stop is waited on instead. Either stop is suppressed on detach. Other
    /// stops seen meanwhile are restarted with their signal re-injected.
    pub fn stop_and_detach(&mut self, tgid: Pid, tid: Pid) -> Result<()> {
        let state = match self.state(tid) {
            Some(State::Exited) | None => {
                self.remove(tid);
                return Ok(());
            },
            Some(state) => state,
        };

        if let State::Running | State::Exiting = state {
            tgkill(tgid, tid, Signal::SIGSTOP).died_if_esrch(tid)?;
        }

        for _ in 0..DETACH_STOP_LIMIT {
            match wait::waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {
                    let held = self.with_held(tid, None);
                    self.remove(tid);
                    return ptrace::detach(tid, held).died_if_esrch(tid);
                },
                Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) if state == State::Spawned => {
                    let held = self.with_held(tid, None);
                    self.remove(tid);
                    return ptrace::detach(tid, held).died_if_esrch(tid);
                },
                Ok(WaitStatus::Stopped(_, signal)) => {
                    trace!(tid = tid.as_raw(), ?signal, "re-injecting signal while detaching");
                    ptrace::cont(tid, signal).died_if_esrch(tid)?;
                },
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                    self.remove(tid);
                    return Ok(());
                },
                Ok(status) => {
                    trace!(tid = tid.as_raw(), ?status, "absorbing stop while detaching");
                    ptrace::cont(tid, None).died_if_esrch(tid)?;
                },
                Err(errno) => return Err(errno.into()),
            }
        }

        internal_error!("task never reached a detachable stop")
    }

    /// Detach a task that is in ptrace-stop.
    pub fn detach(&mut self, tracee: Tracee, signal: Option<Signal>) -> Result<()> {
        let signal = self.with_held(tracee.pid, signal);
        self.remove(tracee.pid);

        if let Stop::Vanished(..) = tracee.stop {
            return Ok(());
        }

        ptrace::detach(tracee.pid, signal).died_if_esrch(tracee.pid)
    }

    /// Stop tracking a task without touching it.
    pub fn forget(&mut self, pid: Pid) {
        self.remove(pid);
    }

    // Poll tasks for a `wait(2)` status change.
    fn poll(&mut self) -> Result<Option<WaitStatus>> {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;

        for (task, state) in self.tasks.clone().into_iter() {
            let pid = Pid::from_raw(task);

            if state == State::Exited && self.prune_exited(pid)? {
                // Leave its status for whoever reaps it.
                continue;
            }

            match wait::waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => return Ok(Some(status)),
                Err(Errno::ECHILD) => {
                    debug!(pid = task, "lost task");
                    self.remove(pid);
                    return Ok(Some(WaitStatus::Signaled(pid, Signal::SIGKILL, false)));
                },
                Err(err) => return Err(err.into()),
            }
        }

        Ok(None)
    }

    // Peek at the wait status of an exited task without consuming it. Returns `true` iff
    // the task was removed.
    fn prune_exited(&mut self, pid: Pid) -> Result<bool> {
        use nix::sys::wait::Id;

        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT | WaitPidFlag::WNOHANG;

        match wait::waitid(Id::Pid(pid), flags) {
            Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                debug!(?status, "saw termination of exited task");
                self.remove(pid);
                Ok(true)
            },
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(status) => {
                // A non-termination status after an exit stop: an off-leader `exec()` has
                // resurrected this tid as the new thread group leader.
                debug!(?status, "exited task resurrected");
                self.set_state(pid, State::Running);
                Ok(false)
            },
            Err(Errno::ECHILD) => {
                debug!(pid = pid.as_raw(), "ECHILD for exited task, assuming reaped");
                self.remove(pid);
                Ok(true)
            },
            Err(errno) => {
                self.remove(pid);
                Err(errno.into())
            },
        }
    }

    /// Wait for some task to stop. Returns `None` once no tasks remain.
    pub fn wait(&mut self) -> Result<Option<Tracee>> {
        let mut poll_delay = self.poll_delay;

        loop {
            if self.tasks.is_empty() {
                debug!("no tasks to wait on");
                return Ok(None);
            }

            match self.poll()? {
                Some(status) => {
                    if let Some(tracee) = self.interpret(status)? {
                        return Ok(Some(tracee));
                    }
                    poll_delay = self.poll_delay;
                },
                None => {
                    trace!(tasks = self.tasks.len(), ?poll_delay, "no task updates, backing off");
                    std::thread::sleep(poll_delay);
                    poll_delay = (poll_delay * 2).min(self.max_poll_delay);
                },
            }
        }
    }

    // Interpret a wait status. Returns `None` for a stop that was absorbed here.
    fn interpret(&mut self, status: WaitStatus) -> Result<Option<Tracee>> {
        let tracee = match status {
            WaitStatus::Exited(pid, exit_code) => {
                self.remove(pid);
                Tracee::new(pid, None, Stop::Vanished(ExitType::Exit(exit_code)))
            },
            WaitStatus::Signaled(pid, signal, core_dumped) => {
                self.remove(pid);
                Tracee::new(pid, None, Stop::Vanished(ExitType::Signaled(signal, core_dumped)))
            },
            WaitStatus::Stopped(pid, Signal::SIGTRAP) if self.state(pid) == Some(State::Spawned) => {
                // Without `PTRACE_O_TRACEEXEC`, which a self-attached child cannot have
                // set yet, a successful `execve()` raises a plain `SIGTRAP`.
                self.set_state(pid, State::Running);
                self.apply_options(pid)?;

                Tracee::new(pid, None, Stop::Spawned)
            },
            WaitStatus::Stopped(pid, Signal::SIGSTOP) if self.is_attach_stop(pid) => {
                self.set_state(pid, State::Running);
                Tracee::new(pid, None, Stop::Attach)
            },
            WaitStatus::Stopped(pid, signal) if self.is_first_stop_pending(pid) => {
                self.absorb_early_stop(pid, signal)?;
                return Ok(None);
            },
            WaitStatus::Stopped(pid, signal) => {
                let stop = if is_group_stop(pid, signal)? {
                    Stop::Group { signal }
                } else {
                    Stop::SignalDelivery { signal }
                };

                Tracee::new(pid, signal, stop)
            },
            WaitStatus::PtraceEvent(pid, _signal, code) => self.interpret_event(pid, code)?,
            WaitStatus::PtraceSyscall(pid) => {
                // Tasks are only ever restarted with `PTRACE_CONT`.
                internal_error!(format!("unexpected syscall-stop for task {}", pid))
            },
            WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                internal_error!("unreachable `wait()` status")
            },
        };

        Ok(Some(tracee))
    }

    // A task can stop for a signal before the stop that introduces it. A task attached
    // mid-`execve()` raises the legacy post-exec `SIGTRAP`, because its options are not
    // set yet: that trap is dropped. Any other signal is held for the first restart. The
    // task keeps running towards its first stop.
    fn absorb_early_stop(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        let deliver = match ptrace::getsiginfo(pid) {
            // Group-stop. Nothing to deliver.
            Err(Errno::EINVAL) => None,
            Err(Errno::ESRCH) => return Ok(()),
            Err(err) => return Err(err.into()),
            Ok(info) if signal == Signal::SIGTRAP && is_exec_trap(&info) => {
                debug!(pid = pid.as_raw(), "dropping post-exec SIGTRAP of attaching task");
                None
            },
            Ok(_) => match self.held.get(&pid.as_raw()) {
                None => {
                    debug!(pid = pid.as_raw(), ?signal, "holding signal until first stop");
                    self.held.insert(pid.as_raw(), signal);
                    None
                },
                // Only one slot. Later signals go through now.
                Some(_) => Some(signal),
            },
        };

        match ptrace::cont(pid, deliver).died_if_esrch(pid) {
            Err(err) if err.debuggee_gone() => Ok(()),
            res => res,
        }
    }

    // Merge a held signal into a restart. An explicit signal wins.
    fn with_held(&mut self, pid: Pid, signal: Option<Signal>) -> Option<Signal> {
        let held = self.held.remove(&pid.as_raw());

        if let (Some(signal), Some(held)) = (signal, held) {
            debug!(pid = pid.as_raw(), ?signal, ?held, "dropping held signal");
        }

        signal.or(held)
    }

    fn interpret_event(&mut self, pid: Pid, code: i32) -> Result<Tracee> {
        let new_task = |pid| -> Result<Pid> {
            let msg = ptrace::getevent(pid).died_if_esrch(pid)?;
            Ok(Pid::from_raw(msg as u32 as i32))
        };

        let stop = match code {
            libc::PTRACE_EVENT_FORK => {
                let new = new_task(pid)?;
                self.mark_attaching(new);
                Stop::Fork { new }
            },
            libc::PTRACE_EVENT_VFORK => {
                let new = new_task(pid)?;
                self.mark_attaching(new);
                Stop::Vfork { new }
            },
            libc::PTRACE_EVENT_CLONE => {
                let new = new_task(pid)?;
                self.mark_attaching(new);
                Stop::Clone { new }
            },
            libc::PTRACE_EVENT_VFORK_DONE => Stop::VforkDone { new: new_task(pid)? },
            libc::PTRACE_EVENT_EXEC => {
                // The exec'ing task now has the tid of the thread group leader. If it was
                // not the leader, its old tid is gone.
                let old = new_task(pid)?;

                if old != pid {
                    self.remove(old);
                }

                self.set_state(pid, State::Running);
                Stop::Exec { old }
            },
            libc::PTRACE_EVENT_EXIT => {
                // The message is the pending wait status. Only its low 16 bits matter.
                let status = ptrace::getevent(pid).died_if_esrch(pid)? as u16;
                self.set_state(pid, State::Exiting);

                match ExitType::parse(status)? {
                    ExitType::Exit(exit_code) => Stop::Exiting { exit_code },
                    ExitType::Signaled(signal, core_dumped) => Stop::Signaling { signal, core_dumped },
                }
            },
            libc::PTRACE_EVENT_SECCOMP => {
                let data = ptrace::getevent(pid).died_if_esrch(pid)? as u16;
                Stop::Seccomp { data }
            },
            _ => internal_error!(format!("unexpected ptrace-event-stop code {}", code)),
        };

        Ok(Tracee::new(pid, None, stop))
    }

    // An auto-attached task may report its `SIGSTOP` before we see the event that
    // announces it. An unknown task stopping with `SIGSTOP` is such a task.
    fn is_attach_stop(&self, pid: Pid) -> bool {
        match self.state(pid) {
            Some(State::Attaching) | None => true,
            Some(_) => false,
        }
    }

    // Newly attached, or spawned and not yet through `execve()`.
    fn is_first_stop_pending(&self, pid: Pid) -> bool {
        matches!(self.state(pid), Some(State::Attaching | State::Spawned))
    }

    fn remove(&mut self, pid: Pid) -> Option<State> {
        info!(pid = pid.as_raw(), "removing task");
        self.held.remove(&pid.as_raw());
        self.tasks.remove(&pid.as_raw())
    }

    fn state(&self, pid: Pid) -> Option<State> {
        self.tasks.get(&pid.as_raw()).copied()
    }

    fn set_state(&mut self, pid: Pid, state: State) {
        debug!(pid = pid.as_raw(), ?state, "setting task state");
        self.tasks.insert(pid.as_raw(), state);
    }

    // Mark `pid` as pending its attach-stop, if it isn't already known.
    fn mark_attaching(&mut self, pid: Pid) {
        if !self.tasks.contains_key(&pid.as_raw()) {
            info!(pid = pid.as_raw(), "attaching to new task");
        }

        self.tasks.entry(pid.as_raw()).or_insert(State::Attaching);
    }
}

/// Terminate every task of process `pid`.
pub fn kill(pid: Pid) -> nix::Result<()> {
    signal::kill(pid, Signal::SIGKILL)
}

fn tgkill(tgid: Pid, tid: Pid, signal: Signal) -> nix::Result<()> {
    // SAFETY: `tgkill` takes plain integers and touches no memory of ours.
    let res = unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw() as libc::c_long,
            tid.as_raw() as libc::c_long,
            signal as libc::c_long,
        )
    };

    Errno::result(res).map(drop)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitType {
    Exit(i32),
    Signaled(Signal, bool),
}

impl ExitType {
    fn parse(status: u16) -> Result<Self> {
        // The bit layout of the word `status` is:
        //
        //   15                         8   7                     0
        //    +-------------------------+---+---------------------+
        //    |        exit_code        | c |       sig_no        |
        //    +-------------------------+---+---------------------+
        //
        // Nonzero `sig_no` means termination by that signal, with bit 7 flagging a
        // core dump. Otherwise it is a normal exit.
        let sig_no = status & 0x7f;

        let ty = if sig_no == 0 {
            ExitType::Exit((status >> 8) as u8 as i32)
        } else {
            let signal = Signal::try_from(sig_no as i32)?;
            let core_dumped = status & 0x80 != 0;

            ExitType::Signaled(signal, core_dumped)
        };

        Ok(ty)
    }
}

// The post-exec trap of a task without `PTRACE_O_TRACEEXEC` is sent by the kernel as if
// by `kill()` from pid 0.
fn is_exec_trap(info: &Siginfo) -> bool {
    // SAFETY: `si_pid` is valid for `SI_USER` signals.
    info.si_code == SI_USER && unsafe { info.si_pid() } == 0
}

// Check if a stop with a stopping signal is a group-stop.
//
// Assumes attach-stop has already been ruled out.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    use Signal::*;

    match sig {
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => {
            // `PTRACE_GETSIGINFO` fails with `EINVAL` only for a group-stop.
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) => Ok(true),
                Err(err) => Err(Error::Os(err)),
                Ok(_) => Ok(false),
            }
        },
        // Only the four stopping signals can cause a group-stop.
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_type_parse() {
        assert_eq!(ExitType::parse(0x0000).unwrap(), ExitType::Exit(0));
        assert_eq!(ExitType::parse(0x2a00).unwrap(), ExitType::Exit(42));
        assert_eq!(ExitType::parse(0x0009).unwrap(), ExitType::Signaled(Signal::SIGKILL, false));
        assert_eq!(ExitType::parse(0x008b).unwrap(), ExitType::Signaled(Signal::SIGSEGV, true));
    }

    #[test]
    fn test_exec_trap_is_recognized() {
        // SAFETY: `siginfo_t` is plain data, valid when zeroed.
        let mut info: Siginfo = unsafe { std::mem::zeroed() };
        assert!(is_exec_trap(&info));

        info.si_code = 1;
        assert!(!is_exec_trap(&info));
    }

    #[test]
    fn test_held_signal_goes_to_first_restart() {
        let mut tracer = Tracer::new(Options::empty(), Duration::from_micros(1), Duration::from_millis(1));
        let pid = Pid::from_raw(4242);

        tracer.held.insert(pid.as_raw(), Signal::SIGUSR1);
        assert_eq!(tracer.with_held(pid, None), Some(Signal::SIGUSR1));
        assert_eq!(tracer.with_held(pid, None), None);

        tracer.held.insert(pid.as_raw(), Signal::SIGUSR1);
        assert_eq!(tracer.with_held(pid, Some(Signal::SIGCHLD)), Some(Signal::SIGCHLD));
        assert!(tracer.held.is_empty());
    }

    #[test]
    fn test_required_options_always_set() {
        let tracer = Tracer::new(Options::empty(), Duration::from_micros(1), Duration::from_millis(1));
        assert!(tracer.options().contains(REQUIRED_OPTIONS));
        assert!(!tracer.options().contains(FOLLOW_OPTIONS));
    }
}
