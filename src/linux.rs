//! Debug-event backend for Linux, built on ptrace(2).
//!
//! Linux reports per-task stops, not debug events. Each stop is turned into zero or more
//! raw records, queued in order. Only the last record of a stop keeps its task halted,
//! so resuming that record restarts the task.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ffi::OsString;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::path::Path;
use std::process::Child;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, Launched};
use crate::error::{Error, Result};
use crate::event::ContinuationDisposition;
use crate::options::Options;
use crate::procfs::{self, MappedImage};
use crate::ptracer::{self, ExitType, Stop, Tracee, Tracer, FOLLOW_OPTIONS};
use crate::raw::{code, exception, severity, RawDebugEvent, RawEventInfo, RawException, RawExit};
use crate::types::{OsHandle, ProcessId, ThreadId};

// Process handles backed by a pidfd carry this tag, so they never collide with the
// plain tid tokens used for threads.
const PIDFD_TAG: u64 = 1 << 32;

// `si_code` values for `SIGTRAP`.
const TRAP_BRKPT: i32 = 1;
const TRAP_TRACE: i32 = 2;
const SI_KERNEL: i32 = 0x80;

#[derive(Debug)]
struct Queued {
    event: RawDebugEvent,

    // Set on the last record produced by a stop.
    halted: Option<Tracee>,
}

// What we know of one debuggee process.
#[derive(Debug, Default)]
struct ProcessInfo {
    // Live tasks, leader included while it lives.
    tasks: BTreeSet<u32>,

    // Set once the process-creation record is queued.
    announced: bool,

    // Leader exit held back until the last other task is gone.
    leader_exit: Option<RawExit>,

    // Thread-creation records waiting for the process to be announced.
    orphans: Vec<RawDebugEvent>,

    // Main image as reported at creation. Never reported as a module.
    image: Option<MappedImage>,

    modules: Vec<MappedImage>,
}

/// [`Backend`] for Linux, using ptrace.
#[derive(Debug)]
pub struct PtraceBackend {
    tracer: Tracer,
    options: Options,
    queue: VecDeque<Queued>,
    halted: Option<Tracee>,
    processes: BTreeMap<u32, ProcessInfo>,

    // Task to thread group, for every task we have seen attach.
    owners: HashMap<u32, u32>,

    root: Option<u32>,
    root_handle: Option<OsHandle>,
    root_exited: bool,
    child: Option<Child>,
    pidfds: HashMap<OsHandle, OwnedFd>,
}

impl Default for PtraceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PtraceBackend {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        let ptrace_options = if options.follow_children() {
            FOLLOW_OPTIONS
        } else {
            ptracer::Options::empty()
        };
        let tracer = Tracer::new(ptrace_options, options.poll_delay(), options.max_poll_delay());

        Self {
            tracer,
            options,
            queue: VecDeque::new(),
            halted: None,
            processes: BTreeMap::new(),
            owners: HashMap::new(),
            root: None,
            root_handle: None,
            root_exited: false,
            child: None,
            pidfds: HashMap::new(),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn reset(&mut self, root: u32) {
        self.queue.clear();
        self.halted = None;
        self.processes.clear();
        self.owners.clear();
        self.root = Some(root);
        self.root_handle = None;
        self.root_exited = false;
    }

    fn launched(&mut self, pid: u32) -> Launched {
        let process_handle = self.open_process_handle(pid);
        self.root_handle = Some(process_handle);

        Launched {
            process_id: ProcessId(pid),
            thread_id: ThreadId(pid),
            process_handle,
            thread_handle: OsHandle(pid as u64),
        }
    }

    fn open_process_handle(&mut self, pid: u32) -> OsHandle {
        // SAFETY: `pidfd_open` takes plain integers. On success we own the returned fd.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::c_long, 0 as libc::c_long) };

        if fd < 0 {
            debug!(pid, err = %Errno::last(), "no pidfd, using pid as process handle");
            return OsHandle(pid as u64);
        }

        // SAFETY: `fd` was just returned by a successful `pidfd_open`.
        let owned = unsafe { OwnedFd::from_raw_fd(fd as i32) };
        let handle = OsHandle(PIDFD_TAG | fd as u64);
        self.pidfds.insert(handle, owned);

        handle
    }

    fn owner_of(&self, tid: u32) -> u32 {
        match self.owners.get(&tid) {
            Some(&tgid) => tgid,
            None => procfs::thread_group_id(tid).unwrap_or(tid),
        }
    }

    fn restart(&mut self, tracee: Tracee, signal: Option<Signal>) -> Result<()> {
        match self.tracer.restart(tracee, signal) {
            Err(err) if err.debuggee_gone() => {
                debug!(tid = tracee.pid.as_raw(), "task died before it could be restarted");
                Ok(())
            },
            res => res,
        }
    }

    fn push(&mut self, events: Vec<RawDebugEvent>, tracee: Tracee) -> Result<()> {
        if events.is_empty() {
            return self.restart(tracee, None);
        }

        let last = events.len() - 1;

        for (i, event) in events.into_iter().enumerate() {
            let halted = if i == last { Some(tracee) } else { None };
            self.queue.push_back(Queued { event, halted });
        }

        Ok(())
    }

    // Turn one stop into records, or restart it if it means nothing at this level.
    fn translate_stop(&mut self, tracee: Tracee) -> Result<()> {
        let tid = tracee.pid.as_raw() as u32;
        trace!(tid, stop = ?tracee.stop, "task stopped");

        let events = match tracee.stop {
            Stop::Spawned => self.announce_process(tid),
            Stop::Attach => {
                match self.tracer.apply_options(tracee.pid) {
                    Err(err) if !err.debuggee_gone() => return Err(err),
                    _ => {},
                }
                self.task_attached(tid)
            },
            Stop::SignalDelivery { signal } => {
                let tgid = self.owner_of(tid);
                let mut events = self.module_changes(tgid, tid);
                events.push(self.exception(tgid, &tracee, signal)?);
                events
            },
            Stop::Exec { old } => self.exec(tid, old.as_raw() as u32),
            Stop::Exiting { exit_code } => {
                let mut events = self.module_changes(self.owner_of(tid), tid);
                events.extend(self.task_exited(tid, RawExit::code(exit_code)));
                events
            },
            Stop::Signaling { signal, core_dumped } => {
                let mut events = self.module_changes(self.owner_of(tid), tid);
                events.extend(self.task_exited(tid, RawExit::signaled(signal as i32, core_dumped)));
                events
            },
            Stop::Vanished(exit) => {
                let exit = match exit {
                    ExitType::Exit(exit_code) => RawExit::code(exit_code),
                    ExitType::Signaled(signal, core_dumped) => RawExit::signaled(signal as i32, core_dumped),
                };
                self.task_exited(tid, exit)
            },
            Stop::Group { .. }
            | Stop::Clone { .. }
            | Stop::Fork { .. }
            | Stop::Vfork { .. }
            | Stop::VforkDone { .. }
            | Stop::Seccomp { .. } => vec![],
        };

        self.push(events, tracee)
    }

    // Creation of process `pid`, followed by its modules and any thread records that
    // arrived early.
    fn announce_process(&mut self, pid: u32) -> Vec<RawDebugEvent> {
        let exe = procfs::exe_path(pid).ok();
        let images = self.scan_modules(pid);

        let main = exe
            .as_ref()
            .and_then(|exe| images.iter().find(|image| &image.path == exe))
            .cloned();
        let base = main.as_ref().map_or(0, |image| image.base);

        let handle = match self.root_handle {
            Some(handle) if Some(pid) == self.root => handle,
            _ => self.open_process_handle(pid),
        };

        info!(pid, ?exe, "debuggee process created");

        let mut events = vec![RawDebugEvent::create_process(pid, pid, handle.0, base, exe)];

        for image in images.iter().filter(|&image| Some(image) != main.as_ref()) {
            events.push(RawDebugEvent::load_module(pid, pid, image.path.clone(), image.base, image.size));
        }

        let process = self.processes.entry(pid).or_default();
        process.announced = true;
        process.tasks.insert(pid);
        process.image = main;
        process.modules = images;
        events.append(&mut process.orphans);

        self.owners.insert(pid, pid);
        events
    }

    fn task_attached(&mut self, tid: u32) -> Vec<RawDebugEvent> {
        let tgid = procfs::thread_group_id(tid).unwrap_or(tid);

        if tgid == tid {
            return self.announce_process(tid);
        }

        self.owners.insert(tid, tgid);
        let process = self.processes.entry(tgid).or_default();
        process.tasks.insert(tid);

        let record = RawDebugEvent::create_thread(tgid, tid);

        if process.announced {
            debug!(tgid, tid, "debuggee thread created");
            vec![record]
        } else {
            trace!(tgid, tid, "holding thread creation until its process is announced");
            process.orphans.push(record);
            vec![]
        }
    }

    fn exec(&mut self, pid: u32, old: u32) -> Vec<RawDebugEvent> {
        let mut events = vec![];

        if old != pid {
            // The exec'ing thread took over the leader's tid.
            self.owners.remove(&old);

            if let Some(process) = self.processes.get_mut(&pid) {
                process.tasks.remove(&old);
            }

            events.push(RawDebugEvent::exit_thread(pid, old, RawExit::code(0)));
        }

        if let Some(process) = self.processes.get_mut(&pid) {
            if process.leader_exit.take().is_some() {
                debug!(pid, "leader resurrected by exec");
            }

            process.tasks.insert(pid);
        }

        // Every module of the old image is gone. The new main image is reported as a
        // module load, since the process keeps its creation record.
        events.extend(self.module_changes(pid, pid));
        events
    }

    fn task_exited(&mut self, tid: u32, exit: RawExit) -> Vec<RawDebugEvent> {
        let tgid = self.owner_of(tid);
        self.owners.remove(&tid);

        let process = match self.processes.get_mut(&tgid) {
            Some(process) => process,
            None => {
                debug!(tid, "exit of unknown task");
                return vec![];
            },
        };

        process.tasks.remove(&tid);

        let mut events = vec![];

        if tid != tgid {
            events.push(RawDebugEvent::exit_thread(tgid, tid, exit));
        }

        if !process.tasks.is_empty() {
            if tid == tgid {
                debug!(tgid, threads = process.tasks.len(), "leader exited first, holding process exit");
                process.leader_exit = Some(exit);
            }
            return events;
        }

        let process_exit = if tid == tgid {
            Some(exit)
        } else {
            process.leader_exit.take()
        };

        if let Some(exit) = process_exit {
            events.push(RawDebugEvent::exit_process(tgid, tgid, exit));
            self.forget_process(tgid);

            if Some(tgid) == self.root {
                self.root_exited = true;
            }
        }

        events
    }

    fn forget_process(&mut self, tgid: u32) {
        if let Some(process) = self.processes.remove(&tgid) {
            for tid in process.tasks {
                self.owners.remove(&tid);
            }
        }
    }

    fn exception(&self, tgid: u32, tracee: &Tracee, signal: Signal) -> Result<RawDebugEvent> {
        let tid = tracee.pid.as_raw() as u32;

        let (si_code, si_errno, address) = match tracee.siginfo() {
            Ok(Some(info)) => (info.si_code, info.si_errno, fault_address(signal, &info)),
            Ok(None) => (0, 0, 0),
            Err(err) if err.debuggee_gone() => (0, 0, 0),
            Err(err) => return Err(err),
        };

        let info = RawEventInfo::Exception(RawException {
            code: exception_code(signal, si_code),
            address,
            first_chance: true,
            parameters: vec![signal as u64, si_code as u64, si_errno as u64],
        });

        Ok(RawDebugEvent::new(code::EXCEPTION, tgid, tid, info))
    }

    // Module loads and unloads since the last scan of `tgid`, attributed to `tid`.
    fn module_changes(&mut self, tgid: u32, tid: u32) -> Vec<RawDebugEvent> {
        match self.processes.get(&tgid) {
            Some(process) if process.announced && self.options.track_modules() => {},
            _ => return vec![],
        }

        let current = self.scan_modules(tgid);

        let process = match self.processes.get_mut(&tgid) {
            Some(process) => process,
            None => return vec![],
        };

        let main = process.image.clone();
        let is_module = |image: &&MappedImage| Some(*image) != main.as_ref();

        let mut events: Vec<RawDebugEvent> = process
            .modules
            .iter()
            .filter(is_module)
            .filter(|old| !current.contains(old))
            .map(|old| RawDebugEvent::unload_module(tgid, tid, old.base))
            .collect();

        events.extend(
            current
                .iter()
                .filter(is_module)
                .filter(|new| !process.modules.contains(new))
                .map(|new| RawDebugEvent::load_module(tgid, tid, new.path.clone(), new.base, new.size)),
        );

        process.modules = current;
        events
    }

    fn scan_modules(&self, pid: u32) -> Vec<MappedImage> {
        if !self.options.track_modules() {
            return vec![];
        }

        match procfs::mapped_images(pid) {
            Ok(images) => images,
            Err(err) => {
                debug!(pid, %err, "could not read mappings");
                vec![]
            },
        }
    }

    fn vanished(&mut self) -> RawDebugEvent {
        let root = self.root.unwrap_or(0);
        warn!(root, "all debuggee tasks vanished before the root process exited");
        self.root_exited = true;

        RawDebugEvent::fatal(root, root, Errno::ECHILD as u32, severity::ERROR)
    }

    // Collect the exit status of a spawned root, once it is known to be dead.
    fn reap_root(&mut self) {
        if !self.root_exited {
            return;
        }

        if let Some(mut child) = self.child.take() {
            match child.wait() {
                Ok(status) => debug!(?status, "reaped root process"),
                Err(err) => debug!(%err, "could not reap root process"),
            }
        }
    }
}

impl Backend for PtraceBackend {
    fn spawn(&mut self, program: &Path, args: &[OsString], cwd: Option<&Path>) -> Result<Launched> {
        let child = self
            .tracer
            .spawn(program, args, cwd)
            .map_err(|source| Error::SpawnFailed { program: program.to_owned(), source })?;

        let pid = child.id();
        self.reset(pid);
        self.child = Some(child);

        Ok(self.launched(pid))
    }

    fn attach(&mut self, pid: ProcessId) -> Result<Launched> {
        let raw = pid.as_raw();
        let tids = procfs::task_ids(raw).map_err(|_| Error::AttachFailed { pid, source: Errno::ESRCH })?;

        let mut attached = vec![];

        for tid in tids {
            let task = Pid::from_raw(tid as i32);

            match self.tracer.attach(task) {
                Ok(()) => attached.push(task),
                // Threads may exit while we enumerate them.
                Err(Errno::ESRCH) if tid != raw => continue,
                Err(source) => {
                    for task in attached {
                        if let Err(err) = self.tracer.stop_and_detach(Pid::from_raw(raw as i32), task) {
                            debug!(%err, tid = task.as_raw(), "could not roll back attach");
                        }
                    }
                    return Err(Error::AttachFailed { pid, source });
                },
            }
        }

        info!(pid = raw, tasks = attached.len(), "attached to process");
        self.reset(raw);
        self.child = None;

        Ok(self.launched(raw))
    }

    fn wait_event(&mut self) -> Result<RawDebugEvent> {
        if let Some(tracee) = self.halted.take() {
            debug!(tid = tracee.pid.as_raw(), "restarting task left halted");
            self.restart(tracee, tracee.pending)?;
        }

        loop {
            if let Some(queued) = self.queue.pop_front() {
                self.halted = queued.halted;
                return Ok(queued.event);
            }

            match self.tracer.wait()? {
                Some(tracee) => self.translate_stop(tracee)?,
                None if !self.root_exited => return Ok(self.vanished()),
                None => internal_error!("no debuggee left to wait on"),
            }
        }
    }

    fn resume(&mut self, pid: ProcessId, tid: ThreadId, disposition: ContinuationDisposition) -> Result<()> {
        let tracee = match self.halted.take() {
            Some(tracee) => tracee,
            None => return Ok(()),
        };

        trace!(pid = pid.as_raw(), tid = tid.as_raw(), ?disposition, "resuming task");

        // Only a signal-delivery stop has a signal to pass on.
        let signal = match (tracee.stop, disposition) {
            (Stop::SignalDelivery { .. }, ContinuationDisposition::NotHandled) => tracee.pending,
            _ => None,
        };

        self.restart(tracee, signal)
    }

    fn terminate(&mut self, pid: ProcessId) -> Result<()> {
        ptracer::kill(Pid::from_raw(pid.as_raw() as i32)).map_err(|source| Error::TerminateFailed { pid, source })?;
        info!(pid = pid.as_raw(), "sent SIGKILL");
        Ok(())
    }

    fn detach(&mut self, pid: ProcessId) -> Result<()> {
        let raw = pid.as_raw();
        let detach_failed = |err: Error| Error::DetachFailed { pid, reason: err.to_string() };

        // Tasks already in ptrace-stop are detached directly, with their signal.
        let mut stopped = vec![];

        if let Some(tracee) = self.halted {
            if self.owner_of(tracee.pid.as_raw() as u32) == raw {
                self.halted = None;
                stopped.push(tracee);
            }
        }

        self.queue.retain(|queued| {
            if queued.event.process_id != raw {
                return true;
            }
            stopped.extend(queued.halted);
            false
        });

        let mut done = BTreeSet::new();

        for tracee in stopped {
            done.insert(tracee.pid.as_raw() as u32);
            self.tracer.detach(tracee, tracee.pending).map_err(detach_failed)?;
        }

        let tasks: Vec<u32> = match self.processes.get(&raw) {
            Some(process) if process.announced => process.tasks.difference(&done).copied().collect(),
            // Not yet announced, so only the tracer knows its tasks.
            _ if self.root == Some(raw) && !self.root_exited => procfs::task_ids(raw).unwrap_or_else(|_| vec![raw]),
            _ => vec![],
        };

        for tid in tasks {
            let task = Pid::from_raw(tid as i32);

            match self.tracer.stop_and_detach(Pid::from_raw(raw as i32), task) {
                Ok(()) => {},
                Err(err) if err.debuggee_gone() => self.tracer.forget(task),
                Err(err) => return Err(detach_failed(err)),
            }
        }

        self.forget_process(raw);

        if Some(raw) == self.root {
            // Never reaped by us, so never waited on.
            self.child = None;
        }

        info!(pid = raw, "detached from process");
        Ok(())
    }

    fn close_handle(&mut self, handle: OsHandle) {
        if self.pidfds.remove(&handle).is_some() {
            trace!(?handle, "closed pidfd");
        }

        if Some(handle) == self.root_handle {
            self.reap_root();
        }
    }
}

impl Drop for PtraceBackend {
    fn drop(&mut self) {
        self.reap_root();
    }
}

fn exception_code(signal: Signal, si_code: i32) -> u32 {
    match signal {
        Signal::SIGTRAP => match si_code {
            TRAP_TRACE => exception::SINGLE_STEP,
            TRAP_BRKPT | SI_KERNEL => exception::BREAKPOINT,
            _ => exception::from_signal(signal as i32),
        },
        Signal::SIGSEGV | Signal::SIGBUS => exception::ACCESS_VIOLATION,
        Signal::SIGILL => exception::ILLEGAL_INSTRUCTION,
        Signal::SIGFPE => exception::INTEGER_DIVIDE_BY_ZERO,
        _ => exception::from_signal(signal as i32),
    }
}

fn fault_address(signal: Signal, info: &ptracer::Siginfo) -> u64 {
    match signal {
        Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE | Signal::SIGTRAP => {
            // SAFETY: these signals carry a fault address in `si_addr`.
            unsafe { info.si_addr() as u64 }
        },
        _ => 0,
    }
}
