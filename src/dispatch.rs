//! The debug-event dispatch loop.
//!
//! Each event is handled in a fixed order: the registry is updated first, then the
//! matching hook runs, then a continuation disposition is computed and handed back to
//! the backend. No event is fetched while the previous one is still being handled.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tracing::{debug, error, info, trace, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::event::*;
use crate::hooks::{Context, Hooks, Requests};
use crate::registry::{ModuleRecord, ProcessRegistry, ProcessState, ThreadState};
use crate::translate::translate;
use crate::types::{OsHandle, ProcessId, ThreadId};


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopState {
    /// No loop running. Ready to start if a root debuggee has been created or attached.
    Idle,

    /// Blocked awaiting the next event, or handling one.
    Running,

    /// Stop or detach requested. The loop exits once the request settles.
    Stopping,

    /// Root debuggee gone, detach completed, or fatal event seen.
    Terminated,
}

impl LoopState {
    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LoopState::Idle,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Terminated,
        }
    }
}

/// Loop-control flags shared with other threads. Setting a flag is the only cross-thread
/// interaction with a running loop.
#[derive(Debug)]
pub(crate) struct LoopControl {
    stop: AtomicBool,
    detach: AtomicBool,
    state: AtomicU8,
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            stop: AtomicBool::new(false),
            detach: AtomicBool::new(false),
            state: AtomicU8::new(LoopState::Idle.to_u8()),
        }
    }
}

impl LoopControl {
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_detach(&self) {
        self.detach.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.detach.store(false, Ordering::SeqCst);
        self.publish(LoopState::Idle);
    }

    pub(crate) fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn publish(&self, state: LoopState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn take_requests(&self) -> Requests {
        Requests {
            handled: false,
            stop: self.stop.swap(false, Ordering::SeqCst),
            detach: self.detach.swap(false, Ordering::SeqCst),
        }
    }
}

/// Result of dispatching one event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dispatched {
    pub disposition: ContinuationDisposition,

    /// Requests made by the hook.
    pub requests: Requests,

    /// The root process exited with this event.
    pub root_exited: bool,

    /// The event was fatal. The loop must exit without resuming.
    pub fatal: bool,

    /// Handles of records destroyed by this event, to close once it settles.
    pub released: Vec<OsHandle>,
}

impl Dispatched {
    fn new(requests: Requests) -> Self {
        Self {
            disposition: ContinuationDisposition::Continue,
            requests,
            root_exited: false,
            fatal: false,
            released: vec![],
        }
    }
}

/// Debuggee state and the per-event-kind handlers that maintain it.
#[derive(Debug)]
pub struct Dispatcher {
    registry: ProcessRegistry,
    root: Option<ProcessId>,
    state: LoopState,
    stop_issued: bool,

    // The root's creation event arrived, so the registry owns its handles.
    root_adopted: bool,
}

impl Dispatcher {
    pub fn new(root: Option<ProcessId>) -> Self {
        Self {
            registry: ProcessRegistry::new(),
            root,
            state: LoopState::Idle,
            stop_issued: false,
            root_adopted: false,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn root(&self) -> Option<ProcessId> {
        self.root
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub(crate) fn root_adopted(&self) -> bool {
        self.root_adopted
    }

    pub(crate) fn reset(&mut self, root: Option<ProcessId>) {
        *self = Dispatcher::new(root);
    }

    /// Apply one event to the registry, run its hook, and decide how to resume.
    pub fn dispatch<H: Hooks>(&mut self, event: &DebugEvent, hooks: &mut H) -> Dispatched {
        let DebugEvent { process_id: pid, thread_id: tid, .. } = *event;

        self.registry.set_current(Some(pid));

        match &event.event {
            Event::ProcessCreated(_) | Event::ProcessExited(_) => {},
            _ => {
                if !self.registry.contains(pid) {
                    warn!(pid = pid.as_raw(), tid = tid.as_raw(), kind = ?event.kind(), "event for unregistered process");
                }
            },
        }

        let dispatched = match &event.event {
            Event::ProcessCreated(info) => self.process_created(pid, tid, info, hooks),
            Event::ProcessExited(info) => self.process_exited(pid, tid, info, hooks),
            Event::ThreadCreated(info) => self.thread_created(pid, tid, info, hooks),
            Event::ThreadExited(info) => self.thread_exited(pid, tid, info, hooks),
            Event::ModuleLoaded(info) => self.module_loaded(pid, tid, info, hooks),
            Event::ModuleUnloaded(info) => self.module_unloaded(pid, tid, info, hooks),
            Event::ExceptionRaised(info) => self.exception_raised(pid, tid, info, hooks),
            Event::DebugOutput(info) => {
                let requests = self.run_hook(pid, tid, |h, ctx| h.debug_output(ctx, info), hooks);
                Dispatched::new(requests)
            },
            Event::FatalSystemEvent(info) => {
                error!(pid = pid.as_raw(), error = info.error, severity = ?info.severity, "fatal system event");

                let requests = self.run_hook(pid, tid, |h, ctx| h.fatal(ctx, info), hooks);
                let mut dispatched = Dispatched::new(requests);
                dispatched.fatal = true;
                dispatched
            },
        };

        trace!(
            pid = pid.as_raw(),
            processes = self.registry.len(),
            threads = self.registry.thread_count(),
            disposition = ?dispatched.disposition,
            "dispatched event"
        );

        dispatched
    }

    fn run_hook<H, F>(&self, pid: ProcessId, tid: ThreadId, f: F, hooks: &mut H) -> Requests
    where
        H: Hooks,
        F: FnOnce(&mut H, &mut Context<'_>),
    {
        let mut ctx = Context::new(&self.registry, pid, tid, self.root);
        f(hooks, &mut ctx);
        ctx.into_requests()
    }

    fn process_created<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ProcessCreated, hooks: &mut H) -> Dispatched {
        let mut released = vec![];

        if self.registry.contains(pid) {
            // A reused identifier means we never saw the old process exit.
            warn!(pid = pid.as_raw(), "replacing stale process record");
            released = self.tear_down_process(pid);
        }

        info!(pid = pid.as_raw(), tid = tid.as_raw(), image = ?info.image_path, "process created");

        if self.root == Some(pid) {
            self.root_adopted = true;
        }

        let process = ProcessState::new(
            pid,
            info.process_handle,
            info.base_address,
            tid,
            info.image_path.clone(),
        );
        let main = ThreadState {
            id: tid,
            handle: info.thread_handle,
            process_id: pid,
            start_address: info.start_address,
        };

        if let Err(err) = self.registry.insert_process(process) {
            warn!(%err, "could not register process");
        } else if let Err(err) = self.registry.insert_thread(pid, main) {
            warn!(%err, "could not register main thread");
        }

        let requests = self.run_hook(pid, tid, |h, ctx| h.process_created(ctx, info), hooks);
        let mut dispatched = Dispatched::new(requests);
        dispatched.released = released;
        dispatched
    }

    fn process_exited<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ProcessExited, hooks: &mut H) -> Dispatched {
        info!(pid = pid.as_raw(), reason = ?info.reason, "process exited");

        let released = self.tear_down_process(pid);

        let requests = self.run_hook(pid, tid, |h, ctx| h.process_exited(ctx, info), hooks);
        let mut dispatched = Dispatched::new(requests);
        dispatched.released = released;
        dispatched.root_exited = self.root == Some(pid);
        dispatched
    }

    // Remove threads, then modules, then the process record. Returns the handles of
    // everything removed, process handle last.
    fn tear_down_process(&mut self, pid: ProcessId) -> Vec<OsHandle> {
        let mut released: Vec<OsHandle> = self
            .registry
            .remove_threads_of(pid)
            .into_iter()
            .map(|thread| thread.handle)
            .collect();

        let modules = self.registry.clear_modules(pid);
        trace!(pid = pid.as_raw(), modules, "cleared modules");

        match self.registry.remove_process(pid) {
            Ok(process) => released.push(process.handle),
            Err(err) => warn!(%err, "could not remove process"),
        }

        released
    }

    fn thread_created<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ThreadCreated, hooks: &mut H) -> Dispatched {
        debug!(pid = pid.as_raw(), tid = tid.as_raw(), "thread created");

        let thread = ThreadState {
            id: tid,
            handle: info.handle,
            process_id: pid,
            start_address: info.start_address,
        };

        if let Err(err) = self.registry.insert_thread(pid, thread) {
            warn!(%err, "could not register thread");
        }

        let requests = self.run_hook(pid, tid, |h, ctx| h.thread_created(ctx, info), hooks);
        Dispatched::new(requests)
    }

    fn thread_exited<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ThreadExited, hooks: &mut H) -> Dispatched {
        debug!(pid = pid.as_raw(), tid = tid.as_raw(), reason = ?info.reason, "thread exited");

        let released = match self.registry.remove_thread(tid) {
            Some(thread) => vec![thread.handle],
            None => {
                warn!(tid = tid.as_raw(), "exit of unregistered thread");
                vec![]
            },
        };

        let requests = self.run_hook(pid, tid, |h, ctx| h.thread_exited(ctx, info), hooks);
        let mut dispatched = Dispatched::new(requests);
        dispatched.released = released;
        dispatched
    }

    fn module_loaded<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ModuleLoaded, hooks: &mut H) -> Dispatched {
        debug!(pid = pid.as_raw(), base = %info.base_address, path = ?info.path, "module loaded");

        let module = ModuleRecord {
            path: info.path.clone(),
            base: info.base_address,
            size: info.size,
        };

        match self.registry.insert_module(pid, module) {
            Ok(Some(old)) => debug!(path = ?old.path, "module load replaced record at same base"),
            Ok(None) => {},
            Err(err) => warn!(%err, "could not register module"),
        }

        let requests = self.run_hook(pid, tid, |h, ctx| h.module_loaded(ctx, info), hooks);
        Dispatched::new(requests)
    }

    fn module_unloaded<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ModuleUnloaded, hooks: &mut H) -> Dispatched {
        debug!(pid = pid.as_raw(), base = %info.base_address, "module unloaded");

        if self.registry.remove_module(pid, info.base_address).is_none() {
            debug!(base = %info.base_address, "unload of unknown module");
        }

        let requests = self.run_hook(pid, tid, |h, ctx| h.module_unloaded(ctx, info), hooks);
        Dispatched::new(requests)
    }

    fn exception_raised<H: Hooks>(&mut self, pid: ProcessId, tid: ThreadId, info: &ExceptionInfo, hooks: &mut H) -> Dispatched {
        debug!(
            pid = pid.as_raw(),
            tid = tid.as_raw(),
            code = info.code,
            kind = ?info.kind,
            address = %info.address,
            first_chance = info.first_chance,
            "exception raised"
        );

        let requests = self.run_hook(pid, tid, |h, ctx| h.exception(ctx, info), hooks);
        let mut dispatched = Dispatched::new(requests);

        dispatched.disposition = if requests.handled {
            ContinuationDisposition::Continue
        } else {
            ContinuationDisposition::NotHandled
        };

        dispatched
    }

    fn set_state(&mut self, state: LoopState, control: &LoopControl) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "loop state");
        }

        self.state = state;
        control.publish(state);
    }

    /// Run the loop until the root debuggee is gone, a detach completes, or a fatal
    /// event or error occurs.
    pub(crate) fn run<B, H>(&mut self, backend: &mut B, hooks: &mut H, control: &LoopControl, kill_on_exit: bool) -> Result<()>
    where
        B: Backend,
        H: Hooks,
    {
        if self.state != LoopState::Idle || self.root.is_none() {
            return Err(Error::InvalidStateTransition { from: self.state, op: "start" });
        }

        self.set_state(LoopState::Running, control);

        let mut pending = Requests::default();
        let res = self.run_loop(backend, hooks, control, &mut pending);

        if let Err(err) = &res {
            error!(%err, "debug loop failed");
        }

        self.tear_down(backend, kill_on_exit);
        self.set_state(LoopState::Terminated, control);

        res
    }

    fn run_loop<B, H>(&mut self, backend: &mut B, hooks: &mut H, control: &LoopControl, pending: &mut Requests) -> Result<()>
    where
        B: Backend,
        H: Hooks,
    {
        loop {
            // Iteration boundary: observe stop and detach requests.
            let external = control.take_requests();
            pending.stop |= external.stop;
            pending.detach |= external.detach;

            if pending.detach {
                pending.detach = false;
                self.set_state(LoopState::Stopping, control);

                match self.detach_all(backend) {
                    Ok(()) => {
                        info!("detached from all debuggees");
                        return Ok(());
                    },
                    Err(err) => {
                        error!(%err, "detach failed, continuing to debug");
                        self.set_state(LoopState::Running, control);
                    },
                }
            }

            if pending.stop {
                pending.stop = false;

                if !self.stop_issued {
                    self.set_state(LoopState::Stopping, control);
                    self.issue_stop(backend, control);
                }
            }

            let raw = backend.wait_event().map_err(|err| Error::Wait(Box::new(err)))?;
            let pid = ProcessId(raw.process_id);
            let tid = ThreadId(raw.thread_id);

            let event = match translate(raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, pid = pid.as_raw(), tid = tid.as_raw(), "skipping untranslatable event");
                    resume(backend, pid, tid, ContinuationDisposition::Continue)?;
                    continue;
                },
            };

            debug!(pid = pid.as_raw(), tid = tid.as_raw(), kind = ?event.kind(), "debug event");

            let dispatched = self.dispatch(&event, hooks);

            if dispatched.fatal {
                release(backend, &dispatched.released);
                return Ok(());
            }

            resume(backend, pid, tid, dispatched.disposition)?;
            release(backend, &dispatched.released);

            if dispatched.root_exited {
                info!(pid = pid.as_raw(), "root process exited");
                return Ok(());
            }

            pending.stop |= dispatched.requests.stop;
            pending.detach |= dispatched.requests.detach;
        }
    }

    /// Ask the backend to terminate the root. The loop keeps draining events until the
    /// root's exit is observed.
    pub(crate) fn issue_stop<B: Backend>(&mut self, backend: &mut B, control: &LoopControl) {
        let root = match self.root {
            Some(root) => root,
            None => return,
        };

        match backend.terminate(root) {
            Ok(()) => {
                info!(pid = root.as_raw(), "terminating root process");
                self.stop_issued = true;
            },
            Err(err) => {
                error!(%err, "could not terminate root process");
                self.set_state(LoopState::Running, control);
            },
        }
    }

    /// Detach from every tracked process, root last. Processes detached before a failure
    /// are dropped from the registry.
    pub(crate) fn detach_all<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        let mut pids: Vec<ProcessId> = self
            .registry
            .process_ids()
            .into_iter()
            .filter(|&pid| Some(pid) != self.root)
            .collect();

        if let Some(root) = self.root {
            pids.push(root);
        }

        for pid in pids {
            backend.detach(pid)?;

            if self.registry.contains(pid) {
                let released = self.tear_down_process(pid);
                release(backend, &released);
            }
        }

        Ok(())
    }

    // Release every debuggee still tracked when the loop ends.
    fn tear_down<B: Backend>(&mut self, backend: &mut B, kill_on_exit: bool) {
        for pid in self.registry.process_ids() {
            let res = if kill_on_exit {
                backend.terminate(pid)
            } else {
                backend.detach(pid)
            };

            if let Err(err) = res {
                debug!(%err, pid = pid.as_raw(), "could not release leftover debuggee");
            }
        }

        let root = self.root;
        let mut root_handle = None;

        for (process, threads) in self.registry.drain() {
            let handles: Vec<OsHandle> = threads.iter().map(|t| t.handle).collect();
            release(backend, &handles);

            if Some(process.id) == root {
                root_handle = Some(process.handle);
            } else {
                release(backend, &[process.handle]);
            }
        }

        if let Some(handle) = root_handle {
            release(backend, &[handle]);
        }
    }
}

fn resume<B: Backend>(backend: &mut B, pid: ProcessId, tid: ThreadId, disposition: ContinuationDisposition) -> Result<()> {
    backend
        .resume(pid, tid, disposition)
        .map_err(|err| Error::Resume { pid, tid, source: Box::new(err) })
}

fn release<B: Backend>(backend: &mut B, handles: &[OsHandle]) {
    for &handle in handles.iter().filter(|h| h.is_valid()) {
        backend.close_handle(handle);
    }
}
