//! Extension point for tooling that reacts to dispatched events.

use crate::event::*;
use crate::registry::{ProcessRegistry, ProcessState, ThreadState};
use crate::types::{ProcessId, ThreadId};


/// Per-event-kind callbacks, each a no-op by default.
///
/// Every hook runs after the core handler has applied the event to the registry. On
/// [`Hooks::thread_exited`], for example, the thread is already gone.
#[allow(unused_variables)]
pub trait Hooks {
    fn process_created(&mut self, ctx: &mut Context<'_>, info: &ProcessCreated) {}

    fn process_exited(&mut self, ctx: &mut Context<'_>, info: &ProcessExited) {}

    fn thread_created(&mut self, ctx: &mut Context<'_>, info: &ThreadCreated) {}

    fn thread_exited(&mut self, ctx: &mut Context<'_>, info: &ThreadExited) {}

    fn module_loaded(&mut self, ctx: &mut Context<'_>, info: &ModuleLoaded) {}

    fn module_unloaded(&mut self, ctx: &mut Context<'_>, info: &ModuleUnloaded) {}

    /// Call [`Context::mark_handled()`] to resume with [`ContinuationDisposition::Continue`].
    fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {}

    fn debug_output(&mut self, ctx: &mut Context<'_>, info: &DebugOutput) {}

    /// The session ends after this hook returns.
    fn fatal(&mut self, ctx: &mut Context<'_>, info: &FatalSystemEvent) {}
}

/// Hooks that do nothing.
impl Hooks for () {}

impl<H: Hooks + ?Sized> Hooks for &mut H {
    fn process_created(&mut self, ctx: &mut Context<'_>, info: &ProcessCreated) {
        (**self).process_created(ctx, info)
    }

    fn process_exited(&mut self, ctx: &mut Context<'_>, info: &ProcessExited) {
        (**self).process_exited(ctx, info)
    }

    fn thread_created(&mut self, ctx: &mut Context<'_>, info: &ThreadCreated) {
        (**self).thread_created(ctx, info)
    }

    fn thread_exited(&mut self, ctx: &mut Context<'_>, info: &ThreadExited) {
        (**self).thread_exited(ctx, info)
    }

    fn module_loaded(&mut self, ctx: &mut Context<'_>, info: &ModuleLoaded) {
        (**self).module_loaded(ctx, info)
    }

    fn module_unloaded(&mut self, ctx: &mut Context<'_>, info: &ModuleUnloaded) {
        (**self).module_unloaded(ctx, info)
    }

    fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {
        (**self).exception(ctx, info)
    }

    fn debug_output(&mut self, ctx: &mut Context<'_>, info: &DebugOutput) {
        (**self).debug_output(ctx, info)
    }

    fn fatal(&mut self, ctx: &mut Context<'_>, info: &FatalSystemEvent) {
        (**self).fatal(ctx, info)
    }
}

/// Requests a hook can make of the running loop.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Requests {
    pub handled: bool,
    pub stop: bool,
    pub detach: bool,
}

/// View of the session handed to each hook.
pub struct Context<'a> {
    registry: &'a ProcessRegistry,
    process_id: ProcessId,
    thread_id: ThreadId,
    root: Option<ProcessId>,
    requests: Requests,
}

impl<'a> Context<'a> {
    pub(crate) fn new(
        registry: &'a ProcessRegistry,
        process_id: ProcessId,
        thread_id: ThreadId,
        root: Option<ProcessId>,
    ) -> Self {
        Self {
            registry,
            process_id,
            thread_id,
            root,
            requests: Requests::default(),
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        self.registry
    }

    /// The process the event originated from, if it is (still) registered.
    ///
    /// During [`Hooks::process_exited`] this is `None`, since the process has already
    /// been removed.
    pub fn current_process(&self) -> Option<&ProcessState> {
        self.registry.current_process()
    }

    /// The thread the event originated from, if it is (still) registered.
    pub fn current_thread(&self) -> Option<&ThreadState> {
        self.registry.lookup_thread(self.thread_id)
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn root_process_id(&self) -> Option<ProcessId> {
        self.root
    }

    pub fn is_root(&self) -> bool {
        self.root == Some(self.process_id)
    }

    /// Mark the current exception as handled. No effect for other event kinds.
    pub fn mark_handled(&mut self) {
        self.requests.handled = true;
    }

    /// Request termination of the root process once this event settles.
    pub fn request_stop(&mut self) {
        self.requests.stop = true;
    }

    /// Request a detach from all debuggees once this event settles.
    pub fn request_detach(&mut self) {
        self.requests.detach = true;
    }

    pub(crate) fn into_requests(self) -> Requests {
        self.requests
    }
}
