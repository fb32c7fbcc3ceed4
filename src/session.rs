//! Public facade over a backend, the dispatcher, and the user's hooks.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{Backend, Launched};
use crate::dispatch::{Dispatcher, LoopControl, LoopState};
use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::options::Options;
use crate::registry::ProcessRegistry;
use crate::types::ProcessId;


/// One debugging session: a root debuggee, the live state of everything it spawns, and
/// the hooks that observe it.
///
/// ```no_run
/// use tether::{PtraceBackend, Session};
///
/// let mut session = Session::new(PtraceBackend::new(), ());
/// session.init("/bin/true", &[], None)?;
/// session.start()?;
/// # Ok::<(), tether::Error>(())
/// ```
pub struct Session<B: Backend, H: Hooks> {
    backend: B,
    hooks: H,
    options: Options,
    dispatcher: Dispatcher,
    root: Option<Launched>,
    control: Arc<LoopControl>,
}

impl<B: Backend, H: Hooks> Session<B, H> {
    pub fn new(backend: B, hooks: H) -> Self {
        Self::with_options(backend, hooks, Options::default())
    }

    pub fn with_options(backend: B, hooks: H, options: Options) -> Self {
        Self {
            backend,
            hooks,
            options,
            dispatcher: Dispatcher::new(None),
            root: None,
            control: Arc::new(LoopControl::default()),
        }
    }

    /// Create the root debuggee.
    ///
    /// On failure the session is left without a root, and [`Session::start()`] is invalid.
    pub fn init(&mut self, program: impl AsRef<Path>, args: &[OsString], cwd: Option<&Path>) -> Result<()> {
        let program = program.as_ref();
        self.check_initializable("init")?;

        let launched = self.backend.spawn(program, args, cwd)?;
        info!(pid = launched.process_id.as_raw(), ?program, "spawned root debuggee");

        self.set_root(launched);
        Ok(())
    }

    /// Start debugging a running process as the root debuggee.
    pub fn attach(&mut self, pid: ProcessId) -> Result<()> {
        self.check_initializable("attach")?;

        let launched = self.backend.attach(pid)?;
        info!(pid = pid.as_raw(), "attached to root debuggee");

        self.set_root(launched);
        Ok(())
    }

    fn check_initializable(&self, op: &'static str) -> Result<()> {
        match self.state() {
            LoopState::Idle if self.root.is_none() => Ok(()),
            LoopState::Terminated => Ok(()),
            from => Err(Error::InvalidStateTransition { from, op }),
        }
    }

    fn set_root(&mut self, launched: Launched) {
        self.dispatcher.reset(Some(launched.process_id));
        self.root = Some(launched);
        self.control.reset();
    }

    /// Run the debug loop. Blocks until the root debuggee exits, the session detaches,
    /// or a fatal event or error occurs.
    pub fn start(&mut self) -> Result<()> {
        if self.root.is_none() || self.state() != LoopState::Idle {
            return Err(Error::InvalidStateTransition { from: self.state(), op: "start" });
        }

        let res = self.dispatcher.run(
            &mut self.backend,
            &mut self.hooks,
            &self.control,
            self.options.kill_on_exit(),
        );

        self.release_root();
        res
    }

    /// Terminate the root debuggee.
    ///
    /// The root's exit is still delivered as an event, once the loop runs. To stop a
    /// running loop, use [`Context::request_stop()`](crate::Context::request_stop) from a
    /// hook, or [`SessionControl::request_stop()`] from another thread.
    pub fn stop(&mut self) -> Result<()> {
        let root = self.live_root("stop")?;
        self.backend.terminate(root)
    }

    /// Stop debugging without killing the debuggees. All tracked state is cleared.
    pub fn detach(&mut self) -> Result<()> {
        self.live_root("detach")?;

        self.dispatcher.detach_all(&mut self.backend)?;
        debug!("detached from all debuggees");

        self.release_root();
        self.dispatcher.reset(None);
        self.control.reset();
        self.root = None;
        Ok(())
    }

    fn live_root(&self, op: &'static str) -> Result<ProcessId> {
        match (self.state(), self.root) {
            (LoopState::Idle, Some(root)) => Ok(root.process_id),
            (from, _) => Err(Error::InvalidStateTransition { from, op }),
        }
    }

    // Close the launched handles of a root the registry never took over. Adopted handles
    // are closed by the dispatcher, root last.
    fn release_root(&mut self) {
        if self.dispatcher.root_adopted() {
            return;
        }

        if let Some(root) = &self.root {
            for handle in [root.process_handle, root.thread_handle] {
                if handle.is_valid() {
                    self.backend.close_handle(handle);
                }
            }
        }
    }

    /// Handle for requesting a stop or detach from another thread.
    pub fn control(&self) -> SessionControl {
        SessionControl { inner: Arc::clone(&self.control) }
    }

    pub fn state(&self) -> LoopState {
        self.dispatcher.state()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        self.dispatcher.registry()
    }

    pub fn root(&self) -> Option<Launched> {
        self.root
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut H {
        &mut self.hooks
    }

    pub fn into_hooks(self) -> H {
        self.hooks
    }
}

/// Cross-thread handle to a session's loop-control flags.
///
/// Requests are observed at the loop's next iteration boundary, which is after the next
/// debug event arrives.
#[derive(Clone, Debug)]
pub struct SessionControl {
    inner: Arc<LoopControl>,
}

impl SessionControl {
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    pub fn request_detach(&self) {
        self.inner.request_detach();
    }

    pub fn state(&self) -> LoopState {
        self.inner.state()
    }
}

/// Convenience for the common "spawn a program with string arguments" case.
pub fn args<I, S>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    args.into_iter().map(Into::into).collect()
}
