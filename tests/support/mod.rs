use std::collections::HashMap;

use pretty_assertions::assert_eq;
use tether::*;

/// Construct an expected hook call with a readable, test-friendly syntax.
macro_rules! seen {
    ($pid: expr, $tid: expr, $kind: ident) => {{
        support::Seen {
            kind: tether::EventKind::$kind,
            pid: $pid,
            tid: $tid,
        }
    }};
}

/// One hook call, as observed by [`Recorder`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Seen {
    pub kind: EventKind,
    pub pid: u32,
    pub tid: u32,
}

/// Hooks that record every call, and optionally act on some of them.
#[allow(unused)]
#[derive(Debug, Default)]
pub struct Recorder {
    pub seen: Vec<Seen>,

    /// Per call, whether the originating process was registered when the hook ran.
    pub registered: Vec<bool>,

    pub exceptions: Vec<ExceptionInfo>,
    pub exits: Vec<(u32, ExitReason)>,
    pub modules: Vec<ModuleLoaded>,
    pub output: Vec<String>,

    /// Per call, the loop state seen through `control`, if set.
    pub states: Vec<LoopState>,
    pub control: Option<SessionControl>,

    pub handle_exceptions: bool,
    pub stop_on: Option<EventKind>,
    pub detach_on: Option<EventKind>,
}

#[allow(unused)]
impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handling_exceptions() -> Self {
        Self { handle_exceptions: true, ..Self::default() }
    }

    pub fn stopping_on(kind: EventKind) -> Self {
        Self { stop_on: Some(kind), ..Self::default() }
    }

    pub fn detaching_on(kind: EventKind) -> Self {
        Self { detach_on: Some(kind), ..Self::default() }
    }

    /// Recorded calls, without module events.
    pub fn lifecycle(&self) -> Vec<Seen> {
        self.seen
            .iter()
            .copied()
            .filter(|s| !matches!(s.kind, EventKind::ModuleLoaded | EventKind::ModuleUnloaded))
            .collect()
    }

    fn record(&mut self, ctx: &mut Context<'_>, kind: EventKind) {
        eprintln!("{}/{}: {:?}", ctx.process_id(), ctx.thread_id(), kind);

        self.seen.push(Seen {
            kind,
            pid: ctx.process_id().as_raw(),
            tid: ctx.thread_id().as_raw(),
        });
        self.registered.push(ctx.current_process().is_some());

        if let Some(control) = &self.control {
            self.states.push(control.state());
        }

        if self.stop_on == Some(kind) {
            self.stop_on = None;
            ctx.request_stop();
        }

        if self.detach_on == Some(kind) {
            self.detach_on = None;
            ctx.request_detach();
        }
    }
}

impl Hooks for Recorder {
    fn process_created(&mut self, ctx: &mut Context<'_>, _info: &ProcessCreated) {
        self.record(ctx, EventKind::ProcessCreated);
    }

    fn process_exited(&mut self, ctx: &mut Context<'_>, info: &ProcessExited) {
        self.exits.push((ctx.process_id().as_raw(), info.reason));
        self.record(ctx, EventKind::ProcessExited);
    }

    fn thread_created(&mut self, ctx: &mut Context<'_>, _info: &ThreadCreated) {
        self.record(ctx, EventKind::ThreadCreated);
    }

    fn thread_exited(&mut self, ctx: &mut Context<'_>, _info: &ThreadExited) {
        self.record(ctx, EventKind::ThreadExited);
    }

    fn module_loaded(&mut self, ctx: &mut Context<'_>, info: &ModuleLoaded) {
        self.modules.push(info.clone());
        self.record(ctx, EventKind::ModuleLoaded);
    }

    fn module_unloaded(&mut self, ctx: &mut Context<'_>, _info: &ModuleUnloaded) {
        self.record(ctx, EventKind::ModuleUnloaded);
    }

    fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {
        self.exceptions.push(info.clone());

        if self.handle_exceptions {
            ctx.mark_handled();
        }

        self.record(ctx, EventKind::ExceptionRaised);
    }

    fn debug_output(&mut self, ctx: &mut Context<'_>, info: &DebugOutput) {
        self.output.push(info.message.clone());
        self.record(ctx, EventKind::DebugOutput);
    }

    fn fatal(&mut self, ctx: &mut Context<'_>, _info: &FatalSystemEvent) {
        self.record(ctx, EventKind::FatalSystemEvent);
    }
}

/// Assert that two hook traces are equivalent modulo id normalization.
#[allow(unused)]
pub fn assert_equivalent(left: &[Seen], right: &[Seen]) {
    let normed_left = Normalizer::normalize(left);
    let normed_right = Normalizer::normalize(right);
    assert_eq!(normed_left, normed_right)
}

/// Normalizes a trace by substituting each concrete raw id with the ordinal of its first
/// appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<u32, u32>,
}

impl Normalizer {
    fn normalize(trace: &[Seen]) -> Vec<Seen> {
        let mut normalizer = Normalizer::default();

        trace
            .iter()
            .map(|seen| Seen {
                kind: seen.kind,
                pid: normalizer.id(seen.pid),
                tid: normalizer.id(seen.tid),
            })
            .collect()
    }

    fn id(&mut self, raw: u32) -> u32 {
        let next_free = self.map.len() as u32;
        *self.map.entry(raw).or_insert(next_free)
    }
}
