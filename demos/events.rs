use anyhow::Result;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

use tether::*;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Attach to this running process instead of spawning one.
    #[structopt(short, long)]
    pid: Option<u32>,

    /// Do not follow forked children.
    #[structopt(long)]
    no_follow: bool,

    /// Leave debuggees running when the session ends.
    #[structopt(long)]
    detach_on_exit: bool,

    /// Mark every exception handled, suppressing signals.
    #[structopt(long)]
    swallow: bool,

    argv: Vec<String>,
}

#[derive(Default)]
struct Counts {
    events: usize,
    swallow: bool,
}

impl Counts {
    fn log(&mut self, ctx: &Context<'_>, what: impl std::fmt::Display) {
        self.events += 1;

        let processes = ctx.registry().len();
        let threads = ctx.registry().thread_count();
        println!("[{:>4}] {}/{} {} ({} processes, {} threads)", self.events, ctx.process_id(), ctx.thread_id(), what, processes, threads);
    }
}

impl Hooks for Counts {
    fn process_created(&mut self, ctx: &mut Context<'_>, info: &ProcessCreated) {
        self.log(ctx, format!("process created: {:?}", info.image_path));
    }

    fn process_exited(&mut self, ctx: &mut Context<'_>, info: &ProcessExited) {
        self.log(ctx, format!("process exited: {:?}", info.reason));
    }

    fn thread_created(&mut self, ctx: &mut Context<'_>, _info: &ThreadCreated) {
        self.log(ctx, "thread created");
    }

    fn thread_exited(&mut self, ctx: &mut Context<'_>, info: &ThreadExited) {
        self.log(ctx, format!("thread exited: {:?}", info.reason));
    }

    fn module_loaded(&mut self, ctx: &mut Context<'_>, info: &ModuleLoaded) {
        self.log(ctx, format!("module loaded: {:?} at {}", info.path, info.base_address));
    }

    fn module_unloaded(&mut self, ctx: &mut Context<'_>, info: &ModuleUnloaded) {
        self.log(ctx, format!("module unloaded: {}", info.base_address));
    }

    fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {
        let module = ctx
            .current_process()
            .and_then(|p| p.modules().containing(info.address))
            .and_then(|m| m.path.clone());

        self.log(ctx, format!("exception: {:?} at {} in {:?}", info.kind, info.address, module));

        if self.swallow {
            ctx.mark_handled();
        }
    }

    fn debug_output(&mut self, ctx: &mut Context<'_>, info: &DebugOutput) {
        self.log(ctx, format!("output: {}", info.message));
    }

    fn fatal(&mut self, ctx: &mut Context<'_>, info: &FatalSystemEvent) {
        self.log(ctx, format!("fatal: error = {}, {:?}", info.error, info.severity));
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = Opt::from_args();

    let mut options = Options::new();
    options.set_follow_children(!opt.no_follow).set_kill_on_exit(!opt.detach_on_exit);

    let hooks = Counts { swallow: opt.swallow, ..Counts::default() };
    let backend = PtraceBackend::with_options(options.clone());
    let mut session = Session::with_options(backend, hooks, options);

    match (opt.pid, opt.argv.split_first()) {
        (Some(pid), _) => session.attach(ProcessId(pid))?,
        (None, Some((program, rest))) => session.init(program, &args(rest.iter()), None)?,
        (None, None) => anyhow::bail!("nothing to debug: pass --pid or a command"),
    }

    session.start()?;
    println!("{} events", session.hooks().events);

    Ok(())
}
