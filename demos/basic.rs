use std::env;
use std::ffi::OsString;

use tether::{Context, ExceptionInfo, Hooks, ModuleLoaded, ProcessCreated, ProcessExited, PtraceBackend, Session};


struct Printer;

impl Hooks for Printer {
    fn process_created(&mut self, ctx: &mut Context<'_>, info: &ProcessCreated) {
        println!("{}: created, image = {:?}, base = {}", ctx.process_id(), info.image_path, info.base_address);
    }

    fn process_exited(&mut self, ctx: &mut Context<'_>, info: &ProcessExited) {
        println!("{}: exited, {:?}", ctx.process_id(), info.reason);
    }

    fn module_loaded(&mut self, ctx: &mut Context<'_>, info: &ModuleLoaded) {
        println!("{}: loaded {:?} at {}", ctx.process_id(), info.path, info.base_address);
    }

    fn exception(&mut self, ctx: &mut Context<'_>, info: &ExceptionInfo) {
        println!("{}/{}: {:?} at {}", ctx.process_id(), ctx.thread_id(), info.kind, info.address);
    }
}

fn main() -> anyhow::Result<()> {
    let mut argv = env::args_os().skip(1);
    let program = argv.next().ok_or_else(|| anyhow::anyhow!("usage: basic <program> [args...]"))?;
    let args: Vec<OsString> = argv.collect();

    let mut session = Session::new(PtraceBackend::new(), Printer);
    session.init(program, &args, None)?;
    session.start()?;

    Ok(())
}
