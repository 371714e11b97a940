mod arch;
mod cli;
mod dump;
mod error;
mod perf;
mod proc;
mod symbols;
mod topo;
mod ui;
mod util;

use std::sync::Arc;

use clap::Parser;

use cli::Opt;
use dump::Dump;
use error::Result;
use proc::{Registry, SortKey};
use topo::Topology;
use ui::console::{console_thread, ConsoleCtl};
use ui::display::{display_thread, DispCtl, DisplayCtx};
use ui::page::PageStack;
use ui::term::Screen;
use util::TimeBase;

fn init_logging(opt: &Opt) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(opt.log_level());

    if let Some(path) = &opt.log_file {
        match std::fs::File::create(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(err) => eprintln!("nodetop: cannot open log file {}: {err}", path.display()),
        }
    }

    builder.init();
}

fn main() {
    let opt = Opt::parse();
    init_logging(&opt);

    if let Err(err) = run(&opt) {
        eprintln!("nodetop: {err}");
        std::process::exit(1);
    }
}

/// Bring the system up in dependency order (topology, counter table,
/// registry, sampler, display, console) and tear it down in reverse.
fn run(opt: &Opt) -> Result<()> {
    let event_table = arch::detect()?;
    let conf = arch::profiling_conf(&event_table, opt.precision);
    let ll_conf = arch::ll_conf(&event_table);

    let topo = Arc::new(Topology::new()?);
    topo.with_nodes(|inner| {
        for node in inner.nodes.iter_mut().filter(|n| n.is_valid()) {
            node.qpi = perf::uncore::discover_qpi();
            node.imc = perf::uncore::discover_imc();
        }
    });

    let registry = Arc::new(Registry::new());
    registry.enum_update(0, topo.cpu_slots());

    let calib = util::calibrate();
    let timebase = TimeBase::new();
    let dump = Arc::new(match &opt.dump_file {
        Some(path) => Dump::create(path).map_err(|source| error::Error::File {
            path: path.clone(),
            source,
        })?,
        None => Dump::disabled(),
    });

    let disp = DispCtl::new();
    let sampler = perf::sampler::spawn(
        topo.clone(),
        registry.clone(),
        disp.clone(),
        conf,
        ll_conf,
        opt.precision,
        timebase,
    );

    // Counting must come up before any UI exists; a failure here is a
    // setup failure and the process exits non-zero.
    if let Err(err) = sampler.profiling_start() {
        sampler.quit();
        return Err(err);
    }

    let cmt_enabled = perf::pqos::resctrl_mounted();
    let console_ctl = ConsoleCtl::new(cmt_enabled)?;

    // Signal handlers do nothing beyond writing one pipe byte.
    {
        let resize_ctl = console_ctl.clone();
        let int_ctl = console_ctl.clone();
        let term_ctl = console_ctl.clone();
        unsafe {
            let _ = signal_hook::low_level::register(signal_hook::consts::SIGWINCH, move || {
                resize_ctl.notify_resize();
            });
            let _ = signal_hook::low_level::register(signal_hook::consts::SIGINT, move || {
                int_ctl.notify_interrupt();
            });
            let _ = signal_hook::low_level::register(signal_hook::consts::SIGTERM, move || {
                term_ctl.notify_interrupt();
            });
        }
    }

    let interactive = unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1;
    let screen = Screen::new(interactive);

    let ctx = DisplayCtx {
        topo,
        registry,
        sampler: sampler.clone(),
        disp: disp.clone(),
        pages: PageStack::new(),
        screen,
        dump,
        sortkey: SortKey::Cpu,
        calib,
        cmt_enabled,
    };

    let console_handle = {
        let ctl = console_ctl.clone();
        let disp = disp.clone();
        std::thread::Builder::new()
            .name("console".into())
            .spawn(move || console_thread(ctl, disp))?
    };

    // The display loop runs on the main thread until quit or the run
    // budget expires; its tail stops the sampler and ends the console.
    display_thread(ctx, console_ctl, opt.interval_secs, opt.run_secs);

    let _ = console_handle.join();
    sampler.quit();
    Ok(())
}
