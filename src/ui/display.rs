use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use super::command::{dispatch_table, Command, DispatchTable};
use super::console::ConsoleCtl;
use super::page::PageStack;
use super::term::Screen;
use super::view::ViewType;
use crate::dump::Dump;
use crate::error::{Error, Result};
use crate::perf::sampler::SamplerCtl;
use crate::proc::{Registry, SortKey};
use crate::topo::Topology;
use crate::util::{CycleCalib, TimeBase};

/// Wakeup reasons for the display thread. A single latest-wins slot, like
/// the flag word the whole UI protocol is built around.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispFlag {
    None,
    Quit,
    ProfilingDataReady,
    ProfilingDataFail,
    LlDataReady,
    LlDataFail,
    PqosDataReady,
    PqosDataFail,
    Cmd,
    ScrollUp,
    ScrollDown,
    ScrollEnter,
}

struct DispState {
    flag: DispFlag,
    cmd: Option<Command>,
    intval_ms: u64,
}

/// Shared handle between the sampler, console, and display threads. The
/// primary flag drives the display loop; the secondary flag is a
/// blocking rendezvous used by pre-hooks that need one sample cycle to
/// complete before they reconfigure.
pub struct DispCtl {
    state: Mutex<DispState>,
    cond: Condvar,
    flag2_tx: Sender<DispFlag>,
    flag2_rx: Receiver<DispFlag>,
}

impl DispCtl {
    pub fn new() -> Arc<DispCtl> {
        let (flag2_tx, flag2_rx) = bounded(1);
        Arc::new(DispCtl {
            state: Mutex::new(DispState {
                flag: DispFlag::None,
                cmd: None,
                intval_ms: 0,
            }),
            cond: Condvar::new(),
            flag2_tx,
            flag2_rx,
        })
    }

    fn set_flag(&self, flag: DispFlag) {
        let mut state = self.state.lock();
        state.flag = flag;
        self.cond.notify_one();
    }

    pub fn profiling_data_ready(&self, intval_ms: u64) {
        let mut state = self.state.lock();
        state.intval_ms = intval_ms;
        state.flag = DispFlag::ProfilingDataReady;
        self.cond.notify_one();
    }

    pub fn profiling_data_fail(&self) {
        self.set_flag(DispFlag::ProfilingDataFail);
    }

    pub fn ll_data_ready(&self, intval_ms: u64) {
        let mut state = self.state.lock();
        state.intval_ms = intval_ms;
        state.flag = DispFlag::LlDataReady;
        self.cond.notify_one();
    }

    pub fn ll_data_fail(&self) {
        self.set_flag(DispFlag::LlDataFail);
    }

    pub fn pqos_data_ready(&self, intval_ms: u64) {
        let mut state = self.state.lock();
        state.intval_ms = intval_ms;
        state.flag = DispFlag::PqosDataReady;
        self.cond.notify_one();
    }

    pub fn pqos_data_fail(&self) {
        self.set_flag(DispFlag::PqosDataFail);
    }

    pub fn send_cmd(&self, cmd: Command) {
        let mut state = self.state.lock();
        state.cmd = Some(cmd);
        state.flag = DispFlag::Cmd;
        self.cond.notify_one();
    }

    pub fn scroll(&self, flag: DispFlag) {
        self.set_flag(flag);
    }

    /// Terminal gone: the console cannot serve keys any more, the
    /// display run ends.
    pub fn quit(&self) {
        self.set_flag(DispFlag::Quit);
    }

    /// Post the secondary flag. Latest-wins: if the display has not yet
    /// consumed the previous value there is nothing useful to add.
    pub fn flag2_set(&self, flag: DispFlag) {
        let _ = self.flag2_tx.try_send(flag);
    }

    /// Block until the sampler posts the secondary flag.
    pub fn flag2_wait(&self) -> Result<DispFlag> {
        self.flag2_rx
            .recv_timeout(Duration::from_secs(60))
            .map_err(|_| Error::RendezvousTimeout)
    }

    pub fn intval_ms(&self) -> u64 {
        self.state.lock().intval_ms
    }
}

/// Everything the dispatch operations work on: the page stack, the view
/// state, and handles to the data model and sampler.
pub struct DisplayCtx {
    pub topo: Arc<Topology>,
    pub registry: Arc<Registry>,
    pub sampler: Arc<SamplerCtl>,
    pub disp: Arc<DispCtl>,
    pub pages: PageStack,
    pub screen: Screen,
    pub dump: Arc<Dump>,
    pub sortkey: SortKey,
    pub calib: CycleCalib,
    pub cmt_enabled: bool,
}

impl DisplayCtx {
    /// View type governing command dispatch right now; before the first
    /// page exists the home view's table row applies.
    pub fn current_view_type(&self) -> ViewType {
        self.pages
            .current()
            .map(|p| p.view.view_type())
            .unwrap_or(ViewType::Home)
    }
}

const WARN_WAIT: &str = "Sampling the performance counters, please wait...";
const WARN_SMALL: &str = "Terminal size is too small; resize to 80x24 or larger.";

/// Render or sample the queued page, mirroring the original's
/// `page_next_execute`: with `smpl` the page stays queued and is redrawn
/// when the data-ready flag arrives; without it the page renders from the
/// data already collected.
pub fn page_next_execute(ctx: &mut DisplayCtx, smpl: bool) -> bool {
    let Some(next) = ctx.pages.next_run() else {
        return false;
    };

    let ok = page_show(ctx, next, smpl);
    ctx.pages.set_current(next);
    if !smpl {
        ctx.pages.clear_next_run();
    }

    ok
}

fn page_show(ctx: &mut DisplayCtx, idx: usize, smpl: bool) -> bool {
    if ctx.screen.too_small() {
        ctx.screen.warn(WARN_SMALL);
        ctx.dump.write_line(WARN_SMALL);
        return false;
    }

    if ctx.topo.refresh(false).is_err() {
        return false;
    }

    if smpl {
        ctx.screen.warn(WARN_WAIT);
        return smpl_start(ctx, idx);
    }

    draw_page(ctx, idx)
}

/// Ask the sampler for the data the page's command needs.
fn smpl_start(ctx: &mut DisplayCtx, idx: usize) -> bool {
    let cmd = match ctx.pages.page(idx) {
        Some(page) => page.cmd.clone(),
        None => return false,
    };

    let res = match &cmd {
        Command::Home
        | Command::IrNormalize
        | Command::Monitor { .. }
        | Command::Lwp { .. }
        | Command::NodeOverview
        | Command::CallChain { .. } => ctx.sampler.profiling_smpl(true),
        Command::NodeDetail { nid } => ctx.sampler.uncore_smpl(*nid),
        Command::Lat { pid, tid }
        | Command::LlCallChain { pid, tid, .. }
        | Command::LatNode { pid, tid, .. }
        | Command::AccDst { pid, tid } => ctx.sampler.ll_smpl(*pid, *tid),
        Command::PqosCmt { pid, tid, .. } | Command::PqosMbm { pid, tid, .. } => {
            ctx.sampler.pqos_smpl(*pid, *tid)
        }
        _ => return false,
    };

    res.is_ok()
}

pub fn draw_page(ctx: &mut DisplayCtx, idx: usize) -> bool {
    let Some(page) = ctx.pages.page_mut(idx) else {
        return false;
    };

    let mut view = std::mem::take(&mut page.view);
    let cmd = page.cmd.clone();
    let model = view.draw(ctx, &cmd);

    if let Some(page) = ctx.pages.page_mut(idx) {
        page.view = view;
    }

    match model {
        Some(model) => {
            ctx.screen.render(&model);
            ctx.dump.write_frame(model.dump_lines().iter().map(|s| s.as_str()));
            true
        }
        None => false,
    }
}

fn go_home(ctx: &mut DisplayCtx, table: &DispatchTable) {
    execute_command(ctx, table, Command::Home);
}

fn execute_command(ctx: &mut DisplayCtx, table: &DispatchTable, mut cmd: Command) {
    let view_type = ctx.current_view_type();
    let cell = table.cell(view_type, cmd.id());

    let mut smpl = false;
    if let Some(preop) = cell.preop {
        if preop(ctx, &mut cmd, &mut smpl).is_err() {
            log::debug!("pre-hook failed for {:?} in {:?}", cmd.id(), view_type);
            return;
        }
    }

    if let Some(op) = cell.op {
        let _ = op(ctx, &cmd, smpl);
    }
}

fn key_scroll(ctx: &mut DisplayCtx, up: bool) {
    if let Some(idx) = ctx.pages.current_index() {
        if let Some(page) = ctx.pages.page_mut(idx) {
            page.view.scroll(up);
        }
        draw_page(ctx, idx);
    }
}

fn scroll_enter(ctx: &mut DisplayCtx, table: &DispatchTable) {
    let cmd = ctx
        .pages
        .current_index()
        .and_then(|idx| ctx.pages.page_mut(idx))
        .and_then(|page| page.view.scroll_enter());

    if let Some(cmd) = cmd {
        execute_command(ctx, table, cmd);
    }
}

/// The display thread: waits on the flag condvar with the refresh
/// timeout; a timeout synthesises a refresh of the current page, a
/// command goes through the dispatch table, data flags redraw, failure
/// flags navigate home.
pub fn display_thread(
    mut ctx: DisplayCtx,
    console: Arc<ConsoleCtl>,
    refresh_secs: u64,
    run_secs: Option<u64>,
) {
    let table = dispatch_table();
    let timebase = TimeBase::new();
    let mut timeout = Duration::from_secs(0);

    loop {
        let (flag, cmd, timed_out) = {
            let mut state = ctx.disp.state.lock();
            let mut timed_out = false;
            while state.flag == DispFlag::None {
                let result = ctx.disp.cond.wait_for(&mut state, timeout);
                if result.timed_out() {
                    timed_out = true;
                    break;
                }
            }

            let flag = state.flag;
            let cmd = state.cmd.take();
            state.flag = DispFlag::None;
            (flag, cmd, timed_out)
        };

        if let Some(limit) = run_secs {
            if timebase.current_ms() / 1000 >= limit {
                log::debug!("display: run time exhausted");
                break;
            }
        }

        if timed_out && flag == DispFlag::None {
            if ctx.pages.current().is_none() {
                timeout = Duration::from_secs(refresh_secs);
                continue;
            }

            execute_command(&mut ctx, &table, Command::Refresh);
            console.set_view_type(ctx.current_view_type());
            timeout = Duration::from_secs(refresh_secs);
            continue;
        }

        match flag {
            DispFlag::Quit => break,
            DispFlag::Cmd => {
                let Some(cmd) = cmd else { continue };
                match cmd {
                    Command::Quit => break,
                    Command::Resize => {
                        ctx.screen.resize();
                        execute_command(&mut ctx, &table, Command::Resize);
                        timeout = Duration::from_secs(refresh_secs);
                    }
                    Command::Refresh => {
                        execute_command(&mut ctx, &table, Command::Refresh);
                        timeout = Duration::from_secs(refresh_secs);
                    }
                    other => execute_command(&mut ctx, &table, other),
                }
            }
            DispFlag::ProfilingDataReady | DispFlag::LlDataReady | DispFlag::PqosDataReady => {
                page_next_execute(&mut ctx, false);
                timeout = Duration::from_secs(refresh_secs);
            }
            DispFlag::ProfilingDataFail | DispFlag::LlDataFail | DispFlag::PqosDataFail => {
                log::debug!("display: sampling failed, navigating home");
                ctx.screen.warn("Sampling failed; returning to the home view.");
                go_home(&mut ctx, &table);
            }
            DispFlag::ScrollUp => key_scroll(&mut ctx, true),
            DispFlag::ScrollDown => key_scroll(&mut ctx, false),
            DispFlag::ScrollEnter => scroll_enter(&mut ctx, &table),
            DispFlag::None => {}
        }

        console.set_view_type(ctx.current_view_type());
    }

    // Quit path: drop the pages, stop the counters, end the console.
    ctx.pages.clear();
    let _ = ctx.sampler.allstop();
    console.request_quit();
    ctx.dump.flush();
}
