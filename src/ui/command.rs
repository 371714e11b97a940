use super::display::{self, DispFlag, DisplayCtx};
use super::view::{SortScope, ViewType, VIEW_TYPE_NUM};
use crate::error::{Error, Result};
use crate::perf::pqos::{PQOS_FLAG_LLC, PQOS_FLAG_LOCAL_BW, PQOS_FLAG_TOTAL_BW};
use crate::perf::UiCountId;
use crate::proc::SortKey;
use crate::symbols::maps;

/// Everything the console can ask of the display thread, typed by what
/// each request carries.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Home,
    IrNormalize,
    Monitor { pid: i32, tid: i32 },
    Lwp { pid: i32 },
    Lat { pid: i32, tid: i32 },
    LatNode { pid: i32, tid: i32, addr: u64, size: u64 },
    NodeOverview,
    NodeDetail { nid: i32 },
    CallChain { pid: i32, tid: i32 },
    LlCallChain { pid: i32, tid: i32, addr: u64, size: u64, desc: String },
    AccDst { pid: i32, tid: i32 },
    MapGet,
    MapStop,
    PqosCmt { pid: i32, tid: i32, flags: u32 },
    PqosMbm { pid: i32, tid: i32, flags: u32 },
    Num(u8),
    Refresh,
    Quit,
    Back,
    Resize,
}

/// Dispatch-table row index of each command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum CmdId {
    Home = 0,
    IrNormalize,
    Monitor,
    Lwp,
    Lat,
    LatNode,
    NodeOverview,
    NodeDetail,
    CallChain,
    LlCallChain,
    AccDst,
    MapGet,
    MapStop,
    PqosCmt,
    PqosMbm,
    Num1,
    Num2,
    Num3,
    Num4,
    Num5,
    Refresh,
    Quit,
    Back,
    Resize,
}

pub const CMD_NUM: usize = 24;

impl Command {
    pub fn id(&self) -> CmdId {
        match self {
            Command::Home => CmdId::Home,
            Command::IrNormalize => CmdId::IrNormalize,
            Command::Monitor { .. } => CmdId::Monitor,
            Command::Lwp { .. } => CmdId::Lwp,
            Command::Lat { .. } => CmdId::Lat,
            Command::LatNode { .. } => CmdId::LatNode,
            Command::NodeOverview => CmdId::NodeOverview,
            Command::NodeDetail { .. } => CmdId::NodeDetail,
            Command::CallChain { .. } => CmdId::CallChain,
            Command::LlCallChain { .. } => CmdId::LlCallChain,
            Command::AccDst { .. } => CmdId::AccDst,
            Command::MapGet => CmdId::MapGet,
            Command::MapStop => CmdId::MapStop,
            Command::PqosCmt { .. } => CmdId::PqosCmt,
            Command::PqosMbm { .. } => CmdId::PqosMbm,
            Command::Num(1) => CmdId::Num1,
            Command::Num(2) => CmdId::Num2,
            Command::Num(3) => CmdId::Num3,
            Command::Num(4) => CmdId::Num4,
            Command::Num(_) => CmdId::Num5,
            Command::Refresh => CmdId::Refresh,
            Command::Quit => CmdId::Quit,
            Command::Back => CmdId::Back,
            Command::Resize => CmdId::Resize,
        }
    }
}

/// Translate a keystroke into a command. The call-chain key is context
/// sensitive: in the latency views it means the latency call chain.
pub fn command_for_key(ch: u8, view: ViewType, cmt_enabled: bool) -> Option<Command> {
    match ch.to_ascii_lowercase() {
        b'h' => Some(Command::Home),
        b'r' => Some(Command::Refresh),
        b'q' => Some(Command::Quit),
        b'b' => Some(Command::Back),
        b'i' => Some(Command::IrNormalize),
        b'n' => Some(Command::NodeOverview),
        b'l' => Some(Command::Lat { pid: 0, tid: 0 }),
        b'd' => Some(Command::AccDst { pid: 0, tid: 0 }),
        b'm' => Some(Command::MapGet),
        b's' => Some(Command::MapStop),
        b'c' => match view {
            ViewType::MoniProc | ViewType::MoniLwp => {
                Some(Command::CallChain { pid: 0, tid: 0 })
            }
            ViewType::LatProc | ViewType::LatLwp => Some(Command::LlCallChain {
                pid: 0,
                tid: 0,
                addr: 0,
                size: 0,
                desc: String::new(),
            }),
            _ => None,
        },
        b'o' if cmt_enabled => Some(Command::PqosCmt {
            pid: 0,
            tid: 0,
            flags: PQOS_FLAG_LLC,
        }),
        b'p' if cmt_enabled => Some(Command::PqosMbm {
            pid: 0,
            tid: 0,
            flags: PQOS_FLAG_TOTAL_BW | PQOS_FLAG_LOCAL_BW,
        }),
        b'1'..=b'5' => Some(Command::Num(ch - b'0')),
        _ => None,
    }
}

pub type PreOp = fn(&mut DisplayCtx, &mut Command, &mut bool) -> Result<()>;
pub type Op = fn(&mut DisplayCtx, &Command, bool) -> Result<()>;

#[derive(Clone, Copy, Default)]
pub struct Cell {
    pub preop: Option<PreOp>,
    pub op: Option<Op>,
}

/// The (view type × command) dispatch matrix. An empty cell means the
/// command does not apply in that view.
pub struct DispatchTable {
    cells: Vec<Cell>,
}

impl DispatchTable {
    fn set(&mut self, view: ViewType, cmd: CmdId, preop: Option<PreOp>, op: Option<Op>) {
        self.cells[view as usize * CMD_NUM + cmd as usize] = Cell { preop, op };
    }

    pub fn cell(&self, view: ViewType, cmd: CmdId) -> Cell {
        self.cells[view as usize * CMD_NUM + cmd as usize]
    }
}

// ---- operations ------------------------------------------------------

pub fn op_page_next(ctx: &mut DisplayCtx, cmd: &Command, smpl: bool) -> Result<()> {
    ctx.pages.create(cmd.clone());
    display::page_next_execute(ctx, smpl);
    Ok(())
}

fn op_page_prev(ctx: &mut DisplayCtx, _cmd: &Command, smpl: bool) -> Result<()> {
    if ctx.pages.back().is_some() {
        display::page_next_execute(ctx, smpl);
    }
    Ok(())
}

pub fn op_refresh(ctx: &mut DisplayCtx, _cmd: &Command, _smpl: bool) -> Result<()> {
    let Some(cur) = ctx.pages.current_index() else {
        return Ok(());
    };

    ctx.pages.set_next_run(cur);
    display::page_next_execute(ctx, true);
    Ok(())
}

fn op_home(ctx: &mut DisplayCtx, cmd: &Command, smpl: bool) -> Result<()> {
    ctx.pages.clear();
    op_page_next(ctx, cmd, smpl)
}

fn op_sort(ctx: &mut DisplayCtx, cmd: &Command, _smpl: bool) -> Result<()> {
    let Command::Num(n) = cmd else { return Ok(()) };
    let scope = match ctx.current_view_type() {
        ViewType::Home => SortScope::Raw,
        _ => SortScope::Normalized,
    };

    if let Some(key) = sort_key_for(scope, *n) {
        ctx.sortkey = key;
        op_refresh(ctx, cmd, false)?;
    }

    Ok(())
}

fn sort_key_for(scope: SortScope, n: u8) -> Option<SortKey> {
    let raw = [SortKey::Rma, SortKey::Lma, SortKey::Rl, SortKey::Cpi, SortKey::Cpu];
    let normalized = [SortKey::Rpi, SortKey::Lpi, SortKey::Rl, SortKey::Cpi, SortKey::Cpu];

    let arr = match scope {
        SortScope::Raw => raw,
        SortScope::Normalized => normalized,
    };
    arr.get(n.checked_sub(1)? as usize).copied()
}

fn op_switch2ll(ctx: &mut DisplayCtx, _cmd: &Command, smpl: bool) -> Result<()> {
    let Some((pid, tid)) = ctx.pages.current().and_then(|p| p.view.monitor_target()) else {
        return Err(Error::SamplingFailed);
    };

    op_page_next(ctx, &Command::Lat { pid, tid }, smpl)
}

fn op_switch2llcallchain(ctx: &mut DisplayCtx, _cmd: &Command, smpl: bool) -> Result<()> {
    let page = ctx.pages.current();
    let Some((pid, tid)) = page.and_then(|p| p.view.lat_target()) else {
        return Ok(());
    };
    let Some((addr, size, desc)) = page.and_then(|p| p.view.lat_selected()) else {
        return Ok(());
    };

    op_page_next(
        ctx,
        &Command::LlCallChain {
            pid,
            tid,
            addr,
            size,
            desc,
        },
        smpl,
    )
}

fn op_switch2latnode(ctx: &mut DisplayCtx, _cmd: &Command, smpl: bool) -> Result<()> {
    let page = ctx.pages.current();
    let Some((pid, tid)) = page.and_then(|p| p.view.lat_target()) else {
        return Ok(());
    };
    let Some((addr, size, _)) = page.and_then(|p| p.view.lat_selected()) else {
        return Ok(());
    };

    op_page_next(ctx, &Command::LatNode { pid, tid, addr, size }, smpl)
}

/// Resolve the NUMA residency of every mapping of the monitored process,
/// so the latency rows can show where each buffer's pages live.
fn op_map_get(ctx: &mut DisplayCtx, cmd: &Command, _smpl: bool) -> Result<()> {
    if let Some((pid, _)) = ctx.pages.current().and_then(|p| p.view.lat_target()) {
        if let Some(proc) = ctx.registry.find(pid) {
            let page_size = crate::util::page_size() as u64;
            let mut inner = proc.inner.lock();
            for entry in inner.maps.iter_mut() {
                if let Err(err) = maps::map_to_numa(pid, entry, page_size, &maps::MovePages) {
                    log::debug!("numa map for {pid} {:#x} failed: {err}", entry.start);
                }
            }
        }
    }

    op_refresh(ctx, cmd, false)
}

fn op_map_stop(ctx: &mut DisplayCtx, cmd: &Command, _smpl: bool) -> Result<()> {
    if let Some((pid, _)) = ctx.pages.current().and_then(|p| p.view.lat_target()) {
        if let Some(proc) = ctx.registry.find(pid) {
            let mut inner = proc.inner.lock();
            for entry in inner.maps.iter_mut() {
                entry.numa.clear();
            }
        }
    }

    op_refresh(ctx, cmd, false)
}

fn op_callchain_count(ctx: &mut DisplayCtx, cmd: &Command, _smpl: bool) -> Result<()> {
    let Command::Num(n) = cmd else { return Ok(()) };
    let counters = [UiCountId::Rma, UiCountId::Lma, UiCountId::Clk, UiCountId::Ir];
    let Some(ui) = counters.get((*n as usize).wrapping_sub(1)).copied() else {
        return Ok(());
    };

    if let Some(cur) = ctx.pages.current_index() {
        if let Some(page) = ctx.pages.page_mut(cur) {
            page.view.set_callchain_counter(ui);
        }
    }

    ctx.sampler.profiling_partpause(ui.counters()[0])?;
    op_refresh(ctx, cmd, false)
}

// ---- pre-hooks -------------------------------------------------------

fn preop_switch2profiling(ctx: &mut DisplayCtx, _cmd: &mut Command, smpl: &mut bool) -> Result<()> {
    *smpl = false;

    if ctx.sampler.pqos_started() {
        ctx.sampler.pqos_stop(0, 0)?;
        *smpl = true;
    }

    if ctx.sampler.uncore_started() {
        ctx.sampler.uncore_stop(-1)?;
        *smpl = true;
    }

    if !ctx.sampler.profiling_started() {
        let _ = ctx.sampler.allstop();
        ctx.sampler.profiling_start()?;
        *smpl = true;
    }

    Ok(())
}

fn preop_switch2ll(ctx: &mut DisplayCtx, _cmd: &mut Command, smpl: &mut bool) -> Result<()> {
    *smpl = false;
    if !ctx.sampler.ll_started() {
        let _ = ctx.sampler.allstop();
        ctx.sampler.ll_start()?;
        *smpl = true;
    }

    Ok(())
}

fn preop_switch2callchain(ctx: &mut DisplayCtx, cmd: &mut Command, smpl: &mut bool) -> Result<()> {
    let Some((pid, tid)) = ctx.pages.current().and_then(|p| p.view.monitor_target()) else {
        return Err(Error::SamplingFailed);
    };

    if let Command::CallChain { pid: p, tid: t } = cmd {
        *p = pid;
        *t = tid;
    }

    *smpl = true;
    ctx.sampler
        .profiling_partpause(UiCountId::Rma.counters()[0])
}

fn preop_leavecallchain(ctx: &mut DisplayCtx, _cmd: &mut Command, smpl: &mut bool) -> Result<()> {
    let ui = ctx
        .pages
        .current()
        .and_then(|p| p.view.callchain_counter())
        .unwrap_or(UiCountId::Rma);

    ctx.sampler.profiling_restore(ui.counters()[0])?;
    *smpl = true;
    Ok(())
}

fn preop_switch2accdst(ctx: &mut DisplayCtx, cmd: &mut Command, _smpl: &mut bool) -> Result<()> {
    let Some((pid, tid)) = ctx.pages.current().and_then(|p| p.view.lat_target()) else {
        return Err(Error::SamplingFailed);
    };

    if let Command::AccDst { pid: p, tid: t } = cmd {
        *p = pid;
        *t = tid;
    }

    Ok(())
}

/// One profiling cycle through the secondary flag, so the reconfiguring
/// pre-hook hands fresh data to whatever renders next.
fn sync_sample(ctx: &mut DisplayCtx) -> Result<()> {
    ctx.sampler.profiling_smpl(false)?;
    match ctx.disp.flag2_wait()? {
        DispFlag::ProfilingDataReady => Ok(()),
        _ => Err(Error::SamplingFailed),
    }
}

fn preop_switch2pqoscmt(ctx: &mut DisplayCtx, cmd: &mut Command, _smpl: &mut bool) -> Result<()> {
    if !ctx.cmt_enabled {
        return Err(Error::ResctrlUnavailable);
    }

    let view = ctx.current_view_type();
    let target = match view {
        ViewType::Home | ViewType::TopnProc => Some((0, 0)),
        ViewType::MoniProc | ViewType::MoniLwp => {
            ctx.pages.current().and_then(|p| p.view.monitor_target())
        }
        ViewType::PqosMbmMoniProc | ViewType::PqosMbmMoniLwp => {
            ctx.pages.current().and_then(|p| p.view.pqos_target())
        }
        _ => None,
    };
    let Some((pid, tid)) = target else {
        return Err(Error::SamplingFailed);
    };

    if let Command::PqosCmt { pid: p, tid: t, .. } = cmd {
        *p = pid;
        *t = tid;
    }

    ctx.sampler.pqos_stop(pid, tid)?;
    sync_sample(ctx)?;
    ctx.sampler.pqos_start(pid, tid, PQOS_FLAG_LLC)
}

fn preop_switch2pqosmbm(ctx: &mut DisplayCtx, cmd: &mut Command, _smpl: &mut bool) -> Result<()> {
    let view = ctx.current_view_type();
    if !matches!(view, ViewType::PqosCmtMoniProc | ViewType::PqosCmtMoniLwp) {
        return Ok(());
    }

    sync_sample(ctx)?;

    let Some((pid, tid)) = ctx.pages.current().and_then(|p| p.view.pqos_target()) else {
        return Err(Error::SamplingFailed);
    };

    if let Command::PqosMbm { pid: p, tid: t, .. } = cmd {
        *p = pid;
        *t = tid;
    }

    ctx.sampler.pqos_stop(pid, tid)?;
    ctx.sampler
        .pqos_start(pid, tid, PQOS_FLAG_TOTAL_BW | PQOS_FLAG_LOCAL_BW)
}

fn preop_switch2uncore(ctx: &mut DisplayCtx, cmd: &mut Command, _smpl: &mut bool) -> Result<()> {
    if ctx.current_view_type() != ViewType::NodeOverview {
        return Ok(());
    }

    sync_sample(ctx)?;

    let Command::NodeDetail { nid } = cmd else {
        return Ok(());
    };
    ctx.sampler.uncore_stop(-1)?;
    ctx.sampler.uncore_start(*nid)
}

/// Build the dispatch matrix the way the original wires it: common rows
/// first, then per-view overrides.
pub fn dispatch_table() -> DispatchTable {
    let mut table = DispatchTable {
        cells: vec![Cell::default(); VIEW_TYPE_NUM * CMD_NUM],
    };

    for view in ViewType::ALL {
        table.set(view, CmdId::Resize, None, Some(op_refresh));
        table.set(view, CmdId::Refresh, None, Some(op_refresh));
        table.set(view, CmdId::Back, None, Some(op_page_prev));
        table.set(view, CmdId::Home, Some(preop_switch2profiling), Some(op_home));
        table.set(
            view,
            CmdId::NodeOverview,
            Some(preop_switch2profiling),
            Some(op_page_next),
        );
    }

    // Home (raw numbers): back is a no-op, numbers sort.
    table.set(ViewType::Home, CmdId::Back, None, None);
    table.set(ViewType::Home, CmdId::Monitor, None, Some(op_page_next));
    table.set(ViewType::Home, CmdId::IrNormalize, None, Some(op_page_next));
    for num in [CmdId::Num1, CmdId::Num2, CmdId::Num3, CmdId::Num4, CmdId::Num5] {
        table.set(ViewType::Home, num, None, Some(op_sort));
        table.set(ViewType::TopnProc, num, None, Some(op_sort));
    }
    table.set(ViewType::Home, CmdId::PqosCmt, Some(preop_switch2pqoscmt), Some(op_page_next));

    table.set(ViewType::TopnProc, CmdId::Monitor, None, Some(op_page_next));
    table.set(
        ViewType::TopnProc,
        CmdId::PqosCmt,
        Some(preop_switch2pqoscmt),
        Some(op_page_next),
    );

    // Per-process monitor.
    table.set(ViewType::MoniProc, CmdId::Lat, Some(preop_switch2ll), Some(op_switch2ll));
    table.set(ViewType::MoniProc, CmdId::Lwp, None, Some(op_page_next));
    table.set(
        ViewType::MoniProc,
        CmdId::CallChain,
        Some(preop_switch2callchain),
        Some(op_page_next),
    );
    table.set(
        ViewType::MoniProc,
        CmdId::PqosCmt,
        Some(preop_switch2pqoscmt),
        Some(op_page_next),
    );

    table.set(ViewType::TopnLwp, CmdId::Monitor, None, Some(op_page_next));

    table.set(ViewType::MoniLwp, CmdId::Lat, Some(preop_switch2ll), Some(op_switch2ll));
    table.set(
        ViewType::MoniLwp,
        CmdId::CallChain,
        Some(preop_switch2callchain),
        Some(op_page_next),
    );
    table.set(
        ViewType::MoniLwp,
        CmdId::PqosCmt,
        Some(preop_switch2pqoscmt),
        Some(op_page_next),
    );

    // Latency views.
    for view in [ViewType::LatProc, ViewType::LatLwp] {
        table.set(view, CmdId::Back, Some(preop_switch2profiling), Some(op_page_prev));
        table.set(view, CmdId::LlCallChain, None, Some(op_switch2llcallchain));
        table.set(view, CmdId::LatNode, None, Some(op_switch2latnode));
        table.set(view, CmdId::AccDst, Some(preop_switch2accdst), Some(op_page_next));
        table.set(view, CmdId::MapGet, None, Some(op_map_get));
        table.set(view, CmdId::MapStop, None, Some(op_map_stop));
        table.set(view, CmdId::NodeOverview, None, None);
    }

    for view in [ViewType::LatNodeProc, ViewType::LatNodeLwp] {
        table.set(view, CmdId::MapGet, None, Some(op_refresh));
        table.set(view, CmdId::MapStop, None, Some(op_refresh));
        table.set(view, CmdId::NodeOverview, None, None);
    }

    for view in [ViewType::AccdstProc, ViewType::AccdstLwp] {
        table.set(view, CmdId::NodeOverview, None, None);
    }

    // Node overview / detail.
    table.set(ViewType::NodeOverview, CmdId::NodeOverview, None, None);
    table.set(
        ViewType::NodeOverview,
        CmdId::NodeDetail,
        Some(preop_switch2uncore),
        Some(op_page_next),
    );
    table.set(
        ViewType::NodeDetail,
        CmdId::Back,
        Some(preop_switch2profiling),
        Some(op_page_prev),
    );

    // Call-chain views: the number keys pick the counter instead of a
    // sort order.
    table.set(
        ViewType::CallChain,
        CmdId::Back,
        Some(preop_leavecallchain),
        Some(op_page_prev),
    );
    table.set(
        ViewType::CallChain,
        CmdId::Home,
        Some(preop_leavecallchain),
        Some(op_home),
    );
    table.set(ViewType::CallChain, CmdId::NodeOverview, None, None);
    for num in [CmdId::Num1, CmdId::Num2, CmdId::Num3, CmdId::Num4] {
        table.set(ViewType::CallChain, num, None, Some(op_callchain_count));
    }

    table.set(ViewType::LlCallChain, CmdId::NodeOverview, None, None);

    // PQoS views.
    for view in [
        ViewType::PqosCmtTopn,
        ViewType::PqosCmtMoniProc,
        ViewType::PqosCmtMoniLwp,
    ] {
        table.set(view, CmdId::Back, Some(preop_switch2profiling), Some(op_page_prev));
    }
    for view in [ViewType::PqosCmtMoniProc, ViewType::PqosCmtMoniLwp] {
        table.set(view, CmdId::PqosMbm, Some(preop_switch2pqosmbm), Some(op_page_next));
    }
    for view in [ViewType::PqosMbmMoniProc, ViewType::PqosMbmMoniLwp] {
        table.set(view, CmdId::Back, Some(preop_switch2pqoscmt), Some(op_page_prev));
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_cell_is_always_wired() {
        let table = dispatch_table();
        for view in ViewType::ALL {
            let cell = table.cell(view, CmdId::Refresh);
            assert!(cell.op.is_some(), "REFRESH missing for {view:?}");
            // Refreshing twice goes through the same operation: the cell
            // itself carries no state.
            assert_eq!(
                cell.op.map(|f| f as usize),
                table.cell(view, CmdId::Refresh).op.map(|f| f as usize)
            );
        }
    }

    #[test]
    fn back_on_root_view_is_noop() {
        let table = dispatch_table();
        let cell = table.cell(ViewType::Home, CmdId::Back);
        assert!(cell.op.is_none());
        assert!(cell.preop.is_none());

        let cell = table.cell(ViewType::MoniProc, CmdId::Back);
        assert!(cell.op.is_some());
    }

    #[test]
    fn callchain_numbers_select_counter_not_sort() {
        let table = dispatch_table();
        let chain = table.cell(ViewType::CallChain, CmdId::Num1).op.unwrap();
        let home = table.cell(ViewType::Home, CmdId::Num1).op.unwrap();
        assert_ne!(chain as usize, home as usize);
        // Key 5 does nothing in the chain view.
        assert!(table.cell(ViewType::CallChain, CmdId::Num5).op.is_none());
    }

    #[test]
    fn key_translation_disambiguates_callchain() {
        assert_eq!(
            command_for_key(b'c', ViewType::MoniProc, false),
            Some(Command::CallChain { pid: 0, tid: 0 })
        );
        assert!(matches!(
            command_for_key(b'c', ViewType::LatProc, false),
            Some(Command::LlCallChain { .. })
        ));
        assert_eq!(command_for_key(b'c', ViewType::Home, false), None);
        assert_eq!(command_for_key(b'o', ViewType::Home, false), None);
        assert!(command_for_key(b'o', ViewType::Home, true).is_some());
        assert_eq!(command_for_key(b'3', ViewType::Home, false), Some(Command::Num(3)));
    }

    #[test]
    fn sort_keys_differ_between_scopes() {
        assert_eq!(sort_key_for(SortScope::Raw, 1), Some(SortKey::Rma));
        assert_eq!(sort_key_for(SortScope::Normalized, 1), Some(SortKey::Rpi));
        assert_eq!(sort_key_for(SortScope::Raw, 5), Some(SortKey::Cpu));
        assert_eq!(sort_key_for(SortScope::Raw, 6), None);
        assert_eq!(sort_key_for(SortScope::Raw, 0), None);
    }
}
