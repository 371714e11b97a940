use std::sync::Arc;

use super::command::Command;
use super::display::DisplayCtx;
use super::term::RowModel;
use crate::perf::UiCountId;
use crate::proc::process::ProcInner;
use crate::proc::thread::Thread;
use crate::symbols::maps::{self, MovePages};
use crate::symbols::ChainList;
use crate::util::{cpu_percent, ratio};

/// Thread lookup against an already-held process guard; `thread_find`
/// would take the same lock again.
fn thread_of(inner: &ProcInner, tid: i32) -> Option<Arc<Thread>> {
    let idx = inner.threads.binary_search_by_key(&tid, |t| t.tid).ok()?;
    Some(inner.threads[idx].clone())
}

pub const VIEW_TYPE_NUM: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ViewType {
    Home = 0,
    TopnProc,
    MoniProc,
    TopnLwp,
    MoniLwp,
    LatProc,
    LatLwp,
    LatNodeProc,
    LatNodeLwp,
    AccdstProc,
    AccdstLwp,
    NodeOverview,
    NodeDetail,
    CallChain,
    LlCallChain,
    PqosCmtTopn,
    PqosCmtMoniProc,
    PqosCmtMoniLwp,
    PqosMbmMoniProc,
    PqosMbmMoniLwp,
}

impl ViewType {
    pub const ALL: [ViewType; VIEW_TYPE_NUM] = [
        ViewType::Home,
        ViewType::TopnProc,
        ViewType::MoniProc,
        ViewType::TopnLwp,
        ViewType::MoniLwp,
        ViewType::LatProc,
        ViewType::LatLwp,
        ViewType::LatNodeProc,
        ViewType::LatNodeLwp,
        ViewType::AccdstProc,
        ViewType::AccdstLwp,
        ViewType::NodeOverview,
        ViewType::NodeDetail,
        ViewType::CallChain,
        ViewType::LlCallChain,
        ViewType::PqosCmtTopn,
        ViewType::PqosCmtMoniProc,
        ViewType::PqosCmtMoniLwp,
        ViewType::PqosMbmMoniProc,
        ViewType::PqosMbmMoniLwp,
    ];
}

/// Which family of sort keys the number hotkeys select in a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortScope {
    Raw,
    Normalized,
}

/// One row of a latency view, kept so hotkeys can act on the highlighted
/// buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatLine {
    pub addr: u64,
    pub size: u64,
    pub desc: String,
    pub naccess: u64,
    pub total_lat: u64,
    pub nodes: Vec<i32>,
}

/// Row identities cached from the last draw, so scrolling and ENTER can
/// name what they point at.
#[derive(Clone, Debug, Default)]
enum RowsMeta {
    #[default]
    None,
    Pids(Vec<i32>),
    Threads(Vec<(i32, i32)>),
    Nodes(Vec<i32>),
    LatLines(Vec<LatLine>),
}

/// Mutable per-page view state: scroll position, the target the page
/// monitors, and whatever the last draw put on screen.
pub struct ViewState {
    vtype: ViewType,
    target: (i32, i32),
    chain_counter: UiCountId,
    scroll: usize,
    nrows: usize,
    rows: RowsMeta,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState::empty(ViewType::Home)
    }
}

impl ViewState {
    fn empty(vtype: ViewType) -> ViewState {
        ViewState {
            vtype,
            target: (0, 0),
            chain_counter: UiCountId::Rma,
            scroll: 0,
            nrows: 0,
            rows: RowsMeta::None,
        }
    }

    pub fn for_command(cmd: &Command) -> ViewState {
        let (vtype, target) = match cmd {
            Command::Home => (ViewType::Home, (0, 0)),
            Command::IrNormalize => (ViewType::TopnProc, (0, 0)),
            Command::Monitor { pid, tid } if *tid == 0 => (ViewType::MoniProc, (*pid, 0)),
            Command::Monitor { pid, tid } => (ViewType::MoniLwp, (*pid, *tid)),
            Command::Lwp { pid } => (ViewType::TopnLwp, (*pid, 0)),
            Command::Lat { pid, tid } if *tid == 0 => (ViewType::LatProc, (*pid, 0)),
            Command::Lat { pid, tid } => (ViewType::LatLwp, (*pid, *tid)),
            Command::LatNode { pid, tid, .. } if *tid == 0 => (ViewType::LatNodeProc, (*pid, 0)),
            Command::LatNode { pid, tid, .. } => (ViewType::LatNodeLwp, (*pid, *tid)),
            Command::AccDst { pid, tid } if *tid == 0 => (ViewType::AccdstProc, (*pid, 0)),
            Command::AccDst { pid, tid } => (ViewType::AccdstLwp, (*pid, *tid)),
            Command::NodeOverview => (ViewType::NodeOverview, (0, 0)),
            Command::NodeDetail { .. } => (ViewType::NodeDetail, (0, 0)),
            Command::CallChain { pid, tid } => (ViewType::CallChain, (*pid, *tid)),
            Command::LlCallChain { pid, tid, .. } => (ViewType::LlCallChain, (*pid, *tid)),
            Command::PqosCmt { pid, tid, .. } if *pid == 0 => (ViewType::PqosCmtTopn, (0, 0)),
            Command::PqosCmt { pid, tid, .. } if *tid == 0 => {
                (ViewType::PqosCmtMoniProc, (*pid, 0))
            }
            Command::PqosCmt { pid, tid, .. } => (ViewType::PqosCmtMoniLwp, (*pid, *tid)),
            Command::PqosMbm { pid, tid, .. } if *tid == 0 => {
                (ViewType::PqosMbmMoniProc, (*pid, 0))
            }
            Command::PqosMbm { pid, tid, .. } => (ViewType::PqosMbmMoniLwp, (*pid, *tid)),
            _ => (ViewType::Home, (0, 0)),
        };

        ViewState::empty(vtype).with_target(target)
    }

    fn with_target(mut self, target: (i32, i32)) -> ViewState {
        self.target = target;
        self
    }

    pub fn view_type(&self) -> ViewType {
        self.vtype
    }

    pub fn monitor_target(&self) -> Option<(i32, i32)> {
        match self.vtype {
            ViewType::MoniProc | ViewType::MoniLwp => Some(self.target),
            _ => None,
        }
    }

    pub fn lat_target(&self) -> Option<(i32, i32)> {
        match self.vtype {
            ViewType::LatProc | ViewType::LatLwp => Some(self.target),
            _ => None,
        }
    }

    pub fn pqos_target(&self) -> Option<(i32, i32)> {
        match self.vtype {
            ViewType::PqosCmtTopn => Some((0, 0)),
            ViewType::PqosCmtMoniProc
            | ViewType::PqosCmtMoniLwp
            | ViewType::PqosMbmMoniProc
            | ViewType::PqosMbmMoniLwp => Some(self.target),
            _ => None,
        }
    }

    pub fn lat_selected(&self) -> Option<(u64, u64, String)> {
        let RowsMeta::LatLines(lines) = &self.rows else {
            return None;
        };
        let line = lines.get(self.scroll)?;
        Some((line.addr, line.size, line.desc.clone()))
    }

    pub fn callchain_counter(&self) -> Option<UiCountId> {
        (self.vtype == ViewType::CallChain).then_some(self.chain_counter)
    }

    pub fn set_callchain_counter(&mut self, ui: UiCountId) {
        self.chain_counter = ui;
    }

    pub fn scroll(&mut self, up: bool) {
        if up {
            self.scroll = self.scroll.saturating_sub(1);
        } else if self.scroll + 1 < self.nrows {
            self.scroll += 1;
        }
    }

    /// ENTER on the highlighted row: descend into what it names.
    pub fn scroll_enter(&self) -> Option<Command> {
        match (&self.vtype, &self.rows) {
            (ViewType::Home | ViewType::TopnProc, RowsMeta::Pids(pids)) => {
                pids.get(self.scroll).map(|pid| Command::Monitor {
                    pid: *pid,
                    tid: 0,
                })
            }
            (ViewType::MoniProc, _) => Some(Command::Lwp {
                pid: self.target.0,
            }),
            (ViewType::TopnLwp, RowsMeta::Threads(threads)) => {
                threads.get(self.scroll).map(|(pid, tid)| Command::Monitor {
                    pid: *pid,
                    tid: *tid,
                })
            }
            (ViewType::NodeOverview, RowsMeta::Nodes(nids)) => {
                nids.get(self.scroll).map(|nid| Command::NodeDetail { nid: *nid })
            }
            (ViewType::LatProc | ViewType::LatLwp, RowsMeta::LatLines(lines)) => {
                lines.get(self.scroll).map(|line| Command::LatNode {
                    pid: self.target.0,
                    tid: self.target.1,
                    addr: line.addr,
                    size: line.size,
                })
            }
            _ => None,
        }
    }

    /// Build this page's row model from the current data model. Returns
    /// None only when there is truly nothing to render.
    pub fn draw(&mut self, ctx: &mut DisplayCtx, cmd: &Command) -> Option<RowModel> {
        let mut model = match self.vtype {
            ViewType::Home => self.draw_top_procs(ctx, false),
            ViewType::TopnProc => self.draw_top_procs(ctx, true),
            ViewType::MoniProc | ViewType::MoniLwp => self.draw_monitor(ctx),
            ViewType::TopnLwp => self.draw_top_threads(ctx),
            ViewType::NodeOverview => self.draw_node_overview(ctx),
            ViewType::NodeDetail => self.draw_node_detail(ctx, cmd),
            ViewType::CallChain => self.draw_callchain(ctx),
            ViewType::LlCallChain => self.draw_llcallchain(ctx, cmd),
            ViewType::LatProc | ViewType::LatLwp => self.draw_latency(ctx),
            ViewType::LatNodeProc | ViewType::LatNodeLwp => self.draw_latnode(ctx, cmd),
            ViewType::AccdstProc | ViewType::AccdstLwp => self.draw_accdst(ctx),
            ViewType::PqosCmtTopn => self.draw_pqos_top(ctx),
            ViewType::PqosCmtMoniProc | ViewType::PqosCmtMoniLwp => self.draw_pqos_cmt(ctx),
            ViewType::PqosMbmMoniProc | ViewType::PqosMbmMoniLwp => self.draw_pqos_mbm(ctx),
        };

        self.nrows = model.rows.len();
        if self.scroll >= self.nrows {
            self.scroll = self.nrows.saturating_sub(1);
        }
        model.highlight = (self.nrows > 0).then_some(self.scroll);
        Some(model)
    }

    fn draw_top_procs(&mut self, ctx: &mut DisplayCtx, normalized: bool) -> RowModel {
        let snapshot = ctx.topo.cpu_map_snapshot();
        ctx.registry.resort(ctx.sortkey, &snapshot);

        let intval = ctx.topo.intval_ms().max(1);
        let ncpus = ctx.topo.online_cpus();
        let mut pids = Vec::new();
        let mut rows = Vec::new();
        let mut total = [0u64; 4]; // rma, lma, clk, ir

        while let Some(proc) = ctx.registry.sort_next() {
            let inner = proc.inner.lock();
            let rma = snapshot.countval_sum(&inner.countvals, None, UiCountId::Rma);
            let lma = snapshot.countval_sum(&inner.countvals, None, UiCountId::Lma);
            let clk = snapshot.countval_sum(&inner.countvals, None, UiCountId::Clk);
            let ir = snapshot.countval_sum(&inner.countvals, None, UiCountId::Ir);
            drop(inner);

            total[0] += rma;
            total[1] += lma;
            total[2] += clk;
            total[3] += ir;

            if rows.len() >= 40 {
                continue;
            }

            let row = if normalized {
                format!(
                    "{:>6}  {:<16} {:>8.2} {:>8.2} {:>8.2} {:>6.2} {:>6.1}",
                    proc.pid,
                    clip_name(&proc.name),
                    ratio(rma * 1000, ir),
                    ratio(lma * 1000, ir),
                    ratio(rma * 1000, lma.max(1)) / 1000.0,
                    ratio(clk, ir),
                    cpu_percent(clk, intval, ctx.calib.clk_of_sec, ncpus),
                )
            } else {
                format!(
                    "{:>6}  {:<16} {:>8.1} {:>8.1} {:>8.2} {:>6.2} {:>6.1}",
                    proc.pid,
                    clip_name(&proc.name),
                    rma as f64 / 1000.0,
                    lma as f64 / 1000.0,
                    ratio(rma * 1000, lma.max(1)) / 1000.0,
                    ratio(clk, ir),
                    cpu_percent(clk, intval, ctx.calib.clk_of_sec, ncpus),
                )
            };
            rows.push(row);
            pids.push(proc.pid);
        }

        let summary = vec![
            format!(
                "Monitoring {} processes and {} threads (interval: {:.1}s)",
                ctx.registry.nprocs(),
                ctx.registry.nthreads(),
                intval as f64 / 1000.0
            ),
            format!(
                "RMA(K): {:.1}  LMA(K): {:.1}  RMA/LMA: {:.2}  CPI: {:.2}",
                total[0] as f64 / 1000.0,
                total[1] as f64 / 1000.0,
                ratio(total[0], total[1].max(1)),
                ratio(total[2], total[3]),
            ),
        ];

        self.rows = RowsMeta::Pids(pids);
        RowModel {
            title: if normalized {
                "nodetop: per-instruction normalized view".into()
            } else {
                "nodetop: system overview".into()
            },
            summary,
            header: if normalized {
                format!(
                    "{:>6}  {:<16} {:>8} {:>8} {:>8} {:>6} {:>6}",
                    "PID", "PROC", "RPI", "LPI", "RMA/LMA", "CPI", "CPU%"
                )
            } else {
                format!(
                    "{:>6}  {:<16} {:>8} {:>8} {:>8} {:>6} {:>6}",
                    "PID", "PROC", "RMA(K)", "LMA(K)", "RMA/LMA", "CPI", "CPU%"
                )
            },
            rows,
            highlight: None,
            note: "h: home  q: quit  n: nodes  i: normalize  1-5: sort  ENTER: monitor".into(),
        }
    }

    fn draw_monitor(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        let snapshot = ctx.topo.cpu_map_snapshot();
        let intval = ctx.topo.intval_ms().max(1);
        let ncpus = ctx.topo.online_cpus();

        let countvals = if tid == 0 {
            proc.inner.lock().countvals.clone()
        } else {
            match proc.thread_find(tid) {
                Some(thread) => thread.inner.lock().countvals.clone(),
                None => return process_gone(tid),
            }
        };

        let mut rows = Vec::new();
        let mut nids = Vec::new();
        for (nid, _) in &snapshot.nodes {
            let rma = snapshot.countval_sum(&countvals, Some(*nid), UiCountId::Rma);
            let lma = snapshot.countval_sum(&countvals, Some(*nid), UiCountId::Lma);
            let clk = snapshot.countval_sum(&countvals, Some(*nid), UiCountId::Clk);
            let ir = snapshot.countval_sum(&countvals, Some(*nid), UiCountId::Ir);

            rows.push(format!(
                "{:>5} {:>9.1} {:>9.1} {:>6.2} {:>6.1}",
                nid,
                rma as f64 / 1000.0,
                lma as f64 / 1000.0,
                ratio(clk, ir),
                cpu_percent(clk, intval, ctx.calib.clk_of_sec, ncpus),
            ));
            nids.push(*nid);
        }

        self.rows = RowsMeta::Nodes(nids);
        let title = if tid == 0 {
            format!("Monitoring process {} ({})", pid, proc.name)
        } else {
            format!("Monitoring thread {} of process {} ({})", tid, pid, proc.name)
        };

        RowModel {
            title,
            summary: Vec::new(),
            header: format!(
                "{:>5} {:>9} {:>9} {:>6} {:>6}",
                "NODE", "RMA(K)", "LMA(K)", "CPI", "CPU%"
            ),
            rows,
            highlight: None,
            note: "l: latency  c: call chain  b: back  h: home".into(),
        }
    }

    fn draw_top_threads(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, _) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        let snapshot = ctx.topo.cpu_map_snapshot();
        let intval = ctx.topo.intval_ms().max(1);
        let ncpus = ctx.topo.online_cpus();

        let threads: Vec<_> = {
            let inner = proc.inner.lock();
            inner.threads.clone()
        };

        let mut entries: Vec<(u64, i32, String)> = threads
            .iter()
            .map(|thread| {
                let ti = thread.inner.lock();
                let clk = snapshot.countval_sum(&ti.countvals, None, UiCountId::Clk);
                let ir = snapshot.countval_sum(&ti.countvals, None, UiCountId::Ir);
                let row = format!(
                    "{:>7} {:>6.2} {:>6.1}",
                    thread.tid,
                    ratio(clk, ir),
                    cpu_percent(clk, intval, ctx.calib.clk_of_sec, ncpus),
                );
                (clk, thread.tid, row)
            })
            .collect();

        entries.sort_by_key(|(_, tid, _)| *tid);
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        self.rows = RowsMeta::Threads(entries.iter().map(|(_, tid, _)| (pid, *tid)).collect());
        RowModel {
            title: format!("Threads of process {} ({})", pid, proc.name),
            summary: Vec::new(),
            header: format!("{:>7} {:>6} {:>6}", "TID", "CPI", "CPU%"),
            rows: entries.into_iter().map(|(_, _, row)| row).collect(),
            highlight: None,
            note: "ENTER: monitor thread  b: back  h: home".into(),
        }
    }

    fn draw_node_overview(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let nodes = ctx.topo.nodes_overview();
        let intval = ctx.topo.intval_ms().max(1);

        let mut rows = Vec::new();
        let mut nids = Vec::new();
        for node in &nodes {
            let rma = UiCountId::Rma.aggregate(&node.countval);
            let lma = UiCountId::Lma.aggregate(&node.countval);
            let clk = UiCountId::Clk.aggregate(&node.countval);

            rows.push(format!(
                "{:>5} {:>5} {:>9.1} {:>9.1} {:>9.1} {:>9.1} {:>6.1}",
                node.nid,
                node.ncpus,
                node.meminfo.total as f64 / (1 << 30) as f64,
                node.meminfo.free as f64 / (1 << 30) as f64,
                rma as f64 / 1000.0,
                lma as f64 / 1000.0,
                cpu_percent(clk, intval, ctx.calib.clk_of_sec, node.ncpus.max(1)),
            ));
            nids.push(node.nid);
        }

        self.rows = RowsMeta::Nodes(nids);
        RowModel {
            title: "Node overview".into(),
            summary: Vec::new(),
            header: format!(
                "{:>5} {:>5} {:>9} {:>9} {:>9} {:>9} {:>6}",
                "NODE", "CPUS", "MEM(G)", "FREE(G)", "RMA(K)", "LMA(K)", "CPU%"
            ),
            rows,
            highlight: None,
            note: "ENTER: node detail  b: back  h: home".into(),
        }
    }

    fn draw_node_detail(&mut self, ctx: &mut DisplayCtx, cmd: &Command) -> RowModel {
        let Command::NodeDetail { nid } = cmd else {
            return RowModel::default();
        };
        let Some(detail) = ctx.topo.node_detail(*nid) else {
            return RowModel {
                title: format!("Node {nid} is gone"),
                ..RowModel::default()
            };
        };

        let intval = ctx.topo.intval_ms().max(1);
        let secs = intval as f64 / 1000.0;
        let mem = &detail.meminfo;

        let mut rows = vec![
            format!("CPUs: {:?}", detail.cpus),
            format!(
                "Mem total: {:.1}G  free: {:.1}G  active: {:.1}G  inactive: {:.1}G",
                mem.total as f64 / (1 << 30) as f64,
                mem.free as f64 / (1 << 30) as f64,
                mem.active as f64 / (1 << 30) as f64,
                mem.inactive as f64 / (1 << 30) as f64,
            ),
            format!(
                "Dirty: {:.1}M  writeback: {:.1}M  mapped: {:.1}M",
                mem.dirty as f64 / (1 << 20) as f64,
                mem.writeback as f64 / (1 << 20) as f64,
                mem.mapped as f64 / (1 << 20) as f64,
            ),
        ];

        // Interconnect flits and CAS counts become bytes per second.
        for (id, value) in &detail.qpi_bw {
            rows.push(format!(
                "QPI/UPI link {id}: {:>9.1} MB/s",
                *value as f64 * 8.0 / secs / 1e6
            ));
        }
        for (id, value) in &detail.imc_bw {
            rows.push(format!(
                "IMC channel {id}: {:>9.1} MB/s",
                *value as f64 * 64.0 / secs / 1e6
            ));
        }

        self.rows = RowsMeta::None;
        RowModel {
            title: format!("Node {} detail", detail.nid),
            summary: Vec::new(),
            header: String::new(),
            rows,
            highlight: None,
            note: "b: back  h: home".into(),
        }
    }

    fn draw_callchain(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        if let Err(err) = proc.sym_load() {
            log::debug!("symbol load for {pid} failed: {err}");
        }

        let counter = self.chain_counter.counters()[0];
        let inner = proc.inner.lock();
        let records = if tid == 0 {
            inner.chains[counter.index()].clone()
        } else {
            match thread_of(&inner, tid) {
                Some(thread) => thread.inner.lock().chains[counter.index()].clone(),
                None => Vec::new(),
            }
        };

        let mut list = ChainList::default();
        for record in &records {
            list.add(&inner.syms, &record.ips);
        }
        drop(inner);
        list.resort();

        let mut rows = Vec::new();
        for chain in list.iter() {
            rows.push(format!("{} sample(s):", chain.naccess));
            for entry in &chain.entries {
                rows.push(format!("  {}", entry.name));
            }
        }

        self.rows = RowsMeta::None;
        RowModel {
            title: format!(
                "Call chains of {} ({:?} overflows)",
                pid, self.chain_counter
            ),
            summary: Vec::new(),
            header: String::new(),
            rows,
            highlight: None,
            note: "1: RMA  2: LMA  3: CLK  4: IR  b: back".into(),
        }
    }

    fn draw_llcallchain(&mut self, ctx: &mut DisplayCtx, cmd: &Command) -> RowModel {
        let Command::LlCallChain {
            pid,
            tid,
            addr,
            size,
            desc,
        } = cmd
        else {
            return RowModel::default();
        };

        let Some(proc) = ctx.registry.find(*pid) else {
            return process_gone(*pid);
        };

        if let Err(err) = proc.sym_load() {
            log::debug!("symbol load for {pid} failed: {err}");
        }

        let inner = proc.inner.lock();
        let recs: Vec<_> = if *tid == 0 {
            inner
                .llrecs
                .iter()
                .filter(|r| r.addr >= *addr && r.addr < addr + size)
                .cloned()
                .collect()
        } else {
            match thread_of(&inner, *tid) {
                Some(thread) => thread
                    .inner
                    .lock()
                    .llrecs
                    .iter()
                    .filter(|r| r.addr >= *addr && r.addr < addr + size)
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut list = ChainList::default();
        for rec in &recs {
            list.add(&inner.syms, &rec.ips);
        }
        drop(inner);
        list.resort();

        let mut rows = Vec::new();
        for chain in list.iter() {
            rows.push(format!("{} access(es):", chain.naccess));
            for entry in &chain.entries {
                rows.push(format!("  {}", entry.name));
            }
        }

        self.rows = RowsMeta::None;
        RowModel {
            title: format!("Latency call chains for {desc} ({:#x})", addr),
            summary: Vec::new(),
            header: String::new(),
            rows,
            highlight: None,
            note: "b: back  h: home".into(),
        }
    }

    fn draw_latency(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        if let Err(err) = proc.sym_load() {
            log::debug!("map load for {pid} failed: {err}");
        }

        let inner = proc.inner.lock();
        let recs: Vec<_> = if tid == 0 {
            inner.llrecs.clone()
        } else {
            match thread_of(&inner, tid) {
                Some(thread) => thread.inner.lock().llrecs.clone(),
                None => Vec::new(),
            }
        };

        // Roll samples up per containing mapping.
        let mut lines: Vec<LatLine> = Vec::new();
        for rec in &recs {
            let Some(entry) = maps::find_containing(&inner.maps, rec.addr) else {
                continue;
            };

            match lines.iter_mut().find(|l| l.addr == entry.start) {
                Some(line) => {
                    line.naccess += 1;
                    line.total_lat += rec.latency;
                }
                None => {
                    let mut nodes: Vec<i32> = entry.numa.iter().map(|r| r.nid).collect();
                    nodes.sort_unstable();
                    nodes.dedup();
                    lines.push(LatLine {
                        addr: entry.start,
                        size: entry.len(),
                        desc: if entry.path.is_empty() {
                            "[anon]".into()
                        } else {
                            entry.path.clone()
                        },
                        naccess: 1,
                        total_lat: rec.latency,
                        nodes,
                    });
                }
            }
        }
        drop(inner);

        lines.sort_by(|a, b| b.naccess.cmp(&a.naccess));

        let total_access: u64 = lines.iter().map(|l| l.naccess).sum();
        let rows: Vec<String> = lines
            .iter()
            .map(|line| {
                // Node spans show up once 'm' resolved the residency.
                let span = if line.nodes.is_empty() {
                    String::new()
                } else {
                    format!(" nodes {:?}", line.nodes)
                };
                format!(
                    "{:>#14x} {:>9.1} {:>8.1} {:>9} {}{}",
                    line.addr,
                    line.size as f64 / 1024.0,
                    ratio(line.naccess * 100, total_access.max(1)),
                    ctx.calib.cycles_to_ns(ratio(line.total_lat, line.naccess) as u64),
                    line.desc,
                    span,
                )
            })
            .collect();

        self.rows = RowsMeta::LatLines(lines);
        RowModel {
            title: if tid == 0 {
                format!("Memory access latency of process {pid}")
            } else {
                format!("Memory access latency of thread {tid} ({pid})")
            },
            summary: Vec::new(),
            header: format!(
                "{:>14} {:>9} {:>8} {:>9} {}",
                "ADDR", "SIZE(K)", "ACCESS%", "LAT(ns)", "DESC"
            ),
            rows,
            highlight: None,
            note: "c: call chain  d: access destination  b: back".into(),
        }
    }

    fn draw_latnode(&mut self, ctx: &mut DisplayCtx, cmd: &Command) -> RowModel {
        let Command::LatNode {
            pid, addr, size, ..
        } = cmd
        else {
            return RowModel::default();
        };

        let Some(proc) = ctx.registry.find(*pid) else {
            return process_gone(*pid);
        };

        let recs: Vec<(u64, u64)> = {
            let inner = proc.inner.lock();
            inner
                .llrecs
                .iter()
                .filter(|r| r.addr >= *addr && r.addr < addr + size)
                .map(|r| (r.addr, r.latency))
                .collect()
        };

        self.node_latency_rows(ctx, *pid, &recs, format!("Buffer {addr:#x} by node"))
    }

    fn draw_accdst(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        let recs: Vec<(u64, u64)> = {
            let inner = proc.inner.lock();
            let source: Vec<_> = if tid == 0 {
                inner.llrecs.clone()
            } else {
                match thread_of(&inner, tid) {
                    Some(thread) => thread.inner.lock().llrecs.clone(),
                    None => Vec::new(),
                }
            };
            source.iter().map(|r| (r.addr, r.latency)).collect()
        };

        self.node_latency_rows(ctx, pid, &recs, format!("Access destinations of {pid}"))
    }

    /// Shared tail of the residency-based views: ask the kernel where
    /// each sampled page lives and roll access counts up per node.
    fn node_latency_rows(
        &mut self,
        ctx: &mut DisplayCtx,
        pid: i32,
        recs: &[(u64, u64)],
        title: String,
    ) -> RowModel {
        let addrs: Vec<u64> = recs.iter().map(|(a, _)| *a).collect();
        let lats: Vec<u64> = recs.iter().map(|(_, l)| *l).collect();

        let nnodes = ctx.topo.nnodes_max();
        let page_size = crate::util::page_size() as u64;
        let result = maps::addr_to_nodedst(pid, &addrs, &lats, nnodes, page_size, &MovePages);

        let mut rows = Vec::new();
        let mut nids = Vec::new();
        match result {
            Ok((dst, total)) => {
                for (nid, node) in dst.iter().enumerate() {
                    if node.naccess == 0 {
                        continue;
                    }

                    rows.push(format!(
                        "{:>5} {:>8.1} {:>9}",
                        nid,
                        ratio(node.naccess * 100, total.max(1)),
                        ctx.calib
                            .cycles_to_ns(ratio(node.total_lat, node.naccess) as u64),
                    ));
                    nids.push(nid as i32);
                }
            }
            Err(err) => {
                log::debug!("move_pages failed for {pid}: {err}");
            }
        }

        self.rows = RowsMeta::Nodes(nids);
        RowModel {
            title,
            summary: Vec::new(),
            header: format!("{:>5} {:>8} {:>9}", "NODE", "ACCESS%", "LAT(ns)"),
            rows,
            highlight: None,
            note: "b: back  h: home".into(),
        }
    }

    fn draw_pqos_top(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let mut rows = Vec::new();
        let mut pids = Vec::new();

        ctx.registry.for_each(|proc| {
            let inner = proc.inner.lock();
            if let Some(pqos) = &inner.pqos {
                rows.push(format!(
                    "{:>6}  {:<16} {:>12.1}",
                    proc.pid,
                    clip_name(&proc.name),
                    pqos.occupancy as f64 / 1024.0
                ));
                pids.push(proc.pid);
            }
        });

        self.rows = RowsMeta::Pids(pids);
        RowModel {
            title: "LLC occupancy by process".into(),
            summary: Vec::new(),
            header: format!("{:>6}  {:<16} {:>12}", "PID", "PROC", "LLC(K)"),
            rows,
            highlight: None,
            note: "b: back  h: home".into(),
        }
    }

    fn draw_pqos_cmt(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        let occupancy = if tid == 0 {
            proc.inner.lock().pqos.map(|p| p.occupancy)
        } else {
            proc.thread_find(tid)
                .and_then(|t| t.inner.lock().pqos.map(|p| p.occupancy))
        };

        let rows = vec![format!(
            "{:>6} {:>7} {:>12.1}",
            pid,
            tid,
            occupancy.unwrap_or(0) as f64 / 1024.0
        )];

        self.rows = RowsMeta::None;
        RowModel {
            title: format!("LLC occupancy of {pid}/{tid}"),
            summary: Vec::new(),
            header: format!("{:>6} {:>7} {:>12}", "PID", "TID", "LLC(K)"),
            rows,
            highlight: None,
            note: "p: memory bandwidth  b: back".into(),
        }
    }

    fn draw_pqos_mbm(&mut self, ctx: &mut DisplayCtx) -> RowModel {
        let (pid, tid) = self.target;
        let Some(proc) = ctx.registry.find(pid) else {
            return process_gone(pid);
        };

        let pqos = if tid == 0 {
            proc.inner.lock().pqos
        } else {
            proc.thread_find(tid).and_then(|t| t.inner.lock().pqos)
        };

        let intval = ctx.disp.intval_ms().max(1);
        let secs = intval as f64 / 1000.0;
        let (total, local) = pqos
            .map(|p| (p.totalbw_scaled, p.localbw_scaled))
            .unwrap_or((0, 0));

        let rows = vec![format!(
            "{:>6} {:>7} {:>11.1} {:>11.1}",
            pid,
            tid,
            total as f64 / secs / 1e6,
            local as f64 / secs / 1e6,
        )];

        self.rows = RowsMeta::None;
        RowModel {
            title: format!("Memory bandwidth of {pid}/{tid}"),
            summary: Vec::new(),
            header: format!(
                "{:>6} {:>7} {:>11} {:>11}",
                "PID", "TID", "TOTAL(MB/s)", "LOCAL(MB/s)"
            ),
            rows,
            highlight: None,
            note: "b: back  h: home".into(),
        }
    }
}

fn process_gone(pid: i32) -> RowModel {
    RowModel {
        title: "Target gone".into(),
        summary: Vec::new(),
        header: String::new(),
        rows: Vec::new(),
        highlight: None,
        note: format!("Process/thread {pid} has exited; press 'h' for the home view."),
    }
}

fn clip_name(name: &str) -> &str {
    match name.char_indices().nth(16) {
        Some((idx, _)) => &name[..idx],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_state_tracks_command_targets() {
        let state = ViewState::for_command(&Command::Monitor { pid: 100, tid: 0 });
        assert_eq!(state.view_type(), ViewType::MoniProc);
        assert_eq!(state.monitor_target(), Some((100, 0)));
        assert!(state.lat_target().is_none());

        let state = ViewState::for_command(&Command::Lat { pid: 7, tid: 8 });
        assert_eq!(state.view_type(), ViewType::LatLwp);
        assert_eq!(state.lat_target(), Some((7, 8)));
    }

    #[test]
    fn scroll_clamps_to_rows() {
        let mut state = ViewState::for_command(&Command::Home);
        state.nrows = 3;
        state.scroll(false);
        state.scroll(false);
        state.scroll(false);
        assert_eq!(state.scroll, 2);
        state.scroll(true);
        assert_eq!(state.scroll, 1);
        state.scroll(true);
        state.scroll(true);
        assert_eq!(state.scroll, 0);
    }

    #[test]
    fn enter_descends_into_highlighted_row() {
        let mut state = ViewState::for_command(&Command::Home);
        state.rows = RowsMeta::Pids(vec![10, 20, 30]);
        state.nrows = 3;
        state.scroll(false);
        assert_eq!(state.scroll_enter(), Some(Command::Monitor { pid: 20, tid: 0 }));

        let mut state = ViewState::for_command(&Command::NodeOverview);
        state.rows = RowsMeta::Nodes(vec![0, 1]);
        state.nrows = 2;
        state.scroll(false);
        assert_eq!(state.scroll_enter(), Some(Command::NodeDetail { nid: 1 }));
    }

    #[test]
    fn lat_selection_names_the_buffer() {
        let mut state = ViewState::for_command(&Command::Lat { pid: 1, tid: 0 });
        state.rows = RowsMeta::LatLines(vec![LatLine {
            addr: 0x4000_0000,
            size: 0x100_0000,
            desc: "/tmp/buf".into(),
            naccess: 3,
            total_lat: 300,
            nodes: Vec::new(),
        }]);
        state.nrows = 1;

        assert_eq!(
            state.lat_selected(),
            Some((0x4000_0000, 0x100_0000, "/tmp/buf".into()))
        );
    }
}
