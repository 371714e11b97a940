use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::perf::counter::CpuSession;
use crate::perf::uncore::UncoreCounter;
use crate::perf::{CountVals, UiCountId};

pub const INVALID_NID: i32 = -1;
pub const INVALID_CPUID: i32 = -1;

const NODE_ROOT: &str = "/sys/devices/system/node";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeMeminfo {
    pub total: u64,
    pub free: u64,
    pub active: u64,
    pub inactive: u64,
    pub dirty: u64,
    pub writeback: u64,
    pub mapped: u64,
}

/// One CPU slot of a node. The embedded counter session is only ever
/// touched from the sampler thread via `cpu_traverse`.
pub struct CpuSlot {
    pub cpuid: i32,
    pub hit: bool,
    pub hotadd: bool,
    pub hotremove: bool,
    pub session: CpuSession,
}

impl CpuSlot {
    fn empty() -> Self {
        CpuSlot {
            cpuid: INVALID_CPUID,
            hit: false,
            hotadd: false,
            hotremove: false,
            session: CpuSession::invalid(0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.cpuid != INVALID_CPUID
    }
}

pub struct NodeSlot {
    pub nid: i32,
    pub hotadd: bool,
    pub hotremove: bool,
    pub ncpus: usize,
    pub cpus: Vec<CpuSlot>,
    pub countval: CountVals,
    pub meminfo: NodeMeminfo,
    pub qpi: Vec<UncoreCounter>,
    pub imc: Vec<UncoreCounter>,
}

impl NodeSlot {
    fn invalid() -> Self {
        NodeSlot {
            nid: INVALID_NID,
            hotadd: false,
            hotremove: false,
            ncpus: 0,
            cpus: Vec::new(),
            countval: CountVals::default(),
            meminfo: NodeMeminfo::default(),
            qpi: Vec::new(),
            imc: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.nid != INVALID_NID
    }

    pub fn first_cpu(&self) -> Option<i32> {
        self.cpus.iter().find(|c| c.is_valid()).map(|c| c.cpuid)
    }
}

pub(crate) struct TopoInner {
    pub nodes: Vec<NodeSlot>,
    pub nnodes: usize,
    pub cpuid_max: i32,
    pub online_cpus: usize,
    pub intval_ms: u64,
}

/// The node group. Mutation is serialised by the inner lock; per-CPU
/// session operations happen only under `cpu_traverse`, which is only
/// called from the sampler thread.
pub struct Topology {
    inner: Mutex<TopoInner>,
    nnodes_max: usize,
}

/// Per-CPU context handed to traverse callbacks.
pub struct TraverseCtx<'a> {
    pub nid: i32,
    pub node_counts: &'a mut CountVals,
    pub cpuid_max: i32,
}

/// Read-only snapshot of the node→CPU assignment, taken so that readers
/// can aggregate per-CPU accumulators without holding the topology lock.
#[derive(Clone, Debug, Default)]
pub struct NodeCpuMap {
    pub nodes: Vec<(i32, Vec<i32>)>,
}

impl NodeCpuMap {
    pub fn node_of_cpu(&self, cpuid: i32) -> Option<i32> {
        self.nodes
            .iter()
            .find(|(_, cpus)| cpus.contains(&cpuid))
            .map(|(nid, _)| *nid)
    }

    /// Sum one UI counter of a per-CPU accumulator array over one node,
    /// or over all nodes when `nid` is None.
    pub fn countval_sum(&self, countvals: &[CountVals], nid: Option<i32>, ui: UiCountId) -> u64 {
        let mut sum = 0;
        for (node_id, cpus) in &self.nodes {
            if nid.is_some() && nid != Some(*node_id) {
                continue;
            }

            for cpu in cpus {
                if let Some(vals) = countvals.get(*cpu as usize) {
                    sum += ui.aggregate(vals);
                }
            }
        }

        sum
    }
}

fn parse_int_list(content: &str) -> Vec<i32> {
    let mut out = Vec::new();
    for part in content.trim().split(',') {
        if part.is_empty() {
            continue;
        }

        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.trim().parse::<i32>(), hi.trim().parse::<i32>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(v) = part.trim().parse::<i32>() {
            out.push(v);
        }
    }

    out
}

fn read_int_list(path: &Path) -> Result<Vec<i32>> {
    let content = fs::read_to_string(path).map_err(Error::Topology)?;
    Ok(parse_int_list(&content))
}

fn parse_mem_kb(line: &str) -> Option<u64> {
    let after = line.split(':').nth(1)?;
    let digits: String = after.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse::<u64>().ok().map(|kb| kb * 1024)
}

fn parse_meminfo(content: &str) -> NodeMeminfo {
    let mut info = NodeMeminfo::default();
    for line in content.lines() {
        let value = match parse_mem_kb(line) {
            Some(v) => v,
            None => continue,
        };

        if line.contains("MemTotal:") {
            info.total = value;
        } else if line.contains("MemFree:") {
            info.free = value;
        } else if line.contains("Inactive:") {
            info.inactive = value;
        } else if line.contains("Active:") {
            info.active = value;
        } else if line.contains("Dirty:") {
            info.dirty = value;
        } else if line.contains("Writeback:") {
            info.writeback = value;
        } else if line.contains("Mapped:") {
            info.mapped = value;
        }
    }

    info
}

impl Topology {
    pub fn new() -> Result<Self> {
        let possible = read_int_list(&Path::new(NODE_ROOT).join("possible"))?;
        let nnodes_max = possible.iter().copied().max().unwrap_or(0) as usize + 1;

        let mut nodes = Vec::with_capacity(nnodes_max);
        for _ in 0..nnodes_max {
            nodes.push(NodeSlot::invalid());
        }

        let topo = Topology {
            inner: Mutex::new(TopoInner {
                nodes,
                nnodes: 0,
                cpuid_max: -1,
                online_cpus: 0,
                intval_ms: 0,
            }),
            nnodes_max,
        };

        topo.refresh(true)?;
        Ok(topo)
    }

    /// Build a fixed topology for tests: no sysfs, no sessions.
    #[cfg(test)]
    pub fn for_test(layout: &[(i32, &[i32])]) -> Self {
        let nnodes_max = layout.iter().map(|(nid, _)| *nid).max().unwrap_or(0) as usize + 1;
        let mut nodes = Vec::new();
        for _ in 0..nnodes_max {
            nodes.push(NodeSlot::invalid());
        }

        let mut cpuid_max = -1;
        let mut online = 0;
        for (nid, cpus) in layout {
            let node = &mut nodes[*nid as usize];
            node.nid = *nid;
            node.ncpus = cpus.len();
            for cpu in *cpus {
                let mut slot = CpuSlot::empty();
                slot.cpuid = *cpu;
                node.cpus.push(slot);
                cpuid_max = cpuid_max.max(*cpu);
                online += 1;
            }
        }

        Topology {
            inner: Mutex::new(TopoInner {
                nodes,
                nnodes: layout.len(),
                cpuid_max,
                online_cpus: online,
                intval_ms: 0,
            }),
            nnodes_max,
        }
    }

    /// Reconcile the node group with sysfs. New nodes are initialised,
    /// vanished ones flagged for removal (their sessions are freed on the
    /// next sampler traverse). The maximum seen CPU id only grows.
    pub fn refresh(&self, init: bool) -> Result<()> {
        let online = read_int_list(&Path::new(NODE_ROOT).join("online"))?;
        let mut inner = self.inner.lock();
        let TopoInner { nodes, nnodes, .. } = &mut *inner;

        for node in nodes.iter_mut() {
            if node.is_valid() && !node.hotremove && !online.contains(&node.nid) {
                node.hotremove = true;
                for cpu in node.cpus.iter_mut() {
                    if cpu.is_valid() {
                        cpu.hotremove = true;
                    }
                }
                *nnodes -= 1;
            }
        }

        for nid in &online {
            let slot = &mut nodes[*nid as usize];
            if !slot.is_valid() {
                *slot = NodeSlot::invalid();
                slot.nid = *nid;
                slot.hotadd = !init;
                *nnodes += 1;
            }
        }

        let mut cpuid_max = inner.cpuid_max;
        for node in inner.nodes.iter_mut() {
            if !node.is_valid() || node.hotremove {
                continue;
            }

            let path = Path::new(NODE_ROOT).join(format!("node{}/cpulist", node.nid));
            let cpu_ids = read_int_list(&path)?;
            cpu_refresh(node, &cpu_ids, init);
            node.ncpus = cpu_ids.len();
            cpuid_max = cpuid_max.max(cpu_ids.iter().copied().max().unwrap_or(-1));

            let mem_path = Path::new(NODE_ROOT).join(format!("node{}/meminfo", node.nid));
            if let Ok(content) = fs::read_to_string(&mem_path) {
                node.meminfo = parse_meminfo(&content);
            } else {
                log::debug!("meminfo read failed for node {}", node.nid);
            }
        }

        inner.cpuid_max = cpuid_max;

        if let Ok(online_cpus) = read_int_list(Path::new("/sys/devices/system/cpu/online")) {
            inner.online_cpus = online_cpus.len();
        }

        Ok(())
    }

    /// Walk every CPU slot of every valid node on behalf of the sampler.
    /// Hot-removed CPUs have their session freed and slot invalidated
    /// before anything else runs; `hotadd_fn` runs exactly once for each
    /// newly appeared CPU, then `func` runs on every valid CPU. With
    /// `err_ret` set, the first callback error aborts the walk.
    pub fn cpu_traverse<F, H>(
        &self,
        mut func: F,
        err_ret: bool,
        mut hotadd_fn: Option<H>,
    ) -> Result<()>
    where
        F: FnMut(&mut CpuSlot, &mut TraverseCtx) -> Result<()>,
        H: FnMut(&mut CpuSlot, &mut TraverseCtx) -> Result<()>,
    {
        let mut inner = self.inner.lock();
        let TopoInner {
            nodes, cpuid_max, ..
        } = &mut *inner;

        for node in nodes.iter_mut() {
            if !node.is_valid() {
                continue;
            }

            let NodeSlot {
                nid,
                hotremove,
                cpus,
                countval,
                ..
            } = node;

            for cpu in cpus.iter_mut() {
                if cpu.hotremove {
                    cpu.session.free();
                    cpu.hotremove = false;
                    cpu.cpuid = INVALID_CPUID;
                    continue;
                }

                let mut ctx = TraverseCtx {
                    nid: *nid,
                    node_counts: &mut *countval,
                    cpuid_max: *cpuid_max,
                };

                if cpu.hotadd {
                    if let Some(hotadd) = hotadd_fn.as_mut() {
                        // A failed hot-add setup leaves the slot without a
                        // session; the next sample pass retries nothing.
                        let _ = hotadd(cpu, &mut ctx);
                        cpu.hotadd = false;
                    }
                }

                if cpu.is_valid() && !cpu.hotadd {
                    let ret = func(cpu, &mut ctx);
                    if err_ret {
                        ret?;
                    }
                }
            }

            if *hotremove {
                *nid = INVALID_NID;
                *hotremove = false;
            }
        }

        Ok(())
    }

    /// Run `f` with the locked node group. Sampler-side helper for uncore
    /// and node-accumulator work that is not per-CPU.
    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&mut TopoInner) -> R) -> R {
        f(&mut self.inner.lock())
    }

    pub fn nnodes_max(&self) -> usize {
        self.nnodes_max
    }

    /// One past the largest CPU id ever seen; sizes per-CPU accumulators.
    pub fn cpu_slots(&self) -> usize {
        (self.inner.lock().cpuid_max + 1).max(0) as usize
    }

    pub fn online_cpus(&self) -> usize {
        self.inner.lock().online_cpus
    }

    pub fn intval_update(&self, intval_ms: u64) {
        self.inner.lock().intval_ms = intval_ms;
    }

    pub fn intval_ms(&self) -> u64 {
        self.inner.lock().intval_ms
    }

    pub fn profiling_clear(&self) {
        for node in self.inner.lock().nodes.iter_mut() {
            node.countval.clear();
        }
    }

    pub fn cpu_map_snapshot(&self) -> NodeCpuMap {
        let inner = self.inner.lock();
        NodeCpuMap {
            nodes: inner
                .nodes
                .iter()
                .filter(|n| n.is_valid())
                .map(|n| {
                    (
                        n.nid,
                        n.cpus
                            .iter()
                            .filter(|c| c.is_valid())
                            .map(|c| c.cpuid)
                            .collect(),
                    )
                })
                .collect(),
        }
    }

    /// Per-node row data for the node-overview view.
    pub fn nodes_overview(&self) -> Vec<NodeOverview> {
        let inner = self.inner.lock();
        inner
            .nodes
            .iter()
            .filter(|n| n.is_valid())
            .map(|n| NodeOverview {
                nid: n.nid,
                ncpus: n.ncpus,
                countval: n.countval,
                meminfo: n.meminfo,
            })
            .collect()
    }

    pub fn node_detail(&self, nid: i32) -> Option<NodeDetail> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(nid as usize).filter(|n| n.is_valid())?;
        Some(NodeDetail {
            nid: node.nid,
            cpus: node
                .cpus
                .iter()
                .filter(|c| c.is_valid())
                .map(|c| c.cpuid)
                .collect(),
            countval: node.countval,
            meminfo: node.meminfo,
            qpi_bw: node.qpi.iter().map(|q| (q.id, q.value_scaled)).collect(),
            imc_bw: node.imc.iter().map(|q| (q.id, q.value_scaled)).collect(),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NodeOverview {
    pub nid: i32,
    pub ncpus: usize,
    pub countval: CountVals,
    pub meminfo: NodeMeminfo,
}

#[derive(Clone, Debug)]
pub struct NodeDetail {
    pub nid: i32,
    pub cpus: Vec<i32>,
    pub countval: CountVals,
    pub meminfo: NodeMeminfo,
    pub qpi_bw: Vec<(usize, u64)>,
    pub imc_bw: Vec<(usize, u64)>,
}

/// Reconcile one node's CPU slots with the freshly read id list, keeping
/// the original hit/hotadd/hotremove protocol.
fn cpu_refresh(node: &mut NodeSlot, cpu_ids: &[i32], init: bool) {
    for slot in node.cpus.iter_mut() {
        slot.hit = false;
    }

    for cpuid in cpu_ids {
        if let Some(slot) = node.cpus.iter_mut().find(|s| s.cpuid == *cpuid) {
            slot.hit = true;
            continue;
        }

        // New CPU: reuse a free slot or grow.
        let slot = match node.cpus.iter_mut().find(|s| !s.is_valid()) {
            Some(slot) => slot,
            None => {
                node.cpus.push(CpuSlot::empty());
                node.cpus.last_mut().unwrap()
            }
        };

        slot.cpuid = *cpuid;
        slot.hit = true;
        slot.hotadd = !init;
        slot.hotremove = false;
        slot.session = CpuSession::invalid(*cpuid as u32);
        if slot.hotadd {
            log::debug!("cpu{cpuid} is hot-added");
        }
    }

    for slot in node.cpus.iter_mut() {
        if !slot.hit && slot.is_valid() {
            slot.hotremove = true;
            log::debug!("cpu{} is hot-removed", slot.cpuid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::CounterId;

    #[test]
    fn int_list_parsing() {
        assert_eq!(parse_int_list("0-3,8,10-11\n"), vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(parse_int_list("0\n"), vec![0]);
        assert_eq!(parse_int_list(""), Vec::<i32>::new());
    }

    #[test]
    fn meminfo_parsing() {
        let content = "\
Node 1 MemTotal:       131897644 kB
Node 1 MemFree:        10937136 kB
Node 1 Active:         51980400 kB
Node 1 Inactive:       60997540 kB
Node 1 Dirty:               808 kB
Node 1 Writeback:             0 kB
Node 1 Mapped:           605768 kB
";
        let info = parse_meminfo(content);
        assert_eq!(info.total, 131897644 * 1024);
        assert_eq!(info.free, 10937136 * 1024);
        assert_eq!(info.active, 51980400 * 1024);
        assert_eq!(info.inactive, 60997540 * 1024);
        assert_eq!(info.dirty, 808 * 1024);
        assert_eq!(info.writeback, 0);
        assert_eq!(info.mapped, 605768 * 1024);
    }

    #[test]
    fn snapshot_sums_per_node() {
        let topo = Topology::for_test(&[(0, &[0, 1]), (1, &[2, 3])]);
        let map = topo.cpu_map_snapshot();

        let mut countvals = vec![CountVals::default(); 4];
        countvals[0].add(CounterId::Rma, 5);
        countvals[2].add(CounterId::Rma, 7);
        countvals[3].add(CounterId::Rma, 1);

        assert_eq!(map.countval_sum(&countvals, Some(0), UiCountId::Rma), 5);
        assert_eq!(map.countval_sum(&countvals, Some(1), UiCountId::Rma), 8);
        assert_eq!(map.countval_sum(&countvals, None, UiCountId::Rma), 13);
        assert_eq!(map.node_of_cpu(2), Some(1));
        assert_eq!(map.node_of_cpu(9), None);
    }

    #[test]
    fn traverse_visits_every_valid_cpu_once() {
        let topo = Topology::for_test(&[(0, &[0, 1]), (1, &[2])]);
        let mut seen = Vec::new();
        topo.cpu_traverse(
            |cpu, ctx| {
                seen.push((ctx.nid, cpu.cpuid));
                Ok(())
            },
            false,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> crate::error::Result<()>>,
        )
        .unwrap();

        assert_eq!(seen, vec![(0, 0), (0, 1), (1, 2)]);
    }

    #[test]
    fn hotadd_runs_once_then_func() {
        let topo = Topology::for_test(&[(0, &[0])]);
        topo.with_nodes(|inner| inner.nodes[0].cpus[0].hotadd = true);

        let mut added = 0;
        let mut visited = 0;
        topo.cpu_traverse(
            |_, _| {
                visited += 1;
                Ok(())
            },
            false,
            Some(|_: &mut CpuSlot, _: &mut TraverseCtx| {
                added += 1;
                Ok(())
            }),
        )
        .unwrap();

        assert_eq!(added, 1);
        assert_eq!(visited, 1);

        // Second traverse: the hotadd flag is consumed.
        topo.cpu_traverse(
            |_, _| Ok(()),
            false,
            Some(|_: &mut CpuSlot, _: &mut TraverseCtx| {
                added += 1;
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn hotremove_invalidates_slot_before_walk() {
        let topo = Topology::for_test(&[(0, &[0, 1])]);
        topo.with_nodes(|inner| inner.nodes[0].cpus[0].hotremove = true);

        let mut seen = Vec::new();
        topo.cpu_traverse(
            |cpu, _| {
                seen.push(cpu.cpuid);
                Ok(())
            },
            false,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> crate::error::Result<()>>,
        )
        .unwrap();

        assert_eq!(seen, vec![1]);
        topo.with_nodes(|inner| {
            assert_eq!(inner.nodes[0].cpus[0].cpuid, INVALID_CPUID);
            assert!(!inner.nodes[0].cpus[0].hotremove);
        });
    }
}
