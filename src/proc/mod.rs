pub mod process;
pub mod thread;

use std::fs;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::perf::UiCountId;
use crate::topo::NodeCpuMap;
use crate::util::ratio;
use process::Process;

/// Orderings for the process and thread tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    Cpu,
    Pid,
    Rpi,
    Lpi,
    Cpi,
    Rma,
    Lma,
    Rl,
}

struct RegInner {
    procs: FxHashMap<i32, Arc<Process>>,
    latest: Option<Arc<Process>>,
    sorted: Vec<Arc<Process>>,
    sort_idx: usize,
    nthreads: usize,
}

/// The tracked-process table: pid → record, refreshed against `/proc`,
/// with a single-slot most-recently-found cache in front of the map.
pub struct Registry {
    inner: Mutex<RegInner>,
}

fn procfs_pids() -> Vec<i32> {
    let Ok(entries) = fs::read_dir("/proc") else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
        .collect()
}

fn procfs_name(pid: i32) -> String {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim_end().to_owned())
        .unwrap_or_default()
}

pub(crate) fn procfs_tids(pid: i32) -> Vec<i32> {
    let Ok(entries) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|e| e.file_name().to_string_lossy().parse::<i32>().ok())
        .collect()
}

fn pid_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegInner {
                procs: FxHashMap::default(),
                latest: None,
                sorted: Vec::new(),
                sort_idx: 0,
                nthreads: 0,
            }),
        }
    }

    /// With pid 0, reconcile against the live `/proc` list; otherwise
    /// probe the one pid and drop its record if it is gone.
    pub fn enum_update(&self, pid: i32, cpu_slots: usize) {
        if pid > 0 {
            if !pid_alive(pid) {
                self.remove(pid);
            }
            return;
        }

        self.reconcile_with(&procfs_pids(), &procfs_name, &procfs_tids, cpu_slots);
    }

    /// The reconcile core, parameterised over the `/proc` readers so it
    /// can be driven from tests.
    pub fn reconcile_with(
        &self,
        pids_new: &[i32],
        name_of: &dyn Fn(i32) -> String,
        tids_of: &dyn Fn(i32) -> Vec<i32>,
        cpu_slots: usize,
    ) {
        {
            let mut inner = self.inner.lock();

            let gone: Vec<i32> = inner
                .procs
                .keys()
                .copied()
                .filter(|pid| !pids_new.contains(pid))
                .collect();
            for pid in gone {
                if let Some(proc) = inner.procs.remove(&pid) {
                    proc.set_removing();
                    if inner.latest.as_ref().map(|p| p.pid) == Some(pid) {
                        inner.latest = None;
                    }
                }
            }

            for pid in pids_new {
                if !inner.procs.contains_key(pid) {
                    let proc = Process::new(*pid, name_of(*pid), cpu_slots);
                    inner.procs.insert(*pid, proc);
                }
            }
        }

        // Thread reconciliation happens outside the table lock; each
        // record has its own lock.
        let procs: Vec<Arc<Process>> = self.inner.lock().procs.values().cloned().collect();
        let mut nthreads = 0;
        for proc in &procs {
            proc.thread_reconcile(&tids_of(proc.pid), cpu_slots);
            nthreads += proc.nthreads();
        }

        self.inner.lock().nthreads = nthreads;
    }

    fn remove(&self, pid: i32) {
        let mut inner = self.inner.lock();
        if let Some(proc) = inner.procs.remove(&pid) {
            proc.set_removing();
        }
        if inner.latest.as_ref().map(|p| p.pid) == Some(pid) {
            inner.latest = None;
        }
    }

    /// Find by pid. The most recently found record is checked before the
    /// map; a tombstoned record cannot be acquired.
    pub fn find(&self, pid: i32) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();

        if let Some(latest) = &inner.latest {
            if latest.pid == pid {
                if latest.is_removing() {
                    inner.latest = None;
                    return None;
                }
                return Some(latest.clone());
            }
        }

        let proc = inner.procs.get(&pid)?.clone();
        if proc.is_removing() {
            return None;
        }

        inner.latest = Some(proc.clone());
        Some(proc)
    }

    pub fn nprocs(&self) -> usize {
        self.inner.lock().procs.len()
    }

    pub fn nthreads(&self) -> usize {
        self.inner.lock().nthreads
    }

    pub fn for_each(&self, mut f: impl FnMut(&Arc<Process>)) {
        let procs: Vec<Arc<Process>> = self.inner.lock().procs.values().cloned().collect();
        for proc in &procs {
            f(proc);
        }
    }

    pub fn intval_update(&self, intval_ms: u64) {
        self.for_each(|p| p.intval_update(intval_ms));
    }

    pub fn profiling_clear(&self) {
        self.for_each(|p| p.profiling_clear());
    }

    pub fn callchain_clear(&self) {
        self.for_each(|p| p.callchain_clear());
    }

    /// Clear latency groups of one process, or of all of them.
    pub fn ll_clear(&self, pid: i32) {
        if pid > 0 {
            if let Some(proc) = self.find(pid) {
                proc.ll_clear();
            }
        } else {
            self.for_each(|p| p.ll_clear());
        }
    }

    /// Recompute sort keys under `key` and rebuild the sorted cursor. The
    /// sort is made deterministic for equal keys by sorting by pid first
    /// and then stably by the key.
    pub fn resort(&self, key: SortKey, cpu_map: &NodeCpuMap) {
        let mut entries: Vec<(u64, Arc<Process>)> = Vec::new();
        self.for_each(|proc| {
            let value = {
                let inner = proc.inner.lock();
                sort_key_value(key, proc.pid, &inner.countvals, cpu_map)
            };
            entries.push((value, proc.clone()));
        });

        entries.sort_unstable_by_key(|(_, proc)| proc.pid);
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        let mut inner = self.inner.lock();
        inner.sorted = entries.into_iter().map(|(_, p)| p).collect();
        inner.sort_idx = 0;
    }

    /// Advance the sort cursor, returning the record it pointed at.
    pub fn sort_next(&self) -> Option<Arc<Process>> {
        let mut inner = self.inner.lock();
        let idx = inner.sort_idx;
        let proc = inner.sorted.get(idx)?.clone();
        inner.sort_idx += 1;
        Some(proc)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn sort_key_value(
    key: SortKey,
    pid: i32,
    countvals: &[crate::perf::CountVals],
    cpu_map: &NodeCpuMap,
) -> u64 {
    let sum = |ui: UiCountId| cpu_map.countval_sum(countvals, None, ui);

    match key {
        SortKey::Cpu => sum(UiCountId::Clk),
        SortKey::Pid => pid as u64,
        SortKey::Rpi => ratio(sum(UiCountId::Rma) * 1000, sum(UiCountId::Ir)) as u64,
        SortKey::Lpi => ratio(sum(UiCountId::Lma) * 1000, sum(UiCountId::Ir)) as u64,
        SortKey::Cpi => ratio(sum(UiCountId::Clk) * 1000, sum(UiCountId::Ir)) as u64,
        SortKey::Rma => sum(UiCountId::Rma),
        SortKey::Lma => sum(UiCountId::Lma),
        SortKey::Rl => ratio(sum(UiCountId::Rma) * 1000, sum(UiCountId::Lma)) as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::CounterId;
    use crate::topo::Topology;
    use std::sync::Weak;

    fn test_registry(pids: &[i32], cpu_slots: usize) -> Registry {
        let registry = Registry::new();
        registry.reconcile_with(
            pids,
            &|pid| format!("proc-{pid}"),
            &|pid| vec![pid],
            cpu_slots,
        );
        registry
    }

    #[test]
    fn find_returns_to_precall_refcount() {
        let registry = test_registry(&[100], 2);

        let before = Arc::strong_count(&registry.find(100).unwrap());
        {
            let _held = registry.find(100).unwrap();
            assert_eq!(Arc::strong_count(&_held), before + 1);
        }
        assert_eq!(Arc::strong_count(&registry.find(100).unwrap()), before);
    }

    #[test]
    fn vanished_pid_is_unreachable_and_freed_after_last_release() {
        let registry = test_registry(&[100, 200, 300], 2);

        let held = registry.find(200).unwrap();
        let weak: Weak<Process> = Arc::downgrade(&held);

        // PID 200 exits between two enumerations.
        registry.reconcile_with(
            &[100, 300],
            &|pid| format!("proc-{pid}"),
            &|pid| vec![pid],
            2,
        );

        assert!(registry.find(200).is_none());
        assert!(held.is_removing());
        assert!(weak.upgrade().is_some());

        drop(held);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn latest_cache_does_not_resurrect_removed_records() {
        let registry = test_registry(&[42], 1);
        let _warm = registry.find(42).unwrap();

        registry.reconcile_with(&[], &|_| String::new(), &|_| Vec::new(), 1);
        assert!(registry.find(42).is_none());
        assert!(registry.find(42).is_none());
    }

    fn seed_clk(registry: &Registry, pid: i32, clk: u64) {
        let proc = registry.find(pid).unwrap();
        proc.countval_update(0, CounterId::Clk, clk, 2);
    }

    #[test]
    fn resort_by_cpu_orders_descending() {
        // Scenario: A=100 with 1M cycles, B=200 with 500k, C=300 with 2M.
        let topo = Topology::for_test(&[(0, &[0, 1])]);
        let registry = test_registry(&[100, 200, 300], 2);
        seed_clk(&registry, 100, 1_000_000);
        seed_clk(&registry, 200, 500_000);
        seed_clk(&registry, 300, 2_000_000);

        registry.resort(SortKey::Cpu, &topo.cpu_map_snapshot());
        let order: Vec<i32> = std::iter::from_fn(|| registry.sort_next())
            .map(|p| p.pid)
            .collect();
        assert_eq!(order, vec![300, 100, 200]);
    }

    #[test]
    fn resort_is_stable_across_runs() {
        let topo = Topology::for_test(&[(0, &[0])]);
        let registry = test_registry(&[5, 3, 9, 1], 1);

        // All keys equal: order must be deterministic (by pid) and
        // byte-identical between two resorts.
        registry.resort(SortKey::Rma, &topo.cpu_map_snapshot());
        let first: Vec<i32> = std::iter::from_fn(|| registry.sort_next())
            .map(|p| p.pid)
            .collect();

        registry.resort(SortKey::Rma, &topo.cpu_map_snapshot());
        let second: Vec<i32> = std::iter::from_fn(|| registry.sort_next())
            .map(|p| p.pid)
            .collect();

        assert_eq!(first, second);
        assert_eq!(first, vec![1, 3, 5, 9]);
    }

    #[test]
    fn sort_keys_compute_ratios() {
        let topo = Topology::for_test(&[(0, &[0])]);
        let registry = test_registry(&[7], 1);
        let proc = registry.find(7).unwrap();
        proc.countval_update(0, CounterId::Clk, 3000, 1);
        proc.countval_update(0, CounterId::Ir, 1000, 1);
        proc.countval_update(0, CounterId::Rma, 50, 1);
        proc.countval_update(0, CounterId::Lma, 25, 1);

        let map = topo.cpu_map_snapshot();
        let inner = proc.inner.lock();
        assert_eq!(sort_key_value(SortKey::Cpi, 7, &inner.countvals, &map), 3000);
        assert_eq!(sort_key_value(SortKey::Rl, 7, &inner.countvals, &map), 2000);
        assert_eq!(sort_key_value(SortKey::Pid, 7, &inner.countvals, &map), 7);
    }
}
