use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::thread::Thread;
use crate::perf::counter::LatencyRecord;
use crate::perf::pqos::Pqos;
use crate::perf::{ChainRecord, CountVals, CounterId, COUNTER_NUM};
use crate::symbols::maps::{self, MapEntry};
use crate::symbols::ProcSymbols;

/// A tracked process. The registry owns it by pid; readers and the
/// sampler borrow it through `Arc` clones. Once the removing tombstone is
/// set no new reference can be acquired, and the record goes away with
/// the last outstanding one.
pub struct Process {
    pub pid: i32,
    pub name: String,
    removing: AtomicBool,
    pub inner: Mutex<ProcInner>,
}

pub struct ProcInner {
    pub countvals: Vec<CountVals>,
    pub chains: [Vec<ChainRecord>; COUNTER_NUM],
    pub llrecs: Vec<LatencyRecord>,
    pub threads: Vec<Arc<Thread>>,
    pub maps: Vec<MapEntry>,
    pub syms: ProcSymbols,
    pub pqos: Option<Pqos>,
    pub thread_pqosed: bool,
    pub intval_ms: u64,
}

impl Process {
    pub fn new(pid: i32, name: String, cpu_slots: usize) -> Arc<Process> {
        Arc::new(Process {
            pid,
            name,
            removing: AtomicBool::new(false),
            inner: Mutex::new(ProcInner {
                countvals: vec![CountVals::default(); cpu_slots],
                chains: std::array::from_fn(|_| Vec::new()),
                llrecs: Vec::new(),
                threads: Vec::new(),
                maps: Vec::new(),
                syms: ProcSymbols::default(),
                pqos: None,
                thread_pqosed: false,
                intval_ms: 0,
            }),
        })
    }

    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::Acquire)
    }

    pub fn set_removing(&self) {
        self.removing.store(true, Ordering::Release);
    }

    /// Look a thread up by id; the list is kept sorted. A thread flagged
    /// as removing or quitting cannot be acquired.
    pub fn thread_find(&self, tid: i32) -> Option<Arc<Thread>> {
        let inner = self.inner.lock();
        let idx = inner.threads.binary_search_by_key(&tid, |t| t.tid).ok()?;
        let thread = &inner.threads[idx];
        if thread.is_removing() || thread.is_quitting() {
            return None;
        }

        Some(thread.clone())
    }

    pub fn nthreads(&self) -> usize {
        self.inner.lock().threads.len()
    }

    /// Reconcile the thread list against a freshly enumerated, sorted TID
    /// list: both lists are merge-walked, so the whole update is linear in
    /// their sizes.
    pub fn thread_reconcile(self: &Arc<Self>, tids_new: &[i32], cpu_slots: usize) {
        let mut sorted = tids_new.to_vec();
        sorted.sort_unstable();

        let mut inner = self.inner.lock();
        let old = std::mem::take(&mut inner.threads);
        let mut merged = Vec::with_capacity(sorted.len());

        let mut i = 0;
        let mut j = 0;
        while i < sorted.len() && j < old.len() {
            if sorted[i] == old[j].tid {
                merged.push(old[j].clone());
                i += 1;
                j += 1;
            } else if sorted[i] < old[j].tid {
                merged.push(Thread::new(sorted[i], Arc::downgrade(self), cpu_slots));
                i += 1;
            } else {
                old[j].set_removing();
                old[j].set_quitting();
                j += 1;
            }
        }

        for tid in &sorted[i..] {
            merged.push(Thread::new(*tid, Arc::downgrade(self), cpu_slots));
        }

        for gone in &old[j..] {
            gone.set_removing();
            gone.set_quitting();
        }

        inner.threads = merged;
    }

    pub fn countval_update(&self, cpu: usize, id: CounterId, value: u64, cpu_slots: usize) {
        let mut inner = self.inner.lock();
        if cpu >= inner.countvals.len() {
            inner.countvals.resize(cpu_slots.max(cpu + 1), CountVals::default());
        }

        inner.countvals[cpu].add(id, value);
    }

    pub fn intval_update(&self, intval_ms: u64) {
        let mut inner = self.inner.lock();
        inner.intval_ms = intval_ms;
        for thread in &inner.threads {
            thread.inner.lock().intval_ms = intval_ms;
        }
    }

    pub fn profiling_clear(&self) {
        let mut inner = self.inner.lock();
        for vals in inner.countvals.iter_mut() {
            vals.clear();
        }
        for thread in &inner.threads {
            thread.profiling_clear();
        }
    }

    pub fn callchain_clear(&self) {
        let mut inner = self.inner.lock();
        for grp in inner.chains.iter_mut() {
            grp.clear();
        }
        for thread in &inner.threads {
            thread.callchain_clear();
        }
    }

    pub fn ll_clear(&self) {
        let mut inner = self.inner.lock();
        inner.llrecs.clear();
        for thread in &inner.threads {
            thread.ll_clear();
        }
    }

    /// Refresh the address map and lazily parse symbols for any mapping
    /// not resolved yet. Holds the process lock: symbol state is guarded
    /// by it.
    pub fn sym_load(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        let reloaded = if inner.maps.is_empty() {
            maps::read_maps(self.pid)?
        } else {
            maps::reload(self.pid, &inner.maps)?
        };
        inner.maps = reloaded;

        let ProcInner { maps, syms, .. } = &mut *inner;
        syms.load(maps);
        Ok(())
    }

    /// Drop one thread's pqos state, or every thread's.
    pub fn pqos_clear(&self, tid: i32) {
        let mut inner = self.inner.lock();
        if tid == 0 {
            inner.pqos = None;
            if inner.thread_pqosed {
                for thread in &inner.threads {
                    let mut ti = thread.inner.lock();
                    if let Some(pqos) = ti.pqos.as_mut() {
                        crate::perf::pqos::task_free(pqos);
                    }
                    ti.pqos = None;
                }
                inner.thread_pqosed = false;
            }
        } else if let Ok(idx) = inner.threads.binary_search_by_key(&tid, |t| t.tid) {
            let thread = inner.threads[idx].clone();
            let mut ti = thread.inner.lock();
            if let Some(pqos) = ti.pqos.as_mut() {
                crate::perf::pqos::task_free(pqos);
            }
            ti.pqos = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_reconcile_merges_sorted_lists() {
        let proc = Process::new(100, "test".into(), 4);
        proc.thread_reconcile(&[100, 102, 104], 4);
        assert_eq!(proc.nthreads(), 3);

        let t102 = proc.thread_find(102).unwrap();
        t102.countval_update(0, CounterId::Clk, 7, 4);

        // 102 survives, 104 goes away, 103 appears.
        proc.thread_reconcile(&[100, 102, 103], 4);
        assert_eq!(proc.nthreads(), 3);
        assert!(proc.thread_find(104).is_none());

        let kept = proc.thread_find(102).unwrap();
        assert_eq!(kept.inner.lock().countvals[0].get(CounterId::Clk), 7);
    }

    #[test]
    fn removed_thread_blocks_new_acquisition() {
        let proc = Process::new(100, "test".into(), 1);
        proc.thread_reconcile(&[100, 101], 1);
        let held = proc.thread_find(101).unwrap();

        proc.thread_reconcile(&[100], 1);
        assert!(proc.thread_find(101).is_none());

        // The outstanding reference stays usable until dropped.
        assert!(held.is_removing());
        drop(held);
    }

    #[test]
    fn countval_grows_with_hot_added_cpu() {
        let proc = Process::new(1, "grow".into(), 2);
        proc.countval_update(5, CounterId::Rma, 9, 8);

        let inner = proc.inner.lock();
        assert_eq!(inner.countvals.len(), 8);
        assert_eq!(inner.countvals[5].get(CounterId::Rma), 9);
        assert_eq!(inner.countvals[4].get(CounterId::Rma), 0);
    }
}
