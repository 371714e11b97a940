use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::process::Process;
use crate::perf::counter::LatencyRecord;
use crate::perf::pqos::Pqos;
use crate::perf::{ChainRecord, CountVals, CounterId, COUNTER_NUM};

/// A tracked thread. Lives in its process's sorted thread list and is
/// only manipulated while the process record is referenced.
pub struct Thread {
    pub tid: i32,
    pub process: Weak<Process>,
    removing: AtomicBool,
    quitting: AtomicBool,
    pub inner: Mutex<ThreadInner>,
}

pub struct ThreadInner {
    pub countvals: Vec<CountVals>,
    pub chains: [Vec<ChainRecord>; COUNTER_NUM],
    pub llrecs: Vec<LatencyRecord>,
    pub pqos: Option<Pqos>,
    pub intval_ms: u64,
}

impl Thread {
    pub fn new(tid: i32, process: Weak<Process>, cpu_slots: usize) -> Arc<Thread> {
        Arc::new(Thread {
            tid,
            process,
            removing: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            inner: Mutex::new(ThreadInner {
                countvals: vec![CountVals::default(); cpu_slots],
                chains: std::array::from_fn(|_| Vec::new()),
                llrecs: Vec::new(),
                pqos: None,
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

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::Acquire)
    }

    pub fn set_quitting(&self) {
        self.quitting.store(true, Ordering::Release);
    }

    /// Accumulate one counter delta at the CPU's slot, growing the array
    /// with a zeroed tail when a hot-added CPU exceeds it.
    pub fn countval_update(&self, cpu: usize, id: CounterId, value: u64, cpu_slots: usize) {
        let mut inner = self.inner.lock();
        if cpu >= inner.countvals.len() {
            inner.countvals.resize(cpu_slots.max(cpu + 1), CountVals::default());
        }

        inner.countvals[cpu].add(id, value);
    }

    pub fn profiling_clear(&self) {
        let mut inner = self.inner.lock();
        for vals in inner.countvals.iter_mut() {
            vals.clear();
        }
    }

    pub fn callchain_clear(&self) {
        let mut inner = self.inner.lock();
        for grp in inner.chains.iter_mut() {
            grp.clear();
        }
    }

    pub fn ll_clear(&self) {
        self.inner.lock().llrecs.clear();
    }
}
