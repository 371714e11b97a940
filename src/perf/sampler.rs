use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::counter::{CountingRecord, CpuSession, LatencyRecord};
use super::pqos;
use super::uncore;
use super::{sample_period, ChainRecord, CountVals, CounterId, PerfConf, Precision, ProfilingConf, COUNTER_NUM};
use crate::error::{Error, Result};
use crate::proc::Registry;
use crate::topo::{CpuSlot, Topology, TraverseCtx};
use crate::ui::display::DispCtl;
use crate::util::TimeBase;

/// Minimum spacing between two sample requests, so overflow thresholds
/// get a chance to fire before the counters are read again.
const SMPL_MIN_INTERVAL_MS: u64 = 1000;

/// How long the display thread waits for the sampler to acknowledge a
/// configuration change.
const STATUS_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerStatus {
    Idle,
    ProfilingStarted,
    ProfilingPartStarted,
    ProfilingFailed,
    LlStarted,
    LlFailed,
    PqosStarted,
    PqosFailed,
    UncoreStarted,
    UncoreFailed,
}

impl SamplerStatus {
    fn is_failed(self) -> bool {
        matches!(
            self,
            SamplerStatus::ProfilingFailed
                | SamplerStatus::LlFailed
                | SamplerStatus::PqosFailed
                | SamplerStatus::UncoreFailed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplerTask {
    ProfilingStart,
    ProfilingSmpl { use_primary: bool },
    ProfilingPartpause { keep: CounterId },
    ProfilingRestore { keep: CounterId },
    LlStart,
    LlSmpl { pid: i32, tid: i32 },
    PqosStart { pid: i32, tid: i32, flags: u32 },
    PqosSmpl { pid: i32, tid: i32 },
    PqosStop { pid: i32, tid: i32 },
    UncoreStart { nid: i32 },
    UncoreSmpl { nid: i32 },
    UncoreStop { nid: i32 },
    Stop,
    Quit,
}

/// The single-slot task mailbox. Posting overwrites whatever was queued;
/// configuration changes always rendezvous on the status cell before the
/// next task is posted, so overwrite only ever folds sample requests.
struct Mailbox {
    slot: Mutex<Option<SamplerTask>>,
    cond: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Mailbox {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn post(&self, task: SamplerTask) {
        let mut slot = self.slot.lock();
        *slot = Some(task);
        self.cond.notify_one();
    }

    fn take(&self) -> SamplerTask {
        let mut slot = self.slot.lock();
        loop {
            if let Some(task) = slot.take() {
                return task;
            }
            self.cond.wait(&mut slot);
        }
    }
}

struct StatusCell {
    status: Mutex<SamplerStatus>,
    cond: Condvar,
}

impl StatusCell {
    fn new() -> Self {
        StatusCell {
            status: Mutex::new(SamplerStatus::Idle),
            cond: Condvar::new(),
        }
    }

    fn set(&self, status: SamplerStatus) {
        let mut guard = self.status.lock();
        *guard = status;
        self.cond.notify_all();
    }

    fn get(&self) -> SamplerStatus {
        *self.status.lock()
    }

    fn wait_for(&self, want: SamplerStatus) -> Result<()> {
        let deadline = Instant::now() + STATUS_WAIT;
        let mut guard = self.status.lock();
        loop {
            if *guard == want {
                return Ok(());
            }
            if guard.is_failed() {
                return Err(Error::SamplingFailed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::RendezvousTimeout);
            }
            let result = self.cond.wait_for(&mut guard, deadline - now);
            if result.timed_out() && *guard != want {
                return Err(Error::RendezvousTimeout);
            }
        }
    }
}

/// Display-thread-facing handle of the sampler thread.
pub struct SamplerCtl {
    mailbox: Mailbox,
    status: StatusCell,
    last_sample_ms: AtomicU64,
    timebase: TimeBase,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SamplerCtl {
    pub fn status(&self) -> SamplerStatus {
        self.status.get()
    }

    /// Profiling keeps serving process enumeration while a PQoS view is
    /// up, so the PQoS state counts as "profiling running".
    pub fn profiling_started(&self) -> bool {
        matches!(
            self.status(),
            SamplerStatus::ProfilingStarted
                | SamplerStatus::ProfilingPartStarted
                | SamplerStatus::PqosStarted
        )
    }

    pub fn ll_started(&self) -> bool {
        self.status() == SamplerStatus::LlStarted
    }

    pub fn pqos_started(&self) -> bool {
        self.status() == SamplerStatus::PqosStarted
    }

    pub fn uncore_started(&self) -> bool {
        self.status() == SamplerStatus::UncoreStarted
    }

    pub fn profiling_start(&self) -> Result<()> {
        self.mailbox.post(SamplerTask::ProfilingStart);
        self.status.wait_for(SamplerStatus::ProfilingStarted)
    }

    /// A refresh hitting faster than the minimum interval is delayed here
    /// on the display thread, not dropped.
    fn smpl_wait(&self) {
        let elapsed = self
            .timebase
            .current_ms()
            .saturating_sub(self.last_sample_ms.load(Ordering::Relaxed));
        if elapsed < SMPL_MIN_INTERVAL_MS {
            std::thread::sleep(Duration::from_millis(SMPL_MIN_INTERVAL_MS - elapsed));
        }
    }

    pub fn profiling_smpl(&self, use_primary: bool) -> Result<()> {
        self.smpl_wait();
        self.mailbox.post(SamplerTask::ProfilingSmpl { use_primary });
        Ok(())
    }

    pub fn profiling_partpause(&self, keep: CounterId) -> Result<()> {
        self.mailbox.post(SamplerTask::ProfilingPartpause { keep });
        self.status.wait_for(SamplerStatus::ProfilingPartStarted)
    }

    pub fn profiling_restore(&self, keep: CounterId) -> Result<()> {
        self.mailbox.post(SamplerTask::ProfilingRestore { keep });
        self.status.wait_for(SamplerStatus::ProfilingStarted)
    }

    pub fn ll_start(&self) -> Result<()> {
        self.mailbox.post(SamplerTask::LlStart);
        self.status.wait_for(SamplerStatus::LlStarted)
    }

    pub fn ll_smpl(&self, pid: i32, tid: i32) -> Result<()> {
        self.smpl_wait();
        self.mailbox.post(SamplerTask::LlSmpl { pid, tid });
        Ok(())
    }

    pub fn pqos_start(&self, pid: i32, tid: i32, flags: u32) -> Result<()> {
        self.mailbox.post(SamplerTask::PqosStart { pid, tid, flags });
        self.status.wait_for(SamplerStatus::PqosStarted)
    }

    pub fn pqos_smpl(&self, pid: i32, tid: i32) -> Result<()> {
        self.smpl_wait();
        self.mailbox.post(SamplerTask::PqosSmpl { pid, tid });
        Ok(())
    }

    pub fn pqos_stop(&self, pid: i32, tid: i32) -> Result<()> {
        self.mailbox.post(SamplerTask::PqosStop { pid, tid });
        Ok(())
    }

    pub fn uncore_start(&self, nid: i32) -> Result<()> {
        self.mailbox.post(SamplerTask::UncoreStart { nid });
        self.status.wait_for(SamplerStatus::UncoreStarted)
    }

    pub fn uncore_smpl(&self, nid: i32) -> Result<()> {
        self.smpl_wait();
        self.mailbox.post(SamplerTask::UncoreSmpl { nid });
        Ok(())
    }

    pub fn uncore_stop(&self, nid: i32) -> Result<()> {
        self.mailbox.post(SamplerTask::UncoreStop { nid });
        Ok(())
    }

    pub fn allstop(&self) -> Result<()> {
        self.mailbox.post(SamplerTask::Stop);
        self.status.wait_for(SamplerStatus::Idle)
    }

    /// Shut the sampler thread down and join it.
    pub fn quit(&self) {
        self.mailbox.post(SamplerTask::Quit);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// State owned by the sampler thread itself.
struct Sampler {
    ctl: Arc<SamplerCtl>,
    topo: Arc<Topology>,
    registry: Arc<Registry>,
    disp: Arc<DispCtl>,
    conf: ProfilingConf,
    ll_conf: Option<PerfConf>,
    precision: Precision,
    periods: [u64; COUNTER_NUM],
    partpause: bool,
    profiling_open: bool,
    ll_open: bool,
    last_ms: u64,
    last_ms_pqos: u64,
    rec_buf: Vec<CountingRecord>,
    ll_buf: Vec<LatencyRecord>,
}

/// Spawn the sampler thread. It is the only thread that performs counter
/// I/O; everything arrives through the task mailbox.
pub fn spawn(
    topo: Arc<Topology>,
    registry: Arc<Registry>,
    disp: Arc<DispCtl>,
    conf: ProfilingConf,
    ll_conf: Option<PerfConf>,
    precision: Precision,
    timebase: TimeBase,
) -> Arc<SamplerCtl> {
    let ctl = Arc::new(SamplerCtl {
        mailbox: Mailbox::new(),
        status: StatusCell::new(),
        last_sample_ms: AtomicU64::new(0),
        timebase,
        handle: Mutex::new(None),
    });

    let mut periods = [0u64; COUNTER_NUM];
    for id in CounterId::ALL {
        periods[id.index()] = sample_period(id, precision);
    }

    let mut sampler = Sampler {
        ctl: ctl.clone(),
        topo,
        registry,
        disp,
        conf,
        ll_conf,
        precision,
        periods,
        partpause: false,
        profiling_open: false,
        ll_open: false,
        last_ms: 0,
        last_ms_pqos: 0,
        rec_buf: Vec::new(),
        ll_buf: Vec::new(),
    };

    let handle = std::thread::Builder::new()
        .name("sampler".into())
        .spawn(move || sampler.run())
        .expect("spawning the sampler thread failed");

    *ctl.handle.lock() = Some(handle);
    ctl
}

impl Sampler {
    fn run(&mut self) {
        loop {
            let task = self.ctl.mailbox.take();
            log::trace!("sampler: task {task:?}");

            match task {
                SamplerTask::Quit => {
                    self.stop_all();
                    break;
                }
                SamplerTask::Stop => {
                    self.stop_all();
                    self.ctl.status.set(SamplerStatus::Idle);
                }
                SamplerTask::ProfilingStart => self.profiling_start(),
                SamplerTask::ProfilingSmpl { use_primary } => self.profiling_smpl(use_primary),
                SamplerTask::ProfilingPartpause { keep } => self.profiling_partpause(keep),
                SamplerTask::ProfilingRestore { keep } => self.profiling_restore(keep),
                SamplerTask::LlStart => self.ll_start(),
                SamplerTask::LlSmpl { pid, tid } => self.ll_smpl(pid, tid),
                SamplerTask::PqosStart { pid, tid, flags } => self.pqos_start(pid, tid, flags),
                SamplerTask::PqosSmpl { pid, tid } => self.pqos_smpl(pid, tid),
                SamplerTask::PqosStop { pid, tid } => self.pqos_stop(pid, tid),
                SamplerTask::UncoreStart { nid } => self.uncore_start(nid),
                SamplerTask::UncoreSmpl { nid } => self.uncore_smpl(nid),
                SamplerTask::UncoreStop { nid } => self.uncore_stop(nid),
            }
        }

        log::debug!("sampler thread is exiting");
    }

    fn now_ms(&self) -> u64 {
        self.ctl.timebase.current_ms()
    }

    fn sessions_free(&mut self) {
        let _ = self.topo.cpu_traverse(
            |cpu, _| {
                cpu.session.free();
                Ok(())
            },
            false,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
        );
    }

    fn stop_all(&mut self) {
        if self.profiling_open || self.ll_open {
            let _ = self.topo.cpu_traverse(
                |cpu, _| {
                    let _ = cpu.session.all_stop();
                    cpu.session.free();
                    Ok(())
                },
                false,
                None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
            );
            self.profiling_open = false;
            self.ll_open = false;
        }

        // Tear any remaining monitoring groups down.
        self.registry.for_each(|proc| proc.pqos_clear(0));

        self.topo.with_nodes(|inner| {
            for node in inner.nodes.iter_mut() {
                uncore::free(&mut node.qpi);
                uncore::free(&mut node.imc);
            }
        });

        self.partpause = false;
    }

    fn profiling_start(&mut self) {
        if self.profiling_open {
            self.ctl.status.set(SamplerStatus::ProfilingStarted);
            log::debug!("sampler: profiling already started");
            return;
        }

        self.stop_all();
        self.registry.ll_clear(0);

        let conf = self.conf;
        let pages = self.precision.ring_pages();
        let setup = self.topo.cpu_traverse(
            |cpu, _| {
                cpu.session = CpuSession::setup_profiling(cpu.cpuid as u32, &conf, pages)?;
                cpu.session.all_start()?;
                Ok(())
            },
            true,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
        );

        match setup {
            Ok(()) => {
                self.profiling_open = true;
                self.last_ms = self.now_ms();
                self.ctl.status.set(SamplerStatus::ProfilingStarted);
                log::debug!("sampler: profiling started");
            }
            Err(err) => {
                log::debug!("sampler: profiling start failed: {err}");
                self.sessions_free();
                self.ctl.status.set(SamplerStatus::ProfilingFailed);
            }
        }
    }

    fn profiling_smpl(&mut self, use_primary: bool) {
        if !self.profiling_open {
            if use_primary {
                self.disp.profiling_data_fail();
            } else {
                self.disp.flag2_set(crate::ui::display::DispFlag::ProfilingDataFail);
            }
            return;
        }

        let intval_ms = self.now_ms().saturating_sub(self.last_ms).max(1);
        self.registry.enum_update(0, self.topo.cpu_slots());
        self.registry.intval_update(intval_ms);
        self.topo.intval_update(intval_ms);
        self.registry.callchain_clear();
        self.registry.profiling_clear();
        self.topo.profiling_clear();

        let registry = self.registry.clone();
        let periods = self.periods;
        let partpause = self.partpause;
        let rec_buf = &mut self.rec_buf;
        let conf = self.conf;
        let pages = self.precision.ring_pages();

        let _ = self.topo.cpu_traverse(
            |cpu, ctx| {
                cpu.session.read_counting(rec_buf);
                let cpu_idx = cpu.cpuid as usize;
                attribute_counting(
                    rec_buf,
                    &mut cpu.session.last,
                    cpu_idx,
                    ctx.node_counts,
                    (ctx.cpuid_max + 1).max(1) as usize,
                    &registry,
                    &periods,
                    partpause,
                );
                Ok(())
            },
            false,
            Some(|cpu: &mut CpuSlot, _: &mut TraverseCtx| {
                cpu.session = CpuSession::setup_profiling(cpu.cpuid as u32, &conf, pages)?;
                cpu.session.all_start()?;
                Ok(())
            }),
        );

        self.last_ms = self.now_ms();
        self.ctl
            .last_sample_ms
            .store(self.last_ms, Ordering::Relaxed);

        if use_primary {
            self.disp.profiling_data_ready(intval_ms);
        } else {
            self.disp.flag2_set(crate::ui::display::DispFlag::ProfilingDataReady);
        }
    }

    fn profiling_partpause(&mut self, keep: CounterId) {
        let _ = self.topo.cpu_traverse(
            |cpu, _| {
                if keep == CounterId::CoreClk {
                    let _ = cpu.session.all_stop();
                } else {
                    for id in CounterId::ALL.into_iter().skip(1) {
                        if id == keep {
                            let _ = cpu.session.start(id);
                        } else {
                            let _ = cpu.session.stop(id);
                        }
                    }
                }
                Ok(())
            },
            false,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
        );

        self.partpause = true;
        self.ctl.status.set(SamplerStatus::ProfilingPartStarted);
    }

    fn profiling_restore(&mut self, keep: CounterId) {
        self.registry.callchain_clear();
        self.registry.profiling_clear();

        let _ = self.topo.cpu_traverse(
            |cpu, _| {
                if keep == CounterId::CoreClk {
                    let _ = cpu.session.all_start();
                } else {
                    let _ = cpu.session.stop(keep);
                    cpu.session.discard_ring();
                    for id in CounterId::ALL.into_iter().skip(1) {
                        let _ = cpu.session.start(id);
                    }
                }
                Ok(())
            },
            false,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
        );

        self.partpause = false;
        self.last_ms = self.now_ms();
        self.ctl.status.set(SamplerStatus::ProfilingStarted);
    }

    fn ll_start(&mut self) {
        if self.ll_open {
            self.ctl.status.set(SamplerStatus::LlStarted);
            return;
        }

        let Some(ll_conf) = self.ll_conf else {
            log::debug!("sampler: no load-latency event on this platform");
            self.ctl.status.set(SamplerStatus::LlFailed);
            return;
        };

        self.stop_all();
        self.registry.callchain_clear();
        self.registry.profiling_clear();
        self.topo.profiling_clear();

        let pages = self.precision.ring_pages();
        let setup = self.topo.cpu_traverse(
            |cpu, _| {
                cpu.session = CpuSession::setup_latency(cpu.cpuid as u32, &ll_conf, pages)?;
                cpu.session.all_start()?;
                Ok(())
            },
            true,
            None::<fn(&mut CpuSlot, &mut TraverseCtx) -> Result<()>>,
        );

        match setup {
            Ok(()) => {
                self.ll_open = true;
                self.last_ms = self.now_ms();
                self.ctl.status.set(SamplerStatus::LlStarted);
                log::debug!("sampler: load-latency started");
            }
            Err(err) => {
                // Old kernels or unsupported PMUs land here.
                log::debug!("sampler: load-latency start failed: {err}");
                self.sessions_free();
                self.ctl.status.set(SamplerStatus::LlFailed);
            }
        }
    }

    fn ll_smpl(&mut self, pid: i32, tid: i32) {
        if !self.ll_open {
            self.disp.ll_data_fail();
            return;
        }

        let intval_ms = self.now_ms().saturating_sub(self.last_ms).max(1);
        self.registry.enum_update(0, self.topo.cpu_slots());
        self.registry.intval_update(intval_ms);
        self.registry.ll_clear(0);

        let registry = self.registry.clone();
        let ll_buf = &mut self.ll_buf;
        let ll_conf = self.ll_conf;
        let pages = self.precision.ring_pages();

        let _ = self.topo.cpu_traverse(
            |cpu, _| {
                cpu.session.read_latency(ll_buf);
                attribute_latency(ll_buf, pid, tid, &registry);
                Ok(())
            },
            false,
            Some(move |cpu: &mut CpuSlot, _: &mut TraverseCtx| {
                if let Some(conf) = ll_conf {
                    cpu.session = CpuSession::setup_latency(cpu.cpuid as u32, &conf, pages)?;
                    cpu.session.all_start()?;
                }
                Ok(())
            }),
        );

        self.last_ms = self.now_ms();
        self.ctl
            .last_sample_ms
            .store(self.last_ms, Ordering::Relaxed);
        self.disp.ll_data_ready(intval_ms);
    }

    fn pqos_start(&mut self, pid: i32, tid: i32, flags: u32) {
        let result = self.pqos_attach(pid, tid, flags);
        match result {
            Ok(()) => self.ctl.status.set(SamplerStatus::PqosStarted),
            Err(err) => {
                log::debug!("sampler: pqos start failed for {pid}/{tid}: {err}");
                self.ctl.status.set(SamplerStatus::PqosFailed);
            }
        }
    }

    fn pqos_attach(&mut self, pid: i32, tid: i32, flags: u32) -> Result<()> {
        if !pqos::resctrl_mounted() {
            return Err(Error::ResctrlUnavailable);
        }

        if pid == 0 {
            // Whole-machine: one group per known process, best effort.
            self.registry.for_each(|proc| {
                if let Ok(pqos) = pqos::task_setup(proc.pid, 0, flags) {
                    proc.inner.lock().pqos = Some(pqos);
                }
            });
            return Ok(());
        }

        let proc = self.registry.find(pid).ok_or(Error::ProcessGone(pid))?;
        let pqos = pqos::task_setup(pid, tid, flags)?;
        if tid == 0 {
            proc.inner.lock().pqos = Some(pqos);
        } else {
            let thread = proc.thread_find(tid).ok_or(Error::ProcessGone(tid))?;
            thread.inner.lock().pqos = Some(pqos);
            proc.inner.lock().thread_pqosed = true;
        }

        Ok(())
    }

    fn pqos_smpl(&mut self, pid: i32, tid: i32) {
        self.registry.enum_update(0, self.topo.cpu_slots());

        if pid == 0 {
            self.registry.for_each(|proc| {
                let mut inner = proc.inner.lock();
                if let Some(pqos) = inner.pqos.as_mut() {
                    pqos::task_sample(pqos);
                }
            });
        } else if let Some(proc) = self.registry.find(pid) {
            if tid == 0 {
                let mut inner = proc.inner.lock();
                if let Some(pqos) = inner.pqos.as_mut() {
                    pqos::task_sample(pqos);
                }
            } else if let Some(thread) = proc.thread_find(tid) {
                let mut inner = thread.inner.lock();
                if let Some(pqos) = inner.pqos.as_mut() {
                    pqos::task_sample(pqos);
                }
            }
        } else {
            self.disp.pqos_data_ready(0);
            return;
        }

        let intval_ms = self.now_ms().saturating_sub(self.last_ms_pqos).max(1);
        self.last_ms_pqos = self.now_ms();
        self.disp.pqos_data_ready(intval_ms);
    }

    fn pqos_stop(&mut self, pid: i32, tid: i32) {
        if pid == 0 {
            self.registry.for_each(|proc| proc.pqos_clear(0));
        } else if let Some(proc) = self.registry.find(pid) {
            proc.pqos_clear(tid);
        }

        if self.ctl.status.get() == SamplerStatus::PqosStarted {
            let next = if self.profiling_open {
                SamplerStatus::ProfilingStarted
            } else {
                SamplerStatus::Idle
            };
            self.ctl.status.set(next);
        }
    }

    fn uncore_start(&mut self, nid: i32) {
        let result = self.topo.with_nodes(|inner| {
            let node = inner
                .nodes
                .get_mut(nid as usize)
                .filter(|n| n.is_valid())
                .ok_or(Error::UncoreOpen {
                    nid,
                    source: std::io::ErrorKind::NotFound.into(),
                })?;
            let cpu = node.first_cpu().ok_or(Error::UncoreOpen {
                nid,
                source: std::io::ErrorKind::NotFound.into(),
            })?;

            uncore::setup(&mut node.qpi, nid, cpu)?;
            if let Err(err) = uncore::setup(&mut node.imc, nid, cpu) {
                uncore::free(&mut node.qpi);
                return Err(err);
            }

            uncore::start(&node.qpi);
            uncore::start(&node.imc);
            Ok(())
        });

        match result {
            Ok(()) => {
                self.last_ms = self.now_ms();
                self.ctl.status.set(SamplerStatus::UncoreStarted);
            }
            Err(err) => {
                log::debug!("sampler: uncore start failed for node {nid}: {err}");
                self.ctl.status.set(SamplerStatus::UncoreFailed);
            }
        }
    }

    fn uncore_smpl(&mut self, nid: i32) {
        let intval_ms = self.now_ms().saturating_sub(self.last_ms).max(1);
        let result = self.topo.with_nodes(|inner| {
            let node = inner
                .nodes
                .get_mut(nid as usize)
                .filter(|n| n.is_valid())
                .ok_or(Error::SamplingFailed)?;
            uncore::sample(&mut node.qpi)?;
            uncore::sample(&mut node.imc)?;
            Ok::<(), Error>(())
        });

        self.last_ms = self.now_ms();
        self.ctl
            .last_sample_ms
            .store(self.last_ms, Ordering::Relaxed);

        match result {
            Ok(()) => self.disp.profiling_data_ready(intval_ms),
            Err(_) => self.disp.profiling_data_fail(),
        }
    }

    fn uncore_stop(&mut self, nid: i32) {
        self.topo.with_nodes(|inner| {
            for node in inner.nodes.iter_mut() {
                if nid < 0 || node.nid == nid {
                    uncore::free(&mut node.qpi);
                    uncore::free(&mut node.imc);
                }
            }
        });
    }
}

/// Fan one CPU's drained records into the data model. The first record
/// seeds the per-CPU baseline; each later record contributes non-negative
/// deltas to the process, its thread, and the node, plus a call-chain
/// record per counter whose delta crossed the overflow threshold. With
/// partpause in force only the chains are collected, so partial samples
/// cannot skew the ratios.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attribute_counting(
    records: &[CountingRecord],
    session_last: &mut CountVals,
    cpu: usize,
    node_counts: &mut CountVals,
    cpu_slots: usize,
    registry: &Registry,
    periods: &[u64; COUNTER_NUM],
    partpause: bool,
) {
    if records.is_empty() {
        return;
    }

    *session_last = records[0].counts;

    for record in &records[1..] {
        let mut diff = CountVals::default();
        for id in CounterId::ALL {
            let j = id.index();
            let new = record.counts.counts[j];
            let last = session_last.counts[j];
            diff.counts[j] = new.saturating_sub(last);
            session_last.counts[j] = new;
        }

        // A pid can vanish between the registry refresh and this drain;
        // its records are unattributable, the rest of the batch is not.
        let Some(proc) = registry.find(record.pid as i32) else {
            continue;
        };
        let Some(thread) = proc.thread_find(record.tid as i32) else {
            continue;
        };

        // One record's updates are published atomically with respect to
        // readers of the process.
        let mut pi = proc.inner.lock();
        let mut ti = thread.inner.lock();

        for id in CounterId::ALL {
            let j = id.index();
            let value = diff.counts[j];

            if !partpause {
                if cpu >= pi.countvals.len() {
                    pi.countvals.resize(cpu_slots.max(cpu + 1), CountVals::default());
                }
                pi.countvals[cpu].add(id, value);

                if cpu >= ti.countvals.len() {
                    ti.countvals.resize(cpu_slots.max(cpu + 1), CountVals::default());
                }
                ti.countvals[cpu].add(id, value);

                node_counts.add(id, value);
            }

            if !record.ips.is_empty() && value >= periods[j] {
                pi.chains[j].push(ChainRecord {
                    count_value: value,
                    ips: record.ips.clone(),
                });
                ti.chains[j].push(ChainRecord {
                    count_value: value,
                    ips: record.ips.clone(),
                });
            }
        }
    }
}

/// Attribute latency records to the (process, thread) each one names,
/// honouring the task's pid/tid filter.
pub(crate) fn attribute_latency(
    records: &[LatencyRecord],
    filter_pid: i32,
    filter_tid: i32,
    registry: &Registry,
) {
    for record in records {
        if filter_pid != 0 && filter_pid != record.pid as i32 {
            continue;
        }
        if filter_pid != 0 && filter_tid != 0 && filter_tid != record.tid as i32 {
            continue;
        }

        let Some(proc) = registry.find(record.pid as i32) else {
            continue;
        };
        let Some(thread) = proc.thread_find(record.tid as i32) else {
            continue;
        };

        let mut pi = proc.inner.lock();
        let mut ti = thread.inner.lock();
        pi.llrecs.push(record.clone());
        ti.llrecs.push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::UiCountId;
    use crate::topo::Topology;

    fn registry_with(pids: &[i32]) -> Registry {
        let registry = Registry::new();
        registry.reconcile_with(pids, &|p| format!("p{p}"), &|p| vec![p], 2);
        registry
    }

    fn record(pid: u32, tid: u32, counts: [u64; COUNTER_NUM], ips: &[u64]) -> CountingRecord {
        CountingRecord {
            pid,
            tid,
            counts: CountVals { counts },
            ips: ips.to_vec(),
        }
    }

    #[test]
    fn deltas_are_baselined_and_monotonic() {
        // Scenario: group {CLK, RMA}, three samples for pid 100.
        let registry = registry_with(&[100]);
        let topo = Topology::for_test(&[(0, &[0])]);
        let mut last = CountVals::default();
        let mut node_counts = CountVals::default();

        // CLK lives at slot 2, RMA at slot 1.
        let records = vec![
            record(100, 100, [0, 10, 1_000_000, 0, 0], &[0x400100]),
            record(100, 100, [0, 21, 2_000_000, 0, 0], &[0x400100]),
            record(100, 100, [0, 33, 3_000_000, 0, 0], &[0x400200]),
        ];

        let mut periods = [u64::MAX; COUNTER_NUM];
        periods[CounterId::Rma.index()] = 10;
        periods[CounterId::Clk.index()] = 1_000_000;

        attribute_counting(
            &records,
            &mut last,
            0,
            &mut node_counts,
            1,
            &registry,
            &periods,
            false,
        );

        let proc = registry.find(100).unwrap();
        let inner = proc.inner.lock();
        let map = topo.cpu_map_snapshot();
        assert_eq!(
            map.countval_sum(&inner.countvals, None, UiCountId::Clk),
            2_000_000
        );
        assert_eq!(map.countval_sum(&inner.countvals, None, UiCountId::Rma), 23);
        assert_eq!(inner.chains[CounterId::Rma.index()].len(), 2);
        assert_eq!(node_counts.get(CounterId::Clk), 2_000_000);

        // The session baseline tracks the last record.
        assert_eq!(last.get(CounterId::Clk), 3_000_000);
    }

    #[test]
    fn negative_delta_is_dropped_as_zero() {
        let registry = registry_with(&[100]);
        let mut last = CountVals::default();
        let mut node_counts = CountVals::default();

        let records = vec![
            record(100, 100, [0, 0, 5_000, 0, 0], &[]),
            // Counter went backwards: lost or reordered samples.
            record(100, 100, [0, 0, 4_000, 0, 0], &[]),
            record(100, 100, [0, 0, 4_500, 0, 0], &[]),
        ];

        attribute_counting(
            &records,
            &mut last,
            0,
            &mut node_counts,
            1,
            &registry,
            &[u64::MAX; COUNTER_NUM],
            false,
        );

        assert_eq!(node_counts.get(CounterId::Clk), 500);
    }

    #[test]
    fn vanished_pid_mid_batch_does_not_drop_later_records() {
        // One CPU's drain interleaves every process scheduled there; a
        // pid that exited after the registry refresh must only lose its
        // own records.
        let registry = registry_with(&[100, 300]);
        let topo = Topology::for_test(&[(0, &[0])]);
        let mut last = CountVals::default();
        let mut node_counts = CountVals::default();

        let records = vec![
            record(100, 100, [0, 0, 1_000_000, 0, 0], &[]),
            // pid 200 is gone from the registry.
            record(200, 200, [0, 0, 1_500_000, 0, 0], &[0x400100]),
            record(300, 300, [0, 0, 2_100_000, 0, 0], &[0x400200]),
        ];

        let mut periods = [u64::MAX; COUNTER_NUM];
        periods[CounterId::Clk.index()] = 100_000;

        attribute_counting(
            &records,
            &mut last,
            0,
            &mut node_counts,
            1,
            &registry,
            &periods,
            false,
        );

        // pid 300's delta (against the unattributable record's readout)
        // still lands, with its call chain.
        let p300 = registry.find(300).unwrap();
        let inner = p300.inner.lock();
        let map = topo.cpu_map_snapshot();
        assert_eq!(
            map.countval_sum(&inner.countvals, None, UiCountId::Clk),
            600_000
        );
        assert_eq!(inner.chains[CounterId::Clk.index()].len(), 1);
        drop(inner);

        // Only the attributable delta reached the node accumulator, and
        // the per-CPU baseline advanced through the whole batch.
        assert_eq!(node_counts.get(CounterId::Clk), 600_000);
        assert_eq!(last.get(CounterId::Clk), 2_100_000);
    }

    #[test]
    fn partpause_collects_chains_without_counts() {
        let registry = registry_with(&[100]);
        let mut last = CountVals::default();
        let mut node_counts = CountVals::default();

        let records = vec![
            record(100, 100, [0, 0, 0, 0, 0], &[0x400100]),
            record(100, 100, [0, 500, 0, 0, 0], &[0x400100]),
        ];

        let mut periods = [u64::MAX; COUNTER_NUM];
        periods[CounterId::Rma.index()] = 100;

        attribute_counting(
            &records,
            &mut last,
            0,
            &mut node_counts,
            1,
            &registry,
            &periods,
            true,
        );

        let proc = registry.find(100).unwrap();
        let inner = proc.inner.lock();
        assert_eq!(node_counts.get(CounterId::Rma), 0);
        assert_eq!(inner.countvals[0].get(CounterId::Rma), 0);
        assert_eq!(inner.chains[CounterId::Rma.index()].len(), 1);
    }

    #[test]
    fn latency_filter_honours_pid_and_tid() {
        let registry = registry_with(&[100, 200]);
        let rec = |pid: u32, tid: u32| LatencyRecord {
            pid,
            tid,
            addr: 0x1000,
            cpu: 0,
            latency: 50,
            ips: vec![],
        };

        attribute_latency(&[rec(100, 100), rec(200, 200)], 100, 0, &registry);

        let p100 = registry.find(100).unwrap();
        let p200 = registry.find(200).unwrap();
        assert_eq!(p100.inner.lock().llrecs.len(), 1);
        assert_eq!(p200.inner.lock().llrecs.len(), 0);
    }

    #[test]
    fn latency_batch_survives_vanished_pid() {
        let registry = registry_with(&[100, 300]);
        let rec = |pid: u32, tid: u32| LatencyRecord {
            pid,
            tid,
            addr: 0x2000,
            cpu: 0,
            latency: 80,
            ips: vec![],
        };

        // pid 200 exited since the last enumeration; the records around
        // it still attribute.
        attribute_latency(
            &[rec(100, 100), rec(200, 200), rec(300, 300)],
            0,
            0,
            &registry,
        );

        let p100 = registry.find(100).unwrap();
        let p300 = registry.find(300).unwrap();
        assert_eq!(p100.inner.lock().llrecs.len(), 1);
        assert_eq!(p300.inner.lock().llrecs.len(), 1);

        let t300 = p300.thread_find(300).unwrap();
        assert_eq!(t300.inner.lock().llrecs.len(), 1);
    }

    #[test]
    fn mailbox_overwrites_single_slot() {
        let mailbox = Mailbox::new();
        mailbox.post(SamplerTask::ProfilingSmpl { use_primary: true });
        mailbox.post(SamplerTask::Stop);
        assert_eq!(mailbox.take(), SamplerTask::Stop);
    }

    #[test]
    fn status_wait_observes_failure() {
        let cell = StatusCell::new();
        cell.set(SamplerStatus::ProfilingFailed);
        assert!(matches!(
            cell.wait_for(SamplerStatus::ProfilingStarted),
            Err(Error::SamplingFailed)
        ));

        cell.set(SamplerStatus::ProfilingStarted);
        assert!(cell.wait_for(SamplerStatus::ProfilingStarted).is_ok());
    }
}
