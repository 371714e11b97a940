use std::io;
use std::os::unix::io::RawFd;

use byteorder::{ByteOrder, NativeEndian};

use super::ring::RingBuffer;
use super::sys::*;
use super::{CountVals, PerfConf, ProfilingConf, CounterId, COUNTER_NUM, IP_NUM};
use crate::error::{Error, Result};

const INVALID_FD: RawFd = -1;

/// One counting sample pulled off a ring: per-group counter readouts
/// (already multiplex-scaled) plus the user-space call chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountingRecord {
    pub pid: u32,
    pub tid: u32,
    pub counts: CountVals,
    pub ips: Vec<u64>,
}

/// One load-latency sample, passed through unaltered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LatencyRecord {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub cpu: u32,
    pub latency: u64,
    pub ips: Vec<u64>,
}

/// Multiplexing compensation: the kernel reports how long the event was
/// scheduled versus enabled; scale the raw count up accordingly.
pub fn scale(value: u64, time_enabled: u64, time_running: u64) -> u64 {
    if time_running > time_enabled {
        log::debug!("scale: time_running > time_enabled");
    }

    if time_running == 0 {
        return 0;
    }

    (value as f64 * time_enabled as f64 / time_running as f64) as u64
}

/// The kernel-visible counter session of one logical CPU: a counter group
/// whose leader owns the ring buffer, the other members redirected into it
/// via SET_OUTPUT. Touched only on the sampler thread.
pub struct CpuSession {
    cpu: u32,
    fds: [RawFd; COUNTER_NUM],
    map_base: *mut u8,
    map_len: usize,
    data_pages: usize,
    page_size: usize,
    pub last: CountVals,
}

unsafe impl Send for CpuSession {}

impl CpuSession {
    pub fn invalid(cpu: u32) -> Self {
        CpuSession {
            cpu,
            fds: [INVALID_FD; COUNTER_NUM],
            map_base: std::ptr::null_mut(),
            map_len: 0,
            data_pages: 0,
            page_size: 0,
            last: CountVals::default(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.map_base.is_null()
    }

    fn open_one(&mut self, idx: usize, attr: &PerfEventAttr) -> Result<()> {
        let group_fd = if idx == 0 { -1 } else { self.fds[0] };
        let fd = sys_perf_event_open(attr, -1, self.cpu as i32, group_fd, 0);
        if fd < 0 {
            return Err(Error::CounterOpen {
                cpu: self.cpu,
                source: io::Error::last_os_error(),
            });
        }

        self.fds[idx] = fd;
        Ok(())
    }

    fn map_ring(&mut self, data_pages: usize) -> Result<()> {
        let page_size = crate::util::page_size();
        let len = (data_pages + 1) * page_size;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fds[0],
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::RingMap {
                cpu: self.cpu,
                source: io::Error::last_os_error(),
            });
        }

        self.map_base = base as *mut u8;
        self.map_len = len;
        self.data_pages = data_pages;
        self.page_size = page_size;
        Ok(())
    }

    /// Open the full profiling group. On any failure every descriptor
    /// already opened for this CPU is released and the session stays
    /// invalid.
    pub fn setup_profiling(
        cpu: u32,
        conf: &ProfilingConf,
        data_pages: usize,
    ) -> Result<CpuSession> {
        let mut session = CpuSession::invalid(cpu);

        for (idx, cfg) in conf.counters.iter().enumerate() {
            if !cfg.is_valid() {
                // The table keeps invalid slots at the tail.
                break;
            }

            let mut attr = PerfEventAttr::zeroed();
            attr.kind = cfg.typ;
            attr.config = cfg.config;
            attr.bp_addr_or_config1 = cfg.config1;
            attr.sample_period_or_freq = cfg.sample_period;
            attr.sample_type = PERF_SAMPLE_TID | PERF_SAMPLE_READ | PERF_SAMPLE_CALLCHAIN;
            attr.read_format = PERF_FORMAT_GROUP
                | PERF_FORMAT_TOTAL_TIME_ENABLED
                | PERF_FORMAT_TOTAL_TIME_RUNNING;
            if idx == 0 {
                attr.flags |= PERF_ATTR_FLAG_DISABLED;
            }

            log::trace!(
                "cpu{cpu}: open counter {idx}, type {:#x}, config {:#x}, config1 {:#x}",
                cfg.typ,
                cfg.config,
                cfg.config1
            );

            if let Err(err) = session.open_one(idx, &attr) {
                session.free();
                return Err(err);
            }

            if idx == 0 {
                if let Err(err) = session.map_ring(data_pages) {
                    session.free();
                    return Err(err);
                }
            } else {
                let ret = unsafe {
                    libc::ioctl(session.fds[idx], PERF_EVENT_IOC_SET_OUTPUT as _, session.fds[0])
                };
                if ret != 0 {
                    let err = Error::CounterOpen {
                        cpu,
                        source: io::Error::last_os_error(),
                    };
                    session.free();
                    return Err(err);
                }
            }
        }

        Ok(session)
    }

    /// Open a precise load-latency session (single counter, own ring).
    pub fn setup_latency(cpu: u32, conf: &PerfConf, data_pages: usize) -> Result<CpuSession> {
        let mut session = CpuSession::invalid(cpu);

        let mut attr = PerfEventAttr::zeroed();
        attr.kind = conf.typ;
        attr.config = conf.config;
        attr.bp_addr_or_config1 = conf.config1;
        attr.sample_period_or_freq = conf.sample_period;
        attr.sample_type = PERF_SAMPLE_TID
            | PERF_SAMPLE_ADDR
            | PERF_SAMPLE_CPU
            | PERF_SAMPLE_WEIGHT
            | PERF_SAMPLE_CALLCHAIN;
        attr.flags |= PERF_ATTR_FLAG_DISABLED
            | PERF_ATTR_FLAG_EXCLUDE_GUEST
            | (1 << PERF_ATTR_PRECISE_IP_SHIFT);

        session.open_one(0, &attr)?;
        if let Err(err) = session.map_ring(data_pages) {
            session.free();
            return Err(err);
        }

        Ok(session)
    }

    fn ioctl_counter(&self, idx: usize, request: libc::c_ulong) -> Result<()> {
        if self.fds[idx] == INVALID_FD {
            return Ok(());
        }

        let ret = unsafe { libc::ioctl(self.fds[idx], request as _, 0) };
        if ret != 0 {
            return Err(Error::CounterOpen {
                cpu: self.cpu,
                source: io::Error::last_os_error(),
            });
        }

        Ok(())
    }

    pub fn start(&self, id: CounterId) -> Result<()> {
        self.ioctl_counter(id.index(), PERF_EVENT_IOC_ENABLE)
    }

    pub fn stop(&self, id: CounterId) -> Result<()> {
        self.ioctl_counter(id.index(), PERF_EVENT_IOC_DISABLE)
    }

    /// Enabling the group leader starts the whole group.
    pub fn all_start(&self) -> Result<()> {
        self.ioctl_counter(0, PERF_EVENT_IOC_ENABLE)
    }

    pub fn all_stop(&self) -> Result<()> {
        self.ioctl_counter(0, PERF_EVENT_IOC_DISABLE)
    }

    fn ring(&mut self) -> RingBuffer {
        unsafe { RingBuffer::new(self.map_base, self.data_pages, self.page_size) }
    }

    /// Drain counting samples. `out` is cleared first; records naming the
    /// kernel/idle task are consumed but not reported.
    pub fn read_counting(&mut self, out: &mut Vec<CountingRecord>) {
        out.clear();
        if !self.is_valid() {
            return;
        }

        let mut ring = self.ring();
        drain_records(&mut ring, |ring, size| {
            if let Some(rec) = parse_counting_sample(ring, size) {
                if rec.pid != 0 && rec.tid != 0 {
                    out.push(rec);
                }
                true
            } else {
                false
            }
        });
    }

    /// Discard everything currently in the ring.
    pub fn discard_ring(&mut self) {
        if !self.is_valid() {
            return;
        }

        self.ring().reset();
    }

    /// Drain load-latency samples.
    pub fn read_latency(&mut self, out: &mut Vec<LatencyRecord>) {
        out.clear();
        if !self.is_valid() {
            return;
        }

        let mut ring = self.ring();
        drain_records(&mut ring, |ring, size| {
            if let Some(rec) = parse_latency_sample(ring, size) {
                if rec.pid != 0 && rec.tid != 0 {
                    out.push(rec);
                }
                true
            } else {
                false
            }
        });
    }

    pub fn free(&mut self) {
        for fd in self.fds.iter_mut() {
            if *fd != INVALID_FD {
                unsafe { libc::close(*fd) };
                *fd = INVALID_FD;
            }
        }

        if !self.map_base.is_null() {
            unsafe { libc::munmap(self.map_base as *mut libc::c_void, self.map_len) };
            self.map_base = std::ptr::null_mut();
            self.map_len = 0;
        }
    }
}

impl Drop for CpuSession {
    fn drop(&mut self) {
        self.free();
    }
}

/// Walk record headers, dispatching sample records to `on_sample` and
/// skipping everything else. A malformed header resets the ring; a parse
/// failure ends the drain.
fn drain_records(
    ring: &mut RingBuffer,
    mut on_sample: impl FnMut(&mut RingBuffer, usize) -> bool,
) {
    loop {
        let mut hdr_buf = [0u8; PERF_EVENT_HEADER_SIZE];
        if !ring.read_exact(&mut hdr_buf) {
            return;
        }

        let kind = NativeEndian::read_u32(&hdr_buf[0..4]);
        let total = NativeEndian::read_u16(&hdr_buf[6..8]) as usize;
        if total <= PERF_EVENT_HEADER_SIZE {
            ring.reset();
            return;
        }

        let size = total - PERF_EVENT_HEADER_SIZE;
        if kind == PERF_RECORD_SAMPLE {
            if !on_sample(ring, size) {
                return;
            }
        } else {
            ring.skip(size);
        }
    }
}

struct FieldReader<'a> {
    ring: &'a mut RingBuffer,
    remaining: usize,
}

impl<'a> FieldReader<'a> {
    fn new(ring: &'a mut RingBuffer, size: usize) -> Self {
        FieldReader { ring, remaining: size }
    }

    fn u32_pair(&mut self) -> Option<(u32, u32)> {
        let mut buf = [0u8; 8];
        if !self.ring.read_exact(&mut buf) {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(8);
        Some((
            NativeEndian::read_u32(&buf[0..4]),
            NativeEndian::read_u32(&buf[4..8]),
        ))
    }

    fn u64(&mut self) -> Option<u64> {
        let mut buf = [0u8; 8];
        if !self.ring.read_exact(&mut buf) {
            return None;
        }
        self.remaining = self.remaining.saturating_sub(8);
        Some(NativeEndian::read_u64(&buf))
    }

    /// Consume whatever the parser did not: stale kernel-side fields of a
    /// known record are skipped, keeping the stream aligned.
    fn finish(self) {
        if self.remaining > 0 {
            log::debug!("sample read: skipping {} trailing bytes", self.remaining);
            self.ring.skip(self.remaining);
        }
    }
}

/// Counting-sample layout for this group configuration:
///
/// ```text
/// { u32 pid, tid; }
/// { u64 nr; }
/// { u64 time_enabled; }
/// { u64 time_running; }
/// { u64 cntr[nr]; }
/// { u64 chain_nr; }
/// { u64 ips[chain_nr]; }
/// ```
pub(crate) fn parse_counting_sample(
    ring: &mut RingBuffer,
    size: usize,
) -> Option<CountingRecord> {
    let mut reader = FieldReader::new(ring, size);
    let rec = read_counting_fields(&mut reader);
    reader.finish();
    rec
}

fn read_counting_fields(reader: &mut FieldReader) -> Option<CountingRecord> {
    let mut rec = CountingRecord::default();

    let (pid, tid) = reader.u32_pair()?;
    let nr = reader.u64()?;
    let time_enabled = reader.u64()?;
    let time_running = reader.u64()?;

    for i in 0..nr {
        let value = reader.u64()?;
        if (i as usize) < COUNTER_NUM {
            rec.counts.counts[i as usize] = scale(value, time_enabled, time_running);
        }
    }

    let chain_nr = reader.u64()?;
    for _ in 0..chain_nr {
        let ip = reader.u64()?;
        if rec.ips.len() < IP_NUM && is_userspace(ip) {
            rec.ips.push(ip);
        }
    }

    rec.pid = pid;
    rec.tid = tid;
    Some(rec)
}

/// Latency-sample layout:
///
/// ```text
/// { u32 pid, tid; }
/// { u64 addr; }
/// { u64 cpu; }
/// { u64 chain_nr; }
/// { u64 ips[chain_nr]; }
/// { u64 weight; }
/// ```
pub(crate) fn parse_latency_sample(ring: &mut RingBuffer, size: usize) -> Option<LatencyRecord> {
    let mut reader = FieldReader::new(ring, size);
    let rec = read_latency_fields(&mut reader);
    reader.finish();
    rec
}

fn read_latency_fields(reader: &mut FieldReader) -> Option<LatencyRecord> {
    let mut rec = LatencyRecord::default();

    let (pid, tid) = reader.u32_pair()?;
    let addr = reader.u64()?;
    let cpu = reader.u64()?;
    let chain_nr = reader.u64()?;
    for _ in 0..chain_nr {
        let ip = reader.u64()?;
        if rec.ips.len() < IP_NUM && is_userspace(ip) {
            rec.ips.push(ip);
        }
    }
    let weight = reader.u64()?;

    rec.pid = pid;
    rec.tid = tid;
    rec.addr = addr;
    rec.cpu = cpu as u32;
    rec.latency = weight;
    Some(rec)
}

#[cfg(test)]
mod tests {
    use super::super::ring::tests::TestRing;
    use super::*;

    fn put_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_ne_bytes());
    }

    pub(crate) fn push_counting_sample(
        ring: &mut TestRing,
        pid: u32,
        tid: u32,
        counts: &[u64],
        time_enabled: u64,
        time_running: u64,
        ips: &[u64],
    ) {
        let mut body = Vec::new();
        put_u32(&mut body, pid);
        put_u32(&mut body, tid);
        put_u64(&mut body, counts.len() as u64);
        put_u64(&mut body, time_enabled);
        put_u64(&mut body, time_running);
        for c in counts {
            put_u64(&mut body, *c);
        }
        put_u64(&mut body, ips.len() as u64);
        for ip in ips {
            put_u64(&mut body, *ip);
        }

        let mut rec = Vec::new();
        put_u32(&mut rec, PERF_RECORD_SAMPLE);
        rec.extend_from_slice(&0u16.to_ne_bytes());
        rec.extend_from_slice(&((body.len() + PERF_EVENT_HEADER_SIZE) as u16).to_ne_bytes());
        rec.extend_from_slice(&body);
        ring.push(&rec);
    }

    fn push_latency_sample(
        ring: &mut TestRing,
        pid: u32,
        tid: u32,
        addr: u64,
        cpu: u64,
        ips: &[u64],
        weight: u64,
    ) {
        let mut body = Vec::new();
        put_u32(&mut body, pid);
        put_u32(&mut body, tid);
        put_u64(&mut body, addr);
        put_u64(&mut body, cpu);
        put_u64(&mut body, ips.len() as u64);
        for ip in ips {
            put_u64(&mut body, *ip);
        }
        put_u64(&mut body, weight);

        let mut rec = Vec::new();
        put_u32(&mut rec, PERF_RECORD_SAMPLE);
        rec.extend_from_slice(&0u16.to_ne_bytes());
        rec.extend_from_slice(&((body.len() + PERF_EVENT_HEADER_SIZE) as u16).to_ne_bytes());
        rec.extend_from_slice(&body);
        ring.push(&rec);
    }

    #[test]
    fn scaling_compensates_multiplexing() {
        assert_eq!(scale(100, 1000, 500), 200);
        assert_eq!(scale(100, 1000, 0), 0);
        // time_running > time_enabled: taken at face value.
        assert_eq!(scale(100, 500, 1000), 50);
    }

    #[test]
    fn counting_sample_parses_and_scales() {
        let mut ring = TestRing::new(1);
        push_counting_sample(
            &mut ring,
            100,
            100,
            &[100, 40, 0, 0, 0],
            1000,
            500,
            &[0x400123, 0xffff_ffff_8100_0000, 0x400456],
        );

        let mut reader = ring.reader();
        let mut parsed = Vec::new();
        drain_records(&mut reader, |r, size| {
            parsed.extend(parse_counting_sample(r, size));
            true
        });

        assert_eq!(parsed.len(), 1);
        let rec = &parsed[0];
        assert_eq!(rec.pid, 100);
        assert_eq!(rec.counts.counts[0], 200);
        assert_eq!(rec.counts.counts[1], 80);
        // Only user-space IPs survive.
        assert_eq!(rec.ips, vec![0x400123, 0x400456]);
    }

    #[test]
    fn latency_sample_passes_through() {
        let mut ring = TestRing::new(1);
        push_latency_sample(&mut ring, 7, 8, 0x4000_1000, 3, &[0x400abc], 321);

        let mut reader = ring.reader();
        let mut parsed = Vec::new();
        drain_records(&mut reader, |r, size| {
            parsed.extend(parse_latency_sample(r, size));
            true
        });

        assert_eq!(
            parsed,
            vec![LatencyRecord {
                pid: 7,
                tid: 8,
                addr: 0x4000_1000,
                cpu: 3,
                latency: 321,
                ips: vec![0x400abc],
            }]
        );
    }

    #[test]
    fn non_sample_records_are_skipped() {
        let mut ring = TestRing::new(1);

        let mut throttle = Vec::new();
        put_u32(&mut throttle, PERF_RECORD_THROTTLE);
        throttle.extend_from_slice(&0u16.to_ne_bytes());
        throttle.extend_from_slice(&24u16.to_ne_bytes());
        throttle.extend_from_slice(&[0u8; 16]);
        ring.push(&throttle);

        push_counting_sample(&mut ring, 9, 9, &[1, 2, 3, 4, 5], 10, 10, &[]);

        let mut reader = ring.reader();
        let mut parsed = Vec::new();
        drain_records(&mut reader, |r, size| {
            parsed.extend(parse_counting_sample(r, size));
            true
        });

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].counts.counts[4], 5);
    }
}
