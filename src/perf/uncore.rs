use std::fs;
use std::io;
use std::os::unix::io::RawFd;

use super::counter::scale;
use super::sys::*;
use crate::error::{Error, Result};

const INVALID_FD: RawFd = -1;
const UNCORE_DEV_MAX: usize = 16;

/// One uncore PMU counter: an interconnect link or a memory-controller
/// channel of one node. The raw readout is `{value, time_enabled,
/// time_running}`; each sample stores the scaled delta.
pub struct UncoreCounter {
    pub id: usize,
    pub typ: u32,
    pub config: u64,
    pub fd: RawFd,
    pub values: [u64; 3],
    pub value_scaled: u64,
}

impl UncoreCounter {
    fn new(id: usize, typ: u32, config: u64) -> Self {
        UncoreCounter {
            id,
            typ,
            config,
            fd: INVALID_FD,
            values: [0; 3],
            value_scaled: 0,
        }
    }

    pub fn free(&mut self) {
        if self.fd != INVALID_FD {
            unsafe { libc::close(self.fd) };
            self.fd = INVALID_FD;
        }
        self.value_scaled = 0;
        self.values = [0; 3];
    }
}

impl Drop for UncoreCounter {
    fn drop(&mut self) {
        self.free();
    }
}

fn discover(prefix: &str, config: u64) -> Vec<UncoreCounter> {
    let mut out = Vec::new();
    for i in 0..UNCORE_DEV_MAX {
        let path = format!("/sys/devices/{prefix}_{i}/type");
        let Ok(content) = fs::read_to_string(&path) else {
            break;
        };
        let Ok(typ) = content.trim().parse::<u32>() else {
            break;
        };

        out.push(UncoreCounter::new(i, typ, config));
    }

    out
}

/// Interconnect-link PMUs: QPI on older parts, UPI on newer ones. The
/// configs select the data-flit counting events.
pub fn discover_qpi() -> Vec<UncoreCounter> {
    let qpi = discover("uncore_qpi", 0x600);
    if !qpi.is_empty() {
        return qpi;
    }

    discover("uncore_upi", 0x0f02)
}

/// Memory-controller PMUs; 0xff04 counts all CAS operations.
pub fn discover_imc() -> Vec<UncoreCounter> {
    discover("uncore_imc", 0xff04)
}

/// Open every counter of the set on one of the node's CPUs. On failure
/// the whole set is released.
pub fn setup(counters: &mut [UncoreCounter], nid: i32, cpu: i32) -> Result<()> {
    for counter in counters.iter_mut() {
        if counter.typ == 0 {
            continue;
        }

        counter.values = [0; 3];
        counter.value_scaled = 0;

        let mut attr = PerfEventAttr::zeroed();
        attr.kind = counter.typ;
        attr.config = counter.config;
        attr.flags = PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_INHERIT;
        attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;

        let fd = sys_perf_event_open(&attr, -1, cpu, -1, 0);
        if fd < 0 {
            let err = Error::UncoreOpen {
                nid,
                source: io::Error::last_os_error(),
            };
            free(counters);
            return Err(err);
        }

        log::debug!(
            "uncore setup: node {nid}, dev {}, type {}, config {:#x}, fd {fd}",
            counter.id,
            counter.typ,
            counter.config
        );
        counter.fd = fd;
    }

    Ok(())
}

pub fn start(counters: &[UncoreCounter]) {
    for counter in counters {
        if counter.fd != INVALID_FD {
            unsafe { libc::ioctl(counter.fd, PERF_EVENT_IOC_ENABLE as _, 0) };
        }
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let ret = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - done,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if ret == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        done += ret as usize;
    }

    Ok(())
}

/// Read each counter and compute the scaled delta since the last read.
pub fn sample(counters: &mut [UncoreCounter]) -> Result<()> {
    for counter in counters.iter_mut() {
        if counter.fd == INVALID_FD {
            continue;
        }

        let mut buf = [0u8; 24];
        if read_fd(counter.fd, &mut buf).is_err() {
            log::debug!("uncore sample: read fd {} failed", counter.fd);
            continue;
        }

        let value = u64::from_ne_bytes(buf[0..8].try_into().unwrap());
        let enabled = u64::from_ne_bytes(buf[8..16].try_into().unwrap());
        let running = u64::from_ne_bytes(buf[16..24].try_into().unwrap());

        counter.value_scaled = scale(
            value.wrapping_sub(counter.values[0]),
            enabled.wrapping_sub(counter.values[1]),
            running.wrapping_sub(counter.values[2]),
        );
        counter.values = [value, enabled, running];
    }

    Ok(())
}

pub fn free(counters: &mut [UncoreCounter]) {
    for counter in counters.iter_mut() {
        counter.free();
    }
}
