use std::fs;
use std::time::Instant;

pub const MS_SEC: u64 = 1000;
pub const NS_SEC: u64 = 1_000_000_000;

/// Monotonic time base shared by the sampler and display threads. All
/// interval arithmetic is done in milliseconds since this base.
#[derive(Clone, Copy, Debug)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        TimeBase {
            start: Instant::now(),
        }
    }

    pub fn current_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// CPU utilization from an unhalted-cycles count over one interval.
pub fn cpu_percent(clk: u64, intval_ms: u64, clk_of_sec: u64, ncpus: usize) -> f64 {
    let total = (clk_of_sec as f64 / MS_SEC as f64) * intval_ms as f64 * ncpus.max(1) as f64;
    if total <= 0.0 {
        0.0
    } else {
        (clk as f64 * 100.0 / total).min(100.0)
    }
}

/// Cycle-to-wallclock calibration. Latency weights arrive in core cycles;
/// the views need nanoseconds.
#[derive(Clone, Copy, Debug)]
pub struct CycleCalib {
    pub ns_of_clk: f64,
    pub clk_of_sec: u64,
}

impl CycleCalib {
    pub fn fixed(clk_of_sec: u64) -> Self {
        CycleCalib {
            ns_of_clk: NS_SEC as f64 / clk_of_sec as f64,
            clk_of_sec,
        }
    }

    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        (cycles as f64 * self.ns_of_clk) as u64
    }
}

fn calibrate_cpuinfo() -> Option<CycleCalib> {
    let content = fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in content.lines() {
        if !line.starts_with("model name") {
            continue;
        }

        // e.g. "model name : Intel(R) Xeon(R) CPU E5-2680 v2 @ 2.80GHz"
        let freq = line.rsplit('@').next()?.trim();
        let ghz = freq.strip_suffix("GHz")?.trim().parse::<f64>().ok()?;
        if ghz > 0.0 {
            return Some(CycleCalib::fixed((ghz * NS_SEC as f64) as u64));
        }
    }

    None
}

fn calibrate_cpufreq() -> Option<CycleCalib> {
    let content =
        fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/cpuinfo_max_freq").ok()?;
    let khz = content.trim().parse::<u64>().ok()?;
    if khz == 0 {
        return None;
    }

    Some(CycleCalib::fixed(khz * 1000))
}

#[cfg(target_arch = "x86_64")]
fn calibrate_tsc() -> CycleCalib {
    use std::arch::x86_64::_rdtsc;
    use std::time::Duration;

    let start = Instant::now();
    let tsc_start = unsafe { _rdtsc() };
    std::thread::sleep(Duration::from_millis(100));
    let tsc_end = unsafe { _rdtsc() };
    let elapsed_ns = start.elapsed().as_nanos() as u64;

    if elapsed_ns == 0 || tsc_end <= tsc_start {
        return CycleCalib::fixed(NS_SEC);
    }

    let clk_of_sec = (tsc_end - tsc_start) * NS_SEC / elapsed_ns;
    CycleCalib::fixed(clk_of_sec.max(1))
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate_tsc() -> CycleCalib {
    CycleCalib::fixed(NS_SEC)
}

/// Calibration order follows reliability: cpuinfo reports the nominal
/// frequency directly, cpufreq the maximum, and the timed counter loop is
/// the fallback when neither file is usable.
pub fn calibrate() -> CycleCalib {
    if let Some(calib) = calibrate_cpuinfo() {
        log::debug!("calibrate: cpuinfo, clk_of_sec = {}", calib.clk_of_sec);
        return calib;
    }

    if let Some(calib) = calibrate_cpufreq() {
        log::debug!("calibrate: cpufreq, clk_of_sec = {}", calib.clk_of_sec);
        return calib;
    }

    let calib = calibrate_tsc();
    log::debug!("calibrate: tsc loop, clk_of_sec = {}", calib.clk_of_sec);
    calib
}

pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_calibration_is_deterministic() {
        let calib = CycleCalib::fixed(2_000_000_000);
        assert_eq!(calib.cycles_to_ns(2_000_000_000), NS_SEC);
        assert_eq!(calib.cycles_to_ns(128), 64);
    }

    #[test]
    fn ratio_handles_zero_denominator() {
        assert_eq!(ratio(10, 0), 0.0);
        assert_eq!(ratio(10, 5), 2.0);
    }

    #[test]
    fn cpu_percent_is_bounded() {
        // 1 CPU at 1 GHz over 1000 ms: the full budget is 1e9 cycles.
        assert_eq!(cpu_percent(500_000_000, 1000, 1_000_000_000, 1), 50.0);
        assert_eq!(cpu_percent(u64::MAX, 1000, 1_000_000_000, 1), 100.0);
        assert_eq!(cpu_percent(1, 0, 1_000_000_000, 1), 0.0);
    }
}
