mod amd;
mod intel;

use crate::error::{Error, Result};
use crate::perf::{sample_period, CounterId, PerfConf, Precision, ProfilingConf, COUNTER_NUM};
use crate::perf::{LL_PERIOD, LL_THRESH};

/// Raw descriptor of one PMU event as the per-microarchitecture tables
/// declare it. `config` already carries the combined event/umask/modifier
/// encoding; `extra` goes into `config1` (the offcore-response MSR or the
/// latency threshold).
#[derive(Clone, Copy, Debug)]
pub struct EventDesc {
    pub typ: u32,
    pub config: u64,
    pub extra: u64,
}

impl EventDesc {
    pub const UNSUPPORTED: EventDesc = EventDesc {
        typ: 0,
        config: u64::MAX,
        extra: 0,
    };

    pub fn is_supported(&self) -> bool {
        self.config != u64::MAX
    }
}

/// A microarchitecture's whole contribution: one descriptor per UI counter
/// slot plus the load-latency descriptor.
#[derive(Clone, Copy, Debug)]
pub struct EventTable {
    pub counters: [EventDesc; COUNTER_NUM],
    pub load_latency: EventDesc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuType {
    SkylakeX,
    IcelakeX,
    SapphireRapids,
    Zen,
    Zen3,
    Zen4,
}

#[cfg(target_arch = "x86_64")]
fn cpu_type_get() -> Option<CpuType> {
    use std::arch::x86_64::__cpuid;

    let id0 = unsafe { __cpuid(0) };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&id0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&id0.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&id0.ecx.to_le_bytes());

    let id1 = unsafe { __cpuid(1) };
    let mut family = (id1.eax >> 8) & 0xf;
    let mut model = (id1.eax >> 4) & 0xf;
    if family == 6 || family == 15 {
        model += ((id1.eax >> 16) & 0xf) << 4;
    }
    if family == 15 {
        family += (id1.eax >> 20) & 0xff;
    }

    match &vendor {
        b"GenuineIntel" => match (family, model) {
            (6, 85) => Some(CpuType::SkylakeX),
            (6, 106) => Some(CpuType::IcelakeX),
            (6, 143) | (6, 207) | (6, 173) => Some(CpuType::SapphireRapids),
            _ => None,
        },
        b"AuthenticAMD" => match family {
            23 => Some(CpuType::Zen),
            25 => match model {
                0x00..=0x0f | 0x20..=0x2f | 0x40..=0x5f => Some(CpuType::Zen3),
                _ => Some(CpuType::Zen4),
            },
            f if f >= 26 => Some(CpuType::Zen4),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn cpu_type_get() -> Option<CpuType> {
    None
}

/// Detect the running microarchitecture and hand back its event table.
pub fn detect() -> Result<EventTable> {
    let cpu_type = cpu_type_get().ok_or(Error::UnsupportedCpu)?;
    log::debug!("detected CPU type {cpu_type:?}");
    Ok(table_for(cpu_type))
}

pub fn table_for(cpu_type: CpuType) -> EventTable {
    match cpu_type {
        CpuType::SkylakeX => intel::SKX_TABLE,
        CpuType::IcelakeX => intel::ICX_TABLE,
        CpuType::SapphireRapids => intel::SPR_TABLE,
        CpuType::Zen | CpuType::Zen3 | CpuType::Zen4 => amd::ZEN_TABLE,
    }
}

/// Build the kernel-side profiling configuration from an event table and
/// the chosen precision.
pub fn profiling_conf(table: &EventTable, precision: Precision) -> ProfilingConf {
    let mut counters = [PerfConf::invalid(); COUNTER_NUM];
    for id in CounterId::ALL {
        let desc = &table.counters[id.index()];
        if !desc.is_supported() {
            continue;
        }

        counters[id.index()] = PerfConf {
            typ: desc.typ,
            config: desc.config,
            config1: desc.extra,
            sample_period: sample_period(id, precision),
        };
    }

    ProfilingConf { counters }
}

/// Load-latency descriptor, or None when the microarchitecture has no
/// usable precise load-latency event.
pub fn ll_conf(table: &EventTable) -> Option<PerfConf> {
    let desc = &table.load_latency;
    if !desc.is_supported() {
        return None;
    }

    Some(PerfConf {
        typ: desc.typ,
        config: desc.config,
        config1: if desc.extra != 0 { desc.extra } else { LL_THRESH },
        sample_period: LL_PERIOD,
    })
}

#[cfg(test)]
mod tests {
    use super::{amd, intel, *};

    #[test]
    fn intel_tables_have_all_counters() {
        for table in [&intel::SKX_TABLE, &intel::ICX_TABLE, &intel::SPR_TABLE] {
            for desc in &table.counters {
                assert!(desc.is_supported());
            }
            assert!(table.load_latency.is_supported());
        }
    }

    #[test]
    fn zen_has_no_load_latency() {
        assert!(ll_conf(&amd::ZEN_TABLE).is_none());
    }

    #[test]
    fn profiling_conf_carries_periods() {
        let conf = profiling_conf(&intel::SKX_TABLE, Precision::Normal);
        assert_eq!(
            conf.counters[CounterId::Rma.index()].sample_period,
            sample_period(CounterId::Rma, Precision::Normal)
        );
        assert!(conf.counters[CounterId::CoreClk.index()].is_valid());
    }
}
