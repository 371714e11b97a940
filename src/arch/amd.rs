//! Event table for the AMD Zen families. Remote vs. local accesses come
//! from `LsDmndFillsFromSys` demand-fill sources (DRAM or IO, far vs.
//! near socket). Zen has no precise load-latency event usable here.

use super::{EventDesc, EventTable};
use crate::perf::sys::{
    PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_INSTRUCTIONS, PERF_TYPE_HARDWARE, PERF_TYPE_RAW,
};

pub static ZEN_TABLE: EventTable = EventTable {
    counters: [
        EventDesc {
            typ: PERF_TYPE_HARDWARE,
            config: PERF_COUNT_HW_CPU_CYCLES, // LsNotHaltedCyc
            extra: 0,
        },
        EventDesc {
            typ: PERF_TYPE_RAW,
            config: 0x4043, // LsDmndFillsFromSys.DRAM_IO_Far
            extra: 0,
        },
        EventDesc {
            typ: PERF_TYPE_HARDWARE,
            config: PERF_COUNT_HW_CPU_CYCLES,
            extra: 0,
        },
        EventDesc {
            typ: PERF_TYPE_HARDWARE,
            config: PERF_COUNT_HW_INSTRUCTIONS, // ExRetOps
            extra: 0,
        },
        EventDesc {
            typ: PERF_TYPE_RAW,
            config: 0x0843, // LsDmndFillsFromSys.DRAM_IO_Near
            extra: 0,
        },
    ],
    load_latency: EventDesc::UNSUPPORTED,
};
