//! Event tables for the supported Intel server microarchitectures.
//!
//! Counter slot order: CORE_CLK, RMA, CLK, IR, LMA. Remote and local
//! memory accesses come from the two offcore-response counters; the
//! `extra` value is the offcore-response MSR encoding selecting remote
//! vs. local DRAM responses.

use super::{EventDesc, EventTable};
use crate::perf::sys::{
    PERF_COUNT_HW_CPU_CYCLES, PERF_COUNT_HW_INSTRUCTIONS, PERF_COUNT_HW_REF_CPU_CYCLES,
    PERF_TYPE_HARDWARE, PERF_TYPE_RAW,
};
use crate::perf::LL_THRESH;

const fn hw(config: u64) -> EventDesc {
    EventDesc {
        typ: PERF_TYPE_HARDWARE,
        config,
        extra: 0,
    }
}

const fn raw(config: u64, extra: u64) -> EventDesc {
    EventDesc {
        typ: PERF_TYPE_RAW,
        config,
        extra,
    }
}

pub static SKX_TABLE: EventTable = EventTable {
    counters: [
        hw(PERF_COUNT_HW_CPU_CYCLES),              // cpu_clk_unhalted.core
        raw(0x53_01b7, 0x63_8000_001),             // off_core_response_0 (remote DRAM)
        hw(PERF_COUNT_HW_REF_CPU_CYCLES),          // cpu_clk_unhalted.ref
        hw(PERF_COUNT_HW_INSTRUCTIONS),            // instr_retired.any
        raw(0x53_01bb, 0x1f_8400_0001),            // off_core_response_1 (local DRAM)
    ],
    load_latency: raw(0x53_01cd, LL_THRESH), // mem_trans_retired.load_latency
};

pub static ICX_TABLE: EventTable = EventTable {
    counters: [
        hw(PERF_COUNT_HW_CPU_CYCLES),
        raw(0x53_01b7, 0x73_0000_001),
        hw(PERF_COUNT_HW_REF_CPU_CYCLES),
        hw(PERF_COUNT_HW_INSTRUCTIONS),
        raw(0x53_01bb, 0x1_0400_0001),
    ],
    load_latency: raw(0x53_01cd, LL_THRESH),
};

pub static SPR_TABLE: EventTable = EventTable {
    counters: [
        hw(PERF_COUNT_HW_CPU_CYCLES),
        raw(0x53_012a, 0x73_0000_001),
        hw(PERF_COUNT_HW_REF_CPU_CYCLES),
        hw(PERF_COUNT_HW_INSTRUCTIONS),
        raw(0x53_012b, 0x1_0400_0001),
    ],
    load_latency: raw(0x53_01cd, LL_THRESH),
};
