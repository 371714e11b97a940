pub mod counter;
pub mod pqos;
pub mod ring;
pub mod sampler;
pub mod sys;
pub mod uncore;

/// Hardware counter slots of one per-CPU group. The order is the group
/// order: the leader (CORE_CLK) comes first and is the enable/disable
/// handle for the whole group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum CounterId {
    CoreClk = 0,
    Rma = 1,
    Clk = 2,
    Ir = 3,
    Lma = 4,
}

pub const COUNTER_NUM: usize = 5;

impl CounterId {
    pub const ALL: [CounterId; COUNTER_NUM] = [
        CounterId::CoreClk,
        CounterId::Rma,
        CounterId::Clk,
        CounterId::Ir,
        CounterId::Lma,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Counter ids as the UI names them. A UI counter can aggregate more than
/// one hardware counter (platforms that split remote accesses over two
/// offcore-response counters).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiCountId {
    Rma,
    Lma,
    Clk,
    Ir,
    CoreClk,
}

static UI_COUNT_MAP: [(UiCountId, &[CounterId]); 5] = [
    (UiCountId::Rma, &[CounterId::Rma]),
    (UiCountId::Lma, &[CounterId::Lma]),
    (UiCountId::Clk, &[CounterId::Clk]),
    (UiCountId::Ir, &[CounterId::Ir]),
    (UiCountId::CoreClk, &[CounterId::CoreClk]),
];

impl UiCountId {
    pub fn counters(self) -> &'static [CounterId] {
        UI_COUNT_MAP
            .iter()
            .find(|(ui, _)| *ui == self)
            .map(|(_, ids)| *ids)
            .unwrap_or(&[])
    }

    /// Aggregate one per-counter value array into this UI counter.
    pub fn aggregate(self, counts: &CountVals) -> u64 {
        self.counters()
            .iter()
            .map(|id| counts.counts[id.index()])
            .sum()
    }
}

/// One value per hardware counter, used both for raw readouts and for
/// accumulated deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountVals {
    pub counts: [u64; COUNTER_NUM],
}

impl CountVals {
    pub fn get(&self, id: CounterId) -> u64 {
        self.counts[id.index()]
    }

    pub fn add(&mut self, id: CounterId, value: u64) {
        self.counts[id.index()] += value;
    }

    pub fn clear(&mut self) {
        self.counts = [0; COUNTER_NUM];
    }
}

/// Sampling precision selects both the overflow thresholds and the ring
/// size. High precision means lower thresholds (more samples) and a bigger
/// ring to absorb them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Precision {
    Low,
    Normal,
    High,
}

impl Precision {
    /// Data pages of the per-CPU ring buffer (one meta page is added).
    pub fn ring_pages(self) -> usize {
        match self {
            Precision::Low => 64,
            Precision::Normal => 256,
            Precision::High => 1024,
        }
    }
}

const SMPL_PERIOD_INFINITE: u64 = 0xFF_FFFF_FFFF_FFFF;

/// Overflow threshold per counter per precision level. A call chain is
/// recorded when one interval's delta reaches the counter's threshold.
pub fn sample_period(id: CounterId, precision: Precision) -> u64 {
    match id {
        CounterId::CoreClk => SMPL_PERIOD_INFINITE,
        CounterId::Rma | CounterId::Lma => match precision {
            Precision::Low => 100_000,
            Precision::Normal => 10_000,
            Precision::High => 5_000,
        },
        CounterId::Clk | CounterId::Ir => match precision {
            Precision::Low => 100_000_000,
            Precision::Normal => 10_000_000,
            Precision::High => 1_000_000,
        },
    }
}

/// Load-latency sampling period and minimum latency threshold (cycles).
pub const LL_PERIOD: u64 = 1000;
pub const LL_THRESH: u64 = 128;

/// Deepest call chain kept per sample.
pub const IP_NUM: usize = 32;

/// One overflow's call-chain record: the delta that crossed the
/// threshold plus the raw user-space IP chain. Symbolic resolution
/// happens later, on the display side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainRecord {
    pub count_value: u64,
    pub ips: Vec<u64>,
}

/// Raw kernel-side configuration of one counter, produced from the
/// per-microarchitecture table.
#[derive(Clone, Copy, Debug, Default)]
pub struct PerfConf {
    pub typ: u32,
    pub config: u64,
    pub config1: u64,
    pub sample_period: u64,
}

impl PerfConf {
    pub fn is_valid(&self) -> bool {
        self.config != u64::MAX
    }

    pub fn invalid() -> Self {
        PerfConf {
            typ: 0,
            config: u64::MAX,
            config1: 0,
            sample_period: 0,
        }
    }
}

/// The full profiling configuration: one descriptor per counter slot.
#[derive(Clone, Copy, Debug)]
pub struct ProfilingConf {
    pub counters: [PerfConf; COUNTER_NUM],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ui_aggregation_sums_mapped_counters() {
        let mut vals = CountVals::default();
        vals.add(CounterId::Rma, 7);
        vals.add(CounterId::Clk, 11);
        assert_eq!(UiCountId::Rma.aggregate(&vals), 7);
        assert_eq!(UiCountId::Clk.aggregate(&vals), 11);
        assert_eq!(UiCountId::Lma.aggregate(&vals), 0);
    }

    #[test]
    fn periods_scale_with_precision() {
        assert!(
            sample_period(CounterId::Rma, Precision::High)
                < sample_period(CounterId::Rma, Precision::Low)
        );
        assert_eq!(
            sample_period(CounterId::CoreClk, Precision::Normal),
            SMPL_PERIOD_INFINITE
        );
    }

    #[test]
    fn ring_pages_per_precision() {
        assert_eq!(Precision::Low.ring_pages(), 64);
        assert_eq!(Precision::Normal.ring_pages(), 256);
        assert_eq!(Precision::High.ring_pages(), 1024);
    }
}
