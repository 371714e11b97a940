use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("This processor is not supported")]
    UnsupportedCpu,

    #[error("NUMA topology enumeration failed: {0}")]
    Topology(std::io::Error),

    #[error("perf_event_open failed on CPU {cpu}: {source}")]
    CounterOpen {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("mapping the ring buffer failed on CPU {cpu}: {source}")]
    RingMap {
        cpu: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("uncore counter setup failed on node {nid}: {source}")]
    UncoreOpen {
        nid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("resctrl is not mounted or not writable")]
    ResctrlUnavailable,

    #[error("the sampler did not reach the requested state in time")]
    RendezvousTimeout,

    #[error("sampling failed; the sampler is in an error state")]
    SamplingFailed,

    #[error("process {0} has exited")]
    ProcessGone(i32),

    #[error("could not open {path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
