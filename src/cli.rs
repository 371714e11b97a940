use std::path::PathBuf;

use clap::Parser;

use crate::perf::Precision;

/// A NUMA-aware top: per-node, per-process and per-thread hardware counter
/// monitoring for Linux.
#[derive(Debug, Parser)]
#[command(name = "nodetop", version)]
pub struct Opt {
    /// Write debug logging to this file instead of stderr.
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Append a plain-text copy of every rendered frame to this file.
    #[arg(short = 'o', long = "dump-file")]
    pub dump_file: Option<PathBuf>,

    /// Sampling precision; higher precision uses lower overflow thresholds
    /// and a bigger ring buffer.
    #[arg(short = 's', long = "precision", value_enum, default_value_t = Precision::Normal)]
    pub precision: Precision,

    /// Stop after this many seconds.
    #[arg(short = 't', long = "run-time")]
    pub run_secs: Option<u64>,

    /// Debug verbosity (0 = off, 1 = debug, 2 = trace).
    #[arg(short = 'd', long = "debug-level", default_value_t = 0)]
    pub debug_level: u8,

    /// Refresh interval in seconds.
    #[arg(short = 'i', long = "interval", default_value_t = 5)]
    pub interval_secs: u64,
}

impl Opt {
    pub fn log_level(&self) -> log::LevelFilter {
        match self.debug_level {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opt = Opt::parse_from(["nodetop"]);
        assert_eq!(opt.interval_secs, 5);
        assert_eq!(opt.debug_level, 0);
        assert!(opt.run_secs.is_none());
        assert!(matches!(opt.precision, Precision::Normal));
    }

    #[test]
    fn precision_values_parse() {
        let opt = Opt::parse_from(["nodetop", "-s", "high", "-t", "30"]);
        assert!(matches!(opt.precision, Precision::High));
        assert_eq!(opt.run_secs, Some(30));
    }
}
