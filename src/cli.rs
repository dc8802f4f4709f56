//! CLI argument parsing for the fzsync demo race

use crate::config::PairConfig;
use crate::demo::DEFAULT_WINDOW;
use crate::error::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the race report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "fzsync")]
#[command(version)]
#[command(
    about = "Reproduce a lost-update race with fuzzy two thread synchronisation",
    long_about = None
)]
pub struct Cli {
    /// Load pair configuration from a TOML file (flags override it)
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum execution time in seconds
    #[arg(long = "exec-time", value_name = "SECS")]
    pub exec_time: Option<f64>,

    /// Maximum number of race iterations
    #[arg(long = "exec-loops", value_name = "N")]
    pub exec_loops: Option<u32>,

    /// Mandatory samples before a random delay is introduced
    #[arg(long = "min-samples", value_name = "N")]
    pub min_samples: Option<u32>,

    /// Weight of the newest sample in the moving averages
    #[arg(long = "avg-alpha", value_name = "ALPHA")]
    pub avg_alpha: Option<f64>,

    /// Maximum deviation ratio before the statistics are trusted
    #[arg(long = "max-dev-ratio", value_name = "RATIO")]
    pub max_dev_ratio: Option<f64>,

    /// Initial delay bias in spins (positive delays thread B)
    #[arg(long = "delay-bias", value_name = "N", allow_hyphen_values = true)]
    pub delay_bias: Option<i32>,

    /// Width of each thread's read-modify-write window in spins
    #[arg(long = "window", value_name = "SPINS", default_value_t = DEFAULT_WINDOW)]
    pub window: u32,

    /// Seed for the delay draws
    #[arg(long = "seed", value_name = "N")]
    pub seed: Option<u64>,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}

impl Cli {
    /// Build the pair configuration: file (or defaults) overlaid with flags
    pub fn pair_config(&self) -> Result<PairConfig> {
        let mut config = match &self.config {
            Some(path) => PairConfig::from_file(path)?,
            None => PairConfig::default(),
        };

        if let Some(v) = self.exec_time {
            config = config.with_exec_time(v);
        }
        if let Some(v) = self.exec_loops {
            config = config.with_exec_loops(v);
        }
        if let Some(v) = self.min_samples {
            config = config.with_min_samples(v);
        }
        if let Some(v) = self.avg_alpha {
            config = config.with_avg_alpha(v);
        }
        if let Some(v) = self.max_dev_ratio {
            config = config.with_max_dev_ratio(v);
        }
        if let Some(v) = self.delay_bias {
            config = config.with_delay_bias(v);
        }

        Ok(config)
    }
}
