//! `hub.toml` configuration for stringhub.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use hub_core::{HitSpoolOptions, HubOptions};

/// Top-level hub configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubConfig {
    /// Source id the hub uses to seal streams it generates itself.
    #[serde(default = "HubConfig::default_hub_id")]
    pub hub_id: u64,
    /// Module mainboard ids, 16 hex digits each.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Bound of each engine's input queue; producers block when full.
    #[serde(default = "HubConfig::default_queue_bound")]
    pub queue_bound: usize,
    /// Send every Nth calibration to the secondary consumer (collector-side).
    #[serde(default = "HubConfig::default_tcal_prescale")]
    pub tcal_prescale: u32,
    /// Passed through to the per-module collectors.
    #[serde(default)]
    pub enable_intervals: bool,
    /// Enable hit spooling to disk (handled by the spool collaborator).
    #[serde(default)]
    pub hit_spooling: bool,
    #[serde(default = "HubConfig::default_hit_spool_dir")]
    pub hit_spool_dir: String,
    #[serde(default = "HubConfig::default_hit_spool_interval_ns")]
    pub hit_spool_interval_ns: u64,
    #[serde(default = "HubConfig::default_hit_spool_num_files")]
    pub hit_spool_num_files: u32,
    /// Supernova source distance in kpc (simulation only).
    #[serde(default)]
    pub sn_distance: Option<f64>,
    /// Accepted for compatibility; the tournament merge is always used.
    #[serde(default)]
    pub use_priority_sort: bool,
    #[serde(default)]
    pub replay: ReplayConfig,
}

/// Synthetic-stream parameters for `stringhub replay`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    #[serde(default = "ReplayConfig::default_hits_per_channel")]
    pub hits_per_channel: u64,
    /// Per-channel hit spacing in 0.1-ns units.
    #[serde(default = "ReplayConfig::default_hit_spacing")]
    pub hit_spacing: i64,
    /// Emit a time calibration every N hits (collector-side prescale).
    #[serde(default = "ReplayConfig::default_tcal_every")]
    pub tcal_every: u64,
    #[serde(default = "ReplayConfig::default_moni_every")]
    pub moni_every: u64,
    #[serde(default = "ReplayConfig::default_sn_every")]
    pub sn_every: u64,
}

impl ReplayConfig {
    fn default_hits_per_channel() -> u64 { 5_000 }
    fn default_hit_spacing() -> i64 { 2_500_000 }
    fn default_tcal_every() -> u64 { 100 }
    fn default_moni_every() -> u64 { 500 }
    fn default_sn_every() -> u64 { 250 }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            hits_per_channel: Self::default_hits_per_channel(),
            hit_spacing: Self::default_hit_spacing(),
            tcal_every: Self::default_tcal_every(),
            moni_every: Self::default_moni_every(),
            sn_every: Self::default_sn_every(),
        }
    }
}

impl HubConfig {
    fn default_hub_id() -> u64 { 0x1000 }
    fn default_queue_bound() -> usize { hub_core::DEFAULT_QUEUE_BOUND }
    fn default_tcal_prescale() -> u32 { 10 }
    fn default_hit_spool_dir() -> String { "/mnt/data/hitspool".into() }
    fn default_hit_spool_interval_ns() -> u64 { 100_000_000_000 }
    fn default_hit_spool_num_files() -> u32 { 100 }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// Returns a default config with a four-module string.
    pub fn default_example() -> Self {
        Self {
            hub_id: Self::default_hub_id(),
            channels: vec![
                "53494d550a000001".into(),
                "53494d550a000002".into(),
                "53494d550a000003".into(),
                "53494d550a000004".into(),
            ],
            queue_bound: Self::default_queue_bound(),
            tcal_prescale: Self::default_tcal_prescale(),
            enable_intervals: false,
            hit_spooling: false,
            hit_spool_dir: Self::default_hit_spool_dir(),
            hit_spool_interval_ns: Self::default_hit_spool_interval_ns(),
            hit_spool_num_files: Self::default_hit_spool_num_files(),
            sn_distance: None,
            use_priority_sort: false,
            replay: ReplayConfig::default(),
        }
    }

    /// Parse the hex channel list into mainboard ids.
    pub fn parsed_channels(&self) -> Result<Vec<u64>> {
        self.channels
            .iter()
            .map(|s| {
                u64::from_str_radix(s, 16)
                    .with_context(|| format!("invalid channel mbid: {s:?}"))
            })
            .collect()
    }

    /// The option set consumed by the dispatch layer.
    pub fn options(&self) -> HubOptions {
        HubOptions {
            queue_bound: self.queue_bound,
            tcal_prescale: self.tcal_prescale,
            enable_intervals: self.enable_intervals,
            hit_spool: self.hit_spooling.then(|| HitSpoolOptions {
                dir: self.hit_spool_dir.clone(),
                interval_ns: self.hit_spool_interval_ns,
                num_files: self.hit_spool_num_files,
            }),
            sn_distance: self.sn_distance,
            use_priority_sort: self.use_priority_sort,
        }
    }
}
