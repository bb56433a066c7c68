use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub pressure: PressureConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub categories: Vec<CategoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Maximum number of category producers running at once. `0` runs every
    /// configured category concurrently.
    #[serde(default)]
    pub stream_count: usize,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Items enqueued between two pressure samples.
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval: usize,
    /// Maximum items drained from the buffer per commit cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream_count: 0,
            buffer_capacity: default_buffer_capacity(),
            sampling_interval: default_sampling_interval(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_buffer_capacity() -> usize {
    crate::buffer::DEFAULT_CAPACITY
}
fn default_sampling_interval() -> usize {
    100
}
fn default_batch_size() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PressureConfig {
    /// Memory budget the usage ratio is measured against. `0` disables
    /// sampling of the process (usage always reads as zero).
    #[serde(default)]
    pub capacity_mb: u64,
    #[serde(default)]
    pub thresholds: PressureThresholds,
    #[serde(default)]
    pub delays: ThrottleDelays,
}

/// Lower bounds (inclusive) of the three throttled levels.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    #[serde(default = "default_light")]
    pub light: f64,
    #[serde(default = "default_heavy")]
    pub heavy: f64,
    #[serde(default = "default_emergency")]
    pub emergency: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            light: default_light(),
            heavy: default_heavy(),
            emergency: default_emergency(),
        }
    }
}

fn default_light() -> f64 {
    0.60
}
fn default_heavy() -> f64 {
    0.75
}
fn default_emergency() -> f64 {
    0.85
}

/// Delay applied per sampling interval at each level.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct ThrottleDelays {
    #[serde(default)]
    pub normal_ms: u64,
    #[serde(default = "default_light_ms")]
    pub light_ms: u64,
    #[serde(default = "default_heavy_ms")]
    pub heavy_ms: u64,
    #[serde(default = "default_emergency_ms")]
    pub emergency_ms: u64,
}

impl Default for ThrottleDelays {
    fn default() -> Self {
        Self {
            normal_ms: 0,
            light_ms: default_light_ms(),
            heavy_ms: default_heavy_ms(),
            emergency_ms: default_emergency_ms(),
        }
    }
}

fn default_light_ms() -> u64 {
    50
}
fn default_heavy_ms() -> u64 {
    200
}
fn default_emergency_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Records per page pulled from a file source.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    500
}

/// One content category fed from a JSON-Lines file.
#[derive(Debug, Deserialize, Clone)]
pub struct CategoryConfig {
    pub name: String,
    pub path: PathBuf,
}

impl Config {
    /// Configuration with every default and no categories, backed by the
    /// given database path.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            pipeline: PipelineConfig::default(),
            pressure: PressureConfig::default(),
            source: SourceConfig::default(),
            categories: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.pipeline;
        if p.buffer_capacity == 0 {
            anyhow::bail!("pipeline.buffer_capacity must be > 0");
        }
        if p.sampling_interval == 0 {
            anyhow::bail!("pipeline.sampling_interval must be > 0");
        }
        if p.batch_size == 0 {
            anyhow::bail!("pipeline.batch_size must be > 0");
        }
        if self.source.page_size == 0 {
            anyhow::bail!("source.page_size must be > 0");
        }

        let t = &self.pressure.thresholds;
        for (name, v) in [("light", t.light), ("heavy", t.heavy), ("emergency", t.emergency)] {
            if !(0.0..=1.0).contains(&v) {
                anyhow::bail!("pressure.thresholds.{} must be in [0.0, 1.0]", name);
            }
        }
        if !(t.light < t.heavy && t.heavy < t.emergency) {
            anyhow::bail!("pressure.thresholds must satisfy light < heavy < emergency");
        }

        let mut seen = std::collections::HashSet::new();
        for c in &self.categories {
            if c.name.trim().is_empty() {
                anyhow::bail!("categories[].name must not be empty");
            }
            if !seen.insert(c.name.as_str()) {
                anyhow::bail!("Duplicate category name: '{}'", c.name);
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}
