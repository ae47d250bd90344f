use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// Cache sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheOptions {
    /// Explicit budget in bytes; derived from the memory class when absent.
    pub budget_bytes: Option<usize>,
    /// Share of the memory class handed to the cache.
    pub memory_fraction: f64,
    pub min_budget_bytes: usize,
    pub max_budget_bytes: usize,
}

impl CacheOptions {
    const fn default_min_budget() -> usize {
        8 * 1024 * 1024
    }

    const fn default_max_budget() -> usize {
        256 * 1024 * 1024
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.memory_fraction > 0.0 && self.memory_fraction <= 1.0,
            "cache.memory-fraction must be in (0, 1]"
        );
        ensure!(
            self.min_budget_bytes <= self.max_budget_bytes,
            "cache.min-budget-bytes must not exceed cache.max-budget-bytes"
        );
        if let Some(bytes) = self.budget_bytes {
            ensure!(bytes > 0, "cache.budget-bytes must be greater than zero");
        }
        Ok(())
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            budget_bytes: None,
            memory_fraction: 0.125,
            min_budget_bytes: Self::default_min_budget(),
            max_budget_bytes: Self::default_max_budget(),
        }
    }
}

/// Cross-fade policy for receivers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FadeOptions {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Fade in even when the buffer was already resident.
    pub fade_cached: bool,
}

impl Default for FadeOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            duration: Duration::from_millis(120),
            fade_cached: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DecodeOptions {
    /// Try the scaled/fast decode path before the legacy one.
    pub modern_decoder: bool,
    /// Rotate pixels by EXIF orientation instead of only reporting it.
    pub bake_orientation: bool,
    pub default_blur_radius: u8,
    pub private_blur_radius: u8,
    /// Edge length private previews are decoded at.
    pub private_size: u32,
    /// Results smaller than this on both sides get blurred.
    pub small_image_blur_threshold: u32,
    #[serde(with = "humantime_serde")]
    pub slow_decode_warning: Duration,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            modern_decoder: true,
            bake_orientation: false,
            default_blur_radius: 3,
            private_blur_radius: 7,
            private_size: 36,
            small_image_blur_threshold: 100,
            slow_decode_warning: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerOptions {
    pub thread_name_prefix: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            thread_name_prefix: "imagepipe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub cache: CacheOptions,
    pub fade: FadeOptions,
    pub decode: DecodeOptions,
    pub workers: WorkerOptions,
}

impl Configuration {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        self.cache.validate().context("invalid cache configuration")?;
        if self.fade.enabled {
            ensure!(
                self.fade.duration > Duration::ZERO,
                "fade.duration must be greater than zero when fading is enabled"
            );
        }
        ensure!(
            self.decode.private_size > 0,
            "decode.private-size must be greater than zero"
        );
        ensure!(
            !self.workers.thread_name_prefix.is_empty(),
            "workers.thread-name-prefix must not be empty"
        );
        Ok(self)
    }
}
