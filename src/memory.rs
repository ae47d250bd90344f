//! Cache budget derived from the machine's memory class.

use tracing::debug;

use crate::config::CacheOptions;

const MEMINFO: &str = "/proc/meminfo";

/// Total physical memory as reported by the platform, if known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryClass {
    pub total_bytes: Option<u64>,
}

impl MemoryClass {
    pub fn detect() -> Self {
        let total_bytes = std::fs::read_to_string(MEMINFO)
            .ok()
            .and_then(|text| parse_mem_total(&text));
        debug!(?total_bytes, "detected memory class");
        Self { total_bytes }
    }

    pub const fn with_total(total_bytes: u64) -> Self {
        Self {
            total_bytes: Some(total_bytes),
        }
    }

    /// Budget in bytes for this class under `opts`.
    ///
    /// An explicit `budget-bytes` wins. Otherwise the configured fraction of
    /// total memory, clamped to the min/max bounds; four times the minimum
    /// when the class is unknown.
    pub fn budget(&self, opts: &CacheOptions) -> usize {
        if let Some(bytes) = opts.budget_bytes {
            return bytes;
        }
        match self.total_bytes {
            Some(total) => {
                let share = (total as f64 * opts.memory_fraction) as usize;
                share.clamp(opts.min_budget_bytes, opts.max_budget_bytes)
            }
            None => opts
                .min_budget_bytes
                .saturating_mul(4)
                .min(opts.max_budget_bytes),
        }
    }
}

/// Budget for the current machine.
pub fn now_visible_budget(opts: &CacheOptions) -> usize {
    MemoryClass::detect().budget(opts)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut parts = line["MemTotal:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let scale = match parts.next() {
        Some("kB") | Some("KB") => 1024,
        Some("mB") | Some("MB") => 1024 * 1024,
        None | Some("B") => 1,
        Some(_) => return None,
    };
    value.checked_mul(scale)
}
