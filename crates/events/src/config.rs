//! Bus configuration.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const HISTORY_CAPACITY_ENV: &str = "BLOCKSCRIPT_HISTORY_CAPACITY";
pub const MAX_DISPATCH_DEPTH_ENV: &str = "BLOCKSCRIPT_MAX_DISPATCH_DEPTH";
pub const SWEEP_INTERVAL_MS_ENV: &str = "BLOCKSCRIPT_SWEEP_INTERVAL_MS";

/// Tunables for an [`EventBus`](crate::EventBus) and its correlation sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Dispatch records kept per event name.
    pub history_capacity: usize,
    /// Maximum nesting of `publish` calls on one thread (cycle guard).
    pub max_dispatch_depth: usize,
    /// How often expired pattern instances are reaped.
    pub sweep_interval: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_capacity: 64,
            max_dispatch_depth: 32,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl BusConfig {
    /// Defaults overridden by `BLOCKSCRIPT_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            history_capacity: parse_or(&lookup, HISTORY_CAPACITY_ENV, defaults.history_capacity),
            max_dispatch_depth: parse_or(
                &lookup,
                MAX_DISPATCH_DEPTH_ENV,
                defaults.max_dispatch_depth,
            ),
            sweep_interval: Duration::from_millis(
                parse_or(
                    &lookup,
                    SWEEP_INTERVAL_MS_ENV,
                    u64::try_from(defaults.sweep_interval.as_millis()).unwrap_or(u64::MAX),
                )
                .max(1),
            ),
        }
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.max_dispatch_depth = depth;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + core::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, fallback = %default, "invalid config value; using default");
                default
            }
        },
    }
}
