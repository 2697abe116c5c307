//! Runtime configuration, read once when a runtime group starts.
//!
//! | Variable          | Meaning                                        |
//! |-------------------|------------------------------------------------|
//! | `PTH_SCHEDULERS`  | scheduler instances in the group (1..=96)      |
//! | `PTH_NODES`       | instances `id < nodes` pin to CPU `id % ncpus` |
//! | `PTH_STACK_SIZE`  | default stack bytes for spawned threads        |

use std::time::Duration;

use tracing::warn;

use crate::coro::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Upper bound on scheduler instances per group.
pub const MAX_SCHEDULERS: usize = 96;

/// Interval between load-average samples.
pub const DEFAULT_LOAD_TICK: Duration = Duration::from_secs(1);

/// Configuration of one runtime group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Desired number of scheduler instances, including the initial one.
    pub schedulers: usize,
    /// Affinity hint: instances with `id < nodes` pin their OS thread.
    pub affinity_nodes: Option<usize>,
    /// Default usable stack size of spawned threads.
    pub stack_size: usize,
    /// Load accounting interval.
    pub load_tick: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            schedulers: 1,
            affinity_nodes: None,
            stack_size: DEFAULT_STACK_SIZE,
            load_tick: DEFAULT_LOAD_TICK,
        }
    }
}

impl Config {
    /// Read the configuration from the process environment.
    ///
    /// Invalid values are logged and replaced by their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(val) = lookup("PTH_SCHEDULERS") {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.schedulers = n.min(MAX_SCHEDULERS),
                _ => warn!(value = %val, "PTH_SCHEDULERS is invalid, using default"),
            }
        }

        if let Some(val) = lookup("PTH_NODES") {
            match val.trim().parse::<usize>() {
                Ok(n) => config.affinity_nodes = Some(n),
                Err(_) => warn!(value = %val, "PTH_NODES is invalid, ignoring"),
            }
        }

        if let Some(val) = lookup("PTH_STACK_SIZE") {
            match val.trim().parse::<usize>() {
                Ok(n) if n >= MIN_STACK_SIZE => config.stack_size = n,
                _ => warn!(
                    value = %val,
                    min = MIN_STACK_SIZE,
                    "PTH_STACK_SIZE is invalid, using default"
                ),
            }
        }

        config
    }

    /// Set the desired scheduler instance count (clamped to `1..=96`).
    #[must_use]
    pub fn with_schedulers(mut self, n: usize) -> Self {
        self.schedulers = n.clamp(1, MAX_SCHEDULERS);
        self
    }

    /// Set the CPU affinity hint.
    #[must_use]
    pub fn with_affinity_nodes(mut self, nodes: Option<usize>) -> Self {
        self.affinity_nodes = nodes;
        self
    }

    /// Set the default stack size (raised to the minimum if smaller).
    #[must_use]
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes.max(MIN_STACK_SIZE);
        self
    }

    /// Set the load accounting interval.
    #[must_use]
    pub fn with_load_tick(mut self, tick: Duration) -> Self {
        self.load_tick = tick.max(Duration::from_millis(1));
        self
    }
}
