//! Sizing the fleet from the amount of work left.
//!
//! All three factors are multiples of nodes per unfinished item: `init` sizes the first
//! launch, and the job keeps between `min` and `max` of them working as items finish.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Share of the available devices a first launch may ask for.
const AVAILABLE_SHARE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Autoscale {
    pub init: f64,
    pub min: f64,
    pub max: f64,
    /// How often the number of working nodes is checked.
    #[serde(with = "crate::serde::secs")]
    pub check_interval: Duration,
}

impl Default for Autoscale {
    fn default() -> Self {
        Self {
            init: 1.0,
            min: 1.0,
            max: 1.0,
            check_interval: Duration::from_secs(20),
        }
    }
}

impl Autoscale {
    pub fn validate(&self) -> Result<()> {
        let bad = |what: &str| Err(FleetError::ConfigError(what.to_string()));
        if !(self.max > 0.0) {
            return bad("--autoscale-max must be positive");
        }
        if !(self.min >= 0.0) {
            return bad("--autoscale-min must not be negative");
        }
        if !(self.init >= 0.0) {
            return bad("--autoscale-init must not be negative");
        }
        if self.max < self.min {
            return bad("--autoscale-max is below --autoscale-min");
        }
        Ok(())
    }

    /// Nodes to launch up front for `items` items. `available` is the provider's count of
    /// matching devices, if it reports one.
    pub fn initial_count(&self, items: usize, available: Option<usize>) -> usize {
        let wanted = (items as f64 * self.init).round() as usize;
        let wanted = match available {
            Some(available) => wanted.min((available as f64 * AVAILABLE_SHARE).round() as usize),
            None => wanted,
        };
        if items > 0 {
            wanted.max(1)
        } else {
            0
        }
    }

    /// Nodes to add so that `working` reaches the floor for `unfinished` items, without
    /// passing the ceiling. Zero while the floor is met.
    pub fn shortfall(&self, working: usize, unfinished: u64) -> usize {
        let floor = (unfinished as f64 * self.min).round() as usize;
        if working >= floor {
            return 0;
        }
        let ceiling = (unfinished as f64 * self.max).round() as usize;
        floor.min(ceiling).saturating_sub(working)
    }
}
