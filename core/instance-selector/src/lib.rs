//! Instance-Type Catalog and Selector.
//!
//! The catalog is a snapshot of `{shape -> (vCPU, memory, price, interruption
//! probability, on-demand/spot)}`. [`Catalog::choose`] answers "which shapes, and how
//! many of each, should I buy to cover `num_workers` workers of `resources_per_worker`
//! as cheaply as possible, without exceeding an interruption-probability ceiling".

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bundle of resources: what a worker needs, or what a VM has available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub memory_gb: f64,
    pub logical_cpu: u32,
    pub custom: BTreeMap<String, f64>,
}

impl Resources {
    pub fn new(memory_gb: f64, logical_cpu: u32) -> Self {
        Self {
            memory_gb,
            logical_cpu,
            custom: BTreeMap::new(),
        }
    }

    pub fn with_custom(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    /// Subtracts `other` from `self`. Returns `None` if any component would go
    /// negative, per I3.
    pub fn subtract(&self, other: &Resources) -> Option<Resources> {
        if self.memory_gb < other.memory_gb {
            return None;
        }
        let logical_cpu = self.logical_cpu.checked_sub(other.logical_cpu)?;

        let mut custom = self.custom.clone();
        for (name, amount) in &other.custom {
            let available = custom.entry(name.clone()).or_insert(0.0);
            if *available < *amount {
                return None;
            }
            *available -= amount;
        }

        Some(Resources {
            memory_gb: self.memory_gb - other.memory_gb,
            logical_cpu,
            custom,
        })
    }

    /// Adds `other` to `self`, component-wise. Used to restore resources on
    /// deallocation.
    pub fn add(&self, other: &Resources) -> Resources {
        let mut custom = self.custom.clone();
        for (name, amount) in &other.custom {
            *custom.entry(name.clone()).or_insert(0.0) += amount;
        }
        Resources {
            memory_gb: self.memory_gb + other.memory_gb,
            logical_cpu: self.logical_cpu + other.logical_cpu,
            custom,
        }
    }

    /// True iff every component of `self` is >= the matching component of `required`.
    pub fn dominates(&self, required: &Resources) -> bool {
        self.memory_gb >= required.memory_gb
            && self.logical_cpu >= required.logical_cpu
            && required
                .custom
                .iter()
                .all(|(name, amount)| self.custom.get(name).copied().unwrap_or(0.0) >= *amount)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnDemandOrSpot {
    OnDemand,
    Spot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeInfo {
    pub name: String,
    pub logical_cpu: u32,
    pub memory_gb: f64,
    pub price_per_hour: f64,
    pub interruption_probability_percent: f64,
    pub on_demand_or_spot: OnDemandOrSpot,
}

impl InstanceTypeInfo {
    pub fn total_resources(&self) -> Resources {
        Resources::new(self.memory_gb, self.logical_cpu)
    }
}

/// "full" is how many workers the shape could host; "actual" may be lower when the
/// last shape in a multi-shape choice is underutilized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeChoice {
    pub instance_type: InstanceTypeInfo,
    pub workers_per_instance_full: u32,
    pub workers_per_instance_actual: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("no instance shape satisfies the resource requirements and interruption ceiling")]
    NoSuitableShape,
}

/// A snapshot of purchasable VM shapes.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    shapes: Vec<InstanceTypeInfo>,
}

impl Catalog {
    pub fn new(shapes: Vec<InstanceTypeInfo>) -> Self {
        Self { shapes }
    }

    pub fn shapes(&self) -> &[InstanceTypeInfo] {
        &self.shapes
    }

    fn workers_per_instance_full(shape: &InstanceTypeInfo, required: &Resources) -> u32 {
        let by_cpu = if required.logical_cpu == 0 {
            u32::MAX
        } else {
            shape.logical_cpu / required.logical_cpu
        };
        let by_memory = if required.memory_gb <= 0.0 {
            u32::MAX
        } else {
            (shape.memory_gb / required.memory_gb).floor() as u32
        };
        by_cpu.min(by_memory)
    }

    fn on_demand_rank(shape: &InstanceTypeInfo) -> u8 {
        match shape.on_demand_or_spot {
            OnDemandOrSpot::OnDemand => 0,
            OnDemandOrSpot::Spot => 1,
        }
    }

    /// Ascending price-per-worker-hour, then on-demand over spot, then lower absolute
    /// price, then lower interruption probability, then lexicographic name.
    fn tie_break(
        a: &InstanceTypeInfo,
        a_price_per_worker: f64,
        b: &InstanceTypeInfo,
        b_price_per_worker: f64,
    ) -> Ordering {
        a_price_per_worker
            .partial_cmp(&b_price_per_worker)
            .unwrap_or(Ordering::Equal)
            .then_with(|| Self::on_demand_rank(a).cmp(&Self::on_demand_rank(b)))
            .then_with(|| {
                a.price_per_hour
                    .partial_cmp(&b.price_per_hour)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| {
                a.interruption_probability_percent
                    .partial_cmp(&b.interruption_probability_percent)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.name.cmp(&b.name))
    }

    /// Picks a near-minimal-cost set of shapes covering `num_workers` workers of
    /// `resources_per_worker`, each within `interruption_ceiling_pct`.
    pub fn choose(
        &self,
        resources_per_worker: &Resources,
        num_workers: u32,
        interruption_ceiling_pct: f64,
    ) -> Result<Vec<InstanceTypeChoice>, SelectorError> {
        if num_workers == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(&InstanceTypeInfo, u32, f64)> = self
            .shapes
            .iter()
            .filter(|shape| {
                shape.interruption_probability_percent <= interruption_ceiling_pct
                    && shape.total_resources().dominates(resources_per_worker)
            })
            .filter_map(|shape| {
                let full = Self::workers_per_instance_full(shape, resources_per_worker);
                if full == 0 {
                    return None;
                }
                let price_per_worker_hour = shape.price_per_hour / full as f64;
                Some((shape, full, price_per_worker_hour))
            })
            .collect();

        if candidates.is_empty() {
            return Err(SelectorError::NoSuitableShape);
        }

        candidates.sort_by(|a, b| Self::tie_break(a.0, a.2, b.0, b.2));

        let (bulk_shape, bulk_full, _) = candidates[0];
        let mut choices = Vec::new();
        let mut remaining = num_workers;

        while remaining > bulk_full {
            choices.push(InstanceTypeChoice {
                instance_type: bulk_shape.clone(),
                workers_per_instance_full: bulk_full,
                workers_per_instance_actual: bulk_full,
            });
            remaining -= bulk_full;
        }

        // The tail instance is paid for in full regardless of how many of its slots the
        // remaining workers fill, so rank candidates by actual instance price here, not
        // by price-per-worker-hour at full occupancy.
        let (last_shape, last_full, _) = *candidates
            .iter()
            .filter(|(_, full, _)| *full >= remaining)
            .min_by(|a, b| Self::tie_break(a.0, a.0.price_per_hour, b.0, b.0.price_per_hour))
            .expect("bulk shape alone always satisfies workers_per_instance_full >= remaining");

        choices.push(InstanceTypeChoice {
            instance_type: last_shape.clone(),
            workers_per_instance_full: last_full,
            workers_per_instance_actual: remaining,
        });

        Ok(choices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(
        name: &str,
        cpu: u32,
        mem: f64,
        price: f64,
        interruption: f64,
        kind: OnDemandOrSpot,
    ) -> InstanceTypeInfo {
        InstanceTypeInfo {
            name: name.to_string(),
            logical_cpu: cpu,
            memory_gb: mem,
            price_per_hour: price,
            interruption_probability_percent: interruption,
            on_demand_or_spot: kind,
        }
    }

    #[test]
    fn test_resources_subtract_clamps_to_none_on_negative() {
        let total = Resources::new(4.0, 2);
        let too_much = Resources::new(8.0, 1);
        assert!(total.subtract(&too_much).is_none());

        let fits = Resources::new(2.0, 1);
        let remaining = total.subtract(&fits).unwrap();
        assert_eq!(remaining, Resources::new(2.0, 1));
    }

    #[test]
    fn test_resources_dominates() {
        let available = Resources::new(8.0, 4);
        assert!(available.dominates(&Resources::new(4.0, 2)));
        assert!(!available.dominates(&Resources::new(16.0, 1)));
    }

    #[test]
    fn test_choose_zero_workers_is_empty() {
        let catalog = Catalog::new(vec![shape(
            "m.small",
            1,
            1.0,
            0.1,
            5.0,
            OnDemandOrSpot::OnDemand,
        )]);
        let choices = catalog.choose(&Resources::new(1.0, 1), 0, 50.0).unwrap();
        assert!(choices.is_empty());
    }

    #[test]
    fn test_choose_picks_cheapest_price_per_worker_hour() {
        // m.dense packs 4 workers at $0.40/hr => $0.10/worker-hr
        // m.loose packs 2 workers at $0.30/hr => $0.15/worker-hr
        let dense = shape("m.dense", 4, 4.0, 0.40, 5.0, OnDemandOrSpot::OnDemand);
        let loose = shape("m.loose", 2, 2.0, 0.30, 5.0, OnDemandOrSpot::OnDemand);
        let catalog = Catalog::new(vec![loose, dense]);

        let choices = catalog.choose(&Resources::new(1.0, 1), 4, 50.0).unwrap();
        assert_eq!(choices.len(), 1);
        assert_eq!(choices[0].instance_type.name, "m.dense");
        assert_eq!(choices[0].workers_per_instance_actual, 4);
    }

    #[test]
    fn test_choose_last_shape_avoids_wasting_a_large_instance() {
        // Bulk-cheapest is m.dense ($0.10/worker-hr, holds 4). For 1 remaining worker
        // after 4 are covered, m.small ($0.12/worker-hr alone, but fits exactly 1)
        // should be preferred for the tail over launching a whole second m.dense.
        let dense = shape("m.dense", 4, 4.0, 0.40, 5.0, OnDemandOrSpot::OnDemand);
        let small = shape("m.small", 1, 1.0, 0.12, 5.0, OnDemandOrSpot::OnDemand);
        let catalog = Catalog::new(vec![dense, small]);

        let choices = catalog.choose(&Resources::new(1.0, 1), 5, 50.0).unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0].instance_type.name, "m.dense");
        assert_eq!(choices[0].workers_per_instance_actual, 4);
        assert_eq!(choices[1].instance_type.name, "m.small");
        assert_eq!(choices[1].workers_per_instance_actual, 1);
    }

    #[test]
    fn test_choose_respects_interruption_ceiling() {
        let cheap_spot = shape("spot.cheap", 2, 2.0, 0.05, 90.0, OnDemandOrSpot::Spot);
        let safe_on_demand = shape("od.safe", 2, 2.0, 0.20, 2.0, OnDemandOrSpot::OnDemand);
        let catalog = Catalog::new(vec![cheap_spot, safe_on_demand]);

        let choices = catalog.choose(&Resources::new(1.0, 1), 2, 10.0).unwrap();
        assert_eq!(choices[0].instance_type.name, "od.safe");
    }

    #[test]
    fn test_choose_fails_when_catalog_empty_after_filtering() {
        let catalog = Catalog::new(vec![shape(
            "tiny",
            1,
            1.0,
            0.05,
            80.0,
            OnDemandOrSpot::OnDemand,
        )]);
        let err = catalog
            .choose(&Resources::new(64.0, 32), 1, 80.0)
            .unwrap_err();
        assert_eq!(err, SelectorError::NoSuitableShape);
    }

    #[test]
    fn test_choose_tie_break_prefers_on_demand_then_price_then_name() {
        let spot = shape("a.spot", 1, 1.0, 0.10, 5.0, OnDemandOrSpot::Spot);
        let on_demand = shape("b.ondemand", 1, 1.0, 0.10, 5.0, OnDemandOrSpot::OnDemand);
        let catalog = Catalog::new(vec![spot, on_demand]);

        let choices = catalog.choose(&Resources::new(1.0, 1), 1, 50.0).unwrap();
        assert_eq!(choices[0].instance_type.name, "b.ondemand");
    }
}
