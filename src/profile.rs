//! Per-firm record of which slices of each category are already reinsured,
//! and the planner that carves the remaining band into tranches.
//!
//! Intervals are kept as fractions of the category's total insured value.
//! Adjacent layers share endpoints exactly: the planner only ever emits
//! existing endpoints, band bounds or midpoints, so no rounding creeps in
//! between a layer's upper bound and its neighbour's lower bound.

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::{ContractId, FirmId};

/// Tolerance for comparing interval endpoints.
const EPS: f64 = 1e-9;

/// Smallest layer worth issuing, in absolute value units.
const MIN_TRANCHE_VALUE: f64 = 2.0;

/// Smallest layer worth issuing, as a share of the band width.
const MIN_TRANCHE_BAND_SHARE: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub lower: f64,
    pub upper: f64,
    /// Absolute attachment of the contract at issuance.
    pub deductible: f64,
    /// Absolute exhaustion point of the contract at issuance.
    pub limit: f64,
    pub contract: ContractId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinsuranceProfile {
    firm: FirmId,
    band_lower: f64,
    band_upper: f64,
    layers: Vec<Vec<Layer>>,
}

impl ReinsuranceProfile {
    pub fn new(firm: FirmId, categories: usize, band_lower: f64, band_upper: f64) -> Self {
        ReinsuranceProfile { firm, band_lower, band_upper, layers: vec![Vec::new(); categories] }
    }

    pub fn band(&self) -> (f64, f64) {
        (self.band_lower, self.band_upper)
    }

    pub fn categories(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self, category: usize) -> &[Layer] {
        &self.layers[category]
    }

    /// Record a placed layer. Fails if it leaves the band or overlaps an
    /// existing layer; both mean the caller broke the allocation protocol.
    pub fn add(&mut self, category: usize, contract: ContractId, lower: f64, upper: f64, deductible: f64, limit: f64) -> Result<(), SimError> {
        if lower < self.band_lower - EPS || upper > self.band_upper + EPS || upper <= lower {
            return Err(SimError::TrancheOutOfBand {
                firm: self.firm,
                category,
                lower,
                upper,
                band_lower: self.band_lower,
                band_upper: self.band_upper,
            });
        }
        if let Some(existing) = self.overlapping(category, lower, upper) {
            return Err(SimError::OverlappingTranche { firm: self.firm, category, lower, upper, existing });
        }
        let layers = &mut self.layers[category];
        let at = layers.partition_point(|l| l.lower < lower);
        layers.insert(at, Layer { lower, upper, deductible, limit, contract });
        Ok(())
    }

    /// Whether `[lower, upper)` could be added without breaking the invariants.
    pub fn can_add(&self, category: usize, lower: f64, upper: f64) -> bool {
        lower >= self.band_lower - EPS
            && upper <= self.band_upper + EPS
            && upper > lower
            && self.overlapping(category, lower, upper).is_none()
    }

    fn overlapping(&self, category: usize, lower: f64, upper: f64) -> Option<ContractId> {
        self.layers[category]
            .iter()
            .find(|l| l.lower < upper - EPS && lower < l.upper - EPS)
            .map(|l| l.contract)
    }

    /// Release the interval held by `contract`. Returns whether it was present.
    pub fn remove(&mut self, category: usize, contract: ContractId) -> bool {
        let layers = &mut self.layers[category];
        match layers.iter().position(|l| l.contract == contract) {
            Some(i) => {
                layers.remove(i);
                true
            }
            None => false,
        }
    }

    /// Gaps in `[0, 1]` not covered by any layer.
    pub fn uncovered(&self, category: usize) -> Vec<(f64, f64)> {
        let mut gaps = Vec::new();
        let mut cursor = 0.0_f64;
        for layer in &self.layers[category] {
            if layer.lower - cursor > EPS {
                gaps.push((cursor, layer.lower));
            }
            cursor = cursor.max(layer.upper);
        }
        if 1.0 - cursor > EPS {
            gaps.push((cursor, 1.0));
        }
        gaps
    }

    /// Uncovered gaps clipped to the firm's reinsurable band.
    pub fn uncovered_in_band(&self, category: usize) -> Vec<(f64, f64)> {
        self.uncovered(category)
            .into_iter()
            .filter_map(|(lo, hi)| {
                let lo = lo.max(self.band_lower);
                let hi = hi.min(self.band_upper);
                (hi - lo > EPS).then_some((lo, hi))
            })
            .collect()
    }

    pub fn is_fully_covered(&self, category: usize) -> bool {
        self.uncovered_in_band(category).is_empty()
    }

    /// Share of the band still uncovered, averaged over categories.
    pub fn mean_uncovered_band_fraction(&self) -> f64 {
        if self.layers.is_empty() {
            return 0.0;
        }
        let total: f64 = (0..self.layers.len())
            .map(|c| self.uncovered_in_band(c).iter().map(|(lo, hi)| hi - lo).sum::<f64>())
            .sum();
        total / self.layers.len() as f64
    }

    /// Carve the uncovered part of the band into layers for a category
    /// worth `total_value`. Returns fraction intervals, lowest first, or
    /// nothing when no gap is large enough to be worth placing.
    pub fn plan_tranches(&self, category: usize, total_value: f64, min_tranches: usize) -> Vec<(f64, f64)> {
        if total_value <= 0.0 {
            return Vec::new();
        }
        let band_width = (self.band_upper - self.band_lower) * total_value;
        let min_width = MIN_TRANCHE_VALUE.max(MIN_TRANCHE_BAND_SHARE * band_width);

        let mut tranches: Vec<(f64, f64)> = self
            .uncovered_in_band(category)
            .into_iter()
            .filter(|(lo, hi)| (hi - lo) * total_value >= min_width)
            .collect();
        if tranches.is_empty() {
            return tranches;
        }
        while tranches.len() < min_tranches {
            if !split_longest(&mut tranches) {
                break;
            }
        }
        tranches
    }

    /// Layers attached below `damage`, i.e. every layer the claim reaches.
    pub fn contracts_to_explode(&self, category: usize, damage: f64) -> Vec<ContractId> {
        self.layers[category].iter().filter(|l| l.deductible < damage).map(|l| l.contract).collect()
    }
}

/// Index of the widest non-empty interval, the first one on ties (widths
/// within `EPS` count as tied).
pub fn widest(tranches: &[(f64, f64)]) -> Option<usize> {
    let mut widest: Option<(usize, f64)> = None;
    for (i, (lo, hi)) in tranches.iter().enumerate() {
        let width = hi - lo;
        let to_beat = widest.map_or(EPS, |(_, w)| w + EPS);
        if width > to_beat {
            widest = Some((i, width));
        }
    }
    widest.map(|(i, _)| i)
}

/// Bisect the widest interval in place. Returns false if every interval
/// is empty.
pub fn split_longest(tranches: &mut Vec<(f64, f64)>) -> bool {
    let Some(i) = widest(tranches) else {
        return false;
    };
    let (lo, hi) = tranches[i];
    let mid = (lo + hi) / 2.0;
    tranches[i] = (lo, mid);
    tranches.insert(i + 1, (mid, hi));
    true
}
