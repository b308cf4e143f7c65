//! Value-at-risk quotes for a firm's book.
//!
//! Each firm carries its own [`RiskModel`]. Models differ only in how badly
//! they misjudge each category (`inaccuracy`), which is what makes firms
//! disagree about how much they can write.

use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::profile::ReinsuranceProfile;
use crate::risk::{InsuranceType, RiskProperties, UnderwrittenRisk};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModel {
    inaccuracy: Vec<f64>,
    margin_of_safety: f64,
    var_tail_prob: f64,
    init_average_exposure: f64,
    init_average_risk_factor: f64,
}

/// Result of pricing the current book.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioEvaluation {
    /// Number of additional primary risks each category can still absorb.
    pub acceptable_by_category: Vec<usize>,
    pub cash_left_by_category: Vec<f64>,
    pub var_per_risk_per_category: Vec<f64>,
    /// Cash left in the tightest category.
    pub excess_capital: f64,
}

/// Result of pricing the current book plus one offered excess-of-loss risk.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferEvaluation {
    pub acceptable: bool,
    pub cash_left_by_category: Vec<f64>,
    /// Value at risk added by the offer; zero when it is not acceptable.
    pub var_this_risk: f64,
    pub excess_capital: f64,
}

impl RiskModel {
    /// Model number `index` over- and under-estimates alternate categories.
    pub fn new(config: &SimulationConfig, index: usize) -> Self {
        let p = config.riskmodel.inaccuracy_parameter;
        let inaccuracy = (0..config.no_categories)
            .map(|c| if (index + c) % 2 == 0 { 1.0 / p } else { p })
            .collect();
        RiskModel {
            inaccuracy,
            margin_of_safety: config.riskmodel.margin_of_safety,
            var_tail_prob: config.riskmodel.var_tail_probability,
            init_average_exposure: config.risk_value,
            init_average_risk_factor: config.risk_factor_mean(),
        }
    }

    pub fn categories(&self) -> usize {
        self.inaccuracy.len()
    }

    pub fn inaccuracy(&self, category: usize) -> f64 {
        self.inaccuracy[category]
    }

    pub fn margin_of_safety(&self) -> f64 {
        self.margin_of_safety
    }

    /// Damage fraction at the `1 − tail` quantile of the uniform severity.
    pub fn gross_damage_quantile(&self) -> f64 {
        1.0 - self.var_tail_prob
    }

    /// Damage quantile the firm keeps after its excess-of-loss layers: the
    /// parts of `[0, q)` covered by a layer are carved out.
    pub fn retained_damage_quantile(&self, category: usize, profile: Option<&ReinsuranceProfile>) -> f64 {
        let q = self.gross_damage_quantile();
        let ceded: f64 = profile
            .map(|p| {
                p.layers(category)
                    .iter()
                    .map(|l| (l.upper.min(q) - l.lower).max(0.0))
                    .sum()
            })
            .unwrap_or(0.0);
        (q - ceded).max(0.0)
    }

    /// Expected claim of an excess-of-loss risk at the VaR quantile.
    pub fn expected_layer_claim(&self, category: usize, value: f64, risk_factor: f64, deductible_fraction: f64, limit_fraction: f64) -> f64 {
        let damage_fraction = self.gross_damage_quantile() * risk_factor * self.inaccuracy[category];
        ((damage_fraction.min(limit_fraction) - deductible_fraction) * value).max(0.0)
    }

    /// Price the current book against `cash`, category by category.
    pub fn evaluate(&self, risks: &[UnderwrittenRisk], cash: f64, profile: Option<&ReinsuranceProfile>) -> PortfolioEvaluation {
        let (layers, proportional): (Vec<&UnderwrittenRisk>, Vec<&UnderwrittenRisk>) =
            risks.iter().partition(|r| r.insurance_type == InsuranceType::ExcessOfLoss);
        let mut cash_left = vec![cash; self.categories()];
        if !layers.is_empty() {
            self.reserve_for_layers(&layers, &mut cash_left);
        }
        self.evaluate_proportional(&proportional, cash_left, profile)
    }

    /// Price the book plus `offered`, deciding whether the offer fits.
    pub fn evaluate_offer(&self, risks: &[UnderwrittenRisk], cash: f64, offered: &RiskProperties, profile: Option<&ReinsuranceProfile>) -> OfferEvaluation {
        let (layers, proportional): (Vec<&UnderwrittenRisk>, Vec<&UnderwrittenRisk>) =
            risks.iter().partition(|r| r.insurance_type == InsuranceType::ExcessOfLoss);
        let mut cash_left = vec![cash; self.categories()];
        self.reserve_for_layers(&layers, &mut cash_left);

        let additional_var = self.expected_layer_claim(
            offered.category,
            offered.value,
            offered.risk_factor,
            offered.deductible_fraction(),
            offered.limit_fraction(),
        );
        let mut additional_required = vec![0.0; self.categories()];
        additional_required[offered.category] = additional_var * self.margin_of_safety;

        if !proportional.is_empty() {
            cash_left = self.evaluate_proportional(&proportional, cash_left, profile).cash_left_by_category;
        }

        let acceptable = cash_left.iter().zip(&additional_required).all(|(left, req)| left - req > 0.0);
        let excess_capital = min_of(&cash_left);
        OfferEvaluation {
            acceptable,
            cash_left_by_category: cash_left,
            var_this_risk: if acceptable { additional_var } else { 0.0 },
            excess_capital,
        }
    }

    fn reserve_for_layers(&self, layers: &[&UnderwrittenRisk], cash_left: &mut [f64]) {
        for risk in layers {
            let claim = self.expected_layer_claim(
                risk.category,
                risk.value,
                risk.risk_factor,
                risk.deductible_fraction,
                risk.limit_fraction,
            );
            cash_left[risk.category] -= claim * self.margin_of_safety;
        }
    }

    fn evaluate_proportional(&self, risks: &[&UnderwrittenRisk], mut cash_left: Vec<f64>, profile: Option<&ReinsuranceProfile>) -> PortfolioEvaluation {
        let n = self.categories();
        let mut acceptable = vec![0usize; n];
        let mut var_per_risk_per_category = vec![0.0; n];

        for category in 0..n {
            let in_category: Vec<&&UnderwrittenRisk> = risks.iter().filter(|r| r.category == category).collect();
            let count = in_category.len() as f64;
            let (average_exposure, average_risk_factor) = if in_category.is_empty() {
                (self.init_average_exposure, self.init_average_risk_factor * self.inaccuracy[category])
            } else {
                let exposure = in_category.iter().map(|r| r.value * (1.0 - r.deductible_fraction)).sum::<f64>() / count;
                let rf = in_category.iter().map(|r| r.risk_factor).sum::<f64>() / count;
                (exposure, rf * self.inaccuracy[category])
            };
            let var_per_risk = self.retained_damage_quantile(category, profile)
                * average_risk_factor
                * average_exposure
                * self.margin_of_safety;
            var_per_risk_per_category[category] = var_per_risk;
            cash_left[category] -= var_per_risk * count;
            if var_per_risk > 0.0 && cash_left[category] > 0.0 {
                acceptable[category] = (cash_left[category] / var_per_risk).floor() as usize;
            }
        }

        let excess_capital = min_of(&cash_left);
        PortfolioEvaluation {
            acceptable_by_category: acceptable,
            cash_left_by_category: cash_left,
            var_per_risk_per_category,
            excess_capital,
        }
    }
}

fn min_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, f64::min)
}
