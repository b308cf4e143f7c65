//! Insurers and reinsurers.
//!
//! Both roles share one [`Firm`] type: the same cash, book, ledger and
//! capacity arithmetic. [`Role`] switches the few steps that differ (which
//! pool a firm draws from, whether it buys cover, how it renews). The
//! per-tick sequence that touches other agents lives in [`crate::cycle`];
//! this module holds the firm's own state and the arithmetic behind its
//! decisions.

use serde::{Deserialize, Serialize};

use crate::config::{CapacityConfig, ReinsuranceType, SimulationConfig};
use crate::contract::Contracts;
use crate::ledger::ObligationLedger;
use crate::profile::ReinsuranceProfile;
use crate::risk::{RiskProperties, UnderwrittenRisk};
use crate::riskmodel::RiskModel;
use crate::types::{ContractId, FirmId};

/// Share of starting cash a new firm aims to keep as capacity.
const INITIAL_CAPACITY_TARGET_SHARE: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Insurer,
    Reinsurer,
}

/// Behavioural parameters, fixed for the firm's life.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmParams {
    pub capacity: CapacityConfig,
    pub dividend_share_of_profits: f64,
    pub interest_rate: f64,
    pub reinsurance_type: ReinsuranceType,
    pub deductible_fraction: f64,
    pub limit_fraction: f64,
    pub premium_share: f64,
    pub min_tranches: usize,
    pub balance_ratio: f64,
    pub recursion_limit: usize,
    pub retention: f64,
    pub mean_runtime: u64,
    pub runtime_halfspread: u64,
    pub payment_period: u64,
    pub expire_immediately: bool,
    pub cat_bond_per_value_premium: f64,
}

impl FirmParams {
    pub fn from_config(config: &SimulationConfig, role: Role) -> Self {
        let class = match role {
            Role::Insurer => &config.insurers,
            Role::Reinsurer => &config.reinsurers,
        };
        FirmParams {
            capacity: config.capacity.clone(),
            dividend_share_of_profits: config.dividend_share_of_profits,
            interest_rate: config.interest_rate,
            reinsurance_type: config.reinsurance.reinsurance_type,
            deductible_fraction: config.reinsurance.deductible_fraction,
            limit_fraction: config.reinsurance.limit_fraction,
            premium_share: config.pricing.reinsurance_premium_share,
            min_tranches: config.reinsurance.min_tranches,
            balance_ratio: class.balance_ratio,
            recursion_limit: class.recursion_limit,
            retention: class.retention,
            mean_runtime: config.contracts.mean_runtime,
            runtime_halfspread: config.contracts.runtime_halfspread,
            payment_period: config.contracts.payment_period,
            expire_immediately: config.expire_immediately,
            cat_bond_per_value_premium: config.pricing.cat_bond_per_value_premium,
        }
    }
}

/// Aggregate of a firm's book in one category.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CategoryExposure {
    pub total_value: f64,
    pub average_risk_factor: f64,
    pub number_risks: usize,
    pub periodized_total_premium: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firm {
    pub id: FirmId,
    pub role: Role,
    pub cash: f64,
    pub capacity_target: f64,
    pub excess_capital: f64,
    /// Income minus outgoings (dividends excluded) in the current tick.
    pub profits_losses: f64,
    pub per_period_dividend: f64,
    pub operational: bool,
    pub contracts: Vec<ContractId>,
    pub obligations: ObligationLedger,
    pub profile: ReinsuranceProfile,
    pub risk_model: RiskModel,
    /// Maturing risks held back to be renewed next tick.
    pub risks_kept: Vec<RiskProperties>,
    /// Number of new risks this firm may take from its pool this tick.
    pub risk_weight: usize,
    /// Cash reported when the firm last drew from its pool.
    pub weight_basis: f64,
    pub params: FirmParams,
}

impl Firm {
    pub fn new(id: FirmId, role: Role, cash: f64, risk_model: RiskModel, params: FirmParams) -> Self {
        let categories = risk_model.categories();
        let profile = ReinsuranceProfile::new(id, categories, params.deductible_fraction, params.limit_fraction);
        Firm {
            id,
            role,
            cash,
            capacity_target: cash * INITIAL_CAPACITY_TARGET_SHARE,
            excess_capital: cash,
            profits_losses: 0.0,
            per_period_dividend: 0.0,
            operational: true,
            contracts: Vec::new(),
            obligations: ObligationLedger::new(),
            profile,
            risk_model,
            risks_kept: Vec::new(),
            risk_weight: 0,
            weight_basis: cash,
            params,
        }
    }

    pub fn receive(&mut self, amount: f64) {
        self.cash += amount;
        self.profits_losses += amount;
    }

    // ── Capacity ──────────────────────────────────────────────────────────────

    /// `max_var` grossed up by the exposure the firm could still lay off:
    /// the uncovered share of its reinsurable band, averaged over categories.
    pub fn reinsurance_var_estimate(&self, max_var: f64) -> f64 {
        max_var * (1.0 + self.profile.mean_uncovered_band_fraction())
    }

    /// Move the capacity target by a fixed factor when the target/VaR ratio
    /// leaves the hysteresis band; leave it alone inside the band.
    pub fn adjust_capacity_target(&mut self, max_var: f64) {
        let estimate = self.reinsurance_var_estimate(max_var);
        let denominator = max_var + estimate;
        let ratio = if denominator == 0.0 {
            f64::INFINITY
        } else {
            (self.capacity_target + estimate) / denominator
        };
        let c = &self.params.capacity;
        if ratio > c.increment_threshold {
            self.capacity_target *= c.increment_factor;
        } else if ratio < c.decrement_threshold {
            self.capacity_target *= c.decrement_factor;
        }
    }

    /// Capacity counts potential reinsurance only while cash covers the VaR.
    pub fn get_capacity(&self, max_var: f64) -> f64 {
        if max_var < self.cash {
            self.cash + self.reinsurance_var_estimate(max_var)
        } else {
            self.cash
        }
    }

    // ── Dividends ─────────────────────────────────────────────────────────────

    pub fn adjust_dividends(&mut self, actual_capacity: f64) {
        self.per_period_dividend = if actual_capacity < self.capacity_target {
            0.0
        } else {
            (self.params.dividend_share_of_profits * self.profits_losses).max(0.0)
        };
    }

    // ── Book characterisation ─────────────────────────────────────────────────

    /// Live contracts of this firm in `category`, in book order.
    fn book_in<'a>(&'a self, category: usize, contracts: &'a Contracts) -> impl Iterator<Item = &'a crate::contract::Contract> + 'a {
        self.contracts
            .iter()
            .filter_map(move |&id| contracts.get(id))
            .filter(move |c| c.category == category)
    }

    pub fn category_exposure(&self, category: usize, contracts: &Contracts) -> CategoryExposure {
        let mut exposure = CategoryExposure::default();
        let mut risk_factor_sum = 0.0;
        for c in self.book_in(category, contracts) {
            exposure.total_value += c.value;
            exposure.number_risks += 1;
            exposure.periodized_total_premium += c.periodized_premium;
            risk_factor_sum += c.risk_factor;
        }
        if exposure.number_risks > 0 {
            exposure.average_risk_factor = risk_factor_sum / exposure.number_risks as f64;
        }
        exposure
    }

    /// Premium earned per unit of value in `category` over contract runtimes.
    pub fn average_premium(&self, category: usize, contracts: &Contracts) -> f64 {
        let (weighted_premium, value) = self
            .book_in(category, contracts)
            .fold((0.0, 0.0), |(p, v), c| (p + c.periodized_premium * c.runtime as f64, v + c.value));
        if value > 0.0 { weighted_premium / value } else { 0.0 }
    }

    /// The book as the risk model sees it; fully ceded contracts are left out.
    pub fn underwritten_risks(&self, contracts: &Contracts) -> Vec<UnderwrittenRisk> {
        self.contracts
            .iter()
            .filter_map(|&id| contracts.get(id))
            .filter(|c| c.reinsurance_share != Some(1.0))
            .map(|c| c.underwritten_risk())
            .collect()
    }

    // ── Underwriting rule ─────────────────────────────────────────────────────

    /// Accept a risk only if reserved cash stays balanced across categories:
    /// either its dispersion, scaled by how much of the firm's cash is
    /// tied up, stays within `balance_ratio` of the mean, or the risk makes
    /// the spread narrower. Returns the decision and the updated cash left.
    pub fn balanced_portfolio(&self, risk: &RiskProperties, cash_left: &[f64], var_per_risk: &[f64]) -> (bool, Vec<f64>) {
        let reserved: Vec<f64> = cash_left.iter().map(|left| self.cash - left).collect();
        let (_, std_pre) = mean_std(&reserved);

        let mut reserved_post = reserved.clone();
        let added = if risk.is_excess_of_loss() {
            self.risk_model.expected_layer_claim(
                risk.category,
                risk.value,
                risk.risk_factor,
                risk.deductible_fraction(),
                risk.limit_fraction(),
            ) * self.risk_model.margin_of_safety()
        } else {
            var_per_risk.get(risk.category).copied().unwrap_or(0.0)
        };
        reserved_post[risk.category] += added;

        let (mean, std_post) = mean_std(&reserved_post);
        let total_reserved: f64 = reserved_post.iter().sum();
        let utilisation = if self.cash > 0.0 { total_reserved / self.cash } else { f64::INFINITY };

        if std_post * utilisation <= self.params.balance_ratio * mean || std_post < std_pre {
            (true, reserved_post.iter().map(|r| self.cash - r).collect())
        } else {
            (false, cash_left.to_vec())
        }
    }

    /// Draw a contract runtime uniformly from `mean ± halfspread`.
    pub fn draw_runtime(&self, rng: &mut impl rand::Rng) -> u64 {
        let lo = self.params.mean_runtime - self.params.runtime_halfspread;
        let hi = self.params.mean_runtime + self.params.runtime_halfspread;
        rng.random_range(lo..=hi)
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Group risks by category, preserving arrival order within each category.
pub fn risks_by_category(risks: Vec<RiskProperties>, categories: usize) -> Vec<Vec<Option<RiskProperties>>> {
    let mut grouped = vec![Vec::new(); categories];
    for risk in risks {
        let category = risk.category;
        grouped[category].push(Some(risk));
    }
    grouped
}
