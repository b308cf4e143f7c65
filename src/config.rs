use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How insurers cede risk to reinsurers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReinsuranceType {
    /// Excess-of-loss layers per category, allocated through the tranche planner.
    NonProportional,
    /// Per-contract quota share with the full share ceded.
    Proportional,
}

impl FromStr for ReinsuranceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "non-proportional" => Ok(ReinsuranceType::NonProportional),
            "proportional" => Ok(ReinsuranceType::Proportional),
            other => Err(ConfigError::UnknownReinsuranceType(other.to_string())),
        }
    }
}

impl TryFrom<String> for ReinsuranceType {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ReinsuranceType> for String {
    fn from(t: ReinsuranceType) -> Self {
        t.to_string()
    }
}

impl fmt::Display for ReinsuranceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReinsuranceType::NonProportional => write!(f, "non-proportional"),
            ReinsuranceType::Proportional => write!(f, "proportional"),
        }
    }
}

/// Per-class parameters shared by every insurer (or every reinsurer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmClassConfig {
    pub count: usize,
    pub initial_cash: f64,
    /// Tolerated dispersion of reserved cash across categories.
    pub balance_ratio: f64,
    /// Upper bound on underwriting passes per tick.
    pub recursion_limit: usize,
    /// Probability that a maturing contract is kept for renewal.
    pub retention: f64,
    /// Per-tick probability that a new firm of this class enters.
    pub entry_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactorConfig {
    pub present: bool,
    pub lower_bound: f64,
    pub upper_bound: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractConfig {
    pub mean_runtime: u64,
    pub runtime_halfspread: u64,
    pub payment_period: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub norm_profit_markup: f64,
    pub upper_price_limit: f64,
    pub lower_price_limit: f64,
    /// Share of the ceding firm's premium income paid for an excess-of-loss layer.
    pub reinsurance_premium_share: f64,
    /// Per-value, per-period premium promised to cat bond investors.
    pub cat_bond_per_value_premium: f64,
    pub reinsurance_off: bool,
    pub catbonds_off: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskModelConfig {
    pub count: usize,
    /// Values >= 1; each model over- or under-estimates alternate categories by this factor.
    pub inaccuracy_parameter: f64,
    /// Values >= 1; liquidity held beyond the value at risk.
    pub margin_of_safety: f64,
    /// Tail probability at which value at risk is taken.
    pub var_tail_probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinsuranceConfig {
    pub reinsurance_type: ReinsuranceType,
    pub deductible_fraction: f64,
    pub limit_fraction: f64,
    pub min_tranches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityConfig {
    pub decrement_threshold: f64,
    pub increment_threshold: f64,
    pub decrement_factor: f64,
    pub increment_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub max_time: u64,
    pub no_categories: usize,
    pub no_risks: usize,
    pub risk_value: f64,
    pub risk_factors: RiskFactorConfig,
    /// Mean ticks between catastrophes in one category.
    pub event_time_mean_separation: f64,
    pub expire_immediately: bool,
    pub money_supply: f64,
    pub dividend_share_of_profits: f64,
    pub interest_rate: f64,
    pub contracts: ContractConfig,
    pub pricing: PricingConfig,
    pub riskmodel: RiskModelConfig,
    pub reinsurance: ReinsuranceConfig,
    pub capacity: CapacityConfig,
    pub insurers: FirmClassConfig,
    pub reinsurers: FirmClassConfig,
}

impl SimulationConfig {
    pub fn canonical() -> Self {
        SimulationConfig {
            seed: 42,
            max_time: 1000,
            no_categories: 4,
            no_risks: 20_000,
            risk_value: 1000.0,
            risk_factors: RiskFactorConfig { present: false, lower_bound: 0.4, upper_bound: 0.6 },
            event_time_mean_separation: 100.0 / 3.0,
            expire_immediately: false,
            money_supply: 2_000_000_000.0,
            dividend_share_of_profits: 0.4,
            interest_rate: 0.001,
            contracts: ContractConfig { mean_runtime: 12, runtime_halfspread: 2, payment_period: 3 },
            pricing: PricingConfig {
                norm_profit_markup: 0.15,
                upper_price_limit: 1.2,
                lower_price_limit: 0.85,
                reinsurance_premium_share: 0.3,
                cat_bond_per_value_premium: 0.0,
                reinsurance_off: false,
                catbonds_off: false,
            },
            riskmodel: RiskModelConfig {
                count: 3,
                inaccuracy_parameter: 2.0,
                margin_of_safety: 2.0,
                var_tail_probability: 0.005,
            },
            reinsurance: ReinsuranceConfig {
                reinsurance_type: ReinsuranceType::NonProportional,
                deductible_fraction: 0.25,
                limit_fraction: 1.0,
                min_tranches: 1,
            },
            capacity: CapacityConfig {
                decrement_threshold: 1.2,
                increment_threshold: 1.8,
                decrement_factor: 24.0 / 25.0,
                increment_factor: 25.0 / 24.0,
            },
            insurers: FirmClassConfig {
                count: 20,
                initial_cash: 80_000.0,
                balance_ratio: 0.1,
                recursion_limit: 50,
                retention: 0.85,
                entry_probability: 0.3,
            },
            reinsurers: FirmClassConfig {
                count: 4,
                initial_cash: 2_000_000.0,
                balance_ratio: 20.0,
                recursion_limit: 10,
                retention: 1.0,
                entry_probability: 0.05,
            },
        }
    }

    /// Load a config from a JSON file and validate it.
    pub fn from_json_file(path: &str) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
        let config: SimulationConfig = serde_json::from_str(&text)
            .map_err(|source| ConfigError::Parse { path: path.to_string(), source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run. Called at setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(ok: bool, field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            if ok { Ok(()) } else { Err(ConfigError::InvalidBounds { field, reason: reason.into() }) }
        }
        fn probability(p: f64, field: &'static str) -> Result<(), ConfigError> {
            check((0.0..=1.0).contains(&p), field, format!("{p} is not a probability"))
        }

        check(self.no_categories > 0, "no_categories", "must be positive")?;
        check(self.risk_value > 0.0, "risk_value", "must be positive")?;
        check(self.money_supply >= 0.0, "money_supply", "must be non-negative")?;
        check(
            self.event_time_mean_separation > 0.0,
            "event_time_mean_separation",
            "must be positive",
        )?;
        check(self.interest_rate >= 0.0, "interest_rate", "must be non-negative")?;
        probability(self.dividend_share_of_profits, "dividend_share_of_profits")?;

        let rf = &self.risk_factors;
        check(
            0.0 <= rf.lower_bound && rf.lower_bound <= rf.upper_bound && rf.upper_bound <= 1.0,
            "risk_factors",
            format!("need 0 <= {} <= {} <= 1", rf.lower_bound, rf.upper_bound),
        )?;

        let c = &self.contracts;
        check(c.mean_runtime > 0, "contracts.mean_runtime", "must be positive")?;
        check(
            c.runtime_halfspread < c.mean_runtime,
            "contracts.runtime_halfspread",
            format!("{} must be below the mean runtime {}", c.runtime_halfspread, c.mean_runtime),
        )?;
        check(c.payment_period > 0, "contracts.payment_period", "must be positive")?;

        let p = &self.pricing;
        check(
            0.0 < p.lower_price_limit && p.lower_price_limit <= p.upper_price_limit,
            "pricing",
            format!("need 0 < lower {} <= upper {}", p.lower_price_limit, p.upper_price_limit),
        )?;
        check(p.norm_profit_markup >= 0.0, "pricing.norm_profit_markup", "must be non-negative")?;
        check(
            p.reinsurance_premium_share >= 0.0,
            "pricing.reinsurance_premium_share",
            "must be non-negative",
        )?;
        check(
            p.cat_bond_per_value_premium >= 0.0,
            "pricing.cat_bond_per_value_premium",
            "must be non-negative",
        )?;

        let m = &self.riskmodel;
        check(m.count > 0, "riskmodel.count", "must be positive")?;
        check(m.inaccuracy_parameter >= 1.0, "riskmodel.inaccuracy_parameter", "must be >= 1")?;
        check(m.margin_of_safety >= 1.0, "riskmodel.margin_of_safety", "must be >= 1")?;
        check(
            0.0 < m.var_tail_probability && m.var_tail_probability < 1.0,
            "riskmodel.var_tail_probability",
            "must lie in (0, 1)",
        )?;

        let r = &self.reinsurance;
        check(
            0.0 <= r.deductible_fraction && r.deductible_fraction < r.limit_fraction && r.limit_fraction <= 1.0,
            "reinsurance",
            format!("need 0 <= deductible {} < limit {} <= 1", r.deductible_fraction, r.limit_fraction),
        )?;
        check(r.min_tranches > 0, "reinsurance.min_tranches", "must be positive")?;

        let cap = &self.capacity;
        check(
            cap.decrement_threshold <= cap.increment_threshold,
            "capacity",
            format!(
                "decrement threshold {} exceeds increment threshold {}",
                cap.decrement_threshold, cap.increment_threshold
            ),
        )?;
        check(
            0.0 < cap.decrement_factor && cap.decrement_factor <= 1.0,
            "capacity.decrement_factor",
            "must lie in (0, 1]",
        )?;
        check(cap.increment_factor >= 1.0, "capacity.increment_factor", "must be >= 1")?;

        for (name, class) in [("insurers", &self.insurers), ("reinsurers", &self.reinsurers)] {
            check(class.initial_cash >= 0.0, name, "initial cash must be non-negative")?;
            check(class.balance_ratio > 0.0, name, "balance ratio must be positive")?;
            check(class.recursion_limit > 0, name, "recursion limit must be positive")?;
            probability(class.retention, name)?;
            probability(class.entry_probability, name)?;
        }

        Ok(())
    }

    /// Mean of the category severity distribution (uniform on [0, 1)).
    pub fn damage_mean(&self) -> f64 {
        0.5
    }

    pub fn risk_factor_mean(&self) -> f64 {
        if self.risk_factors.present {
            (self.risk_factors.lower_bound + self.risk_factors.upper_bound) / 2.0
        } else {
            1.0
        }
    }

    /// Probability that a contract sees at least one catastrophe during its runtime.
    pub fn expected_damage_frequency(&self) -> f64 {
        let runtime = self.contracts.mean_runtime as f64;
        if self.expire_immediately {
            1.0 - (-runtime / self.event_time_mean_separation).exp()
        } else {
            runtime / self.event_time_mean_separation
        }
    }

    /// Break-even premium per unit of value over a contract's runtime, plus markup.
    pub fn norm_premium(&self) -> f64 {
        self.expected_damage_frequency()
            * self.damage_mean()
            * self.risk_factor_mean()
            * (1.0 + self.pricing.norm_profit_markup)
    }
}
