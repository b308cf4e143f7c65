use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::config::SimulationConfig;
use crate::error::SimError;
use crate::ledger::{ObligationLedger, Purpose};
use crate::risk::RiskProperties;
use crate::types::{Party, Tick};

/// Reinsurance is quoted slightly cheaper the higher the deductible.
const REINSURANCE_DEDUCTIBLE_DISCOUNT: f64 = 0.1;
/// Cat bonds carry a flat surcharge over reinsurance...
const CAT_BOND_SURCHARGE: f64 = 0.5;
/// ...which falls off faster with the deductible.
const CAT_BOND_DEDUCTIBLE_DISCOUNT: f64 = 0.9;

/// Everything outside the firm population: customers, capital providers,
/// the two risk pools and the price signals firms read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub money_supply: f64,
    pub obligations: ObligationLedger,
    /// Primary risks not currently insured.
    pub risks: Vec<RiskProperties>,
    /// Reinsurance requests published this tick; cleared after reinsurers act.
    pub reinrisks: Vec<RiskProperties>,
    norm_premium: f64,
    market_premium: f64,
    reinsurance_market_premium: f64,
    no_risks: usize,
    upper_price_limit: f64,
    lower_price_limit: f64,
    reinsurance_off: bool,
    catbonds_off: bool,
}

impl Market {
    pub fn new(config: &SimulationConfig, risks: Vec<RiskProperties>) -> Self {
        let norm_premium = config.norm_premium();
        Market {
            money_supply: config.money_supply,
            obligations: ObligationLedger::new(),
            risks,
            reinrisks: Vec::new(),
            norm_premium,
            market_premium: norm_premium,
            reinsurance_market_premium: norm_premium,
            no_risks: config.no_risks,
            upper_price_limit: config.pricing.upper_price_limit,
            lower_price_limit: config.pricing.lower_price_limit,
            reinsurance_off: config.pricing.reinsurance_off,
            catbonds_off: config.pricing.catbonds_off,
        }
    }

    // ── Pricing ───────────────────────────────────────────────────────────────

    /// Linear in aggregate capital, clamped to the price corridor.
    fn premium_for_capital(&self, capital: f64) -> f64 {
        let norm = self.norm_premium;
        let premium = norm * (self.upper_price_limit - capital / (norm * self.no_risks as f64));
        premium.clamp(norm * self.lower_price_limit, norm * self.upper_price_limit)
    }

    pub fn adjust_market_premium(&mut self, insurer_capital: f64) {
        self.market_premium = self.premium_for_capital(insurer_capital);
    }

    pub fn adjust_reinsurance_market_premium(&mut self, reinsurer_capital: f64) {
        self.reinsurance_market_premium = self.premium_for_capital(reinsurer_capital);
    }

    pub fn norm_premium(&self) -> f64 {
        self.norm_premium
    }

    pub fn get_market_premium(&self) -> f64 {
        self.market_premium
    }

    pub fn get_reinsurance_market_premium(&self) -> f64 {
        self.reinsurance_market_premium
    }

    /// Per-value price of an excess-of-loss layer above `deductible_fraction`.
    pub fn get_reinsurance_premium(&self, deductible_fraction: f64) -> f64 {
        if self.reinsurance_off {
            return f64::INFINITY;
        }
        self.reinsurance_market_premium * (1.0 - REINSURANCE_DEDUCTIBLE_DISCOUNT * deductible_fraction)
    }

    pub fn get_cat_bond_price(&self, deductible_fraction: f64) -> f64 {
        if self.catbonds_off {
            return f64::INFINITY;
        }
        self.reinsurance_market_premium
            * (1.0 + CAT_BOND_SURCHARGE - CAT_BOND_DEDUCTIBLE_DISCOUNT * deductible_fraction)
    }

    // ── Risk pools ────────────────────────────────────────────────────────────

    pub fn append_reinrisks(&mut self, risk: RiskProperties) {
        self.reinrisks.push(risk);
    }

    /// Hand out the first `weight` primary risks of the pool.
    pub fn solicit_insurance_requests(&mut self, weight: usize) -> Vec<RiskProperties> {
        let n = weight.min(self.risks.len());
        self.risks.drain(..n).collect()
    }

    pub fn solicit_reinsurance_requests(&mut self, weight: usize) -> Vec<RiskProperties> {
        let n = weight.min(self.reinrisks.len());
        self.reinrisks.drain(..n).collect()
    }

    pub fn return_risks(&mut self, risks: Vec<RiskProperties>) {
        self.risks.extend(risks);
    }

    pub fn return_reinrisks(&mut self, risks: Vec<RiskProperties>) {
        self.reinrisks.extend(risks);
    }

    pub fn shuffle_risks(&mut self, rng: &mut impl Rng) {
        self.reinrisks.shuffle(rng);
        self.risks.shuffle(rng);
    }

    pub fn clear_reinrisks(&mut self) {
        self.reinrisks.clear();
    }

    // ── Money ─────────────────────────────────────────────────────────────────

    pub fn receive_obligation(&mut self, amount: f64, recipient: Party, due_time: Tick, purpose: Purpose) {
        self.obligations.receive_obligation(amount, recipient, due_time, purpose);
    }

    pub fn receive(&mut self, amount: f64) {
        self.money_supply += amount;
    }

    /// Take `amount` out of the money supply. Running dry is fatal.
    pub fn withdraw(&mut self, time: Tick, amount: f64) -> Result<(), SimError> {
        if self.money_supply < amount {
            return Err(SimError::MoneySupplyExhausted { time, available: self.money_supply, requested: amount });
        }
        self.money_supply -= amount;
        Ok(())
    }
}

/// Primary risks for the initial pool. Categories are uniform; risk
/// factors are uniform in their bounds only when enabled (else 1, no draw).
pub fn generate_risks(config: &SimulationConfig, rng: &mut impl Rng) -> Vec<RiskProperties> {
    let rf = &config.risk_factors;
    (0..config.no_risks)
        .map(|_| {
            let risk_factor = if rf.present && rf.upper_bound > rf.lower_bound {
                rng.random_range(rf.lower_bound..rf.upper_bound)
            } else if rf.present {
                rf.lower_bound
            } else {
                1.0
            };
            let category = rng.random_range(0..config.no_categories);
            RiskProperties::primary(config.risk_value, category, risk_factor)
        })
        .collect()
}

/// Split `pool_len` new risks across firms in proportion to the cash each
/// reported when it last solicited, floored to whole risks.
pub fn reset_weights(bases: &[f64], pool_len: usize) -> Vec<usize> {
    let total: f64 = bases.iter().sum();
    if total <= 0.0 {
        return vec![0; bases.len()];
    }
    bases
        .iter()
        .map(|b| (b / total * pool_len as f64).floor().max(0.0) as usize)
        .collect()
}
