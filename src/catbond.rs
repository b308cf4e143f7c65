//! Catastrophe bonds.
//!
//! A bond is a fully pre-funded stand-in for a reinsurer: the issuing firm
//! hands it the layer's value at risk plus the discounted coupon stream in
//! one payment, the bond writes a single excess-of-loss contract back to
//! the issuer, pays coupons to its owner (the market) and, once the
//! contract is over, returns whatever cash is left and leaves the market.

use serde::{Deserialize, Serialize};

use crate::ledger::ObligationLedger;
use crate::types::{BondId, ContractId, Party};

/// Present value of `runtime` coupons of `per_period_premium`, the first
/// paid now: `Σ p · (1 + r)^−i` for `i` in `0..runtime`.
pub fn discounted_premium(per_period_premium: f64, interest_rate: f64, runtime: u64) -> f64 {
    let discount = 1.0 / (1.0 + interest_rate);
    (0..runtime).map(|i| per_period_premium * discount.powi(i as i32)).sum()
}

/// Cash a firm must transfer to fund a bond: value at risk plus coupons.
pub fn funding(var: f64, per_period_premium: f64, interest_rate: f64, runtime: u64) -> f64 {
    var + discounted_premium(per_period_premium, interest_rate, runtime)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatBond {
    pub id: BondId,
    pub owner: Party,
    pub cash: f64,
    pub contract: Option<ContractId>,
    pub obligations: ObligationLedger,
    pub per_period_premium: f64,
    pub interest_rate: f64,
    pub operational: bool,
}

impl CatBond {
    pub fn new(id: BondId, per_period_premium: f64, interest_rate: f64) -> Self {
        CatBond {
            id,
            owner: Party::Market,
            cash: 0.0,
            contract: None,
            obligations: ObligationLedger::new(),
            per_period_premium,
            interest_rate,
            operational: true,
        }
    }

    pub fn receive(&mut self, amount: f64) {
        self.cash += amount;
    }
}
