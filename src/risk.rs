use serde::{Deserialize, Serialize};

use crate::types::{ContractId, Party, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsuranceType {
    Proportional,
    ExcessOfLoss,
}

/// Terms that only some risks carry. Each variant fixes which optional
/// fields exist, so a risk can never be half-specified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RiskKind {
    /// A single insured property owned by the market's customers.
    Primary,
    /// A category layer offered by a ceding firm.
    ExcessOfLoss {
        number_risks: usize,
        deductible_fraction: f64,
        limit_fraction: f64,
        periodized_total_premium: f64,
        runtime: u64,
        expiration: Tick,
    },
    /// Quota share of one existing primary contract.
    Proportional {
        contract: ContractId,
        reinsurance_share: f64,
        expiration: Tick,
    },
}

/// A risk on offer. Produced by the market (primary risks) or by a firm
/// seeking cover, consumed once it is matched into a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProperties {
    pub value: f64,
    pub category: usize,
    pub owner: Party,
    pub risk_factor: f64,
    pub kind: RiskKind,
}

impl RiskProperties {
    pub fn primary(value: f64, category: usize, risk_factor: f64) -> Self {
        RiskProperties { value, category, owner: Party::Market, risk_factor, kind: RiskKind::Primary }
    }

    pub fn insurance_type(&self) -> InsuranceType {
        match self.kind {
            RiskKind::ExcessOfLoss { .. } => InsuranceType::ExcessOfLoss,
            RiskKind::Primary | RiskKind::Proportional { .. } => InsuranceType::Proportional,
        }
    }

    pub fn deductible_fraction(&self) -> f64 {
        match self.kind {
            RiskKind::ExcessOfLoss { deductible_fraction, .. } => deductible_fraction,
            _ => 0.0,
        }
    }

    pub fn limit_fraction(&self) -> f64 {
        match self.kind {
            RiskKind::ExcessOfLoss { limit_fraction, .. } => limit_fraction,
            _ => 1.0,
        }
    }

    pub fn expiration(&self) -> Option<Tick> {
        match self.kind {
            RiskKind::Primary => None,
            RiskKind::ExcessOfLoss { expiration, .. } | RiskKind::Proportional { expiration, .. } => {
                Some(expiration)
            }
        }
    }

    pub fn is_excess_of_loss(&self) -> bool {
        matches!(self.kind, RiskKind::ExcessOfLoss { .. })
    }
}

/// The slice of a contract a risk model needs to price a book.
#[derive(Debug, Clone, PartialEq)]
pub struct UnderwrittenRisk {
    pub value: f64,
    pub category: usize,
    pub risk_factor: f64,
    pub deductible_fraction: f64,
    pub limit_fraction: f64,
    pub insurance_type: InsuranceType,
    pub runtime: u64,
}
