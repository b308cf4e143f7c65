//! Contracts and the arena that owns them.
//!
//! A contract is owned by the [`Contracts`] arena and listed in its
//! insurer's book by [`ContractId`]. Counterparties, linked reinsurance and
//! reinsurance profiles only hold ids, so there are no ownership cycles.
//!
//! State machine: `Active → Expired` (matured or paid out with
//! `expire_immediately`) or `Active → Voided` (insurer dissolved). Terminal
//! states are final; every transition method is a no-op outside `Active`.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::risk::{InsuranceType, RiskProperties, UnderwrittenRisk};
use crate::types::{ContractId, Party, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
    /// Primary cover of a single property.
    Insurance,
    /// Cover bought by a firm, written by a reinsurer or a cat bond.
    Reinsurance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractState {
    Active,
    Expired,
    Voided,
}

/// Pricing and timing agreed when a risk is accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Terms {
    /// Premium per unit of covered value over the whole runtime.
    pub premium: f64,
    pub runtime: u64,
    pub payment_period: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub kind: ContractKind,
    pub insurance_type: InsuranceType,
    pub insurer: Party,
    pub property_holder: Party,
    pub value: f64,
    pub category: usize,
    pub risk_factor: f64,
    pub deductible_fraction: f64,
    pub limit_fraction: f64,
    pub deductible: f64,
    pub limit: f64,
    pub periodized_premium: f64,
    payment_schedule: VecDeque<(Tick, f64)>,
    pub runtime: u64,
    pub start: Tick,
    pub expiration: Tick,
    /// Claims realized since the insurer last collected them.
    pub current_claim: f64,
    /// Proportional reinsurance written on this contract.
    pub reincontract: Option<ContractId>,
    pub reinsurance_share: Option<f64>,
    pub state: ContractState,
    pub roll_over_flag: bool,
    pub risk: RiskProperties,
}

impl Contract {
    pub fn new(
        id: ContractId,
        kind: ContractKind,
        insurer: Party,
        risk: RiskProperties,
        time: Tick,
        terms: Terms,
    ) -> Self {
        let deductible_fraction = risk.deductible_fraction();
        let limit_fraction = risk.limit_fraction();
        let deductible = deductible_fraction * risk.value;
        let limit = limit_fraction * risk.value;
        let runtime = terms.runtime.max(1);

        let total_premium = terms.premium * (limit - deductible);
        let payment_times: Vec<Tick> = (0..runtime)
            .filter(|i| i % terms.payment_period.max(1) == 0)
            .map(|i| time.offset(i))
            .collect();
        let per_payment = total_premium / payment_times.len() as f64;
        let payment_schedule = payment_times.into_iter().map(|t| (t, per_payment)).collect();

        Contract {
            id,
            kind,
            insurance_type: risk.insurance_type(),
            insurer,
            property_holder: risk.owner,
            value: risk.value,
            category: risk.category,
            risk_factor: risk.risk_factor,
            deductible_fraction,
            limit_fraction,
            deductible,
            limit,
            periodized_premium: total_premium / runtime as f64,
            payment_schedule,
            runtime,
            start: time,
            expiration: time.offset(runtime),
            current_claim: 0.0,
            reincontract: None,
            reinsurance_share: None,
            state: ContractState::Active,
            roll_over_flag: false,
            risk,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ContractState::Active
    }

    /// Pop the next scheduled premium payment if it is due by `time`.
    /// The caller books it as an obligation of the property holder.
    pub fn check_payment_due(&mut self, time: Tick) -> Option<f64> {
        match self.payment_schedule.front() {
            Some(&(due, _)) if due <= time => self.payment_schedule.pop_front().map(|(_, amount)| amount),
            _ => None,
        }
    }

    pub fn remaining_payments(&self) -> usize {
        self.payment_schedule.len()
    }

    /// Apply a catastrophe to a primary contract. The property is hit when
    /// `uniform_draw < risk_factor`; the claim is the damaged value capped
    /// at the limit, net of the deductible. Returns the claim (0 if missed).
    pub fn explode(&mut self, expire_immediately: bool, time: Tick, uniform_draw: f64, damage_draw: f64) -> f64 {
        if !self.is_active() || uniform_draw >= self.risk_factor {
            return 0.0;
        }
        let claim = (self.limit.min(damage_draw * self.value) - self.deductible).max(0.0);
        self.settle_claim(expire_immediately, time, claim)
    }

    /// Apply a ceding firm's aggregate claim to a reinsurance layer: the
    /// layer pays the part of `damage_extent` inside `[deductible, limit)`.
    pub fn explode_layer(&mut self, expire_immediately: bool, time: Tick, damage_extent: f64) -> f64 {
        if !self.is_active() {
            return 0.0;
        }
        let share = self.reinsurance_share.unwrap_or(1.0);
        let claim = (self.limit.min(damage_extent * share) - self.deductible).max(0.0);
        self.settle_claim(expire_immediately, time, claim)
    }

    fn settle_claim(&mut self, expire_immediately: bool, time: Tick, claim: f64) -> f64 {
        if claim > 0.0 {
            self.current_claim += claim;
            if expire_immediately {
                self.state = ContractState::Expired;
                self.expiration = time;
            }
        }
        claim
    }

    /// Hand over the claims accumulated since the last call and zero them.
    /// Returns `(category, claim, is_proportional)`.
    pub fn get_and_reset_current_claim(&mut self) -> (usize, f64, bool) {
        let claim = std::mem::take(&mut self.current_claim);
        (self.category, claim, self.insurance_type == InsuranceType::Proportional)
    }

    /// Terminate early because the insurer left the market.
    pub fn dissolve(&mut self, time: Tick) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = ContractState::Voided;
        self.expiration = time;
        true
    }

    /// Regular end of runtime.
    pub fn mature(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        self.state = ContractState::Expired;
        true
    }

    pub fn is_due_to_mature(&self, time: Tick) -> bool {
        self.expiration <= time
    }

    pub fn reinsure(&mut self, reincontract: ContractId, share: f64) {
        self.reincontract = Some(reincontract);
        self.reinsurance_share = Some(share);
    }

    pub fn unreinsure(&mut self) {
        self.reincontract = None;
        self.reinsurance_share = None;
    }

    pub fn underwritten_risk(&self) -> UnderwrittenRisk {
        UnderwrittenRisk {
            value: self.value,
            category: self.category,
            risk_factor: self.risk_factor,
            deductible_fraction: self.deductible_fraction,
            limit_fraction: self.limit_fraction,
            insurance_type: self.insurance_type,
            runtime: self.runtime,
        }
    }
}

/// Arena of live contracts, keyed by id. Matured contracts are removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contracts {
    next_id: u64,
    slots: BTreeMap<u64, Contract>,
}

impl Contracts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, kind: ContractKind, insurer: Party, risk: RiskProperties, time: Tick, terms: Terms) -> ContractId {
        let id = ContractId(self.next_id);
        self.next_id += 1;
        self.slots.insert(id.0, Contract::new(id, kind, insurer, risk, time, terms));
        id
    }

    pub fn get(&self, id: ContractId) -> Option<&Contract> {
        self.slots.get(&id.0)
    }

    pub fn get_mut(&mut self, id: ContractId) -> Option<&mut Contract> {
        self.slots.get_mut(&id.0)
    }

    pub fn remove(&mut self, id: ContractId) -> Option<Contract> {
        self.slots.remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contract> {
        self.slots.values()
    }
}
