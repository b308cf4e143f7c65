//! Deferred payments.
//!
//! Every cash-holding agent (the market, each firm, each cat bond) owns an
//! [`ObligationLedger`] listing what it still has to pay. Entries fall due
//! at a tick and are handed back to the owner for settlement; the owner
//! decides what happens when it cannot pay (fatal for the market,
//! bankruptcy for a firm).

use serde::{Deserialize, Serialize};

use crate::types::{Party, Tick};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    Premium,
    Claim,
    Dividend,
    Yield,
    /// Capital raised for a cat bond, owed to the issuing firm.
    Bond,
    /// Per-period payment from a cat bond to its owner.
    Coupon,
    Dissolution,
    /// Start-up capital for a firm entering the market.
    Capital,
    Maturity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub amount: f64,
    pub recipient: Party,
    pub due_time: Tick,
    pub purpose: Purpose,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObligationLedger {
    pending: Vec<Obligation>,
}

impl ObligationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a payment. Zero and negative amounts are not recorded.
    pub fn receive_obligation(&mut self, amount: f64, recipient: Party, due_time: Tick, purpose: Purpose) {
        if amount <= 0.0 {
            return;
        }
        self.pending.push(Obligation { amount, recipient, due_time, purpose });
    }

    /// Remove and return every obligation with `due_time <= time`, in the
    /// order they were queued. Later obligations stay pending.
    pub fn take_due(&mut self, time: Tick) -> Vec<Obligation> {
        let (due, later): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|o| o.due_time <= time);
        self.pending = later;
        due
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn total_pending(&self) -> f64 {
        self.pending.iter().map(|o| o.amount).sum()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Obligation> {
        self.pending.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FirmId;

    fn firm(n: u64) -> Party {
        Party::Firm(FirmId(n))
    }

    #[test]
    fn zero_amount_is_not_recorded() {
        let mut ledger = ObligationLedger::new();
        ledger.receive_obligation(0.0, firm(1), Tick(3), Purpose::Premium);
        ledger.receive_obligation(-5.0, firm(1), Tick(3), Purpose::Premium);
        assert!(ledger.is_empty(), "non-positive obligations must be dropped");
    }

    /// Obligations due at or before `time` are released; later ones wait.
    #[test]
    fn take_due_splits_on_due_time() {
        let mut ledger = ObligationLedger::new();
        ledger.receive_obligation(10.0, firm(1), Tick(2), Purpose::Premium);
        ledger.receive_obligation(20.0, firm(2), Tick(5), Purpose::Claim);
        ledger.receive_obligation(30.0, Party::Market, Tick(3), Purpose::Dividend);

        let due = ledger.take_due(Tick(3));
        let amounts: Vec<f64> = due.iter().map(|o| o.amount).collect();
        assert_eq!(amounts, vec![10.0, 30.0], "due entries keep queue order");
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.total_pending(), 20.0);

        assert!(ledger.take_due(Tick(4)).is_empty());
        assert_eq!(ledger.take_due(Tick(5)).len(), 1);
        assert!(ledger.is_empty());
    }
}
