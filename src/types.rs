use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FirmId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BondId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractId(pub u64);

/// Simulation time in ticks (1 unit = 1 simulated month in the canonical
/// calibration). The market advances one tick at a time; every firm acts
/// exactly once per tick in the orchestrator's fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    /// Advance by a number of ticks, for due dates and expirations.
    pub fn offset(self, ticks: u64) -> Self {
        Tick(self.0 + ticks)
    }
}

/// Anyone that can hold cash and receive a payment.
///
/// `Market` stands for the customers and capital providers outside the
/// firm population: it owns the money supply, pays premiums and yields,
/// receives claims, dividends and dissolution proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Party {
    Market,
    Firm(FirmId),
    Bond(BondId),
}
