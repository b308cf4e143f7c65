use std::collections::BTreeMap;

use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};

use crate::catbond::CatBond;
use crate::config::SimulationConfig;
use crate::contract::{ContractKind, Contracts};
use crate::error::SimError;
use crate::events::EventScheduler;
use crate::firm::{Firm, FirmParams, Role};
use crate::history::{History, TickRecord};
use crate::ledger::{ObligationLedger, Purpose};
use crate::market::{self, Market};
use crate::perils;
use crate::riskmodel::RiskModel;
use crate::types::{BondId, FirmId, Party, Tick};

/// Primary claims fall due this many ticks after the catastrophe.
const CLAIM_PAYMENT_DELAY: u64 = 2;

/// The whole market: agents, contracts, pools, schedule and random stream.
///
/// Everything that influences the continuation of a run lives here and is
/// serialized with it, so a snapshot resumes bit for bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    pub config: SimulationConfig,
    pub tick: Tick,
    pub(crate) rng: ChaCha20Rng,
    pub scheduler: EventScheduler,
    pub market: Market,
    /// Insurers and reinsurers, indexed by `FirmId`; bankrupt firms stay in place.
    pub firms: Vec<Firm>,
    /// Live cat bonds keyed by `BondId`.
    pub bonds: BTreeMap<u64, CatBond>,
    pub(crate) next_bond_id: u64,
    pub contracts: Contracts,
    pub history: History,
    pub catastrophes: u64,
}

/// Seed the random stream and draw the catastrophe schedule, the first
/// thing every fresh run does. Recording runs archive the result.
pub fn seed_schedule(config: &SimulationConfig) -> Result<(EventScheduler, ChaCha20Rng), SimError> {
    config.validate()?;
    let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
    let scheduler = EventScheduler::generate(
        config.no_categories,
        config.max_time,
        config.event_time_mean_separation,
        &mut rng,
    )?;
    Ok((scheduler, rng))
}

impl Simulation {
    pub fn from_config(config: SimulationConfig) -> Result<Self, SimError> {
        let (scheduler, rng) = seed_schedule(&config)?;
        Self::from_replay(config, scheduler, rng)
    }

    /// Build from a schedule and random stream captured earlier.
    pub fn from_replay(config: SimulationConfig, scheduler: EventScheduler, mut rng: ChaCha20Rng) -> Result<Self, SimError> {
        config.validate()?;
        if scheduler.categories() != config.no_categories {
            return Err(SimError::ReplayMismatch(format!(
                "schedule has {} categories, config has {}",
                scheduler.categories(),
                config.no_categories
            )));
        }

        let risks = market::generate_risks(&config, &mut rng);
        let market = Market::new(&config, risks);

        let mut firms = Vec::with_capacity(config.insurers.count + config.reinsurers.count);
        for (role, class) in [(Role::Insurer, &config.insurers), (Role::Reinsurer, &config.reinsurers)] {
            for i in 0..class.count {
                let id = FirmId(firms.len() as u64);
                let model = RiskModel::new(&config, i % config.riskmodel.count);
                firms.push(Firm::new(id, role, class.initial_cash, model, FirmParams::from_config(&config, role)));
            }
        }

        info!(
            "simulation seeded: seed={} categories={} insurers={} reinsurers={} risks={}",
            config.seed,
            config.no_categories,
            config.insurers.count,
            config.reinsurers.count,
            config.no_risks
        );

        Ok(Simulation {
            config,
            tick: Tick(0),
            rng,
            scheduler,
            market,
            firms,
            bonds: BTreeMap::new(),
            next_bond_id: 0,
            contracts: Contracts::new(),
            history: History::default(),
            catastrophes: 0,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.tick.0 >= self.config.max_time
    }

    /// Run until the configured horizon.
    pub fn run(&mut self) -> Result<(), SimError> {
        while !self.is_finished() {
            self.step()?;
        }
        info!(
            "run finished at tick {}: {} catastrophes, {} of {} insurers operational",
            self.tick.0,
            self.catastrophes,
            self.firm_ids(Role::Insurer).iter().filter(|&&id| self.firm(id).operational).count(),
            self.firm_ids(Role::Insurer).len(),
        );
        Ok(())
    }

    /// Advance one tick. A tick either completes or the run is over.
    pub fn step(&mut self) -> Result<(), SimError> {
        let t = self.tick;
        self.market_entry(t)?;
        self.iterate(t)?;
        self.record(t);
        self.tick = t.offset(1);
        Ok(())
    }

    fn iterate(&mut self, t: Tick) -> Result<(), SimError> {
        // a. prices
        let insurer_capital = self.class_cash(Role::Insurer);
        let reinsurer_capital = self.class_cash(Role::Reinsurer);
        self.market.adjust_market_premium(insurer_capital);
        self.market.adjust_reinsurance_market_premium(reinsurer_capital);

        // b. market-side payments
        self.settle_market(t)?;

        // c. catastrophes
        for category in self.scheduler.advance_all(t)? {
            self.inflict_peril(category, t)?;
        }

        // d.
        self.market.shuffle_risks(&mut self.rng);

        // e. reinsurers, then cat bonds
        let reinsurers = self.firm_ids(Role::Reinsurer);
        self.reset_weights(&reinsurers, self.market.reinrisks.len());
        for id in reinsurers {
            self.iterate_firm(id, t)?;
        }
        let bond_ids: Vec<u64> = self.bonds.keys().copied().collect();
        for id in bond_ids {
            self.iterate_bond(BondId(id), t)?;
        }
        self.market.clear_reinrisks();

        // f. insurers
        let insurers = self.firm_ids(Role::Insurer);
        self.reset_weights(&insurers, self.market.risks.len());
        for id in insurers {
            self.iterate_firm(id, t)?;
        }
        Ok(())
    }

    fn reset_weights(&mut self, ids: &[FirmId], pool_len: usize) {
        let bases: Vec<f64> = ids.iter().map(|&id| self.firm(id).weight_basis).collect();
        let weights = market::reset_weights(&bases, pool_len);
        for (&id, weight) in ids.iter().zip(weights) {
            let firm = self.firm_mut(id);
            firm.risk_weight = weight;
            firm.weight_basis = 0.0;
        }
    }

    /// With the configured probability per class, a new firm enters,
    /// capitalised out of the money supply.
    fn market_entry(&mut self, t: Tick) -> Result<(), SimError> {
        for role in [Role::Insurer, Role::Reinsurer] {
            let class = match role {
                Role::Insurer => &self.config.insurers,
                Role::Reinsurer => &self.config.reinsurers,
            };
            let (probability, cash) = (class.entry_probability, class.initial_cash);
            if self.rng.random::<f64>() >= probability {
                continue;
            }
            let id = FirmId(self.firms.len() as u64);
            let index = self.firm_ids(role).len() % self.config.riskmodel.count;
            let model = RiskModel::new(&self.config, index);
            let params = FirmParams::from_config(&self.config, role);
            let mut firm = Firm::new(id, role, cash, model, params);
            // funded by the transfer below
            firm.cash = 0.0;
            self.firms.push(firm);
            self.transfer(t, Party::Market, Party::Firm(id), cash, Purpose::Capital)?;
            debug!("{role:?} {id:?} entered at {t:?} with {cash}");
        }
        Ok(())
    }

    fn settle_market(&mut self, t: Tick) -> Result<(), SimError> {
        for o in self.market.obligations.take_due(t) {
            self.transfer(t, Party::Market, o.recipient, o.amount, o.purpose)?;
        }
        Ok(())
    }

    /// One catastrophe in `category`: a shared severity, then per-contract
    /// damage and trigger draws over every live primary contract of an
    /// operational insurer, in insurer then book order.
    fn inflict_peril(&mut self, category: usize, t: Tick) -> Result<(), SimError> {
        let affected: Vec<_> = self
            .firms
            .iter()
            .filter(|f| f.role == Role::Insurer && f.operational)
            .flat_map(|f| f.contracts.iter().copied())
            .filter(|&cid| {
                self.contracts
                    .get(cid)
                    .is_some_and(|c| c.category == category && c.kind == ContractKind::Insurance && c.is_active())
            })
            .collect();

        let draw = perils::draw_peril(affected.len(), &mut self.rng)?;
        self.catastrophes += 1;
        debug!(
            "catastrophe at {t:?} in category {category}: severity {:.4}, {} contracts exposed",
            draw.severity,
            affected.len()
        );

        let expire_immediately = self.config.expire_immediately;
        for (i, cid) in affected.into_iter().enumerate() {
            let Some(contract) = self.contracts.get_mut(cid) else { continue };
            let claim = contract.explode(expire_immediately, t, draw.uniforms[i], draw.damages[i]);
            if claim > 0.0 {
                let (insurer, holder) = (contract.insurer, contract.property_holder);
                if let Some(ledger) = self.ledger_mut(insurer) {
                    ledger.receive_obligation(claim, holder, t.offset(CLAIM_PAYMENT_DELAY), Purpose::Claim);
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, t: Tick) {
        let mut record = TickRecord {
            tick: t,
            insurer_cash: 0.0,
            insurer_contracts: 0,
            insurers_operational: 0,
            reinsurer_cash: 0.0,
            reinsurer_contracts: 0,
            reinsurers_operational: 0,
            catbonds: self.bonds.len(),
            market_premium: self.market.get_market_premium(),
            reinsurance_market_premium: self.market.get_reinsurance_market_premium(),
            catastrophes: self.catastrophes,
        };
        for f in &self.firms {
            let (cash, contracts, operational) = match f.role {
                Role::Insurer => (
                    &mut record.insurer_cash,
                    &mut record.insurer_contracts,
                    &mut record.insurers_operational,
                ),
                Role::Reinsurer => (
                    &mut record.reinsurer_cash,
                    &mut record.reinsurer_contracts,
                    &mut record.reinsurers_operational,
                ),
            };
            *cash += f.cash;
            *contracts += f.contracts.len();
            *operational += usize::from(f.operational);
        }
        self.history.push(record);
    }

    // ── Agents ────────────────────────────────────────────────────────────────

    pub fn firm(&self, id: FirmId) -> &Firm {
        &self.firms[id.0 as usize]
    }

    pub fn firm_mut(&mut self, id: FirmId) -> &mut Firm {
        &mut self.firms[id.0 as usize]
    }

    /// Firms of one role in id order, bankrupt ones included.
    pub fn firm_ids(&self, role: Role) -> Vec<FirmId> {
        self.firms.iter().filter(|f| f.role == role).map(|f| f.id).collect()
    }

    fn class_cash(&self, role: Role) -> f64 {
        self.firms.iter().filter(|f| f.role == role && f.operational).map(|f| f.cash).sum()
    }

    pub fn is_operational(&self, party: Party) -> bool {
        match party {
            Party::Market => true,
            Party::Firm(id) => self.firms.get(id.0 as usize).is_some_and(|f| f.operational),
            Party::Bond(id) => self.bonds.get(&id.0).is_some_and(|b| b.operational),
        }
    }

    pub(crate) fn ledger_mut(&mut self, party: Party) -> Option<&mut ObligationLedger> {
        match party {
            Party::Market => Some(&mut self.market.obligations),
            Party::Firm(id) => self.firms.get_mut(id.0 as usize).map(|f| &mut f.obligations),
            Party::Bond(id) => self.bonds.get_mut(&id.0).map(|b| &mut b.obligations),
        }
    }

    // ── Money ─────────────────────────────────────────────────────────────────

    /// Move `amount` from `payer` to `recipient` now. Nothing moves if either
    /// side has left the market; the market running dry is fatal.
    pub fn transfer(&mut self, t: Tick, payer: Party, recipient: Party, amount: f64, purpose: Purpose) -> Result<(), SimError> {
        if amount <= 0.0 || !self.is_operational(payer) || !self.is_operational(recipient) {
            return Ok(());
        }
        match payer {
            Party::Market => self.market.withdraw(t, amount)?,
            Party::Firm(id) => {
                let firm = self.firm_mut(id);
                firm.cash -= amount;
                if purpose != Purpose::Dividend {
                    firm.profits_losses -= amount;
                }
            }
            Party::Bond(id) => {
                if let Some(bond) = self.bonds.get_mut(&id.0) {
                    bond.cash -= amount;
                }
            }
        }
        match recipient {
            Party::Market => self.market.receive(amount),
            Party::Firm(id) => {
                let firm = self.firm_mut(id);
                if purpose == Purpose::Capital {
                    firm.cash += amount;
                } else {
                    firm.receive(amount);
                }
            }
            Party::Bond(id) => {
                if let Some(bond) = self.bonds.get_mut(&id.0) {
                    bond.receive(amount);
                }
            }
        }
        Ok(())
    }

    /// Money supply plus every agent's cash. Constant over a run.
    pub fn total_money(&self) -> f64 {
        self.market.money_supply
            + self.firms.iter().map(|f| f.cash).sum::<f64>()
            + self.bonds.values().map(|b| b.cash).sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;

    use super::*;
    use crate::risk::{RiskKind, RiskProperties};

    /// A market small enough to run a few hundred ticks in a test.
    fn small_config() -> SimulationConfig {
        let mut config = SimulationConfig::canonical();
        config.max_time = 200;
        config.no_risks = 2_000;
        config.insurers.count = 6;
        config.reinsurers.count = 2;
        config.insurers.entry_probability = 0.05;
        config.reinsurers.entry_probability = 0.01;
        config
    }

    fn layer_risk(owner: FirmId, category: usize, value: f64) -> RiskProperties {
        RiskProperties {
            value,
            category,
            owner: Party::Firm(owner),
            risk_factor: 1.0,
            kind: RiskKind::ExcessOfLoss {
                number_risks: 1,
                deductible_fraction: 0.25,
                limit_fraction: 1.0,
                periodized_total_premium: 0.0,
                runtime: 12,
                expiration: Tick(12),
            },
        }
    }

    // ── Determinism ───────────────────────────────────────────────────────────

    #[test]
    fn same_seed_same_history() {
        let mut a = Simulation::from_config(small_config()).unwrap();
        let mut b = Simulation::from_config(small_config()).unwrap();
        for _ in 0..120 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_eq!(a.history, b.history, "two runs with one seed diverged");
        assert_eq!(a.history.records[119].catastrophes, 12, "seed 42 fires 12 catastrophes by tick 119");
    }

    /// The schedule for seed 42 over 200 ticks, and the first word of the
    /// stream left over for the rest of setup.
    #[test]
    fn schedule_draws_are_pinned() {
        let (scheduler, mut rng) = seed_schedule(&small_config()).unwrap();
        let expected = EventScheduler::from_schedules(
            [
                vec![31, 50, 53, 76, 89, 103, 128, 145, 148, 172, 178, 192],
                vec![128, 169, 172, 196],
                vec![28, 56, 58, 83],
                vec![24, 94, 126, 144, 150, 162],
            ]
            .into_iter()
            .map(|times| times.into_iter().map(Tick).collect())
            .collect(),
        );
        assert_eq!(scheduler, expected);
        assert_eq!(rng.next_u64(), 1_513_800_704_899_038_869);
    }

    #[test]
    fn different_seeds_diverge() {
        let mut other = small_config();
        other.seed = 7;
        let mut a = Simulation::from_config(small_config()).unwrap();
        let mut b = Simulation::from_config(other).unwrap();
        for _ in 0..60 {
            a.step().unwrap();
            b.step().unwrap();
        }
        assert_ne!(a.history, b.history);
    }

    /// Snapshot mid-run, restore, and the continuation matches the
    /// uninterrupted run exactly.
    #[test]
    fn snapshot_resumes_bit_for_bit() {
        let mut golden = Simulation::from_config(small_config()).unwrap();
        for _ in 0..40 {
            golden.step().unwrap();
        }
        let saved = serde_json::to_string(&golden).unwrap();
        let mut resumed: Simulation = serde_json::from_str(&saved).unwrap();
        assert_eq!(resumed, golden, "restored state differs from the saved one");

        for _ in 0..40 {
            golden.step().unwrap();
            resumed.step().unwrap();
        }
        assert_eq!(
            serde_json::to_string(&resumed).unwrap(),
            serde_json::to_string(&golden).unwrap(),
            "resumed continuation diverged"
        );
    }

    // ── Conservation ──────────────────────────────────────────────────────────

    #[test]
    fn money_is_conserved_every_tick() {
        let mut sim = Simulation::from_config(small_config()).unwrap();
        let initial = sim.total_money();
        for _ in 0..200 {
            sim.step().unwrap();
            let now = sim.total_money();
            assert!(
                (now - initial).abs() <= 1e-6 * initial,
                "tick {:?}: money {now} drifted from {initial}",
                sim.tick
            );
        }
    }

    // ── Markets work at all ───────────────────────────────────────────────────

    #[test]
    fn insurers_write_business_and_reinsurers_take_layers() {
        let mut sim = Simulation::from_config(small_config()).unwrap();
        for _ in 0..100 {
            sim.step().unwrap();
        }
        let records = &sim.history.records;
        assert!(records.iter().all(|r| r.tick.0 < 2 || r.insurer_contracts > 0), "insurers wrote nothing");
        assert!(records.iter().any(|r| r.reinsurer_contracts > 0), "no layer was placed in 100 ticks");
    }

    /// After a long run every profile is still a set of disjoint layers
    /// inside the firm's band.
    #[test]
    fn profiles_stay_disjoint_over_a_run() {
        let mut sim = Simulation::from_config(small_config()).unwrap();
        sim.run().unwrap();
        for f in &sim.firms {
            let (lo, hi) = f.profile.band();
            for c in 0..f.profile.categories() {
                let layers = f.profile.layers(c);
                for l in layers {
                    assert!(lo - 1e-12 <= l.lower && l.upper <= hi + 1e-12, "{:?} layer outside band", f.id);
                }
                for pair in layers.windows(2) {
                    assert!(pair[0].upper <= pair[1].lower, "{:?} category {c}: overlapping layers", f.id);
                }
            }
        }
    }

    // ── Cat bonds ─────────────────────────────────────────────────────────────

    #[test]
    fn cat_bond_funding_moves_var_plus_discounted_coupons() {
        let mut config = small_config();
        config.interest_rate = 0.01;
        let mut sim = Simulation::from_config(config).unwrap();
        let firm = FirmId(0);
        let before = sim.firm(firm).cash;
        let money = sim.total_money();

        let bond = sim.place_cat_bond(Tick(0), firm, layer_risk(firm, 0, 1000.0), 50.0, 10.0).unwrap();

        let paid = before - sim.firm(firm).cash;
        let bond_cash = sim.bonds[&bond.0].cash;
        assert!((paid - 163.68).abs() < 0.005, "firm paid {paid:.4}");
        assert!((paid - bond_cash).abs() < 1e-9, "bond must hold exactly what the firm paid");
        assert!((sim.total_money() - money).abs() < 1e-6);
        assert_eq!(sim.firm(firm).profile.layers(0).len(), 1, "bond layer registered with the issuer");
        assert!(
            sim.market.obligations.iter().any(|o| o.recipient == Party::Firm(firm) && o.amount == 50.0),
            "investors owe the issuer the bond's principal"
        );
    }

    /// A bond pays its remaining cash back to the market and leaves once
    /// its contract is over.
    #[test]
    fn cat_bond_winds_up_at_maturity() {
        let mut config = small_config();
        config.insurers.entry_probability = 0.0;
        config.reinsurers.entry_probability = 0.0;
        let mut sim = Simulation::from_config(config).unwrap();
        let firm = FirmId(0);
        let bond = sim.place_cat_bond(Tick(0), firm, layer_risk(firm, 0, 1000.0), 50.0, 0.0).unwrap();
        assert_eq!(bond, BondId(0));
        // ticks 0..=12; the contract expires at 12
        for _ in 0..13 {
            sim.step().unwrap();
        }
        assert!(sim.bonds.is_empty(), "bond should have matured after its 12-tick contract");
        assert!(sim.firm(firm).profile.layers(0).is_empty(), "matured layer must be released");
    }

    // ── Failure modes ─────────────────────────────────────────────────────────

    #[test]
    fn insolvent_firm_goes_bankrupt_and_pays_out() {
        let mut sim = Simulation::from_config(small_config()).unwrap();
        for _ in 0..10 {
            sim.step().unwrap();
        }
        let money = sim.total_money();
        let id = FirmId(0);
        let due = sim.tick;
        sim.firm_mut(id).obligations.receive_obligation(1e12, Party::Market, due, Purpose::Claim);
        sim.step().unwrap();

        let f = sim.firm(id);
        assert!(!f.operational);
        assert_eq!(f.cash, 0.0, "remaining cash goes to the market");
        assert!(f.contracts.is_empty(), "book is voided");
        assert!(f.obligations.is_empty(), "pending obligations are dropped");
        assert!((sim.total_money() - money).abs() <= 1e-6 * money);
    }

    #[test]
    fn stale_schedule_head_is_fatal() {
        let config = small_config();
        let scheduler = EventScheduler::from_schedules(vec![vec![Tick(0)], vec![], vec![], vec![]]);
        let mut sim = Simulation::from_replay(config, scheduler, ChaCha20Rng::seed_from_u64(1)).unwrap();
        sim.tick = Tick(1);
        let err = sim.step().unwrap_err();
        assert!(matches!(err, SimError::StaleSchedule { category: 0, .. }), "got {err}");
    }

    #[test]
    fn empty_money_supply_is_fatal() {
        let mut config = small_config();
        config.money_supply = 0.0;
        config.insurers.entry_probability = 1.0;
        let mut sim = Simulation::from_config(config).unwrap();
        let err = sim.step().unwrap_err();
        assert!(matches!(err, SimError::MoneySupplyExhausted { .. }), "got {err}");
    }

    #[test]
    fn replay_with_wrong_category_count_is_rejected() {
        let scheduler = EventScheduler::from_schedules(vec![vec![]; 3]);
        let err = Simulation::from_replay(small_config(), scheduler, ChaCha20Rng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(err, SimError::ReplayMismatch(_)));
    }
}
