//! One agent's turn within a tick.
//!
//! Firms and bonds are stored by value in [`Simulation`], and almost every
//! step of a turn touches a counterparty (the market, the holder of a
//! layer, the writer of a claim), so the turn is written as methods on the
//! simulation keyed by id rather than as methods on the agent.
//!
//! Firm turn:
//! 1. investment yield
//! 2. settle own due obligations; insolvency ends the firm
//! 3. collect claims and explode reinsurance
//! 4. mature expired contracts
//! 5. raise premium obligations on counterparties
//! 6. if still operational: solicit, underwrite, capacity decisions,
//!    dividends, roll over

use log::{debug, warn};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::catbond::{self, CatBond};
use crate::config::ReinsuranceType;
use crate::contract::{ContractKind, Terms};
use crate::error::SimError;
use crate::firm::{CategoryExposure, Role, risks_by_category};
use crate::ledger::Purpose;
use crate::profile;
use crate::risk::{InsuranceType, RiskKind, RiskProperties, UnderwrittenRisk};
use crate::riskmodel::PortfolioEvaluation;
use crate::simulation::Simulation;
use crate::types::{BondId, ContractId, FirmId, Party, Tick};

/// Minimum number of primary risks a firm may take on in one tick.
const MIN_GROWTH_LIMIT: usize = 50;

/// An excess-of-loss request for one tranche of a category book.
fn layer_request(owner: FirmId, category: usize, exposure: &CategoryExposure, lower: f64, upper: f64, runtime: u64, start: Tick) -> RiskProperties {
    RiskProperties {
        value: exposure.total_value,
        category,
        owner: Party::Firm(owner),
        risk_factor: exposure.average_risk_factor,
        kind: RiskKind::ExcessOfLoss {
            number_risks: exposure.number_risks,
            deductible_fraction: lower,
            limit_fraction: upper,
            periodized_total_premium: exposure.periodized_total_premium,
            runtime,
            expiration: start.offset(runtime),
        },
    }
}

impl Simulation {
    pub(crate) fn iterate_firm(&mut self, id: FirmId, t: Tick) -> Result<(), SimError> {
        if !self.firm(id).operational {
            return Ok(());
        }
        self.firm_mut(id).profits_losses = 0.0;
        self.obtain_yield(Party::Firm(id), t);
        self.effect_payments(id, t)?;
        if !self.firm(id).operational {
            return Ok(());
        }
        self.make_reinsurance_claims(id, t);
        let dissolved = self.mature_contracts(id, t);
        self.check_payments_due(Party::Firm(id), t);

        match self.firm(id).role {
            Role::Insurer => self.insurer_turn(id, t, dissolved)?,
            Role::Reinsurer => self.reinsurer_turn(id, t)?,
        }
        self.roll_over(id, t);
        Ok(())
    }

    fn insurer_turn(&mut self, id: FirmId, t: Tick, dissolved: usize) -> Result<(), SimError> {
        let risks = self.solicit(id);
        let idx = id.0 as usize;

        let firm = &self.firms[idx];
        let cash = firm.cash;
        let underwritten = firm.underwritten_risks(&self.contracts);
        let evaluation = firm.risk_model.evaluate(&underwritten, cash, Some(&firm.profile));
        let max_var = (cash - evaluation.excess_capital).max(0.0);

        self.firms[idx].excess_capital = evaluation.excess_capital;
        self.firms[idx].adjust_capacity_target(max_var);
        let capacity = match self.firms[idx].params.reinsurance_type {
            ReinsuranceType::NonProportional => self.increase_capacity(id, t, max_var)?,
            ReinsuranceType::Proportional => {
                self.ask_reinsurance_proportional(id);
                self.firms[idx].get_capacity(max_var)
            }
        };
        self.firms[idx].adjust_dividends(capacity);
        self.pay_dividends(id, t);

        let rejected = self.underwrite_primary(id, t, risks, evaluation, dissolved);
        self.market.return_risks(rejected);
        Ok(())
    }

    fn reinsurer_turn(&mut self, id: FirmId, t: Tick) -> Result<(), SimError> {
        let risks = self.solicit(id);
        let idx = id.0 as usize;

        let firm = &self.firms[idx];
        let cash = firm.cash;
        let underwritten = firm.underwritten_risks(&self.contracts);
        let evaluation = firm.risk_model.evaluate(&underwritten, cash, None);
        let max_var = (cash - evaluation.excess_capital).max(0.0);

        let rejected = self.underwrite_reinsurance(id, t, risks, &evaluation, underwritten)?;
        self.market.return_reinrisks(rejected);

        let firm = &mut self.firms[idx];
        firm.excess_capital = evaluation.excess_capital;
        firm.adjust_capacity_target(max_var);
        let capacity = firm.get_capacity(max_var);
        firm.adjust_dividends(capacity);
        self.pay_dividends(id, t);
        Ok(())
    }

    // ── Payments ──────────────────────────────────────────────────────────────

    fn obtain_yield(&mut self, party: Party, t: Tick) {
        let amount = match party {
            Party::Firm(id) => self.firm(id).cash * self.config.interest_rate,
            Party::Bond(id) => self.bonds.get(&id.0).map_or(0.0, |b| b.cash * b.interest_rate),
            Party::Market => 0.0,
        };
        self.market.receive_obligation(amount, party, t, Purpose::Yield);
    }

    /// Pay everything due, or go bankrupt if the total exceeds cash.
    fn effect_payments(&mut self, id: FirmId, t: Tick) -> Result<(), SimError> {
        let due = self.firm_mut(id).obligations.take_due(t);
        let total: f64 = due.iter().map(|o| o.amount).sum();
        if total > self.firm(id).cash {
            return self.enter_bankruptcy(id, t, total);
        }
        for o in due {
            self.transfer(t, Party::Firm(id), o.recipient, o.amount, o.purpose)?;
        }
        Ok(())
    }

    fn pay_dividends(&mut self, id: FirmId, t: Tick) {
        let firm = self.firm_mut(id);
        let dividend = firm.per_period_dividend;
        firm.obligations.receive_obligation(dividend, Party::Market, t, Purpose::Dividend);
    }

    /// Queue the next premium instalment of every contract `writer` holds
    /// the pen on, as an obligation of the contract's holder.
    fn check_payments_due(&mut self, writer: Party, t: Tick) {
        let book: Vec<ContractId> = match writer {
            Party::Firm(id) => self.firm(id).contracts.clone(),
            Party::Bond(id) => self.bonds.get(&id.0).and_then(|b| b.contract).into_iter().collect(),
            Party::Market => return,
        };
        for cid in book {
            let Some(contract) = self.contracts.get_mut(cid) else { continue };
            let Some(amount) = contract.check_payment_due(t) else { continue };
            let holder = contract.property_holder;
            if !self.is_operational(holder) {
                continue;
            }
            if let Some(ledger) = self.ledger_mut(holder) {
                ledger.receive_obligation(amount, writer, t, Purpose::Premium);
            }
        }
    }


    // ── Claims ────────────────────────────────────────────────────────────────

    /// Collect this tick's claims per category and pass them on: linked
    /// proportional cover gets each contract's claim, excess-of-loss layers
    /// get the category total when it reaches their deductible.
    fn make_reinsurance_claims(&mut self, id: FirmId, t: Tick) {
        let categories = self.config.no_categories;
        let mut claims = vec![0.0; categories];
        let mut linked = Vec::new();
        for cid in self.firm(id).contracts.clone() {
            let Some(contract) = self.contracts.get_mut(cid) else { continue };
            let (category, claim, is_proportional) = contract.get_and_reset_current_claim();
            if is_proportional {
                claims[category] += claim;
            }
            if claim > 0.0
                && let Some(reincontract) = contract.reincontract
            {
                linked.push((reincontract, claim));
            }
        }
        for (reincontract, claim) in linked {
            self.explode_reinsurance(reincontract, claim, t);
        }
        for (category, &total) in claims.iter().enumerate() {
            if total <= 0.0 {
                continue;
            }
            for reincontract in self.firm(id).profile.contracts_to_explode(category, total) {
                self.explode_reinsurance(reincontract, total, t);
            }
        }
    }

    fn explode_reinsurance(&mut self, cid: ContractId, damage_extent: f64, t: Tick) {
        let expire_immediately = self.config.expire_immediately;
        let Some(contract) = self.contracts.get_mut(cid) else { return };
        let claim = contract.explode_layer(expire_immediately, t, damage_extent);
        if claim > 0.0 {
            let (writer, holder) = (contract.insurer, contract.property_holder);
            if let Some(ledger) = self.ledger_mut(writer) {
                ledger.receive_obligation(claim, holder, t, Purpose::Claim);
            }
        }
    }

    // ── Contract ends ─────────────────────────────────────────────────────────

    /// Drop every contract due to end from the book. Returns how many.
    fn mature_contracts(&mut self, id: FirmId, t: Tick) -> usize {
        let book = std::mem::take(&mut self.firm_mut(id).contracts);
        let contracts = &self.contracts;
        let (due, live): (Vec<ContractId>, Vec<ContractId>) = book
            .into_iter()
            .partition(|&cid| contracts.get(cid).is_none_or(|c| !c.is_active() || c.is_due_to_mature(t)));
        self.firm_mut(id).contracts = live;
        for &cid in &due {
            self.retire_contract(cid, t);
        }
        due.len()
    }

    /// Remove a finished contract from the arena and release whatever it
    /// was linked to.
    pub(crate) fn retire_contract(&mut self, cid: ContractId, t: Tick) {
        let Some(mut contract) = self.contracts.remove(cid) else { return };
        contract.mature();
        let kind = contract.risk.kind.clone();
        match kind {
            RiskKind::Primary => {
                if let Some(reincontract) = contract.reincontract
                    && let Some(r) = self.contracts.get_mut(reincontract)
                {
                    r.dissolve(t);
                }
                if !contract.roll_over_flag {
                    self.market.return_risks(vec![contract.risk]);
                }
            }
            RiskKind::ExcessOfLoss { .. } => {
                if let Party::Firm(holder) = contract.property_holder {
                    self.firm_mut(holder).profile.remove(contract.category, cid);
                }
            }
            RiskKind::Proportional { contract: ceded, .. } => {
                if let Some(c) = self.contracts.get_mut(ceded)
                    && c.reincontract == Some(cid)
                {
                    c.unreinsure();
                }
            }
        }
    }

    /// Void the book, hand back kept risks, pay all cash to the market and
    /// stop trading. Pending obligations are written off.
    fn enter_bankruptcy(&mut self, id: FirmId, t: Tick, owed: f64) -> Result<(), SimError> {
        warn!(
            "{id:?} bankrupt at {t:?}: owes {owed:.2} with {:.2} cash, {} contracts voided",
            self.firm(id).cash,
            self.firm(id).contracts.len()
        );
        let book = std::mem::take(&mut self.firm_mut(id).contracts);
        for cid in book {
            if let Some(c) = self.contracts.get_mut(cid) {
                c.dissolve(t);
            }
            self.retire_contract(cid, t);
        }
        let kept = std::mem::take(&mut self.firm_mut(id).risks_kept);
        if self.firm(id).role == Role::Insurer {
            self.market.return_risks(kept);
        }
        self.firm_mut(id).obligations.clear();

        let cash = self.firm(id).cash;
        self.transfer(t, Party::Firm(id), Party::Market, cash, Purpose::Dissolution)?;
        let firm = self.firm_mut(id);
        firm.operational = false;
        firm.risk_weight = 0;
        firm.weight_basis = 0.0;
        Ok(())
    }

    // ── Underwriting ──────────────────────────────────────────────────────────

    /// New risks from the firm's pool share plus its own renewals, shuffled.
    fn solicit(&mut self, id: FirmId) -> Vec<RiskProperties> {
        let idx = id.0 as usize;
        let (role, weight, cash) = {
            let f = &self.firms[idx];
            (f.role, f.risk_weight, f.cash)
        };
        self.firms[idx].weight_basis = cash;
        let mut risks = match role {
            Role::Insurer => self.market.solicit_insurance_requests(weight),
            Role::Reinsurer => self.market.solicit_reinsurance_requests(weight),
        };
        risks.append(&mut self.firms[idx].risks_kept);
        risks.shuffle(&mut self.rng);
        risks
    }

    /// Round-robin over categories, one risk per category per pass, until
    /// the growth limit, the per-category acceptance count or the pass
    /// limit runs out. Returns what was not written.
    fn underwrite_primary(&mut self, id: FirmId, t: Tick, risks: Vec<RiskProperties>, evaluation: PortfolioEvaluation, dissolved: usize) -> Vec<RiskProperties> {
        let idx = id.0 as usize;
        let categories = self.config.no_categories;
        let (primary, foreign): (Vec<_>, Vec<_>) = risks.into_iter().partition(|r| r.kind == RiskKind::Primary);
        let mut grouped = risks_by_category(primary, categories);

        let PortfolioEvaluation { mut acceptable_by_category, mut cash_left_by_category, var_per_risk_per_category, .. } =
            evaluation;
        let growth_limit = MIN_GROWTH_LIMIT.max(2 * self.firms[idx].contracts.len() + dissolved);
        let passes = grouped
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .min(self.firms[idx].params.recursion_limit);
        let premium = self.market.get_market_premium();
        let payment_period = self.firms[idx].params.payment_period;

        let mut written = 0;
        'passes: for pass in 0..passes {
            for category in 0..categories {
                if written >= growth_limit {
                    break 'passes;
                }
                if acceptable_by_category[category] == 0 {
                    continue;
                }
                let Some(slot) = grouped[category].get_mut(pass) else { continue };
                let Some(risk) = slot.as_ref() else { continue };
                let (accept, cash_left) =
                    self.firms[idx].balanced_portfolio(risk, &cash_left_by_category, &var_per_risk_per_category);
                if !accept {
                    continue;
                }
                let Some(risk) = slot.take() else { continue };
                cash_left_by_category = cash_left;
                let runtime = self.firms[idx].draw_runtime(&mut self.rng);
                let terms = Terms { premium, runtime, payment_period };
                let cid = self.contracts.issue(ContractKind::Insurance, Party::Firm(id), risk, t, terms);
                self.firms[idx].contracts.push(cid);
                acceptable_by_category[category] -= 1;
                written += 1;
            }
        }
        let mut rejected: Vec<RiskProperties> = grouped.into_iter().flatten().flatten().collect();
        rejected.extend(foreign);
        rejected
    }

    /// Same round-robin for reinsurance requests. A request is only
    /// written while its holder still trades and its slot is still free.
    fn underwrite_reinsurance(
        &mut self,
        id: FirmId,
        t: Tick,
        risks: Vec<RiskProperties>,
        evaluation: &PortfolioEvaluation,
        mut underwritten: Vec<UnderwrittenRisk>,
    ) -> Result<Vec<RiskProperties>, SimError> {
        if self.market.get_reinsurance_premium(0.0).is_infinite() {
            return Ok(risks);
        }
        let idx = id.0 as usize;
        let categories = self.config.no_categories;
        let mut grouped = risks_by_category(risks, categories);
        let mut cash_left_by_category = evaluation.cash_left_by_category.clone();
        let var_per_risk = &evaluation.var_per_risk_per_category;
        let passes = grouped
            .iter()
            .map(Vec::len)
            .max()
            .unwrap_or(0)
            .min(self.firms[idx].params.recursion_limit);
        let payment_period = self.firms[idx].params.payment_period;

        for pass in 0..passes {
            for category in 0..categories {
                let Some(slot) = grouped[category].get_mut(pass) else { continue };
                let Some(risk) = slot.as_ref() else { continue };
                if risk.owner == Party::Firm(id) || !self.reinsurance_admissible(risk) {
                    continue;
                }
                let firm = &self.firms[idx];
                let (premium, runtime) = match risk.kind {
                    RiskKind::ExcessOfLoss { runtime, .. } => {
                        let offer = firm.risk_model.evaluate_offer(&underwritten, firm.cash, risk, None);
                        if !offer.acceptable {
                            continue;
                        }
                        (self.layer_premium(risk), runtime)
                    }
                    RiskKind::Proportional { expiration, .. } => {
                        (self.market.get_market_premium(), expiration.0.saturating_sub(t.0).max(1))
                    }
                    RiskKind::Primary => continue,
                };
                let (accept, cash_left) = firm.balanced_portfolio(risk, &cash_left_by_category, var_per_risk);
                if !accept {
                    continue;
                }
                let Some(risk) = slot.take() else { continue };
                cash_left_by_category = cash_left;

                let terms = Terms { premium, runtime, payment_period };
                let cid = self.contracts.issue(ContractKind::Reinsurance, Party::Firm(id), risk, t, terms);
                self.link_reinsurance(cid)?;
                if let Some(c) = self.contracts.get(cid) {
                    underwritten.push(c.underwritten_risk());
                }
                self.firms[idx].contracts.push(cid);
            }
        }
        Ok(grouped.into_iter().flatten().flatten().collect())
    }

    fn reinsurance_admissible(&self, risk: &RiskProperties) -> bool {
        let Party::Firm(holder) = risk.owner else { return false };
        if !self.is_operational(risk.owner) {
            return false;
        }
        match risk.kind {
            RiskKind::ExcessOfLoss { deductible_fraction, limit_fraction, .. } => {
                self.firm(holder).profile.can_add(risk.category, deductible_fraction, limit_fraction)
            }
            RiskKind::Proportional { contract, .. } => self
                .contracts
                .get(contract)
                .is_some_and(|c| c.is_active() && c.reincontract.is_none()),
            RiskKind::Primary => false,
        }
    }

    /// Per-value price of a layer: a share of the ceding book's premium
    /// income over the runtime, scaled by the reinsurance/primary price ratio.
    fn layer_premium(&self, risk: &RiskProperties) -> f64 {
        let RiskKind::ExcessOfLoss { periodized_total_premium, runtime, deductible_fraction, .. } = risk.kind else {
            return 0.0;
        };
        let share = self.config.pricing.reinsurance_premium_share;
        let ratio = self.market.get_reinsurance_premium(deductible_fraction) / self.market.get_market_premium();
        share * periodized_total_premium * runtime as f64 * ratio / risk.value
    }

    /// Register a freshly written reinsurance contract with what it covers.
    fn link_reinsurance(&mut self, cid: ContractId) -> Result<(), SimError> {
        let Some(c) = self.contracts.get(cid) else {
            return Err(SimError::UnknownContract(cid));
        };
        let (category, holder, kind) = (c.category, c.property_holder, c.risk.kind.clone());
        let (deductible, limit) = (c.deductible, c.limit);
        match kind {
            RiskKind::ExcessOfLoss { deductible_fraction, limit_fraction, .. } => {
                if let Party::Firm(h) = holder {
                    self.firm_mut(h).profile.add(category, cid, deductible_fraction, limit_fraction, deductible, limit)?;
                }
            }
            RiskKind::Proportional { contract, reinsurance_share, .. } => {
                let ceded = self.contracts.get_mut(contract).ok_or(SimError::UnknownContract(contract))?;
                ceded.reinsure(cid, reinsurance_share);
            }
            RiskKind::Primary => {}
        }
        Ok(())
    }

    // ── Coverage requests ─────────────────────────────────────────────────────

    /// Walk the categories not yet fully covered in random order and buy
    /// cover for them. Below the capacity target every category is served;
    /// at or above it, only while the market pays better than the firm's
    /// own book, and at most once. Returns the capacity last computed.
    fn increase_capacity(&mut self, id: FirmId, t: Tick, max_var: f64) -> Result<f64, SimError> {
        let idx = id.0 as usize;
        let deductible = self.firms[idx].params.deductible_fraction;
        let reinsurance_price = self.market.get_reinsurance_premium(deductible);
        let cat_bond_price = self.market.get_cat_bond_price(deductible);

        let mut capacity = None;
        if !(reinsurance_price.is_infinite() && cat_bond_price.is_infinite()) {
            let profile = &self.firms[idx].profile;
            let mut open: Vec<usize> = (0..profile.categories()).filter(|&c| !profile.is_fully_covered(c)).collect();
            if open.len() > 1 {
                open.shuffle(&mut self.rng);
            }
            while let Some(category) = open.pop() {
                let current = self.firms[idx].get_capacity(max_var);
                capacity = Some(current);
                if current >= self.firms[idx].capacity_target {
                    if self.increase_capacity_by_category(id, t, category, reinsurance_price, cat_bond_price, false)? {
                        open.clear();
                    }
                } else {
                    self.increase_capacity_by_category(id, t, category, reinsurance_price, cat_bond_price, true)?;
                }
            }
        }
        Ok(capacity.unwrap_or_else(|| self.firms[idx].get_capacity(max_var)))
    }

    /// Buy the cheaper of reinsurance and a cat bond for one category.
    /// Unforced purchases only go ahead while the market premium beats the
    /// firm's average premium on that category.
    fn increase_capacity_by_category(
        &mut self,
        id: FirmId,
        t: Tick,
        category: usize,
        reinsurance_price: f64,
        cat_bond_price: f64,
        force: bool,
    ) -> Result<bool, SimError> {
        if !force {
            let own = self.firm(id).average_premium(category, &self.contracts);
            if own >= self.market.get_market_premium() {
                return Ok(false);
            }
        }
        if reinsurance_price > cat_bond_price {
            self.issue_cat_bond(id, t, category)?;
        } else {
            self.ask_reinsurance_by_category(id, t, category);
        }
        Ok(true)
    }

    /// Publish one excess-of-loss request per planned tranche. Nothing is
    /// published for an empty book or an empty plan.
    fn ask_reinsurance_by_category(&mut self, id: FirmId, t: Tick, category: usize) {
        let firm = self.firm(id);
        let exposure = firm.category_exposure(category, &self.contracts);
        if exposure.number_risks == 0 {
            return;
        }
        let runtime = firm.params.mean_runtime;
        let requests: Vec<RiskProperties> = firm
            .profile
            .plan_tranches(category, exposure.total_value, firm.params.min_tranches)
            .into_iter()
            .map(|(lower, upper)| layer_request(id, category, &exposure, lower, upper, runtime, t))
            .collect();
        for risk in requests {
            self.market.append_reinrisks(risk);
        }
    }

    /// Offer the whole of every contract without cover to the reinsurers.
    fn ask_reinsurance_proportional(&mut self, id: FirmId) {
        if self.market.get_reinsurance_premium(0.0).is_infinite() {
            return;
        }
        let requests: Vec<RiskProperties> = self
            .firm(id)
            .contracts
            .iter()
            .filter_map(|&cid| self.contracts.get(cid))
            .filter(|c| c.kind == ContractKind::Insurance && c.is_active() && c.reincontract.is_none())
            .map(|c| RiskProperties {
                value: c.value,
                category: c.category,
                owner: Party::Firm(id),
                risk_factor: c.risk_factor,
                kind: RiskKind::Proportional { contract: c.id, reinsurance_share: 1.0, expiration: c.expiration },
            })
            .collect();
        for risk in requests {
            self.market.append_reinrisks(risk);
        }
    }

    // ── Cat bonds ─────────────────────────────────────────────────────────────

    /// Cover the widest open tranche of `category` with a new bond, if the
    /// book is non-empty, the layer carries value at risk and the firm can
    /// fund it.
    fn issue_cat_bond(&mut self, id: FirmId, t: Tick, category: usize) -> Result<Option<BondId>, SimError> {
        let firm = self.firm(id);
        let mut exposure = firm.category_exposure(category, &self.contracts);
        if exposure.number_risks == 0 {
            return Ok(None);
        }
        exposure.periodized_total_premium = 0.0;
        let tranches = firm.profile.plan_tranches(category, exposure.total_value, 1);
        let Some((lower, upper)) = profile::widest(&tranches).map(|i| tranches[i]) else {
            return Ok(None);
        };
        let runtime = firm.params.mean_runtime;
        let risk = layer_request(id, category, &exposure, lower, upper, runtime, t);
        let var = firm.risk_model.evaluate_offer(&[], firm.cash, &risk, None).var_this_risk;
        if var <= 0.0 {
            return Ok(None);
        }
        let per_period_premium = firm.params.cat_bond_per_value_premium * risk.value;
        if catbond::funding(var, per_period_premium, self.config.interest_rate, runtime) > firm.cash {
            return Ok(None);
        }
        self.place_cat_bond(t, id, risk, var, per_period_premium).map(Some)
    }

    /// Create a bond writing `risk` back to `firm`, register the layer, and
    /// fund the bond: investors owe the firm `var`, the firm pays the bond
    /// `var` plus the discounted coupon stream at once.
    pub fn place_cat_bond(&mut self, t: Tick, firm: FirmId, risk: RiskProperties, var: f64, per_period_premium: f64) -> Result<BondId, SimError> {
        let runtime = match risk.kind {
            RiskKind::ExcessOfLoss { runtime, .. } => runtime,
            _ => self.config.contracts.mean_runtime,
        };
        let rate = self.config.interest_rate;
        let bond_id = BondId(self.next_bond_id);
        self.next_bond_id += 1;

        let terms = Terms { premium: 0.0, runtime, payment_period: self.config.contracts.payment_period };
        let cid = self.contracts.issue(ContractKind::Reinsurance, Party::Bond(bond_id), risk, t, terms);
        let mut bond = CatBond::new(bond_id, per_period_premium, rate);
        bond.contract = Some(cid);
        self.bonds.insert(bond_id.0, bond);
        self.link_reinsurance(cid)?;

        self.market.receive_obligation(var, Party::Firm(firm), t, Purpose::Bond);
        let total = catbond::funding(var, per_period_premium, rate, runtime);
        self.transfer(t, Party::Firm(firm), Party::Bond(bond_id), total, Purpose::Bond)?;
        debug!("{firm:?} issued {bond_id:?} at {t:?}: var {var:.2}, funded with {total:.2}");
        Ok(bond_id)
    }

    /// A bond's turn: earn yield, pay what is due as far as its cash goes,
    /// then either pay the coupon or, once its contract is over, return all
    /// cash to its owner and leave.
    pub(crate) fn iterate_bond(&mut self, id: BondId, t: Tick) -> Result<(), SimError> {
        if !self.bonds.contains_key(&id.0) {
            return Ok(());
        }
        self.obtain_yield(Party::Bond(id), t);

        let due = self.bonds.get_mut(&id.0).map(|b| b.obligations.take_due(t)).unwrap_or_default();
        for o in due {
            let available = self.bonds.get(&id.0).map_or(0.0, |b| b.cash);
            if o.amount > available {
                debug!("{id:?} short by {:.2} on {:?}", o.amount - available, o.purpose);
            }
            self.transfer(t, Party::Bond(id), o.recipient, o.amount.min(available), o.purpose)?;
        }

        let Some(bond) = self.bonds.get(&id.0) else { return Ok(()) };
        let (owner, contract, coupon) = (bond.owner, bond.contract, bond.per_period_premium);
        let finished = contract.is_none_or(|cid| {
            self.contracts.get(cid).is_none_or(|c| !c.is_active() || c.is_due_to_mature(t))
        });
        if finished {
            if let Some(cid) = contract {
                self.retire_contract(cid, t);
            }
            let cash = self.bonds.get(&id.0).map_or(0.0, |b| b.cash);
            self.transfer(t, Party::Bond(id), owner, cash, Purpose::Maturity)?;
            self.bonds.remove(&id.0);
            debug!("{id:?} matured at {t:?}, returned {cash:.2}");
        } else if let Some(bond) = self.bonds.get_mut(&id.0) {
            bond.obligations.receive_obligation(coupon, owner, t, Purpose::Coupon);
        }
        Ok(())
    }

    // ── Renewals ──────────────────────────────────────────────────────────────

    /// Flag contracts ending next tick for renewal. Insurers keep the
    /// underlying risk with probability `retention`, else hand it back to
    /// the pool; reinsurers re-offer themselves the holder's refreshed book
    /// with the same layer bounds. One draw per maturing contract.
    fn roll_over(&mut self, id: FirmId, t: Tick) {
        let idx = id.0 as usize;
        if !self.firms[idx].operational {
            return;
        }
        let next = t.offset(1);
        let (role, retention, runtime) = {
            let f = &self.firms[idx];
            (f.role, f.params.retention, f.params.mean_runtime)
        };
        for cid in self.firms[idx].contracts.clone() {
            let Some(c) = self.contracts.get(cid) else { continue };
            if !c.is_active() || c.expiration != next {
                continue;
            }
            match role {
                Role::Insurer => {
                    if c.kind != ContractKind::Insurance {
                        continue;
                    }
                    let risk = c.risk.clone();
                    if let Some(c) = self.contracts.get_mut(cid) {
                        c.roll_over_flag = true;
                    }
                    if self.rng.random::<f64>() > retention {
                        self.market.return_risks(vec![risk]);
                    } else {
                        self.firms[idx].risks_kept.push(risk);
                    }
                }
                Role::Reinsurer => {
                    if c.insurance_type != InsuranceType::ExcessOfLoss {
                        continue;
                    }
                    let Party::Firm(holder) = c.property_holder else { continue };
                    if !self.firm(holder).operational {
                        continue;
                    }
                    let (category, lower, upper) = (c.category, c.deductible_fraction, c.limit_fraction);
                    let exposure = self.firm(holder).category_exposure(category, &self.contracts);
                    if let Some(c) = self.contracts.get_mut(cid) {
                        c.roll_over_flag = true;
                    }
                    if self.rng.random::<f64>() < retention && exposure.number_risks > 0 {
                        let renewal = layer_request(holder, category, &exposure, lower, upper, runtime, next);
                        self.firms[idx].risks_kept.push(renewal);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::risk::RiskProperties;

    fn config() -> SimulationConfig {
        let mut config = SimulationConfig::canonical();
        config.max_time = 100;
        config.no_risks = 1_000;
        config.insurers.count = 3;
        config.reinsurers.count = 2;
        config.insurers.entry_probability = 0.0;
        config.reinsurers.entry_probability = 0.0;
        config
    }

    fn sim() -> Simulation {
        Simulation::from_config(config()).unwrap()
    }

    fn write_primary(sim: &mut Simulation, firm: FirmId, category: usize, t: Tick) -> ContractId {
        let terms = Terms { premium: 0.2, runtime: 12, payment_period: 3 };
        let cid = sim.contracts.issue(
            ContractKind::Insurance,
            Party::Firm(firm),
            RiskProperties::primary(1000.0, category, 1.0),
            t,
            terms,
        );
        sim.firm_mut(firm).contracts.push(cid);
        cid
    }

    fn write_priced(sim: &mut Simulation, firm: FirmId, category: usize, premium: f64) {
        let terms = Terms { premium, runtime: 12, payment_period: 3 };
        let cid = sim.contracts.issue(
            ContractKind::Insurance,
            Party::Firm(firm),
            RiskProperties::primary(1000.0, category, 1.0),
            Tick(0),
            terms,
        );
        sim.firm_mut(firm).contracts.push(cid);
    }

    // ── Claims ────────────────────────────────────────────────────────────────

    /// A category claim of 600 on a book of value 1000 hits a layer over
    /// [250, 1000) for 350, queued on the reinsurer towards the insurer.
    #[test]
    fn category_claim_explodes_only_layers_it_reaches() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let reinsurer = FirmId(3);
        let primary = write_primary(&mut sim, insurer, 0, Tick(0));

        let layer_risk = layer_request(insurer, 0, &CategoryExposure { total_value: 1000.0, average_risk_factor: 1.0, number_risks: 1, periodized_total_premium: 10.0 }, 0.25, 1.0, 12, Tick(0));
        let terms = Terms { premium: 0.01, runtime: 12, payment_period: 3 };
        let layer = sim.contracts.issue(ContractKind::Reinsurance, Party::Firm(reinsurer), layer_risk, Tick(0), terms);
        sim.link_reinsurance(layer).unwrap();
        sim.firm_mut(reinsurer).contracts.push(layer);

        sim.contracts.get_mut(primary).unwrap().explode(false, Tick(1), 0.0, 0.6);
        sim.make_reinsurance_claims(insurer, Tick(1));

        let claims: Vec<_> = sim.firm(reinsurer).obligations.iter().filter(|o| o.purpose == Purpose::Claim).collect();
        assert_eq!(claims.len(), 1);
        assert!((claims[0].amount - 350.0).abs() < 1e-9, "layer claim {}", claims[0].amount);
        assert_eq!(claims[0].recipient, Party::Firm(insurer));

        sim.make_reinsurance_claims(insurer, Tick(1));
        assert_eq!(
            sim.firm(reinsurer).obligations.iter().filter(|o| o.purpose == Purpose::Claim).count(),
            1,
            "a collected claim is not passed on twice"
        );
    }

    /// A claim below the deductible leaves the layer untouched.
    #[test]
    fn claim_below_deductible_leaves_layer_alone() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let reinsurer = FirmId(3);
        let primary = write_primary(&mut sim, insurer, 2, Tick(0));
        let exposure = CategoryExposure { total_value: 1000.0, average_risk_factor: 1.0, number_risks: 1, periodized_total_premium: 10.0 };
        let terms = Terms { premium: 0.01, runtime: 12, payment_period: 3 };
        let layer = sim.contracts.issue(
            ContractKind::Reinsurance,
            Party::Firm(reinsurer),
            layer_request(insurer, 2, &exposure, 0.5, 1.0, 12, Tick(0)),
            Tick(0),
            terms,
        );
        sim.link_reinsurance(layer).unwrap();

        sim.contracts.get_mut(primary).unwrap().explode(false, Tick(1), 0.0, 0.3);
        sim.make_reinsurance_claims(insurer, Tick(1));
        assert!(sim.firm(reinsurer).obligations.is_empty());
        assert_eq!(sim.contracts.get(layer).unwrap().current_claim, 0.0);
    }

    // ── Maturity ──────────────────────────────────────────────────────────────

    #[test]
    fn matured_primary_returns_its_risk_unless_rolled_over() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let plain = write_primary(&mut sim, insurer, 0, Tick(0));
        let renewed = write_primary(&mut sim, insurer, 1, Tick(0));
        sim.contracts.get_mut(renewed).unwrap().roll_over_flag = true;
        let pool = sim.market.risks.len();

        let dissolved = sim.mature_contracts(insurer, Tick(12));
        assert_eq!(dissolved, 2);
        assert!(sim.contracts.get(plain).is_none() && sim.contracts.get(renewed).is_none());
        assert_eq!(sim.market.risks.len(), pool + 1, "only the plain contract's risk goes back");
    }

    #[test]
    fn matured_layer_frees_its_interval() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let reinsurer = FirmId(3);
        let exposure = CategoryExposure { total_value: 5000.0, average_risk_factor: 1.0, number_risks: 5, periodized_total_premium: 50.0 };
        let terms = Terms { premium: 0.01, runtime: 12, payment_period: 3 };
        let layer = sim.contracts.issue(
            ContractKind::Reinsurance,
            Party::Firm(reinsurer),
            layer_request(insurer, 1, &exposure, 0.25, 1.0, 12, Tick(0)),
            Tick(0),
            terms,
        );
        sim.link_reinsurance(layer).unwrap();
        sim.firm_mut(reinsurer).contracts.push(layer);
        assert!(sim.firm(insurer).profile.is_fully_covered(1));

        assert_eq!(sim.mature_contracts(reinsurer, Tick(11)), 0, "not yet due");
        assert_eq!(sim.mature_contracts(reinsurer, Tick(12)), 1);
        assert!(sim.firm(insurer).profile.layers(1).is_empty());
    }

    // ── Payments ──────────────────────────────────────────────────────────────

    #[test]
    fn premium_instalment_becomes_holder_obligation() {
        let mut sim = sim();
        let insurer = FirmId(0);
        write_primary(&mut sim, insurer, 0, Tick(0));
        sim.check_payments_due(Party::Firm(insurer), Tick(0));
        let premiums: Vec<_> = sim.market.obligations.iter().filter(|o| o.purpose == Purpose::Premium).collect();
        assert_eq!(premiums.len(), 1);
        assert!((premiums[0].amount - 50.0).abs() < 1e-9, "200 over four instalments");
        assert_eq!(premiums[0].recipient, Party::Firm(insurer));
    }

    // ── Coverage requests ─────────────────────────────────────────────────────

    #[test]
    fn request_is_published_per_planned_tranche() {
        let mut config = config();
        config.reinsurance.min_tranches = 3;
        let mut sim = Simulation::from_config(config).unwrap();
        let insurer = FirmId(0);
        for _ in 0..4 {
            write_primary(&mut sim, insurer, 2, Tick(0));
        }
        sim.ask_reinsurance_by_category(insurer, Tick(0), 2);
        assert_eq!(sim.market.reinrisks.len(), 3);
        let total: f64 = sim.market.reinrisks.iter().map(|r| r.limit_fraction() - r.deductible_fraction()).sum();
        assert!((total - 0.75).abs() < 1e-12, "tranches cover the whole band");
        assert!(sim.market.reinrisks.iter().all(|r| r.value == 4000.0 && r.owner == Party::Firm(insurer)));
    }

    #[test]
    fn empty_category_publishes_nothing() {
        let mut sim = sim();
        sim.ask_reinsurance_by_category(FirmId(0), Tick(0), 1);
        assert!(sim.market.reinrisks.is_empty());
        assert_eq!(sim.issue_cat_bond(FirmId(0), Tick(0), 1).unwrap(), None);
    }

    /// Below target the firm requests cover for every open category it
    /// has business in, regardless of prices.
    #[test]
    fn under_target_firm_requests_cover_everywhere() {
        let mut sim = sim();
        let insurer = FirmId(0);
        for category in 0..4 {
            write_primary(&mut sim, insurer, category, Tick(0));
        }
        sim.firm_mut(insurer).capacity_target = 1e12;
        sim.increase_capacity(insurer, Tick(0), 1000.0).unwrap();
        let mut categories: Vec<usize> = sim.market.reinrisks.iter().map(|r| r.category).collect();
        categories.sort_unstable();
        categories.dedup();
        assert_eq!(categories, vec![0, 1, 2, 3]);
    }

    /// At or above target with a book priced at the market, nothing is bought.
    #[test]
    fn above_target_firm_without_premium_gap_buys_nothing() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let premium = sim.market.get_market_premium();
        let terms = Terms { premium, runtime: 12, payment_period: 3 };
        let cid = sim.contracts.issue(
            ContractKind::Insurance,
            Party::Firm(insurer),
            RiskProperties::primary(1000.0, 0, 1.0),
            Tick(0),
            terms,
        );
        sim.firm_mut(insurer).contracts.push(cid);
        sim.firm_mut(insurer).capacity_target = 0.0;
        sim.increase_capacity(insurer, Tick(0), 1000.0).unwrap();
        assert!(sim.market.reinrisks.is_empty());
    }

    /// At or above target, with every category underpriced against the
    /// market, only the first category walked publishes its tranches.
    #[test]
    fn above_target_firm_acts_on_one_category_per_tick() {
        let mut config = config();
        config.reinsurance.min_tranches = 2;
        let mut sim = Simulation::from_config(config).unwrap();
        let insurer = FirmId(0);
        for category in 0..4 {
            write_priced(&mut sim, insurer, category, 1e-6);
        }
        sim.firm_mut(insurer).capacity_target = 0.0;
        sim.increase_capacity(insurer, Tick(0), 1000.0).unwrap();

        assert_eq!(sim.market.reinrisks.len(), 2, "two tranches for a single category");
        let first = sim.market.reinrisks[0].category;
        assert!(sim.market.reinrisks.iter().all(|r| r.category == first));
        assert!(sim.bonds.is_empty());
    }

    /// Categories priced above the market are passed over and the walk goes
    /// on until it reaches the one worth covering, whatever the shuffle.
    #[test]
    fn declined_categories_do_not_end_the_walk() {
        for seed in 0..8 {
            let mut config = config();
            config.seed = seed;
            let mut sim = Simulation::from_config(config).unwrap();
            let insurer = FirmId(0);
            let dear = 2.0 * sim.market.get_market_premium();
            for category in 0..3 {
                write_priced(&mut sim, insurer, category, dear);
            }
            write_priced(&mut sim, insurer, 3, 1e-6);
            sim.firm_mut(insurer).capacity_target = 0.0;
            sim.increase_capacity(insurer, Tick(0), 1000.0).unwrap();

            assert!(!sim.market.reinrisks.is_empty(), "seed {seed}: cheap category never reached");
            assert!(sim.market.reinrisks.iter().all(|r| r.category == 3), "seed {seed}");
        }
    }

    /// Two equal gaps around a placed layer: the bond takes the lower one,
    /// the same one tranche planning would bisect first.
    #[test]
    fn cat_bond_covers_first_of_equally_wide_gaps() {
        let mut sim = sim();
        let insurer = FirmId(0);
        let reinsurer = FirmId(3);
        for _ in 0..10 {
            write_primary(&mut sim, insurer, 1, Tick(0));
        }
        let exposure = CategoryExposure { total_value: 10_000.0, average_risk_factor: 1.0, number_risks: 10, periodized_total_premium: 100.0 };
        let terms = Terms { premium: 0.01, runtime: 12, payment_period: 3 };
        let middle = sim.contracts.issue(
            ContractKind::Reinsurance,
            Party::Firm(reinsurer),
            layer_request(insurer, 1, &exposure, 0.5, 0.75, 12, Tick(0)),
            Tick(0),
            terms,
        );
        sim.link_reinsurance(middle).unwrap();

        let bond = sim.issue_cat_bond(insurer, Tick(0), 1).unwrap().expect("bond placed");
        let cid = sim.bonds[&bond.0].contract.unwrap();
        let layer = sim.contracts.get(cid).unwrap();
        assert!((layer.deductible_fraction - 0.25).abs() < 1e-12);
        assert!((layer.limit_fraction - 0.5).abs() < 1e-12);
    }

    #[test]
    fn cheaper_bonds_win_over_reinsurance() {
        let mut config = config();
        config.pricing.reinsurance_off = true;
        let mut sim = Simulation::from_config(config).unwrap();
        let insurer = FirmId(0);
        for _ in 0..10 {
            write_primary(&mut sim, insurer, 1, Tick(0));
        }
        sim.firm_mut(insurer).capacity_target = 1e12;
        sim.increase_capacity(insurer, Tick(0), 1000.0).unwrap();
        assert!(sim.market.reinrisks.is_empty(), "reinsurance is switched off");
        assert_eq!(sim.bonds.len(), 1, "one bond for the only category with business");
        assert!(sim.firm(insurer).profile.is_fully_covered(1));
    }

    // ── Bankruptcy ────────────────────────────────────────────────────────────

    #[test]
    fn bankruptcy_voids_book_and_returns_risks() {
        let mut sim = sim();
        let insurer = FirmId(1);
        let a = write_primary(&mut sim, insurer, 0, Tick(0));
        let b = write_primary(&mut sim, insurer, 3, Tick(0));
        sim.firm_mut(insurer).risks_kept.push(RiskProperties::primary(1000.0, 2, 1.0));
        let pool = sim.market.risks.len();
        let money = sim.total_money();

        sim.enter_bankruptcy(insurer, Tick(5), 1e9).unwrap();

        assert!(sim.contracts.get(a).is_none() && sim.contracts.get(b).is_none());
        assert_eq!(sim.market.risks.len(), pool + 3, "two voided risks and one kept risk");
        assert_eq!(sim.firm(insurer).cash, 0.0);
        assert!(!sim.firm(insurer).operational);
        assert!((sim.total_money() - money).abs() < 1e-6);
    }

    // ── Renewals ──────────────────────────────────────────────────────────────

    /// With retention 1 every maturing primary risk is kept and flagged.
    #[test]
    fn full_retention_keeps_every_maturing_risk() {
        let mut config = config();
        config.insurers.retention = 1.0;
        let mut sim = Simulation::from_config(config).unwrap();
        let insurer = FirmId(0);
        let due = write_primary(&mut sim, insurer, 0, Tick(0));
        let later = write_primary(&mut sim, insurer, 0, Tick(5));
        sim.roll_over(insurer, Tick(11));
        assert_eq!(sim.firm(insurer).risks_kept.len(), 1);
        assert!(sim.contracts.get(due).unwrap().roll_over_flag);
        assert!(!sim.contracts.get(later).unwrap().roll_over_flag);
    }
}
