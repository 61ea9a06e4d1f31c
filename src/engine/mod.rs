pub mod actor;

use crate::errors::{EngineError, EngineResult};
use crate::ledger::{InsurancePool, TokenLedger, Treasury};
use crate::params::Deployment;
use crate::state::{
    AccountId, Asset, Command, EngineSnapshot, EngineState, LedgerSnapshot, Outcome, PositionId,
    PriceTick, SweepFailure,
};
use crate::strategy::position::{Position, PositionState};
use smallvec::SmallVec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Well-known accounts of a deployment.
#[derive(Debug, Clone)]
pub struct Accounts {
    pub treasury: AccountId,
    pub insurance: AccountId,
    pub admin: AccountId,
}

/// Everything a transaction may touch. Cloned as a draft, committed whole.
/// Holds open positions only; closed ones leave with their lock.
#[derive(Debug, Clone)]
pub struct Book {
    pub token: TokenLedger,
    pub treasury: Treasury,
    pub insurance: InsurancePool,
    pub positions: BTreeMap<PositionId, Position>,
    pub next_id: PositionId,
}

impl Book {
    /// Ledger totals must agree with the token ledger, and every open
    /// position with exactly one lock.
    pub fn check_invariants(&self) -> EngineResult<()> {
        self.treasury.check_invariants(&self.token)?;
        if self.treasury.open_locks() != self.positions.len() {
            return Err(EngineError::StateCorruption(format!(
                "{} locks for {} open positions",
                self.treasury.open_locks(),
                self.positions.len()
            )));
        }
        for position in self.positions.values() {
            let lock = self.treasury.lock_of(position.id).ok_or_else(|| {
                EngineError::StateCorruption(format!("position {} has no lock", position.id))
            })?;
            if !position.is_active()
                || lock.amount != position.locked_amount
                || lock.premium != position.locked_premium
            {
                return Err(EngineError::StateCorruption(format!(
                    "position {} disagrees with its lock",
                    position.id
                )));
            }
        }
        Ok(())
    }
}

/// Result of an expiry sweep. Each position is its own transaction.
#[derive(Debug, Default)]
pub struct Sweep {
    pub unlocked: Vec<Position>,
    pub failed: Vec<SweepFailure>,
}

/// The options book. Single-writer: all mutation goes through `transact`.
/// Time and price are inputs; nothing here reads a clock.
pub struct Engine {
    book: Book,
    /// Exercised and unlocked positions, kept out of the transaction draft
    closed: HashMap<PositionId, Position>,
    deployment: Arc<Deployment>,
    prices: HashMap<Asset, PriceTick>,
    accounts: Accounts,
}

impl Engine {
    pub fn new(deployment: Arc<Deployment>, accounts: Accounts) -> EngineResult<Self> {
        if accounts.treasury == accounts.insurance {
            return Err(EngineError::Config(
                "treasury and insurance accounts must differ".into(),
            ));
        }
        let mut treasury = Treasury::new(
            accounts.treasury.clone(),
            accounts.admin.clone(),
            deployment.benchmark,
        );
        let mut insurance = InsurancePool::new(accounts.insurance.clone(), accounts.admin.clone());
        insurance.grant_treasury_role(&accounts.admin, accounts.treasury.clone())?;
        for (key, _) in deployment.strategies.iter() {
            treasury.grant_strategy_role(&accounts.admin, *key)?;
        }

        Ok(Self {
            book: Book {
                token: TokenLedger::new(),
                treasury,
                insurance,
                positions: BTreeMap::new(),
                next_id: 0,
            },
            closed: HashMap::new(),
            deployment,
            prices: HashMap::new(),
            accounts,
        })
    }

    #[cfg(test)]
    pub fn book(&self) -> &Book {
        &self.book
    }

    #[inline]
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }

    /// Run `op` against a draft of the book. The draft replaces the book only
    /// if `op` succeeds and the ledger invariants still hold.
    fn transact<T>(&mut self, op: impl FnOnce(&mut Book) -> EngineResult<T>) -> EngineResult<T> {
        let mut draft = self.book.clone();
        let out = op(&mut draft)?;
        draft.check_invariants()?;
        self.book = draft;
        Ok(out)
    }

    // ── Prices ──

    /// Record a tick. Older ticks than the latest for the asset are ignored.
    pub fn update_price(&mut self, tick: PriceTick) -> bool {
        if tick.price == 0 {
            tracing::warn!(asset = %tick.asset, "zero price tick ignored");
            return false;
        }
        if let Some(latest) = self.prices.get(&tick.asset) {
            if tick.timestamp < latest.timestamp {
                tracing::debug!(asset = %tick.asset, ts = tick.timestamp, "stale tick ignored");
                return false;
            }
        }
        self.prices.insert(tick.asset, tick);
        true
    }

    pub fn price(&self, asset: Asset) -> EngineResult<u128> {
        self.prices
            .get(&asset)
            .map(|t| t.price)
            .ok_or(EngineError::MissingPrice(asset))
    }

    // ── Options ──

    pub fn buy(
        &mut self,
        holder: &AccountId,
        strategy: &str,
        period: u64,
        size: u128,
        acceptable_price: u128,
        now: i64,
    ) -> EngineResult<Position> {
        self.ensure_external(holder)?;
        let strategy = Arc::clone(self.deployment.strategy_by_name(strategy)?);
        let spot = self.price(strategy.asset())?;

        let quote = strategy.quote(period, size, spot)?;
        if quote.premium > acceptable_price {
            return Err(EngineError::PremiumTooHigh {
                premium: quote.premium,
                acceptable: acceptable_price,
            });
        }
        let expiration = i64::try_from(period)
            .ok()
            .and_then(|p| now.checked_add(p))
            .ok_or(EngineError::Overflow("expiration"))?;

        let position = self.transact(|book| {
            let id = book.next_id;
            book.token.transfer(holder, book.treasury.account(), quote.premium)?;
            book.treasury.add_tokens(&book.token)?;
            book.treasury.lock_liquidity_for(
                strategy.key,
                id,
                holder.clone(),
                quote.locked_amount,
                quote.premium,
                expiration,
                strategy.limit,
            )?;

            let position = Position {
                id,
                strategy: strategy.key,
                holder: holder.clone(),
                strike: quote.strike,
                size,
                period,
                created_at: now,
                expiration,
                locked_amount: quote.locked_amount,
                locked_premium: quote.premium,
                max_payout: quote.max_payout,
                state: PositionState::Active,
            };
            book.positions.insert(id, position.clone());
            book.next_id += 1;
            Ok(position)
        })?;

        tracing::info!(
            position = position.id,
            strategy = %position.strategy,
            holder = %holder,
            strike = position.strike,
            premium = quote.premium,
            locked = quote.locked_amount,
            expiration = position.expiration,
            "position opened"
        );
        Ok(position)
    }

    pub fn exercise(&mut self, caller: &AccountId, id: PositionId, now: i64) -> EngineResult<(Position, u128)> {
        let position = self.position(id)?;
        if !position.is_active() {
            return Err(EngineError::PositionClosed(id));
        }
        if caller != &position.holder {
            return Err(EngineError::Unauthorized(format!(
                "{caller} does not hold position {id}"
            )));
        }
        let strategy = Arc::clone(self.deployment.strategy(&position.strategy)?);
        let spot = self.price(strategy.asset())?;
        let payoff = strategy.settle(&position, spot, now)?;

        let exercised = self.transact(|book| {
            book.treasury.pay_off(
                &position.strategy,
                id,
                payoff,
                &position.holder,
                &mut book.token,
                &mut book.insurance,
                now,
            )?;
            let mut closed = book
                .positions
                .remove(&id)
                .ok_or(EngineError::PositionNotFound(id))?;
            closed.state = PositionState::Exercised { payoff, exercised_at: now };
            Ok(closed)
        })?;
        self.closed.insert(id, exercised.clone());

        tracing::info!(position = id, strategy = %position.strategy, payoff, spot, "position exercised");
        Ok((exercised, payoff))
    }

    /// Release collateral of an expired position. Anyone may call.
    pub fn unlock(&mut self, id: PositionId, now: i64) -> EngineResult<Position> {
        let position = self.position(id)?;
        if !position.is_active() {
            return Err(EngineError::PositionClosed(id));
        }
        if !position.is_expired(now) {
            return Err(EngineError::NotExpired(id));
        }

        let unlocked = self.transact(|book| {
            let position = release_expired(book, id, now)?;
            // No-op at or above the benchmark
            book.treasury.replenish(&mut book.token, &mut book.insurance)?;
            Ok(position)
        })?;
        self.closed.insert(id, unlocked.clone());

        tracing::info!(
            position = id,
            released = unlocked.locked_amount,
            premium = unlocked.locked_premium,
            "position unlocked"
        );
        Ok(unlocked)
    }

    /// Unlock every expired position in one draft. A position that fails to
    /// unlock stays open and is reported; the others still commit.
    pub fn unlock_expired(&mut self, now: i64) -> EngineResult<Sweep> {
        let expired: Vec<PositionId> = self
            .book
            .positions
            .values()
            .filter(|p| p.is_expired(now))
            .map(|p| p.id)
            .collect();
        if expired.is_empty() {
            return Ok(Sweep::default());
        }

        let sweep = self.transact(|book| {
            let mut sweep = Sweep::default();
            for id in expired {
                match release_expired(book, id, now) {
                    Ok(position) => sweep.unlocked.push(position),
                    Err(e @ EngineError::StateCorruption(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(position = id, error = %e, "sweep failed to unlock");
                        sweep.failed.push(SweepFailure { position: id, error: e.to_string() });
                    }
                }
            }
            Ok(sweep)
        })?;

        for position in &sweep.unlocked {
            tracing::info!(
                position = position.id,
                released = position.locked_amount,
                premium = position.locked_premium,
                "position unlocked"
            );
            self.closed.insert(position.id, position.clone());
        }
        Ok(sweep)
    }

    // ── Treasury ──

    pub fn replenish(&mut self) -> EngineResult<u128> {
        self.transact(|book| book.treasury.replenish(&mut book.token, &mut book.insurance))
    }

    /// Admin mint into a user account. Pool accounts are funded through
    /// `fund_treasury` or `provide` only.
    pub fn fund(&mut self, caller: &AccountId, account: &AccountId, amount: u128) -> EngineResult<()> {
        self.ensure_admin(caller)?;
        self.ensure_external(account)?;
        self.transact(|book| book.token.mint(account, amount))?;
        tracing::info!(account = %account, amount, "account funded");
        Ok(())
    }

    /// Admin mint into the treasury, swept into its accounted balance.
    pub fn fund_treasury(&mut self, caller: &AccountId, amount: u128) -> EngineResult<u128> {
        self.ensure_admin(caller)?;
        let added = self.transact(|book| {
            let account = book.treasury.account().clone();
            book.token.mint(&account, amount)?;
            book.treasury.add_tokens(&book.token)
        })?;
        tracing::info!(amount = added, "treasury funded");
        Ok(added)
    }

    pub fn withdraw(&mut self, caller: &AccountId, to: &AccountId, amount: u128) -> EngineResult<()> {
        self.ensure_external(to)?;
        self.transact(|book| book.treasury.withdraw(caller, to, amount, &mut book.token))
    }

    // ── Insurance pool ──

    pub fn provide(&mut self, holder: &AccountId, amount: u128) -> EngineResult<u128> {
        self.ensure_external(holder)?;
        self.transact(|book| book.insurance.provide(holder, amount, &mut book.token))
    }

    pub fn withdraw_stake(&mut self, holder: &AccountId, shares: u128) -> EngineResult<u128> {
        self.ensure_external(holder)?;
        self.transact(|book| book.insurance.withdraw(holder, shares, &mut book.token))
    }

    pub fn claim_profit(&mut self, holder: &AccountId) -> EngineResult<u128> {
        self.ensure_external(holder)?;
        self.transact(|book| book.insurance.claim_profit(holder, &mut book.token))
    }

    pub fn transfer_share(
        &mut self,
        caller: &AccountId,
        from: &AccountId,
        to: &AccountId,
        shares: u128,
    ) -> EngineResult<()> {
        self.ensure_external(to)?;
        self.transact(|book| book.insurance.transfer_share(caller, from, to, shares))
    }

    // ── Dispatch + queries ──

    pub fn apply(&mut self, command: Command, now: i64) -> EngineResult<Outcome> {
        let outcome = match command {
            Command::Buy { holder, strategy, period, size, acceptable_price } => {
                Outcome::Position(self.buy(&holder, &strategy, period, size, acceptable_price, now)?)
            }
            Command::Exercise { caller, position } => {
                let (position, payoff) = self.exercise(&caller, position, now)?;
                Outcome::Exercised { position, payoff }
            }
            Command::Unlock { position } => Outcome::Position(self.unlock(position, now)?),
            Command::UnlockExpired => {
                let sweep = self.unlock_expired(now)?;
                let replenished = self.replenish()?;
                Outcome::Sweep {
                    unlocked: sweep.unlocked.iter().map(|p| p.id).collect::<SmallVec<_>>(),
                    failed: sweep.failed,
                    replenished,
                }
            }
            Command::Fund { caller, account, amount } => {
                self.fund(&caller, &account, amount)?;
                Outcome::Done
            }
            Command::FundTreasury { caller, amount } => {
                Outcome::Amount { amount: self.fund_treasury(&caller, amount)? }
            }
            Command::Replenish => Outcome::Amount { amount: self.replenish()? },
            Command::TreasuryWithdraw { caller, to, amount } => {
                self.withdraw(&caller, &to, amount)?;
                Outcome::Done
            }
            Command::Provide { holder, amount } => Outcome::Shares { shares: self.provide(&holder, amount)? },
            Command::WithdrawStake { holder, shares } => {
                Outcome::Amount { amount: self.withdraw_stake(&holder, shares)? }
            }
            Command::ClaimProfit { holder } => Outcome::Amount { amount: self.claim_profit(&holder)? },
            Command::TransferShare { caller, from, to, shares } => {
                self.transfer_share(&caller, &from, &to, shares)?;
                Outcome::Done
            }
        };
        Ok(outcome)
    }

    pub fn position(&self, id: PositionId) -> EngineResult<Position> {
        self.book
            .positions
            .get(&id)
            .or_else(|| self.closed.get(&id))
            .cloned()
            .ok_or(EngineError::PositionNotFound(id))
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            treasury: self.book.treasury.snapshot(),
            insurance: self.book.insurance.snapshot(&self.book.token),
            token_supply: self.book.token.total_supply(),
        }
    }

    pub fn snapshot(&self, engine_state: EngineState, now: i64) -> EngineSnapshot {
        let mut prices: Vec<PriceTick> = self.prices.values().copied().collect();
        prices.sort_by_key(|t| t.asset);
        EngineSnapshot {
            engine_state,
            prices,
            ledger: self.ledger_snapshot(),
            active_positions: self.book.positions.len(),
            next_position_id: self.book.next_id,
            strategies: self.deployment.strategy_names(),
            updated_at: chrono::DateTime::from_timestamp(now, 0)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default(),
        }
    }

    /// Pool accounts only move through the ledger, never as a user party.
    fn ensure_external(&self, account: &AccountId) -> EngineResult<()> {
        if account == &self.accounts.treasury || account == &self.accounts.insurance {
            return Err(EngineError::Unauthorized(format!(
                "{account} is a pool account"
            )));
        }
        Ok(())
    }

    fn ensure_admin(&self, caller: &AccountId) -> EngineResult<()> {
        if caller != &self.accounts.admin {
            return Err(EngineError::Unauthorized(format!("{caller} is not the admin")));
        }
        Ok(())
    }
}

/// Release the lock of an expired position and take it off the book.
/// Leaves the book untouched on error.
fn release_expired(book: &mut Book, id: PositionId, now: i64) -> EngineResult<Position> {
    if !book.positions.contains_key(&id) {
        return Err(EngineError::PositionNotFound(id));
    }
    book.treasury.unlock(id, now)?;
    let mut position = book
        .positions
        .remove(&id)
        .ok_or(EngineError::PositionNotFound(id))?;
    position.state = PositionState::Unlocked { unlocked_at: now };
    Ok(position)
}
