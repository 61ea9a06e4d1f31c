use crate::errors::{EngineError, EngineResult};
use crate::ledger::insurance::InsurancePool;
use crate::ledger::token::TokenLedger;
use crate::registry::StrategyKey;
use crate::state::{AccountId, PositionId};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Collateral reserved for one open position. Removed on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedLiquidity {
    pub strategy: StrategyKey,
    pub holder: AccountId,
    pub amount: u128,
    pub premium: u128,
    pub expiration: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TreasurySnapshot {
    pub total_balance: u128,
    pub total_locked: u128,
    pub locked_premium: u128,
    pub available: u128,
    pub benchmark: u128,
    pub locked_by_strategy: Vec<(String, u128)>,
}

/// Operational pool: holds premiums and collateral, pays off exercised options.
///
/// `total_balance` is the accounted balance; it only moves through this type
/// so that it always equals the token balance of `account` between operations.
#[derive(Debug, Clone)]
pub struct Treasury {
    account: AccountId,
    admin: AccountId,
    total_balance: u128,
    total_locked: u128,
    locked_premium: u128,
    benchmark: u128,
    locked_by_strategy: HashMap<StrategyKey, u128>,
    strategies: HashSet<StrategyKey>,
    locked: BTreeMap<PositionId, LockedLiquidity>,
}

impl Treasury {
    pub fn new(account: AccountId, admin: AccountId, benchmark: u128) -> Self {
        Self {
            account,
            admin,
            total_balance: 0,
            total_locked: 0,
            locked_premium: 0,
            benchmark,
            locked_by_strategy: HashMap::new(),
            strategies: HashSet::new(),
            locked: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    #[inline]
    pub fn total_balance(&self) -> u128 {
        self.total_balance
    }

    #[cfg(test)]
    pub fn total_locked(&self) -> u128 {
        self.total_locked
    }

    #[cfg(test)]
    pub fn locked_premium(&self) -> u128 {
        self.locked_premium
    }

    #[inline]
    pub fn locked_by(&self, strategy: &StrategyKey) -> u128 {
        self.locked_by_strategy.get(strategy).copied().unwrap_or(0)
    }

    #[inline]
    pub fn has_role(&self, strategy: &StrategyKey) -> bool {
        self.strategies.contains(strategy)
    }

    pub fn lock_of(&self, id: PositionId) -> Option<&LockedLiquidity> {
        self.locked.get(&id)
    }

    #[inline]
    pub fn open_locks(&self) -> usize {
        self.locked.len()
    }

    /// Balance not reserved for collateral or premiums.
    pub fn available(&self) -> u128 {
        self.total_balance
            .saturating_sub(self.total_locked)
            .saturating_sub(self.locked_premium)
    }

    pub fn grant_strategy_role(&mut self, caller: &AccountId, strategy: StrategyKey) -> EngineResult<()> {
        self.ensure_admin(caller)?;
        self.strategies.insert(strategy);
        tracing::info!(strategy = %strategy, "strategy role granted");
        Ok(())
    }

    /// Account for tokens that arrived at the treasury account.
    pub fn add_tokens(&mut self, token: &TokenLedger) -> EngineResult<u128> {
        let balance = token.balance_of(&self.account);
        if balance < self.total_balance {
            return Err(EngineError::StateCorruption(format!(
                "treasury holds {balance} but accounts {}",
                self.total_balance
            )));
        }
        let delta = balance - self.total_balance;
        self.total_balance = balance;
        Ok(delta)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lock_liquidity_for(
        &mut self,
        strategy: StrategyKey,
        id: PositionId,
        holder: AccountId,
        amount: u128,
        premium: u128,
        expiration: i64,
        limit: u128,
    ) -> EngineResult<()> {
        if !self.has_role(&strategy) {
            return Err(EngineError::Unauthorized(format!(
                "{strategy} has no strategy role"
            )));
        }
        if self.locked.contains_key(&id) {
            return Err(EngineError::StateCorruption(format!("position {id} already locked")));
        }

        let locked = self.locked_by(&strategy);
        if locked.saturating_add(amount) > limit {
            return Err(EngineError::LimitExceeded { locked, requested: amount, limit });
        }

        let required = amount
            .checked_add(premium)
            .ok_or(EngineError::Overflow("lock amount"))?;
        let available = self.available();
        if required > available {
            return Err(EngineError::InsufficientLiquidity { available, required });
        }

        self.total_locked += amount;
        self.locked_premium += premium;
        *self.locked_by_strategy.entry(strategy).or_insert(0) += amount;
        self.locked.insert(
            id,
            LockedLiquidity {
                strategy,
                holder,
                amount,
                premium,
                expiration,
            },
        );
        Ok(())
    }

    /// Release an expired lock without a payoff.
    pub fn unlock(&mut self, id: PositionId, now: i64) -> EngineResult<LockedLiquidity> {
        let lock = self.locked.get(&id).ok_or(EngineError::PositionNotFound(id))?;
        if now < lock.expiration {
            return Err(EngineError::NotExpired(id));
        }
        self.release(id)
    }

    /// Release the lock for `id` and pay `amount` to `recipient`, pulling any
    /// shortfall from the insurance pool. Returns the amount pulled as cover.
    #[allow(clippy::too_many_arguments)]
    pub fn pay_off(
        &mut self,
        strategy: &StrategyKey,
        id: PositionId,
        amount: u128,
        recipient: &AccountId,
        token: &mut TokenLedger,
        insurance: &mut InsurancePool,
        now: i64,
    ) -> EngineResult<u128> {
        let lock = self.locked.get(&id).ok_or(EngineError::PositionNotFound(id))?;
        if &lock.strategy != strategy || !self.has_role(strategy) {
            return Err(EngineError::Unauthorized(format!(
                "{strategy} cannot pay off position {id}"
            )));
        }
        if now >= lock.expiration {
            return Err(EngineError::AlreadyExpired(id));
        }
        self.release(id)?;

        let required = amount
            .checked_add(self.total_locked + self.locked_premium)
            .ok_or(EngineError::Overflow("pay off"))?;
        let mut covered = 0;
        if self.total_balance < required {
            let shortfall = required - self.total_balance;
            insurance
                .pay_out(&self.account, shortfall, token)
                .map_err(|e| match e {
                    EngineError::InsufficientLiquidity { available, .. } => {
                        EngineError::InsufficientLiquidity {
                            available: self.total_balance + available,
                            required,
                        }
                    }
                    other => other,
                })?;
            covered = self.add_tokens(token)?;
            tracing::warn!(position = id, shortfall, "treasury short, pulled cover");
        }

        token.transfer(&self.account, recipient, amount)?;
        self.total_balance -= amount;
        Ok(covered)
    }

    /// Top the treasury back up to its benchmark from the insurance pool.
    pub fn replenish(&mut self, token: &mut TokenLedger, insurance: &mut InsurancePool) -> EngineResult<u128> {
        if self.total_balance >= self.benchmark {
            return Ok(0);
        }
        let pull = (self.benchmark - self.total_balance).min(insurance.balance(token));
        if pull == 0 {
            return Ok(0);
        }
        insurance.pay_out(&self.account, pull, token)?;
        let added = self.add_tokens(token)?;
        tracing::info!(amount = added, total_balance = self.total_balance, "treasury replenished");
        Ok(added)
    }

    pub fn withdraw(
        &mut self,
        caller: &AccountId,
        to: &AccountId,
        amount: u128,
        token: &mut TokenLedger,
    ) -> EngineResult<()> {
        self.ensure_admin(caller)?;
        let available = self.available();
        if amount > available {
            return Err(EngineError::InsufficientLiquidity { available, required: amount });
        }
        token.transfer(&self.account, to, amount)?;
        self.total_balance -= amount;
        tracing::info!(to = %to, amount, "treasury withdrawal");
        Ok(())
    }

    /// Cross-check running totals against the token ledger and the lock table.
    pub fn check_invariants(&self, token: &TokenLedger) -> EngineResult<()> {
        let held = token.balance_of(&self.account);
        if held != self.total_balance {
            return Err(EngineError::StateCorruption(format!(
                "treasury balance {held} != accounted {}",
                self.total_balance
            )));
        }
        if self.total_balance < self.total_locked {
            return Err(EngineError::StateCorruption(format!(
                "total balance {} below total locked {}",
                self.total_balance, self.total_locked
            )));
        }

        let mut locked = 0u128;
        let mut premium = 0u128;
        let mut by_strategy: HashMap<StrategyKey, u128> = HashMap::new();
        for lock in self.locked.values() {
            locked += lock.amount;
            premium += lock.premium;
            *by_strategy.entry(lock.strategy).or_insert(0) += lock.amount;
        }
        if locked != self.total_locked || premium != self.locked_premium {
            return Err(EngineError::StateCorruption(format!(
                "lock table sums ({locked}, {premium}) != totals ({}, {})",
                self.total_locked, self.locked_premium
            )));
        }
        for (strategy, amount) in &self.locked_by_strategy {
            if by_strategy.get(strategy).copied().unwrap_or(0) != *amount {
                return Err(EngineError::StateCorruption(format!(
                    "locked by {strategy} drifted from lock table"
                )));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TreasurySnapshot {
        let mut locked_by_strategy: Vec<(String, u128)> = self
            .locked_by_strategy
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|(key, amount)| (key.to_string(), *amount))
            .collect();
        locked_by_strategy.sort();
        TreasurySnapshot {
            total_balance: self.total_balance,
            total_locked: self.total_locked,
            locked_premium: self.locked_premium,
            available: self.available(),
            benchmark: self.benchmark,
            locked_by_strategy,
        }
    }

    /// Drop the lock for `id` and take it out of the running totals.
    /// All totals are checked before any is written.
    fn release(&mut self, id: PositionId) -> EngineResult<LockedLiquidity> {
        let lock = self.locked.get(&id).ok_or(EngineError::PositionNotFound(id))?;

        let total_locked = self
            .total_locked
            .checked_sub(lock.amount)
            .ok_or_else(|| EngineError::StateCorruption("total locked underflow".into()))?;
        let locked_premium = self
            .locked_premium
            .checked_sub(lock.premium)
            .ok_or_else(|| EngineError::StateCorruption("locked premium underflow".into()))?;
        let by_strategy = self
            .locked_by(&lock.strategy)
            .checked_sub(lock.amount)
            .ok_or_else(|| EngineError::StateCorruption("strategy lock underflow".into()))?;

        let lock = self.locked.remove(&id).ok_or(EngineError::PositionNotFound(id))?;
        self.total_locked = total_locked;
        self.locked_premium = locked_premium;
        self.locked_by_strategy.insert(lock.strategy, by_strategy);
        Ok(lock)
    }

    fn ensure_admin(&self, caller: &AccountId) -> EngineResult<()> {
        if caller == &self.admin {
            Ok(())
        } else {
            Err(EngineError::Unauthorized(format!("{caller} is not the treasury admin")))
        }
    }
}
