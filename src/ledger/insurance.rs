use crate::errors::{EngineError, EngineResult};
use crate::ledger::token::TokenLedger;
use crate::pricing::fixed::{mul_div, mul_div_up};
use crate::state::AccountId;
use std::collections::HashMap;

/// Stake-and-cover pool backing the treasury.
///
/// Stakers hold shares of the pool's token balance. The treasury may pull
/// cover from it; profits sent to it raise the share value. Per-holder
/// `start_balance` tracks the value a holder put in, so
/// claimable profit = share value - start balance (never negative).
#[derive(Debug, Clone)]
pub struct InsurancePool {
    account: AccountId,
    admin: AccountId,
    treasury: Option<AccountId>,
    total_shares: u128,
    shares: HashMap<AccountId, u128>,
    start_balance: HashMap<AccountId, u128>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct InsuranceSnapshot {
    pub balance: u128,
    pub total_shares: u128,
    pub stakers: usize,
}

impl InsurancePool {
    pub fn new(account: AccountId, admin: AccountId) -> Self {
        Self {
            account,
            admin,
            treasury: None,
            total_shares: 0,
            shares: HashMap::new(),
            start_balance: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    #[inline]
    pub fn balance(&self, token: &TokenLedger) -> u128 {
        token.balance_of(&self.account)
    }

    #[inline]
    pub fn shares_of(&self, holder: &AccountId) -> u128 {
        self.shares.get(holder).copied().unwrap_or(0)
    }

    #[inline]
    pub fn start_balance_of(&self, holder: &AccountId) -> u128 {
        self.start_balance.get(holder).copied().unwrap_or(0)
    }

    pub fn grant_treasury_role(&mut self, caller: &AccountId, treasury: AccountId) -> EngineResult<()> {
        if caller != &self.admin {
            return Err(EngineError::Unauthorized(format!(
                "{caller} cannot grant the treasury role"
            )));
        }
        tracing::info!(treasury = %treasury, "treasury role granted on insurance pool");
        self.treasury = Some(treasury);
        Ok(())
    }

    pub fn share_value(&self, holder: &AccountId, token: &TokenLedger) -> EngineResult<u128> {
        if self.total_shares == 0 {
            return Ok(0);
        }
        mul_div(self.shares_of(holder), self.balance(token), self.total_shares)
    }

    /// Stake `amount`, minting shares at the current share value.
    pub fn provide(&mut self, holder: &AccountId, amount: u128, token: &mut TokenLedger) -> EngineResult<u128> {
        let balance = self.balance(token);
        let minted = if self.total_shares == 0 {
            amount
        } else if balance == 0 {
            // Shares outstanding against an empty pool: new stake would be diluted to nothing
            return Err(EngineError::InsufficientLiquidity { available: 0, required: amount });
        } else {
            mul_div(amount, self.total_shares, balance)?
        };
        if minted == 0 {
            return Err(EngineError::InsufficientBalance {
                account: holder.clone(),
                available: amount,
                required: mul_div_up(1, balance, self.total_shares.max(1))?,
            });
        }

        token.transfer(holder, &self.account, amount)?;
        self.total_shares = self
            .total_shares
            .checked_add(minted)
            .ok_or(EngineError::Overflow("total shares"))?;
        *self.shares.entry(holder.clone()).or_insert(0) += minted;
        *self.start_balance.entry(holder.clone()).or_insert(0) += amount;

        tracing::info!(holder = %holder, amount, shares = minted, "stake provided");
        Ok(minted)
    }

    /// Move shares (and the matching part of the start balance) between holders.
    pub fn transfer_share(
        &mut self,
        caller: &AccountId,
        from: &AccountId,
        to: &AccountId,
        amount: u128,
    ) -> EngineResult<()> {
        if caller != from {
            return Err(EngineError::Unauthorized(format!(
                "{caller} cannot transfer shares of {from}"
            )));
        }
        let held = self.shares_of(from);
        if held < amount {
            return Err(EngineError::InsufficientBalance {
                account: from.clone(),
                available: held,
                required: amount,
            });
        }
        if amount == 0 || from == to {
            return Ok(());
        }

        let start = self.start_balance_of(from);
        let moved_start = mul_div(start, amount, held)?;

        self.shares.insert(from.clone(), held - amount);
        self.start_balance.insert(from.clone(), start - moved_start);
        *self.shares.entry(to.clone()).or_insert(0) += amount;
        *self.start_balance.entry(to.clone()).or_insert(0) += moved_start;
        Ok(())
    }

    /// Burn `amount` shares and pay out their value.
    pub fn withdraw(&mut self, holder: &AccountId, amount: u128, token: &mut TokenLedger) -> EngineResult<u128> {
        let held = self.shares_of(holder);
        if held < amount || amount == 0 {
            return Err(EngineError::InsufficientBalance {
                account: holder.clone(),
                available: held,
                required: amount,
            });
        }

        let value = mul_div(amount, self.balance(token), self.total_shares)?;
        let start = self.start_balance_of(holder);
        let released_start = mul_div(start, amount, held)?;

        token.transfer(&self.account, holder, value)?;
        self.burn(holder, amount);
        self.start_balance.insert(holder.clone(), start - released_start);

        tracing::info!(holder = %holder, shares = amount, value, "stake withdrawn");
        Ok(value)
    }

    /// Pay out value accrued above the holder's start balance.
    pub fn claim_profit(&mut self, holder: &AccountId, token: &mut TokenLedger) -> EngineResult<u128> {
        let value = self.share_value(holder, token)?;
        let start = self.start_balance_of(holder);
        if value <= start {
            return Err(EngineError::ZeroClaimableProfit);
        }
        let profit = value - start;

        let burned = mul_div_up(profit, self.total_shares, self.balance(token))?
            .min(self.shares_of(holder));
        token.transfer(&self.account, holder, profit)?;
        self.burn(holder, burned);

        let remaining = self.share_value(holder, token)?;
        self.start_balance.insert(holder.clone(), remaining);

        tracing::info!(holder = %holder, profit, shares_burned = burned, "profit claimed");
        Ok(profit)
    }

    /// Cover transfer to the treasury. Only the granted treasury may pull.
    pub fn pay_out(&mut self, caller: &AccountId, amount: u128, token: &mut TokenLedger) -> EngineResult<()> {
        match &self.treasury {
            Some(treasury) if treasury == caller => {}
            _ => {
                return Err(EngineError::Unauthorized(format!(
                    "{caller} cannot pull cover from the insurance pool"
                )))
            }
        }
        let balance = self.balance(token);
        if balance < amount {
            return Err(EngineError::InsufficientLiquidity { available: balance, required: amount });
        }
        token.transfer(&self.account, caller, amount)?;
        tracing::warn!(amount, remaining = balance - amount, "insurance pool paid out cover");
        Ok(())
    }

    pub fn snapshot(&self, token: &TokenLedger) -> InsuranceSnapshot {
        InsuranceSnapshot {
            balance: self.balance(token),
            total_shares: self.total_shares,
            stakers: self.shares.values().filter(|s| **s > 0).count(),
        }
    }

    fn burn(&mut self, holder: &AccountId, amount: u128) {
        let held = self.shares_of(holder);
        self.shares.insert(holder.clone(), held.saturating_sub(amount));
        self.total_shares = self.total_shares.saturating_sub(amount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (InsurancePool, TokenLedger, AccountId, AccountId) {
        let admin = AccountId::from("admin");
        let pool = InsurancePool::new(AccountId::from("insurance"), admin);
        let mut token = TokenLedger::new();
        let alice = AccountId::from("alice");
        let bob = AccountId::from("bob");
        token.mint(&alice, 1_000_000).unwrap();
        token.mint(&bob, 1_000_000).unwrap();
        (pool, token, alice, bob)
    }

    #[test]
    fn test_shares_track_value() {
        let (mut pool, mut token, alice, bob) = setup();
        assert_eq!(pool.provide(&alice, 1_000, &mut token).unwrap(), 1_000);
        // Pool doubles in value
        token.mint(pool.account(), 1_000).unwrap();
        // Bob gets half as many shares per token
        assert_eq!(pool.provide(&bob, 1_000, &mut token).unwrap(), 500);
        assert_eq!(pool.share_value(&alice, &token).unwrap(), 2_000);
        assert_eq!(pool.share_value(&bob, &token).unwrap(), 1_000);
    }

    #[test]
    fn test_claim_profit_resets_start_balance() {
        let (mut pool, mut token, alice, _) = setup();
        pool.provide(&alice, 1_000, &mut token).unwrap();
        assert!(matches!(pool.claim_profit(&alice, &mut token), Err(EngineError::ZeroClaimableProfit)));

        token.mint(pool.account(), 250).unwrap();
        assert_eq!(pool.claim_profit(&alice, &mut token).unwrap(), 250);
        assert_eq!(token.balance_of(&alice), 1_000_000 - 1_000 + 250);
        assert_eq!(pool.start_balance_of(&alice), pool.share_value(&alice, &token).unwrap());
        assert!(matches!(pool.claim_profit(&alice, &mut token), Err(EngineError::ZeroClaimableProfit)));
    }

    #[test]
    fn test_transfer_share_moves_start_balance() {
        let (mut pool, mut token, alice, bob) = setup();
        pool.provide(&alice, 1_000, &mut token).unwrap();
        assert!(matches!(
            pool.transfer_share(&bob, &alice, &bob, 100),
            Err(EngineError::Unauthorized(_))
        ));
        pool.transfer_share(&alice, &alice, &bob, 400).unwrap();
        assert_eq!(pool.shares_of(&bob), 400);
        assert_eq!(pool.start_balance_of(&bob), 400);
        assert_eq!(pool.start_balance_of(&alice), 600);
    }

    #[test]
    fn test_withdraw_after_loss() {
        let (mut pool, mut token, alice, _) = setup();
        let treasury = AccountId::from("treasury");
        pool.grant_treasury_role(&AccountId::from("admin"), treasury.clone()).unwrap();
        pool.provide(&alice, 1_000, &mut token).unwrap();
        pool.pay_out(&treasury, 200, &mut token).unwrap();

        assert_eq!(pool.withdraw(&alice, 500, &mut token).unwrap(), 400);
        assert_eq!(pool.start_balance_of(&alice), 500);
        assert!(matches!(pool.claim_profit(&alice, &mut token), Err(EngineError::ZeroClaimableProfit)));
    }

    #[test]
    fn test_pay_out_role_gated() {
        let (mut pool, mut token, alice, _) = setup();
        pool.provide(&alice, 1_000, &mut token).unwrap();
        assert!(matches!(
            pool.pay_out(&alice, 10, &mut token),
            Err(EngineError::Unauthorized(_))
        ));
        assert!(matches!(
            pool.grant_treasury_role(&alice, alice.clone()),
            Err(EngineError::Unauthorized(_))
        ));
    }
}
