use crate::errors::{EngineError, EngineResult};
use crate::state::AccountId;
use std::collections::HashMap;

/// ERC-20-equivalent balance book for the settlement token.
/// Custody lives here; treasury and insurance pool only move balances through it.
#[derive(Debug, Clone, Default)]
pub struct TokenLedger {
    balances: HashMap<AccountId, u128>,
    total_supply: u128,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn balance_of(&self, who: &AccountId) -> u128 {
        self.balances.get(who).copied().unwrap_or(0)
    }

    #[inline]
    pub fn total_supply(&self) -> u128 {
        self.total_supply
    }

    /// External credit (deposit from outside the engine).
    pub fn mint(&mut self, to: &AccountId, amount: u128) -> EngineResult<()> {
        let balance = self.balance_of(to);
        let new_balance = balance
            .checked_add(amount)
            .ok_or(EngineError::Overflow("mint"))?;
        self.total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(EngineError::Overflow("total supply"))?;
        self.balances.insert(to.clone(), new_balance);
        Ok(())
    }

    pub fn transfer(&mut self, from: &AccountId, to: &AccountId, amount: u128) -> EngineResult<()> {
        let available = self.balance_of(from);
        if available < amount {
            return Err(EngineError::InsufficientBalance {
                account: from.clone(),
                available,
                required: amount,
            });
        }
        if from == to || amount == 0 {
            return Ok(());
        }
        self.balances.insert(from.clone(), available - amount);
        let credited = self
            .balance_of(to)
            .checked_add(amount)
            .ok_or(EngineError::Overflow("transfer"))?;
        self.balances.insert(to.clone(), credited);
        Ok(())
    }
}
