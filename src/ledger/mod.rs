pub mod insurance;
pub mod token;
pub mod treasury;

pub use insurance::{InsurancePool, InsuranceSnapshot};
pub use token::TokenLedger;
pub use treasury::{Treasury, TreasurySnapshot};
