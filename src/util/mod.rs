//! Shared utility types.

pub mod money_amount;

pub use money_amount::{MoneyAmount, MoneyAmountError};
