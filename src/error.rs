//! Fund error taxonomy
//!
//! Every variant aborts the enclosing operation. The `Fund` handle restores
//! the pre-operation state, so callers never observe a partial result.

use alloy_primitives::{Address, U256};
use thiserror::Error;

pub type FundResult<T> = Result<T, FundError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FundError {
    /// Route endpoints or hop structure do not match the declared tokens
    #[error("invalid swap path: {0}")]
    InvalidSwapPath(String),

    #[error("price feed missing for {0}")]
    PriceFeedMissing(Address),

    #[error("price for {token} last updated at {updated_at}, older than {max_age}s at {now}")]
    StalePrice {
        token: Address,
        updated_at: u64,
        now: u64,
        max_age: u64,
    },

    #[error("target weights sum to {0} ppm, expected 1000000")]
    InsufficientWeightSum(u64),

    #[error("rebalance not due until {due} (now {now})")]
    NotRebalanceDue { due: u64, now: u64 },

    #[error("over slippage: amount {actual} violates bound {bound}")]
    OverSlippage { actual: U256, bound: U256 },

    #[error("token {0} is not a constituent")]
    TokenNotFound(Address),

    #[error("token {0} is already a constituent")]
    TokenExists(Address),

    /// Removal requires zero weight and zero reserve
    #[error("token {0} still has weight or reserve")]
    TokenInUse(Address),

    #[error("nothing claimable for {0}")]
    NothingClaimable(Address),

    #[error("mint amount {amount} below minimum {minimum}")]
    BelowMinimumMintAmount { amount: U256, minimum: U256 },

    #[error("array lengths differ: {left} vs {right}")]
    DifferentArrayLength { left: usize, right: usize },

    #[error("array length {actual}, expected {expected}")]
    InvalidArrayLength { expected: usize, actual: usize },

    #[error("{holder} holds {balance} shares, requested {requested}")]
    InsufficientShares {
        holder: Address,
        balance: U256,
        requested: U256,
    },

    #[error("{holder} holds {balance} of {token}, requires {required}")]
    InsufficientBalance {
        token: Address,
        holder: Address,
        balance: U256,
        required: U256,
    },

    #[error("amount must be nonzero")]
    ZeroAmount,

    #[error("arithmetic overflow in {0}")]
    MathOverflow(&'static str),

    /// An external collaborator (ledger, oracle, router) reverted
    #[error("{call} failed: {reason}")]
    CallFailed { call: &'static str, reason: String },
}

impl FundError {
    pub fn call(call: &'static str, reason: impl Into<String>) -> Self {
        FundError::CallFailed {
            call,
            reason: reason.into(),
        }
    }
}
