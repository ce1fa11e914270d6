//! Collaborator contracts
//!
//! The engine never talks to a chain directly. Ledgers, price feeds, the pool
//! factory, the quoter and the swap router are all reached through these
//! traits. Every call is synchronous and may fail; failures surface as
//! `FundError` and abort the enclosing operation (the path quoter is the one
//! caller that tolerates them per candidate).

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::error::FundResult;
use crate::router::SwapPath;

/// Oracle answer: price in value units per whole token, and its update time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceData {
    pub price: U256,
    pub updated_at: u64,
}

pub trait BalanceReader {
    /// Live balance, never a cached value
    fn balance_of(&self, token: Address, holder: Address) -> FundResult<U256>;

    fn decimals(&self, token: Address) -> FundResult<u8>;
}

pub trait TokenLedger: BalanceReader {
    fn transfer(&mut self, token: Address, from: Address, to: Address, amount: U256)
        -> FundResult<()>;
}

pub trait PriceOracle {
    /// Fails with `PriceFeedMissing` when no feed is configured for `token`
    fn latest_price(&self, token: Address) -> FundResult<PriceData>;
}

pub trait PoolRegistry {
    fn pool_exists(&self, token_a: Address, token_b: Address, fee: u32)
        -> FundResult<Option<Address>>;
}

/// Off-chain view of a QuoterV2-style contract
pub trait PathPricer {
    /// Output obtainable for `amount_in` along `path` (input-to-output encoding)
    fn quote_exact_input(&self, path: &SwapPath, amount_in: U256) -> FundResult<U256>;

    /// Input required for `amount_out` along `path` (output-to-input encoding)
    fn quote_exact_output(&self, path: &SwapPath, amount_out: U256) -> FundResult<U256>;
}

pub trait SwapExecutor {
    /// `trader` pays `amount_in` of the first path token and receives the last
    fn exact_input(
        &mut self,
        trader: Address,
        path: &SwapPath,
        amount_in: U256,
        min_amount_out: U256,
    ) -> FundResult<U256>;

    /// `path` is output-to-input; returns the input actually paid
    fn exact_output(
        &mut self,
        trader: Address,
        path: &SwapPath,
        amount_out: U256,
        max_amount_in: U256,
    ) -> FundResult<U256>;
}

/// Snapshot/restore used to roll back a failed operation
pub trait Checkpoint {
    type Snapshot;

    fn checkpoint(&self) -> Self::Snapshot;

    fn restore(&mut self, snapshot: Self::Snapshot);
}

/// Everything the routing side of the fund reads
pub trait RouteSource: PoolRegistry + PathPricer {}

impl<T: PoolRegistry + PathPricer> RouteSource for T {}

/// Everything a state-changing fund operation needs
pub trait Market: TokenLedger + PriceOracle + RouteSource + SwapExecutor + Checkpoint {}

impl<T> Market for T where T: TokenLedger + PriceOracle + RouteSource + SwapExecutor + Checkpoint {}
