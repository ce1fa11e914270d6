//! Simulated Market
//!
//! In-memory stand-in for the chain: an ERC-20 style ledger, a price-feed
//! table, a V3-style factory and quoter over constant-product pools, and a
//! swap router. Implements every collaborator trait, so the whole fund runs
//! against it in tests and in `basket simulate`.

pub mod pools;
pub mod scenario;

#[cfg(test)]
pub(crate) mod fixtures;

use alloy_primitives::{Address, U256};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::{FundError, FundResult};
use crate::interfaces::{
    BalanceReader, Checkpoint, PathPricer, PoolRegistry, PriceData, PriceOracle, SwapExecutor,
    TokenLedger,
};
use crate::router::SwapPath;
use pools::{Pool, PoolGraph};

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedMarket {
    tokens: HashMap<Address, TokenInfo>,
    balances: HashMap<(Address, Address), U256>,
    prices: HashMap<Address, PriceData>,
    pools: PoolGraph,
    /// Swaps touching these tokens revert
    failing_swaps: HashSet<Address>,
    /// Quotes touching these tokens revert
    failing_quotes: HashSet<Address>,
}

impl SimulatedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(&mut self, token: Address, symbol: &str, decimals: u8) {
        self.tokens.insert(
            token,
            TokenInfo {
                symbol: symbol.to_string(),
                decimals,
            },
        );
    }

    pub fn token_info(&self, token: Address) -> Option<&TokenInfo> {
        self.tokens.get(&token)
    }

    /// Symbol for display, falling back to the address
    pub fn symbol(&self, token: Address) -> String {
        self.tokens
            .get(&token)
            .map(|t| t.symbol.clone())
            .unwrap_or_else(|| token.to_string())
    }

    pub fn set_price(&mut self, token: Address, price: U256, updated_at: u64) {
        self.prices.insert(token, PriceData { price, updated_at });
    }

    pub fn remove_price(&mut self, token: Address) {
        self.prices.remove(&token);
    }

    pub fn add_pool(
        &mut self,
        token_a: Address,
        token_b: Address,
        fee: u32,
        reserve_a: U256,
        reserve_b: U256,
    ) -> Address {
        self.pools
            .insert(Pool::new(token_a, token_b, fee, reserve_a, reserve_b))
    }

    pub fn pools(&self) -> &PoolGraph {
        &self.pools
    }

    /// Creates tokens out of thin air; setup only
    pub fn mint(&mut self, token: Address, holder: Address, amount: U256) {
        *self.balances.entry((token, holder)).or_default() += amount;
    }

    pub fn fail_swaps_through(&mut self, token: Address) {
        self.failing_swaps.insert(token);
    }

    pub fn fail_quotes_through(&mut self, token: Address) {
        self.failing_quotes.insert(token);
    }

    pub fn clear_failures(&mut self) {
        self.failing_swaps.clear();
        self.failing_quotes.clear();
    }

    pub fn balance(&self, token: Address, holder: Address) -> U256 {
        self.balances
            .get(&(token, holder))
            .copied()
            .unwrap_or_default()
    }

    fn debit(&mut self, token: Address, holder: Address, amount: U256) -> FundResult<()> {
        let balance = self.balance(token, holder);
        if balance < amount {
            return Err(FundError::InsufficientBalance {
                token,
                holder,
                balance,
                required: amount,
            });
        }
        self.balances.insert((token, holder), balance - amount);
        Ok(())
    }

    fn credit(&mut self, token: Address, holder: Address, amount: U256) {
        *self.balances.entry((token, holder)).or_default() += amount;
    }

    fn check_swappable(&self, path: &SwapPath, call: &'static str) -> FundResult<()> {
        if let Some(token) = path.tokens().iter().find(|t| self.failing_swaps.contains(*t)) {
            return Err(FundError::call(call, format!("swap through {} reverted", token)));
        }
        Ok(())
    }

    fn check_quotable(&self, path: &SwapPath, call: &'static str) -> FundResult<()> {
        if let Some(token) = path.tokens().iter().find(|t| self.failing_quotes.contains(*t)) {
            return Err(FundError::call(call, format!("quote through {} reverted", token)));
        }
        Ok(())
    }
}

impl BalanceReader for SimulatedMarket {
    fn balance_of(&self, token: Address, holder: Address) -> FundResult<U256> {
        Ok(self.balance(token, holder))
    }

    fn decimals(&self, token: Address) -> FundResult<u8> {
        self.tokens
            .get(&token)
            .map(|t| t.decimals)
            .ok_or_else(|| FundError::call("decimals", format!("unknown token {}", token)))
    }
}

impl TokenLedger for SimulatedMarket {
    fn transfer(
        &mut self,
        token: Address,
        from: Address,
        to: Address,
        amount: U256,
    ) -> FundResult<()> {
        self.debit(token, from, amount)?;
        self.credit(token, to, amount);
        debug!("Transfer {} of {} {} -> {}", amount, self.symbol(token), from, to);
        Ok(())
    }
}

impl PriceOracle for SimulatedMarket {
    fn latest_price(&self, token: Address) -> FundResult<PriceData> {
        self.prices
            .get(&token)
            .copied()
            .ok_or(FundError::PriceFeedMissing(token))
    }
}

impl PoolRegistry for SimulatedMarket {
    fn pool_exists(&self, token_a: Address, token_b: Address, fee: u32) -> FundResult<Option<Address>> {
        Ok(self.pools.pool(token_a, token_b, fee).map(|p| p.address))
    }
}

impl PathPricer for SimulatedMarket {
    fn quote_exact_input(&self, path: &SwapPath, amount_in: U256) -> FundResult<U256> {
        self.check_quotable(path, "quoteExactInput")?;
        self.pools.quote_exact_input(path, amount_in)
    }

    fn quote_exact_output(&self, path: &SwapPath, amount_out: U256) -> FundResult<U256> {
        self.check_quotable(path, "quoteExactOutput")?;
        self.pools.quote_exact_output(path, amount_out)
    }
}

impl SwapExecutor for SimulatedMarket {
    fn exact_input(
        &mut self,
        trader: Address,
        path: &SwapPath,
        amount_in: U256,
        min_amount_out: U256,
    ) -> FundResult<U256> {
        self.check_swappable(path, "exactInput")?;
        let (token_in, token_out) = endpoints(path)?;

        let out = self.pools.quote_exact_input(path, amount_in)?;
        if out < min_amount_out {
            return Err(FundError::OverSlippage {
                actual: out,
                bound: min_amount_out,
            });
        }
        self.debit(token_in, trader, amount_in)?;
        self.pools.swap_exact_input(path, amount_in)?;
        self.credit(token_out, trader, out);
        Ok(out)
    }

    fn exact_output(
        &mut self,
        trader: Address,
        path: &SwapPath,
        amount_out: U256,
        max_amount_in: U256,
    ) -> FundResult<U256> {
        self.check_swappable(path, "exactOutput")?;
        // Output-to-input: first token is received, last is paid
        let (token_out, token_in) = endpoints(path)?;

        let required = self.pools.quote_exact_output(path, amount_out)?;
        if required > max_amount_in {
            return Err(FundError::OverSlippage {
                actual: required,
                bound: max_amount_in,
            });
        }
        self.debit(token_in, trader, required)?;
        self.pools.swap_exact_output(path, amount_out)?;
        self.credit(token_out, trader, amount_out);
        Ok(required)
    }
}

impl Checkpoint for SimulatedMarket {
    type Snapshot = SimulatedMarket;

    fn checkpoint(&self) -> Self::Snapshot {
        self.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        *self = snapshot;
    }
}

fn endpoints(path: &SwapPath) -> FundResult<(Address, Address)> {
    match (path.first(), path.last()) {
        (Some(first), Some(last)) if path.hop_count() > 0 => Ok((first, last)),
        _ => Err(FundError::InvalidSwapPath("no route".to_string())),
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_transfer_checks_balance() {
        let mut market = market();
        let alice = Address::repeat_byte(0xA1);
        market.mint(usdc(), alice, usd(10));

        market.transfer(usdc(), alice, FUND, usd(4)).unwrap();
        assert_eq!(market.balance_of(usdc(), alice).unwrap(), usd(6));
        assert_eq!(market.balance_of(usdc(), FUND).unwrap(), usd(4));

        let err = market.transfer(usdc(), alice, FUND, usd(7)).unwrap_err();
        assert!(matches!(err, FundError::InsufficientBalance { .. }));
    }

    #[test]
    fn test_missing_feed() {
        let mut market = market();
        market.remove_price(link());
        assert_eq!(
            market.latest_price(link()),
            Err(FundError::PriceFeedMissing(link()))
        );
    }

    #[test]
    fn test_swap_respects_bounds() {
        let mut market = market();
        let trader = Address::repeat_byte(0xA1);
        market.mint(weth(), trader, ether(1));

        let sell = SwapPath::direct(weth(), 3000, usdc());
        let quoted = market.quote_exact_input(&sell, ether(1)).unwrap();
        let err = market
            .exact_input(trader, &sell, ether(1), quoted + U256::from(1u8))
            .unwrap_err();
        assert!(matches!(err, FundError::OverSlippage { .. }));

        let out = market.exact_input(trader, &sell, ether(1), quoted).unwrap();
        assert_eq!(out, quoted);
        assert_eq!(market.balance_of(weth(), trader).unwrap(), U256::ZERO);
        assert_eq!(market.balance_of(usdc(), trader).unwrap(), quoted);

        // Buy 10 LINK back with the proceeds, output-to-input
        let buy = SwapPath::direct(link(), 3000, usdc());
        let paid = market.exact_output(trader, &buy, ether(10), out).unwrap();
        assert_eq!(market.balance_of(link(), trader).unwrap(), ether(10));
        assert_eq!(market.balance_of(usdc(), trader).unwrap(), out - paid);
    }

    #[test]
    fn test_failure_injection_and_restore() {
        let mut market = market();
        let trader = Address::repeat_byte(0xA1);
        market.mint(weth(), trader, ether(1));
        let snapshot = market.checkpoint();

        market.fail_swaps_through(usdc());
        let sell = SwapPath::direct(weth(), 3000, usdc());
        assert!(market.exact_input(trader, &sell, ether(1), U256::ZERO).is_err());
        assert!(market.quote_exact_input(&sell, ether(1)).is_ok());

        market.mint(weth(), trader, ether(5));
        market.restore(snapshot);
        assert_eq!(market.balance_of(weth(), trader).unwrap(), ether(1));
        assert!(market.exact_input(trader, &sell, ether(1), U256::ZERO).is_ok());
    }

    #[test]
    fn test_failure_through_bridge_token() {
        let mut market = market();
        let trader = Address::repeat_byte(0xA1);
        market.mint(usdc(), trader, usd(1_000));
        market.fail_quotes_through(weth());

        // WETH is only the middle hop
        let bridged = SwapPath::via(usdc(), 3000, weth(), 500, wbtc());
        let err = market.quote_exact_input(&bridged, usd(100)).unwrap_err();
        assert!(err.to_string().contains("quote through"));
        assert!(market.quote_exact_input(&SwapPath::direct(link(), 3000, usdc()), ether(1)).is_ok());

        market.clear_failures();
        market.fail_swaps_through(weth());
        assert!(market.quote_exact_input(&bridged, usd(100)).is_ok());
        let err = market.exact_input(trader, &bridged, usd(100), U256::ZERO).unwrap_err();
        assert!(err.to_string().contains("swap through"));
        assert_eq!(market.balance_of(usdc(), trader).unwrap(), usd(1_000));
    }
}
