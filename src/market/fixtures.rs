//! Shared test market: USDC numeraire, WETH, LINK, WBTC and a reward token.
//! Oracle prices match the pool mid prices.

use alloy_primitives::{Address, U256};

use super::SimulatedMarket;
use crate::router::{PathQuoter, DEFAULT_FEE_TIERS};
use crate::units::pow10;

/// Same address as the `FundParams` test fixture
pub const FUND: Address = Address::new([0xF0; 20]);

pub fn usdc() -> Address {
    Address::repeat_byte(0xCC)
}

pub fn weth() -> Address {
    Address::repeat_byte(0xE1)
}

pub fn link() -> Address {
    Address::repeat_byte(0x11)
}

pub fn wbtc() -> Address {
    Address::repeat_byte(0xB1)
}

pub fn reward() -> Address {
    Address::repeat_byte(0xAA)
}

/// Whole USDC in 6-decimal units
pub fn usd(n: u64) -> U256 {
    U256::from(n) * pow10(6)
}

/// Whole tokens in 18-decimal units
pub fn ether(n: u64) -> U256 {
    U256::from(n) * pow10(18)
}

/// Oracle price of `n` dollars
pub fn dollars(n: u64) -> U256 {
    U256::from(n) * pow10(18)
}

pub fn market() -> SimulatedMarket {
    let mut market = SimulatedMarket::new();
    market.add_token(usdc(), "USDC", 6);
    market.add_token(weth(), "WETH", 18);
    market.add_token(link(), "LINK", 18);
    market.add_token(wbtc(), "WBTC", 8);
    market.add_token(reward(), "RWD", 18);

    market.set_price(usdc(), dollars(1), 0);
    market.set_price(weth(), dollars(2_000), 0);
    market.set_price(link(), dollars(10), 0);
    market.set_price(wbtc(), dollars(40_000), 0);

    market.add_pool(weth(), usdc(), 3000, ether(10_000), usd(20_000_000));
    market.add_pool(link(), usdc(), 3000, ether(1_000_000), usd(10_000_000));
    market.add_pool(wbtc(), weth(), 500, U256::from(1_000u64) * pow10(8), ether(20_000));
    market
}

pub fn quoter() -> PathQuoter {
    PathQuoter::new(DEFAULT_FEE_TIERS.to_vec(), vec![weth(), usdc()])
}
