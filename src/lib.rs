//! Basket - index-fund engine
//!
//! A basket of ERC-20 constituents backing fungible shares: proportional
//! invest/redeem, single-token entry and exit through Uniswap V3 routes,
//! deviation-band rebalancing against a numeraire, and a reward stream
//! accrued per share.
//!
//! - `fund`: state, allocator, rebalance engine and the atomic `Fund` handle
//! - `router`: V3 path encoding and best-route quoting
//! - `market`: in-memory market and scenario runner
//! - `chain`: read-only RPC market for live quotes and targets

pub mod chain;
pub mod config;
pub mod error;
pub mod fund;
pub mod interfaces;
pub mod market;
pub mod router;
pub mod units;

pub use config::FundConfig;
pub use error::{FundError, FundResult};
pub use fund::Fund;
