//! Chain Adapter - read-only RPC market
//!
//! Answers the read side of the collaborator traits from a live node via
//! eth_call: ERC-20 balances and decimals, Chainlink-style USD feeds, the
//! Uniswap V3 factory and QuoterV2 path quotes. Enough for `quote`, `paths`
//! and `targets` against mainnet; swaps and transfers stay with the
//! simulated market.
//!
//! Caches:
//! - Token and feed decimals never change - cached forever
//! - Pools that exist are cached; misses are re-probed since pools can be created

use alloy_primitives::{aliases::U24, Address, I256, U256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::TransactionRequest;
use alloy_sol_types::{sol, SolCall};
use eyre::{eyre, Result};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::runtime::Handle;
use tracing::debug;

use crate::error::{FundError, FundResult};
use crate::interfaces::{BalanceReader, PathPricer, PoolRegistry, PriceData, PriceOracle};
use crate::router::SwapPath;
use crate::units::{pow10, VALUE_DECIMALS};

lazy_static! {
    /// ERC-20 decimals (immutable per token)
    static ref TOKEN_DECIMALS: RwLock<HashMap<Address, u8>> = RwLock::new(HashMap::new());

    /// Aggregator decimals (immutable per feed)
    static ref FEED_DECIMALS: RwLock<HashMap<Address, u8>> = RwLock::new(HashMap::new());

    /// (token0, token1, fee) -> pool, hits only
    static ref POOL_CACHE: RwLock<HashMap<(Address, Address, u32), Address>> =
        RwLock::new(HashMap::new());
}

// ============================================
// SOLIDITY INTERFACES
// ============================================

sol! {
    #[derive(Debug)]
    interface IERC20 {
        function balanceOf(address account) external view returns (uint256);
        function decimals() external view returns (uint8);
    }

    /// Uniswap V3 factory
    #[derive(Debug)]
    interface IUniswapV3Factory {
        function getPool(address tokenA, address tokenB, uint24 fee) external view returns (address pool);
    }

    /// Uniswap V3 QuoterV2, multi-hop variants
    #[derive(Debug)]
    interface IQuoterV2 {
        function quoteExactInput(bytes memory path, uint256 amountIn)
            external
            returns (
                uint256 amountOut,
                uint160[] memory sqrtPriceX96AfterList,
                uint32[] memory initializedTicksCrossedList,
                uint256 gasEstimate
            );

        function quoteExactOutput(bytes memory path, uint256 amountOut)
            external
            returns (
                uint256 amountIn,
                uint160[] memory sqrtPriceX96AfterList,
                uint32[] memory initializedTicksCrossedList,
                uint256 gasEstimate
            );
    }

    /// Chainlink aggregator
    #[derive(Debug)]
    interface AggregatorV3Interface {
        function decimals() external view returns (uint8);
        function latestRoundData() external view returns (
            uint80 roundId,
            int256 answer,
            uint256 startedAt,
            uint256 updatedAt,
            uint80 answeredInRound
        );
    }
}

pub struct RpcMarket {
    rpc_url: String,
    factory: Address,
    quoter: Address,
    /// token -> aggregator
    price_feeds: HashMap<Address, Address>,
    runtime: Handle,
}

impl RpcMarket {
    /// Must be created inside a multi-threaded tokio runtime; trait calls
    /// block the current worker while the RPC completes.
    pub fn new(
        rpc_url: String,
        factory: Address,
        quoter: Address,
        price_feeds: HashMap<Address, Address>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| eyre!("RpcMarket needs a tokio runtime: {}", e))?;
        Ok(Self {
            rpc_url,
            factory,
            quoter,
            price_feeds,
            runtime,
        })
    }

    async fn call_contract(
        &self,
        call: &'static str,
        to: Address,
        calldata: Vec<u8>,
    ) -> FundResult<Vec<u8>> {
        let provider = ProviderBuilder::new().connect_http(
            self.rpc_url
                .parse()
                .map_err(|e| FundError::call(call, format!("bad RPC url: {}", e)))?,
        );

        let tx = TransactionRequest::default().to(to).input(calldata.into());

        let result = provider
            .call(tx)
            .await
            .map_err(|e| FundError::call(call, format!("eth_call failed: {}", e)))?;

        Ok(result.to_vec())
    }

    /// Fails when the endpoint serves a different chain than configured
    pub fn check_chain_id(&self, expected: u64) -> FundResult<()> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| FundError::call("eth_chainId", format!("bad RPC url: {}", e)))?;
        let provider = ProviderBuilder::new().connect_http(url);
        let actual = tokio::task::block_in_place(|| self.runtime.block_on(provider.get_chain_id()))
            .map_err(|e| FundError::call("eth_chainId", e.to_string()))?;
        ensure_chain(expected, actual)
    }

    fn call_blocking(&self, call: &'static str, to: Address, calldata: Vec<u8>) -> FundResult<Vec<u8>> {
        tokio::task::block_in_place(|| {
            self.runtime
                .block_on(self.call_contract(call, to, calldata))
        })
    }

    fn feed_decimals(&self, feed: Address) -> FundResult<u8> {
        if let Ok(cache) = FEED_DECIMALS.read() {
            if let Some(&decimals) = cache.get(&feed) {
                return Ok(decimals);
            }
        }

        let output = self.call_blocking(
            "decimals",
            feed,
            AggregatorV3Interface::decimalsCall {}.abi_encode(),
        )?;
        let decimals = AggregatorV3Interface::decimalsCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("decimals", e.to_string()))?;

        if let Ok(mut cache) = FEED_DECIMALS.write() {
            cache.insert(feed, decimals);
        }
        Ok(decimals)
    }
}

/// Rescale a positive aggregator answer to value units
fn scale_answer(answer: I256, feed_decimals: u8) -> FundResult<U256> {
    if !answer.is_positive() {
        return Err(FundError::call(
            "latestRoundData",
            format!("non-positive answer {}", answer),
        ));
    }
    let raw = answer.into_raw();
    if feed_decimals <= VALUE_DECIMALS {
        raw.checked_mul(pow10(VALUE_DECIMALS - feed_decimals))
            .ok_or(FundError::MathOverflow("oracle price"))
    } else {
        Ok(raw / pow10(feed_decimals - VALUE_DECIMALS))
    }
}

fn fee_param(fee: u32) -> FundResult<U24> {
    U24::try_from(fee).map_err(|_| FundError::InvalidSwapPath(format!("fee {} exceeds uint24", fee)))
}

impl BalanceReader for RpcMarket {
    fn balance_of(&self, token: Address, holder: Address) -> FundResult<U256> {
        let output = self.call_blocking(
            "balanceOf",
            token,
            IERC20::balanceOfCall { account: holder }.abi_encode(),
        )?;
        IERC20::balanceOfCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("balanceOf", e.to_string()))
    }

    fn decimals(&self, token: Address) -> FundResult<u8> {
        if let Ok(cache) = TOKEN_DECIMALS.read() {
            if let Some(&decimals) = cache.get(&token) {
                return Ok(decimals);
            }
        }

        let output = self.call_blocking("decimals", token, IERC20::decimalsCall {}.abi_encode())?;
        let decimals = IERC20::decimalsCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("decimals", e.to_string()))?;

        if let Ok(mut cache) = TOKEN_DECIMALS.write() {
            cache.insert(token, decimals);
        }
        Ok(decimals)
    }
}

impl PriceOracle for RpcMarket {
    fn latest_price(&self, token: Address) -> FundResult<PriceData> {
        let feed = *self
            .price_feeds
            .get(&token)
            .ok_or(FundError::PriceFeedMissing(token))?;

        let decimals = self.feed_decimals(feed)?;
        let output = self.call_blocking(
            "latestRoundData",
            feed,
            AggregatorV3Interface::latestRoundDataCall {}.abi_encode(),
        )?;
        let round = AggregatorV3Interface::latestRoundDataCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("latestRoundData", e.to_string()))?;

        Ok(PriceData {
            price: scale_answer(round.answer, decimals)?,
            updated_at: round.updatedAt.saturating_to::<u64>(),
        })
    }
}

impl PoolRegistry for RpcMarket {
    fn pool_exists(&self, token_a: Address, token_b: Address, fee: u32) -> FundResult<Option<Address>> {
        let key = if token_a < token_b {
            (token_a, token_b, fee)
        } else {
            (token_b, token_a, fee)
        };
        if let Ok(cache) = POOL_CACHE.read() {
            if let Some(&pool) = cache.get(&key) {
                return Ok(Some(pool));
            }
        }

        let calldata = IUniswapV3Factory::getPoolCall {
            tokenA: key.0,
            tokenB: key.1,
            fee: fee_param(fee)?,
        }
        .abi_encode();
        let output = self.call_blocking("getPool", self.factory, calldata)?;
        let pool = IUniswapV3Factory::getPoolCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("getPool", e.to_string()))?;

        if pool.is_zero() {
            return Ok(None);
        }
        debug!("Pool {} / {} @ {} -> {}", key.0, key.1, fee, pool);
        if let Ok(mut cache) = POOL_CACHE.write() {
            cache.insert(key, pool);
        }
        Ok(Some(pool))
    }
}

impl PathPricer for RpcMarket {
    fn quote_exact_input(&self, path: &SwapPath, amount_in: U256) -> FundResult<U256> {
        let calldata = IQuoterV2::quoteExactInputCall {
            path: path.encode(),
            amountIn: amount_in,
        }
        .abi_encode();
        let output = self.call_blocking("quoteExactInput", self.quoter, calldata)?;
        let decoded = IQuoterV2::quoteExactInputCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("quoteExactInput", e.to_string()))?;
        Ok(decoded.amountOut)
    }

    fn quote_exact_output(&self, path: &SwapPath, amount_out: U256) -> FundResult<U256> {
        let calldata = IQuoterV2::quoteExactOutputCall {
            path: path.encode(),
            amountOut: amount_out,
        }
        .abi_encode();
        let output = self.call_blocking("quoteExactOutput", self.quoter, calldata)?;
        let decoded = IQuoterV2::quoteExactOutputCall::abi_decode_returns(&output)
            .map_err(|e| FundError::call("quoteExactOutput", e.to_string()))?;
        Ok(decoded.amountIn)
    }
}

// ============================================
// TESTS
// ============================================

fn ensure_chain(expected: u64, actual: u64) -> FundResult<()> {
    if expected != actual {
        return Err(FundError::call(
            "eth_chainId",
            format!("endpoint serves chain {}, configured for {}", actual, expected),
        ));
    }
    debug!("Connected to chain {}", actual);
    Ok(())
}
