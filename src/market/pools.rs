//! Pool Graph - constant-product pools keyed by (token pair, fee tier)
//!
//! Tokens are nodes, pools are edges. Several fee tiers between the same pair
//! are parallel edges, so lookups go through `edges_connecting` rather than
//! `find_edge`.
//!
//! Swap math is Uniswap V2 style with the V3 fee unit (hundredths of a bip):
//!   out = in·γ·R_out / (R_in·1e6 + in·γ)        γ = 1e6 − fee
//!   in  = R_in·out·1e6 / ((R_out − out)·γ) + 1

use alloy_primitives::{keccak256, Address, U256};
use petgraph::graph::{EdgeIndex, NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::error::{FundError, FundResult};
use crate::router::SwapPath;
use crate::units::PPM;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pool {
    pub address: Address,
    /// token0 < token1, as a V3 factory orders them
    pub token0: Address,
    pub token1: Address,
    pub fee: u32,
    pub reserve0: U256,
    pub reserve1: U256,
}

impl Pool {
    pub fn new(token_a: Address, token_b: Address, fee: u32, reserve_a: U256, reserve_b: U256) -> Self {
        let (token0, token1, reserve0, reserve1) = if token_a < token_b {
            (token_a, token_b, reserve_a, reserve_b)
        } else {
            (token_b, token_a, reserve_b, reserve_a)
        };
        Self {
            address: pool_address(token0, token1, fee),
            token0,
            token1,
            fee,
            reserve0,
            reserve1,
        }
    }

    /// (reserve of `token_in`, reserve of the other side)
    fn reserves_for(&self, token_in: Address) -> FundResult<(U256, U256)> {
        if token_in == self.token0 {
            Ok((self.reserve0, self.reserve1))
        } else if token_in == self.token1 {
            Ok((self.reserve1, self.reserve0))
        } else {
            Err(FundError::call(
                "swap",
                format!("{} not in pool {}", token_in, self.address),
            ))
        }
    }

    fn gamma(&self) -> U256 {
        U256::from(PPM.saturating_sub(self.fee))
    }

    pub fn amount_out(&self, token_in: Address, amount_in: U256) -> FundResult<U256> {
        let (reserve_in, reserve_out) = self.reserves_for(token_in)?;
        if reserve_in.is_zero() || reserve_out.is_zero() {
            return Err(FundError::call("swap", "empty pool"));
        }
        let in_with_fee = amount_in
            .checked_mul(self.gamma())
            .ok_or(FundError::MathOverflow("pool amount in"))?;
        let numerator = in_with_fee
            .checked_mul(reserve_out)
            .ok_or(FundError::MathOverflow("pool numerator"))?;
        let denominator = reserve_in
            .checked_mul(U256::from(PPM))
            .and_then(|r| r.checked_add(in_with_fee))
            .ok_or(FundError::MathOverflow("pool denominator"))?;
        Ok(numerator / denominator)
    }

    pub fn amount_in(&self, token_in: Address, amount_out: U256) -> FundResult<U256> {
        let (reserve_in, reserve_out) = self.reserves_for(token_in)?;
        if amount_out >= reserve_out {
            return Err(FundError::call(
                "swap",
                format!("insufficient liquidity in {}", self.address),
            ));
        }
        let gamma = self.gamma();
        if gamma.is_zero() {
            return Err(FundError::call("swap", "fee consumes the whole input"));
        }
        let numerator = reserve_in
            .checked_mul(amount_out)
            .and_then(|n| n.checked_mul(U256::from(PPM)))
            .ok_or(FundError::MathOverflow("pool numerator"))?;
        let denominator = (reserve_out - amount_out)
            .checked_mul(gamma)
            .ok_or(FundError::MathOverflow("pool denominator"))?;
        Ok(numerator / denominator + U256::from(1u8))
    }

    fn apply(&mut self, token_in: Address, amount_in: U256, amount_out: U256) {
        if token_in == self.token0 {
            self.reserve0 += amount_in;
            self.reserve1 -= amount_out;
        } else {
            self.reserve1 += amount_in;
            self.reserve0 -= amount_out;
        }
    }
}

/// Deterministic stand-in for a factory's CREATE2 address
pub fn pool_address(token0: Address, token1: Address, fee: u32) -> Address {
    let mut preimage = Vec::with_capacity(20 + 20 + 3);
    preimage.extend_from_slice(token0.as_slice());
    preimage.extend_from_slice(token1.as_slice());
    preimage.extend_from_slice(&fee.to_be_bytes()[1..]);
    Address::from_slice(&keccak256(&preimage)[12..])
}

/// One executed hop: (pool edge, token in, amount in, amount out)
type HopFill = (EdgeIndex, Address, U256, U256);

#[derive(Debug, Clone, Default)]
pub struct PoolGraph {
    graph: UnGraph<Address, Pool>,
    token_to_node: HashMap<Address, NodeIndex>,
}

impl PoolGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pools(pools: Vec<Pool>) -> Self {
        let mut graph = Self::new();
        for pool in pools {
            graph.insert(pool);
        }
        info!(
            "Pool graph built: {} tokens, {} pools",
            graph.graph.node_count(),
            graph.graph.edge_count()
        );
        graph
    }

    /// Adds a pool, replacing an existing one for the same pair and tier
    pub fn insert(&mut self, pool: Pool) -> Address {
        let address = pool.address;
        if let Some(edge) = self.edge(pool.token0, pool.token1, pool.fee) {
            if let Some(existing) = self.graph.edge_weight_mut(edge) {
                *existing = pool;
            }
            return address;
        }
        let node0 = self.get_or_create_node(pool.token0);
        let node1 = self.get_or_create_node(pool.token1);
        self.graph.add_edge(node0, node1, pool);
        address
    }

    fn get_or_create_node(&mut self, token: Address) -> NodeIndex {
        if let Some(&node) = self.token_to_node.get(&token) {
            return node;
        }
        let node = self.graph.add_node(token);
        self.token_to_node.insert(token, node);
        node
    }

    fn edge(&self, a: Address, b: Address, fee: u32) -> Option<EdgeIndex> {
        let node_a = *self.token_to_node.get(&a)?;
        let node_b = *self.token_to_node.get(&b)?;
        self.graph
            .edges_connecting(node_a, node_b)
            .find(|e| e.weight().fee == fee)
            .map(|e| e.id())
    }

    pub fn pool(&self, a: Address, b: Address, fee: u32) -> Option<&Pool> {
        self.edge(a, b, fee)
            .and_then(|edge| self.graph.edge_weight(edge))
    }

    pub fn pool_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.graph.edge_weights()
    }

    fn hop_pool(&self, a: Address, b: Address, fee: u32) -> FundResult<(EdgeIndex, &Pool)> {
        self.edge(a, b, fee)
            .and_then(|edge| self.graph.edge_weight(edge).map(|pool| (edge, pool)))
            .ok_or_else(|| {
                FundError::call("swap", format!("no pool {} / {} fee {}", a, b, fee))
            })
    }

    /// Walks an input-to-output path forward
    fn fill_exact_input(&self, path: &SwapPath, amount_in: U256) -> FundResult<(U256, Vec<HopFill>)> {
        if path.is_empty() {
            return Err(FundError::InvalidSwapPath("no route".to_string()));
        }
        let mut amount = amount_in;
        let mut fills = Vec::with_capacity(path.hop_count());
        for (token_in, token_out, fee) in path.hops() {
            let (edge, pool) = self.hop_pool(token_in, token_out, fee)?;
            let out = pool.amount_out(token_in, amount)?;
            fills.push((edge, token_in, amount, out));
            amount = out;
        }
        Ok((amount, fills))
    }

    /// Walks an output-to-input path: each hop (x, y) needs y in to produce x
    fn fill_exact_output(&self, path: &SwapPath, amount_out: U256) -> FundResult<(U256, Vec<HopFill>)> {
        if path.is_empty() {
            return Err(FundError::InvalidSwapPath("no route".to_string()));
        }
        let mut amount = amount_out;
        let mut fills = Vec::with_capacity(path.hop_count());
        for (token_out, token_in, fee) in path.hops() {
            let (edge, pool) = self.hop_pool(token_out, token_in, fee)?;
            let required = pool.amount_in(token_in, amount)?;
            fills.push((edge, token_in, required, amount));
            amount = required;
        }
        Ok((amount, fills))
    }

    pub fn quote_exact_input(&self, path: &SwapPath, amount_in: U256) -> FundResult<U256> {
        self.fill_exact_input(path, amount_in).map(|(out, _)| out)
    }

    pub fn quote_exact_output(&self, path: &SwapPath, amount_out: U256) -> FundResult<U256> {
        self.fill_exact_output(path, amount_out).map(|(required, _)| required)
    }

    /// Moves reserves; returns the output amount
    pub fn swap_exact_input(&mut self, path: &SwapPath, amount_in: U256) -> FundResult<U256> {
        let (out, fills) = self.fill_exact_input(path, amount_in)?;
        self.apply(fills);
        Ok(out)
    }

    /// Moves reserves; returns the input amount
    pub fn swap_exact_output(&mut self, path: &SwapPath, amount_out: U256) -> FundResult<U256> {
        let (required, fills) = self.fill_exact_output(path, amount_out)?;
        self.apply(fills);
        Ok(required)
    }

    fn apply(&mut self, fills: Vec<HopFill>) {
        for (edge, token_in, amount_in, amount_out) in fills {
            if let Some(pool) = self.graph.edge_weight_mut(edge) {
                pool.apply(token_in, amount_in, amount_out);
                debug!(
                    "Pool {} fee {}: reserves {} / {}",
                    pool.address, pool.fee, pool.reserve0, pool.reserve1
                );
            }
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::pow10;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn units(n: u64, decimals: u8) -> U256 {
        U256::from(n) * pow10(decimals)
    }

    #[test]
    fn test_pool_orders_tokens_and_address_is_stable() {
        let p1 = Pool::new(addr(2), addr(1), 3000, U256::from(5u8), U256::from(7u8));
        let p2 = Pool::new(addr(1), addr(2), 3000, U256::from(7u8), U256::from(5u8));
        assert_eq!(p1, p2);
        assert_eq!(p1.token0, addr(1));
        assert_eq!(p1.reserve0, U256::from(7u8));
        assert_ne!(p1.address, pool_address(addr(1), addr(2), 500));
    }

    #[test]
    fn test_parallel_fee_tiers_are_distinct() {
        let graph = PoolGraph::from_pools(vec![
            Pool::new(addr(1), addr(2), 500, units(1, 18), units(1, 18)),
            Pool::new(addr(1), addr(2), 3000, units(2, 18), units(2, 18)),
        ]);
        assert_eq!(graph.pool_count(), 2);
        assert_eq!(graph.pool(addr(2), addr(1), 3000).unwrap().reserve0, units(2, 18));
        assert!(graph.pool(addr(1), addr(2), 10000).is_none());
        assert!(graph.pool(addr(1), addr(9), 500).is_none());
    }

    #[test]
    fn test_constant_product_math() {
        // 1000/1000 pool at 0.3%: 10 in -> 9.87.. out
        let pool = Pool::new(addr(1), addr(2), 3000, U256::from(1000u64), U256::from(1000u64));
        let out = pool.amount_out(addr(1), U256::from(10u64)).unwrap();
        assert_eq!(out, U256::from(9u64));

        let required = pool.amount_in(addr(1), out).unwrap();
        assert!(required <= U256::from(10u64));
        assert!(pool.amount_out(addr(1), required).unwrap() >= out);

        assert!(pool.amount_in(addr(1), U256::from(1000u64)).is_err());
        assert!(pool.amount_out(addr(3), U256::from(1u8)).is_err());
    }

    #[test]
    fn test_two_hop_swap_moves_both_pools() {
        let (a, bridge, b) = (addr(1), addr(5), addr(2));
        let mut graph = PoolGraph::from_pools(vec![
            Pool::new(a, bridge, 3000, units(1_000, 18), units(2_000, 18)),
            Pool::new(bridge, b, 500, units(2_000, 18), units(4_000, 18)),
        ]);
        let path = SwapPath::via(a, 3000, bridge, 500, b);
        let amount_in = units(1, 18);

        let quoted = graph.quote_exact_input(&path, amount_in).unwrap();
        let out = graph.swap_exact_input(&path, amount_in).unwrap();
        assert_eq!(quoted, out);
        // ~4 b per a before fees and impact
        assert!(out > units(3, 18) && out < units(4, 18));

        let first = graph.pool(a, bridge, 3000).unwrap();
        let a_reserve = if first.token0 == a { first.reserve0 } else { first.reserve1 };
        assert_eq!(a_reserve, units(1_001, 18));
    }

    #[test]
    fn test_exact_output_path_is_walked_from_output() {
        let (a, b) = (addr(1), addr(2));
        let mut graph =
            PoolGraph::from_pools(vec![Pool::new(a, b, 3000, units(1_000, 18), units(1_000, 18))]);

        // Buy 5 b with a: output-to-input encoding
        let path = SwapPath::direct(b, 3000, a);
        let want = units(5, 18);
        let required = graph.quote_exact_output(&path, want).unwrap();
        assert!(required > want);

        let paid = graph.swap_exact_output(&path, want).unwrap();
        assert_eq!(paid, required);
        let pool = graph.pool(a, b, 3000).unwrap();
        assert_eq!(pool.reserve1, units(995, 18));
    }
}
