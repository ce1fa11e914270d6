//! Path Quoter - best route between two tokens
//!
//! Probes the pool factory for every fee tier, directly and through each
//! bridge token, then asks the pricer for an amount on every surviving path.
//!
//! A candidate whose quote reverts is dropped, never fatal. Only when no
//! candidate survives does the caller get the empty "no route" quote.

use alloy_primitives::{Address, U256};
use serde::Serialize;
use tracing::{debug, warn};

use super::SwapPath;
use crate::error::{FundError, FundResult};
use crate::interfaces::{PathPricer, PoolRegistry, RouteSource};

/// Uniswap V3 fee tiers probed by default (0.05%, 0.3%, 1%)
pub const DEFAULT_FEE_TIERS: [u32; 3] = [500, 3000, 10000];

/// Quote result: for exact-out `amount` is the minimal input, for exact-in the
/// maximal output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub path: SwapPath,
    pub amount: U256,
}

impl Quote {
    pub fn no_route() -> Self {
        Self::default()
    }

    /// Zero amount with an empty path is "no viable route", not a free trade
    pub fn has_route(&self) -> bool {
        !self.path.is_empty()
    }

    /// Path and amount of a quote that must be traded: no route aborts, and
    /// the path must run from `first` to `last` as encoded
    pub fn into_route(self, first: Address, last: Address) -> FundResult<(SwapPath, U256)> {
        if !self.has_route() {
            warn!("No route between {} and {}", first, last);
            return Err(FundError::InvalidSwapPath(format!(
                "no route between {} and {}",
                first, last
            )));
        }
        self.path.validate(first, last)?;
        Ok((self.path, self.amount))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuoter {
    fee_tiers: Vec<u32>,
    bridge_tokens: Vec<Address>,
}

impl PathQuoter {
    pub fn new(fee_tiers: Vec<u32>, bridge_tokens: Vec<Address>) -> Self {
        Self {
            fee_tiers,
            bridge_tokens,
        }
    }

    pub fn fee_tiers(&self) -> &[u32] {
        &self.fee_tiers
    }

    pub fn bridge_tokens(&self) -> &[Address] {
        &self.bridge_tokens
    }

    /// |fees| + |fees|² × |bridges|
    pub fn max_path_count(&self) -> usize {
        let fees = self.fee_tiers.len();
        fees + fees * fees * self.bridge_tokens.len()
    }

    /// Every direct and single-bridge route whose pools all exist.
    /// Unordered; may be empty.
    pub fn get_all_paths<R: PoolRegistry + ?Sized>(
        &self,
        registry: &R,
        token_a: Address,
        token_b: Address,
    ) -> Vec<SwapPath> {
        let mut paths = Vec::new();
        if token_a == token_b {
            return paths;
        }

        for &fee in &self.fee_tiers {
            if pool_exists(registry, token_a, token_b, fee) {
                paths.push(SwapPath::direct(token_a, fee, token_b));
            }
        }

        for &bridge in &self.bridge_tokens {
            if bridge == token_a || bridge == token_b {
                continue;
            }
            for &fee_in in &self.fee_tiers {
                if !pool_exists(registry, token_a, bridge, fee_in) {
                    continue;
                }
                for &fee_out in &self.fee_tiers {
                    if pool_exists(registry, bridge, token_b, fee_out) {
                        paths.push(SwapPath::via(token_a, fee_in, bridge, fee_out, token_b));
                    }
                }
            }
        }

        debug!(
            "Found {} paths {} -> {} (max {})",
            paths.len(),
            token_a,
            token_b,
            self.max_path_count()
        );
        paths
    }

    /// Cheapest input for a fixed output. The returned path is encoded
    /// output-to-input, as the router's exact-output call expects.
    pub fn quote_exact_out<R: RouteSource + ?Sized>(
        &self,
        source: &R,
        token_in: Address,
        token_out: Address,
        amount_out: U256,
    ) -> Quote {
        let mut best = Quote::no_route();

        for path in self.get_all_paths(source, token_out, token_in) {
            match source.quote_exact_output(&path, amount_out) {
                Ok(amount_in) => {
                    if !best.has_route() || amount_in < best.amount {
                        best = Quote {
                            path,
                            amount: amount_in,
                        };
                    }
                }
                Err(e) => debug!("Exact-out quote failed on {}: {}", path, e),
            }
        }

        best
    }

    /// Largest output for a fixed input; ties keep the first path found
    pub fn quote_exact_in<R: RouteSource + ?Sized>(
        &self,
        source: &R,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> Quote {
        let mut best = Quote::no_route();

        for path in self.get_all_paths(source, token_in, token_out) {
            match source.quote_exact_input(&path, amount_in) {
                Ok(amount_out) => {
                    if !best.has_route() || amount_out > best.amount {
                        best = Quote {
                            path,
                            amount: amount_out,
                        };
                    }
                }
                Err(e) => debug!("Exact-in quote failed on {}: {}", path, e),
            }
        }

        best
    }
}

impl Default for PathQuoter {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_TIERS.to_vec(), Vec::new())
    }
}

fn pool_exists<R: PoolRegistry + ?Sized>(registry: &R, a: Address, b: Address, fee: u32) -> bool {
    match registry.pool_exists(a, b, fee) {
        Ok(pool) => pool.is_some(),
        Err(e) => {
            debug!("Pool probe {} / {} fee {} failed: {}", a, b, fee, e);
            false
        }
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FundError, FundResult};
    use std::collections::{HashMap, HashSet};

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    /// Registry + pricer with canned answers per encoded path
    #[derive(Default)]
    struct CannedRoutes {
        pools: HashSet<(Address, Address, u32)>,
        exact_in: HashMap<SwapPath, U256>,
        exact_out: HashMap<SwapPath, U256>,
        broken_registry: bool,
    }

    impl CannedRoutes {
        fn pool(mut self, a: Address, b: Address, fee: u32) -> Self {
            self.pools.insert((a, b, fee));
            self.pools.insert((b, a, fee));
            self
        }
    }

    impl PoolRegistry for CannedRoutes {
        fn pool_exists(&self, a: Address, b: Address, fee: u32) -> FundResult<Option<Address>> {
            if self.broken_registry {
                return Err(FundError::call("getPool", "rpc down"));
            }
            Ok(self.pools.contains(&(a, b, fee)).then(|| addr(0xEE)))
        }
    }

    impl PathPricer for CannedRoutes {
        fn quote_exact_input(&self, path: &SwapPath, _: U256) -> FundResult<U256> {
            self.exact_in
                .get(path)
                .copied()
                .ok_or_else(|| FundError::call("quoteExactInput", "revert"))
        }

        fn quote_exact_output(&self, path: &SwapPath, _: U256) -> FundResult<U256> {
            self.exact_out
                .get(path)
                .copied()
                .ok_or_else(|| FundError::call("quoteExactOutput", "revert"))
        }
    }

    #[test]
    fn test_same_token_has_no_paths() {
        let routes = CannedRoutes::default().pool(addr(1), addr(1), 500);
        let quoter = PathQuoter::new(vec![500, 3000], vec![addr(9)]);
        assert!(quoter.get_all_paths(&routes, addr(1), addr(1)).is_empty());
    }

    #[test]
    fn test_only_existing_pools_are_returned() {
        let (a, b, bridge) = (addr(1), addr(2), addr(9));
        let routes = CannedRoutes::default()
            .pool(a, b, 3000)
            .pool(a, bridge, 500)
            .pool(bridge, b, 500)
            .pool(bridge, b, 10000)
            // Dangling: bridge has no pool towards b at this tier from a
            .pool(a, addr(8), 500);

        let quoter = PathQuoter::new(DEFAULT_FEE_TIERS.to_vec(), vec![bridge, addr(8)]);
        let paths = quoter.get_all_paths(&routes, a, b);

        assert_eq!(paths.len(), 3);
        assert!(paths.contains(&SwapPath::direct(a, 3000, b)));
        assert!(paths.contains(&SwapPath::via(a, 500, bridge, 500, b)));
        assert!(paths.contains(&SwapPath::via(a, 500, bridge, 10000, b)));

        for path in &paths {
            for (x, y, fee) in path.hops() {
                assert!(routes.pools.contains(&(x, y, fee)));
            }
        }
        assert!(paths.len() <= quoter.max_path_count());
    }

    #[test]
    fn test_bridge_equal_to_endpoint_is_skipped() {
        let (a, b) = (addr(1), addr(2));
        let routes = CannedRoutes::default().pool(a, b, 500);
        let quoter = PathQuoter::new(vec![500], vec![a, b]);
        assert_eq!(
            quoter.get_all_paths(&routes, a, b),
            vec![SwapPath::direct(a, 500, b)]
        );
    }

    #[test]
    fn test_registry_failure_means_no_pool() {
        let routes = CannedRoutes {
            broken_registry: true,
            ..CannedRoutes::default().pool(addr(1), addr(2), 500)
        };
        let quoter = PathQuoter::default();
        assert!(quoter.get_all_paths(&routes, addr(1), addr(2)).is_empty());
    }

    #[test]
    fn test_exact_in_keeps_largest_and_first_on_tie() {
        let (a, b, bridge) = (addr(1), addr(2), addr(9));
        let mut routes = CannedRoutes::default()
            .pool(a, b, 500)
            .pool(a, b, 3000)
            .pool(a, bridge, 500)
            .pool(bridge, b, 500);

        let direct_low = SwapPath::direct(a, 500, b);
        let direct_mid = SwapPath::direct(a, 3000, b);
        let bridged = SwapPath::via(a, 500, bridge, 500, b);
        routes.exact_in.insert(direct_low.clone(), U256::from(90u64));
        routes.exact_in.insert(direct_mid.clone(), U256::from(100u64));
        routes.exact_in.insert(bridged, U256::from(100u64));

        let quoter = PathQuoter::new(vec![500, 3000], vec![bridge]);
        let quote = quoter.quote_exact_in(&routes, a, b, U256::from(1u64));

        // Direct 3000 is enumerated before the bridged route
        assert_eq!(quote.path, direct_mid);
        assert_eq!(quote.amount, U256::from(100u64));
    }

    #[test]
    fn test_exact_out_keeps_smallest_and_skips_failures() {
        let (token_in, token_out) = (addr(1), addr(2));
        let mut routes = CannedRoutes::default()
            .pool(token_in, token_out, 500)
            .pool(token_in, token_out, 3000)
            .pool(token_in, token_out, 10000);

        // Output-to-input encoding; 500 tier reverts
        routes
            .exact_out
            .insert(SwapPath::direct(token_out, 3000, token_in), U256::from(70u64));
        routes
            .exact_out
            .insert(SwapPath::direct(token_out, 10000, token_in), U256::from(65u64));

        let quoter = PathQuoter::default();
        let quote = quoter.quote_exact_out(&routes, token_in, token_out, U256::from(50u64));

        assert_eq!(quote.path, SwapPath::direct(token_out, 10000, token_in));
        assert_eq!(quote.amount, U256::from(65u64));
        assert!(quote.path.validate(token_out, token_in).is_ok());
    }

    #[test]
    fn test_total_failure_is_empty_quote() {
        let routes = CannedRoutes::default().pool(addr(1), addr(2), 3000);
        let quoter = PathQuoter::default();

        let quote = quoter.quote_exact_in(&routes, addr(1), addr(2), U256::from(5u64));
        assert!(!quote.has_route());
        assert_eq!(quote.amount, U256::ZERO);

        let quote = quoter.quote_exact_out(&routes, addr(1), addr(2), U256::from(5u64));
        assert_eq!(quote, Quote::no_route());
    }

    #[test]
    fn test_into_route_rejects_missing_or_reversed_paths() {
        let (a, b) = (addr(1), addr(2));

        let err = Quote::no_route().into_route(a, b).unwrap_err();
        assert!(matches!(err, FundError::InvalidSwapPath(_)));

        let quote = Quote {
            path: SwapPath::direct(a, 3000, b),
            amount: U256::from(42u64),
        };
        let err = quote.clone().into_route(b, a).unwrap_err();
        assert!(matches!(err, FundError::InvalidSwapPath(_)));

        let (path, amount) = quote.into_route(a, b).unwrap();
        assert_eq!(path, SwapPath::direct(a, 3000, b));
        assert_eq!(amount, U256::from(42u64));
    }
}
