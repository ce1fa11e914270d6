//! Invest / Redeem Orchestrator
//!
//! `Fund` is the handle every state-changing call goes through. Each call is
//! one atomic unit: the fund state and the market are snapshotted first and
//! both are restored if the call fails anywhere.

use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use super::allocator::{self, BasketAmounts};
use super::rebalance::{self, PlanLeg, RebalanceReport, TokenTarget};
use super::FundState;
use crate::error::{FundError, FundResult};
use crate::interfaces::Market;
use crate::router::{Quote, SwapPath};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvestReceipt {
    /// Shares credited to the investor, after the fee
    pub shares: U256,
    pub fee_shares: U256,
    /// Constituent amounts that entered the fund
    pub deposits: BasketAmounts,
    /// Source token consumed by a single-asset invest
    pub source_spent: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemReceipt {
    pub burned: U256,
    pub fee_shares: U256,
    /// Constituent amounts that left the fund
    pub withdrawals: BasketAmounts,
    /// Destination token paid by a single-asset redeem
    pub received: U256,
}

pub struct Fund<M: Market> {
    state: FundState,
    market: M,
    rebalance_log: Option<PathBuf>,
}

impl<M: Market> Fund<M> {
    pub fn new(state: FundState, market: M) -> Self {
        Self {
            state,
            market,
            rebalance_log: None,
        }
    }

    /// Append every successful rebalance report to `path` as JSON lines
    pub fn with_rebalance_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.rebalance_log = Some(path.into());
        self
    }

    pub fn state(&self) -> &FundState {
        &self.state
    }

    pub fn market(&self) -> &M {
        &self.market
    }

    /// Direct market access, for setup outside any fund operation
    pub fn market_mut(&mut self) -> &mut M {
        &mut self.market
    }

    pub fn into_parts(self) -> (FundState, M) {
        (self.state, self.market)
    }

    fn atomically<T>(
        &mut self,
        operation: &'static str,
        f: impl FnOnce(&mut FundState, &mut M) -> FundResult<T>,
    ) -> FundResult<T> {
        let state = self.state.clone();
        let market = self.market.checkpoint();

        match f(&mut self.state, &mut self.market) {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("{} reverted: {}", operation, e);
                self.state = state;
                self.market.restore(market);
                Err(e)
            }
        }
    }

    // ========== Invest ==========

    pub fn invest_with_basket(
        &mut self,
        investor: Address,
        mint_amount: U256,
        max_amounts: &[U256],
        now: u64,
    ) -> FundResult<InvestReceipt> {
        self.atomically("invest_with_basket", |state, market| {
            check_mint(state, mint_amount)?;
            check_len(state, max_amounts.len())?;

            let deposits = allocator::invest_amounts(state, &*market, mint_amount)?;
            for ((_, amount), bound) in deposits.iter().zip(max_amounts) {
                if amount > bound {
                    return Err(FundError::OverSlippage {
                        actual: *amount,
                        bound: *bound,
                    });
                }
            }
            for &(token, amount) in &deposits {
                market.transfer(token, investor, state.address(), amount)?;
            }

            let (shares, fee_shares) = mint_with_fee(state, investor, mint_amount, now)?;
            info!("Invested {} shares for {} (fee {})", shares, investor, fee_shares);
            Ok(InvestReceipt {
                shares,
                fee_shares,
                deposits,
                source_spent: U256::ZERO,
            })
        })
    }

    /// Pays for the basket in `source`. `paths` is either empty (every leg is
    /// quoted) or one exact-output path per constituent, `constituent ->
    /// source`; an empty entry is quoted too. Up to `max_source_in` is pulled
    /// from the investor and whatever the legs leave is refunded.
    pub fn invest_with_token(
        &mut self,
        investor: Address,
        source: Address,
        mint_amount: U256,
        max_source_in: U256,
        paths: &[SwapPath],
        now: u64,
    ) -> FundResult<InvestReceipt> {
        self.atomically("invest_with_token", |state, market| {
            check_mint(state, mint_amount)?;
            check_paths_len(state, paths)?;

            let deposits = allocator::invest_amounts(state, &*market, mint_amount)?;
            let mut legs = Vec::with_capacity(deposits.len());
            let mut total = U256::ZERO;

            for (i, &(token, amount)) in deposits.iter().enumerate() {
                let leg = if token == source || amount.is_zero() {
                    (None, amount)
                } else {
                    let (path, required) = match paths.get(i).filter(|p| !p.is_empty()) {
                        Some(path) => {
                            path.validate(token, source)?;
                            (path.clone(), market.quote_exact_output(path, amount)?)
                        }
                        None => state
                            .quoter()
                            .quote_exact_out(&*market, source, token, amount)
                            .into_route(token, source)?,
                    };
                    (Some(path), required)
                };
                total = total
                    .checked_add(leg.1)
                    .ok_or(FundError::MathOverflow("source total"))?;
                legs.push(leg);
            }

            if total > max_source_in {
                return Err(FundError::OverSlippage {
                    actual: total,
                    bound: max_source_in,
                });
            }

            // Quotes are taken before any leg moves a pool, so later legs may
            // cost more than quoted: pull the whole allowance the investor
            // holds and cap each leg by what is left of it.
            let fund = state.address();
            let held = market.balance_of(source, investor)?;
            if held < total {
                return Err(FundError::InsufficientBalance {
                    token: source,
                    holder: investor,
                    balance: held,
                    required: total,
                });
            }
            let pulled = max_source_in.min(held);
            market.transfer(source, investor, fund, pulled)?;

            let mut spent = U256::ZERO;
            for ((path, amount), &(_, wanted)) in legs.iter().zip(&deposits) {
                let left = pulled.checked_sub(spent).ok_or(FundError::OverSlippage {
                    actual: spent,
                    bound: max_source_in,
                })?;
                match path {
                    Some(path) => spent += market.exact_output(fund, path, wanted, left)?,
                    None if *amount > left => {
                        return Err(FundError::OverSlippage {
                            actual: spent + *amount,
                            bound: max_source_in,
                        })
                    }
                    None => spent += *amount,
                }
            }
            let refund = pulled - spent;
            if !refund.is_zero() {
                market.transfer(source, fund, investor, refund)?;
            }

            let (shares, fee_shares) = mint_with_fee(state, investor, mint_amount, now)?;
            info!(
                "Invested {} shares for {} paying {} of {}",
                shares, investor, spent, source
            );
            Ok(InvestReceipt {
                shares,
                fee_shares,
                deposits,
                source_spent: spent,
            })
        })
    }

    // ========== Redeem ==========

    pub fn redeem_to_basket(
        &mut self,
        holder: Address,
        burn_amount: U256,
        min_amounts: &[U256],
        now: u64,
    ) -> FundResult<RedeemReceipt> {
        self.atomically("redeem_to_basket", |state, market| {
            check_len(state, min_amounts.len())?;
            let withdrawals = prepare_redeem(state, &*market, holder, burn_amount)?;
            for ((_, amount), bound) in withdrawals.iter().zip(min_amounts) {
                if amount < bound {
                    return Err(FundError::OverSlippage {
                        actual: *amount,
                        bound: *bound,
                    });
                }
            }

            let (burned, fee_shares) = burn_with_fee(state, holder, burn_amount, now)?;
            for &(token, amount) in &withdrawals {
                if !amount.is_zero() {
                    market.transfer(token, state.address(), holder, amount)?;
                }
            }

            info!("Redeemed {} shares for {} (fee {})", burned, holder, fee_shares);
            Ok(RedeemReceipt {
                burned,
                fee_shares,
                withdrawals,
                received: U256::ZERO,
            })
        })
    }

    /// Swaps every constituent into `dest`. `paths` as for
    /// `invest_with_token`, encoded `constituent -> dest`.
    pub fn redeem_to_token(
        &mut self,
        holder: Address,
        dest: Address,
        burn_amount: U256,
        min_dest_out: U256,
        paths: &[SwapPath],
        now: u64,
    ) -> FundResult<RedeemReceipt> {
        self.atomically("redeem_to_token", |state, market| {
            check_paths_len(state, paths)?;
            let withdrawals = prepare_redeem(state, &*market, holder, burn_amount)?;
            let (burned, fee_shares) = burn_with_fee(state, holder, burn_amount, now)?;

            let fund = state.address();
            let mut received = U256::ZERO;
            for (i, &(token, amount)) in withdrawals.iter().enumerate() {
                if token == dest || amount.is_zero() {
                    received += amount;
                    continue;
                }
                let path = match paths.get(i).filter(|p| !p.is_empty()) {
                    Some(path) => {
                        path.validate(token, dest)?;
                        path.clone()
                    }
                    None => {
                        state
                            .quoter()
                            .quote_exact_in(&*market, token, dest, amount)
                            .into_route(token, dest)?
                            .0
                    }
                };
                received += market.exact_input(fund, &path, amount, U256::ZERO)?;
            }

            if received < min_dest_out {
                return Err(FundError::OverSlippage {
                    actual: received,
                    bound: min_dest_out,
                });
            }
            market.transfer(dest, fund, holder, received)?;

            info!("Redeemed {} shares for {} into {} of {}", burned, holder, received, dest);
            Ok(RedeemReceipt {
                burned,
                fee_shares,
                withdrawals,
                received,
            })
        })
    }

    // ========== Shares & rewards ==========

    pub fn transfer_shares(&mut self, from: Address, to: Address, amount: U256, now: u64) -> FundResult<()> {
        self.atomically("transfer_shares", |state, _| {
            state.transfer_shares(from, to, amount, now)
        })
    }

    /// Pays the holder's accrued reward out of the fund's reward balance
    pub fn claim_reward(&mut self, holder: Address, now: u64) -> FundResult<U256> {
        self.atomically("claim_reward", |state, market| {
            let amount = state.take_reward(holder, now)?;
            market.transfer(state.params().reward_token, state.address(), holder, amount)?;
            info!("Claimed {} reward for {}", amount, holder);
            Ok(amount)
        })
    }

    pub fn set_emission_rate(&mut self, rate: U256, now: u64) -> FundResult<()> {
        self.atomically("set_emission_rate", |state, _| state.set_emission_rate(rate, now))
    }

    // ========== Rebalance ==========

    pub fn rebalance(&mut self, now: u64) -> FundResult<RebalanceReport> {
        let report = self.atomically("rebalance", |state, market| {
            rebalance::rebalance(state, market, now)
        })?;

        if let Some(path) = &self.rebalance_log {
            if let Err(e) = report.append_to_file(self.state.address(), path) {
                warn!("Failed to write rebalance log {}: {}", path.display(), e);
            }
        }
        Ok(report)
    }

    // ========== Configuration ==========

    pub fn add_token(&mut self, token: Address, weight_ppm: u32, initial: U256) -> FundResult<()> {
        self.atomically("add_token", |state, _| state.add_token(token, weight_ppm, initial))
    }

    /// Checks the live reserve, not a cached one
    pub fn remove_token(&mut self, token: Address) -> FundResult<()> {
        self.atomically("remove_token", |state, market| {
            let reserve = if state.contains(token) {
                market.balance_of(token, state.address())?
            } else {
                U256::ZERO
            };
            state.remove_token(token, reserve)
        })
    }

    pub fn update_weights(&mut self, tokens: &[Address], weights: &[u32]) -> FundResult<()> {
        self.atomically("update_weights", |state, _| state.update_weights(tokens, weights))
    }

    pub fn set_initial_amounts(&mut self, amounts: &[U256]) -> FundResult<()> {
        self.atomically("set_initial_amounts", |state, _| state.set_initial_amounts(amounts))
    }

    // ========== Read-only ==========

    pub fn quote_exact_in(&self, token_in: Address, token_out: Address, amount_in: U256) -> Quote {
        self.state
            .quoter()
            .quote_exact_in(&self.market, token_in, token_out, amount_in)
    }

    pub fn quote_exact_out(&self, token_in: Address, token_out: Address, amount_out: U256) -> Quote {
        self.state
            .quoter()
            .quote_exact_out(&self.market, token_in, token_out, amount_out)
    }

    pub fn get_all_paths(&self, token_a: Address, token_b: Address) -> Vec<SwapPath> {
        self.state.quoter().get_all_paths(&self.market, token_a, token_b)
    }

    pub fn target_values(&self, now: u64) -> FundResult<Vec<TokenTarget>> {
        rebalance::target_values(&self.state, &self.market, now)
    }

    pub fn rebalance_plan(&self, now: u64) -> FundResult<Vec<PlanLeg>> {
        rebalance::compute_plan(&self.state, &self.market, now)
    }

    pub fn invest_amounts(&self, mint_amount: U256) -> FundResult<BasketAmounts> {
        allocator::invest_amounts(&self.state, &self.market, mint_amount)
    }

    pub fn redeem_amounts(&self, burn_amount: U256) -> FundResult<BasketAmounts> {
        allocator::redeem_amounts(&self.state, &self.market, burn_amount)
    }

    pub fn reserves(&self) -> FundResult<BasketAmounts> {
        self.state
            .tokens()
            .iter()
            .map(|&token| Ok((token, self.market.balance_of(token, self.state.address())?)))
            .collect()
    }

    pub fn share_balance(&self, holder: Address) -> U256 {
        self.state.share_balance(holder)
    }

    pub fn total_supply(&self) -> U256 {
        self.state.total_supply()
    }

    pub fn pending_reward(&self, holder: Address, now: u64) -> FundResult<U256> {
        self.state.pending_reward(holder, now)
    }
}

fn check_mint(state: &FundState, mint_amount: U256) -> FundResult<()> {
    if mint_amount.is_zero() {
        return Err(FundError::ZeroAmount);
    }
    let minimum = state.params().min_mint_amount;
    if mint_amount < minimum {
        return Err(FundError::BelowMinimumMintAmount {
            amount: mint_amount,
            minimum,
        });
    }
    Ok(())
}

fn check_len(state: &FundState, actual: usize) -> FundResult<()> {
    let expected = state.tokens().len();
    if actual != expected {
        return Err(FundError::InvalidArrayLength { expected, actual });
    }
    Ok(())
}

fn check_paths_len(state: &FundState, paths: &[SwapPath]) -> FundResult<()> {
    if !paths.is_empty() && paths.len() != state.tokens().len() {
        return Err(FundError::DifferentArrayLength {
            left: paths.len(),
            right: state.tokens().len(),
        });
    }
    Ok(())
}

/// Fee shares to the recipient, the rest to the investor
fn mint_with_fee(
    state: &mut FundState,
    investor: Address,
    mint_amount: U256,
    now: u64,
) -> FundResult<(U256, U256)> {
    let fee = state.invest_fee(mint_amount)?;
    if !fee.is_zero() {
        let recipient = state.params().fee_recipient;
        state.mint_shares(recipient, fee, now)?;
    }
    let shares = mint_amount - fee;
    state.mint_shares(investor, shares, now)?;
    Ok((shares, fee))
}

fn prepare_redeem<M: Market>(
    state: &FundState,
    market: &M,
    holder: Address,
    burn_amount: U256,
) -> FundResult<BasketAmounts> {
    if burn_amount.is_zero() {
        return Err(FundError::ZeroAmount);
    }
    let balance = state.share_balance(holder);
    if balance < burn_amount {
        return Err(FundError::InsufficientShares {
            holder,
            balance,
            requested: burn_amount,
        });
    }
    allocator::redeem_amounts(state, market, burn_amount)
}

/// Fee shares move to the recipient, the rest is burned
fn burn_with_fee(
    state: &mut FundState,
    holder: Address,
    burn_amount: U256,
    now: u64,
) -> FundResult<(U256, U256)> {
    let fee = state.redeem_fee(burn_amount)?;
    if !fee.is_zero() {
        let recipient = state.params().fee_recipient;
        state.transfer_shares(holder, recipient, fee, now)?;
    }
    let burned = burn_amount - fee;
    state.burn_shares(holder, burned, now)?;
    Ok((burned, fee))
}

// ============================================
// TESTS
// ============================================
