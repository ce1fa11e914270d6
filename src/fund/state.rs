//! Fund State - the single aggregate every operation mutates
//!
//! Holds the basket definition (ordered tokens, target weights, initial
//! amounts per share), the share ledger, the mining index and the rebalance
//! clock. Reserves are deliberately absent: they are read live from the token
//! ledger at the fund's address.

use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

use super::mining::MiningIndex;
use crate::error::{FundError, FundResult};
use crate::router::PathQuoter;
use crate::units::{pow10, ppm_of, PPM};

/// Fund parameters, validated once at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundParams {
    /// Address holding the reserves and paying rewards
    pub address: Address,
    /// Settlement asset for rebalance trades
    pub numeraire: Address,
    pub fee_recipient: Address,
    pub reward_token: Address,
    pub share_decimals: u8,
    pub invest_fee_ppm: u32,
    pub redeem_fee_ppm: u32,
    /// Allowed drift from target value before a token is traded
    pub deviance_ppm: u32,
    pub rebalance_interval: u64,
    /// Minimum-out tolerance applied to quoted rebalance legs
    pub rebalance_slippage_ppm: u32,
    /// 0 disables the staleness check
    pub max_price_age: u64,
    pub min_mint_amount: U256,
    pub emission_rate: U256,
}

impl FundParams {
    pub fn one_share(&self) -> U256 {
        pow10(self.share_decimals)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Constituent {
    pub token: Address,
    pub weight_ppm: u32,
    /// Token amount backing one whole share while supply is zero
    pub initial_amount_per_share: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ShareLedger {
    balances: HashMap<Address, U256>,
    total_supply: U256,
}

#[derive(Debug, Clone)]
pub struct FundState {
    params: FundParams,
    quoter: PathQuoter,
    tokens: Vec<Address>,
    weights: HashMap<Address, u32>,
    initial_amounts: HashMap<Address, U256>,
    shares: ShareLedger,
    mining: MiningIndex,
    last_rebalance: u64,
}

impl FundState {
    /// `now` starts the rebalance clock: the first rebalance is due one
    /// interval after creation
    pub fn new(
        params: FundParams,
        quoter: PathQuoter,
        constituents: &[Constituent],
        now: u64,
    ) -> FundResult<Self> {
        if params.invest_fee_ppm > PPM || params.redeem_fee_ppm > PPM || params.deviance_ppm > PPM
        {
            return Err(FundError::MathOverflow("ppm parameter above 1000000"));
        }

        let mut state = Self {
            mining: MiningIndex::new(params.emission_rate),
            params,
            quoter,
            tokens: Vec::new(),
            weights: HashMap::new(),
            initial_amounts: HashMap::new(),
            shares: ShareLedger::default(),
            last_rebalance: now,
        };
        for c in constituents {
            state.add_token(c.token, c.weight_ppm, c.initial_amount_per_share)?;
        }
        Ok(state)
    }

    pub fn params(&self) -> &FundParams {
        &self.params
    }

    pub fn address(&self) -> Address {
        self.params.address
    }

    pub fn quoter(&self) -> &PathQuoter {
        &self.quoter
    }

    pub fn tokens(&self) -> &[Address] {
        &self.tokens
    }

    pub fn contains(&self, token: Address) -> bool {
        self.weights.contains_key(&token)
    }

    pub fn weight(&self, token: Address) -> u32 {
        self.weights.get(&token).copied().unwrap_or(0)
    }

    pub fn weight_sum(&self) -> u64 {
        self.weights.values().map(|w| *w as u64).sum()
    }

    pub fn initial_amount(&self, token: Address) -> U256 {
        self.initial_amounts.get(&token).copied().unwrap_or_default()
    }

    pub fn constituents(&self) -> Vec<Constituent> {
        self.tokens
            .iter()
            .map(|&token| Constituent {
                token,
                weight_ppm: self.weight(token),
                initial_amount_per_share: self.initial_amount(token),
            })
            .collect()
    }

    pub fn last_rebalance(&self) -> u64 {
        self.last_rebalance
    }

    pub fn next_rebalance_due(&self) -> u64 {
        self.last_rebalance
            .saturating_add(self.params.rebalance_interval)
    }

    pub(crate) fn record_rebalance(&mut self, now: u64) {
        self.last_rebalance = now;
    }

    // ========== Basket configuration ==========

    pub fn add_token(&mut self, token: Address, weight_ppm: u32, initial: U256) -> FundResult<()> {
        if self.contains(token) {
            return Err(FundError::TokenExists(token));
        }
        self.tokens.push(token);
        self.weights.insert(token, weight_ppm);
        self.initial_amounts.insert(token, initial);
        debug!("Added constituent {} at {} ppm", token, weight_ppm);
        Ok(())
    }

    /// Caller supplies the live reserve; removal needs zero weight and reserve
    pub fn remove_token(&mut self, token: Address, reserve: U256) -> FundResult<()> {
        if !self.contains(token) {
            return Err(FundError::TokenNotFound(token));
        }
        if self.weight(token) != 0 || !reserve.is_zero() {
            return Err(FundError::TokenInUse(token));
        }
        self.tokens.retain(|t| *t != token);
        self.weights.remove(&token);
        self.initial_amounts.remove(&token);
        debug!("Removed constituent {}", token);
        Ok(())
    }

    /// The sum is only enforced when a rebalance runs
    pub fn update_weights(&mut self, tokens: &[Address], weights: &[u32]) -> FundResult<()> {
        if tokens.len() != weights.len() {
            return Err(FundError::DifferentArrayLength {
                left: tokens.len(),
                right: weights.len(),
            });
        }
        if let Some(missing) = tokens.iter().find(|t| !self.contains(**t)) {
            return Err(FundError::TokenNotFound(*missing));
        }
        for (token, weight) in tokens.iter().zip(weights) {
            self.weights.insert(*token, *weight);
        }
        Ok(())
    }

    /// One amount per constituent, in basket order
    pub fn set_initial_amounts(&mut self, amounts: &[U256]) -> FundResult<()> {
        if amounts.len() != self.tokens.len() {
            return Err(FundError::InvalidArrayLength {
                expected: self.tokens.len(),
                actual: amounts.len(),
            });
        }
        for (token, amount) in self.tokens.iter().zip(amounts) {
            self.initial_amounts.insert(*token, *amount);
        }
        Ok(())
    }

    // ========== Shares ==========

    pub fn total_supply(&self) -> U256 {
        self.shares.total_supply
    }

    pub fn share_balance(&self, holder: Address) -> U256 {
        self.shares
            .balances
            .get(&holder)
            .copied()
            .unwrap_or_default()
    }

    pub fn invest_fee(&self, mint_amount: U256) -> FundResult<U256> {
        ppm_of(mint_amount, self.params.invest_fee_ppm)
    }

    pub fn redeem_fee(&self, burn_amount: U256) -> FundResult<U256> {
        ppm_of(burn_amount, self.params.redeem_fee_ppm)
    }

    pub fn mint_shares(&mut self, to: Address, amount: U256, now: u64) -> FundResult<()> {
        self.before_share_transfer(Address::ZERO, to, now)?;
        self.shares.total_supply = self
            .shares
            .total_supply
            .checked_add(amount)
            .ok_or(FundError::MathOverflow("total supply"))?;
        *self.shares.balances.entry(to).or_default() += amount;
        Ok(())
    }

    pub fn burn_shares(&mut self, from: Address, amount: U256, now: u64) -> FundResult<()> {
        self.ensure_shares(from, amount)?;
        self.before_share_transfer(from, Address::ZERO, now)?;
        *self.shares.balances.entry(from).or_default() -= amount;
        self.shares.total_supply -= amount;
        Ok(())
    }

    pub fn transfer_shares(
        &mut self,
        from: Address,
        to: Address,
        amount: U256,
        now: u64,
    ) -> FundResult<()> {
        self.ensure_shares(from, amount)?;
        self.before_share_transfer(from, to, now)?;
        *self.shares.balances.entry(from).or_default() -= amount;
        *self.shares.balances.entry(to).or_default() += amount;
        Ok(())
    }

    fn ensure_shares(&self, holder: Address, amount: U256) -> FundResult<()> {
        let balance = self.share_balance(holder);
        if balance < amount {
            return Err(FundError::InsufficientShares {
                holder,
                balance,
                requested: amount,
            });
        }
        Ok(())
    }

    /// Global index first, then sender, then receiver; the zero address
    /// stands for mint/burn and is not tracked
    fn before_share_transfer(&mut self, from: Address, to: Address, now: u64) -> FundResult<()> {
        self.mining.update_global(self.shares.total_supply, now)?;
        for holder in [from, to] {
            if holder != Address::ZERO {
                let balance = self.share_balance(holder);
                self.mining.update_holder(holder, balance)?;
            }
        }
        Ok(())
    }

    // ========== Rewards ==========

    pub fn mining(&self) -> &MiningIndex {
        &self.mining
    }

    pub fn set_emission_rate(&mut self, rate: U256, now: u64) -> FundResult<()> {
        self.mining
            .set_emission_rate(rate, self.shares.total_supply, now)
    }

    /// Accrue as for a zero-amount transfer, then zero and return the reward
    pub fn take_reward(&mut self, holder: Address, now: u64) -> FundResult<U256> {
        self.before_share_transfer(holder, Address::ZERO, now)?;
        let amount = self.mining.take_accrued(holder);
        if amount.is_zero() {
            return Err(FundError::NothingClaimable(holder));
        }
        Ok(amount)
    }

    /// What `take_reward` would pay at `now`, without touching state
    pub fn pending_reward(&self, holder: Address, now: u64) -> FundResult<U256> {
        let mut mining = self.mining.clone();
        mining.update_global(self.shares.total_supply, now)?;
        mining.update_holder(holder, self.share_balance(holder))?;
        Ok(mining.accrued(holder))
    }
}

// ============================================
// TESTS
// ============================================
