//! Scenario Runner
//!
//! Drives a `Fund<SimulatedMarket>` from a TOML script: tokens, pools,
//! holders and fund parameters up front, then a list of timed actions.
//! Amounts are written in human units and scaled with each token's decimals.
//! Token, holder and fund addresses are derived from their names.

use alloy_primitives::utils::{parse_units, ParseUnits};
use alloy_primitives::{keccak256, Address, U256};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::SimulatedMarket;
use crate::fund::{Constituent, Fund, FundParams, FundState};
use crate::router::{PathQuoter, DEFAULT_FEE_TIERS};
use crate::units::display_amount;

// ============================================
// SCRIPT FORMAT
// ============================================

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub start_time: u64,
    /// Abort at the first failing step instead of recording it and moving on
    #[serde(default)]
    pub stop_on_error: bool,
    /// JSON-lines file for rebalance reports
    #[serde(default)]
    pub rebalance_log: Option<String>,
    pub tokens: Vec<TokenSpec>,
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
    #[serde(default)]
    pub holders: Vec<HolderSpec>,
    pub fund: FundSpec,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSpec {
    pub symbol: String,
    pub decimals: u8,
    /// USD per whole token; no feed when absent
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSpec {
    pub token_a: String,
    pub token_b: String,
    pub fee: u32,
    pub reserve_a: String,
    pub reserve_b: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HolderSpec {
    pub name: String,
    /// symbol -> amount
    #[serde(default)]
    pub balances: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundSpec {
    pub numeraire: String,
    /// Holder name receiving fee shares
    #[serde(default = "default_fee_recipient")]
    pub fee_recipient: String,
    #[serde(default)]
    pub reward_token: Option<String>,
    /// Reward tokens (human units) minted to the fund up front
    #[serde(default)]
    pub reward_pool: Option<String>,
    #[serde(default = "default_share_decimals")]
    pub share_decimals: u8,
    #[serde(default)]
    pub invest_fee_ppm: u32,
    #[serde(default)]
    pub redeem_fee_ppm: u32,
    #[serde(default = "default_deviance")]
    pub deviance_ppm: u32,
    #[serde(default = "default_interval")]
    pub rebalance_interval_secs: u64,
    #[serde(default)]
    pub rebalance_slippage_ppm: u32,
    #[serde(default)]
    pub max_price_age_secs: u64,
    /// In shares
    #[serde(default = "zero")]
    pub min_mint_amount: String,
    /// Reward tokens per second
    #[serde(default = "zero")]
    pub emission_rate: String,
    #[serde(default = "default_fee_tiers")]
    pub fee_tiers: Vec<u32>,
    #[serde(default)]
    pub bridge_tokens: Vec<String>,
    pub constituents: Vec<ConstituentSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConstituentSpec {
    pub token: String,
    pub weight_ppm: u32,
    /// Tokens per whole share
    pub initial_amount_per_share: String,
}

/// One scripted action. Share amounts are in whole shares.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Invest {
        holder: String,
        shares: String,
        /// symbol -> cap; holder's whole balance when absent
        #[serde(default)]
        max_amounts: BTreeMap<String, String>,
    },
    InvestWithToken {
        holder: String,
        token: String,
        shares: String,
        max_in: String,
    },
    Redeem {
        holder: String,
        shares: String,
    },
    RedeemToToken {
        holder: String,
        token: String,
        shares: String,
        #[serde(default = "zero")]
        min_out: String,
    },
    Rebalance,
    Claim {
        holder: String,
    },
    Transfer {
        from: String,
        to: String,
        shares: String,
    },
    SetPrice {
        token: String,
        price: String,
    },
    SetWeights {
        weights: BTreeMap<String, u32>,
    },
    Advance {
        secs: u64,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Invest { .. } => "invest",
            Step::InvestWithToken { .. } => "invest_with_token",
            Step::Redeem { .. } => "redeem",
            Step::RedeemToToken { .. } => "redeem_to_token",
            Step::Rebalance => "rebalance",
            Step::Claim { .. } => "claim",
            Step::Transfer { .. } => "transfer",
            Step::SetPrice { .. } => "set_price",
            Step::SetWeights { .. } => "set_weights",
            Step::Advance { .. } => "advance",
        }
    }
}

fn zero() -> String {
    "0".to_string()
}

fn default_fee_recipient() -> String {
    "treasury".to_string()
}

fn default_share_decimals() -> u8 {
    18
}

fn default_deviance() -> u32 {
    50_000
}

fn default_interval() -> u64 {
    30 * 24 * 60 * 60
}

fn default_fee_tiers() -> Vec<u32> {
    DEFAULT_FEE_TIERS.to_vec()
}

impl Scenario {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .wrap_err_with(|| format!("Cannot read scenario {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let scenario: Self = toml::from_str(content)?;
        Ok(scenario)
    }
}

/// Deterministic address for a named token, holder or the fund itself
pub fn named_address(name: &str) -> Address {
    Address::from_slice(&keccak256(name.as_bytes())[12..])
}

fn parse_amount(value: &str, decimals: u8) -> Result<U256> {
    match parse_units(value, decimals).map_err(|e| eyre!("Invalid amount {}: {}", value, e))? {
        ParseUnits::U256(amount) => Ok(amount),
        ParseUnits::I256(_) => Err(eyre!("Negative amount {}", value)),
    }
}

// ============================================
// RESULTS
// ============================================

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub index: usize,
    pub action: &'static str,
    pub time: u64,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepRecord>,
    pub total_supply: String,
    /// symbol -> reserve
    pub reserves: BTreeMap<String, String>,
}

impl ScenarioReport {
    pub fn failures(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

// ============================================
// RUNNER
// ============================================

pub struct ScenarioRunner {
    name: String,
    stop_on_error: bool,
    steps: Vec<Step>,
    fund: Fund<SimulatedMarket>,
    tokens: HashMap<String, (Address, u8)>,
    holders: HashMap<String, Address>,
    share_decimals: u8,
    reward_decimals: u8,
    now: u64,
}

impl ScenarioRunner {
    pub fn new(scenario: Scenario) -> Result<Self> {
        let mut market = SimulatedMarket::new();
        let mut tokens = HashMap::new();

        for t in &scenario.tokens {
            let address = named_address(&t.symbol);
            market.add_token(address, &t.symbol, t.decimals);
            if let Some(price) = &t.price {
                market.set_price(address, parse_amount(price, 18)?, scenario.start_time);
            }
            tokens.insert(t.symbol.clone(), (address, t.decimals));
        }
        let token = |symbol: &str| -> Result<(Address, u8)> {
            tokens
                .get(symbol)
                .copied()
                .ok_or_else(|| eyre!("Unknown token {}", symbol))
        };

        for p in &scenario.pools {
            let (a, a_dec) = token(&p.token_a)?;
            let (b, b_dec) = token(&p.token_b)?;
            market.add_pool(
                a,
                b,
                p.fee,
                parse_amount(&p.reserve_a, a_dec)?,
                parse_amount(&p.reserve_b, b_dec)?,
            );
        }

        let mut holders = HashMap::new();
        for h in &scenario.holders {
            let address = named_address(&h.name);
            for (symbol, amount) in &h.balances {
                let (t, dec) = token(symbol)?;
                market.mint(t, address, parse_amount(amount, dec)?);
            }
            holders.insert(h.name.clone(), address);
        }

        let setup = &scenario.fund;
        let share_decimals = setup.share_decimals;
        let fund_address = named_address("fund");
        let fee_recipient = named_address(&setup.fee_recipient);
        holders.entry(setup.fee_recipient.clone()).or_insert(fee_recipient);

        let (reward_token, reward_decimals) = match &setup.reward_token {
            Some(symbol) => token(symbol)?,
            None => (Address::ZERO, 18),
        };
        if let Some(pool) = &setup.reward_pool {
            market.mint(reward_token, fund_address, parse_amount(pool, reward_decimals)?);
        }

        let params = FundParams {
            address: fund_address,
            numeraire: token(&setup.numeraire)?.0,
            fee_recipient,
            reward_token,
            share_decimals: setup.share_decimals,
            invest_fee_ppm: setup.invest_fee_ppm,
            redeem_fee_ppm: setup.redeem_fee_ppm,
            deviance_ppm: setup.deviance_ppm,
            rebalance_interval: setup.rebalance_interval_secs,
            rebalance_slippage_ppm: setup.rebalance_slippage_ppm,
            max_price_age: setup.max_price_age_secs,
            min_mint_amount: parse_amount(&setup.min_mint_amount, setup.share_decimals)?,
            emission_rate: parse_amount(&setup.emission_rate, reward_decimals)?,
        };
        let bridges = setup
            .bridge_tokens
            .iter()
            .map(|s| token(s).map(|(a, _)| a))
            .collect::<Result<Vec<_>>>()?;
        let constituents = setup
            .constituents
            .iter()
            .map(|c| {
                let (address, dec) = token(&c.token)?;
                Ok(Constituent {
                    token: address,
                    weight_ppm: c.weight_ppm,
                    initial_amount_per_share: parse_amount(&c.initial_amount_per_share, dec)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let state = FundState::new(
            params,
            PathQuoter::new(setup.fee_tiers.clone(), bridges),
            &constituents,
            scenario.start_time,
        )
        .wrap_err("Invalid fund parameters")?;

        let mut fund = Fund::new(state, market);
        if let Some(log) = &scenario.rebalance_log {
            fund = fund.with_rebalance_log(log);
        }

        info!(
            "Scenario '{}': {} tokens, {} pools, {} holders, {} steps",
            scenario.name,
            tokens.len(),
            fund.market().pools().pool_count(),
            holders.len(),
            scenario.steps.len()
        );

        Ok(Self {
            name: scenario.name,
            stop_on_error: scenario.stop_on_error,
            steps: scenario.steps,
            fund,
            tokens,
            holders,
            share_decimals,
            reward_decimals,
            now: scenario.start_time,
        })
    }

    pub fn fund(&self) -> &Fund<SimulatedMarket> {
        &self.fund
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn token(&self, symbol: &str) -> Result<Address> {
        self.token_entry(symbol).map(|(a, _)| a)
    }

    pub fn holder(&self, name: &str) -> Result<Address> {
        self.holders
            .get(name)
            .copied()
            .ok_or_else(|| eyre!("Unknown holder {}", name))
    }

    /// Runs every step. A failing step is recorded (its effects are already
    /// rolled back by the fund) unless `stop_on_error` is set.
    pub fn run(&mut self) -> Result<ScenarioReport> {
        let steps = std::mem::take(&mut self.steps);
        let mut records = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            let outcome = self.apply(step);
            let record = StepRecord {
                index,
                action: step.name(),
                time: self.now,
                ok: outcome.is_ok(),
                detail: match &outcome {
                    Ok(detail) => detail.clone(),
                    Err(e) => e.to_string(),
                },
            };
            if record.ok {
                info!("[{}] {} @ {}: {}", index, record.action, record.time, record.detail);
            } else {
                warn!("[{}] {} @ {} failed: {}", index, record.action, record.time, record.detail);
            }
            records.push(record);

            if let Err(e) = outcome {
                if self.stop_on_error {
                    return Err(e.wrap_err(format!("Step {} ({}) failed", index, step.name())));
                }
            }
        }

        let reserves = self
            .fund
            .reserves()?
            .into_iter()
            .map(|(token, amount)| {
                let decimals = self
                    .fund
                    .market()
                    .token_info(token)
                    .map(|t| t.decimals)
                    .unwrap_or(18);
                (self.fund.market().symbol(token), display_amount(amount, decimals))
            })
            .collect();

        Ok(ScenarioReport {
            name: self.name.clone(),
            steps: records,
            total_supply: display_amount(self.fund.total_supply(), self.share_decimals),
            reserves,
        })
    }

    fn apply(&mut self, step: &Step) -> Result<String> {
        let now = self.now;
        match step {
            Step::Invest {
                holder,
                shares,
                max_amounts,
            } => {
                let investor = self.holder(holder)?;
                let mint = self.shares(shares)?;
                let mut caps = Vec::with_capacity(self.fund.state().tokens().len());
                for &token in self.fund.state().tokens() {
                    let symbol = self.fund.market().symbol(token);
                    let cap = match max_amounts.get(&symbol) {
                        Some(amount) => self.amount(&symbol, amount)?,
                        None => self.fund.market().balance(token, investor),
                    };
                    caps.push(cap);
                }
                let receipt = self.fund.invest_with_basket(investor, mint, &caps, now)?;
                Ok(format!(
                    "{} minted {} shares (fee {})",
                    holder,
                    self.show_shares(receipt.shares),
                    self.show_shares(receipt.fee_shares)
                ))
            }
            Step::InvestWithToken {
                holder,
                token,
                shares,
                max_in,
            } => {
                let investor = self.holder(holder)?;
                let source = self.token(token)?;
                let mint = self.shares(shares)?;
                let max = self.amount(token, max_in)?;
                let receipt = self.fund.invest_with_token(investor, source, mint, max, &[], now)?;
                Ok(format!(
                    "{} minted {} shares for {} {}",
                    holder,
                    self.show_shares(receipt.shares),
                    self.show(token, receipt.source_spent)?,
                    token
                ))
            }
            Step::Redeem { holder, shares } => {
                let redeemer = self.holder(holder)?;
                let burn = self.shares(shares)?;
                let mins = vec![U256::ZERO; self.fund.state().tokens().len()];
                let receipt = self.fund.redeem_to_basket(redeemer, burn, &mins, now)?;
                Ok(format!(
                    "{} redeemed {} shares (fee {})",
                    holder,
                    self.show_shares(receipt.burned),
                    self.show_shares(receipt.fee_shares)
                ))
            }
            Step::RedeemToToken {
                holder,
                token,
                shares,
                min_out,
            } => {
                let redeemer = self.holder(holder)?;
                let dest = self.token(token)?;
                let burn = self.shares(shares)?;
                let min = self.amount(token, min_out)?;
                let receipt = self.fund.redeem_to_token(redeemer, dest, burn, min, &[], now)?;
                Ok(format!(
                    "{} redeemed {} shares into {} {}",
                    holder,
                    self.show_shares(receipt.burned),
                    self.show(token, receipt.received)?,
                    token
                ))
            }
            Step::Rebalance => {
                let report = self.fund.rebalance(now)?;
                Ok(format!(
                    "{} trades, budget left {}",
                    report.trades.len(),
                    report.budget_left
                ))
            }
            Step::Claim { holder } => {
                let claimer = self.holder(holder)?;
                let amount = self.fund.claim_reward(claimer, now)?;
                Ok(format!(
                    "{} claimed {}",
                    holder,
                    display_amount(amount, self.reward_decimals)
                ))
            }
            Step::Transfer { from, to, shares } => {
                let sender = self.holder(from)?;
                let receiver = self.holder(to)?;
                let amount = self.shares(shares)?;
                self.fund.transfer_shares(sender, receiver, amount, now)?;
                Ok(format!("{} -> {}: {} shares", from, to, shares))
            }
            Step::SetPrice { token, price } => {
                let address = self.token(token)?;
                let price_value = parse_amount(price, 18)?;
                self.fund.market_mut().set_price(address, price_value, now);
                Ok(format!("{} = ${}", token, price))
            }
            Step::SetWeights { weights } => {
                let mut tokens = Vec::with_capacity(weights.len());
                let mut values = Vec::with_capacity(weights.len());
                for (symbol, weight) in weights {
                    tokens.push(self.token(symbol)?);
                    values.push(*weight);
                }
                self.fund.update_weights(&tokens, &values)?;
                Ok(format!("{} weights updated", tokens.len()))
            }
            Step::Advance { secs } => {
                self.now += secs;
                Ok(format!("clock at {}", self.now))
            }
        }
    }

    fn token_entry(&self, symbol: &str) -> Result<(Address, u8)> {
        self.tokens
            .get(symbol)
            .copied()
            .ok_or_else(|| eyre!("Unknown token {}", symbol))
    }

    fn amount(&self, symbol: &str, value: &str) -> Result<U256> {
        let (_, decimals) = self.token_entry(symbol)?;
        parse_amount(value, decimals)
    }

    fn shares(&self, value: &str) -> Result<U256> {
        parse_amount(value, self.share_decimals)
    }

    fn show(&self, symbol: &str, amount: U256) -> Result<String> {
        let (_, decimals) = self.token_entry(symbol)?;
        Ok(display_amount(amount, decimals))
    }

    fn show_shares(&self, amount: U256) -> String {
        display_amount(amount, self.share_decimals)
    }
}

// ============================================
// TESTS
// ============================================
