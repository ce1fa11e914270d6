//! Rebalance Engine
//!
//! Idle -> Eligible -> Computing -> Executing -> Idle
//!
//! Every constituent is valued at its oracle price. Tokens whose value sits
//! outside `target ± deviance` get a signed swap amount. Execution sells all
//! overweight tokens into the numeraire first, buys underweight tokens with
//! the proceeds, then spreads whatever is left over the basket in a single
//! pass. Only sale proceeds are ever spent: numeraire that was already idle in
//! the fund stays where it is.

use alloy_primitives::{Address, I256, U256};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

use super::FundState;
use crate::error::{FundError, FundResult};
use crate::interfaces::{BalanceReader, PriceOracle, RouteSource, SwapExecutor, TokenLedger};
use crate::router::{PathQuoter, SwapPath};
use crate::units::{mul_div, ppm_of, Value, PPM};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RebalanceStage {
    Idle,
    Eligible,
    Computing,
    Executing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RebalancePhase {
    Sell,
    Buy,
    Residual,
}

impl fmt::Display for RebalancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebalancePhase::Sell => write!(f, "sell"),
            RebalancePhase::Buy => write!(f, "buy"),
            RebalancePhase::Residual => write!(f, "residual"),
        }
    }
}

/// One constituent valued against its target band
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenTarget {
    pub token: Address,
    pub decimals: u8,
    pub price: U256,
    pub reserve: U256,
    pub weight_ppm: u32,
    pub value: Value,
    pub target: Value,
    pub lower: Value,
    pub upper: Value,
}

impl TokenTarget {
    pub fn in_band(&self) -> bool {
        self.value >= self.lower && self.value <= self.upper
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLeg {
    #[serde(flatten)]
    pub target: TokenTarget,
    /// Token-native units: >0 buy, <0 sell, 0 hold
    #[serde(serialize_with = "serialize_signed")]
    pub swap_amount: I256,
}

fn serialize_signed<S: Serializer>(amount: &I256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(amount)
}

/// An executed leg. Numeraire settled internally has an empty path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeRecord {
    pub phase: RebalancePhase,
    pub token_in: Address,
    pub token_out: Address,
    pub path: SwapPath,
    pub amount_in: U256,
    pub amount_out: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebalanceReport {
    pub timestamp: u64,
    pub plan: Vec<PlanLeg>,
    /// Execution order
    pub trades: Vec<TradeRecord>,
    pub reserves_before: Vec<(Address, U256)>,
    pub reserves_after: Vec<(Address, U256)>,
    /// Sale proceeds left after the residual pass (rounding dust)
    pub budget_left: U256,
}

#[derive(Serialize)]
struct RebalanceLogLine<'a> {
    logged_at: DateTime<Utc>,
    fund: Address,
    #[serde(flatten)]
    report: &'a RebalanceReport,
}

impl RebalanceReport {
    /// Append this report as one JSON line
    pub fn append_to_file<P: AsRef<Path>>(&self, fund: Address, path: P) -> eyre::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let line = RebalanceLogLine {
            logged_at: Utc::now(),
            fund,
            report: self,
        };
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
        Ok(())
    }
}

// ============================================
// COMPUTING
// ============================================

/// Weight sum first, then the clock
pub fn check_eligible(state: &FundState, now: u64) -> FundResult<()> {
    let sum = state.weight_sum();
    if sum != PPM as u64 {
        return Err(FundError::InsufficientWeightSum(sum));
    }
    let due = state.next_rebalance_due();
    if now < due {
        return Err(FundError::NotRebalanceDue { due, now });
    }
    Ok(())
}

fn check_fresh(token: Address, updated_at: u64, now: u64, max_age: u64) -> FundResult<()> {
    if max_age > 0 && now.saturating_sub(updated_at) > max_age {
        warn!("Stale price for {}: updated {} now {}", token, updated_at, now);
        return Err(FundError::StalePrice {
            token,
            updated_at,
            now,
            max_age,
        });
    }
    Ok(())
}

/// Current value, target value and band per constituent, in basket order
pub fn target_values<M: BalanceReader + PriceOracle + ?Sized>(
    state: &FundState,
    market: &M,
    now: u64,
) -> FundResult<Vec<TokenTarget>> {
    let params = state.params();
    let mut priced = Vec::with_capacity(state.tokens().len());
    let mut total = Value::ZERO;

    for &token in state.tokens() {
        let feed = market.latest_price(token)?;
        check_fresh(token, feed.updated_at, now, params.max_price_age)?;
        let decimals = market.decimals(token)?;
        let reserve = market.balance_of(token, state.address())?;
        let value = Value::of_amount(reserve, feed.price, decimals)?;
        total = total.checked_add(value)?;
        priced.push((token, decimals, feed.price, reserve, value));
    }

    let deviance = params.deviance_ppm;
    priced
        .into_iter()
        .map(|(token, decimals, price, reserve, value)| {
            let weight_ppm = state.weight(token);
            let target = total.scale_ppm(weight_ppm)?;
            Ok(TokenTarget {
                token,
                decimals,
                price,
                reserve,
                weight_ppm,
                value,
                target,
                lower: target.scale_ppm(PPM - deviance)?,
                upper: target.scale_ppm(PPM + deviance)?,
            })
        })
        .collect()
}

/// Signed swap amount per constituent; weight-0 tokens are never traded
pub fn compute_plan<M: BalanceReader + PriceOracle + ?Sized>(
    state: &FundState,
    market: &M,
    now: u64,
) -> FundResult<Vec<PlanLeg>> {
    target_values(state, market, now)?
        .into_iter()
        .map(|target| {
            let swap_amount = if target.weight_ppm == 0 || target.in_band() {
                I256::ZERO
            } else {
                let (delta, under) = target.value.abs_diff(target.target);
                let amount = delta.to_amount(target.price, target.decimals)?;
                let amount =
                    I256::try_from(amount).map_err(|_| FundError::MathOverflow("swap amount"))?;
                if under {
                    amount
                } else {
                    -amount
                }
            };
            Ok(PlanLeg {
                target,
                swap_amount,
            })
        })
        .collect()
}

// ============================================
// EXECUTING
// ============================================

struct Execution<'a, M: ?Sized> {
    quoter: &'a PathQuoter,
    market: &'a mut M,
    fund: Address,
    numeraire: Address,
    slippage_ppm: u32,
    budget: U256,
    trades: Vec<TradeRecord>,
}

impl<'a, M> Execution<'a, M>
where
    M: RouteSource + SwapExecutor + ?Sized,
{
    fn min_out(&self, quoted: U256) -> FundResult<U256> {
        mul_div(
            quoted,
            U256::from(PPM.saturating_sub(self.slippage_ppm)),
            U256::from(PPM),
        )
    }

    fn settle_internally(&mut self, phase: RebalancePhase, amount: U256) {
        debug!("{} {} of numeraire settled internally", phase, amount);
        self.trades.push(TradeRecord {
            phase,
            token_in: self.numeraire,
            token_out: self.numeraire,
            path: SwapPath::empty(),
            amount_in: amount,
            amount_out: amount,
        });
    }

    fn record(&mut self, trade: TradeRecord) {
        info!(
            "  {} {} -> {} via {}: in {} out {}",
            trade.phase, trade.token_in, trade.token_out, trade.path, trade.amount_in, trade.amount_out
        );
        self.trades.push(trade);
    }

    fn swap_in(
        &mut self,
        phase: RebalancePhase,
        token_in: Address,
        token_out: Address,
        amount_in: U256,
    ) -> FundResult<U256> {
        let quote = self
            .quoter
            .quote_exact_in(&*self.market, token_in, token_out, amount_in);
        let (path, quoted) = quote.into_route(token_in, token_out)?;
        let min_out = self.min_out(quoted)?;
        let amount_out = self
            .market
            .exact_input(self.fund, &path, amount_in, min_out)?;
        self.record(TradeRecord {
            phase,
            token_in,
            token_out,
            path,
            amount_in,
            amount_out,
        });
        Ok(amount_out)
    }

    fn sell(&mut self, plan: &[PlanLeg]) -> FundResult<()> {
        for leg in plan.iter().filter(|l| l.swap_amount.is_negative()) {
            let token = leg.target.token;
            let amount = leg.swap_amount.unsigned_abs();
            if token == self.numeraire {
                self.settle_internally(RebalancePhase::Sell, amount);
                self.budget += amount;
                continue;
            }
            let out = self.swap_in(RebalancePhase::Sell, token, self.numeraire, amount)?;
            self.budget += out;
        }
        info!("Sell phase done, budget {}", self.budget);
        Ok(())
    }

    fn buy(&mut self, plan: &[PlanLeg]) -> FundResult<()> {
        for leg in plan.iter().filter(|l| l.swap_amount.is_positive()) {
            if self.budget.is_zero() {
                break;
            }
            let token = leg.target.token;
            let amount = leg.swap_amount.unsigned_abs();

            if token == self.numeraire {
                let kept = amount.min(self.budget);
                self.settle_internally(RebalancePhase::Buy, kept);
                self.budget -= kept;
                if kept < amount {
                    break;
                }
                continue;
            }

            let quote = self
                .quoter
                .quote_exact_out(&*self.market, self.numeraire, token, amount);
            let (path, required) = quote.into_route(token, self.numeraire)?;

            if self.budget >= required {
                let paid = self
                    .market
                    .exact_output(self.fund, &path, amount, required)?;
                self.budget -= paid;
                self.record(TradeRecord {
                    phase: RebalancePhase::Buy,
                    token_in: self.numeraire,
                    token_out: token,
                    path,
                    amount_in: paid,
                    amount_out: amount,
                });
            } else {
                // Not enough for the full target: spend what is left and stop
                debug!("Budget {} short of {} for {}", self.budget, required, token);
                let budget = self.budget;
                self.swap_in(RebalancePhase::Buy, self.numeraire, token, budget)?;
                self.budget = U256::ZERO;
                break;
            }
        }
        info!("Buy phase done, budget {}", self.budget);
        Ok(())
    }

    /// One pass, each share sized from the budget at the start of the pass
    fn residual(&mut self, state: &FundState) -> FundResult<()> {
        if self.budget.is_zero() {
            return Ok(());
        }
        let start = self.budget;

        for &token in state.tokens() {
            if self.budget.is_zero() {
                break;
            }
            let weight = state.weight(token);
            if weight == 0 {
                continue;
            }
            let share = ppm_of(start, weight)?.min(self.budget);
            if share.is_zero() {
                continue;
            }
            if token == self.numeraire {
                self.settle_internally(RebalancePhase::Residual, share);
            } else {
                self.swap_in(RebalancePhase::Residual, self.numeraire, token, share)?;
            }
            self.budget -= share;
        }
        info!("Residual pass done, {} left", self.budget);
        Ok(())
    }
}

fn advance(stage: &mut RebalanceStage, next: RebalanceStage) {
    debug!("Rebalance {:?} -> {:?}", stage, next);
    *stage = next;
}

/// Runs a full rebalance. Leaves partial effects behind on error: callers
/// needing atomicity go through `Fund`.
pub fn rebalance<M>(state: &mut FundState, market: &mut M, now: u64) -> FundResult<RebalanceReport>
where
    M: TokenLedger + PriceOracle + RouteSource + SwapExecutor + ?Sized,
{
    let mut stage = RebalanceStage::Idle;
    check_eligible(state, now)?;
    advance(&mut stage, RebalanceStage::Eligible);

    advance(&mut stage, RebalanceStage::Computing);
    let plan = compute_plan(state, &*market, now)?;
    let reserves_before: Vec<_> = plan
        .iter()
        .map(|leg| (leg.target.token, leg.target.reserve))
        .collect();

    advance(&mut stage, RebalanceStage::Executing);
    info!(
        "Rebalancing {} tokens: {} sells, {} buys",
        plan.len(),
        plan.iter().filter(|l| l.swap_amount.is_negative()).count(),
        plan.iter().filter(|l| l.swap_amount.is_positive()).count()
    );

    let (trades, budget_left) = {
        let mut run = Execution {
            quoter: state.quoter(),
            market: &mut *market,
            fund: state.address(),
            numeraire: state.params().numeraire,
            slippage_ppm: state.params().rebalance_slippage_ppm,
            budget: U256::ZERO,
            trades: Vec::new(),
        };
        run.sell(&plan)?;
        run.buy(&plan)?;
        run.residual(state)?;
        (run.trades, run.budget)
    };

    let reserves_after = state
        .tokens()
        .iter()
        .map(|&token| Ok((token, market.balance_of(token, state.address())?)))
        .collect::<FundResult<Vec<_>>>()?;

    state.record_rebalance(now);
    advance(&mut stage, RebalanceStage::Idle);
    info!("Rebalance complete: {} trades, {} budget left", trades.len(), budget_left);

    Ok(RebalanceReport {
        timestamp: now,
        plan,
        trades,
        reserves_before,
        reserves_after,
        budget_left,
    })
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::state::tests::params;
    use crate::fund::Constituent;
    use crate::market::fixtures::*;
    use crate::market::SimulatedMarket;
    use crate::units::pow10;

    const MONTH: u64 = 30 * 24 * 3600;

    fn setup(weights: &[(Address, u32)], holdings: &[(Address, U256)]) -> (FundState, SimulatedMarket) {
        let constituents: Vec<_> = weights
            .iter()
            .map(|&(token, weight_ppm)| Constituent {
                token,
                weight_ppm,
                initial_amount_per_share: U256::ZERO,
            })
            .collect();
        let state = FundState::new(params(), quoter(), &constituents, 0).unwrap();
        let mut market = market();
        for &(token, amount) in holdings {
            market.mint(token, FUND, amount);
        }
        (state, market)
    }

    fn milli(n: u64) -> U256 {
        U256::from(n) * pow10(15)
    }

    #[test]
    fn test_weight_sum_checked_before_clock() {
        let tokens: Vec<_> = (1..=7u8).map(Address::repeat_byte).collect();
        let weights: Vec<_> = tokens.iter().map(|t| (*t, 125_000)).collect();
        let (mut state, mut market) = setup(&weights, &[]);

        // 7 × 125000 = 875000, rejected even long before the due time
        assert_eq!(
            rebalance(&mut state, &mut market, 1),
            Err(FundError::InsufficientWeightSum(875_000))
        );

        state.update_weights(&[tokens[0]], &[250_000]).unwrap();
        assert_eq!(
            rebalance(&mut state, &mut market, MONTH - 1),
            Err(FundError::NotRebalanceDue {
                due: MONTH,
                now: MONTH - 1
            })
        );
        assert_eq!(state.last_rebalance(), 0);
    }

    #[test]
    fn test_plan_values_and_bands() {
        let (state, market) = setup(
            &[(weth(), 500_000), (link(), 500_000)],
            &[(weth(), ether(1)), (link(), ether(100))],
        );
        let plan = compute_plan(&state, &market, MONTH).unwrap();

        assert_eq!(plan[0].target.value.raw(), dollars(2_000));
        assert_eq!(plan[0].target.target.raw(), dollars(1_500));
        assert_eq!(plan[0].target.lower.raw(), dollars(1_425));
        assert_eq!(plan[0].target.upper.raw(), dollars(1_575));
        assert_eq!(plan[0].swap_amount, -I256::try_from(milli(250)).unwrap());
        assert_eq!(plan[1].swap_amount, I256::try_from(ether(50)).unwrap());
    }

    #[test]
    fn test_weight_zero_token_is_held() {
        let (state, market) = setup(
            &[(weth(), 1_000_000), (link(), 0)],
            &[(weth(), ether(1)), (link(), ether(100))],
        );
        let plan = compute_plan(&state, &market, MONTH).unwrap();
        assert!(plan[1].swap_amount.is_zero());
        assert!(plan[1].target.target.raw().is_zero());
        // WETH is two thirds of the value against a full target
        assert!(plan[0].swap_amount.is_positive());
    }

    #[test]
    fn test_stale_or_missing_price() {
        let (mut state, mut market) = setup(&[(weth(), 1_000_000)], &[(weth(), ether(1))]);
        let mut p = params();
        p.max_price_age = 3600;
        let stale = FundState::new(p, quoter(), &state.constituents(), 0).unwrap();
        assert!(matches!(
            compute_plan(&stale, &market, MONTH),
            Err(FundError::StalePrice { max_age: 3600, .. })
        ));

        market.remove_price(weth());
        assert_eq!(
            rebalance(&mut state, &mut market, MONTH),
            Err(FundError::PriceFeedMissing(weth()))
        );
    }

    #[test]
    fn test_two_token_rebalance_never_spends_idle_numeraire() {
        let (mut state, mut market) = setup(
            &[(weth(), 500_000), (link(), 500_000)],
            &[(weth(), ether(1)), (link(), ether(100)), (usdc(), usd(1_000))],
        );

        let report = rebalance(&mut state, &mut market, MONTH).unwrap();

        assert_eq!(report.trades.len(), 2);
        let (sell, buy) = (&report.trades[0], &report.trades[1]);
        assert_eq!(sell.phase, RebalancePhase::Sell);
        assert_eq!(sell.amount_in, milli(250));
        // Proceeds fall short of 50 LINK: best effort spends all of them
        assert_eq!(buy.phase, RebalancePhase::Buy);
        assert_eq!(buy.token_in, usdc());
        assert_eq!(buy.amount_in, sell.amount_out);
        assert!(buy.amount_out < ether(50));
        assert!(buy.amount_out > ether(49));

        assert_eq!(report.budget_left, U256::ZERO);
        assert_eq!(market.balance_of(usdc(), FUND).unwrap(), usd(1_000));
        assert_eq!(market.balance_of(weth(), FUND).unwrap(), milli(750));
        assert_eq!(
            market.balance_of(link(), FUND).unwrap(),
            ether(100) + buy.amount_out
        );
        assert_eq!(state.last_rebalance(), MONTH);
        assert_eq!(state.next_rebalance_due(), 2 * MONTH);
    }

    #[test]
    fn test_three_token_rebalance_with_residual() {
        let (mut state, mut market) = setup(
            &[(weth(), 400_000), (link(), 300_000), (wbtc(), 300_000)],
            &[
                (weth(), ether(1)),
                (link(), ether(100)),
                (wbtc(), U256::from(3_000_000u64)),
            ],
        );

        let report = rebalance(&mut state, &mut market, MONTH).unwrap();

        assert_eq!(report.plan[0].swap_amount, -I256::try_from(milli(160)).unwrap());
        assert_eq!(report.plan[1].swap_amount, I256::try_from(ether(26)).unwrap());
        assert!(report.plan[2].swap_amount.is_zero());

        let phases: Vec<_> = report.trades.iter().map(|t| t.phase).collect();
        assert_eq!(
            phases,
            vec![
                RebalancePhase::Sell,
                RebalancePhase::Buy,
                RebalancePhase::Residual,
                RebalancePhase::Residual,
                RebalancePhase::Residual,
            ]
        );
        assert_eq!(report.trades[1].amount_out, ether(26));
        // WBTC residual goes through the WETH bridge
        assert_eq!(report.trades[4].path.tokens(), &[usdc(), weth(), wbtc()]);

        assert!(report.budget_left <= U256::from(3u8));
        assert_eq!(market.balance_of(usdc(), FUND).unwrap(), report.budget_left);
        assert!(market.balance_of(link(), FUND).unwrap() > ether(126));

        let after = compute_plan(&state, &market, 2 * MONTH).unwrap();
        assert!(after.iter().all(|leg| leg.swap_amount.is_zero()));
        assert_eq!(report.reserves_before[0], (weth(), ether(1)));
        assert_eq!(report.reserves_after[1].1, market.balance_of(link(), FUND).unwrap());
    }

    #[test]
    fn test_residual_skips_zero_weight_constituent() {
        let (mut state, mut market) = setup(
            &[(weth(), 400_000), (reward(), 0), (link(), 300_000), (wbtc(), 300_000)],
            &[
                (weth(), ether(1)),
                (link(), ether(100)),
                (wbtc(), U256::from(3_000_000u64)),
            ],
        );
        market.set_price(reward(), dollars(1), 0);

        let report = rebalance(&mut state, &mut market, MONTH).unwrap();

        let residual: Vec<_> = report
            .trades
            .iter()
            .filter(|t| t.phase == RebalancePhase::Residual)
            .map(|t| t.token_out)
            .collect();
        assert_eq!(residual, vec![weth(), link(), wbtc()]);
        assert!(report
            .trades
            .iter()
            .all(|t| t.token_in != reward() && t.token_out != reward()));

        assert!(report.budget_left <= U256::from(3u8));
        assert_eq!(market.balance_of(usdc(), FUND).unwrap(), report.budget_left);
        assert_eq!(market.balance_of(reward(), FUND).unwrap(), U256::ZERO);
    }

    #[test]
    fn test_numeraire_constituent_settles_internally() {
        let (mut state, mut market) = setup(
            &[(weth(), 500_000), (usdc(), 500_000)],
            &[(weth(), ether(1))],
        );

        let report = rebalance(&mut state, &mut market, MONTH).unwrap();

        assert_eq!(report.trades.len(), 2);
        let proceeds = report.trades[0].amount_out;
        assert!(report.trades[1].path.is_empty());
        assert_eq!(report.trades[1].amount_in, proceeds);
        assert_eq!(report.budget_left, U256::ZERO);
        assert_eq!(market.balance_of(usdc(), FUND).unwrap(), proceeds);
        assert_eq!(market.balance_of(weth(), FUND).unwrap(), milli(500));
    }

    #[test]
    fn test_missing_route_aborts() {
        let doge = Address::repeat_byte(0xD0);
        let (mut state, mut market) = setup(
            &[(weth(), 500_000), (doge, 500_000)],
            &[(weth(), ether(1))],
        );
        market.add_token(doge, "DOGE", 18);
        market.set_price(doge, pow10(17), 0);

        let err = rebalance(&mut state, &mut market, MONTH).unwrap_err();
        assert!(matches!(err, FundError::InvalidSwapPath(_)));
        assert_eq!(state.last_rebalance(), 0);
    }

    #[test]
    fn test_report_appends_json_lines() {
        let (mut state, mut market) = setup(
            &[(weth(), 500_000), (link(), 500_000)],
            &[(weth(), ether(1)), (link(), ether(100))],
        );
        let report = rebalance(&mut state, &mut market, MONTH).unwrap();

        let path = std::env::temp_dir().join(format!("basket-rebalance-{}.jsonl", std::process::id()));
        let _ = fs::remove_file(&path);
        report.append_to_file(FUND, &path).unwrap();
        report.append_to_file(FUND, &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["timestamp"], MONTH);
        assert_eq!(parsed["trades"].as_array().unwrap().len(), 2);
        assert_eq!(parsed["plan"][0]["swap_amount"], "-250000000000000000");
        let _ = fs::remove_file(&path);
    }
}
