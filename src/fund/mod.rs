//! The fund: basket state, share accounting, allocation, rebalancing and the
//! user-facing invest/redeem flows

pub mod allocator;
pub mod mining;
mod orchestrator;
pub mod rebalance;
mod state;

pub use allocator::BasketAmounts;
pub use mining::MiningIndex;
pub use orchestrator::{Fund, InvestReceipt, RedeemReceipt};
pub use rebalance::{
    PlanLeg, RebalancePhase, RebalanceReport, RebalanceStage, TokenTarget, TradeRecord,
};
pub use state::{Constituent, FundParams, FundState};
