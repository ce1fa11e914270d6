//! Routing: swap path encoding and best-quote search

mod path;
mod quoter;

pub use path::{SwapPath, MAX_FEE, MAX_HOPS};
pub use quoter::{PathQuoter, Quote, DEFAULT_FEE_TIERS};
