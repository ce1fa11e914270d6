//! Fixed-point helpers
//!
//! Two unit systems meet in the fund:
//! - token-native amounts (`U256`, scaled by each token's own decimals)
//! - value units (`Value`, scaled by `VALUE_DECIMALS`, the oracle price scale)
//!
//! The only bridge between them is an oracle price, via `Value::of_amount`
//! and `Value::to_amount`.

use alloy_primitives::utils::format_units;
use alloy_primitives::U256;
use serde::Serialize;
use std::fmt;

use crate::error::{FundError, FundResult};

/// Parts-per-million denominator for weights, fees and deviance
pub const PPM: u32 = 1_000_000;

/// Decimals of oracle prices and of `Value`
pub const VALUE_DECIMALS: u8 = 18;

pub fn pow10(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}

/// floor(a * b / d)
pub fn mul_div(a: U256, b: U256, d: U256) -> FundResult<U256> {
    if d.is_zero() {
        return Err(FundError::MathOverflow("division by zero"));
    }
    let product = a
        .checked_mul(b)
        .ok_or(FundError::MathOverflow("mul_div"))?;
    Ok(product / d)
}

/// ceil(a * b / d)
pub fn mul_div_up(a: U256, b: U256, d: U256) -> FundResult<U256> {
    if d.is_zero() {
        return Err(FundError::MathOverflow("division by zero"));
    }
    let product = a
        .checked_mul(b)
        .ok_or(FundError::MathOverflow("mul_div_up"))?;
    let quotient = product / d;
    if (product % d).is_zero() {
        Ok(quotient)
    } else {
        Ok(quotient + U256::from(1u8))
    }
}

/// floor(amount * ppm / 1e6)
pub fn ppm_of(amount: U256, ppm: u32) -> FundResult<U256> {
    mul_div(amount, U256::from(ppm), U256::from(PPM))
}

/// Human-readable token amount, falling back to the raw integer
pub fn display_amount(amount: U256, decimals: u8) -> String {
    format_units(amount, decimals).unwrap_or_else(|_| amount.to_string())
}

/// Market value in oracle units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Value(U256);

impl Value {
    pub const ZERO: Value = Value(U256::ZERO);

    pub fn from_raw(raw: U256) -> Self {
        Value(raw)
    }

    pub fn raw(self) -> U256 {
        self.0
    }

    /// amount * price / 10^decimals
    pub fn of_amount(amount: U256, price: U256, decimals: u8) -> FundResult<Value> {
        mul_div(amount, price, pow10(decimals)).map(Value)
    }

    /// value * 10^decimals / price, rounded down
    pub fn to_amount(self, price: U256, decimals: u8) -> FundResult<U256> {
        if price.is_zero() {
            return Err(FundError::MathOverflow("zero price"));
        }
        mul_div(self.0, pow10(decimals), price)
    }

    pub fn scale_ppm(self, ppm: u32) -> FundResult<Value> {
        ppm_of(self.0, ppm).map(Value)
    }

    pub fn checked_add(self, other: Value) -> FundResult<Value> {
        self.0
            .checked_add(other.0)
            .map(Value)
            .ok_or(FundError::MathOverflow("value sum"))
    }

    /// |self - other| and whether self < other
    pub fn abs_diff(self, other: Value) -> (Value, bool) {
        if self.0 >= other.0 {
            (Value(self.0 - other.0), false)
        } else {
            (Value(other.0 - self.0), true)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", display_amount(self.0, VALUE_DECIMALS))
    }
}
