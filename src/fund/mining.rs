//! Reward Index Accrual
//!
//! A single global index grows by `rate × elapsed × SCALE / supply` and each
//! holder earns `balance × (index − last_seen) / SCALE`. Both updates run
//! before every share balance change, global first.

use alloy_primitives::{Address, U256};
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

use crate::error::{FundError, FundResult};
use crate::units::{mul_div, pow10};

/// Index fixed-point decimals
pub const INDEX_SCALE_DECIMALS: u8 = 36;

pub fn index_scale() -> U256 {
    pow10(INDEX_SCALE_DECIMALS)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HolderAccrual {
    pub last_index: U256,
    pub accrued: U256,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MiningIndex {
    index: U256,
    last_update: u64,
    initialized: bool,
    /// Reward units emitted per second across all shares
    emission_rate: U256,
    holders: HashMap<Address, HolderAccrual>,
}

impl MiningIndex {
    pub fn new(emission_rate: U256) -> Self {
        Self {
            emission_rate,
            ..Self::default()
        }
    }

    pub fn index(&self) -> U256 {
        self.index
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn emission_rate(&self) -> U256 {
        self.emission_rate
    }

    pub fn holder(&self, holder: Address) -> Option<&HolderAccrual> {
        self.holders.get(&holder)
    }

    pub fn accrued(&self, holder: Address) -> U256 {
        self.holders
            .get(&holder)
            .map(|h| h.accrued)
            .unwrap_or_default()
    }

    pub fn update_global(&mut self, total_supply: U256, now: u64) -> FundResult<()> {
        if !self.initialized {
            self.index = index_scale();
            self.last_update = now;
            self.initialized = true;
            return Ok(());
        }

        let elapsed = now.saturating_sub(self.last_update);
        if !total_supply.is_zero() && elapsed > 0 && !self.emission_rate.is_zero() {
            let emitted = self
                .emission_rate
                .checked_mul(U256::from(elapsed))
                .ok_or(FundError::MathOverflow("emission"))?;
            let delta = mul_div(emitted, index_scale(), total_supply)?;
            self.index = self
                .index
                .checked_add(delta)
                .ok_or(FundError::MathOverflow("mining index"))?;
            trace!("Mining index +{} -> {}", delta, self.index);
        }

        // Clock moves even without accrual so the same span is never counted twice
        self.last_update = self.last_update.max(now);
        Ok(())
    }

    /// Must follow `update_global`. A first observation only records the index.
    pub fn update_holder(&mut self, holder: Address, balance: U256) -> FundResult<()> {
        let index = self.index;
        match self.holders.get_mut(&holder) {
            Some(entry) => {
                if !balance.is_zero() {
                    let earned = mul_div(balance, index - entry.last_index, index_scale())?;
                    entry.accrued = entry
                        .accrued
                        .checked_add(earned)
                        .ok_or(FundError::MathOverflow("accrued reward"))?;
                }
                entry.last_index = index;
            }
            None => {
                self.holders.insert(
                    holder,
                    HolderAccrual {
                        last_index: index,
                        accrued: U256::ZERO,
                    },
                );
            }
        }
        Ok(())
    }

    /// Zero the holder's accrued reward and return it
    pub fn take_accrued(&mut self, holder: Address) -> U256 {
        match self.holders.get_mut(&holder) {
            Some(entry) => std::mem::take(&mut entry.accrued),
            None => U256::ZERO,
        }
    }

    /// Old rate applies up to `now`, new rate afterwards
    pub fn set_emission_rate(&mut self, rate: U256, total_supply: U256, now: u64) -> FundResult<()> {
        self.update_global(total_supply, now)?;
        self.emission_rate = rate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn e18() -> U256 {
        pow10(18)
    }

    #[test]
    fn test_first_update_initializes() {
        let mut mining = MiningIndex::new(U256::from(1u8));
        mining.update_global(U256::ZERO, 42).unwrap();
        assert_eq!(mining.index(), index_scale());
        assert_eq!(mining.last_update(), 42);
    }

    #[test]
    fn test_hourly_emission_example() {
        // 1e14/sec, supply 1e18, one hour
        let rate = U256::from(100_000_000_000_000u64);
        let mut mining = MiningIndex::new(rate);
        let alice = holder(1);

        mining.update_global(U256::ZERO, 0).unwrap();
        mining.update_holder(alice, U256::ZERO).unwrap();

        mining.update_global(e18(), 3600).unwrap();
        let expected_delta = rate * U256::from(3600u64) * index_scale() / e18();
        assert_eq!(mining.index(), index_scale() + expected_delta);

        mining.update_holder(alice, e18()).unwrap();
        assert_eq!(mining.accrued(alice), rate * U256::from(3600u64));
    }

    #[test]
    fn test_first_observation_is_not_credited_retroactively() {
        let rate = U256::from(10u64);
        let mut mining = MiningIndex::new(rate);
        let (alice, bob) = (holder(1), holder(2));

        mining.update_global(U256::ZERO, 0).unwrap();
        mining.update_holder(alice, U256::ZERO).unwrap();
        mining.update_global(U256::from(100u64), 1000).unwrap();

        // Bob shows up late with a balance: nothing owed for the past
        mining.update_holder(bob, U256::from(50u64)).unwrap();
        assert_eq!(mining.accrued(bob), U256::ZERO);
        assert_eq!(mining.holder(bob).unwrap().last_index, mining.index());
    }

    #[test]
    fn test_idle_supply_advances_clock_without_accrual() {
        let rate = U256::from(1_000u64);
        let mut mining = MiningIndex::new(rate);
        let alice = holder(1);

        mining.update_global(U256::ZERO, 0).unwrap();
        mining.update_global(U256::ZERO, 100).unwrap();
        assert_eq!(mining.index(), index_scale());
        assert_eq!(mining.last_update(), 100);

        mining.update_holder(alice, U256::ZERO).unwrap();
        mining.update_global(U256::from(10u64), 200).unwrap();
        mining.update_holder(alice, U256::from(10u64)).unwrap();

        // Only the 100 seconds with supply count
        assert_eq!(mining.accrued(alice), U256::from(100_000u64));
    }

    #[test]
    fn test_take_resets_but_keeps_index() {
        let mut mining = MiningIndex::new(U256::from(5u64));
        let alice = holder(1);
        mining.update_global(U256::ZERO, 0).unwrap();
        mining.update_holder(alice, U256::ZERO).unwrap();
        mining.update_global(U256::from(1u64), 10).unwrap();
        mining.update_holder(alice, U256::from(1u64)).unwrap();

        let index = mining.index();
        assert_eq!(mining.take_accrued(alice), U256::from(50u64));
        assert_eq!(mining.accrued(alice), U256::ZERO);
        assert_eq!(mining.index(), index);
        assert_eq!(mining.take_accrued(holder(9)), U256::ZERO);
    }

    #[test]
    fn test_rate_change_applies_from_now() {
        let mut mining = MiningIndex::new(U256::from(2u64));
        let alice = holder(1);
        mining.update_global(U256::ZERO, 0).unwrap();
        mining.update_holder(alice, U256::ZERO).unwrap();

        let supply = U256::from(1u64);
        mining.update_global(supply, 0).unwrap();
        mining.set_emission_rate(U256::from(10u64), supply, 100).unwrap();
        mining.update_global(supply, 150).unwrap();
        mining.update_holder(alice, supply).unwrap();

        // 100s at 2/s + 50s at 10/s
        assert_eq!(mining.accrued(alice), U256::from(700u64));
    }
}
