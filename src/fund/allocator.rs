//! Proportional Allocator
//!
//! Share amount -> per-token amounts against live reserves. Deposits round
//! up and withdrawals round down, so rounding always favours the fund.

use alloy_primitives::{Address, U256};

use super::FundState;
use crate::error::{FundError, FundResult};
use crate::interfaces::BalanceReader;
use crate::units::{mul_div, mul_div_up};

/// (token, amount) in basket order
pub type BasketAmounts = Vec<(Address, U256)>;

/// Amounts owed to mint `mint_amount` shares
pub fn invest_amounts<L: BalanceReader + ?Sized>(
    state: &FundState,
    ledger: &L,
    mint_amount: U256,
) -> FundResult<BasketAmounts> {
    let supply = state.total_supply();
    let one_share = state.params().one_share();

    state
        .tokens()
        .iter()
        .map(|&token| {
            let amount = if supply.is_zero() {
                mul_div_up(mint_amount, state.initial_amount(token), one_share)?
            } else {
                let reserve = ledger.balance_of(token, state.address())?;
                mul_div_up(reserve, mint_amount, supply)?
            };
            Ok((token, amount))
        })
        .collect()
}

/// Amounts paid out for burning `burn_amount` shares, after the redeem fee
pub fn redeem_amounts<L: BalanceReader + ?Sized>(
    state: &FundState,
    ledger: &L,
    burn_amount: U256,
) -> FundResult<BasketAmounts> {
    let supply = state.total_supply();
    if burn_amount > supply {
        return Err(FundError::InsufficientShares {
            holder: Address::ZERO,
            balance: supply,
            requested: burn_amount,
        });
    }
    let redeemable = burn_amount - state.redeem_fee(burn_amount)?;

    state
        .tokens()
        .iter()
        .map(|&token| {
            let amount = if redeemable.is_zero() {
                U256::ZERO
            } else {
                let reserve = ledger.balance_of(token, state.address())?;
                mul_div(reserve, redeemable, supply)?
            };
            Ok((token, amount))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fund::state::tests::params;
    use crate::fund::Constituent;
    use crate::router::PathQuoter;
    use std::collections::HashMap;

    struct Reserves(HashMap<(Address, Address), U256>);

    impl BalanceReader for Reserves {
        fn balance_of(&self, token: Address, holder: Address) -> FundResult<U256> {
            Ok(self.0.get(&(token, holder)).copied().unwrap_or_default())
        }

        fn decimals(&self, _: Address) -> FundResult<u8> {
            Ok(18)
        }
    }

    fn token(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn fund(redeem_fee_ppm: u32) -> FundState {
        let mut p = params();
        p.redeem_fee_ppm = redeem_fee_ppm;
        let constituents = [
            Constituent {
                token: token(1),
                weight_ppm: 500_000,
                initial_amount_per_share: U256::from(333_333_333_333_333_333u64),
            },
            Constituent {
                token: token(2),
                weight_ppm: 500_000,
                initial_amount_per_share: U256::from(2_000_000u64),
            },
        ];
        FundState::new(p, PathQuoter::default(), &constituents, 0).unwrap()
    }

    #[test]
    fn test_initial_invest_uses_per_share_amounts_rounded_up() {
        let state = fund(0);
        let reserves = Reserves(HashMap::new());

        // 1.5 shares of 0.333.. is 0.4999..995, rounded up to 0.5
        let mint = U256::from(1_500_000_000_000_000_000u64);
        let amounts = invest_amounts(&state, &reserves, mint).unwrap();
        assert_eq!(amounts[0], (token(1), U256::from(500_000_000_000_000_000u64)));
        assert_eq!(amounts[1], (token(2), U256::from(3_000_000u64)));

        // 1 wei of a share still owes something of every token
        let amounts = invest_amounts(&state, &reserves, U256::from(1u8)).unwrap();
        assert!(amounts.iter().all(|(_, a)| !a.is_zero()));
    }

    #[test]
    fn test_invest_rounds_up_and_redeem_rounds_down() {
        let mut state = fund(0);
        let holder = token(0xA1);
        state.mint_shares(holder, U256::from(3u64), 0).unwrap();

        let mut balances = HashMap::new();
        balances.insert((token(1), state.address()), U256::from(10u64));
        balances.insert((token(2), state.address()), U256::from(9u64));
        let reserves = Reserves(balances);

        // 10 * 1 / 3 = 3.33.. ; 9 * 1 / 3 = 3 exactly
        let invest = invest_amounts(&state, &reserves, U256::from(1u64)).unwrap();
        assert_eq!(invest, vec![(token(1), U256::from(4u64)), (token(2), U256::from(3u64))]);

        let redeem = redeem_amounts(&state, &reserves, U256::from(1u64)).unwrap();
        assert_eq!(redeem, vec![(token(1), U256::from(3u64)), (token(2), U256::from(3u64))]);

        for ((_, deposit), (_, withdrawal)) in invest.iter().zip(&redeem) {
            assert!(deposit >= withdrawal);
        }
    }

    #[test]
    fn test_redeem_fee_is_withheld() {
        // 1% fee
        let mut state = fund(10_000);
        let holder = token(0xA1);
        state.mint_shares(holder, U256::from(1_000u64), 0).unwrap();

        let mut balances = HashMap::new();
        balances.insert((token(1), state.address()), U256::from(1_000u64));
        balances.insert((token(2), state.address()), U256::from(500u64));
        let reserves = Reserves(balances);

        // burn 100, fee 1 -> 99 redeemable
        let redeem = redeem_amounts(&state, &reserves, U256::from(100u64)).unwrap();
        assert_eq!(redeem[0].1, U256::from(99u64));
        assert_eq!(redeem[1].1, U256::from(49u64));

        assert!(redeem_amounts(&state, &reserves, U256::from(1_001u64)).is_err());
    }
}
