//! Swap route encoding
//!
//! Wire format (Uniswap V3 router `bytes path`):
//! `token0 (20) | fee0 (3) | token1 (20) [| fee1 (3) | token2 (20)]`
//!
//! An empty byte string means "no route".

use alloy_primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{FundError, FundResult};

const ADDR_SIZE: usize = 20;
const FEE_SIZE: usize = 3;
const HOP_SIZE: usize = ADDR_SIZE + FEE_SIZE;

/// Direct or via exactly one bridge token
pub const MAX_HOPS: usize = 2;

/// Largest value a `uint24` fee field can carry
pub const MAX_FEE: u32 = (1 << 24) - 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwapPath {
    tokens: Vec<Address>,
    fees: Vec<u32>,
}

impl SwapPath {
    /// The "no route" path
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn direct(from: Address, fee: u32, to: Address) -> Self {
        Self {
            tokens: vec![from, to],
            fees: vec![fee],
        }
    }

    pub fn via(from: Address, fee_in: u32, bridge: Address, fee_out: u32, to: Address) -> Self {
        Self {
            tokens: vec![from, bridge, to],
            fees: vec![fee_in, fee_out],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn hop_count(&self) -> usize {
        self.fees.len()
    }

    pub fn tokens(&self) -> &[Address] {
        &self.tokens
    }

    pub fn fees(&self) -> &[u32] {
        &self.fees
    }

    pub fn first(&self) -> Option<Address> {
        self.tokens.first().copied()
    }

    pub fn last(&self) -> Option<Address> {
        self.tokens.last().copied()
    }

    /// (token_a, token_b, fee) for each hop, in path order
    pub fn hops(&self) -> impl Iterator<Item = (Address, Address, u32)> + '_ {
        self.tokens
            .windows(2)
            .zip(self.fees.iter())
            .map(|(pair, fee)| (pair[0], pair[1], *fee))
    }

    /// Same route, walked the other way
    pub fn reversed(&self) -> Self {
        let mut tokens = self.tokens.clone();
        let mut fees = self.fees.clone();
        tokens.reverse();
        fees.reverse();
        Self { tokens, fees }
    }

    pub fn encode(&self) -> Bytes {
        if self.is_empty() {
            return Bytes::new();
        }
        let mut out = Vec::with_capacity(ADDR_SIZE + HOP_SIZE * self.hop_count());
        out.extend_from_slice(self.tokens[0].as_slice());
        for (fee, token) in self.fees.iter().zip(self.tokens.iter().skip(1)) {
            out.extend_from_slice(&fee.to_be_bytes()[1..]);
            out.extend_from_slice(token.as_slice());
        }
        Bytes::from(out)
    }

    pub fn decode(raw: &[u8]) -> FundResult<Self> {
        if raw.is_empty() {
            return Ok(Self::empty());
        }
        if raw.len() < ADDR_SIZE + HOP_SIZE || (raw.len() - ADDR_SIZE) % HOP_SIZE != 0 {
            return Err(FundError::InvalidSwapPath(format!(
                "malformed length {}",
                raw.len()
            )));
        }

        let hop_count = (raw.len() - ADDR_SIZE) / HOP_SIZE;
        if hop_count > MAX_HOPS {
            return Err(FundError::InvalidSwapPath(format!(
                "{} hops, at most {} allowed",
                hop_count, MAX_HOPS
            )));
        }

        let mut tokens = vec![Address::from_slice(&raw[..ADDR_SIZE])];
        let mut fees = Vec::with_capacity(hop_count);
        for hop in 0..hop_count {
            let start = ADDR_SIZE + hop * HOP_SIZE;
            let fee = &raw[start..start + FEE_SIZE];
            fees.push(u32::from_be_bytes([0, fee[0], fee[1], fee[2]]));
            tokens.push(Address::from_slice(
                &raw[start + FEE_SIZE..start + HOP_SIZE],
            ));
        }

        Ok(Self { tokens, fees })
    }

    pub fn from_hex(s: &str) -> FundResult<Self> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| FundError::InvalidSwapPath(format!("bad hex: {}", e)))?;
        Self::decode(&raw)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.encode()))
    }

    /// Structural check plus exact endpoint match, run before any swap executes
    pub fn validate(&self, first: Address, last: Address) -> FundResult<()> {
        if self.is_empty() {
            return Err(FundError::InvalidSwapPath("no route".to_string()));
        }
        if self.hop_count() > MAX_HOPS || self.tokens.len() != self.fees.len() + 1 {
            return Err(FundError::InvalidSwapPath(format!(
                "bad hop structure ({} tokens, {} fees)",
                self.tokens.len(),
                self.fees.len()
            )));
        }
        if self.fees.iter().any(|fee| *fee > MAX_FEE) {
            return Err(FundError::InvalidSwapPath("fee exceeds uint24".to_string()));
        }
        if self.tokens.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(FundError::InvalidSwapPath("hop into same token".to_string()));
        }
        if self.first() != Some(first) || self.last() != Some(last) {
            return Err(FundError::InvalidSwapPath(format!(
                "endpoints {:?} -> {:?}, expected {} -> {}",
                self.first(),
                self.last(),
                first,
                last
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SwapPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<no route>");
        }
        write!(f, "{}", self.tokens[0])?;
        for (fee, token) in self.fees.iter().zip(self.tokens.iter().skip(1)) {
            write!(f, " -[{}]-> {}", fee, token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    #[test]
    fn test_encoding_layout() {
        let path = SwapPath::via(addr(1), 500, addr(2), 3000, addr(3));
        let raw = path.encode();

        assert_eq!(raw.len(), 20 + 23 * 2);
        assert_eq!(&raw[..20], addr(1).as_slice());
        // 500 = 0x0001f4
        assert_eq!(&raw[20..23], &[0x00, 0x01, 0xf4]);
        assert_eq!(&raw[23..43], addr(2).as_slice());
        // 3000 = 0x000bb8
        assert_eq!(&raw[43..46], &[0x00, 0x0b, 0xb8]);
        assert_eq!(&raw[46..], addr(3).as_slice());

        assert_eq!(SwapPath::decode(&raw).unwrap(), path);
        assert_eq!(SwapPath::from_hex(&path.to_hex()).unwrap(), path);
    }

    #[test]
    fn test_empty_path_means_no_route() {
        assert!(SwapPath::empty().encode().is_empty());
        assert!(SwapPath::decode(&[]).unwrap().is_empty());
        assert!(SwapPath::empty().validate(addr(1), addr(2)).is_err());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // Lone token, no hop
        assert!(SwapPath::decode(&[0u8; 20]).is_err());
        // Truncated fee
        assert!(SwapPath::decode(&[0u8; 42]).is_err());
        // Three hops
        assert!(SwapPath::decode(&[0u8; 20 + 23 * 3]).is_err());
    }

    #[test]
    fn test_validate_endpoints() {
        let path = SwapPath::direct(addr(1), 3000, addr(2));
        assert!(path.validate(addr(1), addr(2)).is_ok());
        assert!(matches!(
            path.validate(addr(2), addr(1)),
            Err(FundError::InvalidSwapPath(_))
        ));
        assert!(path.reversed().validate(addr(2), addr(1)).is_ok());

        let looped = SwapPath::direct(addr(1), 3000, addr(1));
        assert!(looped.validate(addr(1), addr(1)).is_err());
    }
}
