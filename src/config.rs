//! Fund Configuration
//!
//! Everything needed to stand up a fund: network endpoints, the basket,
//! routing sets, fee and rebalance parameters. Loadable from `.env` /
//! environment variables or from a TOML file, and validated once before use.
//!
//! Addresses and large amounts are kept as strings so the TOML stays human
//! editable; `validate()` proves they parse.

use alloy_primitives::{Address, U256};
use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::fund::{Constituent, FundParams, FundState};
use crate::router::{PathQuoter, DEFAULT_FEE_TIERS, MAX_FEE};
use crate::units::PPM;

// ============================================
// MAINNET DEFAULTS
// ============================================

const WETH: &str = "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2";
const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
const WBTC: &str = "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599";
const LINK: &str = "0x514910771AF9Ca656af840dff83E8264EcF986CA";

/// Uniswap V3 factory
const UNISWAP_V3_FACTORY: &str = "0x1F98431c8aD98523631AE4a59f267346ea31F984";
/// Uniswap V3 QuoterV2
const UNISWAP_V3_QUOTER_V2: &str = "0x61fFE014bA17989E743c5F6cB21bF9697530B21e";

/// Chainlink USD feeds (WBTC priced off BTC / USD)
const DEFAULT_PRICE_FEEDS: [(&str, &str); 4] = [
    (WETH, "0x5f4eC3Df9cbd43714FE2740f5E3616155c5b8419"),
    (WBTC, "0xF4030086522a5bEEa4988F8cA5B36dbC97BeE88c"),
    (LINK, "0x2c1d072e956AFFC0D435Cb7AC38EF18d24d9127c"),
    (USDC, "0x8fFfFfd4AfB6115b954Bd326cbe7B4BA576818f6"),
];

/// One basket entry as written in config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstituentConfig {
    pub token: String,
    pub weight_ppm: u32,
    /// Raw token units backing one whole share while supply is zero
    pub initial_amount_per_share: String,
}

/// Main configuration struct for a fund
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundConfig {
    // ========== Network Settings ==========
    pub rpc_url: String,

    /// Checked against the endpoint's `eth_chainId` before any RPC read
    pub chain_id: u64,

    /// Pool factory probed for pool existence
    pub factory_address: String,

    /// QuoterV2-style contract used for path quotes
    pub quoter_address: String,

    // ========== Fund Settings ==========
    /// Address holding the reserves
    pub fund_address: String,

    /// Settlement asset for rebalancing
    pub numeraire: String,

    pub fee_recipient: String,

    pub reward_token: String,

    pub share_decimals: u8,

    // ========== Routing ==========
    pub fee_tiers: Vec<u32>,

    pub bridge_tokens: Vec<String>,

    // ========== Fees ==========
    pub invest_fee_ppm: u32,

    pub redeem_fee_ppm: u32,

    /// Smallest share amount a single invest may mint
    pub min_mint_amount: String,

    // ========== Rebalance ==========
    /// Allowed drift from target value before a token is traded
    pub deviance_ppm: u32,

    pub rebalance_interval_secs: u64,

    /// Minimum-out tolerance on quoted rebalance swaps
    pub rebalance_slippage_ppm: u32,

    /// Oracle answers older than this are rejected (0 = never)
    pub max_price_age_secs: u64,

    pub rebalance_log: bool,

    pub rebalance_log_path: String,

    // ========== Rewards ==========
    /// Reward units emitted per second across all shares
    pub emission_rate: String,

    // ========== Tables ==========
    pub constituents: Vec<ConstituentConfig>,

    /// token -> aggregator
    pub price_feeds: BTreeMap<String, String>,
}

impl FundConfig {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            // Network
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            chain_id: match env::var("CHAIN_ID") {
                Ok(value) => value
                    .parse()
                    .map_err(|e| eyre!("Invalid CHAIN_ID {}: {}", value, e))?,
                Err(_) => defaults.chain_id,
            },
            factory_address: env::var("FACTORY_ADDRESS").unwrap_or(defaults.factory_address),
            quoter_address: env::var("QUOTER_ADDRESS").unwrap_or(defaults.quoter_address),

            // Fund
            fund_address: env::var("FUND_ADDRESS").unwrap_or(defaults.fund_address),
            numeraire: env::var("NUMERAIRE").unwrap_or(defaults.numeraire),
            fee_recipient: env::var("FEE_RECIPIENT").unwrap_or(defaults.fee_recipient),
            reward_token: env::var("REWARD_TOKEN").unwrap_or(defaults.reward_token),
            share_decimals: env::var("SHARE_DECIMALS")
                .unwrap_or_else(|_| "18".to_string())
                .parse()
                .unwrap_or(18),

            // Routing
            fee_tiers: env::var("FEE_TIERS")
                .map(|s| s.split(',').filter_map(|f| f.trim().parse().ok()).collect())
                .unwrap_or(defaults.fee_tiers),
            bridge_tokens: env::var("BRIDGE_TOKENS")
                .map(|s| split_list(&s))
                .unwrap_or(defaults.bridge_tokens),

            // Fees
            invest_fee_ppm: env::var("INVEST_FEE_PPM")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            redeem_fee_ppm: env::var("REDEEM_FEE_PPM")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            min_mint_amount: env::var("MIN_MINT_AMOUNT").unwrap_or(defaults.min_mint_amount),

            // Rebalance
            deviance_ppm: env::var("DEVIANCE_PPM")
                .unwrap_or_else(|_| "50000".to_string())
                .parse()
                .unwrap_or(50_000),
            rebalance_interval_secs: env::var("REBALANCE_INTERVAL_SECS")
                .unwrap_or_else(|_| "2592000".to_string()) // 30 days
                .parse()
                .unwrap_or(2_592_000),
            rebalance_slippage_ppm: env::var("REBALANCE_SLIPPAGE_PPM")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .unwrap_or(5_000),
            max_price_age_secs: env::var("MAX_PRICE_AGE_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .unwrap_or(86_400),
            rebalance_log: env::var("REBALANCE_LOG")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            rebalance_log_path: env::var("REBALANCE_LOG_PATH")
                .unwrap_or(defaults.rebalance_log_path),

            // Rewards
            emission_rate: env::var("EMISSION_RATE").unwrap_or(defaults.emission_rate),

            // Tables
            constituents: match env::var("CONSTITUENTS") {
                Ok(s) => parse_constituents(&s)?,
                Err(_) => defaults.constituents,
            },
            price_feeds: match env::var("PRICE_FEEDS") {
                Ok(s) => parse_price_feeds(&s)?,
                Err(_) => defaults.price_feeds,
            },
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate before any fund is built from this config
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() || self.rpc_url.contains("YOUR_API_KEY") {
            return Err(eyre!("Invalid RPC_URL - please set a valid endpoint"));
        }
        if self.chain_id == 0 {
            return Err(eyre!("CHAIN_ID must be nonzero"));
        }

        for (field, value) in [
            ("factory_address", &self.factory_address),
            ("quoter_address", &self.quoter_address),
            ("fund_address", &self.fund_address),
            ("numeraire", &self.numeraire),
            ("fee_recipient", &self.fee_recipient),
            ("reward_token", &self.reward_token),
        ] {
            parse_address(field, value)?;
        }
        parse_amount("min_mint_amount", &self.min_mint_amount)?;
        parse_amount("emission_rate", &self.emission_rate)?;

        if self.constituents.is_empty() {
            return Err(eyre!("At least one constituent is required"));
        }
        let constituents = self.constituents()?;
        let mut seen = HashSet::new();
        for c in &constituents {
            if !seen.insert(c.token) {
                return Err(eyre!("Duplicate constituent {}", c.token));
            }
        }
        let weight_sum: u64 = constituents.iter().map(|c| c.weight_ppm as u64).sum();
        if weight_sum != PPM as u64 {
            return Err(eyre!(
                "Constituent weights sum to {} ppm, expected {}",
                weight_sum,
                PPM
            ));
        }

        for (field, value) in [
            ("invest_fee_ppm", self.invest_fee_ppm),
            ("redeem_fee_ppm", self.redeem_fee_ppm),
            ("deviance_ppm", self.deviance_ppm),
            ("rebalance_slippage_ppm", self.rebalance_slippage_ppm),
        ] {
            if value > PPM {
                return Err(eyre!("{} must be at most {} (currently {})", field, PPM, value));
            }
        }

        if self.fee_tiers.is_empty() {
            return Err(eyre!("At least one fee tier is required"));
        }
        if let Some(fee) = self.fee_tiers.iter().find(|f| **f > MAX_FEE) {
            return Err(eyre!("Fee tier {} does not fit in uint24", fee));
        }
        self.bridge_token_addresses()?;
        self.price_feed_addresses()?;

        if self.share_decimals > 36 {
            return Err(eyre!("SHARE_DECIMALS above 36 is not supported"));
        }
        if self.rebalance_interval_secs == 0 {
            return Err(eyre!("REBALANCE_INTERVAL_SECS must be positive"));
        }

        Ok(())
    }

    pub fn constituents(&self) -> Result<Vec<Constituent>> {
        self.constituents
            .iter()
            .map(|c| {
                Ok(Constituent {
                    token: parse_address("constituent", &c.token)?,
                    weight_ppm: c.weight_ppm,
                    initial_amount_per_share: parse_amount(
                        "initial_amount_per_share",
                        &c.initial_amount_per_share,
                    )?,
                })
            })
            .collect()
    }

    pub fn bridge_token_addresses(&self) -> Result<Vec<Address>> {
        self.bridge_tokens
            .iter()
            .map(|s| parse_address("bridge_tokens", s))
            .collect()
    }

    pub fn price_feed_addresses(&self) -> Result<HashMap<Address, Address>> {
        self.price_feeds
            .iter()
            .map(|(token, feed)| {
                Ok((
                    parse_address("price_feeds", token)?,
                    parse_address("price_feeds", feed)?,
                ))
            })
            .collect()
    }

    pub fn factory(&self) -> Result<Address> {
        parse_address("factory_address", &self.factory_address)
    }

    pub fn quoter_contract(&self) -> Result<Address> {
        parse_address("quoter_address", &self.quoter_address)
    }

    pub fn path_quoter(&self) -> Result<PathQuoter> {
        Ok(PathQuoter::new(
            self.fee_tiers.clone(),
            self.bridge_token_addresses()?,
        ))
    }

    pub fn to_params(&self) -> Result<FundParams> {
        Ok(FundParams {
            address: parse_address("fund_address", &self.fund_address)?,
            numeraire: parse_address("numeraire", &self.numeraire)?,
            fee_recipient: parse_address("fee_recipient", &self.fee_recipient)?,
            reward_token: parse_address("reward_token", &self.reward_token)?,
            share_decimals: self.share_decimals,
            invest_fee_ppm: self.invest_fee_ppm,
            redeem_fee_ppm: self.redeem_fee_ppm,
            deviance_ppm: self.deviance_ppm,
            rebalance_interval: self.rebalance_interval_secs,
            rebalance_slippage_ppm: self.rebalance_slippage_ppm,
            max_price_age: self.max_price_age_secs,
            min_mint_amount: parse_amount("min_mint_amount", &self.min_mint_amount)?,
            emission_rate: parse_amount("emission_rate", &self.emission_rate)?,
        })
    }

    /// Validated fund state; `now` starts the rebalance clock
    pub fn build_state(&self, now: u64) -> Result<FundState> {
        self.validate()?;
        FundState::new(self.to_params()?, self.path_quoter()?, &self.constituents()?, now)
            .wrap_err("Invalid fund parameters")
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║                 BASKET - CONFIGURATION                     ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ Chain ID:          {:^40} ║", self.chain_id);
        println!("║ Fund:              {:^40} ║", short(&self.fund_address));
        println!("║ Numeraire:         {:^40} ║", short(&self.numeraire));
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ BASKET                                                     ║");
        for c in &self.constituents {
            println!(
                "║ • {:<22} {:>14.2}% {:>18} ║",
                short(&c.token),
                c.weight_ppm as f64 / 10_000.0,
                ""
            );
        }
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ ROUTING                                                    ║");
        println!("║ • Fee Tiers:       {:^40} ║", format!("{:?}", self.fee_tiers));
        println!("║ • Bridge Tokens:   {:^40} ║", self.bridge_tokens.len());
        println!("║ • Price Feeds:     {:^40} ║", self.price_feeds.len());
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ FEES & REBALANCE                                           ║");
        println!("║ • Invest Fee:      {:>38.2}% ║", self.invest_fee_ppm as f64 / 10_000.0);
        println!("║ • Redeem Fee:      {:>38.2}% ║", self.redeem_fee_ppm as f64 / 10_000.0);
        println!("║ • Deviance:        {:>38.2}% ║", self.deviance_ppm as f64 / 10_000.0);
        println!("║ • Slippage:        {:>38.2}% ║", self.rebalance_slippage_ppm as f64 / 10_000.0);
        println!("║ • Interval:        {:>36} s ║", self.rebalance_interval_secs);
        println!("║ • Max Price Age:   {:>36} s ║", self.max_price_age_secs);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ LOGGING                                                    ║");
        println!("║ • Rebalance Log:   {:^40} ║",
            if self.rebalance_log { "✓ Enabled" } else { "✗ Disabled" }
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

impl Default for FundConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://eth.llamarpc.com".to_string(),
            chain_id: 1,
            factory_address: UNISWAP_V3_FACTORY.to_string(),
            quoter_address: UNISWAP_V3_QUOTER_V2.to_string(),
            fund_address: Address::ZERO.to_string(),
            numeraire: USDC.to_string(),
            fee_recipient: Address::ZERO.to_string(),
            reward_token: Address::ZERO.to_string(),
            share_decimals: 18,
            fee_tiers: DEFAULT_FEE_TIERS.to_vec(),
            bridge_tokens: vec![WETH.to_string(), USDC.to_string()],
            invest_fee_ppm: 0,
            redeem_fee_ppm: 0,
            min_mint_amount: "0".to_string(),
            deviance_ppm: 50_000,
            rebalance_interval_secs: 2_592_000,
            rebalance_slippage_ppm: 5_000,
            max_price_age_secs: 86_400,
            rebalance_log: true,
            rebalance_log_path: "./logs/rebalances.jsonl".to_string(),
            emission_rate: "0".to_string(),
            constituents: vec![
                ConstituentConfig {
                    token: WETH.to_string(),
                    weight_ppm: 400_000,
                    initial_amount_per_share: "1000000000000000".to_string(), // 0.001 WETH
                },
                ConstituentConfig {
                    token: WBTC.to_string(),
                    weight_ppm: 300_000,
                    initial_amount_per_share: "5000".to_string(), // 0.00005 WBTC
                },
                ConstituentConfig {
                    token: LINK.to_string(),
                    weight_ppm: 300_000,
                    initial_amount_per_share: "200000000000000000".to_string(), // 0.2 LINK
                },
            ],
            price_feeds: DEFAULT_PRICE_FEEDS
                .iter()
                .map(|(token, feed)| (token.to_string(), feed.to_string()))
                .collect(),
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// `token:weight_ppm:initial,token:weight_ppm:initial`
fn parse_constituents(s: &str) -> Result<Vec<ConstituentConfig>> {
    split_list(s)
        .iter()
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            match parts.as_slice() {
                [token, weight, initial] => Ok(ConstituentConfig {
                    token: token.to_string(),
                    weight_ppm: weight
                        .parse()
                        .wrap_err_with(|| format!("Bad weight in CONSTITUENTS entry {}", entry))?,
                    initial_amount_per_share: initial.to_string(),
                }),
                _ => Err(eyre!(
                    "CONSTITUENTS entry {} should be token:weight_ppm:initial_amount",
                    entry
                )),
            }
        })
        .collect()
}

/// `token:feed,token:feed`
fn parse_price_feeds(s: &str) -> Result<BTreeMap<String, String>> {
    split_list(s)
        .iter()
        .map(|entry| match entry.split_once(':') {
            Some((token, feed)) => Ok((token.trim().to_string(), feed.trim().to_string())),
            None => Err(eyre!("PRICE_FEEDS entry {} should be token:feed", entry)),
        })
        .collect()
}

fn parse_address(field: &str, value: &str) -> Result<Address> {
    Address::from_str(value.trim()).wrap_err_with(|| format!("Invalid {}: {}", field, value))
}

fn parse_amount(field: &str, value: &str) -> Result<U256> {
    U256::from_str(value.trim()).wrap_err_with(|| format!("Invalid {}: {}", field, value))
}

fn short(address: &str) -> String {
    if address.len() > 14 {
        format!("{}…{}", &address[..8], &address[address.len() - 4..])
    } else {
        address.to_string()
    }
}

// ============================================
// TESTS
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FundConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fee_tiers, vec![500, 3000, 10000]);

        let state = config.build_state(0).unwrap();
        assert_eq!(state.tokens().len(), 3);
        assert_eq!(state.weight_sum(), 1_000_000);
        assert_eq!(state.quoter().bridge_tokens().len(), 2);
        assert_eq!(config.price_feed_addresses().unwrap().len(), 4);
    }

    #[test]
    fn test_weights_must_sum_to_one_million() {
        let mut config = FundConfig::default();
        config.constituents[0].weight_ppm = 300_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("900000"));
    }

    #[test]
    fn test_rejects_bad_fields() {
        let mut config = FundConfig::default();
        config.numeraire = "0x1234".to_string();
        assert!(config.validate().is_err());

        let mut config = FundConfig::default();
        config.redeem_fee_ppm = 1_000_001;
        assert!(config.validate().is_err());

        let mut config = FundConfig::default();
        config.constituents[1].token = config.constituents[0].token.clone();
        assert!(config.validate().is_err());

        let mut config = FundConfig::default();
        config.fee_tiers = vec![1 << 24];
        assert!(config.validate().is_err());

        let mut config = FundConfig::default();
        config.chain_id = 0;
        assert!(config.validate().unwrap_err().to_string().contains("CHAIN_ID"));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = FundConfig::default();
        let path = std::env::temp_dir().join(format!("basket-config-{}.toml", std::process::id()));
        config.save_to_file(&path).unwrap();
        let loaded = FundConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_parse_env_lists() {
        let parsed = parse_constituents(&format!("{}:600000:1000, {}:400000:7", WETH, LINK)).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].weight_ppm, 400_000);
        assert_eq!(parsed[1].initial_amount_per_share, "7");
        assert!(parse_constituents("0xabc:notanumber:1").is_err());
        assert!(parse_constituents("0xabc:1").is_err());

        let feeds = parse_price_feeds(&format!("{}:{}", WETH, USDC)).unwrap();
        assert_eq!(feeds.get(WETH).map(String::as_str), Some(USDC));
    }
}
