//! Diagnostic tool - Check fund configuration
//!
//! Run with: cargo run --bin diagnose

use basket::FundConfig;
use std::env;

fn main() {
    println!("🔍 BASKET DIAGNOSTIC CHECK\n");

    // Load .env
    dotenvy::dotenv().ok();

    println!("═══════════════════════════════════════════════════");
    println!("                  CONFIGURATION                     ");
    println!("═══════════════════════════════════════════════════\n");

    let checks = [
        ("NUMERAIRE", "USDC", "Settlement asset for rebalancing"),
        ("CONSTITUENTS", "WETH/WBTC/LINK 40/30/30", "Basket token:weight:initial"),
        ("DEVIANCE_PPM", "50000", "Band around each target value"),
        ("REBALANCE_INTERVAL_SECS", "2592000", "Seconds between rebalances"),
        ("REBALANCE_SLIPPAGE_PPM", "5000", "Tolerance on rebalance swaps"),
        ("MAX_PRICE_AGE_SECS", "86400", "Oldest acceptable oracle answer"),
        ("INVEST_FEE_PPM", "0", "Fee on minted shares"),
        ("REDEEM_FEE_PPM", "0", "Fee on burned shares"),
        ("REBALANCE_LOG", "true", "Log rebalance reports?"),
    ];

    for (key, default, desc) in checks {
        let value = env::var(key).unwrap_or_else(|_| default.to_string());
        let is_default = env::var(key).is_err();
        let marker = if is_default { "(default)" } else { "(from .env)" };
        println!("  {}: {} {}", key, value, marker);
        println!("    └─ {}\n", desc);
    }

    // RPC check
    let rpc = env::var("RPC_URL").unwrap_or_else(|_| "NOT SET".to_string());
    let rpc_display = if rpc.len() > 50 {
        format!("{}...{}", &rpc[..30], &rpc[rpc.len() - 15..])
    } else {
        rpc.clone()
    };
    println!("  RPC_URL: {}", rpc_display);

    let fund = env::var("FUND_ADDRESS").is_ok();
    let recipient = env::var("FEE_RECIPIENT").is_ok();
    let feeds = env::var("PRICE_FEEDS").is_ok();

    println!("\n═══════════════════════════════════════════════════");
    println!("                   FUND ADDRESSES                   ");
    println!("═══════════════════════════════════════════════════\n");

    println!("  FUND_ADDRESS:   {}", if fund { "✅ Set" } else { "❌ Not set" });
    println!("  FEE_RECIPIENT:  {}", if recipient { "✅ Set" } else { "❌ Not set" });
    println!("  PRICE_FEEDS:    {}", if feeds { "✅ Set" } else { "➖ Mainnet defaults" });

    println!("\n═══════════════════════════════════════════════════");
    println!("                     STATUS                         ");
    println!("═══════════════════════════════════════════════════\n");

    let config = match FundConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            println!("  ❌ Could not load configuration: {}", e);
            return;
        }
    };

    match config.validate() {
        Ok(()) => {
            println!("  ✅ Configuration valid");
            println!("     → {} constituents", config.constituents.len());
            println!("     → {} bridge tokens, {} fee tiers", config.bridge_tokens.len(), config.fee_tiers.len());
            let quoter = config.path_quoter().map(|q| q.max_path_count()).unwrap_or(0);
            println!("     → Up to {} candidate routes per pair", quoter);
        }
        Err(e) => {
            println!("  ❌ {}", e);
        }
    }

    let unpriced: Vec<&str> = config
        .constituents
        .iter()
        .filter(|c| {
            !config
                .price_feeds
                .keys()
                .any(|token| token.eq_ignore_ascii_case(&c.token))
        })
        .map(|c| c.token.as_str())
        .collect();
    if !unpriced.is_empty() {
        println!("\n  ⚠️  Constituents without a price feed:");
        for token in unpriced {
            println!("     • {}", token);
        }
        println!("     Rebalancing will abort until every constituent is priced.");
    }

    if config.max_price_age_secs == 0 {
        println!("\n  ⚠️  MAX_PRICE_AGE_SECS = 0 disables the staleness check.");
    }

    println!("\n✅ Diagnostic complete!\n");
}
