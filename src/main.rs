//! Basket - index-fund engine CLI
//!
//! Run with: cargo run -- <command>
//!
//! - `simulate <scenario.toml>` runs a scripted fund against the in-memory market
//! - `config` loads, validates and prints the fund configuration
//! - `paths`, `quote`, `targets` read live state over RPC

use alloy_primitives::utils::{parse_units, ParseUnits};
use alloy_primitives::Address;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use basket::chain::RpcMarket;
use basket::fund::rebalance;
use basket::interfaces::BalanceReader;
use basket::market::scenario::{Scenario, ScenarioRunner};
use basket::units::display_amount;
use basket::FundConfig;

#[derive(Parser, Debug)]
#[command(name = "basket")]
#[command(about = "Index-fund engine: invest, redeem, quote and rebalance a token basket")]
struct Args {
    /// TOML config file; environment / .env when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario script against the simulated market
    Simulate {
        scenario: PathBuf,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate and print the configuration
    Config {
        /// Write the resolved configuration to this TOML file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// List every route between two tokens
    Paths { token_a: String, token_b: String },

    /// Best route and amount for a swap
    Quote {
        token_in: String,
        token_out: String,
        /// Human units of token_in (or token_out with --exact-out)
        amount: String,

        #[arg(long)]
        exact_out: bool,
    },

    /// Current target values, bands and rebalance plan of the fund
    Targets,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 🧺 BASKET - Index Fund Engine").cyan().bold()
    );
    println!(
        "{}",
        style("    Basket Invest/Redeem | V3 Routing | Band Rebalancing").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn load_config(path: &Option<PathBuf>) -> Result<FundConfig> {
    let config = match path {
        Some(path) => FundConfig::from_file(path)?,
        None => FundConfig::from_env()?,
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your config file or .env");
        return Err(e);
    }
    Ok(config)
}

fn rpc_market(config: &FundConfig) -> Result<RpcMarket> {
    let market = RpcMarket::new(
        config.rpc_url.clone(),
        config.factory()?,
        config.quoter_contract()?,
        config.price_feed_addresses()?,
    )?;
    market.check_chain_id(config.chain_id)?;
    Ok(market)
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).map_err(|e| eyre!("Invalid address {}: {}", s, e))
}

fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let directive = if args.verbose { "basket=debug" } else { "basket=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    print_banner();

    match &args.command {
        Command::Simulate { scenario, json } => simulate(scenario, *json),
        Command::Config { save } => {
            let config = load_config(&args.config)?;
            config.print_summary();
            if let Some(path) = save {
                config.save_to_file(path)?;
                println!("{} Saved to {}", style("✓").green(), path.display());
            }
            Ok(())
        }
        Command::Paths { token_a, token_b } => {
            let config = load_config(&args.config)?;
            let market = rpc_market(&config)?;
            let quoter = config.path_quoter()?;
            let (a, b) = (parse_address(token_a)?, parse_address(token_b)?);

            let start = Instant::now();
            let paths = quoter.get_all_paths(&market, a, b);
            println!(
                "{} {} routes (of {} candidates) in {:?}",
                style("✓").green(),
                paths.len(),
                quoter.max_path_count(),
                start.elapsed()
            );
            for path in paths {
                println!("   {}  {}", path, style(path.to_hex()).dim());
            }
            Ok(())
        }
        Command::Quote {
            token_in,
            token_out,
            amount,
            exact_out,
        } => {
            let config = load_config(&args.config)?;
            let market = rpc_market(&config)?;
            let quoter = config.path_quoter()?;
            let (token_in, token_out) = (parse_address(token_in)?, parse_address(token_out)?);
            let decimals_in = market.decimals(token_in)?;
            let decimals_out = market.decimals(token_out)?;

            let fixed_decimals = if *exact_out { decimals_out } else { decimals_in };
            let amount = match parse_units(amount, fixed_decimals)
                .map_err(|e| eyre!("Invalid amount {}: {}", amount, e))?
            {
                ParseUnits::U256(a) => a,
                ParseUnits::I256(_) => return Err(eyre!("Amount must be positive")),
            };

            let quote = if *exact_out {
                quoter.quote_exact_out(&market, token_in, token_out, amount)
            } else {
                quoter.quote_exact_in(&market, token_in, token_out, amount)
            };
            if !quote.has_route() {
                println!("{} No route from {} to {}", style("✗").red(), token_in, token_out);
                return Ok(());
            }

            if *exact_out {
                println!(
                    "{} Pay {} for {}",
                    style("✓").green(),
                    display_amount(quote.amount, decimals_in),
                    display_amount(amount, decimals_out)
                );
            } else {
                println!(
                    "{} Receive {} for {}",
                    style("✓").green(),
                    display_amount(quote.amount, decimals_out),
                    display_amount(amount, decimals_in)
                );
            }
            println!("   Route: {}", quote.path);
            println!("   Encoded: {}", quote.path.to_hex());
            Ok(())
        }
        Command::Targets => {
            let config = load_config(&args.config)?;
            let market = rpc_market(&config)?;
            let now = unix_now();
            let state = config.build_state(now)?;

            println!("{}", style("═══ TARGETS ═══").blue().bold());
            for t in rebalance::target_values(&state, &market, now)? {
                let marker = if t.in_band() {
                    style("in band").green()
                } else {
                    style("out of band").yellow()
                };
                println!(
                    "  {}  {:>6.2}%  value {}  target {}  [{} .. {}]  {}",
                    t.token,
                    t.weight_ppm as f64 / 10_000.0,
                    t.value,
                    t.target,
                    t.lower,
                    t.upper,
                    marker
                );
            }

            println!();
            println!("{}", style("═══ PLAN ═══").magenta().bold());
            for leg in rebalance::compute_plan(&state, &market, now)? {
                println!("  {}  {}", leg.target.token, leg.swap_amount);
            }
            Ok(())
        }
    }
}

fn simulate(path: &Path, json: bool) -> Result<()> {
    let scenario = Scenario::from_file(path)?;
    info!("Loaded scenario '{}' from {}", scenario.name, path.display());

    let start = Instant::now();
    let mut runner = ScenarioRunner::new(scenario)?;
    let report = runner.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", style(format!("═══ SCENARIO: {} ═══", report.name)).green().bold());
    for step in &report.steps {
        let marker = if step.ok {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!(
            "{} [{:>3}] t={:<12} {:<18} {}",
            marker, step.index, step.time, step.action, step.detail
        );
    }

    println!();
    println!("   Total supply: {}", report.total_supply);
    for (symbol, reserve) in &report.reserves {
        println!("   {:<8} {}", symbol, reserve);
    }
    println!();
    println!(
        "{} {} steps, {} failed, in {:?}",
        style("✓").green(),
        report.steps.len(),
        report.failures(),
        start.elapsed()
    );
    Ok(())
}
