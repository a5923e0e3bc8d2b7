//! Timegate: timelocked multi-branch Bitcoin vaults from a single seed
//!
//! Every run derives the role keys, fixes an origin height and compiles the
//! configured policy to a P2WSH address; the command then reports on it or
//! spends from it through one branch.
//!
//! # Usage
//!
//! ```bash
//! timegate --config timegate.toml descriptor
//! timegate --origin-height 84000 status
//! timegate --origin-height 84000 spend recovery
//! ```

mod config;
mod session;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use timegate_core::Seed;
use timegate_esplora::{BroadcastOutcome, EsploraClient};
use timegate_policy::authorization::ApproxDuration;

use crate::session::Session;

const DEFAULT_CONFIG: &str = "timegate.toml";

enum Command {
    Descriptor,
    Keys,
    Status,
    Utxos,
    Spend(String),
}

fn main() -> Result<()> {
    // Parse CLI args (minimal, no clap)
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut origin_height: Option<u32> = None;
    let mut command: Option<Command> = None;
    let mut generate_mnemonic = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = Some(PathBuf::from(&args[i]));
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--origin-height" => {
                i += 1;
                let value = args
                    .get(i)
                    .context("--origin-height requires a block height")?;
                origin_height = Some(
                    value
                        .parse()
                        .with_context(|| format!("Invalid origin height: {}", value))?,
                );
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("timegate {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "descriptor" => command = Some(Command::Descriptor),
            "keys" => command = Some(Command::Keys),
            "status" => command = Some(Command::Status),
            "utxos" => command = Some(Command::Utxos),
            "generate-mnemonic" => generate_mnemonic = true,
            "spend" => {
                i += 1;
                let branch = args.get(i).context("spend requires a branch name")?;
                command = Some(Command::Spend(branch.clone()));
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    // Needs no config or network
    if generate_mnemonic {
        let mnemonic =
            timegate_core::generate_mnemonic().context("Failed to generate mnemonic")?;
        println!("{}", mnemonic);
        return Ok(());
    }

    let Some(command) = command else {
        print_help();
        return Ok(());
    };

    // Load config; a missing default file falls back to defaults + env
    let mut config = match config_path {
        Some(path) => config::Config::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let path = PathBuf::from(DEFAULT_CONFIG);
            if path.exists() {
                config::Config::from_file(&path)?
            } else {
                config::Config::default()
            }
        }
    };

    // Init logger first so override warnings are seen
    let log_level = std::env::var("TIMEGATE_LOG_LEVEL")
        .unwrap_or_else(|_| config.session.log_level.clone());
    std::env::set_var("RUST_LOG", &log_level);
    env_logger::init();

    config.apply_env_overrides();

    config
        .validate()
        .context("Configuration validation failed")?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run(&config, origin_height, command))
}

async fn run(config: &config::Config, origin_height: Option<u32>, command: Command) -> Result<()> {
    let network = config.network();
    let explorer = config.explorer_url()?;
    let client = EsploraClient::new(&explorer, config.bitcoin.timeout_secs)
        .with_context(|| format!("Failed to create explorer client for {}", explorer))?;

    let seed = Seed::from_phrase(&config.seed.mnemonic, &config.seed.passphrase)
        .context("Invalid seed mnemonic")?;
    let session = Session::init(
        Arc::new(client),
        &seed,
        config.scheme()?,
        network,
        origin_height,
    )
    .await?;

    let policy = session.policy();

    match command {
        Command::Descriptor => {
            println!("Variant:       {}", policy.variant());
            println!("Network:       {}", config.bitcoin.network);
            println!(
                "Origin:        {} ({})",
                session.origin_height(),
                session.origin_time()
            );
            println!("Policy:        {}", policy.expression());
            println!("Miniscript:    {}", policy.miniscript());
            println!("Descriptor:    {}", policy.descriptor());
            println!("Address:       {}", policy.address());
            for branch in session.scheme().branches() {
                match policy.locktime(branch.name()) {
                    Some(lt) => println!("  {:<12} locktime {}", branch.name(), lt),
                    None => println!("  {:<12} no locktime", branch.name()),
                }
            }
        }
        Command::Keys => {
            println!("Master fingerprint: {}", session.fingerprint());
            for pair in session.public_keys() {
                println!("{}:", pair.role());
                println!("  xpub: {}", pair.xpub());
                println!("  key:  {}", pair.descriptor_key());
            }
        }
        Command::Status => {
            let (height, statuses) = session.status().await?;
            println!(
                "Tip {}  |  origin {}  |  {}",
                height,
                session.origin_height(),
                policy.address()
            );
            for status in statuses {
                println!("  {}", status);
            }
        }
        Command::Utxos => {
            let utxos = session.utxos().await?;
            if utxos.is_empty() {
                println!("No UTXOs at {}", policy.address());
            }
            let mut total = bitcoin::Amount::ZERO;
            for utxo in &utxos {
                let state = match utxo.height {
                    Some(h) => format!("confirmed at {}", h),
                    None => "unconfirmed".to_string(),
                };
                println!("  {}  {}  {}", utxo.outpoint, utxo.value, state);
                total += utxo.value;
            }
            println!("Total: {}", total);
        }
        Command::Spend(branch) => {
            let destination = config.destination()?;
            let report = session.spend(&seed, &branch, &destination, config.fee()).await?;
            println!(
                "Spending {} via {} to {} ({} fee)",
                report.spend.outpoint, report.spend.branch, destination, report.spend.fee
            );
            match report.outcome {
                BroadcastOutcome::Accepted(txid) => {
                    println!("✓ Broadcast accepted: {}", txid);
                }
                BroadcastOutcome::PrematureLocktime { detail } => {
                    println!(
                        "⏳ Locktime not reached: {} blocks remaining ({})",
                        report.status.remaining,
                        ApproxDuration(report.status.remaining)
                    );
                    log::debug!("node response: {}", detail);
                }
                BroadcastOutcome::OtherRejection(reason) => {
                    anyhow::bail!("Broadcast rejected: {}", reason);
                }
            }
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"Timegate: timelocked multi-branch Bitcoin vaults

USAGE:
    timegate [OPTIONS] <COMMAND>

COMMANDS:
    descriptor            Show policy, descriptor, address and branch locktimes
    keys                  Show master fingerprint and per-role xpubs
    status                Show which branches are spendable at the current tip
    utxos                 List UTXOs at the policy address, oldest first
    spend <BRANCH>        Spend the oldest UTXO through a branch and broadcast
    generate-mnemonic     Print a fresh 12-word BIP-39 mnemonic

OPTIONS:
    -c, --config <PATH>     Config file path (default: ./timegate.toml)
    --origin-height <H>     Pin the origin height instead of using the tip
    -h, --help              Show this help message
    -V, --version           Show version

ENVIRONMENT VARIABLES (override config file):
    TIMEGATE_LOG_LEVEL      Log level (error/warn/info/debug/trace)
    TIMEGATE_NETWORK        Bitcoin network (bitcoin/testnet/testnet4/signet/regtest)
    TIMEGATE_EXPLORER_URL   Esplora base URL
    TIMEGATE_MNEMONIC       BIP-39 mnemonic
    TIMEGATE_PASSPHRASE     BIP-39 passphrase
    TIMEGATE_VARIANT        Policy variant (self-custody/vault/inheritance)
    TIMEGATE_FEE_SATS       Fixed fee in satoshis
    TIMEGATE_DESTINATION    Spend destination address

EXAMPLES:
    # New seed, then look at the vault it produces
    timegate generate-mnemonic
    TIMEGATE_MNEMONIC="..." timegate descriptor

    # Revisit the same address later
    timegate --origin-height 84000 status
    timegate --origin-height 84000 spend recovery
"#
    );
}
