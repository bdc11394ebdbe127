// ============================================================================
// nla-oracle - natural-language arbitration oracle and local ledger tooling
// ============================================================================
// Usage:
//   nla-oracle init [--block-time-ms MS]           Create the local ledger file
//   nla-oracle run --address ADDR [--providers F]  Run the oracle until SIGINT/SIGTERM
//   nla-oracle escrow --from A --arbiter B ...     Create an escrow with a demand
//   nla-oracle fulfill --from A --escrow UID ...    Commit-reveal a fulfillment
//   nla-oracle collect --from A --escrow UID ...    Collect an approved escrow
//   nla-oracle status --fulfillment UID            Show recorded decisions
//   nla-oracle demand encode|decode                Demand codec utility
// ============================================================================

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use clap::{ArgGroup, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use arbiter_core::codec::{decode_demand, encode_demand, OBLIGATION_SCHEMA};
use arbiter_core::config::{DEFAULT_MAX_CONCURRENT_EVENTS, DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_SECS};
use arbiter_core::ledger::DEFAULT_BOND;
use arbiter_core::provider::DEFAULT_PROMPT_TEMPLATE;
use arbiter_core::{
    decisions_for, Address, ArbitrationLoop, BlockClock, CommitRevealCoordinator, Demand,
    EscrowTerms, EventFilter, EventTopic, FileLedger, Ledger, OracleConfig, OracleShell,
    ProviderDescriptor, ProviderRouter, Uid,
};

/// Natural-language arbitration oracle
#[derive(Parser)]
#[command(name = "nla-oracle", version, about = "Arbitrate escrow fulfillments with AI backends")]
struct Cli {
    /// Path to the ledger file (default: ~/.nla-oracle/ledger.redb)
    #[arg(long, global = true)]
    ledger_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local ledger file (no-op if it exists)
    Init {
        /// Block time in milliseconds; 0 mines every write immediately
        #[arg(long, default_value = "0")]
        block_time_ms: u64,

        /// Bond locked by each commit
        #[arg(long, default_value_t = DEFAULT_BOND)]
        bond: u128,
    },

    /// Run the oracle until SIGINT or SIGTERM
    Run {
        /// Arbiter identity the oracle decides as
        #[arg(long)]
        address: Address,

        #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS)]
        poll_interval_ms: u64,

        /// First block to scan
        #[arg(long, default_value = "0")]
        from_block: u64,

        /// Events arbitrated in parallel
        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_EVENTS)]
        concurrency: usize,

        /// Upper bound on a single AI backend call, in seconds
        #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
        request_timeout_secs: u64,

        /// JSON file with provider descriptors (default: from environment)
        #[arg(long)]
        providers: Option<PathBuf>,
    },

    /// Create an escrow carrying a natural-language demand
    Escrow {
        /// Depositor identity
        #[arg(long)]
        from: Address,

        /// Oracle allowed to decide on fulfillments
        #[arg(long)]
        arbiter: Address,

        #[arg(long, default_value = "OpenAI")]
        provider: String,

        #[arg(long)]
        model: String,

        /// Prompt template with {{demand}} and {{obligation}} placeholders
        #[arg(long)]
        template: Option<String>,

        /// The demand, in plain language
        #[arg(long)]
        demand: String,
    },

    /// Fulfill an escrow through commit-reveal
    Fulfill {
        #[arg(long)]
        from: Address,

        #[arg(long)]
        escrow: Uid,

        /// Obligation text submitted for arbitration
        #[arg(long)]
        item: String,
    },

    /// Collect an escrow after an approving decision
    Collect {
        #[arg(long)]
        from: Address,

        #[arg(long)]
        escrow: Uid,

        #[arg(long)]
        fulfillment: Uid,
    },

    /// Show decisions for a fulfillment, or for every fulfillment of an escrow
    #[command(group(ArgGroup::new("target").required(true).args(["fulfillment", "escrow"])))]
    Status {
        #[arg(long)]
        fulfillment: Option<Uid>,

        #[arg(long)]
        escrow: Option<Uid>,
    },

    /// Encode or decode demand bytes
    Demand {
        #[command(subcommand)]
        command: DemandCommand,
    },
}

#[derive(Subcommand)]
enum DemandCommand {
    /// Print the hex encoding of a demand
    Encode {
        #[arg(long)]
        provider: String,

        #[arg(long)]
        model: String,

        #[arg(long)]
        template: Option<String>,

        #[arg(long)]
        demand: String,
    },

    /// Decode hex demand bytes to JSON
    Decode {
        /// Hex string, 0x prefix optional
        hex: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nla_oracle=info".parse()?)
                .add_directive("arbiter_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let ledger_path = match cli.ledger_path {
        Some(path) => path,
        None => FileLedger::default_path()?,
    };

    match cli.command {
        Commands::Init { block_time_ms, bond } => cmd_init(&ledger_path, block_time_ms, bond),
        Commands::Run {
            address,
            poll_interval_ms,
            from_block,
            concurrency,
            request_timeout_secs,
            providers,
        } => {
            let config = OracleConfig {
                poll_interval_ms,
                start_block: from_block,
                max_concurrent_events: concurrency,
                request_timeout_secs,
                ..OracleConfig::new(address)
            };
            cmd_run(&ledger_path, config, providers.as_deref()).await
        }
        Commands::Escrow {
            from,
            arbiter,
            provider,
            model,
            template,
            demand,
        } => {
            let demand = build_demand(provider, model, template, demand);
            cmd_escrow(&ledger_path, from, arbiter, &demand).await
        }
        Commands::Fulfill { from, escrow, item } => {
            cmd_fulfill(&ledger_path, from, escrow, &item).await
        }
        Commands::Collect {
            from,
            escrow,
            fulfillment,
        } => cmd_collect(&ledger_path, from, escrow, fulfillment).await,
        Commands::Status {
            fulfillment,
            escrow,
        } => cmd_status(&ledger_path, fulfillment, escrow).await,
        Commands::Demand { command } => cmd_demand(command),
    }
}

fn build_demand(provider: String, model: String, template: Option<String>, demand: String) -> Demand {
    Demand {
        provider,
        model,
        prompt_template: template.unwrap_or_else(|| DEFAULT_PROMPT_TEMPLATE.to_string()),
        demand_text: demand,
    }
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn open_ledger(path: &Path) -> Result<Arc<FileLedger>> {
    Ok(Arc::new(FileLedger::open(path)?))
}

/// Provider descriptors from a JSON file, or from the environment:
/// OPENAI_API_KEY, ANTHROPIC_API_KEY (+ SEARCH_API_KEY),
/// OPENROUTER_API_KEY (+ OPENROUTER_BASE_URL)
fn load_providers(path: Option<&Path>) -> Result<Vec<ProviderDescriptor>> {
    if let Some(path) = path {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read providers file {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse providers file {}", path.display()));
    }

    let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
    let mut providers = Vec::new();

    if let Some(key) = env("OPENAI_API_KEY") {
        providers.push(ProviderDescriptor::new("OpenAI").with_api_key(key));
    }
    if let Some(key) = env("ANTHROPIC_API_KEY") {
        let mut descriptor = ProviderDescriptor::new("Anthropic").with_api_key(key);
        if let Some(search) = env("SEARCH_API_KEY") {
            descriptor = descriptor.with_auxiliary_key(search);
        }
        providers.push(descriptor);
    }
    if let Some(key) = env("OPENROUTER_API_KEY") {
        let mut descriptor = ProviderDescriptor::new("OpenRouter").with_api_key(key);
        if let Some(url) = env("OPENROUTER_BASE_URL") {
            descriptor = descriptor.with_base_url(url);
        }
        providers.push(descriptor);
    }
    Ok(providers)
}

fn cmd_init(path: &Path, block_time_ms: u64, bond: u128) -> Result<()> {
    let clock = if block_time_ms == 0 {
        BlockClock::instant()
    } else {
        BlockClock::interval(block_time_ms)
    };
    let ledger = FileLedger::init(path, clock, bond)?;
    println!("Ledger: {}", ledger.path().display());
    Ok(())
}

async fn cmd_run(path: &Path, config: OracleConfig, providers: Option<&Path>) -> Result<()> {
    let ledger = open_ledger(path)?;

    let mut router = ProviderRouter::new(config.request_timeout());
    for descriptor in load_providers(providers)? {
        let name = descriptor.name.clone();
        router
            .add_provider(descriptor)
            .with_context(|| format!("Failed to register provider {}", name))?;
    }

    let arbiter = ArbitrationLoop::new(ledger, Arc::new(router), config)
        .context("Set OPENAI_API_KEY, ANTHROPIC_API_KEY or OPENROUTER_API_KEY, or pass --providers")?;
    info!("Watching ledger {}", path.display());

    OracleShell::new(Arc::new(arbiter)).run_until_signal().await
}

async fn cmd_escrow(path: &Path, from: Address, arbiter: Address, demand: &Demand) -> Result<()> {
    demand.validate()?;
    let ledger = open_ledger(path)?;
    let escrow = ledger
        .create_escrow(
            &from,
            &EscrowTerms {
                arbiter,
                demand: encode_demand(demand),
            },
        )
        .await?;

    println!("Escrow:  {}", escrow.uid);
    println!("Arbiter: {}", arbiter);
    println!("Demand:  {}", demand.demand_text);
    Ok(())
}

async fn cmd_fulfill(path: &Path, from: Address, escrow: Uid, item: &str) -> Result<()> {
    let ledger = open_ledger(path)?;
    let coordinator = CommitRevealCoordinator::new(ledger, from);
    let receipt = coordinator.fulfill(&escrow, item).await?;

    println!("Fulfillment: {}", receipt.fulfillment.uid);
    println!("Commitment:  {} (block {})", receipt.commitment, receipt.commit_block);
    println!("Bond tx:     {}", receipt.bond_tx);
    Ok(())
}

async fn cmd_collect(path: &Path, from: Address, escrow: Uid, fulfillment: Uid) -> Result<()> {
    let ledger = open_ledger(path)?;
    let tx = ledger.collect(&from, &escrow, &fulfillment).await?;
    println!("Collected escrow {} (tx {})", escrow, tx);
    Ok(())
}

async fn cmd_status(path: &Path, fulfillment: Option<Uid>, escrow: Option<Uid>) -> Result<()> {
    let ledger = open_ledger(path)?;

    let fulfillments = match (fulfillment, escrow) {
        (Some(uid), _) => vec![uid],
        (None, Some(escrow)) => {
            let latest = ledger.latest_block().await?;
            let events = ledger
                .query_events(&EventFilter {
                    topic: EventTopic::Attested,
                    schema: Some(*OBLIGATION_SCHEMA),
                    from_block: 0,
                    to_block: latest,
                })
                .await?;
            println!("=== Escrow {} ===", escrow);
            events
                .into_iter()
                .filter(|e| e.ref_uid == escrow)
                .map(|e| e.uid)
                .collect()
        }
        (None, None) => anyhow::bail!("Pass --fulfillment or --escrow"),
    };

    if fulfillments.is_empty() {
        println!("No fulfillments found.");
        return Ok(());
    }

    for uid in fulfillments {
        let decisions = decisions_for(ledger.as_ref(), &uid).await?;
        if decisions.is_empty() {
            println!("{}  pending", uid);
            continue;
        }
        for (attestation, decision) in decisions {
            println!(
                "{}  {:5}  by {} at {}",
                uid,
                decision.decision,
                attestation.attester,
                format_timestamp(attestation.time)
            );
        }
    }
    Ok(())
}

fn cmd_demand(command: DemandCommand) -> Result<()> {
    match command {
        DemandCommand::Encode {
            provider,
            model,
            template,
            demand,
        } => {
            let demand = build_demand(provider, model, template, demand);
            println!("0x{}", hex::encode(encode_demand(&demand)));
        }
        DemandCommand::Decode { hex: input } => {
            let trimmed = input.trim();
            let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
            let bytes = hex::decode(digits).context("Invalid hex input")?;
            let demand = decode_demand(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&demand)?);
        }
    }
    Ok(())
}
