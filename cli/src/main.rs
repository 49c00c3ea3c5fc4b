//! txlistener CLI: tail ordered transaction receipts from an EVM node.
//!
//! Usage:
//! ```bash
//! # Tail chain 1 from the latest safe block, one JSON receipt per line
//! txlistener tail --url https://cloudflare-eth.com --chain 1 --start latest
//!
//! # Check start position strings
//! txlistener positions 0x2a:2348721-5 1:latest
//!
//! # Validate a config file
//! txlistener config listener.json
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use txlistener_core::{
    parse_position, ChainId, ListenerConfig, MemoryPositionStore, PositionResolver, RetryConfig,
    RetryingReader, StartPosition,
};
use txlistener_evm::{EvmChainReader, HttpTransport};
use txlistener_stream::TxListener;

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "tail" => cmd_tail(&args[2..]).await,
        "positions" => cmd_positions(&args[2..]),
        "config" => cmd_config(&args[2..]),
        "info" => {
            cmd_info();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            println!("txlistener {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Logs go to stderr so receipts on stdout stay machine-readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_usage() {
    println!("txlistener {}", env!("CARGO_PKG_VERSION"));
    println!("Tail ordered transaction receipts from EVM chains\n");
    println!("USAGE:");
    println!("    txlistener <COMMAND>\n");
    println!("COMMANDS:");
    println!("    tail       Stream receipts of one chain as JSON lines");
    println!("    positions  Parse start position strings");
    println!("    config     Validate a config file and print effective values");
    println!("    info       Print defaults and the position grammar");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("TAIL FLAGS:");
    println!("    --url <URL>       RPC endpoint URL            [required]");
    println!("    --chain <ID>      Chain ID, decimal or 0x-hex [required]");
    println!("    --config <FILE>   JSON listener config");
    println!("    --start <POS>     <block|genesis|latest|oldest>[-<tx>]\n");
    println!("ENVIRONMENT:");
    println!("    RUST_LOG          Log filter (default: info)");
}

async fn cmd_tail(args: &[String]) -> Result<()> {
    let url = parse_flag(args, "--url").ok_or_else(|| anyhow!("--url is required"))?;
    let chain_id: ChainId = parse_flag(args, "--chain")
        .ok_or_else(|| anyhow!("--chain is required"))?
        .parse()?;
    let config = match parse_flag(args, "--config") {
        Some(path) => ListenerConfig::from_file(&path)
            .with_context(|| format!("loading config {path}"))?,
        None => ListenerConfig::default(),
    };
    let start = parse_flag(args, "--start")
        .map(|s| s.parse::<StartPosition>())
        .transpose()?;

    let transport = HttpTransport::with_url(&url)?;
    let reader = EvmChainReader::new().with_chain(chain_id, Arc::new(transport));
    let reader = RetryingReader::new(reader, RetryConfig::default());
    let store = Arc::new(MemoryPositionStore::new());
    let resolver: Arc<dyn PositionResolver> = store.clone();

    let (listener, mut outputs) = TxListener::new(config, Arc::new(reader), Some(resolver))?;
    match start {
        Some(start) => listener.listen_chain(chain_id, start).await?,
        None => listener.listen(&[chain_id]).await?,
    }
    tracing::info!(chain_id = %chain_id, url = %url, "Tailing receipts");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, closing");
                listener.close().await;
                break;
            }
            Some(err) = outputs.errors.recv() => {
                eprintln!("{err}");
            }
            receipt = outputs.receipts.recv() => {
                let Some(receipt) = receipt else { break };
                println!("{}", serde_json::to_string(&receipt)?);
                store.record(&receipt);
            }
        }
    }

    if let Some(stored) = store.get(&chain_id) {
        tracing::info!(chain_id = %chain_id, position = %stored.position, "Last receipt");
    }
    Ok(())
}

fn cmd_positions(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Err(anyhow!("expected at least one <chainID>:<position>"));
    }
    for raw in args {
        let (chain_id, start) = parse_position(raw)?;
        println!("{raw:<24} chain {chain_id} ({}) start {start}", chain_id.to_hex());
    }
    Ok(())
}

fn cmd_config(args: &[String]) -> Result<()> {
    let path = args.first().ok_or_else(|| anyhow!("expected a config file path"))?;
    let config =
        ListenerConfig::from_file(path).with_context(|| format!("loading config {path}"))?;
    config.validate()?;
    let starts = config.start.parse()?;

    println!("Config OK: {path}\n");
    println!("  Poll interval:    {}ms", config.block.backoff_ms);
    println!("  Max backoff:      {}ms", config.block.max_backoff_ms);
    println!("  Fetch limit:      {}", config.block.limit);
    println!("  Finality depth:   {}", config.tracker.depth);
    println!("  Return blocks:    {}", config.returns.blocks);
    println!("  Return errors:    {}", config.returns.errors);
    println!("  Default start:    {}", starts.default_position());

    let mut chains: Vec<_> = starts.iter().collect();
    chains.sort_by_key(|(id, _)| **id);
    for (chain_id, start) in chains {
        println!("  Start chain {chain_id}: {start}");
    }
    Ok(())
}

fn cmd_info() {
    let defaults = ListenerConfig::default();
    println!("txlistener {}\n", env!("CARGO_PKG_VERSION"));
    println!("Defaults:");
    println!("  block.backoff_ms      {}", defaults.block.backoff_ms);
    println!("  block.max_backoff_ms  {}", defaults.block.max_backoff_ms);
    println!("  block.limit           {}", defaults.block.limit);
    println!("  tracker.depth         {}", defaults.tracker.depth);
    println!("  start.default         {}", defaults.start.default);
    println!();
    println!("Start positions:");
    println!("  <chainID>:<blockNumber|genesis|latest|oldest>[-<txIndex>]");
    println!("  chainID is decimal or 0x-prefixed hex");
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}
