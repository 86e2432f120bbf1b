// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Node
//!
//! Entry point for the `tessera-node` binary: parses flags, loads the
//! optional JSON config, starts the P2P service with its TCP listener and
//! serves the HTTP API until SIGINT/SIGTERM.

mod api;
mod cli;
mod logging;
mod metrics;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use tessera_p2p::config::{
    chain_name, CHAIN_ID_DEVNET, CHAIN_ID_MAINNET, CHAIN_ID_TESTNET, PROTOCOL_VERSION,
};
use tessera_p2p::crypto::{KeyFile, SignatureAlg};
use tessera_p2p::gossip::Topic;
use tessera_p2p::net::service::ServiceOptions;
use tessera_p2p::peer::AddrSource;
use tessera_p2p::sync::chain_view::FixedConsensus;
use tessera_p2p::sync::SyncEvent;
use tessera_p2p::types::Hash32;
use tessera_p2p::wire::BlockHeader;
use tessera_p2p::{IdentityKeypair, P2pConfig, P2pService, ServiceHandle};

use cli::{Commands, KeyAlg, TesseraNodeCli};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = TesseraNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn chain_id_for(network: &str) -> Result<u64> {
    Ok(match network {
        "mainnet" => CHAIN_ID_MAINNET,
        "testnet" => CHAIN_ID_TESTNET,
        "devnet" => CHAIN_ID_DEVNET,
        other => bail!("unknown network {other:?}"),
    })
}

fn load_config(path: Option<&Path>) -> Result<P2pConfig> {
    let Some(path) = path else {
        return Ok(P2pConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn load_identity(path: Option<&Path>) -> Result<IdentityKeypair> {
    let Some(path) = path else {
        tracing::warn!("no key file given, using a throwaway identity");
        return Ok(IdentityKeypair::generate(SignatureAlg::Ed25519));
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let file: KeyFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse key file {}", path.display()))?;
    IdentityKeypair::from_key_file(&file)
        .with_context(|| format!("invalid key in {}", path.display()))
}

fn parse_topics(names: &[String]) -> Result<Vec<Topic>> {
    names
        .iter()
        .map(|n| Topic::parse(n.trim()).with_context(|| format!("unknown topic {n:?}")))
        .collect()
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, args.log_format);

    let chain_id = chain_id_for(&args.network)?;
    let mut config = load_config(args.config.as_deref())?;
    config.handshake.chain_id = chain_id;
    let identity = Arc::new(load_identity(args.key_file.as_deref())?);
    let topics = parse_topics(&args.topics)?;
    let genesis = BlockHeader::genesis(chain_id, args.genesis_time, args.threshold);

    tracing::info!(
        peer = %identity.peer_id(),
        network = chain_name(chain_id),
        genesis = %genesis.hash().short(),
        listen = %args.listen,
        api = %args.api,
        "starting tessera-node"
    );

    let node_metrics =
        Arc::new(NodeMetrics::new().context("failed to create prometheus registry")?);

    let (service, handle) = P2pService::new(
        config,
        identity,
        genesis.clone(),
        Arc::new(FixedConsensus::new(args.threshold, Hash32::ZERO)),
        ServiceOptions {
            topics,
            listen_addr: args.external_addr.clone(),
            metrics: Some(node_metrics.p2p.clone()),
            ..ServiceOptions::default()
        },
    );
    let service_task = tokio::spawn(service.run());
    let events_task = tokio::spawn(log_sync_events(handle.clone()));

    // --- P2P listener ---
    let p2p_listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind P2P listener on {}", args.listen))?;
    tracing::info!(addr = %args.listen, "P2P listener ready");
    let accept_handle = handle.clone();
    let accept_task = tokio::spawn(async move {
        if let Err(e) = accept_handle.accept_loop(p2p_listener).await {
            tracing::error!(error = %e, "accept loop failed");
        }
    });

    for peer in &args.peers {
        handle.add_candidate(*peer, AddrSource::Seed);
        match handle.connect(*peer).await {
            Ok(_) => tracing::info!(%peer, "dialing seed peer"),
            Err(e) => tracing::warn!(%peer, error = %e, "seed peer unreachable, will retry"),
        }
    }

    // --- API server ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        network: chain_name(chain_id).to_string(),
        service: handle.clone(),
        metrics: Arc::clone(&node_metrics),
    };
    let api_listener = tokio::net::TcpListener::bind(args.api)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api))?;
    tracing::info!(addr = %args.api, "API server listening");

    tokio::select! {
        res = axum::serve(api_listener, api::create_router(app_state)) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "API server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, saying goodbye to peers");
        }
    }

    handle.shutdown();
    accept_task.abort();
    events_task.abort();
    if let Err(e) = service_task.await {
        tracing::warn!(error = %e, "service task ended abnormally");
    }
    tracing::info!("tessera-node stopped");
    Ok(())
}

/// Surface chain-level events in the node log.
async fn log_sync_events(handle: ServiceHandle) {
    let mut events = handle.subscribe_events();
    loop {
        match events.recv().await {
            Ok(SyncEvent::HeadersAccepted(headers)) => {
                if let Some(tip) = headers.last() {
                    tracing::debug!(height = tip.height, count = headers.len(), "headers accepted");
                }
            }
            Ok(SyncEvent::Reorg(reorg)) => tracing::info!(
                depth = reorg.depth,
                old_tip = %reorg.old_tip.short(),
                new_tip = %reorg.new_tip.short(),
                "reorg"
            ),
            Ok(SyncEvent::SafeModeEntered(mode)) => tracing::warn!(
                candidate = %mode.candidate.short(),
                depth = mode.depth,
                "entered safe mode, POST /safe-mode/exit to resume"
            ),
            Ok(SyncEvent::SafeModeExited { adopted }) => {
                tracing::info!(adopted = adopted.is_some(), "left safe mode")
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "event log lagged"),
            Err(RecvError::Closed) => return,
        }
    }
}

fn keygen(args: cli::KeygenArgs) -> Result<()> {
    logging::init_logging("tessera_node=info", LogFormat::Pretty);

    if args.out.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", args.out.display());
    }
    let alg = match args.alg {
        KeyAlg::Ed25519 => SignatureAlg::Ed25519,
        KeyAlg::MlDsa44 => SignatureAlg::MlDsa44,
    };
    let keypair = IdentityKeypair::generate(alg);
    let json = serde_json::to_string_pretty(&keypair.to_key_file())?;
    std::fs::write(&args.out, json)
        .with_context(|| format!("failed to write key file {}", args.out.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&args.out, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("Key generated.");
    println!("  Algorithm : {}", alg.name());
    println!("  Peer id   : {}", keypair.peer_id());
    println!("  Key file  : {}", args.out.display());
    Ok(())
}

fn print_version() {
    println!("tessera-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT or SIGTERM. Only Ctrl+C on non-Unix platforms.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_map_to_chain_ids() {
        assert_eq!(chain_id_for("devnet").unwrap(), CHAIN_ID_DEVNET);
        assert_eq!(chain_id_for("mainnet").unwrap(), CHAIN_ID_MAINNET);
        assert!(chain_id_for("moonnet").is_err());
    }

    #[test]
    fn unknown_topic_is_rejected() {
        assert!(parse_topics(&["headers".into(), " tx".into()]).is_ok());
        assert!(parse_topics(&["weather".into()]).is_err());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.handshake.chain_id, CHAIN_ID_DEVNET);
    }
}
