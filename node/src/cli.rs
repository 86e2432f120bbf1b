//! # CLI Interface
//!
//! `tessera-node` subcommands: `run`, `keygen` and `version`. Every `run`
//! flag can also come from a `TESSERA_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::logging::LogFormat;

/// Tessera peer-to-peer node.
#[derive(Parser, Debug)]
#[command(
    name = "tessera-node",
    about = "Tessera peer-to-peer node",
    version,
    propagate_version = true
)]
pub struct TesseraNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Generate an identity key file.
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for `run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON file with a `P2pConfig`. Missing fields take their defaults.
    #[arg(long, short = 'c', env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the P2P listener binds to.
    #[arg(long, env = "TESSERA_LISTEN", default_value = "0.0.0.0:9740")]
    pub listen: SocketAddr,

    /// Address the HTTP status and metrics server binds to.
    #[arg(long, env = "TESSERA_API", default_value = "127.0.0.1:9741")]
    pub api: SocketAddr,

    /// Address advertised to peers during identify.
    #[arg(long, env = "TESSERA_EXTERNAL_ADDR")]
    pub external_addr: Option<String>,

    /// Peers to dial at startup, comma separated.
    #[arg(long, env = "TESSERA_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Identity key file written by `keygen`. A throwaway key is generated
    /// when omitted.
    #[arg(long, env = "TESSERA_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Gossip topics to subscribe to, comma separated.
    #[arg(
        long,
        env = "TESSERA_TOPICS",
        value_delimiter = ',',
        default_value = "headers,tx"
    )]
    pub topics: Vec<String>,

    /// Network: mainnet, testnet or devnet.
    #[arg(long, env = "TESSERA_NETWORK", default_value = "devnet")]
    pub network: String,

    /// Genesis timestamp (Unix seconds).
    #[arg(long, env = "TESSERA_GENESIS_TIME", default_value_t = 0)]
    pub genesis_time: u64,

    /// Initial acceptance threshold in micro-units.
    #[arg(long, env = "TESSERA_THRESHOLD", default_value_t = 1_000_000)]
    pub threshold: u64,

    #[arg(long, env = "TESSERA_LOG_FORMAT", value_enum, default_value = "pretty")]
    pub log_format: LogFormat,
}

/// Key algorithms accepted by `keygen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KeyAlg {
    Ed25519,
    #[value(name = "ml-dsa-44")]
    MlDsa44,
}

/// Arguments for `keygen`.
#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Where to write the key file.
    #[arg(long, short = 'o', default_value = "tessera.key")]
    pub out: PathBuf,

    #[arg(long, value_enum, default_value = "ed25519")]
    pub alg: KeyAlg,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}
