use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use minichain::config::ChainConfig;
use minichain::contracts::NullRuntime;
use minichain::ledger::Ledger;
use minichain::node::{run, Node, NodeOptions};
use minichain::rpc::{RpcApi, RpcResponse};
use minichain::storage::{ChainStore, SledStorage};
use minichain::sync::TcpTransport;
use minichain::transaction::{KeyPair, Transaction};

#[derive(Debug, Parser)]
#[command(name = "minichain", about = "Account-based proof-of-work node")]
struct Args {
    /// Directory of the sled database.
    #[arg(long, default_value = "minichain_data")]
    data_dir: PathBuf,
    /// Chain config JSON; defaults apply to missing fields.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Hex secp256k1 secret key. A fresh key is generated when absent.
    #[arg(long)]
    private_key: Option<String>,
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: SocketAddr,
    /// Address announced to peers; defaults to the listen address.
    #[arg(long)]
    address: Option<String>,
    /// Peers to connect to on startup.
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    mine: bool,
    /// Catch up from peers before taking part in the network.
    #[arg(long)]
    chain_request: bool,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

fn print_response(response: &RpcResponse) {
    match (&response.payload, &response.error) {
        (Some(payload), _) if response.success => println!("{payload}"),
        (_, Some(error)) => eprintln!("error: {}", error.message),
        _ => eprintln!("error: empty response"),
    }
}

fn repl(rpc: RpcApi<SledStorage>) -> anyhow::Result<()> {
    println!("Node is running. Type 'help' for commands.");
    let stdin = io::stdin();
    let mut input = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        input.clear();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(());
        }
        let words: Vec<&str> = input.split_whitespace().collect();

        match words.as_slice() {
            [] => {}
            ["exit"] => return Ok(()),
            ["help"] => {
                println!("Available commands: height, address, work, balance <address>, block <number>, send <recipient> <amount> <gas> <nonce>, exit");
            }
            ["height"] => print_response(&rpc.handle("getBlockNumber", &Value::Null)),
            ["address"] => print_response(&rpc.handle("getAddress", &Value::Null)),
            ["work"] => print_response(&rpc.handle("getWork", &Value::Null)),
            ["balance", address] => print_response(&rpc.handle("getBalance", &json!({ "address": address }))),
            ["block", number] => match number.parse::<u64>() {
                Ok(number) => print_response(&rpc.handle("getBlockByNumber", &json!({ "blockNumber": number }))),
                Err(_) => eprintln!("error: block number must be an integer"),
            },
            ["send", recipient, amount, gas, nonce] => {
                let Ok(nonce) = nonce.parse::<u64>() else {
                    eprintln!("error: nonce must be an integer");
                    continue;
                };
                let tx = Transaction::new(*recipient, *amount, *gas, nonce);
                let signed = rpc.handle("signTxn", &json!({ "transaction": tx }));
                match signed.payload {
                    Some(payload) if signed.success => print_response(&rpc.handle("sendTxn", &payload)),
                    _ => print_response(&signed),
                }
            }
            _ => println!("Unknown command: {}", input.trim()),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &args.config {
        Some(path) => ChainConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => ChainConfig::default(),
    };
    let key_pair = match &args.private_key {
        Some(secret) => KeyPair::from_secret_hex(secret).context("parsing --private-key")?,
        None => {
            let key_pair = KeyPair::generate();
            warn!("No --private-key given, generated a throwaway key");
            key_pair
        }
    };
    info!(address = %key_pair.address(), "Starting node");

    let storage = SledStorage::new(&args.data_dir)
        .with_context(|| format!("opening {}", args.data_dir.display()))?;
    let store = Arc::new(ChainStore::new(storage)?);
    let ledger = Ledger::new(Arc::clone(&store), Arc::new(NullRuntime), Arc::new(config));

    let my_address = args.address.clone().unwrap_or_else(|| args.listen.to_string());
    let node = Node::open(
        ledger,
        NodeOptions {
            my_address: my_address.clone(),
            coinbase: key_pair.address(),
            mining: args.mine,
            chain_request: args.chain_request,
            peers: args.peers.clone(),
        },
    )?;

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let transport = Arc::new(TcpTransport::new(my_address));
    let listen = args.listen;
    let listener_inbox = inbound_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = TcpTransport::listen(listen, listener_inbox).await {
            warn!(error = %e, "P2P listener stopped");
        }
    });

    let rpc = RpcApi::new(Arc::clone(&store), key_pair, args.mine, Some(inbound_tx));
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let console = async move {
        match tokio::task::spawn_blocking(move || repl(rpc)).await {
            Ok(Err(e)) => warn!(error = %e, "Console failed"),
            Err(e) => warn!(error = %e, "Console task panicked"),
            Ok(Ok(())) => {}
        }
        let _ = shutdown_tx.send(());
    };

    let (node, ()) = tokio::join!(run(node, transport, inbound_rx, shutdown_rx), console);
    node?.store().close()?;
    info!("Exiting node");
    Ok(())
}
