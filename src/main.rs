//! Montana ACP Node — command-line entry point.

use clap::{Parser, Subcommand};
use montana::engine::{Config as EngineConfig, MontanaNode};
use montana::{Keypair, NetConfig, NodeType, Storage, NODE_FULL, NODE_PRESENCE};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "montana", version, about = "Montana ACP Node")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory (chain db, keys, peer tables)
    #[arg(long, global = true, default_value = "./data")]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Create the data directory and write the genesis slice.
    Init,
    /// Run a node.
    Node {
        /// Node type: full, light, client
        #[arg(long, default_value = "full")]
        node_type: String,
        #[arg(short, long, default_value = "19333")]
        port: u16,
        #[arg(long, default_value = "mainnet")]
        network: String,
    },
    /// Generate (or display) this node's ML-DSA-65 consensus keypair.
    Keygen,
    /// Sign a message (read from stdin) with this node's consensus key.
    Sign,
    /// Verify a signature. Message on stdin; pubkey/signature as hex args.
    Verify { pubkey_hex: String, signature_hex: String },
    /// Print chain head, peer count, and weight-registry size.
    Status,
    /// Load a peer-anchor list (one `ip:port` per line) into the address manager.
    ImportAnchors { path: PathBuf },
    /// Ban a peer address for 24h.
    Ban { addr: String },
    /// Remove an address from the ban list.
    Unban { addr: String },
}

fn parse_node_type(s: &str) -> Option<NodeType> {
    match s {
        "full" => Some(NodeType::Full),
        "light" => Some(NodeType::Light),
        "client" => Some(NodeType::Client),
        _ => None,
    }
}

fn load_or_generate_consensus_keypair(data_dir: &std::path::Path) -> std::io::Result<Keypair> {
    let secret_path = data_dir.join("consensus_secret.key");
    let public_path = data_dir.join("consensus_public.key");

    if secret_path.exists() && public_path.exists() {
        let secret_bytes = std::fs::read(&secret_path)?;
        let public = std::fs::read(&public_path)?;
        Keypair::from_bytes(public, &secret_bytes)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt consensus keypair"))
    } else {
        std::fs::create_dir_all(data_dir)?;
        let keypair = Keypair::generate();
        std::fs::write(&secret_path, keypair.secret_bytes())?;
        std::fs::write(&public_path, keypair.public_key())?;
        info!("Generated new consensus keypair at {:?}", data_dir);
        Ok(keypair)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("montana=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let exit_code = run(args).await;
    std::process::exit(exit_code);
}

async fn run(args: Args) -> i32 {
    match args.command {
        Command::Init => cmd_init(&args.data_dir),
        Command::Node { node_type, port, network } => cmd_node(&args.data_dir, &node_type, port, &network).await,
        Command::Keygen => cmd_keygen(&args.data_dir),
        Command::Sign => cmd_sign(&args.data_dir),
        Command::Verify { pubkey_hex, signature_hex } => cmd_verify(&pubkey_hex, &signature_hex),
        Command::Status => cmd_status(&args.data_dir),
        Command::ImportAnchors { path } => cmd_import_anchors(&args.data_dir, &path),
        Command::Ban { addr } => cmd_ban(&args.data_dir, &addr),
        Command::Unban { addr } => cmd_unban(&args.data_dir, &addr),
    }
}

fn cmd_init(data_dir: &std::path::Path) -> i32 {
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        error!("Failed to create data directory: {}", e);
        return 2;
    }
    let storage = match Storage::open(data_dir.join("chain")) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            return 4;
        }
    };
    match storage.init_genesis() {
        Ok(genesis) => {
            info!("Genesis slice written (index {})", genesis.header.slice_index);
            0
        }
        Err(e) => {
            error!("Failed to write genesis slice: {}", e);
            4
        }
    }
}

async fn cmd_node(data_dir: &std::path::Path, node_type: &str, port: u16, network: &str) -> i32 {
    let Some(node_type) = parse_node_type(node_type) else {
        error!("Invalid node type. Use: full, light, client");
        return 2;
    };
    let testnet = match network {
        "mainnet" => false,
        "testnet" => true,
        _ => {
            error!("Invalid network. Use: mainnet, testnet");
            return 2;
        }
    };

    if let Err(e) = std::fs::create_dir_all(data_dir) {
        error!("Failed to create data directory: {}", e);
        return 2;
    }

    let keypair = match load_or_generate_consensus_keypair(data_dir) {
        Ok(k) => k,
        Err(e) => {
            error!("Failed to load consensus keypair: {}", e);
            return 5;
        }
    };

    let storage = match Storage::open(data_dir.join("chain")) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            return 4;
        }
    };

    let net_config = NetConfig {
        listen_port: port,
        data_dir: data_dir.join("net"),
        node_type,
        services: NODE_FULL | NODE_PRESENCE,
        testnet,
        ..Default::default()
    };

    let (network, event_rx) = match montana::Network::new(net_config).await {
        Ok(res) => res,
        Err(e) => {
            error!("Failed to initialize network: {}", e);
            return 2;
        }
    };
    let network = std::sync::Arc::new(network);

    if let Err(e) = network.start().await {
        error!("Failed to start network: {}", e);
        return 2;
    }
    info!("Network started on port {}", port);

    let genesis_hash = match storage.get_slice(0) {
        Ok(slice) => slice.header.hash(),
        Err(_) => [0u8; 32],
    };

    let engine_config = EngineConfig {
        node_type,
        genesis_hash,
        tau1_interval: Duration::from_secs(montana::TAU1_MINUTES * 60),
        tau2_interval: Duration::from_secs(montana::TAU2_MINUTES * 60),
    };

    let node = MontanaNode::new(engine_config, keypair, storage, network, event_rx);

    if let Err(e) = node.start().await {
        error!("Failed to start consensus engine: {}", e);
        return 3;
    }
    info!("Montana node running ({:?}). Press Ctrl+C to stop.", node.state().await);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }

    info!("Shutting down...");
    if let Err(e) = node.stop().await {
        error!("Error during shutdown: {}", e);
    }
    0
}

fn cmd_keygen(data_dir: &std::path::Path) -> i32 {
    match load_or_generate_consensus_keypair(data_dir) {
        Ok(keypair) => {
            println!("pubkey_hex={}", hex::encode(keypair.public_key()));
            0
        }
        Err(e) => {
            error!("Failed to load/generate keypair: {}", e);
            5
        }
    }
}

fn cmd_sign(data_dir: &std::path::Path) -> i32 {
    use std::io::Read;
    let keypair = match load_or_generate_consensus_keypair(data_dir) {
        Ok(k) => k,
        Err(e) => {
            error!("Failed to load keypair: {}", e);
            return 5;
        }
    };

    let mut message = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut message) {
        error!("Failed to read message from stdin: {}", e);
        return 2;
    }
    if message.is_empty() {
        error!("Refusing to sign an empty message");
        return 2;
    }

    let signature = keypair.sign(&message);
    println!("pubkey_hex={}", hex::encode(keypair.public_key()));
    println!("signature_hex={}", hex::encode(&signature));
    0
}

fn cmd_verify(pubkey_hex: &str, signature_hex: &str) -> i32 {
    use std::io::Read;
    let Ok(pubkey) = hex::decode(pubkey_hex) else {
        error!("Invalid pubkey hex");
        return 2;
    };
    let Ok(signature) = hex::decode(signature_hex) else {
        error!("Invalid signature hex");
        return 2;
    };

    let mut message = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut message) {
        error!("Failed to read message from stdin: {}", e);
        return 2;
    }

    match montana::verify(&pubkey, &message, &signature) {
        Ok(()) => {
            println!("OK");
            0
        }
        Err(_) => {
            println!("INVALID");
            1
        }
    }
}

fn cmd_status(data_dir: &std::path::Path) -> i32 {
    let storage = match Storage::open(data_dir.join("chain")) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            return 4;
        }
    };

    match storage.head() {
        Ok(head) => {
            println!("head_index={}", head);
            if let Some(age) = storage.chain_age_secs() {
                println!("last_slice_age_secs={}", age);
            }
            let weights = storage.get_all_weights().unwrap_or_default();
            println!("registered_nodes={}", weights.len());
            0
        }
        Err(e) => {
            error!("Chain not initialized ({}). Run `montana init` first.", e);
            4
        }
    }
}

fn cmd_import_anchors(data_dir: &std::path::Path, path: &std::path::Path) -> i32 {
    use montana::net::AddrMan;
    use montana::net::NetAddress;

    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to read anchors file: {}", e);
            return 2;
        }
    };

    let net_dir = data_dir.join("net");
    if let Err(e) = std::fs::create_dir_all(&net_dir) {
        error!("Failed to create data directory: {}", e);
        return 2;
    }
    let addr_path = net_dir.join("addresses.dat");
    let mut addrman = if addr_path.exists() {
        AddrMan::load(&addr_path).unwrap_or_else(|_| AddrMan::new())
    } else {
        AddrMan::new()
    };

    let mut imported = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Ok(socket_addr) = line.parse::<std::net::SocketAddr>() else {
            continue;
        };
        if addrman.add(NetAddress::new(socket_addr.ip(), socket_addr.port(), 0), None) {
            imported += 1;
        }
    }

    if let Err(e) = addrman.save(&addr_path) {
        error!("Failed to save address manager: {}", e);
        return 4;
    }

    info!("Imported {} anchor addresses", imported);
    0
}

fn cmd_ban(data_dir: &std::path::Path, addr: &str) -> i32 {
    use montana::net::{BanEntry, BanList};

    let Ok(socket_addr) = addr.parse::<std::net::SocketAddr>() else {
        error!("Invalid address: {}", addr);
        return 2;
    };

    let net_dir = data_dir.join("net");
    if let Err(e) = std::fs::create_dir_all(&net_dir) {
        error!("Failed to create data directory: {}", e);
        return 2;
    }
    let ban_path = net_dir.join("banlist.dat");
    let mut banlist = if ban_path.exists() {
        BanList::load(&ban_path).unwrap_or_else(|_| BanList::new())
    } else {
        BanList::new()
    };

    banlist.ban(BanEntry::new(socket_addr, 24 * 60 * 60, "manual ban".to_string()));

    if let Err(e) = banlist.save(&ban_path) {
        error!("Failed to save ban list: {}", e);
        return 4;
    }
    info!("Banned {}", socket_addr);
    0
}

fn cmd_unban(data_dir: &std::path::Path, addr: &str) -> i32 {
    use montana::net::BanList;

    let Ok(socket_addr) = addr.parse::<std::net::SocketAddr>() else {
        error!("Invalid address: {}", addr);
        return 2;
    };

    let net_dir = data_dir.join("net");
    let ban_path = net_dir.join("banlist.dat");
    let mut banlist = if ban_path.exists() {
        match BanList::load(&ban_path) {
            Ok(b) => b,
            Err(e) => {
                error!("Failed to load ban list: {}", e);
                return 4;
            }
        }
    } else {
        info!("No ban list present; nothing to unban");
        return 0;
    };

    if banlist.unban(&socket_addr) {
        if let Err(e) = banlist.save(&ban_path) {
            error!("Failed to save ban list: {}", e);
            return 4;
        }
        info!("Unbanned {}", socket_addr);
    } else {
        info!("{} was not banned", socket_addr);
    }
    0
}
