//! Cairn - peer-to-peer encrypted block storage node

use anyhow::{Context, Result};
use cairn_core::keys::Keyring;
use cairn_core::transport::memory::MemoryNetwork;
use cairn_core::FileId;
use cairn_node::config::{expand_path, Config};
use cairn_node::{Node, NodeHandle, NodeSettings, SqliteStore};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Peer-to-peer encrypted block storage", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.cairn/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and generate a keyring
    Init {
        /// Enable the post-quantum encryption layer
        #[arg(long)]
        post_quantum: bool,
    },

    /// Encrypt and store a file
    Upload {
        /// Path to the file to store
        #[arg(required = true)]
        file: String,
    },

    /// Reassemble a stored file
    Download {
        /// File id (hex-encoded)
        #[arg(required = true)]
        id: String,

        /// Output path
        #[arg(short, long)]
        output: Option<String>,
    },

    /// List stored files
    List,

    /// Delete a stored file and its blocks
    Delete {
        /// File id (hex-encoded)
        #[arg(required = true)]
        id: String,
    },

    /// Show status and statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let mut config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?
    } else {
        Config::default()
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Init { post_quantum } => init(&config_path, config, post_quantum)?,
        Commands::Upload { file } => upload_file(&config, &file).await?,
        Commands::Download { id, output } => download_file(&config, &id, output.as_deref()).await?,
        Commands::List => list_files(&config).await?,
        Commands::Delete { id } => delete_file(&config, &id).await?,
        Commands::Status => show_status(&config).await?,
    }

    Ok(())
}

fn init(config_path: &Path, mut config: Config, post_quantum: bool) -> Result<()> {
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    if config_path.exists() {
        println!("Config already exists at: {}", config_path.display());
    } else {
        config.crypto.post_quantum |= post_quantum;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(config_path, toml::to_string_pretty(&config)?)?;
        println!("Wrote config: {}", config_path.display());
    }

    let keyring_path = config.keyring_path();
    if keyring_path.exists() {
        println!("Keyring already exists at: {}", keyring_path.display());
        return Ok(());
    }

    let keyring = Keyring::generate(config.crypto.post_quantum);
    std::fs::write(&keyring_path, keyring.to_json()?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&keyring_path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!(
        "Generated {} keyring: {}",
        if keyring.post_quantum.is_some() { "layered" } else { "symmetric" },
        keyring_path.display()
    );
    println!("Keep a copy of it: files cannot be decrypted without it.");
    Ok(())
}

/// Start an offline node over the local store
fn start_node(config: &Config) -> Result<NodeHandle> {
    let keyring_path = config.keyring_path();
    let json = std::fs::read_to_string(&keyring_path).with_context(|| {
        format!("No keyring at {}; run `cairn init` first", keyring_path.display())
    })?;
    let keyring = Keyring::from_json(&json)?;

    std::fs::create_dir_all(config.data_dir())?;
    let store = SqliteStore::open(&config.database_path())?;

    // No signaling backend ships with the node; a private in-memory
    // network gives it an identity and no reachable peers.
    let peer_id = if config.network.peer_id.is_empty() {
        "local"
    } else {
        config.network.peer_id.as_str()
    };
    let network = MemoryNetwork::new();
    let (signaling, incoming) = network.join(peer_id)?;

    let mut settings = NodeSettings::from_config(config);
    settings.bootstrap.clear();
    Ok(Node::spawn(signaling, incoming, store, keyring, settings))
}

async fn upload_file(config: &Config, path: &str) -> Result<()> {
    let path = Path::new(path);
    if !path.exists() {
        anyhow::bail!("File not found: {}", path.display());
    }
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    let data = std::fs::read(path)?;

    let node = start_node(config)?;
    tracing::info!("Storing {} ({} bytes)", name, data.len());
    let record = node.upload(data, name).await?;
    node.shutdown().await?;

    println!("Stored: {}", record.name);
    println!("Id: {}", record.id);
    println!("Size: {} bytes ({} blocks)", record.size, record.block_ids.len());
    if let Some(layout) = &record.erasure {
        println!(
            "Erasure: {}+{} ({} parity blocks)",
            layout.data_shards,
            layout.parity_shards,
            record.all_block_ids().len() - record.block_ids.len()
        );
    }
    Ok(())
}

async fn download_file(config: &Config, id: &str, output: Option<&str>) -> Result<()> {
    let file_id: FileId = id.parse()?;
    let node = start_node(config)?;

    let result = async {
        let name = node
            .list_files()
            .await?
            .into_iter()
            .find(|r| r.id == file_id)
            .map(|r| r.name);
        let data = node.download(file_id).await?;
        Ok::<_, cairn_core::Error>((name, data))
    }
    .await;
    node.shutdown().await?;
    let (name, data) = result?;

    let default_name = name.unwrap_or_else(|| format!("{}.download", file_id));
    let output_path = Path::new(output.unwrap_or(&default_name));
    std::fs::write(output_path, &data)?;

    println!("Downloaded {} bytes to {}", data.len(), output_path.display());
    Ok(())
}

async fn list_files(config: &Config) -> Result<()> {
    let node = start_node(config)?;
    let records = node.list_files().await?;
    node.shutdown().await?;

    if records.is_empty() {
        println!("No files stored");
        return Ok(());
    }
    for record in records {
        println!(
            "{}  {}  {} bytes  {} blocks  {}",
            record.id,
            record.name,
            record.size,
            record.block_ids.len(),
            record.mime_type.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn delete_file(config: &Config, id: &str) -> Result<()> {
    let file_id: FileId = id.parse()?;
    let node = start_node(config)?;
    let result = node.delete(file_id).await;
    node.shutdown().await?;
    result?;

    println!("Deleted {}", file_id);
    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    println!("Cairn v{}", env!("CARGO_PKG_VERSION"));
    println!("Protocol version: {}", cairn_core::PROTOCOL_VERSION);
    println!("Data directory: {}", config.data_dir().display());

    let node = start_node(config)?;
    let stats = node.get_stats().await?;
    let files = node.list_files().await?;
    node.shutdown().await?;

    println!("Files: {}", files.len());
    println!("Blocks: {} ({} bytes)", stats.block_count, stats.storage_used);
    println!("Peers: {}", stats.peer_count);
    println!(
        "Encryption: {}",
        if config.crypto.post_quantum { "layered (ML-KEM-768 + ML-DSA-65)" } else { "symmetric (XChaCha20-Poly1305)" }
    );
    Ok(())
}
