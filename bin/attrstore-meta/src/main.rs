//! attrstore metadata node
//!
//! Opens the node's snapshot and runs one flat key-value or extended
//! attribute operation against it.

use anyhow::{Context, Result};
use attrstore_common::{Config, InodeId};
use attrstore_meta_store::{MetaNode, SizeCounters};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "attrstore-meta")]
#[command(about = "attrstore metadata node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/attrstore/meta.toml")]
    config: PathBuf,

    /// Data directory (overrides the config file)
    #[arg(long, env = "ATTRSTORE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flat key-value operations
    Kv {
        #[command(subcommand)]
        action: KvCommands,
    },
    /// Extended attribute operations
    Xattr {
        #[command(subcommand)]
        action: XattrCommands,
    },
}

#[derive(Subcommand, Debug)]
enum KvCommands {
    /// Insert a new key
    Add { key: String, value: String },
    /// Update a key (`%+N`, `%-N`, `%1X`, `%2Y` or a plain value)
    Update {
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Delete a key
    Del { key: String },
    /// Read a key. A trailing `*` lists every key with that prefix.
    Get {
        key: String,
        /// Only keys containing this substring (prefix listing)
        #[arg(long)]
        kfilter: Option<String>,
        /// Only values containing this substring (prefix listing)
        #[arg(long)]
        vfilter: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum XattrCommands {
    /// Set an attribute
    Set { inode: u64, key: String, value: String },
    /// Read an attribute
    Get { inode: u64, key: String },
    /// List attribute names
    List { inode: u64 },
    /// Remove an attribute
    Remove { inode: u64, key: String },
    /// Append to an attribute's current value
    Append { inode: u64, key: String, value: String },
    /// Add `files,dirs,bytes` to a size counter attribute
    Usage {
        inode: u64,
        key: String,
        #[arg(allow_hyphen_values = true)]
        delta: String,
    },
    /// Add a link from `parent`
    Link { inode: u64, parent: u64 },
    /// Drop a link from `parent`
    Unlink { inode: u64, parent: u64 },
    /// Show parent links
    Links { inode: u64 },
}

/// Layer the config file and `ATTRSTORE__*` environment over the defaults.
fn load_config(path: &Path) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(false))
        .add_source(config::Environment::with_prefix("ATTRSTORE").separator("__"))
        .build()
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let config: Config = settings
        .try_deserialize()
        .context("invalid configuration")?;
    Ok(config)
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // CLI takes precedence over the config file
    let mut config = load_config(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.json_logs;

    init_logging(&config.logging.level, config.logging.json);
    debug!("Config file: {}", args.config.display());

    let node = MetaNode::open(&config)
        .with_context(|| format!("failed to open {}", config.snapshot_path().display()))?;

    match args.command {
        Commands::Kv { action } => handle_kv(&node, action).await?,
        Commands::Xattr { action } => handle_xattr(&node, action).await?,
    }

    info!("Node at applied index {}", node.applied_index());
    Ok(())
}

async fn handle_kv(node: &MetaNode, action: KvCommands) -> Result<()> {
    match action {
        KvCommands::Add { key, value } => {
            println!("{}", node.kv.add(&key, &value).await?);
        }
        KvCommands::Update { key, value } => {
            println!("{}", node.kv.update(&key, &value).await?);
        }
        KvCommands::Del { key } => {
            node.kv.delete(&key).await?;
            println!("Deleted '{key}'");
        }
        KvCommands::Get {
            key,
            kfilter,
            vfilter,
        } => {
            if let Some(prefix) = key.strip_suffix('*') {
                let matches =
                    node.kv
                        .prefix_scan(prefix, kfilter.as_deref(), vfilter.as_deref())?;
                for (k, v) in &matches {
                    println!("{k}={v}");
                }
                println!("{} keys", matches.len());
            } else {
                println!("{}", node.kv.get(&key)?);
            }
        }
    }
    Ok(())
}

async fn handle_xattr(node: &MetaNode, action: XattrCommands) -> Result<()> {
    match action {
        XattrCommands::Set { inode, key, value } => {
            node.extend
                .set(InodeId::new(inode), &key, value.as_bytes())
                .await?;
            println!("Set '{key}' on inode {inode}");
        }
        XattrCommands::Get { inode, key } => match node.extend.get(InodeId::new(inode), &key) {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => anyhow::bail!("inode {inode} has no attribute '{key}'"),
        },
        XattrCommands::List { inode } => {
            for key in node.extend.list_keys(InodeId::new(inode)) {
                println!("{key}");
            }
        }
        XattrCommands::Remove { inode, key } => {
            node.extend.remove(InodeId::new(inode), &key).await?;
            println!("Removed '{key}' from inode {inode}");
        }
        XattrCommands::Append { inode, key, value } => {
            let appended = node
                .extend
                .append(InodeId::new(inode), &[key.as_str()], &[value.as_bytes()])
                .await?;
            for (k, v) in &appended {
                println!("{k}={}", String::from_utf8_lossy(v));
            }
        }
        XattrCommands::Usage { inode, key, delta } => {
            let delta: SizeCounters = delta
                .parse()
                .with_context(|| format!("invalid size counters '{delta}'"))?;
            let total = node
                .extend
                .merge_size_counters(InodeId::new(inode), &key, delta)
                .await?;
            println!("{total}");
        }
        XattrCommands::Link { inode, parent } => {
            node.extend
                .increment_parent_link(InodeId::new(inode), InodeId::new(parent))
                .await?;
        }
        XattrCommands::Unlink { inode, parent } => {
            node.extend
                .decrement_parent_link(InodeId::new(inode), InodeId::new(parent))
                .await?;
        }
        XattrCommands::Links { inode } => {
            for (parent, count) in node.extend.parent_links(InodeId::new(inode)).iter() {
                println!("{parent} {count}");
            }
        }
    }
    Ok(())
}
