//! Shardmap CLI - Shard map administration and queries
//!
//! Manages a shard map keyed by 32-bit integers. Shard stores are redb files
//! under the data directory, so state persists between invocations.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use shardmap_client::{Connector, LocalConnector};
use shardmap_common::{Config, FailurePolicy};
use shardmap_manager::{ShardMapManager, ShardSummary};
use shardmap_query::{MultiShardQuery, MultiShardResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "shardmap-cli")]
#[command(about = "Shard map administration CLI")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "shardmap.toml")]
    config: PathBuf,

    /// Directory holding the manager store and shard stores
    #[arg(long, env = "SHARDMAP_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Shard map name (overrides config)
    #[arg(long)]
    shard_map: Option<String>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the manager store, the shard map and the initial shards
    Init,
    /// Show shards and their ranges
    Status,
    /// Add a shard for the range that starts at the current maximum key
    AddShard {
        /// Exclusive upper key (default: current maximum + range width)
        #[arg(long)]
        high: Option<i32>,
    },
    /// Add a shard without a range, or show an existing empty one
    AddEmptyShard,
    /// Insert a tenant on the shard that owns its id
    Insert {
        /// Tenant id (sharding key)
        key: i32,
        /// Tenant name
        name: String,
    },
    /// Run a statement on the shard that owns a key
    Exec {
        /// Sharding key
        key: i32,
        /// Statement text
        statement: String,
    },
    /// Query a table on every shard
    Query {
        /// Table to read
        #[arg(default_value = "Tenants")]
        table: String,
        /// Fail the whole query if any shard fails
        #[arg(long)]
        abort_on_failure: bool,
        /// Per-shard timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Maximum shards queried at once
        #[arg(long)]
        parallelism: Option<usize>,
    },
    /// Drop every shard that has no ranges
    DropEmptyShards,
    /// Drop every shard and delete the manager store
    DropAll,
    /// Check that the manager server is reachable
    Ping,
}

fn load_config(args: &Args) -> Result<Config> {
    // Load config file if it exists
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        debug!("No config file at {}, using defaults", args.config.display());
        Config::default()
    };

    // CLI takes precedence
    if let Some(data_dir) = &args.data_dir {
        config.manager.store_path = data_dir.join("manager.redb");
    }
    if let Some(name) = &args.shard_map {
        config.manager.shard_map_name.clone_from(name);
    }
    Ok(config)
}

fn shard_root(config: &Config) -> PathBuf {
    config
        .manager
        .store_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("shards")
}

fn attach(config: Config, connector: Arc<dyn Connector>) -> Result<ShardMapManager<i32>> {
    let path = config.manager.store_path.clone();
    ShardMapManager::initialize_or_attach(config, connector, false)?.ok_or_else(|| {
        anyhow!(
            "shard map manager at {} is not initialized, run `shardmap-cli init` first",
            path.display()
        )
    })
}

fn print_shards(shards: &[ShardSummary<i32>], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(shards)?);
        return Ok(());
    }
    if shards.is_empty() {
        println!("No shards found");
        return Ok(());
    }
    println!("{:<40} {:<8} {:<8} RANGES", "LOCATION", "STATUS", "VERSION");
    println!("{}", "-".repeat(80));
    for summary in shards {
        let ranges = if summary.mappings.is_empty() {
            "(empty)".to_string()
        } else {
            summary
                .mappings
                .iter()
                .map(|m| {
                    if m.is_online() {
                        m.range.to_string()
                    } else {
                        format!("{} offline", m.range)
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        println!(
            "{:<40} {:<8} {:<8} {}",
            summary.shard.location.to_string(),
            format!("{:?}", summary.shard.status),
            summary.shard.version,
            ranges
        );
    }
    Ok(())
}

fn print_result(result: &MultiShardResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    for row in &result.rows {
        let values = row
            .values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        println!("{:<40} {}", row.location.to_string(), values);
    }
    println!(
        "{} row(s) from {} shard(s)",
        result.rows.len(),
        result.shard_count - result.failures.len()
    );
    for failure in &result.failures {
        println!("Skipped {failure}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let root = shard_root(&config);
    let connector: Arc<dyn Connector> = Arc::new(
        LocalConnector::new(&root)
            .with_context(|| format!("failed to open shard directory {}", root.display()))?,
    );
    info!("Manager store: {}", config.manager.store_path.display());

    match args.command {
        Commands::Init => {
            let manager = ShardMapManager::<i32>::initialize(config, connector)?;
            let shards = manager.create_starter_layout().await?;
            print_shards(&shards, args.json)?;
        }
        Commands::Status => {
            let manager = attach(config, connector)?;
            if manager.shard_map()?.is_none() {
                println!("Shard map '{}' does not exist", manager.map_name());
                return Ok(());
            }
            print_shards(&manager.list_shards_with_mappings()?, args.json)?;
        }
        Commands::AddShard { high } => {
            let manager = attach(config, connector)?;
            let high = match high {
                Some(high) => high,
                None => manager.default_next_high()?,
            };
            let (shard, mapping) = manager.extend_coverage(high).await?;
            println!("Added {} on {}", mapping.range, shard.location);
        }
        Commands::AddEmptyShard => {
            let manager = attach(config, connector)?;
            let shard = manager.add_empty_shard().await?;
            println!("Empty shard {} at {}", shard.id, shard.location);
        }
        Commands::Insert { key, name } => {
            let manager = attach(config, connector)?;
            let statement = format!(
                "INSERT INTO Tenants VALUES ({key}, '{}')",
                name.replace('\'', "''")
            );
            let location = manager
                .with_shard_for_key(&key, |conn| {
                    Box::pin(async move {
                        conn.execute(&statement)
                            .await
                            .map(|_| conn.location().clone())
                    })
                })
                .await?;
            println!("Inserted tenant {key} on {location}");
        }
        Commands::Exec { key, statement } => {
            let manager = attach(config, connector)?;
            let (location, affected) = manager
                .with_shard_for_key(&key, |conn| {
                    Box::pin(async move {
                        conn.execute(&statement)
                            .await
                            .map(|affected| (conn.location().clone(), affected))
                    })
                })
                .await?;
            println!("{affected} row(s) affected on {location}");
        }
        Commands::Query {
            table,
            abort_on_failure,
            timeout_ms,
            parallelism,
        } => {
            let manager = attach(config, connector)?;
            let mut policy = manager.default_query_policy();
            if abort_on_failure {
                policy.on_shard_failure = FailurePolicy::AbortAll;
            }
            if let Some(ms) = timeout_ms {
                policy.per_shard_timeout = Duration::from_millis(ms);
            }
            if let Some(parallelism) = parallelism {
                policy.max_parallelism = parallelism;
            }
            let result = manager
                .run_multi_shard_query(&MultiShardQuery::select_all(table), &policy)
                .await?;
            print_result(&result, args.json)?;
        }
        Commands::DropEmptyShards => {
            let manager = attach(config, connector)?;
            let dropped = manager.drop_empty_shards().await?;
            for shard in &dropped {
                println!("Dropped {}", shard.location);
            }
            println!("{} empty shard(s) dropped", dropped.len());
        }
        Commands::DropAll => {
            let manager = attach(config, connector)?;
            let name = manager.map_name().to_string();
            manager.drop_all_and_teardown().await?;
            println!("Dropped shard map '{name}' and its manager store");
        }
        Commands::Ping => {
            let attached = ShardMapManager::<i32>::attach(config.clone(), Arc::clone(&connector))?;
            let reachable = match attached {
                Some(manager) => manager.check_connectivity().await,
                None => connector.ping(&config.manager.server).await,
            };
            if !reachable {
                return Err(anyhow!("server {} is unreachable", config.manager.server));
            }
            println!("Server {} is reachable", config.manager.server);
        }
    }

    Ok(())
}
