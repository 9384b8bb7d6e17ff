//! ChainView CLI — deploy and inspect materialized views.
//!
//! # Commands
//! ```text
//! chainview deploy <definition.json> --handler <path> [--force-reindex] [--schema-name <name>]
//! chainview ddl    <definition.json> [--schema-name <name>]
//! chainview list   [--status active|error|reindexing] [--json]
//! chainview status <name>
//! chainview delete <name> --yes
//! chainview reorg  <height>
//! chainview info
//! ```
//!
//! Handlers run inside the host process that embeds the engine; the CLI only
//! manages definitions, namespaces, and the registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use chainview_core::{
    schema, DeployOptions, NotificationBus, RegisteredView, StaticHandlerLoader, ViewDefinition,
    ViewEngine, ViewStatus, ViewStore,
};
use chainview_storage::{PgNotificationBus, PostgresStore};

mod config;
mod telemetry;

use config::CliConfig;

#[derive(Parser)]
#[command(
    name = "chainview",
    about = "Materialized views over a blockchain event log — ChainView CLI",
    long_about = "
ChainView CLI: deploy view definitions, inspect the view registry, and
signal running view services.

ENVIRONMENT VARIABLES:
  DATABASE_URL       Postgres connection URL
  CHAINVIEW_CONFIG   Path to a YAML config file
  RUST_LOG           Log filter (overrides the config file)
",
    version
)]
struct Cli {
    /// YAML config file (database_url, engine, log)
    #[arg(short, long, global = true, env = "CHAINVIEW_CONFIG")]
    config: Option<PathBuf>,

    /// Postgres connection URL
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, migrate, or rebuild a view from its definition file
    Deploy {
        /// Path to the view definition JSON
        definition: PathBuf,
        /// Location the host process loads the view's handlers from
        #[arg(long)]
        handler: String,
        /// Drop and rebuild the view even for a breaking or empty change
        #[arg(long)]
        force_reindex: bool,
        /// Namespace for a new view (default: view_<name>)
        #[arg(long)]
        schema_name: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the DDL a definition generates, without touching the database
    Ddl {
        /// Path to the view definition JSON
        definition: PathBuf,
        /// Namespace (default: view_<name>)
        #[arg(long)]
        schema_name: Option<String>,
    },

    /// List registered views
    List {
        /// Only views with this status
        #[arg(long, value_parser = ["active", "error", "reindexing"])]
        status: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one view's registry row as JSON
    Status {
        /// View name
        name: String,
    },

    /// Drop a view's namespace and registry row
    Delete {
        /// View name
        name: String,
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Ask running view services to repair their rows at a height
    Reorg {
        /// Height whose block was replaced
        height: u64,
    },

    /// Show build and configuration info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.log.level = "debug".into();
    }
    telemetry::init_tracing(&config.log);
    let url = cli.database_url.as_deref();

    match cli.command {
        Commands::Deploy {
            definition,
            handler,
            force_reindex,
            schema_name,
            json,
        } => {
            let definition = read_definition(&definition)?;
            let (engine, _) = connect(&config, url).await?;
            let outcome = engine
                .deploy_schema(
                    &definition,
                    &handler,
                    &DeployOptions {
                        force_reindex,
                        schema_name,
                    },
                )
                .await
                .with_context(|| format!("deploying view '{}'", definition.name))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{} {} (id {})", outcome.action, definition.name, outcome.view_id);
            }
            Ok(())
        }
        Commands::Ddl {
            definition,
            schema_name,
        } => cmd_ddl(&definition, schema_name),
        Commands::List { status, json } => {
            let (engine, _) = connect(&config, url).await?;
            let views = engine
                .list_views(status.as_deref().map(ViewStatus::parse))
                .await?;
            print_views(&views, json)
        }
        Commands::Status { name } => {
            let (engine, _) = connect(&config, url).await?;
            let view = engine
                .view_status(&name)
                .await?
                .with_context(|| format!("view '{name}' is not registered"))?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Commands::Delete { name, yes } => {
            if !yes {
                bail!("refusing to delete '{name}' without --yes (drops the view's schema and all its rows)");
            }
            let (engine, _) = connect(&config, url).await?;
            if !engine.delete_view(&name).await? {
                bail!("view '{name}' is not registered");
            }
            println!("deleted {name}");
            Ok(())
        }
        Commands::Reorg { height } => {
            let (engine, bus) = connect(&config, url).await?;
            let channel = &engine.config().reorg_channel;
            let payload = serde_json::json!({ "blockHeight": height }).to_string();
            bus.publish(channel, &payload).await?;
            debug!(channel = %channel, payload = %payload, "Published reorg notice");
            let tip = engine
                .store()
                .index_progress(&engine.config().network)
                .await?
                .map(|p| p.last_contiguous_block);
            println!("reorg at {height} published on '{channel}' (indexer tip: {tip:?})");
            Ok(())
        }
        Commands::Info => cmd_info(&config),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

/// An engine over Postgres with no handlers; registry and DDL operations only.
async fn connect(config: &CliConfig, url: Option<&str>) -> Result<(ViewEngine, PgNotificationBus)> {
    let url = config.database_url(url)?;
    let store = PostgresStore::connect(&url)
        .await
        .context("connecting to Postgres")?;
    let bus = PgNotificationBus::new(store.pool().clone());
    let engine = ViewEngine::new(
        Arc::new(store),
        Arc::new(StaticHandlerLoader::new()),
        config.engine.clone(),
    );
    Ok((engine, bus))
}

fn print_views(views: &[RegisteredView], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(views)?);
        return Ok(());
    }
    if views.is_empty() {
        println!("no views registered");
        return Ok(());
    }
    println!(
        "{:<32} {:>4} {:<11} {:>12} {:>10} {:>8}",
        "NAME", "VER", "STATUS", "BLOCK", "PROCESSED", "ERRORS"
    );
    for v in views {
        println!(
            "{:<32} {:>4} {:<11} {:>12} {:>10} {:>8}",
            v.name,
            v.version,
            v.status.as_str(),
            v.last_processed_block,
            v.health.total_processed,
            v.health.total_errors
        );
    }
    Ok(())
}

fn read_definition(path: &Path) -> Result<ViewDefinition> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading definition '{}'", path.display()))?;
    let definition = ViewDefinition::from_json(&text)
        .with_context(|| format!("parsing definition '{}'", path.display()))?;
    definition.validate()?;
    Ok(definition)
}

fn cmd_ddl(path: &Path, schema_name: Option<String>) -> Result<()> {
    let definition = read_definition(path)?;
    let schema_name = schema_name.unwrap_or_else(|| definition.default_schema_name());
    let generated = schema::generate(&definition.schema, &schema_name)?;
    println!("-- view {} v{} (schema hash {})", definition.name, definition.version, generated.hash);
    for statement in generated.sql()? {
        println!("{statement};");
    }
    Ok(())
}

fn cmd_info(config: &CliConfig) -> Result<()> {
    println!("chainview {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Column types: text, uint, int, principal, boolean, timestamp, jsonb");
    println!("Sources:      contract (+ function | event), type (+ minAmount); globs with *");
    println!();
    println!("Engine configuration:");
    println!("{}", serde_yaml::to_string(&config.engine)?);
    Ok(())
}
