//! Wharf - Incremental Warehouse Replication
//!
//! Command-line front end for dump, load and status.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wharf::config::WharfConfig;
use wharf::dump::DumpRequest;
use wharf::error::{Error, Result};
use wharf::event::EventId;
use wharf::load::LoadRequest;
use wharf::tuning;
use wharf::ReplicationEngine;

/// Wharf - Incremental Warehouse Replication
#[derive(Parser)]
#[command(name = "wharf")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wharf.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wharf.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Dump a source database (bootstrap without --from)
    Dump {
        /// Database name or pattern
        db: String,

        /// Restrict to matching tables
        #[arg(long)]
        table: Option<String>,

        /// Last event id already replicated
        #[arg(long)]
        from: Option<EventId>,

        /// Last event id to include
        #[arg(long)]
        to: Option<EventId>,

        /// Maximum number of events
        #[arg(long)]
        limit: Option<usize>,

        /// Skip data files
        #[arg(long)]
        metadata_only: bool,
    },

    /// Load a dump into the replica
    Load {
        /// Replica database name, or '*' to keep source names
        target_db: String,

        /// Dump root written by `wharf dump`
        dump_root: PathBuf,

        /// Only load this table
        #[arg(long)]
        table: Option<String>,

        /// Skip data files
        #[arg(long)]
        metadata_only: bool,

        /// Apply objects one at a time
        #[arg(long)]
        no_parallel: bool,

        /// Write data files straight into their final location
        #[arg(long)]
        move_optimization: bool,

        /// Maximum catalog operations per iteration
        #[arg(long)]
        max_ops: Option<usize>,
    },

    /// Show the last event id replicated into a replica database or table
    Status {
        db: String,

        #[arg(long)]
        table: Option<String>,
    },

    /// Reclaim expired CM content
    PurgeCm,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration is optional for `init`; logging falls back to defaults
    let config = WharfConfig::from_file(&cli.config).ok();
    let (level, format) = match &config {
        Some(c) => (c.logging.level.clone(), c.logging.format.clone()),
        None => ("info".to_string(), "pretty".to_string()),
    };
    init_logging(cli.log_level.as_deref().unwrap_or(&level), &format);

    let result = match cli.command {
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
        command => run_command(cli.config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error[{}]: {}", e.code(), e);
            ExitCode::from((e.code().as_u32() % 256).max(1) as u8)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run_command(config_path: PathBuf, command: Commands) -> Result<()> {
    let config = WharfConfig::from_file(&config_path)?;
    let engine = ReplicationEngine::open(config)?;

    match command {
        Commands::Dump {
            db,
            table,
            from,
            to,
            limit,
            metadata_only,
        } => {
            let result = engine
                .dump(&DumpRequest {
                    db_pattern: db,
                    table,
                    from,
                    to,
                    limit,
                    metadata_only,
                })
                .await?;
            println!("{}\t{}", result.dump_root.display(), result.last_event_id);
        }
        Commands::Load {
            target_db,
            dump_root,
            table,
            metadata_only,
            no_parallel,
            move_optimization,
            max_ops,
        } => {
            let mut options = engine.default_load_options();
            options.table = table;
            options.metadata_only = metadata_only;
            options.parallel = options.parallel && !no_parallel;
            options.move_optimization = options.move_optimization || move_optimization;
            if let Some(max_ops) = max_ops {
                options.max_ops_per_iteration = max_ops;
            }

            let result = engine
                .load(&LoadRequest {
                    target_db,
                    dump_root,
                    options,
                })
                .await?;
            println!(
                "Loaded up to event {} ({} operations in {} iterations, {} steps already applied)",
                result.last_event_id, result.applied_ops, result.iterations, result.skipped_steps
            );
        }
        Commands::Status { db, table } => match engine.status(&db, table.as_deref()).await? {
            Some(id) => println!("{}", id),
            None => println!("NULL"),
        },
        Commands::PurgeCm => {
            let purged = engine.purge_cm().await?;
            println!("Purged {} CM entries", purged);
        }
        Commands::Init { .. } | Commands::Validate => {
            return Err(Error::Internal("command handled before engine start".into()));
        }
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# Wharf Configuration
# Generated configuration file

[source]
data_dir = "/var/lib/wharf/source"
message_format = "json-0.2"

[target]
data_dir = "/var/lib/wharf/replica"

[dump]
dump_dir = "/var/lib/wharf/dumps"
fetch_batch_size = 500

[cm]
enabled = true
retention_secs = 86400
max_dump_lag_secs = 43200

[load]
max_ops_per_iteration = 10000
parallel = true
workers = 0
move_optimization = false

[logging]
level = "info"
format = "pretty"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then dump with: wharf --config {} dump <db>", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    let config = WharfConfig::from_file(&config_path)?;
    println!("✓ Configuration is valid");
    println!("  Source:         {}", config.source.data_dir.display());
    println!("  Replica:        {}", config.target.data_dir.display());
    println!("  Dump dir:       {}", config.dump.dump_dir.display());
    println!(
        "  CM:             {} (retention {}s)",
        if config.cm.enabled { "enabled" } else { "disabled" },
        config.cm.retention_secs
    );
    println!("  Load workers:   {}", config.load_workers());
    println!();
    println!("{}", tuning::tuning_summary(&tuning::auto_tune()));
    Ok(())
}
