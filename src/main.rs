use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use attrwatch::config::{EngineConfig, LogFormat, LoggingConfig};
use attrwatch::detect::config::parse_timespan;
use attrwatch::detect::replay::export_limits;
use attrwatch::detect::{StrategyConfig, StrategyKind};
use attrwatch::model::{AttributeKey, AttributeUpdate};
use attrwatch::storage::SqliteStore;
use attrwatch::watch::{Entity, WatchRegistry};

#[derive(Parser)]
#[command(
    name = "attrwatch",
    about = "Continuous anomaly detection for entity attribute streams",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, env = "ATTRWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + ingest pipeline)
    Serve {
        /// Bind address, overriding the config file
        #[arg(long)]
        bind: Option<String>,
    },

    /// Classify newline-delimited JSON attribute updates
    Evaluate {
        /// Input file; reads stdin when omitted
        input: Option<PathBuf>,

        /// Do not store the updates as datapoints
        #[arg(long)]
        no_record: bool,
    },

    /// Print the limits a strategy would have drawn over stored history
    Limits {
        #[arg(long)]
        entity: String,

        #[arg(long)]
        attribute: String,

        /// Strategy kind: range or delta
        #[arg(long, default_value = "range")]
        kind: StrategyKind,

        /// Allowed deviation in percent
        #[arg(long, default_value = "10")]
        deviation: f64,

        /// Evaluation window, e.g. 30m, 2h, 1d
        #[arg(long, default_value = "1h")]
        timespan: String,

        /// Points required before limits are drawn
        #[arg(long, default_value = "10")]
        minimum_points: usize,
    },

    /// List watched attributes
    Watched {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Manage entity metadata
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },
}

#[derive(Subcommand)]
enum EntityAction {
    /// Insert or replace entities from a JSON file (one object or a list)
    Import {
        path: PathBuf,
    },

    /// Remove an entity and stop watching its attributes
    Delete {
        id: String,
    },
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = EngineConfig::resolve(cli.config.as_deref())?;
    init_logging(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.listen_address = bind;
            }
            tracing::info!(bind = %config.api.listen_address, "Starting attrwatch daemon");
            attrwatch::serve(&config).await?;
        }
        Commands::Evaluate { input, no_record } => {
            run_evaluate(&config, input, !no_record)?;
        }
        Commands::Limits {
            entity,
            attribute,
            kind,
            deviation,
            timespan,
            minimum_points,
        } => {
            let (store, _) = attrwatch::open_storage(&config)?;
            let strategy = StrategyConfig::new(kind, deviation, parse_timespan(&timespan)?, minimum_points);
            let export = export_limits(&store, &AttributeKey::new(entity, attribute), &strategy)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
        }
        Commands::Watched { json } => {
            let (store, _) = attrwatch::open_storage(&config)?;
            let registry = WatchRegistry::new();
            registry.load(&store)?;
            print_watched(&registry, json)?;
        }
        Commands::Entity { action } => {
            let (store, _) = attrwatch::open_storage(&config)?;
            run_entity(&store, action)?;
        }
    }

    Ok(())
}

fn run_evaluate(config: &EngineConfig, input: Option<PathBuf>, record: bool) -> Result<()> {
    let (store, alerts) = attrwatch::open_storage(config)?;
    let engine = attrwatch::build_engine(&store, &alerts)?;

    let reader: Box<dyn BufRead> = match &input {
        Some(path) => Box::new(BufReader::new(
            std::fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(std::io::stdin())),
    };

    let mut skipped = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let update: AttributeUpdate = match serde_json::from_str(&line) {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(line = index + 1, error = %e, "skipping malformed update");
                skipped += 1;
                continue;
            }
        };
        if record {
            store.record_update(&update)?;
        }
        let classification = engine.process(&update)?;
        println!(
            "{}",
            json!({
                "entity_id": update.entity_id,
                "attribute_name": update.attribute_name,
                "timestamp": update.timestamp,
                "classification": classification.map(|c| c.as_str()),
            })
        );
    }
    if skipped > 0 {
        tracing::warn!(skipped, "some input lines were not valid updates");
    }
    Ok(())
}

fn print_watched(registry: &WatchRegistry, as_json: bool) -> Result<()> {
    let entries: Vec<_> = registry.keys().into_iter().filter_map(|k| registry.get(&k)).collect();
    if as_json {
        let list: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "entity_id": e.key().entity_id,
                    "attribute_name": e.key().attribute_name,
                    "strategies": e.configs(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
    } else if entries.is_empty() {
        println!("No watched attributes.");
    } else {
        println!("{:<30} | Strategies", "Attribute");
        println!("{:-<30}-|-{:-<30}", "", "");
        for entry in entries {
            let kinds: Vec<&str> = entry.configs().iter().map(|c| c.kind.as_str()).collect();
            println!("{:<30} | {}", entry.key().to_string(), kinds.join(", "));
        }
    }
    Ok(())
}

fn run_entity(store: &SqliteStore, action: EntityAction) -> Result<()> {
    match action {
        EntityAction::Import { path } => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let value: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            let entities: Vec<Entity> = if value.is_array() {
                serde_json::from_value(value)?
            } else {
                vec![serde_json::from_value(value)?]
            };
            for entity in &entities {
                store.upsert_entity(entity)?;
                println!("Entity '{}' imported.", entity.id);
            }
        }
        EntityAction::Delete { id } => match store.delete_entity(&id)? {
            Some(_) => println!("Entity '{}' removed.", id),
            None => anyhow::bail!("entity '{}' not found", id),
        },
    }
    Ok(())
}
