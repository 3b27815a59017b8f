//! CardForge CLI - Operator interface over the ledger
//!
//! Commands: status, next, refs, diff, recover, requeue
//! Outputs JSON to stdout, logs to stderr
//! Returns non-zero on error

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;

use cardforge_core::artifacts::ArtifactStore;
use cardforge_core::controller::ItemReport;
use cardforge_core::sync::sync_diff;
use cardforge_core::telemetry::init_telemetry_with_level;
use cardforge_core::templates::TemplateRegistry;
use cardforge_core::{
    CardType, Category, ForgeConfig, ItemFilter, Ledger, Phase, Rarity, ReferenceSelector,
    Scheduler, Seq,
};

#[derive(Parser)]
#[command(name = "cardforge-cli")]
#[command(about = "CardForge CLI - Card Production Orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, default_value = "cardforge.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Phase counts and per-item state
    Status {
        /// Only items in this phase (e.g. failed, needs_rebuild)
        #[arg(short, long)]
        phase: Option<String>,
    },

    /// Preview the category the scheduler would allocate next
    Next,

    /// Preview the reference set for a category
    Refs {
        #[arg(short, long)]
        rarity: String,

        #[arg(short = 't', long)]
        card_type: String,

        /// Item to exclude (the card being generated)
        #[arg(short, long)]
        seq: Option<Seq>,
    },

    /// Done items the remote catalog does not reflect yet
    Diff,

    /// Open the ledger, resetting items left mid-phase, and report them
    Recover,

    /// Send a failed item back to pending
    Requeue { seq: Seq },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ForgeConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            println!("{}", json!({ "success": false, "error": e.to_string() }));
            return ExitCode::FAILURE;
        }
    };
    init_telemetry_with_level(&config.core.log_level);

    match run(cli.command, &config) {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to encode output: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            println!("{}", json!({ "success": false, "error": format!("{:#}", e) }));
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, config: &ForgeConfig) -> Result<Value> {
    let ledger = Ledger::open(config.ledger_dir())
        .with_context(|| format!("opening ledger at {}", config.ledger_dir().display()))?;

    match command {
        Commands::Status { phase } => {
            let snapshot = ledger.snapshot();
            let filter = match phase {
                Some(p) => ItemFilter::phase(parse_enum::<Phase>(&p.to_lowercase())?),
                None => ItemFilter::default(),
            };
            let items: Vec<ItemReport> = snapshot.filter(&filter).map(ItemReport::from_item).collect();
            Ok(json!({
                "total": snapshot.items.len(),
                "phases": snapshot.phase_counts(),
                "recovered": ledger.recovered(),
                "items": items,
            }))
        }

        Commands::Next => {
            let decision = Scheduler::from_config(&config.quotas).decide(&ledger.snapshot());
            Ok(serde_json::to_value(decision)?)
        }

        Commands::Refs {
            rarity,
            card_type,
            seq,
        } => {
            let category = Category::new(
                parse_enum::<CardType>(&card_type.to_uppercase())?,
                parse_enum::<Rarity>(&rarity.to_uppercase())?,
            );
            let registry = TemplateRegistry::load_from_dir(
                &config.core.templates_dir,
                &config.core.default_template,
            )
            .with_context(|| format!("loading templates from {}", config.core.templates_dir.display()))?;
            let template = registry
                .for_category(&category)
                .with_context(|| format!("no card template for {}", category))?;

            let references = ReferenceSelector::new(config.references.max_references).select(
                &category,
                seq,
                &ledger.snapshot(),
                &registry.image_path(template),
                &ArtifactStore::new(config.artifacts_dir()),
            );
            let entries: Vec<Value> = references
                .entries
                .iter()
                .map(|e| {
                    json!({
                        "seq": e.seq,
                        "role": e.role,
                        "label": e.label(),
                        "path": e.path,
                    })
                })
                .collect();
            Ok(json!({ "category": category, "template": template.id, "references": entries }))
        }

        Commands::Diff => {
            let diff = sync_diff(&ledger.snapshot());
            Ok(json!({ "count": diff.len(), "items": diff }))
        }

        Commands::Recover => Ok(json!({ "recovered": ledger.recovered() })),

        Commands::Requeue { seq } => {
            let item = ledger
                .requeue(seq)
                .with_context(|| format!("requeueing item {}", seq))?;
            Ok(json!({ "success": true, "item": ItemReport::from_item(&item) }))
        }
    }
}

/// Parse a serde enum from its wire name.
fn parse_enum<T: DeserializeOwned>(name: &str) -> Result<T> {
    serde_json::from_value(Value::String(name.to_string()))
        .with_context(|| format!("unknown value '{}'", name))
}
