//! `flowquery` CLI entry-point.
//!
//! Available sub-commands:
//! - `schema`  — print the platform schema (or one entity of it).
//! - `explain` — validate descriptors and print the storage batches they plan to.
//! - `run`     — run descriptors against an in-memory store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::{Client, ClientConfig, Descriptor, Planner};
use schema::platform::platform_registry;
use schema::{Entity, RelationLink};
use serde_json::{json, Value};
use storage::MemoryStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "flowquery",
    about = "Typed query client for the workflow-automation platform",
    version
)]
struct Cli {
    /// Client configuration (JSON).
    #[arg(long, global = true, env = "FLOWQUERY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the schema registry.
    Schema {
        /// Only this entity.
        #[arg(long)]
        entity: Option<String>,
    },
    /// Plan descriptors without running them.
    Explain {
        /// Descriptor file: one descriptor or a list.
        path: PathBuf,
    },
    /// Run descriptors against a fresh in-memory store.
    Run {
        /// Descriptor file: one descriptor or a list.
        path: PathBuf,
        /// Descriptors run first to populate the store; their results are not printed.
        #[arg(long)]
        seed: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(platform_registry().context("platform schema is invalid")?);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Schema { entity } => {
            let rendered = match entity {
                Some(name) => describe(registry.entity(&name)?),
                None => Value::Array(registry.entities().map(describe).collect()),
            };
            print_json(&rendered)?;
        }
        Command::Explain { path } => {
            config.validate(&registry)?;
            let planner = Planner::new(&registry, &config);
            let mut plans = Vec::new();
            for descriptor in read_descriptors(&path)? {
                let plan = planner
                    .plan(&descriptor.entity, descriptor.operation, &descriptor.args)
                    .with_context(|| format!("planning {} {}", descriptor.operation, descriptor.entity))?;
                plans.push(plan.explain());
            }
            print_json(&Value::Array(plans))?;
        }
        Command::Run { path, seed } => {
            let store = MemoryStore::with_options(registry.clone(), &config.executor)
                .context("invalid executor options")?;
            let client = Client::new(registry.clone(), Arc::new(store), config)?;

            if let Some(seed) = seed {
                let descriptors = read_descriptors(&seed)?;
                info!("seeding with {} descriptors from {}", descriptors.len(), seed.display());
                for descriptor in &descriptors {
                    client
                        .dispatch(descriptor)
                        .await
                        .with_context(|| format!("seed {} {}", descriptor.operation, descriptor.entity))?;
                }
            }

            let mut results = Vec::new();
            for descriptor in read_descriptors(&path)? {
                let result = client
                    .dispatch(&descriptor)
                    .await
                    .with_context(|| format!("{} {}", descriptor.operation, descriptor.entity))?;
                results.push(json!({
                    "entity": descriptor.entity,
                    "operation": descriptor.operation,
                    "result": result,
                }));
            }
            print_json(&Value::Array(results))?;
        }
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let Some(path) = path else {
        return Ok(ClientConfig::default());
    };
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read config {}", path.display()))?;
    let config = serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))?;
    info!("loaded client config from {}", path.display());
    Ok(config)
}

fn read_descriptors(path: &Path) -> Result<Vec<Descriptor>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read descriptors {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))?;
    let descriptors = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<Descriptor>, _>>(),
        single => serde_json::from_value(single).map(|d| vec![d]),
    }
    .with_context(|| format!("malformed descriptor in {}", path.display()))?;
    if descriptors.is_empty() {
        bail!("{} holds no descriptors", path.display());
    }
    Ok(descriptors)
}

fn describe(entity: &Entity) -> Value {
    let fields: Vec<Value> = entity
        .fields
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "type": f.kind.label(),
                "list": f.list,
                "nullable": f.nullable,
                "hasDefault": f.default.is_some() || f.updated_at,
            })
        })
        .collect();
    let relations: Vec<Value> = entity
        .relations
        .iter()
        .map(|r| {
            let mut out = json!({
                "name": r.name,
                "target": r.target,
                "cardinality": r.cardinality,
            });
            if let RelationLink::Owned { fields, references, .. } = &r.link {
                out["fields"] = json!(fields);
                out["references"] = json!(references);
                out["onDelete"] = json!(r.on_delete_action());
            }
            out
        })
        .collect();
    let uniques: Vec<Value> = entity
        .unique_constraints()
        .map(|u| json!({"name": u.name, "fields": u.fields}))
        .collect();
    json!({
        "name": entity.name,
        "fields": fields,
        "relations": relations,
        "identity": entity.identity.name,
        "uniques": uniques,
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

