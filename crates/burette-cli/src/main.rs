use anyhow::{Context, Result};
use burette_core::{DefinitionError, ExperimentDefinition, MergeStrategy};
use burette_runner::{summarize_definition, ComponentSummary, DefinitionSummary};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "burette",
    version,
    about = "Repeatable live digital forensic experiment definitions"
)]
struct Cli {
    /// Raise the log filter to debug.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a definition document, reporting every violated constraint.
    Validate {
        definition: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Show how a definition will resolve: components, effective
    /// parameters, canonical digest.
    Describe {
        definition: PathBuf,
        /// Merge nested parameter mappings recursively instead of
        /// replacing them wholesale.
        #[arg(long)]
        deep_merge: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Validate { definition, json } => validate(&definition, json),
        Commands::Describe {
            definition,
            deep_merge,
            json,
        } => {
            let strategy = if deep_merge {
                MergeStrategy::Deep
            } else {
                MergeStrategy::Replace
            };
            describe(&definition, strategy, json)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_document(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn validate(path: &Path, json_mode: bool) -> Result<()> {
    let document = load_document(path)?;
    match ExperimentDefinition::from_yaml_str(&document) {
        Ok(definition) => {
            if json_mode {
                emit_json(&json!({"ok": true, "experiment": definition.name()}));
            } else {
                println!("{}: ok", definition.name());
            }
            Ok(())
        }
        Err(DefinitionError::Malformed { violations }) => {
            if json_mode {
                emit_json(&json!({"ok": false, "violations": violations}));
            } else {
                for violation in &violations {
                    eprintln!("{violation}");
                }
            }
            std::process::exit(1);
        }
        Err(err) => Err(err.into()),
    }
}

fn describe(path: &Path, strategy: MergeStrategy, json_mode: bool) -> Result<()> {
    let document = load_document(path)?;
    let definition = ExperimentDefinition::from_yaml_str(&document)
        .with_context(|| format!("validating {}", path.display()))?;
    let summary = summarize_definition(&definition, strategy)?;
    if json_mode {
        emit_json(&summary_to_json(&summary));
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn summary_to_json(summary: &DefinitionSummary) -> Value {
    json!({
        "experiment": summary.experiment,
        "repetitions": summary.repetitions,
        "technique": component_to_json(&summary.technique),
        "analysts": summary.analysts.iter().map(component_to_json).collect::<Vec<_>>(),
        "digest": summary.digest,
    })
}

fn component_to_json(component: &ComponentSummary) -> Value {
    json!({
        "name": component.name,
        "parameters": component.effective_parameters,
    })
}

fn print_summary(summary: &DefinitionSummary) {
    println!("experiment: {}", summary.experiment);
    println!("repetitions: {}", summary.repetitions);
    println!(
        "technique: {} ({} parameters)",
        summary.technique.name,
        summary.technique.effective_parameters.len()
    );
    for analyst in &summary.analysts {
        println!(
            "analyst: {} ({} parameters)",
            analyst.name,
            analyst.effective_parameters.len()
        );
    }
    println!("digest: {}", summary.digest);
}

fn emit_json(value: &Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}
