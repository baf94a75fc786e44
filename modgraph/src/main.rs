//! Inspect LM program graphs described as JSON.
//!
//! Reads a graph description (see `io::graph_file`) and reports its
//! predictors by dotted path. `get-lm` is experimental and honors the
//! settings file and `MODGRAPH_EXPERIMENTAL`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use modgraph::error::ProgramError;
use modgraph::exit_codes;
use modgraph::io::graph_file::load_graph;
use modgraph::io::settings::load_settings;
use modgraph::logging;

#[derive(Parser)]
#[command(
    name = "modgraph",
    version,
    about = "Inspect predictors in language-model program graphs"
)]
struct Cli {
    /// Settings file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "modgraph.toml")]
    settings: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print every predictor as `path<TAB>signature<TAB>model`.
    List { graph: PathBuf },
    /// Print `path = predictor`, one per line.
    Show { graph: PathBuf },
    /// Print the single model used by all predictors (experimental).
    GetLm { graph: PathBuf },
    /// Print the predictor configuration snapshot as JSON.
    State { graph: PathBuf },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::List { graph } => cmd_list(&graph),
        Command::Show { graph } => cmd_show(&graph),
        Command::GetLm { graph } => cmd_get_lm(&graph, &cli.settings),
        Command::State { graph } => cmd_state(&graph),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ProgramError>() {
        Some(ProgramError::InconsistentLm { .. }) => exit_codes::INCONSISTENT_LM,
        Some(ProgramError::FeatureGated { .. }) => exit_codes::FEATURE_GATED,
        _ => exit_codes::INVALID,
    }
}

fn cmd_list(graph: &Path) -> Result<()> {
    let module = load_graph(graph)?;
    for (path, predictor) in module.named_predictors() {
        let model = predictor
            .lm
            .as_ref()
            .map_or("-", |lm| lm.config().model.as_str());
        println!("{}\t{}\t{}", path, predictor.signature, model);
    }
    Ok(())
}

fn cmd_show(graph: &Path) -> Result<()> {
    let module = load_graph(graph)?;
    let rendered = module.to_string();
    if !rendered.is_empty() {
        println!("{}", rendered);
    }
    Ok(())
}

fn cmd_get_lm(graph: &Path, settings_path: &Path) -> Result<()> {
    let settings = load_settings(settings_path)?;
    let module = load_graph(graph)?;
    let lm = module
        .get_lm(&settings)
        .with_context(|| format!("get lm for {}", graph.display()))?;
    match lm {
        Some(lm) => println!("{}", lm.config().model),
        None => println!("-"),
    }
    Ok(())
}

fn cmd_state(graph: &Path) -> Result<()> {
    let module = load_graph(graph)?;
    let state = module.dump_state()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&state).context("serialize state")?
    );
    Ok(())
}
