//! Kolosal NAS CLI Module
//!
//! Builds the search graph, discretizes it and smoke-evaluates the child.

use clap::{Parser, ValueEnum};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::nas::{
    ArchOptimizerConfig, ArchitectureEvaluator, DartsArchOptimizer, EvaluationConfig, EvaluationResult,
    MacroGraph, OperationRegistry, SearchConfig,
};

// ─── Styling helpers ───────────────────────────────────────────────────────────

const W: usize = 58; // box inner width

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn line_box_top()    { println!("  {}", dim("┌─────────────────────────────────────────────────────────┐")); }
fn line_box_bottom() { println!("  {}", dim("└─────────────────────────────────────────────────────────┘")); }

fn line_box(content: &str) {
    let visible_len = strip_ansi(content).chars().count();
    let pad = W.saturating_sub(visible_len);
    println!("  {}  {}{} {}", dim("│"), content, " ".repeat(pad), dim("│"));
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::new();
    let mut in_escape = false;
    for c in s.chars() {
        if c == '\x1b' { in_escape = true; continue; }
        if in_escape { if c == 'm' { in_escape = false; } continue; }
        out.push(c);
    }
    out
}

fn kv(key: &str, val: &str) -> String {
    format!("{} {}", muted(&format!("{:<14}", key)), val.white())
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

// ─── CLI definition ────────────────────────────────────────────────────────────

/// Architecture optimizer the search is run with
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchOptimizer {
    #[value(name = "DARTSOptimizer")]
    Darts,
    #[value(name = "GDASOptimizer")]
    Gdas,
    #[value(name = "PCDARTSOptimizer")]
    PcDarts,
}

impl SearchOptimizer {
    pub fn name(&self) -> &'static str {
        match self {
            SearchOptimizer::Darts => "DARTSOptimizer",
            SearchOptimizer::Gdas => "GDASOptimizer",
            SearchOptimizer::PcDarts => "PCDARTSOptimizer",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kolosal-nas")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Differentiable neural architecture search in Rust")]
#[command(long_about = None)]
pub struct Cli {
    /// Architecture optimizer
    #[arg(long, value_enum, default_value = "DARTSOptimizer")]
    pub optimizer: SearchOptimizer,

    /// Random seed
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Dataset (cifar10, cifar100, ImageNet16-120)
    #[arg(long, default_value = "cifar10")]
    pub dataset: String,

    /// Search epochs
    #[arg(long, default_value = "50")]
    pub epochs: usize,

    /// Final evaluation config name, read from <config-dir>/<config>.json
    #[arg(long, default_value = "final_eval")]
    pub config: String,

    /// Directory holding default.json and the final evaluation configs
    #[arg(long, default_value = "configs")]
    pub config_dir: PathBuf,
}

/// Files written by a run
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub search_topology: PathBuf,
    pub final_topology: PathBuf,
    pub evaluation: EvaluationResult,
}

fn apply_overrides(mut config: SearchConfig, cli: &Cli) -> SearchConfig {
    let save = config.save.join(cli.optimizer.name()).join(&cli.dataset);
    config.seed = cli.seed;
    config.dataset = cli.dataset.clone();
    config.epochs = cli.epochs;
    config.save = save;
    config
}

fn load_config(path: &Path) -> anyhow::Result<SearchConfig> {
    SearchConfig::from_file(path).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
}

/// Search → discretize → evaluate
pub fn run(cli: &Cli) -> anyhow::Result<RunSummary> {
    section("Search");

    let search_config = apply_overrides(load_config(&cli.config_dir.join("default.json"))?, cli);
    std::fs::create_dir_all(&search_config.save)?;
    let registry = Arc::new(OperationRegistry::darts());
    info!(
        optimizer = cli.optimizer.name(),
        dataset = %search_config.dataset,
        seed = search_config.seed,
        save = %search_config.save.display(),
        "Starting search run"
    );

    step_run("Building search graph");
    let start = Instant::now();
    let search_topology = search_config.save.join("graph.json");
    let graph = MacroGraph::from_config(&search_config, &search_topology, Arc::clone(&registry))?;
    let mut arch_optimizer = DartsArchOptimizer::new(ArchOptimizerConfig::default());
    graph.parse(&mut arch_optimizer);
    step_done(&format!(
        "{} cells, {} arch weights in {:?}",
        graph.num_cells(),
        arch_optimizer.num_arch_weights(),
        start.elapsed()
    ));

    section("Discretize");

    let final_config = apply_overrides(load_config(&cli.config_dir.join(format!("{}.json", cli.config)))?, cli);
    std::fs::create_dir_all(&final_config.save)?;
    let steps = graph.cell(0).map_or(search_config.steps, |c| c.inter_nodes().len());
    let n_input_edges = final_config.n_input_edges.clone().unwrap_or_else(|| vec![2; steps]);

    step_run("Selecting edges");
    let start = Instant::now();
    let final_arch = graph.discretize(&final_config, &n_input_edges)?;
    drop(graph);
    let final_topology = final_config.save.join("final_graph.json");
    final_arch.save_topology(&final_topology)?;
    step_done(&format!("{} edges kept in {:?}", final_arch.topology().num_edges(), start.elapsed()));

    let mut final_optimizer = DartsArchOptimizer::new(ArchOptimizerConfig::default());
    final_arch.parse(&mut final_optimizer);

    section("Evaluate");

    step_run("Forward pass");
    let mut evaluator = ArchitectureEvaluator::new(EvaluationConfig::from(&final_config));
    let evaluation = evaluator.evaluate(&final_arch)?;
    step_done(&format!("{:.1} ms", evaluation.forward_time * 1e3));

    println!();
    line_box_top();
    line_box(&kv("Optimizer", cli.optimizer.name()));
    line_box(&kv("Dataset", &final_config.dataset));
    line_box(&kv("Cells", &final_arch.num_cells().to_string()));
    line_box(&kv("Parameters", &final_optimizer.num_parameters().to_string()));
    line_box(&kv("FLOPs", &evaluation.flops.unwrap_or(0).to_string()));
    line_box(&kv("Output", &format!("{:?}", evaluation.output_shape)));
    line_box(&kv("Topology", &final_topology.display().to_string()));
    line_box_bottom();
    println!();

    Ok(RunSummary {
        search_topology,
        final_topology,
        evaluation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let cli = Cli::try_parse_from(["kolosal-nas"]).unwrap();
        assert_eq!(cli.optimizer, SearchOptimizer::Darts);
        assert_eq!(cli.seed, 1);
        assert_eq!(cli.config, "final_eval");
        assert_eq!(cli.config_dir, PathBuf::from("configs"));
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "kolosal-nas",
            "--optimizer",
            "GDASOptimizer",
            "--seed",
            "7",
            "--dataset",
            "cifar100",
            "--epochs",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.optimizer, SearchOptimizer::Gdas);
        assert_eq!(cli.seed, 7);
        assert_eq!(cli.epochs, 3);
        assert!(Cli::try_parse_from(["kolosal-nas", "--optimizer", "SGD"]).is_err());
    }

    #[test]
    fn test_overrides_nest_save_dir() {
        let cli = Cli::try_parse_from(["kolosal-nas", "--dataset", "cifar100", "--seed", "4"]).unwrap();
        let config = apply_overrides(SearchConfig::default().with_save("out"), &cli);
        assert_eq!(config.save, PathBuf::from("out").join("DARTSOptimizer").join("cifar100"));
        assert_eq!(config.seed, 4);
        assert_eq!(config.num_classes().unwrap(), 100);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[1mbold\x1b[0m"), "bold");
    }

    #[test]
    fn test_run_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("configs");
        std::fs::create_dir_all(&config_dir).unwrap();
        let base = SearchConfig::default()
            .with_channels(4)
            .with_layers(3)
            .with_steps(2)
            .with_input_size(8)
            .with_save(dir.path().join("save"));
        base.save(config_dir.join("default.json")).unwrap();
        base.clone().with_layers(4).save(config_dir.join("final_eval.json")).unwrap();

        let args: Vec<std::ffi::OsString> =
            vec!["kolosal-nas".into(), "--config-dir".into(), config_dir.into_os_string()];
        let cli = Cli::try_parse_from(args).unwrap();
        let summary = run(&cli).unwrap();
        assert!(summary.search_topology.exists());
        assert!(summary.final_topology.exists());
        assert_eq!(summary.evaluation.output_shape, vec![2, 10]);
    }
}
