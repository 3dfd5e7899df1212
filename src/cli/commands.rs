//! CLI command definitions for pattern-forge.
//!
//! - `generate` expands patterns into a validated JSONL dataset.
//! - `lint` renders one sample per pattern and runs the static checks.
//! - `check` renders one sample per pattern and runs the full pipeline.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::stream::{self, StreamExt};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::generator::resolver::{BindingResolver, Resolution};
use crate::generator::{CandidateSample, SampleGenerator};
use crate::metrics::GenerationMetrics;
use crate::orchestrator::{
    diagnostics_channel, parse_quota, GenerationConfig, GenerationOrchestrator, QuotaCeiling,
    RunReport,
};
use crate::pattern::{Pattern, PatternRegistry};
use crate::sink::{existing_fingerprints, JsonlSink};
use crate::validation::{DeepAnalysisPolicy, PipelineConfig, Rejection, ValidationPipeline};

/// Default output file for generated datasets.
const DEFAULT_OUTPUT: &str = "dataset.jsonl";

/// Default pattern directory.
const DEFAULT_PATTERNS_DIR: &str = "patterns";

/// Combinatorial generator of validated Python training samples.
#[derive(Parser)]
#[command(name = "pattern-forge")]
#[command(about = "Expand code patterns into validated, labeled training samples")]
#[command(version)]
#[command(
    long_about = "pattern-forge expands human-authored code patterns into many distinct Python samples.\n\nEvery sample is paired with an instruction and must pass syntax, style, optional deep analysis and sandboxed execution before it is written.\n\nExample usage:\n  pattern-forge generate --patterns ./patterns --target 500 --quota 0.2 --output dataset.jsonl"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate a dataset from patterns.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Render one sample per pattern and run syntax and style checks.
    Lint(LintArgs),

    /// Render one sample per pattern and run the full validation pipeline.
    Check(CheckArgs),
}

/// Pattern source options shared by all commands.
#[derive(clap::Args, Debug, Clone)]
pub struct PatternSource {
    /// Directories containing pattern YAML files.
    #[arg(short, long = "patterns", num_args = 1.., default_value = DEFAULT_PATTERNS_DIR)]
    pub patterns: Vec<PathBuf>,

    /// Descend into subdirectories.
    #[arg(short, long)]
    pub recursive: bool,
}

/// Sandbox options shared by `generate` and `check`.
#[derive(clap::Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Python interpreter used for parsing and execution.
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Run candidates inside this Docker image instead of under bubblewrap.
    #[arg(long, value_name = "IMAGE")]
    pub docker: Option<String>,

    /// Run candidates as plain local processes, without network or
    /// filesystem confinement. Every run logs a warning.
    #[arg(long, conflicts_with = "docker")]
    pub unconfined: bool,

    /// Execution timeout per candidate, in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Enable the deep-analysis stage.
    #[arg(long)]
    pub deep_analysis: bool,

    /// Record deep-analysis findings instead of rejecting.
    #[arg(long, requires = "deep_analysis")]
    pub advisory: bool,
}

/// Arguments for `pattern-forge generate`.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    #[command(flatten)]
    pub source: PatternSource,

    #[command(flatten)]
    pub sandbox: SandboxArgs,

    /// Number of accepted samples to produce.
    #[arg(short = 'n', long)]
    pub target: Option<usize>,

    /// Per-pattern ceiling as a fraction or percentage of the target (0.2, 20%).
    #[arg(long, conflicts_with = "quota_count")]
    pub quota: Option<String>,

    /// Per-pattern ceiling as an absolute count.
    #[arg(long)]
    pub quota_count: Option<usize>,

    /// Failed random draws before a pattern counts as exhausted.
    #[arg(long)]
    pub max_draws: Option<u32>,

    /// Validated candidates per pattern before it counts as exhausted.
    #[arg(long)]
    pub max_attempts: Option<usize>,

    /// Candidates validated concurrently.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Seed for binding draws.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Lowest pattern complexity to use.
    #[arg(long)]
    pub min_complexity: Option<u8>,

    /// Highest pattern complexity to use.
    #[arg(long)]
    pub max_complexity: Option<u8>,

    /// Only use patterns of these categories (repeatable).
    #[arg(short, long = "category")]
    pub categories: Vec<String>,

    /// Output JSONL file.
    #[arg(short, long, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Append to the output file and skip samples it already contains.
    #[arg(long)]
    pub resume: bool,

    /// Write rejected candidates to this JSONL file.
    #[arg(long, value_name = "FILE")]
    pub diagnostics: Option<PathBuf>,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long, value_name = "FILE")]
    pub metrics_out: Option<PathBuf>,

    /// Print the run report as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `pattern-forge lint`.
#[derive(Parser, Debug)]
pub struct LintArgs {
    #[command(flatten)]
    pub source: PatternSource,

    /// Python interpreter used for parsing.
    #[arg(long)]
    pub interpreter: Option<String>,

    /// Patterns checked concurrently.
    #[arg(long, default_value = "8")]
    pub concurrency: usize,

    /// Seed for the sample assignment.
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Print results as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `pattern-forge check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub source: PatternSource,

    #[command(flatten)]
    pub sandbox: SandboxArgs,

    /// Patterns checked concurrently.
    #[arg(long, default_value = "4")]
    pub concurrency: usize,

    /// Seed for the sample assignment.
    #[arg(long, default_value = "0")]
    pub seed: u64,

    /// Print results as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Generate(args) => run_generate_command(args).await?,
        Commands::Lint(args) => run_lint_command(args).await?,
        Commands::Check(args) => run_check_command(args).await?,
    }
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Loads patterns from every directory, merging them into one registry.
fn load_patterns(source: &PatternSource) -> anyhow::Result<PatternRegistry> {
    let mut registry = PatternRegistry::new();
    for dir in &source.patterns {
        let mut part = PatternRegistry::new();
        let count = if source.recursive {
            part.load_directory_recursive(dir)
        } else {
            part.load_directory(dir)
        }
        .with_context(|| format!("Failed to read pattern directory {}", dir.display()))?;
        info!(dir = %dir.display(), count, "Loaded patterns");
        registry.merge(part);
    }
    for w in registry.warnings() {
        warn!(path = %w.path.display(), error = %w.error, "Pattern skipped");
    }
    Ok(registry)
}

fn apply_sandbox_args(config: &mut GenerationConfig, args: &SandboxArgs) {
    if let Some(interpreter) = &args.interpreter {
        config.sandbox.interpreter = interpreter.clone();
    }
    if let Some(image) = &args.docker {
        config.sandbox = config.sandbox.clone().with_docker(image.clone());
    }
    if args.unconfined {
        config.sandbox = config.sandbox.clone().unconfined();
    }
    if let Some(secs) = args.timeout {
        config.execution_timeout = Duration::from_secs(secs);
    }
    if args.deep_analysis {
        config.deep_analysis = true;
    }
    if args.advisory {
        config.deep_analysis_policy = DeepAnalysisPolicy::Advisory;
    }
}

/// Applies command-line overrides on top of a base configuration.
fn build_config(args: &GenerateArgs, base: GenerationConfig) -> anyhow::Result<GenerationConfig> {
    let mut config = base;
    apply_sandbox_args(&mut config, &args.sandbox);

    if let Some(target) = args.target {
        config.target = target;
    }
    if let Some(quota) = &args.quota {
        config.quota = parse_quota(quota)?;
    }
    if let Some(count) = args.quota_count {
        config.quota = QuotaCeiling::Absolute(count);
    }
    if let Some(max_draws) = args.max_draws {
        config.max_draws = max_draws;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts_per_pattern = Some(max_attempts);
    }
    if let Some(concurrency) = args.concurrency {
        config.max_concurrent_validations = concurrency;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(min) = args.min_complexity {
        config.complexity_range.0 = min;
    }
    if let Some(max) = args.max_complexity {
        config.complexity_range.1 = max;
    }
    if !args.categories.is_empty() {
        config.categories = args.categories.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Renders one sample of a pattern.
fn render_sample(pattern: &Pattern, seed: u64) -> Result<CandidateSample, String> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    match BindingResolver::default().resolve(pattern, &HashSet::new(), &mut rng) {
        Resolution::Assigned(assignment) => SampleGenerator::new()
            .generate(pattern, assignment)
            .map_err(|e| e.to_string()),
        Resolution::Exhausted(_) => Err("no assignment satisfies the constraints".to_string()),
    }
}

/// Suggested fixes for a rejection.
fn suggestions(rejection: &Rejection) -> Vec<String> {
    let mut out = Vec::new();
    match rejection {
        Rejection::SyntaxInvalid { line, .. } => {
            out.push(format!(
                "fix the template around rendered line {}; check indentation of inserted values",
                line
            ));
        }
        Rejection::StyleViolation { violations } | Rejection::DeepAnalysisFlag { flags: violations } => {
            for v in violations {
                let hint = match v.code.as_str() {
                    "F401" => {
                        let name = v.message.split('\'').nth(1).unwrap_or("the import");
                        format!("remove `{}` from `requires`, or use it in the template", name)
                    }
                    "F403" => "import the names you need explicitly instead of `*`".to_string(),
                    "F821" => {
                        let name = v.message.split('\'').nth(1).unwrap_or("the name");
                        format!("add the import for `{}` to `requires`, or define it in the template", name)
                    }
                    "F841" => "drop the unused local or return it".to_string(),
                    "E401" => "put each import in `requires` on its own entry".to_string(),
                    "W291" | "W293" => "strip trailing whitespace from the template".to_string(),
                    "W191" => "indent with spaces, not tabs".to_string(),
                    "E501" => "shorten the line or wrap long pool values".to_string(),
                    "E711" => "compare to None with `is` / `is not`".to_string(),
                    "E712" => "use the truth value directly instead of comparing to True/False".to_string(),
                    "E722" => "catch a specific exception instead of a bare `except:`".to_string(),
                    "E731" => "define a function with `def` instead of assigning a lambda".to_string(),
                    "E702" | "E703" => "put one statement per line without trailing semicolons".to_string(),
                    "W391" => "remove blank lines at the end of the template".to_string(),
                    "W0102" => "use None as the default and create the container inside".to_string(),
                    "W0122" | "W0123" => "avoid exec/eval in generated code".to_string(),
                    _ => continue,
                };
                if !out.contains(&hint) {
                    out.push(hint);
                }
            }
        }
        Rejection::ExecutionFailed(_) => {
            out.push("run the rendered sample locally with its checks to see the failure".to_string());
        }
    }
    out
}

/// Outcome of checking one pattern.
#[derive(Debug, Clone, Serialize)]
struct PatternCheck {
    pattern_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    passed: bool,
    /// Stage that failed, or `load` / `render`.
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    suggestions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    advisories: Vec<String>,
}

/// Summary printed by `lint` and `check`.
#[derive(Debug, Serialize)]
struct CheckSummary {
    total: usize,
    passed: usize,
    failed: usize,
    by_stage: BTreeMap<String, usize>,
    patterns: Vec<PatternCheck>,
}

impl CheckSummary {
    fn new(mut patterns: Vec<PatternCheck>) -> Self {
        patterns.sort_by(|a, b| a.pattern_id.cmp(&b.pattern_id));
        let mut by_stage = BTreeMap::new();
        for p in &patterns {
            if let Some(stage) = &p.failed_at {
                *by_stage.entry(stage.clone()).or_insert(0) += 1;
            }
        }
        let passed = patterns.iter().filter(|p| p.passed).count();
        Self {
            total: patterns.len(),
            passed,
            failed: patterns.len() - passed,
            by_stage,
            patterns,
        }
    }

    fn print(&self, verbose_suggestions: bool) {
        for p in &self.patterns {
            let mark = if p.passed { "PASS" } else { "FAIL" };
            println!("{} {}", mark, p.pattern_id);
            if let Some(path) = &p.path {
                if !p.passed {
                    println!("     file: {}", path);
                }
            }
            if let (Some(stage), Some(detail)) = (&p.failed_at, &p.detail) {
                println!("     {}: {}", stage, detail);
            }
            for a in &p.advisories {
                println!("     advisory: {}", a);
            }
            if verbose_suggestions {
                for s in &p.suggestions {
                    println!("     suggestion: {}", s);
                }
            }
        }
        println!();
        println!(
            "{} pattern(s): {} passed, {} failed",
            self.total, self.passed, self.failed
        );
        if !self.by_stage.is_empty() {
            let parts: Vec<String> = self
                .by_stage
                .iter()
                .map(|(stage, n)| format!("{}={}", stage, n))
                .collect();
            println!("failures by stage: {}", parts.join(", "));
        }
    }
}

/// Renders and validates one sample of every loaded pattern.
async fn check_patterns(
    registry: PatternRegistry,
    pipeline: ValidationPipeline,
    concurrency: usize,
    seed: u64,
) -> anyhow::Result<CheckSummary> {
    let mut results: Vec<PatternCheck> = registry
        .warnings()
        .iter()
        .map(|w| PatternCheck {
            pattern_id: w
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: Some(w.path.display().to_string()),
            passed: false,
            failed_at: Some("load".to_string()),
            detail: Some(w.error.to_string()),
            suggestions: Vec::new(),
            advisories: Vec::new(),
        })
        .collect();

    let paths: BTreeMap<String, String> = registry
        .iter()
        .filter_map(|p| {
            registry
                .get_path(&p.id)
                .map(|path| (p.id.clone(), path.display().to_string()))
        })
        .collect();

    let pipeline = Arc::new(pipeline);
    let checked: Vec<anyhow::Result<PatternCheck>> = stream::iter(registry.into_patterns())
        .map(|pattern| {
            let path = paths.get(&pattern.id).cloned();
            check_one(Arc::clone(&pipeline), pattern, path, seed)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for result in checked {
        results.push(result?);
    }
    Ok(CheckSummary::new(results))
}

/// Renders and validates one sample of a pattern.
async fn check_one(
    pipeline: Arc<ValidationPipeline>,
    pattern: Pattern,
    path: Option<String>,
    seed: u64,
) -> anyhow::Result<PatternCheck> {
    let candidate = match render_sample(&pattern, seed) {
        Ok(candidate) => candidate,
        Err(detail) => {
            return Ok(PatternCheck {
                pattern_id: pattern.id,
                path,
                passed: false,
                failed_at: Some("render".to_string()),
                detail: Some(detail),
                suggestions: Vec::new(),
                advisories: Vec::new(),
            })
        }
    };
    let verdict = pipeline
        .validate(&candidate)
        .await
        .with_context(|| format!("Validation failed to run for {}", pattern.id))?;

    Ok(PatternCheck {
        pattern_id: pattern.id,
        path,
        passed: verdict.accepted,
        failed_at: verdict.failing_stage.map(|s| s.to_string()),
        detail: verdict.rejection.as_ref().map(|r| r.to_string()),
        suggestions: verdict.rejection.as_ref().map(suggestions).unwrap_or_default(),
        advisories: verdict.advisories.iter().map(|v| v.to_string()).collect(),
    })
}

fn finish_check(summary: &CheckSummary, json: bool, suggestions: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        summary.print(suggestions);
    }
    if summary.failed > 0 {
        anyhow::bail!("{} of {} pattern(s) failed", summary.failed, summary.total);
    }
    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_generate_command(args: GenerateArgs) -> anyhow::Result<()> {
    let base = GenerationConfig::from_env().context("Invalid FORGE_* environment")?;
    let config = build_config(&args, base)?;

    let registry = load_patterns(&args.source)?;
    if registry.is_empty() {
        anyhow::bail!("No valid patterns found in {:?}", args.source.patterns);
    }

    let metrics = Arc::new(GenerationMetrics::new()?);
    let mut orchestrator = GenerationOrchestrator::new(config)?.with_metrics(metrics.clone());

    let mut sink = if args.resume {
        let fingerprints = existing_fingerprints(&args.output).await?;
        info!(existing = fingerprints.len(), output = %args.output.display(), "Resuming into existing dataset");
        orchestrator = orchestrator.with_seed_fingerprints(fingerprints);
        JsonlSink::append(&args.output).await?
    } else {
        JsonlSink::create(&args.output).await?
    };

    let diagnostics_task = match &args.diagnostics {
        Some(path) => {
            let (tx, mut records) = diagnostics_channel();
            orchestrator = orchestrator.with_diagnostics(tx);
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Some(tokio::spawn(async move {
                while let Some(record) = records.next().await {
                    let mut line = serde_json::to_string(&record)?;
                    line.push('\n');
                    file.write_all(line.as_bytes()).await?;
                }
                file.flush().await?;
                Ok::<(), anyhow::Error>(())
            }))
        }
        None => None,
    };

    let cancel = orchestrator.cancellation_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight validations");
            cancel.cancel();
        }
    });

    let result = orchestrator.run(registry.into_patterns(), &mut sink).await;
    sink.close().await?;
    // Closes the diagnostics channel.
    drop(orchestrator);
    if let Some(task) = diagnostics_task {
        task.await??;
    }

    if let Some(path) = &args.metrics_out {
        tokio::fs::write(path, metrics.export())
            .await
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    match result {
        Ok(report) => {
            print_report(&report, &args.output, args.json)?;
            Ok(())
        }
        Err(e) => {
            if let Some(report) = e.report() {
                print_report(report, &args.output, args.json)?;
            }
            Err(e.into())
        }
    }
}

fn print_report(report: &RunReport, output: &Path, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.summary());
        println!("Dataset: {}", output.display());
    }
    Ok(())
}

async fn run_lint_command(args: LintArgs) -> anyhow::Result<()> {
    let registry = load_patterns(&args.source)?;
    let mut config = PipelineConfig::default();
    if let Some(interpreter) = &args.interpreter {
        config.sandbox.interpreter = interpreter.clone();
    }
    let pipeline = ValidationPipeline::static_checks(&config);
    let summary = check_patterns(registry, pipeline, args.concurrency, args.seed).await?;
    finish_check(&summary, args.json, true)
}

async fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let mut config = GenerationConfig::from_env().context("Invalid FORGE_* environment")?;
    apply_sandbox_args(&mut config, &args.sandbox);
    config.validate()?;

    let registry = load_patterns(&args.source)?;
    let pipeline = ValidationPipeline::new(&config.pipeline_config());
    pipeline.prepare().await?;
    let summary = check_patterns(registry, pipeline, args.concurrency, args.seed).await?;
    finish_check(&summary, args.json, true)
}
