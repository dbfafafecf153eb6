//! CLI adapter for the harness. Three subcommands grouped under one
//! top-level tool, built around a `Cli`/`Commands` clap-derive shape and a
//! `Reporter`/`CliReporter` pattern: `plan` drives the planner, `run` drives
//! the factory for a single work order, `run-all` sequences every
//! `WO-NN.json` in a directory through `run`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harness::factory::{self, FactoryConfig, Reporter};
use harness::llm::LlmClient;
use harness::plancompile::{self, CompileOptions};
use harness_types::WorkOrder;

#[derive(Parser, Debug)]
#[command(name = "harness", version, about = "LLM code-generation harness: plan, run, run-all")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a product spec into a validated work-order manifest.
    Plan(PlanArgs),
    /// Execute a single work order against a target repo.
    Run(RunArgs),
    /// Sequentially run every `WO-NN.json` in a directory, stop on failure.
    RunAll(RunAllArgs),
}

#[derive(Parser, Debug, Clone)]
struct PlanArgs {
    #[arg(long)]
    spec: PathBuf,
    #[arg(long, default_value = "work_orders")]
    outdir: PathBuf,
    #[arg(long)]
    repo: Option<PathBuf>,
    #[arg(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,
    #[arg(long, default_value = "prompts/planner_template.txt")]
    template: PathBuf,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    print_summary: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    no_color: bool,
    #[arg(long, default_value = "gpt-5")]
    llm_model: String,
    #[arg(long, default_value = "medium")]
    reasoning_effort: String,
    #[arg(long, default_value = "https://api.openai.com")]
    llm_base_url: String,
}

#[derive(Parser, Debug, Clone)]
struct RunArgs {
    #[arg(long)]
    repo: PathBuf,
    #[arg(long = "work-order")]
    work_order: PathBuf,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long, conflicts_with = "reuse_branch")]
    create_branch: bool,
    #[arg(long)]
    reuse_branch: bool,
    #[arg(long, default_value_t = factory::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    #[arg(long, default_value = "gpt-5")]
    llm_model: String,
    #[arg(long)]
    allow_verify_exempt: bool,
    #[arg(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,
    #[arg(long, default_value = "https://api.openai.com")]
    llm_base_url: String,
}

#[derive(Parser, Debug, Clone)]
struct RunAllArgs {
    #[arg(long)]
    repo: PathBuf,
    #[arg(long)]
    workdir: PathBuf,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    create_branch: bool,
    #[arg(long, default_value_t = factory::DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    #[arg(long, default_value = "gpt-5")]
    llm_model: String,
    #[arg(long)]
    allow_verify_exempt: bool,
    #[arg(long, default_value = "artifacts")]
    artifacts_dir: PathBuf,
    #[arg(long, default_value = "https://api.openai.com")]
    llm_base_url: String,
}

struct CliReporter {
    quiet: bool,
}

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        if !self.quiet {
            eprintln!("[info] {msg}");
        }
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.cmd {
        Commands::Plan(args) => ExitCode::from(run_plan(&args)),
        Commands::Run(args) => ExitCode::from(run_run(&args).unwrap_or(1) as u8),
        Commands::RunAll(args) => ExitCode::from(run_run_all(&args)),
    }
}

/// Exit codes: `0` success, `2` validation failure, `3` API/transport error,
/// `4` JSON parse failure exhausted retries, `1` other.
fn run_plan(args: &PlanArgs) -> u8 {
    let client = match LlmClient::from_env(args.llm_base_url.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[error] {e}");
            return 3;
        }
    };

    let opts = CompileOptions {
        spec_path: args.spec.clone(),
        template_path: args.template.clone(),
        outdir: args.outdir.clone(),
        artifacts_dir: args.artifacts_dir.clone(),
        model: args.llm_model.clone(),
        reasoning_effort: args.reasoning_effort.clone(),
        overwrite: args.overwrite,
    };

    let verbose = args.verbose;
    let quiet = args.quiet;
    let result = plancompile::compile(&opts, &client, |event| {
        if quiet {
            return;
        }
        match event.phase {
            "start" => eprintln!("[plan] attempt {} starting", event.attempt_index),
            "pass" => eprintln!(
                "[plan] attempt {} passed; wrote work orders to {}",
                event.attempt_index,
                event.artifact_path.clone().unwrap_or_default()
            ),
            "fail" => eprintln!(
                "[plan] attempt {} failed, retrying: {}",
                event.attempt_index,
                event.error_excerpt.clone().unwrap_or_default()
            ),
            "FAIL" => eprintln!(
                "[plan] attempt {} FAILED (no attempts remaining): {}",
                event.attempt_index,
                event.error_excerpt.clone().unwrap_or_default()
            ),
            other => {
                if verbose {
                    eprintln!("[plan] {other}");
                }
            }
        }
    });

    match result {
        Ok(summary) => {
            if args.print_summary {
                println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
            }
            0
        }
        Err(e) => {
            eprintln!("[error] {e}");
            exit_code_for_plan_error(&e)
        }
    }
}

/// Heuristic classification of `plancompile::compile`'s terminal error,
/// since validation-failure-at-attempt-budget and JSON-parse-failure share
/// one error path (E000 is a validation code) while transport errors
/// surface from an earlier, separate `?` propagation.
fn exit_code_for_plan_error(e: &anyhow::Error) -> u8 {
    let msg = e.to_string();
    if msg.starts_with("plan compilation failed after") {
        if msg.contains("first: JSON parse error") {
            4
        } else {
            2
        }
    } else if msg.contains("HARNESS_LLM_API_KEY")
        || msg.contains("LLM")
        || msg.contains("HTTP")
        || msg.contains("transport")
    {
        3
    } else {
        1
    }
}

fn run_run(args: &RunArgs) -> Result<i32> {
    let work_order: WorkOrder = serde_json::from_str(
        &fs::read_to_string(&args.work_order)
            .with_context(|| format!("failed to read work order at {}", args.work_order.display()))?,
    )
    .with_context(|| format!("failed to parse work order {}", args.work_order.display()))?;

    if let Some(branch) = &args.branch {
        if args.create_branch {
            harness::workspace::create_branch(&args.repo, branch)
                .with_context(|| format!("failed to create branch {branch}"))?;
        } else if !args.reuse_branch {
            anyhow::bail!(
                "--branch {branch} given without --create-branch or --reuse-branch; ambiguous whether it should be created"
            );
        }
    }

    let client = LlmClient::from_env(args.llm_base_url.clone())?;
    let out_dir = args.artifacts_dir.join("factory").join(&work_order.id);
    let config = FactoryConfig {
        repo_root: args.repo.clone(),
        out_dir,
        max_attempts: args.max_attempts,
        llm_model: args.llm_model.clone(),
        allow_verify_exempt: args.allow_verify_exempt,
    };

    let mut reporter = CliReporter { quiet: false };
    let summary = factory::run(&config, &work_order, &client, &mut reporter)?;
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    println!("verdict: {:?}", summary.verdict);
    Ok(summary.verdict.exit_code())
}

fn run_run_all(args: &RunAllArgs) -> u8 {
    let branch_name = args.branch.clone().unwrap_or_else(|| default_run_all_branch());
    if args.create_branch && harness::workspace::create_branch(&args.repo, &branch_name).is_err() {
        eprintln!("[error] failed to create branch {branch_name}");
        return 2;
    }

    let mut work_orders = match discover_work_orders(&args.workdir) {
        Ok(w) => w,
        Err(e) => {
            eprintln!("[error] {e}");
            return 1;
        }
    };
    work_orders.sort();

    if work_orders.is_empty() {
        eprintln!("[warn] no WO-*.json files found in {}", args.workdir.display());
        return 0;
    }

    for path in &work_orders {
        let run_args = RunArgs {
            repo: args.repo.clone(),
            work_order: path.clone(),
            branch: Some(branch_name.clone()),
            create_branch: false,
            reuse_branch: true,
            max_attempts: args.max_attempts,
            llm_model: args.llm_model.clone(),
            allow_verify_exempt: args.allow_verify_exempt,
            artifacts_dir: args.artifacts_dir.clone(),
            llm_base_url: args.llm_base_url.clone(),
        };
        match run_run(&run_args) {
            Ok(0) => continue,
            Ok(code) => {
                eprintln!("[error] work order {} failed; stopping run-all", path.display());
                return code as u8;
            }
            Err(e) => {
                eprintln!("[error] work order {} crashed: {e}", path.display());
                return 2;
            }
        }
    }
    0
}

fn default_run_all_branch() -> String {
    "aos/run-all".to_string()
}

/// Discover `WO-NN.json` files in `dir`, returned sorted in numeric `NN`
/// order (lexical sort on zero-padded `NN` happens to coincide, but we sort
/// explicitly so a future non-padded id still orders correctly).
fn discover_work_orders(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<(u32, PathBuf)> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?.to_string();
            let stripped = name.strip_prefix("WO-")?.strip_suffix(".json")?;
            let n: u32 = stripped.parse().ok()?;
            Some((n, path))
        })
        .collect();
    entries.sort_by_key(|(n, _)| *n);
    Ok(entries.into_iter().map(|(_, p)| p).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_classifies_json_parse_failure() {
        let e = anyhow::anyhow!("plan compilation failed after 3 attempts: 1 error(s), first: JSON parse error: eof");
        assert_eq!(exit_code_for_plan_error(&e), 4);
    }

    #[test]
    fn exit_code_classifies_validation_failure() {
        let e = anyhow::anyhow!("plan compilation failed after 3 attempts: 2 error(s), first: E101: precondition unsatisfied");
        assert_eq!(exit_code_for_plan_error(&e), 2);
    }

    #[test]
    fn exit_code_classifies_transport_error() {
        let e = anyhow::anyhow!("HARNESS_LLM_API_KEY is not set or blank");
        assert_eq!(exit_code_for_plan_error(&e), 3);
    }

    #[test]
    fn exit_code_classifies_other_as_one() {
        let e = anyhow::anyhow!("failed to read spec at /nope.md");
        assert_eq!(exit_code_for_plan_error(&e), 1);
    }

    #[test]
    fn discover_work_orders_sorts_numerically() {
        let td = tempfile::tempdir().unwrap();
        for name in ["WO-02.json", "WO-10.json", "WO-01.json"] {
            fs::write(td.path().join(name), "{}").unwrap();
        }
        let found = discover_work_orders(td.path()).unwrap();
        let names: Vec<_> = found.iter().map(|p| p.file_name().unwrap().to_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["WO-01.json", "WO-02.json", "WO-10.json"]);
    }
}
