use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use denkwerk_evals::{
    load_cases, load_event_log, CaseFile, EvalError, EvaluationResult, HarnessConfig, RunStatus,
    ScriptedRuntime, TestCase, TestRunner,
};
use futures_util::{stream, StreamExt};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "agent-eval")]
#[command(about = "Evaluate agent behavior against declarative test cases")]
struct Args {
    /// Harness configuration (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run case files against the scripted runtime embedded in each file
    Simulate {
        /// Path to cases directory or case file (YAML/JSON)
        #[arg(long, default_value = "evals/cases")]
        cases: PathBuf,

        /// Output path for JSONL results
        #[arg(long)]
        out: Option<PathBuf>,

        /// Run only cases whose id contains this substring (repeatable)
        #[arg(long)]
        filter: Vec<String>,

        /// Stop at first failure or error
        #[arg(long)]
        fail_fast: bool,

        /// Cases run at the same time (overrides the config file)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Per-case timeout when the case sets none (overrides the config file)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Evaluate a recorded JSONL event log against one case
    Replay {
        #[arg(long)]
        case: PathBuf,

        #[arg(long)]
        events: PathBuf,

        /// Write the result here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the JSON Schema of a test case
    Schema,
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn default_out_path() -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    PathBuf::from(format!("evals/runs/{ts}.jsonl"))
}

fn filter_cases(mut cases: Vec<CaseFile>, filters: &[String]) -> Vec<CaseFile> {
    if filters.is_empty() {
        return cases;
    }
    cases.retain(|c| filters.iter().any(|f| c.case.id.contains(f)));
    cases
}

fn print_failure(result: &EvaluationResult) {
    let label = match result.status {
        RunStatus::Completed => "FAIL",
        RunStatus::TimedOut => "TIMEOUT",
        RunStatus::RuntimeError => "RUNTIME-ERROR",
    };
    eprintln!("{label} {} ({} ms)", result.test_case_id, result.duration_ms);
    for failure in result.failures() {
        eprintln!("  - {failure}");
    }
}

async fn run_case(runner: &TestRunner, file: CaseFile) -> (TestCase, Result<EvaluationResult, EvalError>) {
    let CaseFile { case, script } = file;
    if script.is_none() {
        warn!(case = %case.id, "case has no script; the scripted runtime will report missing turns");
    }
    let runtime = Arc::new(ScriptedRuntime::new(script.unwrap_or_default()));
    let result = runner.with_runtime(runtime).run(&case).await;
    (case, result)
}

async fn simulate(
    config: HarnessConfig,
    cases: &Path,
    out: Option<PathBuf>,
    filter: &[String],
    fail_fast: bool,
) -> Result<bool, Box<dyn std::error::Error>> {
    let files = filter_cases(load_cases(cases)?, filter);
    if files.is_empty() {
        eprintln!("No cases matched.");
        std::process::exit(2);
    }

    let out_path = out.unwrap_or_else(default_out_path);
    ensure_parent_dir(&out_path)?;
    let mut writer = BufWriter::new(fs::File::create(&out_path)?);

    let concurrency = config.concurrency.max(1);
    let runner = TestRunner::new(Arc::new(ScriptedRuntime::new(Default::default())), config);
    let mut results = stream::iter(files)
        .map(|file| run_case(&runner, file))
        .buffered(concurrency);

    let mut total = 0usize;
    let mut passed = 0usize;
    while let Some((case, result)) = results.next().await {
        total += 1;
        match result {
            Ok(result) => {
                serde_json::to_writer(&mut writer, &result)?;
                writer.write_all(b"\n")?;
                if result.passed {
                    passed += 1;
                } else {
                    print_failure(&result);
                    if fail_fast {
                        break;
                    }
                }
            }
            Err(err) => {
                eprintln!("ERROR {}: {err}", case.id);
                if fail_fast {
                    break;
                }
            }
        }
    }
    writer.flush()?;

    println!(
        "Runtime: scripted, Results: {passed}/{total} passed, Output: {}",
        out_path.display()
    );
    Ok(passed == total)
}

fn replay(
    config: HarnessConfig,
    case: &Path,
    events: &Path,
    out: Option<PathBuf>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let mut files = load_cases(case)?;
    if files.len() != 1 {
        eprintln!("Expected exactly one case in {}, found {}.", case.display(), files.len());
        std::process::exit(2);
    }
    let case = files.remove(0).case;
    let events = load_event_log(events)?;

    let runner = TestRunner::new(Arc::new(ScriptedRuntime::new(Default::default())), config);
    let result = runner.evaluate_log(&case, &events)?;
    let json = serde_json::to_string_pretty(&result)?;
    match out {
        Some(path) => {
            ensure_parent_dir(&path)?;
            fs::write(&path, json)?;
        }
        None => println!("{json}"),
    }
    if !result.passed {
        print_failure(&result);
    }
    Ok(result.passed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,agent_eval=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };

    let all_passed = match args.command {
        Command::Simulate {
            cases,
            out,
            filter,
            fail_fast,
            concurrency,
            timeout_ms,
        } => {
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.default_timeout_ms = timeout_ms;
            }
            simulate(config, &cases, out, &filter, fail_fast).await?
        }
        Command::Replay { case, events, out } => replay(config, &case, &events, out)?,
        Command::Schema => {
            let schema = schemars::schema_for!(TestCase);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            true
        }
    };

    if all_passed {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
