use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use cp_runner::{
    JsonFileStore, Settings, StateStore, StressFiles, StressOutcome, StressTester, TestRunner,
    TracingObserver,
};

#[derive(Debug, Parser)]
#[command(name = "cp-runner", version, about = "Run and stress test competitive programming solutions")]
struct Cli {
    /// Settings file (defaults to $CP_RUNNER_CONFIG, then built-in settings)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding stored testcases and stress snapshots
    #[arg(long, global = true, default_value = ".cp-runner")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every stored testcase of a source file
    Run {
        file: PathBuf,
        /// Add a testcase with this input before running
        #[arg(long)]
        input: Option<String>,
        /// Accepted output of the added testcase
        #[arg(long, requires = "input")]
        answer: Option<String>,
    },
    /// Compare a solution against `<stem>__good` on inputs from `<stem>__generator`
    Stress {
        file: PathBuf,
        /// Wall-clock budget in ms, -1 runs until a mismatch or Ctrl-C
        #[arg(long, allow_negative_numbers = true)]
        max_runtime_ms: Option<i64>,
        /// Store the failing input as a testcase when a mismatch is found
        #[arg(long)]
        keep: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cp_runner=info".parse()?),
        )
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env()?,
    };
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&cli.state_dir));

    match cli.command {
        Command::Run {
            file,
            input,
            answer,
        } => run_testcases(file, Arc::new(settings), store, input, answer).await,
        Command::Stress {
            file,
            max_runtime_ms,
            keep,
        } => {
            if let Some(ms) = max_runtime_ms {
                settings.stress.max_runtime_ms = ms;
            }
            stress(file, Arc::new(settings), store, keep).await
        }
    }
}

async fn run_testcases(
    file: PathBuf,
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    input: Option<String>,
    answer: Option<String>,
) -> Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("Source file {} not found", file.display()))?;
    let runner = TestRunner::new(&file, settings, store).with_observer(Arc::new(TracingObserver));
    runner.load().await?;

    if let Some(input) = input {
        let id = runner
            .add_testcase(input, answer.unwrap_or_default())
            .await?;
        info!("Added testcase #{}", id);
    }

    let ids: Vec<_> = runner
        .testcases()?
        .into_iter()
        .filter(|tc| !tc.skip)
        .map(|tc| tc.id)
        .collect();
    if ids.is_empty() {
        warn!("No testcases for {}, add one with --input", file.display());
        return Ok(());
    }

    for id in ids {
        let mut task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run(id).await }
        });

        let verdict = tokio::select! {
            result = &mut task => result.context("Run task panicked")??,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, stopping testcase #{}", id);
                runner.stop(id).await?;
                task.await.context("Run task panicked")??;
                break;
            }
        };

        let tc = runner.testcase(id)?;
        println!("#{:<3} {:<15} {:>6}ms", id, verdict.to_string(), tc.elapsed_ms);
        if tc.show_detail && !tc.stderr.is_empty() {
            println!("{}", tc.stderr.trim_end());
        }
    }
    Ok(())
}

async fn stress(
    file: PathBuf,
    settings: Arc<Settings>,
    store: Arc<dyn StateStore>,
    keep: bool,
) -> Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("Source file {} not found", file.display()))?;
    let files = StressFiles::beside(&file, &settings.stress);
    let tester = StressTester::new(files, settings.clone(), store.clone())
        .with_observer(Arc::new(TracingObserver));

    let session = tester.run();
    tokio::pin!(session);
    let outcome = tokio::select! {
        outcome = &mut session => outcome?,
        _ = tokio::signal::ctrl_c() => {
            tester.stop();
            session.await?
        }
    };
    println!("{}", outcome);

    if let StressOutcome::MismatchFound { .. } = outcome {
        let snapshot = tester.snapshot()?;
        println!("input:\n{}", snapshot.generator.stdout.trim_end());
        println!("expected:\n{}", snapshot.reference.stdout.trim_end());
        println!("received:\n{}", snapshot.candidate.stdout.trim_end());

        if keep {
            let runner = TestRunner::new(&file, settings, store);
            runner.load().await?;
            let id = runner.add_from_stress(&snapshot).await?;
            info!("Stored the failing input as testcase #{}", id);
        }
    }
    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(message = "panic occurred", panic = %panic_info);
    }));
}
