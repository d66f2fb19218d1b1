//! Compiler module - Source compilation with a content-addressed cache
//!
//! This module provides:
//! - `Compiler`: runs a compile command for a source file, skipping it when
//!   the source content and the command are unchanged since the last
//!   successful compile of that file
//! - Deduplication: a compile request for a file that is already compiling
//!   attaches to the in-flight result instead of spawning a second compiler
//!
//! Failed compiles are never cached, so an edit always triggers a retry.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Error, Result};
use crate::runner::{Channel, CommandSpec, ExitOutcome, ProcessEvent, ProcessRunner};

/// Fingerprint of a source file's content
pub trait ContentHasher: Send + Sync {
    fn hash(&self, content: &[u8]) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn hash(&self, content: &[u8]) -> String {
        format!("{:x}", Sha256::digest(content))
    }
}

/// Result of a compile request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Binary is up to date; `cached` when no compiler was spawned
    Compiled { cached: bool },
    /// Compiler failed; `stderr` holds its diagnostics
    Failed { stderr: String, outcome: ExitOutcome },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Compiled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    hash: String,
    command: String,
}

struct InFlight {
    key: CacheKey,
    result: ResultRx,
}

type ResultRx = watch::Receiver<Option<CompileOutcome>>;

enum Claim {
    Cached,
    Leader(watch::Sender<Option<CompileOutcome>>, ResultRx),
    Follower(ResultRx),
    Busy(ResultRx),
}

#[derive(Default)]
struct CacheState {
    compiled: HashMap<PathBuf, CacheKey>,
    in_flight: HashMap<PathBuf, InFlight>,
}

/// Compile cache shared by every run of a session.
///
/// Cloning is cheap and clones share the cache.
#[derive(Clone)]
pub struct Compiler {
    hasher: Arc<dyn ContentHasher>,
    state: Arc<Mutex<CacheState>>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self::with_hasher(Sha256Hasher)
    }

    pub fn with_hasher(hasher: impl ContentHasher + 'static) -> Self {
        Self {
            hasher: Arc::new(hasher),
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    /// Compile `source` with `command`, unless a previous successful compile
    /// saw the same content and the same command.
    pub async fn compile(&self, source: &Path, command: &CommandSpec) -> Result<CompileOutcome> {
        let content = tokio::fs::read(source).await?;
        let key = CacheKey {
            hash: self.hasher.hash(&content),
            command: command.to_vec().join(" "),
        };

        loop {
            match self.claim(source, &key)? {
                Claim::Cached => {
                    debug!("Compile cache hit for {}", source.display());
                    return Ok(CompileOutcome::Compiled { cached: true });
                }
                Claim::Leader(tx, rx) => {
                    self.spawn_compile(source.to_path_buf(), command.clone(), key.clone(), tx);
                    return self.await_result(source, rx).await;
                }
                Claim::Follower(rx) => {
                    debug!("Attaching to in-flight compile of {}", source.display());
                    return self.await_result(source, rx).await;
                }
                Claim::Busy(rx) => {
                    // another revision is compiling; wait for it, then re-check
                    let _ = self.await_result(source, rx).await;
                }
            }
        }
    }

    fn claim(&self, source: &Path, key: &CacheKey) -> Result<Claim> {
        let mut state = self.lock()?;
        if state.compiled.get(source) == Some(key) {
            return Ok(Claim::Cached);
        }
        if let Some(flight) = state.in_flight.get(source) {
            let rx = flight.result.clone();
            return Ok(if &flight.key == key {
                Claim::Follower(rx)
            } else {
                Claim::Busy(rx)
            });
        }

        let (tx, rx) = watch::channel(None);
        state.in_flight.insert(
            source.to_path_buf(),
            InFlight {
                key: key.clone(),
                result: rx.clone(),
            },
        );
        Ok(Claim::Leader(tx, rx))
    }

    /// Forget every cached compile
    pub fn clear(&self) -> Result<()> {
        self.lock()?.compiled.clear();
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| Error::invalid_state("compile cache lock poisoned"))
    }

    /// The compiler runs in its own task so the result is published even if
    /// the requesting future is dropped.
    fn spawn_compile(
        &self,
        source: PathBuf,
        command: CommandSpec,
        key: CacheKey,
        tx: watch::Sender<Option<CompileOutcome>>,
    ) {
        let state = self.state.clone();
        tokio::spawn(async move {
            info!("Compiling {} with {:?}", source.display(), command.to_vec());
            let (outcome, elapsed) = run_compiler(&command).await;

            if let Ok(mut state) = state.lock() {
                state.in_flight.remove(&source);
                if outcome.is_success() {
                    state.compiled.insert(source.clone(), key);
                } else {
                    state.compiled.remove(&source);
                }
            }

            match &outcome {
                CompileOutcome::Compiled { .. } => info!(
                    "Compiled {} in {}ms",
                    source.display(),
                    elapsed.as_millis()
                ),
                CompileOutcome::Failed { outcome, .. } => {
                    warn!("Compilation of {} failed: {}", source.display(), outcome)
                }
            }
            tx.send_replace(Some(outcome));
        });
    }

    async fn await_result(&self, source: &Path, mut rx: ResultRx) -> Result<CompileOutcome> {
        let result = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match result {
            Some(outcome) => Ok(outcome),
            None => {
                // the compile task died without publishing
                let mut state = self.lock()?;
                let dead = state
                    .in_flight
                    .get(source)
                    .is_some_and(|flight| flight.result.has_changed().is_err());
                if dead {
                    state.in_flight.remove(source);
                }
                Err(Error::invalid_state(format!(
                    "compile of {} ended without a result",
                    source.display()
                )))
            }
        }
    }
}

async fn run_compiler(command: &CommandSpec) -> (CompileOutcome, Duration) {
    let mut runner = ProcessRunner::start(command);
    runner.close_stdin();

    let mut stdout = String::new();
    let mut stderr = String::new();
    while let Some(event) = runner.next_event().await {
        match event {
            ProcessEvent::Output {
                channel: Channel::Stdout,
                chunk,
            } => stdout.push_str(&chunk),
            ProcessEvent::Output {
                channel: Channel::Stderr,
                chunk,
            } => stderr.push_str(&chunk),
            ProcessEvent::Closed(_) => {}
            ProcessEvent::Exited(record) => {
                let elapsed = record.elapsed();
                let outcome = if record.outcome.is_success() {
                    CompileOutcome::Compiled { cached: false }
                } else {
                    // some compilers report on stdout
                    if stderr.trim().is_empty() {
                        stderr = stdout;
                    }
                    if let ExitOutcome::SpawnFailed(msg) = &record.outcome {
                        stderr.push_str(msg);
                    }
                    CompileOutcome::Failed {
                        stderr,
                        outcome: record.outcome,
                    }
                };
                return (outcome, elapsed);
            }
        }
    }

    (
        CompileOutcome::Failed {
            stderr: "compiler ended without an exit status".to_string(),
            outcome: ExitOutcome::Exited(-1),
        },
        Duration::ZERO,
    )
}
