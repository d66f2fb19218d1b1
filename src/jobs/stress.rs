//! Stress testing
//!
//! Repeats rounds of: generate an input from a random seed, feed it to the
//! candidate and the reference solution at the same time, wait for all
//! three processes and compare both outputs. The session ends on the first
//! mismatch, on the first failing process, when the time budget runs out or
//! when it is stopped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandResolver, TemplateResolver};
use crate::compiler::{CompileOutcome, Compiler};
use crate::config::{Settings, StressSettings};
use crate::core::utils::{as_millis, compare_output};
use crate::core::{Error, Result, Verdict};
use crate::jobs::Program;
use crate::observer::{NullObserver, OutputStream, RunObserver, Target};
use crate::runner::{Channel, ExitOutcome, ProcessEvent, ProcessRunner, RunRecord};
use crate::storage::{stress_key, StateStore};
use crate::stream::{Normalization, StreamHandler};

/// Role of a program in a stress session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Generator,
    Candidate,
    Reference,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Generator, Slot::Candidate, Slot::Reference];

    fn index(self) -> usize {
        match self {
            Slot::Generator => 0,
            Slot::Candidate => 1,
            Slot::Reference => 2,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Slot::Generator => "generator",
            Slot::Candidate => "candidate",
            Slot::Reference => "reference",
        };
        write!(f, "{}", s)
    }
}

/// Source files of a stress session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StressFiles {
    pub candidate: PathBuf,
    pub generator: PathBuf,
    pub reference: PathBuf,
}

impl StressFiles {
    /// Generator and reference next to the candidate, named
    /// `<stem><suffix>.<ext>` (`a__generator.cpp`, `a__good.cpp`)
    pub fn beside(candidate: impl AsRef<Path>, settings: &StressSettings) -> Self {
        let candidate = candidate.as_ref();
        let sibling = |suffix: &str| {
            let stem = candidate
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let name = match candidate.extension() {
                Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
                None => format!("{}{}", stem, suffix),
            };
            candidate.with_file_name(name)
        };

        Self {
            generator: sibling(&settings.generator_suffix),
            reference: sibling(&settings.reference_suffix),
            candidate: candidate.to_path_buf(),
        }
    }

    pub fn path(&self, slot: Slot) -> &Path {
        match slot {
            Slot::Generator => &self.generator,
            Slot::Candidate => &self.candidate,
            Slot::Reference => &self.reference,
        }
    }
}

/// How a stress session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StressOutcome {
    /// Candidate and reference disagreed in this round
    MismatchFound { round: u64 },
    /// A program failed to compile (round 0) or failed at runtime
    Failure { round: u64, slot: Slot },
    /// The time budget ran out after this many matching rounds
    TimedOut { rounds: u64 },
    /// Stopped on request after this many completed rounds
    Stopped { rounds: u64 },
}

impl fmt::Display for StressOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StressOutcome::MismatchFound { round } => write!(f, "mismatch found in round {}", round),
            StressOutcome::Failure { round: 0, slot } => write!(f, "{} failed to compile", slot),
            StressOutcome::Failure { round, slot } => write!(f, "{} failed in round {}", slot, round),
            StressOutcome::TimedOut { rounds } => write!(f, "no mismatch in {} rounds", rounds),
            StressOutcome::Stopped { rounds } => write!(f, "stopped after {} rounds", rounds),
        }
    }
}

/// Last known state of one slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotSnapshot {
    pub stdout: String,
    pub stderr: String,
    pub verdict: Verdict,
    pub elapsed_ms: u64,
}

/// Persisted state of the last stress session of a file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressSnapshot {
    pub generator: SlotSnapshot,
    pub candidate: SlotSnapshot,
    pub reference: SlotSnapshot,
    pub outcome: Option<StressOutcome>,
    pub rounds: u64,
}

impl StressSnapshot {
    pub fn slot(&self, slot: Slot) -> &SlotSnapshot {
        match slot {
            Slot::Generator => &self.generator,
            Slot::Candidate => &self.candidate,
            Slot::Reference => &self.reference,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut SlotSnapshot {
        match slot {
            Slot::Generator => &mut self.generator,
            Slot::Candidate => &mut self.candidate,
            Slot::Reference => &mut self.reference,
        }
    }
}

/// Live state of one slot during a session
struct SlotState {
    slot: Slot,
    stdout: StreamHandler,
    stderr: StreamHandler,
    closed: [bool; 2],
    verdict: Verdict,
    elapsed: Duration,
}

impl SlotState {
    fn reset(&mut self) {
        self.stdout.reset();
        self.stderr.reset();
        self.closed = [false; 2];
        self.elapsed = Duration::ZERO;
    }

    fn handler(&mut self, channel: Channel) -> &mut StreamHandler {
        match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        }
    }

    fn close(&mut self, channel: Channel) {
        let index = channel as usize;
        if !self.closed[index] {
            self.closed[index] = true;
            self.handler(channel).write("", true);
        }
    }

    fn close_all(&mut self) {
        self.close(Channel::Stdout);
        self.close(Channel::Stderr);
    }

    fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            stdout: self.stdout.full().to_string(),
            stderr: self.stderr.full().to_string(),
            verdict: self.verdict,
            elapsed_ms: as_millis(self.elapsed),
        }
    }
}

enum RoundResult {
    Match,
    Mismatch,
    Failed(Slot),
    Stopped,
}

#[derive(Default)]
struct Session {
    running: bool,
    stop: CancellationToken,
    snapshot: StressSnapshot,
}

/// Clears the running flag when a session ends, however it ends
struct SessionGuard {
    session: Arc<Mutex<Session>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.lock() {
            session.running = false;
        }
    }
}

/// Stress session runner of one candidate file.
///
/// Cloning is cheap; clones share the session, so `stop` can be called from
/// another task while `run` is in progress.
#[derive(Clone)]
pub struct StressTester {
    files: StressFiles,
    settings: Arc<Settings>,
    resolver: Arc<dyn CommandResolver>,
    compiler: Compiler,
    store: Arc<dyn StateStore>,
    observer: Arc<dyn RunObserver>,
    session: Arc<Mutex<Session>>,
}

impl StressTester {
    pub fn new(files: StressFiles, settings: Arc<Settings>, store: Arc<dyn StateStore>) -> Self {
        Self {
            files,
            settings,
            resolver: Arc::new(TemplateResolver::new()),
            compiler: Compiler::new(),
            store,
            observer: Arc::new(NullObserver),
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn files(&self) -> &StressFiles {
        &self.files
    }

    pub fn is_running(&self) -> bool {
        self.lock().map(|s| s.running).unwrap_or(false)
    }

    /// State of the current or last session
    pub fn snapshot(&self) -> Result<StressSnapshot> {
        Ok(self.lock()?.snapshot.clone())
    }

    /// Restore the snapshot stored for the candidate file
    pub async fn load_snapshot(&self) -> Result<Option<StressSnapshot>> {
        let key = stress_key(&self.files.candidate);
        let snapshot: Option<StressSnapshot> = match self.store.read_state(&key).await? {
            Some(value) => Some(serde_json::from_value(value)?),
            None => None,
        };
        if let Some(snapshot) = &snapshot {
            self.lock()?.snapshot = snapshot.clone();
        }
        Ok(snapshot)
    }

    /// Request the session to stop.
    ///
    /// Processes of the round in flight are cancelled; the round still waits
    /// for all of them before the session ends.
    pub fn stop(&self) {
        if let Ok(session) = self.lock() {
            if session.running {
                info!("Stopping stress session of {}", self.files.candidate.display());
            }
            session.stop.cancel();
        }
    }

    /// Run a session until a mismatch, a failure, the time budget or a stop
    pub async fn run(&self) -> Result<StressOutcome> {
        let stop = {
            let mut session = self.lock()?;
            if session.running {
                return Err(Error::invalid_state("a stress session is already running"));
            }
            session.running = true;
            session.stop = CancellationToken::new();
            session.snapshot = StressSnapshot::default();
            session.stop.clone()
        };
        let _guard = SessionGuard {
            session: self.session.clone(),
        };

        let outcome = self.run_session(&stop).await?;
        info!(
            "Stress session of {} finished: {}",
            self.files.candidate.display(),
            outcome
        );

        let snapshot = {
            let mut session = self.lock()?;
            session.snapshot.outcome = Some(outcome);
            session.snapshot.clone()
        };
        match serde_json::to_value(&snapshot) {
            Ok(value) => {
                if let Err(e) = self
                    .store
                    .write_state(&stress_key(&self.files.candidate), value)
                    .await
                {
                    warn!("Failed to persist stress snapshot: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize stress snapshot: {}", e),
        }
        Ok(outcome)
    }

    async fn run_session(&self, stop: &CancellationToken) -> Result<StressOutcome> {
        for slot in Slot::ALL {
            let path = self.files.path(slot);
            if !path.exists() {
                return Err(Error::invalid_state(format!(
                    "{} file {} does not exist",
                    slot,
                    path.display()
                )));
            }
        }

        let started = Instant::now();
        let mut programs = Vec::with_capacity(3);
        for slot in Slot::ALL {
            programs.push(
                Program::resolve(&self.settings, self.resolver.as_ref(), self.files.path(slot))
                    .await?,
            );
        }

        let mut slots = Slot::ALL.map(|slot| self.slot_state(slot));
        for state in &slots {
            self.notify(state.slot, state.verdict, None);
        }

        if let Some(slot) = self.compile_all(&programs, &mut slots, stop).await? {
            self.publish(&slots, 0)?;
            return Ok(StressOutcome::Failure { round: 0, slot });
        }
        if stop.is_cancelled() {
            return Ok(StressOutcome::Stopped { rounds: 0 });
        }

        let budget = self.settings.stress_budget();
        let delay = self.settings.round_delay();
        let mut round = 0u64;

        let outcome = loop {
            if stop.is_cancelled() {
                break StressOutcome::Stopped { rounds: round };
            }
            round += 1;

            let result = self.run_round(round, &programs, &mut slots, stop).await?;
            self.publish(&slots, round)?;
            match result {
                RoundResult::Stopped => break StressOutcome::Stopped { rounds: round - 1 },
                RoundResult::Failed(slot) => break StressOutcome::Failure { round, slot },
                RoundResult::Mismatch => break StressOutcome::MismatchFound { round },
                RoundResult::Match => {}
            }

            if let Some(budget) = budget {
                if started.elapsed() > budget {
                    break StressOutcome::TimedOut { rounds: round };
                }
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = stop.cancelled() => {}
                }
            }
        };
        Ok(outcome)
    }

    /// Compile every slot that needs it; returns the first slot that failed
    async fn compile_all(
        &self,
        programs: &[Program],
        slots: &mut [SlotState; 3],
        stop: &CancellationToken,
    ) -> Result<Option<Slot>> {
        let mut outcomes: [Option<CompileOutcome>; 3] = [None, None, None];
        for slot in Slot::ALL {
            if programs[slot.index()].compile.is_some() {
                self.set_verdict(&mut slots[slot.index()], Verdict::Compiling);
            }
        }

        let compile = |slot: Slot| {
            let program = &programs[slot.index()];
            async move {
                match &program.compile {
                    Some(command) => self.compiler.compile(&program.source, command).await.map(Some),
                    None => Ok(None),
                }
            }
        };
        let compiled = async {
            tokio::join!(
                compile(Slot::Generator),
                compile(Slot::Candidate),
                compile(Slot::Reference)
            )
        };

        tokio::select! {
            (generator, candidate, reference) = compiled => {
                outcomes = [generator?, candidate?, reference?];
            }
            _ = stop.cancelled() => {
                debug!("Stress session stopped while compiling");
            }
        }

        let mut failed = None;
        for slot in Slot::ALL {
            let state = &mut slots[slot.index()];
            match outcomes[slot.index()].take() {
                Some(CompileOutcome::Failed { stderr, .. }) => {
                    state.stderr.write(&stderr, false);
                    state.close(Channel::Stderr);
                    self.set_verdict(state, Verdict::CompileError);
                    failed.get_or_insert(slot);
                }
                _ if state.verdict == Verdict::Compiling => {
                    self.set_verdict(state, Verdict::NotApplicable)
                }
                _ => {}
            }
        }
        Ok(failed)
    }

    async fn run_round(
        &self,
        round: u64,
        programs: &[Program],
        slots: &mut [SlotState; 3],
        stop: &CancellationToken,
    ) -> Result<RoundResult> {
        debug!("Stress round {} of {}", round, self.files.candidate.display());
        for state in slots.iter_mut() {
            state.reset();
            self.set_verdict(state, Verdict::Running);
        }

        // solutions first so they are ready when generated input arrives
        let candidate = ProcessRunner::start(&programs[Slot::Candidate.index()].run);
        let reference = ProcessRunner::start(&programs[Slot::Reference.index()].run);
        let mut generator = ProcessRunner::start(&programs[Slot::Generator.index()].run);
        let seed = rand::random::<u32>();
        generator.write_stdin(&format!("{}\n", seed));
        generator.close_stdin();

        let mut runners = [generator, candidate, reference];
        let mut records: [Option<RunRecord>; 3] = [None, None, None];
        let mut stop_seen = false;

        while records.iter().any(Option::is_none) {
            let [generator, candidate, reference] = &mut runners;
            let (slot, event) = tokio::select! {
                Some(event) = generator.next_event(), if records[0].is_none() => (Slot::Generator, event),
                Some(event) = candidate.next_event(), if records[1].is_none() => (Slot::Candidate, event),
                Some(event) = reference.next_event(), if records[2].is_none() => (Slot::Reference, event),
                _ = stop.cancelled(), if !stop_seen => {
                    stop_seen = true;
                    for runner in &runners {
                        runner.cancel();
                    }
                    continue;
                }
                else => return Err(Error::invalid_state("stress round lost its processes")),
            };

            let state = &mut slots[slot.index()];
            match event {
                ProcessEvent::Output { channel, chunk } => {
                    state.handler(channel).write(&chunk, false);
                    if slot == Slot::Generator && channel == Channel::Stdout {
                        // both solutions consume the same input
                        runners[Slot::Candidate.index()].write_stdin(&chunk);
                        runners[Slot::Reference.index()].write_stdin(&chunk);
                    }
                }
                ProcessEvent::Closed(channel) => {
                    state.close(channel);
                    if slot == Slot::Generator && channel == Channel::Stdout {
                        runners[Slot::Candidate.index()].close_stdin();
                        runners[Slot::Reference.index()].close_stdin();
                    }
                }
                ProcessEvent::Exited(record) => {
                    if slot == Slot::Generator {
                        runners[Slot::Candidate.index()].close_stdin();
                        runners[Slot::Reference.index()].close_stdin();
                    }
                    if !record.outcome.is_success() {
                        warn!(
                            "Stress {} {} in round {}, cancelling the others",
                            slot, record.outcome, round
                        );
                        for other in Slot::ALL {
                            if other != slot && records[other.index()].is_none() {
                                runners[other.index()].cancel();
                            }
                        }
                    }
                    if let ExitOutcome::SpawnFailed(msg) = &record.outcome {
                        state.stderr.write(msg, false);
                    }
                    state.elapsed = record.elapsed();
                    records[slot.index()] = Some(record);
                }
            }
        }

        let mut outcomes = Vec::with_capacity(3);
        for (state, record) in slots.iter_mut().zip(records) {
            state.close_all();
            outcomes.push(record.map(|r| r.outcome));
        }

        if stop.is_cancelled() {
            for state in slots.iter_mut() {
                self.finish_slot(state, Verdict::NotApplicable);
            }
            return Ok(RoundResult::Stopped);
        }

        // cancelled siblings count as successful, so this finds the culprit
        let failed = Slot::ALL.into_iter().find(|slot| {
            outcomes[slot.index()]
                .as_ref()
                .is_some_and(|outcome| !outcome.is_success())
        });
        if let Some(slot) = failed {
            for state in slots.iter_mut() {
                let verdict = if state.slot == slot {
                    Verdict::RuntimeError
                } else {
                    Verdict::NotApplicable
                };
                self.finish_slot(state, verdict);
            }
            return Ok(RoundResult::Failed(slot));
        }

        let matched = compare_output(
            slots[Slot::Candidate.index()].stdout.full(),
            slots[Slot::Reference.index()].stdout.full(),
        );
        for state in slots.iter_mut() {
            let verdict = if !matched && state.slot == Slot::Candidate {
                Verdict::WrongAnswer
            } else {
                Verdict::NotApplicable
            };
            self.finish_slot(state, verdict);
        }

        if matched {
            Ok(RoundResult::Match)
        } else {
            info!("Stress mismatch in round {} (seed {})", round, seed);
            Ok(RoundResult::Mismatch)
        }
    }

    fn slot_state(&self, slot: Slot) -> SlotState {
        // the generated input is test data, its formatting is kept
        let policy = match slot {
            Slot::Generator => Normalization::Preserve,
            Slot::Candidate | Slot::Reference => Normalization::Collapse,
        };
        SlotState {
            slot,
            stdout: self.stream(slot, OutputStream::Stdout, policy),
            stderr: self.stream(slot, OutputStream::Stderr, Normalization::Collapse),
            closed: [false; 2],
            verdict: Verdict::NotApplicable,
            elapsed: Duration::ZERO,
        }
    }

    fn stream(&self, slot: Slot, stream: OutputStream, policy: Normalization) -> StreamHandler {
        let observer = self.observer.clone();
        let target = Target::Stress(slot);
        StreamHandler::new(policy, self.settings.live_limits())
            .with_callback(move |chunk| observer.on_output(target, stream, chunk))
    }

    fn set_verdict(&self, state: &mut SlotState, verdict: Verdict) {
        state.verdict = verdict;
        self.notify(state.slot, verdict, None);
    }

    fn finish_slot(&self, state: &mut SlotState, verdict: Verdict) {
        state.verdict = verdict;
        self.notify(state.slot, verdict, Some(state.elapsed));
    }

    fn notify(&self, slot: Slot, verdict: Verdict, elapsed: Option<Duration>) {
        self.observer.on_status(Target::Stress(slot), verdict, elapsed);
    }

    /// Copy the slot states into the shared snapshot
    fn publish(&self, slots: &[SlotState; 3], rounds: u64) -> Result<()> {
        let mut session = self.lock()?;
        for state in slots {
            *session.snapshot.slot_mut(state.slot) = state.snapshot();
        }
        session.snapshot.rounds = rounds;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| Error::invalid_state("stress session lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_beside_candidate() {
        let files = StressFiles::beside("/w/a.cpp", &StressSettings::default());
        assert_eq!(files.generator, PathBuf::from("/w/a__generator.cpp"));
        assert_eq!(files.reference, PathBuf::from("/w/a__good.cpp"));
        assert_eq!(files.path(Slot::Candidate), Path::new("/w/a.cpp"));

        let files = StressFiles::beside("sol", &StressSettings::default());
        assert_eq!(files.generator, PathBuf::from("sol__generator"));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = StressOutcome::Failure {
            round: 3,
            slot: Slot::Reference,
        };
        let value = serde_json::to_value(outcome).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"kind": "failure", "round": 3, "slot": "reference"})
        );
        assert_eq!(outcome.to_string(), "reference failed in round 3");
        assert_eq!(
            StressOutcome::Failure { round: 0, slot: Slot::Generator }.to_string(),
            "generator failed to compile"
        );
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot: StressSnapshot = serde_json::from_str(r#"{"rounds": 4}"#).unwrap();
        assert_eq!(snapshot.rounds, 4);
        assert_eq!(snapshot.outcome, None);
        assert_eq!(snapshot.slot(Slot::Candidate).verdict, Verdict::NotApplicable);
    }
}
