//! Single-run orchestration
//!
//! `TestRunner` owns the testcase list of one source file and drives each
//! testcase through compile, run and judge. A testcase has at most one live
//! process: starting a new run stops the previous one and waits for it to
//! terminate first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::command::{CommandResolver, TemplateResolver};
use crate::compiler::{CompileOutcome, Compiler};
use crate::config::Settings;
use crate::core::utils::as_millis;
use crate::core::{classify, Error, Result, Testcase, TestcaseId, Verdict};
use crate::jobs::stress::StressSnapshot;
use crate::jobs::Program;
use crate::observer::{NullObserver, OutputStream, RunObserver, Target};
use crate::runner::{Channel, ExitOutcome, ProcessEvent, ProcessRunner};
use crate::storage::{testcases_key, StateStore};
use crate::stream::{Normalization, StreamHandler};

/// Request sent to a live run
#[derive(Debug)]
enum Control {
    Input(String),
    CloseInput,
    Stop,
}

struct ActiveRun {
    generation: u64,
    control: mpsc::UnboundedSender<Control>,
    done: watch::Receiver<bool>,
}

struct Book {
    testcases: Vec<Testcase>,
    next_id: TestcaseId,
    generation: u64,
    active: HashMap<TestcaseId, ActiveRun>,
}

impl Default for Book {
    fn default() -> Self {
        Self {
            testcases: Vec::new(),
            next_id: 1,
            generation: 0,
            active: HashMap::new(),
        }
    }
}

impl Book {
    fn get_mut(&mut self, id: TestcaseId) -> Result<&mut Testcase> {
        self.testcases
            .iter_mut()
            .find(|tc| tc.id == id)
            .ok_or(Error::UnknownTestcase(id))
    }
}

/// Unregisters a run when it ends, however it ends
struct RunGuard {
    book: Arc<Mutex<Book>>,
    id: TestcaseId,
    generation: u64,
    done: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Ok(mut book) = self.book.lock() {
            let current = book.active.get(&self.id).map(|run| run.generation);
            if current == Some(self.generation) {
                book.active.remove(&self.id);
            }
        }
        self.done.send_replace(true);
    }
}

/// stdout and stderr sinks of one run
struct RunStreams {
    stdout: StreamHandler,
    stderr: StreamHandler,
    closed: [bool; 2],
}

impl RunStreams {
    fn output(&mut self, channel: Channel, chunk: &str) {
        self.handler(channel).write(chunk, false);
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

    fn handler(&mut self, channel: Channel) -> &mut StreamHandler {
        match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        }
    }
}

/// Testcase runner of one source file.
///
/// Cloning is cheap; clones share the testcase list and live runs.
#[derive(Clone)]
pub struct TestRunner {
    source: PathBuf,
    settings: Arc<Settings>,
    resolver: Arc<dyn CommandResolver>,
    compiler: Compiler,
    store: Arc<dyn StateStore>,
    observer: Arc<dyn RunObserver>,
    book: Arc<Mutex<Book>>,
}

impl TestRunner {
    pub fn new(source: impl AsRef<Path>, settings: Arc<Settings>, store: Arc<dyn StateStore>) -> Self {
        Self {
            source: source.as_ref().to_path_buf(),
            settings,
            resolver: Arc::new(TemplateResolver::new()),
            compiler: Compiler::new(),
            store,
            observer: Arc::new(NullObserver),
            book: Arc::new(Mutex::new(Book::default())),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn CommandResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Share a compile cache with other runners of the session
    pub fn with_compiler(mut self, compiler: Compiler) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Restore the stored testcase list, returning how many were loaded
    pub async fn load(&self) -> Result<usize> {
        let key = testcases_key(&self.source);
        let mut testcases: Vec<Testcase> = match self.store.read_state(&key).await? {
            Some(value) => serde_json::from_value(value)?,
            None => Vec::new(),
        };
        for tc in &mut testcases {
            // a run cannot survive a restart
            if !tc.verdict.is_terminal() {
                tc.verdict = Verdict::NotApplicable;
            }
        }

        let count = testcases.len();
        let mut book = self.lock()?;
        book.next_id = testcases.iter().map(|tc| tc.id).max().unwrap_or(0) + 1;
        book.testcases = testcases;
        info!("Loaded {} testcases for {}", count, self.source.display());
        Ok(count)
    }

    /// Write the testcase list to the store
    pub async fn persist(&self) -> Result<()> {
        let value = {
            let book = self.lock()?;
            serde_json::to_value(&book.testcases)?
        };
        self.store
            .write_state(&testcases_key(&self.source), value)
            .await?;
        Ok(())
    }

    pub fn testcases(&self) -> Result<Vec<Testcase>> {
        Ok(self.lock()?.testcases.clone())
    }

    pub fn testcase(&self, id: TestcaseId) -> Result<Testcase> {
        let book = self.lock()?;
        book.testcases
            .iter()
            .find(|tc| tc.id == id)
            .cloned()
            .ok_or(Error::UnknownTestcase(id))
    }

    pub fn is_running(&self, id: TestcaseId) -> bool {
        self.lock()
            .map(|book| book.active.contains_key(&id))
            .unwrap_or(false)
    }

    /// Append a new testcase
    pub async fn add_testcase(
        &self,
        input: impl Into<String>,
        accepted: impl Into<String>,
    ) -> Result<TestcaseId> {
        let id = {
            let mut book = self.lock()?;
            let id = book.next_id;
            book.next_id += 1;
            book.testcases.push(Testcase::new(id, input, accepted));
            id
        };
        debug!("Added testcase #{} to {}", id, self.source.display());
        self.persist().await?;
        Ok(id)
    }

    /// Turn the last generated stress input and its reference output into a
    /// testcase
    pub async fn add_from_stress(&self, snapshot: &StressSnapshot) -> Result<TestcaseId> {
        if snapshot.generator.stdout.trim().is_empty() {
            return Err(Error::invalid_state("stress snapshot has no generated input"));
        }
        self.add_testcase(
            snapshot.generator.stdout.clone(),
            snapshot.reference.stdout.clone(),
        )
        .await
    }

    pub async fn delete(&self, id: TestcaseId) -> Result<()> {
        self.stop(id).await?;
        {
            let mut book = self.lock()?;
            let before = book.testcases.len();
            book.testcases.retain(|tc| tc.id != id);
            if book.testcases.len() == before {
                return Err(Error::UnknownTestcase(id));
            }
        }
        self.persist().await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.stop_all().await?;
        self.lock()?.testcases.clear();
        self.persist().await
    }

    /// Take the last stdout as the accepted output
    pub async fn accept(&self, id: TestcaseId) -> Result<Verdict> {
        let verdict = self.update(id, |tc| {
            tc.accepted = tc.stdout.clone();
            if is_comparison(tc.verdict) {
                tc.verdict = classify(&ExitOutcome::Exited(0), &tc.stdout, &tc.accepted);
            }
            tc.apply_auto_visibility();
            tc.verdict
        })?;
        self.notify(id, verdict);
        self.persist().await?;
        Ok(verdict)
    }

    /// Drop the accepted output
    pub async fn decline(&self, id: TestcaseId) -> Result<Verdict> {
        let verdict = self.update(id, |tc| {
            tc.accepted.clear();
            if is_comparison(tc.verdict) {
                tc.verdict = Verdict::NotApplicable;
            }
            tc.apply_auto_visibility();
            tc.verdict
        })?;
        self.notify(id, verdict);
        self.persist().await?;
        Ok(verdict)
    }

    /// Enter editing; not allowed while the testcase runs
    pub fn edit(&self, id: TestcaseId) -> Result<()> {
        {
            let mut book = self.lock()?;
            if book.active.contains_key(&id) {
                return Err(Error::invalid_state(format!("testcase {} is running", id)));
            }
            book.get_mut(id)?.verdict = Verdict::Editing;
        }
        self.notify(id, Verdict::Editing);
        Ok(())
    }

    /// Store edited input and accepted output; previous results are dropped
    pub async fn save(
        &self,
        id: TestcaseId,
        input: impl Into<String>,
        accepted: impl Into<String>,
    ) -> Result<()> {
        let (input, accepted) = (input.into(), accepted.into());
        self.update(id, |tc| {
            tc.input = input;
            tc.accepted = accepted;
            tc.stdout.clear();
            tc.stderr.clear();
            tc.elapsed_ms = 0;
            tc.verdict = Verdict::NotApplicable;
        })?;
        self.notify(id, Verdict::NotApplicable);
        self.persist().await
    }

    pub async fn toggle_detail(&self, id: TestcaseId) -> Result<bool> {
        let shown = self.update(id, |tc| {
            tc.toggle_detail();
            tc.show_detail
        })?;
        self.persist().await?;
        Ok(shown)
    }

    pub async fn toggle_skip(&self, id: TestcaseId) -> Result<bool> {
        let skip = self.update(id, |tc| {
            tc.skip = !tc.skip;
            tc.skip
        })?;
        self.persist().await?;
        Ok(skip)
    }

    /// Append text to the stdin of a running testcase
    pub fn send_input(&self, id: TestcaseId, text: impl Into<String>) -> Result<()> {
        self.control(id, Control::Input(text.into()))
    }

    /// Send EOF to a running testcase
    pub fn close_input(&self, id: TestcaseId) -> Result<()> {
        self.control(id, Control::CloseInput)
    }

    /// Stop the run of a testcase and wait for its process to terminate.
    /// Stopping an idle testcase does nothing.
    pub async fn stop(&self, id: TestcaseId) -> Result<()> {
        let done = {
            let book = self.lock()?;
            book.active.get(&id).map(|run| {
                let _ = run.control.send(Control::Stop);
                run.done.clone()
            })
        };
        if let Some(mut done) = done {
            debug!("Waiting for testcase #{} to stop", id);
            // a closed channel means the run is gone as well
            let _ = done.wait_for(|finished| *finished).await;
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let ids: Vec<TestcaseId> = self.lock()?.active.keys().copied().collect();
        for id in ids {
            self.stop(id).await?;
        }
        Ok(())
    }

    /// Run every testcase that is not skipped, one after another
    pub async fn run_all(&self) -> Result<Vec<(TestcaseId, Verdict)>> {
        let ids: Vec<TestcaseId> = self
            .lock()?
            .testcases
            .iter()
            .filter(|tc| !tc.skip)
            .map(|tc| tc.id)
            .collect();

        let mut verdicts = Vec::with_capacity(ids.len());
        for id in ids {
            match self.run(id).await {
                Ok(verdict) => verdicts.push((id, verdict)),
                // deleted while the batch was running
                Err(Error::UnknownTestcase(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(verdicts)
    }

    /// Compile if needed, run one testcase and judge it.
    ///
    /// Stdin gets EOF right after the stored input, so programs reading until
    /// end of input terminate. A stopped run keeps its partial output and
    /// falls back to the verdict the testcase had before.
    pub async fn run(&self, id: TestcaseId) -> Result<Verdict> {
        self.run_with(id, false).await
    }

    /// Like [`TestRunner::run`], but stdin stays open after the stored input
    /// for `send_input` until `close_input` is called.
    pub async fn run_interactive(&self, id: TestcaseId) -> Result<Verdict> {
        self.run_with(id, true).await
    }

    async fn run_with(&self, id: TestcaseId, keep_stdin_open: bool) -> Result<Verdict> {
        let (guard, mut control) = loop {
            self.stop(id).await?;
            if let Some(registered) = self.register(id)? {
                break registered;
            }
        };

        let (input, accepted, prior) = {
            let mut book = self.lock()?;
            let tc = book.get_mut(id)?;
            let prior = if tc.verdict.is_terminal() {
                tc.verdict
            } else {
                Verdict::NotApplicable
            };
            (tc.input.clone(), tc.accepted.clone(), prior)
        };

        let program = Program::resolve(&self.settings, self.resolver.as_ref(), &self.source).await?;

        // controls that arrive before the process exists
        let mut early = Vec::new();
        if let Some(command) = &program.compile {
            self.set_verdict(id, Verdict::Compiling)?;
            let compile = self.compiler.compile(&program.source, command);
            tokio::pin!(compile);

            let outcome = loop {
                tokio::select! {
                    outcome = &mut compile => break Some(outcome),
                    Some(ctrl) = control.recv() => match ctrl {
                        Control::Stop => break None,
                        other => early.push(other),
                    },
                }
            };

            match outcome {
                None => {
                    info!("Testcase #{} stopped while compiling", id);
                    self.set_verdict(id, prior)?;
                    return Ok(prior);
                }
                Some(Err(e)) => {
                    self.set_verdict(id, prior)?;
                    return Err(e);
                }
                Some(Ok(CompileOutcome::Failed { stderr, .. })) => {
                    self.update(id, |tc| {
                        tc.stdout.clear();
                        tc.stderr = stderr;
                        tc.elapsed_ms = 0;
                        tc.verdict = Verdict::CompileError;
                        tc.apply_auto_visibility();
                    })?;
                    self.finish(id, Verdict::CompileError, None).await;
                    return Ok(Verdict::CompileError);
                }
                Some(Ok(CompileOutcome::Compiled { .. })) => {}
            }
        }

        self.set_verdict(id, Verdict::Running)?;
        let target = Target::Testcase(id);
        let mut echo = self.stream(target, OutputStream::Input, Normalization::Preserve);
        let mut expected = self.stream(target, OutputStream::Accepted, Normalization::Preserve);
        let mut streams = RunStreams {
            stdout: self.stream(target, OutputStream::Stdout, Normalization::Collapse),
            stderr: self.stream(target, OutputStream::Stderr, Normalization::Collapse),
            closed: [false; 2],
        };
        expected.write(&accepted, true);

        let mut runner = ProcessRunner::start(&program.run);
        info!("Running testcase #{}: {:?}", id, runner.argv());
        if runner.write_stdin(&input) {
            echo.write(&input, false);
        }

        let mut stopped = false;
        let mut echo_closed = false;
        for ctrl in early {
            apply_control(ctrl, &mut runner, &mut echo, &mut echo_closed, &mut stopped);
        }
        if !keep_stdin_open {
            apply_control(
                Control::CloseInput,
                &mut runner,
                &mut echo,
                &mut echo_closed,
                &mut stopped,
            );
        }

        let record = loop {
            tokio::select! {
                event = runner.next_event() => match event {
                    Some(ProcessEvent::Output { channel, chunk }) => streams.output(channel, &chunk),
                    Some(ProcessEvent::Closed(channel)) => streams.close(channel),
                    Some(ProcessEvent::Exited(record)) => break record,
                    None => {
                        return Err(Error::invalid_state(format!(
                            "testcase {} lost its process",
                            id
                        )))
                    }
                },
                Some(ctrl) = control.recv() => {
                    apply_control(ctrl, &mut runner, &mut echo, &mut echo_closed, &mut stopped);
                }
            }
        };
        streams.close_all();
        if !echo_closed {
            echo.write("", true);
        }

        let elapsed = record.elapsed();
        let verdict = if stopped {
            info!("Testcase #{} stopped", id);
            prior
        } else {
            classify(&record.outcome, streams.stdout.full(), &accepted)
        };

        let mut stderr = streams.stderr.full().to_string();
        if let ExitOutcome::SpawnFailed(msg) = &record.outcome {
            stderr.push_str(msg);
        }
        let stdout = streams.stdout.full().to_string();

        self.update(id, |tc| {
            tc.stdout = stdout;
            tc.stderr = stderr;
            tc.elapsed_ms = as_millis(elapsed);
            tc.verdict = verdict;
            if !stopped {
                tc.apply_auto_visibility();
            }
        })?;
        self.finish(id, verdict, Some(elapsed)).await;

        drop(guard);
        Ok(verdict)
    }

    fn register(
        &self,
        id: TestcaseId,
    ) -> Result<Option<(RunGuard, mpsc::UnboundedReceiver<Control>)>> {
        let mut book = self.lock()?;
        book.get_mut(id)?;
        if book.active.contains_key(&id) {
            return Ok(None);
        }

        book.generation += 1;
        let generation = book.generation;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        book.active.insert(
            id,
            ActiveRun {
                generation,
                control: control_tx,
                done: done_rx,
            },
        );

        let guard = RunGuard {
            book: self.book.clone(),
            id,
            generation,
            done: done_tx,
        };
        Ok(Some((guard, control_rx)))
    }

    fn control(&self, id: TestcaseId, ctrl: Control) -> Result<()> {
        let mut book = self.lock()?;
        book.get_mut(id)?;
        let run = book
            .active
            .get(&id)
            .ok_or_else(|| Error::invalid_state(format!("testcase {} is not running", id)))?;
        run.control
            .send(ctrl)
            .map_err(|_| Error::invalid_state(format!("testcase {} is finishing", id)))
    }

    fn stream(&self, target: Target, stream: OutputStream, policy: Normalization) -> StreamHandler {
        let observer = self.observer.clone();
        StreamHandler::new(policy, self.settings.live_limits())
            .with_callback(move |chunk| observer.on_output(target, stream, chunk))
    }

    fn update<R>(&self, id: TestcaseId, f: impl FnOnce(&mut Testcase) -> R) -> Result<R> {
        let mut book = self.lock()?;
        Ok(f(book.get_mut(id)?))
    }

    fn set_verdict(&self, id: TestcaseId, verdict: Verdict) -> Result<()> {
        self.update(id, |tc| tc.verdict = verdict)?;
        self.notify(id, verdict);
        Ok(())
    }

    fn notify(&self, id: TestcaseId, verdict: Verdict) {
        self.observer.on_status(Target::Testcase(id), verdict, None);
    }

    /// Report the final verdict and store the list
    async fn finish(&self, id: TestcaseId, verdict: Verdict, elapsed: Option<Duration>) {
        self.observer
            .on_status(Target::Testcase(id), verdict, elapsed);
        if let Err(e) = self.persist().await {
            warn!("Failed to persist testcases of {}: {}", self.source.display(), e);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Book>> {
        self.book
            .lock()
            .map_err(|_| Error::invalid_state("testcase list lock poisoned"))
    }
}

/// Verdicts that come from comparing output with the accepted output
fn is_comparison(verdict: Verdict) -> bool {
    matches!(
        verdict,
        Verdict::Accepted | Verdict::WrongAnswer | Verdict::NotApplicable
    )
}

fn apply_control(
    ctrl: Control,
    runner: &mut ProcessRunner,
    echo: &mut StreamHandler,
    echo_closed: &mut bool,
    stopped: &mut bool,
) {
    match ctrl {
        Control::Input(text) => {
            if *echo_closed || !runner.write_stdin(&text) {
                debug!("Dropping input for {:?}: stdin is closed", runner.argv());
                return;
            }
            echo.write(&text, false);
        }
        Control::CloseInput => {
            runner.close_stdin();
            if !*echo_closed {
                *echo_closed = true;
                echo.write("", true);
            }
        }
        Control::Stop => {
            *stopped = true;
            runner.cancel();
        }
    }
}
