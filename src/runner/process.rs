//! Process runner implementation
//!
//! Spawns one external program with piped stdio. Output is pumped into an
//! event channel, stdin writes are queued to a writer task and a supervisor
//! task owns the child until it terminates.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decode::Utf8Decoder;
use super::{Channel, CommandSpec, ExitOutcome, ProcessEvent, RunRecord};
use crate::core::{Error, Result};

const READ_CHUNK_SIZE: usize = 8192;

/// Time between SIGTERM and SIGKILL on cancellation
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Upper bound on draining output after the process exited.
///
/// A grandchild holding the pipe open must not hang the run forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to one running (or finished) external process
pub struct ProcessRunner {
    argv: Vec<String>,
    stdin: Option<UnboundedSender<String>>,
    cancel: CancellationToken,
    events: UnboundedReceiver<ProcessEvent>,
}

impl ProcessRunner {
    /// Spawn the command.
    ///
    /// Never fails: a spawn error is reported as an immediate
    /// `ProcessEvent::Exited` carrying `ExitOutcome::SpawnFailed`.
    pub fn start(spec: &CommandSpec) -> Self {
        let argv = spec.to_vec();
        let (event_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let mut record = RunRecord {
            argv: argv.clone(),
            work_dir: spec.work_dir.clone(),
            started_at: None,
            finished_at: None,
            outcome: ExitOutcome::Exited(0),
        };

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }

        let started_at = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {:?}: {}", argv, e);
                record.finished_at = Some(started_at);
                record.outcome = ExitOutcome::SpawnFailed(e.to_string());
                let _ = event_tx.send(ProcessEvent::Exited(record));
                return Self {
                    argv,
                    stdin: None,
                    cancel,
                    events,
                };
            }
        };
        record.started_at = Some(started_at);
        debug!("Spawned process {:?} (pid {:?})", argv, child.id());

        let stdin = child.stdin.take().map(spawn_stdin_writer);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, Channel::Stdout, event_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, Channel::Stderr, event_tx.clone()));
        }

        tokio::spawn(supervise(child, cancel.clone(), pumps, event_tx, record));

        Self {
            argv,
            stdin,
            cancel,
            events,
        }
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Queue text for the process's stdin. Returns false once stdin is closed.
    pub fn write_stdin(&self, text: &str) -> bool {
        match &self.stdin {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }

    /// Send EOF once all queued writes are flushed
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Request supervisor termination. The run then ends as `Cancelled`.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Cancelling process {:?}", self.argv);
        }
        self.cancel.cancel();
    }

    /// Token that cancels this process when triggered
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next output or terminal event; `None` after the terminal event
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }

    /// Await termination, discarding any output not yet consumed
    pub async fn wait(mut self) -> Result<RunRecord> {
        while let Some(event) = self.events.recv().await {
            if let ProcessEvent::Exited(record) = event {
                return Ok(record);
            }
        }
        Err(Error::invalid_state(format!(
            "process {:?} ended without an exit event",
            self.argv
        )))
    }
}

impl Drop for ProcessRunner {
    // a handle that goes away takes its process with it
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    pumps: Vec<JoinHandle<()>>,
    events: UnboundedSender<ProcessEvent>,
    mut record: RunRecord,
) {
    // an exit that already happened wins over a late cancel
    let (status, cancelled) = tokio::select! {
        biased;
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => (terminate(&mut child).await, true),
    };
    record.finished_at = Some(Instant::now());

    record.outcome = match status {
        _ if cancelled => ExitOutcome::Cancelled,
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => {
            warn!("Failed to wait for {:?}: {}", record.argv, e);
            ExitOutcome::Exited(-1)
        }
    };
    info!(
        "Process {:?} {} after {}ms",
        record.argv,
        record.outcome,
        record.elapsed().as_millis()
    );

    for mut pump in pumps {
        if timeout(DRAIN_TIMEOUT, &mut pump).await.is_err() {
            warn!("Output of {:?} did not drain, dropping the rest", record.argv);
            pump.abort();
        }
    }

    let _ = events.send(ProcessEvent::Exited(record));
}

/// SIGTERM the process group, then SIGKILL after a grace period
async fn terminate(child: &mut Child) -> std::io::Result<std::process::ExitStatus> {
    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    if let Some(pgid) = group {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    match timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            if let Some(pgid) = group {
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

fn spawn_stdin_writer(mut stdin: ChildStdin) -> UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!("Stdin closed by the process: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                debug!("Stdin flush failed: {}", e);
                break;
            }
        }
        // dropping stdin delivers EOF
    });

    tx
}

fn spawn_pump<R>(mut reader: R, channel: Channel, events: UnboundedSender<ProcessEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut decoder = Utf8Decoder::default();

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = decoder.decode(&buf[..n]);
                    if !chunk.is_empty() {
                        // keep reading even if nobody listens so the child never blocks
                        let _ = events.send(ProcessEvent::Output { channel, chunk });
                    }
                }
                Err(e) => {
                    debug!("Read from {:?} failed: {}", channel, e);
                    break;
                }
            }
        }

        let tail = decoder.finish();
        if !tail.is_empty() {
            let _ = events.send(ProcessEvent::Output {
                channel,
                chunk: tail,
            });
        }
        let _ = events.send(ProcessEvent::Closed(channel));
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script])
    }

    async fn collect(mut runner: ProcessRunner) -> (String, String, RunRecord) {
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(event) = runner.next_event().await {
            match event {
                ProcessEvent::Output { channel: Channel::Stdout, chunk } => stdout.push_str(&chunk),
                ProcessEvent::Output { channel: Channel::Stderr, chunk } => stderr.push_str(&chunk),
                ProcessEvent::Closed(_) => {}
                ProcessEvent::Exited(record) => return (stdout, stderr, record),
            }
        }
        panic!("no exit event");
    }

    #[tokio::test]
    async fn test_echo_stdin_to_stdout() {
        let mut runner = ProcessRunner::start(&sh("cat"));
        assert!(runner.write_stdin("1 2\n"));
        runner.close_stdin();

        let (stdout, stderr, record) = collect(runner).await;
        assert_eq!(stdout, "1 2\n");
        assert_eq!(stderr, "");
        assert_eq!(record.outcome, ExitOutcome::Exited(0));
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_non_zero_exit_and_stderr() {
        let runner = ProcessRunner::start(&sh("echo boom >&2; exit 3"));
        let (_, stderr, record) = collect(runner).await;
        assert_eq!(stderr, "boom\n");
        assert_eq!(record.outcome, ExitOutcome::Exited(3));
        assert!(!record.outcome.is_success());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal_with_zero_elapsed() {
        let runner = ProcessRunner::start(&CommandSpec::new("/nonexistent/binary/for/sure"));
        assert!(!runner.write_stdin("ignored"));

        let record = runner.wait().await.unwrap();
        assert!(matches!(record.outcome, ExitOutcome::SpawnFailed(_)));
        assert_eq!(record.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cancel_is_success() {
        let runner = ProcessRunner::start(&sh("sleep 30"));
        runner.cancel();

        let record = runner.wait().await.unwrap();
        assert_eq!(record.outcome, ExitOutcome::Cancelled);
        assert!(record.outcome.is_success());
        assert!(record.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_cancel_after_exit_keeps_outcome() {
        let runner = ProcessRunner::start(&sh("exit 2"));
        let token = runner.canceller();
        let record = runner.wait().await.unwrap();
        token.cancel();
        assert_eq!(record.outcome, ExitOutcome::Exited(2));
    }

    #[tokio::test]
    async fn test_cancel_after_unobserved_exit_keeps_failure() {
        let runner = ProcessRunner::start(&sh("exit 2"));
        // block the runtime so the supervisor sees the exit and the cancel together
        std::thread::sleep(Duration::from_millis(300));
        runner.cancel();

        let record = runner.wait().await.unwrap();
        assert_eq!(record.outcome, ExitOutcome::Exited(2));
        assert!(!record.outcome.is_success());
    }

    #[tokio::test]
    async fn test_dropping_the_handle_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script = format!("sleep 1; touch {}", marker.display());
        drop(ProcessRunner::start(&sh(&script)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_signaled_process_fails() {
        let runner = ProcessRunner::start(&sh("kill -SEGV $$"));
        let record = runner.wait().await.unwrap();
        assert_eq!(record.outcome, ExitOutcome::Signaled(11));
        assert!(!record.outcome.is_success());
    }

    #[tokio::test]
    async fn test_work_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::start(&sh("pwd -P").with_work_dir(dir.path()));
        let (stdout, _, _) = collect(runner).await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(stdout.trim_end(), expected.to_str().unwrap());
    }
}
