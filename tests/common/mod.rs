#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use cp_runner::{OutputStream, RunObserver, Target, Verdict};
use tempfile::TempDir;

/// Observer that keeps every notification
#[derive(Default)]
pub struct Recorder {
    statuses: Mutex<Vec<(Target, Verdict)>>,
    output: Mutex<Vec<(Target, OutputStream, String)>>,
}

impl RunObserver for Recorder {
    fn on_status(&self, target: Target, verdict: Verdict, _elapsed: Option<Duration>) {
        self.statuses.lock().unwrap().push((target, verdict));
    }

    fn on_output(&self, target: Target, stream: OutputStream, chunk: &str) {
        self.output
            .lock()
            .unwrap()
            .push((target, stream, chunk.to_string()));
    }
}

impl Recorder {
    pub fn saw(&self, target: Target, verdict: Verdict) -> bool {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .any(|&(t, v)| t == target && v == verdict)
    }

    /// Concatenated live chunks of one stream
    pub fn text(&self, target: Target, stream: OutputStream) -> String {
        self.output
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, s, _)| *t == target && *s == stream)
            .map(|(_, _, chunk)| chunk.as_str())
            .collect()
    }
}

/// Poll `check` until it holds, failing the test after 10s
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Scratch directory with shell-script sources
pub struct Sources {
    pub dir: TempDir,
}

impl Sources {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.dir.path().join(name)).unwrap_or_default()
    }
}

pub const SUM: &str = "read a b\necho $((a + b))\n";
