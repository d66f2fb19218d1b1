mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, Recorder, Sources, SUM};
use cp_runner::{
    Error, MemoryStore, OutputStream, Settings, Slot, StressFiles, StressOutcome,
    StressTester, Target, Verdict,
};

const GENERATOR: &str = "read seed\necho \"2 2\"\n";

/// Candidate that answers wrong in round 7, counting rounds in `count`
const WRONG_IN_ROUND_7: &str = "read a b
n=$(cat count 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > count
if [ $n -eq 7 ]; then echo 5; else echo $((a + b)); fi
";

struct Session {
    sources: Sources,
    store: Arc<MemoryStore>,
    recorder: Arc<Recorder>,
    tester: StressTester,
}

impl Session {
    fn new(candidate: &str, generator: &str, reference: &str, settings: Settings) -> Self {
        let sources = Sources::new();
        let source = sources.write("a.sh", candidate);
        sources.write("a__generator.sh", generator);
        sources.write("a__good.sh", reference);
        Self::with_sources(sources, &source, settings)
    }

    fn with_sources(sources: Sources, source: &std::path::Path, settings: Settings) -> Self {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let files = StressFiles::beside(source, &settings.stress);
        let tester = StressTester::new(files, Arc::new(settings), store.clone())
            .with_observer(recorder.clone());
        Self {
            sources,
            store,
            recorder,
            tester,
        }
    }
}

fn settings(max_runtime_ms: i64, round_delay_ms: u64) -> Settings {
    let mut settings = Settings::default();
    settings.stress.max_runtime_ms = max_runtime_ms;
    settings.stress.round_delay_ms = round_delay_ms;
    settings
}

#[tokio::test]
async fn test_matching_rounds_run_until_the_budget() {
    let session = Session::new(SUM, GENERATOR, SUM, settings(300, 10));

    let outcome = session.tester.run().await.unwrap();
    let rounds = match outcome {
        StressOutcome::TimedOut { rounds } => rounds,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(rounds >= 1);
    assert!(!session.tester.is_running());

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.rounds, rounds);
    assert_eq!(snapshot.candidate.verdict, Verdict::NotApplicable);
    assert_eq!(snapshot.generator.stdout, "2 2\n");
    assert_eq!(snapshot.candidate.stdout, "4\n");
    assert_eq!(snapshot.reference.stdout, "4\n");
    assert!(!session
        .recorder
        .saw(Target::Stress(Slot::Candidate), Verdict::WrongAnswer));

    // the snapshot survives the session
    let restored = StressTester::new(
        session.tester.files().clone(),
        Arc::new(Settings::default()),
        session.store.clone(),
    );
    let loaded = restored.load_snapshot().await.unwrap().unwrap();
    assert_eq!(loaded.outcome, Some(outcome));
    assert_eq!(loaded, restored.snapshot().unwrap());
}

#[tokio::test]
async fn test_mismatch_stops_the_session() {
    let session = Session::new(WRONG_IN_ROUND_7, GENERATOR, SUM, settings(-1, 0));

    let outcome = session.tester.run().await.unwrap();
    assert_eq!(outcome, StressOutcome::MismatchFound { round: 7 });
    // round 8 never started
    assert_eq!(session.sources.read("count").trim(), "7");

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.candidate.verdict, Verdict::WrongAnswer);
    assert_eq!(snapshot.candidate.stdout, "5\n");
    assert_eq!(snapshot.reference.stdout, "4\n");
    assert_eq!(snapshot.rounds, 7);
}

#[tokio::test]
async fn test_failure_cancels_the_other_processes() {
    let session = Session::new("exit 3\n", GENERATOR, "sleep 30\n", settings(-1, 0));

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.tester.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        StressOutcome::Failure {
            round: 1,
            slot: Slot::Candidate
        }
    );

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.candidate.verdict, Verdict::RuntimeError);
    assert_eq!(snapshot.reference.verdict, Verdict::NotApplicable);
    assert!(snapshot.reference.elapsed_ms < 30_000);
}

#[tokio::test]
async fn test_stop_ends_the_session() {
    let slow = "cat > /dev/null\nsleep 30\n";
    let session = Session::new(slow, GENERATOR, slow, settings(-1, 0));

    let task = tokio::spawn({
        let tester = session.tester.clone();
        async move { tester.run().await }
    });
    eventually("running round", || {
        session
            .recorder
            .saw(Target::Stress(Slot::Candidate), Verdict::Running)
    })
    .await;
    session.tester.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, StressOutcome::Stopped { rounds: 0 });
    assert_eq!(
        session.tester.snapshot().unwrap().candidate.verdict,
        Verdict::NotApplicable
    );
}

#[tokio::test]
async fn test_compile_failure_marks_the_slot() {
    let sources = Sources::new();
    let source = sources.write("a.fake", SUM);
    sources.write("a__generator.fake", GENERATOR);
    sources.write("a__good.fake", SUM);
    let settings = Settings::from_toml(
        r#"
[languages.fake]
extensions = ["fake"]
compile = "sh -c 'case ${fileBasename} in *__good*) echo broken >&2; exit 1;; esac'"
run = "sh ${file}"
"#,
    )
    .unwrap();
    let session = Session::with_sources(sources, &source, settings);

    let outcome = session.tester.run().await.unwrap();
    assert_eq!(
        outcome,
        StressOutcome::Failure {
            round: 0,
            slot: Slot::Reference
        }
    );

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.reference.verdict, Verdict::CompileError);
    assert_eq!(snapshot.reference.stderr, "broken\n");
    assert_eq!(snapshot.candidate.verdict, Verdict::NotApplicable);
    assert_eq!(snapshot.rounds, 0);
}

#[tokio::test]
async fn test_missing_reference_is_an_error() {
    let sources = Sources::new();
    let source = sources.write("a.sh", SUM);
    sources.write("a__generator.sh", GENERATOR);
    let session = Session::with_sources(sources, &source, settings(-1, 0));

    let result = session.tester.run().await;
    assert!(matches!(result, Err(Error::InvalidState { .. })));
    assert!(!session.tester.is_running());
    assert_eq!(session.tester.snapshot().unwrap().outcome, None);
    assert!(session.tester.load_snapshot().await.unwrap().is_none());
}

#[tokio::test]
async fn test_spawn_failure_ends_the_session() {
    let sources = Sources::new();
    let source = sources.write("a.prog", "");
    sources.write("a__generator.prog", "");
    sources.write("a__good.prog", "");
    // "built" generator and candidate echo the seed; the reference binary is missing
    for name in ["a.bin", "a__generator.bin"] {
        std::os::unix::fs::symlink("/bin/cat", sources.path().join(name)).unwrap();
    }
    let settings = Settings::from_toml(
        r#"
[languages.prog]
extensions = ["prog"]
run = "${fileDirname}/${fileBasenameNoExtension}.bin"
"#,
    )
    .unwrap();
    let session = Session::with_sources(sources, &source, settings);

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.tester.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        StressOutcome::Failure {
            round: 1,
            slot: Slot::Reference
        }
    );

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.reference.verdict, Verdict::RuntimeError);
    assert_eq!(snapshot.reference.elapsed_ms, 0);
    assert!(snapshot.reference.stderr.contains("No such file"));
    assert_eq!(snapshot.candidate.verdict, Verdict::NotApplicable);
}

#[tokio::test]
async fn test_generator_failure_cancels_both_solutions() {
    let session = Session::new("sleep 30\n", "exit 4\n", "sleep 30\n", settings(-1, 0));

    let outcome = tokio::time::timeout(Duration::from_secs(10), session.tester.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        StressOutcome::Failure {
            round: 1,
            slot: Slot::Generator
        }
    );

    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.generator.verdict, Verdict::RuntimeError);
    assert_eq!(snapshot.candidate.verdict, Verdict::NotApplicable);
    assert_eq!(snapshot.reference.verdict, Verdict::NotApplicable);
    assert!(snapshot.candidate.elapsed_ms < 5_000);
    assert!(snapshot.reference.elapsed_ms < 5_000);
}

#[tokio::test]
async fn test_budget_counts_compile_time() {
    let sources = Sources::new();
    let source = sources.write("a.fake", SUM);
    sources.write("a__generator.fake", GENERATOR);
    sources.write("a__good.fake", SUM);
    let settings = Settings::from_toml(
        r#"
[stress]
max_runtime_ms = 200
round_delay_ms = 0

[languages.fake]
extensions = ["fake"]
compile = "sleep 0.5"
run = "sh ${file}"
"#,
    )
    .unwrap();
    let session = Session::with_sources(sources, &source, settings);

    // compiling alone used up the budget, so the first matching round is the last
    let outcome = session.tester.run().await.unwrap();
    assert_eq!(outcome, StressOutcome::TimedOut { rounds: 1 });
}

#[tokio::test]
async fn test_stderr_is_collapsed_into_the_snapshot() {
    let noisy = "read a b\necho \"warn:   slow  path\" >&2\necho $((a + b))\n";
    let session = Session::new(noisy, GENERATOR, SUM, settings(200, 0));

    session.tester.run().await.unwrap();
    let snapshot = session.tester.snapshot().unwrap();
    assert_eq!(snapshot.candidate.stderr, "warn: slow path\n");
    assert!(session
        .recorder
        .text(Target::Stress(Slot::Candidate), OutputStream::Stderr)
        .ends_with("warn: slow path\n"));
}
