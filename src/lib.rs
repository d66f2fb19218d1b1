//! Test runner for competitive programming
//!
//! Compiles and runs a solution against stored testcases, streams its output
//! into bounded live views and judges the result. Stress mode checks a
//! candidate against a reference solution on generated inputs.

pub mod command;
pub mod compiler;
pub mod config;
pub mod core;
pub mod jobs;
pub mod observer;
pub mod runner;
pub mod storage;
pub mod stream;

pub use crate::command::{CommandResolver, TemplateResolver};
pub use crate::compiler::{CompileOutcome, Compiler};
pub use crate::config::Settings;
pub use crate::core::{classify, Error, Result, Testcase, TestcaseId, Verdict};
pub use crate::jobs::{Slot, StressFiles, StressOutcome, StressSnapshot, StressTester, TestRunner};
pub use crate::observer::{NullObserver, OutputStream, RunObserver, Target, TracingObserver};
pub use crate::runner::{CommandSpec, ExitOutcome, ProcessRunner, RunRecord};
pub use crate::storage::{JsonFileStore, MemoryStore, StateStore};
pub use crate::stream::{LiveLimits, Normalization, StreamHandler};
