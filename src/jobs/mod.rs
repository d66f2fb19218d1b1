//! Jobs module - Orchestration of compile, run and judge
//!
//! - `single`: runs stored testcases of one source file
//! - `stress`: differential testing of a candidate against a reference
//!   solution on generated inputs

pub mod single;
pub mod stress;

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::command::CommandResolver;
use crate::config::Settings;
use crate::core::{Error, Result};
use crate::runner::CommandSpec;

pub use single::TestRunner;
pub use stress::{Slot, StressFiles, StressOutcome, StressSnapshot, StressTester};

/// A source file with its resolved compile and run commands
#[derive(Debug, Clone)]
pub struct Program {
    pub source: PathBuf,
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
}

impl Program {
    /// Look up the language of `source` and resolve its command templates.
    ///
    /// Commands run in the directory of the source file.
    pub async fn resolve(
        settings: &Settings,
        resolver: &dyn CommandResolver,
        source: &Path,
    ) -> Result<Self> {
        let language = settings
            .language_for(source)
            .ok_or_else(|| Error::NoLanguage(source.to_path_buf()))?;

        let work_dir = source
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));

        let compile = match &language.compile {
            Some(template) => Some(resolve_command(resolver, template, source, work_dir).await?),
            None => None,
        };
        let run = resolve_command(resolver, &language.run, source, work_dir).await?;
        debug!("Resolved {} to {:?}", source.display(), run.to_vec());

        Ok(Self {
            source: source.to_path_buf(),
            compile,
            run,
        })
    }
}

async fn resolve_command(
    resolver: &dyn CommandResolver,
    template: &str,
    source: &Path,
    work_dir: &Path,
) -> Result<CommandSpec> {
    let argv = resolver.resolve(template, Some(source)).await?;
    if argv.is_empty() {
        return Err(Error::EmptyCommand(template.to_string()));
    }
    Ok(CommandSpec::from_vec(&argv).with_work_dir(work_dir))
}
