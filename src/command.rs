//! Command template resolution
//!
//! Turns a configured command template such as
//! `g++ -O2 -o ${fileDirname}/${fileBasenameNoExtension} ${file}` into an argv.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

/// Expands a command template for a context file and splits it into argv
#[async_trait]
pub trait CommandResolver: Send + Sync {
    async fn resolve(&self, template: &str, context_file: Option<&Path>) -> anyhow::Result<Vec<String>>;
}

/// Default resolver with `${...}` variables and shell-like quoting.
///
/// Supported variables: `file`, `fileDirname`, `fileBasename`,
/// `fileBasenameNoExtension`, `fileExtname`, `workspaceFolder` and
/// `env:NAME`.
#[derive(Debug, Clone, Default)]
pub struct TemplateResolver {
    workspace: Option<PathBuf>,
}

impl TemplateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, dir: impl AsRef<Path>) -> Self {
        self.workspace = Some(dir.as_ref().to_path_buf());
        self
    }

    fn variable(&self, name: &str, file: Option<&Path>) -> anyhow::Result<String> {
        if let Some(var) = name.strip_prefix("env:") {
            return Ok(std::env::var(var).unwrap_or_default());
        }

        if name == "workspaceFolder" {
            let dir = match &self.workspace {
                Some(dir) => dir.clone(),
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            return Ok(dir.display().to_string());
        }

        let file = file.with_context(|| format!("${{{}}} needs a context file", name))?;
        let value = match name {
            "file" => file.display().to_string(),
            "fileDirname" => file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
                .display()
                .to_string(),
            "fileBasename" => file_name_part(file.file_name()),
            "fileBasenameNoExtension" => file_name_part(file.file_stem()),
            "fileExtname" => file
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default(),
            _ => anyhow::bail!("Unknown variable ${{{}}}", name),
        };
        Ok(value)
    }

    fn substitute(&self, template: &str, file: Option<&Path>) -> anyhow::Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .with_context(|| format!("Unterminated variable in {:?}", template))?;
            out.push_str(&self.variable(&after[..end], file)?);
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[async_trait]
impl CommandResolver for TemplateResolver {
    async fn resolve(&self, template: &str, context_file: Option<&Path>) -> anyhow::Result<Vec<String>> {
        let expanded = self.substitute(template, context_file)?;
        split_command(&expanded)
    }
}

fn file_name_part(part: Option<&std::ffi::OsStr>) -> String {
    part.map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Split a command line on whitespace, honouring single and double quotes
pub fn split_command(line: &str) -> anyhow::Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_token = true;
            }
            None if c.is_whitespace() => {
                if in_token {
                    args.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if let Some(q) = quote {
        anyhow::bail!("Unterminated {} quote in {:?}", q, line);
    }
    if in_token {
        args.push(current);
    }
    Ok(args)
}
