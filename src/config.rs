//! Runner settings
//!
//! Settings come from a TOML file. Everything has a built-in default so an
//! empty (or missing) file yields a working configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use crate::stream::LiveLimits;

/// Environment variable pointing at the settings file
pub const CONFIG_ENV: &str = "CP_RUNNER_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub live: LiveSettings,
    pub stress: StressSettings,
    pub languages: BTreeMap<String, LanguageConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    /// Maximum characters of the live view
    pub max_chars: usize,
    /// Maximum lines of the live view
    pub max_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StressSettings {
    /// Wall-clock budget of a stress session in ms, -1 disables it
    pub max_runtime_ms: i64,
    /// Pause between two matching rounds in ms
    pub round_delay_ms: u64,
    /// File stem suffix of the generator, e.g. `a__generator.cpp`
    pub generator_suffix: String,
    /// File stem suffix of the reference solution, e.g. `a__good.cpp`
    pub reference_suffix: String,
}

/// Configuration for a supported programming language
#[derive(Debug, Clone, Deserialize)]
pub struct LanguageConfig {
    /// File extensions handled by this language, without the dot
    pub extensions: Vec<String>,
    /// Compile command template (None if not needed)
    #[serde(default)]
    pub compile: Option<String>,
    /// Run command template
    pub run: String,
}

impl Default for LiveSettings {
    fn default() -> Self {
        let limits = LiveLimits::default();
        Self {
            max_chars: limits.max_chars,
            max_lines: limits.max_lines,
        }
    }
}

impl Default for StressSettings {
    fn default() -> Self {
        Self {
            max_runtime_ms: -1,
            round_delay_ms: 10,
            generator_suffix: "__generator".to_string(),
            reference_suffix: "__good".to_string(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            live: LiveSettings::default(),
            stress: StressSettings::default(),
            languages: default_languages(),
        }
    }
}

fn language(extensions: &[&str], compile: Option<&str>, run: &str) -> LanguageConfig {
    LanguageConfig {
        extensions: extensions.iter().map(|e| e.to_string()).collect(),
        compile: compile.map(str::to_string),
        run: run.to_string(),
    }
}

fn default_languages() -> BTreeMap<String, LanguageConfig> {
    let binary = "${fileDirname}/${fileBasenameNoExtension}";
    let mut languages = BTreeMap::new();
    languages.insert(
        "cpp".to_string(),
        language(
            &["cpp", "cc", "cxx"],
            Some("g++ -std=c++17 -O2 -o ${fileDirname}/${fileBasenameNoExtension} ${file}"),
            binary,
        ),
    );
    languages.insert(
        "c".to_string(),
        language(
            &["c"],
            Some("gcc -O2 -o ${fileDirname}/${fileBasenameNoExtension} ${file} -lm"),
            binary,
        ),
    );
    languages.insert(
        "rust".to_string(),
        language(
            &["rs"],
            Some("rustc -O -o ${fileDirname}/${fileBasenameNoExtension} ${file}"),
            binary,
        ),
    );
    languages.insert(
        "python".to_string(),
        language(&["py"], None, "python3 ${file}"),
    );
    languages.insert("sh".to_string(), language(&["sh"], None, "sh ${file}"));
    languages
}

impl Settings {
    /// Load settings from a TOML file; keys left out keep their defaults
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = Self::from_toml(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parse settings; configured languages are merged over the defaults.
    ///
    /// A default language is dropped when a configured one claims any of its
    /// extensions.
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        let claimed: Vec<String> = settings
            .languages
            .values()
            .flat_map(|lang| lang.extensions.iter().map(|e| e.to_lowercase()))
            .collect();
        for (name, config) in default_languages() {
            let clashes = config
                .extensions
                .iter()
                .any(|e| claimed.contains(&e.to_lowercase()));
            if !clashes {
                settings.languages.entry(name).or_insert(config);
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `CP_RUNNER_CONFIG` (after reading `.env`), else defaults
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load(path),
            Err(_) => Ok(Self::default()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.live.max_chars == 0 || self.live.max_lines == 0 {
            anyhow::bail!("live.max_chars and live.max_lines must be positive");
        }
        if self.stress.max_runtime_ms < -1 {
            anyhow::bail!(
                "stress.max_runtime_ms must be -1 (disabled) or a budget, got {}",
                self.stress.max_runtime_ms
            );
        }
        for (name, lang) in &self.languages {
            if lang.run.trim().is_empty() {
                anyhow::bail!("Language {} has an empty run command", name);
            }
            if lang.extensions.is_empty() {
                warn!("Language {} has no extensions and will never be used", name);
            }
        }
        Ok(())
    }

    pub fn live_limits(&self) -> LiveLimits {
        LiveLimits {
            max_chars: self.live.max_chars,
            max_lines: self.live.max_lines,
        }
    }

    /// Stress budget, `None` when disabled
    pub fn stress_budget(&self) -> Option<Duration> {
        u64::try_from(self.stress.max_runtime_ms)
            .ok()
            .map(Duration::from_millis)
    }

    pub fn round_delay(&self) -> Duration {
        Duration::from_millis(self.stress.round_delay_ms)
    }

    /// Language configuration by file extension (case-insensitive)
    pub fn language_for(&self, file: &Path) -> Option<&LanguageConfig> {
        let ext = file.extension()?.to_str()?.to_lowercase();
        self.languages
            .values()
            .find(|lang| lang.extensions.iter().any(|e| e.to_lowercase() == ext))
    }
}
