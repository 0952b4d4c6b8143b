use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::models::Language;

#[derive(Parser)]
#[command(name = "rexec", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file; built-in defaults are used when absent
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Override the number of concurrent execution slots
    #[arg(long = "workers", short = 'w')]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Import a directory as a project and execute it
    Run {
        /// Directory whose files become the project's files
        dir: PathBuf,

        /// Language of the project
        #[arg(long, short = 'l', default_value = "python")]
        language: Language,

        /// Entry file relative to the directory
        #[arg(long, short = 'e')]
        entry: Option<String>,

        /// Time limit for the entry process in milliseconds
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
    },
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };
        if let Some(workers) = self.workers {
            config.engine.workers = workers;
        }
        Ok(config)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub sandbox: SandboxConfig,
    pub languages: LanguageConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of executions RUNNING at once across all projects
    pub workers: usize,
    /// Wall-clock budget of one execution
    pub timeout_ms: MilliSecond,
    /// Time between the termination signal and the forced kill
    pub grace_period_ms: MilliSecond,
    /// Cap on captured bytes per stream
    pub output_limit: ByteSize,
    pub sample_interval_ms: MilliSecond,
    pub storage_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout_ms: MilliSecond(10_000),
            grace_period_ms: MilliSecond(500),
            output_limit: ByteSize(1024 * 1024),
            sample_interval_ms: MilliSecond(100),
            storage_retry: RetryConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub initial_backoff_ms: MilliSecond,
    pub max_backoff_ms: MilliSecond,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff_ms: MilliSecond(50),
            max_backoff_ms: MilliSecond(2_000),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .0
            .saturating_mul(factor)
            .min(self.max_backoff_ms.0);
        Duration::from_millis(millis)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Private working directory, own process group, scrubbed environment
    #[default]
    None,
    /// Additionally run inside fresh user, network, pid and mount namespaces
    Unshare,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    /// Directory under which per-execution sandboxes are created
    pub root: Option<PathBuf>,
    pub isolation: IsolationMode,
    /// Maximum number of files a sandbox may be populated with
    pub max_files: usize,
    /// Maximum total size of the populated files
    pub max_disk_bytes: ByteSize,
    /// RLIMIT_NPROC applied to the entry process
    ///
    /// The kernel counts every process of the real user id against this
    /// limit, not just those of the sandbox, so it must leave room for
    /// whatever else the engine's user is running.
    pub max_processes: Option<u64>,
    /// RLIMIT_AS applied to the entry process
    pub max_memory_bytes: Option<ByteSize>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: None,
            isolation: IsolationMode::None,
            max_files: 1024,
            max_disk_bytes: ByteSize(64 * 1024 * 1024),
            max_processes: None,
            max_memory_bytes: None,
        }
    }
}

impl SandboxConfig {
    /// Sandbox root, defaulting to the per-user cache directory
    pub fn root_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }

        use directories::ProjectDirs;
        let proj_dirs = ProjectDirs::from("", "", "rexec")
            .ok_or_else(|| anyhow::anyhow!("Unable to find user directory"))?;
        Ok(proj_dirs.cache_dir().join("sandboxes"))
    }
}

/// How to launch the entry file of one language
#[derive(Deserialize, Debug, Clone)]
pub struct OneLanguageConfig {
    pub language: Language,
    /// Command template; `%ENTRY%` is replaced with the entry file path
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl OneLanguageConfig {
    pub fn builtin(language: Language) -> Self {
        let command = match language {
            Language::Python => vec!["python3", "-u", "%ENTRY%"],
            Language::Javascript => vec!["node", "%ENTRY%"],
            Language::Ruby => vec!["ruby", "%ENTRY%"],
        };
        let mut env = HashMap::new();
        if language == Language::Python {
            env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
        }
        Self {
            language,
            command: command.into_iter().map(String::from).collect(),
            env,
        }
    }
}

/// Launch configuration for every supported language
///
/// Languages missing from the configuration file fall back to the built-in
/// commands.
#[derive(Deserialize, Debug, Clone)]
#[serde(from = "Vec<OneLanguageConfig>")]
pub struct LanguageConfig(Vec<OneLanguageConfig>);

impl LanguageConfig {
    pub fn get(&self, language: Language) -> Option<&OneLanguageConfig> {
        self.0.iter().find(|l| l.language == language)
    }

    /// Replaces the launch configuration of one language
    pub fn set(&mut self, config: OneLanguageConfig) {
        self.0.retain(|l| l.language != config.language);
        self.0.push(config);
    }
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self(Language::ALL.into_iter().map(OneLanguageConfig::builtin).collect())
    }
}

impl From<Vec<OneLanguageConfig>> for LanguageConfig {
    fn from(configured: Vec<OneLanguageConfig>) -> Self {
        let mut languages = Self::default();
        for config in configured {
            languages.set(config);
        }
        languages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.timeout_ms, MilliSecond(5000));
        assert_eq!(config.sandbox.isolation, IsolationMode::None);
        assert_eq!(
            config.languages.get(Language::Python).unwrap().command,
            vec!["python3", "-u", "%ENTRY%"]
        );
        // Not listed in the file, falls back to the builtin
        assert_eq!(
            config.languages.get(Language::Ruby).unwrap().command,
            vec!["ruby", "%ENTRY%"]
        );
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let config: Config = serde_json::from_str(r#"{"engine": {"workers": 2}}"#).unwrap();
        assert_eq!(config.engine.workers, 2);
        assert_eq!(config.engine.grace_period_ms, MilliSecond(500));
        assert_eq!(config.sandbox.max_files, 1024);
        assert!(config.languages.get(Language::Javascript).is_some());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            attempts: 6,
            initial_backoff_ms: MilliSecond(100),
            max_backoff_ms: MilliSecond(500),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(500));
        assert_eq!(retry.backoff(40), Duration::from_millis(500));
    }
}
