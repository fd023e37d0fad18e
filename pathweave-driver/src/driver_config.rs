// SPDX-License-Identifier: Apache-2.0

//! Driver configuration: a TOML file with the search parameters and the
//! collaborator commands, overridable from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use pathweave::SearchConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "pathweave.toml";

/// An external program and the fixed arguments it is started with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollaboratorCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CollaboratorCommand {
    /// Splits a command line on whitespace; the first word is the program.
    /// Quotes are not interpreted, so an argument containing spaces can only
    /// be given through the TOML `args` list.
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut words = command_line.split_whitespace();
        let program = words.next()?.to_string();
        Some(CollaboratorCommand {
            program,
            args: words.map(str::to_string).collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    pub search: SearchConfig,
    pub resolver: Option<CollaboratorCommand>,
    pub generator: Option<CollaboratorCommand>,
    /// How long a generator process may overrun its budget before it is
    /// killed, in milliseconds.
    pub kill_grace_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            search: SearchConfig::default(),
            resolver: None,
            generator: None,
            kill_grace_ms: 5_000,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub resolver: Option<String>,
    pub generator: Option<String>,
    pub timeout_secs: Option<u64>,
    pub workers: Option<usize>,
}

impl DriverConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("parse pathweave config")
    }

    /// Reads `path` if given, otherwise falls back to the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(DriverConfig::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(resolver) = overrides.resolver.as_deref() {
            self.resolver = CollaboratorCommand::parse(resolver);
        }
        if let Some(generator) = overrides.generator.as_deref() {
            self.generator = CollaboratorCommand::parse(generator);
        }
        if let Some(timeout_secs) = overrides.timeout_secs {
            self.search.termination.timeout_secs = timeout_secs;
        }
        if let Some(workers) = overrides.workers {
            for stage in [&mut self.search.resolve, &mut self.search.generate] {
                stage.workers = workers;
                stage.max_batch = stage.max_batch.min(workers);
            }
        }
    }
}

/// The config file in the working directory, if there is one.
pub fn default_config_path() -> Option<PathBuf> {
    let path = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
    if path.exists() {
        log::info!("Using {} in current directory", path.display());
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use test_case::test_case;

    const SAMPLE: &str = r#"
kill_grace_ms = 250

[resolver]
program = "jpf-resolve"
args = ["--mode", "symbolic"]

[generator]
program = "evo-generate"

[search]
max_depth = 6
generation_budget_ms = 1500

[search.resolve]
workers = 4
max_batch = 4
throttle = 0.5

[search.termination]
timeout_secs = 90
check_interval_ms = 250

[search.triage]
k = 7
min_average_similarity = 0.6
"#;

    #[test]
    fn parses_nested_sections() {
        let config = DriverConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.resolver,
            Some(CollaboratorCommand {
                program: "jpf-resolve".to_string(),
                args: vec!["--mode".to_string(), "symbolic".to_string()],
            })
        );
        assert!(config.generator.as_ref().unwrap().args.is_empty());
        assert_eq!(config.kill_grace(), Duration::from_millis(250));
        assert_eq!(config.search.max_depth, 6);
        assert_eq!(config.search.resolve.workers, 4);
        assert_eq!(config.search.resolve.throttle, 0.5);
        assert_eq!(config.search.termination.timeout_secs, 90);
        assert_eq!(config.search.triage.k, 7);
        // Unset fields keep their defaults.
        assert_eq!(config.search.triage.max_minority_votes, 1);
        assert!(config.search.validate().is_ok());
    }

    #[test_case("bogus = 1" ; "unknown top-level key")]
    #[test_case("[search]\nmax_dpeth = 3" ; "misspelled search key")]
    #[test_case("[resolver]\nargs = []" ; "resolver without program")]
    fn rejects_bad_config(text: &str) {
        assert!(DriverConfig::from_toml(text).is_err());
    }

    #[test]
    fn load_without_path_uses_defaults() {
        let config = DriverConfig::load(None).unwrap();
        assert_eq!(config, DriverConfig::default());
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = DriverConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.search.max_depth, 6);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = DriverConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.toml"));
    }

    #[test]
    fn command_line_overrides_config() {
        let mut config = DriverConfig::from_toml(SAMPLE).unwrap();
        config.apply(&Overrides {
            resolver: Some("./resolve.sh --fast".to_string()),
            generator: None,
            timeout_secs: Some(5),
            workers: Some(2),
        });
        assert_eq!(
            config.resolver,
            Some(CollaboratorCommand {
                program: "./resolve.sh".to_string(),
                args: vec!["--fast".to_string()],
            })
        );
        assert_eq!(config.generator.as_ref().unwrap().program, "evo-generate");
        assert_eq!(config.search.termination.timeout_secs, 5);
        assert_eq!(config.search.resolve.workers, 2);
        assert_eq!(config.search.resolve.max_batch, 2);
        assert_eq!(config.search.generate.workers, 2);
        assert!(config.search.validate().is_ok());
    }

    #[test]
    fn quoted_arguments_need_the_toml_args_list() {
        let split = CollaboratorCommand::parse("resolve --cp 'a b'").unwrap();
        assert_eq!(split.args, vec!["--cp", "'a", "b'"]);

        let config =
            DriverConfig::from_toml("[resolver]\nprogram = \"resolve\"\nargs = [\"--cp\", \"a b\"]")
                .unwrap();
        assert_eq!(
            config.resolver.unwrap().args,
            vec!["--cp".to_string(), "a b".to_string()]
        );
    }

    #[test]
    fn blank_command_line_parses_to_none() {
        assert_eq!(CollaboratorCommand::parse("   "), None);
    }
}
