//! Configuration model (spec.md §3, §6). A roster is loaded either from a
//! YAML file (`ConfigLoader`, grounded on
//! `config/loader.rs::SuperAgentConfigLoaderFile` in the codebase this
//! crate is grounded on) or synthesized from `--exec NAME=COMMAND` flags
//! when no config file is given (spec.md §6 "Simplified roster").

pub mod loader;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error reading config file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("daemon `{0}`: start_command is required")]
    MissingStartCommand(String),
}

/// `Shell(command line)` runs through `sh -c`; `Exec(argv)` execs the
/// binary directly. Which shape a daemon gets is decided purely by the
/// YAML value: a scalar string is a shell command, a sequence is an argv
/// list (spec.md §3, §9 "Dynamic dispatch on spec shape").
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Exec(Vec<String>),
    Shell(String),
}

impl CommandSpec {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandSpec::Shell(command.into())
    }

    /// Resolves to the `(program, args)` pair `std::process::Command`
    /// needs, applying the `sh -c` wrapping for shell-shaped specs
    /// (spec.md §4.1).
    pub fn program_and_args(&self) -> (&str, Vec<&str>) {
        match self {
            CommandSpec::Exec(argv) => {
                let program = argv.first().map(String::as_str).unwrap_or("");
                let args = argv.iter().skip(1).map(String::as_str).collect();
                (program, args)
            }
            CommandSpec::Shell(line) => ("sh", vec!["-c", line.as_str()]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum StdoutMode {
    #[serde(rename = "console")]
    Console,
    #[serde(rename = "/dev/null", alias = "devnull")]
    Devnull,
    #[serde(rename = "log")]
    Log,
}

impl Default for StdoutMode {
    fn default() -> Self {
        StdoutMode::Console
    }
}

/// A non-empty sequence of delays in seconds. The tail value repeats
/// indefinitely once `restart_cursor` runs past the end (spec.md §4.2,
/// §9 "Heterogeneous restart strategies").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartStrategy(Vec<u64>);

impl RestartStrategy {
    pub fn default_immediate() -> Self {
        RestartStrategy(vec![0])
    }

    /// Delay to wait before the `cursor`-th consecutive unplanned
    /// restart. `cursor` is clamped to the last index.
    pub fn delay_for(&self, cursor: usize) -> Duration {
        let idx = cursor.min(self.0.len() - 1);
        Duration::from_secs(self.0[idx])
    }

    pub fn max_index(&self) -> usize {
        self.0.len() - 1
    }

    /// The stability window: a child that stays `running` this long has
    /// its restart cursor reset to 0 (spec.md §4.2).
    pub fn stability_window(&self) -> Duration {
        let max = self.0.iter().copied().max().unwrap_or(0);
        Duration::from_secs(if max == 0 { 60 } else { max })
    }
}

impl<'de> Deserialize<'de> for RestartStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let delays = Vec::<u64>::deserialize(deserializer)?;
        if delays.is_empty() {
            return Err(serde::de::Error::custom(
                "restart sequence must not be empty",
            ));
        }
        Ok(RestartStrategy(delays))
    }
}

/// Immutable for the lifetime of one roster generation (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSpec {
    pub start_command: CommandSpec,
    pub stop_command: Option<CommandSpec>,
    pub start_priority: i64,
    pub cwd: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub stdout_mode: StdoutMode,
    pub restart_strategy: RestartStrategy,
    pub admin_commands: IndexMap<String, CommandSpec>,
}

/// Any subset of daemon fields the `defaults` section may supply
/// (spec.md §6).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub start_priority: Option<i64>,
    #[serde(default, rename = "stdout")]
    pub stdout_mode: Option<StdoutMode>,
    #[serde(default, rename = "restart")]
    pub restart_strategy: Option<RestartStrategy>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDaemonSpec {
    start_command: Option<CommandSpec>,
    #[serde(default)]
    stop_command: Option<CommandSpec>,
    #[serde(default)]
    start_priority: Option<i64>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    environment: Option<HashMap<String, String>>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default, rename = "stdout")]
    stdout_mode: Option<StdoutMode>,
    #[serde(default, rename = "restart")]
    restart_strategy: Option<RestartStrategy>,
    #[serde(default, rename = "commands")]
    admin_commands: IndexMap<String, CommandSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    defaults: Defaults,
    #[serde(default)]
    daemons: IndexMap<String, RawDaemonSpec>,
}

/// Applies `defaults` to every daemon entry and produces the final,
/// immutable roster spec map (insertion order preserved, spec.md §3).
pub fn resolve(raw: RawConfig) -> Result<IndexMap<String, DaemonSpec>, ConfigError> {
    let RawConfig { defaults, daemons } = raw;

    daemons
        .into_iter()
        .map(|(name, raw_spec)| {
            let start_command = raw_spec
                .start_command
                .ok_or_else(|| ConfigError::MissingStartCommand(name.clone()))?;

            let mut environment = defaults.environment.clone();
            environment.extend(raw_spec.environment.unwrap_or_default());

            let spec = DaemonSpec {
                start_command,
                stop_command: raw_spec.stop_command,
                start_priority: raw_spec.start_priority.or(defaults.start_priority).unwrap_or(10),
                cwd: raw_spec.cwd.or_else(|| defaults.cwd.clone()),
                environment,
                user: raw_spec.user.or_else(|| defaults.user.clone()),
                group: raw_spec.group.or_else(|| defaults.group.clone()),
                stdout_mode: raw_spec.stdout_mode.or(defaults.stdout_mode).unwrap_or_default(),
                restart_strategy: raw_spec
                    .restart_strategy
                    .or_else(|| defaults.restart_strategy.clone())
                    .unwrap_or_else(RestartStrategy::default_immediate),
                admin_commands: raw_spec.admin_commands,
            };

            Ok((name, spec))
        })
        .collect()
}

/// Builds a roster spec map straight from `--exec NAME=COMMAND` flags, with
/// no config file involved (spec.md §6 "Simplified roster").
pub fn from_exec_args(execs: &[(String, String)]) -> IndexMap<String, DaemonSpec> {
    execs
        .iter()
        .map(|(name, command)| {
            let spec = DaemonSpec {
                start_command: CommandSpec::shell(command.clone()),
                stop_command: None,
                start_priority: 10,
                cwd: None,
                environment: HashMap::new(),
                user: None,
                group: None,
                stdout_mode: StdoutMode::default(),
                restart_strategy: RestartStrategy::default_immediate(),
                admin_commands: IndexMap::new(),
            };
            (name.clone(), spec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_command_spec_picks_shape_from_yaml() {
        let shell: CommandSpec = serde_yaml::from_str("\"/bin/false\"").unwrap();
        assert_eq!(shell, CommandSpec::Shell("/bin/false".to_string()));

        let exec: CommandSpec = serde_yaml::from_str("[\"/bin/false\", \"--flag\"]").unwrap();
        assert_eq!(
            exec,
            CommandSpec::Exec(vec!["/bin/false".to_string(), "--flag".to_string()])
        );
    }

    #[test]
    fn empty_restart_strategy_is_rejected() {
        let result: Result<RestartStrategy, _> = serde_yaml::from_str("[]");
        assert!(result.is_err());
    }

    #[test]
    fn restart_strategy_repeats_tail() {
        let strategy = RestartStrategy(vec![0, 0, 5]);
        assert_eq!(strategy.delay_for(0).as_secs(), 0);
        assert_eq!(strategy.delay_for(2).as_secs(), 5);
        assert_eq!(strategy.delay_for(10).as_secs(), 5);
    }

    #[test]
    fn stability_window_defaults_to_60s_when_strategy_is_all_zero() {
        let strategy = RestartStrategy(vec![0, 0]);
        assert_eq!(strategy.stability_window(), Duration::from_secs(60));

        let strategy = RestartStrategy(vec![1, 5, 30]);
        assert_eq!(strategy.stability_window(), Duration::from_secs(30));
    }

    #[test]
    fn resolve_applies_defaults_and_daemon_overrides_win() {
        let yaml = r#"
defaults:
  environment:
    FOO: bar
  start_priority: 20
daemons:
  a:
    start_command: "sleep 100"
  b:
    start_command: "sleep 200"
    start_priority: 5
    environment:
      FOO: baz
"#;
        let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
        let resolved = resolve(raw).unwrap();

        assert_eq!(resolved["a"].start_priority, 20);
        assert_eq!(resolved["a"].environment.get("FOO").unwrap(), "bar");
        assert_eq!(resolved["b"].start_priority, 5);
        assert_eq!(resolved["b"].environment.get("FOO").unwrap(), "baz");

        // insertion order preserved for deterministic priority-tie iteration
        assert_eq!(resolved.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn missing_start_command_is_an_error() {
        let yaml = r#"
daemons:
  a: {}
"#;
        let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(resolve(raw).is_err());
    }
}
