// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file that lists every target
//! nigiri knows how to build. The file is loaded once per invocation and is
//! read-only from the point of view of the artifact store.
//!
//! # General Layout
//!
//! Each target is a table under `targets`, keyed by the target's name. The
//! name doubles as the directory that holds the target's artifacts, so it
//! must be a plain path segment. An optional `defaults` table provides build
//! commands for targets that do not define one for the running host.
//!
//! ```toml
//! [defaults.build-command]
//! linux = "make build"
//!
//! [targets.foo]
//! source = "https://github.com/foo/foo.git"
//! default-branch = "main"
//! env = ["CGO_ENABLED=0"]
//!
//! [targets.foo.build-command]
//! linux = "make"
//! binary-path = "bin/foo"
//! ```

use crate::{exec::HostOs, path::validate_target_name};

use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument};

/// Sample configuration written by `nigiri init`.
pub const SAMPLE_CONFIG: &str = r#"# Nigiri configuration file.
#
# Every table under "targets" names a project nigiri can build. The table key
# is also the directory the project's builds are stored under.

[targets.sample-project]
source = "https://github.com/username/sample-project"
default-branch = "main"
env = ["GO111MODULE=on", "CGO_ENABLED=0"]

[targets.sample-project.build-command]
linux = "make build"
windows = "make build"
darwin = "make build"
# binary-path = "bin/sample-project"

# Fallback build commands for targets lacking one for the running host.
[defaults.build-command]
linux = "make build"
windows = "make build"
darwin = "make build"
"#;

/// Top-level configuration layout.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct NigiriConfig {
    /// Fallback settings shared by every target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<Defaults>,

    /// Target definitions keyed by target name.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetDefinition>,
}

impl NigiriConfig {
    /// Look up target definition by name.
    pub fn target(&self, name: &str) -> Option<&TargetDefinition> {
        self.targets.get(name)
    }

    /// Pick build command for target on given OS.
    ///
    /// Falls back to the default build command table if the target does not
    /// define one for the OS.
    pub fn build_command_for<'a>(&'a self, target: &'a TargetDefinition, os: HostOs) -> Option<&'a str> {
        target.build_command.for_os(os).or_else(|| {
            self.defaults
                .as_ref()
                .and_then(|defaults| defaults.build_command.for_os(os))
        })
    }

    fn validate(&self) -> Result<()> {
        for (name, target) in &self.targets {
            validate_target_name(name).map_err(|source| ConfigError::InvalidTargetName {
                source,
                name: name.clone(),
            })?;

            if target.source.trim().is_empty() {
                return Err(ConfigError::MissingSource { target: name.clone() });
            }

            if let Some(entry) = target.env.iter().find(|entry| parse_env_entry(entry).is_none()) {
                return Err(ConfigError::InvalidEnv {
                    target: name.clone(),
                    entry: entry.clone(),
                });
            }
        }

        Ok(())
    }
}

impl FromStr for NigiriConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: NigiriConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on source locations.
        for target in config.targets.values_mut() {
            target.source = shellexpand::full(target.source.as_str())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned();
        }

        config.validate()?;
        Ok(config)
    }
}

impl Display for NigiriConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Settings shared by every target.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Defaults {
    /// Fallback build commands.
    #[serde(default)]
    pub build_command: BuildCommands,
}

/// Build definition of one target.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetDefinition {
    /// Remote URL or path to clone from.
    pub source: String,

    /// Branch whose tip is built when no commit is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,

    /// Directory inside the clone to build from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,

    /// Discard source after building instead of archiving it.
    #[serde(default)]
    pub binary_only: bool,

    /// Extra `KEY=VALUE` environment entries for build and run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,

    /// Build commands per OS and binary location.
    #[serde(default)]
    pub build_command: BuildCommands,
}

impl TargetDefinition {
    /// Split environment entries into key and value pairs.
    ///
    /// Malformed entries are rejected on load, so none are skipped here in
    /// practice.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| parse_env_entry(entry))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect()
    }

    /// Relative path of the produced binary, if configured.
    pub fn binary_path(&self) -> Option<&Path> {
        self.build_command
            .binary_path
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    /// Working subdirectory inside the clone, if configured.
    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }
}

/// Build command table keyed by OS family.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub darwin: Option<String>,

    /// Path of the produced binary relative to the working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
}

impl BuildCommands {
    /// Command for given OS family, ignoring blank entries.
    pub fn for_os(&self, os: HostOs) -> Option<&str> {
        let command = match os {
            HostOs::Linux => self.linux.as_deref(),
            HostOs::Windows => self.windows.as_deref(),
            HostOs::Darwin => self.darwin.as_deref(),
        };

        command.filter(|command| !command.trim().is_empty())
    }
}

fn parse_env_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=').filter(|(key, _)| !key.is_empty())
}

/// Layer of indirection for loading and saving target definitions.
pub trait TargetRegistry {
    /// Load every target definition.
    fn load_targets(&self) -> Result<NigiriConfig>;

    /// Persist target definitions.
    fn save_targets(&self, config: &NigiriConfig) -> Result<()>;
}

/// Target definitions stored in a TOML file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Construct new configuration file handle.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of configuration file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Check if configuration file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write [`SAMPLE_CONFIG`] to configuration file path.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Path`] if the parent directory cannot be
    ///   created.
    /// - Return [`ConfigError::Write`] if the file cannot be written.
    pub fn write_sample(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::path::create_dir_if_absent(parent)?;
        }

        write(&self.path, SAMPLE_CONFIG).map_err(|err| ConfigError::Write {
            source: err,
            path: self.path.clone(),
        })
    }
}

impl TargetRegistry for ConfigFile {
    #[instrument(skip(self), level = "debug")]
    fn load_targets(&self) -> Result<NigiriConfig> {
        debug!("load configuration from {:?}", self.path.display());
        read_to_string(&self.path)
            .map_err(|err| ConfigError::Read {
                source: err,
                path: self.path.clone(),
            })?
            .parse()
    }

    #[instrument(skip(self, config), level = "debug")]
    fn save_targets(&self, config: &NigiriConfig) -> Result<()> {
        let contents = toml::ser::to_string_pretty(config).map_err(ConfigError::Serialize)?;
        write(&self.path, contents).map_err(|err| ConfigError::Write {
            source: err,
            path: self.path.clone(),
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Target name cannot be used as a directory name.
    #[error("invalid target {name:?} in configuration")]
    InvalidTargetName {
        #[source]
        source: crate::path::PathError,
        name: String,
    },

    /// Parent directory of configuration file cannot be created.
    #[error(transparent)]
    Path(#[from] crate::path::PathError),

    /// Target lacks a source location.
    #[error("target {target:?} has no source")]
    MissingSource { target: String },

    /// Environment entry is not of the form `KEY=VALUE`.
    #[error("target {target:?} has malformed env entry {entry:?}, expected KEY=VALUE")]
    InvalidEnv { target: String, entry: String },

    /// Configuration file cannot be read from.
    #[error("failed to read configuration file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Configuration file cannot be written to.
    #[error("failed to write configuration file at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
