// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Build metadata record.
//!
//! Every finished build leaves a plain `Key: value` text file in its artifact
//! directory. It is written last, so its presence also marks a build that ran
//! to completion.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const KEY_TARGET: &str = "Target";
pub const KEY_COMMIT: &str = "Commit";
pub const KEY_SHORT_HASH: &str = "Short hash";
pub const KEY_BUILD_DATE: &str = "Build date";
pub const KEY_CLONE_DURATION: &str = "Clone duration";
pub const KEY_BUILD_DURATION: &str = "Build duration";
pub const KEY_OS: &str = "OS";
pub const KEY_ARCH: &str = "Architecture";

/// Facts recorded about one finished build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildInfo {
    pub target: String,
    pub commit: String,
    pub short_hash: String,
    pub build_date: OffsetDateTime,
    pub clone_duration: Duration,
    pub build_duration: Duration,
    pub os: String,
    pub arch: String,
}

impl BuildInfo {
    /// Write record to path, replacing any previous record.
    ///
    /// # Errors
    ///
    /// - Return [`MetadataError::Write`] if the file cannot be written.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        write(path, self.to_string()).map_err(|err| MetadataError::Write {
            source: err,
            path: path.to_path_buf(),
        })
    }
}

impl Display for BuildInfo {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let date = self
            .build_date
            .format(&Rfc3339)
            .map_err(|_| std::fmt::Error)?;

        writeln!(fmt, "{KEY_TARGET}: {}", self.target)?;
        writeln!(fmt, "{KEY_COMMIT}: {}", self.commit)?;
        writeln!(fmt, "{KEY_SHORT_HASH}: {}", self.short_hash)?;
        writeln!(fmt, "{KEY_BUILD_DATE}: {date}")?;
        writeln!(fmt, "{KEY_CLONE_DURATION}: {:?}", self.clone_duration)?;
        writeln!(fmt, "{KEY_BUILD_DURATION}: {:?}", self.build_duration)?;
        writeln!(fmt, "{KEY_OS}: {}", self.os)?;
        writeln!(fmt, "{KEY_ARCH}: {}", self.arch)
    }
}

/// Fields read back from a metadata record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildRecord {
    fields: BTreeMap<String, String>,
}

impl BuildRecord {
    /// Read record from path.
    ///
    /// # Errors
    ///
    /// - Return [`MetadataError::Read`] if the file cannot be read.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = read_to_string(path).map_err(|err| MetadataError::Read {
            source: err,
            path: path.to_path_buf(),
        })?;

        Ok(Self::parse(&data))
    }

    /// Parse `Key: value` lines, skipping anything else.
    pub fn parse(data: &str) -> Self {
        let fields = data
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
            .filter(|(key, _)| !key.is_empty())
            .collect();

        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Full commit hash.
    pub fn commit(&self) -> Option<&str> {
        self.get(KEY_COMMIT)
    }

    /// Build date, if present and well formed.
    pub fn build_date(&self) -> Option<OffsetDateTime> {
        self.get(KEY_BUILD_DATE)
            .and_then(|date| OffsetDateTime::parse(date, &Rfc3339).ok())
    }
}

/// Metadata error types.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("failed to write build metadata to {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error("failed to read build metadata from {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = MetadataError> = std::result::Result<T, E>;
