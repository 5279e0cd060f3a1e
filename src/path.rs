// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Map target names and commits onto their canonical directories inside the
//! artifact store. Every artifact lives at `<root>/<target>/<short-hash>`, so
//! the only identity a build has on disk is the pair of path segments it is
//! stored under.
//!
//! Functions in this module never consult the file system except for the two
//! directory creation flavors: [`create_dir_strict`] and
//! [`create_dir_if_absent`].

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Name of the store directory placed in the user's home directory.
pub const STORE_DIR_NAME: &str = ".nigiri";

/// Name of the configuration file placed at the top-level of the store.
pub const CONFIG_FILE_NAME: &str = ".nigiri.toml";

/// Determine absolute path to user's home directory.
///
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoWayHome`] if home directory path cannot be
///   determined.
pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().ok_or(PathError::NoWayHome)
}

/// Determine default absolute path to the artifact store.
///
/// Uses `$HOME/.nigiri` as the default. Does not check if the path returned
/// actually exists.
///
/// # Errors
///
/// - Return [`PathError::NoWayHome`] if home directory path cannot be
///   determined.
pub fn default_store_dir() -> Result<PathBuf> {
    home_dir().map(|path| path.join(STORE_DIR_NAME))
}

/// Default location of the configuration file for a given store root.
pub fn default_config_path(root: impl AsRef<Path>) -> PathBuf {
    root.as_ref().join(CONFIG_FILE_NAME)
}

/// Check that a target name can be used as a single path segment.
///
/// # Errors
///
/// - Return [`PathError::InvalidTargetName`] if the name is empty, hidden,
///   a relative component, or contains a path separator.
pub fn validate_target_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains('\0');

    if invalid {
        return Err(PathError::InvalidTargetName { name: name.into() });
    }

    Ok(())
}

/// Path to the root directory holding every artifact of a target.
///
/// # Errors
///
/// - Return [`PathError::InvalidTargetName`] if the target name cannot be used
///   as a path segment.
pub fn target_root_of(base: impl AsRef<Path>, target: &str) -> Result<PathBuf> {
    validate_target_name(target)?;
    Ok(base.as_ref().join(target))
}

/// Path to the artifact directory of a commit inside a target root.
pub fn commit_dir_of(target_root: impl AsRef<Path>, short_hash: &str) -> PathBuf {
    target_root.as_ref().join(short_hash)
}

/// Path to the advisory lock file guarding one artifact directory.
///
/// The lock lives beside the artifact rather than inside it, so it can be held
/// before the artifact directory exists. Hidden names are never enumerated as
/// builds.
pub fn lock_path_of(target_root: impl AsRef<Path>, short_hash: &str) -> PathBuf {
    target_root.as_ref().join(format!(".{short_hash}.lock"))
}

/// Create a directory, failing if anything already exists at its path.
///
/// Parent directories must already exist.
///
/// # Errors
///
/// - Return [`PathError::AlreadyExists`] if the path is already taken.
/// - Return [`PathError::CreateDir`] for any other I/O failure.
pub fn create_dir_strict(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    match std::fs::create_dir(path) {
        Ok(()) => Ok(path.to_path_buf()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Err(PathError::AlreadyExists {
            path: path.to_path_buf(),
        }),
        Err(err) => Err(PathError::CreateDir {
            source: err,
            path: path.to_path_buf(),
        }),
    }
}

/// Create a directory and any missing parents, succeeding if it exists.
///
/// # Errors
///
/// - Return [`PathError::CreateDir`] if the directory cannot be created.
pub fn create_dir_if_absent(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    mkdirp::mkdirp(path).map_err(|err| PathError::CreateDir {
        source: err,
        path: path.to_path_buf(),
    })?;

    Ok(path.to_path_buf())
}

/// Path resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// No way to determine user's home directory.
    #[error("cannot determine absolute path to user's home directory")]
    NoWayHome,

    /// Target name cannot be used as a directory name.
    #[error("invalid target name {name:?}: must be a plain, non-hidden path segment")]
    InvalidTargetName { name: String },

    /// Strict creation found something at the path already.
    #[error("{:?} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    /// Directory could not be created.
    #[error("failed to create directory {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = PathError> = std::result::Result<T, E>;
