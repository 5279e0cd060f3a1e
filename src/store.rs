// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Artifact store management and manipulation.
//!
//! Nigiri groups build artifacts together into one place called the __artifact
//! store__. The file system is the only source of truth about what has been
//! built. There is no index: every query re-reads directory state.
//!
//! # Artifact Store Layout
//!
//! The artifact store can generally be placed anywhere on the user's file
//! system, but defaults to `$HOME/.nigiri`. Each target gets its own
//! __target root__ named after the target. The direct children of a target
//! root are the artifacts of that target, each named after the short hash of
//! the commit it was built from:
//!
//! ```text
//! <root>/<target>/<short-hash>/
//!   src/              # live source tree
//!   source.tar.gz     # compressed source tree
//!   bin/              # copied binary
//!   logs/build.log    # captured build command output
//!   build-info.txt    # build metadata
//! ```
//!
//! Hidden entries are never treated as targets or artifacts, which leaves room
//! for the per-artifact lock files kept beside the artifact directories.

use crate::{
    commit::Commit,
    path::{
        commit_dir_of, create_dir_if_absent, create_dir_strict, lock_path_of, target_root_of,
        PathError,
    },
};

use fs4::FileExt;
use std::{
    fs::{read_dir, remove_dir_all, remove_file, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

/// Directory holding the live source tree of an artifact.
pub const SRC_DIR_NAME: &str = "src";

/// Compressed source tree of an artifact.
pub const ARCHIVE_FILE_NAME: &str = "source.tar.gz";

/// Directory holding the copied binary of an artifact.
pub const BIN_DIR_NAME: &str = "bin";

/// Directory holding build logs of an artifact.
pub const LOG_DIR_NAME: &str = "logs";

/// Captured build command output.
pub const BUILD_LOG_NAME: &str = "build.log";

/// Build metadata record.
pub const INFO_FILE_NAME: &str = "build-info.txt";

/// Marker present while an artifact is being built.
pub const PENDING_FILE_NAME: &str = ".pending";

/// Top-level store of every target's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Construct new artifact store handle at root path.
    ///
    /// Does not touch the file system.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root path of artifact store.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Open existing target root.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::UnknownTarget`] if target was never built.
    /// - Return [`StoreError::Path`] if target name is invalid.
    pub fn target(&self, name: &str) -> Result<TargetRoot> {
        let path = target_root_of(&self.root, name)?;
        if !path.is_dir() {
            return Err(StoreError::UnknownTarget { name: name.into() });
        }

        Ok(TargetRoot {
            name: name.into(),
            path,
        })
    }

    /// Open target root, creating it if absent.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Path`] if target name is invalid, or the
    ///   directory cannot be created.
    pub fn create_target(&self, name: &str) -> Result<TargetRoot> {
        let path = create_dir_if_absent(target_root_of(&self.root, name)?)?;
        Ok(TargetRoot {
            name: name.into(),
            path,
        })
    }

    /// Names of every target that has a target root, sorted.
    ///
    /// An absent store root simply holds no targets.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadDir`] if the store root cannot be read.
    pub fn list_targets(&self) -> Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = visible_dirs(&self.root)?
            .into_iter()
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }

    /// Remove every target root in the store.
    ///
    /// Failure to remove one target does not stop removal of the others.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadDir`] if the store root cannot be read.
    #[instrument(skip(self), level = "debug")]
    pub fn remove_all(&self) -> Result<RemovalSummary> {
        let mut summary = RemovalSummary::default();
        for name in self.list_targets()? {
            let path = self.root.join(&name);
            match remove_dir_all(&path) {
                Ok(()) => summary.removed += 1,
                Err(err) => {
                    warn!("failed to remove target {name:?}: {err}");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// Outcome of a removal sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RemovalSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Directory holding every artifact of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRoot {
    name: String,
    path: PathBuf,
}

impl TargetRoot {
    /// Name of target.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Path to target root.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Artifact handle of commit, whether it exists or not.
    pub fn artifact(&self, commit: &Commit) -> Artifact {
        Artifact::new(commit_dir_of(&self.path, commit.short_hash()))
    }

    /// Check if commit has an artifact directory.
    pub fn exists(&self, commit: &Commit) -> bool {
        self.artifact(commit).path().is_dir()
    }

    /// Create artifact directory of commit.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::AlreadyExists`] if artifact directory exists.
    pub fn create(&self, commit: &Commit) -> Result<Artifact> {
        let path = create_dir_strict(commit_dir_of(&self.path, commit.short_hash())).map_err(
            |err| match err {
                PathError::AlreadyExists { path } => StoreError::AlreadyExists { path },
                err => StoreError::Path(err),
            },
        )?;

        Ok(Artifact::new(path))
    }

    /// Every artifact of target, newest modification first.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::ReadDir`] if target root cannot be read.
    pub fn list_builds(&self) -> Result<Vec<StoredBuild>> {
        let mut builds = visible_dirs(&self.path)?
            .into_iter()
            .map(|(_, path)| {
                let modified = path
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                StoredBuild {
                    artifact: Artifact::new(path),
                    modified,
                }
            })
            .collect::<Vec<_>>();

        // INVARIANT: Newest first, ties broken by name for stable output.
        builds.sort_by(|a, b| {
            b.modified
                .cmp(&a.modified)
                .then_with(|| a.name().cmp(b.name()))
        });

        Ok(builds)
    }

    /// Most recently modified artifact.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NoBuildsFound`] if target has no artifacts.
    pub fn locate_head(&self) -> Result<StoredBuild> {
        self.list_builds()?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NoBuildsFound {
                target: self.name.clone(),
            })
    }

    /// Find the single artifact whose short hash starts with prefix.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::NotFound`] if no artifact matches.
    /// - Return [`StoreError::AmbiguousCommit`] if more than one matches.
    pub fn resolve_prefix(&self, prefix: &str) -> Result<StoredBuild> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(StoreError::NotFound {
                target: self.name.clone(),
                prefix: prefix.into(),
            });
        }

        let mut matches = self
            .list_builds()?
            .into_iter()
            .filter(|build| build.name().starts_with(prefix))
            .collect::<Vec<_>>();

        match matches.len() {
            0 => Err(StoreError::NotFound {
                target: self.name.clone(),
                prefix: prefix.into(),
            }),
            1 => Ok(matches.remove(0)),
            _ => {
                let mut candidates = matches
                    .iter()
                    .map(|build| build.name().to_owned())
                    .collect::<Vec<_>>();
                candidates.sort();
                Err(StoreError::AmbiguousCommit {
                    prefix: prefix.into(),
                    candidates,
                })
            }
        }
    }

    /// Remove artifact directory of commit.
    ///
    /// Does nothing if the artifact does not exist.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Remove`] if removal fails.
    pub fn remove(&self, commit: &Commit) -> Result<()> {
        remove_if_present(self.artifact(commit).path())
    }

    /// Remove target root with every artifact in it.
    ///
    /// Does nothing if the target root does not exist.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Remove`] if removal fails.
    #[instrument(skip(self), fields(target = %self.name), level = "debug")]
    pub fn remove_all(&self) -> Result<()> {
        remove_if_present(&self.path)
    }

    /// Take exclusive advisory lock on artifact of commit.
    ///
    /// The lock is held until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Locked`] if another process holds the lock.
    /// - Return [`StoreError::Lock`] if the lock file cannot be opened.
    pub fn lock(&self, commit: &Commit) -> Result<ArtifactLock> {
        let path = lock_path_of(&self.path, commit.short_hash());
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| StoreError::Lock {
                source: err,
                path: path.clone(),
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("locked {:?}", path.display());
                Ok(ArtifactLock { _file: file })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(StoreError::Locked {
                target: self.name.clone(),
                short_hash: commit.short_hash().into(),
            }),
            #[cfg(windows)]
            Err(err) if matches!(err.raw_os_error(), Some(32 | 33)) => Err(StoreError::Locked {
                target: self.name.clone(),
                short_hash: commit.short_hash().into(),
            }),
            Err(err) => Err(StoreError::Lock { source: err, path }),
        }
    }
}

/// Guard of an exclusive artifact lock.
#[derive(Debug)]
pub struct ArtifactLock {
    _file: File,
}

/// Artifact listed from a target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBuild {
    pub artifact: Artifact,
    pub modified: SystemTime,
}

impl StoredBuild {
    /// Short hash naming the artifact.
    pub fn name(&self) -> &str {
        self.artifact.short_hash()
    }
}

/// On-disk layout of one built commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    /// Construct artifact handle at path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Short hash taken from the directory name.
    pub fn short_hash(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn src_dir(&self) -> PathBuf {
        self.path.join(SRC_DIR_NAME)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.path.join(ARCHIVE_FILE_NAME)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join(BIN_DIR_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join(LOG_DIR_NAME)
    }

    pub fn build_log(&self) -> PathBuf {
        self.log_dir().join(BUILD_LOG_NAME)
    }

    pub fn info_path(&self) -> PathBuf {
        self.path.join(INFO_FILE_NAME)
    }

    pub fn pending_path(&self) -> PathBuf {
        self.path.join(PENDING_FILE_NAME)
    }

    /// Check if artifact finished building.
    ///
    /// A build holds the pending marker from claiming the directory until its
    /// metadata is written, so a failed or interrupted build keeps it, even a
    /// forced rebuild over older metadata.
    pub fn is_complete(&self) -> bool {
        self.info_path().is_file() && !self.pending_path().exists()
    }

    /// Flag artifact as being built.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Marker`] if the marker cannot be written.
    pub fn mark_pending(&self) -> Result<()> {
        let path = self.pending_path();
        File::create(&path)
            .map(|_| ())
            .map_err(|err| StoreError::Marker { source: err, path })
    }

    /// Flag artifact as finished.
    ///
    /// # Errors
    ///
    /// - Return [`StoreError::Marker`] if the marker cannot be removed.
    pub fn clear_pending(&self) -> Result<()> {
        let path = self.pending_path();
        match remove_file(&path) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(StoreError::Marker { source: err, path })
            }
            _ => Ok(()),
        }
    }

    /// Approximate disk usage of artifact.
    pub fn size(&self) -> u64 {
        dir_size(&self.path)
    }
}

/// Sum of file sizes under a directory.
///
/// Unreadable entries are skipped and symlinks are not followed.
pub fn dir_size(path: impl AsRef<Path>) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

fn visible_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = read_dir(path).map_err(|err| StoreError::ReadDir {
        source: err,
        path: path.to_path_buf(),
    })?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StoreError::ReadDir {
            source: err,
            path: path.to_path_buf(),
        })?;

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        dirs.push((name, entry.path()));
    }

    Ok(dirs)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Remove {
            source: err,
            path: path.to_path_buf(),
        }),
    }
}

/// All possible error types for artifact store interaction.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Target has no target root.
    #[error("unknown target {name:?}: nothing has been built for it")]
    UnknownTarget { name: String },

    /// Artifact directory is already present.
    #[error("artifact {:?} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    /// Target root holds no artifacts.
    #[error("no builds found for target {target:?}")]
    NoBuildsFound { target: String },

    /// No artifact matches a commit prefix.
    #[error("no build of target {target:?} matches commit {prefix:?}")]
    NotFound { target: String, prefix: String },

    /// More than one artifact matches a commit prefix.
    #[error("commit {prefix:?} is ambiguous, candidates: {}", candidates.join(", "))]
    AmbiguousCommit {
        prefix: String,
        candidates: Vec<String>,
    },

    /// Another process is building the same artifact.
    #[error("build {short_hash} of target {target:?} is locked by another process")]
    Locked { target: String, short_hash: String },

    /// Lock file cannot be opened or locked.
    #[error("failed to lock {:?}", path.display())]
    Lock {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory cannot be listed.
    #[error("failed to read directory {:?}", path.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Directory cannot be removed.
    #[error("failed to remove {:?}", path.display())]
    Remove {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Pending marker cannot be written or removed.
    #[error("failed to update build marker {:?}", path.display())]
    Marker {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Path(#[from] PathError),
}

/// Friendly result alias :3
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
