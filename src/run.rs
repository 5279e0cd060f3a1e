// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Run resolution.
//!
//! Find a built binary and launch it. Resolution never touches the network:
//! "latest" means the most recently modified artifact of the target, and an
//! explicit commit is matched against the short hashes already in the store.

use crate::{
    archive::{extract, ArchiveError},
    commit::CommitSelector,
    config::TargetDefinition,
    store::{Artifact, ArtifactStore, StoreError, StoredBuild},
};

use std::{
    fs::read_dir,
    path::{absolute, Path, PathBuf},
    process::{Command, ExitStatus},
};
use tracing::{debug, info, instrument};

/// Token separating nigiri arguments from target arguments.
pub const ARG_SEPARATOR: &str = "--";

/// Trailing `run` arguments split apart.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunArgs {
    /// Commit selector, latest build if absent.
    pub selector: Option<String>,

    /// Arguments passed to the binary.
    pub args: Vec<String>,

    /// Tokens between selector and separator that belong to neither.
    pub ignored: Vec<String>,
}

/// Split trailing `run` arguments into a commit selector and target arguments.
///
/// An explicit `--` separates the two unambiguously: a single token before it
/// is the selector, and any further tokens before it are reported as ignored.
/// Without a separator, the first token is the selector unless it looks like
/// a flag, in which case everything goes to the target.
pub fn split_run_args(args: &[String]) -> RunArgs {
    if let Some(index) = args.iter().position(|arg| arg == ARG_SEPARATOR) {
        let (selector, ignored) = match args[..index].split_first() {
            Some((first, rest)) => (Some(first.clone()), rest.to_vec()),
            None => (None, Vec::new()),
        };
        return RunArgs {
            selector,
            args: args[index + 1..].to_vec(),
            ignored,
        };
    }

    match args.split_first() {
        None => RunArgs::default(),
        Some((first, _)) if first.starts_with('-') => RunArgs {
            args: args.to_vec(),
            ..Default::default()
        },
        Some((first, rest)) => RunArgs {
            selector: Some(first.clone()),
            args: rest.to_vec(),
            ..Default::default()
        },
    }
}

/// Binary resolved for launching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    /// Short hash of artifact the binary came from.
    pub short_hash: String,

    /// Absolute path to executable.
    pub binary: PathBuf,

    /// Extra environment entries for the process.
    pub env: Vec<(String, String)>,
}

impl Launch {
    /// Launch binary with inherited standard streams and wait for it.
    ///
    /// The working directory is the directory containing the binary.
    ///
    /// # Errors
    ///
    /// - Return [`RunError::Spawn`] if the process cannot be started.
    #[instrument(skip(self, args), fields(binary = %self.binary.display()), level = "debug")]
    pub fn run(&self, args: &[String]) -> Result<ExitStatus> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).envs(self.env.iter().map(|(key, value)| (key, value)));
        if let Some(parent) = self.binary.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            cmd.current_dir(parent);
        }

        info!("running {:?} with args {args:?}", self.binary.display());
        cmd.status().map_err(|err| RunError::Spawn {
            source: err,
            binary: self.binary.clone(),
        })
    }
}

/// Locate artifacts and binaries in the store.
#[derive(Debug, Clone, Copy)]
pub struct RunResolver<'a> {
    store: &'a ArtifactStore,
}

impl<'a> RunResolver<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self { store }
    }

    /// Pick the artifact a selector refers to.
    ///
    /// # Errors
    ///
    /// - Return [`RunError::Store`] if the target was never built, has no
    ///   builds, or the selector matches zero or several builds.
    pub fn resolve_build(&self, target: &str, selector: Option<&str>) -> Result<StoredBuild> {
        let target_root = self.store.target(target)?;
        let build = match CommitSelector::parse(selector) {
            CommitSelector::Latest => {
                let build = target_root.locate_head()?;
                info!("using latest build {}", build.name());
                build
            }
            CommitSelector::Hash(prefix) => target_root.resolve_prefix(&prefix)?,
        };

        Ok(build)
    }

    /// Resolve selector into a launchable binary.
    ///
    /// Target definition may be absent if the target was removed from the
    /// configuration after being built.
    ///
    /// # Errors
    ///
    /// - Return [`RunError::Store`] if the artifact cannot be resolved.
    /// - Return [`RunError::BinaryNotFound`] if no binary can be located.
    /// - Return [`RunError::Permissions`] if the binary cannot be made
    ///   executable.
    /// - Return [`RunError::Absolute`] if the binary path cannot be made
    ///   absolute.
    pub fn prepare(
        &self,
        target: &str,
        definition: Option<&TargetDefinition>,
        selector: Option<&str>,
    ) -> Result<Launch> {
        let build = self.resolve_build(target, selector)?;
        let binary = locate_binary(target, definition, &build.artifact)?;
        ensure_executable(&binary)?;

        // INVARIANT: Binary path must survive the launch changing directories.
        let binary = absolute(&binary).map_err(|err| RunError::Absolute {
            source: err,
            binary: binary.clone(),
        })?;

        Ok(Launch {
            short_hash: build.name().to_owned(),
            binary,
            env: definition.map(TargetDefinition::env_pairs).unwrap_or_default(),
        })
    }
}

/// Find the executable inside an artifact.
///
/// The `bin` directory is checked first. Otherwise the source tree is
/// searched, extracting the source archive once if needed.
///
/// # Errors
///
/// - Return [`RunError::BinaryNotFound`] if every location is exhausted.
/// - Return [`RunError::Extract`] if the source archive cannot be unpacked.
#[instrument(skip(definition, artifact), level = "debug")]
pub fn locate_binary(
    target: &str,
    definition: Option<&TargetDefinition>,
    artifact: &Artifact,
) -> Result<PathBuf> {
    let configured_name = definition
        .and_then(TargetDefinition::binary_path)
        .and_then(Path::file_name);

    let bin_dir = artifact.bin_dir();
    if bin_dir.is_dir() {
        let mut candidates = Vec::new();
        if let Some(name) = configured_name {
            candidates.push(bin_dir.join(name));
        }
        candidates.push(bin_dir.join(target));
        if cfg!(windows) {
            candidates.push(bin_dir.join(format!("{target}.exe")));
        }

        if let Some(binary) = candidates.into_iter().find(|path| path.is_file()) {
            return Ok(binary);
        }

        if let Some(binary) = sole_file(&bin_dir) {
            return Ok(binary);
        }
    }

    debug!("no binary in {:?}, searching source", bin_dir.display());
    let src_dir = artifact.src_dir();
    let archive = artifact.archive_path();
    if !src_dir.exists() && archive.is_file() {
        info!("extracting source archive of {}", artifact.short_hash());
        extract(&archive, artifact.path())?;
    }

    let work_dir = match definition.and_then(TargetDefinition::working_directory) {
        Some(dir) => src_dir.join(dir),
        None => src_dir,
    };

    let mut candidates = Vec::new();
    if let Some(binary_path) = definition.and_then(TargetDefinition::binary_path) {
        candidates.push(work_dir.join(binary_path));
    }
    candidates.push(work_dir.join(target));
    candidates.push(work_dir.join("bin").join(target));
    candidates.push(work_dir.join("build").join(target));

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| RunError::BinaryNotFound {
            target: target.into(),
            artifact: artifact.path().to_path_buf(),
        })
}

fn sole_file(dir: &Path) -> Option<PathBuf> {
    let mut files = read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file());

    match (files.next(), files.next()) {
        (Some(file), None) => Some(file),
        _ => None,
    }
}

/// Set execute bits on binary if none are set.
///
/// No-op on platforms without permission bits.
///
/// # Errors
///
/// - Return [`RunError::Permissions`] if the permissions cannot be changed.
pub fn ensure_executable(binary: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::{fs::set_permissions, os::unix::fs::PermissionsExt};

        let permission_err = |err| RunError::Permissions {
            source: err,
            binary: binary.to_path_buf(),
        };
        let mut permissions = binary.metadata().map_err(permission_err)?.permissions();
        if permissions.mode() & 0o111 == 0 {
            permissions.set_mode(permissions.mode() | 0o755);
            set_permissions(binary, permissions).map_err(permission_err)?;
        }
    }

    #[cfg(not(unix))]
    let _ = binary;

    Ok(())
}

/// Run resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// Artifact could not be resolved.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Source archive could not be unpacked.
    #[error(transparent)]
    Extract(#[from] ArchiveError),

    /// No binary in any known location.
    #[error("binary of target {target:?} not found in {:?}", artifact.display())]
    BinaryNotFound { target: String, artifact: PathBuf },

    /// Binary could not be made executable.
    #[error("failed to make {:?} executable", binary.display())]
    Permissions {
        #[source]
        source: std::io::Error,
        binary: PathBuf,
    },

    /// Binary path could not be made absolute.
    #[error("failed to resolve absolute path of {:?}", binary.display())]
    Absolute {
        #[source]
        source: std::io::Error,
        binary: PathBuf,
    },

    /// Binary could not be started.
    #[error("failed to run {:?}", binary.display())]
    Spawn {
        #[source]
        source: std::io::Error,
        binary: PathBuf,
    },
}

/// Friendly result alias :3
pub type Result<T, E = RunError> = std::result::Result<T, E>;
