// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Build pipeline.
//!
//! Turn a target and an optional commit into an artifact: resolve the commit,
//! claim its artifact directory, clone, run the host's build command, then
//! keep the binary, archive or discard the source, and record metadata.
//!
//! # Failure Policy
//!
//! Resolution and configuration errors abort before anything touches the
//! store. Once the artifact directory exists, a failing clone, checkout, or
//! build aborts the pipeline but leaves the directory in place for inspection.
//! Such a build never gets a metadata record, which is how it is recognized as
//! incomplete later on. Binary copying, source archiving, and metadata writing
//! happen after the build succeeded, so their failures only produce warnings.

use crate::{
    archive::compress_dir,
    commit::{resolve_commit, Commit, CommitError, CommitSelector, RemoteSpec},
    config::{NigiriConfig, TargetDefinition},
    exec::{host_arch_name, host_os_name, CommandRunner, ExecError, HostOs, OutputSink},
    metadata::BuildInfo,
    path::create_dir_if_absent,
    store::{Artifact, ArtifactStore, StoreError},
    vcs::{CloneOptions, Credentials, Vcs, VcsError},
};

use std::{
    fs::{copy, remove_dir_all, remove_file, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::{Duration, Instant},
};
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

/// What to build and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// Name of target to build.
    pub target: String,

    /// Commit to build, `HEAD` alias, or nothing for the branch tip.
    pub commit: Option<String>,

    /// Rebuild even if an artifact already exists.
    pub force: bool,

    /// Clone depth, zero for full history.
    pub depth: u32,

    /// Mirror clone progress and build output to the console.
    pub verbose: bool,

    /// Authentication for the remote.
    pub credentials: Credentials,
}

impl BuildRequest {
    /// Construct request for target with default options.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            commit: None,
            force: false,
            depth: 1,
            verbose: false,
            credentials: Credentials::Default,
        }
    }
}

/// Result of a successful pipeline run.
#[derive(Debug)]
pub enum BuildOutcome {
    /// Artifact existed and no rebuild was requested.
    AlreadyBuilt { commit: Commit, artifact: Artifact },

    /// Artifact was (re)built.
    Built(BuildReport),
}

impl BuildOutcome {
    pub fn commit(&self) -> &Commit {
        match self {
            Self::AlreadyBuilt { commit, .. } => commit,
            Self::Built(report) => &report.commit,
        }
    }

    pub fn artifact(&self) -> &Artifact {
        match self {
            Self::AlreadyBuilt { artifact, .. } => artifact,
            Self::Built(report) => &report.artifact,
        }
    }
}

/// Details of a finished build.
#[derive(Debug)]
pub struct BuildReport {
    pub commit: Commit,
    pub artifact: Artifact,
    pub clone_duration: Duration,
    pub build_duration: Duration,

    /// Binary copied into the artifact, if configured and found.
    pub binary: Option<PathBuf>,

    /// Problems with post-build steps that did not fail the build.
    pub warnings: Vec<String>,
}

/// Orchestrates builds against an artifact store.
#[derive(Debug)]
pub struct BuildPipeline<'a, V, R> {
    store: &'a ArtifactStore,
    config: &'a NigiriConfig,
    vcs: V,
    runner: R,
    host: Option<HostOs>,
}

impl<'a, V, R> BuildPipeline<'a, V, R>
where
    V: Vcs,
    R: CommandRunner,
{
    /// Construct new pipeline for the running host.
    pub fn new(store: &'a ArtifactStore, config: &'a NigiriConfig, vcs: V, runner: R) -> Self {
        Self {
            store,
            config,
            vcs,
            runner,
            host: HostOs::current(),
        }
    }

    /// Pick build commands as if running on another host.
    pub fn with_host(mut self, host: Option<HostOs>) -> Self {
        self.host = host;
        self
    }

    /// Run the pipeline to completion.
    ///
    /// # Errors
    ///
    /// - Return [`BuildError::UnknownTarget`] if target is not configured.
    /// - Return [`BuildError::CommitResolution`] if commit cannot be resolved.
    /// - Return [`BuildError::NoBuildCommand`] if target has no command for
    ///   this host.
    /// - Return [`BuildError::Store`] if the artifact directory cannot be
    ///   claimed, including when another build holds its lock.
    /// - Return [`BuildError::Clone`] or [`BuildError::Checkout`] if the source
    ///   cannot be obtained.
    /// - Return [`BuildError::WorkingDirNotFound`] if the configured working
    ///   directory is missing from the clone.
    /// - Return [`BuildError::BuildFailed`] if the build command fails.
    #[instrument(skip(self, request), fields(target = %request.target), level = "debug")]
    pub fn build(&self, request: &BuildRequest) -> Result<BuildOutcome> {
        let definition = self
            .config
            .target(&request.target)
            .ok_or_else(|| BuildError::UnknownTarget {
                name: request.target.clone(),
            })?;

        let selector = CommitSelector::parse(request.commit.as_deref());
        let remote = RemoteSpec {
            url: definition.source.as_str(),
            default_branch: definition.default_branch.as_deref(),
        };
        let commit = resolve_commit(&self.vcs, remote, &selector, &request.credentials)?;

        // INVARIANT: Configuration errors must abort before any mutation.
        let command = self.select_command(&request.target, definition)?;

        let target_root = self.store.create_target(&request.target)?;
        if !request.force && target_root.exists(&commit) {
            info!("{} at {commit} is already built", request.target);
            let artifact = target_root.artifact(&commit);
            return Ok(BuildOutcome::AlreadyBuilt { commit, artifact });
        }
        let _lock = target_root.lock(&commit)?;

        // INVARIANT: Another build may have finished the commit since the check above.
        let artifact = if target_root.exists(&commit) {
            let artifact = target_root.artifact(&commit);
            if !request.force {
                info!("{} at {commit} is already built", request.target);
                return Ok(BuildOutcome::AlreadyBuilt { commit, artifact });
            }

            info!("force rebuilding {} at {commit}", request.target);
            wipe_source(&artifact)?;
            artifact
        } else {
            target_root.create(&commit)?
        };
        artifact.mark_pending()?;

        create_dir_if_absent(artifact.log_dir()).map_err(StoreError::Path)?;
        let log_path = artifact.build_log();
        let log = File::create(&log_path).map_err(|err| BuildError::Log {
            source: err,
            path: log_path.clone(),
        })?;

        info!("cloning {} at {commit}", definition.source);
        let clone_opts = CloneOptions {
            depth: request.depth,
            reference: selector.is_explicit().then(|| commit.hash().to_owned()),
            verbose: request.verbose,
            credentials: request.credentials.clone(),
        };
        let start = Instant::now();
        self.vcs
            .clone_repo(&definition.source, &artifact.src_dir(), &clone_opts)
            .map_err(BuildError::Clone)?;

        // INVARIANT: A depth one clone of an explicit commit already landed on it.
        if selector.is_explicit() && request.depth != 1 {
            self.vcs
                .checkout(&artifact.src_dir(), commit.hash())
                .map_err(BuildError::Checkout)?;
        }
        let clone_duration = start.elapsed();

        let work_dir = match definition.working_directory() {
            Some(dir) => {
                let work_dir = artifact.src_dir().join(dir);
                if !work_dir.is_dir() {
                    return Err(BuildError::WorkingDirNotFound { path: work_dir });
                }
                work_dir
            }
            None => artifact.src_dir(),
        };

        info!("building {} at {commit}", request.target);
        let start = Instant::now();
        let status = self.runner.run(
            &work_dir,
            command,
            &definition.env_pairs(),
            OutputSink {
                log,
                mirror: request.verbose,
            },
        )?;
        let build_duration = start.elapsed();

        if !status.success() {
            return Err(BuildError::BuildFailed {
                status,
                log: log_path,
            });
        }

        let mut warnings = Vec::new();
        let binary = match definition.binary_path() {
            Some(binary_path) => match copy_binary(&work_dir.join(binary_path), &artifact) {
                Ok(binary) => Some(binary),
                Err(err) => {
                    note(&mut warnings, format!("failed to copy binary: {err}"));
                    None
                }
            },
            None => None,
        };

        retain_source(definition, &artifact, &mut warnings);

        let info = BuildInfo {
            target: request.target.clone(),
            commit: commit.hash().to_owned(),
            short_hash: commit.short_hash().to_owned(),
            build_date: OffsetDateTime::now_utc(),
            clone_duration,
            build_duration,
            os: host_os_name().into(),
            arch: host_arch_name().into(),
        };
        if let Err(err) = info.write_to(artifact.info_path()) {
            note(&mut warnings, format!("failed to write build metadata: {err}"));
        }
        if let Err(err) = artifact.clear_pending() {
            note(&mut warnings, format!("failed to mark build as finished: {err}"));
        }

        info!("built {} at {commit} in {build_duration:?}", request.target);
        Ok(BuildOutcome::Built(BuildReport {
            commit,
            artifact,
            clone_duration,
            build_duration,
            binary,
            warnings,
        }))
    }

    fn select_command(&self, target: &str, definition: &'a TargetDefinition) -> Result<&'a str> {
        let os = self.host.ok_or_else(|| BuildError::NoBuildCommand {
            target: target.into(),
            os: host_os_name().into(),
        })?;

        self.config
            .build_command_for(definition, os)
            .ok_or_else(|| BuildError::NoBuildCommand {
                target: target.into(),
                os: os.to_string(),
            })
    }
}

fn note(warnings: &mut Vec<String>, message: String) {
    warn!("{message}");
    warnings.push(message);
}

/// Clear the source subtree of an artifact for a forced rebuild.
///
/// Logs, binaries, and metadata stay put until overwritten.
fn wipe_source(artifact: &Artifact) -> Result<()> {
    match remove_dir_all(artifact.src_dir()) {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            return Err(BuildError::Wipe {
                source: err,
                path: artifact.src_dir(),
            })
        }
        _ => {}
    }

    match remove_file(artifact.archive_path()) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(BuildError::Wipe {
            source: err,
            path: artifact.archive_path(),
        }),
        _ => Ok(()),
    }
}

/// Copy built binary into the artifact's `bin` directory.
///
/// Permission bits travel with the copy.
fn copy_binary(binary: &Path, artifact: &Artifact) -> std::io::Result<PathBuf> {
    let file_name = binary
        .file_name()
        .ok_or_else(|| std::io::Error::new(ErrorKind::InvalidInput, "binary path has no file name"))?;
    let bin_dir = artifact.bin_dir();
    create_dir_if_absent(&bin_dir).map_err(std::io::Error::other)?;

    let dest = bin_dir.join(file_name);
    copy(binary, &dest)?;
    info!("binary saved to {:?}", dest.display());

    Ok(dest)
}

/// Archive or discard the cloned source.
///
/// A failed archive leaves the live tree in place.
fn retain_source(definition: &TargetDefinition, artifact: &Artifact, warnings: &mut Vec<String>) {
    let src_dir = artifact.src_dir();
    if definition.binary_only {
        if let Err(err) = remove_dir_all(&src_dir) {
            note(warnings, format!("failed to remove source of binary-only target: {err}"));
        }
        return;
    }

    if let Err(err) = compress_dir(&src_dir, &artifact.archive_path()) {
        note(warnings, format!("keeping uncompressed source: {err}"));
        return;
    }

    if let Err(err) = remove_dir_all(&src_dir) {
        note(warnings, format!("failed to remove source after compression: {err}"));
    }
}

/// Build pipeline error types.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Target is not in the configuration.
    #[error("unknown target {name:?}, add it to the configuration first")]
    UnknownTarget { name: String },

    /// Commit could not be resolved.
    #[error(transparent)]
    CommitResolution(#[from] CommitError),

    /// Target lacks a build command for the host.
    #[error("target {target:?} has no build command for {os}")]
    NoBuildCommand { target: String, os: String },

    /// Artifact directory could not be claimed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Build log could not be created.
    #[error("failed to create build log {:?}", path.display())]
    Log {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Source of a forced rebuild could not be cleared.
    #[error("failed to clear previous source at {:?}", path.display())]
    Wipe {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Source could not be cloned.
    #[error("failed to clone source")]
    Clone(#[source] VcsError),

    /// Requested commit could not be checked out.
    #[error("failed to checkout requested commit")]
    Checkout(#[source] VcsError),

    /// Configured working directory is missing from the clone.
    #[error("working directory {:?} not found in source", path.display())]
    WorkingDirNotFound { path: PathBuf },

    /// Build command could not be run.
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Build command exited unsuccessfully.
    #[error("build failed with {status}, see log at {:?}", log.display())]
    BuildFailed { status: ExitStatus, log: PathBuf },
}

/// Friendly result alias :3
pub type Result<T, E = BuildError> = std::result::Result<T, E>;
