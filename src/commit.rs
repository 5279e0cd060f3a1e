// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Commit identity and resolution.
//!
//! A [`Commit`] pairs a full hash with its __short hash__, the first seven
//! characters of the full hash. The short hash is the only part of a commit
//! that ever reaches the file system: it names the artifact directory.
//!
//! # Resolution
//!
//! Users name commits three ways: not at all, through the `HEAD` alias, or by
//! an explicit hash. The first two both mean "the current tip of the remote
//! default branch" and always ask the remote. An explicit hash is trusted as
//! given and only checked structurally, so resolving it never touches the
//! network.

use crate::vcs::{Credentials, Vcs};

use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::{info, instrument};

/// Number of leading hash characters used as the on-disk identity.
pub const SHORT_HASH_LEN: usize = 7;

/// Branch used when a target does not name a default branch.
pub const FALLBACK_BRANCH: &str = "main";

/// A built or buildable revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Commit {
    hash: String,
    short_hash: String,
}

impl Commit {
    /// Construct commit from a full or partial hash.
    ///
    /// # Errors
    ///
    /// - Return [`CommitError::InvalidCommit`] if the hash is shorter than
    ///   [`SHORT_HASH_LEN`] characters.
    pub fn new(hash: impl Into<String>) -> Result<Self> {
        let hash = hash.into().trim().to_owned();
        let short_hash = short_hash_of(&hash)?.to_owned();
        let commit = Self { hash, short_hash };
        commit.validate()?;

        Ok(commit)
    }

    /// Full hash as given or as reported by the remote.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Seven character prefix naming the artifact directory.
    pub fn short_hash(&self) -> &str {
        &self.short_hash
    }

    /// Check that both hash forms are present and long enough.
    ///
    /// # Errors
    ///
    /// - Return [`CommitError::InvalidCommit`] if either hash is empty or
    ///   shorter than [`SHORT_HASH_LEN`].
    pub fn validate(&self) -> Result<()> {
        validate_parts(&self.hash, &self.short_hash)
    }
}

impl Display for Commit {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.short_hash)
    }
}

/// Derive the short hash of a full hash.
///
/// # Errors
///
/// - Return [`CommitError::InvalidCommit`] if the hash is too short.
pub fn short_hash_of(hash: &str) -> Result<&str> {
    if hash.is_empty() {
        return Err(CommitError::InvalidCommit {
            hash: hash.into(),
            reason: "hash is empty",
        });
    }

    if hash.chars().count() < SHORT_HASH_LEN || !hash.is_char_boundary(SHORT_HASH_LEN) {
        return Err(CommitError::InvalidCommit {
            hash: hash.into(),
            reason: "hash is too short",
        });
    }

    Ok(&hash[..SHORT_HASH_LEN])
}

fn validate_parts(hash: &str, short_hash: &str) -> Result<()> {
    let reason = if hash.is_empty() {
        "hash is empty"
    } else if hash.len() < SHORT_HASH_LEN {
        "hash is too short"
    } else if short_hash.is_empty() {
        "short hash is empty"
    } else if short_hash.len() < SHORT_HASH_LEN {
        "short hash is too short"
    } else if !hash.starts_with(short_hash) {
        "short hash is not a prefix of hash"
    } else {
        return Ok(());
    };

    Err(CommitError::InvalidCommit {
        hash: hash.into(),
        reason,
    })
}

/// Check if user input is the `HEAD` alias.
pub fn is_head_alias(reference: &str) -> bool {
    reference.eq_ignore_ascii_case("HEAD")
}

/// What a user asked for when naming a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitSelector {
    /// No reference or the `HEAD` alias.
    Latest,

    /// Explicit full or partial hash.
    Hash(String),
}

impl CommitSelector {
    /// Interpret optional user input.
    pub fn parse(reference: Option<&str>) -> Self {
        match reference.map(str::trim) {
            None => Self::Latest,
            Some(reference) if reference.is_empty() || is_head_alias(reference) => Self::Latest,
            Some(reference) => Self::Hash(reference.to_owned()),
        }
    }

    /// Check if selector names a specific revision.
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Hash(_))
    }
}

/// Where a target's commits come from.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSpec<'a> {
    /// URL or path of the remote repository.
    pub url: &'a str,

    /// Default branch, if configured.
    pub default_branch: Option<&'a str>,
}

impl RemoteSpec<'_> {
    /// Default branch, or [`FALLBACK_BRANCH`] if unset.
    pub fn branch(&self) -> &str {
        self.default_branch
            .filter(|branch| !branch.is_empty())
            .unwrap_or(FALLBACK_BRANCH)
    }
}

/// Resolve user selection into a validated commit to build.
///
/// Remote tips are always fetched fresh, never read from a local cache.
///
/// # Errors
///
/// - Return [`CommitError::Resolution`] if the remote cannot report the tip
///   of the default branch.
/// - Return [`CommitError::InvalidCommit`] if the hash is malformed.
#[instrument(skip(vcs, credentials), level = "debug")]
pub fn resolve_commit(
    vcs: &impl Vcs,
    remote: RemoteSpec<'_>,
    selector: &CommitSelector,
    credentials: &Credentials,
) -> Result<Commit> {
    match selector {
        CommitSelector::Latest => {
            let branch = remote.branch();
            info!("getting HEAD of branch {branch:?} from {}", remote.url);
            let hash = vcs.resolve_branch_head(remote.url, branch, credentials)?;
            Commit::new(hash)
        }
        CommitSelector::Hash(hash) => {
            info!("using specified commit {hash}");
            Commit::new(hash.as_str())
        }
    }
}

/// Commit identity error types.
#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    /// Hash is malformed.
    #[error("invalid commit {hash:?}: {reason}")]
    InvalidCommit { hash: String, reason: &'static str },

    /// Remote could not resolve the branch tip.
    #[error("failed to resolve commit from remote")]
    Resolution(#[from] crate::vcs::VcsError),
}

/// Friendly result alias :3
pub type Result<T, E = CommitError> = std::result::Result<T, E>;
