// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote repository access.
//!
//! The artifact store only needs three things from version control: the tip
//! of a remote branch, a clone of some revision, and a way to move that clone
//! onto an exact reference. The [`Vcs`] trait captures exactly that, and
//! [`Git2Vcs`] implements it through libgit2.
//!
//! # Authentication
//!
//! Credentials are resolved through [`auth_git2`]: ssh-agent, Git credential
//! helpers, and finally an interactive prompt drawn through [`inquire`] while
//! the clone progress bar is suspended. A token can be supplied instead via
//! [`Credentials::Token`], which is sent as `x-access-token` basic credentials
//! the way GitHub expects. Tokens are never written to disk.

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::{CheckoutBuilder, RepoBuilder},
    Config, Direction, ErrorCode, FetchOptions, Remote, RemoteCallbacks, Repository,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    path::{Path, PathBuf},
    process::Command,
    time,
};
use tracing::{debug, info, instrument, warn};

/// Environment variable consulted for a token before asking `gh`.
pub const TOKEN_ENV: &str = "GITHUB_TOKEN";

// libgit2 reports `GIT_ENOTSUPPORTED` as a generic error code.
const GIT_ENOTSUPPORTED: i32 = -39;

/// Layer of indirection for version control access.
pub trait Vcs {
    /// Ask the remote for the commit its branch currently points at.
    fn resolve_branch_head(&self, url: &str, branch: &str, credentials: &Credentials)
        -> Result<String>;

    /// Clone remote into a destination directory.
    fn clone_repo(&self, url: &str, dest: &Path, opts: &CloneOptions) -> Result<()>;

    /// Move an existing clone onto an exact reference.
    fn checkout(&self, repo: &Path, reference: &str) -> Result<()>;
}

impl<T: Vcs + ?Sized> Vcs for &T {
    fn resolve_branch_head(
        &self,
        url: &str,
        branch: &str,
        credentials: &Credentials,
    ) -> Result<String> {
        (**self).resolve_branch_head(url, branch, credentials)
    }

    fn clone_repo(&self, url: &str, dest: &Path, opts: &CloneOptions) -> Result<()> {
        (**self).clone_repo(url, dest, opts)
    }

    fn checkout(&self, repo: &Path, reference: &str) -> Result<()> {
        (**self).checkout(repo, reference)
    }
}

/// How to authenticate against a remote.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Let libgit2 and the user's Git setup figure it out.
    #[default]
    Default,

    /// Token based basic authentication.
    Token(String),
}

impl Credentials {
    /// Obtain a token from the environment or the GitHub CLI.
    ///
    /// Checks [`TOKEN_ENV`] first, then `gh auth token`.
    ///
    /// # Errors
    ///
    /// - Return [`VcsError::NoToken`] if neither source yields a token.
    pub fn from_token_sources() -> Result<Self> {
        if let Some(token) = std::env::var(TOKEN_ENV)
            .ok()
            .filter(|token| !token.trim().is_empty())
        {
            debug!("using token from {TOKEN_ENV}");
            return Ok(Self::Token(token.trim().into()));
        }

        let output = Command::new("gh").args(["auth", "token"]).output();
        if let Ok(output) = output {
            let token = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            if output.status.success() && !token.is_empty() {
                debug!("using token from gh credential helper");
                return Ok(Self::Token(token));
            }
        }

        Err(VcsError::NoToken)
    }

    fn authenticator(&self, bar: &ProgressBar) -> GitAuthenticator {
        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = match self {
            Self::Default => GitAuthenticator::default(),
            Self::Token(token) => {
                GitAuthenticator::default().add_plaintext_credentials("*", "x-access-token", token)
            }
        };

        authenticator.set_prompter(prompter)
    }
}

/// Options for [`Vcs::clone_repo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOptions {
    /// History depth to fetch, zero for full history.
    pub depth: u32,

    /// Exact revision to land on, if not the default branch tip.
    pub reference: Option<String>,

    /// Draw clone progress on the console.
    pub verbose: bool,

    /// Authentication to use.
    pub credentials: Credentials,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            depth: 1,
            reference: None,
            verbose: false,
            credentials: Credentials::Default,
        }
    }
}

/// Version control access through libgit2.
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2Vcs;

impl Git2Vcs {
    /// Construct new libgit2 backend.
    pub fn new() -> Self {
        Self
    }

    fn progress_bar(url: &str, verbose: bool) -> Result<ProgressBar> {
        if !verbose {
            return Ok(ProgressBar::hidden());
        }

        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(url.to_string());
        bar.enable_steady_tick(time::Duration::from_millis(100));

        Ok(bar)
    }

    fn clone_with_depth(
        url: &str,
        dest: &Path,
        depth: u32,
        authenticator: &GitAuthenticator,
        config: &Config,
        bar: &ProgressBar,
    ) -> Result<()> {
        let clone = |depth| {
            RepoBuilder::new()
                .fetch_options(fetch_options(authenticator, config, bar, depth))
                .clone(url, dest)
                .map(drop)
        };

        match clone(depth) {
            Err(err) if depth > 0 && err.raw_code() == GIT_ENOTSUPPORTED => {
                warn!("{url} refuses shallow clones ({}), cloning full history", err.message());
                clear_partial_clone(dest)?;
                clone(0)
            }
            result => result,
        }
        .map_err(|err| classify(url, err, |source| VcsError::Clone { url: url.into(), source }))
    }

    fn fetch_exact(url: &str, dest: &Path, reference: &str, fo: &mut FetchOptions<'_>) -> Result<()> {
        let repository = Repository::init(dest)?;
        let mut remote = repository.remote("origin", url)?;
        remote
            .fetch(&[reference], Some(fo), None)
            .map_err(|err| classify(url, err, |source| VcsError::Clone { url: url.into(), source }))?;

        let commit = repository.find_reference("FETCH_HEAD")?.peel_to_commit()?;
        repository.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repository.set_head_detached(commit.id())?;

        Ok(())
    }
}

impl Vcs for Git2Vcs {
    #[instrument(skip(self, credentials), level = "debug")]
    fn resolve_branch_head(
        &self,
        url: &str,
        branch: &str,
        credentials: &Credentials,
    ) -> Result<String> {
        let bar = ProgressBar::hidden();
        let authenticator = credentials.authenticator(&bar);
        let config = Config::open_default()?;
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));

        let mut remote = Remote::create_detached(url)?;
        let connection = remote
            .connect_auth(Direction::Fetch, Some(rc), None)
            .map_err(|err| classify(url, err, |source| VcsError::ListRemote { url: url.into(), source }))?;
        let heads = connection
            .list()
            .map_err(|err| classify(url, err, |source| VcsError::ListRemote { url: url.into(), source }))?;

        let branch_ref = format!("refs/heads/{branch}");
        let head = heads
            .iter()
            .find(|head| head.name() == branch_ref)
            .or_else(|| heads.iter().find(|head| head.name() == "HEAD"))
            .ok_or_else(|| VcsError::BranchNotFound {
                branch: branch.into(),
                url: url.into(),
            })?;

        debug!("{} points at {}", head.name(), head.oid());
        Ok(head.oid().to_string())
    }

    /// Clone remote into destination.
    ///
    /// A depth of one together with an explicit reference fetches only that
    /// revision and detaches HEAD at it. If the remote refuses to serve a bare
    /// object id, fall back to a full clone followed by a checkout. Remotes
    /// that refuse shallow clones altogether, like local paths, get the full
    /// history instead.
    #[instrument(skip(self, opts), level = "debug")]
    fn clone_repo(&self, url: &str, dest: &Path, opts: &CloneOptions) -> Result<()> {
        let bar = Self::progress_bar(url, opts.verbose)?;
        let authenticator = opts.credentials.authenticator(&bar);
        let config = Config::open_default()?;

        let result = match (&opts.reference, opts.depth) {
            (Some(reference), 1) => {
                let mut fo = fetch_options(&authenticator, &config, &bar, 1);
                Self::fetch_exact(url, dest, reference, &mut fo).or_else(|err| {
                    warn!("cannot fetch {reference} alone ({err}), falling back to full clone");
                    clear_partial_clone(dest)?;
                    Self::clone_with_depth(url, dest, 0, &authenticator, &config, &bar)?;
                    self.checkout(dest, reference)
                })
            }
            (_, depth) => Self::clone_with_depth(url, dest, depth, &authenticator, &config, &bar),
        };
        bar.finish_and_clear();
        result?;

        info!("cloned {url} into {:?}", dest.display());
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn checkout(&self, repo: &Path, reference: &str) -> Result<()> {
        let checkout_err = |source| VcsError::Checkout {
            reference: reference.into(),
            source,
        };

        let repository = Repository::open(repo).map_err(checkout_err)?;
        let object = repository
            .revparse_single(reference)
            .or_else(|_| repository.revparse_single(&format!("origin/{reference}")))
            .map_err(checkout_err)?;
        let commit = object.peel_to_commit().map_err(checkout_err)?;
        repository
            .checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
            .map_err(checkout_err)?;
        repository.set_head_detached(commit.id()).map_err(checkout_err)?;

        Ok(())
    }
}

fn fetch_options<'a>(
    authenticator: &'a GitAuthenticator,
    config: &'a Config,
    bar: &'a ProgressBar,
    depth: u32,
) -> FetchOptions<'a> {
    let mut throttle = time::Instant::now();
    let mut rc = RemoteCallbacks::new();
    rc.credentials(authenticator.credentials(config));
    rc.transfer_progress(move |progress| {
        let stats = progress.to_owned();
        if throttle.elapsed() > time::Duration::from_millis(10) {
            throttle = time::Instant::now();
            bar.set_length(stats.total_objects() as u64);
            bar.set_position(stats.received_objects() as u64);
        }
        true
    });

    let mut fo = FetchOptions::new();
    fo.remote_callbacks(rc);
    if depth > 0 {
        fo.depth(i32::try_from(depth).unwrap_or(i32::MAX));
    }
    fo
}

fn clear_partial_clone(dest: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dest) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(VcsError::Cleanup {
            source: err,
            path: dest.to_path_buf(),
        }),
        _ => Ok(()),
    }
}

fn classify(url: &str, err: git2::Error, otherwise: impl FnOnce(git2::Error) -> VcsError) -> VcsError {
    if err.code() == ErrorCode::Auth {
        return VcsError::Authentication {
            url: url.into(),
            source: err,
        };
    }

    otherwise(err)
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("passphrase")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}

/// Version control error types.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Remote rejected our credentials.
    #[error("authentication failed for {url}")]
    Authentication {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Remote does not carry the requested branch.
    #[error("branch {branch:?} not found in remote repository {url}")]
    BranchNotFound { branch: String, url: String },

    /// Remote references could not be listed.
    #[error("failed to list remote references of {url}")]
    ListRemote {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Clone did not complete.
    #[error("failed to clone {url}")]
    Clone {
        url: String,
        #[source]
        source: git2::Error,
    },

    /// Reference could not be checked out.
    #[error("failed to checkout reference {reference:?}")]
    Checkout {
        reference: String,
        #[source]
        source: git2::Error,
    },

    /// Partial clone could not be cleared before retrying.
    #[error("failed to clear partial clone at {:?}", path.display())]
    Cleanup {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// No token available for token authentication.
    #[error("no token found, set {TOKEN_ENV} or login with 'gh auth login'")]
    NoToken,

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = VcsError> = std::result::Result<T, E>;
