// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod integration;

use anyhow::Result;
use git2::{IndexEntry, IndexTime, Oid, Repository, RepositoryInitOptions};
use nigiri::{
    config::{BuildCommands, NigiriConfig, TargetDefinition},
    exec::{CommandRunner, ExecError, OutputSink, ShellRunner},
    vcs::{CloneOptions, Credentials, Vcs, VcsError},
};
use std::{
    cell::{Cell, RefCell},
    fs::{create_dir_all, write},
    path::{Path, PathBuf},
    process::ExitStatus,
};

/// Upstream repository that targets clone from.
pub(crate) struct RepoFixture {
    repo: Repository,
    path: PathBuf,
}

impl RepoFixture {
    pub(crate) fn new(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self {
            repo,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub(crate) fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub(crate) fn stage_and_commit(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<Oid> {
        let entry = IndexEntry {
            ctime: IndexTime::new(0, 0),
            mtime: IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100644,
            uid: 0,
            gid: 0,
            file_size: contents.as_ref().len() as u32,
            id: self.repo.blob(contents.as_ref().as_bytes())?,
            flags: 0,
            flags_extended: 0,
            path: filename.as_ref().to_string_lossy().as_bytes().to_vec(),
        };

        // INVARIANT: Always use new tree produced by index after staging new entry.
        let mut index = self.repo.index()?;
        index.add_frombuffer(&entry, contents.as_ref().as_bytes())?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Some(parent) = self.repo.head().ok().and_then(|head| head.target()) {
            parents.push(self.repo.find_commit(parent)?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            format!("chore: add {:?}", filename.as_ref()).as_ref(),
            &tree,
            &parents,
        )?;

        Ok(oid)
    }
}

/// Configuration holding a single target.
pub(crate) fn single_target(name: &str, definition: TargetDefinition) -> NigiriConfig {
    let mut config = NigiriConfig::default();
    config.targets.insert(name.into(), definition);
    config
}

/// Target definition building with the same command on every host.
pub(crate) fn target_with_command(source: &str, command: &str) -> TargetDefinition {
    TargetDefinition {
        source: source.into(),
        build_command: BuildCommands {
            linux: Some(command.into()),
            windows: Some(command.into()),
            darwin: Some(command.into()),
            binary_path: None,
        },
        ..Default::default()
    }
}

/// Version control stand-in that never touches the network.
pub(crate) struct FakeVcs {
    pub(crate) head: String,
    pub(crate) clones: Cell<usize>,
    pub(crate) checkouts: RefCell<Vec<String>>,
}

impl FakeVcs {
    pub(crate) fn new(head: &str) -> Self {
        Self {
            head: head.into(),
            clones: Cell::new(0),
            checkouts: RefCell::new(Vec::new()),
        }
    }
}

impl Vcs for FakeVcs {
    fn resolve_branch_head(
        &self,
        _url: &str,
        _branch: &str,
        _credentials: &Credentials,
    ) -> Result<String, VcsError> {
        Ok(self.head.clone())
    }

    fn clone_repo(&self, _url: &str, dest: &Path, _opts: &CloneOptions) -> Result<(), VcsError> {
        self.clones.set(self.clones.get() + 1);
        create_dir_all(dest.join("cmd")).map_err(|source| VcsError::Cleanup {
            source,
            path: dest.to_path_buf(),
        })?;
        write(dest.join("README"), "fixture\n").map_err(|source| VcsError::Cleanup {
            source,
            path: dest.to_path_buf(),
        })?;

        Ok(())
    }

    fn checkout(&self, _repo: &Path, reference: &str) -> Result<(), VcsError> {
        self.checkouts.borrow_mut().push(reference.into());
        Ok(())
    }
}

/// Shell runner that counts its invocations.
#[derive(Default)]
pub(crate) struct CountingRunner {
    pub(crate) runs: Cell<usize>,
}

impl CommandRunner for CountingRunner {
    fn run(
        &self,
        cwd: &Path,
        command: &str,
        env: &[(String, String)],
        sink: OutputSink,
    ) -> Result<ExitStatus, ExecError> {
        self.runs.set(self.runs.get() + 1);
        ShellRunner::new().run(cwd, command, env, sink)
    }
}
