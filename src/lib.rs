// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Commit-addressed build artifacts.
//!
//! Nigiri builds upstream repositories at specific commits and keeps each
//! result in its own directory, keyed by the target's name and the commit's
//! short hash. Builds can later be run, listed, and pruned.
//!
//! # Components
//!
//! - [`path`] maps targets and commits onto store paths.
//! - [`commit`] resolves what commit a user means.
//! - [`store`] owns the on-disk layout of artifacts.
//! - [`build`] turns a target and commit into an artifact.
//! - [`run`] finds and launches a built binary.
//! - [`retention`] evicts old builds.
//!
//! Remote access, command execution, and configuration sit behind the
//! [`vcs::Vcs`], [`exec::CommandRunner`], and [`config::TargetRegistry`]
//! traits respectively.
//!
//! There is no daemon and no shared state besides the file system. The store
//! root is always passed in explicitly.

pub mod archive;
pub mod build;
pub mod commit;
pub mod config;
pub mod exec;
pub mod metadata;
pub mod path;
pub mod retention;
pub mod run;
pub mod store;
pub mod vcs;
