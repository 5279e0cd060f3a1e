// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{single_target, target_with_command, CountingRunner, FakeVcs, RepoFixture};

use anyhow::Result;
use filetime::{set_file_mtime, FileTime};
use nigiri::{
    build::{BuildError, BuildOutcome, BuildPipeline, BuildRequest},
    commit::Commit,
    metadata::BuildRecord,
    path::lock_path_of,
    retention::{RetentionManager, RetentionPolicy},
    run::RunResolver,
    store::{ArtifactStore, StoreError},
    vcs::{CloneOptions, Credentials, Git2Vcs, Vcs},
};
use pretty_assertions::assert_eq;
use std::{
    cell::Cell,
    fs::{read_to_string, remove_file, write},
    time::{Duration, SystemTime},
};

const HEAD: &str = "0123456789abcdef0123456789abcdef01234567";
const DAY: u64 = 24 * 60 * 60;

fn seed_builds(store: &ArtifactStore, target: &str, ages_in_days: &[u64]) -> Result<()> {
    let root = store.create_target(target)?;
    let now = SystemTime::now();
    for (index, age) in ages_in_days.iter().enumerate() {
        let artifact = root.create(&Commit::new(format!("{index:07x}"))?)?;
        let modified = now - Duration::from_secs(age * DAY);
        set_file_mtime(artifact.path(), FileTime::from_system_time(modified))?;
    }

    Ok(())
}

fn build_count(store: &ArtifactStore, target: &str) -> Result<usize> {
    Ok(store.target(target)?.list_builds()?.len())
}

#[cfg(unix)]
#[test]
fn build_twice_without_force_is_noop() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target("foo", target_with_command("https://example.org/foo.git", "true"));
    let vcs = FakeVcs::new(HEAD);
    let runner = CountingRunner::default();
    let pipeline = BuildPipeline::new(&store, &config, &vcs, &runner);

    let first = pipeline.build(&BuildRequest::new("foo"))?;
    assert!(matches!(first, BuildOutcome::Built(_)));
    assert!(first.artifact().is_complete());

    let second = pipeline.build(&BuildRequest::new("foo"))?;
    assert!(matches!(second, BuildOutcome::AlreadyBuilt { .. }));
    assert_eq!(second.commit().short_hash(), "0123456");
    assert_eq!(vcs.clones.get(), 1);
    assert_eq!(runner.runs.get(), 1);

    Ok(())
}

#[cfg(unix)]
#[test]
fn force_rebuild_reruns_build_command() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target(
        "foo",
        target_with_command("https://example.org/foo.git", "echo run >> ../../marker"),
    );
    let vcs = FakeVcs::new(HEAD);
    let runner = CountingRunner::default();
    let pipeline = BuildPipeline::new(&store, &config, &vcs, &runner);

    let mut request = BuildRequest::new("foo");
    pipeline.build(&request)?;
    request.force = true;
    let outcome = pipeline.build(&request)?;

    assert!(matches!(outcome, BuildOutcome::Built(_)));
    assert_eq!(runner.runs.get(), 2);
    assert_eq!(vcs.clones.get(), 2);
    assert_eq!(
        read_to_string(outcome.artifact().path().parent().unwrap().join("marker"))?,
        "run\nrun\n"
    );

    Ok(())
}

#[cfg(unix)]
#[test]
fn failed_build_is_kept_and_incomplete() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target(
        "foo",
        target_with_command("https://example.org/foo.git", "echo broken; exit 3"),
    );
    let vcs = FakeVcs::new(HEAD);
    let pipeline = BuildPipeline::new(&store, &config, &vcs, CountingRunner::default());

    let result = pipeline.build(&BuildRequest::new("foo"));
    let log = match result {
        Err(BuildError::BuildFailed { status, log }) => {
            assert_eq!(status.code(), Some(3));
            log
        }
        other => panic!("expected build failure, got {other:?}"),
    };
    assert_eq!(read_to_string(&log)?, "broken\n");

    let root = store.target("foo")?;
    let head = root.locate_head()?;
    assert_eq!(head.name(), "0123456");
    assert!(!head.artifact.is_complete());
    assert!(head.artifact.src_dir().is_dir());

    Ok(())
}

#[cfg(unix)]
#[test]
fn failed_force_rebuild_is_incomplete() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target(
        "foo",
        target_with_command("https://example.org/foo.git", "test ! -e ../../broken"),
    );
    let pipeline = BuildPipeline::new(&store, &config, FakeVcs::new(HEAD), CountingRunner::default());

    let mut request = BuildRequest::new("foo");
    let artifact = pipeline.build(&request)?.artifact().clone();
    assert!(artifact.is_complete());

    write(store.target("foo")?.path().join("broken"), "")?;
    request.force = true;
    assert!(matches!(
        pipeline.build(&request),
        Err(BuildError::BuildFailed { .. })
    ));
    assert!(artifact.info_path().is_file());
    assert!(!artifact.is_complete());

    let policy = RetentionPolicy {
        include_incomplete: true,
        ..Default::default()
    };
    let plan = RetentionManager::new(&store).plan("foo", &policy, SystemTime::now())?;
    let evicted = plan.evict.iter().map(|build| build.name()).collect::<Vec<_>>();
    assert_eq!(evicted, vec!["0123456"]);

    Ok(())
}

#[cfg(unix)]
#[test]
fn already_built_commit_takes_no_lock() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target("foo", target_with_command("https://example.org/foo.git", "true"));
    let pipeline = BuildPipeline::new(&store, &config, FakeVcs::new(HEAD), CountingRunner::default());

    pipeline.build(&BuildRequest::new("foo"))?;
    let lock = lock_path_of(store.target("foo")?.path(), "0123456");
    if lock.exists() {
        remove_file(&lock)?;
    }

    let outcome = pipeline.build(&BuildRequest::new("foo"))?;
    assert!(matches!(outcome, BuildOutcome::AlreadyBuilt { .. }));
    assert!(!lock.exists());

    Ok(())
}

#[cfg(unix)]
#[test]
fn post_build_steps_archive_source_and_copy_binary() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path().join("store"));
    let mut definition = target_with_command(
        "https://example.org/foo.git",
        "mkdir -p out && printf '#!/bin/sh\\n' > out/foo && chmod 755 out/foo",
    );
    definition.working_directory = Some("cmd".into());
    definition.build_command.binary_path = Some("out/foo".into());
    definition.env = vec!["NIGIRI_FLAVOR=salmon".into()];
    let config = single_target("foo", definition);
    let pipeline = BuildPipeline::new(&store, &config, FakeVcs::new(HEAD), CountingRunner::default());

    let report = match pipeline.build(&BuildRequest::new("foo"))? {
        BuildOutcome::Built(report) => report,
        other => panic!("expected fresh build, got {other:?}"),
    };
    assert!(report.warnings.is_empty());
    assert_eq!(report.binary, Some(report.artifact.bin_dir().join("foo")));
    assert!(report.artifact.archive_path().is_file());
    assert!(!report.artifact.src_dir().exists());

    let record = BuildRecord::read_from(report.artifact.info_path())?;
    assert_eq!(record.commit(), Some(HEAD));
    assert_eq!(record.get("Target"), Some("foo"));
    assert!(record.build_date().is_some());

    let launch = RunResolver::new(&store).prepare("foo", config.target("foo"), Some("HEAD"))?;
    assert_eq!(launch.binary, report.artifact.bin_dir().join("foo"));
    assert_eq!(
        launch.env,
        vec![("NIGIRI_FLAVOR".to_string(), "salmon".to_string())]
    );

    Ok(())
}

#[cfg(unix)]
#[test]
fn binary_only_discards_source() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let mut definition = target_with_command("https://example.org/foo.git", "true");
    definition.binary_only = true;
    let config = single_target("foo", definition);
    let pipeline = BuildPipeline::new(&store, &config, FakeVcs::new(HEAD), CountingRunner::default());

    let outcome = pipeline.build(&BuildRequest::new("foo"))?;
    assert!(!outcome.artifact().src_dir().exists());
    assert!(!outcome.artifact().archive_path().exists());
    assert!(outcome.artifact().is_complete());

    Ok(())
}

#[test]
fn configuration_errors_abort_before_mutation() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target("foo", target_with_command("https://example.org/foo.git", "true"));
    let vcs = FakeVcs::new(HEAD);

    let pipeline = BuildPipeline::new(&store, &config, &vcs, CountingRunner::default());
    assert!(matches!(
        pipeline.build(&BuildRequest::new("bar")),
        Err(BuildError::UnknownTarget { .. })
    ));

    let pipeline = pipeline.with_host(None);
    assert!(matches!(
        pipeline.build(&BuildRequest::new("foo")),
        Err(BuildError::NoBuildCommand { .. })
    ));

    let mut request = BuildRequest::new("foo");
    request.commit = Some("abc".into());
    assert!(matches!(
        pipeline.build(&request),
        Err(BuildError::CommitResolution(_))
    ));

    assert!(store.list_targets()?.is_empty());
    assert_eq!(vcs.clones.get(), 0);

    Ok(())
}

#[test]
fn missing_working_directory_fails_after_clone() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let mut definition = target_with_command("https://example.org/foo.git", "true");
    definition.working_directory = Some("nope".into());
    let config = single_target("foo", definition);
    let runner = CountingRunner::default();
    let pipeline = BuildPipeline::new(&store, &config, FakeVcs::new(HEAD), &runner);

    assert!(matches!(
        pipeline.build(&BuildRequest::new("foo")),
        Err(BuildError::WorkingDirNotFound { .. })
    ));
    assert_eq!(runner.runs.get(), 0);
    assert_eq!(build_count(&store, "foo")?, 1);

    Ok(())
}

#[cfg(unix)]
#[test]
fn explicit_commit_checkout_depends_on_depth() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let config = single_target("foo", target_with_command("https://example.org/foo.git", "true"));
    let vcs = FakeVcs::new(HEAD);
    let pipeline = BuildPipeline::new(&store, &config, &vcs, CountingRunner::default());

    let mut request = BuildRequest::new("foo");
    request.commit = Some("fedcba9876".into());
    pipeline.build(&request)?;
    assert!(vcs.checkouts.borrow().is_empty());

    request.commit = Some("aaaaaaa1111".into());
    request.depth = 0;
    pipeline.build(&request)?;
    assert_eq!(*vcs.checkouts.borrow(), vec!["aaaaaaa1111".to_string()]);

    Ok(())
}

#[test]
fn git2_resolves_branch_head_and_checks_out() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let upstream = RepoFixture::new(tmp.path().join("upstream"))?;
    let first = upstream.stage_and_commit("hello.txt", "first\n")?;
    let second = upstream.stage_and_commit("hello.txt", "second\n")?;

    let vcs = Git2Vcs::new();
    let head = vcs.resolve_branch_head(&upstream.url(), "main", &Credentials::Default)?;
    assert_eq!(head, second.to_string());

    let dest = tmp.path().join("clone");
    let opts = CloneOptions {
        depth: 0,
        ..Default::default()
    };
    vcs.clone_repo(&upstream.url(), &dest, &opts)?;
    assert_eq!(read_to_string(dest.join("hello.txt"))?, "second\n");

    vcs.checkout(&dest, &first.to_string())?;
    assert_eq!(read_to_string(dest.join("hello.txt"))?, "first\n");

    Ok(())
}

#[cfg(unix)]
#[test]
fn git2_pipeline_builds_from_local_upstream() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let upstream = RepoFixture::new(tmp.path().join("upstream"))?;
    upstream.stage_and_commit("build.sh", "mkdir -p out\necho built > out/app\n")?;
    let head = upstream.stage_and_commit("VERSION", "1\n")?;

    let store = ArtifactStore::new(tmp.path().join("store"));
    let mut definition = target_with_command(&upstream.url(), "sh build.sh");
    definition.build_command.binary_path = Some("out/app".into());
    let config = single_target("app", definition);
    let pipeline = BuildPipeline::new(&store, &config, Git2Vcs::new(), CountingRunner::default());

    let mut request = BuildRequest::new("app");
    request.depth = 0;
    let outcome = pipeline.build(&request)?;

    assert_eq!(outcome.commit().hash(), head.to_string());
    assert_eq!(
        read_to_string(outcome.artifact().bin_dir().join("app"))?,
        "built\n"
    );
    assert!(outcome.artifact().archive_path().is_file());

    Ok(())
}

#[cfg(unix)]
#[test]
fn git2_default_depth_builds_from_local_upstream() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let upstream = RepoFixture::new(tmp.path().join("upstream"))?;
    upstream.stage_and_commit("build.sh", "mkdir -p out\ncat VERSION > out/app\n")?;
    let head = upstream.stage_and_commit("VERSION", "1\n")?;

    let store = ArtifactStore::new(tmp.path().join("store"));
    let mut definition = target_with_command(&upstream.url(), "sh build.sh");
    definition.build_command.binary_path = Some("out/app".into());
    let config = single_target("app", definition);
    let pipeline = BuildPipeline::new(&store, &config, Git2Vcs::new(), CountingRunner::default());

    let outcome = pipeline.build(&BuildRequest::new("app"))?;
    assert_eq!(outcome.commit().hash(), head.to_string());
    assert_eq!(read_to_string(outcome.artifact().bin_dir().join("app"))?, "1\n");

    Ok(())
}

#[cfg(unix)]
#[test]
fn git2_explicit_commit_at_depth_one_from_local_upstream() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let upstream = RepoFixture::new(tmp.path().join("upstream"))?;
    upstream.stage_and_commit("build.sh", "mkdir -p out\ncat VERSION > out/app\n")?;
    let first = upstream.stage_and_commit("VERSION", "1\n")?;
    upstream.stage_and_commit("VERSION", "2\n")?;

    let store = ArtifactStore::new(tmp.path().join("store"));
    let mut definition = target_with_command(&upstream.url(), "sh build.sh");
    definition.build_command.binary_path = Some("out/app".into());
    let config = single_target("app", definition);
    let pipeline = BuildPipeline::new(&store, &config, Git2Vcs::new(), CountingRunner::default());

    let mut request = BuildRequest::new("app");
    request.commit = Some(first.to_string());
    let outcome = pipeline.build(&request)?;
    assert_eq!(outcome.commit().hash(), first.to_string());
    assert_eq!(read_to_string(outcome.artifact().bin_dir().join("app"))?, "1\n");

    Ok(())
}

#[test]
fn retention_count_bound_keeps_newest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    seed_builds(&store, "foo", &[0, 1, 2, 3, 4, 5, 6])?;
    let manager = RetentionManager::new(&store);
    let policy = RetentionPolicy {
        max_builds: 3,
        ..Default::default()
    };

    let plan = manager.plan("foo", &policy, SystemTime::now())?;
    let evicted = plan.evict.iter().map(|build| build.name()).collect::<Vec<_>>();
    assert_eq!(evicted, vec!["0000003", "0000004", "0000005", "0000006"]);

    let report = manager.sweep(&[plan], false, |_, _| true);
    assert_eq!(report.removed, 4);
    assert_eq!(build_count(&store, "foo")?, 3);

    Ok(())
}

#[test]
fn retention_age_bound_removes_old_builds() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    seed_builds(&store, "foo", &[0, 3, 6, 9, 12, 15, 18])?;
    let manager = RetentionManager::new(&store);
    let policy = RetentionPolicy {
        max_age_days: 10,
        ..Default::default()
    };

    let plan = manager.plan("foo", &policy, SystemTime::now())?;
    let evicted = plan.evict.iter().map(|build| build.name()).collect::<Vec<_>>();
    assert_eq!(evicted, vec!["0000004", "0000005", "0000006"]);

    manager.sweep(&[plan], false, |_, _| true);
    assert_eq!(build_count(&store, "foo")?, 4);

    Ok(())
}

#[test]
fn retention_dry_run_and_decline_delete_nothing() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    seed_builds(&store, "foo", &[0, 20, 40])?;
    let manager = RetentionManager::new(&store);
    let policy = RetentionPolicy {
        max_builds: 1,
        max_age_days: 1,
        include_incomplete: true,
    };
    let plans = vec![manager.plan("foo", &policy, SystemTime::now())?];

    let report = manager.sweep(&plans, true, |_, _| panic!("dry run never asks"));
    assert_eq!(report.planned, 3);
    assert_eq!(report.removed, 0);
    assert_eq!(build_count(&store, "foo")?, 3);

    let report = manager.sweep(&plans, false, |_, _| false);
    assert!(report.declined);
    assert_eq!(build_count(&store, "foo")?, 3);

    Ok(())
}

#[test]
fn retention_sweep_of_all_targets_asks_once() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    seed_builds(&store, "foo", &[0, 1, 2])?;
    seed_builds(&store, "bar", &[0, 1])?;
    let manager = RetentionManager::new(&store);
    let policy = RetentionPolicy {
        max_builds: 1,
        ..Default::default()
    };

    let plans = manager.plan_all(&policy, SystemTime::now())?;
    let asked = Cell::new(0);
    let report = manager.sweep(&plans, false, |count, _| {
        asked.set(asked.get() + 1);
        assert_eq!(count, 3);
        true
    });

    assert_eq!(asked.get(), 1);
    assert_eq!(report.removed, 3);
    assert_eq!(build_count(&store, "foo")?, 1);
    assert_eq!(build_count(&store, "bar")?, 1);

    Ok(())
}

#[test]
fn retention_of_unknown_target_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    let result = RetentionManager::new(&store).plan("ghost", &RetentionPolicy::default(), SystemTime::now());
    assert!(result.is_err());

    Ok(())
}

#[test]
fn removing_missing_target_or_commit_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = ArtifactStore::new(tmp.path());
    assert!(matches!(
        store.target("ghost"),
        Err(StoreError::UnknownTarget { .. })
    ));

    seed_builds(&store, "foo", &[0])?;
    let root = store.target("foo")?;
    assert!(matches!(
        root.resolve_prefix("fffffff"),
        Err(StoreError::NotFound { .. })
    ));

    Ok(())
}
