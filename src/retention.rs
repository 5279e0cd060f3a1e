// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retention of old builds.
//!
//! Evict builds by count, by age, or both. The two bounds are independent
//! filters whose matches are unioned: a build is evicted if it lies beyond
//! the newest `max_builds`, or if it is older than `max_age_days`, or both.
//!
//! Planning is pure and never touches the file system beyond listing builds.
//! Sweeping deletes what was planned, carrying on past individual failures.

use crate::store::{ArtifactStore, StoreError, StoredBuild};

use std::{
    fs::remove_dir_all,
    time::{Duration, SystemTime},
};
use tracing::{info, instrument, warn};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Bounds deciding which builds to evict.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many newest builds, zero to disable.
    pub max_builds: usize,

    /// Evict builds older than this many days, zero to disable.
    pub max_age_days: u64,

    /// Also evict builds that never finished.
    pub include_incomplete: bool,
}

impl RetentionPolicy {
    /// Check if policy can evict anything at all.
    pub fn is_active(&self) -> bool {
        self.max_builds > 0 || self.max_age_days > 0 || self.include_incomplete
    }

    /// Select builds to evict.
    ///
    /// Builds are considered newest first by modification time regardless of
    /// input order. The output keeps that order.
    pub fn select(&self, builds: &[StoredBuild], now: SystemTime) -> Vec<StoredBuild> {
        let mut builds = builds.to_vec();
        builds.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.name().cmp(b.name())));

        let max_age = Duration::from_secs(self.max_age_days.saturating_mul(SECS_PER_DAY));
        builds
            .into_iter()
            .enumerate()
            .filter(|(index, build)| {
                let over_count = self.max_builds > 0 && *index >= self.max_builds;
                let over_age = self.max_age_days > 0
                    && now.duration_since(build.modified).unwrap_or_default() > max_age;
                let incomplete = self.include_incomplete && !build.artifact.is_complete();
                over_count || over_age || incomplete
            })
            .map(|(_, build)| build)
            .collect()
    }
}

/// Builds of one target selected for eviction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPlan {
    pub target: String,
    pub evict: Vec<StoredBuild>,

    /// Approximate disk space held by the evicted builds.
    pub bytes: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.evict.is_empty()
    }
}

/// Outcome of a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Builds selected for eviction.
    pub planned: usize,

    /// Builds actually deleted.
    pub removed: usize,

    /// Builds that could not be deleted.
    pub failed: usize,

    /// Approximate disk space of selected builds.
    pub bytes: u64,

    /// User declined the confirmation prompt.
    pub declined: bool,
}

/// Disk usage of one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUsage {
    pub target: String,
    pub builds: usize,
    pub bytes: u64,
}

/// Plan and carry out evictions against an artifact store.
#[derive(Debug, Clone, Copy)]
pub struct RetentionManager<'a> {
    store: &'a ArtifactStore,
}

impl<'a> RetentionManager<'a> {
    pub fn new(store: &'a ArtifactStore) -> Self {
        Self { store }
    }

    /// Plan evictions for one target.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Store`] if the target was never built or
    ///   cannot be read.
    pub fn plan(&self, target: &str, policy: &RetentionPolicy, now: SystemTime) -> Result<EvictionPlan> {
        let builds = self.store.target(target)?.list_builds()?;
        let evict = policy.select(&builds, now);
        let bytes = evict.iter().map(|build| build.artifact.size()).sum();

        Ok(EvictionPlan {
            target: target.into(),
            evict,
            bytes,
        })
    }

    /// Plan evictions for every target in the store.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Store`] if the store cannot be read.
    pub fn plan_all(&self, policy: &RetentionPolicy, now: SystemTime) -> Result<Vec<EvictionPlan>> {
        self.store
            .list_targets()?
            .iter()
            .map(|target| self.plan(target, policy, now))
            .collect()
    }

    /// Delete every planned build.
    ///
    /// Nothing is deleted on a dry run, or if there is nothing to delete, or
    /// if `confirm` declines. The confirmation is asked at most once for all
    /// plans together, with the total build count and size.
    #[instrument(skip(self, plans, confirm), level = "debug")]
    pub fn sweep(
        &self,
        plans: &[EvictionPlan],
        dry_run: bool,
        confirm: impl FnOnce(usize, u64) -> bool,
    ) -> SweepReport {
        let mut report = SweepReport {
            planned: plans.iter().map(|plan| plan.evict.len()).sum(),
            bytes: plans.iter().map(|plan| plan.bytes).sum(),
            ..Default::default()
        };

        if report.planned == 0 {
            info!("nothing to remove");
            return report;
        }

        for plan in plans.iter().filter(|plan| !plan.is_empty()) {
            info!(
                "{}: {} build(s) to remove, about {}",
                plan.target,
                plan.evict.len(),
                human_size(plan.bytes)
            );
        }

        if dry_run {
            info!(
                "dry run: would remove {} build(s), freeing about {}",
                report.planned,
                human_size(report.bytes)
            );
            return report;
        }

        if !confirm(report.planned, report.bytes) {
            info!("cleanup cancelled");
            report.declined = true;
            return report;
        }

        for plan in plans {
            for build in &plan.evict {
                match remove_dir_all(build.artifact.path()) {
                    Ok(()) => {
                        info!("removed {} at {}", plan.target, build.name());
                        report.removed += 1;
                    }
                    Err(err) => {
                        warn!("failed to remove {} at {}: {err}", plan.target, build.name());
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }

    /// Disk usage of every target in the store.
    ///
    /// # Errors
    ///
    /// - Return [`RetentionError::Store`] if the store cannot be read.
    pub fn usage(&self) -> Result<Vec<TargetUsage>> {
        let mut usage = Vec::new();
        for target in self.store.list_targets()? {
            let root = self.store.target(&target)?;
            let builds = root.list_builds()?;
            usage.push(TargetUsage {
                builds: builds.len(),
                bytes: builds.iter().map(|build| build.artifact.size()).sum(),
                target,
            });
        }

        Ok(usage)
    }
}

/// Render byte count with a binary unit suffix.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

/// Retention error types.
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Friendly result alias :3
pub type Result<T, E = RetentionError> = std::result::Result<T, E>;
