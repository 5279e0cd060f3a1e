// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use nigiri::{
    build::{BuildOutcome, BuildPipeline, BuildRequest},
    commit::Commit,
    config::{ConfigFile, NigiriConfig, TargetRegistry},
    exec::ShellRunner,
    metadata::BuildRecord,
    path::{default_config_path, default_store_dir},
    retention::{human_size, RetentionManager, RetentionPolicy},
    run::{split_run_args, RunArgs, RunResolver},
    store::ArtifactStore,
    vcs::{Credentials, Git2Vcs},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use inquire::Confirm;
use std::{
    collections::BTreeSet,
    path::PathBuf,
    process::exit,
    time::SystemTime,
};
use time::{macros::format_description, OffsetDateTime};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "nigiri [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(flatten)]
    pub globals: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<i32> {
        let ctx = Session::new(&self.globals)?;
        match self.command {
            Command::Init(opts) => run_init(&ctx, opts),
            Command::Build(opts) => run_build(&ctx, opts),
            Command::Run(opts) => return run_run(&ctx, opts),
            Command::Remove(opts) => run_remove(&ctx, opts),
            Command::Cleanup(opts) => run_cleanup(&ctx, opts),
            Command::List(opts) => run_list(&ctx, opts),
        }?;

        Ok(0)
    }
}

#[derive(Args, Clone, Debug)]
struct GlobalOptions {
    /// Path to artifact store root.
    #[arg(long, global = true, env = "NIGIRI_ROOT", value_name = "path")]
    pub root: Option<PathBuf>,

    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Write sample configuration file.
    #[command(override_usage = "nigiri init [options]")]
    Init(InitOptions),

    /// Build target at a commit.
    #[command(override_usage = "nigiri build [options] <target> [<commit>]")]
    Build(BuildOptions),

    /// Run built binary of target.
    #[command(override_usage = "nigiri run <target> [<commit>|HEAD] [--] [<args>]...")]
    Run(RunOptions),

    /// Remove builds or whole targets.
    #[command(override_usage = "nigiri remove [options] <target> [<commit>]\n       nigiri remove --all")]
    Remove(RemoveOptions),

    /// Evict old builds by count and age.
    #[command(override_usage = "nigiri cleanup [options] [<target>]")]
    Cleanup(CleanupOptions),

    /// List targets and their builds.
    #[command(override_usage = "nigiri list [<target>]")]
    List(ListOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitOptions {
    /// Overwrite existing configuration without asking.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BuildOptions {
    /// Name of target to build.
    #[arg(value_name = "target")]
    pub target: String,

    /// Commit to build, defaults to the tip of the default branch.
    #[arg(value_name = "commit")]
    pub commit: Option<String>,

    /// Rebuild even if the commit was already built.
    #[arg(short, long)]
    pub force: bool,

    /// Clone depth, use 0 for full history.
    #[arg(short, long, default_value_t = 1, value_name = "depth")]
    pub depth: u32,

    /// Show clone progress and build output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Authenticate with a GitHub token from GITHUB_TOKEN or gh.
    #[arg(short = 't', long)]
    pub use_token: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Name of target, then commit selector and arguments for the binary.
    // INVARIANT: Target must share the trailing argument so a `--` right after
    //   it reaches the selector split untouched.
    #[arg(
        value_name = "target",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl RunOptions {
    fn split(&self) -> Result<(&str, RunArgs)> {
        let Some((target, rest)) = self.command.split_first() else {
            bail!("no target given to run");
        };

        Ok((target.as_str(), split_run_args(rest)))
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RemoveOptions {
    /// Name of target to remove from.
    #[arg(value_name = "target", required_unless_present = "all")]
    pub target: Option<String>,

    /// Commit prefix of build to remove, whole target if absent.
    #[arg(value_name = "commit")]
    pub commit: Option<String>,

    /// Remove every target.
    #[arg(long, conflicts_with_all = ["target", "commit"])]
    pub all: bool,

    /// Skip confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CleanupOptions {
    /// Name of target to clean up.
    #[arg(value_name = "target")]
    pub target: Option<String>,

    /// Maximum age of builds to keep in days, 0 to disable.
    #[arg(short = 'a', long, default_value_t = 30, value_name = "days")]
    pub max_age: u64,

    /// Maximum number of builds to keep per target, 0 to disable.
    #[arg(short = 'b', long, default_value_t = 5, value_name = "count")]
    pub max_builds: usize,

    /// Also remove builds that never finished.
    #[arg(short, long)]
    pub incomplete: bool,

    /// Show what would be removed without removing anything.
    #[arg(short, long)]
    pub dry_run: bool,

    /// Clean up every target.
    #[arg(short = 'A', long, conflicts_with = "target")]
    pub all: bool,

    /// Skip confirmation prompt.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    /// Show builds of this target only.
    #[arg(value_name = "target")]
    pub target: Option<String>,
}

struct Session {
    store: ArtifactStore,
    config: ConfigFile,
}

impl Session {
    fn new(globals: &GlobalOptions) -> Result<Self> {
        let root = match &globals.root {
            Some(root) => root.clone(),
            None => default_store_dir()?,
        };
        let config = match &globals.config {
            Some(path) => path.clone(),
            None => default_config_path(&root),
        };

        Ok(Self {
            store: ArtifactStore::new(root),
            config: ConfigFile::new(config),
        })
    }

    fn load_config(&self) -> Result<NigiriConfig> {
        if !self.config.exists() {
            bail!(
                "no configuration at {:?}, create one with 'nigiri init'",
                self.config.path().display()
            );
        }

        self.config
            .load_targets()
            .with_context(|| format!("failed to load {:?}", self.config.path().display()))
    }
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    match run() {
        Ok(code) => exit(code),
        Err(error) => {
            error!("{error:?}");
            exit(1);
        }
    }
}

fn run() -> Result<i32> {
    Cli::parse().run()
}

fn confirm(message: &str, skip: bool) -> Result<bool> {
    if skip {
        return Ok(true);
    }

    Confirm::new(message)
        .with_default(false)
        .prompt()
        .context("failed to read confirmation")
}

fn run_init(ctx: &Session, opts: InitOptions) -> Result<()> {
    if ctx.config.exists() {
        let message = format!(
            "Configuration {:?} already exists, overwrite it?",
            ctx.config.path().display()
        );
        if !confirm(&message, opts.force)? {
            info!("init cancelled");
            return Ok(());
        }
    }

    ctx.config.write_sample()?;
    info!("wrote sample configuration to {:?}", ctx.config.path().display());

    Ok(())
}

fn run_build(ctx: &Session, opts: BuildOptions) -> Result<()> {
    let config = ctx.load_config()?;
    let credentials = if opts.use_token {
        Credentials::from_token_sources()?
    } else {
        Credentials::Default
    };

    let request = BuildRequest {
        target: opts.target.clone(),
        commit: opts.commit,
        force: opts.force,
        depth: opts.depth,
        verbose: opts.verbose,
        credentials,
    };
    let pipeline = BuildPipeline::new(&ctx.store, &config, Git2Vcs::new(), ShellRunner::new());
    let outcome = pipeline.build(&request)?;

    let short_hash = outcome.commit().short_hash().to_owned();
    match outcome {
        BuildOutcome::AlreadyBuilt { .. } => {
            info!("nothing to do, use --force to rebuild");
        }
        BuildOutcome::Built(report) => {
            if !report.warnings.is_empty() {
                warn!("build finished with {} warning(s)", report.warnings.len());
            }
            info!("built {} at {short_hash}", opts.target);
        }
    }
    info!("run it with: nigiri run {} {short_hash}", opts.target);

    Ok(())
}

fn run_run(ctx: &Session, opts: RunOptions) -> Result<i32> {
    let (target, run_args) = opts.split()?;
    if !run_args.ignored.is_empty() {
        warn!(
            "ignoring {:?} before '--', only one commit selector is accepted",
            run_args.ignored
        );
    }

    // INVARIANT: Builds stay runnable after their target leaves the configuration.
    let config = if ctx.config.exists() {
        ctx.load_config()?
    } else {
        NigiriConfig::default()
    };

    let launch = RunResolver::new(&ctx.store).prepare(
        target,
        config.target(target),
        run_args.selector.as_deref(),
    )?;
    info!("running {target} at {}", launch.short_hash);
    let status = launch.run(&run_args.args)?;

    Ok(status.code().unwrap_or(1))
}

fn run_remove(ctx: &Session, opts: RemoveOptions) -> Result<()> {
    if opts.all {
        if !confirm("Remove every target and all of their builds?", opts.yes)? {
            info!("remove cancelled");
            return Ok(());
        }

        let summary = ctx.store.remove_all()?;
        info!("removed {} target(s)", summary.removed);
        if summary.failed > 0 {
            bail!("failed to remove {} target(s)", summary.failed);
        }
        return Ok(());
    }

    let Some(target) = opts.target else {
        bail!("specify a target or --all");
    };
    let target_root = ctx.store.target(&target)?;

    match opts.commit {
        Some(prefix) => {
            let build = target_root.resolve_prefix(&prefix)?;
            let message = format!("Remove build {} of {target}?", build.name());
            if !confirm(&message, opts.yes)? {
                info!("remove cancelled");
                return Ok(());
            }

            let commit = Commit::new(build.name())?;
            target_root.remove(&commit)?;
            info!("removed {target} at {}", build.name());
        }
        None => {
            let message = format!("Remove target {target} and all of its builds?");
            if !confirm(&message, opts.yes)? {
                info!("remove cancelled");
                return Ok(());
            }

            target_root.remove_all()?;
            info!("removed target {target}");
        }
    }

    Ok(())
}

fn run_cleanup(ctx: &Session, opts: CleanupOptions) -> Result<()> {
    let manager = RetentionManager::new(&ctx.store);

    if opts.target.is_none() && !opts.all {
        let usage = manager.usage()?;
        if usage.is_empty() {
            println!("No builds in {}", ctx.store.root().display());
            return Ok(());
        }

        println!("{:<24} {:>8} {:>12}", "TARGET", "BUILDS", "SIZE");
        for entry in &usage {
            println!(
                "{:<24} {:>8} {:>12}",
                entry.target,
                entry.builds,
                human_size(entry.bytes)
            );
        }
        let total = usage.iter().map(|entry| entry.bytes).sum();
        println!("{:<24} {:>8} {:>12}", "TOTAL", "", human_size(total));
        println!("\nUse 'nigiri cleanup <target>' or 'nigiri cleanup --all' to free space.");
        return Ok(());
    }

    let policy = RetentionPolicy {
        max_builds: opts.max_builds,
        max_age_days: opts.max_age,
        include_incomplete: opts.incomplete,
    };
    if !policy.is_active() {
        bail!("every retention bound is disabled, nothing could be removed");
    }

    let now = SystemTime::now();
    let plans = match &opts.target {
        Some(target) => vec![manager.plan(target, &policy, now)?],
        None => manager.plan_all(&policy, now)?,
    };

    let report = manager.sweep(&plans, opts.dry_run, |count, bytes| {
        let message = format!("Remove {count} build(s), about {}?", human_size(bytes));
        confirm(&message, opts.yes).unwrap_or_else(|err| {
            warn!("{err:?}");
            false
        })
    });

    if report.removed > 0 {
        info!(
            "removed {} build(s), freed about {}",
            report.removed,
            human_size(report.bytes)
        );
    }
    if report.failed > 0 {
        warn!("failed to remove {} build(s)", report.failed);
    }

    Ok(())
}

fn run_list(ctx: &Session, opts: ListOptions) -> Result<()> {
    let config = if ctx.config.exists() {
        ctx.load_config()?
    } else {
        NigiriConfig::default()
    };

    match opts.target {
        Some(target) => list_builds(ctx, &config, &target),
        None => list_targets(ctx, &config),
    }
}

fn list_targets(ctx: &Session, config: &NigiriConfig) -> Result<()> {
    let built = ctx.store.list_targets()?;
    let names = config
        .targets
        .keys()
        .cloned()
        .chain(built.iter().cloned())
        .collect::<BTreeSet<_>>();

    if names.is_empty() {
        println!("No targets configured or built");
        return Ok(());
    }

    println!("{:<24} {:>8}  {}", "TARGET", "BUILDS", "SOURCE");
    for name in names {
        let builds = match ctx.store.target(&name) {
            Ok(root) => root.list_builds()?.len(),
            Err(_) => 0,
        };
        let source = config
            .target(&name)
            .map(|target| target.source.as_str())
            .unwrap_or("(not configured)");
        println!("{name:<24} {builds:>8}  {source}");
    }

    Ok(())
}

fn list_builds(ctx: &Session, config: &NigiriConfig, target: &str) -> Result<()> {
    if let Some(definition) = config.target(target) {
        println!("Target: {target}");
        println!("Source: {}", definition.source);
        if let Some(branch) = &definition.default_branch {
            println!("Branch: {branch}");
        }
        println!();
    }

    let builds = ctx.store.target(target)?.list_builds()?;
    if builds.is_empty() {
        println!("No builds of {target}");
        return Ok(());
    }

    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    println!("{:<9} {:<21} {:<11} {:>10}", "COMMIT", "BUILT (UTC)", "STATUS", "SIZE");
    for build in builds {
        let built_at = BuildRecord::read_from(build.artifact.info_path())
            .ok()
            .and_then(|record| record.build_date())
            .unwrap_or_else(|| OffsetDateTime::from(build.modified));
        let status = if build.artifact.is_complete() {
            "complete"
        } else {
            "incomplete"
        };
        println!(
            "{:<9} {:<21} {:<11} {:>10}",
            build.name(),
            built_at.format(&format)?,
            status,
            human_size(build.artifact.size())
        );
    }

    Ok(())
}
