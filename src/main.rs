use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use grip::branch::{BranchRequest, BranchResolver};
use grip::cache::StatusCache;
use grip::config::Config;
use grip::griptree::{GriptreeListing, GriptreeManager};
use grip::{glog, glog_error, ExecutionReport, ManifestProvider, RepoFilter, RepoSetExecutor, Result, TomlManifest, Workspace};

/// grip - run git across many repositories as one workspace
#[derive(Parser, Debug)]
#[command(name = "grip")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    GRIP_DEBUG=1    Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.grip/grip.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Print machine-readable JSON instead of the per-repo table
    #[arg(long, global = true)]
    pub json: bool,

    /// Workspace root (defaults to the nearest parent with .gitgrip/workspace.toml)
    #[arg(short = 'w', long, global = true)]
    pub workspace: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct RepoArgs {
    /// Only these repositories (repeatable)
    #[arg(short = 'r', long = "repo")]
    pub repos: Vec<String>,

    /// Only repositories in these groups (repeatable)
    #[arg(short = 'g', long = "group")]
    pub groups: Vec<String>,
}

impl RepoArgs {
    fn filter(&self) -> RepoFilter {
        RepoFilter::all()
            .with_names(self.repos.iter().cloned())
            .with_groups(self.groups.iter().cloned())
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create (or switch to) a branch in every selected repository
    Branch {
        name: String,

        #[command(flatten)]
        repos: RepoArgs,

        /// Also branch the workspace configuration repository
        #[arg(long)]
        include_manifest: bool,
    },

    /// Switch every selected repository to an existing branch
    Checkout {
        name: String,

        #[command(flatten)]
        repos: RepoArgs,

        /// Also switch the workspace configuration repository
        #[arg(long)]
        include_manifest: bool,
    },

    /// Manage griptrees (parallel workspaces on another branch)
    #[command(subcommand)]
    Tree(TreeCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum TreeCommand {
    /// Create a griptree for a branch
    Add {
        branch: String,

        /// Target directory (defaults to a sibling of the workspace)
        #[arg(long)]
        path: Option<PathBuf>,

        #[command(flatten)]
        repos: RepoArgs,
    },

    /// List griptrees and their health
    List,

    /// Remove a griptree. Uncommitted changes inside it are discarded.
    Remove {
        branch: String,

        /// Remove even if locked or if some worktrees fail to be removed
        #[arg(long)]
        force: bool,
    },

    /// Protect a griptree from removal
    Lock { branch: String },

    /// Allow a griptree to be removed again
    Unlock { branch: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    grip::log::init(cli.debug);
    glog!("grip {:?}", cli.command);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            glog_error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every repository succeeded or was skipped.
fn run(cli: &Cli) -> Result<bool> {
    let config = Config::load()?;
    let workspace = load_workspace(cli)?;
    let executor = RepoSetExecutor::parallel(config.max_concurrency);
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Command::Branch {
            name,
            repos,
            include_manifest,
        } => {
            let request = BranchRequest::create(name).with_manifest(*include_manifest);
            rt.block_on(run_branch(cli, &config, &workspace, executor, repos, request))
        }
        Command::Checkout {
            name,
            repos,
            include_manifest,
        } => {
            let request = BranchRequest::checkout(name).with_manifest(*include_manifest);
            rt.block_on(run_branch(cli, &config, &workspace, executor, repos, request))
        }
        Command::Tree(tree) => {
            let manager = GriptreeManager::new(workspace.clone(), executor, config.git_timeout());
            rt.block_on(run_tree(cli, &workspace, &manager, tree))
        }
    }
}

fn load_workspace(cli: &Cli) -> Result<Workspace> {
    let start = match &cli.workspace {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    TomlManifest::discover(&start)?.load()
}

async fn run_branch(
    cli: &Cli,
    config: &Config,
    workspace: &Workspace,
    executor: RepoSetExecutor,
    repos: &RepoArgs,
    request: BranchRequest,
) -> Result<bool> {
    let cache = StatusCache::new(config.status_cache_ttl(), config.git_timeout());
    let selection = repos.filter().select(workspace, &cache).await?;
    let resolver = BranchResolver::new(executor, cache, config.git_timeout());
    let resolution = resolver.resolve(workspace, &selection, &request).await?;
    glog!("branch {} resolved with plan {}", request.branch, resolution.plan);
    print_report(cli, &resolution.report)?;
    Ok(resolution.report.is_success())
}

async fn run_tree(cli: &Cli, workspace: &Workspace, manager: &GriptreeManager, command: &TreeCommand) -> Result<bool> {
    match command {
        TreeCommand::Add { branch, path, repos } => {
            let selection = repos.filter().apply(workspace)?;
            let added = manager.add(branch, path.as_deref(), &selection).await?;
            print_report(cli, &added.report)?;
            match &added.griptree {
                Some(griptree) if !cli.json => {
                    println!("griptree {} at {}", griptree.branch, griptree.path.display());
                    if added.is_partial() {
                        println!("some repositories have no worktree; see the failures above");
                    }
                }
                Some(_) => {}
                None => eprintln!("no worktree could be created; nothing was registered"),
            }
            Ok(added.griptree.is_some() && added.report.is_success())
        }
        TreeCommand::List => {
            let listings = manager.list()?;
            print_listings(cli, &listings)?;
            Ok(true)
        }
        TreeCommand::Remove { branch, force } => {
            let removed = manager.remove(branch, *force).await?;
            print_report(cli, &removed.report)?;
            if !removed.removed {
                eprintln!("griptree {} kept; rerun with --force to remove it anyway", branch);
            }
            Ok(removed.removed && removed.report.is_success())
        }
        TreeCommand::Lock { branch } => {
            let changed = manager.lock(branch)?;
            print_toggle(cli, branch, "locked", changed)?;
            Ok(true)
        }
        TreeCommand::Unlock { branch } => {
            let changed = manager.unlock(branch)?;
            print_toggle(cli, branch, "unlocked", changed)?;
            Ok(true)
        }
    }
}

fn print_report(cli: &Cli, report: &ExecutionReport) -> Result<()> {
    if cli.json {
        println!("{}", report.to_json()?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn print_listings(cli: &Cli, listings: &[GriptreeListing]) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(listings)?);
        return Ok(());
    }
    if listings.is_empty() {
        println!("no griptrees");
        return Ok(());
    }
    for listing in listings {
        let gt = &listing.griptree;
        let mut flags = Vec::new();
        if gt.locked {
            flags.push("locked".to_string());
        }
        if listing.adopted {
            flags.push("adopted".to_string());
        }
        if !listing.health.is_valid() {
            flags.push(format!("{:?}", listing.health));
        }
        println!(
            "{:30} {}  {} repos  {}",
            gt.branch,
            gt.path.display(),
            gt.worktrees.len(),
            flags.join(" ")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct Toggle<'a> {
    branch: &'a str,
    state: &'a str,
    changed: bool,
}

fn print_toggle(cli: &Cli, branch: &str, state: &str, changed: bool) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&Toggle { branch, state, changed })?);
    } else if changed {
        println!("griptree {} {}", branch, state);
    } else {
        println!("griptree {} already {}", branch, state);
    }
    Ok(())
}
