//! # rootsnap command line
//!
//! Command line tool to manage atomic, image based deployments of the
//! operating system.

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;
use owo_colors::OwoColorize;

use crate::bootloader::SystemdBoot;
use crate::config::Config;
use crate::deploy::{Deployed, Deployer, Update};
use crate::error::Error;
use crate::initramfs::Dracut;
use crate::ledger::Ledger;
use crate::repo::Repository;
use crate::snapshot::Btrfs;
use crate::store::{Storage, BOOT_DIR, STATE_ROOT};
use crate::teardown;

/// External tools every mutating command shells out to.
const REQUIRED_TOOLS: &[&str] = &["btrfs", "bootctl", "dracut"];

/// Create the state root with a default configuration.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct InitOpts {
    /// Base URL of the image repository.
    #[clap(long)]
    pub(crate) repo_url: Option<String>,

    /// Target deployed when none is given.
    #[clap(long)]
    pub(crate) default_image: Option<String>,
}

/// Deploy a version of a target.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct DeployOpts {
    /// The target to deploy; defaults to the configured image.
    pub(crate) target: Option<String>,

    /// The version to deploy; defaults to the newest one.
    pub(crate) version: Option<String>,
}

/// Deploy the newest version of a target, unless it is current.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct UpdateOpts {
    /// The target to update; defaults to the configured image.
    pub(crate) target: Option<String>,
}

/// Manage atomic deployments of whole root filesystem images.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    /// Create the state root, its default configuration and boot-entry
    /// template.
    Init(InitOpts),
    /// Download, verify and install a version, then select it for the
    /// next boot.
    Deploy(DeployOpts),
    /// Deploy the newest version if it is not the current deployment.
    Update(UpdateOpts),
    /// Show installed deployments, most recent first.
    List,
    /// Show the targets offered by the repository.
    GetAvailable,
    /// Remove every deployment and all managed state.
    Teardown,
}

/// Deploy and manage whole root filesystem images.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "rootsnap")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) struct Opt {
    /// The state root.
    #[clap(long, global = true, default_value = STATE_ROOT)]
    pub(crate) root: Utf8PathBuf,

    /// Where kernels and boot entries are installed.
    #[clap(long, global = true, default_value = BOOT_DIR)]
    pub(crate) boot_dir: Utf8PathBuf,

    #[clap(subcommand)]
    pub(crate) cmd: Command,
}

/// Checked before any mutation.
fn require_root() -> Result<(), Error> {
    if !rustix::process::getuid().is_root() {
        return Err(Error::Precondition(
            "This command requires root privileges".into(),
        ));
    }
    Ok(())
}

fn require_tools(tools: &[&str]) -> Result<(), Error> {
    for tool in tools {
        if let Err(e) = which::which(tool) {
            return Err(Error::Precondition(format!(
                "Required tool {tool} not found: {e}"
            )));
        }
    }
    Ok(())
}

/// Open the state root and its configuration.
fn open(opts: &Opt) -> Result<(Storage, Config), Error> {
    let storage = Storage::open(&opts.root, &opts.boot_dir)?;
    let config = Config::load(&storage.root_dir)?;
    Ok((storage, config))
}

fn print_deployed(d: &Deployed) {
    let id = &d.entry.id;
    anstream::println!(
        "{} {id} ({} {}); it boots next",
        "Deployed".green().bold(),
        d.target,
        d.entry.version
    );
    for id in d.collected.removed.iter().chain(d.collected.orphans.iter()) {
        anstream::println!("Removed {id}");
    }
}

fn init(opts: &Opt, init: &InitOpts) -> Result<(), Error> {
    require_root()?;
    let mut config = Config::default();
    if let Some(url) = init.repo_url.as_deref() {
        config.repo_url = url.to_owned();
    }
    if let Some(image) = init.default_image.as_deref() {
        config.repo_default_image = image.to_owned();
    }
    let storage = Storage::init(&opts.root, &opts.boot_dir, &config)?;
    println!("Initialized {}", storage.root());
    Ok(())
}

fn run_deployer<T>(
    opts: &Opt,
    f: impl FnOnce(&Deployer) -> Result<T, Error>,
) -> Result<T, Error> {
    require_root()?;
    require_tools(REQUIRED_TOOLS)?;
    let (storage, config) = open(opts)?;
    let _lock = storage.lock()?;
    let repo = Repository::new(&config.repo_url);
    let registry = SystemdBoot::new(storage.loader_entries());
    let deployer = Deployer {
        config: &config,
        storage: &storage,
        repo: &repo,
        fs: &Btrfs,
        registry: &registry,
        initramfs: &Dracut,
    };
    f(&deployer)
}

fn list(opts: &Opt) -> Result<()> {
    let (storage, _) = open(opts)?;
    let ledger = Ledger::load(&storage.root_dir)?;
    let out = std::io::stdout();
    crate::status::human_readable_output(out.lock(), &ledger, &storage)
}

fn get_available(opts: &Opt) -> Result<(), Error> {
    let (_, config) = open(opts)?;
    let repo = Repository::new(&config.repo_url);
    for target in repo.list_targets()? {
        println!("{target}");
    }
    Ok(())
}

fn teardown(opts: &Opt) -> Result<()> {
    require_root()?;
    require_tools(&["btrfs"])?;
    let (storage, _) = open(opts)?;
    let _lock = storage.lock()?;
    if !teardown::confirmed(&teardown::Terminal, storage.root())? {
        println!("Aborted; nothing was changed.");
        return Ok(());
    }
    let registry = SystemdBoot::new(storage.loader_entries());
    let removed = teardown::teardown(&Btrfs, &registry, &storage)?;
    for id in removed {
        println!("Removed {id}");
    }
    anstream::println!("{} {}", "Removed".red().bold(), storage.root());
    Ok(())
}

/// Report benign outcomes and let everything else through.
fn benign_ok(r: Result<(), Error>) -> Result<()> {
    match r {
        Err(e) if e.is_benign() => {
            anstream::println!("{} {e}", "Note:".yellow().bold());
            Ok(())
        }
        r => Ok(r?),
    }
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
fn run_from_opt(opt: Opt) -> Result<()> {
    match &opt.cmd {
        Command::Init(init_opts) => Ok(init(&opt, init_opts)?),
        Command::Deploy(d) => benign_ok(run_deployer(&opt, |deployer| {
            let deployed = deployer.deploy(d.target.as_deref(), d.version.as_deref())?;
            print_deployed(&deployed);
            Ok(())
        })),
        Command::Update(u) => benign_ok(run_deployer(&opt, |deployer| {
            match deployer.update(u.target.as_deref())? {
                Update::UpToDate { id } => println!("{id} is up to date"),
                Update::Deployed(d) => print_deployed(&d),
            }
            Ok(())
        })),
        Command::List => list(&opt),
        Command::GetAvailable => Ok(get_available(&opt)?),
        Command::Teardown => teardown(&opt),
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<T>(args: T) -> Result<()>
where
    T: IntoIterator,
    T::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}
