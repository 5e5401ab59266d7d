mod cgroups;
mod config;
mod dns;
mod error;
mod hosts;
mod iptables;
mod lifecycle;
mod links;
mod net;
mod netfilter;
mod project;
mod rules;
mod runtime;
mod subnet;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use caps::{CapSet, Capability};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Project;
use error::Error;
use iptables::Iptables;
use lifecycle::{Host, Settings};
use net::IpCommand;
use project::{Command, Orchestrator, render_status};
use runtime::LxcRuntime;

/// Orchestrates groups of LXC containers declared in a YAML project file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Project file
    #[arg(short, long, global = true, default_value = "locker.yml")]
    file: PathBuf,

    /// Project name, defaults to the name of the current directory
    #[arg(short, long, global = true)]
    project: Option<String>,

    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Stop running containers before starting them again
    #[arg(short, long, global = true)]
    restart: bool,

    /// Do not touch port forwards
    #[arg(long, global = true)]
    no_ports: bool,

    /// Do not touch links
    #[arg(long, global = true)]
    no_links: bool,

    /// Seconds to wait for a clean shutdown before forcing it
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    /// Seconds to wait for a started container to get an address
    #[arg(long, global = true, default_value_t = 10)]
    address_timeout: u64,

    /// Remove containers even if they are running
    #[arg(short = 'x', long, global = true)]
    force: bool,

    /// LXC container directory
    #[arg(long, global = true, default_value = "/var/lib/lxc")]
    lxcpath: PathBuf,

    #[command(subcommand)]
    command: CommandArgs,
}

#[derive(clap::Args, Debug)]
struct Names {
    /// Containers to act on, all containers of the project if empty
    names: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum CommandArgs {
    /// Create containers from a template or by cloning
    Create(Names),
    /// Start containers and set up forwards, links and cgroups
    Start(Names),
    /// Remove forwards and links, then stop containers
    Stop(Names),
    /// Stop and start containers
    Reboot(Names),
    /// Destroy containers
    Rm(Names),
    /// Show the live state of containers
    Status(Names),
    /// Add port forwards
    Ports(Names),
    /// Remove port forwards
    Rmports(Names),
    /// Add links
    Links(Names),
    /// Remove links
    Rmlinks(Names),
    /// Apply cgroup settings
    Cgroup(Names),
    /// Remove the project's firewall rules and bridge
    Cleanup(Names),
    /// Freeze containers
    Freeze(Names),
    /// Unfreeze containers
    Unfreeze(Names),
}

impl CommandArgs {
    fn split(self) -> (Command, Vec<String>) {
        let (command, names) = match self {
            Self::Create(n) => (Command::Create, n),
            Self::Start(n) => (Command::Start, n),
            Self::Stop(n) => (Command::Stop, n),
            Self::Reboot(n) => (Command::Reboot, n),
            Self::Rm(n) => (Command::Remove, n),
            Self::Status(n) => (Command::Status, n),
            Self::Ports(n) => (Command::Ports, n),
            Self::Rmports(n) => (Command::RmPorts, n),
            Self::Links(n) => (Command::Links, n),
            Self::Rmlinks(n) => (Command::RmLinks, n),
            Self::Cgroup(n) => (Command::Cgroup, n),
            Self::Cleanup(n) => (Command::Cleanup, n),
            Self::Freeze(n) => (Command::Freeze, n),
            Self::Unfreeze(n) => (Command::Unfreeze, n),
        };
        (command, names.names)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "locker=debug" } else { "locker=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Returns whether every selected container succeeded.
fn run(args: Args) -> anyhow::Result<bool> {
    let project_name = match &args.project {
        Some(name) => name.clone(),
        None => project_from_cwd()?,
    };
    let project = Project::load(&args.file, &project_name)
        .with_context(|| format!("failed to load project {}", project_name))?;

    check_privileges()?;
    let runtime = LxcRuntime::new(&args.lxcpath);
    runtime.probe()?;
    let iptables = Iptables::default();
    let ip = IpCommand;

    let settings = Settings {
        restart: args.restart,
        no_ports: args.no_ports,
        no_links: args.no_links,
        force: args.force,
        stop_timeout: Duration::from_secs(args.timeout),
        address_timeout: Duration::from_secs(args.address_timeout),
        ..Settings::default()
    };
    let host = Host {
        runtime: &runtime,
        netfilter: &iptables,
        network: &ip,
    };

    let (command, names) = args.command.split();
    let report = Orchestrator::new(&project, &settings, host).run(command, &names)?;

    if command == Command::Status {
        print!("{}", render_status(&report.rows));
    }
    for (name, e) in &report.failed {
        tracing::error!("{}: {}", name, e);
    }
    if !report.is_success() {
        tracing::error!(
            "{} of {} containers failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        );
    }
    Ok(report.is_success())
}

fn project_from_cwd() -> anyhow::Result<String> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    cwd.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .context("cannot derive a project name from the current directory, use --project")
}

/// Firewall and bridge changes need root or CAP_NET_ADMIN.
fn check_privileges() -> Result<(), Error> {
    if nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    match caps::has_cap(None, CapSet::Effective, Capability::CAP_NET_ADMIN) {
        Ok(true) => Ok(()),
        _ => Err(Error::Privilege(
            "locker must run as root or with CAP_NET_ADMIN".into(),
        )),
    }
}
