mod cli;
mod dns;
mod error;
mod ini;
mod interrupt;
mod layers;
mod log_pipe;
mod logging;
mod preprocess;
mod probe;
mod registry;
mod report;
mod settings;
mod ssh;
mod supervisor;
mod systemd;
mod tunnel;
mod validate;

use std::collections::BTreeSet;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::{error, info, warn};

use cli::{Cli, Command};
use dns::SystemResolver;
use error::Error;
use interrupt::StopSignal;
use logging::LogSink;
use probe::{ProbeCache, SystemCommands};
use registry::TunnelRegistry;
use settings::{ConfigLocation, Settings};
use ssh::CheckOutcome;
use supervisor::{HelperCommand, Supervisor};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let (settings, settings_error) = match Settings::load() {
        Ok(settings) => (settings, None),
        Err(e) => (Settings::default(), Some(e)),
    };

    let sink = cli.log.clone().unwrap_or(LogSink::Stderr);
    let color = !cli.no_color && !sink.is_file();
    if !color {
        colored::control::set_override(false);
    }
    if let Err(e) = logging::init(&sink, &settings.log_filter, color) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        return ExitCode::FAILURE;
    }
    if let Some(e) = settings_error {
        warn!("Ignoring settings: {:#}", e);
    }

    let result = interrupt::install()
        .context("failed to install signal handlers")
        .and_then(|stop| dispatch(cli, &settings, &stop));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_abort(&e) => {
            warn!("Aborted.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// An operator interrupt, which ends the tool cleanly.
fn is_abort(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<Error>(), Some(Error::Interrupted))
}

fn dispatch(cli: Cli, settings: &Settings, stop: &StopSignal) -> Result<()> {
    let location = settings.locate_tunnels_config(cli.config.as_deref());
    let command = cli.command.unwrap_or(Command::Status { tunnels: Vec::new() });

    match command {
        Command::Status { tunnels } => cmd_status(&location, &tunnels, stop),
        Command::Config { tunnels } => cmd_config(&location, &tunnels, stop),
        Command::Check { tunnels } => cmd_check(&location, &tunnels, stop),
        Command::Run { all, tunnels } => cmd_run(&location, all, &tunnels, settings, stop),
    }
}

fn load_registry(path: &Path) -> Result<TunnelRegistry> {
    if !path.is_file() {
        anyhow::bail!("Unable to locate config file {}", path.display());
    }
    let shown = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    TunnelRegistry::load(path, &SystemResolver)
        .with_context(|| format!("Configuration file {} is invalid", shown.display()))
}

fn cmd_status(location: &ConfigLocation, ids: &[String], stop: &StopSignal) -> Result<()> {
    let probe = SystemCommands;
    let cache = ProbeCache::new(&probe);

    // Without any config there may still be reverse tunnels worth listing.
    let registry = if location.explicit || location.path.is_file() || !ids.is_empty() {
        load_registry(&location.path)?
    } else {
        warn!("No tunnel config found at {}", location.path.display());
        TunnelRegistry::default()
    };
    stop.check()?;

    let selected = registry.select_or_all(ids)?;
    if !selected.is_empty() {
        let status = report::render_status(&selected, &cache);
        stop.check()?;
        println!("{}", status);
    }
    if ids.is_empty()
        && let Some(remote) = report::render_detected_remote(registry.all(), &cache)
    {
        stop.check()?;
        if !selected.is_empty() {
            println!();
        }
        println!("{}", remote);
    }
    Ok(())
}

fn cmd_config(location: &ConfigLocation, ids: &[String], stop: &StopSignal) -> Result<()> {
    let registry = load_registry(&location.path)?;
    stop.check()?;
    let selected = registry.select_or_all(ids)?;
    if selected.is_empty() {
        println!("{}", "No tunnel configured".yellow());
    } else {
        println!("{}", report::render_config(&selected));
    }
    Ok(())
}

fn cmd_check(location: &ConfigLocation, ids: &[String], stop: &StopSignal) -> Result<()> {
    let registry = load_registry(&location.path)?;
    stop.check()?;
    let selected = registry.select_or_all(ids)?;
    let probe = SystemCommands;
    let cache = ProbeCache::new(&probe);

    let mut failures = 0;
    for tunnel in selected {
        stop.check()?;
        let title = format!("{}/{}", tunnel.remote_server(), tunnel.name());
        let as_service_user = systemd::is_installed(tunnel, &cache);
        match ssh::check_connection(tunnel, as_service_user) {
            CheckOutcome::Ok => println!("{}: {}", title, "Ok".green()),
            CheckOutcome::Failed(reason) => {
                failures += 1;
                println!("{}: {}: Unable to connect:", title, "Error".red());
                println!("{}", indent(&reason));
            }
        }
    }
    stop.check()?;
    if failures > 0 {
        anyhow::bail!("{} tunnel(s) failed the connection check", failures);
    }
    Ok(())
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("  {}", line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn cmd_run(
    location: &ConfigLocation,
    all: bool,
    ids: &[String],
    settings: &Settings,
    stop: &StopSignal,
) -> Result<()> {
    let registry = load_registry(&location.path)?;
    stop.check()?;
    if registry.is_empty() {
        anyhow::bail!("No tunnel configured");
    }
    let selected: Vec<_> = if all {
        registry.all().iter().collect()
    } else {
        registry.select(ids)?
    };

    if settings.scan_known_hosts {
        let servers: BTreeSet<&str> = selected.iter().map(|t| t.remote_server()).collect();
        for server in servers {
            stop.check()?;
            ssh::ensure_known_host(server);
        }
    }

    let program = ssh::which(&settings.helper)?;
    let helpers: Vec<HelperCommand> = selected
        .iter()
        .map(|tunnel| {
            info!("Starting {}: {}", tunnel.label(), tunnel);
            HelperCommand::for_tunnel(&program, tunnel)
        })
        .collect();

    Supervisor::new(settings.supervisor_options()).run(&helpers, stop)?;
    Ok(())
}
