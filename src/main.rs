mod cli;
mod display;
mod picker;
mod prompt;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use prompt::TerminalPrompter;
use warren::config::Config;
use warren::graph::TunnelProfile;
use warren::hosts::HostCatalog;
use warren::jump::JumpResolver;
use warren::registry::StopOutcome;
use warren::service::{ExecuteResult, TunnelService, host_key};
use warren::transport::libssh2::Libssh2Transport;
use warren::transport::{HostKeyVerifier, InteractiveAuth, KnownHostsOnly, NoInteraction};
use warren::validate::{ValidationReport, Validator};
use warren::{profiles, render, resolve, ssh_config};

/// SIGINT/SIGTERM count. The first stops the tunnels, the second abandons their teardown.
static SIGNALS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handle_signal(_: libc::c_int) {
    SIGNALS.fetch_add(1, Ordering::SeqCst);
}

fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_signal as *const () as usize;
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
    }
}

fn init_logging(verbose: bool, color: bool) {
    let debug = verbose || std::env::var_os("WARREN_DEBUG").is_some();
    let default = if debug { "warren=debug,warn" } else { "warren=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(color)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();

    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    init_logging(cli.verbose, !cli.no_color);
    let cfg = Config::load();

    match cli.command {
        Command::List => cmd_list(&cfg),
        Command::Check { name } => cmd_check(name, &cfg),
        Command::Route { name } => cmd_route(name, &cfg),
        Command::Command { name, host } => cmd_command(name, host, &cfg),
        Command::Up { names, all, host } => cmd_up(names, all, host, &cfg),
        Command::Config => cmd_config(&cfg),
        Command::Completions { shell } => cmd_completions(shell, &cfg),
        Command::ListNames => cmd_list_names(&cfg),
    }
}

fn profiles_dir(cfg: &Config) -> Result<PathBuf> {
    cfg.profiles_dir().context("cannot locate profile directory")
}

fn load_profiles(cfg: &Config) -> Result<Vec<TunnelProfile>> {
    let dir = profiles_dir(cfg)?;
    profiles::load_all(&dir).with_context(|| format!("failed to load profiles from {}", dir.display()))
}

/// The ssh_config host store. A missing file is an empty store.
fn load_hosts(cfg: &Config) -> Result<HostCatalog> {
    let path = cfg.ssh_config_path()?;
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no ssh config, host store is empty");
        return Ok(HostCatalog::default());
    }
    ssh_config::load_hosts(&path, &whoami::username())
}

fn find_profile(cfg: &Config, name: &str) -> Result<TunnelProfile> {
    let dir = profiles_dir(cfg)?;
    profiles::find(&dir, name)?
        .ok_or_else(|| anyhow::anyhow!("profile '{}' not found in {}", name, dir.display()))
}

/// Named profile, or a fuzzy pick among all of them.
fn select_profile(cfg: &Config, name: Option<String>, prompt: &str) -> Result<TunnelProfile> {
    if let Some(ref n) = name {
        return find_profile(cfg, n);
    }
    let mut all = load_profiles(cfg)?;
    let items: Vec<String> = all
        .iter()
        .map(|p| format!("{} ({})", p.id, p.name()))
        .collect();
    let idx = picker::pick(prompt, &items)?;
    Ok(all.swap_remove(idx))
}

fn select_host(hosts: &HostCatalog, name: Option<String>, prompt: &str) -> Result<String> {
    if let Some(n) = name {
        return Ok(n);
    }
    let items: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
    let idx = picker::pick(prompt, &items)?;
    Ok(items[idx].clone())
}

fn validator(cfg: &Config) -> Validator {
    Validator::new(cfg.max_graph_nodes)
}

fn cmd_list(cfg: &Config) -> Result<()> {
    let validator = validator(cfg);
    let rows: Vec<(TunnelProfile, ValidationReport)> = load_profiles(cfg)?
        .into_iter()
        .map(|p| {
            let report = validator.validate(&p);
            (p, report)
        })
        .collect();
    display::print_profile_list(&rows);

    match load_hosts(cfg) {
        Ok(hosts) => display::print_host_list(hosts.iter()),
        Err(e) => println!("{} {:#}", "⚠".yellow(), e),
    }
    Ok(())
}

fn cmd_check(name: Option<String>, cfg: &Config) -> Result<()> {
    let profiles = match name {
        Some(ref n) => vec![find_profile(cfg, n)?],
        None => load_profiles(cfg)?,
    };
    if profiles.is_empty() {
        println!("{}", "No profiles to check.".yellow());
        return Ok(());
    }

    let validator = validator(cfg);
    let mut invalid = 0;
    for profile in &profiles {
        let report = validator.validate(profile);
        if !report.is_valid() {
            invalid += 1;
        }
        display::print_report(profile, &report);
    }

    if invalid > 0 {
        anyhow::bail!("{}/{} profile(s) invalid", invalid, profiles.len());
    }
    Ok(())
}

fn cmd_route(name: Option<String>, cfg: &Config) -> Result<()> {
    let profile = select_profile(cfg, name, "Show route for")?;
    let report = validator(cfg).validate(&profile);
    if !report.is_valid() {
        display::print_report(&profile, &report);
        anyhow::bail!("'{}' is not a valid profile", profile.id);
    }
    let root = profile
        .root()
        .with_context(|| format!("'{}' has no local machine node", profile.id))?;
    let chain = resolve::resolve(&profile, &root.id);
    display::print_route(&profile, &chain);
    Ok(())
}

fn cmd_command(name: Option<String>, host: bool, cfg: &Config) -> Result<()> {
    let hosts = load_hosts(cfg)?;

    let command = if host {
        let host_id = select_host(&hosts, name, "Command for host")?;
        let resolver = JumpResolver::new(&hosts, cfg.max_jump_depth);
        let chain = resolver.resolve(&host_id)?;
        render::render_command(&chain, &resolver.forwards_for(&host_id)?)?
    } else {
        let profile = select_profile(cfg, name, "Command for profile")?;
        let report = validator(cfg).validate(&profile);
        if !report.is_valid() {
            display::print_report(&profile, &report);
            anyhow::bail!("'{}' is not a valid profile", profile.id);
        }
        let root = profile
            .root()
            .with_context(|| format!("'{}' has no local machine node", profile.id))?;
        let chain = resolve::resolve(&profile, &root.id);
        render::render(&chain, &hosts)
            .with_context(|| format!("cannot render '{}'", profile.id))?
    };

    println!("{command}");
    Ok(())
}

/// What `up` was asked to start.
enum Target {
    Profile(TunnelProfile),
    Host(String),
}

impl Target {
    fn key(&self) -> String {
        match self {
            Target::Profile(p) => p.id.clone(),
            Target::Host(h) => host_key(h),
        }
    }

    fn name(&self) -> &str {
        match self {
            Target::Profile(p) => p.name(),
            Target::Host(h) => h,
        }
    }
}

fn up_targets(names: Vec<String>, all: bool, host: bool, hosts: &HostCatalog, cfg: &Config) -> Result<Vec<Target>> {
    if all {
        let validator = validator(cfg);
        let valid: Vec<Target> = load_profiles(cfg)?
            .into_iter()
            .filter(|p| validator.validate(p).is_valid())
            .map(Target::Profile)
            .collect();
        return Ok(valid);
    }

    if host {
        if !names.is_empty() {
            return Ok(names.into_iter().map(Target::Host).collect());
        }
        let items: Vec<String> = hosts.iter().map(|h| h.id.clone()).collect();
        let picked = picker::pick_many("Start hosts", &items)?;
        return Ok(picked.into_iter().map(|i| Target::Host(items[i].clone())).collect());
    }

    if !names.is_empty() {
        return names
            .iter()
            .map(|n| find_profile(cfg, n).map(Target::Profile))
            .collect();
    }
    let all = load_profiles(cfg)?;
    let items: Vec<String> = all
        .iter()
        .map(|p| format!("{} ({})", p.id, p.name()))
        .collect();
    let picked = picker::pick_many("Start profiles", &items)?;
    Ok(all
        .into_iter()
        .enumerate()
        .filter(|(i, _)| picked.contains(i))
        .map(|(_, p)| Target::Profile(p))
        .collect())
}

fn cmd_up(names: Vec<String>, all: bool, host: bool, cfg: &Config) -> Result<()> {
    let hosts = load_hosts(cfg)?;
    let targets = up_targets(names, all, host, &hosts, cfg)?;
    if targets.is_empty() {
        println!("{}", "Nothing to start.".yellow());
        return Ok(());
    }

    let (verifier, auth): (Arc<dyn HostKeyVerifier>, Arc<dyn InteractiveAuth>) =
        if console::user_attended_stderr() {
            let prompter = Arc::new(TerminalPrompter::new());
            (prompter.clone(), prompter)
        } else {
            (Arc::new(KnownHostsOnly), Arc::new(NoInteraction))
        };
    let service = TunnelService::new(
        Arc::new(Libssh2Transport::new(cfg.transport_settings())),
        Arc::new(hosts),
        verifier,
        auth,
        cfg.service_settings(),
    );

    install_signal_handlers();
    let cancel = CancellationToken::new();
    let abandon = CancellationToken::new();
    let done = CancellationToken::new();

    let running = thread::scope(|s| {
        s.spawn(|| {
            while !done.is_cancelled() {
                let signals = SIGNALS.load(Ordering::SeqCst);
                if signals >= 1 {
                    cancel.cancel();
                }
                if signals >= 2 {
                    abandon.cancel();
                }
                thread::sleep(Duration::from_millis(100));
            }
        });

        let started: Vec<(&Target, ExecuteResult)> = thread::scope(|starters| {
            let handles: Vec<_> = targets
                .iter()
                .map(|target| {
                    let service = &service;
                    let cancel = &cancel;
                    let handle = starters.spawn(move || match target {
                        Target::Profile(p) => service.execute(p, cancel),
                        Target::Host(h) => service.execute_host(h, cancel),
                    });
                    (target, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(target, handle)| {
                    let result = handle.join().unwrap_or_else(|_| ExecuteResult {
                        error: Some("start panicked".to_string()),
                        ..ExecuteResult::default()
                    });
                    (target, result)
                })
                .collect()
        });

        report_started(&service, &started, cfg);

        let running = service.registry().len();
        if running == 0 {
            done.cancel();
            return 0;
        }
        println!("{}", "Press Ctrl-C to stop.".dimmed());
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(200));
        }

        println!();
        display::print_status_rows(&service.status().into_iter().collect::<Vec<_>>());
        println!("{}", "Stopping. Press Ctrl-C again to abandon teardown.".dimmed());
        for (id, outcome) in service.stop_all(&abandon) {
            match outcome {
                StopOutcome::TimedOut => println!(
                    "{} {}  teardown abandoned",
                    "⚠".yellow(),
                    id.yellow().bold()
                ),
                _ => display::print_stopped(&id),
            }
        }
        done.cancel();
        running
    });

    if running == 0 {
        anyhow::bail!("no tunnel started");
    }
    Ok(())
}

fn report_started(service: &TunnelService, started: &[(&Target, ExecuteResult)], cfg: &Config) {
    let status = service.status();
    for (target, result) in started {
        match status.get(&target.key()) {
            Some(tunnel) if result.success => {
                display::print_started(target.name(), tunnel, cfg.health_timeout());
                if let Some(ref error) = result.error {
                    println!("  {} {}", "⚠".yellow(), error);
                }
            }
            _ => display::print_failed(
                target.name(),
                result.error.as_deref().unwrap_or("not started"),
            ),
        }
        for warning in &result.warnings {
            println!("  {} {}", "⚠".yellow(), warning.dimmed());
        }
    }
}

fn cmd_config(cfg: &Config) -> Result<()> {
    let path = Config::init()?;
    let editor = cfg.resolve_editor();

    let status = std::process::Command::new(&editor)
        .arg(&path)
        .status()
        .with_context(|| format!("failed to launch editor '{}'", editor))?;

    if !status.success() {
        anyhow::bail!("editor exited with {}", status);
    }

    Ok(())
}

fn cmd_completions(shell: Option<clap_complete::Shell>, cfg: &Config) -> Result<()> {
    let shell = match shell {
        Some(s) => s,
        None => {
            let name = cfg.shell.as_deref().ok_or_else(|| {
                anyhow::anyhow!(
                    "no shell specified; use `warren completions <shell>` or set `shell` in ~/.warren/config.toml"
                )
            })?;
            name.parse::<clap_complete::Shell>()
                .map_err(|_| anyhow::anyhow!("unknown shell '{}' in config", name))?
        }
    };

    let shell_name = match shell {
        clap_complete::Shell::Bash => "bash",
        clap_complete::Shell::Zsh => "zsh",
        clap_complete::Shell::Fish => "fish",
        clap_complete::Shell::Elvish => "elvish",
        clap_complete::Shell::PowerShell => "powershell",
        _ => anyhow::bail!("unsupported shell"),
    };
    unsafe { std::env::set_var("COMPLETE", shell_name) };
    clap_complete::CompleteEnv::with_factory(Cli::command).complete();
    Ok(())
}

fn cmd_list_names(cfg: &Config) -> Result<()> {
    for p in load_profiles(cfg)? {
        println!("{}", p.id);
    }
    Ok(())
}
