use clap::{Parser, Subcommand};
use clap_complete::engine::{ArgValueCompleter, CompletionCandidate};

use warren::config::Config;

#[derive(Parser)]
#[command(name = "warren", about = "Graph-driven SSH tunnel manager", version)]
pub struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Debug logging on stderr (same as WARREN_DEBUG=1)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

fn complete_profile_names(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let prefix = current.to_str().unwrap_or("");
    let cfg = Config::load();
    let Ok(dir) = cfg.profiles_dir() else {
        return Vec::new();
    };
    warren::profiles::load_all(&dir)
        .unwrap_or_default()
        .iter()
        .filter(|p| p.id.starts_with(prefix))
        .map(|p| CompletionCandidate::new(&p.id))
        .collect()
}

fn complete_host_names(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let prefix = current.to_str().unwrap_or("");
    let cfg = Config::load();
    let Ok(path) = cfg.ssh_config_path() else {
        return Vec::new();
    };
    let user = whoami::username();
    let Ok(hosts) = warren::ssh_config::load_hosts(&path, &user) else {
        return Vec::new();
    };
    hosts
        .iter()
        .filter(|h| h.id.starts_with(prefix))
        .map(|h| CompletionCandidate::new(&h.id))
        .collect()
}

/// Profiles first, then host aliases, since `--host` may come after the name.
fn complete_targets(current: &std::ffi::OsStr) -> Vec<CompletionCandidate> {
    let mut candidates = complete_profile_names(current);
    candidates.extend(complete_host_names(current));
    candidates
}

#[derive(Subcommand)]
pub enum Command {
    /// List profiles and tunnel hosts
    #[command(alias = "ls")]
    List,
    /// Validate a profile
    Check {
        /// Profile id (checks every profile if omitted)
        #[arg(add = ArgValueCompleter::new(complete_profile_names))]
        name: Option<String>,
    },
    /// Show the hop path a profile resolves to
    Route {
        /// Profile id (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_profile_names))]
        name: Option<String>,
    },
    /// Print the equivalent ssh command line
    Command {
        /// Profile id, or host alias with --host (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_targets))]
        name: Option<String>,
        /// Treat NAME as an ssh_config host and follow its ProxyJump chain
        #[arg(long)]
        host: bool,
    },
    /// Bring tunnels up in the foreground until Ctrl-C
    Up {
        /// Profile ids, or host aliases with --host (interactive picker if omitted)
        #[arg(add = ArgValueCompleter::new(complete_targets))]
        names: Vec<String>,
        /// Start every valid profile
        #[arg(long, short, conflicts_with = "names", conflicts_with = "host")]
        all: bool,
        /// Treat NAMES as ssh_config hosts
        #[arg(long)]
        host: bool,
    },
    /// Initialize or edit ~/.warren/config.toml
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for (reads from config if omitted)
        shell: Option<clap_complete::Shell>,
    },
    /// List profile ids (for shell completion scripts)
    #[command(hide = true)]
    ListNames,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn up_takes_several_names() {
        let cli = Cli::try_parse_from(["warren", "up", "db", "web", "-v"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Up { names, all, host } => {
                assert_eq!(names, vec!["db".to_string(), "web".to_string()]);
                assert!(!all && !host);
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn all_conflicts_with_names() {
        assert!(Cli::try_parse_from(["warren", "up", "db", "--all"]).is_err());
    }
}
