use std::time::Duration;

use colored::Colorize;
use console::Alignment;

use warren::graph::{NodeType, TunnelNode, TunnelProfile};
use warren::health;
use warren::hosts::HostRecord;
use warren::registry::TunnelStatus;
use warren::resolve::ResolvedChain;
use warren::tunnel;
use warren::validate::ValidationReport;

/// Print profiles with a validity bullet and their node counts.
pub fn print_profile_list(profiles: &[(TunnelProfile, ValidationReport)]) {
    if profiles.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!("Add a TOML profile to ~/.warren/profiles to get started.");
        return;
    }

    let w_id = profiles.iter().map(|(p, _)| p.id.len()).max().unwrap_or(0);
    let w_name = profiles.iter().map(|(p, _)| p.name().len()).max().unwrap_or(0);

    for (profile, report) in profiles {
        let (bullet, id) = if report.is_valid() {
            ("●".green().to_string(), profile.id.green().bold().to_string())
        } else {
            ("✗".red().to_string(), profile.id.red().bold().to_string())
        };
        let hops = profile.nodes_of(NodeType::SshHost).count();
        let mut summary = format!("{} nodes, {} hops", profile.nodes.len(), hops);
        if !report.is_valid() {
            summary.push_str(&format!(", {} errors", report.errors.len()));
        }
        if !report.warnings.is_empty() {
            summary.push_str(&format!(", {} warnings", report.warnings.len()));
        }
        println!(
            "  {} {}  {}  {}",
            bullet,
            pad(&id, w_id),
            pad(profile.name(), w_name),
            summary.dimmed()
        );
    }
}

/// Print ssh_config hosts that declare forwards or jump through other hosts.
pub fn print_host_list<'a>(hosts: impl Iterator<Item = &'a HostRecord>) {
    let rows: Vec<&HostRecord> = hosts
        .filter(|h| !h.forwards.is_empty() || h.proxy_jump.is_some())
        .collect();
    if rows.is_empty() {
        return;
    }
    println!();
    println!("{}", "hosts".dimmed());
    let w_id = rows.iter().map(|h| h.id.len()).max().unwrap_or(0);
    for host in rows {
        let mut detail = tunnel::describe(&host.forwards);
        if let Some(ref jump) = host.proxy_jump {
            if !detail.is_empty() {
                detail.push_str("  ");
            }
            detail.push_str(&format!("via {jump}"));
        }
        println!("  {} {}  {}", "○".dimmed(), pad(&host.id, w_id), detail.dimmed());
    }
}

pub fn print_report(profile: &TunnelProfile, report: &ValidationReport) {
    if report.is_valid() {
        println!("{} {} {}", "✓".green(), profile.id.green().bold(), "valid".green());
    } else {
        println!("{} {} {}", "✗".red(), profile.id.red().bold(), "invalid".red());
    }
    for error in &report.errors {
        println!("  {} {}", "✗".red(), error);
    }
    for warning in &report.warnings {
        println!("  {} {}", "⚠".yellow(), warning);
    }
}

pub fn print_route(profile: &TunnelProfile, chain: &ResolvedChain) {
    println!("{} {}", "●".green(), profile.name().bold());
    let path: Vec<String> = chain.path.iter().map(node_label).collect();
    println!("  {}  {}", "path".dimmed(), path.join(" → "));
    if !chain.side.is_empty() {
        let side: Vec<String> = chain.side.iter().map(node_label).collect();
        println!("  {}  {}", "side".dimmed(), side.join(", "));
    }
    if !chain.directives.is_empty() {
        println!("  {}  {}", "fwd ".dimmed(), tunnel::describe(&chain.directives));
    }
}

fn node_label(node: &TunnelNode) -> String {
    match (node.node_type, node.host_id.as_deref()) {
        (NodeType::SshHost, Some(host)) => format!("{}[{host}]", node.id),
        (NodeType::LocalMachine, _) => node.id.to_string(),
        _ => format!("{} ({})", node.id, node.node_type),
    }
}

/// One line for a freshly started tunnel, probing its local listeners.
pub fn print_started(name: &str, status: &TunnelStatus, health_timeout: Duration) {
    let started = format!(
        "{} {} {}",
        "●".green(),
        name.green().bold(),
        "started".green()
    );
    let via = status.hops.join(" → ").dimmed();

    if status.local_ports.is_empty() {
        println!("{started} via {via}");
        return;
    }
    let health_msg = if health::wait_healthy_ports(&status.local_ports, health_timeout) {
        format!("{} healthy", "✓".green())
    } else {
        format!("{} port not reachable yet", "✗".yellow())
    };
    println!("{started} via {via}  {health_msg}");
}

pub fn print_failed(name: &str, error: &str) {
    println!("{} {}  {}", "✗".red(), name.red().bold(), error);
}

pub fn print_stopped(name: &str) {
    println!("{} {} {}", "○".dimmed(), name.bold(), "stopped".dimmed());
}

/// Print running tunnels with uptime, hop path and local port health.
pub fn print_status_rows(rows: &[(String, TunnelStatus)]) {
    let w_name = rows.iter().map(|(id, _)| id.len()).max().unwrap_or(0);
    let uptimes: Vec<String> = rows
        .iter()
        .map(|(_, s)| format!("up {}", format_uptime(s.uptime())))
        .collect();
    let w_status = uptimes.iter().map(String::len).max().unwrap_or(0);
    // ✓/✗ render double-width in some fonts.
    let w_health = console::measure_text_width("✓").max(1);

    for ((id, status), uptime) in rows.iter().zip(&uptimes) {
        let health = if status.local_ports.is_empty() {
            " ".repeat(w_health)
        } else if status.local_ports.iter().all(|p| health::check_port(*p)) {
            pad(&"✓".green().to_string(), w_health)
        } else {
            pad(&"✗".red().to_string(), w_health)
        };
        println!(
            "  {} {}  {}  {}  {}",
            "●".green(),
            pad(&id.green().bold().to_string(), w_name),
            pad(&uptime.green().to_string(), w_status),
            health,
            status.forwards.join(", ").dimmed()
        );
    }
}

/// Compact uptime: "2d 3h", "5h 12m" or "7m", never below a minute.
pub fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let mins = (secs % 3600) / 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins.max(1))
    }
}

/// Pad an ANSI-colored string to a visible width using console's awareness of escape codes.
fn pad(s: &str, width: usize) -> String {
    console::pad_str(s, width, Alignment::Left, None).to_string()
}
