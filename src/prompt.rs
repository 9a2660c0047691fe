use colored::Colorize;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Password, Select};
use parking_lot::Mutex;

use warren::resolve::Hop;
use warren::transport::{
    AuthPrompt, HostKeyDecision, HostKeyInfo, HostKeyStatus, HostKeyVerifier, InteractiveAuth,
};

/// Terminal answers for host-key and authentication questions.
///
/// Chains connect on their own threads; the lock keeps their questions from
/// interleaving on the terminal.
#[derive(Default)]
pub struct TerminalPrompter {
    lock: Mutex<()>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostKeyVerifier for TerminalPrompter {
    fn verify(&self, info: &HostKeyInfo) -> HostKeyDecision {
        match info.status {
            HostKeyStatus::Known => return HostKeyDecision::AcceptOnce,
            HostKeyStatus::Changed => {
                let _guard = self.lock.lock();
                eprintln!(
                    "{} host key for {}:{} has {} ({} {})",
                    "✗".red(),
                    info.host.bold(),
                    info.port,
                    "changed".red().bold(),
                    info.key_type,
                    info.fingerprint
                );
                eprintln!("  remove the old entry from known_hosts if the change is expected");
                return HostKeyDecision::Reject;
            }
            HostKeyStatus::Unknown => {}
        }

        let _guard = self.lock.lock();
        eprintln!(
            "{} unknown host {}:{}",
            "⚠".yellow(),
            info.host.bold(),
            info.port
        );
        eprintln!("  {} {}", info.key_type, info.fingerprint.dimmed());
        let choices = ["Reject", "Accept once", "Accept and remember"];
        let picked = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("Trust this host?")
            .items(&choices)
            .default(0)
            .interact();
        match picked {
            Ok(1) => HostKeyDecision::AcceptOnce,
            Ok(2) => HostKeyDecision::AcceptAndRemember,
            _ => HostKeyDecision::Reject,
        }
    }
}

impl InteractiveAuth for TerminalPrompter {
    fn respond(&self, hop: &Hop, instructions: &str, prompts: &[AuthPrompt]) -> Option<Vec<String>> {
        let _guard = self.lock.lock();
        eprintln!("{} {}", "?".cyan(), hop.to_string().bold());
        if !instructions.trim().is_empty() {
            eprintln!("  {}", instructions.trim());
        }

        let theme = ColorfulTheme::default();
        let mut answers = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let text = prompt.text.trim().trim_end_matches(':');
            let answer = if prompt.echo {
                Input::<String>::with_theme(&theme)
                    .with_prompt(text)
                    .allow_empty(true)
                    .interact_text()
            } else {
                Password::with_theme(&theme)
                    .with_prompt(text)
                    .allow_empty_password(true)
                    .interact()
            };
            answers.push(answer.ok()?);
        }
        Some(answers)
    }
}
