//! iptables rules that feed the queue.
//!
//! Three rules, applied in order: DNS responses into the queue, new
//! connections into the queue, and a drop for anything carrying the deny
//! mark. The queue rules use `--queue-bypass` so traffic keeps flowing
//! while no daemon is bound.

use log::{debug, error, info};
use std::io;
use std::process::Command;
use thiserror::Error;

/// Upper bound on duplicate copies removed per rule.
const MAX_DUPLICATES: usize = 16;

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("failed to {} firewall rules: {}", action(.enable), .failed.join(", "))]
    Partial {
        enable: bool,
        failed: Vec<&'static str>,
    },
}

fn action(enable: &bool) -> &'static str {
    if *enable {
        "apply"
    } else {
        "remove"
    }
}

/// Exit status and stderr of one rule command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs the rule tool with the given arguments.
pub trait CommandRunner {
    fn binary(&self) -> &str;
    fn run(&self, args: &[String]) -> io::Result<CommandOutput>;
}

pub struct Iptables {
    binary: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            binary: "iptables".to_string(),
        }
    }
}

impl CommandRunner for Iptables {
    fn binary(&self) -> &str {
        &self.binary
    }

    fn run(&self, args: &[String]) -> io::Result<CommandOutput> {
        debug!("executing: {} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(args).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub name: &'static str,
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl FirewallRule {
    fn new(name: &'static str, table: &'static str, chain: &'static str, spec: String) -> Self {
        Self {
            name,
            table,
            chain,
            spec: spec.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn args(&self, op: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-w", "-t", self.table, op, self.chain]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// The rule set, in application order.
pub fn rule_set(queue_num: u16, drop_mark: u32) -> Vec<FirewallRule> {
    vec![
        FirewallRule::new(
            "dns",
            "filter",
            "INPUT",
            format!(
                "--protocol udp --sport 53 -j NFQUEUE --queue-num {} --queue-bypass",
                queue_num
            ),
        ),
        FirewallRule::new(
            "conntrack",
            "mangle",
            "OUTPUT",
            format!(
                "-m conntrack --ctstate NEW -j NFQUEUE --queue-num {} --queue-bypass",
                queue_num
            ),
        ),
        FirewallRule::new(
            "drop-marked",
            "filter",
            "OUTPUT",
            format!("-m mark --mark {} -j DROP", drop_mark),
        ),
    ]
}

pub struct FirewallController<R> {
    runner: R,
    rules: Vec<FirewallRule>,
}

impl<R: CommandRunner> FirewallController<R> {
    pub fn new(runner: R, queue_num: u16, drop_mark: u32) -> Self {
        Self {
            runner,
            rules: rule_set(queue_num, drop_mark),
        }
    }

    /// Installs (`enable`) or removes every rule. A failing rule does not
    /// stop the others; all failures are reported together.
    pub fn apply(&self, enable: bool) -> Result<(), FirewallError> {
        let mut failed = Vec::new();
        for rule in &self.rules {
            let result = if enable {
                self.install(rule)
            } else {
                self.remove(rule)
            };
            if let Err(e) = result {
                error!("Error while running {} firewall rule: {}", rule.name, e);
                failed.push(rule.name);
            }
        }

        if failed.is_empty() {
            info!(
                "Firewall rules {}",
                if enable { "installed" } else { "removed" }
            );
            Ok(())
        } else {
            Err(FirewallError::Partial { enable, failed })
        }
    }

    fn install(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        if self.exists(rule)? {
            debug!("{} rule already present", rule.name);
            return Ok(());
        }
        self.run_checked(&rule.args("-I"))
    }

    fn remove(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        for _ in 0..MAX_DUPLICATES {
            if !self.exists(rule)? {
                return Ok(());
            }
            self.run_checked(&rule.args("-D"))?;
        }
        Ok(())
    }

    /// `iptables -C` exits 1 when the rule is absent and 2+ on real errors.
    fn exists(&self, rule: &FirewallRule) -> Result<bool, FirewallError> {
        let args = rule.args("-C");
        let output = self.run(&args)?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.command_error(&args, output)),
        }
    }

    fn run_checked(&self, args: &[String]) -> Result<(), FirewallError> {
        let output = self.run(args)?;
        if output.success() {
            Ok(())
        } else {
            Err(self.command_error(args, output))
        }
    }

    fn run(&self, args: &[String]) -> Result<CommandOutput, FirewallError> {
        self.runner.run(args).map_err(|source| FirewallError::Spawn {
            binary: self.runner.binary().to_string(),
            source,
        })
    }

    fn command_error(&self, args: &[String], output: CommandOutput) -> FirewallError {
        FirewallError::Command {
            command: format!("{} {}", self.runner.binary(), args.join(" ")),
            stderr: output.stderr,
        }
    }
}
