//! Verdicts for resolved connections.

use log::debug;
use std::io;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{Mode, NotifierConfig};
use crate::conn::Connection;
use crate::queue::Verdict;
use crate::rules::RuleSet;
use crate::whitelist;

const NOTIFIER_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("decision not reached within {0:?}")]
    Timeout(Duration),
    #[error("failed to run notifier {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("notifier {program} {reason}")]
    Notifier { program: String, reason: String },
}

/// Decides the fate of one connection.
///
/// Runs on the packet's critical path: implementations must return within
/// `timeout`, failing with [`PolicyError::Timeout`] rather than blocking.
pub trait Policy: Send + Sync {
    fn decide(&self, conn: &Connection, timeout: Duration) -> Result<Verdict, PolicyError>;
}

/// External command run for every connection no rule covers. The
/// connection description is passed as its last argument.
pub struct Notifier {
    program: String,
    args: Vec<String>,
}

impl Notifier {
    pub fn new(config: &NotifierConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    /// Runs the notifier, killing it once `timeout` expires.
    pub fn notify(&self, conn: &Connection, timeout: Duration) -> Result<(), PolicyError> {
        let deadline = Instant::now() + timeout;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(conn.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| PolicyError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return Ok(()),
                Ok(Some(status)) => {
                    return Err(PolicyError::Notifier {
                        program: self.program.clone(),
                        reason: format!("exited with {}", status),
                    })
                }
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PolicyError::Timeout(timeout));
                }
                Ok(None) => thread::sleep(NOTIFIER_POLL),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(PolicyError::Notifier {
                        program: self.program.clone(),
                        reason: format!("could not be waited on: {}", e),
                    });
                }
            }
        }
    }
}

/// Rules first, then the essential-service list, then the notifier and
/// the mode.
pub struct RulePolicy {
    rules: RuleSet,
    mode: Mode,
    drop_mark: u32,
    notifier: Option<Notifier>,
}

impl RulePolicy {
    pub fn new(rules: RuleSet, mode: Mode, drop_mark: u32, notifier: Option<Notifier>) -> Self {
        Self {
            rules,
            mode,
            drop_mark,
            notifier,
        }
    }

    fn deny(&self) -> Verdict {
        Verdict::Deny {
            mark: Some(self.drop_mark),
        }
    }
}

impl Policy for RulePolicy {
    fn decide(&self, conn: &Connection, timeout: Duration) -> Result<Verdict, PolicyError> {
        let started = Instant::now();
        self.rules.reload_if_changed();
        if let Some(allow) = self.rules.decision(&conn.process.path, conn.dst_port()) {
            return Ok(if allow { Verdict::Allow } else { self.deny() });
        }

        if let Some(reason) =
            whitelist::auto_allow_reason(&conn.process.path, conn.tuple.dst, conn.dst_port())
        {
            debug!("Auto-allowed {} ({})", conn, reason);
            return Ok(Verdict::Allow);
        }

        if let Some(notifier) = &self.notifier {
            notifier.notify(conn, timeout.saturating_sub(started.elapsed()))?;
        }

        Ok(match self.mode {
            Mode::Observe => Verdict::Allow,
            Mode::Enforce => self.deny(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{FiveTuple, Protocol};
    use crate::process::testing::process;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn connection(path: &str, dst_port: u16) -> Connection {
        Connection {
            tuple: FiveTuple {
                protocol: Protocol::Tcp,
                src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                src_port: 51000,
                dst: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                dst_port,
            },
            process: process(4242, path),
            host: Some("example.com".to_string()),
        }
    }

    fn rules(content: &str) -> (tempfile::TempDir, RuleSet) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(&path, content).unwrap();
        let rules = RuleSet::load(&path);
        (dir, rules)
    }

    fn notifier(program: &str, args: &[&str]) -> Notifier {
        Notifier::new(&NotifierConfig {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn explicit_rules_win() {
        let (_dir, rules) = rules(r#"{"/usr/bin/curl:443": false, "/usr/sbin/chronyd:123": false}"#);
        let policy = RulePolicy::new(rules, Mode::Observe, 42, None);

        assert_eq!(
            policy.decide(&connection("/usr/bin/curl", 443), TIMEOUT).unwrap(),
            Verdict::Deny { mark: Some(42) }
        );
        // Rules override the essential-service list too
        assert_eq!(
            policy.decide(&connection("/usr/sbin/chronyd", 123), TIMEOUT).unwrap(),
            Verdict::Deny { mark: Some(42) }
        );
    }

    #[test]
    fn mode_decides_unmatched_connections() {
        let (_dir, observe_rules) = rules("{}");
        let observe = RulePolicy::new(observe_rules, Mode::Observe, 42, None);
        assert_eq!(
            observe.decide(&connection("/usr/bin/curl", 443), TIMEOUT).unwrap(),
            Verdict::Allow
        );

        let (_dir, enforce_rules) = rules("{}");
        let enforce = RulePolicy::new(enforce_rules, Mode::Enforce, 42, None);
        assert_eq!(
            enforce.decide(&connection("/usr/bin/curl", 443), TIMEOUT).unwrap(),
            Verdict::Deny { mark: Some(42) }
        );
        assert_eq!(
            enforce.decide(&connection("/usr/sbin/chronyd", 123), TIMEOUT).unwrap(),
            Verdict::Allow
        );
    }

    #[test]
    fn successful_notifier_keeps_mode_verdict() {
        let (_dir, rules) = rules("{}");
        let policy = RulePolicy::new(rules, Mode::Enforce, 7, Some(notifier("true", &[])));
        assert_eq!(
            policy.decide(&connection("/usr/bin/curl", 443), TIMEOUT).unwrap(),
            Verdict::Deny { mark: Some(7) }
        );
    }

    #[test]
    fn failing_notifier_is_an_error() {
        let (_dir, rules) = rules("{}");
        let policy = RulePolicy::new(rules, Mode::Observe, 7, Some(notifier("false", &[])));
        assert!(matches!(
            policy.decide(&connection("/usr/bin/curl", 443), TIMEOUT),
            Err(PolicyError::Notifier { .. })
        ));

        let missing = notifier("/nonexistent/notifier", &[]);
        assert!(matches!(
            missing.notify(&connection("/usr/bin/curl", 443), TIMEOUT),
            Err(PolicyError::Spawn { .. })
        ));
    }

    #[test]
    fn notifier_gets_only_the_remaining_budget() {
        let (_dir, rules) = rules("{}");
        let policy = RulePolicy::new(rules, Mode::Observe, 7, Some(notifier("sh", &["-c", "sleep 5"])));
        let started = Instant::now();
        assert!(matches!(
            policy.decide(&connection("/usr/bin/curl", 443), Duration::ZERO),
            Err(PolicyError::Timeout(d)) if d == Duration::ZERO
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn slow_notifier_is_killed_at_the_deadline() {
        // The connection string lands in $0 of the shell
        let slow = notifier("sh", &["-c", "sleep 5"]);
        let started = Instant::now();
        let result = slow.notify(&connection("/usr/bin/curl", 443), Duration::from_millis(50));
        assert!(matches!(result, Err(PolicyError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
