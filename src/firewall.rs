//! iptables rule for the Tempest broadcast port.
//!
//! Every failure here is a warning: the listener may still work when the
//! host firewall is already open.

use log::{info, warn};
use serde::Serialize;
use std::net::UdpSocket;
use std::process::Command;

use crate::error::{FusionError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleAction {
    Check,
    Insert,
    Delete,
}

impl RuleAction {
    fn flag(self) -> &'static str {
        match self {
            RuleAction::Check => "-C",
            RuleAction::Insert => "-I",
            RuleAction::Delete => "-D",
        }
    }
}

pub fn rule_comment(port: u16) -> String {
    format!("wind-fusion-{}", port)
}

/// `iptables` argv for the ACCEPT rule on `port`, tagged with our comment.
pub fn rule_args(action: RuleAction, port: u16) -> Vec<String> {
    [
        "iptables",
        action.flag(),
        "INPUT",
        "-p",
        "udp",
        "--dport",
        &port.to_string(),
        "-j",
        "ACCEPT",
        "-m",
        "comment",
        "--comment",
        &rule_comment(port),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn run_iptables(action: RuleAction, port: u16) -> Result<()> {
    // -n: never prompt for a password
    let output = Command::new("sudo")
        .arg("-n")
        .args(rule_args(action, port))
        .output()
        .map_err(|e| FusionError::Firewall(format!("failed to run sudo: {}", e)))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(FusionError::Firewall(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Rule inserted by this process. Removed on drop.
#[derive(Debug)]
pub struct FirewallRule {
    port: u16,
}

impl FirewallRule {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for FirewallRule {
    fn drop(&mut self) {
        info!("Removing iptables rule for UDP port {}...", self.port);
        match run_iptables(RuleAction::Delete, self.port) {
            Ok(()) => info!("Firewall rule removed"),
            Err(e) => warn!(
                "Failed to remove firewall rule: {}. Manual cleanup: sudo {}",
                e,
                rule_args(RuleAction::Delete, self.port).join(" ")
            ),
        }
    }
}

/// Allow inbound UDP on `port`. Returns a guard only when a rule was
/// actually inserted; an existing rule is left alone.
pub fn open_udp_port(port: u16) -> Option<FirewallRule> {
    if !cfg!(target_os = "linux") {
        info!("Firewall management only supported on Linux, skipping");
        return None;
    }

    if run_iptables(RuleAction::Check, port).is_ok() {
        info!("Firewall rule for UDP port {} already exists", port);
        return None;
    }

    info!("Adding iptables rule to allow UDP broadcasts on port {}...", port);
    match run_iptables(RuleAction::Insert, port) {
        Ok(()) => {
            info!("Firewall rule added");
            Some(FirewallRule { port })
        }
        Err(e) => {
            warn!(
                "Could not configure firewall: {}. If broadcasts do not arrive, run: sudo {}",
                e,
                rule_args(RuleAction::Insert, port).join(" ")
            );
            None
        }
    }
}

/// What the process did to the firewall at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FirewallSetup {
    pub port: u16,
    pub rule_added: bool,
}

impl FirewallSetup {
    pub fn from_rule(rule: Option<&FirewallRule>, port: u16) -> Self {
        match rule {
            Some(rule) => FirewallSetup {
                port: rule.port(),
                rule_added: true,
            },
            None => FirewallSetup {
                port,
                rule_added: false,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FirewallStatus {
    pub platform: &'static str,
    pub is_linux: bool,
    pub rule_added: bool,
    pub rule_exists: bool,
    pub port: u16,
    pub sudo_available: bool,
}

/// Non-interactive sudo works.
pub fn sudo_available() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Blocks on `sudo`; run off the async workers.
pub fn status(setup: FirewallSetup) -> FirewallStatus {
    let is_linux = cfg!(target_os = "linux");
    FirewallStatus {
        platform: std::env::consts::OS,
        is_linux,
        rule_added: setup.rule_added,
        rule_exists: is_linux && run_iptables(RuleAction::Check, setup.port).is_ok(),
        port: setup.port,
        sudo_available: is_linux && sudo_available(),
    }
}

/// Bind the port briefly to see whether the listener will be able to.
pub fn probe_udp_port(port: u16) -> bool {
    match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(_) => {
            info!("UDP port {} is available", port);
            true
        }
        Err(e) => {
            warn!("UDP port {} binding failed: {}", port, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_args_shape() {
        let args = rule_args(RuleAction::Insert, 50222);
        assert_eq!(
            args.join(" "),
            "iptables -I INPUT -p udp --dport 50222 -j ACCEPT -m comment --comment wind-fusion-50222"
        );
        assert_eq!(rule_args(RuleAction::Check, 1)[1], "-C");
        assert_eq!(rule_args(RuleAction::Delete, 1)[1], "-D");
    }

    #[test]
    fn test_probe_detects_busy_port() {
        let held = UdpSocket::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        assert!(!probe_udp_port(port));

        drop(held);
        assert!(probe_udp_port(port));
    }

    #[test]
    fn test_setup_reports_inserted_rule_port() {
        let untouched = FirewallSetup::from_rule(None, 50222);
        assert_eq!(
            untouched,
            FirewallSetup {
                port: 50222,
                rule_added: false
            }
        );

        let rule = FirewallRule { port: 50223 };
        let setup = FirewallSetup::from_rule(Some(&rule), 50222);
        assert_eq!(setup.port, 50223);
        assert!(setup.rule_added);
        // Dropping the guard shells out to sudo; skip it here
        std::mem::forget(rule);
    }

    #[test]
    fn test_status_carries_setup() {
        let status = status(FirewallSetup {
            port: 50222,
            rule_added: false,
        });
        assert_eq!(status.port, 50222);
        assert!(!status.rule_added);
        assert_eq!(status.platform, std::env::consts::OS);
        assert_eq!(status.is_linux, cfg!(target_os = "linux"));
        if !status.is_linux {
            assert!(!status.rule_exists && !status.sudo_available);
        }
    }
}
