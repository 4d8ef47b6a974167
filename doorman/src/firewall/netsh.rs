use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Command;

use tracing::debug;

use super::{port_list, run, FirewallBackend, FirewallError, FirewallRule, RULE_TAG};

/// Windows Defender Firewall via `netsh advfirewall`; one named rule per
/// address.
#[derive(Debug, Clone)]
pub struct Netsh {
    program: String,
}

impl Default for Netsh {
    fn default() -> Self {
        Self {
            program: "netsh".into(),
        }
    }
}

impl Netsh {
    fn rule_name(address: IpAddr) -> String {
        format!("{RULE_TAG}-{address}")
    }

    fn add_args(rule: &FirewallRule) -> Result<Vec<String>, FirewallError> {
        let ports = port_list(&rule.ports)?;
        Ok(vec![
            "advfirewall".into(),
            "firewall".into(),
            "add".into(),
            "rule".into(),
            format!("name={}", Self::rule_name(rule.address)),
            "dir=in".into(),
            "action=allow".into(),
            "protocol=TCP".into(),
            format!("remoteip={}", rule.address),
            format!("localport={ports}"),
        ])
    }

    fn delete_args(address: IpAddr) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "delete".into(),
            "rule".into(),
            format!("name={}", Self::rule_name(address)),
        ]
    }
}

impl FirewallBackend for Netsh {
    fn name(&self) -> &'static str {
        "netsh"
    }

    fn allow(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::add_args(rule)?);
        run(&mut cmd).map(|_| ())
    }

    fn revoke(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<(), FirewallError> {
        port_list(ports)?;
        let mut cmd = Command::new(&self.program);
        cmd.args(Self::delete_args(address));
        // netsh reports a missing rule as a failure; treat it as already gone.
        match run(&mut cmd) {
            Ok(_) => Ok(()),
            Err(FirewallError::Command { stderr, code, .. }) => {
                debug!(client_ip = %address, ?code, %stderr, "netsh delete reported no rule");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
