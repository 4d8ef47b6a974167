use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Command;

use super::{port_list, run, FirewallBackend, FirewallError, FirewallRule, RULE_TAG};

/// Linux netfilter via `iptables`/`ip6tables`. Rules are inserted at the
/// top of the chain and tagged with a comment.
#[derive(Debug, Clone)]
pub struct Iptables {
    v4: String,
    v6: String,
    chain: String,
}

impl Default for Iptables {
    fn default() -> Self {
        Self {
            v4: "iptables".into(),
            v6: "ip6tables".into(),
            chain: "INPUT".into(),
        }
    }
}

impl Iptables {
    fn program(&self, address: IpAddr) -> &str {
        match address {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    fn rule_args(
        &self,
        op: &str,
        address: IpAddr,
        ports: &BTreeSet<u16>,
    ) -> Result<Vec<String>, FirewallError> {
        let ports = port_list(ports)?;
        let source = address.to_string();
        Ok([
            op,
            self.chain.as_str(),
            "-s",
            source.as_str(),
            "-p",
            "tcp",
            "-m",
            "multiport",
            "--dports",
            ports.as_str(),
            "-m",
            "comment",
            "--comment",
            RULE_TAG,
            "-j",
            "ACCEPT",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect())
    }

    // `-w` waits for the xtables lock instead of failing when the expiry
    // worker and the main loop run commands at the same time.
    fn command(&self, address: IpAddr, args: Vec<String>) -> Command {
        let mut cmd = Command::new(self.program(address));
        cmd.arg("-w").args(args);
        cmd
    }

    /// `iptables -C` exits 1 when the rule is absent.
    fn exists(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<bool, FirewallError> {
        match run(&mut self.command(address, self.rule_args("-C", address, ports)?)) {
            Ok(_) => Ok(true),
            Err(FirewallError::Command { code: Some(1), .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl FirewallBackend for Iptables {
    fn name(&self) -> &'static str {
        "iptables"
    }

    fn probe(&self) -> Result<(), FirewallError> {
        let mut cmd = Command::new(&self.v4);
        cmd.args(["-w", "-n", "-L", self.chain.as_str()]);
        run(&mut cmd).map(|_| ())
    }

    fn allow(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        let args = self.rule_args("-I", rule.address, &rule.ports)?;
        run(&mut self.command(rule.address, args)).map(|_| ())
    }

    fn revoke(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<(), FirewallError> {
        // Delete every copy so a rule left over from an earlier run goes too.
        while self.exists(address, ports)? {
            run(&mut self.command(address, self.rule_args("-D", address, ports)?))?;
        }
        Ok(())
    }
}
