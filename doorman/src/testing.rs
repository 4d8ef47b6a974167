//! In-memory stand-ins for the firewall and the score database.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::firewall::{FirewallBackend, FirewallError, FirewallRule};
use crate::store::{ScoreStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Allow(FirewallRule),
    Revoke(IpAddr, BTreeSet<u16>),
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    table: HashMap<IpAddr, usize>,
    fail_allow: bool,
    fail_revoke: bool,
    revoke_delay: Duration,
    revokes_started: usize,
}

/// Backend that records every call and simulates a rule table.
#[derive(Clone, Default)]
pub struct RecordingBackend {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingBackend {
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn allows(&self) -> Vec<FirewallRule> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Allow(rule) => Some(rule),
                Call::Revoke(..) => None,
            })
            .collect()
    }

    pub fn revokes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Revoke(..)))
            .count()
    }

    /// Rules the simulated firewall currently holds for the address.
    pub fn installed(&self, address: IpAddr) -> usize {
        self.inner
            .lock()
            .unwrap()
            .table
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    pub fn fail_allow(&self, fail: bool) {
        self.inner.lock().unwrap().fail_allow = fail;
    }

    pub fn fail_revoke(&self, fail: bool) {
        self.inner.lock().unwrap().fail_revoke = fail;
    }

    /// Makes every revoke take `delay` before it touches the table.
    pub fn revoke_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().revoke_delay = delay;
    }

    pub fn revokes_started(&self) -> usize {
        self.inner.lock().unwrap().revokes_started
    }
}

fn injected(program: &str) -> FirewallError {
    FirewallError::Command {
        program: program.into(),
        code: Some(2),
        stderr: "injected failure".into(),
    }
}

impl FirewallBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn allow(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Allow(rule.clone()));
        if inner.fail_allow {
            return Err(injected("allow"));
        }
        *inner.table.entry(rule.address).or_default() += 1;
        Ok(())
    }

    fn revoke(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<(), FirewallError> {
        let delay = {
            let mut inner = self.inner.lock().unwrap();
            inner.revokes_started += 1;
            inner.revoke_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(Call::Revoke(address, ports.clone()));
        if inner.fail_revoke {
            return Err(injected("revoke"));
        }
        inner.table.remove(&address);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryScoreStore {
    scores: Mutex<HashMap<(u64, IpAddr), u64>>,
    fail_increment: Mutex<bool>,
}

impl MemoryScoreStore {
    pub fn fail_increment(&self, fail: bool) {
        *self.fail_increment.lock().unwrap() = fail;
    }
}

impl ScoreStore for MemoryScoreStore {
    fn get(&self, agent_id: u64, address: IpAddr) -> Result<u64, StoreError> {
        Ok(self
            .scores
            .lock()
            .unwrap()
            .get(&(agent_id, address))
            .copied()
            .unwrap_or(0))
    }

    fn increment(&self, agent_id: u64, address: IpAddr) -> Result<(), StoreError> {
        if *self.fail_increment.lock().unwrap() {
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        *self
            .scores
            .lock()
            .unwrap()
            .entry((agent_id, address))
            .or_default() += 1;
        Ok(())
    }
}
