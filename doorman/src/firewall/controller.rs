use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use super::{FirewallBackend, FirewallError, FirewallRule};

/// Schedule key: deadline plus a tiebreaker so equal deadlines stay distinct.
type Slot = (Instant, u64);

/// Serializes backend commands for one address.
type OpLock = Arc<Mutex<()>>;

const MAX_RETRY: Duration = Duration::from_secs(30);

struct Active {
    rule: FirewallRule,
    slot: Slot,
}

#[derive(Default)]
struct State {
    active: HashMap<IpAddr, Active>,
    pending: BTreeMap<Slot, IpAddr>,
    ops: HashMap<IpAddr, OpLock>,
    next_seq: u64,
    stopping: bool,
}

impl State {
    /// Drops the address from both the active set and the schedule.
    fn forget(&mut self, address: IpAddr) -> Option<FirewallRule> {
        let active = self.active.remove(&address)?;
        self.pending.remove(&active.slot);
        Some(active.rule)
    }

    fn schedule(&mut self, rule: FirewallRule, deadline: Instant) {
        let slot = (deadline, self.next_seq);
        self.next_seq += 1;
        let address = rule.address;
        if let Some(previous) = self.active.insert(address, Active { rule, slot }) {
            self.pending.remove(&previous.slot);
        }
        self.pending.insert(slot, address);
    }
}

struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    retry: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `op` holding the address's operation lock, so grant, revoke and
    /// expiry for one address never interleave. The state lock is not held
    /// while waiting or while `op` runs.
    fn exclusive<R>(&self, address: IpAddr, op: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(self.lock().ops.entry(address).or_default());
        let result = {
            let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
            op()
        };
        drop(lock);

        let mut state = self.lock();
        let idle = state
            .ops
            .get(&address)
            .is_some_and(|l| Arc::strong_count(l) == 1);
        if idle && !state.active.contains_key(&address) {
            state.ops.remove(&address);
        }
        result
    }

    /// Keeps a rule whose removal failed tracked and tries again later.
    fn retry_later(&self, rule: FirewallRule) {
        let now = Instant::now();
        let deadline = now.checked_add(self.retry).unwrap_or(now);
        self.lock().schedule(rule, deadline);
        self.wake.notify_one();
    }
}

/// Grants, revokes and expires allow rules on top of one backend.
///
/// At most one rule per address is active: a repeated `add` for the same
/// address removes the old rule and its pending expiry before installing
/// the new one. Expiries are serviced by one worker thread. Backend commands
/// for the same address run one at a time; the internal state lock is never
/// held while a backend command runs. A rule whose removal fails stays
/// tracked and is retried.
pub struct FirewallController<B: FirewallBackend> {
    backend: Arc<B>,
    shared: Arc<Shared>,
    minute: Duration,
    worker: Option<JoinHandle<()>>,
}

impl<B: FirewallBackend> FirewallController<B> {
    pub fn new(backend: B) -> Result<Self, FirewallError> {
        Self::with_minute(backend, Duration::from_secs(60))
    }

    /// Controller whose TTL unit is `minute` instead of sixty seconds.
    pub fn with_minute(backend: B, minute: Duration) -> Result<Self, FirewallError> {
        let backend = Arc::new(backend);
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
            retry: minute.min(MAX_RETRY),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let backend = Arc::clone(&backend);
            thread::Builder::new()
                .name("firewall-expiry".into())
                .spawn(move || expire_loop(&shared, backend.as_ref()))
                .map_err(FirewallError::Worker)?
        };
        Ok(Self {
            backend,
            shared,
            minute,
            worker: Some(worker),
        })
    }

    /// Opens `ports` to `address` for `ttl_minutes`, replacing any rule the
    /// address already holds.
    pub fn add(
        &self,
        address: IpAddr,
        ports: &BTreeSet<u16>,
        ttl_minutes: u32,
    ) -> Result<(), FirewallError> {
        let lifetime = self
            .minute
            .checked_mul(ttl_minutes)
            .ok_or(FirewallError::Ttl(ttl_minutes))?;
        Instant::now()
            .checked_add(lifetime)
            .ok_or(FirewallError::Ttl(ttl_minutes))?;

        self.shared.exclusive(address, || {
            let mut leftover = None;
            if let Some(previous) = self.shared.lock().forget(address) {
                if let Err(err) = self.backend.revoke(address, &previous.ports) {
                    warn!(client_ip = %address, error = %err, "failed to remove previous rule");
                    leftover = Some(previous);
                }
            }

            let rule = FirewallRule {
                address,
                ports: ports.clone(),
                granted_at: SystemTime::now(),
                ttl_minutes,
            };
            if let Err(err) = self.backend.allow(&rule) {
                if let Some(previous) = leftover {
                    self.shared.retry_later(previous);
                }
                return Err(err);
            }

            // Checked above; the clock has moved by at most one command since.
            let now = Instant::now();
            let deadline = now.checked_add(lifetime).unwrap_or(now);
            self.shared.lock().schedule(rule, deadline);
            self.shared.wake.notify_one();
            info!(
                client_ip = %address,
                ports = ?ports,
                ttl_minutes,
                backend = self.backend.name(),
                "rule installed"
            );
            Ok(())
        })
    }

    /// Removes the address's rule now. Succeeds when nothing was installed.
    /// On failure a tracked rule stays tracked and its removal is retried.
    pub fn del(&self, address: IpAddr, ports: &BTreeSet<u16>) -> Result<(), FirewallError> {
        self.shared.exclusive(address, || {
            let tracked = self.shared.lock().forget(address);
            let result = self.backend.revoke(address, ports);
            if result.is_err() {
                if let Some(rule) = tracked {
                    self.shared.retry_later(rule);
                }
            }
            result
        })
    }

    /// Best-effort removal of every rule this controller installed.
    pub fn cleanup(&self) {
        let rules: Vec<(IpAddr, BTreeSet<u16>)> = self
            .shared
            .lock()
            .active
            .iter()
            .map(|(address, active)| (*address, active.rule.ports.clone()))
            .collect();
        info!(count = rules.len(), "removing managed firewall rules");
        for (address, ports) in rules {
            if let Err(err) = self.del(address, &ports) {
                warn!(client_ip = %address, error = %err, "cleanup failed for rule");
            }
        }
        let mut state = self.shared.lock();
        state.pending.clear();
        state.active.clear();
    }

    /// Addresses currently believed to hold a rule.
    #[cfg(test)]
    pub fn active_addresses(&self) -> Vec<IpAddr> {
        let mut addrs: Vec<IpAddr> = self.shared.lock().active.keys().copied().collect();
        addrs.sort();
        addrs
    }
}

impl<B: FirewallBackend> Drop for FirewallController<B> {
    fn drop(&mut self) {
        self.shared.lock().stopping = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn expire_loop<B: FirewallBackend>(shared: &Shared, backend: &B) {
    let mut state = shared.lock();
    loop {
        if state.stopping {
            break;
        }
        let now = Instant::now();
        let next = state.pending.first_key_value().map(|(slot, addr)| (*slot, *addr));
        match next {
            Some((slot, address)) if slot.0 <= now => {
                drop(state);
                shared.exclusive(address, || expire(shared, backend, address, slot));
                state = shared.lock();
            }
            Some((slot, _)) => {
                state = shared
                    .wake
                    .wait_timeout(state, slot.0 - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            }
            None => {
                state = shared
                    .wake
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// Revokes the rule behind `slot` unless a later grant or a manual revoke
/// superseded it while the worker waited for the address.
fn expire<B: FirewallBackend>(shared: &Shared, backend: &B, address: IpAddr, slot: Slot) {
    let rule = {
        let mut state = shared.lock();
        state.pending.remove(&slot);
        match state.active.get(&address) {
            Some(active) if active.slot == slot => active.rule.clone(),
            _ => return,
        }
    };

    let held_secs = rule.granted_at.elapsed().unwrap_or_default().as_secs();
    info!(
        client_ip = %address,
        ports = ?rule.ports,
        ttl_minutes = rule.ttl_minutes,
        held_secs,
        "TTL expired, removing rule"
    );
    match backend.revoke(address, &rule.ports) {
        Ok(()) => {
            let mut state = shared.lock();
            if state.active.get(&address).is_some_and(|a| a.slot == slot) {
                state.active.remove(&address);
            }
        }
        Err(err) => {
            warn!(client_ip = %address, error = %err, "failed to remove expired rule, will retry");
            shared.retry_later(rule);
        }
    }
}
