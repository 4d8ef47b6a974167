use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use knock_proto::carrier::Captured;
use knock_proto::{NonceGuard, TokenVerifier};
use tracing::{debug, info, warn};

use crate::admission::AdmissionEngine;
use crate::firewall::{FirewallBackend, FirewallController};
use crate::logging::client_label;
use crate::rate_limit::RateLimiter;
use crate::store::ScoreStore;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Event {
    Packet(Captured),
    Shutdown,
}

/// Outcome of one accepted knock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub agent_id: u64,
    pub address: IpAddr,
    pub ttl_minutes: u32,
    pub installed: bool,
}

/// Single-threaded loop: verify, admit, open, then bump trust.
pub struct Orchestrator<B: FirewallBackend, S: ScoreStore> {
    verifier: TokenVerifier,
    nonces: NonceGuard,
    admission: AdmissionEngine<S>,
    firewall: FirewallController<B>,
    scores: Arc<S>,
    ports: BTreeSet<u16>,
    limiter: RateLimiter,
    obfuscate_ip: bool,
}

impl<B: FirewallBackend, S: ScoreStore> Orchestrator<B, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: TokenVerifier,
        nonces: NonceGuard,
        admission: AdmissionEngine<S>,
        firewall: FirewallController<B>,
        scores: Arc<S>,
        ports: BTreeSet<u16>,
        limiter: RateLimiter,
        obfuscate_ip: bool,
    ) -> Self {
        Self {
            verifier,
            nonces,
            admission,
            firewall,
            scores,
            ports,
            limiter,
            obfuscate_ip,
        }
    }

    /// Processes events until shutdown or until every sender is gone, then
    /// removes the rules this process installed.
    pub fn run(mut self, events: Receiver<Event>) {
        let mut last_maintenance = Instant::now();
        loop {
            match events.recv_timeout(MAINTENANCE_INTERVAL) {
                Ok(Event::Packet(captured)) => {
                    if let Some(grant) = self.handle(&captured) {
                        info!(
                            client_ip = %client_label(grant.address, self.obfuscate_ip),
                            agent_id = grant.agent_id,
                            decision = "allow",
                            ttl_minutes = grant.ttl_minutes,
                            installed = grant.installed,
                            "knock accepted"
                        );
                    }
                }
                Ok(Event::Shutdown) => {
                    info!("shutdown requested");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    info!("packet source closed, shutting down");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
            let now = Instant::now();
            if now.duration_since(last_maintenance) >= MAINTENANCE_INTERVAL {
                self.limiter.prune(now);
                last_maintenance = now;
            }
        }
        self.firewall.cleanup();
    }

    /// Handles one captured knock. Invalid knocks yield `None` and leave no
    /// trace beyond a debug line.
    pub fn handle(&mut self, captured: &Captured) -> Option<Grant> {
        let address = captured.source;
        let label = client_label(address, self.obfuscate_ip);
        if !self.limiter.allow(address) {
            debug!(client_ip = %label, decision = "drop", reason = "rate_limited");
            return None;
        }

        let verified = self
            .verifier
            .verify(captured.token.as_bytes(), &self.nonces)?;
        let agent_id = verified.agent_id;
        let ttl_minutes = self.admission.next(agent_id, address);

        let installed = match self.firewall.add(address, &self.ports, ttl_minutes) {
            Ok(()) => true,
            Err(err) => {
                warn!(client_ip = %label, agent_id, error = %err, "failed to add firewall rule");
                false
            }
        };

        // Trust tracks proof of the key, not firewall success.
        if let Err(err) = self.scores.increment(agent_id, address) {
            warn!(client_ip = %label, agent_id, error = %err, "failed to increment score");
        }

        Some(Grant {
            agent_id,
            address,
            ttl_minutes,
            installed,
        })
    }
}
