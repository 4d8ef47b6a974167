use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::store::ScoreStore;

/// Position of the highest set bit plus one; `bit_length(0) == 0`.
pub fn bit_length(n: u64) -> u32 {
    u64::BITS - n.leading_zeros()
}

/// Turns a trust score into a grant lifetime in minutes:
/// `base * 2^bit_length(score + 1)`, capped at `max`.
pub struct AdmissionEngine<S: ScoreStore> {
    base_ttl: u32,
    max_ttl: u32,
    scores: Arc<S>,
}

impl<S: ScoreStore> AdmissionEngine<S> {
    pub fn new(base_ttl: u32, max_ttl: u32, scores: Arc<S>) -> Self {
        Self {
            base_ttl,
            max_ttl: max_ttl.max(base_ttl),
            scores,
        }
    }

    /// TTL for the identity's next grant. A failing store read counts as a
    /// fresh identity.
    pub fn next(&self, agent_id: u64, address: IpAddr) -> u32 {
        let score = self.scores.get(agent_id, address).unwrap_or_else(|err| {
            warn!(agent_id, client_ip = %address, error = %err, "score lookup failed, using 0");
            0
        });
        self.ttl_for_score(score)
    }

    pub fn ttl_for_score(&self, score: u64) -> u32 {
        let factor = 1u64
            .checked_shl(bit_length(score.saturating_add(1)))
            .unwrap_or(u64::MAX);
        let ttl = u64::from(self.base_ttl)
            .saturating_mul(factor)
            .min(u64::from(self.max_ttl));
        u32::try_from(ttl).unwrap_or(self.max_ttl)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::store::StoreError;
    use crate::testing::MemoryScoreStore;

    fn engine(base: u32, max: u32) -> AdmissionEngine<MemoryScoreStore> {
        AdmissionEngine::new(base, max, Arc::new(MemoryScoreStore::default()))
    }

    #[test]
    fn bit_length_values() {
        assert_eq!(bit_length(0), 0);
        assert_eq!(bit_length(1), 1);
        assert_eq!(bit_length(4), 3);
        assert_eq!(bit_length(11), 4);
        assert_eq!(bit_length(u64::MAX), 64);
    }

    #[test]
    fn schedule_doubles_per_tier_and_caps() {
        let engine = engine(5, 60);
        assert_eq!(engine.ttl_for_score(0), 10);
        assert_eq!(engine.ttl_for_score(1), 20);
        assert_eq!(engine.ttl_for_score(2), 20);
        assert_eq!(engine.ttl_for_score(3), 40);
        assert_eq!(engine.ttl_for_score(10), 60);
        assert_eq!(engine.ttl_for_score(u64::MAX), 60);
    }

    #[test]
    fn schedule_stays_in_bounds_and_never_decreases() {
        let engine = engine(3, 1000);
        let mut last = 0;
        for score in 0..5000u64 {
            let ttl = engine.ttl_for_score(score);
            assert!((3..=1000).contains(&ttl));
            assert!(ttl >= last);
            last = ttl;
        }
    }

    #[test]
    fn next_reads_the_store() {
        let store = Arc::new(MemoryScoreStore::default());
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let engine = AdmissionEngine::new(5, 60, Arc::clone(&store));
        assert_eq!(engine.next(1, addr), 10);
        for _ in 0..3 {
            store.increment(1, addr).unwrap();
        }
        assert_eq!(engine.next(1, addr), 40);
        assert_eq!(engine.next(2, addr), 10);
    }

    #[test]
    fn store_failure_falls_back_to_fresh_identity() {
        struct Broken;
        impl ScoreStore for Broken {
            fn get(&self, _: u64, _: IpAddr) -> Result<u64, StoreError> {
                Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery))
            }
            fn increment(&self, _: u64, _: IpAddr) -> Result<(), StoreError> {
                Ok(())
            }
        }
        let engine = AdmissionEngine::new(1, 5, Arc::new(Broken));
        assert_eq!(engine.next(1, IpAddr::V4(Ipv4Addr::LOCALHOST)), 2);
    }
}
