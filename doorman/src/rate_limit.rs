use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

// Simple per-source token bucket, checked before any crypto work
pub struct RateLimiter {
    buckets: HashMap<IpAddr, (u32, Instant)>,
    pps: u32,
    burst: u32,
}

impl RateLimiter {
    pub fn new(pps: u32, burst: u32) -> Self {
        Self {
            buckets: HashMap::new(),
            pps,
            burst,
        }
    }

    pub fn allow(&mut self, ip: IpAddr) -> bool {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let bucket = self.buckets.entry(ip).or_insert((self.burst, now));
        let elapsed = now.saturating_duration_since(bucket.1).as_secs_f64();
        let refill = (elapsed * f64::from(self.pps)) as u32;
        // Only move the clock forward once a whole token has accrued.
        if refill > 0 {
            bucket.0 = bucket.0.saturating_add(refill).min(self.burst);
            bucket.1 = now;
        }
        if bucket.0 == 0 {
            return false;
        }
        bucket.0 -= 1;
        true
    }

    /// Forgets sources idle long enough to have refilled completely.
    pub fn prune(&mut self, now: Instant) {
        let full_after = Duration::from_secs_f64(f64::from(self.burst) / f64::from(self.pps.max(1)));
        self.buckets
            .retain(|_, (_, last)| now.saturating_duration_since(*last) <= full_after);
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const A: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
    const B: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));

    #[test]
    fn burst_then_refill() {
        let mut rl = RateLimiter::new(2, 3);
        let t0 = Instant::now();
        assert!(rl.allow_at(A, t0));
        assert!(rl.allow_at(A, t0));
        assert!(rl.allow_at(A, t0));
        assert!(!rl.allow_at(A, t0));
        // other sources are unaffected
        assert!(rl.allow_at(B, t0));

        assert!(rl.allow_at(A, t0 + Duration::from_millis(500)));
        assert!(!rl.allow_at(A, t0 + Duration::from_millis(500)));
    }

    #[test]
    fn slow_trickle_is_not_starved() {
        let mut rl = RateLimiter::new(1, 1);
        let t0 = Instant::now();
        assert!(rl.allow_at(A, t0));
        assert!(!rl.allow_at(A, t0 + Duration::from_millis(400)));
        assert!(!rl.allow_at(A, t0 + Duration::from_millis(800)));
        assert!(rl.allow_at(A, t0 + Duration::from_millis(1000)));
    }

    #[test]
    fn prune_drops_idle_sources() {
        let mut rl = RateLimiter::new(10, 20);
        let t0 = Instant::now();
        rl.allow_at(A, t0);
        rl.allow_at(B, t0 + Duration::from_secs(5));
        rl.prune(t0 + Duration::from_secs(6));
        assert_eq!(rl.tracked(), 1);
    }
}
