//! Idempotency keys for the stateless-nonce wallet
//!
//! A key packs the absolute expiry time (high 32 bits) and a sequence number
//! (low 32 bits). The ledger contract refuses a second execution of the same
//! key and forgets keys once their expiry has passed, which bounds how long a
//! transfer can stay pending.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Default validity window in seconds
pub const DEFAULT_TIMEOUT_SECS: u32 = 3600;

/// Source of the current UNIX time
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> u32;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u32 {
        chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
    }
}

/// Clock frozen at a given instant, for reproducible keys
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u32);

impl Clock for FixedClock {
    fn now_unix(&self) -> u32 {
        self.0
    }
}

/// 64-bit idempotency key: `expires_at << 32 | sequence`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdempotencyKey(u64);

impl IdempotencyKey {
    pub fn new(expires_at: u32, sequence: u32) -> Self {
        Self(((expires_at as u64) << 32) | sequence as u64)
    }

    /// Build a key expiring `timeout` seconds after `clock`'s current time.
    ///
    /// With `sequence == None` a uniformly random 32-bit sequence is drawn
    /// from `rng`; the same clock reading, timeout and sequence always yield
    /// the same key.
    pub fn generate<R: RngCore + ?Sized>(
        clock: &dyn Clock,
        rng: &mut R,
        timeout: Option<u32>,
        sequence: Option<u32>,
    ) -> Self {
        let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let sequence = sequence.unwrap_or_else(|| rng.next_u32());
        Self::new(clock.now_unix().saturating_add(timeout), sequence)
    }

    /// Key from its 64-bit wire form
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    /// 64-bit wire form: expiry in the high half, sequence in the low half
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Absolute UNIX time after which the ledger forgets this key
    pub fn expires_at(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn sequence(self) -> u32 {
        self.0 as u32
    }

    /// Whether the validity window has elapsed at `now`
    pub fn is_expired(self, now: u32) -> bool {
        now > self.expires_at()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.expires_at(), self.sequence())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn test_layout() {
        let key = IdempotencyKey::new(1_700_003_600, 42);
        assert_eq!(key.as_u64(), (1_700_003_600u64 << 32) | 42);
        assert_eq!(key.expires_at(), 1_700_003_600);
        assert_eq!(key.sequence(), 42);
        assert_eq!(IdempotencyKey::from_u64(key.as_u64()), key);
    }

    #[test]
    fn test_default_timeout() {
        let clock = FixedClock(1_000);
        let mut rng = StdRng::seed_from_u64(1);
        let key = IdempotencyKey::generate(&clock, &mut rng, None, Some(5));
        assert_eq!(key.expires_at(), 1_000 + DEFAULT_TIMEOUT_SECS);
        assert_eq!(key.sequence(), 5);
    }

    #[test]
    fn test_reproducible() {
        let clock = FixedClock(1_700_000_000);
        let mut rng = StdRng::seed_from_u64(1);
        let a = IdempotencyKey::generate(&clock, &mut rng, Some(60), Some(9));
        let b = IdempotencyKey::generate(&clock, &mut rng, Some(60), Some(9));
        assert_eq!(a, b);

        let mut rng_a = StdRng::seed_from_u64(77);
        let mut rng_b = StdRng::seed_from_u64(77);
        assert_eq!(
            IdempotencyKey::generate(&clock, &mut rng_a, None, None),
            IdempotencyKey::generate(&clock, &mut rng_b, None, None)
        );
    }

    #[test]
    fn test_injective_in_sequence() {
        let clock = FixedClock(1_700_000_000);
        let mut rng = StdRng::seed_from_u64(3);
        let keys: HashSet<_> = (0..1000u32)
            .map(|seq| IdempotencyKey::generate(&clock, &mut rng, Some(120), Some(seq)))
            .collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_expiry_check() {
        let key = IdempotencyKey::new(100, 0);
        assert!(!key.is_expired(100));
        assert!(key.is_expired(101));
        assert_eq!(key.to_string(), "100:0");
    }
}
