//! Byte rate limiting
//!
//! Two process-lifetime [`RateGroup`]s (inbound and outbound) throttle all
//! connections attached to them using token buckets measured in bytes. Group
//! configuration can be replaced at runtime; the swap is atomic with respect
//! to existing members. A connection may additionally carry its own override
//! bucket, which is consumed before the group bucket.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tracing::warn;

use crate::config::{RateLimit, RATE_LIMIT_MAX};

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A single-direction token bucket measured in bytes
pub struct ByteBucket {
    limiter: Limiter,
    burst: u32,
}

impl std::fmt::Debug for ByteBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBucket")
            .field("burst", &self.burst)
            .finish_non_exhaustive()
    }
}

impl ByteBucket {
    /// Build a bucket for `rate` bytes/sec with `burst` bytes of headroom
    ///
    /// Returns `None` when `rate` is [`RATE_LIMIT_MAX`] (no throttling).
    #[must_use]
    pub fn new(rate: u32, burst: u32) -> Option<Self> {
        if rate == RATE_LIMIT_MAX {
            return None;
        }
        let rate = NonZeroU32::new(rate.max(1)).expect("clamped above zero");
        let burst_nz = NonZeroU32::new(burst.max(1)).expect("clamped above zero");
        let quota = Quota::per_second(rate).allow_burst(burst_nz);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            burst: burst_nz.get(),
        })
    }

    /// Wait until `n` bytes of budget are available, then consume them
    ///
    /// Amounts above the burst size are paid in burst-sized installments.
    pub async fn pay(&self, n: usize) {
        let mut remaining = n as u64;
        while remaining > 0 {
            let take = remaining.min(u64::from(self.burst)) as u32;
            let take = NonZeroU32::new(take).expect("loop guard keeps take non-zero");
            if self.limiter.until_n_ready(take).await.is_err() {
                // Unreachable while take <= burst; fail open rather than stall
                warn!(bytes = take.get(), "rate bucket cannot cover chunk");
                return;
            }
            remaining -= u64::from(take.get());
        }
    }
}

/// A runtime-swappable single-direction bucket
#[derive(Debug, Default)]
struct SwapBucket {
    bucket: RwLock<Option<Arc<ByteBucket>>>,
}

impl SwapBucket {
    fn new(rate: u32, burst: u32) -> Self {
        Self {
            bucket: RwLock::new(ByteBucket::new(rate, burst).map(Arc::new)),
        }
    }

    fn replace(&self, rate: u32, burst: u32) {
        *self.bucket.write() = ByteBucket::new(rate, burst).map(Arc::new);
    }

    fn current(&self) -> Option<Arc<ByteBucket>> {
        self.bucket.read().clone()
    }

    async fn pay(&self, n: usize) {
        if let Some(bucket) = self.current() {
            bucket.pay(n).await;
        }
    }
}

/// Shared token buckets for one traffic direction group
///
/// Exactly two exist at runtime: one for inbound connections, one for
/// outbound. Every established connection pays into its group's buckets for
/// each read and write.
#[derive(Debug)]
pub struct RateGroup {
    read: SwapBucket,
    write: SwapBucket,
    swap_lock: parking_lot::Mutex<()>,
}

impl RateGroup {
    /// Create a group that does not throttle
    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(&RateLimit::unlimited())
    }

    /// Create a group from a limit descriptor
    #[must_use]
    pub fn new(limit: &RateLimit) -> Self {
        Self {
            read: SwapBucket::new(limit.max_read_rate, limit.max_read_burst),
            write: SwapBucket::new(limit.max_write_rate, limit.max_write_burst),
            swap_lock: parking_lot::Mutex::new(()),
        }
    }

    /// Replace the group configuration
    ///
    /// Existing members keep the old buckets until the swap completes; no
    /// member observes a half-replaced configuration.
    pub fn replace(&self, limit: &RateLimit) {
        let _guard = self.swap_lock.lock();
        self.read.replace(limit.max_read_rate, limit.max_read_burst);
        self.write.replace(limit.max_write_rate, limit.max_write_burst);
    }

    /// Consume read budget
    pub async fn pay_read(&self, n: usize) {
        self.read.pay(n).await;
    }

    /// Consume write budget
    pub async fn pay_write(&self, n: usize) {
        self.write.pay(n).await;
    }
}

/// Per-connection view of rate limiting
///
/// Composes an optional per-connection override in front of the shared group:
/// the override bucket is consumed first, then the group bucket. Without an
/// override only group tokens are consumed.
#[derive(Debug)]
pub struct ConnRate {
    group: Arc<RateGroup>,
    own_read: RwLock<Option<Arc<ByteBucket>>>,
    own_write: RwLock<Option<Arc<ByteBucket>>>,
}

impl ConnRate {
    /// Attach a connection to its direction group
    #[must_use]
    pub fn new(group: Arc<RateGroup>) -> Self {
        Self {
            group,
            own_read: RwLock::new(None),
            own_write: RwLock::new(None),
        }
    }

    /// Install or replace this connection's override
    pub fn set_override(&self, limit: &RateLimit) {
        *self.own_read.write() =
            ByteBucket::new(limit.max_read_rate, limit.max_read_burst).map(Arc::new);
        *self.own_write.write() =
            ByteBucket::new(limit.max_write_rate, limit.max_write_burst).map(Arc::new);
    }

    /// Consume read budget: override first, then the group
    pub async fn pay_read(&self, n: usize) {
        let own = self.own_read.read().clone();
        if let Some(bucket) = own {
            bucket.pay(n).await;
        }
        self.group.pay_read(n).await;
    }

    /// Consume write budget: override first, then the group
    pub async fn pay_write(&self, n: usize) {
        let own = self.own_write.read().clone();
        if let Some(bucket) = own {
            bucket.pay(n).await;
        }
        self.group.pay_write(n).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_unlimited_rate_has_no_bucket() {
        assert!(ByteBucket::new(RATE_LIMIT_MAX, RATE_LIMIT_MAX).is_none());
        assert!(ByteBucket::new(1024, 2048).is_some());
    }

    #[test]
    fn test_zero_rate_clamped() {
        // Zero rate must not panic; it is clamped to one byte per second
        let bucket = ByteBucket::new(0, 0).unwrap();
        assert_eq!(bucket.burst, 1);
    }

    #[tokio::test]
    async fn test_burst_paid_without_delay() {
        let bucket = ByteBucket::new(1024, 4096).unwrap();
        timeout(Duration::from_millis(100), bucket.pay(4096))
            .await
            .expect("burst-sized payment should not block");
    }

    #[tokio::test]
    async fn test_exhausted_bucket_blocks() {
        let bucket = ByteBucket::new(1024, 1024).unwrap();
        bucket.pay(1024).await;

        // The bucket is drained; another payment must wait for refill
        let blocked = timeout(Duration::from_millis(50), bucket.pay(512)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_group_replace_takes_effect() {
        let group = RateGroup::unlimited();
        timeout(Duration::from_millis(100), group.pay_read(1 << 20))
            .await
            .expect("unlimited group should not block");

        group.replace(&RateLimit {
            max_read_rate: 1024,
            max_read_burst: 1024,
            max_write_rate: RATE_LIMIT_MAX,
            max_write_burst: RATE_LIMIT_MAX,
        });

        group.pay_read(1024).await;
        let blocked = timeout(Duration::from_millis(50), group.pay_read(1024)).await;
        assert!(blocked.is_err(), "swapped-in read limit should throttle");

        // Writes stayed unlimited
        timeout(Duration::from_millis(100), group.pay_write(1 << 20))
            .await
            .expect("write direction should be untouched");
    }

    #[tokio::test]
    async fn test_conn_override_composes_with_group() {
        let group = Arc::new(RateGroup::unlimited());
        let conn = ConnRate::new(Arc::clone(&group));

        // No override: group only, unlimited
        timeout(Duration::from_millis(100), conn.pay_read(1 << 20))
            .await
            .expect("no override, unlimited group");

        conn.set_override(&RateLimit {
            max_read_rate: 512,
            max_read_burst: 512,
            max_write_rate: RATE_LIMIT_MAX,
            max_write_burst: RATE_LIMIT_MAX,
        });

        conn.pay_read(512).await;
        let blocked = timeout(Duration::from_millis(50), conn.pay_read(512)).await;
        assert!(blocked.is_err(), "override should throttle this connection");
    }
}
