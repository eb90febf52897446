use std::collections::HashMap;

/// Entries idle longer than this are dropped once the map needs pruning.
pub const IDLE_EVICT_MS: u64 = 5 * 60 * 1000;

/// Map size beyond which an access triggers a prune pass.
pub const PRUNE_THRESHOLD: usize = 1_024;

/// Shape of one token bucket family.
#[derive(Debug, Clone, Copy)]
pub struct BucketPolicy {
    pub burst: f64,
    pub refill_per_sec: f64,
}

/// Policy for session-token minting: burst of 3, one token back every
/// five seconds.
pub const MINT_POLICY: BucketPolicy = BucketPolicy {
    burst: 3.0,
    refill_per_sec: 0.2,
};

/// Policy for socket upgrade attempts; same shape, separate buckets.
pub const UPGRADE_POLICY: BucketPolicy = BucketPolicy {
    burst: 3.0,
    refill_per_sec: 0.2,
};

#[derive(Debug, Clone)]
struct RateBucket {
    tokens: f64,
    last_refill_ms: u64,
}

/// Per-key token buckets with opportunistic pruning: bounded-memory,
/// approximate LRU. Owned explicitly by the gateway state and threaded
/// through the request path; there is no ambient singleton.
pub struct RateBucketStore {
    policy: BucketPolicy,
    prune_threshold: usize,
    buckets: HashMap<String, RateBucket>,
}

impl RateBucketStore {
    pub fn new(policy: BucketPolicy) -> Self {
        Self::with_prune_threshold(policy, PRUNE_THRESHOLD)
    }

    pub fn with_prune_threshold(policy: BucketPolicy, prune_threshold: usize) -> Self {
        Self {
            policy,
            prune_threshold,
            buckets: HashMap::new(),
        }
    }

    /// Takes one token for `key`, refilling by elapsed time first.
    /// Returns false when the bucket is empty.
    pub fn allow(&mut self, key: &str, now_ms: u64) -> bool {
        self.prune_if_needed(now_ms);

        let bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert(RateBucket {
                tokens: self.policy.burst,
                last_refill_ms: now_ms,
            });

        let elapsed_sec = now_ms.saturating_sub(bucket.last_refill_ms) as f64 / 1000.0;
        bucket.tokens =
            (bucket.tokens + elapsed_sec * self.policy.refill_per_sec).min(self.policy.burst);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn prune_if_needed(&mut self, now_ms: u64) {
        if self.buckets.len() <= self.prune_threshold {
            return;
        }
        self.buckets
            .retain(|_, bucket| now_ms.saturating_sub(bucket.last_refill_ms) < IDLE_EVICT_MS);
    }
}
