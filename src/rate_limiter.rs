//! Per-tenant token bucket admission control.
//!
//! Buckets are created lazily and kept in a bounded map; when the map is full
//! the tenant that was admitted into it first is evicted.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub rate: f64,
    pub burst: u32,
    pub max_tenants: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
            max_tenants: 10_000,
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(burst: u32) -> Self {
        Self {
            tokens: f64::from(burst),
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self, rate: f64, burst: u32) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(f64::from(burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct Buckets {
    by_tenant: HashMap<String, Arc<Mutex<TokenBucket>>>,
    insertion_order: VecDeque<String>,
}

pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: RwLock<Buckets>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: RwLock::new(Buckets::default()),
        }
    }

    pub fn allow(&self, tenant_id: &str) -> bool {
        let bucket = self.bucket_for(tenant_id);
        let allowed = bucket.lock().try_take(self.config.rate, self.config.burst);

        if !allowed {
            debug!(tenant_id, "Rate limit exceeded");
        }

        allowed
    }

    pub fn tenant_count(&self) -> usize {
        self.buckets.read().by_tenant.len()
    }

    fn bucket_for(&self, tenant_id: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.read().by_tenant.get(tenant_id) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();

        // Another caller may have created it between the two locks.
        if let Some(bucket) = buckets.by_tenant.get(tenant_id) {
            return Arc::clone(bucket);
        }

        while buckets.by_tenant.len() >= self.config.max_tenants.max(1) {
            let Some(oldest) = buckets.insertion_order.pop_front() else {
                break;
            };
            buckets.by_tenant.remove(&oldest);
            debug!(tenant_id = %oldest, "Evicted rate limiter bucket");
        }

        let bucket = Arc::new(Mutex::new(TokenBucket::full(self.config.burst)));
        buckets
            .by_tenant
            .insert(tenant_id.to_string(), Arc::clone(&bucket));
        buckets.insertion_order.push_back(tenant_id.to_string());

        bucket
    }
}
