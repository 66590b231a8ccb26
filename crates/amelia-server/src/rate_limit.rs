use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use tokio::sync::Mutex;

/// In-process token bucket, per `(ip, bucket)`. Protects `pair/generate`
/// and `pair/exchange` (§6.1) — the one piece of ambient infrastructure in
/// this crate with no corpus-grounded crate behind it, since none of the
/// reference repos pull in a rate-limiting dependency; a small hand-rolled
/// bucket is the pragmatic alternative to inventing a dependency.
pub struct RateLimiter {
    buckets: Mutex<HashMap<(IpAddr, &'static str), Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request is admitted, `false` if the bucket for
    /// `(ip, name)` is currently empty. `capacity` tokens refill linearly
    /// over one minute.
    pub async fn check(&self, ip: IpAddr, name: &'static str, capacity: u32) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry((ip, name)).or_insert_with(|| Bucket {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        let refill_rate = capacity as f64 / 60.0;
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(capacity as f64);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.check(ip, "pair_generate", 5).await);
        }
        assert!(!limiter.check(ip, "pair_generate", 5).await);
    }

    #[tokio::test]
    async fn separate_ips_get_independent_buckets() {
        let limiter = RateLimiter::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.check(a, "pair_generate", 5).await);
        }
        assert!(limiter.check(b, "pair_generate", 5).await);
    }

    #[tokio::test]
    async fn separate_bucket_names_are_independent_for_the_same_ip() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.check(ip, "pair_generate", 5).await);
        }
        assert!(limiter.check(ip, "pair_exchange", 10).await);
    }
}
