//! Per-resource concurrent-in-flight admission control.
//!
//! Counters live in the store layer so admission is linearizable across
//! instances sharing a distributed store. Every admitted request
//! registers exactly one decrement on the exchange's completion hooks; a
//! TTL on the counter keys lets crashed instances free their share.

use std::env;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::{ConcurrencyLimit, RequestMatcher, ResponseConfig};
use crate::exchange::ResponseState;
use crate::store::{Store, StoreFactory};

const COUNTER_STORE: &str = "ratelimiter";
const DEFAULT_TTL_SECS: u64 = 300;

pub struct RateLimiter {
    store: Store,
}

impl RateLimiter {
    /// Counter TTL comes from `IMPOSTER_RATE_LIMITER_TTL` (seconds,
    /// default 300).
    pub fn from_env(factory: &StoreFactory) -> Self {
        let ttl = env::var("IMPOSTER_RATE_LIMITER_TTL")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::new(factory, Duration::from_secs(ttl))
    }

    pub fn new(factory: &StoreFactory, ttl: Duration) -> Self {
        Self {
            store: factory.open(COUNTER_STORE).with_counter_ttl(Some(ttl)),
        }
    }

    /// Attempt to admit a request. `None` admits (and, when limits are
    /// configured, registers the paired decrement on `state`);
    /// `Some(response)` rejects with the configured response.
    pub fn check(
        &self,
        counter_key: &str,
        limits: &[ConcurrencyLimit],
        state: &mut ResponseState,
    ) -> Option<ResponseConfig> {
        if limits.is_empty() {
            return None;
        }

        let in_flight = match self.store.atomic_inc(counter_key, 1) {
            Ok(count) => count,
            Err(e) => {
                // No counter was actually incremented: admit without a
                // decrement.
                warn!("rate limiter failing open for {}: {}", counter_key, e);
                return None;
            }
        };

        // Highest threshold strictly exceeded selects the response.
        let mut sorted: Vec<&ConcurrencyLimit> = limits.iter().collect();
        sorted.sort_by_key(|limit| limit.limit);
        let breached = sorted
            .into_iter()
            .rev()
            .find(|limit| in_flight > limit.limit);

        if let Some(limit) = breached {
            debug!(
                "rate limiting {}: {} in flight exceeds limit {}",
                counter_key, in_flight, limit.limit
            );
            if let Err(e) = self.store.atomic_dec(counter_key, 1) {
                warn!("rate limiter rollback failed for {}: {}", counter_key, e);
            }
            return Some(limit.response.clone());
        }

        let store = self.store.clone();
        let key = counter_key.to_owned();
        state.on_complete(move || {
            if let Err(e) = store.atomic_dec(&key, 1) {
                warn!("rate limiter decrement failed for {}: {}", key, e);
            }
        });
        None
    }
}

/// Deterministic counter key for a resource: method, resource name and a
/// hash of the matcher's distinguishing fields, so resources sharing
/// method/name but differing criteria count separately.
pub fn resource_key(method: &str, name: &str, matcher: &RequestMatcher) -> String {
    let mut hasher = Sha256::new();
    for (key, condition) in &matcher.request_headers {
        hasher.update(format!("h:{}={:?}:{:?};", key, condition.operator, condition.value));
    }
    for (key, condition) in &matcher.query_params {
        hasher.update(format!("q:{}={:?}:{:?};", key, condition.operator, condition.value));
    }
    for (key, condition) in &matcher.form_params {
        hasher.update(format!("f:{}={:?}:{:?};", key, condition.operator, condition.value));
    }
    if let Some(body) = &matcher.request_body {
        let mut predicates: Vec<_> = body.all_of.iter().chain(&body.any_of).collect();
        predicates.push(&body.single);
        for predicate in predicates {
            hasher.update(format!(
                "b:{:?}:{:?}:{:?}:{:?};",
                predicate.json_path, predicate.x_path, predicate.operator, predicate.value
            ));
        }
    }
    if let Some(action) = &matcher.soap_action {
        hasher.update(format!("a:{};", action));
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}:{}", method, name, &digest[..12])
}
