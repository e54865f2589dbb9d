//! Keyed collection of breakers, one per dependency name.
//!
//! Lazily creates a breaker on first use from a template configuration.
//! Creation is race-free the same way this codebase's in-memory health
//! check registry is: an optimistic lookup under a read lock, and only on a
//! miss does a writer re-check under the write lock before inserting, so two
//! callers racing on the same fresh key never construct two breakers.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use crate::breaker::{CircuitBreaker, Clock, Config, Stats, SystemClock};
use crate::metrics::{MetricsSink, NoopMetricsSink};

/// Owns one [`CircuitBreaker`] per dependency key for the registry's
/// lifetime. Not on the data path itself — callers fetch a breaker once (or
/// cache the `Arc`) and then call its methods directly.
pub struct BreakerRegistry {
    template: Config,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// A registry with a no-op metrics sink and the real system clock,
    /// creating breakers from `template` on first use of each key.
    pub fn new(template: Config) -> Self {
        Self::with_metrics(template, Arc::new(NoopMetricsSink))
    }

    /// As [`BreakerRegistry::new`], with an explicit metrics sink shared by
    /// every breaker this registry creates.
    pub fn with_metrics(template: Config, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            template,
            clock: Arc::new(SystemClock),
            metrics,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the breaker for `key`, creating one from the registry's
    /// template configuration if this is the first use of `key`.
    pub async fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(key) {
            return existing.clone();
        }
        let template = self.template.clone();
        self.get_or_create(key, template).await
    }

    /// As [`BreakerRegistry::get`], but with a per-key configuration used
    /// only if `key` has not been created yet. Re-configuring an existing
    /// breaker is not supported; callers needing distinct policies for the
    /// same logical dependency must use distinct keys.
    pub async fn get_or_create(&self, key: &str, config: Config) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().await.get(key) {
            return existing.clone();
        }
        let mut guard = self.breakers.write().await;
        if let Some(existing) = guard.get(key) {
            return existing.clone();
        }
        let breaker = CircuitBreaker::with_clock_and_metrics(
            key,
            config,
            self.clock.clone(),
            self.metrics.clone(),
        );
        guard.insert(key.to_string(), breaker.clone());
        breaker
    }

    /// A point-in-time list of `(key, stats)` pairs for bulk reporting.
    pub async fn snapshot(&self) -> Vec<(String, Stats)> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.stats()))
            .collect()
    }

    /// Number of breakers created so far.
    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    /// Whether no breaker has been created yet.
    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }

    /// Closes every breaker this registry has created, draining their
    /// outstanding state-change deliveries concurrently.
    pub async fn close(&self) {
        let breakers: Vec<_> = self.breakers.read().await.values().cloned().collect();
        join_all(breakers.iter().map(|b| b.close())).await;
    }
}
