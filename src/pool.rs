//! Legacy failover ordering: rank tunnels by recent success rate instead of strict rotation.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: usize = 20;
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
struct ProxyHealth {
    recent: VecDeque<bool>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl ProxyHealth {
    /// Untried proxies score 1.0 so they get a chance.
    fn score(&self) -> f64 {
        if self.recent.is_empty() {
            return 1.0;
        }
        let ok = self.recent.iter().filter(|s| **s).count();
        ok as f64 / self.recent.len() as f64
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHealthSnapshot {
    pub worker_id: String,
    pub score: f64,
    pub samples: usize,
    pub consecutive_failures: u32,
    pub cooling_down: bool,
}

pub struct HealthScoredPool {
    order: Vec<String>,
    window: usize,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<HashMap<String, ProxyHealth>>,
}

impl HealthScoredPool {
    pub fn new(worker_ids: impl IntoIterator<Item = String>) -> Self {
        Self::with_policy(
            worker_ids,
            DEFAULT_WINDOW,
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_COOLDOWN,
        )
    }

    pub fn with_policy(
        worker_ids: impl IntoIterator<Item = String>,
        window: usize,
        failure_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        let order: Vec<String> = worker_ids.into_iter().collect();
        let inner = order
            .iter()
            .map(|id| (id.clone(), ProxyHealth::default()))
            .collect();
        Self {
            order,
            window: window.max(1),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProxyHealth>> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("proxy pool lock poisoned; continuing with recovered state");
                poisoned.into_inner()
            }
        }
    }

    pub fn record_success(&self, worker_id: &str) {
        let mut guard = self.lock();
        let h = guard.entry(worker_id.to_string()).or_default();
        push_window(&mut h.recent, true, self.window);
        h.consecutive_failures = 0;
        h.cooldown_until = None;
    }

    pub fn record_failure(&self, worker_id: &str) {
        self.record_failure_at(worker_id, Instant::now());
    }

    fn record_failure_at(&self, worker_id: &str, now: Instant) {
        let mut guard = self.lock();
        let h = guard.entry(worker_id.to_string()).or_default();
        push_window(&mut h.recent, false, self.window);
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        if h.consecutive_failures >= self.failure_threshold {
            h.cooldown_until = Some(now + self.cooldown);
            tracing::debug!(
                worker = worker_id,
                failures = h.consecutive_failures,
                "proxy entered cooldown"
            );
        }
    }

    /// Worker ids best-first. Cooling-down proxies are still listed, last.
    pub fn ranked(&self) -> Vec<String> {
        self.ranked_at(Instant::now())
    }

    fn ranked_at(&self, now: Instant) -> Vec<String> {
        let guard = self.lock();
        let mut ids: Vec<(usize, &String)> = self.order.iter().enumerate().collect();
        let default = ProxyHealth::default();
        ids.sort_by(|(ia, a), (ib, b)| {
            let ha = guard.get(*a).unwrap_or(&default);
            let hb = guard.get(*b).unwrap_or(&default);
            ha.cooling_down(now)
                .cmp(&hb.cooling_down(now))
                .then(hb.score().total_cmp(&ha.score()))
                .then(ha.consecutive_failures.cmp(&hb.consecutive_failures))
                .then(ia.cmp(ib))
        });
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn snapshot(&self) -> Vec<ProxyHealthSnapshot> {
        let now = Instant::now();
        let guard = self.lock();
        self.order
            .iter()
            .map(|id| {
                let h = guard.get(id).cloned().unwrap_or_default();
                ProxyHealthSnapshot {
                    worker_id: id.clone(),
                    score: h.score(),
                    samples: h.recent.len(),
                    consecutive_failures: h.consecutive_failures,
                    cooling_down: h.cooling_down(now),
                }
            })
            .collect()
    }
}

fn push_window(buf: &mut VecDeque<bool>, v: bool, cap: usize) {
    while buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(v);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("worker-{i}")).collect()
    }

    #[test]
    fn untried_pool_keeps_configuration_order() {
        let pool = HealthScoredPool::new(ids(3));
        assert_eq!(pool.ranked(), ids(3));
    }

    #[test]
    fn higher_success_rate_ranks_first() {
        let pool = HealthScoredPool::new(ids(3));
        pool.record_success("worker-1");
        pool.record_failure("worker-1");
        pool.record_success("worker-3");
        pool.record_success("worker-3");
        // worker-2 untried (1.0), worker-3 1.0 with history, worker-1 0.5
        assert_eq!(pool.ranked(), vec!["worker-2", "worker-3", "worker-1"]);
    }

    #[test]
    fn consecutive_failures_trigger_cooldown_then_expire() {
        let pool =
            HealthScoredPool::with_policy(ids(2), 10, 2, Duration::from_secs(30));
        let now = Instant::now();
        pool.record_failure_at("worker-1", now);
        pool.record_failure_at("worker-1", now);
        pool.record_success("worker-2");
        pool.record_failure_at("worker-2", now);
        pool.record_failure_at("worker-2", now);
        pool.record_failure_at("worker-2", now);
        // Both cooling down; worker-2 has the better score.
        assert_eq!(pool.ranked_at(now), vec!["worker-2", "worker-1"]);

        pool.record_success("worker-1");
        assert_eq!(pool.ranked_at(now)[0], "worker-1");
        assert_eq!(
            pool.ranked_at(now + Duration::from_secs(31)),
            vec!["worker-1", "worker-2"]
        );
    }

    #[test]
    fn window_is_bounded() {
        let pool = HealthScoredPool::with_policy(ids(1), 4, 100, Duration::ZERO);
        for _ in 0..10 {
            pool.record_failure("worker-1");
        }
        for _ in 0..4 {
            pool.record_success("worker-1");
        }
        let snap = pool.snapshot();
        assert_eq!(snap[0].samples, 4);
        assert_eq!(snap[0].score, 1.0);
    }
}
