//! Backend selection for the client dispatcher.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use log::{trace, warn};
use serde::Serialize;
use tokio::time::Instant;

/// Transport failures in a row before a backend is marked unhealthy.
const UNHEALTHY_AFTER: u64 = 3;

const NO_RTT: u64 = u64::MAX;

/// Strategy for picking the agent a request is sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancePolicy {
    /// Cycle through healthy agents in configuration order.
    #[default]
    RoundRobin,
    /// Prefer agents never timed yet, then the lowest last round-trip time.
    LowestLatency,
    Random,
}

/// Point-in-time statistics for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub agent: String,
    pub in_flight: u64,
    pub requests: u64,
    pub errors: u64,
    pub last_rtt: Option<Duration>,
    pub healthy: bool,
}

pub(crate) struct Backend {
    agent: String,
    in_flight: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU64,
    /// Microseconds; `NO_RTT` until the first completed call.
    last_rtt_us: AtomicU64,
    healthy: AtomicBool,
}

impl Backend {
    fn new(agent: String) -> Self {
        Self {
            agent,
            in_flight: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
            last_rtt_us: AtomicU64::new(NO_RTT),
            healthy: AtomicBool::new(true),
        }
    }

    pub(crate) fn agent(&self) -> &str {
        &self.agent
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn last_rtt(&self) -> Option<Duration> {
        match self.last_rtt_us.load(Ordering::Relaxed) {
            NO_RTT => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Starts timing one call.
    pub(crate) fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        InFlight {
            backend: self.clone(),
            started: Instant::now(),
        }
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            agent: self.agent.clone(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_rtt: self.last_rtt(),
            healthy: self.is_healthy(),
        }
    }
}

/// One call on a backend; dropping it without [`InFlight::finish`] (an
/// aborted request) only releases the in-flight count.
pub(crate) struct InFlight {
    backend: Arc<Backend>,
    started: Instant,
}

impl InFlight {
    /// Records the outcome. `transport_ok` is false when the agent could
    /// not be reached at all; errors returned by the agent still count as a
    /// healthy round trip.
    pub(crate) fn finish(self, transport_ok: bool) {
        let backend = &self.backend;
        if transport_ok {
            let rtt = self.started.elapsed();
            let us = u64::try_from(rtt.as_micros()).unwrap_or(NO_RTT - 1);
            backend.last_rtt_us.store(us, Ordering::Relaxed);
            backend.consecutive_errors.store(0, Ordering::Relaxed);
            if !backend.healthy.swap(true, Ordering::AcqRel) {
                warn!("agent {} is healthy again", backend.agent);
            }
            trace!("agent {} answered in {rtt:?}", backend.agent);
        } else {
            backend.errors.fetch_add(1, Ordering::Relaxed);
            let streak = backend.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= UNHEALTHY_AFTER && backend.healthy.swap(false, Ordering::AcqRel) {
                warn!("agent {} marked unhealthy after {streak} failures", backend.agent);
            }
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.backend.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The configured agents plus the selection policy.
pub(crate) struct Balancer {
    backends: Vec<Arc<Backend>>,
    policy: LoadBalancePolicy,
    next: AtomicUsize,
}

impl Balancer {
    pub(crate) fn new(agents: impl IntoIterator<Item = String>, policy: LoadBalancePolicy) -> Self {
        Self {
            backends: agents.into_iter().map(|a| Arc::new(Backend::new(a))).collect(),
            policy,
            next: AtomicUsize::new(0),
        }
    }

    /// Picks the backend for the next request.
    ///
    /// Unhealthy agents are skipped while any healthy one remains.
    pub(crate) fn pick(&self) -> Option<Arc<Backend>> {
        let healthy: Vec<&Arc<Backend>> = self.backends.iter().filter(|b| b.is_healthy()).collect();
        let candidates = if healthy.is_empty() {
            self.backends.iter().collect()
        } else {
            healthy
        };
        if candidates.is_empty() {
            return None;
        }
        let chosen = match self.policy {
            LoadBalancePolicy::RoundRobin => {
                let idx = self.next.fetch_add(1, Ordering::Relaxed);
                candidates[idx % candidates.len()]
            }
            LoadBalancePolicy::LowestLatency => {
                let untimed = candidates
                    .iter()
                    .filter(|b| b.last_rtt().is_none())
                    .min_by_key(|b| b.in_flight.load(Ordering::Relaxed));
                match untimed {
                    Some(backend) => *backend,
                    None => candidates
                        .iter()
                        .min_by_key(|b| (b.last_rtt(), b.in_flight.load(Ordering::Relaxed)))
                        .copied()?,
                }
            }
            LoadBalancePolicy::Random => {
                let idx = RandomState::new().build_hasher().finish() as usize % candidates.len();
                candidates[idx]
            }
        };
        Some(chosen.clone())
    }

    pub(crate) fn set_healthy(&self, agent: &str, healthy: bool) -> bool {
        match self.backends.iter().find(|b| b.agent == agent) {
            Some(backend) => {
                backend.healthy.store(healthy, Ordering::Release);
                if healthy {
                    backend.consecutive_errors.store(0, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }

    pub(crate) fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(policy: LoadBalancePolicy) -> Balancer {
        Balancer::new(["a", "b", "c"].map(String::from), policy)
    }

    fn picks(balancer: &Balancer, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| balancer.pick().unwrap().agent().to_string())
            .collect()
    }

    #[test]
    fn round_robin_cycles_in_order_and_skips_unhealthy() {
        let balancer = balancer(LoadBalancePolicy::RoundRobin);
        assert_eq!(picks(&balancer, 4), ["a", "b", "c", "a"]);

        balancer.set_healthy("b", false);
        let next = picks(&balancer, 4);
        assert!(!next.contains(&"b".to_string()));

        balancer.set_healthy("a", false);
        balancer.set_healthy("c", false);
        assert_eq!(picks(&balancer, 3).len(), 3, "all unhealthy falls back to everyone");
    }

    #[tokio::test(start_paused = true)]
    async fn lowest_latency_times_every_backend_first() {
        let balancer = balancer(LoadBalancePolicy::LowestLatency);
        for (agent, ms) in [("a", 50), ("b", 5), ("c", 20)] {
            let backend = balancer.pick().unwrap();
            assert_eq!(backend.agent(), agent);
            let call = backend.begin();
            tokio::time::advance(Duration::from_millis(ms)).await;
            call.finish(true);
        }
        assert_eq!(picks(&balancer, 3), ["b", "b", "b"]);
        let stats = balancer.stats();
        assert_eq!(stats[1].last_rtt, Some(Duration::from_millis(5)));
        assert!(stats.iter().all(|s| s.in_flight == 0 && s.requests == 1));
    }

    #[test]
    fn repeated_transport_failures_mark_a_backend_unhealthy() {
        let balancer = balancer(LoadBalancePolicy::RoundRobin);
        let backend = balancer.backends[0].clone();
        for _ in 0..UNHEALTHY_AFTER {
            backend.begin().finish(false);
        }
        assert!(!backend.is_healthy());
        assert_eq!(backend.stats().errors, UNHEALTHY_AFTER);
        backend.begin().finish(true);
        assert!(backend.is_healthy());
    }

    #[test]
    fn random_only_picks_configured_agents() {
        let balancer = balancer(LoadBalancePolicy::Random);
        for agent in picks(&balancer, 20) {
            assert!(["a", "b", "c"].contains(&agent.as_str()));
        }
        assert!(Balancer::new(Vec::new(), LoadBalancePolicy::Random).pick().is_none());
    }

    #[test]
    fn dropped_calls_release_in_flight() {
        let balancer = balancer(LoadBalancePolicy::RoundRobin);
        let backend = balancer.pick().unwrap();
        let call = backend.begin();
        assert_eq!(balancer.stats()[0].in_flight, 1);
        drop(call);
        assert_eq!(balancer.stats()[0].in_flight, 0);
    }
}
