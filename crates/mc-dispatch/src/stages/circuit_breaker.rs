//! Circuit breaker stage
//!
//! One breaker per message type, tracked in a shared registry. Closed
//! passes through and counts consecutive failures; at the threshold the
//! breaker opens and calls fail fast with `CircuitOpen`. After the break
//! duration a single half-open probe is admitted: success closes the
//! breaker, failure re-opens it with a fresh timer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mc_common::{Envelope, MercuryError, ProcessingContext, ProcessingResult};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::pipeline::{Next, PipelineStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time to stay open before admitting a probe.
    pub break_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            break_duration: Duration::from_secs(60),
        }
    }
}

struct Breaker {
    name: String,
    state: RwLock<BreakerState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    /// Set while the single half-open probe is outstanding.
    probe_in_flight: AtomicBool,
    rejected: AtomicU32,
    config: CircuitBreakerConfig,
}

impl Breaker {
    fn new(name: String, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            state: RwLock::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            probe_in_flight: AtomicBool::new(false),
            rejected: AtomicU32::new(0),
            config,
        }
    }

    fn allow_request(&self) -> bool {
        let state = *self.state.read();
        match state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .read()
                    .map(|at| at.elapsed() >= self.config.break_duration)
                    .unwrap_or(true);
                if elapsed {
                    let mut state = self.state.write();
                    // Re-check under the write lock; a racing caller may
                    // have transitioned already.
                    if *state == BreakerState::Open {
                        *state = BreakerState::HalfOpen;
                        self.probe_in_flight.store(false, Ordering::SeqCst);
                        debug!(breaker = %self.name, "Circuit breaker half-open");
                    }
                    drop(state);
                    return self.claim_probe();
                }
                self.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
            BreakerState::HalfOpen => {
                let allowed = self.claim_probe();
                if !allowed {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                }
                allowed
            }
        }
    }

    /// At most one caller wins the half-open probe.
    fn claim_probe(&self) -> bool {
        self.probe_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn record_success(&self) {
        let state = *self.state.read();
        match state {
            BreakerState::HalfOpen => {
                *self.state.write() = BreakerState::Closed;
                *self.opened_at.write() = None;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.probe_in_flight.store(false, Ordering::SeqCst);
                info!(breaker = %self.name, "Circuit breaker closed after successful probe");
            }
            BreakerState::Closed => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            BreakerState::Closed => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.failure_threshold {
                    *self.state.write() = BreakerState::Open;
                    *self.opened_at.write() = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = count,
                        "Circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                *self.state.write() = BreakerState::Open;
                *self.opened_at.write() = Some(Instant::now());
                self.probe_in_flight.store(false, Ordering::SeqCst);
                warn!(breaker = %self.name, "Circuit breaker re-opened on failed probe");
            }
            BreakerState::Open => {}
        }
    }

    fn state(&self) -> BreakerState {
        *self.state.read()
    }
}

/// Shared per-key breaker registry.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
    config: CircuitBreakerConfig,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<Breaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(key) {
                return Arc::clone(breaker);
            }
        }
        let mut breakers = self.breakers.write();
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Breaker::new(key.to_string(), self.config.clone()))),
        )
    }

    pub fn state(&self, key: &str) -> Option<BreakerState> {
        self.breakers.read().get(key).map(|b| b.state())
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .read()
            .values()
            .filter(|b| b.state() == BreakerState::Open)
            .count()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

pub struct CircuitBreakerStage {
    registry: Arc<BreakerRegistry>,
}

impl CircuitBreakerStage {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PipelineStage for CircuitBreakerStage {
    fn name(&self) -> &'static str {
        "circuit_breaker"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        let breaker = self.registry.get_or_create(&envelope.message_type);

        if !breaker.allow_request() {
            metrics::counter!("mercury.breaker.rejected").increment(1);
            return ProcessingResult::failure(MercuryError::CircuitOpen(
                envelope.message_type.clone(),
            ));
        }

        let result = next.run(envelope, ctx).await;

        match &result {
            ProcessingResult::Success(_) => breaker.record_success(),
            // Cancellation says nothing about downstream health.
            ProcessingResult::Failure {
                error: MercuryError::Cancelled,
                ..
            } => {}
            ProcessingResult::Failure { .. } => breaker.record_failure(),
        }

        result
    }
}
