// crates/ponte-server/src/llm/circuit_breaker.rs
// Circuit breaker for model load sequences — tracks failures per model and
// temporarily rejects ensure-active attempts for models that keep failing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// How many failures within the tracking window before we trip the circuit.
const FAILURE_THRESHOLD: u32 = 5;

/// Window in which failures are counted. Failures older than this are ignored.
const FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// How long a tripped circuit stays open before allowing a single probe.
const COOLDOWN: Duration = Duration::from_secs(60);

/// Circuit state for a single model.
#[derive(Debug, Clone)]
enum State {
    /// Normal operation — tracking recent failures.
    Closed { failures: Vec<Instant> },
    /// Tripped — all requests are rejected until cooldown expires.
    Open { tripped_at: Instant },
    /// Cooldown expired — allow exactly one probe request.
    HalfOpen,
}

impl Default for State {
    fn default() -> Self {
        Self::Closed {
            failures: Vec::new(),
        }
    }
}

/// Thread-safe circuit breaker keyed by model identifier.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    states: Arc<Mutex<HashMap<String, State>>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check whether a load sequence may run for this model.
    ///
    /// Returns `true` if the circuit is Closed or transitions to HalfOpen
    /// (allowing a single probe). Returns `false` while Open and cooling off.
    pub fn is_available(&self, model: &str) -> bool {
        let Ok(mut states) = self.states.lock() else {
            return true; // If mutex is poisoned, allow the request
        };
        let state = states.entry(model.to_string()).or_default();

        match state {
            State::Closed { .. } => true,
            State::Open { tripped_at } => {
                if tripped_at.elapsed() >= COOLDOWN {
                    info!(model, "Circuit half-open, allowing probe load");
                    *state = State::HalfOpen;
                    true
                } else {
                    false
                }
            }
            State::HalfOpen => {
                // A probe is already in flight. Block additional callers
                // until the probe resolves.
                false
            }
        }
    }

    /// Record a successful activation — resets the circuit to Closed.
    pub fn record_success(&self, model: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(model.to_string()).or_default();

        let was_half_open = matches!(state, State::HalfOpen);
        *state = State::Closed {
            failures: Vec::new(),
        };

        if was_half_open {
            info!(model, "Circuit recovered (half-open probe succeeded)");
        }
    }

    /// Record a failed activation — may trip the circuit.
    pub fn record_failure(&self, model: &str) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        let state = states.entry(model.to_string()).or_default();
        let now = Instant::now();

        match state {
            State::Closed { failures } => {
                failures.push(now);
                failures.retain(|t| now.duration_since(*t) < FAILURE_WINDOW);

                if failures.len() as u32 >= FAILURE_THRESHOLD {
                    warn!(
                        model,
                        failures = failures.len(),
                        "Circuit tripped — loads rejected for {}s",
                        COOLDOWN.as_secs()
                    );
                    *state = State::Open { tripped_at: now };
                }
            }
            State::HalfOpen => {
                warn!(model, "Half-open probe failed — circuit re-tripped");
                *state = State::Open { tripped_at: now };
            }
            State::Open { .. } => {}
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_model_is_available() {
        let cb = CircuitBreaker::new();
        assert!(cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_single_failure_does_not_trip() {
        let cb = CircuitBreaker::new();
        cb.record_failure("qwen2.5-7b");
        assert!(cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_threshold_failures_trips_circuit() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record_failure("qwen2.5-7b");
        }
        assert!(!cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD - 1 {
            cb.record_failure("qwen2.5-7b");
        }
        cb.record_success("qwen2.5-7b");
        cb.record_failure("qwen2.5-7b");
        assert!(cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_independent_models() {
        let cb = CircuitBreaker::new();
        for _ in 0..FAILURE_THRESHOLD {
            cb.record_failure("qwen2.5-7b");
        }
        assert!(!cb.is_available("qwen2.5-7b"));
        assert!(cb.is_available("llama-3.2-3b"));
    }

    #[test]
    fn test_open_circuit_transitions_to_half_open_after_cooldown() {
        let cb = CircuitBreaker::new();

        {
            let mut states = cb.states.lock().unwrap();
            states.insert(
                "qwen2.5-7b".to_string(),
                State::Open {
                    tripped_at: Instant::now() - COOLDOWN - Duration::from_secs(1),
                },
            );
        }

        assert!(cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_half_open_success_closes_circuit() {
        let cb = CircuitBreaker::new();

        {
            let mut states = cb.states.lock().unwrap();
            states.insert("qwen2.5-7b".to_string(), State::HalfOpen);
        }

        cb.record_success("qwen2.5-7b");
        assert!(cb.is_available("qwen2.5-7b"));
    }

    #[test]
    fn test_half_open_failure_retrips_circuit() {
        let cb = CircuitBreaker::new();

        {
            let mut states = cb.states.lock().unwrap();
            states.insert("qwen2.5-7b".to_string(), State::HalfOpen);
        }

        cb.record_failure("qwen2.5-7b");
        assert!(!cb.is_available("qwen2.5-7b"));
    }
}
