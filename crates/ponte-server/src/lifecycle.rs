// crates/ponte-server/src/lifecycle.rs
// Model lifecycle manager - ensures the target model is active at the
// runtime before any request. The runtime auto-unloads idle models, and a
// model that is present but idle fails requests; the only reliable
// reactivation path is unload-then-load.

use crate::error::{PonteError, Result};
use crate::llm::{CircuitBreaker, ModelInfo, ModelRuntime, ModelStatus};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default model TTL passed to load commands. Never unbounded.
pub const DEFAULT_MODEL_TTL_SECS: u64 = 600;
/// Cache entries older than this are stale and force a re-query.
const CACHE_WINDOW: Duration = Duration::from_secs(60);
/// Attempts of the full ensure sequence before giving up.
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between ensure attempts (doubles, jittered 0.5x-1.0x).
const ATTEMPT_BASE_BACKOFF: Duration = Duration::from_secs(1);
/// Wait before re-querying a model reported as `loading`.
const LOADING_RECHECK: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    status: ModelStatus,
    observed_at: Instant,
}

/// Process-wide manager. Shared across queries; everything mutable sits
/// behind a lock, and concurrent ensures for the same model are single-flight.
pub struct ModelLifecycle {
    runtime: Arc<dyn ModelRuntime>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Per-model locks so at most one load sequence runs per identifier.
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Identifiers seen in the most recent listing, for error messages.
    last_seen: Mutex<Vec<String>>,
    breaker: CircuitBreaker,
}

impl ModelLifecycle {
    pub fn new(runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            runtime,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            last_seen: Mutex::new(Vec::new()),
            breaker: CircuitBreaker::new(),
        }
    }

    /// Ensure `model` is active at the runtime, loading or reactivating it
    /// if necessary. `None`, the empty string, and the sentinel "default"
    /// succeed without contacting the runtime - the transport will use the
    /// runtime's default model.
    pub async fn ensure_active(&self, model: Option<&str>, ttl_secs: u64) -> Result<()> {
        let model = match model {
            Some(m) if !m.is_empty() && m != "default" => m,
            _ => return Ok(()),
        };

        // Advisory cache: an active sighting inside the window lets the
        // request proceed directly. Anything else forces a re-query.
        if self.cached_active(model) {
            debug!(model, "Lifecycle cache hit (active)");
            return Ok(());
        }

        if !self.breaker.is_available(model) {
            return Err(PonteError::ModelUnavailable {
                model: model.to_string(),
                reason: "repeated load failures, circuit open".into(),
                available: self.last_seen.lock().map(|v| v.clone()).unwrap_or_default(),
            });
        }

        let guard = self.flight_lock(model);
        let _held = guard.lock().await;

        // Someone else may have finished the sequence while we waited.
        if self.cached_active(model) {
            return Ok(());
        }

        let mut last_reason = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match self.ensure_once(model, ttl_secs).await {
                Ok(()) => {
                    self.breaker.record_success(model);
                    return Ok(());
                }
                Err(e) => {
                    last_reason = e.to_string();
                    self.breaker.record_failure(model);
                    warn!(model, attempt, error = %last_reason, "Model activation attempt failed");
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(attempt_backoff(attempt)).await;
                    }
                }
            }
        }

        Err(PonteError::ModelUnavailable {
            model: model.to_string(),
            reason: last_reason,
            available: self.last_seen.lock().map(|v| v.clone()).unwrap_or_default(),
        })
    }

    /// One pass of the activation sequence: query, act on the observed
    /// status, verify with a fresh listing.
    async fn ensure_once(&self, model: &str, ttl_secs: u64) -> Result<()> {
        let mut status = self.query_status(model).await?;

        if status == ModelStatus::Loading {
            debug!(model, "Model is loading, waiting briefly");
            tokio::time::sleep(LOADING_RECHECK).await;
            status = self.query_status(model).await?;
        }

        match status {
            ModelStatus::Active => return Ok(()),
            ModelStatus::Idle => {
                info!(model, "Model is idle, reactivating via unload+load");
                self.invalidate(model);
                self.runtime.unload_model(model).await?;
                self.runtime.load_model(model, ttl_secs).await?;
            }
            ModelStatus::Absent => {
                info!(model, ttl_secs, "Model not resident, loading");
                self.invalidate(model);
                self.runtime.load_model(model, ttl_secs).await?;
            }
            ModelStatus::Loading => {
                return Err(PonteError::ModelUnavailable {
                    model: model.to_string(),
                    reason: "still loading after recheck".into(),
                    available: self.last_seen.lock().map(|v| v.clone()).unwrap_or_default(),
                });
            }
        }

        // Post-load verification: the listing must now report active.
        let verified = self.query_status(model).await?;
        if verified == ModelStatus::Active {
            Ok(())
        } else {
            Err(PonteError::ModelUnavailable {
                model: model.to_string(),
                reason: format!("status is '{}' after load", verified),
                available: self.last_seen.lock().map(|v| v.clone()).unwrap_or_default(),
            })
        }
    }

    /// Query the runtime listing and refresh the cache for every entry.
    async fn query_status(&self, model: &str) -> Result<ModelStatus> {
        let listing = self.runtime.list_models().await?;
        self.absorb_listing(&listing);

        Ok(listing
            .iter()
            .find(|m| m.id == model)
            .map(|m| m.status)
            .unwrap_or(ModelStatus::Absent))
    }

    fn absorb_listing(&self, listing: &[ModelInfo]) {
        let now = Instant::now();
        if let Ok(mut cache) = self.cache.lock() {
            for info in listing {
                cache.insert(
                    info.id.clone(),
                    CacheEntry {
                        status: info.status,
                        observed_at: now,
                    },
                );
            }
        }
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = listing.iter().map(|m| m.id.clone()).collect();
        }
    }

    fn cached_active(&self, model: &str) -> bool {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(model).copied())
            .map(|entry| {
                entry.status == ModelStatus::Active && entry.observed_at.elapsed() < CACHE_WINDOW
            })
            .unwrap_or(false)
    }

    /// Drop the cache entry for a model. Called on load/unload and by the
    /// loop when the runtime reports model-not-found mid-query.
    pub fn invalidate(&self, model: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(model);
        }
    }

    /// Identifiers from the most recent listing (for status reporting).
    pub fn known_models(&self) -> Vec<String> {
        self.last_seen.lock().map(|v| v.clone()).unwrap_or_default()
    }

    fn flight_lock(&self, model: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn attempt_backoff(attempt: u32) -> Duration {
    let exp = ATTEMPT_BASE_BACKOFF.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter: f64 = rand::rng().random_range(0.5..=1.0);
    exp.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted runtime: each list_models call pops the next listing; load
    /// and unload calls are recorded in order.
    struct ScriptedRuntime {
        listings: Mutex<Vec<Vec<ModelInfo>>>,
        pub ops: Mutex<Vec<String>>,
        pub list_calls: AtomicUsize,
    }

    impl ScriptedRuntime {
        fn new(listings: Vec<Vec<ModelInfo>>) -> Self {
            Self {
                listings: Mutex::new(listings),
                ops: Mutex::new(Vec::new()),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    fn model(id: &str, status: ModelStatus) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            status,
        }
    }

    #[async_trait]
    impl ModelRuntime for ScriptedRuntime {
        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let mut listings = self.listings.lock().unwrap();
            if listings.len() > 1 {
                Ok(listings.remove(0))
            } else {
                Ok(listings.first().cloned().unwrap_or_default())
            }
        }

        async fn load_model(&self, model: &str, ttl_secs: u64) -> Result<()> {
            self.ops
                .lock()
                .unwrap()
                .push(format!("load:{}:{}", model, ttl_secs));
            Ok(())
        }

        async fn unload_model(&self, model: &str) -> Result<()> {
            self.ops.lock().unwrap().push(format!("unload:{}", model));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sentinels_skip_runtime() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(None, 600).await.unwrap();
        lifecycle.ensure_active(Some(""), 600).await.unwrap();
        lifecycle.ensure_active(Some("default"), 600).await.unwrap();

        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_already_active_model() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![vec![model(
            "qwen",
            ModelStatus::Active,
        )]]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();
        assert!(runtime.ops.lock().unwrap().is_empty());

        // Second call hits the cache, no further listing.
        let calls_before = runtime.list_calls.load(Ordering::SeqCst);
        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_idle_model_reactivated_via_unload_load() {
        // idle -> unload+load -> verification sees active
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![model("qwen", ModelStatus::Idle)],
            vec![model("qwen", ModelStatus::Active)],
        ]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();

        let ops = runtime.ops.lock().unwrap().clone();
        assert_eq!(ops, vec!["unload:qwen", "load:qwen:600"]);
    }

    #[tokio::test]
    async fn test_absent_model_loaded() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![model("other", ModelStatus::Active)],
            vec![
                model("other", ModelStatus::Active),
                model("qwen", ModelStatus::Active),
            ],
        ]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(Some("qwen"), 300).await.unwrap();

        let ops = runtime.ops.lock().unwrap().clone();
        assert_eq!(ops, vec!["load:qwen:300"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_model_fails_with_available_list() {
        // Model never appears; every listing shows only the others.
        let runtime = Arc::new(ScriptedRuntime::new(vec![vec![
            model("llama", ModelStatus::Active),
            model("phi", ModelStatus::Idle),
        ]]));
        let lifecycle = ModelLifecycle::new(runtime);

        let err = lifecycle
            .ensure_active(Some("ghost"), 600)
            .await
            .unwrap_err();

        match err {
            PonteError::ModelUnavailable {
                model, available, ..
            } => {
                assert_eq!(model, "ghost");
                assert!(available.contains(&"llama".to_string()));
                assert!(available.contains(&"phi".to_string()));
            }
            other => panic!("expected ModelUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_success_verified_active() {
        // Invariant: after a successful ensure, a fresh listing shows active.
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            vec![model("qwen", ModelStatus::Idle)],
            vec![model("qwen", ModelStatus::Active)],
        ]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();

        let listing = runtime.list_models().await.unwrap();
        assert_eq!(
            listing.iter().find(|m| m.id == "qwen").unwrap().status,
            ModelStatus::Active
        );
    }

    #[tokio::test]
    async fn test_invalidate_forces_requery() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![vec![model(
            "qwen",
            ModelStatus::Active,
        )]]));
        let lifecycle = ModelLifecycle::new(runtime.clone());

        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();
        let calls = runtime.list_calls.load(Ordering::SeqCst);

        lifecycle.invalidate("qwen");
        lifecycle.ensure_active(Some("qwen"), 600).await.unwrap();
        assert!(runtime.list_calls.load(Ordering::SeqCst) > calls);
    }
}
