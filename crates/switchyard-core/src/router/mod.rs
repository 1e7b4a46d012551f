//! Provider router: picks the model for each model call.
//!
//! Selection order is: the request's model hint, then the persisted
//! preference, then the catalog by descending priority. A candidate is
//! only taken when the [`UsageLedger`] can reserve a request slot for it,
//! i.e. it is not soft-blacklisted and is under its rpm/tpm/rpd limits.
//! When every candidate is soft-blacklisted the router degrades to the one
//! whose blacklist ends soonest instead of failing the request. A model over
//! a numeric limit is never handed out; if that is all that is left,
//! selection fails with [`RouterError::RateLimited`].

pub mod ledger;
pub mod state;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use ledger::UsageLedger;
use state::{RouterState, StateError, StateStore};

/// Static catalog entry for a routable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub provider: String,
    /// Requests per minute.
    pub rpm: u32,
    /// Tokens per minute.
    pub tpm: u64,
    /// Requests per day.
    pub rpd: u32,
    #[serde(default, alias = "priority")]
    pub priority_score: i32,
}

impl ModelDescriptor {
    pub fn new(id: &str, provider: &str, rpm: u32, tpm: u64, rpd: u32, priority_score: i32) -> Self {
        Self {
            id: id.to_string(),
            provider: provider.to_string(),
            rpm,
            tpm,
            rpd,
            priority_score,
        }
    }
}

/// The outcome of [`ProviderRouter::select`].
#[derive(Debug, Clone)]
pub struct Selection {
    pub model: ModelDescriptor,
    /// Set when every candidate was blacklisted; holds how long until this
    /// one's blacklist ends.
    pub degraded: Option<Duration>,
}

impl Selection {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

/// Per-model view used by status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub model: ModelDescriptor,
    pub available: bool,
    pub req_this_minute: u32,
    pub tok_this_minute: u64,
    pub req_today: u32,
    pub blacklisted_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("the model catalog is empty")]
    EmptyCatalog,

    #[error("model '{0}' is not in the catalog")]
    UnknownModel(String),

    #[error("every model is at its rate limit, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error(transparent)]
    State(#[from] StateError),
}

pub struct ProviderRouter {
    /// Sorted by descending priority; ties keep config order.
    catalog: Vec<ModelDescriptor>,
    ledger: Arc<UsageLedger>,
    store: StateStore,
}

impl ProviderRouter {
    pub fn new(catalog: Vec<ModelDescriptor>, ledger: Arc<UsageLedger>, store: StateStore) -> Self {
        let mut catalog = catalog;
        catalog.sort_by(|a, b| b.priority_score.cmp(&a.priority_score));
        Self {
            catalog,
            ledger,
            store,
        }
    }

    pub fn catalog(&self) -> &[ModelDescriptor] {
        &self.catalog
    }

    pub fn model(&self, id: &str) -> Option<&ModelDescriptor> {
        self.catalog.iter().find(|m| m.id == id)
    }

    /// Pick a model for the next call and reserve a request slot on it.
    pub fn select(&self, preferred: Option<&str>) -> Result<Selection, RouterError> {
        self.select_at(preferred, Utc::now())
    }

    pub fn select_at(
        &self,
        preferred: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Selection, RouterError> {
        if self.catalog.is_empty() {
            return Err(RouterError::EmptyCatalog);
        }

        let candidates = self.candidates(preferred);

        if let Some(i) = self.ledger.reserve_first_at(&candidates, now) {
            let model = candidates[i].clone();
            debug!(model = %model.id, provider = %model.provider, "Selected model");
            return Ok(Selection {
                model,
                degraded: None,
            });
        }

        // Every candidate is blacklisted or over a limit.
        let degraded = self
            .ledger
            .reserve_degraded_at(&candidates, now)
            .map_err(|retry_after| {
                warn!(retry_secs = retry_after.as_secs(), "Every model is over its limits");
                RouterError::RateLimited { retry_after }
            })?;
        let model = candidates[degraded.index].clone();
        warn!(
            model = %model.id,
            wait_secs = degraded.wait.as_secs(),
            "Every model is blacklisted, degrading to the one that frees up soonest"
        );
        Ok(Selection {
            model,
            degraded: Some(degraded.wait),
        })
    }

    /// Candidate order: hint, persisted preference, then catalog priority.
    fn candidates(&self, preferred: Option<&str>) -> Vec<&ModelDescriptor> {
        let persisted = self.preference();
        let mut ordered: Vec<&ModelDescriptor> = Vec::with_capacity(self.catalog.len());

        let hinted = preferred.and_then(|id| {
            let found = self.model(id);
            if found.is_none() {
                debug!(model = id, "Model hint not in catalog, ignoring");
            }
            found
        });

        for m in hinted
            .into_iter()
            .chain(self.model(&persisted.model_id))
            .chain(self.catalog.iter())
        {
            if !ordered.iter().any(|o| o.id == m.id) {
                ordered.push(m);
            }
        }
        ordered
    }

    /// Account tokens for a finished call (success or failure).
    pub fn record(&self, model_id: &str, tokens_used: u64) {
        self.ledger.record_tokens(model_id, tokens_used, true);
    }

    /// React to a failed call: rate limits blacklist with backoff, an
    /// unavailable model sits out the initial backoff.
    pub fn record_failure(&self, model_id: &str, kind: ErrorKind, retry_after: Option<Duration>) {
        self.record_failure_at(model_id, kind, retry_after, Utc::now());
    }

    pub fn record_failure_at(
        &self,
        model_id: &str,
        kind: ErrorKind,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) {
        self.ledger.record_tokens_at(model_id, 0, false, now);
        match kind {
            ErrorKind::RateLimitExceeded => {
                self.ledger.record_violation_at(model_id, retry_after, now);
            }
            ErrorKind::ModelUnavailable => {
                let duration = self.ledger.backoff().initial;
                self.ledger.blacklist_for_at(model_id, duration, now);
            }
            _ => {}
        }
    }

    /// Whether a catalog model could take a request right now.
    pub fn is_available(&self, model_id: &str) -> bool {
        self.model(model_id)
            .is_some_and(|m| self.ledger.is_available(m))
    }

    /// The persisted preference, validated against the catalog.
    pub fn preference(&self) -> RouterState {
        let state = self.store.load();
        match self.model(&state.model_id) {
            Some(m) if m.provider == state.provider => state,
            Some(m) => RouterState::new(&m.provider, &m.id),
            None => {
                let defaults = self.store.defaults();
                if self.model(&defaults.model_id).is_some() {
                    defaults.clone()
                } else {
                    // Catalog is sorted, so the head is the best default.
                    self.catalog
                        .first()
                        .map(|m| RouterState::new(&m.provider, &m.id))
                        .unwrap_or_else(|| defaults.clone())
                }
            }
        }
    }

    /// Explicitly switch the preferred model and persist it.
    pub fn set_preference(&self, model_id: &str) -> Result<RouterState, RouterError> {
        let model = self
            .model(model_id)
            .ok_or_else(|| RouterError::UnknownModel(model_id.to_string()))?;
        let state = RouterState::new(&model.provider, &model.id);
        self.store.save(&state)?;
        info!(provider = %state.provider, model = %state.model_id, "Preferred model updated");
        Ok(state)
    }

    /// Usage and availability for every catalog model.
    pub fn snapshot(&self) -> Vec<ModelStatus> {
        let now = Utc::now();
        self.catalog
            .iter()
            .map(|m| {
                let record = self.ledger.record_at(&m.id, now);
                ModelStatus {
                    model: m.clone(),
                    available: self.ledger.is_available_at(m, now),
                    req_this_minute: record.req_this_minute,
                    tok_this_minute: record.tok_this_minute,
                    req_today: record.req_today,
                    blacklisted_until: record.blacklisted_until,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn catalog() -> Vec<ModelDescriptor> {
        vec![
            ModelDescriptor::new("small", "groq", 30, 100_000, 1_000, 10),
            ModelDescriptor::new("large", "groq", 2, 100_000, 1_000, 90),
            ModelDescriptor::new("remote", "openrouter", 30, 100_000, 1_000, 50),
        ]
    }

    fn router_in(dir: &std::path::Path) -> ProviderRouter {
        let store = StateStore::new(
            dir.join("state.json"),
            RouterState::new("groq", "large"),
            Duration::ZERO,
        );
        ProviderRouter::new(catalog(), Arc::new(UsageLedger::default()), store)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_selects_by_priority() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        assert_eq!(router.catalog()[0].id, "large");
        let sel = router.select_at(None, t0()).unwrap();
        assert_eq!(sel.model.id, "large");
        assert!(!sel.is_degraded());
    }

    #[test]
    fn test_honours_eligible_hint() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        let sel = router.select_at(Some("remote"), t0()).unwrap();
        assert_eq!(sel.model.id, "remote");

        // Unknown hints fall through to the normal order.
        let sel = router.select_at(Some("nope"), t0()).unwrap();
        assert_eq!(sel.model.id, "large");
    }

    #[test]
    fn test_falls_back_when_rpm_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        let now = t0();
        assert_eq!(router.select_at(None, now).unwrap().model.id, "large");
        assert_eq!(router.select_at(None, now).unwrap().model.id, "large");
        // rpm = 2, next best is "remote".
        assert_eq!(router.select_at(None, now).unwrap().model.id, "remote");
    }

    #[test]
    fn test_blacklisted_model_never_selected() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        let now = t0();
        router.record_failure_at("large", ErrorKind::RateLimitExceeded, None, now);

        for _ in 0..20 {
            let sel = router.select_at(Some("large"), now).unwrap();
            assert_ne!(sel.model.id, "large");
        }
    }

    #[test]
    fn test_all_blacklisted_degrades_to_soonest() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        let now = t0();
        router.record_failure_at("large", ErrorKind::RateLimitExceeded, Some(Duration::from_secs(900)), now);
        router.record_failure_at("remote", ErrorKind::RateLimitExceeded, Some(Duration::from_secs(300)), now);
        router.record_failure_at("small", ErrorKind::ModelUnavailable, None, now);

        let sel = router.select_at(None, now).unwrap();
        assert_eq!(sel.model.id, "small");
        assert_eq!(sel.degraded, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_over_limit_models_are_never_handed_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(
            dir.path().join("state.json"),
            RouterState::new("p", "only"),
            Duration::ZERO,
        );
        let router = ProviderRouter::new(
            vec![ModelDescriptor::new("only", "p", 2, 1_000_000, 1_000, 0)],
            Arc::new(UsageLedger::default()),
            store,
        );
        let now = t0();

        assert!(router.select_at(None, now).is_ok());
        assert!(router.select_at(None, now).is_ok());
        for _ in 0..4 {
            match router.select_at(None, now + chrono::Duration::seconds(15)) {
                Err(RouterError::RateLimited { retry_after }) => {
                    assert_eq!(retry_after, Duration::from_secs(45));
                }
                other => panic!("expected RateLimited, got {:?}", other.map(|s| s.model.id)),
            }
        }
        assert!(router.select_at(None, now + chrono::Duration::seconds(60)).is_ok());
    }

    #[test]
    fn test_other_failures_do_not_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        router.record_failure("large", ErrorKind::AuthenticationError, None);
        assert!(router.is_available("large"));
        assert!(!router.is_available("unknown-model"));
    }

    #[test]
    fn test_preference_persists_and_steers_selection() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        let state = router.set_preference("remote").unwrap();
        assert_eq!(state, RouterState::new("openrouter", "remote"));

        let restarted = router_in(dir.path());
        assert_eq!(restarted.preference(), state);
        assert_eq!(restarted.select_at(None, t0()).unwrap().model.id, "remote");
    }

    #[test]
    fn test_unknown_preference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let router = router_in(dir.path());
        assert!(matches!(
            router.set_preference("ghost"),
            Err(RouterError::UnknownModel(_))
        ));
    }

    #[test]
    fn test_stale_preference_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("state.json"),
            r#"{"provider": "groq", "modelId": "retired-model"}"#,
        )
        .unwrap();
        let router = router_in(dir.path());
        assert_eq!(router.preference(), RouterState::new("groq", "large"));
    }

    #[test]
    fn test_empty_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(
            dir.path().join("state.json"),
            RouterState::new("groq", "x"),
            Duration::ZERO,
        );
        let router = ProviderRouter::new(Vec::new(), Arc::new(UsageLedger::default()), store);
        assert!(matches!(router.select(None), Err(RouterError::EmptyCatalog)));
    }

    #[test]
    fn test_concurrent_selections_never_exceed_rpm() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(
            dir.path().join("state.json"),
            RouterState::new("p", "only"),
            Duration::from_secs(60),
        );
        let router = Arc::new(ProviderRouter::new(
            vec![ModelDescriptor::new("only", "p", 5, 1_000_000, 1_000, 0)],
            Arc::new(UsageLedger::default()),
            store,
        ));
        let now = t0();

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || router.select_at(None, now).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 5);
    }
}
