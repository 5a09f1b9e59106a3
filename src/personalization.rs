//! Per-user emission CPT overrides
//!
//! A learned model (trained offline from posterior/evidence pairs) can
//! replace one or more emission tables for a user. The loader is a
//! read-through cache with a short TTL; any load or parse failure silently
//! falls back to the global defaults and never reaches the orchestrator.

use crate::tables::LikelihoodRow;
use crate::types::{State, PROB_FLOOR, STATE_COUNT};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// Maximum age of a cached personalization entry.
pub const PERSONALIZATION_TTL: Duration = Duration::from_secs(600);

/// Cache capacity; the stalest entry is evicted beyond this.
const CACHE_MAX_ENTRIES: usize = 1024;

/// Stored payload shape: `{"version": ..., "emission_cpt": {var: {cat: {state: prob}}}}`.
#[derive(Debug, Deserialize)]
struct StoredModel {
    #[serde(default)]
    version: Option<String>,
    emission_cpt: HashMap<String, HashMap<String, HashMap<State, f64>>>,
}

/// Parsed per-user override of one or more emission tables.
#[derive(Debug, Clone)]
pub struct PersonalizedCpt {
    pub version: Option<String>,
    tables: HashMap<String, HashMap<String, LikelihoodRow>>,
}

impl PersonalizedCpt {
    /// Parse a stored model payload. Missing state cells are floored rather
    /// than zeroed so an override can never annihilate a posterior.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let stored: StoredModel = serde_json::from_str(json)?;
        let mut tables = HashMap::new();
        for (variable, categories) in stored.emission_cpt {
            let mut rows = HashMap::new();
            for (category, cells) in categories {
                let mut row = [PROB_FLOOR; STATE_COUNT];
                for (state, prob) in cells {
                    row[state.index()] = prob.max(PROB_FLOOR);
                }
                rows.insert(category, row);
            }
            tables.insert(variable, rows);
        }
        Ok(PersonalizedCpt {
            version: stored.version,
            tables,
        })
    }

    /// Override row for a variable/category pair, if present.
    pub fn row(&self, variable: &str, category: &str) -> Option<&LikelihoodRow> {
        self.tables.get(variable)?.get(category)
    }

    /// Variables this model overrides.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Durable store for personalization payloads, keyed by user id.
pub trait PersonalizationStore: Send + Sync {
    fn load_json(&self, user_id: &str) -> Option<String>;
}

/// In-memory store used by tests and the CLI.
#[derive(Default)]
pub struct InMemoryPersonalizationStore {
    payloads: RwLock<HashMap<String, String>>,
}

impl InMemoryPersonalizationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, user_id: &str, json: &str) {
        self.payloads
            .write()
            .expect("personalization store lock poisoned")
            .insert(user_id.to_string(), json.to_string());
    }
}

impl PersonalizationStore for InMemoryPersonalizationStore {
    fn load_json(&self, user_id: &str) -> Option<String> {
        self.payloads
            .read()
            .expect("personalization store lock poisoned")
            .get(user_id)
            .cloned()
    }
}

struct CacheEntry {
    loaded_at: Instant,
    model: Option<Arc<PersonalizedCpt>>,
}

/// Read-through cache over a [`PersonalizationStore`].
pub struct PersonalizationLoader {
    store: Arc<dyn PersonalizationStore>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl PersonalizationLoader {
    pub fn new(store: Arc<dyn PersonalizationStore>) -> Self {
        Self::with_ttl(store, PERSONALIZATION_TTL)
    }

    pub fn with_ttl(store: Arc<dyn PersonalizationStore>, ttl: Duration) -> Self {
        PersonalizationLoader {
            store,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Model for a user, or None (meaning: use the global defaults). Parse
    /// failures are logged at info level and cached as absent so a corrupt
    /// payload is not re-parsed on every request.
    pub fn load(&self, user_id: &str) -> Option<Arc<PersonalizedCpt>> {
        {
            let cache = self.cache.read().expect("personalization cache lock poisoned");
            if let Some(entry) = cache.get(user_id) {
                if entry.loaded_at.elapsed() < self.ttl {
                    return entry.model.clone();
                }
            }
        }

        let model = self.store.load_json(user_id).and_then(|json| {
            match PersonalizedCpt::from_json(&json) {
                Ok(model) => Some(Arc::new(model)),
                Err(err) => {
                    tracing::info!(user_id, %err, "personalized CPT unreadable, using defaults");
                    None
                }
            }
        });

        let mut cache = self.cache.write().expect("personalization cache lock poisoned");
        if cache.len() >= CACHE_MAX_ENTRIES && !cache.contains_key(user_id) {
            if let Some(stalest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.loaded_at)
                .map(|(key, _)| key.clone())
            {
                cache.remove(&stalest);
            }
        }
        cache.insert(
            user_id.to_string(),
            CacheEntry {
                loaded_at: Instant::now(),
                model: model.clone(),
            },
        );
        model
    }

    /// Drop a user's cached entry (e.g. after a `baseline_updated` event).
    pub fn invalidate(&self, user_id: &str) {
        self.cache
            .write()
            .expect("personalization cache lock poisoned")
            .remove(user_id);
    }
}
