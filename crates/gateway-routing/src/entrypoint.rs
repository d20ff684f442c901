//! Model registry and provider selection.
//!
//! [`Entrypoints`] maps each logical model name to a [`ModelEntry`] holding
//! its provider pool. Reads happen on every request, writes only on
//! (re)configuration, so a single coarse `RwLock` guards the map.

use crate::selector::{ProviderSelector, RandomSelector};
use gateway_providers::Provider;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// The provider pool behind one logical model
#[derive(Debug, Clone, Default)]
pub struct ModelEntry {
    name: String,
    providers: Vec<Arc<Provider>>,
}

impl ModelEntry {
    /// Create an empty entry
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
        }
    }

    /// Model name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Providers in registration order
    #[must_use]
    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    /// Whether the pool is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Registry of model entries
pub struct Entrypoints {
    models: RwLock<HashMap<String, ModelEntry>>,
    selector: Arc<dyn ProviderSelector>,
}

impl Default for Entrypoints {
    fn default() -> Self {
        Self::new()
    }
}

impl Entrypoints {
    /// Registry with uniform random selection
    #[must_use]
    pub fn new() -> Self {
        Self::with_selector(Arc::new(RandomSelector))
    }

    /// Registry with a custom random source
    #[must_use]
    pub fn with_selector(selector: Arc<dyn ProviderSelector>) -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            selector,
        }
    }

    /// Create an empty entry; returns false if it already existed
    pub fn create_model_entry(&self, model: &str) -> bool {
        let mut models = self.models.write();
        if models.contains_key(model) {
            return false;
        }
        models.insert(model.to_string(), ModelEntry::new(model));
        true
    }

    /// Add a provider to the entry of its logical model, creating the entry
    ///
    /// Providers with a store id already present in the entry are ignored.
    pub fn add_provider(&self, provider: Arc<Provider>) {
        let model = provider.wrapper_name().to_string();
        let mut models = self.models.write();
        let entry = models
            .entry(model.clone())
            .or_insert_with(|| ModelEntry::new(&model));
        let duplicate = provider.id() != 0
            && entry.providers.iter().any(|p| p.id() == provider.id());
        if duplicate {
            debug!(model = %model, provider = %provider.describe(), "Provider already registered");
            return;
        }
        entry.providers.push(provider);
    }

    /// Replace the whole registry
    pub fn replace_all(&self, providers: impl IntoIterator<Item = Arc<Provider>>) {
        let mut next: HashMap<String, ModelEntry> = HashMap::new();
        for provider in providers {
            let model = provider.wrapper_name().to_string();
            next.entry(model.clone())
                .or_insert_with(|| ModelEntry::new(&model))
                .providers
                .push(provider);
        }
        let count: usize = next.values().map(|e| e.providers.len()).sum();
        *self.models.write() = next;
        info!(providers = count, "Provider registry replaced");
    }

    /// Whether the model has an entry (possibly empty)
    #[must_use]
    pub fn contains_model(&self, model: &str) -> bool {
        self.models.read().contains_key(model)
    }

    /// Snapshot of a model's providers
    #[must_use]
    pub fn providers(&self, model: &str) -> Vec<Arc<Provider>> {
        self.models
            .read()
            .get(model)
            .map(|e| e.providers.clone())
            .unwrap_or_default()
    }

    /// Number of providers behind a model
    #[must_use]
    pub fn pool_size(&self, model: &str) -> usize {
        self.models.read().get(model).map_or(0, |e| e.providers.len())
    }

    /// Uniformly random provider of a model; `None` for unknown or empty
    #[must_use]
    pub fn peek_provider(&self, model: &str) -> Option<Arc<Provider>> {
        self.peek_untried(model, &[])
    }

    /// Uniformly random provider not yet in `tried`
    #[must_use]
    pub fn peek_untried(&self, model: &str, tried: &[Arc<Provider>]) -> Option<Arc<Provider>> {
        let models = self.models.read();
        let entry = models.get(model)?;
        let candidates: Vec<&Arc<Provider>> = entry
            .providers
            .iter()
            .filter(|p| !tried.iter().any(|t| Arc::ptr_eq(t, p)))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = self.selector.pick(candidates.len());
        candidates.get(index).map(|p| Arc::clone(p))
    }

    /// Model names, sorted
    #[must_use]
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every provider across all models
    #[must_use]
    pub fn all_providers(&self) -> Vec<Arc<Provider>> {
        self.models
            .read()
            .values()
            .flat_map(|e| e.providers.iter().cloned())
            .collect()
    }
}
