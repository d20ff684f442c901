//! A configured upstream with its lazily built client.

use crate::registry::ClientRegistry;
use gateway_core::{AiClient, ClientOptions, GatewayResult, ProviderSpec};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One upstream endpoint/credential pair serving a logical model
pub struct Provider {
    id: i64,
    spec: ProviderSpec,
    client: Mutex<Option<Arc<dyn AiClient>>>,
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("provider", &self.spec.describe())
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Create a provider; `id` is the store identifier (0 when not persisted)
    #[must_use]
    pub fn new(id: i64, spec: ProviderSpec) -> Self {
        Self {
            id,
            spec,
            client: Mutex::new(None),
        }
    }

    /// Store identifier
    #[must_use]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Static description
    #[must_use]
    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    /// Logical model served
    #[must_use]
    pub fn wrapper_name(&self) -> &str {
        &self.spec.wrapper_name
    }

    /// Log-friendly description
    #[must_use]
    pub fn describe(&self) -> String {
        format!("#{} {}", self.id, self.spec.describe())
    }

    /// Get the cached client, building it on first use
    ///
    /// A failed build is not cached, so the next call retries.
    pub fn client(
        &self,
        registry: &ClientRegistry,
        timeout: Duration,
    ) -> GatewayResult<Arc<dyn AiClient>> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let options = ClientOptions::from_spec(&self.spec, timeout);
        let client = registry.build(&self.spec.type_name, &options)?;
        debug!(provider = %self.describe(), "Upstream client built");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drop the cached client so the next call rebuilds it
    pub fn reset_client(&self) {
        self.client.lock().take();
    }

    /// Whether a client is currently cached
    #[must_use]
    pub fn has_client(&self) -> bool {
        self.client.lock().is_some()
    }
}
