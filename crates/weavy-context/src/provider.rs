//! Context provider registry.
//!
//! Widgets find their context through the provider host they are nested in.
//! Contexts register under their provider name, and all contexts on a page
//! share one portal root for overlays, which lives while any context does.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use tracing::trace;

use crate::lock;

#[derive(Debug, Default)]
struct Registry {
    providers: HashMap<String, Vec<String>>,
    portal_refs: usize,
}

/// Provider attachments and the shared portal root refcount.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    inner: Mutex<Registry>,
}

static REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static ProviderRegistry {
    REGISTRY.get_or_init(ProviderRegistry::default)
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, provider: &str, context_id: &str) {
        let mut registry = lock(&self.inner);
        let contexts = registry.providers.entry(provider.to_string()).or_default();
        if !contexts.iter().any(|id| id == context_id) {
            contexts.push(context_id.to_string());
        }
        trace!(provider, context_id, "context attached to provider");
    }

    /// Returns `false` if the context was not attached.
    pub fn detach(&self, provider: &str, context_id: &str) -> bool {
        let mut registry = lock(&self.inner);
        let Some(contexts) = registry.providers.get_mut(provider) else {
            return false;
        };
        let before = contexts.len();
        contexts.retain(|id| id != context_id);
        let removed = contexts.len() != before;
        if contexts.is_empty() {
            registry.providers.remove(provider);
        }
        removed
    }

    /// Contexts attached to `provider`, oldest first.
    pub fn contexts(&self, provider: &str) -> Vec<String> {
        lock(&self.inner)
            .providers
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Takes a reference on the portal root. Returns `true` when it was created.
    pub fn acquire_portal_root(&self) -> bool {
        let mut registry = lock(&self.inner);
        registry.portal_refs += 1;
        registry.portal_refs == 1
    }

    /// Drops a reference. Returns `true` when the root was removed.
    pub fn release_portal_root(&self) -> bool {
        let mut registry = lock(&self.inner);
        match registry.portal_refs {
            0 => false,
            refs => {
                registry.portal_refs = refs - 1;
                registry.portal_refs == 0
            }
        }
    }

    pub fn has_portal_root(&self) -> bool {
        lock(&self.inner).portal_refs > 0
    }
}
