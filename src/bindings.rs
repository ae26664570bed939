// Backend binding registry
// Source of truth for which scrobbling services are bound, authenticated and enabled

use crate::config::Config;
use crate::scrobbler::lastfm::LastFmScrobbler;
use crate::scrobbler::listenbrainz::ListenBrainzScrobbler;
use crate::scrobbler::ScrobbleService;
use anyhow::Result;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Public view of one bound service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendBinding {
    pub service_id: String,
    pub authenticated: bool,
    pub enabled: bool,
}

/// Notification published whenever a binding changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    Bound(String),
    Unbound(String),
    Authenticated(String),
    Deauthenticated(String),
    /// A service rejected its credentials; the user must authenticate again
    ReauthenticationRequired(String),
    Toggled { service_id: String, enabled: bool },
}

struct Entry {
    binding: BackendBinding,
    service: Arc<dyn ScrobbleService>,
}

pub struct BindingRegistry {
    entries: RwLock<Vec<Entry>>,
    changes: broadcast::Sender<BindingChange>,
}

impl Default for BindingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// Bind every service named in the config; disabled ones are bound but switched off
    pub fn from_config(config: &Config) -> Result<Self> {
        let registry = Self::new();

        if let Some(lastfm) = &config.lastfm {
            let service = LastFmScrobbler::new(
                lastfm.api_key.clone(),
                lastfm.api_secret.clone(),
                lastfm.session_key.clone(),
            )?;
            let id = service.id().to_string();
            registry.bind(Arc::new(service), !lastfm.session_key.is_empty());
            registry.set_enabled(&id, lastfm.enabled);
        }

        for lb in &config.listenbrainz {
            let service = ListenBrainzScrobbler::new(lb.name.clone(), lb.token.clone(), lb.api_url.clone())?;
            let id = service.id().to_string();
            registry.bind(Arc::new(service), !lb.token.is_empty());
            registry.set_enabled(&id, lb.enabled);
        }

        Ok(registry)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BindingChange> {
        self.changes.subscribe()
    }

    /// Bind a service, replacing any binding with the same id
    pub fn bind(&self, service: Arc<dyn ScrobbleService>, authenticated: bool) {
        let service_id = service.id().to_string();
        let entry = Entry {
            binding: BackendBinding {
                service_id: service_id.clone(),
                authenticated,
                enabled: true,
            },
            service,
        };

        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            match entries.iter_mut().find(|e| e.binding.service_id == service_id) {
                Some(existing) => {
                    log::warn!("Replacing existing binding {}", service_id);
                    *existing = entry;
                }
                None => entries.push(entry),
            }
        }

        log::info!("Bound {} (authenticated: {})", service_id, authenticated);
        self.publish(BindingChange::Bound(service_id));
    }

    /// Remove a binding; returns false if it was not bound
    pub fn unbind(&self, service_id: &str) -> bool {
        let removed = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|e| e.binding.service_id != service_id);
            entries.len() != before
        };

        if removed {
            log::info!("Unbound {}", service_id);
            self.publish(BindingChange::Unbound(service_id.to_string()));
        }
        removed
    }

    pub fn authenticate(&self, service_id: &str) -> bool {
        let found = self.update(service_id, |b| b.authenticated = true);
        if found {
            self.publish(BindingChange::Authenticated(service_id.to_string()));
        }
        found
    }

    pub fn deauthenticate(&self, service_id: &str) -> bool {
        let found = self.update(service_id, |b| b.authenticated = false);
        if found {
            self.publish(BindingChange::Deauthenticated(service_id.to_string()));
        }
        found
    }

    pub fn set_enabled(&self, service_id: &str, enabled: bool) -> bool {
        let found = self.update(service_id, |b| b.enabled = enabled);
        if found {
            self.publish(BindingChange::Toggled {
                service_id: service_id.to_string(),
                enabled,
            });
        }
        found
    }

    /// Mark a binding unauthenticated after the service rejected its credentials
    pub fn require_reauthentication(&self, service_id: &str) {
        if self.update(service_id, |b| b.authenticated = false) {
            log::warn!("{} rejected its credentials, re-authentication required", service_id);
            self.publish(BindingChange::ReauthenticationRequired(service_id.to_string()));
        }
    }

    pub fn bindings(&self) -> Vec<BackendBinding> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.iter().map(|e| e.binding.clone()).collect()
    }

    pub fn get(&self, service_id: &str) -> Option<BackendBinding> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|e| e.binding.service_id == service_id)
            .map(|e| e.binding.clone())
    }

    /// Enabled bindings with their services, in bind order
    pub(crate) fn enabled_services(&self) -> Vec<(BackendBinding, Arc<dyn ScrobbleService>)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .filter(|e| e.binding.enabled)
            .map(|e| (e.binding.clone(), e.service.clone()))
            .collect()
    }

    fn update(&self, service_id: &str, apply: impl FnOnce(&mut BackendBinding)) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|e| e.binding.service_id == service_id) {
            Some(entry) => {
                apply(&mut entry.binding);
                true
            }
            None => {
                log::debug!("No binding named {}", service_id);
                false
            }
        }
    }

    fn publish(&self, change: BindingChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}
