//! Provider factories with per-configuration instance caching.
//!
//! ## Resolution
//!
//! ```text
//! get_service(Some(cfg)) ─► cache[(kind, provider, configId|"default")] ─► slot
//!                            ├─ filled → shared instance
//!                            └─ empty  → factory(cfg) under the slot lock → filled
//!
//! get_service(None) ─► default instance ─► fallback ─► retry default ─► Unavailable
//! ```
//!
//! The map only hands out per-key slots; construction runs under the slot's
//! own mutex after the shard lock is released. Two sessions racing on the
//! same key see one construction and the same `Arc`, while a slow model load
//! never holds up lookups of other keys. Failed constructions leave the slot
//! empty, so the next request retries.
//!
//! Construction may block (a local model warms up inside its factory), so
//! async callers resolve through `Gateway::resolve`, which runs this on the
//! blocking pool.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{LanguageModel, ProviderConfig, ProviderKind, SpeechToText, TextToSpeech};
use crate::config::ProviderDefaults;
use crate::error::{Result, VoxgateError};
use crate::inference::ModelHandle;

/// Builds one provider instance from its configuration.
pub type Factory<P> = Arc<dyn Fn(&ProviderConfig) -> Result<Arc<P>> + Send + Sync>;

/// One cache entry; `None` until a construction succeeds.
type Slot<P> = Arc<Mutex<Option<Arc<P>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderKey {
    pub kind: ProviderKind,
    pub provider: String,
    pub config_id: String,
}

pub struct ProviderRegistry<P: ?Sized + Send + Sync + 'static> {
    kind: ProviderKind,
    factories: RwLock<HashMap<String, Factory<P>>>,
    cache: DashMap<ProviderKey, Slot<P>>,
    default_config: RwLock<ProviderConfig>,
    default_instance: RwLock<Option<Arc<P>>>,
    fallback: RwLock<Option<(String, Arc<P>)>>,
}

impl<P: ?Sized + Send + Sync + 'static> ProviderRegistry<P> {
    pub fn new(kind: ProviderKind, default_provider: impl Into<String>) -> Self {
        let mut default_config = ProviderConfig::new(default_provider);
        default_config.normalize();
        Self {
            kind,
            factories: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            default_config: RwLock::new(default_config),
            default_instance: RwLock::new(None),
            fallback: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn register_factory<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<P>> + Send + Sync + 'static,
    {
        let name = name.into().to_ascii_lowercase();
        debug!(kind = %self.kind, provider = %name, "factory registered");
        self.factories.write().insert(name, Arc::new(factory));
    }

    /// Replace the distinguished default. A config without a provider name
    /// keeps the current one. Drops a previously built default, including
    /// its cache entry, so new credentials take effect.
    pub fn set_default(&self, config: ProviderConfig) {
        let mut config = config;
        config.normalize();
        let mut current = self.default_config.write();
        if config.provider.is_empty() {
            config.provider = current.provider.clone();
        }
        if self.cache.remove(&self.key_for(&config)).is_some() {
            debug!(kind = %self.kind, provider = %config.provider, "stale default evicted");
        }
        *current = config;
        drop(current);
        *self.default_instance.write() = None;
    }

    pub fn default_name(&self) -> String {
        self.default_config.read().provider.clone()
    }

    /// Build the default provider now. Called eagerly at startup so an
    /// expensive local model does not delay the first request. A failure is
    /// logged and returned; the registry stays usable.
    pub fn init_default(&self) -> Result<Arc<P>> {
        let config = self.default_config.read().clone();
        match self.lookup_or_build(&config) {
            Ok(instance) => {
                *self.default_instance.write() = Some(Arc::clone(&instance));
                info!(kind = %self.kind, provider = %config.provider, "default provider ready");
                Ok(instance)
            }
            Err(e) => {
                warn!(kind = %self.kind, provider = %config.provider, "default provider init failed: {e}");
                Err(e)
            }
        }
    }

    /// Default instance, else the fallback, else one more attempt at the
    /// default. `ProviderUnavailable` when all three come up empty.
    pub fn get_default(&self) -> Result<Arc<P>> {
        if let Some(instance) = self.default_instance.read().as_ref() {
            return Ok(Arc::clone(instance));
        }
        if let Some((name, instance)) = self.fallback.read().as_ref() {
            debug!(kind = %self.kind, fallback = %name, "serving fallback for default");
            return Ok(Arc::clone(instance));
        }
        self.init_default().map_err(|_| VoxgateError::ProviderUnavailable {
            kind: self.kind,
            provider: self.default_name(),
        })
    }

    /// Resolve a provider for a session. `None` means the process default.
    pub fn get_service(&self, config: Option<&ProviderConfig>) -> Result<Arc<P>> {
        let Some(config) = config else {
            return self.get_default();
        };
        let mut config = config.clone();
        config.normalize();
        if config.provider.is_empty() {
            config.provider = self.default_name();
        }

        let instance = self.lookup_or_build(&config)?;
        if config.provider != self.default_name() {
            self.designate_fallback(&config.provider, &instance);
        }
        Ok(instance)
    }

    fn lookup_or_build(&self, config: &ProviderConfig) -> Result<Arc<P>> {
        let key = self.key_for(config);
        let slot = Arc::clone(self.cache.entry(key.clone()).or_default().value());

        let mut filled = slot.lock();
        if let Some(instance) = filled.as_ref() {
            return Ok(Arc::clone(instance));
        }
        match self.build(config) {
            Ok(instance) => {
                *filled = Some(Arc::clone(&instance));
                Ok(instance)
            }
            Err(e) => {
                drop(filled);
                // Skip a slot another caller is filling right now.
                self.cache
                    .remove_if(&key, |_, slot| slot.try_lock().is_some_and(|s| s.is_none()));
                Err(e)
            }
        }
    }

    fn build(&self, config: &ProviderConfig) -> Result<Arc<P>> {
        let factory = self
            .factories
            .read()
            .get(&config.provider)
            .cloned()
            .ok_or_else(|| VoxgateError::UnknownProvider(config.provider.clone(), self.kind))?;

        match factory(config) {
            Ok(instance) => {
                info!(
                    kind = %self.kind,
                    provider = %config.provider,
                    config_id = %config.cache_id(),
                    "provider constructed"
                );
                Ok(instance)
            }
            Err(e) => {
                warn!(
                    kind = %self.kind,
                    provider = %config.provider,
                    config_id = %config.cache_id(),
                    "provider construction failed: {e}"
                );
                Err(VoxgateError::ProviderUnavailable {
                    kind: self.kind,
                    provider: config.provider.clone(),
                })
            }
        }
    }

    fn designate_fallback(&self, name: &str, instance: &Arc<P>) {
        if self.fallback.read().is_some() {
            return;
        }
        let mut slot = self.fallback.write();
        if slot.is_none() {
            info!(kind = %self.kind, provider = %name, "fallback provider designated");
            *slot = Some((name.to_string(), Arc::clone(instance)));
        }
    }

    fn key_for(&self, config: &ProviderConfig) -> ProviderKey {
        ProviderKey {
            kind: self.kind,
            provider: config.provider.clone(),
            config_id: config.cache_id(),
        }
    }

    /// Drop a cached instance, e.g. after its configuration was edited.
    pub fn evict(&self, config: &ProviderConfig) -> bool {
        let mut config = config.clone();
        config.normalize();
        self.cache.remove(&self.key_for(&config)).is_some()
    }

    /// Instances built and cached. A construction in progress is not counted.
    pub fn cached_len(&self) -> usize {
        self.cache
            .iter()
            .filter(|entry| entry.value().try_lock().is_some_and(|s| s.is_some()))
            .count()
    }

    pub fn fallback_name(&self) -> Option<String> {
        self.fallback.read().as_ref().map(|(name, _)| name.clone())
    }
}

/// The three registries a gateway resolves providers from.
pub struct Providers {
    pub stt: ProviderRegistry<dyn SpeechToText>,
    pub tts: ProviderRegistry<dyn TextToSpeech>,
    pub llm: ProviderRegistry<dyn LanguageModel>,
}

impl Providers {
    /// Empty registries with the configured default names.
    pub fn new(defaults: &ProviderDefaults) -> Self {
        let providers = Self {
            stt: ProviderRegistry::new(ProviderKind::Stt, defaults.stt.clone()),
            tts: ProviderRegistry::new(ProviderKind::Tts, defaults.tts.clone()),
            llm: ProviderRegistry::new(ProviderKind::Llm, defaults.llm.clone()),
        };
        if let Some(cfg) = &defaults.stt_config {
            providers.stt.set_default(cfg.clone());
        }
        if let Some(cfg) = &defaults.tts_config {
            providers.tts.set_default(cfg.clone());
        }
        if let Some(cfg) = &defaults.llm_config {
            providers.llm.set_default(cfg.clone());
        }
        providers
    }

    /// Registries with every built-in factory. `recognizer` backs the
    /// offline `local` STT provider.
    pub fn with_builtin(defaults: &ProviderDefaults, recognizer: ModelHandle) -> Self {
        let providers = Self::new(defaults);

        providers.stt.register_factory("local", move |_cfg| {
            let stt: Arc<dyn SpeechToText> =
                Arc::new(super::local::LocalSpeechToText::new(recognizer.clone())?);
            Ok(stt)
        });
        providers.tts.register_factory("silent", |_cfg| {
            let tts: Arc<dyn TextToSpeech> = Arc::new(super::local::SilentSpeech::default());
            Ok(tts)
        });

        #[cfg(feature = "cloud")]
        super::openai::register(&providers);

        providers
    }

    /// Eagerly build the three defaults; failures are logged and left to
    /// the fallback rules.
    pub fn init_defaults(&self) {
        let _ = self.stt.init_default();
        let _ = self.tts.init_default();
        let _ = self.llm.init_default();
    }
}
