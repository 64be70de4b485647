//! Layered boolean feature flags.
//!
//! Resolution order: runtime overrides (set at runtime and persisted), then
//! environment overrides (`FEATURE_<NAME>`), then the compiled default.
//! Unknown flags are always off.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::ResilienceError;
use crate::logger::{LogContext, Logger};

/// Storage key holding persisted overrides.
pub const OVERRIDES_STORAGE_KEY: &str = "feature_flag_overrides";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FEATURE_";

/// Maintenance mode flag name.
pub const MAINTENANCE_MODE: &str = "maintenance_mode";

/// Minimal key-value persistence used for flag overrides.
pub trait KeyValueStorage: Send + Sync {
    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    fn get(&self, key: &str) -> Result<Option<String>, ResilienceError>;

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    fn set(&self, key: &str, value: &str) -> Result<(), ResilienceError>;

    /// Delete a value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the backend fails.
    fn remove(&self, key: &str) -> Result<(), ResilienceError>;
}

/// In-memory [`KeyValueStorage`].
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, ResilienceError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ResilienceError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ResilienceError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Compiled flag definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagDefinition {
    /// Flag name
    pub name: &'static str,
    /// Value when nothing overrides it
    pub default_enabled: bool,
    /// What the flag controls
    pub description: &'static str,
    /// Whether it can be changed at runtime
    pub mutable: bool,
}

const fn flag(
    name: &'static str,
    default_enabled: bool,
    mutable: bool,
    description: &'static str,
) -> FlagDefinition {
    FlagDefinition {
        name,
        default_enabled,
        description,
        mutable,
    }
}

/// Every known flag.
pub const FLAG_DEFINITIONS: &[FlagDefinition] = &[
    flag(MAINTENANCE_MODE, false, true, "Reject requests while the system is under maintenance"),
    flag("auto_recovery", true, true, "Absorb minor issues with safe fallbacks"),
    flag("circuit_breaker", true, true, "Gate calls to failing dependencies"),
    flag("request_retry", true, true, "Retry transient failures with backoff"),
    flag("idempotency_keys", true, true, "Suppress and replay duplicate mutations"),
    flag("system_alerts", true, true, "Show alerts for major issues"),
    flag("health_monitoring", true, false, "Expose the health endpoint"),
    flag("cash_register", true, true, "Cash register module"),
    flag("purchase_orders", true, true, "Purchase orders module"),
    flag("supplier_returns", true, true, "Supplier returns module"),
    flag("inventory_adjustments", true, true, "Inventory adjustments module"),
    flag("e_invoicing", true, true, "Electronic invoicing module"),
];

/// Where an override came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    /// `FEATURE_<NAME>` environment variable
    Environment,
    /// Set at runtime
    Runtime,
}

#[derive(Debug, Clone, Copy)]
struct Override {
    enabled: bool,
    changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Overrides {
    runtime: HashMap<String, Override>,
    env: HashMap<String, bool>,
}

impl Overrides {
    fn resolve(&self, name: &str) -> Option<(bool, OverrideSource, Option<DateTime<Utc>>)> {
        if let Some(found) = self.runtime.get(name) {
            return Some((found.enabled, OverrideSource::Runtime, found.changed_at));
        }
        self.env
            .get(name)
            .map(|enabled| (*enabled, OverrideSource::Environment, None))
    }

    fn runtime_snapshot(&self) -> BTreeMap<String, bool> {
        self.runtime
            .iter()
            .map(|(name, o)| (name.clone(), o.enabled))
            .collect()
    }
}

/// Resolved state of one flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    /// Flag name
    pub name: String,
    /// Effective value
    pub enabled: bool,
    /// Compiled default
    pub default_enabled: bool,
    /// What the flag controls
    pub description: String,
    /// Whether it can be changed at runtime
    pub mutable: bool,
    /// Override in effect, if any
    pub source: Option<OverrideSource>,
    /// When it was last changed at runtime
    pub last_changed: Option<DateTime<Utc>>,
}

/// Flag store with runtime and environment overrides.
pub struct FeatureFlagStore {
    storage: Arc<dyn KeyValueStorage>,
    overrides: RwLock<Overrides>,
    logger: Option<Arc<Logger>>,
}

impl std::fmt::Debug for FeatureFlagStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlagStore")
            .field("runtime_overrides", &self.overrides.read().runtime.len())
            .finish_non_exhaustive()
    }
}

impl Default for FeatureFlagStore {
    fn default() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }
}

impl FeatureFlagStore {
    /// Store backed by `storage`, loading any persisted overrides.
    #[must_use]
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        let store = Self {
            storage,
            overrides: RwLock::new(Overrides::default()),
            logger: None,
        };
        store.load_persisted();
        store
    }

    /// Report changes and rejected writes through `logger`.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Seed environment overrides from `FEATURE_<NAME>` pairs.
    ///
    /// `"true"` and `"1"` enable; any other value disables. Unknown flag
    /// names are ignored. Runtime overrides keep precedence.
    #[must_use]
    pub fn with_env_overrides<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        {
            let mut overrides = self.overrides.write();
            for (key, value) in vars {
                let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                    continue;
                };
                let name = name.to_lowercase();
                if definition(&name).is_none() {
                    continue;
                }
                let enabled = matches!(value.as_ref().trim(), "true" | "1");
                overrides.env.insert(name, enabled);
            }
        }
        self
    }

    /// Seed environment overrides from the process environment.
    #[must_use]
    pub fn with_process_env(self) -> Self {
        self.with_env_overrides(std::env::vars())
    }

    /// Effective value of `name`.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        if let Some((enabled, _, _)) = self.overrides.read().resolve(name) {
            return enabled;
        }
        definition(name).is_some_and(|def| def.default_enabled)
    }

    /// Whether maintenance mode is on.
    #[must_use]
    pub fn is_maintenance_mode(&self) -> bool {
        self.is_enabled(MAINTENANCE_MODE)
    }

    /// Set a runtime override and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::InvalidInput`] for unknown or immutable flags.
    pub fn set(&self, name: &str, enabled: bool) -> Result<(), ResilienceError> {
        let Some(def) = definition(name) else {
            return Err(ResilienceError::invalid_input(format!("unknown feature flag {name}")));
        };
        if !def.mutable {
            self.log_warn(format!("Refused to change immutable feature flag {name}"), name);
            return Err(ResilienceError::invalid_input(format!("feature flag {name} is immutable")));
        }

        let persisted = {
            let mut overrides = self.overrides.write();
            overrides.runtime.insert(
                name.to_string(),
                Override {
                    enabled,
                    changed_at: Some(Utc::now()),
                },
            );
            overrides.runtime_snapshot()
        };

        if let Some(logger) = &self.logger {
            logger.info(
                format!("Feature flag {name} set to {enabled}"),
                LogContext::new("feature_flags").with_metadata("flag", name),
            );
        }
        self.persist(&persisted);
        Ok(())
    }

    /// Resolved state of every known flag, ordered by name.
    #[must_use]
    pub fn get_all(&self) -> BTreeMap<String, FeatureFlag> {
        let overrides = self.overrides.read();
        FLAG_DEFINITIONS
            .iter()
            .map(|def| {
                let found = overrides.resolve(def.name);
                let flag = FeatureFlag {
                    name: def.name.to_string(),
                    enabled: found.map_or(def.default_enabled, |(enabled, _, _)| enabled),
                    default_enabled: def.default_enabled,
                    description: def.description.to_string(),
                    mutable: def.mutable,
                    source: found.map(|(_, source, _)| source),
                    last_changed: found.and_then(|(_, _, changed_at)| changed_at),
                };
                (def.name.to_string(), flag)
            })
            .collect()
    }

    /// Compiled definition of `name`.
    #[must_use]
    pub fn definition(&self, name: &str) -> Option<FlagDefinition> {
        definition(name).copied()
    }

    /// Drop runtime overrides, in memory and in storage.
    pub fn reset(&self) {
        self.overrides.write().runtime.clear();
        if let Err(err) = self.storage.remove(OVERRIDES_STORAGE_KEY) {
            self.log_warn(format!("Failed to clear persisted feature flags: {err}"), "*");
        }
    }

    fn load_persisted(&self) {
        let raw = match self.storage.get(OVERRIDES_STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to load persisted feature flags");
                return;
            }
        };
        let Ok(persisted) = serde_json::from_str::<HashMap<String, bool>>(&raw) else {
            tracing::warn!("Ignoring malformed persisted feature flags");
            return;
        };

        let mut overrides = self.overrides.write();
        for (name, enabled) in persisted {
            if definition(&name).is_some_and(|def| def.mutable) {
                overrides.runtime.insert(
                    name,
                    Override {
                        enabled,
                        changed_at: None,
                    },
                );
            }
        }
    }

    fn persist(&self, overrides: &BTreeMap<String, bool>) {
        let result = serde_json::to_string(overrides)
            .map_err(ResilienceError::from)
            .and_then(|raw| self.storage.set(OVERRIDES_STORAGE_KEY, &raw));
        if let Err(err) = result {
            self.log_warn(format!("Failed to persist feature flags: {err}"), "*");
        }
    }

    fn log_warn(&self, message: String, name: &str) {
        if let Some(logger) = &self.logger {
            logger.warn(message, LogContext::new("feature_flags").with_metadata("flag", name));
        } else {
            tracing::warn!(flag = name, "{message}");
        }
    }
}

fn definition(name: &str) -> Option<&'static FlagDefinition> {
    FLAG_DEFINITIONS.iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let flags = FeatureFlagStore::default();
        assert!(!flags.is_maintenance_mode());
        assert!(flags.is_enabled("cash_register"));
        assert!(!flags.is_enabled("does_not_exist"));
    }

    #[test]
    fn test_override_then_reset() {
        let flags = FeatureFlagStore::default();
        assert!(flags.set("purchase_orders", false).is_ok());
        assert!(!flags.is_enabled("purchase_orders"));

        flags.reset();
        assert!(flags.is_enabled("purchase_orders"));
    }

    #[test]
    fn test_immutable_flag_rejected() {
        let logger = Arc::new(Logger::default());
        let flags = FeatureFlagStore::default().with_logger(Arc::clone(&logger));

        let result = flags.set("health_monitoring", false);
        assert!(matches!(result, Err(ResilienceError::InvalidInput(_))));
        assert!(flags.is_enabled("health_monitoring"));
        assert_eq!(logger.len(), 1);
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let flags = FeatureFlagStore::default();
        assert!(flags.set("teleporter", true).is_err());
        assert!(!flags.is_enabled("teleporter"));
    }

    #[test]
    fn test_overrides_survive_restart() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let flags = FeatureFlagStore::new(Arc::clone(&storage));
        assert!(flags.set(MAINTENANCE_MODE, true).is_ok());

        let reloaded = FeatureFlagStore::new(Arc::clone(&storage));
        assert!(reloaded.is_maintenance_mode());

        reloaded.reset();
        assert!(storage.get(OVERRIDES_STORAGE_KEY).ok().flatten().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let flags = FeatureFlagStore::default().with_env_overrides([
            ("FEATURE_E_INVOICING", "false"),
            ("FEATURE_MAINTENANCE_MODE", "1"),
            ("FEATURE_UNKNOWN", "true"),
            ("PATH", "/usr/bin"),
        ]);
        assert!(!flags.is_enabled("e_invoicing"));
        assert!(flags.is_maintenance_mode());
        assert!(!flags.is_enabled("unknown"));

        // Runtime beats environment, and reset falls back to it.
        assert!(flags.set("e_invoicing", true).is_ok());
        assert!(flags.is_enabled("e_invoicing"));
        flags.reset();
        assert!(!flags.is_enabled("e_invoicing"));
    }

    #[test]
    fn test_get_all_reports_sources() {
        let flags = FeatureFlagStore::default();
        assert!(flags.set("system_alerts", false).is_ok());

        let all = flags.get_all();
        assert_eq!(all.len(), FLAG_DEFINITIONS.len());
        let alerts = &all["system_alerts"];
        assert!(!alerts.enabled);
        assert!(alerts.default_enabled);
        assert_eq!(alerts.source, Some(OverrideSource::Runtime));
        assert!(alerts.last_changed.is_some());
        assert_eq!(all["cash_register"].source, None);
    }

    #[test]
    fn test_malformed_persisted_value_ignored() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(OVERRIDES_STORAGE_KEY, "{not json").ok();
        let flags = FeatureFlagStore::new(storage);
        assert!(flags.is_enabled("cash_register"));
    }
}
