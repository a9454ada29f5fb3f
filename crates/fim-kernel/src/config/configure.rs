//! `configure-static://KEY` placeholder resolution for connector and generator options.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const CONFIGURE_STATIC_PREFIX: &str = "configure-static://";

/// Resolves static configuration placeholders.
pub trait ConfigureManager: Send + Sync + 'static {
    /// Returns the configured value for a `configure-static://KEY` placeholder, or the input
    /// unchanged when it is not a placeholder or the key is unknown.
    fn replace_static_configure(&self, placeholder: &str) -> String;
}

fn static_key(placeholder: &str) -> Option<&str> {
    placeholder.strip_prefix(CONFIGURE_STATIC_PREFIX)
}

/// In-memory key/value configuration.
#[derive(Debug, Default)]
pub struct SettableConfigureManager {
    configures: RwLock<HashMap<String, String>>,
}

impl SettableConfigureManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, returning the previous value.
    pub fn set_configure(&self, key: &str, value: &str) -> Option<String> {
        self.configures
            .write()
            .insert(key.to_string(), value.to_string())
    }
}

impl ConfigureManager for SettableConfigureManager {
    fn replace_static_configure(&self, placeholder: &str) -> String {
        static_key(placeholder)
            .and_then(|key| self.configures.read().get(key).cloned())
            .unwrap_or_else(|| placeholder.to_string())
    }
}

/// Resolves placeholders from process environment variables.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfigureManager;

impl ConfigureManager for EnvConfigureManager {
    fn replace_static_configure(&self, placeholder: &str) -> String {
        static_key(placeholder)
            .and_then(|key| std::env::var(key).ok())
            .unwrap_or_else(|| placeholder.to_string())
    }
}

/// Chains managers in registration order; the first one that resolves a placeholder wins.
#[derive(Default, Clone)]
pub struct NestedConfigureManager {
    managers: Vec<Arc<dyn ConfigureManager>>,
}

impl NestedConfigureManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sub_configure_manager(&mut self, manager: Arc<dyn ConfigureManager>) {
        self.managers.push(manager);
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Resolves every option value.
    pub fn resolve_options(&self, options: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        options
            .iter()
            .map(|(k, v)| (k.clone(), self.replace_static_configure(v)))
            .collect()
    }
}

impl ConfigureManager for NestedConfigureManager {
    fn replace_static_configure(&self, placeholder: &str) -> String {
        self.managers
            .iter()
            .fold(placeholder.to_string(), |acc, m| m.replace_static_configure(&acc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settable_manager() {
        let manager = SettableConfigureManager::new();
        assert_eq!(manager.set_configure("db.url", "postgres://a"), None);
        assert_eq!(
            manager.set_configure("db.url", "postgres://b"),
            Some("postgres://a".to_string())
        );
        assert_eq!(
            manager.replace_static_configure("configure-static://db.url"),
            "postgres://b"
        );
        assert_eq!(
            manager.replace_static_configure("configure-static://missing"),
            "configure-static://missing"
        );
        assert_eq!(manager.replace_static_configure("db.url"), "db.url");
    }

    #[test]
    fn test_nested_manager_layers() {
        // SAFETY: the variable name is unique to this test
        unsafe { std::env::set_var("FIM_CONFIGURE_TEST_PORT", "8080") };

        let settable = Arc::new(SettableConfigureManager::new());
        settable.set_configure("FIM_CONFIGURE_TEST_PORT", "9090");
        settable.set_configure("listen", "0.0.0.0");

        let mut nested = NestedConfigureManager::new();
        nested.add_sub_configure_manager(settable);
        nested.add_sub_configure_manager(Arc::new(EnvConfigureManager));

        let options = BTreeMap::from([
            ("port".to_string(), "configure-static://FIM_CONFIGURE_TEST_PORT".to_string()),
            ("host".to_string(), "configure-static://listen".to_string()),
            ("path".to_string(), "/register".to_string()),
        ]);
        let resolved = nested.resolve_options(&options);
        assert_eq!(resolved["port"], "9090");
        assert_eq!(resolved["host"], "0.0.0.0");
        assert_eq!(resolved["path"], "/register");
    }

    #[test]
    fn test_env_manager() {
        // SAFETY: the variable name is unique to this test
        unsafe { std::env::set_var("FIM_CONFIGURE_TEST_TOKEN", "s3cret") };
        assert_eq!(
            EnvConfigureManager.replace_static_configure("configure-static://FIM_CONFIGURE_TEST_TOKEN"),
            "s3cret"
        );
    }
}
