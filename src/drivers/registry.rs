use std::collections::BTreeMap;
use std::sync::Arc;

use super::bambu::BambuDriver;
use super::dummy::DummyDriver;
use super::klipper::KlipperDriver;
use super::{Driver, DriverContext};

/// Builds a driver for one printer.
pub type DriverFactory = Box<dyn Fn(DriverContext) -> Arc<dyn Driver> + Send + Sync>;

/// Map from a printer's `driver_key` to the factory that builds its driver.
pub struct DriverRegistry {
    factories: BTreeMap<String, DriverFactory>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in drivers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("bambu", bambu);
        registry.register("klipper", klipper);
        registry.register("dummy", dummy);
        registry
    }

    /// Add or replace the factory for `key`.
    pub fn register<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(DriverContext) -> Arc<dyn Driver> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_string(), Box::new(factory));
    }

    pub fn create(&self, key: &str, ctx: DriverContext) -> Option<Arc<dyn Driver>> {
        self.factories.get(key).map(|factory| factory(ctx))
    }

    #[cfg(test)]
    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    #[cfg(test)]
    pub fn keys(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

fn bambu(ctx: DriverContext) -> Arc<dyn Driver> {
    Arc::new(BambuDriver::new(ctx))
}

fn klipper(ctx: DriverContext) -> Arc<dyn Driver> {
    Arc::new(KlipperDriver::new(ctx))
}

fn dummy(ctx: DriverContext) -> Arc<dyn Driver> {
    Arc::new(DummyDriver::new(ctx))
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::testing;
    use serde_json::json;

    #[test]
    fn test_builtin_keys() {
        let registry = DriverRegistry::builtin();
        assert_eq!(registry.keys(), vec!["bambu", "dummy", "klipper"]);
        assert!(!registry.contains("octoprint"));
    }

    #[test]
    fn test_create_resolves_by_key() {
        let registry = DriverRegistry::builtin();
        let (ctx, _rx) = testing::context(4, json!({}));
        let driver = registry.create("dummy", ctx.clone()).unwrap();
        assert_eq!(driver.driver_key(), "dummy");
        assert!(registry.create("octoprint", ctx).is_none());
    }
}
