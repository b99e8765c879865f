//! Driver registry -- backend names mapped to driver factories.
//!
//! A process-wide registry is populated with the built-in backends the
//! first time it is touched; [`register_driver`] adds or replaces entries.
//! Registration is meant to happen during test setup, before drivers are
//! created. It is lock-protected, so concurrent use is memory-safe, but a
//! `new` racing a `register_driver` for the same name may see either entry.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use tracing::debug;

use crate::config::Config;
use crate::driver::Driver;
use crate::error::DriverError;

/// Zero-argument constructor for a fresh, unconfigured driver.
pub type DriverFactory = Arc<dyn Fn() -> Box<dyn Driver> + Send + Sync>;

/// A collection of driver factories, keyed by backend name.
///
/// # Example
///
/// ```ignore
/// let mut registry = DriverRegistry::new();
/// registry.register("postgres", || Box::new(PostgresDriver::new()));
/// let driver = registry.create("postgres", Config::default())?;
/// ```
#[derive(Default)]
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every backend that ships with this crate.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        crate::postgres::register(&mut registry);
        registry
    }

    /// Register a factory under `name`.
    ///
    /// If a factory with the same name is already registered it is
    /// replaced and the old one is returned.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Option<DriverFactory>
    where
        F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(driver = %name, "registering driver");
        self.factories.insert(name, Arc::new(factory))
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Option<DriverFactory> {
        self.factories.get(name).cloned()
    }

    /// Instantiate the named driver and hand it `config`.
    ///
    /// No process is started here; that happens on the first
    /// [`Driver::client`] call.
    pub fn create(&self, name: &str, config: Config) -> Result<Box<dyn Driver>, DriverError> {
        let factory = self.get(name).ok_or_else(|| DriverError::UnknownDriver {
            name: name.to_string(),
        })?;
        Ok(instantiate(&factory, config))
    }

    /// List the names of all registered drivers, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Return the number of registered drivers.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Return `true` if no drivers are registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.list())
            .finish()
    }
}

fn instantiate(factory: &DriverFactory, config: Config) -> Box<dyn Driver> {
    let mut driver = factory();
    driver.set_config(config);
    driver
}

// ---------------------------------------------------------------------------
// Process-wide registry
// ---------------------------------------------------------------------------

static GLOBAL: LazyLock<RwLock<DriverRegistry>> =
    LazyLock::new(|| RwLock::new(DriverRegistry::with_builtin_drivers()));

/// Register a driver factory in the process-wide registry.
///
/// The last registration for a name wins.
pub fn register_driver<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Box<dyn Driver> + Send + Sync + 'static,
{
    GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(name, factory);
}

/// Create the named driver with [`Config::from_env`].
pub fn new(name: &str) -> Result<Box<dyn Driver>, DriverError> {
    new_with_config(name, Config::from_env())
}

/// Create the named driver with an explicit config.
pub fn new_with_config(name: &str, config: Config) -> Result<Box<dyn Driver>, DriverError> {
    // Clone the factory out so the lock is not held while it runs.
    let factory = GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .ok_or_else(|| DriverError::UnknownDriver {
            name: name.to_string(),
        })?;
    Ok(instantiate(&factory, config))
}

/// Names of every driver in the process-wide registry, sorted.
pub fn registered_drivers() -> Vec<String> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .list()
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ClientHandle, DriverState};
    use crate::error::ErrorKind;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Minimal test driver that remembers its config.
    struct FakeDriver {
        label: String,
        config: Option<Config>,
    }

    impl FakeDriver {
        fn boxed(label: &str) -> Box<dyn Driver> {
            Box::new(Self {
                label: label.to_string(),
                config: None,
            })
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        fn name(&self) -> &str {
            &self.label
        }

        fn set_config(&mut self, config: Config) {
            self.config = Some(config);
        }

        fn state(&self) -> DriverState {
            DriverState::Unstarted
        }

        fn connection_url(&self) -> Option<String> {
            // Expose the configured timeout so tests can see what was injected.
            self.config
                .as_ref()
                .map(|c| format!("fake://{}", c.connect_timeout.as_secs()))
        }

        async fn client(&mut self) -> Result<ClientHandle, DriverError> {
            Ok(ClientHandle::new(()))
        }

        async fn wipe(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), DriverError> {
            Ok(())
        }

        fn check(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = DriverRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_and_create_injects_config() {
        let mut registry = DriverRegistry::new();
        let old = registry.register("alpha", || FakeDriver::boxed("alpha"));
        assert!(old.is_none());

        let driver = registry
            .create("alpha", Config::new(Duration::from_secs(7)))
            .unwrap();
        assert_eq!(driver.name(), "alpha");
        assert_eq!(driver.connection_url().as_deref(), Some("fake://7"));
        assert_eq!(driver.state(), DriverState::Unstarted);
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = DriverRegistry::new();
        registry.register("alpha", || FakeDriver::boxed("first"));
        let old = registry.register("alpha", || FakeDriver::boxed("second"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);

        let driver = registry.create("alpha", Config::default()).unwrap();
        assert_eq!(driver.name(), "second");
    }

    #[test]
    fn create_missing_is_configuration_error() {
        let registry = DriverRegistry::new();
        let err = registry
            .create("nonexistent-backend", Config::default())
            .err()
            .expect("unknown name must fail");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(err, DriverError::UnknownDriver { ref name } if name == "nonexistent-backend"));
    }

    #[test]
    fn each_create_builds_a_fresh_instance() {
        let mut registry = DriverRegistry::new();
        registry.register("alpha", || FakeDriver::boxed("alpha"));
        let a = registry.create("alpha", Config::new(Duration::from_secs(1))).unwrap();
        let b = registry.create("alpha", Config::new(Duration::from_secs(2))).unwrap();
        assert_eq!(a.connection_url().as_deref(), Some("fake://1"));
        assert_eq!(b.connection_url().as_deref(), Some("fake://2"));
    }

    #[test]
    fn builtin_registry_has_postgres() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(registry.list(), vec!["postgres"]);
    }

    #[test]
    fn global_register_and_new() {
        register_driver("registry-unit-fake", || FakeDriver::boxed("registry-unit-fake"));
        assert!(registered_drivers().contains(&"registry-unit-fake".to_string()));
        assert!(registered_drivers().contains(&"postgres".to_string()));

        let driver =
            new_with_config("registry-unit-fake", Config::new(Duration::from_secs(9))).unwrap();
        assert_eq!(driver.connection_url().as_deref(), Some("fake://9"));
    }

    #[test]
    fn global_new_unknown_fails_without_side_effects() {
        let err = new("nonexistent-backend").err().expect("must fail");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = DriverRegistry::new();
        registry.register("test-driver", || FakeDriver::boxed("test-driver"));
        let debug = format!("{registry:?}");
        assert!(debug.contains("test-driver"));
    }
}
