//! Collector factory: maps implementation identifiers to constructors.
//!
//! The `name` key of a plugin section selects the constructor. Built-in
//! collectors are registered by [`CollectorFactory::with_builtins`]; embedders
//! and tests add their own with [`CollectorFactory::register`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collector::{Collector, PluginInitError};
use crate::config::PluginConfig;

/// Constructor signature stored in the factory.
pub type Constructor =
    Arc<dyn Fn(&PluginConfig) -> Result<Box<dyn Collector>, PluginInitError> + Send + Sync>;

/// Registry of collector constructors keyed by implementation identifier.
#[derive(Clone, Default)]
pub struct CollectorFactory {
    constructors: BTreeMap<String, Constructor>,
}

impl std::fmt::Debug for CollectorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorFactory")
            .field("identifiers", &self.identifiers())
            .finish()
    }
}

impl CollectorFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a factory with every built-in collector registered.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register(crate::collector::ping::IDENTIFIER, |config| {
            Ok(Box::new(crate::collector::ping::PingCollector::from_config(
                config,
            )?))
        });
        factory.register(crate::collector::conncheck::IDENTIFIER, |config| {
            Ok(Box::new(
                crate::collector::conncheck::ConnCheckCollector::from_config(config)?,
            ))
        });
        factory.register(crate::collector::httpcheck::IDENTIFIER, |config| {
            Ok(Box::new(
                crate::collector::httpcheck::HttpCheckCollector::from_config(config)?,
            ))
        });
        factory.register(crate::collector::system::IDENTIFIER, |config| {
            Ok(Box::new(crate::collector::system::SystemCollector::from_config(
                config,
            )?))
        });
        factory
    }

    /// Register (or replace) the constructor for `identifier`.
    pub fn register<F>(&mut self, identifier: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&PluginConfig) -> Result<Box<dyn Collector>, PluginInitError> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        if self
            .constructors
            .insert(identifier.clone(), Arc::new(constructor))
            .is_some()
        {
            tracing::debug!(identifier = %identifier, "Replaced collector constructor");
        }
        self
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.constructors.contains_key(identifier)
    }

    /// Registered identifiers, sorted.
    pub fn identifiers(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Construct the collector selected by `config.name()`.
    ///
    /// # Errors
    /// `UnknownPlugin` if nothing is registered under that identifier, or
    /// whatever the constructor itself returns.
    pub fn build(&self, config: &PluginConfig) -> Result<Box<dyn Collector>, PluginInitError> {
        let constructor = self
            .constructors
            .get(config.name())
            .ok_or_else(|| PluginInitError::UnknownPlugin(config.name().to_string()))?;
        constructor(config)
    }
}
