//! Explicit name → constructor table for resource implementations.
//!
//! `[resource.<id>] implementation = "..."` in the config selects an entry.
//! New implementations are added with [`ResourceRegistry::register`].

use std::collections::HashMap;

use super::{Resource, TabFileResource};
use crate::config::ResourceConfig;
use crate::error::AppError;

/// Builds a resource from its configuration.
pub type ResourceFactory = fn(&ResourceConfig) -> Result<Box<dyn Resource>, AppError>;

pub struct ResourceRegistry {
    factories: HashMap<String, ResourceFactory>,
}

impl ResourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every implementation shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(TabFileResource::IMPLEMENTATION, TabFileResource::from_config);
        registry
    }

    /// Add or replace the factory for `implementation`.
    pub fn register(&mut self, implementation: &str, factory: ResourceFactory) {
        self.factories.insert(implementation.to_string(), factory);
    }

    pub fn create(&self, config: &ResourceConfig) -> Result<Box<dyn Resource>, AppError> {
        let factory = self.factories.get(&config.implementation).ok_or_else(|| {
            AppError::Resource(format!(
                "resource {}: unknown implementation '{}'",
                config.id, config.implementation
            ))
        })?;
        factory(config)
    }

    /// Registered implementation names, sorted.
    pub fn implementations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
