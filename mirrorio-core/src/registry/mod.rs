pub mod factory;

pub use factory::{StorageDefinition, build_registry, build_storage};

use crate::backend::Storage;
use crate::error::{MirrorError, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves backend locators into live storage handles at construction
/// time. The replica layer depends only on this seam, so topologies can be
/// assembled from config, from code, or from test fixtures.
pub trait Loader: Send + Sync {
    fn resolve(&self, locator: &str) -> Result<Arc<dyn Storage>>;
}

/// Explicit name-to-storage map, built once at process start and handed to
/// whatever assembles the storage topology. Replaces a process-wide
/// registration hook with a value that can be passed around and dropped.
#[derive(Debug, Default)]
pub struct StorageRegistry {
    stores: HashMap<String, Arc<dyn Storage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, store: Arc<dyn Storage>) -> Result<()> {
        let name = name.into();
        if self.stores.contains_key(&name) {
            return Err(MirrorError::Config(format!(
                "storage '{name}' is defined twice"
            )));
        }
        self.stores.insert(name, store);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Storage>> {
        self.stores.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl Loader for StorageRegistry {
    fn resolve(&self, locator: &str) -> Result<Arc<dyn Storage>> {
        self.get(locator)
            .ok_or_else(|| MirrorError::Resolve(locator.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStorage;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StorageRegistry::new();
        registry
            .register("/mem/", Arc::new(MemoryStorage::new()))
            .unwrap();

        assert!(registry.resolve("/mem/").is_ok());
        let err = registry.resolve("/nope/").unwrap_err();
        assert!(matches!(err, MirrorError::Resolve(_)));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = StorageRegistry::new();
        registry
            .register("/mem/", Arc::new(MemoryStorage::new()))
            .unwrap();
        let err = registry
            .register("/mem/", Arc::new(MemoryStorage::new()))
            .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }
}
