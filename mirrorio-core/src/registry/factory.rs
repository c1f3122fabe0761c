use super::{Loader, StorageRegistry};
use crate::backend::Storage;
use crate::backends::{LocalDiskStorage, MemoryStorage};
use crate::error::Result;
use crate::replica::{ReplicaConfig, ReplicaStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Typed definition of one storage instance in the topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageDefinition {
    Memory,
    Localdisk { path: PathBuf },
    Replica(ReplicaConfig),
}

/// Build one storage instance, resolving any backend locators it names
/// through `loader`.
pub fn build_storage(
    loader: &dyn Loader,
    definition: &StorageDefinition,
) -> Result<Arc<dyn Storage>> {
    match definition {
        StorageDefinition::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageDefinition::Localdisk { path } => {
            Ok(Arc::new(LocalDiskStorage::new(path.clone())?))
        }
        StorageDefinition::Replica(config) => {
            Ok(Arc::new(ReplicaStore::from_config(loader, config)?))
        }
    }
}

/// Build a registry from named definitions, in declaration order. A
/// replica definition may only reference stores defined before it;
/// forward references fail with a resolution error.
pub fn build_registry(definitions: &[(String, StorageDefinition)]) -> Result<StorageRegistry> {
    let mut registry = StorageRegistry::new();
    for (name, definition) in definitions {
        let store = build_storage(&registry, definition)?;
        registry.register(name.clone(), store)?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MirrorError;

    fn replica_definition(backends: &[&str], min: Option<usize>) -> StorageDefinition {
        StorageDefinition::Replica(ReplicaConfig {
            backends: backends.iter().map(|s| s.to_string()).collect(),
            min_writes_for_success: min,
        })
    }

    #[test]
    fn test_build_topology_in_order() {
        let definitions = vec![
            ("/b1/".to_string(), StorageDefinition::Memory),
            ("/b2/".to_string(), StorageDefinition::Memory),
            (
                "/repl/".to_string(),
                replica_definition(&["/b1/", "/b2/"], Some(1)),
            ),
        ];

        let registry = build_registry(&definitions).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("/repl/").is_ok());
    }

    #[test]
    fn test_forward_reference_fails() {
        let definitions = vec![
            (
                "/repl/".to_string(),
                replica_definition(&["/later/"], None),
            ),
            ("/later/".to_string(), StorageDefinition::Memory),
        ];

        let err = build_registry(&definitions).unwrap_err();
        assert!(matches!(err, MirrorError::Resolve(_)));
    }

    #[test]
    fn test_definition_parses_from_config_fragment() {
        let definition: StorageDefinition = serde_json::from_value(serde_json::json!({
            "type": "replica",
            "backends": ["/b1/", "/b2/", "/b3/"],
            "minWritesForSuccess": 2
        }))
        .unwrap();

        match definition {
            StorageDefinition::Replica(config) => {
                assert_eq!(config.backends.len(), 3);
                assert_eq!(config.min_writes_for_success, Some(2));
            }
            other => panic!("unexpected definition: {other:?}"),
        }

        let localdisk: StorageDefinition = serde_json::from_value(serde_json::json!({
            "type": "localdisk",
            "path": "/var/lib/mirrorio/blobs"
        }))
        .unwrap();
        assert!(matches!(localdisk, StorageDefinition::Localdisk { .. }));
    }
}
