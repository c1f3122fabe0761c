use mirrorio_core::{MirrorError, Result, StorageDefinition};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Name of the store the HTTP surface serves.
    pub serve: String,
    /// Named stores, built in declaration order; a replica may reference
    /// any store defined before it.
    pub stores: Vec<StoreEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    pub name: String,
    #[serde(flatten)]
    pub definition: StorageDefinition,
}

fn default_listen_addr() -> String {
    "127.0.0.1:3179".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("MIRRORIO"))
            .build()
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| MirrorError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stores.is_empty() {
            return Err(MirrorError::Config(
                "at least one store must be defined".to_string(),
            ));
        }
        if !self.stores.iter().any(|entry| entry.name == self.serve) {
            return Err(MirrorError::Config(format!(
                "serve store '{}' is not defined",
                self.serve
            )));
        }
        Ok(())
    }

    pub fn definitions(&self) -> Vec<(String, StorageDefinition)> {
        self.stores
            .iter()
            .map(|entry| (entry.name.clone(), entry.definition.clone()))
            .collect()
    }
}
