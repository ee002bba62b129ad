//! Deployed process definitions with optional file persistence.
//!
//! Definitions are versioned per key: deploying a key again creates
//! `key:2`, `key:3`, ... and instances started by key always pick the
//! latest version. Running instances keep the version they started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::definition::ProcessDefinition;
use super::validation::validate_process;
use crate::error::{ProcessEngineError, Result};

/// Summary of a deployed definition (for listing).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionMetadata {
    pub id: String,
    pub key: String,
    pub name: String,
    pub version: u32,
    pub node_count: usize,
}

/// In-memory definition repository with optional JSON persistence.
///
/// # Example
///
/// ```ignore
/// let mut repository = ProcessRepository::with_persistence(".process/definitions");
/// repository.load_from_disk()?;
/// let id = repository.deploy(definition)?;
/// ```
#[derive(Debug, Default)]
pub struct ProcessRepository {
    /// Deployed definitions, keyed by `key:version` id.
    definitions: HashMap<String, Arc<ProcessDefinition>>,
    /// Latest version per key.
    latest: HashMap<String, u32>,
    /// Optional path for file persistence.
    persist_path: Option<PathBuf>,
}

impl ProcessRepository {
    /// Create a new in-memory repository without persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository that persists to the given directory.
    ///
    /// The directory will be created if it doesn't exist when saving.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            persist_path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Validate and deploy a definition, returning its assigned id.
    pub fn deploy(&mut self, mut definition: ProcessDefinition) -> Result<String> {
        let errors = validate_process(&definition);
        if !errors.is_empty() {
            return Err(ProcessEngineError::Validation {
                key: definition.key.clone(),
                errors,
            });
        }

        let version = self.latest.get(&definition.key).copied().unwrap_or(0) + 1;
        definition.version = version;
        definition.id = format!("{}:{}", definition.key, version);

        self.save_to_disk(&definition)?;
        log::info!("Deployed process definition '{}'", definition.id);
        let id = definition.id.clone();
        self.insert(definition);
        Ok(id)
    }

    fn insert(&mut self, definition: ProcessDefinition) {
        let latest = self.latest.entry(definition.key.clone()).or_insert(0);
        *latest = (*latest).max(definition.version);
        self.definitions
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Load all definitions from the persistence directory.
    ///
    /// Returns the number of definitions loaded.
    pub fn load_from_disk(&mut self) -> Result<usize> {
        let Some(path) = self.persist_path.clone() else {
            return Ok(0);
        };

        if !path.exists() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in std::fs::read_dir(&path)? {
            let file_path = entry?.path();

            if file_path.extension().map_or(false, |e| e == "json") {
                let content = std::fs::read_to_string(&file_path)?;
                match serde_json::from_str::<ProcessDefinition>(&content) {
                    Ok(definition) if !definition.id.is_empty() => {
                        log::info!("Loaded process definition '{}' from {:?}", definition.id, file_path);
                        self.insert(definition);
                        count += 1;
                    }
                    Ok(_) => {
                        log::warn!("Skipping undeployed definition in {:?}", file_path);
                    }
                    Err(e) => {
                        log::warn!("Failed to parse process definition from {:?}: {}", file_path, e);
                    }
                }
            }
        }
        Ok(count)
    }

    fn save_to_disk(&self, definition: &ProcessDefinition) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };

        std::fs::create_dir_all(path)?;
        let file_path = path.join(format!("{}.v{}.json", definition.key, definition.version));
        let content = serde_json::to_string_pretty(definition)?;
        std::fs::write(&file_path, content)?;
        log::debug!("Saved process definition '{}' to {:?}", definition.id, file_path);
        Ok(())
    }

    /// Get a definition by its `key:version` id.
    pub fn get(&self, id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(id).cloned()
    }

    /// Get a definition by id or fail with `DefinitionNotFound`.
    pub fn require(&self, id: &str) -> Result<Arc<ProcessDefinition>> {
        self.get(id)
            .ok_or_else(|| ProcessEngineError::DefinitionNotFound(id.to_string()))
    }

    /// Latest deployed version of a key.
    pub fn latest_by_key(&self, key: &str) -> Result<Arc<ProcessDefinition>> {
        let version = self
            .latest
            .get(key)
            .ok_or_else(|| ProcessEngineError::DefinitionNotFound(key.to_string()))?;
        self.require(&format!("{}:{}", key, version))
    }

    /// List all deployed definitions, ordered by id.
    pub fn list(&self) -> Vec<DefinitionMetadata> {
        let mut list: Vec<_> = self
            .definitions
            .values()
            .map(|d| DefinitionMetadata {
                id: d.id.clone(),
                key: d.key.clone(),
                name: d.name.clone(),
                version: d.version,
                node_count: d.nodes.len(),
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key).then(a.version.cmp(&b.version)));
        list
    }

    /// Check if a definition id is deployed.
    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }
}
