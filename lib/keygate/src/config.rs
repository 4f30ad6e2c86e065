//! KeyManager configuration

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KeygateError, Result};
use crate::types::{AccessPolicy, KeyPairIdentifier};

pub const DEFAULT_OPERATION_PROMPT: &str = "Authenticate to continue";

/// What `generate_key_pair` does when a pair already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExistingKeyPolicy {
    /// Delete the old pair and generate a fresh one
    #[default]
    Replace,
    /// Refuse with `KeygateError::KeyExists`
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyManagerConfig {
    pub identifier: KeyPairIdentifier,
    #[serde(default = "default_prompt")]
    pub operation_prompt: String,
    #[serde(default)]
    pub access: AccessPolicy,
    #[serde(default)]
    pub on_existing: ExistingKeyPolicy,
}

fn default_prompt() -> String {
    DEFAULT_OPERATION_PROMPT.to_string()
}

impl KeyManagerConfig {
    pub fn new(identifier: KeyPairIdentifier) -> Self {
        Self {
            identifier,
            operation_prompt: default_prompt(),
            access: AccessPolicy::default(),
            on_existing: ExistingKeyPolicy::default(),
        }
    }

    /// Shorthand for `new(KeyPairIdentifier::from_namespace(namespace))`.
    pub fn for_namespace(namespace: &str) -> Self {
        Self::new(KeyPairIdentifier::from_namespace(namespace))
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.operation_prompt = prompt.into();
        self
    }

    pub fn with_access(mut self, access: AccessPolicy) -> Self {
        self.access = access;
        self
    }

    pub fn with_existing_policy(mut self, on_existing: ExistingKeyPolicy) -> Self {
        self.on_existing = on_existing;
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KeygateError::StorageError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = std::fs::File::create(path)
            .map_err(|e| KeygateError::StorageError(e.to_string()))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| KeygateError::StorageError(e.to_string()))?;
        file.sync_all()
            .map_err(|e| KeygateError::StorageError(e.to_string()))?;
        Ok(())
    }
}
