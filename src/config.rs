//! JSON loading for parameter structs
//!
//! Every parameter struct derives serde with `#[serde(default)]`, so a
//! config file only needs the fields it overrides.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{QcError, Result};

/// Load/save a parameter struct as JSON
pub trait JsonConfig: Serialize + DeserializeOwned {
    fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| QcError::Io(format!("Failed to read config '{}': {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
