//! Named connection strings and application settings.
//!
//! # Responsibility
//! - Load connection configuration from JSON text or a JSON file.
//! - Resolve connection entries by name for the connection factory.
//!
//! # Invariants
//! - Lookups never fall back to another entry; a missing name is an error.
//! - Every load failure surfaces as `DbError::Configuration`.

use crate::db::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One named connection entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStringSettings {
    /// Driver identifier, e.g. `sqlite`.
    pub provider_name: String,
    /// Provider-specific `key=value;` connection string.
    pub connection_string: String,
}

/// Configuration document holding connection strings and free-form settings.
///
/// ```json
/// {
///   "connection_strings": {
///     "Northwind": { "provider_name": "sqlite", "connection_string": "Data Source=nw.db" }
///   },
///   "app_settings": { "Database": "Northwind" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStrings {
    #[serde(default)]
    pub connection_strings: BTreeMap<String, ConnectionStringSettings>,
    #[serde(default)]
    pub app_settings: BTreeMap<String, String>,
}

impl ConnectionStrings {
    pub fn from_json_str(json: &str) -> DbResult<Self> {
        serde_json::from_str(json)
            .map_err(|err| DbError::Configuration(format!("invalid configuration document: {err}")))
    }

    pub fn load(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            DbError::Configuration(format!(
                "failed to read configuration `{}`: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&text)
    }

    /// Adds or replaces a connection entry.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        provider_name: impl Into<String>,
        connection_string: impl Into<String>,
    ) {
        self.connection_strings.insert(
            name.into(),
            ConnectionStringSettings {
                provider_name: provider_name.into(),
                connection_string: connection_string.into(),
            },
        );
    }

    pub fn get(&self, name: &str) -> DbResult<&ConnectionStringSettings> {
        self.connection_strings.get(name).ok_or_else(|| {
            DbError::Configuration(format!(
                "failed to find connection string named `{name}` in configuration"
            ))
        })
    }

    pub fn app_setting(&self, key: &str) -> Option<&str> {
        self.app_settings.get(key).map(String::as_str)
    }
}
