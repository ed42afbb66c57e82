//! Configuration-driven connection factory.

use super::driver::ConnectionFactory;
use super::sqlite::{SqliteConnection, SqliteOptions};
use super::{DbError, DbResult};
use crate::config::ConnectionStrings;
use log::{error, info};

const SQLITE_PROVIDERS: &[&str] = &["sqlite", "sqlite3", "rusqlite"];

/// Creates closed SQLite connections for one named connection string.
///
/// The entry is resolved and validated once, up front; `create` only builds
/// new handles from the cached options.
#[derive(Debug, Clone)]
pub struct DbConnectionFactory {
    name: String,
    options: SqliteOptions,
}

impl DbConnectionFactory {
    /// Resolves `name` in `config`.
    ///
    /// # Errors
    /// - `DbError::Configuration` when the name is unknown, the provider is
    ///   not SQLite, or the connection string is malformed.
    pub fn new(config: &ConnectionStrings, name: &str) -> DbResult<Self> {
        let resolved = resolve(config, name);
        match &resolved {
            Ok(_) => info!("event=factory_init module=factory status=ok name={name}"),
            Err(err) => error!(
                "event=factory_init module=factory status=error name={} error_code={} error={}",
                name,
                err.code(),
                err
            ),
        }
        resolved
    }

    /// Factory for explicit options, bypassing named configuration.
    pub fn from_options(name: impl Into<String>, options: SqliteOptions) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }
}

impl ConnectionFactory for DbConnectionFactory {
    type Connection = SqliteConnection;

    fn create(&self) -> DbResult<SqliteConnection> {
        Ok(SqliteConnection::new(self.options.clone()))
    }
}

fn resolve(config: &ConnectionStrings, name: &str) -> DbResult<DbConnectionFactory> {
    if name.trim().is_empty() {
        return Err(DbError::Configuration(
            "connection string name cannot be empty".to_string(),
        ));
    }

    let entry = config.get(name)?;
    let provider = entry.provider_name.trim().to_ascii_lowercase();
    if !SQLITE_PROVIDERS.contains(&provider.as_str()) {
        return Err(DbError::Configuration(format!(
            "connection string `{name}` uses unsupported provider `{}`",
            entry.provider_name
        )));
    }

    let options = SqliteOptions::parse(&entry.connection_string).map_err(|err| match err {
        DbError::Configuration(message) => {
            DbError::Configuration(format!("connection string `{name}`: {message}"))
        }
        other => other,
    })?;

    Ok(DbConnectionFactory {
        name: name.to_string(),
        options,
    })
}
