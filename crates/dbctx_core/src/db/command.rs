//! Statement bundle handed verbatim to the driver.

use rusqlite::types::Value;
use std::time::Duration;

/// How the driver should interpret `Command::sql`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// Named statement parameters, kept in bind order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: Vec<(String, Value)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a named value.
    ///
    /// Names without a `:`, `@` or `$` prefix are stored as `:name`.
    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let name = normalize_param_name(name);
        let value = value.into();
        match self.values.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// SQL text plus everything the driver needs to run it.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: String,
    pub params: Params,
    pub timeout: Option<Duration>,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::default(),
            timeout: None,
            kind: CommandKind::Text,
        }
    }

    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.set(name, value);
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }
}

impl From<&str> for Command {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Command {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

fn normalize_param_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.starts_with([':', '@', '$']) {
        trimmed.to_string()
    } else {
        format!(":{trimmed}")
    }
}
