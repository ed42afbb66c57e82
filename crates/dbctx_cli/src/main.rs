//! Command-line version check and statement runner.
//!
//! # Responsibility
//! - With no arguments, print the core version to verify `dbctx_core` linkage.
//! - Run one statement against a configured connection: `exec` inside a unit
//!   of work, `query` printing the rows of the first result set.

use dbctx_core::logging::LoggingError;
use dbctx_core::{Command, ConnectionStrings, DbError, Row, SqliteContext};
use log::info;
use rusqlite::types::Value;
use std::fmt::{Display, Formatter};
use std::process::ExitCode;

const USAGE: &str = "usage: dbctx_cli [exec|query <config.json> <sql> [connection-name]]";
const DEFAULT_CONNECTION_SETTING: &str = "Database";

#[derive(Debug)]
enum CliError {
    Usage(String),
    Logging(LoggingError),
    Db(DbError),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Usage(message) => write!(f, "{message}\n{USAGE}"),
            Self::Logging(err) => write!(f, "logging: {err}"),
            Self::Db(err) => write!(f, "{} ({})", err, err.code()),
        }
    }
}

impl From<DbError> for CliError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<LoggingError> for CliError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<(), CliError> {
    if args.is_empty() {
        println!("dbctx_core version={}", dbctx_core::core_version());
        return Ok(());
    }

    dbctx_core::init_logging_from_env()?;

    let (mode, config_path, sql, name) = match args {
        [mode, config, sql] => (mode.as_str(), config, sql, None),
        [mode, config, sql, name] => (mode.as_str(), config, sql, Some(name.as_str())),
        _ => return Err(CliError::Usage("wrong number of arguments".to_string())),
    };

    let config = ConnectionStrings::load(config_path)?;
    let name = match name {
        Some(name) => name,
        None => config.app_setting(DEFAULT_CONNECTION_SETTING).ok_or_else(|| {
            CliError::Usage(format!(
                "no connection name given and app setting `{DEFAULT_CONNECTION_SETTING}` is missing"
            ))
        })?,
    };
    let ctx = SqliteContext::from_config(&config, name)?;
    let command = Command::new(sql.as_str());

    match mode {
        "exec" => {
            let affected = ctx.in_unit_of_work(Default::default(), |ctx| ctx.execute(&command))?;
            info!("event=cli_exec module=cli status=ok affected={affected}");
            println!("affected={affected}");
        }
        "query" => {
            let rows = ctx.query::<Row>(&command)?.collect_all()?;
            if let Some(first) = rows.first() {
                println!("{}", first.columns().join("\t"));
            }
            for row in &rows {
                let cells: Vec<String> = row.values().iter().map(render_value).collect();
                println!("{}", cells.join("\t"));
            }
            info!("event=cli_query module=cli status=ok rows={}", rows.len());
        }
        other => return Err(CliError::Usage(format!("unknown mode `{other}`"))),
    }

    ctx.close()?;
    Ok(())
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(number) => number.to_string(),
        Value::Real(number) => number.to_string(),
        Value::Text(text) => text.clone(),
        Value::Blob(bytes) => format!("<blob {} bytes>", bytes.len()),
    }
}
