///
/// # Configuration
///
/// `litefn.toml` selects the database, the collision policy and which
/// built-in functions a new connection starts with. Every section and key is
/// optional.
///
/// ```toml
/// [connection]
/// data_source = "Data Source=app.db;Mode=ReadWrite"
///
/// [functions]
/// on_conflict = "replace"
/// builtins = ["stdev", "regexp"]
///
/// [logging]
/// level = "debug"
/// ```
///

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::Level;

use crate::builtins::{self, BUILTIN_NAMES};
use crate::connection::{Connection, ConnectionString};
use crate::errors::{Error, Result};
use crate::registry::ConflictPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub functions: FunctionsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// A connection string or a bare path.
    #[serde(default = "default_data_source")]
    pub data_source: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            data_source: default_data_source(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FunctionsConfig {
    #[serde(default)]
    pub on_conflict: ConflictPolicy,
    #[serde(default = "default_builtins")]
    pub builtins: Vec<String>,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            on_conflict: ConflictPolicy::default(),
            builtins: default_builtins(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_data_source() -> String {
    "Data Source=:memory:".to_string()
}

fn default_builtins() -> Vec<String> {
    BUILTIN_NAMES.iter().map(|s| s.to_string()).collect()
}

fn default_level() -> String {
    "warn".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

pub fn parse_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    fn validate(&self) -> Result<()> {
        self.connection.data_source.parse::<ConnectionString>()?;
        self.log_level()?;
        for name in &self.functions.builtins {
            if !BUILTIN_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
                return Err(Error::Config(format!("unknown builtin function '{name}'")));
            }
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        self.logging
            .level
            .parse()
            .map_err(|_| Error::Config(format!("invalid log level '{}'", self.logging.level)))
    }

    /// Open the configured database and register the configured builtins.
    pub fn open(&self) -> Result<Connection> {
        let target: ConnectionString = self.connection.data_source.parse()?;
        let mut conn = Connection::open_with(&target, self.functions.on_conflict)?;
        for name in &self.functions.builtins {
            builtins::register_builtin(&mut conn, name)?;
        }
        Ok(conn)
    }
}
