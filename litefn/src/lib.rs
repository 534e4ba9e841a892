///
/// # litefn: host-defined SQL functions for an embedded database
///
/// Register scalar functions, aggregates and boolean predicates written in
/// Rust on a connection, then call them from SQL like built-ins.
///
/// ## Library Usage
///
/// ```rust,ignore
/// use litefn::{Arity, Connection};
///
/// let mut conn = Connection::open("Data Source=:memory:")?;
/// conn.register_scalar("volume", Arity::Fixed(2), |r: f64, h: f64| {
///     std::f64::consts::PI * r.powi(2) * h
/// })?;
/// conn.register_aggregate(
///     "product",
///     || 1i64,
///     |acc: i64, x: i64| acc * x,
///     |acc: i64| acc,
/// )?;
/// conn.register_predicate("regexp", |pattern: String, text: String| {
///     text.contains(&pattern)
/// })?;
///
/// let v: f64 = conn.query_scalar("SELECT volume(2, 10)", [])?;
/// ```
///
/// Registrations belong to the connection and disappear when it closes.
///

pub mod aggregate;
mod bridge;
pub mod builtins;
pub mod config;
pub mod connection;
pub mod errors;
pub mod predicate;
pub mod registry;
pub mod scalar;
pub mod value;

pub use aggregate::{AggregateAdapter, AggregateFunction, FnAggregate};
pub use config::{Config, load_config, parse_config_str};
pub use connection::{Connection, ConnectionString, OpenMode, Row, Rows, Statement};
pub use errors::{Error, Result};
pub use predicate::{InfixOperator, Predicate};
pub use registry::{ConflictPolicy, FunctionEntry, FunctionKind};
pub use rusqlite::params;
pub use scalar::{Arity, FnScalar, ScalarFunction};
pub use value::{CallbackOutput, FromSqlValue, SqlType, SqlValue};
