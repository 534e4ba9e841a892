///
/// Connections with a connection-scoped function table.
///
/// A `Connection` owns one engine connection plus the table of functions
/// registered on it. Registrations live exactly as long as the connection;
/// two connections can register the same name with different behavior.
///
/// Statements run through `execute`, `execute_batch`, `query_scalar`, or
/// `prepare` + `Statement::query`, which yields `Rows`: a lazy, forward-only,
/// single-pass iterator over materialized `Row`s. Every statement run gets
/// its own id in the failure slot, so a callback failure is attributed to the
/// statement it happened in even while other statements are still open.
///

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rusqlite::{OpenFlags, Params};
use tracing::{debug, warn};

use crate::aggregate::{AggregateAdapter, AggregateFunction, FnAggregate, StepFunction};
use crate::bridge::{self, FailureSlot, StatementId};
use crate::errors::{Error, Result};
use crate::predicate::{Predicate, PredicateOutput};
use crate::registry::{ConflictPolicy, FunctionEntry, FunctionKey, FunctionTable};
use crate::scalar::{Arity, FnScalar, HostFunction, ScalarFunction};
use crate::value::{CallbackOutput, FromSqlValue, SqlValue};

pub const MEMORY_DATA_SOURCE: &str = ":memory:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadWriteCreate,
    ReadWrite,
    ReadOnly,
    Memory,
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "readwritecreate" => Ok(OpenMode::ReadWriteCreate),
            "readwrite" => Ok(OpenMode::ReadWrite),
            "readonly" => Ok(OpenMode::ReadOnly),
            "memory" => Ok(OpenMode::Memory),
            other => Err(Error::InvalidConnectionString(format!(
                "unknown mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            OpenMode::ReadWriteCreate => "ReadWriteCreate",
            OpenMode::ReadWrite => "ReadWrite",
            OpenMode::ReadOnly => "ReadOnly",
            OpenMode::Memory => "Memory",
        };
        f.write_str(mode)
    }
}

/// Parsed form of `Data Source=...;Mode=...`.
///
/// A string without any `=` is taken as a bare data source, so `:memory:`
/// and `app.db` are accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub data_source: String,
    pub mode: OpenMode,
}

impl ConnectionString {
    pub fn memory() -> Self {
        Self {
            data_source: MEMORY_DATA_SOURCE.to_string(),
            mode: OpenMode::Memory,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.mode == OpenMode::Memory || self.data_source == MEMORY_DATA_SOURCE
    }
}

impl FromStr for ConnectionString {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.contains('=') {
            if s.is_empty() {
                return Err(Error::InvalidConnectionString("empty".to_string()));
            }
            return Ok(Self {
                data_source: s.to_string(),
                mode: OpenMode::default(),
            });
        }

        let mut data_source = None;
        let mut mode = OpenMode::default();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::InvalidConnectionString(format!("expected key=value, found '{part}'"))
            })?;
            let keyword: String = key
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_lowercase();
            match keyword.as_str() {
                "datasource" | "filename" => data_source = Some(value.trim().to_string()),
                "mode" => mode = value.parse()?,
                _ => {
                    return Err(Error::InvalidConnectionString(format!(
                        "unknown keyword '{}'",
                        key.trim()
                    )));
                }
            }
        }

        let data_source = match data_source {
            Some(ds) if !ds.is_empty() => ds,
            _ if mode == OpenMode::Memory => MEMORY_DATA_SOURCE.to_string(),
            _ => {
                return Err(Error::InvalidConnectionString(
                    "missing 'Data Source'".to_string(),
                ));
            }
        };
        Ok(Self { data_source, mode })
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Data Source={};Mode={}", self.data_source, self.mode)
    }
}

pub struct Connection {
    conn: rusqlite::Connection,
    functions: FunctionTable,
    failures: FailureSlot,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.conn.path())
            .field("functions", &self.functions.len())
            .finish()
    }
}

impl Connection {
    /// Open from a connection string such as `Data Source=:memory:`.
    pub fn open(connection_string: &str) -> Result<Self> {
        Self::open_with(&connection_string.parse()?, ConflictPolicy::default())
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_with(&ConnectionString::memory(), ConflictPolicy::default())
    }

    pub fn open_with(target: &ConnectionString, policy: ConflictPolicy) -> Result<Self> {
        let conn = if target.data_source == MEMORY_DATA_SOURCE {
            rusqlite::Connection::open_in_memory()?
        } else {
            match target.mode {
                OpenMode::Memory => rusqlite::Connection::open_with_flags(
                    format!("file:{}?mode=memory&cache=shared", target.data_source),
                    OpenFlags::default(),
                )?,
                OpenMode::ReadWriteCreate => rusqlite::Connection::open(&target.data_source)?,
                OpenMode::ReadWrite => rusqlite::Connection::open_with_flags(
                    &target.data_source,
                    OpenFlags::SQLITE_OPEN_READ_WRITE
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?,
                OpenMode::ReadOnly => rusqlite::Connection::open_with_flags(
                    &target.data_source,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_URI
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?,
            }
        };
        debug!(connection = %target, ?policy, "opened connection");
        Ok(Self {
            conn,
            functions: FunctionTable::new(policy),
            failures: FailureSlot::default(),
        })
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.functions.policy()
    }

    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.functions.set_policy(policy);
    }

    /// Register a typed closure as a scalar function.
    ///
    /// `arity` must equal the closure's parameter count. The function is
    /// declared deterministic, which lets the engine fold constant calls and
    /// use it in indexes. For a closure whose result can change between
    /// calls, register `FnScalar::new(..)?.with_deterministic(false)` through
    /// `register_scalar_function` instead.
    pub fn register_scalar<Args, F>(&mut self, name: &str, arity: Arity, func: F) -> Result<()>
    where
        F: HostFunction<Args>,
        Args: 'static,
    {
        let function = FnScalar::new(name, arity, func)?;
        self.install(FunctionEntry::Scalar(Arc::new(function)))
    }

    /// Register a `ScalarFunction` implementation, which may be variadic.
    pub fn register_scalar_function<F>(&mut self, function: F) -> Result<()>
    where
        F: ScalarFunction + 'static,
    {
        self.install(FunctionEntry::Scalar(Arc::new(function)))
    }

    /// Register an aggregate built from an initial-state factory, a step
    /// closure and a finalize closure. The SQL arity is the number of value
    /// parameters `step` takes after the accumulator.
    pub fn register_aggregate<S, Args, I, St, Fi, R>(
        &mut self,
        name: &str,
        initial_state: I,
        step: St,
        finalize: Fi,
    ) -> Result<()>
    where
        S: Send + 'static,
        Args: 'static,
        I: Fn() -> S + Send + Sync + 'static,
        St: StepFunction<S, Args>,
        Fi: Fn(S) -> R + Send + Sync + 'static,
        R: CallbackOutput,
    {
        let function = FnAggregate::new(name, initial_state, step, finalize);
        self.register_aggregate_function(function)
    }

    pub fn register_aggregate_function<F>(&mut self, function: F) -> Result<()>
    where
        F: AggregateFunction + 'static,
        F::State: 'static,
    {
        self.install(FunctionEntry::Aggregate(Arc::new(AggregateAdapter::new(function))))
    }

    /// Register a two-argument boolean function.
    ///
    /// Under the names `regexp`, `match`, `glob` and `like` the predicate
    /// also serves the infix operator, called as `name(rhs, lhs)`.
    pub fn register_predicate<A, B, R, F>(&mut self, name: &str, func: F) -> Result<()>
    where
        F: Fn(A, B) -> R + Send + Sync + 'static,
        A: FromSqlValue + 'static,
        B: FromSqlValue + 'static,
        R: PredicateOutput + 'static,
    {
        self.register_predicate_function(Predicate::new(name, func))
    }

    /// Register a prebuilt `Predicate`, e.g. one marked non-deterministic.
    pub fn register_predicate_function<A, B, R, F>(
        &mut self,
        predicate: Predicate<F, A, B>,
    ) -> Result<()>
    where
        F: Fn(A, B) -> R + Send + Sync + 'static,
        A: FromSqlValue + 'static,
        B: FromSqlValue + 'static,
        R: PredicateOutput + 'static,
    {
        let operator = predicate.operator();
        self.install(FunctionEntry::Predicate {
            function: Arc::new(predicate),
            operator,
        })
    }

    fn install(&mut self, entry: FunctionEntry) -> Result<()> {
        let key = self.functions.admit(entry.name(), entry.arity())?;
        match &entry {
            FunctionEntry::Scalar(function) | FunctionEntry::Predicate { function, .. } => {
                bridge::install_scalar(&self.conn, &key.name, Arc::clone(function), &self.failures)?
            }
            FunctionEntry::Aggregate(function) => {
                bridge::install_aggregate(&self.conn, &key.name, Arc::clone(function), &self.failures)?
            }
        }
        let kind = entry.kind();
        if let Some(previous) = self.functions.insert(key.clone(), entry) {
            warn!(
                function = %key.name,
                arity = %key.arity,
                replaced = %previous.kind(),
                by = %kind,
                "function replaced"
            );
        } else {
            debug!(function = %key.name, arity = %key.arity, %kind, "function registered");
        }
        Ok(())
    }

    /// Unregister the function stored under `name` and `arity`.
    pub fn remove_function(&mut self, name: &str, arity: Arity) -> Result<()> {
        if self.functions.get(name, arity).is_none() {
            return Err(Error::registration(
                name,
                format!("no function is registered with {arity}"),
            ));
        }
        let key = FunctionKey::new(name, arity);
        bridge::uninstall(&self.conn, &key.name, arity)?;
        self.functions.remove(name, arity);
        Ok(())
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.functions.iter()
    }

    /// The entry a call to `name` with `num_args` arguments resolves to.
    pub fn function(&self, name: &str, num_args: usize) -> Option<&FunctionEntry> {
        self.functions.find(name, num_args)
    }

    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.failures.scoped(|| self.conn.execute(sql, params))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.failures.scoped(|| self.conn.execute_batch(sql))
    }

    /// First column of the first row, converted to `T`.
    pub fn query_scalar<T: FromSqlValue, P: Params>(&self, sql: &str, params: P) -> Result<T> {
        let value = self.failures.scoped(|| {
            self.conn
                .query_row(sql, params, |row| row.get_ref(0).map(SqlValue::try_from))
        })??;
        T::from_sql_value(&value)
    }

    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>> {
        let stmt = self.conn.prepare(sql)?;
        Ok(Statement::new(stmt, self.failures.clone()))
    }

    /// Prepare each statement of a multi-statement script in turn.
    pub fn statements<'a>(&'a self, sql: &'a str) -> Statements<'a> {
        Statements {
            batch: rusqlite::Batch::new(&self.conn, sql),
            failures: self.failures.clone(),
            done: false,
        }
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    pub fn changes(&self) -> u64 {
        self.conn.changes()
    }

    /// Close the connection, dropping every registration with it.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| Error::Engine(e))
    }
}

pub struct Statements<'conn> {
    batch: rusqlite::Batch<'conn, 'conn>,
    failures: FailureSlot,
    done: bool,
}

impl<'conn> Iterator for Statements<'conn> {
    type Item = Result<Statement<'conn>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.batch.next() {
            Ok(Some(stmt)) => Some(Ok(Statement::new(stmt, self.failures.clone()))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(Error::Engine(e)))
            }
        }
    }
}

pub struct Statement<'conn> {
    stmt: rusqlite::Statement<'conn>,
    columns: Arc<[String]>,
    failures: FailureSlot,
}

impl<'conn> Statement<'conn> {
    fn new(stmt: rusqlite::Statement<'conn>, failures: FailureSlot) -> Self {
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        Self {
            stmt,
            columns,
            failures,
        }
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn execute<P: Params>(&mut self, params: P) -> Result<usize> {
        self.failures.scoped(|| self.stmt.execute(params))
    }

    /// Run the statement. Rows are produced as the iterator is advanced.
    pub fn query<P: Params>(&mut self, params: P) -> Result<Rows<'_>> {
        let rows = self.stmt.query(params)?;
        let id = self.failures.begin();
        Ok(Rows {
            rows: Some(rows),
            columns: Arc::clone(&self.columns),
            failures: self.failures.clone(),
            id,
        })
    }
}

pub struct Rows<'stmt> {
    // `None` once the statement has finished or failed.
    rows: Option<rusqlite::Rows<'stmt>>,
    columns: Arc<[String]>,
    failures: FailureSlot,
    id: StatementId,
}

impl Rows<'_> {
    /// Reset the statement under its own id, so finalizers of unfinished
    /// groups see whether this statement failed.
    fn close(&mut self) {
        self.failures.enter(self.id);
        self.rows = None;
        self.failures.finish(self.id);
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        let rows = self.rows.as_mut()?;
        self.failures.enter(self.id);
        let step = match rows.next() {
            Ok(Some(row)) => (0..self.columns.len())
                .map(|i| row.get_ref(i).map_err(Error::from).and_then(SqlValue::try_from))
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(self.failures.resolve(self.id, e)),
        };
        match step {
            Ok(Some(values)) => Some(Ok(Row {
                columns: Arc::clone(&self.columns),
                values,
            })),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for Rows<'_> {
    fn drop(&mut self) {
        if self.rows.is_some() {
            self.close();
        }
    }
}

/// Column lookup by position or (case-insensitive) name.
pub trait ColumnIndex {
    fn column_index(&self, columns: &[String]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn column_index(&self, columns: &[String]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::Engine(rusqlite::Error::InvalidColumnIndex(*self)))
        }
    }
}

impl ColumnIndex for &str {
    fn column_index(&self, columns: &[String]) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(self))
            .ok_or_else(|| Error::Engine(rusqlite::Error::InvalidColumnName(self.to_string())))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn get<T: FromSqlValue>(&self, idx: impl ColumnIndex) -> Result<T> {
        let i = idx.column_index(&self.columns)?;
        T::from_sql_value(&self.values[i])
    }

    pub fn value(&self, idx: impl ColumnIndex) -> Option<&SqlValue> {
        let i = idx.column_index(&self.columns).ok()?;
        self.values.get(i)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}
