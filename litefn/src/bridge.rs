///
/// Installs function-table entries into the embedded engine.
///
/// The engine only knows callbacks that return its own error type, which it
/// flattens into a message when it aborts the statement. To hand the caller
/// the original `Error`, every callback records its failure in the
/// connection's `FailureSlot` before returning; the connection consults the
/// slot whenever a statement fails.
///
/// Several statements can be open on one connection at once, so failures are
/// kept per statement. Each statement gets a `StatementId` when it starts and
/// re-enters it every time it hands control to the engine. Callbacks always
/// run inside whichever statement entered last, and an aggregate finalizer
/// only skips the host finalize for groups of the statement that failed.
///

use std::any::Any;
use std::collections::HashMap;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::Value;
use tracing::debug;

use crate::aggregate::ErasedAggregateFunction;
use crate::errors::{Error, Result};
use crate::scalar::{Arity, ScalarFunction};
use crate::value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct StatementId(u64);

#[derive(Default)]
struct FailureState {
    current: StatementId,
    last_id: u64,
    // Present once the statement has aborted; the error is taken by `resolve`.
    aborted: HashMap<StatementId, Option<Error>>,
}

/// Callback failures of the statements currently open on a connection.
#[derive(Clone, Default)]
pub(crate) struct FailureSlot(Arc<Mutex<FailureState>>);

impl FailureSlot {
    fn with<T>(&self, f: impl FnOnce(&mut FailureState) -> T) -> T {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Start a statement and make it the one callbacks are attributed to.
    pub(crate) fn begin(&self) -> StatementId {
        self.with(|state| {
            state.last_id += 1;
            let id = StatementId(state.last_id);
            state.current = id;
            id
        })
    }

    /// Called before the engine resumes `id`.
    pub(crate) fn enter(&self, id: StatementId) {
        self.with(|state| state.current = id);
    }

    /// Forget everything recorded for `id`.
    pub(crate) fn finish(&self, id: StatementId) {
        self.with(|state| {
            state.aborted.remove(&id);
        });
    }

    /// Run one whole statement, start to reset, under a fresh id.
    pub(crate) fn scoped<T>(&self, run: impl FnOnce() -> rusqlite::Result<T>) -> Result<T> {
        let id = self.begin();
        let result = run().map_err(|e| self.resolve(id, e));
        self.finish(id);
        result
    }

    /// Store `err` for the current statement (unless an earlier failure is
    /// already stored) and turn it into the engine error that aborts it.
    fn record(&self, err: Error) -> rusqlite::Error {
        let message = err.to_string();
        self.with(|state| {
            debug!(error = %message, statement = state.current.0, "callback failed, aborting statement");
            let current = state.current;
            let slot = state.aborted.entry(current).or_insert(None);
            if slot.is_none() {
                *slot = Some(err);
            }
        });
        rusqlite::Error::UserFunctionError(message.into())
    }

    fn is_aborted(&self) -> bool {
        self.with(|state| state.aborted.contains_key(&state.current))
    }

    /// Prefer the recorded callback failure of `id` over the engine's copy
    /// of it.
    pub(crate) fn resolve(&self, id: StatementId, err: rusqlite::Error) -> Error {
        self.with(|state| state.aborted.get_mut(&id).and_then(Option::take))
            .unwrap_or(Error::Engine(err))
    }
}

/// Callback handle moved into engine closures.
///
/// Functions are `Send + Sync` and hold no state the engine could observe
/// half-updated after a panic, so crossing the unwind boundary is sound.
struct Shared<T: ?Sized>(Arc<T>);

impl<T: ?Sized> Shared<T> {
    fn get(&self) -> &T {
        &self.0
    }
}

impl<T: ?Sized> UnwindSafe for Shared<T> {}
impl<T: ?Sized> RefUnwindSafe for Shared<T> {}

/// Accumulator of one group as the engine stores it.
struct GroupState(Box<dyn Any + Send>);

impl UnwindSafe for GroupState {}
impl RefUnwindSafe for GroupState {}

fn function_flags(deterministic: bool) -> FunctionFlags {
    if deterministic {
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC
    } else {
        FunctionFlags::SQLITE_UTF8
    }
}

fn collect_args(ctx: &Context<'_>) -> Result<Vec<SqlValue>> {
    (0..ctx.len()).map(|i| SqlValue::try_from(ctx.get_raw(i))).collect()
}

pub(crate) fn install_scalar(
    conn: &rusqlite::Connection,
    name: &str,
    function: Arc<dyn ScalarFunction>,
    failures: &FailureSlot,
) -> Result<()> {
    let arity = function.arity();
    let flags = function_flags(function.is_deterministic());
    let callback = Shared(function);
    let failures = failures.clone();
    conn.create_scalar_function(name, arity.as_engine_arg(), flags, move |ctx| {
        collect_args(ctx)
            .and_then(|args| callback.get().invoke(&args))
            .map(Value::from)
            .map_err(|err| failures.record(err))
    })?;
    debug!(function = name, %arity, "installed scalar function");
    Ok(())
}

struct AggregateBridge {
    function: Shared<ErasedAggregateFunction>,
    failures: FailureSlot,
}

impl Aggregate<GroupState, Value> for AggregateBridge {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<GroupState> {
        Ok(GroupState(self.function.get().initial_state()))
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut GroupState) -> rusqlite::Result<()> {
        collect_args(ctx)
            .and_then(|args| self.function.get().step(&mut state.0, &args))
            .map_err(|err| self.failures.record(err))
    }

    fn finalize(&self, _ctx: &mut Context<'_>, state: Option<GroupState>) -> rusqlite::Result<Value> {
        if self.failures.is_aborted() {
            return Ok(Value::Null);
        }
        let function = self.function.get();
        // The engine never calls `init` for a group without rows.
        let state = match state {
            Some(GroupState(state)) => state,
            None => function.initial_state(),
        };
        function
            .finalize(state)
            .map(Value::from)
            .map_err(|err| self.failures.record(err))
    }
}

pub(crate) fn install_aggregate(
    conn: &rusqlite::Connection,
    name: &str,
    function: Arc<ErasedAggregateFunction>,
    failures: &FailureSlot,
) -> Result<()> {
    let arity = function.arity();
    let bridge = AggregateBridge {
        function: Shared(function),
        failures: failures.clone(),
    };
    conn.create_aggregate_function(name, arity.as_engine_arg(), function_flags(true), bridge)?;
    debug!(function = name, %arity, "installed aggregate function");
    Ok(())
}

pub(crate) fn uninstall(conn: &rusqlite::Connection, name: &str, arity: Arity) -> Result<()> {
    conn.remove_function(name, arity.as_engine_arg())?;
    debug!(function = name, %arity, "removed function");
    Ok(())
}
