///
/// Aggregate functions.
///
/// An aggregate accumulates over the rows of one group and produces one
/// value per group. The accumulator lives exactly as long as its group:
///
/// 1. `initial_state` creates a fresh accumulator when the group begins.
/// 2. `step` is called once per contributing row, in engine order.
/// 3. `finalize` consumes the accumulator and produces the group's value.
///
/// A group with no rows still gets one `finalize` call on a fresh
/// accumulator, so an aggregate always decides its own empty-group result.
///
/// The function table stores aggregates type-erased behind
/// `AggregateAdapter`, which boxes the concrete state as `dyn Any`.
/// `FnAggregate` builds an aggregate out of three typed closures.
///

use std::any::Any;
use std::marker::PhantomData;

use crate::errors::{Error, Result};
use crate::scalar::{Arity, argument_count_error, null_propagates};
use crate::value::{CallbackOutput, FromSqlValue, SqlValue};

/// An aggregate SQL function.
pub trait AggregateFunction: Send + Sync {
    /// Per-group accumulator.
    type State: Send;

    fn initial_state(&self) -> Self::State;

    fn step(&self, state: &mut Self::State, args: &[SqlValue]) -> Result<()>;

    fn finalize(&self, state: Self::State) -> Result<SqlValue>;

    fn arity(&self) -> Arity;

    fn name(&self) -> &str;
}

/// Type-erased aggregate as stored in the function table.
pub type ErasedAggregateFunction = dyn AggregateFunction<State = Box<dyn Any + Send>>;

/// Wraps a concrete aggregate so heterogeneous aggregates can share one
/// trait-object type.
pub struct AggregateAdapter<F> {
    inner: F,
}

impl<F> AggregateAdapter<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F> AggregateAdapter<F>
where
    F: AggregateFunction,
{
    fn state_mismatch(&self) -> Error {
        Error::execution(self.inner.name(), "accumulator type mismatch")
    }
}

impl<F> AggregateFunction for AggregateAdapter<F>
where
    F: AggregateFunction,
    F::State: 'static,
{
    type State = Box<dyn Any + Send>;

    fn initial_state(&self) -> Self::State {
        Box::new(self.inner.initial_state())
    }

    fn step(&self, state: &mut Self::State, args: &[SqlValue]) -> Result<()> {
        let concrete = state
            .downcast_mut::<F::State>()
            .ok_or_else(|| self.state_mismatch())?;
        self.inner.step(concrete, args)
    }

    fn finalize(&self, state: Self::State) -> Result<SqlValue> {
        let concrete = state
            .downcast::<F::State>()
            .map_err(|_| self.state_mismatch())?;
        self.inner.finalize(*concrete)
    }

    fn arity(&self) -> Arity {
        self.inner.arity()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// What a step closure may return: the next accumulator, or a failure.
pub trait StepOutput<S> {
    fn into_state(self) -> Result<S>;
}

impl<S> StepOutput<S> for S {
    fn into_state(self) -> Result<S> {
        Ok(self)
    }
}

impl<S> StepOutput<S> for Result<S> {
    fn into_state(self) -> Result<S> {
        self
    }
}

/// A step closure `(accumulator, values...) -> accumulator`.
///
/// Rows where a non-`Option` parameter is NULL do not contribute: the
/// accumulator passes through unchanged, as with the engine's own `sum` and
/// `avg`.
pub trait StepFunction<S, Args>: Send + Sync + 'static {
    const PARAMS: usize;

    fn call(&self, state: S, args: &[SqlValue]) -> Result<S>;
}

macro_rules! impl_step_function {
    ($count:expr; $($ty:ident $arg:ident),*) => {
        impl<F, S, O, $($ty,)*> StepFunction<S, ($($ty,)*)> for F
        where
            F: Fn(S, $($ty),*) -> O + Send + Sync + 'static,
            O: StepOutput<S>,
            $($ty: FromSqlValue,)*
        {
            const PARAMS: usize = $count;

            fn call(&self, state: S, args: &[SqlValue]) -> Result<S> {
                let [$($arg),*] = args else {
                    return Err(argument_count_error($count, args.len()));
                };
                if null_propagates(args, &[$(<$ty as FromSqlValue>::ACCEPTS_NULL),*]) {
                    return Ok(state);
                }
                $(let $arg = <$ty as FromSqlValue>::from_sql_value($arg)?;)*
                (self)(state, $($arg),*).into_state()
            }
        }
    };
}

impl_step_function!(0;);
impl_step_function!(1; A a);
impl_step_function!(2; A a, B b);
impl_step_function!(3; A a, B b, C c);

/// `AggregateFunction` assembled from an initial-state factory, a step
/// closure and a finalize closure.
pub struct FnAggregate<I, St, Fi, Args> {
    name: String,
    init: I,
    step: St,
    finalize: Fi,
    _args: PhantomData<fn(Args)>,
}

impl<S, I, St, Fi, Args> FnAggregate<I, St, Fi, Args>
where
    I: Fn() -> S,
    St: StepFunction<S, Args>,
{
    pub fn new(name: &str, init: I, step: St, finalize: Fi) -> Self {
        Self {
            name: name.to_string(),
            init,
            step,
            finalize,
            _args: PhantomData,
        }
    }
}

impl<S, R, I, St, Fi, Args> AggregateFunction for FnAggregate<I, St, Fi, Args>
where
    S: Send + 'static,
    I: Fn() -> S + Send + Sync,
    St: StepFunction<S, Args>,
    Fi: Fn(S) -> R + Send + Sync,
    R: CallbackOutput,
{
    // `None` only while a step is in flight or after it failed.
    type State = Option<S>;

    fn initial_state(&self) -> Self::State {
        Some((self.init)())
    }

    fn step(&self, state: &mut Self::State, args: &[SqlValue]) -> Result<()> {
        let current = state
            .take()
            .ok_or_else(|| Error::execution(&self.name, "accumulator used after a failed step"))?;
        *state = Some(self.step.call(current, args)?);
        Ok(())
    }

    fn finalize(&self, state: Self::State) -> Result<SqlValue> {
        let state =
            state.ok_or_else(|| Error::execution(&self.name, "accumulator used after a failed step"))?;
        (self.finalize)(state).into_sql_result()
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(St::PARAMS)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
