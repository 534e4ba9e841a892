///
/// Two-argument boolean predicates and infix operators.
///
/// A predicate is a scalar function with a fixed arity of two and a boolean
/// result (stored as INTEGER 1/0, NULL for unknown). The engine dispatches a
/// handful of infix operators to user functions by name:
///
///   lhs REGEXP rhs  ->  regexp(rhs, lhs)
///   lhs MATCH rhs   ->  match(rhs, lhs)
///   lhs GLOB rhs    ->  glob(rhs, lhs)
///   lhs LIKE rhs    ->  like(rhs, lhs)
///
/// so a predicate registered under one of those names receives the pattern
/// first and the tested value second. Any other name is reachable only with
/// call syntax, `name(a, b)`.
///

use std::fmt;
use std::marker::PhantomData;

use crate::errors::{Error, Result};
use crate::scalar::{Arity, ScalarFunction, null_propagates};
use crate::value::{FromSqlValue, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfixOperator {
    Regexp,
    Match,
    Glob,
    Like,
}

impl InfixOperator {
    /// The operator the engine routes to a function with this name.
    pub fn for_function(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "regexp" => Some(InfixOperator::Regexp),
            "match" => Some(InfixOperator::Match),
            "glob" => Some(InfixOperator::Glob),
            "like" => Some(InfixOperator::Like),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            InfixOperator::Regexp => "REGEXP",
            InfixOperator::Match => "MATCH",
            InfixOperator::Glob => "GLOB",
            InfixOperator::Like => "LIKE",
        }
    }
}

impl fmt::Display for InfixOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

/// What a predicate closure may return. `None` is SQL NULL (unknown).
pub trait PredicateOutput {
    fn into_truth(self) -> Result<Option<bool>>;
}

impl PredicateOutput for bool {
    fn into_truth(self) -> Result<Option<bool>> {
        Ok(Some(self))
    }
}

impl PredicateOutput for Option<bool> {
    fn into_truth(self) -> Result<Option<bool>> {
        Ok(self)
    }
}

impl PredicateOutput for Result<bool> {
    fn into_truth(self) -> Result<Option<bool>> {
        self.map(Some)
    }
}

impl PredicateOutput for Result<Option<bool>> {
    fn into_truth(self) -> Result<Option<bool>> {
        self
    }
}

/// `ScalarFunction` backed by a two-parameter boolean closure.
pub struct Predicate<F, A, B> {
    name: String,
    operator: Option<InfixOperator>,
    deterministic: bool,
    func: F,
    _args: PhantomData<fn(A, B)>,
}

impl<F, A, B, R> Predicate<F, A, B>
where
    F: Fn(A, B) -> R,
{
    pub fn new(name: &str, func: F) -> Self {
        Self {
            name: name.to_string(),
            operator: InfixOperator::for_function(name),
            deterministic: true,
            func,
            _args: PhantomData,
        }
    }

    pub fn operator(&self) -> Option<InfixOperator> {
        self.operator
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }
}

impl<F, A, B, R> ScalarFunction for Predicate<F, A, B>
where
    F: Fn(A, B) -> R + Send + Sync,
    A: FromSqlValue,
    B: FromSqlValue,
    R: PredicateOutput,
{
    fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
        let [a, b] = args else {
            return Err(Error::execution(
                &self.name,
                format!("expected 2 argument(s), got {}", args.len()),
            ));
        };
        if null_propagates(args, &[A::ACCEPTS_NULL, B::ACCEPTS_NULL]) {
            return Ok(SqlValue::Null);
        }
        let truth = (self.func)(A::from_sql_value(a)?, B::from_sql_value(b)?).into_truth()?;
        Ok(truth.map_or(SqlValue::Null, SqlValue::from))
    }

    fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(2)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
