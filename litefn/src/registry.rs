///
/// Per-connection function table.
///
/// Every function installed on a connection is recorded here under a
/// `FunctionKey` of `(lowercase name, arity)`. The table is what decides
/// whether a registration is admissible (name rules, arity limits, collision
/// policy) before the engine is touched, and it answers introspection
/// queries afterwards.
///
/// Lookup strategy:
/// 1. Exact match on `(name, Fixed(num_args))`.
/// 2. Fallback to `(name, Variadic)`.
/// 3. `None`.
///

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::aggregate::ErasedAggregateFunction;
use crate::errors::{Error, Result};
use crate::predicate::InfixOperator;
use crate::scalar::{Arity, ScalarFunction};

/// Largest argument count the engine accepts for a user function.
pub const MAX_FUNCTION_ARGS: usize = 127;

/// Longest function name, in bytes, the engine accepts.
pub const MAX_NAME_LEN: usize = 255;

/// Keywords the parser never dispatches through a function call; a function
/// registered under one of these names could never be called.
const RESERVED_NAMES: &[&str] = &[
    "and", "between", "case", "cast", "collate", "exists", "in", "is", "not", "or", "raise",
];

/// What happens when a registration reuses an existing `(name, arity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Refuse the second registration.
    #[default]
    Error,
    /// The second registration replaces the first.
    Replace,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FunctionKey {
    pub name: String,
    pub arity: Arity,
}

impl FunctionKey {
    pub fn new(name: &str, arity: Arity) -> Self {
        Self {
            name: canonical_name(name),
            arity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Scalar,
    Aggregate,
    Predicate,
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            FunctionKind::Scalar => "scalar",
            FunctionKind::Aggregate => "aggregate",
            FunctionKind::Predicate => "predicate",
        };
        f.write_str(kind)
    }
}

#[derive(Clone)]
pub enum FunctionEntry {
    Scalar(Arc<dyn ScalarFunction>),
    Aggregate(Arc<ErasedAggregateFunction>),
    Predicate {
        function: Arc<dyn ScalarFunction>,
        operator: Option<InfixOperator>,
    },
}

impl FunctionEntry {
    pub fn kind(&self) -> FunctionKind {
        match self {
            FunctionEntry::Scalar(_) => FunctionKind::Scalar,
            FunctionEntry::Aggregate(_) => FunctionKind::Aggregate,
            FunctionEntry::Predicate { .. } => FunctionKind::Predicate,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FunctionEntry::Scalar(f) | FunctionEntry::Predicate { function: f, .. } => f.name(),
            FunctionEntry::Aggregate(f) => f.name(),
        }
    }

    pub fn arity(&self) -> Arity {
        match self {
            FunctionEntry::Scalar(f) | FunctionEntry::Predicate { function: f, .. } => f.arity(),
            FunctionEntry::Aggregate(f) => f.arity(),
        }
    }

    /// The infix operator that reaches this entry, if any.
    pub fn operator(&self) -> Option<InfixOperator> {
        match self {
            FunctionEntry::Predicate { operator, .. } => *operator,
            _ => None,
        }
    }
}

impl fmt::Debug for FunctionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("arity", &self.arity())
            .field("operator", &self.operator())
            .finish()
    }
}

#[derive(Default)]
pub struct FunctionTable {
    entries: HashMap<FunctionKey, FunctionEntry>,
    policy: ConflictPolicy,
}

impl FunctionTable {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// Check that `name`/`arity` may be registered and return its key.
    ///
    /// Nothing is recorded; call `insert` once the engine has accepted the
    /// function.
    pub fn admit(&self, name: &str, arity: Arity) -> Result<FunctionKey> {
        validate_name(name)?;
        if let Arity::Fixed(n) = arity {
            if n > MAX_FUNCTION_ARGS {
                return Err(Error::registration(
                    name,
                    format!("{n} arguments exceeds the limit of {MAX_FUNCTION_ARGS}"),
                ));
            }
        }
        let key = FunctionKey::new(name, arity);
        if self.policy == ConflictPolicy::Error {
            if let Some(existing) = self.entries.get(&key) {
                return Err(Error::registration(
                    name,
                    format!(
                        "a {} function is already registered with {}",
                        existing.kind(),
                        arity
                    ),
                ));
            }
        }
        Ok(key)
    }

    /// Record `entry`, returning the entry it replaced.
    pub fn insert(&mut self, key: FunctionKey, entry: FunctionEntry) -> Option<FunctionEntry> {
        self.entries.insert(key, entry)
    }

    pub fn remove(&mut self, name: &str, arity: Arity) -> Option<FunctionEntry> {
        self.entries.remove(&FunctionKey::new(name, arity))
    }

    pub fn get(&self, name: &str, arity: Arity) -> Option<&FunctionEntry> {
        self.entries.get(&FunctionKey::new(name, arity))
    }

    /// Resolve the entry a call with `num_args` arguments would reach.
    pub fn find(&self, name: &str, num_args: usize) -> Option<&FunctionEntry> {
        let canon = canonical_name(name);
        let exact = FunctionKey {
            name: canon.clone(),
            arity: Arity::Fixed(num_args),
        };
        if let Some(entry) = self.entries.get(&exact) {
            trace!(name = %canon, arity = num_args, hit = "exact", "function lookup");
            return Some(entry);
        }
        let variadic = FunctionKey {
            name: canon.clone(),
            arity: Arity::Variadic,
        };
        let result = self.entries.get(&variadic);
        trace!(
            name = %canon,
            arity = num_args,
            hit = if result.is_some() { "variadic" } else { "miss" },
            "function lookup"
        );
        result
    }

    /// Whether any entry has this name, whatever its arity.
    pub fn contains(&self, name: &str) -> bool {
        let canon = canonical_name(name);
        self.entries.keys().any(|k| k.name == canon)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FunctionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::registration(name, "name is empty"));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::registration(
            name,
            format!("name is longer than {MAX_NAME_LEN} bytes"),
        ));
    }
    if trimmed.contains('\0') {
        return Err(Error::registration(name, "name contains a NUL byte"));
    }
    let canon = canonical_name(trimmed);
    if RESERVED_NAMES.contains(&canon.as_str()) {
        return Err(Error::registration(
            name,
            "name is an SQL keyword the engine does not allow as a function",
        ));
    }
    Ok(())
}

pub(crate) fn canonical_name(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{AggregateAdapter, FnAggregate};
    use crate::predicate::Predicate;
    use crate::scalar::FnScalar;
    use crate::value::SqlValue;

    fn double() -> FunctionEntry {
        let f = FnScalar::new("double", Arity::Fixed(1), |x: i64| x * 2).unwrap();
        FunctionEntry::Scalar(Arc::new(f))
    }

    fn total() -> FunctionEntry {
        let f = FnAggregate::new("total", || 0i64, |acc: i64, v: i64| acc + v, |acc: i64| acc);
        FunctionEntry::Aggregate(Arc::new(AggregateAdapter::new(f)))
    }

    struct AnyArgs;

    impl ScalarFunction for AnyArgs {
        fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
            Ok(SqlValue::Integer(args.len() as i64))
        }

        fn arity(&self) -> Arity {
            Arity::Variadic
        }

        fn name(&self) -> &str {
            "double"
        }
    }

    fn register(table: &mut FunctionTable, entry: FunctionEntry) -> Result<Option<FunctionEntry>> {
        let key = table.admit(entry.name(), entry.arity())?;
        Ok(table.insert(key, entry))
    }

    #[test]
    fn test_register_and_case_insensitive_lookup() {
        let mut table = FunctionTable::default();
        assert!(register(&mut table, double()).unwrap().is_none());

        assert!(table.contains("DOUBLE"));
        assert!(table.find("Double", 1).is_some());
        assert!(table.find(" double ", 1).is_some());
        assert!(table.find("double", 2).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_variadic_fallback() {
        let mut table = FunctionTable::default();
        register(&mut table, double()).unwrap();
        register(&mut table, FunctionEntry::Scalar(Arc::new(AnyArgs))).unwrap();

        assert_eq!(table.find("double", 1).unwrap().arity(), Arity::Fixed(1));
        assert_eq!(table.find("double", 3).unwrap().arity(), Arity::Variadic);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_collision_rejected_by_default() {
        let mut table = FunctionTable::default();
        register(&mut table, double()).unwrap();

        let err = register(&mut table, double()).unwrap_err();
        assert!(matches!(err, Error::Registration { .. }));
        assert!(err.to_string().contains("already registered"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_collision_across_kinds() {
        let mut table = FunctionTable::default();
        register(&mut table, total()).unwrap();
        let clash = FnScalar::new("TOTAL", Arity::Fixed(1), |x: i64| x).unwrap();
        let err = register(&mut table, FunctionEntry::Scalar(Arc::new(clash))).unwrap_err();
        assert!(err.to_string().contains("aggregate function is already registered"));
    }

    #[test]
    fn test_replace_policy_returns_previous() {
        let mut table = FunctionTable::new(ConflictPolicy::Replace);
        register(&mut table, double()).unwrap();
        let previous = register(&mut table, double()).unwrap();
        assert_eq!(previous.map(|e| e.kind()), Some(FunctionKind::Scalar));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reserved_and_invalid_names() {
        let table = FunctionTable::default();
        for name in ["cast", "EXISTS", " raise "] {
            let err = table.admit(name, Arity::Fixed(1)).unwrap_err();
            assert!(err.to_string().contains("SQL keyword"), "{name}: {err}");
        }
        assert!(table.admit("", Arity::Fixed(0)).is_err());
        assert!(table.admit("bad\0name", Arity::Fixed(0)).is_err());
        assert!(table.admit(&"f".repeat(MAX_NAME_LEN + 1), Arity::Fixed(0)).is_err());
        assert!(table.admit("fine", Arity::Fixed(MAX_FUNCTION_ARGS + 1)).is_err());
        assert!(table.admit("fine", Arity::Fixed(MAX_FUNCTION_ARGS)).is_ok());
    }

    #[test]
    fn test_predicate_entry_reports_operator() {
        let mut table = FunctionTable::default();
        let f = Predicate::new("regexp", |p: String, s: String| s.contains(&p));
        let entry = FunctionEntry::Predicate {
            operator: f.operator(),
            function: Arc::new(f),
        };
        register(&mut table, entry).unwrap();

        let found = table.find("REGEXP", 2).unwrap();
        assert_eq!(found.kind(), FunctionKind::Predicate);
        assert_eq!(found.operator(), Some(InfixOperator::Regexp));
    }

    #[test]
    fn test_remove() {
        let mut table = FunctionTable::default();
        register(&mut table, double()).unwrap();
        assert!(table.remove("DOUBLE", Arity::Fixed(1)).is_some());
        assert!(table.remove("double", Arity::Fixed(1)).is_none());
        assert!(table.is_empty());
    }
}
