///
/// Scalar (row-level) functions.
///
/// A scalar function maps the arguments of one call site to one value and
/// keeps no state between calls. Two ways to provide one:
///
/// - implement `ScalarFunction` directly (the only way to get a variadic
///   function, since the implementation sees the raw argument slice), or
/// - hand a typed closure to `Connection::register_scalar`, which wraps it
///   in `FnScalar`. Typed closures take 0 to 4 parameters, each converted
///   with `FromSqlValue`, and return anything implementing `CallbackOutput`.
///
/// Typed closures are strict about NULL: when an argument is NULL and the
/// matching parameter is not an `Option`, the closure is not called and the
/// result is NULL.
///

use std::fmt;
use std::marker::PhantomData;

use crate::errors::{Error, Result};
use crate::value::{CallbackOutput, FromSqlValue, SqlValue};

/// Number of arguments a function accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Fixed(usize),
    Variadic,
}

impl Arity {
    /// The engine's encoding: the argument count, or `-1` for variadic.
    pub fn as_engine_arg(self) -> i32 {
        match self {
            Arity::Fixed(n) => i32::try_from(n).unwrap_or(i32::MAX),
            Arity::Variadic => -1,
        }
    }

    pub fn accepts(self, num_args: usize) -> bool {
        match self {
            Arity::Fixed(n) => n == num_args,
            Arity::Variadic => true,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Fixed(n) => write!(f, "{n} argument(s)"),
            Arity::Variadic => f.write_str("a variable number of arguments"),
        }
    }
}

/// A scalar SQL function.
///
/// Implementations are shared behind `Arc` and may be invoked from whatever
/// thread runs the statement, hence `Send + Sync`.
pub trait ScalarFunction: Send + Sync {
    fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue>;

    /// Deterministic functions let the engine fold constant calls.
    fn is_deterministic(&self) -> bool {
        true
    }

    fn arity(&self) -> Arity;

    fn name(&self) -> &str;
}

/// A host closure callable with SQL arguments.
///
/// `Args` is a marker tuple of the closure's parameter types; it only exists
/// so one closure type can have one implementation per parameter count.
pub trait HostFunction<Args>: Send + Sync + 'static {
    const PARAMS: usize;

    fn call(&self, args: &[SqlValue]) -> Result<SqlValue>;
}

pub(crate) fn null_propagates(args: &[SqlValue], accepts_null: &[bool]) -> bool {
    args.iter()
        .zip(accepts_null)
        .any(|(value, accepts)| value.is_null() && !accepts)
}

pub(crate) fn argument_count_error(expected: usize, found: usize) -> Error {
    Error::Execution {
        function: "host callback".to_string(),
        message: format!("expected {expected} argument(s), got {found}"),
    }
}

macro_rules! impl_host_function {
    ($count:expr; $($ty:ident $arg:ident),*) => {
        impl<F, R, $($ty,)*> HostFunction<($($ty,)*)> for F
        where
            F: Fn($($ty),*) -> R + Send + Sync + 'static,
            R: CallbackOutput,
            $($ty: FromSqlValue,)*
        {
            const PARAMS: usize = $count;

            fn call(&self, args: &[SqlValue]) -> Result<SqlValue> {
                let [$($arg),*] = args else {
                    return Err(argument_count_error($count, args.len()));
                };
                if null_propagates(args, &[$(<$ty as FromSqlValue>::ACCEPTS_NULL),*]) {
                    return Ok(SqlValue::Null);
                }
                (self)($(<$ty as FromSqlValue>::from_sql_value($arg)?),*).into_sql_result()
            }
        }
    };
}

impl_host_function!(0;);
impl_host_function!(1; A a);
impl_host_function!(2; A a, B b);
impl_host_function!(3; A a, B b, C c);
impl_host_function!(4; A a, B b, C c, D d);

/// `ScalarFunction` backed by a typed closure.
pub struct FnScalar<F, Args> {
    name: String,
    arity: Arity,
    deterministic: bool,
    func: F,
    _args: PhantomData<fn(Args)>,
}

impl<F, Args> FnScalar<F, Args>
where
    F: HostFunction<Args>,
{
    /// Wrap `func`, checking that its parameter count matches `arity`.
    pub fn new(name: &str, arity: Arity, func: F) -> Result<Self> {
        if arity != Arity::Fixed(F::PARAMS) {
            return Err(Error::ArityMismatch {
                name: name.to_string(),
                declared: arity,
                params: F::PARAMS,
            });
        }
        Ok(Self {
            name: name.to_string(),
            arity,
            deterministic: true,
            func,
            _args: PhantomData,
        })
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }
}

impl<F, Args> ScalarFunction for FnScalar<F, Args>
where
    F: HostFunction<Args>,
{
    fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
        if !self.arity.accepts(args.len()) {
            return Err(Error::execution(
                &self.name,
                format!("expected {}, got {}", self.arity, args.len()),
            ));
        }
        self.func.call(args)
    }

    fn is_deterministic(&self) -> bool {
        self.deterministic
    }

    fn arity(&self) -> Arity {
        self.arity
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;
    use std::sync::Arc;

    use super::*;
    use crate::value::SqlType;

    // -- Variadic concat, only expressible through the trait --

    struct Concat;

    impl ScalarFunction for Concat {
        fn invoke(&self, args: &[SqlValue]) -> Result<SqlValue> {
            let mut out = String::new();
            for arg in args {
                if !arg.is_null() {
                    out.push_str(&arg.to_string());
                }
            }
            Ok(SqlValue::Text(out))
        }

        fn arity(&self) -> Arity {
            Arity::Variadic
        }

        fn name(&self) -> &str {
            "concat_all"
        }
    }

    fn volume() -> FnScalar<impl HostFunction<(f64, f64)>, (f64, f64)> {
        FnScalar::new("volume", Arity::Fixed(2), |radius: f64, height: f64| {
            PI * radius.powi(2) * height
        })
        .unwrap()
    }

    #[test]
    fn test_typed_closure_invoke() {
        let f = volume();
        let result = f
            .invoke(&[SqlValue::Integer(3), SqlValue::Integer(15)])
            .unwrap();
        let SqlValue::Real(v) = result else {
            panic!("expected REAL, got {result:?}");
        };
        assert!((v - 135.0 * PI).abs() < 1e-9);
        assert_eq!(f.arity(), Arity::Fixed(2));
        assert!(f.is_deterministic());
    }

    #[test]
    fn test_arity_mismatch_rejected_at_construction() {
        let err = FnScalar::new("volume", Arity::Fixed(3), |r: f64, h: f64| r * h)
            .err()
            .expect("arity 3 with a 2-parameter closure");
        assert!(matches!(
            err,
            Error::ArityMismatch {
                declared: Arity::Fixed(3),
                params: 2,
                ..
            }
        ));

        let err = FnScalar::new("volume", Arity::Variadic, |r: f64| r)
            .err()
            .expect("typed closures are never variadic");
        assert!(matches!(err, Error::ArityMismatch { declared: Arity::Variadic, .. }));
    }

    #[test]
    fn test_null_propagates_through_strict_parameters() {
        let f = volume();
        assert_eq!(
            f.invoke(&[SqlValue::Null, SqlValue::Integer(2)]).unwrap(),
            SqlValue::Null
        );
    }

    #[test]
    fn test_option_parameter_sees_null() {
        let f = FnScalar::new("ifnull_len", Arity::Fixed(1), |s: Option<String>| {
            s.map_or(-1, |s| s.len() as i64)
        })
        .unwrap();
        assert_eq!(f.invoke(&[SqlValue::Null]).unwrap(), SqlValue::Integer(-1));
        assert_eq!(
            f.invoke(&[SqlValue::Text("abc".to_string())]).unwrap(),
            SqlValue::Integer(3)
        );
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let f = volume();
        let err = f
            .invoke(&[SqlValue::Text("two".to_string()), SqlValue::Integer(1)])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TypeCoercion {
                expected: "f64",
                found: SqlType::Text
            }
        ));
    }

    #[test]
    fn test_wrong_argument_count_at_invoke() {
        let f = volume();
        let err = f.invoke(&[SqlValue::Integer(1)]).unwrap_err();
        assert!(matches!(err, Error::Execution { ref function, .. } if function == "volume"));
    }

    #[test]
    fn test_zero_argument_closure() {
        let f = FnScalar::new("answer", Arity::Fixed(0), || 42i64)
            .unwrap()
            .with_deterministic(false);
        assert_eq!(f.invoke(&[]).unwrap(), SqlValue::Integer(42));
        assert!(!f.is_deterministic());
    }

    #[test]
    fn test_fallible_closure() {
        let f = FnScalar::new("checked_div", Arity::Fixed(2), |a: i64, b: i64| {
            a.checked_div(b)
                .ok_or_else(|| Error::execution("checked_div", "division by zero"))
        })
        .unwrap();
        assert_eq!(
            f.invoke(&[SqlValue::Integer(9), SqlValue::Integer(3)]).unwrap(),
            SqlValue::Integer(3)
        );
        let err = f
            .invoke(&[SqlValue::Integer(1), SqlValue::Integer(0)])
            .unwrap_err();
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_variadic_trait_object() {
        let f: Arc<dyn ScalarFunction> = Arc::new(Concat);
        assert_eq!(f.arity(), Arity::Variadic);
        assert_eq!(
            f.invoke(&[
                SqlValue::Text("a".to_string()),
                SqlValue::Null,
                SqlValue::Integer(1),
            ])
            .unwrap(),
            SqlValue::Text("a1".to_string())
        );
        assert_eq!(f.invoke(&[]).unwrap(), SqlValue::Text(String::new()));
    }

    #[test]
    fn test_arity_engine_encoding() {
        assert_eq!(Arity::Fixed(2).as_engine_arg(), 2);
        assert_eq!(Arity::Variadic.as_engine_arg(), -1);
        assert!(Arity::Variadic.accepts(7));
        assert!(!Arity::Fixed(1).accepts(2));
    }
}
