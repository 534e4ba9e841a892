///
/// SQL values crossing the bridge.
///
/// `SqlValue` is the tagged union the engine hands to callbacks and accepts
/// back from them. Conversions to host types go through `FromSqlValue` and
/// are strict: the only implicit widening is INTEGER to `f64`. Everything
/// else that does not match fails with `Error::TypeCoercion`.
///
/// `CallbackOutput` is the other direction, implemented for the host types a
/// callback may return (plus `Option` for NULL and `Result` for failures).
///

use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    Null,
    Integer,
    Real,
    Text,
    Blob,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlType::Null => "NULL",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
        };
        f.write_str(name)
    }
}

impl SqlValue {
    pub fn sql_type(&self) -> SqlType {
        match self {
            SqlValue::Null => SqlType::Null,
            SqlValue::Integer(_) => SqlType::Integer,
            SqlValue::Real(_) => SqlType::Real,
            SqlValue::Text(_) => SqlType::Text,
            SqlValue::Blob(_) => SqlType::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Convert to a host type, failing on any mismatch.
    pub fn get<T: FromSqlValue>(&self) -> Result<T> {
        T::from_sql_value(self)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Integer(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => f.write_str(s),
            SqlValue::Blob(b) => {
                f.write_str("x'")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                f.write_str("'")
            }
        }
    }
}

/// TEXT that is not valid UTF-8 is a `TypeCoercion` error, never repaired.
impl TryFrom<ValueRef<'_>> for SqlValue {
    type Error = Error;

    fn try_from(value: ValueRef<'_>) -> Result<Self> {
        Ok(match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Integer(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) => {
                let text = std::str::from_utf8(t).map_err(|_| Error::TypeCoercion {
                    expected: "String",
                    found: SqlType::Text,
                })?;
                SqlValue::Text(text.to_string())
            }
            ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
        })
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(i) => Value::Integer(i),
            SqlValue::Real(r) => Value::Real(r),
            SqlValue::Text(s) => Value::Text(s),
            SqlValue::Blob(b) => Value::Blob(b),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            SqlValue::Null => ValueRef::Null,
            SqlValue::Integer(i) => ValueRef::Integer(*i),
            SqlValue::Real(r) => ValueRef::Real(*r),
            SqlValue::Text(s) => ValueRef::Text(s.as_bytes()),
            SqlValue::Blob(b) => ValueRef::Blob(b),
        };
        Ok(ToSqlOutput::Borrowed(value))
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Blob(value)
    }
}

/// Strict conversion from a SQL value into a host parameter type.
pub trait FromSqlValue: Sized {
    /// Whether SQL NULL is a legal input. Callbacks whose parameters do not
    /// accept NULL are skipped and yield NULL themselves.
    const ACCEPTS_NULL: bool = false;

    fn from_sql_value(value: &SqlValue) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &SqlValue) -> Error {
    Error::TypeCoercion {
        expected,
        found: value.sql_type(),
    }
}

impl FromSqlValue for SqlValue {
    const ACCEPTS_NULL: bool = true;

    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromSqlValue for i64 {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Integer(i) => Ok(*i),
            other => Err(mismatch("i64", other)),
        }
    }
}

impl FromSqlValue for i32 {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Integer(i) => i32::try_from(*i).map_err(|_| mismatch("i32", value)),
            other => Err(mismatch("i32", other)),
        }
    }
}

impl FromSqlValue for f64 {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Real(r) => Ok(*r),
            SqlValue::Integer(i) => Ok(*i as f64),
            other => Err(mismatch("f64", other)),
        }
    }
}

impl FromSqlValue for bool {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Integer(i) => Ok(*i != 0),
            other => Err(mismatch("bool", other)),
        }
    }
}

impl FromSqlValue for String {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Text(s) => Ok(s.clone()),
            other => Err(mismatch("String", other)),
        }
    }
}

impl FromSqlValue for Vec<u8> {
    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Blob(b) => Ok(b.clone()),
            other => Err(mismatch("Vec<u8>", other)),
        }
    }
}

impl<T: FromSqlValue> FromSqlValue for Option<T> {
    const ACCEPTS_NULL: bool = true;

    fn from_sql_value(value: &SqlValue) -> Result<Self> {
        match value {
            SqlValue::Null => Ok(None),
            other => T::from_sql_value(other).map(Some),
        }
    }
}

/// A value a callback may hand back to the engine.
pub trait CallbackOutput {
    fn into_sql_result(self) -> Result<SqlValue>;
}

macro_rules! infallible_output {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CallbackOutput for $ty {
                fn into_sql_result(self) -> Result<SqlValue> {
                    Ok(SqlValue::from(self))
                }
            }
        )*
    };
}

infallible_output!(SqlValue, i64, i32, f64, bool, String, &'static str, Vec<u8>);

impl<T: CallbackOutput> CallbackOutput for Option<T> {
    fn into_sql_result(self) -> Result<SqlValue> {
        match self {
            Some(value) => value.into_sql_result(),
            None => Ok(SqlValue::Null),
        }
    }
}

impl<T: CallbackOutput> CallbackOutput for Result<T> {
    fn into_sql_result(self) -> Result<SqlValue> {
        self.and_then(CallbackOutput::into_sql_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widens_to_f64() {
        assert_eq!(SqlValue::Integer(3).get::<f64>().unwrap(), 3.0);
        assert_eq!(SqlValue::Real(2.5).get::<f64>().unwrap(), 2.5);
    }

    #[test]
    fn test_text_never_coerces_to_number() {
        let err = SqlValue::Text("3.5".to_string()).get::<f64>().unwrap_err();
        assert!(matches!(
            err,
            Error::TypeCoercion {
                expected: "f64",
                found: SqlType::Text
            }
        ));

        let err = SqlValue::Text("7".to_string()).get::<i64>().unwrap_err();
        assert!(matches!(err, Error::TypeCoercion { found: SqlType::Text, .. }));
    }

    #[test]
    fn test_real_does_not_truncate_to_integer() {
        let err = SqlValue::Real(1.9).get::<i64>().unwrap_err();
        assert!(matches!(
            err,
            Error::TypeCoercion {
                expected: "i64",
                found: SqlType::Real
            }
        ));
    }

    #[test]
    fn test_i32_rejects_out_of_range() {
        assert_eq!(SqlValue::Integer(-12).get::<i32>().unwrap(), -12);
        let err = SqlValue::Integer(i64::from(i32::MAX) + 1).get::<i32>().unwrap_err();
        assert!(matches!(err, Error::TypeCoercion { expected: "i32", .. }));
    }

    #[test]
    fn test_null_requires_option() {
        assert!(SqlValue::Null.get::<String>().is_err());
        assert_eq!(SqlValue::Null.get::<Option<String>>().unwrap(), None);
        assert_eq!(
            SqlValue::Text("x".to_string()).get::<Option<String>>().unwrap(),
            Some("x".to_string())
        );
        assert!(!<String as FromSqlValue>::ACCEPTS_NULL);
        assert!(<Option<String> as FromSqlValue>::ACCEPTS_NULL);
        assert!(<SqlValue as FromSqlValue>::ACCEPTS_NULL);
    }

    #[test]
    fn test_callback_outputs() {
        assert_eq!(true.into_sql_result().unwrap(), SqlValue::Integer(1));
        assert_eq!(2.5f64.into_sql_result().unwrap(), SqlValue::Real(2.5));
        assert_eq!("ok".into_sql_result().unwrap(), SqlValue::Text("ok".to_string()));
        assert_eq!(None::<f64>.into_sql_result().unwrap(), SqlValue::Null);

        let failed: Result<i64> = Err(Error::execution("f", "boom"));
        assert!(matches!(failed.into_sql_result(), Err(Error::Execution { .. })));
    }

    #[test]
    fn test_value_ref_round_trip_through_engine_types() {
        let value = SqlValue::try_from(ValueRef::Text(b"Cylinder A")).unwrap();
        assert_eq!(value, SqlValue::Text("Cylinder A".to_string()));
        assert_eq!(Value::from(value), Value::Text("Cylinder A".to_string()));

        let blob = SqlValue::Blob(vec![0xde, 0xad]);
        assert_eq!(blob.to_string(), "x'dead'");
        assert_eq!(blob.sql_type().to_string(), "BLOB");
    }

    #[test]
    fn test_invalid_utf8_text_is_rejected() {
        let err = SqlValue::try_from(ValueRef::Text(&[0xff, 0x61])).unwrap_err();
        assert!(matches!(
            err,
            Error::TypeCoercion {
                expected: "String",
                found: SqlType::Text
            }
        ));
        assert_eq!(
            SqlValue::try_from(ValueRef::Blob(&[0xff, 0x61])).unwrap(),
            SqlValue::Blob(vec![0xff, 0x61])
        );
    }
}
