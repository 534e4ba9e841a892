///
/// Error types for the function bridge.
///
/// Registration problems (`Registration`, `ArityMismatch`) are reported
/// before any query runs. Callback failures (`TypeCoercion`, `Execution`)
/// abort the statement that triggered them and reach the caller unchanged.
/// Whatever the engine itself reports is passed through in `Engine`.
///

use thiserror::Error;

use crate::scalar::Arity;
use crate::value::SqlType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot register function '{name}': {reason}")]
    Registration { name: String, reason: String },

    #[error("Function '{name}' declared with {declared} but its callback takes {params} parameter(s)")]
    ArityMismatch {
        name: String,
        declared: Arity,
        params: usize,
    },

    #[error("Cannot convert SQL {found} value to {expected}")]
    TypeCoercion { expected: &'static str, found: SqlType },

    #[error("Function '{function}' failed: {message}")]
    Execution { function: String, message: String },

    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Engine(#[from] rusqlite::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Error a callback returns to abort the running statement.
    pub fn execution(function: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Execution {
            function: function.into(),
            message: message.into(),
        }
    }

    pub(crate) fn registration(name: &str, reason: impl Into<String>) -> Self {
        Error::Registration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = Error::registration("stdev", "already registered with 1 argument(s)");
        assert!(err.to_string().contains("Cannot register function 'stdev'"));
        assert!(err.to_string().contains("already registered"));

        let err = Error::ArityMismatch {
            name: "volume".to_string(),
            declared: Arity::Fixed(3),
            params: 2,
        };
        assert!(err.to_string().contains("'volume'"));
        assert!(err.to_string().contains("3 argument(s)"));
        assert!(err.to_string().contains("takes 2 parameter(s)"));

        let err = Error::TypeCoercion {
            expected: "f64",
            found: SqlType::Text,
        };
        assert_eq!(err.to_string(), "Cannot convert SQL TEXT value to f64");

        let err = Error::execution("regexp", "invalid pattern");
        assert_eq!(err.to_string(), "Function 'regexp' failed: invalid pattern");

        let err = Error::InvalidConnectionString("unknown keyword 'pooling'".to_string());
        assert!(err.to_string().contains("Invalid connection string"));
        assert!(err.to_string().contains("pooling"));
    }

    #[test]
    fn test_engine_error_passes_through_verbatim() {
        let engine = rusqlite::Error::QueryReturnedNoRows;
        let expected = engine.to_string();
        let err = Error::from(engine);
        assert_eq!(err.to_string(), expected);
        assert!(matches!(err, Error::Engine(rusqlite::Error::QueryReturnedNoRows)));
    }
}
