///
/// Built-in functions a connection can opt into:
///
/// - `stdev(x)`: population standard deviation (aggregate)
/// - `volume(radius, height)`: volume of a cylinder (scalar)
/// - `regexp(pattern, text)`: regular-expression match, also reachable as
///   `text REGEXP pattern`
///

use std::f64::consts::PI;
use std::sync::{Mutex, PoisonError};

use regex::Regex;

use crate::aggregate::AggregateFunction;
use crate::connection::Connection;
use crate::errors::{Error, Result};
use crate::scalar::Arity;
use crate::value::SqlValue;

pub const BUILTIN_NAMES: &[&str] = &["stdev", "volume", "regexp"];

/// Running `(count, sum, sum of squares)` of the values seen so far.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StdevAccumulator {
    count: u64,
    sum: f64,
    sum_of_squares: f64,
}

impl StdevAccumulator {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.sum_of_squares += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `None` when no values were pushed.
    pub fn population_stdev(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        // Rounding can push a zero variance slightly negative.
        let variance = (self.sum_of_squares - self.sum * self.sum / n).max(0.0);
        Some((variance / n).sqrt())
    }
}

struct Stdev;

impl AggregateFunction for Stdev {
    type State = StdevAccumulator;

    fn initial_state(&self) -> StdevAccumulator {
        StdevAccumulator::default()
    }

    fn step(&self, state: &mut StdevAccumulator, args: &[SqlValue]) -> Result<()> {
        match args {
            [SqlValue::Null] => Ok(()),
            [value] => {
                state.push(value.get::<f64>()?);
                Ok(())
            }
            _ => Err(Error::execution(
                "stdev",
                format!("expected 1 argument(s), got {}", args.len()),
            )),
        }
    }

    fn finalize(&self, state: StdevAccumulator) -> Result<SqlValue> {
        Ok(state
            .population_stdev()
            .map_or(SqlValue::Null, SqlValue::Real))
    }

    fn arity(&self) -> Arity {
        Arity::Fixed(1)
    }

    fn name(&self) -> &str {
        "stdev"
    }
}

pub fn register_stdev(conn: &mut Connection) -> Result<()> {
    conn.register_aggregate_function(Stdev)
}

pub fn cylinder_volume(radius: f64, height: f64) -> f64 {
    PI * radius.powi(2) * height
}

pub fn register_volume(conn: &mut Connection) -> Result<()> {
    conn.register_scalar("volume", Arity::Fixed(2), cylinder_volume)
}

/// Compiled form of the most recent pattern. Queries usually apply one
/// pattern to every row.
#[derive(Default)]
struct PatternCache {
    last: Mutex<Option<(String, Regex)>>,
}

impl PatternCache {
    fn is_match(&self, pattern: &str, text: &str) -> Result<bool> {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((cached, re)) = last.as_ref() {
            if cached == pattern {
                return Ok(re.is_match(text));
            }
        }
        let re = Regex::new(pattern)
            .map_err(|e| Error::execution("regexp", format!("invalid pattern: {e}")))?;
        let matched = re.is_match(text);
        *last = Some((pattern.to_string(), re));
        Ok(matched)
    }
}

pub fn register_regexp(conn: &mut Connection) -> Result<()> {
    let cache = PatternCache::default();
    conn.register_predicate("regexp", move |pattern: String, text: String| {
        cache.is_match(&pattern, &text)
    })
}

pub fn register_builtins(conn: &mut Connection) -> Result<()> {
    for name in BUILTIN_NAMES {
        register_builtin(conn, name)?;
    }
    Ok(())
}

pub fn register_builtin(conn: &mut Connection, name: &str) -> Result<()> {
    match name.to_ascii_lowercase().as_str() {
        "stdev" => register_stdev(conn),
        "volume" => register_volume(conn),
        "regexp" => register_regexp(conn),
        _ => Err(Error::Config(format!("unknown builtin function '{name}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_matches_closed_form() {
        let values = [3.5, 3.7, 2.8, 3.9, 3.2];
        let mut acc = StdevAccumulator::default();
        values.iter().for_each(|v| acc.push(*v));

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let expected = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();

        let got = acc.population_stdev().unwrap();
        assert_eq!(acc.count(), 5);
        assert!((got - expected).abs() <= expected * 1e-9);
        assert!((got - 0.38678159211627366).abs() <= 0.38678159211627366 * 1e-9);
    }

    #[test]
    fn test_accumulator_edges() {
        assert_eq!(StdevAccumulator::default().population_stdev(), None);

        let mut single = StdevAccumulator::default();
        single.push(4.2);
        assert_eq!(single.population_stdev(), Some(0.0));

        let mut constant = StdevAccumulator::default();
        (0..10).for_each(|_| constant.push(0.1));
        assert!(constant.population_stdev().unwrap() >= 0.0);
    }

    #[test]
    fn test_stdev_skips_null_rejects_text() {
        let mut state = Stdev.initial_state();
        Stdev.step(&mut state, &[SqlValue::Null]).unwrap();
        Stdev.step(&mut state, &[SqlValue::Integer(2)]).unwrap();
        assert_eq!(state.count(), 1);

        let err = Stdev
            .step(&mut state, &[SqlValue::Text("2".to_string())])
            .unwrap_err();
        assert!(matches!(err, Error::TypeCoercion { expected: "f64", .. }));
        assert_eq!(Stdev.finalize(StdevAccumulator::default()).unwrap(), SqlValue::Null);
    }

    #[test]
    fn test_cylinder_volume() {
        assert!((cylinder_volume(2.0, 10.0) - 125.66370614359172).abs() < 1e-9);
        assert_eq!(cylinder_volume(0.0, 10.0), 0.0);
    }

    #[test]
    fn test_pattern_cache() {
        let cache = PatternCache::default();
        assert!(cache.is_match(r"\w\. {2,}\w", "Dr.  Smith").unwrap());
        assert!(!cache.is_match(r"\w\. {2,}\w", "Dr. Smith").unwrap());
        assert!(cache.is_match("^a", "abc").unwrap());

        let err = cache.is_match("(", "abc").unwrap_err();
        assert!(err.to_string().contains("invalid pattern"));
    }

    #[test]
    fn test_unknown_builtin() {
        let mut conn = Connection::open_in_memory().unwrap();
        let err = register_builtin(&mut conn, "median").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        register_builtins(&mut conn).unwrap();
        assert_eq!(conn.functions().count(), 3);
    }
}
