//! Typed readers for normalized query parameter values

use crate::error::{EpcisError, Result};
use crate::model::QueryParameter;
use chrono::{DateTime, Utc};

pub(crate) fn invalid(parameter: &QueryParameter, reason: &str) -> EpcisError {
    EpcisError::QueryParameter(format!("{}: {}", parameter.name, reason))
}

/// The one value of a single-valued parameter
pub(crate) fn single(parameter: &QueryParameter) -> Result<&str> {
    match parameter.values.as_slice() {
        [value] => Ok(value.trim()),
        _ => Err(invalid(parameter, "expects exactly one value")),
    }
}

pub(crate) fn time(parameter: &QueryParameter) -> Result<DateTime<Utc>> {
    let value = single(parameter)?;
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| invalid(parameter, "expects an RFC 3339 timestamp"))
}

pub(crate) fn number(parameter: &QueryParameter) -> Result<f64> {
    single(parameter)?
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
        .ok_or_else(|| invalid(parameter, "expects a number"))
}

pub(crate) fn count(parameter: &QueryParameter) -> Result<usize> {
    single(parameter)?
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(parameter, "expects a positive integer"))
}

pub(crate) fn flag(parameter: &QueryParameter) -> Result<bool> {
    match single(parameter)? {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(parameter, "expects true or false")),
    }
}

/// Every value parsed with `parse`, failing on the first unknown one
pub(crate) fn each<T>(
    parameter: &QueryParameter,
    parse: impl Fn(&str) -> Option<T>,
    expected: &str,
) -> Result<Vec<T>> {
    parameter
        .values
        .iter()
        .map(|value| {
            parse(value.trim()).ok_or_else(|| {
                invalid(parameter, &format!("'{}' is not {}", value, expected))
            })
        })
        .collect()
}
