// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Normalization of query results before comparison.

use crate::ast::{Sort, Type, Value};
use crate::client::Row;

/// Coerces a raw cell into a [`Value`] according to its column type code.
///
/// Never fails: a cell that does not parse as the requested type is kept as
/// text. `None` and the literal `NULL` both become [`Value::Null`].
pub fn coerce(raw: Option<&str>, typ: Type) -> Value {
    let raw = match raw {
        None | Some("NULL") => return Value::Null,
        Some(raw) => raw,
    };
    match typ {
        Type::Integer => {
            let trimmed = raw.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Value::Integer(i);
            }
            // Drivers that decode typed floats hand `I` columns a truncated
            // integer, so real numbers in integer columns do the same.
            match trimmed.parse::<f64>() {
                Ok(f) if f.is_finite() && f.abs() < 9.2e18 => Value::Integer(f.trunc() as i64),
                _ => Value::Text(raw.to_owned()),
            }
        }
        Type::Real => match raw.trim().parse::<f64>() {
            Ok(f) => Value::Real(f),
            Err(_) => Value::Text(raw.to_owned()),
        },
        Type::Text => Value::Text(raw.to_owned()),
    }
}

/// Coerces, sorts and flattens `rows` into the sequence of values a query's
/// expected output is compared against.
///
/// Column `i` is coerced with `types[i % types.len()]`. Rows are flattened in
/// row-major order. Both sort modes compare values by their string form,
/// since values of different types have no other common ordering.
pub fn format_rows(rows: &[Row], types: &[Type], sort: Sort) -> Vec<Value> {
    let mut rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let typ = match types {
                        [] => Type::Text,
                        types => types[i % types.len()],
                    };
                    coerce(cell.as_deref(), typ)
                })
                .collect()
        })
        .collect();

    if let Sort::Row = sort {
        rows.sort_by_cached_key(|row| row.iter().map(Value::to_string).collect::<Vec<_>>());
    }
    let mut values: Vec<Value> = rows.into_iter().flatten().collect();
    if let Sort::Value = sort {
        values.sort_by_cached_key(Value::to_string);
    }
    values
}
