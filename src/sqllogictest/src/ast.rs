// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Abstract syntax tree nodes for sqllogictest.

use std::fmt;

/// A column type code from a `query` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// `I`
    Integer,
    /// `R`
    Real,
    /// `T`, and any code this driver does not know how to coerce.
    Text,
}

/// The sort mode of a query, applied to the output before comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    /// `nosort`
    No,
    /// `rowsort`
    Row,
    /// `valuesort`
    Value,
}

impl fmt::Display for Sort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Sort::No => "nosort",
            Sort::Row => "rowsort",
            Sort::Value => "valuesort",
        })
    }
}

/// A single result cell after coercion.
///
/// NULL is its own variant so that it can never compare equal to an empty
/// string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Real(r) => write_real(f, *r),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Writes `r` the way the reference corpus renders floats: the shortest
/// round-tripping digits, integral values keeping one fractional digit, and
/// scientific notation below 1e-4 or from 1e16 with a signed exponent of at
/// least two digits (`1e+16`, `1.5e-05`).
fn write_real(f: &mut fmt::Formatter, r: f64) -> fmt::Result {
    if r.is_nan() {
        return f.write_str("nan");
    }
    // `Debug` already switches to scientific notation at the same bounds.
    let s = format!("{:?}", r);
    match s.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            write!(f, "{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => f.write_str(&s),
    }
}

/// The expected output of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// One value per line, rows flattened in order.
    Values(Vec<Value>),
    /// `<num_values> values hashing to <md5>`
    Hashed { num_values: usize, md5: String },
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Output::Values(values) => {
                f.write_str("[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str("]")
            }
            Output::Hashed { num_values, md5 } => {
                write!(f, "{} values hashing to {}", num_values, md5)
            }
        }
    }
}

/// Where a command came from in its script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// 1-based line number of the first line of the command's block.
    pub line: usize,
    /// 0-based index of the command among the commands of its file.
    pub position: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.line)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub location: Location,
    /// The SQL text, after dialect rewriting.
    pub sql: String,
    pub expect_success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub location: Location,
    /// The SQL text, after dialect rewriting.
    pub sql: String,
    /// One code per output column, cycled if there are more columns.
    pub types: Vec<Type>,
    pub sort: Sort,
    pub label: Option<String>,
    /// `None` when the query has no `----` separator, in which case any
    /// successful execution passes.
    pub expected: Option<Output>,
}

/// A parsed command block.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Statement(Statement),
    Query(Query),
    /// Stop processing the current file.
    Halt,
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.location, self.sql)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.location, self.sql)
    }
}
