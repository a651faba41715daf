// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Comparison of formatted query results against expected output.

use md5::{Digest, Md5};

use crate::ast::{Output, Value};

/// Actual output that did not match a query's expected output.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub expected: Output,
    /// The actual output, in the same shape as `expected`.
    pub actual: Output,
}

/// Computes the sqllogictest digest of `values`: the MD5 of every value's
/// string form followed by a newline, as lowercase hex.
pub fn digest(values: &[Value]) -> String {
    let mut hasher = Md5::new();
    for value in values {
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Checks `values`, already coerced and sorted, against `expected`.
pub fn validate(values: Vec<Value>, expected: &Output) -> Result<(), Mismatch> {
    match expected {
        Output::Values(expected_values) => {
            if values != *expected_values {
                return Err(Mismatch {
                    expected: expected.clone(),
                    actual: Output::Values(values),
                });
            }
        }
        Output::Hashed {
            num_values,
            md5: expected_md5,
        } => {
            let md5 = digest(&values);
            if values.len() != *num_values || md5 != *expected_md5 {
                return Err(Mismatch {
                    expected: expected.clone(),
                    actual: Output::Hashed {
                        num_values: values.len(),
                        md5,
                    },
                });
            }
        }
    }
    Ok(())
}
