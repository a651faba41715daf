// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A driver for [sqllogictest], a SQL correctness testing framework.
//!
//! Only "full scripts" are supported. Scripts are run against a live engine
//! over a [`client::Connector`]: statements sequentially on one connection,
//! queries concurrently on a pool of connections.
//!
//! [sqllogictest]: https://www.sqlite.org/sqllogictest/doc/trunk/about.wiki

pub mod ast;
pub mod client;
pub mod format;
pub mod parser;
pub mod pool;
pub mod runner;
pub mod util;
pub mod validate;
