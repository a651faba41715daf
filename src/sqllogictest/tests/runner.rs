// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs scripts end to end against an in-memory stand-in for the engine.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use sqllogictest::ast::Value;
use sqllogictest::client::{Connection, Connector, DbError, ErrorKind, Row};
use sqllogictest::runner::{Counters, RunConfig, RunError, Runner};
use sqllogictest::validate::digest;

/// A scripted database. Statements only track which tables and views
/// exist; query results and errors are canned by SQL text.
struct FakeDb {
    log: Vec<String>,
    tables: Vec<String>,
    views: Vec<String>,
    rows: HashMap<String, Vec<Row>>,
    errors: HashMap<String, DbError>,
    version: Row,
    connections: usize,
}

impl FakeDb {
    fn new() -> FakeDb {
        FakeDb {
            log: vec![],
            tables: vec![],
            views: vec![],
            rows: HashMap::new(),
            errors: HashMap::new(),
            version: vec![Some("5.1.0".into()), Some("f".into()), Some("abc123".into())],
            connections: 0,
        }
    }

    fn position(&self, sql: &str) -> usize {
        self.log
            .iter()
            .position(|s| s == sql)
            .unwrap_or_else(|| panic!("{:?} never executed; log: {:#?}", sql, self.log))
    }
}

#[derive(Clone)]
struct FakeConnector(Arc<Mutex<FakeDb>>);

struct FakeConnection(Arc<Mutex<FakeDb>>);

/// A statement that takes a while, giving queued queries time to finish.
const PAUSE: &str = "SELECT pause";

fn unqualified(name: &str) -> String {
    let name = name.trim();
    name.rsplit('.').next().unwrap_or(name).trim_matches('"').to_string()
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> Result<FakeConnection, DbError> {
        self.0.lock().unwrap().connections += 1;
        Ok(FakeConnection(Arc::clone(&self.0)))
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        if sql == PAUSE {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        let mut db = self.0.lock().unwrap();
        db.log.push(sql.into());
        if let Some(error) = db.errors.get(sql) {
            return Err(error.clone());
        }
        let name = |rest: &str| -> String {
            rest.chars().take_while(|c| c.is_alphanumeric()).collect()
        };
        if let Some(rest) = sql.strip_prefix("CREATE TABLE ") {
            let table = name(rest);
            db.tables.push(table);
        } else if let Some(rest) = sql.strip_prefix("CREATE VIEW ") {
            let view = name(rest);
            db.views.push(view);
        } else if let Some(rest) = sql
            .strip_prefix("REFRESH TABLE ")
            .or_else(|| sql.strip_prefix("DROP TABLE "))
        {
            let table = unqualified(rest);
            if db.views.contains(&table) {
                return Err(DbError::new(ErrorKind::Database, format!("{} is a view", table)));
            }
            if sql.starts_with("DROP") {
                db.tables.retain(|t| *t != table);
            }
        } else if let Some(rest) = sql.strip_prefix("DROP VIEW ") {
            let dropped: Vec<_> = rest.split(',').map(unqualified).collect();
            db.views.retain(|v| !dropped.contains(v));
        }
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        let mut db = self.0.lock().unwrap();
        if sql.contains("FROM sys.nodes") {
            return Ok(vec![db.version.clone()]);
        }
        if sql.starts_with("SELECT table_name FROM information_schema.tables") {
            let relations = if sql.contains("table_type = 'VIEW'") {
                &db.views
            } else {
                &db.tables
            };
            return Ok(relations.iter().map(|r| vec![Some(r.clone())]).collect());
        }
        db.log.push(sql.into());
        if let Some(error) = db.errors.get(sql) {
            return Err(error.clone());
        }
        Ok(db.rows.get(sql).cloned().unwrap_or_default())
    }
}

fn text_rows(cells: &[&str]) -> Vec<Row> {
    cells.iter().map(|c| vec![Some(c.to_string())]).collect()
}

async fn runner(db: &Arc<Mutex<FakeDb>>, config: RunConfig) -> Runner<FakeConnector> {
    Runner::start(FakeConnector(Arc::clone(db)), config)
        .await
        .unwrap()
}

fn config(workers: usize, fail_fast: bool) -> RunConfig {
    RunConfig {
        workers,
        fail_fast,
        ..RunConfig::default()
    }
}

const BASIC: &str = "statement ok
CREATE TABLE t1(a INTEGER, b VARCHAR(10))

statement ok
INSERT INTO t1 VALUES(1, 'x')

statement ok
INSERT INTO t1 VALUES(2, 'y')

query I rowsort
SELECT a FROM t1
----
1
2

query IT nosort
SELECT a, b FROM t1 ORDER BY a
----
1
x
2
y

statement ok
INSERT INTO t1 VALUES(3, 'z')
";

fn basic_db() -> Arc<Mutex<FakeDb>> {
    let mut db = FakeDb::new();
    db.rows.insert("SELECT a FROM t1".into(), text_rows(&["2", "1"]));
    db.rows.insert(
        "SELECT a, b FROM t1 ORDER BY a".into(),
        vec![
            vec![Some("1".into()), Some("x".into())],
            vec![Some("2".into()), Some("y".into())],
        ],
    );
    Arc::new(Mutex::new(db))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_basic_file() {
    let db = basic_db();
    let mut runner = runner(&db, config(4, false)).await;
    let report = runner.run_string("basic.test", BASIC).await.unwrap();
    runner.shutdown().await;

    assert_eq!(report.version, "5.1.0");
    assert_eq!(report.source, "basic.test");
    assert_eq!(
        report.counters,
        Counters {
            lines: 24,
            commands: 6,
            success: 6,
            whitelisted: 0,
            unsupported: 0,
            failures: 0,
        }
    );
    assert_eq!(report.to_string(), "5.1.0\tbasic.test\t24\t6\t6\t0\t0\t0");

    let db = db.lock().unwrap();
    // Statements before the first query have all run before the refresh,
    // and every query runs after it.
    let refresh = db.position("REFRESH TABLE \"doc\".\"t1\"");
    assert!(db.position("INSERT INTO t1 VALUES(2, 'y')") < refresh);
    assert!(refresh < db.position("SELECT a FROM t1"));
    assert!(refresh < db.position("SELECT a, b FROM t1 ORDER BY a"));
    assert_eq!(
        db.log.iter().filter(|s| s.starts_with("REFRESH")).count(),
        1,
        "tables are refreshed once per file"
    );
    // Tables are dropped after everything else.
    assert_eq!(db.log.last().unwrap(), "DROP TABLE \"doc\".\"t1\"");
    assert!(db.tables.is_empty());
    assert!(db.log.contains(&"CREATE TABLE t1(a INTEGER, b STRING)".to_string()));
}

#[tokio::test]
async fn test_runs_are_repeatable() {
    let db = basic_db();
    let mut runner = runner(&db, config(2, false)).await;
    let first = runner.run_string("basic.test", BASIC).await.unwrap();
    let second = runner.run_string("basic.test", BASIC).await.unwrap();
    runner.shutdown().await;
    assert_eq!(first, second);
    // Two pool connections plus one control connection shared by both runs.
    assert_eq!(db.lock().unwrap().connections, 3);
}

#[tokio::test]
async fn test_halt_and_conditionals() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    let mut runner = runner(&db, config(1, false)).await;
    let script = "statement ok
CREATE TABLE t1(a INTEGER)

skipif crate
statement ok
SELECT skipped

onlyif mysql
statement ok
SELECT also_skipped

onlyif crate
statement ok
SELECT only_crate

halt

statement ok
SELECT never
";
    let report = runner.run_string("halt.test", script).await.unwrap();
    assert_eq!(report.counters.commands, 2);
    assert_eq!(report.counters.success, 2);
    assert_eq!(report.counters.lines, 12);

    let db = db.lock().unwrap();
    assert!(db.log.contains(&"SELECT only_crate".to_string()));
    for sql in ["SELECT skipped", "SELECT also_skipped", "SELECT never"] {
        assert!(!db.log.contains(&sql.to_string()), "{} ran", sql);
    }
}

#[tokio::test]
async fn test_statement_expectations() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "INSERT INTO nope VALUES(1)".into(),
        DbError::new(ErrorKind::Syntax, "Relation 'nope' unknown"),
    );
    let mut runner = runner(&db, config(1, false)).await;
    let script = "statement error
INSERT INTO nope VALUES(1)

statement ok
INSERT INTO nope VALUES(1)

statement error
SELECT 1
";
    let report = runner.run_string("stmt.test", script).await.unwrap();
    assert_eq!(report.counters.commands, 3);
    assert_eq!(report.counters.success, 1);
    assert_eq!(report.counters.failures, 2);
    assert!(report.any_failed());
}

#[tokio::test]
async fn test_fail_fast_aborts() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "INSERT INTO t1 VALUES(1)".into(),
        DbError::new(ErrorKind::Database, "disk full"),
    );
    let mut runner = runner(&db, config(1, true)).await;
    let script = "statement ok
CREATE TABLE t1(a INTEGER)

statement ok
INSERT INTO t1 VALUES(1)

statement ok
INSERT INTO t1 VALUES(2)
";
    match runner.run_string("abort.test", script).await {
        Err(RunError::Aborted { report, reason }) => {
            assert_eq!(report.counters.commands, 2);
            assert_eq!(report.counters.failures, 1);
            assert!(reason.contains("disk full"), "{}", reason);
        }
        other => panic!("expected abort, got {:?}", other),
    }

    let db = db.lock().unwrap();
    assert!(!db.log.contains(&"INSERT INTO t1 VALUES(2)".to_string()));
    // Cleanup still happens.
    assert!(db.tables.is_empty());
}

#[tokio::test]
async fn test_known_bug_does_not_abort() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "SELECT NULL FROM t1 GROUP BY NULL".into(),
        DbError::new(ErrorKind::Database, "Cannot GROUP BY 'NULL': invalid data type"),
    );
    let mut runner = runner(&db, config(1, true)).await;
    let script = "statement ok
SELECT NULL FROM t1 GROUP BY NULL

statement ok
SELECT 1
";
    let report = runner.run_string("known.test", script).await.unwrap();
    assert_eq!(report.counters.commands, 2);
    assert_eq!(report.counters.failures, 1);
    assert_eq!(report.counters.success, 1);
}

#[tokio::test]
async fn test_whitelist_and_unsupported() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    {
        let mut db = db.lock().unwrap();
        db.rows.insert(
            "SELECT a FROM t1 WHERE a BETWEEN NULL AND 3".into(),
            text_rows(&["7"]),
        );
        db.errors.insert(
            "SELECT a FROM t1 WINDOW w AS ()".into(),
            DbError::new(ErrorKind::Unsupported, "window definitions are not supported"),
        );
    }
    let mut runner = runner(&db, config(2, true)).await;
    let script = "query I nosort
SELECT a FROM t1 WHERE a BETWEEN NULL AND 3
----
1

query I nosort
SELECT a FROM t1 WINDOW w AS ()
----
1
";
    let report = runner.run_string("exempt.test", script).await.unwrap();
    assert_eq!(
        report.counters,
        Counters {
            lines: 6,
            commands: 2,
            success: 0,
            whitelisted: 1,
            unsupported: 1,
            failures: 0,
        }
    );
}

#[tokio::test]
async fn test_hashed_results() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock()
        .unwrap()
        .rows
        .insert("SELECT a FROM t1".into(), text_rows(&["3", "1", "2"]));
    let md5 = digest(&[Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    let script = format!(
        "query I rowsort
SELECT a FROM t1
----
3 values hashing to {md5}

query I nosort
SELECT a FROM t1
----
3 values hashing to {md5}

query I rowsort
SELECT a FROM t1
----
2 values hashing to {md5}
"
    );
    let mut runner = runner(&db, config(2, false)).await;
    let report = runner.run_string("hash.test", &script).await.unwrap();
    assert_eq!(report.counters.commands, 3);
    assert_eq!(report.counters.success, 1);
    assert_eq!(report.counters.failures, 2);
}

#[tokio::test]
async fn test_parse_error() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    let mut runner = runner(&db, config(1, false)).await;
    let script = "statement ok
CREATE TABLE t1(a INTEGER)

query I partialsort
SELECT a FROM t1
";
    match runner.run_string("bad.test", script).await {
        Err(RunError::Parse { file, error }) => {
            assert_eq!(file, "bad.test");
            assert_eq!(error.line, 4);
        }
        other => panic!("expected parse error, got {:?}", other),
    }
    assert!(db.lock().unwrap().tables.is_empty());
}

#[tokio::test]
async fn test_snapshot_version() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().version = vec![
        Some("5.2.0".into()),
        Some("true".into()),
        Some("abc123".into()),
    ];
    let mut runner = runner(&db, config(1, false)).await;
    let report = runner.run_string("v.test", "statement ok\nSELECT 1\n").await.unwrap();
    assert_eq!(report.version, "5.2.0-abc123");
}

#[tokio::test]
async fn test_run_file() {
    let db = basic_db();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(BASIC.as_bytes()).unwrap();
    let mut runner = runner(&db, config(2, false)).await;
    let report = runner.run_file(file.path()).await.unwrap();
    assert_eq!(report.source, file.path().display().to_string());
    assert_eq!(report.counters.success, 6);

    let missing = file.path().with_extension("missing");
    assert!(matches!(
        runner.run_file(&missing).await,
        Err(RunError::Io { .. })
    ));
}

#[tokio::test]
async fn test_views_are_dropped_not_refreshed() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    let mut runner = runner(&db, config(2, false)).await;
    let script = "statement ok
CREATE TABLE t1(a INTEGER)

statement ok
CREATE VIEW v1 AS SELECT a FROM t1

statement ok
CREATE TABLE t2(b INTEGER)

query I nosort
SELECT a FROM v1
";
    let report = runner.run_string("view.test", script).await.unwrap();
    assert_eq!(report.counters.commands, 4);
    assert_eq!(report.counters.success, 4);

    let db = db.lock().unwrap();
    assert!(db.log.contains(&"REFRESH TABLE \"doc\".\"t1\"".to_string()));
    assert!(db.log.contains(&"REFRESH TABLE \"doc\".\"t2\"".to_string()));
    assert!(!db.log.iter().any(|s| s.contains("\"v1\"") && !s.starts_with("DROP VIEW")));
    assert!(db.log.contains(&"SELECT a FROM v1".to_string()));
    assert_eq!(db.log.last().unwrap(), "DROP VIEW \"doc\".\"v1\"");
    assert!(db.tables.is_empty());
    assert!(db.views.is_empty());
}

#[tokio::test]
async fn test_cleanup_error_keeps_report() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "DROP TABLE \"doc\".\"t1\"".into(),
        DbError::new(ErrorKind::Database, "table is locked"),
    );
    let mut runner = runner(&db, config(1, false)).await;
    let script = "statement ok
CREATE TABLE t1(a INTEGER)

statement ok
CREATE TABLE t2(a INTEGER)

statement ok
CREATE VIEW v1 AS SELECT a FROM t2
";
    match runner.run_string("cleanup.test", script).await {
        Err(err @ RunError::Cleanup { .. }) => {
            let report = err.report().unwrap();
            assert_eq!(report.counters.commands, 3);
            assert_eq!(report.counters.success, 3);
            assert_eq!(
                report.to_string(),
                "5.1.0\tcleanup.test\t7\t3\t3\t0\t0\t0"
            );
            assert!(err.to_string().contains("table is locked"), "{}", err);
        }
        other => panic!("expected cleanup error, got {:?}", other),
    }

    // Everything but the table that failed to drop is gone.
    let db = db.lock().unwrap();
    assert_eq!(db.tables, vec!["t1".to_string()]);
    assert!(db.views.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fail_fast_on_query_failure() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "SELECT a FROM t1".into(),
        DbError::new(ErrorKind::Database, "shard unavailable"),
    );
    let mut runner = runner(&db, config(1, true)).await;
    let script = format!(
        "statement ok
CREATE TABLE t1(a INTEGER)

query I nosort
SELECT a FROM t1
----
1

statement ok
{PAUSE}

statement ok
INSERT INTO t1 VALUES(2)
"
    );
    match runner.run_string("query-abort.test", &script).await {
        Err(RunError::Aborted { report, reason }) => {
            // The pause may or may not be dispatched before the failure is
            // recorded, but nothing after it is.
            let c = report.counters;
            assert!((2..=3).contains(&c.commands), "{:?}", c);
            assert_eq!(c.failures, 1);
            assert_eq!(c.success, c.commands - 1);
            assert!(reason.contains("shard unavailable"), "{}", reason);
        }
        other => panic!("expected abort, got {:?}", other),
    }

    let db = db.lock().unwrap();
    assert!(!db.log.contains(&"INSERT INTO t1 VALUES(2)".to_string()));
    assert!(db.tables.is_empty());
}

#[tokio::test]
async fn test_unsupported_statement() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().errors.insert(
        "ALTER TABLE t1 RENAME TO t2".into(),
        DbError::new(ErrorKind::Unsupported, "ALTER TABLE RENAME is not supported"),
    );
    let mut runner = runner(&db, config(1, true)).await;
    let script = "statement ok
ALTER TABLE t1 RENAME TO t2

statement ok
SELECT 1
";
    let report = runner.run_string("unsupported.test", script).await.unwrap();
    assert_eq!(
        report.counters,
        Counters {
            lines: 4,
            commands: 2,
            success: 1,
            whitelisted: 0,
            unsupported: 1,
            failures: 0,
        }
    );
}

#[tokio::test]
async fn test_valuesort() {
    let db = Arc::new(Mutex::new(FakeDb::new()));
    db.lock().unwrap().rows.insert(
        "SELECT a, b FROM t1".into(),
        vec![
            vec![Some("3".into()), Some("1".into())],
            vec![Some("2".into()), Some("0".into())],
        ],
    );
    let mut runner = runner(&db, config(2, false)).await;
    let script = "query II valuesort
SELECT a, b FROM t1
----
0
1
2
3

query II nosort
SELECT a, b FROM t1
----
0
1
2
3
";
    let report = runner.run_string("valuesort.test", script).await.unwrap();
    assert_eq!(report.counters.commands, 2);
    assert_eq!(report.counters.success, 1);
    assert_eq!(report.counters.failures, 1);
}
