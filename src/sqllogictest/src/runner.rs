// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The sqllogictest runner.
//!
//! A [`Runner`] processes one file at a time. Statements run in file order on
//! a single control connection. Queries are handed to a [`WorkerPool`] and
//! may complete in any order, but never before the tables of the schema
//! under test have been refreshed, which happens right before the first
//! query of each file. Once every query has completed, the tables and views
//! are dropped so the next file starts from an empty schema.

use std::fmt;
use std::ops;
use std::path::Path;
use std::sync::{Arc, Mutex};

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::ast::{Location, Output, Query, Record, Statement};
use crate::client::{Connection, Connector, DbError, ErrorKind, Row};
use crate::format::format_rows;
use crate::parser::{self, Blocks, ParseError};
use crate::pool::{PoolClosed, WorkerPool};
use crate::util;
use crate::validate::{validate, Mismatch};

#[derive(Debug)]
pub enum Outcome {
    Unsupported { error: DbError },
    StatementFailed { error: DbError },
    UnexpectedStatementSuccess,
    QueryFailed { error: DbError },
    IncorrectResult { expected: Output, actual: Output },
    Success,
}

impl Outcome {
    fn error(&self) -> Option<&DbError> {
        match self {
            Outcome::Unsupported { error }
            | Outcome::StatementFailed { error }
            | Outcome::QueryFailed { error } => Some(error),
            _ => None,
        }
    }

    /// Reports whether the command ran but did not do what the script
    /// expected, as opposed to the database rejecting it.
    fn is_mismatch(&self) -> bool {
        matches!(
            self,
            Outcome::StatementFailed { .. }
                | Outcome::UnexpectedStatementSuccess
                | Outcome::IncorrectResult { .. }
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Outcome::*;
        const INDENT: &str = "\n        ";
        match self {
            Unsupported { error } => write!(f, "Unsupported: {}", error),
            StatementFailed { error } => write!(f, "StatementFailed: {}", error),
            UnexpectedStatementSuccess => f.write_str("UnexpectedStatementSuccess!"),
            QueryFailed { error } => write!(f, "QueryFailed: {}", error),
            IncorrectResult { expected, actual } => write!(
                f,
                "IncorrectResult!{}expected: {}{}actually: {}",
                INDENT, expected, INDENT, actual
            ),
            Success => f.write_str("Success"),
        }
    }
}

/// How an [`Outcome`] is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Success,
    Whitelisted,
    Unsupported,
    Failed { fatal: bool },
}

const DEFAULT_WHITELIST: &[&str] = &[
    // CREATE INDEX is not supported, but raises a parse error.
    "CREATE INDEX.*",
    ".*BETWEEN.*NULL.*",
    // Result is not deterministic.
    r"SELECT - SUM \( col1 \) \* \+ col1 FROM tab0 cor0 GROUP BY col1, col1",
];

const DEFAULT_KNOWN_BUGS: &[&str] = &[
    "must appear in the GROUP BY clause or be used in an aggregation function",
    "if type of default result argument ",
    "Cannot GROUP BY 'NULL':",
    "java.lang.Long cannot be cast to [Ljava.lang.Object;",
];

/// Commands whose failures are tolerated.
#[derive(Debug, Clone)]
pub struct Exemptions {
    whitelist: Vec<Regex>,
    known_bugs: Vec<String>,
}

impl Default for Exemptions {
    fn default() -> Exemptions {
        let mut exemptions = Exemptions::none();
        for pattern in DEFAULT_WHITELIST {
            exemptions
                .whitelist(pattern)
                .expect("default whitelist patterns are valid");
        }
        for bug in DEFAULT_KNOWN_BUGS {
            exemptions.known_bug(*bug);
        }
        exemptions
    }
}

impl Exemptions {
    /// No exemptions at all.
    pub fn none() -> Exemptions {
        Exemptions {
            whitelist: vec![],
            known_bugs: vec![],
        }
    }

    /// Adds a pattern for SQL whose mismatches are counted as whitelisted
    /// rather than failed. Patterns are case-insensitive and anchored at the
    /// start of the SQL text.
    pub fn whitelist(&mut self, pattern: &str) -> Result<(), regex::Error> {
        let regex = RegexBuilder::new(&format!("^(?:{})", pattern))
            .case_insensitive(true)
            .build()?;
        self.whitelist.push(regex);
        Ok(())
    }

    /// Adds an error message substring that marks a failure as a known bug,
    /// which does not abort a fail-fast run.
    pub fn known_bug(&mut self, substring: impl Into<String>) {
        self.known_bugs.push(substring.into());
    }

    pub fn is_whitelisted(&self, sql: &str) -> bool {
        self.whitelist.iter().any(|regex| regex.is_match(sql))
    }

    pub fn is_known_bug(&self, message: &str) -> bool {
        self.known_bugs.iter().any(|bug| message.contains(bug.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// The engine name matched by `skipif` and `onlyif`.
    pub engine: String,
    /// The schema whose tables are refreshed and dropped around each file.
    pub schema: String,
    /// The number of connections that execute queries concurrently.
    pub workers: usize,
    /// Abort a file at the first failure that is not exempt.
    pub fail_fast: bool,
    pub exemptions: Exemptions,
}

impl Default for RunConfig {
    fn default() -> RunConfig {
        RunConfig {
            engine: "crate".into(),
            schema: "doc".into(),
            workers: 8,
            fail_fast: false,
            exemptions: Exemptions::default(),
        }
    }
}

/// Per-file counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    /// The line of the most recently dispatched command.
    pub lines: usize,
    pub commands: usize,
    pub success: usize,
    pub whitelisted: usize,
    pub unsupported: usize,
    pub failures: usize,
}

/// [`Counters`] shared between the control task and the workers.
#[derive(Debug, Default)]
pub struct Stats(Mutex<Counters>);

impl Stats {
    fn begin_command(&self, line: usize) {
        let mut counters = self.0.lock().expect("lock poisoned");
        counters.lines = counters.lines.max(line);
        counters.commands += 1;
    }

    fn tally(&self, disposition: Disposition) {
        let mut counters = self.0.lock().expect("lock poisoned");
        match disposition {
            Disposition::Success => counters.success += 1,
            Disposition::Whitelisted => counters.whitelisted += 1,
            Disposition::Unsupported => counters.unsupported += 1,
            Disposition::Failed { .. } => counters.failures += 1,
        }
    }

    pub fn snapshot(&self) -> Counters {
        *self.0.lock().expect("lock poisoned")
    }
}

/// The result of running one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    /// The version of the engine the file ran against.
    pub version: String,
    pub source: String,
    pub counters: Counters,
}

impl FileReport {
    pub fn any_failed(&self) -> bool {
        self.counters.failures > 0
    }
}

impl fmt::Display for FileReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = &self.counters;
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.version,
            self.source,
            c.lines,
            c.commands,
            c.success,
            c.whitelisted,
            c.unsupported,
            c.failures
        )
    }
}

/// Totals across every file of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub files: usize,
    pub commands: usize,
    pub success: usize,
    pub whitelisted: usize,
    pub unsupported: usize,
    pub failures: usize,
}

impl ops::AddAssign<&FileReport> for Summary {
    fn add_assign(&mut self, rhs: &FileReport) {
        let c = &rhs.counters;
        self.files += 1;
        self.commands += c.commands;
        self.success += c.success;
        self.whitelisted += c.whitelisted;
        self.unsupported += c.unsupported;
        self.failures += c.failures;
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = if self.any_failed() { "FAIL!" } else { "SUCCESS!" };
        write!(
            f,
            "{} files={} commands={} success={} whitelisted={} unsupported={} failures={}",
            status,
            self.files,
            self.commands,
            self.success,
            self.whitelisted,
            self.unsupported,
            self.failures,
        )
    }
}

impl Summary {
    pub fn any_failed(&self) -> bool {
        self.failures > 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("reading {path}: {error}")]
    Io {
        path: String,
        #[source]
        error: std::io::Error,
    },
    #[error("parsing {file}: {error}")]
    Parse {
        file: String,
        #[source]
        error: ParseError,
    },
    #[error("{file}: {error}")]
    Database {
        file: String,
        #[source]
        error: DbError,
    },
    #[error("{}: aborted at {reason}", .report.source)]
    Aborted { report: FileReport, reason: String },
    /// The file ran to completion but its relations could not all be dropped.
    #[error("{}: cleaning up: {error}", .report.source)]
    Cleanup {
        report: FileReport,
        #[source]
        error: DbError,
    },
    #[error(transparent)]
    PoolClosed(#[from] PoolClosed),
}

impl RunError {
    /// The report of the file, if it ran far enough to produce one.
    pub fn report(&self) -> Option<&FileReport> {
        match self {
            RunError::Aborted { report, .. } | RunError::Cleanup { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// State of the file being run, shared with the workers' callbacks.
struct FileState {
    source: String,
    stats: Stats,
    /// Why the file was aborted, if it was.
    abort: Mutex<Option<String>>,
    exemptions: Arc<Exemptions>,
    fail_fast: bool,
}

impl FileState {
    fn aborted(&self) -> Option<String> {
        self.abort.lock().expect("lock poisoned").clone()
    }

    fn dispose(&self, sql: &str, outcome: &Outcome) -> Disposition {
        match outcome {
            Outcome::Success => Disposition::Success,
            Outcome::Unsupported { .. } => Disposition::Unsupported,
            outcome if outcome.is_mismatch() && self.exemptions.is_whitelisted(sql) => {
                Disposition::Whitelisted
            }
            outcome => {
                let known_bug = outcome
                    .error()
                    .map_or(false, |e| self.exemptions.is_known_bug(&e.message));
                Disposition::Failed {
                    fatal: self.fail_fast && !known_bug,
                }
            }
        }
    }

    /// Counts `outcome`, and records the abort if it is fatal.
    fn record(&self, location: Location, sql: &str, outcome: Outcome) {
        let disposition = self.dispose(sql, &outcome);
        let file = &self.source;
        match disposition {
            Disposition::Success => debug!(%file, %location, "ok"),
            Disposition::Whitelisted => info!(%file, %location, "whitelisted: {} {}", outcome, sql),
            Disposition::Unsupported => info!(%file, %location, "unsupported: {} {}", outcome, sql),
            Disposition::Failed { fatal: false } if self.fail_fast => {
                warn!(%file, %location, "known bug: {} {}", outcome, sql)
            }
            Disposition::Failed { .. } => error!(%file, %location, "{} {}", outcome, sql),
        }
        self.stats.tally(disposition);
        if let Disposition::Failed { fatal: true } = disposition {
            self.abort
                .lock()
                .expect("lock poisoned")
                .get_or_insert_with(|| format!("{}: {}\n{}", location, outcome, sql));
        }
    }
}

async fn run_statement<T: Connection>(conn: &mut T, statement: &Statement) -> Outcome {
    match (conn.execute(&statement.sql).await, statement.expect_success) {
        (Ok(()), true) => Outcome::Success,
        (Ok(()), false) => Outcome::UnexpectedStatementSuccess,
        (Err(error), true) if error.is_unsupported() => Outcome::Unsupported { error },
        (Err(error), true) => Outcome::StatementFailed { error },
        (Err(_), false) => Outcome::Success,
    }
}

/// Formats and validates the result of executing `query`.
pub fn check_query(query: &Query, result: Result<Vec<Row>, DbError>) -> Outcome {
    let rows = match result {
        Ok(rows) => rows,
        Err(error) if error.is_unsupported() => return Outcome::Unsupported { error },
        Err(error) => return Outcome::QueryFailed { error },
    };
    let expected = match &query.expected {
        Some(expected) => expected,
        None => return Outcome::Success,
    };
    let values = format_rows(&rows, &query.types, query.sort);
    match validate(values, expected) {
        Ok(()) => Outcome::Success,
        Err(Mismatch { expected, actual }) => Outcome::IncorrectResult { expected, actual },
    }
}

async fn server_version<T: Connection>(conn: &mut T) -> Result<String, DbError> {
    let rows = conn
        .query(
            "SELECT version['number'], version['build_snapshot'], version['build_hash'] \
             FROM sys.nodes LIMIT 1",
        )
        .await?;
    let row = rows
        .into_iter()
        .next()
        .ok_or_else(|| DbError::new(ErrorKind::Database, "sys.nodes returned no rows"))?;
    let cell = |i: usize| row.get(i).cloned().flatten();
    let mut version = cell(0).unwrap_or_else(|| "unknown".into());
    if let (Some("t" | "true"), Some(hash)) = (cell(1).as_deref(), cell(2)) {
        version = format!("{}-{}", version, hash);
    }
    Ok(version)
}

// Values of `information_schema.tables.table_type`.
const BASE_TABLE: &str = "BASE TABLE";
const VIEW: &str = "VIEW";

async fn list_relations<T: Connection>(
    conn: &mut T,
    schema: &str,
    table_type: &str,
) -> Result<Vec<String>, DbError> {
    let sql = format!(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_type = {} AND table_schema = {}",
        util::quote_literal(table_type),
        util::quote_literal(schema)
    );
    Ok(conn
        .query(&sql)
        .await?
        .into_iter()
        .filter_map(|row| row.into_iter().next().flatten())
        .collect())
}

fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", util::quote_ident(schema), util::quote_ident(name))
}

async fn refresh_tables<T: Connection>(conn: &mut T, schema: &str) -> Result<(), DbError> {
    for table in list_relations(conn, schema, BASE_TABLE).await? {
        debug!(%table, "refreshing");
        conn.execute(&format!("REFRESH TABLE {}", qualified(schema, &table)))
            .await?;
    }
    Ok(())
}

/// Drops every table and view in `schema`.
///
/// A failure to drop one relation does not stop the others from being
/// dropped. The first error is returned.
async fn drop_relations<T: Connection>(conn: &mut T, schema: &str) -> Result<(), DbError> {
    let mut first_error = None;
    match list_relations(conn, schema, BASE_TABLE).await {
        Ok(tables) => {
            for table in tables {
                debug!(%table, "dropping");
                let sql = format!("DROP TABLE {}", qualified(schema, &table));
                if let Err(e) = conn.execute(&sql).await {
                    warn!(%table, "dropping table: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(e) => {
            first_error.get_or_insert(e);
        }
    }
    match list_relations(conn, schema, VIEW).await {
        Ok(views) if views.is_empty() => (),
        Ok(views) => {
            debug!(?views, "dropping views");
            let names: Vec<_> = views.iter().map(|view| qualified(schema, view)).collect();
            if let Err(e) = conn.execute(&format!("DROP VIEW {}", names.join(", "))).await {
                warn!("dropping views: {}", e);
                first_error.get_or_insert(e);
            }
        }
        Err(e) => {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct Control<T> {
    conn: T,
    version: String,
}

/// Returns the control connection, opening it and fetching the engine
/// version if this is the first file.
async fn connect<'a, C: Connector>(
    connector: &C,
    slot: &'a mut Option<Control<C::Connection>>,
) -> Result<&'a mut Control<C::Connection>, DbError> {
    let control = match slot.take() {
        Some(control) => control,
        None => {
            let mut conn = connector.connect().await?;
            let version = server_version(&mut conn).await?;
            info!(%version, "connected to engine");
            Control { conn, version }
        }
    };
    Ok(slot.insert(control))
}

pub struct Runner<C: Connector> {
    config: RunConfig,
    exemptions: Arc<Exemptions>,
    connector: C,
    pool: WorkerPool,
    control: Option<Control<C::Connection>>,
}

impl<C: Connector> Runner<C> {
    /// Opens the worker pool. The control connection is opened lazily by
    /// the first file.
    pub async fn start(connector: C, config: RunConfig) -> Result<Runner<C>, DbError> {
        let pool = WorkerPool::open(&connector, config.workers).await?;
        Ok(Runner {
            exemptions: Arc::new(config.exemptions.clone()),
            config,
            connector,
            pool,
            control: None,
        })
    }

    pub async fn run_file(&mut self, path: &Path) -> Result<FileReport, RunError> {
        let source = path.display().to_string();
        let input = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| RunError::Io {
                path: source.clone(),
                error,
            })?;
        self.run_string(&source, &input).await
    }

    pub async fn run_stdin(&mut self) -> Result<FileReport, RunError> {
        let mut input = String::new();
        tokio::io::stdin()
            .read_to_string(&mut input)
            .await
            .map_err(|error| RunError::Io {
                path: "<stdin>".into(),
                error,
            })?;
        self.run_string("<stdin>", &input).await
    }

    /// Runs the script `input`, reporting it under the name `source`.
    pub async fn run_string(&mut self, source: &str, input: &str) -> Result<FileReport, RunError> {
        let span = info_span!("file", path = source);
        self.run_script(source, input).instrument(span).await
    }

    async fn run_script(&mut self, source: &str, input: &str) -> Result<FileReport, RunError> {
        let database_error = |error: DbError| RunError::Database {
            file: source.into(),
            error,
        };

        let control = connect(&self.connector, &mut self.control)
            .await
            .map_err(database_error)?;
        let state = Arc::new(FileState {
            source: source.into(),
            stats: Stats::default(),
            abort: Mutex::new(None),
            exemptions: Arc::clone(&self.exemptions),
            fail_fast: self.config.fail_fast,
        });

        let processed = process(&mut control.conn, &self.pool, &state, &self.config, input).await;
        self.pool.drain().await;
        let cleanup = drop_relations(&mut control.conn, &self.config.schema).await;

        let report = FileReport {
            version: control.version.clone(),
            source: source.into(),
            counters: state.stats.snapshot(),
        };
        let result = processed.and_then(|()| match state.aborted() {
            Some(reason) => Err(RunError::Aborted {
                report: report.clone(),
                reason,
            }),
            None => cleanup.map_err(|error| RunError::Cleanup {
                report: report.clone(),
                error,
            }),
        });
        if let Err(RunError::Database { error, .. } | RunError::Cleanup { error, .. }) = &result {
            if error.kind == ErrorKind::Connection {
                self.control = None;
            }
        }
        result.map(|()| report)
    }

    /// Closes the worker pool.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
    }
}

async fn process<T: Connection>(
    conn: &mut T,
    pool: &WorkerPool,
    state: &Arc<FileState>,
    config: &RunConfig,
    input: &str,
) -> Result<(), RunError> {
    let database_error = |error: DbError| RunError::Database {
        file: state.source.clone(),
        error,
    };
    let mut refreshed = false;
    let blocks = Blocks::new(input.lines())
        .filter(|block| parser::should_run(block, &config.engine));
    for (position, block) in blocks.enumerate() {
        if state.aborted().is_some() {
            break;
        }
        let record = match parser::parse_record(&block, position) {
            Ok(record) => record,
            Err(error) => {
                error!("command parse failure: {}", block);
                return Err(RunError::Parse {
                    file: state.source.clone(),
                    error,
                });
            }
        };
        match record {
            Record::Halt => {
                debug!(line = block.line, "halt");
                break;
            }
            Record::Statement(statement) => {
                state.stats.begin_command(statement.location.line);
                debug!("executing {}", statement);
                let outcome = run_statement(conn, &statement).await;
                state.record(statement.location, &statement.sql, outcome);
            }
            Record::Query(query) => {
                state.stats.begin_command(query.location.line);
                if !refreshed {
                    refresh_tables(conn, &config.schema)
                        .await
                        .map_err(database_error)?;
                    refreshed = true;
                }
                let state = Arc::clone(state);
                pool.submit(
                    query,
                    Box::new(move |query: Query, result: Result<Vec<Row>, DbError>| {
                        let outcome = check_query(&query, result);
                        state.record(query.location, &query.sql, outcome);
                    }),
                )
                .await?;
            }
        }
    }
    Ok(())
}
