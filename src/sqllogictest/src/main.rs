// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fs::File;
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use sqllogictest::client::PostgresConnector;
use sqllogictest::runner::{Exemptions, FileReport, RunConfig, RunError, Runner, Summary};
use sqllogictest::util;

/// Runs sqllogictest scripts to verify database engine correctness.
///
/// Prints one tab-separated line per file: engine version, file name, last
/// line number, commands, successes, whitelisted, unsupported, failures.
#[derive(clap::Parser)]
struct Args {
    /// Host of the engine under test.
    #[clap(long, env = "PGHOST", default_value = "localhost")]
    host: String,
    /// Port of the engine's PostgreSQL wire protocol endpoint.
    #[clap(long, env = "PGPORT", default_value = "5432")]
    port: u16,
    /// User to connect as.
    #[clap(long, env = "PGUSER", default_value = "crate")]
    user: String,
    /// Database to connect to.
    #[clap(long, env = "PGDATABASE", default_value = "doc")]
    database: String,
    /// Connection string, overriding --host, --port, --user and --database.
    #[clap(long, value_name = "DSN")]
    dsn: Option<String>,
    /// Log filter directives, e.g. `info` or `sqllogictest=debug`.
    ///
    /// Defaults to the RUST_LOG environment variable, or `warn`.
    #[clap(short = 'l', long, value_name = "FILTER")]
    log_filter: Option<String>,
    /// Stop at the first failure that is not a known bug.
    #[clap(long = "failfast", alias = "fail-fast")]
    fail_fast: bool,
    /// Number of queries to run in parallel.
    #[clap(short = 'n', long, value_name = "N", default_value = "8")]
    workers: usize,
    /// Engine name matched by `skipif` and `onlyif`.
    #[clap(long, default_value = "crate")]
    engine: String,
    /// Schema whose tables are refreshed before the first query and dropped
    /// after each file.
    #[clap(long, default_value = "doc")]
    schema: String,
    /// Don't exit with a failing code if not all commands are successful.
    #[clap(long)]
    no_fail: bool,
    /// Save a JSON-formatted summary to FILE.
    #[clap(long, value_name = "FILE")]
    json_summary_file: Option<PathBuf>,
    /// Count mismatches of SQL matching REGEX as whitelisted.
    #[clap(long = "whitelist", value_name = "REGEX")]
    whitelist: Vec<String>,
    /// Treat errors containing SUBSTRING as known bugs.
    #[clap(long = "known-bug", value_name = "SUBSTRING")]
    known_bugs: Vec<String>,
    /// Paths to sqllogictest scripts or directories of them. `-` reads a
    /// script from stdin.
    #[clap(value_name = "PATH", required = true)]
    paths: Vec<String>,
}

enum Flow {
    Continue,
    Abort,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(err) = init_logging(args.log_filter.as_deref()) {
        eprintln!("error: {:#}", err);
        process::exit(1);
    }

    let (pg_config, config) = match configure(&args) {
        Ok(configs) => configs,
        Err(err) => {
            eprintln!("error: {:#}", err);
            process::exit(1);
        }
    };

    let json_summary_file = match &args.json_summary_file {
        Some(filename) => match File::create(filename) {
            Ok(file) => Some(file),
            Err(err) => {
                eprintln!("creating {}: {}", filename.display(), err);
                process::exit(1);
            }
        },
        None => None,
    };

    let mut runner = match Runner::start(PostgresConnector::new(pg_config), config).await {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("error: connecting: {}", err);
            process::exit(1);
        }
    };

    let mut bad_file = false;
    let mut aborted = false;
    let mut summary = Summary::default();
    'paths: for path in &args.paths {
        if path == "-" {
            let result = runner.run_stdin().await;
            if let Flow::Abort = report(result, &mut summary, &mut bad_file) {
                aborted = true;
                break 'paths;
            }
            continue;
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    let result = runner.run_file(entry.path()).await;
                    if let Flow::Abort = report(result, &mut summary, &mut bad_file) {
                        aborted = true;
                        break 'paths;
                    }
                }
                Ok(_) => (),
                Err(err) => {
                    eprintln!("error: reading directory entry: {}", err);
                    bad_file = true;
                }
            }
        }
    }
    runner.shutdown().await;

    eprintln!("{}", summary);

    if let Some(json_summary_file) = json_summary_file {
        if let Err(err) = serde_json::to_writer(json_summary_file, &summary) {
            eprintln!("error: unable to write summary file: {}", err);
            process::exit(2);
        }
    }

    if bad_file || aborted || (summary.any_failed() && !args.no_fail) {
        process::exit(1);
    }
}

fn init_logging(filter: Option<&str>) -> Result<(), anyhow::Error> {
    let filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).context("parsing --log-filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn configure(args: &Args) -> Result<(tokio_postgres::Config, RunConfig), anyhow::Error> {
    let pg_config = match &args.dsn {
        Some(dsn) => dsn.parse().context("parsing --dsn")?,
        None => {
            let mut pg_config = tokio_postgres::Config::new();
            pg_config
                .host(&args.host)
                .port(args.port)
                .user(&args.user)
                .dbname(&args.database);
            pg_config
        }
    };

    let mut exemptions = Exemptions::default();
    for pattern in &args.whitelist {
        exemptions
            .whitelist(pattern)
            .with_context(|| format!("parsing --whitelist {:?}", pattern))?;
    }
    for bug in &args.known_bugs {
        exemptions.known_bug(bug.as_str());
    }

    let config = RunConfig {
        engine: args.engine.clone(),
        schema: args.schema.clone(),
        workers: args.workers,
        fail_fast: args.fail_fast,
        exemptions,
    };
    Ok((pg_config, config))
}

fn report(
    result: Result<FileReport, RunError>,
    summary: &mut Summary,
    bad_file: &mut bool,
) -> Flow {
    match result {
        Ok(report) => {
            println!("{}", report);
            *summary += &report;
            Flow::Continue
        }
        Err(RunError::Aborted { report, reason }) => {
            println!("{}", report);
            *summary += &report;
            eprintln!("error: {} aborted:\n{}", report.source, util::indent(&reason, 4));
            Flow::Abort
        }
        Err(err) => {
            if let Some(report) = err.report() {
                println!("{}", report);
                *summary += report;
            }
            eprintln!("error: {}", err);
            *bad_file = true;
            Flow::Continue
        }
    }
}
