// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A parser for sqllogictest "full scripts".
//!
//! Parsing happens in two steps. [`Blocks`] splits the raw text into
//! blank-line separated blocks, dropping comment and `hash-threshold` lines.
//! [`parse_record`] then turns one block into a [`Record`]. Deciding whether a
//! block applies to the engine under test (`skipif`/`onlyif`) is left to the
//! caller, see [`should_run`].

use std::fmt;
use std::iter::{Enumerate, Fuse};

use lazy_static::lazy_static;
use regex::Regex;

use crate::ast::{Location, Output, Query, Record, Sort, Statement, Type};
use crate::format;

/// A blank-line delimited group of lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block<'a> {
    /// 1-based line number of the first line in the block.
    pub line: usize,
    /// The lines of the block, trimmed of surrounding whitespace.
    pub lines: Vec<&'a str>,
}

impl fmt::Display for Block<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.lines.join("\n"))
    }
}

/// Splits a stream of lines into [`Block`]s.
///
/// Lines starting with `#` or `hash-threshold` are invisible: they neither
/// contribute to a block nor end one. Runs of blank lines collapse into a
/// single separator, and a final block without a trailing blank line is
/// still produced.
pub struct Blocks<'a, I>
where
    I: Iterator<Item = &'a str>,
{
    lines: Fuse<Enumerate<I>>,
}

impl<'a, I> Blocks<'a, I>
where
    I: Iterator<Item = &'a str>,
{
    pub fn new(lines: I) -> Self {
        Blocks {
            lines: lines.enumerate().fuse(),
        }
    }
}

impl<'a, I> Iterator for Blocks<'a, I>
where
    I: Iterator<Item = &'a str>,
{
    type Item = Block<'a>;

    fn next(&mut self) -> Option<Block<'a>> {
        let mut block: Option<Block<'a>> = None;
        for (i, raw) in &mut self.lines {
            if raw.starts_with('#') || raw.starts_with("hash-threshold") {
                continue;
            }
            let line = raw.trim();
            if line.is_empty() {
                if block.is_some() {
                    return block;
                }
                continue;
            }
            block
                .get_or_insert_with(|| Block {
                    line: i + 1,
                    lines: vec![],
                })
                .lines
                .push(line);
        }
        block
    }
}

/// Reports whether `block` applies to the engine named `engine`.
///
/// A block is skipped if one of its leading conditionals is `skipif <engine>`
/// or `onlyif <other>` for some other engine.
pub fn should_run(block: &Block, engine: &str) -> bool {
    for line in conditionals(&block.lines) {
        let mut words = line.split_whitespace();
        let directive = words.next().unwrap_or("");
        let target = words.next().unwrap_or("");
        match directive {
            "skipif" if target == engine => return false,
            "onlyif" if target != engine => return false,
            _ => (),
        }
    }
    true
}

fn conditionals<'a, 'b>(lines: &'b [&'a str]) -> impl Iterator<Item = &'a str> + 'b {
    lines
        .iter()
        .copied()
        .take_while(|line| line.starts_with("skipif") || line.starts_with("onlyif"))
}

lazy_static! {
    static ref VARCHAR_REGEX: Regex = Regex::new(r"VARCHAR\(\d+\)").unwrap();
    static ref REAL_REGEX: Regex = Regex::new("REAL").unwrap();
    static ref TEXT_REGEX: Regex = Regex::new("TEXT").unwrap();
    static ref HASH_REGEX: Regex = Regex::new(r"^(\d+) values hashing to ([0-9a-f]{32})$").unwrap();
}

/// Rewrites type names from the generic dialect the scripts are written in
/// to the ones the engine under test understands.
///
/// The substitutions are purely textual and case-sensitive.
pub fn rewrite_dialect(sql: &str) -> String {
    let sql = VARCHAR_REGEX.replace_all(sql, "STRING");
    let sql = REAL_REGEX.replace_all(&sql, "DOUBLE").into_owned();
    TEXT_REGEX.replace_all(&sql, "STRING").into_owned()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("block contains only conditionals")]
    MissingCommand,
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("missing SQL text")]
    MissingSql,
    #[error("malformed query header: {0:?}")]
    MalformedQueryHeader(String),
    #[error("invalid result format codes: {0:?}")]
    InvalidTypes(String),
    #[error("invalid sort mode: {0:?}")]
    InvalidSort(String),
}

/// A command block that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {kind}\n{block}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
    /// The offending block, for diagnostics.
    pub block: String,
}

/// Parses a single block into a [`Record`].
///
/// Any leading `skipif`/`onlyif` lines are discarded; whether the block
/// should run at all is decided beforehand by [`should_run`]. `position` is
/// the 0-based index of the command within its file.
pub fn parse_record(block: &Block, position: usize) -> Result<Record, ParseError> {
    let error = |kind| ParseError {
        line: block.line,
        kind,
        block: block.to_string(),
    };
    let skip = conditionals(&block.lines).count();
    let (header, body) = match block.lines[skip..].split_first() {
        Some((header, body)) => (*header, body),
        None => return Err(error(ParseErrorKind::MissingCommand)),
    };
    let location = Location {
        line: block.line,
        position,
    };

    if header.starts_with("statement") {
        if body.is_empty() {
            return Err(error(ParseErrorKind::MissingSql));
        }
        Ok(Record::Statement(Statement {
            location,
            sql: rewrite_dialect(&body.join(" ")),
            expect_success: header.ends_with("ok"),
        }))
    } else if header.starts_with("query") {
        parse_query(header, body, location).map_err(error)
    } else if header.starts_with("halt") {
        Ok(Record::Halt)
    } else {
        Err(error(ParseErrorKind::UnknownCommand(header.into())))
    }
}

fn parse_query(header: &str, body: &[&str], location: Location) -> Result<Record, ParseErrorKind> {
    let mut words = header.split_whitespace().skip(1);
    let (codes, sort) = match (words.next(), words.next()) {
        (Some(codes), Some(sort)) => (codes, sort),
        _ => return Err(ParseErrorKind::MalformedQueryHeader(header.into())),
    };
    let label = words.next().map(String::from);
    let types = parse_types(codes)?;
    let sort = match sort {
        "nosort" => Sort::No,
        "rowsort" => Sort::Row,
        "valuesort" => Sort::Value,
        other => return Err(ParseErrorKind::InvalidSort(other.into())),
    };

    let (sql, expected) = match body.iter().position(|line| line.starts_with("---")) {
        Some(i) => (&body[..i], Some(parse_output(&body[i + 1..], &types))),
        None => (body, None),
    };
    if sql.is_empty() {
        return Err(ParseErrorKind::MissingSql);
    }

    Ok(Record::Query(Query {
        location,
        sql: rewrite_dialect(&sql.join(" ")),
        types,
        sort,
        label,
        expected,
    }))
}

fn parse_types(codes: &str) -> Result<Vec<Type>, ParseErrorKind> {
    if !codes.contains(['I', 'R', 'T']) {
        return Err(ParseErrorKind::InvalidTypes(codes.into()));
    }
    Ok(codes
        .chars()
        .map(|code| match code {
            'I' => Type::Integer,
            'R' => Type::Real,
            _ => Type::Text,
        })
        .collect())
}

fn parse_output(lines: &[&str], types: &[Type]) -> Output {
    if let [line] = lines {
        if let Some(captures) = HASH_REGEX.captures(line) {
            if let Ok(num_values) = captures[1].parse() {
                return Output::Hashed {
                    num_values,
                    md5: captures[2].to_owned(),
                };
            }
        }
    }
    Output::Values(
        lines
            .iter()
            .enumerate()
            .map(|(i, line)| format::coerce(Some(line), types[i % types.len()]))
            .collect(),
    )
}

/// Parses every command of a script that applies to `engine`, stopping at
/// the first `halt`.
pub fn parse_records(input: &str, engine: &str) -> Result<Vec<Record>, ParseError> {
    let mut records = vec![];
    let blocks = Blocks::new(input.lines()).filter(|block| should_run(block, engine));
    for (position, block) in blocks.enumerate() {
        match parse_record(&block, position)? {
            Record::Halt => break,
            record => records.push(record),
        }
    }
    Ok(records)
}
