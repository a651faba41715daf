// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Connections to the database under test.
//!
//! The runner only needs to execute SQL and fetch rows as text, so the
//! contract is kept to [`Connector`] and [`Connection`]. [`PostgresConnector`]
//! implements it over the PostgreSQL wire protocol.

use async_trait::async_trait;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage};
use tracing::{debug, error};

/// A result row in text form. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// The broad category of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Any other error reported by the database.
    Database,
    /// The SQL was malformed or referred to objects that do not exist.
    Syntax,
    /// The database does not support a feature the SQL uses.
    Unsupported,
    /// The connection itself failed.
    Connection,
}

/// An error reported while talking to the database.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct DbError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DbError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> DbError {
        DbError {
            kind,
            message: message.into(),
        }
    }

    /// Classifies a server-reported error by its SQLSTATE and message.
    pub fn from_server(code: &str, message: &str) -> DbError {
        let message = message.trim();
        let kind = if code == SqlState::FEATURE_NOT_SUPPORTED.code()
            || message.starts_with("UnsupportedFeatureException")
            || message.ends_with(" is not supported")
        {
            ErrorKind::Unsupported
        } else if code.starts_with("42") {
            ErrorKind::Syntax
        } else {
            ErrorKind::Database
        };
        DbError::new(kind, message)
    }

    pub fn is_unsupported(&self) -> bool {
        self.kind == ErrorKind::Unsupported
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(e: tokio_postgres::Error) -> DbError {
        match e.as_db_error() {
            Some(db) => DbError::from_server(db.code().code(), db.message()),
            None => DbError::new(ErrorKind::Connection, e.to_string()),
        }
    }
}

/// A single, exclusively owned connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Executes `sql`, discarding any rows it produces.
    async fn execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Executes `sql` and fetches all of its rows.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError>;
}

/// Opens [`Connection`]s to the database under test.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self) -> Result<Self::Connection, DbError>;
}

/// Connects over the PostgreSQL wire protocol.
#[derive(Debug, Clone)]
pub struct PostgresConnector {
    config: Config,
}

impl PostgresConnector {
    pub fn new(config: Config) -> PostgresConnector {
        PostgresConnector { config }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    type Connection = PostgresConnection;

    async fn connect(&self) -> Result<PostgresConnection, DbError> {
        let (client, connection) = self.config.connect(NoTls).await?;
        debug!(hosts = ?self.config.get_hosts(), "connected");
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {}", e);
            }
        });
        Ok(PostgresConnection { client })
    }
}

pub struct PostgresConnection {
    client: tokio_postgres::Client,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn execute(&mut self, sql: &str) -> Result<(), DbError> {
        Ok(self.client.batch_execute(sql).await?)
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        let messages = self.client.simple_query(sql).await?;
        let mut rows = vec![];
        for message in messages {
            if let SimpleQueryMessage::Row(row) = message {
                rows.push((0..row.len()).map(|i| row.get(i).map(String::from)).collect());
            }
        }
        Ok(rows)
    }
}
