// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A fixed pool of workers that execute queries concurrently.
//!
//! Each worker owns one long-lived [`Connection`] and pulls work from a
//! shared, bounded FIFO queue. Submitting to a full queue waits for space.
//! [`WorkerPool::drain`] waits until every submitted item has been executed
//! and its callback has returned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info_span, Instrument};

use crate::ast::Query;
use crate::client::{Connection, Connector, DbError, Row};

/// How many queued items each worker may have waiting on it.
pub const QUEUE_DEPTH_PER_WORKER: usize = 5;

/// Invoked exactly once per submitted query, on the worker that ran it.
pub type Callback = Box<dyn FnOnce(Query, Result<Vec<Row>, DbError>) + Send>;

struct WorkItem {
    query: Query,
    callback: Callback,
}

/// Counts submitted items whose callbacks have not yet returned.
#[derive(Default)]
struct Inflight {
    pending: AtomicUsize,
    idle: Notify,
}

impl Inflight {
    fn complete(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Marks its item complete when dropped, even if the callback panics.
struct Completion<'a>(&'a Inflight);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

/// The queue was closed because every worker has exited.
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker pool is closed")]
pub struct PoolClosed;

pub struct WorkerPool {
    tx: async_channel::Sender<WorkItem>,
    inflight: Arc<Inflight>,
    workers: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    /// Opens `size` connections and starts one worker per connection.
    ///
    /// A `size` of zero is treated as one.
    pub async fn open<C: Connector>(connector: &C, size: usize) -> Result<WorkerPool, DbError> {
        let size = size.max(1);
        let (tx, rx) = async_channel::bounded(QUEUE_DEPTH_PER_WORKER * size);
        let inflight = Arc::new(Inflight::default());
        let mut workers = JoinSet::new();
        for id in 0..size {
            let conn = connector.connect().await?;
            let rx = rx.clone();
            let inflight = Arc::clone(&inflight);
            workers.spawn(work(conn, rx, inflight).instrument(info_span!("worker", id)));
        }
        debug!(size, "worker pool started");
        Ok(WorkerPool {
            tx,
            inflight,
            workers,
            size,
        })
    }

    /// The number of workers, and therefore connections, in the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `query` for execution, waiting while the queue is full.
    pub async fn submit(&self, query: Query, callback: Callback) -> Result<(), PoolClosed> {
        self.inflight.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(WorkItem { query, callback }).await.is_err() {
            self.inflight.complete();
            return Err(PoolClosed);
        }
        Ok(())
    }

    /// Waits until every submitted query has run and its callback returned.
    pub async fn drain(&self) {
        loop {
            let idle = self.inflight.idle.notified();
            tokio::pin!(idle);
            // Register for the notification before checking the counter so a
            // completion in between cannot be missed.
            idle.as_mut().enable();
            if self.inflight.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Closes the queue and waits for the workers to finish what is queued.
    pub async fn shutdown(mut self) {
        self.tx.close();
        while self.workers.join_next().await.is_some() {}
    }
}

async fn work<C: Connection>(
    mut conn: C,
    rx: async_channel::Receiver<WorkItem>,
    inflight: Arc<Inflight>,
) {
    while let Ok(WorkItem { query, callback }) = rx.recv().await {
        let _completion = Completion(&inflight);
        debug!("executing {}", query);
        let result = conn.query(&query.sql).await;
        callback(query, result);
    }
}
