use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bson::Document;
use serde::de::DeserializeOwned;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::trace;

use crate::{
    conn::{reply_failure, Connection},
    error::{Error, ErrorKind, Result},
    query::QueryPlan,
    session::Session,
    wire::{GetMore, KillCursors, Op, Reply},
};

/// How long an exhausted tailable cursor pauses before polling the server
/// again when the server's own await window returned empty.
const TAIL_POLL_PAUSE: Duration = Duration::from_millis(100);

/// A cursor streaming the results of one query.
///
/// The cursor keeps a reference to the socket the query ran on for its whole
/// life, since get-mores are only valid there. When the unread part of the
/// current batch falls below the query's prefetch fraction, the next batch
/// is requested in the background.
///
/// Dropping a cursor whose server-side cursor is still open sends a
/// best-effort `KILL_CURSORS`.
pub struct Cursor<'a> {
    session: &'a Session,
    conn: Arc<Connection>,
    plan: QueryPlan,
    buffer: VecDeque<Document>,
    current: Option<Document>,
    /// Server cursor id; zero once exhausted, and it stays zero.
    cursor_id: i64,
    /// Documents still owed under the query's limit, when one was set.
    remaining_limit: Option<i64>,
    /// Size of the most recently received batch, for the prefetch
    /// threshold.
    last_batch_size: usize,
    /// An in-flight background get-more, at most one at a time.
    pending: Option<JoinHandle<Result<Reply>>>,
    closed_rx: watch::Receiver<bool>,
    /// When the last document was handed out; tail timeouts count from
    /// here.
    last_doc_at: Instant,
    /// First failure; reported again on every subsequent call.
    error: Option<Error>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(
        session: &'a Session,
        conn: Arc<Connection>,
        plan: QueryPlan,
        first_reply: Reply,
    ) -> Self {
        let remaining_limit = if plan.limit > 0 {
            Some(plan.limit as i64)
        } else {
            None
        };

        let buffer: VecDeque<Document> = first_reply.docs.into();
        Self {
            closed_rx: session.closed_watch(),
            session,
            conn,
            plan,
            last_batch_size: buffer.len(),
            buffer,
            current: None,
            cursor_id: first_reply.cursor_id,
            remaining_limit,
            pending: None,
            last_doc_at: Instant::now(),
            error: None,
        }
    }

    fn is_tail(&self) -> bool {
        self.plan.tail_timeout.is_some()
    }

    /// Moves to the next document, fetching batches as needed. Returns
    /// `false` on natural exhaustion; a tailable cursor instead waits for
    /// new data up to its timeout.
    pub async fn advance(&mut self) -> Result<bool> {
        if let Some(ref err) = self.error {
            return Err(err.clone());
        }
        if self.session.is_closed() {
            return Err(Error::session_closed());
        }
        match self.advance_inner().await {
            Ok(more) => Ok(more),
            Err(err) => {
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn advance_inner(&mut self) -> Result<bool> {
        loop {
            if self.remaining_limit == Some(0) {
                return Ok(false);
            }

            if let Some(doc) = self.buffer.pop_front() {
                if let Some(ref mut remaining) = self.remaining_limit {
                    *remaining -= 1;
                }
                self.maybe_prefetch();
                self.last_doc_at = Instant::now();
                self.current = Some(doc);
                return Ok(true);
            }

            // Batch exhausted: wait for the prefetched one, or ask.
            if let Some(handle) = self.pending.take() {
                let reply = self.await_reply(handle).await?;
                self.ingest(reply)?;
                continue;
            }

            if self.cursor_id == 0 {
                return Ok(false);
            }

            if self.is_tail() {
                self.check_tail_deadline()?;
            }

            let op = self.get_more_op();
            let mut closed = self.closed_rx.clone();
            if *closed.borrow() {
                return Err(Error::session_closed());
            }
            let reply = tokio::select! {
                reply = self.conn.send_with_reply(std::slice::from_ref(&op)) => reply?,
                _ = closed.changed() => return Err(Error::session_closed()),
            };

            let empty = reply.docs.is_empty();
            self.ingest(reply)?;

            if empty && self.is_tail() && self.cursor_id != 0 {
                // The server's await window closed with nothing new; pause
                // before polling again so an idle tail does not spin.
                self.check_tail_deadline()?;
                let mut closed = self.closed_rx.clone();
                tokio::select! {
                    _ = sleep(TAIL_POLL_PAUSE) => {}
                    _ = closed.changed() => return Err(Error::session_closed()),
                }
            }
        }
    }

    /// The document [`advance`](Cursor::advance) stopped on.
    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    /// Advances and deserializes, folding natural exhaustion into `None`.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if !self.advance().await? {
            return Ok(None);
        }
        let doc = self
            .current
            .clone()
            .expect("advance() == true leaves a current document");
        Ok(Some(bson::from_document(doc)?))
    }

    fn check_tail_deadline(&self) -> Result<()> {
        if let Some(Some(timeout)) = self.plan.tail_timeout {
            if self.last_doc_at.elapsed() >= timeout {
                return Err(ErrorKind::TailTimeout.into());
            }
        }
        Ok(())
    }

    fn get_more_op(&self) -> Op {
        let num_to_return = match self.remaining_limit {
            Some(remaining)
                if self.plan.batch <= 0 || remaining <= self.plan.batch as i64 =>
            {
                -(remaining as i32)
            }
            _ => self.plan.batch,
        };
        Op::GetMore(GetMore {
            full_collection_name: self.plan.full_collection_name(),
            num_to_return,
            cursor_id: self.cursor_id,
        })
    }

    /// Starts a background get-more once the unread share of the current
    /// batch falls below the prefetch fraction.
    fn maybe_prefetch(&mut self) {
        if self.pending.is_some()
            || self.cursor_id == 0
            || self.plan.prefetch <= 0.0
            || self.last_batch_size == 0
        {
            return;
        }
        let unread = self.buffer.len() as f64 / self.last_batch_size as f64;
        if unread >= self.plan.prefetch {
            return;
        }

        trace!(cursor_id = self.cursor_id, "prefetching next batch");
        let conn = self.conn.clone();
        let op = self.get_more_op();
        self.pending = Some(tokio::spawn(async move {
            conn.send_with_reply(std::slice::from_ref(&op)).await
        }));
    }

    async fn await_reply(&mut self, handle: JoinHandle<Result<Reply>>) -> Result<Reply> {
        let mut closed = self.closed_rx.clone();
        if *closed.borrow() {
            return Err(Error::session_closed());
        }
        tokio::select! {
            joined = handle => match joined {
                Ok(result) => result,
                Err(_) => Err(Error::invalid_response("get-more task failed")),
            },
            _ = closed.changed() => Err(Error::session_closed()),
        }
    }

    /// Folds a get-more reply into the cursor.
    fn ingest(&mut self, reply: Reply) -> Result<()> {
        if let Some(err) = reply_failure(&reply) {
            return Err(err);
        }
        if reply.is_cursor_not_found() {
            // The server dropped the cursor (a capped collection rolled
            // over, or it timed out). Nothing more will come.
            self.cursor_id = 0;
            return Ok(());
        }
        // Once exhausted the cursor stays exhausted, whatever a late reply
        // claims.
        if self.cursor_id != 0 {
            self.cursor_id = reply.cursor_id;
        }
        self.last_batch_size = reply.docs.len();
        self.buffer.extend(reply.docs);
        Ok(())
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.abort();
        }

        // The kill targets the cursor's own socket, best-effort, after
        // which the cursor's reference is dropped.
        let conn = self.conn.clone();
        let cursor_id = self.cursor_id;

        if cursor_id != 0 {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let op = Op::KillCursors(KillCursors {
                        cursor_ids: vec![cursor_id],
                    });
                    if let Err(err) = conn.send(std::slice::from_ref(&op)).await {
                        trace!(cursor_id, error = %err, "kill cursors failed");
                    }
                    conn.release();
                });
                return;
            }
        }
        conn.release();
    }
}
