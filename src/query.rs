use std::time::Duration;

use bson::{doc, Document};
use serde::de::DeserializeOwned;

use crate::{
    command_responses::CountResponse,
    conn::reply_failure,
    cursor::Cursor,
    db::Database,
    error::{Error, Result},
    session::Session,
    wire::{Op, Query as WireQuery, QueryFlags},
};

/// A prepared query, built with chained setters and executed with
/// [`one`](Query::one), [`iter`](Query::iter), or [`count`](Query::count).
///
/// Setters consume and return the builder, so a bound query is immutable:
/// `iter` may be called any number of times, each call producing an
/// independent cursor from the settings as they stand.
#[derive(Clone, Debug)]
pub struct Query<'a> {
    session: &'a Session,
    plan: QueryPlan,
}

/// The complete description of a query, snapshotted into every cursor.
#[derive(Clone, Debug)]
pub(crate) struct QueryPlan {
    pub db: String,
    pub coll: String,
    pub filter: Document,
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: i32,
    pub limit: i32,
    pub batch: i32,
    pub prefetch: f64,
    /// `Some` marks a tailable await-data query; the inner value is the
    /// tail timeout, `None` meaning wait forever.
    pub tail_timeout: Option<Option<Duration>>,
}

impl QueryPlan {
    pub(crate) fn full_collection_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    /// The numberToReturn for the initial query: negative when the whole
    /// limit fits in one batch, telling the server to close the cursor
    /// right away.
    fn first_batch_size(&self) -> i32 {
        if self.limit > 0 && (self.batch <= 0 || self.limit <= self.batch) {
            -self.limit
        } else {
            self.batch
        }
    }

    /// The filter as it goes on the wire, with the sort folded in.
    fn wire_filter(&self) -> Document {
        match self.sort {
            Some(ref sort) => doc! {
                "$query": self.filter.clone(),
                "$orderby": sort.clone(),
            },
            None => self.filter.clone(),
        }
    }

    fn flags(&self, slave_ok: bool) -> QueryFlags {
        let mut flags = QueryFlags::empty();
        if slave_ok {
            flags.insert(QueryFlags::SLAVE_OK);
        }
        if self.tail_timeout.is_some() {
            flags.insert(QueryFlags::TAILABLE_CURSOR | QueryFlags::AWAIT_DATA);
        }
        flags
    }

    fn query_op(&self, num_to_return: i32, slave_ok: bool) -> Op {
        Op::Query(WireQuery {
            flags: self.flags(slave_ok),
            full_collection_name: self.full_collection_name(),
            num_to_skip: self.skip,
            num_to_return,
            query: self.wire_filter(),
            return_field_selector: self.projection.clone(),
        })
    }
}

impl<'a> Query<'a> {
    pub(crate) fn new(session: &'a Session, db: &str, coll: &str, filter: Document) -> Self {
        let (batch, prefetch) = session.query_defaults();
        Self {
            session,
            plan: QueryPlan {
                db: db.to_string(),
                coll: coll.to_string(),
                filter,
                projection: None,
                sort: None,
                skip: 0,
                limit: 0,
                batch,
                prefetch,
                tail_timeout: None,
            },
        }
    }

    /// Orders the results by the given sort document. A later call replaces
    /// an earlier one.
    pub fn sort(mut self, sort: Document) -> Self {
        self.plan.sort = Some(sort);
        self
    }

    /// Skips `n` documents before returning any.
    pub fn skip(mut self, n: i32) -> Self {
        self.plan.skip = n;
        self
    }

    /// Caps the total number of documents returned.
    pub fn limit(mut self, n: i32) -> Self {
        self.plan.limit = n;
        self
    }

    /// Restricts the fields of the returned documents.
    pub fn select(mut self, projection: Document) -> Self {
        self.plan.projection = Some(projection);
        self
    }

    /// Overrides the session's batch size for this query.
    pub fn batch(mut self, n: i32) -> Self {
        self.plan.batch = n;
        self
    }

    /// Overrides the session's prefetch fraction for this query.
    pub fn prefetch(mut self, fraction: f64) -> Self {
        self.plan.prefetch = fraction.clamp(0.0, 1.0);
        self
    }

    /// Makes the cursor tailable with await-data, for following a capped
    /// collection. `timeout` bounds how long a [`Cursor::advance`] call may
    /// wait past the last received document; `None` waits forever.
    pub fn tail(mut self, timeout: Option<Duration>) -> Self {
        self.plan.tail_timeout = Some(timeout);
        self
    }

    /// Fetches the first matching document, or the not-found sentinel if
    /// there is none.
    pub async fn one<T: DeserializeOwned>(&self) -> Result<T> {
        let hold = self.session.acquire(false).await?;
        let op = self.plan.query_op(-1, self.session.slave_ok());
        let result = hold.conn.send_with_reply(&[op]).await;
        hold.done();

        let reply = result?;
        if let Some(err) = reply_failure(&reply) {
            return Err(err);
        }
        let doc = reply.docs.into_iter().next().ok_or_else(Error::not_found)?;
        Ok(bson::from_document(doc)?)
    }

    /// Executes the query and returns a cursor over its results, holding
    /// the first batch.
    pub async fn iter(&self) -> Result<Cursor<'a>> {
        let hold = self.session.acquire(false).await?;
        // The cursor takes its own reference: it outlives this operation
        // and get-mores must go to the same server.
        hold.conn.acquire();
        let conn = hold.conn.clone();
        hold.done();

        let op = self
            .plan
            .query_op(self.plan.first_batch_size(), self.session.slave_ok());
        let reply = match conn.send_with_reply(&[op]).await {
            Ok(reply) => reply,
            Err(err) => {
                conn.release();
                return Err(err);
            }
        };
        if let Some(err) = reply_failure(&reply) {
            conn.release();
            return Err(err);
        }

        Ok(Cursor::new(self.session, conn, self.plan.clone(), reply))
    }

    /// Asks the server how many documents the query matches, honoring skip
    /// and limit.
    pub async fn count(&self) -> Result<u64> {
        let mut command = doc! { "count": self.plan.coll.clone() };
        if !self.plan.filter.is_empty() {
            command.insert("query", self.plan.filter.clone());
        }
        if self.plan.limit > 0 {
            command.insert("limit", self.plan.limit);
        }
        if self.plan.skip > 0 {
            command.insert("skip", self.plan.skip);
        }

        let response: CountResponse = Database::new(self.session, &self.plan.db)
            .run(command)
            .await?;
        Ok(response.n.unwrap_or(0).max(0) as u64)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connstring::ConnectionString;

    fn query(session: &Session) -> Query<'_> {
        Query::new(session, "db", "coll", doc! { "a": 1 })
    }

    fn session() -> Session {
        Session::connect(ConnectionString::parse("localhost:1").unwrap())
    }

    #[tokio::test]
    async fn later_setter_wins() {
        let _guard = crate::test::serial();
        let session = session();
        let q = query(&session)
            .sort(doc! { "a": 1 })
            .skip(1)
            .sort(doc! { "b": -1 })
            .skip(7)
            .batch(3)
            .batch(4);
        assert_eq!(q.plan.sort, Some(doc! { "b": -1 }));
        assert_eq!(q.plan.skip, 7);
        assert_eq!(q.plan.batch, 4);
    }

    #[tokio::test]
    async fn sort_wraps_the_filter() {
        let _guard = crate::test::serial();
        let session = session();
        let plain = query(&session);
        assert_eq!(plain.plan.wire_filter(), doc! { "a": 1 });

        let sorted = query(&session).sort(doc! { "x": 1 });
        assert_eq!(
            sorted.plan.wire_filter(),
            doc! { "$query": { "a": 1 }, "$orderby": { "x": 1 } }
        );
    }

    #[tokio::test]
    async fn first_batch_size_honors_limit() {
        let _guard = crate::test::serial();
        let session = session();
        // Limit fits in one batch: ask the server to close the cursor.
        assert_eq!(query(&session).limit(5).plan.first_batch_size(), -5);
        assert_eq!(query(&session).limit(5).batch(10).plan.first_batch_size(), -5);
        // Limit spans batches: plain batch size.
        assert_eq!(query(&session).limit(50).batch(10).plan.first_batch_size(), 10);
        assert_eq!(query(&session).batch(10).plan.first_batch_size(), 10);
        assert_eq!(query(&session).plan.first_batch_size(), 0);
    }

    #[tokio::test]
    async fn tail_sets_the_cursor_flags() {
        let _guard = crate::test::serial();
        let session = session();
        let q = query(&session).tail(Some(Duration::from_secs(1)));
        let flags = q.plan.flags(true);
        assert!(flags.contains(QueryFlags::TAILABLE_CURSOR));
        assert!(flags.contains(QueryFlags::AWAIT_DATA));
        assert!(flags.contains(QueryFlags::SLAVE_OK));

        let plain = query(&session).plan.flags(false);
        assert_eq!(plain, QueryFlags::empty());
    }
}
