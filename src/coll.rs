use bson::Document;

use crate::{
    error::{Error, Result},
    query::Query,
    session::Session,
    wire::{Delete, DeleteFlags, Insert, Op, Update, UpdateFlags},
};

/// The client-side handle on one collection. Obtained from
/// [`Database::c`](crate::Database::c).
///
/// Writes honor the session's write concern: in safe mode (the default)
/// each one is confirmed by a piggybacked `getLastError` on the same socket,
/// and server-reported problems surface as errors.
#[derive(Clone, Debug)]
pub struct Collection<'a> {
    session: &'a Session,
    db: String,
    name: String,
}

impl<'a> Collection<'a> {
    pub(crate) fn new(session: &'a Session, db: &str, name: &str) -> Self {
        Self {
            session,
            db: db.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `database.collection` namespace this handle addresses.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.name)
    }

    /// Inserts the given documents.
    pub async fn insert(&self, docs: impl IntoIterator<Item = Document>) -> Result<()> {
        let documents: Vec<Document> = docs.into_iter().collect();
        if documents.is_empty() {
            return Err(Error::argument("no documents to insert"));
        }

        let op = Op::Insert(Insert {
            full_collection_name: self.full_name(),
            documents,
        });
        self.session.write_op(&self.db, op).await.map(drop)
    }

    /// Updates one document matching `selector`. In safe mode, fails with
    /// the not-found sentinel when nothing matched.
    pub async fn update(&self, selector: Document, update: Document) -> Result<()> {
        let outcome = self
            .update_with(selector, update, UpdateFlags::empty())
            .await?;
        self.check_matched(outcome)
    }

    /// Updates one document matching `selector`, inserting `update` as a new
    /// document if none matched.
    pub async fn upsert(&self, selector: Document, update: Document) -> Result<()> {
        self.update_with(selector, update, UpdateFlags::UPSERT)
            .await
            .map(drop)
    }

    /// Updates every document matching `selector`.
    pub async fn update_all(&self, selector: Document, update: Document) -> Result<()> {
        self.update_with(selector, update, UpdateFlags::MULTI_UPDATE)
            .await
            .map(drop)
    }

    async fn update_with(
        &self,
        selector: Document,
        update: Document,
        flags: UpdateFlags,
    ) -> Result<Option<i64>> {
        let op = Op::Update(Update {
            full_collection_name: self.full_name(),
            flags,
            selector,
            update,
        });
        let response = self.session.write_op(&self.db, op).await?;
        Ok(response.map(|r| r.n.unwrap_or(0)))
    }

    /// Removes one document matching `selector`. In safe mode, fails with
    /// the not-found sentinel when nothing matched.
    pub async fn remove(&self, selector: Document) -> Result<()> {
        let outcome = self
            .remove_with(selector, DeleteFlags::SINGLE_REMOVE)
            .await?;
        self.check_matched(outcome)
    }

    /// Removes every document matching `selector`.
    pub async fn remove_all(&self, selector: Document) -> Result<()> {
        self.remove_with(selector, DeleteFlags::empty()).await.map(drop)
    }

    async fn remove_with(&self, selector: Document, flags: DeleteFlags) -> Result<Option<i64>> {
        let op = Op::Delete(Delete {
            full_collection_name: self.full_name(),
            flags,
            selector,
        });
        let response = self.session.write_op(&self.db, op).await?;
        Ok(response.map(|r| r.n.unwrap_or(0)))
    }

    /// `outcome` is `None` for unsafe writes, which report nothing.
    fn check_matched(&self, outcome: Option<i64>) -> Result<()> {
        match outcome {
            Some(0) => Err(Error::not_found()),
            _ => Ok(()),
        }
    }

    /// Counts the documents in the collection.
    pub async fn count(&self) -> Result<u64> {
        self.find(Document::new()).count().await
    }

    /// Prepares a query for the documents matching `filter`. Nothing is
    /// sent until a result is requested.
    pub fn find(&self, filter: Document) -> Query<'a> {
        Query::new(self.session, &self.db, &self.name, filter)
    }
}
