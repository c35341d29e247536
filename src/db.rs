use bson::Document;
use serde::de::DeserializeOwned;

use crate::{
    auth::{self, Credential},
    coll::Collection,
    command_responses::{command_code, command_errmsg, command_ok},
    error::{is_unauthorized_code, is_unauthorized_message, Error, ErrorKind, Result},
    session::Session,
};

/// A command to run: either a bare command name, meaning `{name: 1}`, or a
/// full command document.
#[derive(Clone, Debug)]
pub enum Command {
    Name(String),
    Doc(Document),
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        Command::Name(name.to_string())
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        Command::Name(name)
    }
}

impl From<Document> for Command {
    fn from(doc: Document) -> Self {
        Command::Doc(doc)
    }
}

impl Command {
    fn into_document(self) -> Result<Document> {
        match self {
            Command::Name(name) => {
                let mut doc = Document::new();
                doc.insert(name, 1);
                Ok(doc)
            }
            Command::Doc(doc) => {
                if doc.is_empty() {
                    return Err(Error::argument("empty command document"));
                }
                Ok(doc)
            }
        }
    }
}

/// The client-side handle on one database of the cluster. Obtained from
/// [`Session::db`]; holds no server-side state of its own.
#[derive(Clone, Debug)]
pub struct Database<'a> {
    session: &'a Session,
    name: String,
}

impl<'a> Database<'a> {
    pub(crate) fn new(session: &'a Session, name: &str) -> Self {
        Self {
            session,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A handle on the named collection of this database.
    pub fn c(&self, name: &str) -> Collection<'a> {
        Collection::new(self.session, &self.name, name)
    }

    /// Alias for [`c`](Database::c).
    pub fn collection(&self, name: &str) -> Collection<'a> {
        self.c(name)
    }

    /// Runs a command on this database, routed like a read under the
    /// session's mode, and deserializes the reply document.
    pub async fn run<T: DeserializeOwned>(&self, cmd: impl Into<Command>) -> Result<T> {
        let command = cmd.into().into_document()?;

        let hold = self.session.acquire(false).await?;
        let result = hold
            .conn
            .run_command(&self.name, command, self.session.slave_ok())
            .await;
        hold.done();

        let doc = result?;
        if !command_ok(&doc) {
            let message = command_errmsg(&doc);
            let code = command_code(&doc);
            return Err(
                if is_unauthorized_code(code) || is_unauthorized_message(&message) {
                    ErrorKind::Unauthorized { message }.into()
                } else {
                    ErrorKind::QueryFailure { code, message }.into()
                },
            );
        }
        Ok(bson::from_document(doc)?)
    }

    /// Authenticates against this database. On success the credential is
    /// kept on the session and replayed on every socket the session uses
    /// from here on.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let credential = Credential::new(&self.name, username, password);

        let hold = self.session.acquire(false).await?;
        let result = auth::login(&hold.conn, &credential).await;
        hold.done();
        result?;

        self.session.add_credential(credential);
        Ok(())
    }

    /// Removes this database's credential from the session and logs the
    /// session's bound socket out of it. Sockets elsewhere in the pool drop
    /// the cached login when they next serve a session without it.
    pub async fn logout(&self) {
        let removed = self.session.remove_credential(&self.name);
        if removed.is_none() {
            return;
        }
        if let Some(conn) = self.session.cached_conn() {
            let _ = conn
                .run_command(&self.name, bson::doc! { "logout": 1 }, true)
                .await;
            conn.note_logout(&self.name);
        }
    }

    /// Creates or updates a user of this database. The password is stored
    /// as the standard credential digest.
    pub async fn add_user(&self, username: &str, password: &str, read_only: bool) -> Result<()> {
        let user = bson::doc! {
            "user": username,
            "pwd": auth::password_digest(username, password),
            "readOnly": read_only,
        };
        self.c("system.users")
            .upsert(bson::doc! { "user": username }, user)
            .await
    }

    /// Removes a user of this database. Fails with the not-found sentinel
    /// when no such user exists.
    pub async fn remove_user(&self, username: &str) -> Result<()> {
        self.c("system.users")
            .remove(bson::doc! { "user": username })
            .await
    }
}
