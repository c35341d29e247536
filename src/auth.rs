use std::fmt;

use bson::doc;
use md5::{Digest, Md5};

use crate::{
    command_responses::{command_errmsg, command_ok, GetNonceResponse},
    conn::Connection,
    error::{Error, ErrorKind, Result},
};

/// One database login. The cleartext password is digested immediately and
/// never stored.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Credential {
    pub db: String,
    pub username: String,
    pub password_digest: String,
}

impl Credential {
    pub(crate) fn new(db: &str, username: &str, password: &str) -> Self {
        Self {
            db: db.to_string(),
            username: username.to_string(),
            password_digest: password_digest(username, password),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Credential")
            .field("db", &self.db)
            .field("username", &self.username)
            .finish()
    }
}

/// The credential digest stored server-side: `md5(user + ":mongo:" + pw)`.
pub(crate) fn password_digest(username: &str, password: &str) -> String {
    md5_hex(format!("{}:mongo:{}", username, password).as_bytes())
}

fn md5_hex(input: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// The response to the server's nonce challenge.
fn nonce_key(nonce: &str, username: &str, password_digest: &str) -> String {
    md5_hex(format!("{}{}{}", nonce, username, password_digest).as_bytes())
}

/// Runs the nonce challenge-response login for `credential` on `conn` and
/// records it in the connection's credential cache.
pub(crate) async fn login(conn: &Connection, credential: &Credential) -> Result<()> {
    let reply = conn
        .run_command(&credential.db, doc! { "getnonce": 1 }, true)
        .await?;
    if !command_ok(&reply) {
        return Err(ErrorKind::AuthenticationFailed {
            message: command_errmsg(&reply),
        }
        .into());
    }
    let nonce = bson::from_document::<GetNonceResponse>(reply)
        .ok()
        .and_then(|r| r.nonce)
        .ok_or_else(|| Error::invalid_response("getnonce reply carried no nonce"))?;

    let key = nonce_key(&nonce, &credential.username, &credential.password_digest);
    let authenticate = doc! {
        "authenticate": 1,
        "user": credential.username.clone(),
        "nonce": nonce,
        "key": key,
    };

    let reply = conn.run_command(&credential.db, authenticate, true).await?;
    if !command_ok(&reply) {
        return Err(ErrorKind::AuthenticationFailed {
            message: command_errmsg(&reply),
        }
        .into());
    }

    conn.note_login(credential.clone());
    Ok(())
}

/// Brings a freshly acquired connection's login state in line with the
/// session's credential set: missing credentials are replayed, and
/// credentials cached from a previous session that this one does not hold
/// are logged out before any user operation runs.
pub(crate) async fn ensure(conn: &Connection, credentials: &[Credential]) -> Result<()> {
    let cached = conn.logins();

    for stale in cached
        .iter()
        .filter(|c| !credentials.iter().any(|want| want.db == c.db))
    {
        // Best-effort: a dead connection will fail the actual operation.
        let _ = conn
            .run_command(&stale.db, doc! { "logout": 1 }, true)
            .await;
        conn.note_logout(&stale.db);
    }

    for credential in credentials {
        if !cached.contains(credential) {
            login(conn, credential).await?;
        }
    }

    Ok(())
}
