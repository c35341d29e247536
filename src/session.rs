use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Document};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::{
    auth::{self, Credential},
    command_responses::{command_code, command_errmsg, command_ok, LastErrorResponse},
    conn::{reply_failure, Connection},
    connstring::ConnectionString,
    db::{Command, Database},
    error::{
        is_unauthorized_code, is_unauthorized_message, Error, ErrorKind, LastError, Result,
    },
    topology::{AcquireMode, Topology, DEFAULT_SYNC_TIMEOUT},
    wire::{Op, Query, Reply},
};

const DEFAULT_PREFETCH: f64 = 0.25;

/// The consistency mode of a session, which determines where reads and
/// writes are routed and whether the session stays bound to one socket.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Reads and writes always go to the master, over one reserved socket.
    Strong,
    /// Reads start on a slave; the first write moves the session to the
    /// master, where it stays until refreshed.
    Monotonic,
    /// Reads go to any slave, writes to the master, with no socket reserved
    /// between operations.
    Eventual,
}

/// The write concern applied to acknowledged writes.
///
/// Every write is followed on the same socket by a `getLastError` carrying
/// these values, and the write fails if the reply reports a problem. See
/// [`Session::set_safe`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Safe {
    /// Minimum number of replicas that must have the write before it is
    /// acknowledged. Zero leaves the server default in place.
    pub w: i32,
    /// How long the server may wait for `w` replicas before reporting a
    /// write concern timeout.
    pub w_timeout: Option<Duration>,
    /// Require the write to be flushed to disk before acknowledgement.
    pub fsync: bool,
}

/// A communication session with the cluster.
///
/// Sessions are cheap: they share the cluster topology and the socket pools
/// with every other session from the same connect. A session is safe to use
/// from multiple tasks; concurrent operations serialize only at the point a
/// socket is acquired.
pub struct Session {
    topology: Arc<Topology>,
    /// Credentials given in the connection string. Immutable; re-seeded
    /// into sessions derived via [`new_session`](Session::new_session).
    url_creds: Arc<Vec<Credential>>,
    state: Mutex<SessionState>,
    /// Serializes socket acquisition (and the credential replay that goes
    /// with it) across concurrent operations on this session.
    acquire_gate: tokio::sync::Mutex<()>,
    closed_tx: watch::Sender<bool>,
}

struct SessionState {
    mode: Mode,
    conn: Option<Arc<Connection>>,
    safety: Option<Safe>,
    batch: i32,
    prefetch: f64,
    sync_timeout: Duration,
    creds: Vec<Credential>,
    closed: bool,
}

impl SessionState {
    fn fresh(mode: Mode, creds: Vec<Credential>) -> Self {
        Self {
            mode,
            conn: None,
            safety: Some(Safe::default()),
            batch: 0,
            prefetch: DEFAULT_PREFETCH,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            creds,
            closed: false,
        }
    }
}

/// A connection checked out for one operation, holding its own reference
/// on top of any the session keeps, so a concurrent refresh cannot recycle
/// the socket out from under the operation. [`done`](ConnHold::done) gives
/// the reference back.
pub(crate) struct ConnHold {
    pub(crate) conn: Arc<Connection>,
}

impl ConnHold {
    pub(crate) fn done(self) {
        self.conn.release();
    }
}

impl Session {
    pub(crate) fn connect(connstring: ConnectionString) -> Session {
        let mut url_creds = Vec::new();
        if let Some(ref username) = connstring.username {
            let db = connstring.database.as_deref().unwrap_or("admin");
            url_creds.push(Credential::new(
                db,
                username,
                connstring.password.as_deref().unwrap_or(""),
            ));
        }

        let topology = Topology::new(&connstring);
        topology.session_opened();

        Session {
            topology,
            state: Mutex::new(SessionState::fresh(Mode::Strong, url_creds.clone())),
            url_creds: Arc::new(url_creds),
            acquire_gate: tokio::sync::Mutex::new(()),
            closed_tx: watch::channel(false).0,
        }
    }

    fn derive(&self, conn: Option<Arc<Connection>>, state: SessionState) -> Session {
        self.topology.session_opened();
        Session {
            topology: self.topology.clone(),
            url_creds: self.url_creds.clone(),
            state: Mutex::new(SessionState { conn, ..state }),
            acquire_gate: tokio::sync::Mutex::new(()),
            closed_tx: watch::channel(false).0,
        }
    }

    /// Returns a session with the same cluster and the connection-string
    /// credentials, but none of this session's transient logins, no bound
    /// socket, and default settings.
    pub fn new_session(&self) -> Session {
        let mode = self.state.lock().unwrap().mode;
        self.derive(None, SessionState::fresh(mode, (*self.url_creds).clone()))
    }

    /// Returns a session sharing this one's bound socket and carrying all
    /// its settings and logins.
    pub fn clone_session(&self) -> Session {
        let state = self.state.lock().unwrap();
        if let Some(ref conn) = state.conn {
            conn.acquire();
        }
        self.derive(
            state.conn.clone(),
            SessionState {
                mode: state.mode,
                conn: None,
                safety: state.safety.clone(),
                batch: state.batch,
                prefetch: state.prefetch,
                sync_timeout: state.sync_timeout,
                creds: state.creds.clone(),
                closed: false,
            },
        )
    }

    /// Like [`clone_session`](Session::clone_session), but without the bound
    /// socket, so the first operation makes a fresh routing decision.
    pub fn copy_session(&self) -> Session {
        let state = self.state.lock().unwrap();
        self.derive(
            None,
            SessionState {
                mode: state.mode,
                conn: None,
                safety: state.safety.clone(),
                batch: state.batch,
                prefetch: state.prefetch,
                sync_timeout: state.sync_timeout,
                creds: state.creds.clone(),
                closed: false,
            },
        )
    }

    /// Releases the session's bound socket, if any. Settings and logins are
    /// kept; the next operation routes afresh, and a monotonic session
    /// reverts to reading from slaves.
    pub fn refresh(&self) {
        let conn = self.state.lock().unwrap().conn.take();
        if let Some(conn) = conn {
            conn.release();
        }
    }

    /// Closes the session, releasing its socket and unblocking any cursor
    /// suspended on it. Further operations fail. Dropping the session does
    /// the same.
    pub fn close(&self) {
        let conn = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
            state.conn.take()
        };
        if let Some(conn) = conn {
            conn.release();
        }
        let _ = self.closed_tx.send(true);
        self.topology.session_closed();
    }

    /// Switches the consistency mode, dropping the bound socket so the next
    /// operation routes under the new mode.
    pub fn set_mode(&self, mode: Mode) {
        let conn = {
            let mut state = self.state.lock().unwrap();
            state.mode = mode;
            state.conn.take()
        };
        if let Some(conn) = conn {
            conn.release();
        }
    }

    pub fn strong(&self) {
        self.set_mode(Mode::Strong);
    }

    pub fn monotonic(&self) {
        self.set_mode(Mode::Monotonic);
    }

    pub fn eventual(&self) {
        self.set_mode(Mode::Eventual);
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().unwrap().mode
    }

    /// Sets the write concern. `Some` makes every write wait for the
    /// piggybacked `getLastError`; `None` makes writes fire-and-forget,
    /// reporting nothing the server finds wrong with them.
    pub fn set_safe(&self, safety: Option<Safe>) {
        self.state.lock().unwrap().safety = safety;
    }

    pub fn safety(&self) -> Option<Safe> {
        self.state.lock().unwrap().safety.clone()
    }

    /// Default batch size for queries made through this session. `-1` asks
    /// the server for single-document batches.
    pub fn set_batch(&self, n: i32) {
        self.state.lock().unwrap().batch = n;
    }

    /// Fraction of a batch left unread at which the next one is requested
    /// in the background. Zero disables prefetching.
    pub fn set_prefetch(&self, fraction: f64) {
        self.state.lock().unwrap().prefetch = fraction.clamp(0.0, 1.0);
    }

    /// How long operations wait for a suitable server before failing with
    /// `NoReachableServers`.
    pub fn set_sync_timeout(&self, timeout: Duration) {
        self.state.lock().unwrap().sync_timeout = timeout;
    }

    /// Removes every credential from this session and logs it out of the
    /// bound socket. Other pooled sockets drop the logins when they next
    /// serve a session without them.
    pub async fn logout_all(&self) {
        let (creds, conn) = {
            let mut state = self.state.lock().unwrap();
            (std::mem::take(&mut state.creds), state.conn.clone())
        };
        if let Some(conn) = conn {
            for cred in creds {
                let _ = conn.run_command(&cred.db, doc! { "logout": 1 }, true).await;
                conn.note_logout(&cred.db);
            }
        }
    }

    /// A handle on the named database.
    pub fn db<'a>(&'a self, name: &str) -> Database<'a> {
        Database::new(self, name)
    }

    /// Runs a command on the `admin` database. `cmd` may be a bare command
    /// name (`"ping"`) or a full document.
    pub async fn run<T: DeserializeOwned>(&self, cmd: impl Into<Command>) -> Result<T> {
        self.db("admin").run(cmd).await
    }

    /// Round-trips a `ping` to whatever server the session currently routes
    /// reads to.
    pub async fn ping(&self) -> Result<()> {
        self.run::<Document>("ping").await.map(drop)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Whether queries should carry the slave-ok flag under the current
    /// mode.
    pub(crate) fn slave_ok(&self) -> bool {
        self.state.lock().unwrap().mode != Mode::Strong
    }

    pub(crate) fn query_defaults(&self) -> (i32, f64) {
        let state = self.state.lock().unwrap();
        (state.batch, state.prefetch)
    }

    pub(crate) fn add_credential(&self, credential: Credential) {
        let mut state = self.state.lock().unwrap();
        state.creds.retain(|c| c.db != credential.db);
        state.creds.push(credential);
    }

    pub(crate) fn remove_credential(&self, db: &str) -> Option<Credential> {
        let mut state = self.state.lock().unwrap();
        let found = state.creds.iter().position(|c| c.db == db)?;
        Some(state.creds.remove(found))
    }

    pub(crate) fn cached_conn(&self) -> Option<Arc<Connection>> {
        self.state.lock().unwrap().conn.clone()
    }

    /// Checks out a connection appropriate for the operation under the
    /// session's mode, replaying credentials on it first.
    pub(crate) async fn acquire(&self, write: bool) -> Result<ConnHold> {
        let _gate = self.acquire_gate.lock().await;

        let (mode, cached, sync_timeout, creds) = {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::session_closed());
            }
            (
                state.mode,
                state.conn.clone(),
                state.sync_timeout,
                state.creds.clone(),
            )
        };

        match mode {
            Mode::Strong => {
                if let Some(conn) = cached {
                    conn.acquire();
                    return Ok(ConnHold { conn });
                }
                let conn = self
                    .acquire_fresh(AcquireMode::Master, sync_timeout, &creds)
                    .await?;
                // The session keeps the reference the acquire produced; the
                // operation takes one of its own.
                self.bind(conn.clone());
                conn.acquire();
                Ok(ConnHold { conn })
            }
            Mode::Monotonic => {
                if let Some(conn) = cached {
                    if !write || conn.on_master() {
                        conn.acquire();
                        return Ok(ConnHold { conn });
                    }
                    // First write: move from the slave socket to a master
                    // one; the session then behaves like strong until
                    // refreshed.
                    self.refresh();
                }
                let acquire_mode = if write {
                    AcquireMode::Master
                } else {
                    AcquireMode::PreferSlave
                };
                let conn = self.acquire_fresh(acquire_mode, sync_timeout, &creds).await?;
                self.bind(conn.clone());
                conn.acquire();
                Ok(ConnHold { conn })
            }
            Mode::Eventual => {
                // Nothing is reserved: the operation holds the only
                // reference and the socket pools again when it completes.
                let acquire_mode = if write {
                    AcquireMode::Master
                } else {
                    AcquireMode::PreferSlave
                };
                let conn = self.acquire_fresh(acquire_mode, sync_timeout, &creds).await?;
                Ok(ConnHold { conn })
            }
        }
    }

    async fn acquire_fresh(
        &self,
        mode: AcquireMode,
        sync_timeout: Duration,
        creds: &[Credential],
    ) -> Result<Arc<Connection>> {
        let conn = self.topology.acquire(mode, sync_timeout).await?;
        if let Err(err) = auth::ensure(&conn, creds).await {
            conn.release();
            return Err(err);
        }
        Ok(conn)
    }

    /// Reserves `conn` as the session's socket. The session keeps the
    /// reference the caller acquired.
    fn bind(&self, conn: Arc<Connection>) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            state.conn.replace(conn)
        };
        if let Some(previous) = previous {
            previous.release();
        }
    }

    /// Sends a write op, following it with `getLastError` on the same socket
    /// when the session is in safe mode.
    pub(crate) async fn write_op(&self, db: &str, op: Op) -> Result<Option<LastErrorResponse>> {
        let hold = self.acquire(true).await?;
        let safety = self.state.lock().unwrap().safety.clone();

        let result = match safety {
            None => hold.conn.send(&[op]).await.map(|_| None),
            Some(safe) => {
                let get_last_error =
                    Op::Query(Query::command(db, last_error_command(&safe), false));
                match hold.conn.send_with_reply(&[op, get_last_error]).await {
                    Ok(reply) => interpret_last_error(reply).map(Some),
                    Err(err) => Err(err),
                }
            }
        };

        hold.done();
        result
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        fmt.debug_struct("Session")
            .field("mode", &state.mode)
            .field("bound", &state.conn.as_ref().map(|c| c.id))
            .field("closed", &state.closed)
            .finish()
    }
}

fn last_error_command(safe: &Safe) -> Document {
    let mut command = doc! { "getLastError": 1 };
    if safe.w > 0 {
        command.insert("w", safe.w);
    }
    if let Some(timeout) = safe.w_timeout {
        command.insert("wtimeout", timeout.as_millis() as i64);
    }
    if safe.fsync {
        command.insert("fsync", true);
    }
    command
}

fn interpret_last_error(reply: Reply) -> Result<LastErrorResponse> {
    if let Some(err) = reply_failure(&reply) {
        return Err(err);
    }
    let doc = reply
        .docs
        .into_iter()
        .next()
        .ok_or_else(|| Error::invalid_response("getLastError reply contained no document"))?;

    if !command_ok(&doc) {
        let message = command_errmsg(&doc);
        let code = command_code(&doc);
        return Err(if is_unauthorized_code(code) || is_unauthorized_message(&message) {
            ErrorKind::Unauthorized { message }.into()
        } else {
            ErrorKind::QueryFailure { code, message }.into()
        });
    }

    let response: LastErrorResponse = bson::from_document(doc)?;
    let wtimeout = response.wtimeout.unwrap_or(false);
    let message = response.err.clone().filter(|e| !e.is_empty());

    if wtimeout || message.is_some() {
        let code = response.code.unwrap_or(0);
        let message =
            message.unwrap_or_else(|| "timed out waiting for write concern".to_string());
        if is_unauthorized_code(code) || is_unauthorized_message(&message) {
            return Err(ErrorKind::Unauthorized { message }.into());
        }
        return Err(ErrorKind::LastError(LastError {
            code,
            message,
            n: response.n.unwrap_or(0),
            wtimeout,
        })
        .into());
    }

    Ok(response)
}
