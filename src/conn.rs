use std::{
    collections::HashMap,
    io::ErrorKind as IoErrorKind,
    sync::{
        atomic::{AtomicI32, AtomicU32, Ordering},
        Arc, Mutex, Weak,
    },
    time::Instant,
};

use bson::Document;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    auth::Credential,
    connstring::ServerAddress,
    error::{
        is_unauthorized_code, is_unauthorized_message, Error, ErrorKind, Result,
    },
    stats::STATS,
    topology::Server,
    wire::{Header, Op, Query, Reply},
};

/// Replies larger than this indicate a corrupt length field rather than a
/// legitimate message.
const MAX_MESSAGE_LENGTH: i32 = 48 * 1024 * 1024;

static NEXT_CONNECTION_ID: AtomicU32 = AtomicU32::new(0);

/// One TCP connection to one server.
///
/// Writes are serialized by an internal mutex held only while the frame goes
/// out; replies are read by a background task and dispatched to waiters by
/// the `responseTo` field, so any number of callers can have requests in
/// flight concurrently.
///
/// Connections are explicitly reference-counted on top of `Arc`: sessions,
/// cursors, and pools all share them, and when the count drops to zero the
/// connection returns to its server's idle pool (or is closed, if it
/// previously failed).
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    server: Weak<Server>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    next_request_id: AtomicI32,
    state: Mutex<ConnectionState>,
}

struct ConnectionState {
    pending: HashMap<i32, oneshot::Sender<Result<Reply>>>,
    /// Set once on failure or close; never cleared.
    error: Option<Error>,
    dead: bool,
    logins: Vec<Credential>,
    refs: isize,
    last_used: Instant,
    reader: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) async fn connect(
        address: ServerAddress,
        server: Weak<Server>,
    ) -> Result<Arc<Self>> {
        let stream =
            TcpStream::connect((address.hostname(), address.port())).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst),
            address,
            server,
            writer: tokio::sync::Mutex::new(write_half),
            next_request_id: AtomicI32::new(1),
            state: Mutex::new(ConnectionState {
                pending: HashMap::new(),
                error: None,
                dead: false,
                logins: Vec::new(),
                refs: 0,
                last_used: Instant::now(),
                reader: None,
            }),
        });

        STATS.socket_alive(1);
        let reader = tokio::spawn(reader_loop(conn.clone(), read_half));
        {
            let mut state = conn.state.lock().unwrap();
            if state.dead {
                reader.abort();
            } else {
                state.reader = Some(reader);
            }
        }

        debug!(id = conn.id, address = %conn.address, "connection established");
        Ok(conn)
    }

    /// Adds a reference. The holder must pair this with [`release`].
    pub(crate) fn acquire(&self) {
        let mut state = self.state.lock().unwrap();
        state.refs += 1;
        STATS.socket_refs(1);
        if state.refs == 1 {
            STATS.socket_in_use(1);
        }
    }

    /// Drops a reference. At zero the connection goes back to its server's
    /// pool, or is closed if it abended or the server is gone.
    pub(crate) fn release(self: &Arc<Self>) {
        let (last, errored) = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.refs > 0, "connection released more times than acquired");
            state.refs -= 1;
            STATS.socket_refs(-1);
            if state.refs == 0 {
                STATS.socket_in_use(-1);
                state.last_used = Instant::now();
                (true, state.error.is_some())
            } else {
                (false, false)
            }
        };

        if !last {
            return;
        }

        if errored {
            self.close();
            return;
        }

        match self.server.upgrade() {
            Some(server) => server.checkin(self.clone()),
            None => self.close(),
        }
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.state.lock().unwrap().error.clone()
    }

    pub(crate) fn idle_since(&self) -> Instant {
        self.state.lock().unwrap().last_used
    }

    /// Credentials successfully replayed on this connection, cached across
    /// pool reuse.
    pub(crate) fn logins(&self) -> Vec<Credential> {
        self.state.lock().unwrap().logins.clone()
    }

    pub(crate) fn note_login(&self, credential: Credential) {
        let mut state = self.state.lock().unwrap();
        state.logins.retain(|c| c.db != credential.db);
        state.logins.push(credential);
    }

    pub(crate) fn note_logout(&self, db: &str) {
        self.state.lock().unwrap().logins.retain(|c| c.db != db);
    }

    /// Whether this connection's server is currently classified as a write
    /// target.
    pub(crate) fn on_master(&self) -> bool {
        self.server
            .upgrade()
            .map(|s| s.role().counts_as_master())
            .unwrap_or(false)
    }

    /// Sends `ops` as one contiguous write with no reply expected.
    pub(crate) async fn send(&self, ops: &[Op]) -> Result<()> {
        self.send_inner(ops, false).await.map(drop)
    }

    /// Sends `ops` as one contiguous write and awaits the reply to the last
    /// of them, which must be a reply-bearing op.
    pub(crate) async fn send_with_reply(&self, ops: &[Op]) -> Result<Reply> {
        debug_assert!(ops.last().map(Op::expects_reply).unwrap_or(false));
        let reply = self.send_inner(ops, true).await?;
        Ok(reply.expect("send_inner returns a reply when one was requested"))
    }

    async fn send_inner(&self, ops: &[Op], want_reply: bool) -> Result<Option<Reply>> {
        let mut buf = Vec::new();
        let mut last_id = 0;
        for op in ops {
            last_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
            op.append_to(&mut buf, last_id)?;
        }

        // Register the waiter before the frame can possibly be answered, and
        // under the same lock that guards the error slot so an abend cannot
        // slip between the check and the insert.
        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(ref err) = state.error {
                return Err(err.clone());
            }
            state.last_used = Instant::now();
            if want_reply {
                let (tx, rx) = oneshot::channel();
                state.pending.insert(last_id, tx);
                Some(rx)
            } else {
                None
            }
        };

        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write_all(&buf).await {
                let err = Error::from(ErrorKind::Io(err));
                self.close_with(err.clone(), true);
                return Err(err);
            }
        }
        STATS.sent_ops(ops.len() as isize);

        match rx {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(result) => result.map(Some),
                // The sender is only dropped when the connection dies between
                // the map drain and our await.
                Err(_) => Err(self
                    .error()
                    .unwrap_or_else(|| Error::from(ErrorKind::Io(closed_error())))),
            },
        }
    }

    /// Runs a single command as a one-document query against `db.$cmd` and
    /// returns the reply document. Callers interpret the `ok` field.
    pub(crate) async fn run_command(
        &self,
        db: &str,
        command: Document,
        slave_ok: bool,
    ) -> Result<Document> {
        let op = Op::Query(Query::command(db, command, slave_ok));
        let reply = self.send_with_reply(&[op]).await?;
        if let Some(err) = reply_failure(&reply) {
            return Err(err);
        }
        reply
            .docs
            .into_iter()
            .next()
            .ok_or_else(|| Error::invalid_response("command reply contained no document"))
    }

    /// Closes the connection, failing all parked waiters.
    pub(crate) fn close(&self) {
        self.close_with(Error::from(ErrorKind::Io(closed_error())), false);
    }

    /// `abended` marks an I/O failure, as opposed to a deliberate close; an
    /// abend is reported to the server so the topology re-probes, since the
    /// failure may be a role change on a host that still accepts dials.
    fn close_with(&self, cause: Error, abended: bool) {
        let (pending, reader) = {
            let mut state = self.state.lock().unwrap();
            if state.dead {
                return;
            }
            state.dead = true;
            state.error.get_or_insert_with(|| cause.clone());
            (std::mem::take(&mut state.pending), state.reader.take())
        };

        for (_, tx) in pending {
            let _ = tx.send(Err(cause.clone()));
        }

        STATS.socket_alive(-1);
        if let Some(server) = self.server.upgrade() {
            server.note_conn_closed(self.id, abended);
        }
        if let Some(reader) = reader {
            reader.abort();
        }

        debug!(id = self.id, address = %self.address, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Normally closed explicitly; this covers teardown paths.
        let dead = self.state.lock().unwrap().dead;
        if !dead {
            self.close();
        }
    }
}

/// Reads replies off the wire and hands each to the waiter registered under
/// its `responseTo`, until the stream fails or the connection is closed.
async fn reader_loop(conn: Arc<Connection>, mut stream: OwnedReadHalf) {
    loop {
        let reply = match read_reply(&mut stream).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    id = conn.id,
                    address = %conn.address,
                    error = %err,
                    "connection abended",
                );
                conn.close_with(err, true);
                return;
            }
        };

        STATS.received_ops(1);
        STATS.received_docs(reply.docs.len() as isize);

        let waiter = {
            let mut state = conn.state.lock().unwrap();
            state.pending.remove(&reply.response_to)
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(Ok(reply));
            }
            None => {
                trace!(
                    id = conn.id,
                    response_to = reply.response_to,
                    "reply without a waiter dropped",
                );
            }
        }
    }
}

async fn read_reply(stream: &mut OwnedReadHalf) -> Result<Reply> {
    let mut header_buf = [0u8; Header::LENGTH];
    stream.read_exact(&mut header_buf).await?;
    let header = Header::read_from(&mut &header_buf[..])?;

    if header.length < Header::LENGTH as i32 || header.length > MAX_MESSAGE_LENGTH {
        return Err(Error::invalid_response(format!(
            "nonsensical message length: {}",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize - Header::LENGTH];
    stream.read_exact(&mut body).await?;

    Reply::read_body(&header, &body)
}

/// Maps a reply's failure flags to an error, if any.
pub(crate) fn reply_failure(reply: &Reply) -> Option<Error> {
    if !reply.is_query_failure() {
        return None;
    }

    let doc = match reply.docs.first() {
        Some(doc) => doc,
        None => return Some(Error::invalid_response("query failure without a document")),
    };
    let message = doc
        .get_str("$err")
        .map(str::to_string)
        .unwrap_or_else(|_| "query failure without $err".to_string());
    let code = doc.get_i32("code").unwrap_or(0);

    if is_unauthorized_code(code) || is_unauthorized_message(&message) {
        Some(ErrorKind::Unauthorized { message }.into())
    } else {
        Some(ErrorKind::QueryFailure { code, message }.into())
    }
}

fn closed_error() -> std::io::Error {
    std::io::Error::new(IoErrorKind::NotConnected, "connection was closed")
}
