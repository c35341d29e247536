use std::{
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use tracing::debug;

use super::Topology;
use crate::{
    conn::Connection,
    connstring::ServerAddress,
    error::{ErrorKind, Result},
    stats::STATS,
};

/// Hard cap on open connections per server.
const POOL_LIMIT: isize = 4096;

/// The last role a server reported for itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Role {
    Unknown,
    Master,
    Slave,
    /// A routing proxy in front of a sharded cluster; accepts writes like a
    /// master.
    Mongos,
}

impl Role {
    pub(crate) fn counts_as_master(self) -> bool {
        matches!(self, Role::Master | Role::Mongos)
    }
}

/// One known server: its last-known role and a bounded LIFO pool of idle
/// connections.
pub(crate) struct Server {
    pub(crate) address: ServerAddress,
    /// Owning topology, poked for a resync when a connection abends.
    topology: Weak<Topology>,
    state: Mutex<ServerState>,
}

struct ServerState {
    role: Role,
    pool: Vec<Arc<Connection>>,
    /// Open connections to this server, pooled or not.
    alive: isize,
    /// Set when the owning topology shuts down; check-ins close instead of
    /// pooling.
    draining: bool,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, topology: Weak<Topology>) -> Arc<Self> {
        Arc::new(Self {
            address,
            topology,
            state: Mutex::new(ServerState {
                role: Role::Unknown,
                pool: Vec::new(),
                alive: 0,
                draining: false,
            }),
        })
    }

    pub(crate) fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    /// Records the role the server reported, migrating connection stats
    /// between the master and slave buckets when the classification flips.
    pub(crate) fn set_role(&self, role: Role) {
        let mut state = self.state.lock().unwrap();
        if state.role.counts_as_master() != role.counts_as_master() {
            STATS.conn_moved(state.alive, role.counts_as_master());
        }
        if state.role != role {
            debug!(address = %self.address, ?role, "server reclassified");
        }
        state.role = role;
    }

    /// Connections currently handed out to sessions, cursors, or probes.
    /// Used to prefer the least-loaded slave.
    pub(crate) fn in_use(&self) -> isize {
        let state = self.state.lock().unwrap();
        state.alive - state.pool.len() as isize
    }

    /// Returns a referenced connection: the most recently used idle one, or
    /// a fresh dial up to the pool cap.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<Arc<Connection>> {
        loop {
            let pooled = self.state.lock().unwrap().pool.pop();
            match pooled {
                Some(conn) if conn.error().is_none() => {
                    conn.acquire();
                    return Ok(conn);
                }
                // Abended while idle; accounting already settled.
                Some(conn) => drop(conn),
                None => break,
            }
        }

        // Count the dial before it completes so a racing reclassification
        // migrates it with the rest.
        {
            let mut state = self.state.lock().unwrap();
            if state.draining {
                return Err(ErrorKind::SessionClosed.into());
            }
            if state.alive >= POOL_LIMIT {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("connection limit reached for {}", self.address),
                }
                .into());
            }
            state.alive += 1;
            STATS.conn(1, state.role.counts_as_master());
        }

        match Connection::connect(self.address.clone(), Arc::downgrade(self)).await {
            Ok(conn) => {
                conn.acquire();
                Ok(conn)
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap();
                state.alive -= 1;
                STATS.conn(-1, state.role.counts_as_master());
                Err(err)
            }
        }
    }

    /// Returns a connection whose refcount dropped to zero to the idle pool.
    pub(crate) fn checkin(&self, conn: Arc<Connection>) {
        let close = {
            let mut state = self.state.lock().unwrap();
            if state.draining || conn.error().is_some() {
                true
            } else {
                state.pool.push(conn.clone());
                false
            }
        };
        if close {
            conn.close();
        }
    }

    /// Settles accounting for a connection that closed, wherever it was.
    /// An abended connection also prompts a topology resync: the server may
    /// have changed roles even though it still accepts dials.
    pub(crate) fn note_conn_closed(&self, id: u32, abended: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.pool.retain(|c| c.id != id);
            state.alive -= 1;
            STATS.conn(-1, state.role.counts_as_master());
        }

        if abended {
            if let Some(topology) = self.topology.upgrade() {
                debug!(address = %self.address, "connection abended, requesting sync");
                topology.request_sync();
            }
        }
    }

    /// Closes pooled connections that have sat idle longer than `max_idle`.
    pub(crate) fn prune_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        let evicted: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            let (keep, evict) = std::mem::take(&mut state.pool)
                .into_iter()
                .partition(|c| now.duration_since(c.idle_since()) < max_idle);
            state.pool = keep;
            evict
        };
        for conn in evicted {
            debug!(address = %self.address, id = conn.id, "evicting idle connection");
            conn.close();
        }
    }

    /// Shuts the pool down: idle connections close now, in-use ones close on
    /// their final release.
    pub(crate) fn drain(&self) {
        let pooled = {
            let mut state = self.state.lock().unwrap();
            state.draining = true;
            std::mem::take(&mut state.pool)
        };
        for conn in pooled {
            conn.close();
        }
    }
}
