mod server;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicIsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bson::doc;
use tokio::{
    sync::{watch, Notify},
    task::JoinSet,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    command_responses::IsMasterResponse,
    conn::Connection,
    connstring::{ConnectionString, ServerAddress},
    error::{Error, ErrorKind, Result},
};

use self::server::Role;
pub(crate) use self::server::Server;

/// How long an acquire may wait for a usable server before failing with
/// `NoReachableServers`, unless the session overrides it.
pub(crate) const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(7);

/// Delay between unprompted topology sync passes.
const HEARTBEAT: Duration = Duration::from_secs(10);

/// Pooled connections idle longer than this are closed between sync passes.
const MAX_IDLE: Duration = Duration::from_secs(5 * 60);

/// The class of server an operation needs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum AcquireMode {
    /// Writes and strongly consistent reads: a master (or routing proxy).
    Master,
    /// Reads that tolerate lag: the least-loaded slave, falling back to a
    /// master when no slave is reachable.
    PreferSlave,
}

/// The set of known servers of one logical cluster and the machinery that
/// keeps their roles current.
///
/// A background task re-runs discovery on a heartbeat, when an acquire finds
/// no candidate, or when a connection abends. Sessions share one `Topology`
/// per connect and refcount it; the task exits when the last session closes.
pub(crate) struct Topology {
    seeds: Vec<ServerAddress>,
    direct: bool,
    state: Mutex<TopologyState>,
    /// Wakes the monitor for an immediate sync pass.
    sync_wanted: Notify,
    /// Bumped after every sync pass so acquirers can re-pick.
    epoch: watch::Sender<u64>,
    sessions: AtomicIsize,
}

struct TopologyState {
    servers: HashMap<ServerAddress, Arc<Server>>,
    masters: Vec<ServerAddress>,
    slaves: Vec<ServerAddress>,
    closed: bool,
}

impl Topology {
    /// Creates the topology for one connect and starts its monitor task.
    /// The caller must be running on a tokio runtime.
    pub(crate) fn new(connstring: &ConnectionString) -> Arc<Self> {
        let (epoch, _) = watch::channel(0);
        let topology = Arc::new(Self {
            seeds: connstring.addrs.clone(),
            direct: connstring.direct,
            state: Mutex::new(TopologyState {
                servers: HashMap::new(),
                masters: Vec::new(),
                slaves: Vec::new(),
                closed: false,
            }),
            sync_wanted: Notify::new(),
            epoch,
            sessions: AtomicIsize::new(0),
        });

        // Seed servers are created here rather than above so they carry the
        // back-reference for abend-triggered resyncs.
        for addr in &connstring.addrs {
            topology.server(addr);
        }

        tokio::spawn(monitor_loop(topology.clone()));
        topology
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops a session reference; the last one shuts the topology down.
    pub(crate) fn session_closed(&self) {
        if self.sessions.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }

        let servers: Vec<_> = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.servers.values().cloned().collect()
        };
        for server in servers {
            server.drain();
        }
        self.sync_wanted.notify_one();
        self.epoch.send_modify(|e| *e += 1);
        info!("topology released by last session");
    }

    fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Asks the monitor for a sync pass without waiting for it.
    pub(crate) fn request_sync(&self) {
        self.sync_wanted.notify_one();
    }

    /// Returns a referenced connection to a server of the requested class,
    /// running discovery as needed. Fails with `NoReachableServers` once
    /// `sync_timeout` elapses without a usable candidate.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        mode: AcquireMode,
        sync_timeout: Duration,
    ) -> Result<Arc<Connection>> {
        let deadline = Instant::now() + sync_timeout;
        let mut epoch = self.epoch.subscribe();
        let mut tried = HashSet::new();

        loop {
            if self.is_closed() {
                return Err(Error::session_closed());
            }

            // Snapshot the epoch before picking so a sync completing in
            // between is not missed below.
            let _ = epoch.borrow_and_update();

            match self.pick(mode, &tried) {
                Some(server) => match server.acquire().await {
                    Ok(conn) => return Ok(conn),
                    Err(err) => {
                        warn!(
                            address = %server.address,
                            error = %err,
                            "could not acquire connection",
                        );
                        tried.insert(server.address.clone());
                        self.request_sync();
                    }
                },
                None => {
                    self.request_sync();
                    if Instant::now() >= deadline {
                        return Err(ErrorKind::NoReachableServers.into());
                    }
                    if tokio::time::timeout_at(deadline, epoch.changed())
                        .await
                        .is_err()
                    {
                        return Err(ErrorKind::NoReachableServers.into());
                    }
                    tried.clear();
                }
            }
        }
    }

    fn pick(&self, mode: AcquireMode, tried: &HashSet<ServerAddress>) -> Option<Arc<Server>> {
        let state = self.state.lock().unwrap();

        let least_loaded = |addrs: &[ServerAddress]| {
            addrs
                .iter()
                .filter(|a| !tried.contains(*a))
                .filter_map(|a| state.servers.get(a))
                .min_by_key(|s| s.in_use())
                .cloned()
        };

        match mode {
            AcquireMode::Master => least_loaded(&state.masters),
            AcquireMode::PreferSlave => {
                least_loaded(&state.slaves).or_else(|| least_loaded(&state.masters))
            }
        }
    }

    fn server(self: &Arc<Self>, address: &ServerAddress) -> Arc<Server> {
        let mut state = self.state.lock().unwrap();
        state
            .servers
            .entry(address.clone())
            .or_insert_with(|| Server::new(address.clone(), Arc::downgrade(self)))
            .clone()
    }

    fn known_addresses(&self) -> Vec<ServerAddress> {
        let state = self.state.lock().unwrap();
        let mut addresses: Vec<_> = state.servers.keys().cloned().collect();
        for seed in &self.seeds {
            if !addresses.contains(seed) {
                addresses.push(seed.clone());
            }
        }
        addresses
    }

    /// One full discovery pass: probe every known address in parallel,
    /// recurse over newly learned hosts, then atomically install the new
    /// master/slave sets.
    async fn sync_once(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        debug!("topology sync starting");

        let mut probes = JoinSet::new();
        let mut seen = HashSet::new();
        for address in self.known_addresses() {
            seen.insert(address.clone());
            probes.spawn(probe(self.clone(), address));
        }

        let mut masters = Vec::new();
        let mut slaves = Vec::new();

        while let Some(joined) = probes.join_next().await {
            let Ok((address, result)) = joined else {
                continue;
            };

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    // Out of this round, but kept in history for the next.
                    debug!(address = %address, error = %err, "server did not respond");
                    continue;
                }
            };

            let role = classify(&response);
            self.server(&address).set_role(role);

            if self.direct {
                // The seed is authoritative regardless of what it reports.
                masters.push(address);
                continue;
            }

            match role {
                Role::Master | Role::Mongos => masters.push(address),
                Role::Slave => slaves.push(address),
                Role::Unknown => {}
            }

            let mut learned = response.hosts.unwrap_or_default();
            if let Some(primary) = response.primary {
                learned.push(primary);
            }
            for host in learned {
                match ServerAddress::parse(&host) {
                    Ok(address) => {
                        if seen.insert(address.clone()) {
                            probes.spawn(probe(self.clone(), address));
                        }
                    }
                    Err(_) => warn!(host = %host, "server advertised an unparseable host"),
                }
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            masters.sort();
            slaves.sort();
            if state.masters != masters || state.slaves != slaves {
                info!(?masters, ?slaves, "topology changed");
            }
            state.masters = masters;
            state.slaves = slaves;
        }
        self.epoch.send_modify(|e| *e += 1);
    }

    fn prune_idle_pools(&self) {
        let servers: Vec<_> = {
            let state = self.state.lock().unwrap();
            state.servers.values().cloned().collect()
        };
        for server in servers {
            server.prune_idle(MAX_IDLE);
        }
    }
}

async fn monitor_loop(topology: Arc<Topology>) {
    loop {
        if topology.is_closed() {
            break;
        }
        topology.sync_once().await;
        topology.prune_idle_pools();

        tokio::select! {
            _ = sleep(HEARTBEAT) => {}
            _ = topology.sync_wanted.notified() => {}
        }
    }

    // A sync pass racing the shutdown may have re-pooled connections.
    let servers: Vec<_> = {
        let state = topology.state.lock().unwrap();
        state.servers.values().cloned().collect()
    };
    for server in servers {
        server.drain();
    }
    debug!("topology monitor stopped");
}

async fn probe(
    topology: Arc<Topology>,
    address: ServerAddress,
) -> (ServerAddress, Result<IsMasterResponse>) {
    let server = topology.server(&address);

    let result = timeout(DEFAULT_SYNC_TIMEOUT, async {
        let conn = server.acquire().await?;
        let result = conn.run_command("admin", doc! { "ismaster": 1 }, true).await;
        conn.release();
        Ok(bson::from_document::<IsMasterResponse>(result?)?)
    })
    .await
    .unwrap_or_else(|_| {
        Err(Error::from(ErrorKind::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "ismaster probe timed out",
        ))))
    });

    (address, result)
}

fn classify(response: &IsMasterResponse) -> Role {
    if response.msg.as_deref() == Some("isdbgrid") {
        Role::Mongos
    } else if response.is_master == Some(true) {
        Role::Master
    } else if response.secondary == Some(true) {
        Role::Slave
    } else {
        Role::Unknown
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn response(doc: bson::Document) -> IsMasterResponse {
        bson::from_document(doc).unwrap()
    }

    #[test]
    fn classify_roles() {
        assert_eq!(classify(&response(doc! { "ismaster": true })), Role::Master);
        assert_eq!(
            classify(&response(doc! { "ismaster": false, "secondary": true })),
            Role::Slave
        );
        assert_eq!(
            classify(&response(doc! { "ismaster": true, "msg": "isdbgrid" })),
            Role::Mongos
        );
        assert_eq!(
            classify(&response(doc! { "ismaster": false, "secondary": false })),
            Role::Unknown
        );
    }
}
