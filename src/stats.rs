use std::sync::atomic::{AtomicIsize, Ordering};

use lazy_static::lazy_static;

lazy_static! {
    pub(crate) static ref STATS: StatsRecord = StatsRecord::default();
}

/// Process-wide operation counters, updated atomically by every topology.
///
/// These exist primarily so tests can assert on connection and socket
/// accounting; see [`get_stats`] and [`reset_stats`].
#[derive(Default)]
pub(crate) struct StatsRecord {
    master_conns: AtomicIsize,
    slave_conns: AtomicIsize,
    sent_ops: AtomicIsize,
    received_ops: AtomicIsize,
    received_docs: AtomicIsize,
    sockets_alive: AtomicIsize,
    sockets_in_use: AtomicIsize,
    socket_refs: AtomicIsize,
}

impl StatsRecord {
    pub(crate) fn conn(&self, delta: isize, master: bool) {
        if master {
            self.master_conns.fetch_add(delta, Ordering::SeqCst);
        } else {
            self.slave_conns.fetch_add(delta, Ordering::SeqCst);
        }
    }

    /// Migrates `count` live connections between the master and slave
    /// buckets when a server is reclassified.
    pub(crate) fn conn_moved(&self, count: isize, now_master: bool) {
        if count == 0 {
            return;
        }
        self.conn(-count, !now_master);
        self.conn(count, now_master);
    }

    pub(crate) fn sent_ops(&self, delta: isize) {
        self.sent_ops.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn received_ops(&self, delta: isize) {
        self.received_ops.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn received_docs(&self, delta: isize) {
        self.received_docs.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn socket_alive(&self, delta: isize) {
        self.sockets_alive.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn socket_in_use(&self, delta: isize) {
        self.sockets_in_use.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn socket_refs(&self, delta: isize) {
        self.socket_refs.fetch_add(delta, Ordering::SeqCst);
    }
}

/// A snapshot of the process-wide driver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Live connections to servers currently classified as master (or as a
    /// routing proxy, which accepts writes like one).
    pub master_conns: isize,
    /// Live connections to slaves and still-unclassified servers.
    pub slave_conns: isize,
    pub sent_ops: isize,
    pub received_ops: isize,
    pub received_docs: isize,
    /// Sockets open, pooled or not.
    pub sockets_alive: isize,
    /// Sockets referenced by at least one session, cursor, or in-flight
    /// operation.
    pub sockets_in_use: isize,
    /// Total outstanding socket references.
    pub socket_refs: isize,
}

/// Returns a snapshot of the process-wide driver counters.
pub fn get_stats() -> Stats {
    Stats {
        master_conns: STATS.master_conns.load(Ordering::SeqCst),
        slave_conns: STATS.slave_conns.load(Ordering::SeqCst),
        sent_ops: STATS.sent_ops.load(Ordering::SeqCst),
        received_ops: STATS.received_ops.load(Ordering::SeqCst),
        received_docs: STATS.received_docs.load(Ordering::SeqCst),
        sockets_alive: STATS.sockets_alive.load(Ordering::SeqCst),
        sockets_in_use: STATS.sockets_in_use.load(Ordering::SeqCst),
        socket_refs: STATS.socket_refs.load(Ordering::SeqCst),
    }
}

/// Zeroes the process-wide counters. Intended for tests that assert on
/// absolute values.
pub fn reset_stats() {
    STATS.master_conns.store(0, Ordering::SeqCst);
    STATS.slave_conns.store(0, Ordering::SeqCst);
    STATS.sent_ops.store(0, Ordering::SeqCst);
    STATS.received_ops.store(0, Ordering::SeqCst);
    STATS.received_docs.store(0, Ordering::SeqCst);
    STATS.sockets_alive.store(0, Ordering::SeqCst);
    STATS.sockets_in_use.store(0, Ordering::SeqCst);
    STATS.socket_refs.store(0, Ordering::SeqCst);
}
