use std::time::Duration;

use bson::{doc, Document};
use pretty_assertions::assert_eq;

use super::{eventually, eventually_async, harness::MockServer, serial, serial_with_stats};
use crate::{connect, error::ErrorKind, get_stats};

// Connect to the master of a single-server deployment, insert, read the
// document back, and check that exactly one connection was established and
// recycled for the insert.
#[tokio::test]
async fn topology_sync_with_single_master() {
    let _guard = serial_with_stats();
    let server = MockServer::start().await;
    let session = connect(server.address()).await.unwrap();

    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "a": 1, "b": 2 }]).await.unwrap();

    let found: Document = coll.find(doc! { "a": 1 }).one().await.unwrap();
    assert_eq!(found, doc! { "a": 1, "b": 2 });

    let stats = get_stats();
    assert_eq!(stats.master_conns, 1);
    assert_eq!(stats.slave_conns, 0);
    assert_eq!(stats.sockets_in_use, 1);

    // Refresh the session and the socket must be released.
    session.refresh();
    let stats = get_stats();
    assert_eq!(stats.sockets_in_use, 0);
}

// Seed with a slave of a three-node set. Discovery must find the master,
// and a monotonic session must move there on its first write.
#[tokio::test]
async fn topology_sync_with_slave_seed() {
    let _guard = serial_with_stats();
    let master = MockServer::start().await;
    let slave_a = MockServer::start().await;
    let slave_b = MockServer::start().await;

    let hosts = vec![
        master.address().to_string(),
        slave_a.address().to_string(),
        slave_b.address().to_string(),
    ];
    slave_a.make_slave(Some(master.address()));
    slave_b.make_slave(Some(master.address()));
    for server in [&master, &slave_a, &slave_b] {
        server.set_hosts(hosts.clone());
    }

    let session = connect(slave_a.address()).await.unwrap();
    session.monotonic();

    // Before any write, reads run on a slave.
    let reply: Document = session.run(doc! { "ismaster": 1 }).await.unwrap();
    assert!(!reply.get_bool("ismaster").unwrap());

    session
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 1, "b": 2 }])
        .await
        .unwrap();
    assert_eq!(master.docs("mydb.mycollection").len(), 1);

    // The first write bound the session to the master.
    let reply: Document = session.run(doc! { "ismaster": 1 }).await.unwrap();
    assert!(reply.get_bool("ismaster").unwrap());

    // One connection to each server during discovery, master socket
    // recycled for the insert.
    let stats = get_stats();
    assert_eq!(stats.master_conns, 1);
    assert_eq!(stats.slave_conns, 2);
    assert_eq!(stats.sockets_in_use, 1);

    session.refresh();
    assert_eq!(get_stats().sockets_in_use, 0);
}

// Kill the master of a two-node set: the strong session keeps failing on
// its reserved socket until refreshed, then finds the newly elected master.
#[tokio::test]
async fn failover_to_new_master_after_refresh() {
    let _guard = serial();
    let old_master = MockServer::start().await;
    let slave = MockServer::start().await;
    let hosts = vec![
        old_master.address().to_string(),
        slave.address().to_string(),
    ];
    slave.make_slave(Some(old_master.address()));
    old_master.set_hosts(hosts.clone());
    slave.set_hosts(hosts.clone());

    let session = connect(&format!(
        "mongodb://{},{}",
        old_master.address(),
        slave.address()
    ))
    .await
    .unwrap();
    session.set_sync_timeout(Duration::from_secs(2));

    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "n": 1 }]).await.unwrap();

    old_master.stop();

    // The reserved socket is dead; so is the next attempt on it.
    let err = coll.insert([doc! { "n": 2 }]).await.unwrap_err();
    assert!(err.is_network_error());
    let err = coll.insert([doc! { "n": 3 }]).await.unwrap_err();
    assert!(err.is_network_error());

    // Election: the remaining member takes over.
    slave.make_master();
    session.refresh();
    coll.insert([doc! { "n": 4 }]).await.unwrap();
    assert_eq!(slave.docs("mydb.mycollection").len(), 1);
}

// A stepdown resets the client's sockets but the host keeps accepting new
// dials. The abended socket alone must prompt a re-probe, with no failed
// dial and no explicit refresh, so writes move to the new master instead
// of reconnecting to the stale one.
#[tokio::test]
async fn socket_abend_prompts_resync_while_server_stays_reachable() {
    let _guard = serial();
    let stepping_down = MockServer::start().await;
    let successor = MockServer::start().await;
    let hosts = vec![
        stepping_down.address().to_string(),
        successor.address().to_string(),
    ];
    successor.make_slave(Some(stepping_down.address()));
    stepping_down.set_hosts(hosts.clone());
    successor.set_hosts(hosts.clone());

    let session = connect(&format!(
        "mongodb://{},{}",
        stepping_down.address(),
        successor.address()
    ))
    .await
    .unwrap();
    session.eventual();

    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "n": 1 }]).await.unwrap();
    assert_eq!(stepping_down.docs("mydb.mycollection").len(), 1);

    // Election: roles swap, and the old master resets its connections
    // while staying reachable.
    stepping_down.make_slave(Some(successor.address()));
    successor.make_master();
    let probes_before = successor.query_count();
    stepping_down.drop_connections();

    // The re-probe arrives with no session activity in between.
    eventually(|| successor.query_count() > probes_before).await;

    // And once the pass lands, writes route to the new master.
    eventually_async(|| async {
        coll.insert([doc! { "probe": true }]).await.unwrap();
        !successor.docs("mydb.mycollection").is_empty()
    })
    .await;
}

#[tokio::test]
async fn unreachable_seed_fails_with_no_reachable_servers() {
    let _guard = serial();
    let server = MockServer::start().await;
    let address = server.address().to_string();
    drop(server);

    let session = connect(&address).await.unwrap();
    session.set_sync_timeout(Duration::from_millis(300));

    let err = session
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 1 }])
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::NoReachableServers));
}

// connect=direct skips discovery and takes the seed as it is, even when it
// reports itself a slave.
#[tokio::test]
async fn direct_connect_uses_the_seed_authoritatively() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.make_slave(None);

    let session = connect(&format!("mongodb://{}/?connect=direct", server.address()))
        .await
        .unwrap();
    session
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 1 }])
        .await
        .unwrap();
    assert_eq!(server.docs("mydb.mycollection").len(), 1);
}

// In eventual mode nothing is reserved between operations.
#[tokio::test]
async fn eventual_mode_reserves_no_socket() {
    let _guard = serial_with_stats();
    let server = MockServer::start().await;
    let session = connect(server.address()).await.unwrap();
    session.eventual();

    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "a": 1 }]).await.unwrap();
    let _: Document = coll.find(doc! { "a": 1 }).one().await.unwrap();

    assert_eq!(get_stats().sockets_in_use, 0);
}
