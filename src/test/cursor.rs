use std::{sync::Arc, time::Duration};

use bson::{doc, Document};
use pretty_assertions::assert_eq;

use super::{eventually, harness::MockServer, serial};
use crate::connect;

async fn populated(server: &MockServer, n: i64) -> crate::Session {
    let session = connect(server.address()).await.unwrap();
    let docs: Vec<Document> = (0..n).map(|i| doc! { "i": i }).collect();
    session
        .db("mydb")
        .c("mycollection")
        .insert(docs)
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn cursor_streams_every_batch() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 10).await;

    let query = session.db("mydb").c("mycollection").find(doc! {}).batch(3);
    let mut cursor = query.iter().await.unwrap();

    let mut seen = Vec::new();
    while let Some(doc) = cursor.next::<Document>().await.unwrap() {
        seen.push(doc.get_i64("i").unwrap());
    }
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    // 10 documents in batches of 3: the first on the query, the rest over
    // three get-mores (each prefetched as its predecessor drained).
    assert_eq!(server.get_more_count(), 3);
}

#[tokio::test]
async fn query_is_reusable_and_iterators_are_independent() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 4).await;

    let query = session.db("mydb").c("mycollection").find(doc! {}).batch(2);
    let mut first = query.iter().await.unwrap();
    let mut second = query.iter().await.unwrap();

    let mut seen_first = 0;
    while first.next::<Document>().await.unwrap().is_some() {
        seen_first += 1;
    }
    let mut seen_second = 0;
    while second.next::<Document>().await.unwrap().is_some() {
        seen_second += 1;
    }
    assert_eq!(seen_first, 4);
    assert_eq!(seen_second, 4);
}

#[tokio::test]
async fn limit_caps_the_result() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 10).await;

    let query = session
        .db("mydb")
        .c("mycollection")
        .find(doc! {})
        .batch(4)
        .limit(6);
    let mut cursor = query.iter().await.unwrap();

    let mut seen = 0;
    while cursor.next::<Document>().await.unwrap().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 6);
}

#[tokio::test]
async fn one_returns_not_found_on_empty_result() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 1).await;

    let coll = session.db("mydb").c("mycollection");
    let err = coll.find(doc! { "i": 99 }).one::<Document>().await.unwrap_err();
    assert!(err.is_not_found());
}

// Dropping a cursor with a live server-side cursor sends a best-effort
// kill.
#[tokio::test]
async fn dropped_cursor_is_killed_server_side() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 10).await;

    let query = session.db("mydb").c("mycollection").find(doc! {}).batch(3);
    let mut cursor = query.iter().await.unwrap();
    let _ = cursor.next::<Document>().await.unwrap();
    drop(cursor);

    eventually(|| server.kill_cursors_count() == 1).await;
}

// A tailable cursor hands out new documents as they arrive, and reports a
// timeout once nothing shows up within its window.
#[tokio::test]
async fn tail_returns_new_data_then_times_out() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = populated(&server, 2).await;
    let address = server.address().to_string();

    let query = session
        .db("mydb")
        .c("mycollection")
        .find(doc! {})
        .tail(Some(Duration::from_secs(1)));
    let mut cursor = query.iter().await.unwrap();

    assert!(cursor.next::<Document>().await.unwrap().is_some());
    assert!(cursor.next::<Document>().await.unwrap().is_some());

    // Another session appends while this cursor is parked.
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let writer = connect(&address).await.unwrap();
        writer
            .db("mydb")
            .c("mycollection")
            .insert([doc! { "i": 2_i64 }])
            .await
            .unwrap();
    });

    let started = std::time::Instant::now();
    let doc = cursor.next::<Document>().await.unwrap().unwrap();
    assert_eq!(doc.get_i64("i").unwrap(), 2);
    assert!(started.elapsed() < Duration::from_millis(900));

    let started = std::time::Instant::now();
    let err = cursor.next::<Document>().await.unwrap_err();
    assert!(err.is_tail_timeout());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

// Closing the session unblocks a parked tail.
#[tokio::test]
async fn closing_the_session_unblocks_a_tail() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = Arc::new(populated(&server, 1).await);

    let query = session
        .db("mydb")
        .c("mycollection")
        .find(doc! {})
        .tail(None);
    let mut cursor = query.iter().await.unwrap();
    assert!(cursor.next::<Document>().await.unwrap().is_some());

    let closer = session.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        closer.close();
    });

    let err = cursor.next::<Document>().await.unwrap_err();
    assert!(err.is_session_closed());
}
