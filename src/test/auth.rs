use bson::doc;

use super::{harness::MockServer, serial};
use crate::{connect, error::ErrorKind};

#[tokio::test]
async fn login_rejects_a_bad_password() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.add_user("admin", "root", "rapadura");
    server.require_auth();

    let session = connect(server.address()).await.unwrap();
    let err = session
        .db("admin")
        .login("root", "wrong")
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::AuthenticationFailed { .. }));
}

// A transient login survives a refresh: the credential is replayed on
// whatever socket the session acquires next.
#[tokio::test]
async fn credentials_replay_after_refresh() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.add_user("admin", "root", "rapadura");
    server.require_auth();

    let session = connect(server.address()).await.unwrap();
    session.db("admin").login("root", "rapadura").await.unwrap();

    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "a": 1 }]).await.unwrap();

    session.refresh();
    coll.insert([doc! { "a": 2 }]).await.unwrap();
    assert_eq!(server.docs("mydb.mycollection").len(), 2);
}

// A session derived via new_session does not inherit transient logins, and
// a pooled socket that still carries one is logged out before it serves
// the new session.
#[tokio::test]
async fn new_session_drops_transient_logins() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.add_user("admin", "root", "rapadura");
    server.require_auth();

    let session = connect(server.address()).await.unwrap();
    session.db("admin").login("root", "rapadura").await.unwrap();
    let coll = session.db("mydb").c("mycollection");
    coll.insert([doc! { "a": 1 }]).await.unwrap();
    session.refresh();

    let fresh = session.new_session();
    let err = fresh
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 2 }])
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::Unauthorized { .. }));
}

// Credentials from the connection string are permanent: they propagate to
// sessions derived via new_session.
#[tokio::test]
async fn url_credentials_propagate_to_derived_sessions() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.add_user("admin", "root", "rapadura");
    server.require_auth();

    let session = connect(&format!("mongodb://root:rapadura@{}/admin", server.address()))
        .await
        .unwrap();
    session
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 1 }])
        .await
        .unwrap();

    let fresh = session.new_session();
    fresh
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 2 }])
        .await
        .unwrap();
    assert_eq!(server.docs("mydb.mycollection").len(), 2);
}

// Clone carries transient logins; logout on the original removes the
// credential from it but not from the clone.
#[tokio::test]
async fn clone_carries_logins() {
    let _guard = serial();
    let server = MockServer::start().await;
    server.add_user("admin", "root", "rapadura");
    server.require_auth();

    let session = connect(server.address()).await.unwrap();
    session.db("admin").login("root", "rapadura").await.unwrap();

    let clone = session.clone_session();
    clone
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 1 }])
        .await
        .unwrap();

    session.db("admin").logout().await;
    session.refresh();
    let err = session
        .db("mydb")
        .c("mycollection")
        .insert([doc! { "a": 2 }])
        .await
        .unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::Unauthorized { .. }));
}

#[tokio::test]
async fn user_management_round_trip() {
    let _guard = serial();
    let server = MockServer::start().await;
    let session = connect(server.address()).await.unwrap();
    let db = session.db("mydb");

    db.add_user("reader", "secret", true).await.unwrap();
    let users = server.docs("mydb.system.users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get_str("user").unwrap(), "reader");
    assert!(users[0].get_bool("readOnly").unwrap());
    // The cleartext password never reaches the server.
    assert_ne!(users[0].get_str("pwd").unwrap(), "secret");

    db.remove_user("reader").await.unwrap();
    assert!(server.docs("mydb.system.users").is_empty());

    let err = db.remove_user("reader").await.unwrap_err();
    assert!(err.is_not_found());
}
