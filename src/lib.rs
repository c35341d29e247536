//! This crate is a pure Rust driver for MongoDB-compatible replicated
//! document databases, speaking the classic wire protocol. It discovers the
//! members of a replica set from one or more seed addresses, keeps their
//! roles current through elections and failovers, and routes every
//! operation according to the session's consistency mode.
//!
//! To connect, pass a connection string to [`connect`]:
//!
//! ```no_run
//! use mrd::error::Result;
//!
//! # async fn example() -> Result<()> {
//! let session = mrd::connect("mongodb://localhost:27017").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Operations go through `Database` and `Collection` handles derived from
//! the session:
//!
//! ```no_run
//! use mrd::{bson::doc, error::Result};
//!
//! # async fn example() -> Result<()> {
//! # let session = mrd::connect("mongodb://localhost:27017").await?;
//! let people = session.db("mydb").c("people");
//! people.insert([doc! { "name": "Ada" }]).await?;
//!
//! let ada: mrd::bson::Document = people.find(doc! { "name": "Ada" }).one().await?;
//! # Ok(())
//! # }
//! ```
//!
//! A session's consistency mode decides where reads and writes go and
//! whether the session stays bound to one socket: `Strong` pins everything
//! to the master, `Monotonic` reads from a slave until the first write, and
//! `Eventual` spreads reads over slaves with nothing reserved. Writes are
//! confirmed through the piggybacked `getLastError` command unless the
//! session is switched to unsafe mode.

#[macro_use]
extern crate bitflags;

mod auth;
mod coll;
mod command_responses;
mod conn;
mod connstring;
mod cursor;
mod db;
pub mod error;
mod query;
mod session;
mod stats;
#[cfg(test)]
mod test;
mod topology;
mod wire;

pub use bson;

pub use crate::{
    coll::Collection,
    connstring::ServerAddress,
    cursor::Cursor,
    db::{Command, Database},
    query::Query,
    session::{Mode, Safe, Session},
    stats::{get_stats, reset_stats, Stats},
};

use crate::{connstring::ConnectionString, error::Result};

/// Establishes a session with the cluster reachable through the given
/// connection string.
///
/// Topology discovery starts in the background; the first operation on the
/// session waits for it, up to the session's sync timeout. Accepts
/// `mongodb://` URLs and bare `host:port` addresses; see
/// [`ServerAddress`] and the crate docs for the recognized forms.
pub async fn connect(uri: &str) -> Result<Session> {
    let connstring = ConnectionString::parse(uri)?;
    Ok(Session::connect(connstring))
}
