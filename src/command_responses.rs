use bson::{Bson, Document};
use serde::Deserialize;

/// The portion of an `ismaster` reply the topology sync consumes.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub(crate) struct IsMasterResponse {
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,
    pub secondary: Option<bool>,
    pub hosts: Option<Vec<String>>,
    pub primary: Option<String>,
    /// Set to "isdbgrid" when the responder is a routing proxy.
    pub msg: Option<String>,
}

/// The reply to the `getLastError` command piggybacked after safe writes.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct LastErrorResponse {
    pub err: Option<String>,
    pub code: Option<i32>,
    pub n: Option<i64>,
    pub wtimeout: Option<bool>,
    #[serde(rename = "updatedExisting")]
    pub updated_existing: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GetNonceResponse {
    pub nonce: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct CountResponse {
    pub n: Option<i64>,
}

/// Whether a command reply's `ok` field indicates success. Servers send it
/// as a double, an int, or occasionally a boolean.
pub(crate) fn command_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v != 0.0,
        Some(Bson::Int32(v)) => *v != 0,
        Some(Bson::Int64(v)) => *v != 0,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// The `errmsg` of a failed command, or a placeholder when the server sent
/// none.
pub(crate) fn command_errmsg(doc: &Document) -> String {
    doc.get_str("errmsg")
        .map(str::to_string)
        .unwrap_or_else(|_| "command failed without errmsg".to_string())
}

pub(crate) fn command_code(doc: &Document) -> i32 {
    match doc.get("code") {
        Some(Bson::Int32(v)) => *v,
        Some(Bson::Int64(v)) => *v as i32,
        _ => 0,
    }
}
