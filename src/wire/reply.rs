use bson::Document;
use byteorder::{LittleEndian, ReadBytesExt};

use super::{flags::ResponseFlags, header::Header};
use crate::error::{Error, Result};

/// A parsed OP_REPLY frame.
#[derive(Debug)]
pub(crate) struct Reply {
    pub response_to: i32,
    pub flags: ResponseFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub docs: Vec<Document>,
}

impl Reply {
    /// Parses a reply body. `body` is the frame with the header already
    /// stripped off.
    pub(crate) fn read_body(header: &Header, body: &[u8]) -> Result<Self> {
        let mut r = std::io::Cursor::new(body);

        let flags = ResponseFlags::from_bits_truncate(r.read_i32::<LittleEndian>()?);
        let cursor_id = r.read_i64::<LittleEndian>()?;
        let starting_from = r.read_i32::<LittleEndian>()?;
        let num_returned = r.read_i32::<LittleEndian>()?;

        let mut docs = Vec::with_capacity(num_returned.max(0) as usize);
        while (r.position() as usize) < body.len() {
            docs.push(Document::from_reader(&mut r)?);
        }

        if docs.len() != num_returned.max(0) as usize {
            return Err(Error::invalid_response(format!(
                "reply declared {} documents but contained {}",
                num_returned,
                docs.len(),
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            docs,
        })
    }

    pub(crate) fn is_query_failure(&self) -> bool {
        self.flags.contains(ResponseFlags::QUERY_FAILURE)
    }

    pub(crate) fn is_cursor_not_found(&self) -> bool {
        self.flags.contains(ResponseFlags::CURSOR_NOT_FOUND)
    }
}
