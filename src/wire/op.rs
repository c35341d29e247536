use std::io::Write;

use bson::Document;
use byteorder::{LittleEndian, WriteBytesExt};

use super::{
    flags::{DeleteFlags, QueryFlags, UpdateFlags},
    header::{Header, OpCode},
};
use crate::error::Result;

/// A request operation, ready to be framed and put on the wire.
///
/// Each variant knows its own body layout; document contents are delegated
/// to the codec. Only `Query` and `GetMore` produce a reply.
#[derive(Debug)]
pub(crate) enum Op {
    Query(Query),
    GetMore(GetMore),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    KillCursors(KillCursors),
}

impl Op {
    pub(crate) fn op_code(&self) -> OpCode {
        match self {
            Op::Query(..) => OpCode::Query,
            Op::GetMore(..) => OpCode::GetMore,
            Op::Insert(..) => OpCode::Insert,
            Op::Update(..) => OpCode::Update,
            Op::Delete(..) => OpCode::Delete,
            Op::KillCursors(..) => OpCode::KillCursors,
        }
    }

    pub(crate) fn expects_reply(&self) -> bool {
        matches!(self, Op::Query(..) | Op::GetMore(..))
    }

    /// Appends the full frame (header + body) for this op to `buf`, patching
    /// the length field once the body size is known.
    pub(crate) fn append_to(&self, buf: &mut Vec<u8>, request_id: i32) -> Result<()> {
        let start = buf.len();

        let header = Header {
            length: 0,
            request_id,
            response_to: 0,
            op_code: self.op_code(),
        };
        header.write_to(buf)?;

        match self {
            Op::Query(op) => op.write_body(buf)?,
            Op::GetMore(op) => op.write_body(buf)?,
            Op::Insert(op) => op.write_body(buf)?,
            Op::Update(op) => op.write_body(buf)?,
            Op::Delete(op) => op.write_body(buf)?,
            Op::KillCursors(op) => op.write_body(buf)?,
        }

        let length = (buf.len() - start) as i32;
        (&mut buf[start..start + 4]).write_i32::<LittleEndian>(length)?;

        Ok(())
    }
}

fn write_cstring<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_all(s.as_bytes())?;
    w.write_all(&[0])?;
    Ok(())
}

#[derive(Debug)]
pub(crate) struct Query {
    pub flags: QueryFlags,
    pub full_collection_name: String,
    pub num_to_skip: i32,
    pub num_to_return: i32,
    pub query: Document,
    pub return_field_selector: Option<Document>,
}

impl Query {
    /// A single-document command query against `db.$cmd`.
    pub(crate) fn command(db: &str, command: Document, slave_ok: bool) -> Self {
        let mut flags = QueryFlags::empty();
        if slave_ok {
            flags.insert(QueryFlags::SLAVE_OK);
        }

        Self {
            flags,
            full_collection_name: format!("{}.$cmd", db),
            num_to_skip: 0,
            num_to_return: -1,
            query: command,
            return_field_selector: None,
        }
    }

    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(self.flags.bits())?;
        write_cstring(w, &self.full_collection_name)?;
        w.write_i32::<LittleEndian>(self.num_to_skip)?;
        w.write_i32::<LittleEndian>(self.num_to_return)?;

        self.query.to_writer(&mut *w)?;

        if let Some(ref return_field_selector) = self.return_field_selector {
            return_field_selector.to_writer(w)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct GetMore {
    pub full_collection_name: String,
    pub num_to_return: i32,
    pub cursor_id: i64,
}

impl GetMore {
    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(0)?; // reserved
        write_cstring(w, &self.full_collection_name)?;
        w.write_i32::<LittleEndian>(self.num_to_return)?;
        w.write_i64::<LittleEndian>(self.cursor_id)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Insert {
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

impl Insert {
    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(0)?; // flags
        write_cstring(w, &self.full_collection_name)?;
        for document in &self.documents {
            document.to_writer(&mut *w)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Update {
    pub full_collection_name: String,
    pub flags: UpdateFlags,
    pub selector: Document,
    pub update: Document,
}

impl Update {
    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(0)?; // reserved
        write_cstring(w, &self.full_collection_name)?;
        w.write_i32::<LittleEndian>(self.flags.bits())?;
        self.selector.to_writer(&mut *w)?;
        self.update.to_writer(w)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Delete {
    pub full_collection_name: String,
    pub flags: DeleteFlags,
    pub selector: Document,
}

impl Delete {
    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(0)?; // reserved
        write_cstring(w, &self.full_collection_name)?;
        w.write_i32::<LittleEndian>(self.flags.bits())?;
        self.selector.to_writer(w)?;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

impl KillCursors {
    fn write_body<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_i32::<LittleEndian>(0)?; // reserved
        w.write_i32::<LittleEndian>(self.cursor_ids.len() as i32)?;
        for id in &self.cursor_ids {
            w.write_i64::<LittleEndian>(*id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use byteorder::{LittleEndian, ReadBytesExt};
    use pretty_assertions::assert_eq;

    use super::*;

    fn frame(op: Op, request_id: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        op.append_to(&mut buf, request_id).unwrap();
        buf
    }

    #[test]
    fn query_frame_layout() {
        let op = Op::Query(Query {
            flags: QueryFlags::SLAVE_OK,
            full_collection_name: "db.coll".to_string(),
            num_to_skip: 3,
            num_to_return: -1,
            query: doc! { "a": 1 },
            return_field_selector: None,
        });
        let buf = frame(op, 7);

        let mut r = std::io::Cursor::new(&buf);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), buf.len() as i32);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 7); // request id
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 0); // response to
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 2004); // OP_QUERY
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 4); // slaveOk
        let mut name = Vec::new();
        loop {
            let b = r.read_u8().unwrap();
            if b == 0 {
                break;
            }
            name.push(b);
        }
        assert_eq!(name, b"db.coll");
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 3); // skip
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), -1); // numToReturn

        let doc = Document::from_reader(&mut r).unwrap();
        assert_eq!(doc, doc! { "a": 1 });
        assert_eq!(r.position() as usize, buf.len());
    }

    #[test]
    fn get_more_frame_layout() {
        let op = Op::GetMore(GetMore {
            full_collection_name: "db.coll".to_string(),
            num_to_return: 10,
            cursor_id: 0x0102030405060708,
        });
        let buf = frame(op, 1);

        let mut r = std::io::Cursor::new(&buf[Header::LENGTH..]);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 0);
        let mut skip = [0u8; 8]; // "db.coll\0"
        std::io::Read::read_exact(&mut r, &mut skip).unwrap();
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 10);
        assert_eq!(r.read_i64::<LittleEndian>().unwrap(), 0x0102030405060708);
    }

    #[test]
    fn insert_frame_carries_all_documents() {
        let op = Op::Insert(Insert {
            full_collection_name: "db.coll".to_string(),
            documents: vec![doc! { "a": 1 }, doc! { "b": 2 }],
        });
        let buf = frame(op, 1);

        let mut r = std::io::Cursor::new(&buf[Header::LENGTH..]);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 0);
        let mut skip = [0u8; 8];
        std::io::Read::read_exact(&mut r, &mut skip).unwrap();
        assert_eq!(Document::from_reader(&mut r).unwrap(), doc! { "a": 1 });
        assert_eq!(Document::from_reader(&mut r).unwrap(), doc! { "b": 2 });
    }

    #[test]
    fn kill_cursors_frame_layout() {
        let op = Op::KillCursors(KillCursors {
            cursor_ids: vec![5, 9],
        });
        let buf = frame(op, 1);

        let mut r = std::io::Cursor::new(&buf[Header::LENGTH..]);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 0);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap(), 2);
        assert_eq!(r.read_i64::<LittleEndian>().unwrap(), 5);
        assert_eq!(r.read_i64::<LittleEndian>().unwrap(), 9);
    }

    #[test]
    fn length_is_patched_per_op() {
        let mut buf = Vec::new();
        Op::KillCursors(KillCursors { cursor_ids: vec![1] })
            .append_to(&mut buf, 1)
            .unwrap();
        let first_len = buf.len();
        Op::Delete(Delete {
            full_collection_name: "db.c".to_string(),
            flags: DeleteFlags::SINGLE_REMOVE,
            selector: doc! {},
        })
        .append_to(&mut buf, 2)
        .unwrap();

        let mut r = std::io::Cursor::new(&buf);
        assert_eq!(r.read_i32::<LittleEndian>().unwrap() as usize, first_len);
        let mut r = std::io::Cursor::new(&buf[first_len..]);
        assert_eq!(
            r.read_i32::<LittleEndian>().unwrap() as usize,
            buf.len() - first_len
        );
    }
}
