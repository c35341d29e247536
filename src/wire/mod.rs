mod flags;
mod header;
mod op;
mod reply;

pub(crate) use self::{
    flags::{DeleteFlags, QueryFlags, ResponseFlags, UpdateFlags},
    header::{Header, OpCode},
    op::{Delete, GetMore, Insert, KillCursors, Op, Query, Update},
    reply::Reply,
};
