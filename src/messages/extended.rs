// Extended query protocol: Parse/Bind/Describe/Execute/Close encoders and
// the parameter value they carry.
// See: <https://www.postgresql.org/docs/current/protocol-message-formats.html>

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::BytesMut;

use crate::buffer::WriteBuffer;

/// Text (0) or binary (1) on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    #[default]
    Text,
    Binary,
}

impl Format {
    #[inline(always)]
    pub fn code(self) -> i16 {
        match self {
            Format::Text => 0,
            Format::Binary => 1,
        }
    }
}

/// One bound parameter: a type OID plus the opaque encoded value. Encoding
/// and decoding of concrete types is the type-handler registry's job; this
/// core only frames bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub oid: i32,
    pub value: Option<BytesMut>,
    pub format: Format,
}

impl Param {
    pub fn text(oid: i32, value: impl AsRef<[u8]>) -> Param {
        Param {
            oid,
            value: Some(BytesMut::from(value.as_ref())),
            format: Format::Text,
        }
    }

    pub fn binary(oid: i32, value: impl AsRef<[u8]>) -> Param {
        Param {
            oid,
            value: Some(BytesMut::from(value.as_ref())),
            format: Format::Binary,
        }
    }

    pub fn null(oid: i32) -> Param {
        Param {
            oid,
            value: None,
            format: Format::Text,
        }
    }
}

/// The tuple (SQL text, ordered parameter OIDs) identifying a cacheable
/// prepared statement on one connector.
pub fn fingerprint(sql: &str, params: &[Param]) -> u64 {
    let mut hasher = DefaultHasher::new();
    sql.hash(&mut hasher);
    for param in params {
        param.oid.hash(&mut hasher);
    }
    hasher.finish()
}

/// Parse (F).
#[derive(Debug, Clone)]
pub struct Parse<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_oids: &'a [i32],
}

impl Parse<'_> {
    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.begin_message(b'P');
        buf.write_cstring(self.name);
        buf.write_cstring(self.query);
        buf.write_i16(self.param_oids.len() as i16);
        for oid in self.param_oids {
            buf.write_i32(*oid);
        }
        buf.end_message();
    }
}

/// Bind (F). Result columns are requested in one uniform format.
#[derive(Debug, Clone)]
pub struct Bind<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub params: &'a [Param],
    pub result_format: Format,
}

impl Bind<'_> {
    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.begin_message(b'B');
        buf.write_cstring(self.portal);
        buf.write_cstring(self.statement);
        buf.write_i16(self.params.len() as i16);
        for param in self.params {
            buf.write_i16(param.format.code());
        }
        buf.write_i16(self.params.len() as i16);
        for param in self.params {
            match &param.value {
                Some(value) => {
                    buf.write_i32(value.len() as i32);
                    buf.write_bytes(value);
                }
                None => buf.write_i32(-1),
            }
        }
        buf.write_i16(1);
        buf.write_i16(self.result_format.code());
        buf.end_message();
    }
}

/// Describe (F), for a statement (`S`) or a portal (`P`).
#[derive(Debug, Clone)]
pub struct Describe<'a> {
    pub target: u8,
    pub name: &'a str,
}

impl<'a> Describe<'a> {
    pub fn statement(name: &'a str) -> Describe<'a> {
        Describe { target: b'S', name }
    }

    pub fn portal(name: &'a str) -> Describe<'a> {
        Describe { target: b'P', name }
    }

    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.begin_message(b'D');
        buf.write_byte(self.target);
        buf.write_cstring(self.name);
        buf.end_message();
    }
}

/// Execute (F). `max_rows == 0` means no limit.
#[derive(Debug, Clone)]
pub struct Execute<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl Execute<'_> {
    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.begin_message(b'E');
        buf.write_cstring(self.portal);
        buf.write_i32(self.max_rows);
        buf.end_message();
    }
}

/// Close (F) for a named prepared statement, sent when the LRU evicts it.
#[derive(Debug, Clone)]
pub struct Close<'a> {
    pub name: &'a str,
}

impl Close<'_> {
    pub fn encode(&self, buf: &mut WriteBuffer) {
        buf.begin_message(b'C');
        buf.write_byte(b'S');
        buf.write_cstring(self.name);
        buf.end_message();
    }
}
