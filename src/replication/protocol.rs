// ABOUTME: Decoder for the pgoutput logical replication wire format (protocol v1)
// ABOUTME: Turns raw XLogData payloads into typed messages without interpreting them

use super::lsn::Lsn;
use crate::error::{Error, Result};
use bytes::{Buf, Bytes};
use chrono::{DateTime, Utc};

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01)
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Bounds-checked big-endian reader over one message payload
pub struct BufferReader {
    data: Bytes,
}

impl BufferReader {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn ensure(&self, count: usize) -> Result<()> {
        if self.data.remaining() < count {
            return Err(Error::protocol(format!(
                "Not enough bytes remaining. Need {}, have {}",
                count,
                self.data.remaining()
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure(4)?;
        Ok(self.data.get_u32())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4)?;
        Ok(self.data.get_i32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure(8)?;
        Ok(self.data.get_u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8)?;
        Ok(self.data.get_i64())
    }

    pub fn read_lsn(&mut self) -> Result<Lsn> {
        self.read_u64().map(Lsn)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Bytes> {
        self.ensure(count)?;
        Ok(self.data.copy_to_bytes(count))
    }

    /// Null-terminated UTF-8 string
    pub fn read_cstring(&mut self) -> Result<String> {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::protocol("Unterminated string in buffer"))?;
        let raw = self.data.copy_to_bytes(end);
        self.data.advance(1);
        String::from_utf8(raw.to_vec())
            .map_err(|e| Error::protocol(format!("Invalid UTF-8 in string: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// Part of the replica identity key
    pub is_key: bool,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnDescriptor>,
}

impl RelationBody {
    pub fn key_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.is_key)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleValue {
    Null,
    /// TOASTed value the server did not resend because it did not change
    UnchangedToast,
    Text(Bytes),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleData(pub Vec<TupleValue>);

/// Which old tuple form an update or delete carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OldTupleKind {
    /// `K`: key columns only
    Key,
    /// `O`: the full old row (replica identity full)
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgOutputMessage {
    Begin {
        final_lsn: Lsn,
        commit_time: DateTime<Utc>,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: Lsn,
        end_lsn: Lsn,
        commit_time: DateTime<Utc>,
    },
    Origin {
        commit_lsn: Lsn,
        name: String,
    },
    Relation(RelationBody),
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        relation_id: u32,
        new: TupleData,
    },
    Update {
        relation_id: u32,
        old: Option<(OldTupleKind, TupleData)>,
        new: TupleData,
    },
    Delete {
        relation_id: u32,
        old_kind: OldTupleKind,
        old: TupleData,
    },
    Truncate {
        options: u8,
        relation_ids: Vec<u32>,
    },
    Message {
        transactional: bool,
        lsn: Lsn,
        prefix: String,
        content: Bytes,
    },
}

impl PgOutputMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            PgOutputMessage::Begin { .. } => "begin",
            PgOutputMessage::Commit { .. } => "commit",
            PgOutputMessage::Origin { .. } => "origin",
            PgOutputMessage::Relation(_) => "relation",
            PgOutputMessage::Type { .. } => "type",
            PgOutputMessage::Insert { .. } => "insert",
            PgOutputMessage::Update { .. } => "update",
            PgOutputMessage::Delete { .. } => "delete",
            PgOutputMessage::Truncate { .. } => "truncate",
            PgOutputMessage::Message { .. } => "message",
        }
    }

    /// Decode one pgoutput payload
    pub fn parse(data: Bytes) -> Result<Self> {
        let mut reader = BufferReader::new(data);
        let tag = reader.read_u8()?;
        match tag {
            b'B' => Ok(PgOutputMessage::Begin {
                final_lsn: reader.read_lsn()?,
                commit_time: pg_timestamp(reader.read_i64()?)?,
                xid: reader.read_u32()?,
            }),
            b'C' => Ok(PgOutputMessage::Commit {
                flags: reader.read_u8()?,
                commit_lsn: reader.read_lsn()?,
                end_lsn: reader.read_lsn()?,
                commit_time: pg_timestamp(reader.read_i64()?)?,
            }),
            b'O' => Ok(PgOutputMessage::Origin {
                commit_lsn: reader.read_lsn()?,
                name: reader.read_cstring()?,
            }),
            b'R' => parse_relation(&mut reader).map(PgOutputMessage::Relation),
            b'Y' => Ok(PgOutputMessage::Type {
                id: reader.read_u32()?,
                namespace: reader.read_cstring()?,
                name: reader.read_cstring()?,
            }),
            b'I' => {
                let relation_id = reader.read_u32()?;
                expect_tag(&mut reader, b'N', "INSERT")?;
                Ok(PgOutputMessage::Insert {
                    relation_id,
                    new: parse_tuple(&mut reader)?,
                })
            }
            b'U' => {
                let relation_id = reader.read_u32()?;
                let mut marker = reader.read_u8()?;
                let mut old = None;
                if marker == b'K' || marker == b'O' {
                    let kind = old_tuple_kind(marker);
                    old = Some((kind, parse_tuple(&mut reader)?));
                    marker = reader.read_u8()?;
                }
                if marker != b'N' {
                    return Err(Error::protocol(format!(
                        "Unexpected new tuple marker in UPDATE: {:?} (expected 'N')",
                        marker as char
                    )));
                }
                Ok(PgOutputMessage::Update {
                    relation_id,
                    old,
                    new: parse_tuple(&mut reader)?,
                })
            }
            b'D' => {
                let relation_id = reader.read_u32()?;
                let marker = reader.read_u8()?;
                if marker != b'K' && marker != b'O' {
                    return Err(Error::protocol(format!(
                        "Unexpected tuple marker in DELETE: {:?} (expected 'K' or 'O')",
                        marker as char
                    )));
                }
                Ok(PgOutputMessage::Delete {
                    relation_id,
                    old_kind: old_tuple_kind(marker),
                    old: parse_tuple(&mut reader)?,
                })
            }
            b'T' => {
                let count = reader.read_u32()?;
                let options = reader.read_u8()?;
                let relation_ids = (0..count)
                    .map(|_| reader.read_u32())
                    .collect::<Result<Vec<_>>>()?;
                Ok(PgOutputMessage::Truncate {
                    options,
                    relation_ids,
                })
            }
            b'M' => {
                let transactional = reader.read_u8()? == 1;
                let lsn = reader.read_lsn()?;
                let prefix = reader.read_cstring()?;
                let len = reader.read_u32()? as usize;
                Ok(PgOutputMessage::Message {
                    transactional,
                    lsn,
                    prefix,
                    content: reader.read_bytes(len)?,
                })
            }
            other => Err(Error::protocol(format!(
                "Unknown pgoutput message type {:?}",
                other as char
            ))),
        }
    }
}

fn expect_tag(reader: &mut BufferReader, expected: u8, message: &str) -> Result<()> {
    let tag = reader.read_u8()?;
    if tag != expected {
        return Err(Error::protocol(format!(
            "Unexpected tuple marker in {}: {:?} (expected {:?})",
            message, tag as char, expected as char
        )));
    }
    Ok(())
}

fn old_tuple_kind(marker: u8) -> OldTupleKind {
    if marker == b'K' {
        OldTupleKind::Key
    } else {
        OldTupleKind::Full
    }
}

fn parse_relation(reader: &mut BufferReader) -> Result<RelationBody> {
    let id = reader.read_u32()?;
    let namespace = reader.read_cstring()?;
    let name = reader.read_cstring()?;
    let replica_identity = reader.read_u8()?;
    let column_count = reader.read_u16()?;

    let mut columns = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let flags = reader.read_u8()?;
        columns.push(ColumnDescriptor {
            is_key: flags & 1 == 1,
            name: reader.read_cstring()?,
            type_oid: reader.read_u32()?,
            type_modifier: reader.read_i32()?,
        });
    }

    Ok(RelationBody {
        id,
        // pgoutput sends an empty namespace for pg_catalog
        namespace: if namespace.is_empty() {
            "pg_catalog".to_string()
        } else {
            namespace
        },
        name,
        replica_identity,
        columns,
    })
}

fn parse_tuple(reader: &mut BufferReader) -> Result<TupleData> {
    let count = reader.read_u16()?;
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let kind = reader.read_u8()?;
        let value = match kind {
            b'n' => TupleValue::Null,
            b'u' => TupleValue::UnchangedToast,
            b't' | b'b' => {
                let len = reader.read_u32()? as usize;
                let bytes = reader.read_bytes(len)?;
                if kind == b't' {
                    TupleValue::Text(bytes)
                } else {
                    TupleValue::Binary(bytes)
                }
            }
            other => {
                return Err(Error::protocol(format!(
                    "Unknown tuple value kind {:?}",
                    other as char
                )))
            }
        };
        values.push(value);
    }
    Ok(TupleData(values))
}

fn pg_timestamp(micros: i64) -> Result<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::protocol(format!("Timestamp out of range: {}", micros)))
}

/// Builders for pgoutput payloads, shared by decoder and listener tests
#[cfg(test)]
pub(crate) mod test_messages {
    use super::Lsn;
    use bytes::{BufMut, Bytes, BytesMut};

    fn cstring(buf: &mut BytesMut, s: &str) {
        buf.put_slice(s.as_bytes());
        buf.put_u8(0);
    }

    pub fn begin(final_lsn: Lsn, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(final_lsn.0);
        buf.put_i64(0);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit(commit_lsn: Lsn, end_lsn: Lsn) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(commit_lsn.0);
        buf.put_u64(end_lsn.0);
        buf.put_i64(0);
        buf.freeze()
    }

    /// Columns are `(name, type_oid, is_key)`
    pub fn relation(id: u32, namespace: &str, name: &str, columns: &[(&str, u32, bool)]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(id);
        cstring(&mut buf, namespace);
        cstring(&mut buf, name);
        buf.put_u8(b'd');
        buf.put_u16(columns.len() as u16);
        for (column, oid, is_key) in columns {
            buf.put_u8(u8::from(*is_key));
            cstring(&mut buf, column);
            buf.put_u32(*oid);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    /// `None` encodes SQL NULL, `Some("\u{0}")` encodes unchanged TOAST
    pub fn tuple(buf: &mut BytesMut, values: &[Option<&str>]) {
        buf.put_u16(values.len() as u16);
        for value in values {
            match value {
                None => buf.put_u8(b'n'),
                Some("\u{0}") => buf.put_u8(b'u'),
                Some(text) => {
                    buf.put_u8(b't');
                    buf.put_u32(text.len() as u32);
                    buf.put_slice(text.as_bytes());
                }
            }
        }
    }

    pub fn insert(relation_id: u32, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(relation_id);
        buf.put_u8(b'N');
        tuple(&mut buf, values);
        buf.freeze()
    }

    pub fn update(relation_id: u32, old_keys: Option<&[Option<&str>]>, values: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(relation_id);
        if let Some(old) = old_keys {
            buf.put_u8(b'K');
            tuple(&mut buf, old);
        }
        buf.put_u8(b'N');
        tuple(&mut buf, values);
        buf.freeze()
    }

    pub fn delete(relation_id: u32, old_keys: &[Option<&str>]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(relation_id);
        buf.put_u8(b'K');
        tuple(&mut buf, old_keys);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::test_messages::*;
    use super::*;

    #[test]
    fn test_parse_begin_and_commit() {
        match PgOutputMessage::parse(begin(Lsn(0x100), 42)).unwrap() {
            PgOutputMessage::Begin {
                final_lsn,
                xid,
                commit_time,
            } => {
                assert_eq!(final_lsn, Lsn(0x100));
                assert_eq!(xid, 42);
                assert_eq!(commit_time.timestamp(), PG_EPOCH_OFFSET_SECS);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        match PgOutputMessage::parse(commit(Lsn(0x100), Lsn(0x130))).unwrap() {
            PgOutputMessage::Commit {
                commit_lsn,
                end_lsn,
                ..
            } => {
                assert_eq!(commit_lsn, Lsn(0x100));
                assert_eq!(end_lsn, Lsn(0x130));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_relation_marks_key_columns() {
        let msg = relation(16384, "public", "orders", &[("id", 23, true), ("total", 1700, false)]);
        let PgOutputMessage::Relation(body) = PgOutputMessage::parse(msg).unwrap() else {
            panic!("expected relation");
        };
        assert_eq!(body.id, 16384);
        assert_eq!(body.namespace, "public");
        assert_eq!(body.name, "orders");
        assert_eq!(body.key_columns(), vec!["id".to_string()]);
        assert_eq!(body.columns[1].type_oid, 1700);
    }

    #[test]
    fn test_parse_update_with_old_keys() {
        let msg = update(1, Some(&[Some("1"), None]), &[Some("2"), Some("\u{0}")]);
        let PgOutputMessage::Update { old, new, .. } = PgOutputMessage::parse(msg).unwrap() else {
            panic!("expected update");
        };
        let (kind, old) = old.unwrap();
        assert_eq!(kind, OldTupleKind::Key);
        assert_eq!(old.0[0], TupleValue::Text(Bytes::from_static(b"1")));
        assert_eq!(new.0[1], TupleValue::UnchangedToast);
    }

    #[test]
    fn test_parse_truncated_payload_is_protocol_error() {
        let mut msg = insert(1, &[Some("hello")]).to_vec();
        msg.truncate(msg.len() - 2);
        let err = PgOutputMessage::parse(Bytes::from(msg)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_parse_unknown_tag() {
        let err = PgOutputMessage::parse(Bytes::from_static(b"Z")).unwrap_err();
        assert!(err.to_string().contains("Unknown pgoutput message type"));
    }
}
