//! pgoutput message parsing
//!
//! Parses the binary logical replication messages produced by the `pgoutput`
//! plugin (protocol version 1, plus binary tuple columns from later
//! versions). All reads are bounds-checked: a truncated payload is a decode
//! error, never a panic.
//!
//! Markers outside the version 1 set decode to `None` so newer servers can
//! add message kinds without breaking the stream.

use crate::common::{CdcError, Result};
use chrono::DateTime;

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Decoded pgoutput message
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin(OriginBody),
    Relation(RelationBody),
    Type(TypeBody),
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginBody {
    pub final_lsn: u64,
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginBody {
    pub commit_lsn: u64,
    pub name: String,
}

/// Table definition sent before the first change of a relation
#[derive(Debug, Clone, PartialEq)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// 1 = part of the replica identity key
    pub flags: u8,
    pub name: String,
    pub type_id: u32,
    pub type_mode: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertBody {
    pub relation_id: u32,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateBody {
    pub relation_id: u32,
    /// Old key (`K`) or full old row (`O`), depending on replica identity
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Tuple,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateBody {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

/// Row image
#[derive(Debug, Clone, PartialEq)]
pub struct Tuple(pub Vec<TupleData>);

#[derive(Debug, Clone, PartialEq)]
pub enum TupleData {
    Null,
    /// Unchanged TOASTed value, not sent
    Toast,
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

impl PgOutputMessage {
    /// Decode one message. Unknown markers yield `Ok(None)`.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        let mut r = Reader::new(data);
        let marker = r.u8()?;
        let msg = match marker {
            b'B' => Self::Begin(BeginBody {
                final_lsn: r.u64()?,
                timestamp: r.i64()?,
                xid: r.u32()?,
            }),
            b'C' => Self::Commit(CommitBody {
                flags: r.u8()?,
                commit_lsn: r.u64()?,
                end_lsn: r.u64()?,
                timestamp: r.i64()?,
            }),
            b'O' => Self::Origin(OriginBody {
                commit_lsn: r.u64()?,
                name: r.cstr()?,
            }),
            b'R' => Self::Relation(decode_relation(&mut r)?),
            b'Y' => Self::Type(TypeBody {
                id: r.u32()?,
                namespace: r.cstr()?,
                name: r.cstr()?,
            }),
            b'I' => {
                let relation_id = r.u32()?;
                r.expect_marker(b'N')?;
                Self::Insert(InsertBody {
                    relation_id,
                    new_tuple: decode_tuple(&mut r)?,
                })
            }
            b'U' => Self::Update(decode_update(&mut r)?),
            b'D' => {
                let relation_id = r.u32()?;
                match r.u8()? {
                    b'K' | b'O' => Self::Delete(DeleteBody {
                        relation_id,
                        old_tuple: decode_tuple(&mut r)?,
                    }),
                    t => {
                        return Err(CdcError::decode(format!(
                            "unexpected tuple marker {:#04x} in delete",
                            t
                        )))
                    }
                }
            }
            b'T' => {
                let count = r.u32()?;
                let options = r.u8()?;
                let relation_ids = (0..count).map(|_| r.u32()).collect::<Result<Vec<_>>>()?;
                Self::Truncate(TruncateBody {
                    options,
                    relation_ids,
                })
            }
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

fn decode_relation(r: &mut Reader<'_>) -> Result<RelationBody> {
    let id = r.u32()?;
    let namespace = r.cstr()?;
    let name = r.cstr()?;
    let replica_identity = r.u8()?;
    let count = r.u16()?;
    let mut columns = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        columns.push(Column {
            flags: r.u8()?,
            name: r.cstr()?,
            type_id: r.u32()?,
            type_mode: r.i32()?,
        });
    }
    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn decode_update(r: &mut Reader<'_>) -> Result<UpdateBody> {
    let relation_id = r.u32()?;
    let (old_tuple, new_tuple) = match r.u8()? {
        b'K' | b'O' => {
            let old = decode_tuple(r)?;
            r.expect_marker(b'N')?;
            (Some(old), decode_tuple(r)?)
        }
        b'N' => (None, decode_tuple(r)?),
        t => {
            return Err(CdcError::decode(format!(
                "unexpected tuple marker {:#04x} in update",
                t
            )))
        }
    };
    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn decode_tuple(r: &mut Reader<'_>) -> Result<Tuple> {
    let count = r.u16()?;
    let mut columns = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let data = match r.u8()? {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                let len = r.u32()?;
                TupleData::Text(r.bytes(len as usize)?.to_vec())
            }
            b'b' => {
                let len = r.u32()?;
                TupleData::Binary(r.bytes(len as usize)?.to_vec())
            }
            t => {
                return Err(CdcError::decode(format!(
                    "unexpected column kind {:#04x}",
                    t
                )))
            }
        };
        columns.push(data);
    }
    Ok(Tuple(columns))
}

/// Render a tuple as a JSON object keyed by the relation's column names.
pub fn tuple_to_json(tuple: &Tuple, relation: &RelationBody) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (i, col_data) in tuple.0.iter().enumerate() {
        let Some(col_def) = relation.columns.get(i) else {
            continue;
        };
        let value = match col_data {
            TupleData::Null => serde_json::Value::Null,
            TupleData::Toast => serde_json::Value::String("<toast>".to_string()),
            TupleData::Text(bytes) => {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            TupleData::Binary(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
        };
        map.insert(col_def.name.clone(), value);
    }
    serde_json::Value::Object(map)
}

/// Render a tuple positionally when the relation is unknown.
pub fn tuple_to_json_positional(tuple: &Tuple) -> serde_json::Value {
    let relation = RelationBody {
        id: 0,
        namespace: String::new(),
        name: String::new(),
        replica_identity: 0,
        columns: (0..tuple.0.len())
            .map(|i| Column {
                flags: 0,
                name: format!("col{}", i + 1),
                type_id: 0,
                type_mode: -1,
            })
            .collect(),
    };
    tuple_to_json(tuple, &relation)
}

/// PostgreSQL timestamp (microseconds since 2000-01-01) to Unix epoch millis.
pub fn pg_timestamp_to_epoch_millis(ts: i64) -> Option<i64> {
    DateTime::from_timestamp_micros(ts.checked_add(PG_EPOCH_OFFSET_MICROS)?)
        .map(|dt| dt.timestamp_millis())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                CdcError::decode(format!(
                    "truncated message: need {} bytes at offset {}, have {}",
                    n,
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    fn cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CdcError::decode("unterminated string"))?;
        let s = std::str::from_utf8(&rest[..nul])
            .map_err(|e| CdcError::decode(format!("invalid UTF-8 in string: {}", e)))?
            .to_string();
        self.pos += nul + 1;
        Ok(s)
    }

    fn expect_marker(&mut self, expected: u8) -> Result<()> {
        match self.u8()? {
            m if m == expected => Ok(()),
            m => Err(CdcError::decode(format!(
                "expected marker '{}', got {:#04x}",
                expected as char, m
            ))),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_messages::*;
    use super::*;

    #[test]
    fn test_decode_begin() {
        let msg = PgOutputMessage::decode(&begin(0x0000_0001_0000_0000, 42))
            .unwrap()
            .unwrap();
        match msg {
            PgOutputMessage::Begin(body) => {
                assert_eq!(body.xid, 42);
                assert_eq!(body.final_lsn, 0x0000_0001_0000_0000);
            }
            other => panic!("Expected Begin message, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_relation_and_insert() {
        let rel = match PgOutputMessage::decode(&relation(16384, "public", "users", &["id", "name"]))
            .unwrap()
            .unwrap()
        {
            PgOutputMessage::Relation(r) => r,
            other => panic!("Expected Relation, got {:?}", other),
        };
        assert_eq!(rel.columns.len(), 2);
        assert_eq!(rel.columns[0].flags, 1);

        let ins = match PgOutputMessage::decode(&insert(16384, &[Some("1"), None]))
            .unwrap()
            .unwrap()
        {
            PgOutputMessage::Insert(i) => i,
            other => panic!("Expected Insert, got {:?}", other),
        };
        let json = tuple_to_json(&ins.new_tuple, &rel);
        assert_eq!(json, serde_json::json!({"id": "1", "name": null}));
    }

    #[test]
    fn test_decode_update_with_old_tuple() {
        let data = update(7, Some(&[Some("1"), Some("old")]), &[Some("1"), Some("new")]);
        match PgOutputMessage::decode(&data).unwrap().unwrap() {
            PgOutputMessage::Update(u) => {
                assert!(u.old_tuple.is_some());
                assert_eq!(u.new_tuple.0[1], TupleData::Text(b"new".to_vec()));
            }
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_payloads_are_errors() {
        let full = insert(16384, &[Some("hello")]);
        for len in 1..full.len() {
            let result = PgOutputMessage::decode(&full[..len]);
            assert!(
                matches!(result, Err(CdcError::Decode(_))),
                "prefix of length {} should fail",
                len
            );
        }
        assert!(PgOutputMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_unknown_marker_is_skipped() {
        assert_eq!(PgOutputMessage::decode(b"Mxyz").unwrap(), None);
        // streaming markers are outside protocol version 1
        assert_eq!(PgOutputMessage::decode(b"S\0\0\0\x01\x01").unwrap(), None);
    }

    #[test]
    fn test_truncate() {
        match PgOutputMessage::decode(&truncate(&[1, 2])).unwrap().unwrap() {
            PgOutputMessage::Truncate(t) => assert_eq!(t.relation_ids, vec![1, 2]),
            other => panic!("Expected Truncate, got {:?}", other),
        }
    }

    #[test]
    fn test_pg_timestamp_conversion() {
        assert_eq!(pg_timestamp_to_epoch_millis(0), Some(946_684_800_000));
        assert_eq!(pg_timestamp_to_epoch_millis(1_000), Some(946_684_800_001));
    }
}
