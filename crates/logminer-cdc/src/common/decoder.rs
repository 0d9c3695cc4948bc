//! Change event decoding
//!
//! [`ChangeEventDecoder`] turns raw records pulled from a mining session into
//! [`ChangeEvent`]s. It is fed one record at a time, in cursor order, and
//! keeps the state that spans records:
//!
//! - log-mining rows with the continuation flag set are buffered and their
//!   redo text concatenated until the closing row arrives
//! - pgoutput relation metadata is cached so row messages can be named
//! - the transaction id announced by a pgoutput `Begin`

use crate::common::pgoutput::{
    pg_timestamp_to_epoch_millis, tuple_to_json, tuple_to_json_positional, PgOutputMessage,
    RelationBody, Tuple,
};
use crate::common::{CdcError, ChangeEvent, OperationKind, PositionToken, Result};
use bytes::Bytes;
use std::collections::HashMap;
use tracing::{trace, warn};

/// LogMiner operation codes.
pub mod op_codes {
    pub const INSERT: i32 = 1;
    pub const DELETE: i32 = 2;
    pub const UPDATE: i32 = 3;
    pub const DDL: i32 = 5;
    pub const START: i32 = 6;
    pub const COMMIT: i32 = 7;
    pub const ROLLBACK: i32 = 36;
}

/// One row of a log-mining result set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MiningRow {
    pub position: PositionToken,
    pub operation_code: i32,
    pub transaction_id: Option<String>,
    pub object_id: Option<i64>,
    pub schema: Option<String>,
    pub object: Option<String>,
    pub sql_redo: Option<String>,
    /// Payload continues in the next row
    pub continuation: bool,
    pub rs_id: Option<String>,
    pub ssn: Option<i64>,
    pub row_id: Option<String>,
    /// Epoch milliseconds
    pub timestamp: Option<i64>,
}

impl MiningRow {
    pub fn new(position: PositionToken, operation_code: i32, sql_redo: impl Into<String>) -> Self {
        Self {
            position,
            operation_code,
            sql_redo: Some(sql_redo.into()),
            ..Default::default()
        }
    }

    pub fn continued(mut self) -> Self {
        self.continuation = true;
        self
    }

    pub fn with_transaction(mut self, xid: impl Into<String>) -> Self {
        self.transaction_id = Some(xid.into());
        self
    }

    pub fn with_object(mut self, id: i64, schema: impl Into<String>, object: impl Into<String>) -> Self {
        self.object_id = Some(id);
        self.schema = Some(schema.into());
        self.object = Some(object.into());
        self
    }

    /// Redo record address and statement number within it.
    pub fn with_redo_record(mut self, rs_id: impl Into<String>, ssn: i64) -> Self {
        self.rs_id = Some(rs_id.into());
        self.ssn = Some(ssn);
        self
    }

    pub fn with_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.row_id = Some(row_id.into());
        self
    }

    /// Whether `next` carries the rest of a payload this row started: the
    /// same transaction, and the same redo record and statement when both
    /// rows report them.
    fn is_continued_by(&self, next: &MiningRow) -> bool {
        if next.transaction_id != self.transaction_id {
            return false;
        }
        match (&self.rs_id, self.ssn, &next.rs_id, next.ssn) {
            (Some(rs_id), Some(ssn), Some(next_rs_id), Some(next_ssn)) => {
                rs_id == next_rs_id && ssn == next_ssn
            }
            _ => true,
        }
    }
}

/// One message of a logical replication stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationPayload {
    pub position: PositionToken,
    pub transaction_id: Option<String>,
    pub data: Bytes,
}

impl ReplicationPayload {
    pub fn new(position: PositionToken, data: impl Into<Bytes>) -> Self {
        Self {
            position,
            transaction_id: None,
            data: data.into(),
        }
    }
}

/// Raw record pulled from a mining session.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Mining(MiningRow),
    Replication(ReplicationPayload),
}

impl RawRecord {
    pub fn position(&self) -> PositionToken {
        match self {
            Self::Mining(row) => row.position,
            Self::Replication(p) => p.position,
        }
    }
}

/// Result of one pull against an open session.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    /// No further rows remain in the window
    pub exhausted: bool,
}

impl RawBatch {
    pub fn last(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            exhausted: true,
        }
    }

    pub fn partial(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            exhausted: false,
        }
    }
}

/// Counters kept by the decoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    /// Records that decoded to nothing (unknown kinds, metadata messages)
    pub skipped: u64,
    /// Rows joined into a previous fragment
    pub continuation_rows: u64,
    /// Incomplete payloads dropped at a window reset
    pub fragments_dropped: u64,
}

#[derive(Debug)]
struct PendingRedo {
    head: MiningRow,
    sql: String,
}

/// Stateful decoder for one mining stream.
pub struct ChangeEventDecoder {
    source: String,
    pending: Option<PendingRedo>,
    relations: HashMap<u32, RelationBody>,
    current_xid: Option<String>,
    stats: DecoderStats,
}

impl ChangeEventDecoder {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            pending: None,
            relations: HashMap::new(),
            current_xid: None,
            stats: DecoderStats::default(),
        }
    }

    /// Decode one record. `Ok(None)` means the record produced no event (a
    /// buffered fragment, metadata, or an unrecognized kind).
    pub fn decode(&mut self, raw: RawRecord) -> Result<Option<ChangeEvent>> {
        let decoded = match raw {
            RawRecord::Mining(row) => self.decode_mining_row(row)?,
            RawRecord::Replication(payload) => self.decode_replication(payload)?,
        };
        if decoded.is_none() && self.pending.is_none() {
            self.stats.skipped += 1;
        }
        Ok(decoded)
    }

    /// Whether a multi-row payload is partially assembled.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop per-window state. Relation metadata survives: it describes the
    /// catalog, not the window.
    pub fn reset_window(&mut self) {
        if let Some(pending) = self.pending.take() {
            warn!(
                "Dropping incomplete payload at {} ({} bytes buffered)",
                pending.head.position,
                pending.sql.len()
            );
            self.stats.fragments_dropped += 1;
        }
        self.current_xid = None;
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn relation(&self, id: u32) -> Option<&RelationBody> {
        self.relations.get(&id)
    }

    fn decode_mining_row(&mut self, row: MiningRow) -> Result<Option<ChangeEvent>> {
        let fragment = row.sql_redo.clone().unwrap_or_default();

        let (head, sql) = match self.pending.take() {
            Some(mut pending) => {
                if !pending.head.is_continued_by(&row) {
                    return Err(CdcError::decode(format!(
                        "continuation of payload at {} interrupted by transaction {:?} (rs_id {:?}, ssn {:?})",
                        pending.head.position, row.transaction_id, row.rs_id, row.ssn
                    )));
                }
                self.stats.continuation_rows += 1;
                pending.sql.push_str(&fragment);
                if row.continuation {
                    self.pending = Some(pending);
                    return Ok(None);
                }
                (pending.head, pending.sql)
            }
            None if row.continuation => {
                self.pending = Some(PendingRedo {
                    head: row,
                    sql: fragment,
                });
                return Ok(None);
            }
            None => (row, fragment),
        };

        let Some(op) = classify_mining_row(head.operation_code, &sql) else {
            trace!(
                "Skipping mining row with operation code {} at {}",
                head.operation_code,
                head.position
            );
            return Ok(None);
        };

        let mut event = ChangeEvent::new(op, head.position, self.source.clone());
        event.transaction_id = head.transaction_id;
        event.schema = head.schema;
        event.object = head.object;
        event.object_id = head.object_id;
        event.row_id = head.row_id;
        event.timestamp = head.timestamp;
        if !op.is_boundary() {
            event = event.with_redo(sql);
        }
        Ok(Some(event))
    }

    fn decode_replication(&mut self, payload: ReplicationPayload) -> Result<Option<ChangeEvent>> {
        let Some(message) = PgOutputMessage::decode(&payload.data)? else {
            trace!(
                "Skipping unrecognized replication message at {}",
                payload.position
            );
            return Ok(None);
        };

        let xid = payload.transaction_id.or_else(|| self.current_xid.clone());
        let base = |op: OperationKind, source: &str| {
            let mut event = ChangeEvent::new(op, payload.position, source);
            event.transaction_id = xid.clone();
            event
        };

        let event = match message {
            PgOutputMessage::Begin(begin) => {
                self.current_xid = Some(begin.xid.to_string());
                return Ok(None);
            }
            PgOutputMessage::Relation(relation) => {
                self.relations.insert(relation.id, relation);
                return Ok(None);
            }
            PgOutputMessage::Origin(_) | PgOutputMessage::Type(_) => return Ok(None),
            PgOutputMessage::Commit(commit) => {
                self.current_xid = None;
                let mut event = base(OperationKind::Commit, &self.source);
                event.timestamp = pg_timestamp_to_epoch_millis(commit.timestamp);
                event
            }
            PgOutputMessage::Insert(insert) => self.row_event(
                base(OperationKind::Insert, &self.source),
                insert.relation_id,
                None,
                Some(&insert.new_tuple),
            ),
            PgOutputMessage::Update(update) => self.row_event(
                base(OperationKind::Update, &self.source),
                update.relation_id,
                update.old_tuple.as_ref(),
                Some(&update.new_tuple),
            ),
            PgOutputMessage::Delete(delete) => self.row_event(
                base(OperationKind::Delete, &self.source),
                delete.relation_id,
                Some(&delete.old_tuple),
                None,
            ),
            PgOutputMessage::Truncate(truncate) => {
                let names: Vec<String> = truncate
                    .relation_ids
                    .iter()
                    .map(|id| match self.relations.get(id) {
                        Some(rel) => format!("{}.{}", rel.namespace, rel.name),
                        None => format!("relation {}", id),
                    })
                    .collect();
                let mut event = base(OperationKind::Ddl, &self.source)
                    .with_redo(format!("TRUNCATE {}", names.join(", ")));
                if let [single] = truncate.relation_ids.as_slice() {
                    event.object_id = Some(i64::from(*single));
                    if let Some(rel) = self.relations.get(single) {
                        event.schema = Some(rel.namespace.clone());
                        event.object = Some(rel.name.clone());
                    }
                }
                event
            }
        };
        Ok(Some(event))
    }

    fn row_event(
        &self,
        mut event: ChangeEvent,
        relation_id: u32,
        before: Option<&Tuple>,
        after: Option<&Tuple>,
    ) -> ChangeEvent {
        event.object_id = Some(i64::from(relation_id));
        let relation = self.relations.get(&relation_id);
        let render = |t: &Tuple| match relation {
            Some(rel) => tuple_to_json(t, rel),
            None => tuple_to_json_positional(t),
        };
        if let Some(rel) = relation {
            event.schema = Some(rel.namespace.clone());
            event.object = Some(rel.name.clone());
        }
        event.with_tuple(before.map(render), after.map(render))
    }
}

/// Classify a mining row. Redo text `commit`/`rollback` marks a boundary
/// whatever the operation code says.
fn classify_mining_row(operation_code: i32, sql: &str) -> Option<OperationKind> {
    let trimmed = sql.trim().trim_end_matches(';');
    if trimmed.eq_ignore_ascii_case("commit") {
        return Some(OperationKind::Commit);
    }
    if trimmed.eq_ignore_ascii_case("rollback") {
        return Some(OperationKind::Rollback);
    }
    match operation_code {
        op_codes::INSERT => Some(OperationKind::Insert),
        op_codes::DELETE => Some(OperationKind::Delete),
        op_codes::UPDATE => Some(OperationKind::Update),
        op_codes::DDL => Some(OperationKind::Ddl),
        op_codes::COMMIT => Some(OperationKind::Commit),
        op_codes::ROLLBACK => Some(OperationKind::Rollback),
        _ => None,
    }
}
