//! [`LogMiningBackend`] over a PostgreSQL logical replication slot.

use super::statements;
use crate::common::pgoutput::PgOutputMessage;
use crate::common::{
    CdcError, CompiledFilter, Dialect, FilterMode, LogMiningBackend, LogSegment, MiningPredicate,
    MiningWindow, PositionToken, RawBatch, RawRecord, ReplicationPayload, Result, SqlConnection,
    SqlRow, SqlValue,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::OnceLock;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Default logical replication slot.
pub const DEFAULT_SLOT_NAME: &str = "cdc_slot";

const MIN_SEGMENT_SIZE: u64 = 1 << 20;
const MAX_SEGMENT_SIZE: u64 = 1 << 30;

/// PostgreSQL backend settings.
///
/// `Debug` redacts the password from the connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresMinerConfig {
    /// libpq key=value string or `postgresql://` URL
    pub connection_string: String,
    /// Logical replication slot using the `pgoutput` plugin
    pub slot_name: String,
    /// Publication whose tables the slot streams
    pub publication: String,
    /// Create the slot when it does not exist
    pub create_slot: bool,
}

impl std::fmt::Debug for PostgresMinerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresMinerConfig")
            .field(
                "connection_string",
                &redact_connection_string(&self.connection_string),
            )
            .field("slot_name", &self.slot_name)
            .field("publication", &self.publication)
            .field("create_slot", &self.create_slot)
            .finish()
    }
}

/// Redact the password from a connection string for logging.
pub(crate) fn redact_connection_string(conn_str: &str) -> String {
    if let Ok(mut url) = Url::parse(conn_str) {
        if url.password().is_some() {
            let _ = url.set_password(Some("[REDACTED]"));
            return url.to_string();
        }
        return conn_str.to_string();
    }

    conn_str
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("password") => {
                format!("{}=[REDACTED]", key)
            }
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl PostgresMinerConfig {
    pub fn builder() -> PostgresMinerConfigBuilder {
        PostgresMinerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_string.is_empty() {
            return Err(CdcError::config("Connection string is required"));
        }
        if self.slot_name.is_empty() {
            return Err(CdcError::config("Slot name is required"));
        }
        if !self
            .slot_name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        {
            return Err(CdcError::config(format!(
                "Slot name '{}' may only contain lower case letters, digits and underscores",
                self.slot_name
            )));
        }
        if self.publication.is_empty() {
            return Err(CdcError::config("Publication name is required"));
        }
        Ok(())
    }
}

/// Builder for [`PostgresMinerConfig`]
#[derive(Default)]
pub struct PostgresMinerConfigBuilder {
    connection_string: Option<String>,
    slot_name: Option<String>,
    publication: Option<String>,
    create_slot: Option<bool>,
}

impl PostgresMinerConfigBuilder {
    pub fn connection_string(mut self, s: impl Into<String>) -> Self {
        self.connection_string = Some(s.into());
        self
    }

    pub fn slot_name(mut self, s: impl Into<String>) -> Self {
        self.slot_name = Some(s.into());
        self
    }

    pub fn publication(mut self, s: impl Into<String>) -> Self {
        self.publication = Some(s.into());
        self
    }

    pub fn create_slot(mut self, create: bool) -> Self {
        self.create_slot = Some(create);
        self
    }

    pub fn build(self) -> Result<PostgresMinerConfig> {
        let config = PostgresMinerConfig {
            connection_string: self
                .connection_string
                .ok_or_else(|| CdcError::config("Connection string is required"))?,
            slot_name: self
                .slot_name
                .unwrap_or_else(|| DEFAULT_SLOT_NAME.to_string()),
            publication: self
                .publication
                .ok_or_else(|| CdcError::config("Publication name is required"))?,
            create_slot: self.create_slot.unwrap_or(true),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Split a WAL file name `TTTTTTTTXXXXXXXXYYYYYYYY` into timeline and
/// segment number.
pub fn parse_wal_file_name(name: &str, segment_size: u64) -> Result<(u32, u64)> {
    let malformed = || CdcError::malformed_position(format!("invalid WAL file name '{}'", name));
    if name.len() != 24 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(malformed());
    }
    let timeline = u32::from_str_radix(&name[0..8], 16).map_err(|_| malformed())?;
    let log = u64::from_str_radix(&name[8..16], 16).map_err(|_| malformed())?;
    let seg = u64::from_str_radix(&name[16..24], 16).map_err(|_| malformed())?;

    let per_log = 0x1_0000_0000 / segment_size;
    if seg >= per_log {
        return Err(malformed());
    }
    Ok((timeline, log * per_log + seg))
}

fn segment_from_name(
    name: &str,
    segment_size: u64,
    archived: bool,
    current: Option<&str>,
) -> Result<LogSegment> {
    let (timeline, segno) = parse_wal_file_name(name, segment_size)?;
    let first = PositionToken::new(segno.saturating_mul(segment_size));
    let next = PositionToken::new(segno.saturating_add(1).saturating_mul(segment_size));
    Ok(if archived {
        LogSegment::archived(name, timeline, segno, first, next)
    } else if current == Some(name) {
        LogSegment::online(name, timeline, segno, first, PositionToken::Max, true)
    } else {
        LogSegment::online(name, timeline, segno, first, next, false)
    })
}

fn lsn_param(position: &PositionToken) -> Result<SqlValue> {
    position
        .to_pg_lsn()
        .map(SqlValue::Text)
        .ok_or_else(|| CdcError::malformed_position(format!("{} is not a WAL location", position)))
}

/// Logical replication capability over the SQL slot functions.
#[derive(Debug)]
pub struct PostgresWalMiner {
    config: PostgresMinerConfig,
    segment_size: OnceLock<u64>,
}

impl PostgresWalMiner {
    pub fn new(config: PostgresMinerConfig) -> Self {
        Self {
            config,
            segment_size: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &PostgresMinerConfig {
        &self.config
    }

    async fn segment_size(&self, conn: &dyn SqlConnection) -> Result<u64> {
        if let Some(size) = self.segment_size.get() {
            return Ok(*size);
        }
        let row = conn
            .query_one(statements::WAL_SEGMENT_SIZE, &[])
            .await?
            .ok_or_else(|| CdcError::no_catalog_access("wal_segment_size is not visible"))?;
        let size = u64::try_from(row.i64("seg_size")?).unwrap_or(0);
        if !size.is_power_of_two() || !(MIN_SEGMENT_SIZE..=MAX_SEGMENT_SIZE).contains(&size) {
            return Err(CdcError::no_catalog_access(format!(
                "unsupported wal_segment_size {}",
                size
            )));
        }
        Ok(*self.segment_size.get_or_init(|| size))
    }

    /// `(active, confirmed position)` of the slot, `None` when missing.
    async fn slot_state(&self, conn: &dyn SqlConnection) -> Result<Option<(bool, PositionToken)>> {
        match conn
            .query_one(
                statements::SLOT_STATE,
                &[SqlValue::from(self.config.slot_name.as_str())],
            )
            .await?
        {
            Some(row) => Ok(Some((row.flag("active"), row.position("position")?))),
            None => Ok(None),
        }
    }
}

/// Group peeked rows by transaction and stamp every message with its
/// commit location, keeping transactions that commit inside `[lower, upper)`.
///
/// The commit location is the start of the commit record, taken from the
/// Commit message. The slot skips a transaction exactly when that location
/// lies below its confirmed position, so windows partition on it too.
///
/// Relation and type messages of skipped transactions are kept, stamped at
/// `lower`: pgoutput sends them once per session and later transactions
/// rely on them.
fn group_by_commit(
    rows: Vec<ReplicationPayload>,
    lower: PositionToken,
    upper: PositionToken,
) -> Vec<RawRecord> {
    let in_window = |p: &PositionToken| lower <= *p && *p < upper;
    let mut records = Vec::with_capacity(rows.len());
    let mut open: Vec<ReplicationPayload> = Vec::new();
    let mut in_txn = false;

    for row in rows {
        let tag = row.data.first().copied();
        match tag {
            Some(b'B') => {
                if !open.is_empty() {
                    warn!("Dropping {} messages of an unterminated transaction", open.len());
                    open.clear();
                }
                in_txn = true;
                open.push(row);
            }
            Some(b'C') if in_txn => {
                let commit = commit_location(&row);
                open.push(row);
                if in_window(&commit) {
                    records.extend(open.drain(..).map(|mut p| {
                        p.position = commit;
                        RawRecord::Replication(p)
                    }));
                } else {
                    trace!("Skipping transaction committed at {}", commit);
                    records.extend(open.drain(..).filter(is_catalog_message).map(|mut p| {
                        p.position = lower;
                        p.transaction_id = None;
                        RawRecord::Replication(p)
                    }));
                }
                in_txn = false;
            }
            _ if in_txn => open.push(row),
            _ => {
                if in_window(&row.position) {
                    records.push(RawRecord::Replication(row));
                }
            }
        }
    }
    if !open.is_empty() {
        warn!("Dropping {} messages of an unterminated transaction", open.len());
    }
    records
}

/// Start of the commit record; the peeked location when the message does
/// not decode.
fn commit_location(row: &ReplicationPayload) -> PositionToken {
    match PgOutputMessage::decode(&row.data) {
        Ok(Some(PgOutputMessage::Commit(commit))) => PositionToken::new(commit.commit_lsn),
        _ => row.position,
    }
}

/// Relation and type messages describe the catalog, not the transaction.
fn is_catalog_message(row: &ReplicationPayload) -> bool {
    matches!(row.data.first(), Some(b'R') | Some(b'Y'))
}

fn peeked_row(row: &SqlRow) -> Result<ReplicationPayload> {
    let data = row
        .get_by_name("data")
        .and_then(SqlValue::as_bytes)
        .ok_or_else(|| CdcError::decode("peeked change has no data column"))?;
    let mut payload = ReplicationPayload::new(row.position("position")?, Bytes::copy_from_slice(data));
    payload.transaction_id = row.opt_str("xid").map(str::to_string);
    Ok(payload)
}

#[async_trait]
impl LogMiningBackend for PostgresWalMiner {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn prepare(&self, conn: &dyn SqlConnection) -> Result<()> {
        let publication = SqlValue::from(self.config.publication.as_str());
        if conn
            .query_one(statements::PUBLICATION_EXISTS, &[publication])
            .await?
            .is_none()
        {
            return Err(CdcError::config(format!(
                "publication '{}' does not exist",
                self.config.publication
            )));
        }

        if self.slot_state(conn).await?.is_some() {
            return Ok(());
        }
        if !self.config.create_slot {
            return Err(CdcError::config(format!(
                "replication slot '{}' does not exist",
                self.config.slot_name
            )));
        }
        conn.query(
            statements::CREATE_SLOT,
            &[SqlValue::from(self.config.slot_name.as_str())],
        )
        .await?;
        info!("Created replication slot {}", self.config.slot_name);
        Ok(())
    }

    async fn current_thread(&self, conn: &dyn SqlConnection) -> Result<u32> {
        let row = conn
            .query_one(statements::TIMELINE, &[])
            .await?
            .ok_or_else(|| CdcError::no_catalog_access("pg_control_checkpoint returned no row"))?;
        let timeline = row.i64("timeline_id")?;
        u32::try_from(timeline)
            .map_err(|_| CdcError::decode(format!("timeline out of range: {}", timeline)))
    }

    async fn online_segments(&self, conn: &dyn SqlConnection) -> Result<Vec<LogSegment>> {
        let size = self.segment_size(conn).await?;
        let current_row = conn
            .query_one(statements::CURRENT_WAL, &[])
            .await?
            .ok_or_else(|| CdcError::no_catalog_access("current WAL file is not visible"))?;
        let current = current_row.str("file_name")?.to_string();

        let mut segments = Vec::new();
        for row in conn.query(statements::WAL_DIRECTORY, &[]).await? {
            let name = row.str("name")?;
            // Recycled files ahead of the insert position hold no data yet.
            if name > current.as_str() {
                continue;
            }
            segments.push(segment_from_name(name, size, false, Some(current.as_str()))?);
        }
        Ok(segments)
    }

    async fn archived_segments(
        &self,
        conn: &dyn SqlConnection,
        from: &PositionToken,
        retention_hours: u32,
    ) -> Result<Vec<LogSegment>> {
        let size = self.segment_size(conn).await?;
        let mut segments = Vec::new();
        for row in conn
            .query(
                statements::ARCHIVE_STATUS,
                &[SqlValue::Int64(i64::from(retention_hours))],
            )
            .await?
        {
            let status = row.str("name")?;
            let name = status.strip_suffix(".done").unwrap_or(status);
            let segment = segment_from_name(name, size, true, None)?;
            if segment.reaches(from) {
                segments.push(segment);
            }
        }
        Ok(segments)
    }

    async fn earliest_position(
        &self,
        conn: &dyn SqlConnection,
        _thread: u32,
    ) -> Result<PositionToken> {
        Ok(self
            .slot_state(conn)
            .await?
            .map(|(_, position)| position)
            .unwrap_or(PositionToken::Null))
    }

    async fn highest_position(&self, conn: &dyn SqlConnection) -> Result<PositionToken> {
        match conn.query_one(statements::CURRENT_WAL, &[]).await? {
            Some(row) => row.position("position"),
            None => Ok(PositionToken::Null),
        }
    }

    async fn resolve_object_ids(
        &self,
        conn: &dyn SqlConnection,
        filter: &CompiledFilter,
    ) -> Result<Vec<i64>> {
        let predicate = filter.resolution_predicate();
        let sql = statements::object_ids(
            filter.mode() == FilterMode::MaterializedViewLogs,
            &predicate.sql,
        );
        conn.query(&sql, &predicate.params)
            .await?
            .iter()
            .map(|row| row.i64("oid"))
            .collect()
    }

    async fn register_segment(
        &self,
        _conn: &dyn SqlConnection,
        segment: &LogSegment,
        new_set: bool,
    ) -> Result<()> {
        // The slot reads WAL itself; registration only validates ordering.
        trace!("WAL segment {} in range (new_set={})", segment.name, new_set);
        Ok(())
    }

    async fn open_session(&self, conn: &dyn SqlConnection, window: &MiningWindow) -> Result<()> {
        match self.slot_state(conn).await? {
            None => Err(CdcError::session_start(format!(
                "replication slot '{}' does not exist",
                self.config.slot_name
            ))),
            Some((true, _)) => Err(CdcError::session_start(format!(
                "replication slot '{}' is in use by another process",
                self.config.slot_name
            ))),
            Some((false, confirmed)) => {
                if !confirmed.is_null() && confirmed > window.lower {
                    debug!(
                        "Slot {} confirmed at {}, past window start {}",
                        self.config.slot_name, confirmed, window.lower
                    );
                }
                Ok(())
            }
        }
    }

    async fn pull_raw(
        &self,
        conn: &dyn SqlConnection,
        window: &MiningWindow,
        _predicate: &MiningPredicate,
    ) -> Result<RawBatch> {
        let limit = window.upper - PositionToken::new(1);
        let rows = conn
            .query(
                statements::PEEK_CHANGES,
                &[
                    SqlValue::from(self.config.slot_name.as_str()),
                    lsn_param(&limit)?,
                    SqlValue::from(self.config.publication.as_str()),
                ],
            )
            .await?;
        let payloads = rows.iter().map(peeked_row).collect::<Result<Vec<_>>>()?;
        let peeked = payloads.len();
        let records = group_by_commit(payloads, window.lower, window.upper);
        debug!(
            "Peeked {} messages from slot {}, {} inside [{}, {})",
            peeked,
            self.config.slot_name,
            records.len(),
            window.lower,
            window.upper
        );
        Ok(RawBatch::last(records))
    }

    async fn close_session(&self, _conn: &dyn SqlConnection) -> Result<()> {
        // Peeking holds no server-side session.
        Ok(())
    }

    async fn send_feedback(&self, conn: &dyn SqlConnection, position: &PositionToken) -> Result<()> {
        conn.query(
            statements::ADVANCE_SLOT,
            &[
                SqlValue::from(self.config.slot_name.as_str()),
                lsn_param(position)?,
            ],
        )
        .await?;
        debug!("Advanced slot {} to {}", self.config.slot_name, position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pgoutput::test_messages as msg;
    use crate::common::scripted::ScriptedConnection;
    use crate::common::{ChangeEventDecoder, OperationKind};

    const MB16: u64 = 16 * 1024 * 1024;

    fn config() -> PostgresMinerConfig {
        PostgresMinerConfig::builder()
            .connection_string("host=localhost user=cdc password=secret dbname=shop")
            .publication("shop_pub")
            .build()
            .unwrap()
    }

    fn name_row(name: &str) -> SqlRow {
        SqlRow::from_pairs([("name", SqlValue::from(name))])
    }

    fn peek_row(pos: u64, xid: &str, data: Vec<u8>) -> SqlRow {
        SqlRow::from_pairs([
            ("position", SqlValue::from(pos.to_string())),
            ("xid", SqlValue::from(xid)),
            ("data", SqlValue::Bytes(data)),
        ])
    }

    fn seg_size_row() -> SqlRow {
        SqlRow::from_pairs([("seg_size", SqlValue::Int64(MB16 as i64))])
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = config();
        assert_eq!(config.slot_name, DEFAULT_SLOT_NAME);
        assert!(config.create_slot);

        assert!(PostgresMinerConfig::builder()
            .connection_string("host=localhost")
            .build()
            .is_err());
        assert!(PostgresMinerConfig::builder()
            .connection_string("host=localhost")
            .publication("p")
            .slot_name("Bad-Slot")
            .build()
            .is_err());
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("secret"));
        assert!(debug.contains("password=[REDACTED]"));

        let url = PostgresMinerConfig::builder()
            .connection_string("postgresql://cdc:hunter2@db:5432/shop")
            .publication("p")
            .build()
            .unwrap();
        let debug = format!("{:?}", url);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_redact_without_password() {
        assert_eq!(
            redact_connection_string("host=localhost user=cdc"),
            "host=localhost user=cdc"
        );
        assert_eq!(
            redact_connection_string("postgresql://db/shop"),
            "postgresql://db/shop"
        );
    }

    #[test]
    fn test_parse_wal_file_name() {
        assert_eq!(
            parse_wal_file_name("000000010000000000000003", MB16).unwrap(),
            (1, 3)
        );
        // 256 segments of 16MB per 4GB log id
        assert_eq!(
            parse_wal_file_name("00000002000000010000000A", MB16).unwrap(),
            (2, 256 + 10)
        );
        assert!(parse_wal_file_name("000000010000000000000003.partial", MB16).is_err());
        assert!(parse_wal_file_name("0000000100000000000001FF", MB16).is_err());
        assert!(parse_wal_file_name("00000001000000000000000G", MB16).is_err());
    }

    #[tokio::test]
    async fn test_online_segments() {
        let conn = ScriptedConnection::new()
            .on_query("pg_settings", vec![seg_size_row()])
            .on_query(
                "pg_walfile_name",
                vec![SqlRow::from_pairs([
                    ("file_name", SqlValue::from("000000010000000000000003")),
                    ("position", SqlValue::from("50331700")),
                ])],
            )
            .on_query(
                "pg_ls_waldir",
                vec![
                    name_row("000000010000000000000002"),
                    name_row("000000010000000000000003"),
                    name_row("000000010000000000000004"),
                ],
            );
        let miner = PostgresWalMiner::new(config());

        let segments = miner.online_segments(&conn).await.unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].sequence, 2);
        assert_eq!(segments[0].first_position, PositionToken::new(2 * MB16));
        assert_eq!(segments[0].next_position, PositionToken::new(3 * MB16));
        assert!(segments[1].current);
        assert_eq!(segments[1].next_position, PositionToken::Max);

        // segment size is read once
        miner.online_segments(&conn).await.unwrap();
        assert_eq!(conn.count("pg_settings"), 1);

        assert_eq!(
            miner.highest_position(&conn).await.unwrap(),
            PositionToken::new(50_331_700)
        );
    }

    #[tokio::test]
    async fn test_archived_segments_respect_from() {
        let conn = ScriptedConnection::new()
            .on_query("pg_settings", vec![seg_size_row()])
            .on_query(
                "pg_ls_archive_statusdir",
                vec![
                    name_row("000000010000000000000001.done"),
                    name_row("000000010000000000000002.done"),
                ],
            );
        let miner = PostgresWalMiner::new(config());

        let segments = miner
            .archived_segments(&conn, &PositionToken::new(2 * MB16 + 5), 12)
            .await
            .unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].name, "000000010000000000000002");
        assert!(!segments[0].is_online());

        let calls = conn.calls();
        assert_eq!(calls[1].1, vec![SqlValue::Int64(12)]);
    }

    #[tokio::test]
    async fn test_prepare_creates_missing_slot() {
        let conn = ScriptedConnection::new().on_query(
            "pg_publication",
            vec![SqlRow::from_pairs([("pubname", SqlValue::from("shop_pub"))])],
        );
        PostgresWalMiner::new(config()).prepare(&conn).await.unwrap();
        assert_eq!(conn.count("pg_create_logical_replication_slot"), 1);

        let no_create = PostgresMinerConfig {
            create_slot: false,
            ..config()
        };
        let conn = ScriptedConnection::new().on_query(
            "pg_publication",
            vec![SqlRow::from_pairs([("pubname", SqlValue::from("shop_pub"))])],
        );
        let err = PostgresWalMiner::new(no_create)
            .prepare(&conn)
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[tokio::test]
    async fn test_prepare_requires_publication() {
        let conn = ScriptedConnection::new();
        let err = PostgresWalMiner::new(config())
            .prepare(&conn)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("shop_pub"));
    }

    #[tokio::test]
    async fn test_open_session_rejects_active_slot() {
        let conn = ScriptedConnection::new().on_query(
            "pg_replication_slots",
            vec![SqlRow::from_pairs([
                ("active", SqlValue::Bool(true)),
                ("position", SqlValue::from("100")),
            ])],
        );
        let miner = PostgresWalMiner::new(config());
        let window = MiningWindow::for_range(PositionToken::new(100), PositionToken::new(200));
        let err = miner.open_session(&conn, &window).await.unwrap_err();
        assert!(matches!(err, CdcError::SessionStart(_)));

        let missing = ScriptedConnection::new();
        assert!(miner.open_session(&missing, &window).await.is_err());
    }

    #[tokio::test]
    async fn test_earliest_is_slot_position() {
        let conn = ScriptedConnection::new().on_query(
            "pg_replication_slots",
            vec![SqlRow::from_pairs([
                ("active", SqlValue::Bool(false)),
                ("position", SqlValue::from("4096")),
            ])],
        );
        let miner = PostgresWalMiner::new(config());
        assert_eq!(
            miner.earliest_position(&conn, 1).await.unwrap(),
            PositionToken::new(4096)
        );
        assert_eq!(
            miner
                .earliest_position(&ScriptedConnection::new(), 1)
                .await
                .unwrap(),
            PositionToken::Null
        );
    }

    #[tokio::test]
    async fn test_pull_raw_stamps_commit_position() {
        // peeked locations are record ends; commit messages carry the start
        let conn = ScriptedConnection::new().on_query(
            "pg_logical_slot_peek_binary_changes",
            vec![
                // committed before the window
                peek_row(40, "700", msg::begin(50, 700)),
                peek_row(45, "700", msg::insert(16384, &[Some("0")])),
                peek_row(58, "700", msg::commit(50)),
                // straddles the lower bound, commits inside
                peek_row(90, "701", msg::begin(120, 701)),
                peek_row(95, "701", msg::relation(16384, "public", "orders", &["id"])),
                peek_row(95, "701", msg::insert(16384, &[Some("1")])),
                peek_row(110, "701", msg::insert(16384, &[Some("2")])),
                peek_row(128, "701", msg::commit(120)),
                // commit record starts inside and ends past the upper bound
                peek_row(190, "702", msg::begin(196, 702)),
                peek_row(192, "702", msg::insert(16384, &[Some("3")])),
                peek_row(204, "702", msg::commit(196)),
            ],
        );
        let miner = PostgresWalMiner::new(config());
        let window = MiningWindow::for_range(PositionToken::new(100), PositionToken::new(200));

        let batch = miner
            .pull_raw(&conn, &window, &MiningPredicate::unrestricted())
            .await
            .unwrap();
        assert!(batch.exhausted);
        let positions: Vec<_> = batch.records.iter().map(|r| r.position()).collect();
        assert_eq!(
            positions,
            [vec![PositionToken::new(120); 5], vec![PositionToken::new(196); 3]].concat()
        );

        let calls = conn.calls();
        assert_eq!(
            calls[0].1,
            vec![
                SqlValue::from("cdc_slot"),
                SqlValue::from("0/C7"),
                SqlValue::from("shop_pub"),
            ]
        );

        let mut decoder = ChangeEventDecoder::new("postgres");
        let events: Vec<_> = batch
            .records
            .into_iter()
            .filter_map(|r| decoder.decode(r).unwrap())
            .collect();
        let ops: Vec<_> = events.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![
                OperationKind::Insert,
                OperationKind::Insert,
                OperationKind::Commit,
                OperationKind::Insert,
                OperationKind::Commit
            ]
        );
        assert_eq!(events[0].qualified_name().as_deref(), Some("public.orders"));
        assert_eq!(events[0].transaction_id.as_deref(), Some("701"));
    }

    #[tokio::test]
    async fn test_skipped_transaction_keeps_relation_messages() {
        let conn = ScriptedConnection::new().on_query(
            "pg_logical_slot_peek_binary_changes",
            vec![
                peek_row(40, "700", msg::begin(50, 700)),
                peek_row(42, "700", msg::relation(16384, "public", "orders", &["id"])),
                peek_row(45, "700", msg::insert(16384, &[Some("0")])),
                peek_row(58, "700", msg::commit(50)),
                peek_row(110, "701", msg::begin(150, 701)),
                peek_row(120, "701", msg::insert(16384, &[Some("1")])),
                peek_row(158, "701", msg::commit(150)),
            ],
        );
        let miner = PostgresWalMiner::new(config());
        let window = MiningWindow::for_range(PositionToken::new(100), PositionToken::new(200));

        let batch = miner
            .pull_raw(&conn, &window, &MiningPredicate::unrestricted())
            .await
            .unwrap();
        assert_eq!(batch.records.len(), 4);
        // the relation of the skipped transaction sits at the window start
        assert_eq!(batch.records[0].position(), PositionToken::new(100));

        let mut decoder = ChangeEventDecoder::new("postgres");
        let events: Vec<_> = batch
            .records
            .into_iter()
            .filter_map(|r| decoder.decode(r).unwrap())
            .collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].op, OperationKind::Insert);
        assert_eq!(events[0].qualified_name().as_deref(), Some("public.orders"));
        assert_eq!(events[0].position, PositionToken::new(150));
        assert_eq!(events[0].transaction_id.as_deref(), Some("701"));
    }

    #[tokio::test]
    async fn test_feedback_advances_slot() {
        let conn = ScriptedConnection::new();
        let miner = PostgresWalMiner::new(config());
        miner
            .send_feedback(&conn, &PositionToken::new(0x1_0000_0010))
            .await
            .unwrap();
        let calls = conn.calls();
        assert!(calls[0].0.contains("pg_replication_slot_advance"));
        assert_eq!(calls[0].1[1], SqlValue::from("1/10"));

        assert!(miner.send_feedback(&conn, &PositionToken::Max).await.is_err());
    }

    #[tokio::test]
    async fn test_resolve_object_ids() {
        let conn = ScriptedConnection::new().on_query(
            "pg_class",
            vec![SqlRow::from_pairs([("oid", SqlValue::Int64(16384))])],
        );
        let filter = crate::common::FilterCompiler::new(Dialect::Postgres)
            .compile(
                &["public.orders"],
                FilterMode::Tables,
                crate::common::Polarity::Include,
            )
            .unwrap();
        let ids = PostgresWalMiner::new(config())
            .resolve_object_ids(&conn, &filter)
            .await
            .unwrap();
        assert_eq!(ids, vec![16384]);
        assert_eq!(
            conn.calls()[0].1,
            vec![SqlValue::from("public"), SqlValue::from("orders")]
        );
    }
}
