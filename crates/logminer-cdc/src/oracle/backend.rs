//! [`LogMiningBackend`] over Oracle LogMiner.

use super::statements;
use crate::common::{
    CdcError, CompiledFilter, Dialect, FilterMode, LogMiningBackend, LogSegment, MiningPredicate,
    MiningRow, MiningWindow, PositionToken, RawBatch, RawRecord, Result, RowStream, SqlConnection,
    SqlRow, SqlValue,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Raised by `END_LOGMNR` when no session is active.
const NO_ACTIVE_SESSION: &str = "ORA-01307";

/// Default number of `V$LOGMNR_CONTENTS` rows returned per pull.
pub const DEFAULT_FETCH_SIZE: usize = 10_000;

/// Oracle-specific backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleMinerConfig {
    /// Connected to a multitenant container database
    pub cdb: bool,
    /// Objects resolve through the connected PDB's `DBA_*` views even in a CDB
    pub pdb_connection_allowed: bool,
    /// Restrict mined rows to pluggable containers (CDB only)
    pub filter_containers: bool,
    /// Archive destination name; the first valid local destination when unset
    pub archive_destination: Option<String>,
    /// Mining rows handed to the loop per pull
    pub fetch_size: usize,
}

impl Default for OracleMinerConfig {
    fn default() -> Self {
        Self {
            cdb: false,
            pdb_connection_allowed: false,
            filter_containers: true,
            archive_destination: None,
            fetch_size: DEFAULT_FETCH_SIZE,
        }
    }
}

impl OracleMinerConfig {
    pub fn builder() -> OracleMinerConfigBuilder {
        OracleMinerConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(dest) = &self.archive_destination {
            if dest.trim().is_empty() {
                return Err(CdcError::config("archive_destination must not be blank"));
            }
        }
        if self.fetch_size == 0 {
            return Err(CdcError::config("fetch_size must be positive"));
        }
        Ok(())
    }

    fn objects_view(&self) -> &'static str {
        if self.cdb && !self.pdb_connection_allowed {
            "CDB_OBJECTS"
        } else {
            "DBA_OBJECTS"
        }
    }

    fn mview_logs_view(&self) -> &'static str {
        if self.cdb && !self.pdb_connection_allowed {
            "CDB_MVIEW_LOGS"
        } else {
            "DBA_MVIEW_LOGS"
        }
    }
}

#[derive(Debug, Default)]
pub struct OracleMinerConfigBuilder {
    config: OracleMinerConfig,
}

impl OracleMinerConfigBuilder {
    pub fn cdb(mut self, cdb: bool) -> Self {
        self.config.cdb = cdb;
        self
    }

    pub fn pdb_connection_allowed(mut self, allowed: bool) -> Self {
        self.config.pdb_connection_allowed = allowed;
        self
    }

    pub fn filter_containers(mut self, filter: bool) -> Self {
        self.config.filter_containers = filter;
        self
    }

    pub fn archive_destination(mut self, name: impl Into<String>) -> Self {
        self.config.archive_destination = Some(name.into());
        self
    }

    pub fn fetch_size(mut self, rows: usize) -> Self {
        self.config.fetch_size = rows;
        self
    }

    pub fn build(self) -> Result<OracleMinerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Open `V$LOGMNR_CONTENTS` result set of one window.
struct ContentsCursor {
    window: (u64, PositionToken, PositionToken),
    rows: Pin<Box<dyn RowStream>>,
}

/// Oracle LogMiner capability.
///
/// The contents query of a window runs once; its rows are handed out
/// `fetch_size` at a time across pulls.
#[derive(Clone, Default)]
pub struct OracleLogMiner {
    config: OracleMinerConfig,
    cursor: Arc<Mutex<Option<ContentsCursor>>>,
}

impl std::fmt::Debug for OracleLogMiner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OracleLogMiner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OracleLogMiner {
    pub fn new(config: OracleMinerConfig) -> Self {
        Self {
            config,
            cursor: Arc::default(),
        }
    }

    pub fn config(&self) -> &OracleMinerConfig {
        &self.config
    }

    async fn container_uids(&self, conn: &dyn SqlConnection) -> Result<Vec<i64>> {
        if !(self.config.cdb && self.config.filter_containers) {
            return Ok(Vec::new());
        }
        conn.query(statements::PLUGGABLE_CONTAINERS, &[])
            .await?
            .iter()
            .map(|row| row.i64("CON_UID"))
            .collect()
    }
}

/// SCN bind value. NUMBER binds accept text for values past `i64`.
fn scn_param(position: &PositionToken) -> Result<SqlValue> {
    match position {
        PositionToken::Null => Ok(SqlValue::Int64(0)),
        PositionToken::Value(v) => Ok(i64::try_from(*v)
            .map(SqlValue::Int64)
            .unwrap_or_else(|_| SqlValue::Text(v.to_string()))),
        PositionToken::Max => Err(CdcError::session_start(
            "an SCN bound cannot be the end-of-log placeholder",
        )),
    }
}

fn u32_column(row: &SqlRow, name: &str) -> Result<u32> {
    let value = row.i64(name)?;
    u32::try_from(value)
        .map_err(|_| CdcError::decode(format!("column {} out of range: {}", name, value)))
}

fn u64_column(row: &SqlRow, name: &str) -> Result<u64> {
    let value = row.i64(name)?;
    u64::try_from(value)
        .map_err(|_| CdcError::decode(format!("column {} out of range: {}", name, value)))
}

fn online_segment(row: &SqlRow) -> Result<LogSegment> {
    let current = row
        .opt_str("STATUS")
        .is_some_and(|s| s.eq_ignore_ascii_case("CURRENT"));
    let next = match row.position("NEXT_CHANGE")? {
        PositionToken::Null => PositionToken::Max,
        _ if current => PositionToken::Max,
        next => next,
    };
    Ok(LogSegment::online(
        row.str("FILE_NAME")?,
        u32_column(row, "THREAD")?,
        u64_column(row, "SEQ")?,
        row.position("FIRST_CHANGE")?,
        next,
        current,
    ))
}

fn archived_segment(row: &SqlRow) -> Result<LogSegment> {
    Ok(LogSegment::archived(
        row.str("FILE_NAME")?,
        u32_column(row, "THREAD")?,
        u64_column(row, "SEQ")?,
        row.position("FIRST_CHANGE")?,
        row.position("NEXT_CHANGE")?,
    ))
}

fn mining_row(row: &SqlRow) -> Result<RawRecord> {
    let operation_code = i32::try_from(row.i64("OPERATION_CODE")?)
        .map_err(|_| CdcError::decode("OPERATION_CODE out of range"))?;
    Ok(RawRecord::Mining(MiningRow {
        position: row.position("SCN")?,
        operation_code,
        transaction_id: row.opt_str("XID").map(str::to_string),
        object_id: row.opt_i64("DATA_OBJ#")?,
        schema: row.opt_str("SEG_OWNER").map(str::to_string),
        object: row.opt_str("TABLE_NAME").map(str::to_string),
        sql_redo: row.opt_str("SQL_REDO").map(str::to_string),
        continuation: row.flag("CSF"),
        rs_id: row.opt_str("RS_ID").map(|s| s.trim().to_string()),
        ssn: row.opt_i64("SSN")?,
        row_id: row.opt_str("ROW_ID").map(str::to_string),
        timestamp: row.opt_i64("EVENT_MILLIS")?,
    }))
}

#[async_trait]
impl LogMiningBackend for OracleLogMiner {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Oracle
    }

    async fn current_thread(&self, conn: &dyn SqlConnection) -> Result<u32> {
        let row = conn
            .query_one(statements::CURRENT_THREAD, &[])
            .await?
            .ok_or_else(|| CdcError::no_catalog_access("V$INSTANCE returned no row"))?;
        u32_column(&row, "THREAD#")
    }

    async fn online_segments(&self, conn: &dyn SqlConnection) -> Result<Vec<LogSegment>> {
        conn.query(statements::ONLINE_LOGS, &[])
            .await?
            .iter()
            .map(online_segment)
            .collect()
    }

    async fn archived_segments(
        &self,
        conn: &dyn SqlConnection,
        from: &PositionToken,
        retention_hours: u32,
    ) -> Result<Vec<LogSegment>> {
        let destination = self.config.archive_destination.as_deref();
        let sql = statements::archived_logs(destination.is_some(), retention_hours > 0);

        let mut params = vec![scn_param(from)?];
        if let Some(dest) = destination {
            params.push(SqlValue::from(dest));
        }
        if retention_hours > 0 {
            params.push(SqlValue::Int64(i64::from(retention_hours)));
        }

        conn.query(&sql, &params)
            .await?
            .iter()
            .map(archived_segment)
            .collect()
    }

    async fn earliest_position(
        &self,
        conn: &dyn SqlConnection,
        thread: u32,
    ) -> Result<PositionToken> {
        match conn
            .query_one(
                statements::FIRST_AVAILABLE_SCN,
                &[SqlValue::Int64(i64::from(thread))],
            )
            .await?
        {
            Some(row) => row.position("FIRST_CHANGE"),
            None => Ok(PositionToken::Null),
        }
    }

    async fn highest_position(&self, conn: &dyn SqlConnection) -> Result<PositionToken> {
        match conn.query_one(statements::CURRENT_SCN, &[]).await? {
            Some(row) => row.position("CURRENT_SCN"),
            None => Ok(PositionToken::Null),
        }
    }

    async fn resolve_object_ids(
        &self,
        conn: &dyn SqlConnection,
        filter: &CompiledFilter,
    ) -> Result<Vec<i64>> {
        let predicate = filter.resolution_predicate();
        let mview_logs = match filter.mode() {
            FilterMode::Tables => None,
            FilterMode::MaterializedViewLogs => Some(self.config.mview_logs_view()),
        };
        let sql = statements::object_ids(self.config.objects_view(), mview_logs, &predicate.sql);
        let ids = conn
            .query(&sql, &predicate.params)
            .await?
            .iter()
            .map(|row| row.i64("OBJECT_ID"))
            .collect::<Result<Vec<_>>>()?;
        debug!(
            "Resolved {} Oracle objects from {}",
            ids.len(),
            self.config.objects_view()
        );
        Ok(ids)
    }

    async fn register_segment(
        &self,
        conn: &dyn SqlConnection,
        segment: &LogSegment,
        new_set: bool,
    ) -> Result<()> {
        debug!(
            "Adding log file {} ({})",
            segment.name,
            if new_set { "NEW" } else { "ADDFILE" }
        );
        conn.execute(
            statements::ADD_LOGFILE,
            &[
                SqlValue::Int64(i64::from(new_set)),
                SqlValue::from(segment.name.as_str()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn open_session(&self, conn: &dyn SqlConnection, window: &MiningWindow) -> Result<()> {
        self.cursor.lock().await.take();
        // ENDSCN is inclusive; the window's upper bound is not.
        let end = window.upper - PositionToken::new(1);
        conn.execute(
            statements::START_LOGMNR,
            &[scn_param(&window.lower)?, scn_param(&end)?],
        )
        .await?;
        info!("LogMiner session started for SCN {}..={}", window.lower, end);
        Ok(())
    }

    async fn pull_raw(
        &self,
        conn: &dyn SqlConnection,
        window: &MiningWindow,
        predicate: &MiningPredicate,
    ) -> Result<RawBatch> {
        let key = (window.id, window.lower, window.upper);
        let mut cursor = self.cursor.lock().await;
        if cursor.as_ref().map_or(true, |c| c.window != key) {
            let containers = self.container_uids(conn).await?;
            let sql = statements::mine_contents(&predicate.to_sql(), &containers);
            *cursor = Some(ContentsCursor {
                window: key,
                rows: conn.query_stream(&sql, &[]).await?,
            });
        }
        let Some(open) = cursor.as_mut() else {
            return Ok(RawBatch::last(Vec::new()));
        };

        let mut records = Vec::with_capacity(self.config.fetch_size.min(1_024));
        let mut exhausted = false;
        while records.len() < self.config.fetch_size {
            match open.rows.next().await? {
                Some(row) => records.push(mining_row(&row)?),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }
        trace!(
            "Fetched {} LogMiner rows for window {} (exhausted={})",
            records.len(),
            window.id,
            exhausted
        );
        if exhausted {
            *cursor = None;
            Ok(RawBatch::last(records))
        } else {
            Ok(RawBatch::partial(records))
        }
    }

    async fn close_session(&self, conn: &dyn SqlConnection) -> Result<()> {
        self.cursor.lock().await.take();
        match conn.execute(statements::END_LOGMNR, &[]).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains(NO_ACTIVE_SESSION) => {
                warn!("END_LOGMNR found no active session");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
