//! LogMiner SQL templates
//!
//! Every value that varies per call travels as a bind parameter. The only
//! text spliced into statements is integer object/container id lists built
//! by the filter compiler and the catalog view names chosen from config.

use crate::common::op_codes;

pub const CURRENT_THREAD: &str = "SELECT THREAD# FROM V$INSTANCE";

pub const CURRENT_SCN: &str = "SELECT CURRENT_SCN FROM V$DATABASE";

pub const FIRST_AVAILABLE_SCN: &str = "SELECT MIN(FIRST_CHANGE#) AS FIRST_CHANGE \
     FROM V$ARCHIVED_LOG \
     WHERE ARCHIVED = 'YES' AND STANDBY_DEST = 'NO' AND DELETED = 'NO' AND THREAD# = :1";

pub const ONLINE_LOGS: &str = "SELECT MIN(F.MEMBER) AS FILE_NAME, L.FIRST_CHANGE# AS FIRST_CHANGE, \
     L.NEXT_CHANGE# AS NEXT_CHANGE, L.STATUS AS STATUS, L.SEQUENCE# AS SEQ, L.THREAD# AS THREAD \
     FROM V$LOG L JOIN V$LOGFILE F ON F.GROUP# = L.GROUP# \
     WHERE L.STATUS <> 'UNUSED' \
     GROUP BY F.GROUP#, L.FIRST_CHANGE#, L.NEXT_CHANGE#, L.STATUS, L.SEQUENCE#, L.THREAD# \
     ORDER BY L.SEQUENCE#";

/// `:1` = 1 for the first file of a registration set, `:2` = file name.
pub const ADD_LOGFILE: &str = "DECLARE\n\
     \x20 l_option BINARY_INTEGER;\n\
     BEGIN\n\
     \x20 IF :1 = 1 THEN\n\
     \x20   l_option := DBMS_LOGMNR.NEW;\n\
     \x20 ELSE\n\
     \x20   l_option := DBMS_LOGMNR.ADDFILE;\n\
     \x20 END IF;\n\
     \x20 DBMS_LOGMNR.ADD_LOGFILE(LOGFILENAME => :2, OPTIONS => l_option);\n\
     END;";

/// `:1` = start SCN, `:2` = end SCN (both inclusive).
///
/// Rows come back in redo order, uncommitted ones included. Transactions are
/// assembled from their commit and rollback rows by the mining loop, which
/// lets a transaction span several sessions.
pub const START_LOGMNR: &str = "BEGIN\n\
     \x20 DBMS_LOGMNR.START_LOGMNR(\n\
     \x20   STARTSCN => :1,\n\
     \x20   ENDSCN => :2,\n\
     \x20   OPTIONS => DBMS_LOGMNR.DICT_FROM_ONLINE_CATALOG);\n\
     END;";

pub const END_LOGMNR: &str = "BEGIN\n  DBMS_LOGMNR.END_LOGMNR;\nEND;";

pub const PLUGGABLE_CONTAINERS: &str = "SELECT CON_UID FROM V$CONTAINERS WHERE CON_ID > 2";

/// Owners whose objects are never mined.
pub const SYSTEM_OWNERS: &[&str] = &[
    "SYS",
    "SYSTEM",
    "MGDSYS",
    "OJVMSYS",
    "AUDSYS",
    "OUTLN",
    "APPQOSSYS",
    "DBSNMP",
    "CTXSYS",
    "ORDSYS",
    "ORDPLUGINS",
    "ORDDATA",
    "MDSYS",
    "OLAPSYS",
    "GGSYS",
    "XDB",
    "GSMADMIN_INTERNAL",
    "DBSFWUSER",
    "LBACSYS",
    "DVSYS",
    "WMSYS",
];

/// Archived logs that end after `:1`.
///
/// Optional binds follow in order: the archive destination name, then the
/// retention window in hours.
pub fn archived_logs(destination: bool, retention: bool) -> String {
    let mut next_bind = 2;
    let mut sql = String::from(
        "SELECT A.NAME AS FILE_NAME, A.FIRST_CHANGE# AS FIRST_CHANGE, A.NEXT_CHANGE# AS NEXT_CHANGE, \
         A.SEQUENCE# AS SEQ, A.THREAD# AS THREAD \
         FROM V$ARCHIVED_LOG A \
         WHERE A.NAME IS NOT NULL AND A.ARCHIVED = 'YES' AND A.STATUS = 'A' \
         AND A.STANDBY_DEST = 'NO' AND A.DELETED = 'NO' \
         AND A.NEXT_CHANGE# > :1 \
         AND A.DEST_ID IN (SELECT DEST_ID FROM V$ARCHIVE_DEST_STATUS \
         WHERE STATUS = 'VALID' AND TYPE = 'LOCAL'",
    );
    if destination {
        sql.push_str(&format!(" AND DEST_NAME = :{}", next_bind));
        next_bind += 1;
    }
    sql.push_str(" AND ROWNUM = 1)");
    if retention {
        sql.push_str(&format!(" AND A.FIRST_TIME >= SYSDATE - (:{} / 24)", next_bind));
    }
    sql.push_str(" ORDER BY A.SEQUENCE#");
    sql
}

/// Object ids for a name predicate over the table or materialized view log
/// catalog.
///
/// `DBA_OBJECTS.OBJECT_ID` is the dictionary object number, the value
/// LogMiner reports as `DATA_OBJ#`. `DATA_OBJECT_ID` is the segment number
/// (`DATA_OBJD#`), which changes on truncate and move, so it only serves
/// to exclude objects without storage.
pub fn object_ids(objects_view: &str, mview_logs_view: Option<&str>, name_predicate: &str) -> String {
    let owners: Vec<String> = SYSTEM_OWNERS.iter().map(|o| format!("'{}'", o)).collect();
    let join = match mview_logs_view {
        Some(view) => format!(
            " JOIN {} L ON L.LOG_OWNER = O.OWNER AND L.LOG_TABLE = O.OBJECT_NAME",
            view
        ),
        None => String::new(),
    };
    format!(
        "SELECT O.OBJECT_ID FROM {} O{} \
         WHERE O.DATA_OBJECT_ID IS NOT NULL AND O.OBJECT_TYPE LIKE 'TABLE%' AND O.TEMPORARY = 'N' \
         AND O.OWNER NOT IN ({}) AND {}",
        objects_view,
        join,
        owners.join(","),
        name_predicate
    )
}

/// Mining query over `V$LOGMNR_CONTENTS`.
///
/// Row changes pass the object predicate; commit and rollback rows always
/// pass. `containers` restricts rows to the given pluggable databases.
pub fn mine_contents(object_predicate: &str, containers: &[i64]) -> String {
    let mut sql = format!(
        "SELECT SCN, ROUND((TIMESTAMP - DATE '1970-01-01') * 86400000) AS EVENT_MILLIS, \
         OPERATION_CODE, RAWTOHEX(XID) AS XID, RS_ID, SSN, CSF, ROW_ID, DATA_OBJ#, \
         SEG_OWNER, TABLE_NAME, SQL_REDO, SRC_CON_UID \
         FROM V$LOGMNR_CONTENTS \
         WHERE ((OPERATION_CODE IN ({}, {}, {}, {}) AND {}) OR OPERATION_CODE IN ({}, {}))",
        op_codes::INSERT,
        op_codes::DELETE,
        op_codes::UPDATE,
        op_codes::DDL,
        object_predicate,
        op_codes::COMMIT,
        op_codes::ROLLBACK
    );
    if !containers.is_empty() {
        let list: Vec<String> = containers.iter().map(i64::to_string).collect();
        sql.push_str(&format!(" AND SRC_CON_UID IN ({})", list.join(",")));
    }
    sql
}
