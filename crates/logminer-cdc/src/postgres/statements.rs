//! WAL catalog and slot SQL.
//!
//! Positions cross the wire as decimal text (`pg_wal_lsn_diff(x, '0/0')`)
//! and come back in as `$n::text::pg_lsn` binds.

/// Segment size in bytes; PostgreSQL 10 reports it in 8kB pages.
pub const WAL_SEGMENT_SIZE: &str = "SELECT (setting::bigint * CASE unit \
     WHEN '8kB' THEN 8192 WHEN 'kB' THEN 1024 WHEN 'MB' THEN 1048576 ELSE 1 END) AS seg_size \
     FROM pg_settings WHERE name = 'wal_segment_size'";

pub const CURRENT_WAL: &str = "SELECT pg_walfile_name(pg_current_wal_lsn()) AS file_name, \
     pg_wal_lsn_diff(pg_current_wal_lsn(), '0/0')::text AS position";

pub const TIMELINE: &str = "SELECT timeline_id::bigint AS timeline_id FROM pg_control_checkpoint()";

pub const WAL_DIRECTORY: &str = "SELECT name FROM pg_ls_waldir() \
     WHERE name ~ '^[0-9A-F]{24}$' ORDER BY name";

/// `$1` = retention in hours, 0 for unbounded.
pub const ARCHIVE_STATUS: &str = "SELECT name FROM pg_ls_archive_statusdir() \
     WHERE name ~ '^[0-9A-F]{24}\\.done$' \
     AND ($1::bigint = 0 OR modification >= now() - ($1::bigint * interval '1 hour')) \
     ORDER BY name";

pub const SLOT_STATE: &str = "SELECT active, \
     pg_wal_lsn_diff(COALESCE(confirmed_flush_lsn, restart_lsn), '0/0')::text AS position \
     FROM pg_replication_slots WHERE slot_name = $1 AND plugin = 'pgoutput'";

pub const CREATE_SLOT: &str = "SELECT slot_name::text AS slot_name \
     FROM pg_create_logical_replication_slot($1, 'pgoutput')";

pub const PUBLICATION_EXISTS: &str = "SELECT pubname::text AS pubname FROM pg_publication WHERE pubname = $1";

/// `$1` = slot, `$2` = inclusive upper LSN, `$3` = publication.
pub const PEEK_CHANGES: &str = "SELECT pg_wal_lsn_diff(lsn, '0/0')::text AS position, \
     xid::text AS xid, data \
     FROM pg_logical_slot_peek_binary_changes($1, $2::text::pg_lsn, NULL, \
     'proto_version', '1', 'publication_names', $3)";

pub const ADVANCE_SLOT: &str = "SELECT slot_name::text AS slot_name \
     FROM pg_replication_slot_advance($1, $2::text::pg_lsn)";

const OBJECT_BASE: &str = "SELECT c.oid::bigint AS oid FROM pg_class c \
     JOIN pg_namespace n ON n.oid = c.relnamespace";

/// Relation oids for a name predicate.
pub fn object_ids(materialized_views: bool, name_predicate: &str) -> String {
    if materialized_views {
        format!(
            "{} JOIN pg_matviews m ON m.schemaname = n.nspname AND m.matviewname = c.relname \
             WHERE c.relkind = 'm' AND {}",
            OBJECT_BASE, name_predicate
        )
    } else {
        format!(
            "{} WHERE c.relkind IN ('r', 'p') \
             AND n.nspname NOT IN ('pg_catalog', 'information_schema') AND {}",
            OBJECT_BASE, name_predicate
        )
    }
}
