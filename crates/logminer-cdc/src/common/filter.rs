//! Object filter compilation
//!
//! Include/exclude lists are written as `schema.object` patterns:
//!
//! - `ORDERS`: object name only, any schema
//! - `SALES.ORDERS`: schema and object
//! - `HR.*` or `HR.%`: every object in a schema
//! - `"Sales"."Orders"`: quoted names keep their case
//!
//! Unquoted names are folded the way the backend folds identifiers (Oracle
//! upper-cases, PostgreSQL lower-cases).
//!
//! Filtering happens in two steps. A pattern list compiles into a
//! parameterized name predicate over the backend catalog; the backend resolves
//! that predicate into internal object ids; the ids are then emitted as an
//! `IN`-list predicate split into chunks of at most
//! [`MAX_CHUNK_CARDINALITY`] elements, because mining views expose only
//! numeric object ids and backends cap list literals at 1000 items.
//!
//! # Example
//!
//! ```rust
//! use logminer_cdc::common::{Dialect, FilterCompiler, FilterMode, Polarity};
//!
//! let compiler = FilterCompiler::new(Dialect::Oracle);
//! let filter = compiler
//!     .compile(&["SALES.ORDERS", "HR.*"], FilterMode::Tables, Polarity::Include)
//!     .unwrap();
//!
//! assert!(filter.admits("SALES", "ORDERS"));
//! assert!(filter.admits("HR", "EMPLOYEES"));
//! assert!(!filter.admits("SALES", "CUSTOMERS"));
//! ```

use crate::common::{CdcError, LogMiningBackend, Result, SqlConnection, SqlValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use tracing::debug;

/// Largest number of ids in one `IN (...)` list.
pub const MAX_CHUNK_CARDINALITY: usize = 998;

static UNQUOTED_IDENTIFIER: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$#]{0,127}$"));

/// Backend SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Oracle,
    Postgres,
}

impl Dialect {
    /// Fold an unquoted identifier the way the backend does.
    pub fn fold(&self, identifier: &str) -> String {
        match self {
            Self::Oracle => identifier.to_uppercase(),
            Self::Postgres => identifier.to_lowercase(),
        }
    }

    /// Bind placeholder for the 1-based parameter `n`.
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Self::Oracle => format!(":{}", n),
            Self::Postgres => format!("${}", n),
        }
    }

    /// Column holding the internal object id in mined rows.
    pub fn object_id_column(&self) -> &'static str {
        match self {
            Self::Oracle => "DATA_OBJ#",
            Self::Postgres => "relid",
        }
    }

    /// Catalog columns `(schema, object)` matched for `mode`.
    pub fn name_fields(&self, mode: FilterMode) -> (&'static str, &'static str) {
        match (self, mode) {
            (Self::Oracle, FilterMode::Tables) => ("O.OWNER", "O.OBJECT_NAME"),
            (Self::Oracle, FilterMode::MaterializedViewLogs) => ("L.LOG_OWNER", "L.MASTER"),
            (Self::Postgres, FilterMode::Tables) => ("n.nspname", "c.relname"),
            (Self::Postgres, FilterMode::MaterializedViewLogs) => ("n.nspname", "m.matviewname"),
        }
    }
}

/// Which catalog name fields a filter is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Table owner and name
    #[default]
    Tables,
    /// Materialized view log owner and master table
    MaterializedViewLogs,
}

/// How multiple patterns combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Row visible if any pattern matches (OR)
    Include,
    /// Row visible unless some pattern matches (AND of negations)
    Exclude,
}

/// One parsed filter pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectPattern {
    /// Bare name: matches the object name in any schema
    Object { object: String },
    /// `schema.object`
    Qualified { schema: String, object: String },
    /// `schema.*` / `schema.%`
    Schema { schema: String },
}

impl ObjectPattern {
    /// Parse a pattern, folding unquoted names for `dialect`.
    pub fn parse(pattern: &str, dialect: Dialect) -> Result<Self> {
        let parts = split_identifier_path(pattern.trim())?;
        match parts.as_slice() {
            [Part::Name(object)] => Ok(Self::Object {
                object: object.resolve(dialect),
            }),
            [Part::Name(schema), Part::Wildcard] => Ok(Self::Schema {
                schema: schema.resolve(dialect),
            }),
            [Part::Name(schema), Part::Name(object)] => Ok(Self::Qualified {
                schema: schema.resolve(dialect),
                object: object.resolve(dialect),
            }),
            _ => Err(CdcError::filter(format!(
                "invalid pattern '{}': expected object, schema.object or schema.*",
                pattern
            ))),
        }
    }

    /// Whether the pattern matches a catalog `(schema, object)` pair.
    pub fn matches(&self, schema: &str, object: &str) -> bool {
        match self {
            Self::Object { object: o } => o == object,
            Self::Qualified {
                schema: s,
                object: o,
            } => s == schema && o == object,
            Self::Schema { schema: s } => s == schema,
        }
    }
}

#[derive(Debug)]
enum Identifier {
    Quoted(String),
    Unquoted(String),
}

impl Identifier {
    fn resolve(&self, dialect: Dialect) -> String {
        match self {
            Self::Quoted(s) => s.clone(),
            Self::Unquoted(s) => dialect.fold(s),
        }
    }
}

#[derive(Debug)]
enum Part {
    Name(Identifier),
    Wildcard,
}

fn split_identifier_path(pattern: &str) -> Result<Vec<Part>> {
    let identifier = UNQUOTED_IDENTIFIER
        .as_ref()
        .map_err(|e| CdcError::filter(e.to_string()))?;
    let invalid = |why: &str| CdcError::filter(format!("invalid pattern '{}': {}", pattern, why));

    let mut parts = Vec::new();
    let mut chars = pattern.chars().peekable();
    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        name.push('"');
                    }
                    Some('"') => break,
                    Some(c) => name.push(c),
                    None => return Err(invalid("unterminated quoted identifier")),
                }
            }
            if name.is_empty() {
                return Err(invalid("empty quoted identifier"));
            }
            parts.push(Part::Name(Identifier::Quoted(name)));
        } else {
            let mut raw = String::new();
            while let Some(&c) = chars.peek() {
                if c == '.' {
                    break;
                }
                raw.push(c);
                chars.next();
            }
            let raw = raw.trim();
            if raw == "*" || raw == "%" {
                parts.push(Part::Wildcard);
            } else if identifier.is_match(raw) {
                parts.push(Part::Name(Identifier::Unquoted(raw.to_string())));
            } else {
                return Err(invalid("not a valid identifier"));
            }
        }

        match chars.next() {
            None => break,
            Some('.') => continue,
            Some(_) => return Err(invalid("unexpected text after quoted identifier")),
        }
    }

    // A wildcard is only meaningful in the object position.
    let wildcard_misplaced = parts
        .iter()
        .enumerate()
        .any(|(i, p)| matches!(p, Part::Wildcard) && (i == 0 || i + 1 != parts.len()));
    if wildcard_misplaced {
        return Err(invalid("wildcard must follow a schema name"));
    }
    Ok(parts)
}

/// SQL text with its bind parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Compiled name filter.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    dialect: Dialect,
    mode: FilterMode,
    polarity: Polarity,
    patterns: Vec<ObjectPattern>,
    predicate: SqlFragment,
}

impl CompiledFilter {
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn mode(&self) -> FilterMode {
        self.mode
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn patterns(&self) -> &[ObjectPattern] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Catalog predicate in this filter's polarity.
    pub fn predicate(&self) -> &SqlFragment {
        &self.predicate
    }

    /// Catalog predicate selecting the objects the patterns name, whatever
    /// this filter's polarity. Used to resolve object ids.
    pub fn resolution_predicate(&self) -> SqlFragment {
        render_predicate(self.dialect, self.mode, Polarity::Include, &self.patterns)
    }

    /// Whether any pattern names `(schema, object)`.
    pub fn matches(&self, schema: &str, object: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(schema, object))
    }

    /// Whether a row of `(schema, object)` is visible under this filter.
    pub fn admits(&self, schema: &str, object: &str) -> bool {
        match self.polarity {
            Polarity::Include => self.matches(schema, object),
            Polarity::Exclude => !self.matches(schema, object),
        }
    }
}

fn render_predicate(
    dialect: Dialect,
    mode: FilterMode,
    polarity: Polarity,
    patterns: &[ObjectPattern],
) -> SqlFragment {
    if patterns.is_empty() {
        let sql = match polarity {
            Polarity::Include => "1 = 0",
            Polarity::Exclude => "1 = 1",
        };
        return SqlFragment {
            sql: sql.to_string(),
            params: Vec::new(),
        };
    }

    let (schema_field, object_field) = dialect.name_fields(mode);
    let mut params = Vec::new();
    let mut bind = |value: &str| {
        params.push(SqlValue::Text(value.to_string()));
        dialect.placeholder(params.len())
    };

    let clauses: Vec<String> = patterns
        .iter()
        .map(|pattern| {
            let clause = match pattern {
                ObjectPattern::Object { object } => format!("{} = {}", object_field, bind(object)),
                ObjectPattern::Schema { schema } => format!("{} = {}", schema_field, bind(schema)),
                ObjectPattern::Qualified { schema, object } => {
                    let s = bind(schema);
                    let o = bind(object);
                    format!("{} = {} AND {} = {}", schema_field, s, object_field, o)
                }
            };
            match polarity {
                Polarity::Include => format!("({})", clause),
                Polarity::Exclude => format!("NOT ({})", clause),
            }
        })
        .collect();

    let joiner = match polarity {
        Polarity::Include => " OR ",
        Polarity::Exclude => " AND ",
    };
    SqlFragment {
        sql: format!("({})", clauses.join(joiner)),
        params,
    }
}

/// Split `ids` into lists of at most `max` elements.
///
/// Input is de-duplicated and sorted first, so every id lands in exactly one
/// chunk.
pub fn chunk_object_ids(ids: &[i64], max: usize) -> Vec<Vec<i64>> {
    let unique: BTreeSet<i64> = ids.iter().copied().collect();
    let unique: Vec<i64> = unique.into_iter().collect();
    unique.chunks(max.max(1)).map(<[i64]>::to_vec).collect()
}

/// Object-id list predicate.
///
/// Ids are integers produced by the backend catalog and are rendered as
/// literals; only names ever travel as bind parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectIdPredicate {
    column: String,
    exclude: bool,
    ids: BTreeSet<i64>,
    chunks: Vec<Vec<i64>>,
}

impl ObjectIdPredicate {
    pub fn new(column: impl Into<String>, ids: &[i64], exclude: bool) -> Self {
        Self::with_chunk_size(column, ids, exclude, MAX_CHUNK_CARDINALITY)
    }

    pub fn with_chunk_size(
        column: impl Into<String>,
        ids: &[i64],
        exclude: bool,
        max_chunk: usize,
    ) -> Self {
        Self {
            column: column.into(),
            exclude,
            ids: ids.iter().copied().collect(),
            chunks: chunk_object_ids(ids, max_chunk),
        }
    }

    pub fn chunks(&self) -> &[Vec<i64>] {
        &self.chunks
    }

    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Render as `col IN (..) OR col IN (..)`, or
    /// `col NOT IN (..) AND col NOT IN (..)` when excluding.
    pub fn to_sql(&self) -> String {
        if self.chunks.is_empty() {
            return if self.exclude { "1 = 1" } else { "1 = 0" }.to_string();
        }
        let (op, joiner) = if self.exclude {
            ("NOT IN", " AND ")
        } else {
            ("IN", " OR ")
        };
        let clauses: Vec<String> = self
            .chunks
            .iter()
            .map(|chunk| {
                let list: Vec<String> = chunk.iter().map(i64::to_string).collect();
                format!("{} {} ({})", self.column, op, list.join(","))
            })
            .collect();
        format!("({})", clauses.join(joiner))
    }

    /// In-memory evaluation of the predicate for one object id.
    pub fn admits(&self, id: i64) -> bool {
        self.ids.contains(&id) != self.exclude
    }
}

/// Object restriction attached to a mining session: include ids AND NOT
/// exclude ids. Boundary rows are never restricted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MiningPredicate {
    pub include: Option<ObjectIdPredicate>,
    pub exclude: Option<ObjectIdPredicate>,
}

impl MiningPredicate {
    /// A predicate admitting every object.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    pub fn to_sql(&self) -> String {
        match (&self.include, &self.exclude) {
            (None, None) => "1 = 1".to_string(),
            (Some(p), None) | (None, Some(p)) => p.to_sql(),
            (Some(i), Some(e)) => format!("({} AND {})", i.to_sql(), e.to_sql()),
        }
    }

    /// Whether an event for `object_id` passes. Events without an object id
    /// (boundaries, some DDL) always pass.
    pub fn admits(&self, object_id: Option<i64>) -> bool {
        let Some(id) = object_id else {
            return true;
        };
        self.include.as_ref().map_or(true, |p| p.admits(id))
            && self.exclude.as_ref().map_or(true, |p| p.admits(id))
    }
}

/// Compiles pattern lists for one backend dialect.
#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler {
    dialect: Dialect,
}

impl FilterCompiler {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compile patterns into a name filter.
    pub fn compile<S: AsRef<str>>(
        &self,
        patterns: &[S],
        mode: FilterMode,
        polarity: Polarity,
    ) -> Result<CompiledFilter> {
        let patterns = patterns
            .iter()
            .map(|p| ObjectPattern::parse(p.as_ref(), self.dialect))
            .collect::<Result<Vec<_>>>()?;
        let predicate = render_predicate(self.dialect, mode, polarity, &patterns);
        Ok(CompiledFilter {
            dialect: self.dialect,
            mode,
            polarity,
            patterns,
            predicate,
        })
    }

    /// Resolve a compiled filter to object ids through the backend catalog
    /// and emit a chunked id predicate.
    pub async fn compile_object_id_filter(
        &self,
        backend: &dyn LogMiningBackend,
        conn: &dyn SqlConnection,
        filter: &CompiledFilter,
        exclude: bool,
    ) -> Result<ObjectIdPredicate> {
        let ids = if filter.is_empty() {
            Vec::new()
        } else {
            backend.resolve_object_ids(conn, filter).await?
        };
        let predicate = ObjectIdPredicate::new(self.dialect.object_id_column(), &ids, exclude);
        debug!(
            "Resolved {} patterns to {} object ids in {} chunks (exclude={})",
            filter.patterns().len(),
            predicate.len(),
            predicate.chunks().len(),
            exclude
        );
        Ok(predicate)
    }

    /// Build the session predicate from include and exclude lists. An empty
    /// list leaves its side unrestricted.
    pub async fn mining_predicate<S: AsRef<str>>(
        &self,
        backend: &dyn LogMiningBackend,
        conn: &dyn SqlConnection,
        mode: FilterMode,
        include: &[S],
        exclude: &[S],
    ) -> Result<MiningPredicate> {
        let mut predicate = MiningPredicate::unrestricted();
        if !include.is_empty() {
            let filter = self.compile(include, mode, Polarity::Include)?;
            predicate.include = Some(
                self.compile_object_id_filter(backend, conn, &filter, false)
                    .await?,
            );
        }
        if !exclude.is_empty() {
            let filter = self.compile(exclude, mode, Polarity::Exclude)?;
            predicate.exclude = Some(
                self.compile_object_id_filter(backend, conn, &filter, true)
                    .await?,
            );
        }
        Ok(predicate)
    }
}
