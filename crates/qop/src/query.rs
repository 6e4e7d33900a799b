//! Query data model shared across intake, pipeline, and publisher.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// One result row: column name to raw (stringly) value, as produced by the
/// query engine's SELECT/POST stage.
pub type OutRow = BTreeMap<String, String>;

/// Ordered sequence of result rows.
pub type RowBuffer = Vec<OutRow>;

/// Row handles matched by one WHERE term over one chunk.
pub type WhereResult = BTreeSet<u64>;

/// Group-keyed output entry for map-output (stats) queries.
pub type MapRow = (String, serde_json::Value);

/// Group-keyed result set. Duplicate keys may exist until a merge pass
/// combines them.
pub type OutRowMultimap = Vec<MapRow>;

/// Per-chunk output of the SELECT/POST sub-step.
#[derive(Debug, Clone)]
pub enum ChunkPartial {
    Rows(RowBuffer),
    Map(OutRowMultimap),
}

/// Immutable parameters of one admitted query.
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Query id, unique within the KV.
    pub qid: String,
    /// Raw key/value terms read from `QUERY:<qid>`.
    pub terms: HashMap<String, String>,
    /// Per-pipeline parallelism granted to this query.
    pub max_tasks: usize,
    /// Admission timestamp, microseconds since the epoch.
    pub query_starttm: u64,
}

impl QueryParams {
    /// Submitter-side enqueue timestamp (microseconds), 0 when absent.
    pub fn enqueue_time(&self) -> u64 {
        self.terms
            .get("enqueue_time")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

/// What `QueryEngine::prepare` derives from the raw terms.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    /// Row-capacity hint per chunk; the length is the chunk count.
    pub chunk_size: Vec<u64>,
    pub need_merge: bool,
    pub map_output: bool,
    pub where_clause: String,
    /// Number of OR terms in the WHERE clause.
    pub wterms: u32,
    pub select: String,
    pub post: String,
    pub time_period: u64,
    pub table: String,
}
