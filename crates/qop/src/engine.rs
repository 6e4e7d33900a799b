//! Seam to the query-engine evaluator.
//!
//! The evaluator itself is a black box supplied by the embedding process: it
//! partitions a query into chunks at prepare time, answers WHERE and
//! SELECT/POST sub-steps asynchronously, and owns all merge semantics. The
//! proxy only schedules those calls.

use async_trait::async_trait;

use crate::query::{ChunkPartial, OutRowMultimap, PreparedQuery, QueryParams, RowBuffer, WhereResult};

/// Per-sub-step performance record returned by the engine. `error` marks
/// the step as failed and aborts the owning chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepPerf {
    pub where_time_ms: u32,
    pub select_time_ms: u32,
    pub postproc_time_ms: u32,
    pub error: bool,
}

/// Prepare rejected the query. The code is surfaced to the submitter as a
/// negative progress value; the table (when the engine got far enough to
/// derive it) goes into telemetry.
#[derive(Debug, Clone)]
pub struct PrepareError {
    pub code: i32,
    pub table: String,
}

#[async_trait]
pub trait QueryEngine: Send + Sync + 'static {
    /// Derive chunking and processing hints from the raw query terms.
    fn prepare(&self, qp: &QueryParams) -> Result<PreparedQuery, PrepareError>;

    /// Evaluate one OR term of the WHERE clause over one chunk.
    async fn execute_where(&self, qp: &QueryParams, chunk: u32, term: u32)
        -> (StepPerf, WhereResult);

    /// Run SELECT and post-processing over the rows matched by the WHERE
    /// union for one chunk.
    async fn execute_select(
        &self,
        qp: &QueryParams,
        chunk: u32,
        matches: WhereResult,
    ) -> (StepPerf, ChunkPartial);

    /// OR-combine the WHERE partials of one chunk.
    fn set_union(&self, terms: Vec<WhereResult>) -> WhereResult;

    /// Fold one chunk's rows into a worker accumulator (merge mode).
    /// Returns false on failure.
    fn accumulate(&self, qp: &QueryParams, chunk: RowBuffer, acc: &mut RowBuffer) -> bool;

    /// Fold one chunk's group-keyed entries into a worker accumulator
    /// (merge mode, map output).
    fn stats_merge(&self, table: &str, chunk: OutRowMultimap, acc: &mut OutRowMultimap);

    /// Merge all workers' row accumulators into the final result.
    fn final_merge_rows(&self, qp: &QueryParams, parts: Vec<RowBuffer>, out: &mut RowBuffer)
        -> bool;

    /// Merge all workers' group-keyed accumulators into the final result.
    fn final_merge_map(
        &self,
        qp: &QueryParams,
        parts: Vec<OutRowMultimap>,
        out: &mut OutRowMultimap,
    ) -> bool;

    /// Render one group-keyed output entry as a ready-made JSON row.
    fn stats_row_json(&self, table: &str, key: &str, value: &serde_json::Value) -> String;
}
