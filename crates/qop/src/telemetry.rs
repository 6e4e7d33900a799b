//! Per-query performance records, emitted as structured tracing events.
//! External reporters subscribe to the `qop::query_perf` target.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::StepPerf;

/// Table name reported when a query failed before its terms were read.
pub(crate) const UNKNOWN_TABLE: &str = "__UNKNOWN__";

/// Return current epoch time in microseconds (saturating).
pub(crate) fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

/// Everything we record about one finished query.
pub(crate) struct QueryStats {
    pub qid: String,
    pub table: String,
    pub rows: u32,
    pub time_ms: u32,
    pub chunks: usize,
    pub where_clause: String,
    pub select: String,
    pub post: String,
    pub time_span: u64,
    pub enq_delay_ms: u32,
    pub error: &'static str,
    pub chunk_where_time: String,
    pub chunk_select_time: String,
    pub chunk_postproc_time: String,
    pub chunk_merge_time: String,
    pub final_merge_ms: u32,
    pub redis_ms: u32,
}

impl QueryStats {
    pub fn report(&self) {
        tracing::info!(
            target: "qop::query_perf",
            qid = %self.qid,
            table = %self.table,
            rows = self.rows,
            time_ms = self.time_ms,
            chunks = self.chunks,
            where_clause = %self.where_clause,
            select = %self.select,
            post = %self.post,
            time_span = self.time_span,
            enq_delay_ms = self.enq_delay_ms,
            error = self.error,
            chunk_where_time = %self.chunk_where_time,
            chunk_select_time = %self.chunk_select_time,
            chunk_postproc_time = %self.chunk_postproc_time,
            chunk_merge_time = %self.chunk_merge_time,
            final_merge_ms = self.final_merge_ms,
            redis_ms = self.redis_ms,
            "query perf"
        );
    }
}

/// Perf record for a query that never reached the pipeline.
pub(crate) fn admission_failure(qid: &str, table: &str, error: &str, enq_delay_ms: u32) {
    tracing::info!(
        target: "qop::query_perf",
        %qid,
        %table,
        rows = 0u32,
        %error,
        enq_delay_ms,
        "query failed before pipeline start"
    );
}

/// Join per-worker sub-step timings the way the perf reports expect:
/// values comma-joined within a worker, workers separated by a space.
pub(crate) fn join_times(groups: &[Vec<u32>]) -> String {
    let mut out = String::new();
    for group in groups {
        for value in group {
            out.push_str(&value.to_string());
            out.push(',');
        }
        out.push(' ');
    }
    out
}

/// Split per-worker perf records into where/select/post timing strings.
pub(crate) fn perf_strings(perf: &[Vec<StepPerf>]) -> (String, String, String) {
    let pick = |f: fn(&StepPerf) -> u32| {
        perf.iter()
            .map(|group| group.iter().map(f).collect::<Vec<_>>())
            .collect::<Vec<_>>()
    };
    (
        join_times(&pick(|p| p.where_time_ms)),
        join_times(&pick(|p| p.select_time_ms)),
        join_times(&pick(|p| p.postproc_time_ms)),
    )
}
