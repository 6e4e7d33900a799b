//! Two-stage pipeline scheduler.
//!
//! Stage A fans the query's chunks out over `max_tasks` worker tasks that
//! share an atomic chunk cursor and row counter, each folding its chunks
//! into a private accumulator. After all workers finish, the chunk merger
//! combines the accumulators (detecting row-budget overflow), and Stage B
//! serializes, publishes, expires, and completes the query on its assigned
//! worker connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::chunk;
use crate::engine::{QueryEngine, StepPerf};
use crate::error;
use crate::keys::reply_key;
use crate::kv_client::KvClient;
use crate::publish::{self, chunk_progress, progress_json};
use crate::query::{ChunkPartial, OutRowMultimap, PreparedQuery, QueryParams, RowBuffer};
use crate::registry::Admission;
use crate::telemetry::{self, epoch_micros, QueryStats};
use crate::ProxyShared;

/// Everything a pipeline needs, fixed at admission.
pub(crate) struct PipelineInput {
    pub qp: QueryParams,
    pub prepared: PreparedQuery,
    pub admission: Admission,
    pub max_rows: u32,
    pub enq_delay_ms: u32,
    /// Next chunk to dispatch.
    chunk_cursor: AtomicU32,
    /// Rows accepted so far across all workers.
    total_rows: AtomicU32,
}

impl PipelineInput {
    pub fn new(
        qp: QueryParams,
        prepared: PreparedQuery,
        admission: Admission,
        max_rows: u32,
        enq_delay_ms: u32,
    ) -> Self {
        Self {
            qp,
            prepared,
            admission,
            max_rows,
            enq_delay_ms,
            chunk_cursor: AtomicU32::new(0),
            total_rows: AtomicU32::new(0),
        }
    }
}

/// One Stage-A worker's accumulated output.
struct StageAOut {
    ret_ok: bool,
    perf: Vec<StepPerf>,
    chunk_merge_ms: Vec<u32>,
    rows: RowBuffer,
    map_rows: OutRowMultimap,
}

impl StageAOut {
    fn new() -> Self {
        Self {
            ret_ok: true,
            perf: Vec::new(),
            chunk_merge_ms: Vec::new(),
            rows: RowBuffer::new(),
            map_rows: OutRowMultimap::new(),
        }
    }

    fn failed() -> Self {
        Self {
            ret_ok: false,
            ..Self::new()
        }
    }
}

/// Output of the chunk merger.
struct MergedResult {
    ret_ok: bool,
    overflow: bool,
    fm_ms: u32,
    rows: RowBuffer,
    map_rows: OutRowMultimap,
    perf: Vec<Vec<StepPerf>>,
    chunk_merge_ms: Vec<Vec<u32>>,
}

pub(crate) async fn run(shared: Arc<ProxyShared>, input: PipelineInput, kv: KvClient) {
    let input = Arc::new(input);
    let workers = input.qp.max_tasks.max(1);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        handles.push(tokio::spawn(stage_a_worker(
            shared.clone(),
            input.clone(),
            kv.clone(),
        )));
    }
    let mut outs = Vec::with_capacity(workers);
    for handle in handles {
        match handle.await {
            Ok(out) => outs.push(out),
            // A panicked worker loses its partial; the query fails.
            Err(_) => outs.push(StageAOut::failed()),
        }
    }

    let merged = merge_outputs(shared.engine.as_ref(), &input, outs);

    let map_output = input.prepared.map_output;
    let out_rows = if map_output {
        merged.map_rows.len()
    } else {
        merged.rows.len()
    };
    let outcome = if merged.overflow {
        Err(error::ENOBUFS)
    } else if !merged.ret_ok {
        Err(error::EIO)
    } else {
        Ok(publish::jsonify(
            shared.engine.as_ref(),
            &shared.schema,
            &input.prepared.table,
            map_output,
            &merged.rows,
            &merged.map_rows,
        ))
    };
    let error_label = match &outcome {
        Err(code) if *code == error::ENOBUFS => "ERROR-ENOBUFS",
        Err(_) => "ERROR-EIO",
        Ok(_) => "None",
    };

    let published = publish::respond(&kv, &shared.config.hostname, &input.qp.qid, outcome).await;

    let time_ms = (epoch_micros().saturating_sub(input.qp.query_starttm) / 1000) as u32;
    let (chunk_where_time, chunk_select_time, chunk_postproc_time) =
        telemetry::perf_strings(&merged.perf);
    QueryStats {
        qid: input.qp.qid.clone(),
        table: input.prepared.table.clone(),
        rows: out_rows as u32,
        time_ms,
        chunks: input.prepared.chunk_size.len(),
        where_clause: input.prepared.where_clause.clone(),
        select: input.prepared.select.clone(),
        post: input.prepared.post.clone(),
        time_span: input.prepared.time_period,
        enq_delay_ms: input.enq_delay_ms,
        error: error_label,
        chunk_where_time,
        chunk_select_time,
        chunk_postproc_time,
        chunk_merge_time: telemetry::join_times(&merged.chunk_merge_ms),
        final_merge_ms: merged.fm_ms,
        redis_ms: published.redis_ms,
    }
    .report();
    tracing::info!(
        qid = %input.qp.qid,
        table = %input.prepared.table,
        time_ms,
        redis_ms = published.redis_ms,
        merge_ms = merged.fm_ms,
        rows = out_rows,
        enq_delay_ms = input.enq_delay_ms,
        "finished query"
    );

    shared.registry.complete(&input.qp.qid);
}

/// Claim chunks until the cursor runs out, the row budget trips, or an
/// engine step fails.
async fn stage_a_worker(
    shared: Arc<ProxyShared>,
    input: Arc<PipelineInput>,
    kv: KvClient,
) -> StageAOut {
    let engine = shared.engine.as_ref();
    let chunks = input.prepared.chunk_size.len() as u32;
    let mut out = StageAOut::new();
    loop {
        let chunk = input.chunk_cursor.fetch_add(1, Ordering::Relaxed);
        if chunk >= chunks {
            break;
        }
        kv.send_nowait(vec![
            "RPUSH".to_string(),
            reply_key(&input.qp.qid),
            progress_json(chunk_progress(chunk, chunks)),
        ])
        .await;

        let partial = match chunk::execute(
            engine,
            &input.qp,
            chunk,
            input.prepared.wterms,
            &mut out.perf,
        )
        .await
        {
            Ok(partial) => partial,
            Err(step) => {
                tracing::warn!(qid = %input.qp.qid, chunk, %step, "query engine step failed");
                out.ret_ok = false;
                break;
            }
        };

        let added = merge_chunk(engine, &input, partial, &mut out);
        if !out.ret_ok {
            break;
        }
        let prev = input.total_rows.fetch_add(added, Ordering::Relaxed);
        if prev > input.max_rows {
            tracing::warn!(
                qid = %input.qp.qid,
                rows = prev + added,
                max_rows = input.max_rows,
                "query row budget exceeded"
            );
            break;
        }
    }
    out
}

/// Fold one chunk partial into the worker accumulator and return the row
/// delta it contributed.
fn merge_chunk(
    engine: &dyn QueryEngine,
    input: &PipelineInput,
    partial: ChunkPartial,
    out: &mut StageAOut,
) -> u32 {
    if input.prepared.need_merge {
        let started = epoch_micros();
        let added = match partial {
            ChunkPartial::Map(chunk) => {
                let base = out.map_rows.len();
                engine.stats_merge(&input.prepared.table, chunk, &mut out.map_rows);
                out.map_rows.len() - base
            }
            ChunkPartial::Rows(chunk) => {
                let base = out.rows.len();
                if !engine.accumulate(&input.qp, chunk, &mut out.rows) {
                    out.ret_ok = false;
                }
                out.rows.len() - base
            }
        };
        out.chunk_merge_ms
            .push((epoch_micros().saturating_sub(started) / 1000) as u32);
        added as u32
    } else {
        // Unmerged mode: take the chunk as-is; output order is free.
        match partial {
            ChunkPartial::Map(mut chunk) => {
                let added = chunk.len();
                out.map_rows.append(&mut chunk);
                added as u32
            }
            ChunkPartial::Rows(mut chunk) => {
                let added = chunk.len();
                out.rows.append(&mut chunk);
                added as u32
            }
        }
    }
}

/// Chunk merger: combine all workers' accumulators into the final result,
/// short-circuiting on row-budget overflow or a failed worker.
fn merge_outputs(
    engine: &dyn QueryEngine,
    input: &PipelineInput,
    outs: Vec<StageAOut>,
) -> MergedResult {
    let map_output = input.prepared.map_output;
    let mut merged = MergedResult {
        ret_ok: true,
        overflow: false,
        fm_ms: 0,
        rows: RowBuffer::new(),
        map_rows: OutRowMultimap::new(),
        perf: Vec::new(),
        chunk_merge_ms: Vec::new(),
    };

    let total: usize = outs
        .iter()
        .map(|out| {
            if map_output {
                out.map_rows.len()
            } else {
                out.rows.len()
            }
        })
        .sum();
    if total as u64 > u64::from(input.max_rows) {
        merged.overflow = true;
        return merged;
    }

    let mut row_parts = Vec::new();
    let mut map_parts = Vec::new();
    for out in outs {
        merged.perf.push(out.perf);
        merged.chunk_merge_ms.push(out.chunk_merge_ms);
        if !out.ret_ok {
            merged.ret_ok = false;
        } else if map_output {
            map_parts.push(out.map_rows);
        } else {
            row_parts.push(out.rows);
        }
    }
    if !merged.ret_ok {
        return merged;
    }

    if input.prepared.need_merge {
        let started = epoch_micros();
        let ok = if map_output {
            engine.final_merge_map(&input.qp, map_parts, &mut merged.map_rows)
        } else {
            engine.final_merge_rows(&input.qp, row_parts, &mut merged.rows)
        };
        if !ok {
            merged.ret_ok = false;
        }
        merged.fm_ms = (epoch_micros().saturating_sub(started) / 1000) as u32;
    } else {
        for mut part in row_parts {
            merged.rows.append(&mut part);
        }
        for mut part in map_parts {
            merged.map_rows.append(&mut part);
        }
    }
    merged
}
