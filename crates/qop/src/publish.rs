//! Result publisher: schema-typed JSON rows, batched pushes onto the
//! per-query RESULT lists, progress records, and key expiration.

use serde_json::Value;

use crate::engine::QueryEngine;
use crate::keys::{engine_key, query_key, reply_key, result_key, QUERY_KEY_TTL_SECS};
use crate::kv_client::KvClient;
use crate::query::{OutRowMultimap, RowBuffer};
use crate::schema::{ColumnType, SchemaRegistry, TableSchema};
use crate::telemetry::epoch_micros;

/// A result batch closes once its cumulative row bytes reach this.
pub(crate) const MAX_ROW_THRESHOLD: usize = 10_000;

pub(crate) fn progress_json(value: i32) -> String {
    format!("{{\"progress\":{value}}}")
}

fn batch_progress_json(lines: u32) -> String {
    format!("{{\"progress\":90,\"lines\":{lines}}}")
}

fn terminal_progress_json(lines: u32, count: usize) -> String {
    format!("{{\"progress\":100,\"lines\":{lines},\"count\":{count}}}")
}

/// Per-chunk progress advance.
pub(crate) fn chunk_progress(chunk: u32, chunks: u32) -> i32 {
    (10 + (chunk * 75) / chunks) as i32
}

/// Serialize the final result to one JSON string per row. Map-output rows
/// are rendered by the engine; plain rows are typed against the table
/// schema. An empty table name produces no rows.
pub(crate) fn jsonify(
    engine: &dyn QueryEngine,
    schema: &SchemaRegistry,
    table: &str,
    map_output: bool,
    rows: &RowBuffer,
    map_rows: &OutRowMultimap,
) -> Vec<String> {
    if table.is_empty() {
        return Vec::new();
    }
    if map_output {
        map_rows
            .iter()
            .map(|(key, value)| engine.stats_row_json(table, key, value))
            .collect()
    } else {
        let schema = schema.resolve(table);
        rows.iter()
            .map(|row| {
                let mut out = serde_json::Map::new();
                for (name, value) in row {
                    out.insert(name.clone(), column_value(schema, table, name, value));
                }
                Value::Object(out).to_string()
            })
            .collect()
    }
}

/// Type one raw column value per the schema rules.
fn column_value(schema: &TableSchema, table: &str, name: &str, value: &str) -> Value {
    if name.starts_with("COUNT") {
        return Value::from(value.parse::<u64>().unwrap_or(0));
    }
    let Some(column) = schema.column(name) else {
        // Only a bad SELECT plan can emit a column outside the schema.
        panic!("column {name} is not in the schema for table {table}");
    };
    if value.is_empty() {
        return Value::Null;
    }
    match column.datatype {
        ColumnType::String | ColumnType::Uuid | ColumnType::IpAddr => Value::from(value.to_owned()),
        ColumnType::Double => Value::from(value.parse::<f64>().unwrap_or(0.0)),
        ColumnType::Unsigned => Value::from(value.parse::<u64>().unwrap_or(0)),
    }
}

/// Group rows into batches: rows are appended while the cumulative byte
/// length stays under the threshold.
fn batch_spans(rows: &[String], threshold: usize) -> Vec<std::ops::Range<usize>> {
    let mut spans = Vec::new();
    let mut idx = 0;
    while idx < rows.len() {
        let start = idx;
        let mut bytes = 0usize;
        while idx < rows.len() && bytes < threshold {
            bytes += rows[idx].len();
            idx += 1;
        }
        spans.push(start..idx);
    }
    spans
}

pub(crate) struct RespondStats {
    pub lines: u32,
    pub redis_ms: u32,
}

/// Stage-B KV sequence. Every command is awaited on the query's worker
/// connection and retried through disconnects, so a reconnect mid-publish
/// still lands every batch and exactly one terminal record.
pub(crate) async fn respond(
    kv: &KvClient,
    hostname: &str,
    qid: &str,
    outcome: Result<Vec<String>, i32>,
) -> RespondStats {
    let started = epoch_micros();
    let reply = reply_key(qid);
    let ttl = QUERY_KEY_TTL_SECS.to_string();
    let mut lines = 0u32;

    let terminal = match &outcome {
        Err(code) => progress_json(-code),
        Ok(rows) => {
            for span in batch_spans(rows, MAX_ROW_THRESHOLD) {
                let key = result_key(qid, lines);
                let mut push = vec!["RPUSH".to_string(), key.clone()];
                push.extend(rows[span].iter().cloned());
                kv.call_retry(push).await;
                kv.call_retry(vec!["EXPIRE".to_string(), key, ttl.clone()]).await;
                lines += 1;
                kv.call_retry(vec![
                    "RPUSH".to_string(),
                    reply.clone(),
                    batch_progress_json(lines),
                ])
                .await;
            }
            terminal_progress_json(lines, rows.len())
        }
    };
    tracing::debug!(%qid, %terminal, "query result status");
    kv.call_retry(vec!["RPUSH".to_string(), reply.clone(), terminal])
        .await;
    let redis_ms = (epoch_micros().saturating_sub(started) / 1000) as u32;

    kv.call_retry(vec!["EXPIRE".to_string(), reply, ttl.clone()])
        .await;
    kv.call_retry(vec!["EXPIRE".to_string(), query_key(qid), ttl])
        .await;
    kv.call_retry(vec![
        "LREM".to_string(),
        engine_key(hostname),
        "0".to_string(),
        qid.to_string(),
    ])
    .await;

    RespondStats { lines, redis_ms }
}
