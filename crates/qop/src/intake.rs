//! Admission: turn a qid popped from the work queue into a running
//! pipeline, or report why it cannot run.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error;
use crate::keys::{query_key, reply_key};
use crate::kv_client::{frame_error, frame_map, EphemeralKv, KvTarget};
use crate::pipeline::{self, PipelineInput};
use crate::publish::progress_json;
use crate::query::QueryParams;
use crate::registry::AdmitError;
use crate::report;
use crate::telemetry::{self, epoch_micros, UNKNOWN_TABLE};
use crate::ProxyShared;

/// Progress value published the moment a query is admitted.
const PROGRESS_ADMITTED: i32 = 15;

pub(crate) async fn admit(shared: Arc<ProxyShared>, endpoint: usize, qid: String) {
    let target = shared.kv_target(endpoint);
    let started = epoch_micros();

    let terms = match read_query_terms(&target, &qid).await {
        Ok(terms) => terms,
        Err(err) => {
            tracing::error!(%qid, error = %err, "cannot read query input");
            report::query_error(&target, &qid, error::EIO).await;
            telemetry::admission_failure(&qid, UNKNOWN_TABLE, "Could not read query input", 0);
            return;
        }
    };

    let qp = QueryParams {
        qid: qid.clone(),
        terms,
        max_tasks: shared.config.max_tasks,
        query_starttm: started,
    };
    let enq_delay_ms = (started.saturating_sub(qp.enqueue_time()) / 1000) as u32;

    let prepared = match shared.engine.prepare(&qp) {
        Ok(prepared) => prepared,
        Err(err) => {
            tracing::error!(%qid, code = err.code, "query prepare failed");
            report::query_error(&target, &qid, err.code).await;
            telemetry::admission_failure(&qid, &err.table, "Query Parsing Error", enq_delay_ms);
            return;
        }
    };
    tracing::info!(
        %qid,
        chunks = prepared.chunk_size.len(),
        need_merge = prepared.need_merge,
        "query prepared"
    );

    let admission = match shared.registry.try_admit(&qid, endpoint) {
        Ok(admission) => admission,
        Err(AdmitError::TooManyQueries) => {
            tracing::error!(
                %qid,
                active = shared.registry.active_queries(),
                "too many concurrent queries"
            );
            report::query_error(&target, &qid, error::EMFILE).await;
            telemetry::admission_failure(&qid, &prepared.table, "EMFILE", enq_delay_ms);
            return;
        }
        Err(AdmitError::AlreadyActive) => {
            tracing::warn!(%qid, "query already in flight; ignoring duplicate");
            return;
        }
    };

    let kv = shared.fleet.endpoints[admission.endpoint]
        .worker(admission.conn)
        .clone();
    tracing::debug!(%qid, conn = admission.conn, tasks = qp.max_tasks, "starting pipeline");
    kv.send_nowait(vec![
        "RPUSH".to_string(),
        reply_key(&qid),
        progress_json(PROGRESS_ADMITTED),
    ])
    .await;

    let input = PipelineInput::new(qp, prepared, admission, shared.config.max_rows, enq_delay_ms);
    tokio::spawn(pipeline::run(shared.clone(), input, kv));
}

/// Read the submitted terms over an ephemeral connection.
async fn read_query_terms(
    target: &KvTarget,
    qid: &str,
) -> anyhow::Result<HashMap<String, String>> {
    let mut kv = EphemeralKv::connect(target).await?;
    let reply = kv
        .command(vec!["HGETALL".to_string(), query_key(qid)])
        .await?;
    if let Some(err) = frame_error(&reply) {
        anyhow::bail!("HGETALL failed: {err}");
    }
    frame_map(&reply).ok_or_else(|| anyhow::anyhow!("unexpected HGETALL reply shape"))
}
