//! Out-of-band error reporting for queries that never reached a pipeline.

use crate::keys::reply_key;
use crate::kv_client::{frame_error, EphemeralKv, KvTarget};
use crate::publish::progress_json;

/// Push `{"progress":-code}` onto the query's reply list over an ephemeral
/// connection. There is no pipeline to reschedule, so our own KV failures
/// are logged and swallowed.
pub(crate) async fn query_error(target: &KvTarget, qid: &str, code: i32) {
    let record = progress_json(-code);
    let mut kv = match EphemeralKv::connect(target).await {
        Ok(kv) => kv,
        Err(err) => {
            tracing::error!(%qid, error = %err, "cannot report query error; no kv connection");
            return;
        }
    };
    match kv
        .command(vec!["RPUSH".to_string(), reply_key(qid), record])
        .await
    {
        Ok(reply) => {
            if let Some(err) = frame_error(&reply) {
                tracing::error!(%qid, error = %err, "kv rejected query error report");
            }
        }
        Err(err) => {
            tracing::error!(%qid, error = %err, "cannot report query error");
        }
    }
}
