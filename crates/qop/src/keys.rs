//! KV key builders for the query protocol.

/// Global incoming work queue shared by all proxies.
pub const QUERY_QUEUE: &str = "QUERYQ";

/// TTL applied to per-query keys once the query reaches its terminal state.
pub const QUERY_KEY_TTL_SECS: u32 = 300;

/// Per-host in-progress list, fed atomically by `BRPOPLPUSH`.
pub fn engine_key(hostname: &str) -> String {
    format!("ENGINE:{hostname}")
}

/// Hash holding the submitted query terms.
pub fn query_key(qid: &str) -> String {
    format!("QUERY:{qid}")
}

/// Progress stream list for one query.
pub fn reply_key(qid: &str) -> String {
    format!("REPLY:{qid}")
}

/// Result-row batch list `n` for one query.
pub fn result_key(qid: &str, batch: u32) -> String {
    format!("RESULT:{qid}:{batch}")
}
