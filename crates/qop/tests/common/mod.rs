//! Shared helpers for integration tests: an in-process KV server speaking
//! RESP2, a scriptable query engine, and a proxy harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio_util::codec::Framed;

use qop::{
    ChunkPartial, Config, KvEndpoint, OutRow, OutRowMultimap, PrepareError, PreparedQuery,
    QueryEngine, QueryParams, QueryProxy, RowBuffer, SchemaRegistry, StepPerf, WhereResult,
};

pub const TEST_HOSTNAME: &str = "qe-test";

/// Default deadline for progress to show up.
pub const WAIT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Mock KV server

#[derive(Default)]
struct KvData {
    lists: HashMap<String, Vec<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    expires: HashMap<String, u64>,
}

/// Shared state behind the mock server; tests read and seed it directly.
pub struct KvState {
    data: Mutex<KvData>,
    queue_notify: Notify,
    kill_epoch: AtomicU64,
    sever_on_push: Mutex<Option<String>>,
    password: Option<String>,
}

impl KvState {
    fn new(password: Option<&str>) -> Self {
        Self {
            data: Mutex::new(KvData::default()),
            queue_notify: Notify::new(),
            kill_epoch: AtomicU64::new(0),
            sever_on_push: Mutex::new(None),
            password: password.map(str::to_string),
        }
    }

    fn killed_since(&self, epoch: u64) -> bool {
        self.kill_epoch.load(Ordering::Relaxed) > epoch
    }

    /// Store the query hash and push the qid onto the work queue (at the
    /// head, so the oldest submission pops first).
    pub fn submit_query(&self, qid: &str, terms: &[(&str, &str)]) {
        {
            let mut data = self.data.lock().unwrap();
            data.hashes.insert(
                format!("QUERY:{qid}"),
                terms
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            );
            data.lists
                .entry("QUERYQ".to_string())
                .or_default()
                .insert(0, qid.to_string());
        }
        self.queue_notify.notify_waiters();
    }

    pub fn list(&self, key: &str) -> Vec<String> {
        self.data
            .lock()
            .unwrap()
            .lists
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn expire_secs(&self, key: &str) -> Option<u64> {
        self.data.lock().unwrap().expires.get(key).copied()
    }

    pub fn engine_list(&self, hostname: &str) -> Vec<String> {
        self.list(&format!("ENGINE:{hostname}"))
    }

    /// Parsed records on `REPLY:<qid>`, in push order.
    pub fn reply_records(&self, qid: &str) -> Vec<serde_json::Value> {
        self.list(&format!("REPLY:{qid}"))
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("reply record is json"))
            .collect()
    }

    /// Number of RESULT batch keys for `qid`.
    pub fn result_batches(&self, qid: &str) -> usize {
        let data = self.data.lock().unwrap();
        (0..)
            .take_while(|n| data.lists.contains_key(&format!("RESULT:{qid}:{n}")))
            .count()
    }

    /// Concatenation of all RESULT batches for `qid`, parsed.
    pub fn result_rows(&self, qid: &str) -> Vec<serde_json::Value> {
        let mut rows = Vec::new();
        for n in 0..self.result_batches(qid) {
            for raw in self.list(&format!("RESULT:{qid}:{n}")) {
                rows.push(serde_json::from_str(&raw).expect("result row is json"));
            }
        }
        rows
    }

    /// Arm the connection killer: once a pushed value contains `needle`,
    /// the server drops every connection (after acknowledging that push).
    pub fn sever_when_pushed(&self, needle: &str) {
        *self.sever_on_push.lock().unwrap() = Some(needle.to_string());
    }

    /// Drop every connection now.
    pub fn kill_connections(&self) {
        self.kill_epoch.fetch_add(1, Ordering::Relaxed);
        self.queue_notify.notify_waiters();
    }
}

pub struct MockKv {
    pub addr: SocketAddr,
    pub state: Arc<KvState>,
}

impl MockKv {
    pub async fn start() -> MockKv {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<&str>) -> MockKv {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock kv");
        let addr = listener.local_addr().expect("mock kv addr");
        let state = Arc::new(KvState::new(password));
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_conn(socket, state).await;
                });
            }
        });
        MockKv { addr, state }
    }
}

async fn handle_conn(socket: TcpStream, state: Arc<KvState>) -> anyhow::Result<()> {
    let epoch = state.kill_epoch.load(Ordering::Relaxed);
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        if state.killed_since(epoch) {
            return Ok(());
        }
        let args = match parse_args(&frame) {
            Some(args) if !args.is_empty() => args,
            _ => {
                framed
                    .send(BytesFrame::Error("ERR bad command".to_string().into()))
                    .await?;
                continue;
            }
        };
        // None means the connection was killed while blocking.
        let Some((reply, sever)) = execute(&state, &args, epoch).await else {
            return Ok(());
        };
        framed.send(reply).await?;
        if sever {
            state.kill_connections();
            return Ok(());
        }
    }
    Ok(())
}

async fn execute(
    state: &Arc<KvState>,
    args: &[String],
    epoch: u64,
) -> Option<(BytesFrame, bool)> {
    let cmd = args[0].to_ascii_uppercase();
    let reply = match cmd.as_str() {
        "PING" => (simple("PONG"), false),
        "AUTH" => {
            if state.password.as_deref() == args.get(1).map(String::as_str) {
                (simple("OK"), false)
            } else {
                (
                    BytesFrame::Error("ERR invalid password".to_string().into()),
                    false,
                )
            }
        }
        "RPUSH" => {
            let mut sever = false;
            let len = {
                let pattern = state.sever_on_push.lock().unwrap().clone();
                let mut data = state.data.lock().unwrap();
                let list = data.lists.entry(args[1].clone()).or_default();
                for value in &args[2..] {
                    if let Some(needle) = &pattern {
                        if value.contains(needle.as_str()) {
                            sever = true;
                        }
                    }
                    list.push(value.clone());
                }
                list.len()
            };
            if sever {
                state.sever_on_push.lock().unwrap().take();
            }
            (BytesFrame::Integer(len as i64), sever)
        }
        "HGETALL" => {
            let data = state.data.lock().unwrap();
            let mut items = Vec::new();
            if let Some(hash) = data.hashes.get(&args[1]) {
                for (k, v) in hash {
                    items.push(bulk(k));
                    items.push(bulk(v));
                }
            }
            (BytesFrame::Array(items), false)
        }
        "EXPIRE" => {
            let secs = args[2].parse::<u64>().unwrap_or(0);
            state
                .data
                .lock()
                .unwrap()
                .expires
                .insert(args[1].clone(), secs);
            (BytesFrame::Integer(1), false)
        }
        "LREM" => {
            let mut data = state.data.lock().unwrap();
            let removed = match data.lists.get_mut(&args[1]) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|v| *v != args[3]);
                    before - list.len()
                }
                None => 0,
            };
            (BytesFrame::Integer(removed as i64), false)
        }
        "BRPOPLPUSH" => loop {
            if state.killed_since(epoch) {
                return None;
            }
            {
                let mut data = state.data.lock().unwrap();
                let popped = data
                    .lists
                    .get_mut(&args[1])
                    .and_then(|list| list.pop());
                if let Some(value) = popped {
                    data.lists
                        .entry(args[2].clone())
                        .or_default()
                        .insert(0, value.clone());
                    break (bulk(&value), false);
                }
            }
            let _ = tokio::time::timeout(
                Duration::from_millis(20),
                state.queue_notify.notified(),
            )
            .await;
        },
        other => (
            BytesFrame::Error(format!("ERR unknown command {other}").into()),
            false,
        ),
    };
    Some(reply)
}

fn simple(s: &str) -> BytesFrame {
    BytesFrame::SimpleString(Bytes::copy_from_slice(s.as_bytes()))
}

fn bulk(s: &str) -> BytesFrame {
    BytesFrame::BulkString(Bytes::copy_from_slice(s.as_bytes()))
}

fn frame_text(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            Some(String::from_utf8_lossy(b).into_owned())
        }
        _ => None,
    }
}

fn parse_args(frame: &BytesFrame) -> Option<Vec<String>> {
    let BytesFrame::Array(items) = frame else {
        return None;
    };
    items.iter().map(frame_text).collect()
}

// ---------------------------------------------------------------------------
// Mock query engine

/// Scripted behavior for one query (or the fallback for all queries).
#[derive(Clone)]
pub struct QueryScript {
    pub chunk_size: Vec<u64>,
    pub wterms: u32,
    pub need_merge: bool,
    pub map_output: bool,
    pub table: String,
    /// Rows the SELECT step emits per chunk (plain mode).
    pub rows_per_chunk: Vec<RowBuffer>,
    /// Entries the SELECT step emits per chunk (map mode).
    pub map_per_chunk: Vec<OutRowMultimap>,
    /// Fail the WHERE sub-step `(chunk, term)`.
    pub fail_where: Option<(u32, u32)>,
    /// Reject the query at prepare time with this code.
    pub prepare_code: Option<i32>,
}

impl Default for QueryScript {
    fn default() -> Self {
        Self {
            chunk_size: vec![100],
            wterms: 1,
            need_merge: true,
            map_output: false,
            table: "FlowSeriesTable".to_string(),
            rows_per_chunk: Vec::new(),
            map_per_chunk: Vec::new(),
            fail_where: None,
            prepare_code: None,
        }
    }
}

/// Build a result row from column/value pairs.
pub fn row(cols: &[(&str, &str)]) -> OutRow {
    cols.iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub struct MockEngine {
    scripts: Mutex<HashMap<String, QueryScript>>,
    fallback: Mutex<QueryScript>,
    gate: Semaphore,
    gated: AtomicBool,
}

impl MockEngine {
    pub fn new() -> Arc<MockEngine> {
        Arc::new(MockEngine {
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(QueryScript::default()),
            gate: Semaphore::new(0),
            gated: AtomicBool::new(false),
        })
    }

    pub fn script_for(&self, qid: &str, script: QueryScript) {
        self.scripts.lock().unwrap().insert(qid.to_string(), script);
    }

    pub fn set_fallback(&self, script: QueryScript) {
        *self.fallback.lock().unwrap() = script;
    }

    fn lookup(&self, qid: &str) -> QueryScript {
        self.scripts
            .lock()
            .unwrap()
            .get(qid)
            .cloned()
            .unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }

    /// Make every WHERE sub-step block until a permit is released.
    pub fn gate_where_steps(&self) {
        self.gated.store(true, Ordering::Relaxed);
    }

    pub fn release_where_steps(&self, permits: usize) {
        self.gate.add_permits(permits);
    }
}

#[async_trait]
impl QueryEngine for MockEngine {
    fn prepare(&self, qp: &QueryParams) -> Result<PreparedQuery, PrepareError> {
        let script = self.lookup(&qp.qid);
        if let Some(code) = script.prepare_code {
            return Err(PrepareError {
                code,
                table: script.table.clone(),
            });
        }
        Ok(PreparedQuery {
            chunk_size: script.chunk_size.clone(),
            need_merge: script.need_merge,
            map_output: script.map_output,
            where_clause: "(sourcevn=*)".to_string(),
            wterms: script.wterms,
            select: "sourcevn,bytes".to_string(),
            post: "none".to_string(),
            time_period: 600,
            table: script.table.clone(),
        })
    }

    async fn execute_where(
        &self,
        qp: &QueryParams,
        chunk: u32,
        term: u32,
    ) -> (StepPerf, WhereResult) {
        if self.gated.load(Ordering::Relaxed) {
            self.gate.acquire().await.expect("gate closed").forget();
        }
        let script = self.lookup(&qp.qid);
        if script.fail_where == Some((chunk, term)) {
            return (
                StepPerf {
                    error: true,
                    ..StepPerf::default()
                },
                WhereResult::new(),
            );
        }
        let matches = (0..5u64).map(|i| u64::from(chunk) * 100 + i).collect();
        (
            StepPerf {
                where_time_ms: 1,
                ..StepPerf::default()
            },
            matches,
        )
    }

    async fn execute_select(
        &self,
        qp: &QueryParams,
        chunk: u32,
        _matches: WhereResult,
    ) -> (StepPerf, ChunkPartial) {
        let script = self.lookup(&qp.qid);
        let partial = if script.map_output {
            ChunkPartial::Map(
                script
                    .map_per_chunk
                    .get(chunk as usize)
                    .cloned()
                    .unwrap_or_default(),
            )
        } else {
            ChunkPartial::Rows(
                script
                    .rows_per_chunk
                    .get(chunk as usize)
                    .cloned()
                    .unwrap_or_default(),
            )
        };
        (
            StepPerf {
                select_time_ms: 1,
                ..StepPerf::default()
            },
            partial,
        )
    }

    fn set_union(&self, terms: Vec<WhereResult>) -> WhereResult {
        terms.into_iter().flatten().collect()
    }

    fn accumulate(&self, _qp: &QueryParams, chunk: RowBuffer, acc: &mut RowBuffer) -> bool {
        acc.extend(chunk);
        true
    }

    fn stats_merge(&self, _table: &str, chunk: OutRowMultimap, acc: &mut OutRowMultimap) {
        for (key, value) in chunk {
            if !acc.iter().any(|(k, _)| *k == key) {
                acc.push((key, value));
            }
        }
    }

    fn final_merge_rows(
        &self,
        _qp: &QueryParams,
        parts: Vec<RowBuffer>,
        out: &mut RowBuffer,
    ) -> bool {
        for part in parts {
            out.extend(part);
        }
        true
    }

    fn final_merge_map(
        &self,
        _qp: &QueryParams,
        parts: Vec<OutRowMultimap>,
        out: &mut OutRowMultimap,
    ) -> bool {
        for part in parts {
            for (key, value) in part {
                if !out.iter().any(|(k, _)| *k == key) {
                    out.push((key, value));
                }
            }
        }
        true
    }

    fn stats_row_json(&self, _table: &str, key: &str, value: &serde_json::Value) -> String {
        serde_json::json!({ "name": key, "value": value }).to_string()
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct TestProxy {
    pub kv: MockKv,
    pub engine: Arc<MockEngine>,
    pub proxy: QueryProxy,
}

pub async fn start_proxy(max_tasks: usize, max_rows: u32) -> TestProxy {
    start_proxy_with_password(max_tasks, max_rows, None).await
}

pub async fn start_proxy_with_password(
    max_tasks: usize,
    max_rows: u32,
    password: Option<&str>,
) -> TestProxy {
    init_tracing();
    let kv = MockKv::start_with_password(password).await;
    let engine = MockEngine::new();
    let config = Config {
        endpoints: vec![KvEndpoint {
            host: "127.0.0.1".to_string(),
            port: kv.addr.port(),
        }],
        password: password.map(str::to_string),
        tls: None,
        max_tasks,
        max_rows,
        hostname: TEST_HOSTNAME.to_string(),
    };
    let engine_dyn: Arc<dyn QueryEngine> = engine.clone();
    let proxy =
        QueryProxy::start(config, engine_dyn, SchemaRegistry::default()).expect("start proxy");
    TestProxy { kv, engine, proxy }
}

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` every 10ms until it passes or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// The terminal record for `qid`, if one has been pushed.
pub fn find_terminal(state: &KvState, qid: &str) -> Option<serde_json::Value> {
    state.reply_records(qid).into_iter().find(|record| {
        let progress = record["progress"].as_i64().unwrap_or(0);
        progress == 100 || progress < 0
    })
}

/// Wait for the terminal progress record of `qid`.
pub async fn wait_for_terminal(
    state: &KvState,
    qid: &str,
    timeout: Duration,
) -> serde_json::Value {
    let mut terminal = None;
    wait_until(timeout, || {
        terminal = find_terminal(state, qid);
        terminal.is_some()
    })
    .await;
    match terminal {
        Some(terminal) => terminal,
        None => panic!(
            "no terminal progress for {qid}; reply list: {:?}",
            state.list(&format!("REPLY:{qid}"))
        ),
    }
}
