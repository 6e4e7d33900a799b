//! Query orchestrator proxy.
//!
//! Operators submit analytics queries by pushing a query id onto a shared
//! work queue in an external key/value store. This crate pulls those ids
//! over a dedicated control connection per KV endpoint, loads the query
//! terms, drives the query through a chunked two-stage pipeline against an
//! externally supplied [`QueryEngine`], and streams progress and result
//! rows back into the KV for the submitter.
//!
//! The embedding process owns the runtime, the engine, and configuration;
//! call [`QueryProxy::start`] from within a Tokio runtime. Connections live
//! for the process lifetime and reconnect on their own.

mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod fleet;
mod intake;
mod keys;
mod kv_client;
mod pipeline;
mod publish;
pub mod query;
pub mod registry;
mod report;
pub mod schema;
mod telemetry;
mod tls;

use std::sync::Arc;

use tokio::sync::watch;

pub use config::{Config, KvEndpoint, TlsPaths};
pub use engine::{PrepareError, QueryEngine, StepPerf};
pub use fleet::{HealthStatus, WORKER_CONNECTIONS};
pub use kv_client::{ConnState, KvClient, KvTarget};
pub use query::{
    ChunkPartial, MapRow, OutRow, OutRowMultimap, PreparedQuery, QueryParams, RowBuffer,
    WhereResult,
};
pub use registry::SubQueryHandle;
pub use schema::{Column, ColumnType, SchemaRegistry, TableSchema};

use fleet::Fleet;
use registry::Registry;

/// Concurrent-pipeline cap across all endpoints.
pub const MAX_PIPELINES: usize = 32;

pub(crate) struct ProxyShared {
    pub config: Config,
    pub engine: Arc<dyn QueryEngine>,
    pub schema: SchemaRegistry,
    pub registry: Registry,
    pub fleet: Fleet,
    pub tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
}

impl ProxyShared {
    /// Target for ephemeral connections to one endpoint.
    pub fn kv_target(&self, endpoint: usize) -> KvTarget {
        let ep = &self.config.endpoints[endpoint];
        KvTarget {
            host: ep.host.clone(),
            port: ep.port,
            password: self.config.password.clone(),
            tls: self.tls.clone(),
        }
    }
}

/// Handle to a running proxy.
pub struct QueryProxy {
    shared: Arc<ProxyShared>,
}

impl QueryProxy {
    /// Connect the fleet and start pulling queries. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        config: Config,
        engine: Arc<dyn QueryEngine>,
        schema: SchemaRegistry,
    ) -> anyhow::Result<QueryProxy> {
        anyhow::ensure!(
            !config.endpoints.is_empty(),
            "at least one KV endpoint is required"
        );
        let tls = config.tls.as_ref().map(tls::client_config).transpose()?;
        let fleet = Fleet::connect(&config, tls.clone());
        let registry = Registry::new(config.endpoints.len(), MAX_PIPELINES);
        let shared = Arc::new(ProxyShared {
            config,
            engine,
            schema,
            registry,
            fleet,
            tls,
        });
        for endpoint in 0..shared.config.endpoints.len() {
            tokio::spawn(fleet::control_loop(shared.clone(), endpoint));
        }
        tracing::info!(
            endpoints = shared.config.endpoints.len(),
            max_tasks = shared.config.max_tasks,
            max_rows = shared.config.max_rows,
            hostname = %shared.config.hostname,
            "query proxy started"
        );
        Ok(QueryProxy { shared })
    }

    /// Aggregate connection health, updated on every transition.
    pub fn health(&self) -> watch::Receiver<HealthStatus> {
        self.shared.fleet.health()
    }

    /// Number of pipelines currently in flight.
    pub fn active_queries(&self) -> usize {
        self.shared.registry.active_queries()
    }

    /// Per-worker-connection load for one endpoint.
    pub fn endpoint_loads(&self, endpoint: usize) -> [u32; WORKER_CONNECTIONS] {
        self.shared.registry.endpoint_loads(endpoint)
    }

    /// Park an engine-owned sub-query handle on an active query; it is
    /// released when the query completes. Returns false when the query is
    /// not in flight.
    pub fn attach_subquery(&self, qid: &str, handle: SubQueryHandle) -> bool {
        self.shared.registry.attach_subquery(qid, handle)
    }
}
