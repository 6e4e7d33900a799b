//! Connection fleet: per KV endpoint, one control connection dedicated to
//! pulling work plus a fixed set of worker connections multiplexed across
//! in-flight queries. Also aggregates connection health.

use std::sync::Arc;

use tokio::sync::{watch, Notify};

use crate::config::Config;
use crate::intake;
use crate::keys::{engine_key, QUERY_QUEUE};
use crate::kv_client::{frame_error, frame_string, ConnState, KvClient, KvTarget};
use crate::ProxyShared;

/// Worker connections per endpoint. The control connection is extra and
/// never hosts a pipeline.
pub const WORKER_CONNECTIONS: usize = 4;

/// All connections to one KV endpoint.
pub struct EndpointConns {
    pub label: String,
    pub control: KvClient,
    pub workers: Vec<KvClient>,
}

impl EndpointConns {
    fn all(&self) -> impl Iterator<Item = &KvClient> {
        std::iter::once(&self.control).chain(self.workers.iter())
    }

    pub fn worker(&self, conn: usize) -> &KvClient {
        &self.workers[conn]
    }
}

/// Aggregate connection health, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// At least one endpoint is reachable; lists any that are not.
    Up { down_endpoints: Vec<String> },
    /// Every endpoint is down.
    Down,
}

pub struct Fleet {
    pub endpoints: Vec<EndpointConns>,
    health_rx: watch::Receiver<HealthStatus>,
}

impl Fleet {
    /// Spawn the connection tasks for every configured endpoint and the
    /// health aggregation task. Control loops are armed separately once the
    /// shared proxy context exists.
    pub fn connect(config: &Config, tls: Option<Arc<tokio_rustls::rustls::ClientConfig>>) -> Fleet {
        let state_notify = Arc::new(Notify::new());
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        for endpoint in &config.endpoints {
            let target = KvTarget {
                host: endpoint.host.clone(),
                port: endpoint.port,
                password: config.password.clone(),
                tls: tls.clone(),
            };
            let control = KvClient::spawn(target.clone(), state_notify.clone());
            let workers = (0..WORKER_CONNECTIONS)
                .map(|_| KvClient::spawn(target.clone(), state_notify.clone()))
                .collect();
            endpoints.push(EndpointConns {
                label: endpoint.to_string(),
                control,
                workers,
            });
        }

        let (health_tx, health_rx) = watch::channel(HealthStatus::Down);
        let watched: Vec<(String, Vec<KvClient>)> = endpoints
            .iter()
            .map(|ep| (ep.label.clone(), ep.all().cloned().collect()))
            .collect();
        tokio::spawn(health_task(watched, state_notify, health_tx));

        Fleet {
            endpoints,
            health_rx,
        }
    }

    pub fn health(&self) -> watch::Receiver<HealthStatus> {
        self.health_rx.clone()
    }
}

fn aggregate(endpoints: &[(String, Vec<KvClient>)]) -> HealthStatus {
    let mut down_endpoints = Vec::new();
    for (label, conns) in endpoints {
        // An endpoint counts as down until at least one of its connections
        // has authenticated.
        if conns.iter().all(|c| c.state() != ConnState::Ready) {
            down_endpoints.push(label.clone());
        }
    }
    if down_endpoints.len() == endpoints.len() {
        HealthStatus::Down
    } else {
        HealthStatus::Up { down_endpoints }
    }
}

async fn health_task(
    endpoints: Vec<(String, Vec<KvClient>)>,
    state_notify: Arc<Notify>,
    health_tx: watch::Sender<HealthStatus>,
) {
    loop {
        state_notify.notified().await;
        let status = aggregate(&endpoints);
        health_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            tracing::info!(status = ?status, "kv connection status changed");
            *current = status;
            true
        });
    }
}

/// Control loop for one endpoint: once every connection is ready, keep one
/// blocking pop outstanding against the global work queue and hand each
/// payload to admission.
pub(crate) async fn control_loop(shared: Arc<ProxyShared>, endpoint: usize) {
    let take_work = vec![
        "BRPOPLPUSH".to_string(),
        QUERY_QUEUE.to_string(),
        engine_key(&shared.config.hostname),
        "0".to_string(),
    ];
    loop {
        {
            let conns = &shared.fleet.endpoints[endpoint];
            // The queue is armed only when the whole endpoint is usable, so
            // an admitted query always has worker connections to run on.
            for conn in conns.all() {
                conn.ready().await;
            }
        }
        let reply = shared.fleet.endpoints[endpoint]
            .control
            .call(take_work.clone())
            .await;
        match reply {
            Some(frame) => {
                if let Some(err) = frame_error(&frame) {
                    tracing::error!(
                        endpoint = %shared.fleet.endpoints[endpoint].label,
                        error = %err,
                        "work queue pop failed"
                    );
                    continue;
                }
                match frame_string(&frame) {
                    Some(qid) => {
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            intake::admit(shared, endpoint, qid).await;
                        });
                    }
                    None => {
                        tracing::error!(
                            endpoint = %shared.fleet.endpoints[endpoint].label,
                            "unexpected reply type on control connection"
                        );
                    }
                }
            }
            None => {
                tracing::debug!(
                    endpoint = %shared.fleet.endpoints[endpoint].label,
                    "control connection dropped; re-arming after reconnect"
                );
            }
        }
    }
}
