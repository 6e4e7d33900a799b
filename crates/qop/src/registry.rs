//! In-progress query registry.
//!
//! One coarse mutex guards the in-progress map, the per-endpoint worker
//! load counters, and the per-query sub-query attachments, so admission
//! (cap check + least-loaded pick + load increment) is atomic with respect
//! to concurrent completions.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::fleet::WORKER_CONNECTIONS;

/// Opaque handle the engine may park on a query for its lifetime.
pub type SubQueryHandle = Arc<dyn Any + Send + Sync>;

/// Where an admitted query runs: endpoint index and worker-connection index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub endpoint: usize,
    pub conn: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    /// The concurrent-pipeline cap is reached.
    TooManyQueries,
    /// The qid already has an active pipeline.
    AlreadyActive,
}

pub struct Registry {
    max_pipelines: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    active: HashMap<String, Admission>,
    loads: Vec<[u32; WORKER_CONNECTIONS]>,
    subqueries: HashMap<String, Vec<SubQueryHandle>>,
}

impl Registry {
    pub fn new(endpoints: usize, max_pipelines: usize) -> Self {
        Self {
            max_pipelines,
            inner: Mutex::new(Inner {
                active: HashMap::new(),
                loads: vec![[0; WORKER_CONNECTIONS]; endpoints],
                subqueries: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit `qid` onto the least-loaded worker connection of `endpoint`.
    pub fn try_admit(&self, qid: &str, endpoint: usize) -> Result<Admission, AdmitError> {
        let mut inner = self.lock();
        if inner.active.contains_key(qid) {
            return Err(AdmitError::AlreadyActive);
        }
        if inner.active.len() >= self.max_pipelines {
            return Err(AdmitError::TooManyQueries);
        }
        let conn = least_loaded(&inner.loads[endpoint]);
        inner.loads[endpoint][conn] += 1;
        let admission = Admission { endpoint, conn };
        inner.active.insert(qid.to_string(), admission);
        inner.subqueries.insert(qid.to_string(), Vec::new());
        Ok(admission)
    }

    /// Drop a finished query and release its connection slot.
    pub fn complete(&self, qid: &str) {
        let mut inner = self.lock();
        if let Some(admission) = inner.active.remove(qid) {
            let load = &mut inner.loads[admission.endpoint][admission.conn];
            *load = load.saturating_sub(1);
        }
        inner.subqueries.remove(qid);
    }

    /// Park an engine-owned handle on an active query. Returns false when
    /// the query is not in flight.
    pub fn attach_subquery(&self, qid: &str, handle: SubQueryHandle) -> bool {
        let mut inner = self.lock();
        match inner.subqueries.get_mut(qid) {
            Some(handles) => {
                handles.push(handle);
                true
            }
            None => false,
        }
    }

    pub fn active_queries(&self) -> usize {
        self.lock().active.len()
    }

    pub fn endpoint_loads(&self, endpoint: usize) -> [u32; WORKER_CONNECTIONS] {
        self.lock().loads[endpoint]
    }
}

/// Smallest load wins; ties break to the lowest index.
fn least_loaded(loads: &[u32; WORKER_CONNECTIONS]) -> usize {
    let mut best = 0;
    for (idx, load) in loads.iter().enumerate().skip(1) {
        if *load < loads[best] {
            best = idx;
        }
    }
    best
}
