//! Chunk executor: one chunk through its WHERE sub-steps and the
//! SELECT/POST sub-step.

use std::fmt;

use crate::engine::{QueryEngine, StepPerf};
use crate::query::{ChunkPartial, QueryParams, WhereResult};

/// Which sub-step of a chunk reported an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepFailure {
    Where(u32),
    Select,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepFailure::Where(term) => write!(f, "where term {term}"),
            StepFailure::Select => write!(f, "select/post"),
        }
    }
}

/// Drive one chunk. WHERE terms run strictly in order; their partials are
/// consumed by the set union before SELECT/POST starts. A sub-step whose
/// perf record carries `error` aborts the chunk with no further sub-steps.
pub(crate) async fn execute(
    engine: &dyn QueryEngine,
    qp: &QueryParams,
    chunk: u32,
    wterms: u32,
    perf: &mut Vec<StepPerf>,
) -> Result<ChunkPartial, StepFailure> {
    let mut welem: Vec<WhereResult> = Vec::with_capacity(wterms as usize);
    for term in 0..wterms {
        let (step, matches) = engine.execute_where(qp, chunk, term).await;
        let failed = step.error;
        perf.push(step);
        if failed {
            return Err(StepFailure::Where(term));
        }
        welem.push(matches);
    }

    let matches = engine.set_union(std::mem::take(&mut welem));

    let (step, partial) = engine.execute_select(qp, chunk, matches).await;
    let failed = step.error;
    perf.push(step);
    if failed {
        return Err(StepFailure::Select);
    }
    Ok(partial)
}
