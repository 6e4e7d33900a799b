//! Errno-style codes carried in the negative progress encoding on
//! `REPLY:<qid>`.

/// Query engine sub-step failure.
pub const EIO: i32 = 5;

/// Admission refused: too many concurrent pipelines.
pub const EMFILE: i32 = 24;

/// Accepted rows exceeded the per-query budget.
pub const ENOBUFS: i32 = 105;
