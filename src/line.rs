//! The record type delivered to consumers.

use std::time::SystemTime;

use crate::error::Error;

/// A single tailed record.
#[derive(Clone, Debug)]
pub struct Line {
    /// Record content, without its trailing newline.
    pub text: String,

    /// 1-based count of emitted records, monotonic across rotations.
    /// In-band diagnostics repeat the current count instead of consuming one.
    pub num: u64,

    /// Byte offset of the start of this record within the file it was read
    /// from.
    pub offset: u64,

    /// Wall-clock time at emission.
    pub time: SystemTime,

    /// Terminal or informational error attached to this record. A record
    /// with [`Error::RateLimited`] is a diagnostic, not a failure.
    pub err: Option<Error>,
}
