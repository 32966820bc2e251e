// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Frame-range parsing and batch planning.
//!
//! A frame-range expression is a comma-separated list of single frames or
//! inclusive ranges `A-B` with A <= B. Parsing deduplicates and sorts;
//! planning emits contiguous runs of at most `batch_size` frames, where a
//! gap in the frame set always starts a new run. Planning is
//! deterministic: the same (expression, batch size) pair always yields the
//! same batches in the same order.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Batching errors. All of them map to a bad request on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    /// Empty expression or empty term
    #[error("frame range is empty")]
    Empty,

    /// A term that is neither an integer nor `A-B`
    #[error("malformed frame range term: {0:?}")]
    MalformedTerm(String),

    /// A range term with start > end
    #[error("descending frame range: {0:?}")]
    DescendingRange(String),

    /// Zero batch size
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
}

/// A contiguous inclusive run of frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSpan {
    /// First frame
    pub start: i64,
    /// Last frame, inclusive
    pub end: i64,
}

impl FrameSpan {
    /// Number of frames in the span.
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Whether the span is degenerate. Never true for planner output.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Iterate the frames of the span.
    pub fn frames(&self) -> impl Iterator<Item = i64> {
        self.start..=self.end
    }

    /// Parse the wire form produced by [`fmt::Display`]: `"A-B"` or `"N"`.
    pub fn parse(s: &str) -> Result<Self, BatchError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BatchError::Empty);
        }

        match split_range(s) {
            Some((a, b)) => {
                let start: i64 = a
                    .trim()
                    .parse()
                    .map_err(|_| BatchError::MalformedTerm(s.to_string()))?;
                let end: i64 = b
                    .trim()
                    .parse()
                    .map_err(|_| BatchError::MalformedTerm(s.to_string()))?;
                if end < start {
                    return Err(BatchError::DescendingRange(s.to_string()));
                }
                Ok(Self { start, end })
            }
            None => {
                let frame: i64 = s
                    .parse()
                    .map_err(|_| BatchError::MalformedTerm(s.to_string()))?;
                Ok(Self {
                    start: frame,
                    end: frame,
                })
            }
        }
    }
}

impl fmt::Display for FrameSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Split `A-B` on the dash separating the two bounds, tolerating negative
/// frame numbers (`-5`, `-10--5`).
fn split_range(s: &str) -> Option<(&str, &str)> {
    for (idx, ch) in s.char_indices().skip(1) {
        if ch == '-' && !s[..idx].ends_with(['-', ' ']) {
            return Some((&s[..idx], &s[idx + 1..]));
        }
    }
    None
}

/// Parse a frame-range expression into a sorted, deduplicated frame list.
pub fn parse_frame_range(expr: &str) -> Result<Vec<i64>, BatchError> {
    if expr.trim().is_empty() {
        return Err(BatchError::Empty);
    }

    let mut frames = Vec::new();
    for term in expr.split(',') {
        let span = FrameSpan::parse(term)?;
        frames.extend(span.frames());
    }

    frames.sort_unstable();
    frames.dedup();
    Ok(frames)
}

/// Split a sorted, deduplicated frame list into batches: contiguous runs,
/// cut at every gap, each at most `batch_size` frames long. Batch indices
/// are the (1-based) positions in the returned order.
pub fn plan_batches(frames: &[i64], batch_size: i64) -> Result<Vec<FrameSpan>, BatchError> {
    if batch_size < 1 {
        return Err(BatchError::ZeroBatchSize);
    }
    if frames.is_empty() {
        return Err(BatchError::Empty);
    }

    let mut spans = Vec::new();
    let mut start = frames[0];
    let mut prev = frames[0];

    for &frame in &frames[1..] {
        if frame != prev + 1 || frame - start + 1 > batch_size {
            spans.push(FrameSpan { start, end: prev });
            start = frame;
        }
        prev = frame;
    }
    spans.push(FrameSpan { start, end: prev });

    Ok(spans)
}

/// Parse and plan in one step.
pub fn plan_frame_range(expr: &str, batch_size: i64) -> Result<Vec<FrameSpan>, BatchError> {
    let frames = parse_frame_range(expr)?;
    plan_batches(&frames, batch_size)
}
