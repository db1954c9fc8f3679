//! Range queries and deterministic decimation over a [`SeriesStore`].
//!
//! # Decimation
//!
//! A span of `L` records requested with `max_points = M` is reduced with a
//! stride `N = ceil(L / M)`. For contiguous spans the kept records are the
//! ones whose absolute index is a multiple of `N`, so:
//!
//! - the same query over unchanged data always returns the same points, and
//! - a live view whose span grows at the tail keeps its earlier points for
//!   as long as `N` does not change.
//!
//! With `M >= L` the stride is 1 and nothing is dropped.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::record::TelemetryRecord;
use crate::store::{SegmentInfo, SeriesStore};

/// How often (in visited records) long loops check their deadline.
const DEADLINE_CHECK_EVERY: usize = 1024;

/// Which records a query covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryRange {
    /// Every retained record.
    #[default]
    All,
    /// Absolute record indices, `[start, end)`.
    Index { start: u64, end: u64 },
    /// Source-clock timestamps, `[start, end]` inclusive.
    Time { start: f64, end: f64 },
}

impl QueryRange {
    pub fn index(start: u64, end: u64) -> Self {
        QueryRange::Index { start, end }
    }

    pub fn time(start: f64, end: f64) -> Self {
        QueryRange::Time { start, end }
    }

    fn validate(&self) -> Result<(), QueryError> {
        match *self {
            QueryRange::All => Ok(()),
            QueryRange::Index { start, end } if start > end => Err(QueryError::InvalidRange(
                format!("index start {} is after end {}", start, end),
            )),
            QueryRange::Index { .. } => Ok(()),
            QueryRange::Time { start, end } if !start.is_finite() || !end.is_finite() => Err(
                QueryError::InvalidRange("time bounds must be finite".to_string()),
            ),
            QueryRange::Time { start, end } if start > end => Err(QueryError::InvalidRange(
                format!("time start {} is after end {}", start, end),
            )),
            QueryRange::Time { .. } => Ok(()),
        }
    }
}

/// Time budget for one query.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn check(&self) -> Result<(), QueryError> {
        if self.started.elapsed() > self.limit {
            Err(QueryError::Timeout {
                limit_ms: self.limit.as_millis() as u64,
            })
        } else {
            Ok(())
        }
    }
}

fn check(deadline: Option<&Deadline>) -> Result<(), QueryError> {
    deadline.map_or(Ok(()), Deadline::check)
}

/// A record together with its position in the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedRecord {
    pub index: u64,
    pub segment: u32,
    #[serde(flatten)]
    pub record: TelemetryRecord,
}

/// Result of a range query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSlice {
    pub records: Vec<IndexedRecord>,
    /// Segments overlapping the requested span, with their boundaries.
    pub segments: Vec<SegmentInfo>,
    /// Decimation stride applied (1 = no decimation).
    pub stride: u64,
    /// Records in the span before decimation.
    pub span_len: u64,
    /// Oldest index still retained by the store.
    pub first_available: u64,
    /// Records retained by the store at query time.
    pub total_records: u64,
}

/// Contiguous or scattered selection of absolute indices.
enum Span {
    Contiguous { start: u64, end: u64 },
    Scattered(Vec<u64>),
}

impl SeriesStore {
    /// Query a range, decimated to at most `max_points` records.
    ///
    /// A well-formed range that currently holds no records returns an empty
    /// slice; malformed ranges and `max_points == 0` are errors.
    pub fn query(
        &self,
        range: QueryRange,
        max_points: usize,
        deadline: Option<&Deadline>,
    ) -> Result<SeriesSlice, QueryError> {
        if max_points == 0 {
            return Err(QueryError::InvalidRange(
                "max_points must be positive".to_string(),
            ));
        }
        range.validate()?;

        let span = match range {
            QueryRange::All => Span::Contiguous {
                start: self.first_index(),
                end: self.next_index(),
            },
            QueryRange::Index { start, end } => Span::Contiguous {
                start: start.max(self.first_index()),
                end: end.min(self.next_index()),
            },
            QueryRange::Time { start, end } => self.time_span(start, end, deadline)?,
        };

        let (records, span_len, stride, bounds) = match span {
            Span::Contiguous { start, end } if start >= end => (Vec::new(), 0, 1, None),
            Span::Contiguous { start, end } => {
                let span_len = end - start;
                let stride = span_len.div_ceil(max_points as u64).max(1);
                let first = start.div_ceil(stride) * stride;
                let mut out = Vec::with_capacity(max_points.min(span_len as usize));
                for (n, index) in (first..end).step_by(stride as usize).enumerate() {
                    if n % DEADLINE_CHECK_EVERY == 0 {
                        check(deadline)?;
                    }
                    if let Some(rec) = self.indexed(index) {
                        out.push(rec);
                    }
                }
                (out, span_len, stride, Some((start, end)))
            }
            Span::Scattered(indices) if indices.is_empty() => (Vec::new(), 0, 1, None),
            Span::Scattered(indices) => {
                let span_len = indices.len() as u64;
                let stride = span_len.div_ceil(max_points as u64).max(1);
                let bounds = (indices[0], indices[indices.len() - 1] + 1);
                let mut out = Vec::with_capacity(max_points.min(indices.len()));
                for (n, index) in indices.iter().step_by(stride as usize).enumerate() {
                    if n % DEADLINE_CHECK_EVERY == 0 {
                        check(deadline)?;
                    }
                    if let Some(rec) = self.indexed(*index) {
                        out.push(rec);
                    }
                }
                (out, span_len, stride, Some(bounds))
            }
        };

        let segments = bounds
            .map(|(start, end)| self.segments_between(start, end))
            .unwrap_or_default();

        Ok(SeriesSlice {
            records,
            segments,
            stride,
            span_len,
            first_available: self.first_index(),
            total_records: self.len() as u64,
        })
    }

    /// The last `n` retained records, oldest first.
    pub fn latest_n(&self, n: usize) -> Vec<IndexedRecord> {
        let end = self.next_index();
        let start = end.saturating_sub(n as u64).max(self.first_index());
        (start..end).filter_map(|i| self.indexed(i)).collect()
    }

    fn indexed(&self, index: u64) -> Option<IndexedRecord> {
        self.segment_and_record(index)
            .map(|(segment, record)| IndexedRecord {
                index,
                segment,
                record,
            })
    }

    fn time_span(
        &self,
        start: f64,
        end: f64,
        deadline: Option<&Deadline>,
    ) -> Result<Span, QueryError> {
        if self.is_empty() {
            return Ok(Span::Contiguous { start: 0, end: 0 });
        }
        if self.timestamps_monotonic() {
            let lo = self.partition_by_time(|t| t < start);
            let hi = self.partition_by_time(|t| t <= end);
            return Ok(Span::Contiguous { start: lo, end: hi });
        }

        let mut indices = Vec::new();
        for (n, (index, ts)) in self.timestamps().enumerate() {
            if n % DEADLINE_CHECK_EVERY == 0 {
                check(deadline)?;
            }
            if ts >= start && ts <= end {
                indices.push(index);
            }
        }
        Ok(Span::Scattered(indices))
    }

    /// First absolute index whose timestamp fails `pred` (timestamps sorted).
    fn partition_by_time<F: Fn(f64) -> bool>(&self, pred: F) -> u64 {
        let (mut lo, mut hi) = (self.first_index(), self.next_index());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.timestamp_at(mid) {
                Some(t) if pred(t) => lo = mid + 1,
                _ => hi = mid,
            }
        }
        lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn rec(step: i64, ts: f64) -> TelemetryRecord {
        TelemetryRecord {
            step_id: step,
            timestamp: ts,
            joint_angles: vec![step as f64 * 0.1],
            joint_velocities: vec![0.0],
            joint_order: vec!["hip".to_string()],
            extra: Map::new(),
        }
    }

    fn store_with(n: i64) -> SeriesStore {
        let mut store = SeriesStore::with_chunk_records(16);
        for step in 0..n {
            store.append(rec(step, step as f64 * 0.5));
        }
        store
    }

    fn steps(slice: &SeriesSlice) -> Vec<i64> {
        slice.records.iter().map(|r| r.record.step_id).collect()
    }

    #[test]
    fn test_no_decimation_when_points_suffice() {
        let store = store_with(10);
        let slice = store.query(QueryRange::All, 10, None).expect("query");
        assert_eq!(slice.stride, 1);
        assert_eq!(steps(&slice), (0..10).collect::<Vec<_>>());
        assert_eq!(slice.records[4].record, rec(4, 2.0));
        assert_eq!(slice.total_records, 10);
    }

    #[test]
    fn test_stride_decimation() {
        let store = store_with(100);
        let slice = store.query(QueryRange::All, 10, None).expect("query");
        assert_eq!(slice.stride, 10);
        assert_eq!(slice.span_len, 100);
        assert_eq!(steps(&slice), vec![0, 10, 20, 30, 40, 50, 60, 70, 80, 90]);

        let slice = store.query(QueryRange::All, 7, None).expect("query");
        assert_eq!(slice.stride, 15);
        assert!(slice.records.len() <= 7);
    }

    #[test]
    fn test_decimation_is_deterministic() {
        let store = store_with(1000);
        let a = store.query(QueryRange::index(13, 977), 50, None).expect("a");
        let b = store.query(QueryRange::index(13, 977), 50, None).expect("b");
        assert_eq!(a, b);
        assert!(a.records.len() <= 50);
    }

    #[test]
    fn test_points_stable_as_tail_grows() {
        let mut store = store_with(95);
        let before = store.query(QueryRange::All, 10, None).expect("before");
        store.append(rec(95, 47.5));
        store.append(rec(96, 48.0));
        let after = store.query(QueryRange::All, 10, None).expect("after");
        assert_eq!(before.stride, after.stride);
        assert_eq!(steps(&before), steps(&after));
    }

    #[test]
    fn test_index_range_clamps_to_available() {
        let store = store_with(20);
        let slice = store.query(QueryRange::index(15, 500), 100, None).expect("query");
        assert_eq!(steps(&slice), vec![15, 16, 17, 18, 19]);

        let empty = store.query(QueryRange::index(30, 40), 100, None).expect("query");
        assert!(empty.records.is_empty());
        assert!(empty.segments.is_empty());
    }

    #[test]
    fn test_invalid_ranges() {
        let store = store_with(5);
        assert!(matches!(
            store.query(QueryRange::index(4, 2), 10, None),
            Err(QueryError::InvalidRange(_))
        ));
        assert!(matches!(
            store.query(QueryRange::time(3.0, 1.0), 10, None),
            Err(QueryError::InvalidRange(_))
        ));
        assert!(matches!(
            store.query(QueryRange::time(f64::NAN, 1.0), 10, None),
            Err(QueryError::InvalidRange(_))
        ));
        assert!(matches!(
            store.query(QueryRange::All, 0, None),
            Err(QueryError::InvalidRange(_))
        ));
    }

    #[test]
    fn test_time_range_inclusive() {
        let store = store_with(20);
        let slice = store.query(QueryRange::time(1.0, 3.0), 100, None).expect("query");
        assert_eq!(steps(&slice), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_time_range_with_clock_reset() {
        let mut store = SeriesStore::new();
        for step in 0..5 {
            store.append(rec(step, 100.0 + step as f64));
        }
        // Process restart: source clock starts over.
        for step in 5..10 {
            store.append(rec(step, (step - 5) as f64));
        }
        assert!(!store.timestamps_monotonic());
        let slice = store.query(QueryRange::time(2.0, 101.0), 100, None).expect("query");
        assert_eq!(steps(&slice), vec![0, 1, 7, 8, 9]);
        assert_eq!(slice.segments.len(), 1);
    }

    #[test]
    fn test_segments_reported_for_span() {
        let mut store = SeriesStore::new();
        for step in 0..4 {
            store.append(rec(step, step as f64));
        }
        let mut wide = rec(4, 4.0);
        wide.joint_order.push("knee".into());
        wide.joint_angles.push(1.0);
        wide.joint_velocities.push(1.0);
        store.append(wide);

        let slice = store.query(QueryRange::index(2, 5), 10, None).expect("query");
        assert_eq!(slice.segments.len(), 2);
        let segs: Vec<u32> = slice.records.iter().map(|r| r.segment).collect();
        assert_eq!(segs, vec![0, 0, 1]);

        let slice = store.query(QueryRange::index(0, 2), 10, None).expect("query");
        assert_eq!(slice.segments.len(), 1);
    }

    #[test]
    fn test_latest_n() {
        let store = store_with(40);
        let tail = store.latest_n(3);
        let got: Vec<u64> = tail.iter().map(|r| r.index).collect();
        assert_eq!(got, vec![37, 38, 39]);
        assert_eq!(store.latest_n(100).len(), 40);
        assert!(SeriesStore::new().latest_n(5).is_empty());
    }

    #[test]
    fn test_expired_deadline() {
        let store = store_with(10);
        let deadline = Deadline::after(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            store.query(QueryRange::All, 10, Some(&deadline)),
            Err(QueryError::Timeout { limit_ms: 0 })
        ));
    }

    #[test]
    fn test_query_after_eviction() {
        let mut store = SeriesStore::with_capacity(Some(16));
        for step in 0..64 {
            store.append(rec(step, step as f64));
        }
        let slice = store.query(QueryRange::index(0, 64), 1000, None).expect("query");
        assert_eq!(slice.first_available, store.first_index());
        assert_eq!(slice.records.first().map(|r| r.index), Some(store.first_index()));
        assert_eq!(slice.records.len(), store.len());
    }
}
