//! Columnar in-memory store for one session's records.
//!
//! # Layout
//!
//! ```text
//! sealed: [Arc<Chunk 0..4096>] [Arc<Chunk 4096..8192>] ...   open: Chunk 8192..
//!           segment 0            segment 0 | segment 1            segment 1
//! ```
//!
//! Records are appended to an open chunk of parallel column vectors. A full
//! chunk, or one that ends at a schema change, is sealed behind an `Arc` and
//! never mutated again. Cloning the store therefore copies only the chunk
//! pointers and the open chunk, which is what makes [`SeriesStore::snapshot`]
//! cheap enough to publish after every ingest batch.
//!
//! # Segments
//!
//! A segment is a contiguous run of records sharing one `joint_order`. A
//! record whose `joint_order` differs from the current segment opens a new
//! one; chunks never span segments.
//!
//! # Indices and eviction
//!
//! Every record receives an absolute index that is never reused while the
//! store lives. With a capacity set, whole sealed chunks are evicted from the
//! front once the retained count exceeds it; evicted indices simply stop
//! resolving.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::record::TelemetryRecord;

/// Contiguous run of records sharing one joint schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentInfo {
    pub id: u32,
    /// Absolute index of the first retained record in the segment.
    pub first_index: u64,
    /// One past the absolute index of the last record in the segment.
    pub end_index: u64,
    pub joint_order: Arc<Vec<String>>,
}

impl SegmentInfo {
    pub fn len(&self) -> u64 {
        self.end_index - self.first_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index == self.first_index
    }

    pub fn contains(&self, index: u64) -> bool {
        index >= self.first_index && index < self.end_index
    }
}

/// Result of appending one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub index: u64,
    pub segment: u32,
    /// The record's schema differed from the previous record's.
    pub schema_changed: bool,
}

#[derive(Debug, Clone)]
struct Chunk {
    first_index: u64,
    segment: u32,
    joint_order: Arc<Vec<String>>,
    step_ids: Vec<i64>,
    timestamps: Vec<f64>,
    /// Row-major, `joint_order.len()` values per record.
    angles: Vec<f64>,
    velocities: Vec<f64>,
    extras: Vec<Option<Box<Map<String, Value>>>>,
}

impl Chunk {
    fn new(
        first_index: u64,
        segment: u32,
        joint_order: Arc<Vec<String>>,
        capacity: usize,
    ) -> Self {
        let width = joint_order.len();
        Self {
            first_index,
            segment,
            step_ids: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            angles: Vec::with_capacity(capacity * width),
            velocities: Vec::with_capacity(capacity * width),
            extras: Vec::with_capacity(capacity),
            joint_order,
        }
    }

    fn len(&self) -> usize {
        self.step_ids.len()
    }

    fn end_index(&self) -> u64 {
        self.first_index + self.len() as u64
    }

    fn push(&mut self, record: TelemetryRecord) {
        self.step_ids.push(record.step_id);
        self.timestamps.push(record.timestamp);
        self.angles.extend_from_slice(&record.joint_angles);
        self.velocities.extend_from_slice(&record.joint_velocities);
        self.extras.push(if record.extra.is_empty() {
            None
        } else {
            Some(Box::new(record.extra))
        });
    }

    fn record(&self, offset: usize) -> TelemetryRecord {
        let width = self.joint_order.len();
        let cols = offset * width..(offset + 1) * width;
        TelemetryRecord {
            step_id: self.step_ids[offset],
            timestamp: self.timestamps[offset],
            joint_angles: self.angles[cols.clone()].to_vec(),
            joint_velocities: self.velocities[cols].to_vec(),
            joint_order: self.joint_order.as_ref().clone(),
            extra: self.extras[offset]
                .as_deref()
                .cloned()
                .unwrap_or_default(),
        }
    }
}

/// In-memory series for one session.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    sealed: VecDeque<Arc<Chunk>>,
    open: Option<Chunk>,
    segments: VecDeque<SegmentInfo>,
    first_index: u64,
    next_index: u64,
    next_segment_id: u32,
    capacity: Option<usize>,
    chunk_records: usize,
    evicted: u64,
    timestamps_monotonic: bool,
    last_timestamp: Option<f64>,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::with_chunk_records(crate::DEFAULT_CHUNK_RECORDS)
    }

    /// Store that evicts its oldest chunks beyond `capacity` records.
    ///
    /// The retained count never exceeds `capacity`; chunks shrink to at most
    /// an eighth of it so eviction never drops more than that at once.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let mut store = match capacity {
            Some(cap) => {
                Self::with_chunk_records((cap / 8).clamp(1, crate::DEFAULT_CHUNK_RECORDS))
            }
            None => Self::new(),
        };
        store.capacity = capacity;
        store
    }

    pub fn with_chunk_records(chunk_records: usize) -> Self {
        Self {
            sealed: VecDeque::new(),
            open: None,
            segments: VecDeque::new(),
            first_index: 0,
            next_index: 0,
            next_segment_id: 0,
            capacity: None,
            chunk_records: chunk_records.max(1),
            evicted: 0,
            timestamps_monotonic: true,
            last_timestamp: None,
        }
    }

    /// Retained record count.
    pub fn len(&self) -> usize {
        (self.next_index - self.first_index) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == self.first_index
    }

    /// Absolute index of the oldest retained record.
    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Absolute index the next appended record will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Records dropped by capacity eviction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether timestamps have never decreased; enables binary search.
    pub fn timestamps_monotonic(&self) -> bool {
        self.timestamps_monotonic
    }

    /// Segments that still have retained records, oldest first.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments.iter().filter(|s| !s.is_empty()).cloned().collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.iter().filter(|s| !s.is_empty()).count()
    }

    /// Segments overlapping `[start, end)`.
    pub fn segments_between(&self, start: u64, end: u64) -> Vec<SegmentInfo> {
        self.segments
            .iter()
            .filter(|s| !s.is_empty() && s.first_index < end && s.end_index > start)
            .cloned()
            .collect()
    }

    /// Drop all records and segments; indices restart at 0.
    pub fn reset(&mut self) {
        *self = Self {
            capacity: self.capacity,
            ..Self::with_chunk_records(self.chunk_records)
        };
    }

    /// Cheap immutable copy for readers.
    pub fn snapshot(&self) -> Arc<SeriesStore> {
        Arc::new(self.clone())
    }

    pub fn append(&mut self, record: TelemetryRecord) -> AppendOutcome {
        let index = self.next_index;
        let same_schema = self
            .segments
            .back()
            .map(|seg| seg.joint_order.as_slice() == record.joint_order.as_slice());
        let schema_changed = same_schema == Some(false);

        if same_schema != Some(true) {
            self.seal_open();
            let id = self.next_segment_id;
            self.next_segment_id += 1;
            if schema_changed {
                info!(
                    segment = id,
                    index,
                    joints = record.joint_order.len(),
                    "joint schema changed; opening new segment"
                );
            }
            self.segments.push_back(SegmentInfo {
                id,
                first_index: index,
                end_index: index,
                joint_order: Arc::new(record.joint_order.clone()),
            });
        }

        // The newest segment always carries the most recently issued id.
        let segment = self.next_segment_id - 1;
        let mut joint_order = None;
        if let Some(seg) = self.segments.back_mut() {
            seg.end_index = index + 1;
            joint_order = Some(Arc::clone(&seg.joint_order));
        }

        if let Some(last) = self.last_timestamp {
            if record.timestamp < last {
                self.timestamps_monotonic = false;
            }
        }
        self.last_timestamp = Some(record.timestamp);

        let chunk_records = self.chunk_records;
        let open = self.open.get_or_insert_with(|| {
            let joint_order =
                joint_order.unwrap_or_else(|| Arc::new(record.joint_order.clone()));
            Chunk::new(index, segment, joint_order, chunk_records)
        });
        open.push(record);
        let full = open.len() >= chunk_records;
        self.next_index += 1;

        if full {
            self.seal_open();
        }
        self.enforce_capacity();

        AppendOutcome {
            index,
            segment,
            schema_changed,
        }
    }

    fn seal_open(&mut self) {
        if let Some(chunk) = self.open.take() {
            if chunk.len() > 0 {
                self.sealed.push_back(Arc::new(chunk));
            }
        }
    }

    fn enforce_capacity(&mut self) {
        let Some(capacity) = self.capacity else {
            return;
        };
        let mut dropped = 0u64;
        while self.len() > capacity {
            let Some(chunk) = self.sealed.pop_front() else {
                break;
            };
            dropped += chunk.len() as u64;
            self.first_index = chunk.end_index();
        }
        if dropped == 0 {
            return;
        }
        self.evicted += dropped;

        let first = self.first_index;
        while self.segments.len() > 1
            && self.segments.front().is_some_and(|s| s.end_index <= first)
        {
            self.segments.pop_front();
        }
        if let Some(front) = self.segments.front_mut() {
            front.first_index = front.first_index.max(first).min(front.end_index);
        }
        debug!(dropped, first_index = first, capacity, "evicted oldest chunks");
    }

    fn locate(&self, index: u64) -> Option<(&Chunk, usize)> {
        if index < self.first_index || index >= self.next_index {
            return None;
        }
        if let Some(open) = &self.open {
            if index >= open.first_index {
                return Some((open, (index - open.first_index) as usize));
            }
        }
        let pos = self.sealed.partition_point(|c| c.end_index() <= index);
        let chunk = self.sealed.get(pos)?;
        Some((chunk.as_ref(), (index - chunk.first_index) as usize))
    }

    /// Record at an absolute index, if retained.
    pub fn get(&self, index: u64) -> Option<TelemetryRecord> {
        self.locate(index).map(|(chunk, offset)| chunk.record(offset))
    }

    /// Segment id of the record at an absolute index.
    pub fn segment_of(&self, index: u64) -> Option<u32> {
        self.locate(index).map(|(chunk, _)| chunk.segment)
    }

    pub(crate) fn timestamp_at(&self, index: u64) -> Option<f64> {
        self.locate(index)
            .map(|(chunk, offset)| chunk.timestamps[offset])
    }

    pub(crate) fn segment_and_record(&self, index: u64) -> Option<(u32, TelemetryRecord)> {
        self.locate(index)
            .map(|(chunk, offset)| (chunk.segment, chunk.record(offset)))
    }

    /// Iterate `(absolute index, timestamp)` over retained records in order.
    pub(crate) fn timestamps(&self) -> impl Iterator<Item = (u64, f64)> + '_ {
        self.sealed
            .iter()
            .map(|c| c.as_ref())
            .chain(self.open.as_ref())
            .flat_map(|c| {
                c.timestamps
                    .iter()
                    .enumerate()
                    .map(move |(i, t)| (c.first_index + i as u64, *t))
            })
    }

    /// The most recently appended record.
    pub fn last(&self) -> Option<TelemetryRecord> {
        self.next_index.checked_sub(1).and_then(|i| self.get(i))
    }

    /// `(first, last)` step ids of the retained records.
    pub fn step_span(&self) -> Option<(i64, i64)> {
        let first = self.locate(self.first_index)?;
        let last = self.locate(self.next_index - 1)?;
        Some((first.0.step_ids[first.1], last.0.step_ids[last.1]))
    }
}
