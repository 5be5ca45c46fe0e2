use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, CoreResult};
use crate::task::TaskId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u64);

impl ChunkId {
    pub const UNSET: ChunkId = ChunkId(0);

    pub fn is_set(&self) -> bool {
        *self != Self::UNSET
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRange {
    begin: u64,
    end: u64,
}

impl ChunkRange {
    pub fn new(begin: u64, end: u64) -> CoreResult<Self> {
        if end < begin {
            return Err(CoreError::InvalidArgument(format!(
                "invalid range {}..{}",
                begin, end
            )));
        }
        Ok(Self { begin, end })
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.begin + 1
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.begin, self.end)
    }
}

/// One contiguous byte range of a task. A chunk without a range is the single
/// unranged stream of a non-resumable task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    id: ChunkId,
    task_id: TaskId,
    range: Option<ChunkRange>,
    finished: bool,
    file: Option<String>,
}

impl Chunk {
    pub fn new(task_id: TaskId, range: Option<ChunkRange>) -> Self {
        Self {
            id: ChunkId::UNSET,
            task_id,
            range,
            finished: false,
            file: None,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn range(&self) -> Option<ChunkRange> {
        self.range
    }

    pub fn is_resumable(&self) -> bool {
        self.range.is_some()
    }

    pub fn length(&self) -> u64 {
        self.range.map(|range| range.len()).unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    pub(crate) fn with_id(mut self, id: ChunkId) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn with_range(mut self, range: ChunkRange) -> Self {
        self.range = Some(range);
        self
    }

    pub(crate) fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub(crate) fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

/// Splits `[0, length)` into at most `max_chunks` contiguous ranges. The count
/// only grows while every piece stays above `min_chunk_size`; the last range
/// absorbs the division remainder.
pub fn plan_chunks(length: u64, max_chunks: u32, min_chunk_size: u64) -> Vec<ChunkRange> {
    if length == 0 {
        return Vec::new();
    }

    let mut count = 1u64;
    while count < max_chunks as u64 && length / (count + 1) > min_chunk_size {
        count += 1;
    }

    let per_chunk = length / count;
    let mut ranges = Vec::with_capacity(count as usize);
    for index in 0..count {
        let begin = index * per_chunk;
        let end = if index == count - 1 {
            length - 1
        } else {
            (index + 1) * per_chunk - 1
        };
        ranges.push(ChunkRange { begin, end });
    }
    ranges
}

/// Cuts the unclaimed tail off `range`. `first_free` is the first byte nobody
/// has started writing yet; the returned pair partitions `range` exactly and
/// the tail never starts before `first_free`. Returns `None` when the tail
/// would be smaller than `min_chunk_size`.
pub fn split_range(
    range: ChunkRange,
    first_free: u64,
    min_chunk_size: u64,
) -> Option<(ChunkRange, ChunkRange)> {
    if first_free > range.end {
        return None;
    }
    let first_free = first_free.max(range.begin);
    let free = range.end - first_free + 1;
    let tail = free / 2;
    if tail == 0 || tail < min_chunk_size {
        return None;
    }
    let head_end = range.end - tail;
    Some((
        ChunkRange {
            begin: range.begin,
            end: head_end,
        },
        ChunkRange {
            begin: head_end + 1,
            end: range.end,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(ranges: &[ChunkRange], length: u64) {
        let mut next = 0u64;
        for range in ranges {
            assert_eq!(range.begin(), next, "gap or overlap at {}", next);
            next = range.end() + 1;
        }
        assert_eq!(next, length);
    }

    #[test]
    fn two_million_bytes_four_connections() {
        let ranges = plan_chunks(2_000_000, 4, 250_000);
        assert_eq!(ranges.len(), 4);
        for range in &ranges {
            assert_eq!(range.len(), 500_000);
        }
        assert_partition(&ranges, 2_000_000);
    }

    #[test]
    fn small_resource_is_not_fanned_out() {
        let ranges = plan_chunks(100_000, 4, 250_000);
        assert_eq!(ranges, vec![ChunkRange::new(0, 99_999).unwrap()]);
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let ranges = plan_chunks(1_000_003, 3, 250_000);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].len(), 333_334);
        assert_eq!(ranges[2].len(), 1_000_003 - 2 * 333_334);
        assert_partition(&ranges, 1_000_003);
    }

    #[test]
    fn plans_always_partition_and_respect_floor() {
        let floor = 250 * 1024;
        for length in [1u64, 1_000, 256_000, 512_001, 3_333_333, 10_000_000, 77_777_777] {
            for max in 1..=16u32 {
                let ranges = plan_chunks(length, max, floor);
                assert!(!ranges.is_empty());
                assert!(ranges.len() as u32 <= max);
                assert_partition(&ranges, length);
                if ranges.len() > 1 {
                    assert!(ranges.iter().all(|range| range.len() > floor));
                }
            }
        }
    }

    #[test]
    fn split_partitions_range_after_cursor() {
        let range = ChunkRange::new(1_000, 1_000_999).unwrap();
        let (head, tail) = split_range(range, 200_000, 1_000).expect("split");
        assert_eq!(head.begin(), 1_000);
        assert_eq!(head.end() + 1, tail.begin());
        assert_eq!(tail.end(), 1_000_999);
        assert!(head.end() >= 200_000 - 1);
        assert_eq!(head.len() + tail.len(), range.len());
    }

    #[test]
    fn split_never_precedes_first_free_byte() {
        let range = ChunkRange::new(0, 9_999).unwrap();
        for cursor in [0u64, 1, 4_000, 9_000, 9_998] {
            if let Some((head, tail)) = split_range(range, cursor, 1) {
                assert!(tail.begin() >= cursor);
                assert_eq!(head.end() + 1, tail.begin());
                assert_eq!(tail.end(), 9_999);
            }
        }
    }

    #[test]
    fn split_declines_undersized_tail() {
        let range = ChunkRange::new(0, 999_999).unwrap();
        assert!(split_range(range, 600_000, 250_000).is_none());
        assert!(split_range(range, 1_000_000, 1).is_none());
        let (_, tail) = split_range(range, 400_000, 250_000).expect("split");
        assert!(tail.len() >= 250_000);
    }

    #[test]
    fn inverted_range_is_rejected() {
        assert!(ChunkRange::new(10, 9).is_err());
        assert_eq!(ChunkRange::new(10, 10).unwrap().len(), 1);
    }
}
