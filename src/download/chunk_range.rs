use std::collections::Bound;
use std::ops::RangeBounds;
use serde::{Deserialize, Serialize};

/// 一个闭区间字节范围 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> ChunkRange {
        ChunkRange { start, end }
    }

    pub fn from_len(start: u64, len: u64) -> ChunkRange {
        ChunkRange { start, end: start + len - 1 }
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start) + 1
    }

    pub fn to_range_header(&self) -> headers::Range {
        headers::Range::bytes(self).unwrap()
    }

    /// 偏移后的剩余范围，用于断点续传
    pub fn with_offset(&self, offset: u64) -> ChunkRange {
        ChunkRange {
            start: self.start + offset,
            end: self.end,
        }
    }
}

/// 为 ChunkRange 实现范围 trait: start..=end
impl<'a> RangeBounds<u64> for &'a ChunkRange {
    fn start_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.start)
    }

    fn end_bound(&self) -> Bound<&u64> {
        Bound::Included(&self.end)
    }
}

/// 把 [0, total-1] 切成 workers 个连续不相交的闭区间，余数落在最后一块
pub fn split_into_chunks(total: u64, workers: u64) -> Vec<ChunkRange> {
    if total == 0 || workers == 0 {
        return Vec::new();
    }

    let chunk = total / workers;
    let remainder = total % workers;

    let mut ranges = Vec::with_capacity(workers as usize);
    for i in 0..workers {
        let start = i * chunk;
        let mut end = start + chunk - 1;
        if i == workers - 1 {
            end += remainder;
        }
        ranges.push(ChunkRange::new(start, end));
    }

    ranges
}
