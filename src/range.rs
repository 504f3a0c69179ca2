//! Byte ranges and the initial range plan.

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

/// A contiguous slice of the remote resource owned by one worker.
///
/// `end` is inclusive, matching `Range: bytes=begin-end`. `None` means the
/// size is unknown and the range runs until the body ends. `begin` is the
/// progress cursor: it starts at the slice start and only moves forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub begin: u64,
    pub end: Option<u64>,
}

impl Range {
    pub const fn new(begin: u64, end: u64) -> Self {
        Self {
            begin,
            end: Some(end),
        }
    }

    /// A range covering the whole body of a resource of unknown length.
    pub const fn unbounded() -> Self {
        Self {
            begin: 0,
            end: None,
        }
    }

    pub const fn is_bounded(&self) -> bool {
        self.end.is_some()
    }

    /// Bytes still to fetch, or `None` when the size is unknown.
    pub fn remaining(&self) -> Option<u64> {
        self.end.map(|end| match end.checked_sub(self.begin) {
            Some(span) => span.saturating_add(1),
            None => 0,
        })
    }

    /// True once a bounded range has been written through its last byte.
    pub fn is_complete(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Value for the `Range` request header, if one should be sent.
    pub fn header_value(&self) -> Option<String> {
        match self.end {
            Some(end) => Some(format!("bytes={}-{}", self.begin, end)),
            None if self.begin > 0 => Some(format!("bytes={}-", self.begin)),
            None => None,
        }
    }
}

/// Split a resource into `workers` contiguous ranges covering `[0, size)`.
///
/// An unknown or zero size yields a single unbounded range. The last range
/// absorbs the remainder of the division. When there are fewer bytes than
/// workers the worker count is reduced so no range is empty.
pub fn plan_ranges(size: Option<u64>, workers: usize) -> Result<Vec<Range>> {
    if workers == 0 {
        return Err(DownloadError::InvalidWorkerCount);
    }

    let size = match size {
        Some(size) if size > 0 => size,
        _ => return Ok(vec![Range::unbounded()]),
    };

    let count = (workers as u64).min(size);
    let block = size / count;

    let ranges = (0..count)
        .map(|i| {
            let begin = i * block;
            let end = if i == count - 1 {
                size - 1
            } else {
                (i + 1) * block - 1
            };
            Range::new(begin, end)
        })
        .collect();

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_four_workers() {
        let ranges = plan_ranges(Some(1_000_000), 4).unwrap();
        assert_eq!(
            ranges,
            vec![
                Range::new(0, 249_999),
                Range::new(250_000, 499_999),
                Range::new(500_000, 749_999),
                Range::new(750_000, 999_999),
            ]
        );
    }

    #[test]
    fn test_plan_remainder_goes_to_last() {
        let ranges = plan_ranges(Some(10), 3).unwrap();
        assert_eq!(
            ranges,
            vec![Range::new(0, 2), Range::new(3, 5), Range::new(6, 9)]
        );
    }

    #[test]
    fn test_plan_unknown_size() {
        assert_eq!(plan_ranges(None, 8).unwrap(), vec![Range::unbounded()]);
        assert_eq!(plan_ranges(Some(0), 8).unwrap(), vec![Range::unbounded()]);
    }

    #[test]
    fn test_plan_rejects_zero_workers() {
        assert!(matches!(
            plan_ranges(Some(100), 0),
            Err(DownloadError::InvalidWorkerCount)
        ));
        assert!(matches!(
            plan_ranges(None, 0),
            Err(DownloadError::InvalidWorkerCount)
        ));
    }

    #[test]
    fn test_plan_more_workers_than_bytes() {
        let ranges = plan_ranges(Some(3), 8).unwrap();
        assert_eq!(
            ranges,
            vec![Range::new(0, 0), Range::new(1, 1), Range::new(2, 2)]
        );
    }

    #[test]
    fn test_header_value() {
        assert_eq!(
            Range::new(10, 19).header_value().as_deref(),
            Some("bytes=10-19")
        );
        assert_eq!(Range::unbounded().header_value(), None);
        let resumed = Range {
            begin: 42,
            end: None,
        };
        assert_eq!(resumed.header_value().as_deref(), Some("bytes=42-"));
    }

    #[test]
    fn test_remaining_and_complete() {
        let mut range = Range::new(100, 199);
        assert_eq!(range.remaining(), Some(100));
        assert!(!range.is_complete());

        range.begin = 200;
        assert_eq!(range.remaining(), Some(0));
        assert!(range.is_complete());

        assert_eq!(Range::unbounded().remaining(), None);
        assert!(!Range::unbounded().is_complete());
    }

    #[test]
    fn test_remaining_at_largest_offset() {
        let range = Range::new(5, u64::MAX);
        assert_eq!(range.remaining(), Some(u64::MAX - 4));
        assert!(!range.is_complete());
        assert_eq!(Range::new(0, u64::MAX).remaining(), Some(u64::MAX));
    }

    proptest! {
        #[test]
        fn prop_plan_covers_size(size in 1u64..10_000_000, workers in 1usize..64) {
            let ranges = plan_ranges(Some(size), workers).unwrap();

            prop_assert_eq!(ranges.len() as u64, (workers as u64).min(size));
            prop_assert_eq!(ranges[0].begin, 0);
            prop_assert_eq!(ranges.last().unwrap().end, Some(size - 1));

            for pair in ranges.windows(2) {
                prop_assert_eq!(pair[0].end.unwrap() + 1, pair[1].begin);
            }

            let covered: u64 = ranges.iter().map(|r| r.remaining().unwrap()).sum();
            prop_assert_eq!(covered, size);
            prop_assert!(ranges.iter().all(|r| r.remaining().unwrap() > 0));
        }
    }
}
