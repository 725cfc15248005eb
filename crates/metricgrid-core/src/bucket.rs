//! Time buckets and down-sampling.
//!
//! Buckets are decimal-packed UTC timestamps: `yyyyMMddHHmm` for minutes,
//! `yyyyMMddHH` for hours and `yyyyMMdd` for days. Coarsening a bucket is a
//! plain integer division.

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, MergeResult};

/// Granularity of a time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownSampling {
    Minute,
    Hour,
    Day,
}

impl DownSampling {
    /// Detect the granularity of a bucket from its digit count.
    pub fn of(bucket: i64) -> Option<Self> {
        match bucket {
            100_000_000_000..=999_999_999_999 => Some(DownSampling::Minute),
            1_000_000_000..=9_999_999_999 => Some(DownSampling::Hour),
            10_000_000..=99_999_999 => Some(DownSampling::Day),
            _ => None,
        }
    }

    /// Number of decimal digits dropped when coarsening from minutes.
    fn depth(self) -> u32 {
        match self {
            DownSampling::Minute => 0,
            DownSampling::Hour => 1,
            DownSampling::Day => 2,
        }
    }

    /// Storage model suffix for this granularity.
    pub fn table_suffix(self) -> &'static str {
        match self {
            DownSampling::Minute => "",
            DownSampling::Hour => "_hour",
            DownSampling::Day => "_day",
        }
    }
}

/// Convert `bucket` to the coarser granularity `target`.
///
/// Converting to a finer granularity, or from a bucket whose granularity
/// cannot be determined, fails with [`MergeError::InvalidBucket`].
pub fn rebucket(bucket: i64, target: DownSampling) -> MergeResult<i64> {
    let source = DownSampling::of(bucket).ok_or(MergeError::InvalidBucket { bucket })?;
    if target < source {
        return Err(MergeError::InvalidBucket { bucket });
    }
    let steps = target.depth() - source.depth();
    Ok(bucket / 100_i64.pow(steps))
}
