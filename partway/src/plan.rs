//! Splitting a logical object into the ordered list of parts that the worker
//! pool will transfer.
use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::ops::{Range, RangeInclusive};

/// The smallest part size the service accepts for any part but the last.
pub const MIN_PART_SIZE: u64 = 100 * 1024;

/// The largest part size the service accepts.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// The most parts a single multipart session may hold.
pub const MAX_PART_COUNT: u64 = 10_000;

/// One contiguous byte range of the object, transferred as a unit.
///
/// Part numbers are 1-based and dense, and are never renumbered once a plan
/// has been written to a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

impl Part {
    /// The half-open byte range this part covers, as used by ranged GETs and
    /// positional file I/O.
    pub(crate) fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.size
    }

    /// The inclusive byte range the copy API expects.  Only meaningful for
    /// parts with a non-zero size.
    pub(crate) fn copy_range(&self) -> RangeInclusive<u64> {
        self.offset..=self.offset + self.size - 1
    }
}

/// Compute the parts covering `[0, source_size)` at the requested part size.
///
/// Every part is exactly `part_size` bytes except the last, which holds the
/// remainder.  A zero-byte source still yields a single zero-byte part, since
/// creating an empty object requires uploading something.
pub(crate) fn plan(source_size: u64, part_size: u64) -> Result<Vec<Part>> {
    check_part_size(part_size)?;

    if source_size == 0 {
        return Ok(vec![Part {
            number: 1,
            offset: 0,
            size: 0,
        }]);
    }

    let count = (source_size + part_size - 1) / part_size;
    ensure!(
        count <= MAX_PART_COUNT,
        error::TooManyPartsSnafu {
            size: source_size,
            part_size
        }
    );

    let mut parts = Vec::with_capacity(count as usize);
    let mut offset = 0u64;
    let mut number = 1u32;

    while offset < source_size {
        let size = part_size.min(source_size - offset);

        parts.push(Part {
            number,
            offset,
            size,
        });

        offset += size;
        number += 1;
    }

    Ok(parts)
}

/// Reject part sizes outside `[MIN_PART_SIZE, MAX_PART_SIZE]` before any
/// remote call is issued.
pub(crate) fn check_part_size(part_size: u64) -> Result<()> {
    ensure!(
        (MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size),
        error::InvalidPartSizeSnafu { size: part_size }
    );

    Ok(())
}
