//! Splitting a byte range into parts.

use crate::checkpoint::{PartRecord, PartStatus};
use crate::config::{DEFAULT_PART_SIZE, MAX_PART_COUNT, MAX_PART_SIZE, MIN_PART_SIZE};
use crate::error::WosError;

/// Splits `[0, total)` into contiguous parts of `part_size` bytes, numbered
/// from 1. The last part holds the remainder. Zero bytes gives zero parts.
///
/// Fails when a part number would not fit in a `u32`.
pub fn partition(total: u64, part_size: u64) -> Result<Vec<PartRecord>, WosError> {
    let part_size = part_size.max(1);
    let count = total.div_ceil(part_size);
    let count = u32::try_from(count).map_err(|_| {
        WosError::validation(format!(
            "{} bytes in parts of {} bytes needs {} parts",
            total, part_size, count
        ))
    })?;
    Ok((1..=count)
        .map(|part_number| {
            let offset = u64::from(part_number - 1) * part_size;
            PartRecord {
                part_number,
                offset,
                size: part_size.min(total - offset),
                etag: None,
                status: PartStatus::Pending,
            }
        })
        .collect())
}

/// Part size for uploading `total` bytes: the request clamped to the service
/// limits, then raised until the part count fits.
pub fn upload_part_size(requested: u64, total: u64) -> u64 {
    let size = requested.clamp(MIN_PART_SIZE, MAX_PART_SIZE);
    if total.div_ceil(size) > MAX_PART_COUNT {
        total.div_ceil(MAX_PART_COUNT)
    } else {
        size
    }
}

/// Part size for downloading `total` bytes: the request (or the default),
/// raised until the part count fits the same cap uploads use.
pub fn download_part_size(requested: u64, total: u64) -> u64 {
    let size = if requested == 0 {
        DEFAULT_PART_SIZE
    } else {
        requested
    };
    size.max(total.div_ceil(MAX_PART_COUNT))
}

/// Whether `parts` are numbered 1..=n and cover `[0, total)` without gaps or overlap.
pub fn is_tiling(parts: &[PartRecord], total: u64) -> bool {
    let mut next = 0u64;
    for (i, part) in parts.iter().enumerate() {
        if part.part_number as usize != i + 1 || part.offset != next {
            return false;
        }
        next = part.offset + part.size;
    }
    next == total
}
