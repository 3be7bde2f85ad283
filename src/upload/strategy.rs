//! Simple vs. multipart decision and part sizing

use super::UploadError;
use crate::s3::MAX_SINGLE_PUT_SIZE;

/// Minimum part size (5MB) - S3 requirement for every part but the last
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum part size (5GB)
pub const MAX_PART_SIZE: u64 = MAX_SINGLE_PUT_SIZE;

/// Maximum parts allowed
pub const MAX_PARTS: u64 = 10_000;

/// Part size used when nothing is configured
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStrategy {
    /// One PUT with the whole body
    Simple,
    /// Initiate, upload parts, complete
    Multipart,
}

/// Pick the upload strategy; a payload exactly `part_size` long is still simple
pub fn select_strategy(size: u64, part_size: u64) -> UploadStrategy {
    if size <= part_size {
        UploadStrategy::Simple
    } else {
        UploadStrategy::Multipart
    }
}

/// Number of parts `size` bytes split into
pub fn part_count(size: u64, part_size: u64) -> u64 {
    if part_size == 0 {
        return 0;
    }
    size.div_ceil(part_size)
}

/// Check that `size` bytes cut into `part_size` parts is a valid multipart
/// layout: part size within S3 limits and at most `MAX_PARTS` parts
pub fn check_part_layout(size: u64, part_size: u64) -> Result<(), UploadError> {
    if part_size < MIN_PART_SIZE {
        return Err(UploadError::PartTooSmall {
            part_size,
            minimum: MIN_PART_SIZE,
        });
    }
    if part_size > MAX_PART_SIZE {
        return Err(UploadError::InvalidOptions(format!(
            "part size {} exceeds the maximum of {} bytes",
            part_size, MAX_PART_SIZE
        )));
    }
    let parts = part_count(size, part_size);
    if parts > MAX_PARTS {
        return Err(UploadError::TooManyParts {
            parts,
            maximum: MAX_PARTS,
        });
    }
    Ok(())
}

/// Resolve the part size for an upload of `size` bytes
///
/// An explicit `requested` size is validated as-is. Without one, `default`
/// grows until the upload fits in `MAX_PARTS` parts.
pub fn resolve_part_size(
    size: u64,
    requested: Option<u64>,
    default: u64,
) -> Result<u64, UploadError> {
    match requested {
        Some(part_size) => {
            check_part_layout(size, part_size)?;
            Ok(part_size)
        }
        None => {
            let part_size = default
                .max(MIN_PART_SIZE)
                .max(size.div_ceil(MAX_PARTS));
            if part_size > MAX_PART_SIZE {
                return Err(UploadError::ObjectTooLarge {
                    size,
                    maximum: MAX_PART_SIZE * MAX_PARTS,
                });
            }
            Ok(part_size)
        }
    }
}
