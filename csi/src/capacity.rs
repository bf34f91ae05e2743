//! Capacity-range resolution for CreateVolume and GetCapacity.
//!
//! Standalone and unit-testable by design, mirroring how the teacher
//! keeps pure sizing/parsing logic (e.g. `findmnt.rs`'s `key_adjusted_value`)
//! separate from anything that touches the host.

use crate::error::CsiError;

pub const DEFAULT_VOLUME_SIZE: u64 = bytesize::GIB;
pub const MIN_VOLUME_SIZE: u64 = bytesize::GIB;
pub const MAX_VOLUME_SIZE: u64 = 200 * bytesize::GIB;
pub const MAX_VOLUMES_PER_NODE: i64 = 200;

/// Resolve a CSI `CapacityRange` (required/limit, either of which may be
/// absent, signalled by a value of zero) to the concrete byte size to
/// allocate for a new volume.
///
/// Rule table (spec.md §4.5):
/// 1. neither set                         -> `DEFAULT_VOLUME_SIZE`
/// 2. both set, `limit < required`        -> `out_of_range`
/// 3. any set value below `MIN_VOLUME_SIZE` -> `out_of_range`
/// 4. any set value above `MAX_VOLUME_SIZE` -> `out_of_range`
/// 5. both set and equal                  -> that value
/// 6. only `limit` set                    -> `limit`
/// 7. only `required` set                 -> `required`
/// 8. both set and unequal                -> `limit` (tightest upper bound satisfying `required`)
pub fn resolve_volume_size(required_bytes: i64, limit_bytes: i64) -> Result<u64, CsiError> {
    if required_bytes < 0 || limit_bytes < 0 {
        return Err(CsiError::invalid_argument(
            "capacity_range bytes must not be negative",
        ));
    }
    let required = required_bytes as u64;
    let limit = limit_bytes as u64;

    for set_value in [required, limit].iter().filter(|v| **v > 0) {
        if *set_value < MIN_VOLUME_SIZE {
            return Err(CsiError::out_of_range(format!(
                "capacity_range value {} is below minimum volume size {}",
                set_value, MIN_VOLUME_SIZE
            )));
        }
        if *set_value > MAX_VOLUME_SIZE {
            return Err(CsiError::out_of_range(format!(
                "capacity_range value {} exceeds maximum volume size {}",
                set_value, MAX_VOLUME_SIZE
            )));
        }
    }

    let size = match (required, limit) {
        (0, 0) => DEFAULT_VOLUME_SIZE,
        (required, 0) => required,
        (0, limit) => limit,
        (required, limit) if limit < required => {
            return Err(CsiError::out_of_range(format!(
                "limit_bytes {} is below required_bytes {}",
                limit, required
            )))
        }
        (_required, limit) => limit,
    };

    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn no_bounds_uses_default() {
        assert_eq!(resolve_volume_size(0, 0).unwrap(), DEFAULT_VOLUME_SIZE);
    }

    #[test]
    fn required_only() {
        let required = 5 * bytesize::GIB;
        assert_eq!(resolve_volume_size(required as i64, 0).unwrap(), required);
    }

    #[test]
    fn limit_only() {
        let limit = 5 * bytesize::GIB;
        assert_eq!(resolve_volume_size(0, limit as i64).unwrap(), limit);
    }

    #[test]
    fn both_equal() {
        let value = 2 * bytesize::GIB;
        assert_eq!(
            resolve_volume_size(value as i64, value as i64).unwrap(),
            value
        );
    }

    #[test]
    fn both_unequal_uses_limit() {
        let required = 2 * bytesize::GIB;
        let limit = 5 * bytesize::GIB;
        assert_eq!(
            resolve_volume_size(required as i64, limit as i64).unwrap(),
            limit
        );
    }

    #[test]
    fn limit_below_required_is_out_of_range() {
        let required = 6 * bytesize::GIB;
        let limit = 5 * bytesize::GIB;
        assert_matches!(
            resolve_volume_size(required as i64, limit as i64),
            Err(CsiError::OutOfRange { .. })
        );
    }

    #[test]
    fn required_below_minimum() {
        let required = 100 * bytesize::MIB;
        assert_matches!(
            resolve_volume_size(required as i64, 0),
            Err(CsiError::OutOfRange { .. })
        );
    }

    #[test]
    fn limit_below_minimum() {
        let limit = 100 * bytesize::MIB;
        assert_matches!(
            resolve_volume_size(0, limit as i64),
            Err(CsiError::OutOfRange { .. })
        );
    }

    #[test]
    fn required_above_maximum() {
        let required = 201 * bytesize::GIB;
        assert_matches!(
            resolve_volume_size(required as i64, 0),
            Err(CsiError::OutOfRange { .. })
        );
    }

    #[test]
    fn limit_above_maximum() {
        let limit = 201 * bytesize::GIB;
        assert_matches!(
            resolve_volume_size(0, limit as i64),
            Err(CsiError::OutOfRange { .. })
        );
    }

    #[test]
    fn negative_bytes_rejected() {
        assert_matches!(
            resolve_volume_size(-1, 0),
            Err(CsiError::InvalidArgument { .. })
        );
    }
}
