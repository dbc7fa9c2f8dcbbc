//! Size arithmetic and formatting helpers.

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Like [`align_up`], but `None` if the result does not fit in a `u64`.
#[inline]
pub fn checked_align_up(value: u64, alignment: u64) -> Option<u64> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|padded| padded & !(alignment - 1))
}

/// Smallest `nominal * 2^k` that is at least `size`, or `None` if that overflows.
pub fn grow_to_fit(nominal: u64, size: u64) -> Option<u64> {
    let mut grown = nominal.max(1);
    while grown < size {
        grown = grown.checked_mul(2)?;
    }
    Some(grown)
}

/// Formats a byte count for log output, e.g. `1.50 MB`.
pub fn format_memory_size(bytes: u64, precision: usize) -> String {
    if bytes >= GIB {
        format!("{:.*} GB", precision, bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.*} MB", precision, bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.*} KB", precision, bytes as f64 / KIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 16), 272);
        assert_eq!(align_up(1000, 1), 1000);
    }

    #[test]
    fn test_grow_to_fit() {
        assert_eq!(grow_to_fit(64 * KIB, 100 * KIB), Some(128 * KIB));
        assert_eq!(grow_to_fit(64 * KIB, 64 * KIB), Some(64 * KIB));
        assert_eq!(grow_to_fit(64 * KIB, 1), Some(64 * KIB));
        assert_eq!(grow_to_fit(64 * KIB, 129 * KIB), Some(256 * KIB));
        assert_eq!(grow_to_fit(64 * KIB, 1 << 63), Some(1 << 63));
    }

    #[test]
    fn test_grow_to_fit_overflow() {
        assert_eq!(grow_to_fit(64 * KIB, (1 << 63) + 1), None);
        assert_eq!(grow_to_fit(3, u64::MAX), None);
    }

    #[test]
    fn test_checked_align_up() {
        assert_eq!(checked_align_up(257, 16), Some(272));
        assert_eq!(checked_align_up(u64::MAX - 4, 1), Some(u64::MAX - 4));
        assert_eq!(checked_align_up(u64::MAX - 4, 16), None);
    }

    #[test]
    fn test_format_memory_size() {
        assert_eq!(format_memory_size(512, 2), "512 bytes");
        assert_eq!(format_memory_size(64 * KIB, 1), "64.0 KB");
        assert_eq!(format_memory_size(3 * MIB / 2, 2), "1.50 MB");
        assert_eq!(format_memory_size(2 * GIB, 0), "2 GB");
    }
}
