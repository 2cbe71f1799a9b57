//! Maps current file size to a target batch payload size using a
//! monotone non-decreasing step table. Pure function: no state, no I/O.

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

const TIERS: [(u64, u64); 4] = [
    (5 * GIB, 50 * MIB),
    (25 * GIB, 100 * MIB),
    (100 * GIB, 250 * MIB),
    (500 * GIB, 500 * MIB),
];
const TOP_TARGET: u64 = 1 * GIB;

/// Target batch payload size for a file of `current_size_bytes`.
///
/// | file size            | target  |
/// |-----------------------|---------|
/// | < 5 GiB               | 50 MiB  |
/// | < 25 GiB              | 100 MiB |
/// | < 100 GiB             | 250 MiB |
/// | < 500 GiB             | 500 MiB |
/// | >= 500 GiB             | 1 GiB   |
///
/// For any `a <= b`, `target(a) <= target(b)`.
pub fn target_batch_size(current_size_bytes: u64) -> u64 {
    for (ceiling, target) in TIERS {
        if current_size_bytes < ceiling {
            return target;
        }
    }
    TOP_TARGET
}
