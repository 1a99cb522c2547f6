//! # Branchless Key Scan
//!
//! Node pages store their key/value pairs interleaved, with keys at even
//! word offsets. The lookup primitive over that layout is "index of the
//! first key not less than the target", shared by internal routing and leaf
//! search.
//!
//! Because keys within the live prefix are sorted and non-zero, the answer
//! equals the number of keys strictly below the target. The scan counts
//! those in unrolled chunks of four: the four comparisons in a chunk carry
//! no data dependency and compile to branch-free code, and a chunk whose
//! last key already reaches the target ends the scan. Nodes with fewer than
//! four live entries take a plain early-exit loop instead.

/// Number of entries folded into one unrolled step.
pub const CHUNK: usize = 4;

/// Returns the index of the first of the `num_keys` live entries whose key
/// is `>= target`, or `num_keys` if every key is below it.
///
/// `pairs` is the interleaved pair area of a node; entry `i`'s key lives at
/// `pairs[2 * i]`.
pub fn first_ge(pairs: &[u64], num_keys: usize, target: u64) -> usize {
    debug_assert!(pairs.len() >= 2 * num_keys);

    if num_keys < CHUNK {
        for i in 0..num_keys {
            if pairs[2 * i] >= target {
                return i;
            }
        }
        return num_keys;
    }

    let mut below = 0usize;
    let mut i = 0usize;
    while i + CHUNK <= num_keys {
        let base = 2 * i;
        below += (pairs[base] < target) as usize
            + (pairs[base + 2] < target) as usize
            + (pairs[base + 4] < target) as usize
            + (pairs[base + 6] < target) as usize;
        if pairs[base + 6] >= target {
            return below;
        }
        i += CHUNK;
    }
    while i < num_keys {
        below += (pairs[2 * i] < target) as usize;
        i += 1;
    }
    below
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(keys: &[u64], target: u64) -> usize {
        keys.iter().position(|&k| k >= target).unwrap_or(keys.len())
    }

    fn interleave(keys: &[u64]) -> Vec<u64> {
        let mut pairs = Vec::with_capacity(2 * keys.len());
        for (i, &k) in keys.iter().enumerate() {
            pairs.push(k);
            pairs.push(0xDEAD_0000 + i as u64);
        }
        pairs
    }

    #[test]
    fn empty_prefix_returns_zero() {
        assert_eq!(first_ge(&[], 0, 42), 0);
    }

    #[test]
    fn matches_naive_scan_for_all_sizes() {
        let mut keys = Vec::new();
        for n in 1..=20u64 {
            keys.push(n * 7 + 1);
            let pairs = interleave(&keys);
            for probe in 0..keys.last().unwrap() + 3 {
                assert_eq!(
                    first_ge(&pairs, keys.len(), probe),
                    naive(&keys, probe),
                    "n={} probe={}",
                    n,
                    probe
                );
            }
        }
    }

    #[test]
    fn target_beyond_all_keys_returns_count() {
        let keys = [2u64, 4, 6, 8, 10, 12, 14];
        let pairs = interleave(&keys);
        assert_eq!(first_ge(&pairs, keys.len(), 100), keys.len());
    }

    #[test]
    fn ignores_entries_past_the_live_prefix() {
        let keys = [5u64, 9, 13, 0, 0];
        let pairs = interleave(&keys);
        assert_eq!(first_ge(&pairs, 3, 14), 3);
        assert_eq!(first_ge(&pairs, 3, 9), 1);
    }

    #[test]
    fn max_sentinel_always_terminates_search() {
        let keys = [3u64, 7, 11, 15, u64::MAX];
        let pairs = interleave(&keys);
        assert_eq!(first_ge(&pairs, keys.len(), u64::MAX - 1), 4);
        assert_eq!(first_ge(&pairs, keys.len(), 2), 0);
    }
}
