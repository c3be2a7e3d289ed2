//! Blocked exclusive prefix sum.
//!
//! Mirrors the two-level structure of a device scan: an independent
//! exclusive scan inside each thread block, a scan of the per-block
//! totals, then a block-offset add pass. The pass split is the barrier
//! a real scan needs between its scan and write-back phases.

use rayon::prelude::*;

/// Exclusive prefix sum of `flags` into `out`, scanned in blocks of
/// `block_size` elements.
///
/// Returns the total sum (the matched count when `flags` is a 0/1 match
/// mask). `out` must be at least as long as `flags`.
pub fn exclusive_scan_blocked(flags: &[i32], out: &mut [i32], block_size: usize) -> i32 {
    let n = flags.len();
    if n == 0 {
        return 0;
    }
    let block_size = block_size.max(1);
    debug_assert!(out.len() >= n);

    // Phase 1: independent exclusive scan per block, recording totals.
    let block_sums: Vec<i32> = out[..n]
        .par_chunks_mut(block_size)
        .zip(flags.par_chunks(block_size))
        .map(|(out_block, flag_block)| {
            let mut running = 0;
            for (slot, &flag) in out_block.iter_mut().zip(flag_block) {
                *slot = running;
                running += flag;
            }
            running
        })
        .collect();

    // Phase 2: scan the per-block totals into block offsets.
    let mut offsets = Vec::with_capacity(block_sums.len());
    let mut running = 0;
    for &sum in &block_sums {
        offsets.push(running);
        running += sum;
    }

    // Phase 3: add each block's offset to its elements.
    out[..n]
        .par_chunks_mut(block_size)
        .zip(offsets.par_iter())
        .for_each(|(out_block, &offset)| {
            for slot in out_block {
                *slot += offset;
            }
        });

    running
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_scan(flags: &[i32]) -> (Vec<i32>, i32) {
        let mut out = Vec::with_capacity(flags.len());
        let mut running = 0;
        for &f in flags {
            out.push(running);
            running += f;
        }
        (out, running)
    }

    #[test]
    fn test_matches_reference_across_block_sizes() {
        let flags: Vec<i32> = (0..100).map(|i| (i % 3 == 0) as i32).collect();
        let (expected, expected_total) = reference_scan(&flags);

        for block_size in [1, 2, 7, 32, 100, 1000] {
            let mut out = vec![0; flags.len()];
            let total = exclusive_scan_blocked(&flags, &mut out, block_size);
            assert_eq!(out, expected, "block_size={block_size}");
            assert_eq!(total, expected_total);
        }
    }

    #[test]
    fn test_empty_input() {
        let mut out = [0; 0];
        assert_eq!(exclusive_scan_blocked(&[], &mut out, 32), 0);
    }

    #[test]
    fn test_all_set() {
        let flags = vec![1; 17];
        let mut out = vec![0; 17];
        let total = exclusive_scan_blocked(&flags, &mut out, 4);
        assert_eq!(total, 17);
        assert_eq!(out, (0..17).collect::<Vec<i32>>());
    }
}
