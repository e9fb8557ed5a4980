//! The request transform: sort an integer array.
//!
//! Deliberately quadratic so that every request carries a predictable,
//! size-dependent CPU cost. Engines only see the [`Transform`] trait, which
//! lets tests substitute a transform with artificial latency.

/// CPU-bound work applied to every request payload on a worker thread.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, values: &mut [i32]);
}

/// Ascending exchange sort, O(n^2) comparisons.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadraticSort;

impl Transform for QuadraticSort {
    fn apply(&self, values: &mut [i32]) {
        sort_in_place(values);
    }
}

/// Sort `values` ascending by pairwise exchange.
pub fn sort_in_place(values: &mut [i32]) {
    for i in 0..values.len() {
        for j in i + 1..values.len() {
            if values[i] > values[j] {
                values.swap(i, j);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(a: &[i32], b: &[i32]) -> bool {
        let mut a = a.to_vec();
        let mut b = b.to_vec();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }

    #[test]
    fn test_sort_example() {
        let mut values = vec![5, 3, 3, 1];
        sort_in_place(&mut values);
        assert_eq!(values, vec![1, 3, 3, 5]);
    }

    #[test]
    fn test_sort_edge_cases() {
        let mut empty: Vec<i32> = vec![];
        sort_in_place(&mut empty);
        assert!(empty.is_empty());

        let mut single = vec![7];
        sort_in_place(&mut single);
        assert_eq!(single, vec![7]);

        let mut extremes = vec![i32::MAX, 0, i32::MIN, -1, i32::MAX];
        sort_in_place(&mut extremes);
        assert_eq!(extremes, vec![i32::MIN, -1, 0, i32::MAX, i32::MAX]);
    }

    #[test]
    fn test_sort_is_ordered_permutation() {
        // Deterministic pseudo-random inputs of varying length
        let mut seed: u32 = 0x9e37_79b9;
        for len in [2usize, 3, 17, 64, 257] {
            let input: Vec<i32> = (0..len)
                .map(|_| {
                    seed ^= seed << 13;
                    seed ^= seed >> 17;
                    seed ^= seed << 5;
                    (seed % 1000) as i32 - 500
                })
                .collect();

            let mut output = input.clone();
            QuadraticSort.apply(&mut output);

            assert!(output.windows(2).all(|w| w[0] <= w[1]));
            assert!(is_permutation(&input, &output));
        }
    }
}
