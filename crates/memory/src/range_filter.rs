//! Similarity-based truncation of ranked search results.

/// Truncate a descending-score list by two gates:
///
/// * `take` is the largest prefix length whose population standard deviation
///   of scores is strictly below `max_std` (running sum / sum-of-squares, no
///   second pass);
/// * within that prefix, only items scoring strictly above
///   `scores[0] - max_range` are retained.
///
/// Because scores are descending, the retained items are always a prefix of
/// the input.  Empty input yields empty output.
pub fn range_filter<T>(ranked: Vec<(f32, T)>, max_range: f32, max_std: f32) -> Vec<T> {
    if ranked.is_empty() {
        return Vec::new();
    }

    let floor = ranked[0].0 - max_range;

    let mut sum = 0.0f64;
    let mut square_sum = 0.0f64;
    let mut take = 0usize;
    for (i, (score, _)) in ranked.iter().enumerate() {
        let s = f64::from(*score);
        sum += s;
        square_sum += s * s;
        let d = (i + 1) as f64;
        // Population variance over the prefix; clamp away the tiny negative
        // values floating-point cancellation can produce.
        let variance = ((square_sum - sum * sum / d) / d).max(0.0);
        if variance.sqrt() < f64::from(max_std) {
            take = i + 1;
        }
    }

    ranked
        .into_iter()
        .take(take)
        .filter(|(score, _)| *score > floor)
        .map(|(_, item)| item)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(scores: &[f32]) -> Vec<(f32, f32)> {
        scores.iter().map(|s| (*s, *s)).collect()
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(range_filter::<u8>(Vec::new(), 1.0, 1.0).is_empty());
    }

    #[test]
    fn single_element_passes() {
        assert_eq!(range_filter(scored(&[0.4]), 0.0, 1.0), vec![0.4]);
    }

    #[test]
    fn infinite_gates_keep_everything() {
        let input = scored(&[0.9, 0.5, 0.1, -0.3]);
        let out = range_filter(input, f32::INFINITY, f32::INFINITY);
        assert_eq!(out, vec![0.9, 0.5, 0.1, -0.3]);
    }

    #[test]
    fn range_gate_drops_distant_tail() {
        // stddev over all three is small, so take = 3; the range gate then
        // drops 0.4 because 0.9 - 0.2 = 0.7 and retention is strict.
        let out = range_filter(scored(&[0.9, 0.85, 0.4]), 0.2, 1.0);
        assert_eq!(out, vec![0.9, 0.85]);
    }

    #[test]
    fn stddev_gate_limits_the_prefix() {
        // Prefix [1.0, 0.98] has stddev 0.01 < 0.05; adding 0.0 blows it up.
        let out = range_filter(scored(&[1.0, 0.98, 0.0]), 10.0, 0.05);
        assert_eq!(out, vec![1.0, 0.98]);
    }

    #[test]
    fn zero_stddev_gate_admits_nothing() {
        // Even a single element has stddev 0, which is not strictly below 0.
        assert!(range_filter(scored(&[0.9, 0.8]), 1.0, 0.0).is_empty());
    }

    #[test]
    fn output_is_a_prefix_of_input() {
        let input = scored(&[0.9, 0.7, 0.6, 0.55, 0.2]);
        let out = range_filter(input.clone(), 0.25, 0.5);
        let prefix: Vec<f32> = input.iter().map(|(_, v)| *v).take(out.len()).collect();
        assert_eq!(out, prefix);
        for v in &out {
            assert!(0.9 - v <= 0.25);
        }
    }
}
