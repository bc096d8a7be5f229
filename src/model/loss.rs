use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

/// Probabilities are clipped to [EPSILON, 1 - EPSILON] before taking the log
const EPSILON: f32 = 1e-7;

/// Softmax over every row - Convert scores into probability distributions
pub fn softmax(scores: &ArrayView2<f32>) -> Array2<f32> {
    let mut out = scores.to_owned();

    for mut row in out.axis_iter_mut(Axis(0)) {
        // Shift by the max so exp never overflows to inf
        let max = row.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row /= sum;
    }

    out
}

/// Mean sparse categorical cross-entropy of a batch of probability rows
pub fn cross_entropy(probabilities: &ArrayView2<f32>, labels: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }

    let total: f32 = probabilities
        .axis_iter(Axis(0))
        .zip(labels)
        .map(|(row, &label)| -row[label].clamp(EPSILON, 1.0 - EPSILON).ln())
        .sum();

    total / labels.len() as f32
}

/// Gradient of the mean cross-entropy with respect to the pre-softmax scores
pub fn cross_entropy_grad(probabilities: &ArrayView2<f32>, labels: &[usize]) -> Array2<f32> {
    let mut grad = probabilities.to_owned();
    for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(labels) {
        row[label] -= 1.0;
    }

    grad / labels.len().max(1) as f32
}

pub fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Number of rows whose most probable class is the label
pub fn count_correct(probabilities: &ArrayView2<f32>, labels: &[usize]) -> usize {
    probabilities
        .axis_iter(Axis(0))
        .zip(labels)
        .filter(|(row, &label)| argmax(row.view()) == label)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one() {
        let scores = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, -1000.0]];
        let probs = softmax(&scores.view());

        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((probs[[1, 0]] - 0.5).abs() < 1e-6);
        assert!(probs[[0, 2]] > probs[[0, 1]]);
    }

    #[test]
    fn cross_entropy_matches_negative_log() {
        let probs = array![[0.25, 0.75], [0.5, 0.5]];
        let loss = cross_entropy(&probs.view(), &[1, 0]);
        let expected = -(0.75f32.ln() + 0.5f32.ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_is_finite_for_zero_probability() {
        let probs = array![[1.0, 0.0]];
        let loss = cross_entropy(&probs.view(), &[1]);
        assert!(loss.is_finite());
        assert!((loss - 16.118095).abs() < 1e-3);
    }

    #[test]
    fn gradient_subtracts_one_hot_and_averages() {
        let probs = array![[0.2, 0.8], [0.6, 0.4]];
        let grad = cross_entropy_grad(&probs.view(), &[1, 0]);
        let expected = array![[0.1f32, -0.1], [-0.2, 0.2]];
        for (a, b) in grad.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn counts_correct_predictions() {
        let probs = array![[0.1, 0.9], [0.7, 0.3], [0.4, 0.6]];
        assert_eq!(count_correct(&probs.view(), &[1, 0, 0]), 2);
    }
}
