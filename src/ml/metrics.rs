use super::Tensor;

/// Classification metrics for evaluating model performance
pub struct ClassificationMetrics;

impl ClassificationMetrics {
    /// Calculates accuracy for multi-class classification.
    ///
    /// # Arguments
    /// * `predictions` - Model output, shape [batch, n_classes] or [batch] labels
    /// * `targets` - Ground truth, shape [batch, n_classes] (one-hot) or [batch] (labels)
    ///
    /// # Returns
    /// Accuracy as f32 (0.0 to 1.0)
    ///
    /// # Examples
    /// ```
    /// use finetune_ml::ml::{metrics::ClassificationMetrics, Tensor};
    ///
    /// let preds = Tensor::new(vec![0.1, 0.9, 0.8, 0.2], vec![2, 2]);
    /// let targets = Tensor::new(vec![0.0, 1.0, 0.0, 1.0], vec![2, 2]);
    /// assert_eq!(ClassificationMetrics::accuracy(&preds, &targets), 0.5);
    /// ```
    pub fn accuracy(predictions: &Tensor, targets: &Tensor) -> f32 {
        let pred_labels = Self::labels(predictions);
        let true_labels = Self::labels(targets);

        assert_eq!(
            pred_labels.len(),
            true_labels.len(),
            "Predictions and targets must have same batch size"
        );

        let correct = pred_labels
            .data
            .iter()
            .zip(true_labels.data.iter())
            .filter(|&(a, b)| (a - b).abs() < 1e-6)
            .count();

        correct as f32 / pred_labels.len() as f32
    }

    /// Accuracy of a single-logit binary classifier: a logit above zero
    /// predicts the positive class, a target above 0.5 is positive.
    pub fn binary_accuracy(logits: &Tensor, targets: &Tensor) -> f32 {
        assert_eq!(logits.len(), targets.len(), "logits and targets differ in size");

        let correct = logits
            .data
            .iter()
            .zip(targets.data.iter())
            .filter(|&(&x, &t)| (x > 0.0) == (t > 0.5))
            .count();

        correct as f32 / logits.len() as f32
    }

    /// Calculates top-k accuracy for classification tasks.
    ///
    /// # Arguments
    /// * `predictions` - Model output, shape [batch, n_classes]
    /// * `targets` - Ground truth labels, shape [batch] or [batch, n_classes]
    /// * `k` - Number of top predictions to consider
    pub fn top_k_accuracy(predictions: &Tensor, targets: &Tensor, k: usize) -> f32 {
        assert!(
            predictions.shape.len() == 2,
            "Predictions must be 2D [batch, n_classes]"
        );
        let batch_size = predictions.shape[0];
        let n_classes = predictions.shape[1];

        assert!(k <= n_classes, "k must be <= number of classes");

        let true_labels = Self::labels(targets);

        let mut correct = 0;
        for (row, &label) in predictions.data.chunks(n_classes).zip(true_labels.data.iter()) {
            if top_k(row, k).iter().any(|(idx, _)| *idx == label as usize) {
                correct += 1;
            }
        }

        correct as f32 / batch_size as f32
    }

    /// Label indices from either labels `[batch]` or scores `[batch, n]`.
    fn labels(t: &Tensor) -> Tensor {
        if t.shape.len() == 1 {
            t.clone()
        } else {
            t.argmax(Some(t.shape.len() - 1))
        }
    }
}

/// The `k` largest entries of `row` as `(index, value)`, highest first.
pub fn top_k(row: &[f32], k: usize) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

/// Convenience function for accuracy calculation
pub fn accuracy(predictions: &Tensor, targets: &Tensor) -> f32 {
    ClassificationMetrics::accuracy(predictions, targets)
}

/// Convenience function for binary accuracy calculation
pub fn binary_accuracy(logits: &Tensor, targets: &Tensor) -> f32 {
    ClassificationMetrics::binary_accuracy(logits, targets)
}

/// Convenience function for top-k accuracy calculation
pub fn top_k_accuracy(predictions: &Tensor, targets: &Tensor, k: usize) -> f32 {
    ClassificationMetrics::top_k_accuracy(predictions, targets, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_accuracy_thresholds_logits_at_zero() {
        let logits = Tensor::new(vec![2.0, -1.0, 0.5, -0.2], vec![4, 1]);
        let targets = Tensor::new(vec![1.0, 0.0, 0.0, 0.0], vec![4, 1]);
        assert_eq!(binary_accuracy(&logits, &targets), 0.75);
    }

    #[test]
    fn top_k_counts_label_within_best_k() {
        let preds = Tensor::new(vec![0.1, 0.5, 0.4, 0.7, 0.2, 0.1], vec![2, 3]);
        let targets = Tensor::new(vec![2.0, 2.0], vec![2]);
        assert_eq!(top_k_accuracy(&preds, &targets, 1), 0.0);
        assert_eq!(top_k_accuracy(&preds, &targets, 2), 0.5);
        assert_eq!(top_k_accuracy(&preds, &targets, 3), 1.0);
    }
}
