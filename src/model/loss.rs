//! Windowed softmax cross-entropy for class-incremental heads.

use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// How global labels are mapped into the local window of the current task.
///
/// The two schemes are not interchangeable: `Offset` assumes globally unique labels per task,
/// `Modulo` assumes label ids are recycled across tasks.
pub enum LabelScheme {
    /// `local = label - offset`; a label outside of the window is an error.
    Offset,
    /// `local = label % classes`.
    Modulo,
}

impl Default for LabelScheme {
    fn default() -> Self {
        LabelScheme::Offset
    }
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to the task window bookkeeping.
pub enum LossError {
    #[error("label {label} is outside of the task window [{start}, {end})")]
    LabelOutOfWindow {
        label: usize,
        start: usize,
        end: usize,
    },
    #[error("the task window [{start}, {end}) exceeds the {classes} outputs of the head")]
    WindowOutOfHead {
        start: usize,
        end: usize,
        classes: usize,
    },
    #[error("the batch has {logits} rows of logits but {labels} labels")]
    BatchMismatch { logits: usize, labels: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// The slice `[offset, offset + classes)` of the shared head owned by the current task.
pub struct TaskWindow {
    pub offset: usize,
    pub classes: usize,
}

impl TaskWindow {
    /// Creates a new window.
    pub fn new(offset: usize, classes: usize) -> Self {
        Self { offset, classes }
    }

    /// The global class range of this window.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.classes
    }

    /// The exclusive upper bound of this window, i.e. the number of classes seen so far.
    pub fn end(&self) -> usize {
        self.offset + self.classes
    }

    /// Maps a global label into this window.
    ///
    /// # Errors
    /// Fails with the `Offset` scheme if the label lies outside of the window.
    pub fn local_label(&self, label: usize, scheme: LabelScheme) -> Result<usize, LossError> {
        match scheme {
            LabelScheme::Offset if self.range().contains(&label) => Ok(label - self.offset),
            LabelScheme::Modulo if self.classes > 0 => Ok(label % self.classes),
            _ => Err(LossError::LabelOutOfWindow {
                label,
                start: self.offset,
                end: self.end(),
            }),
        }
    }

    /// Maps a local label of this window back to the global label space.
    pub fn global_label(&self, local: usize) -> usize {
        self.offset + local
    }
}

/// Computes the row-wise softmax of a batch of logits.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.rows_mut() {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    probs
}

/// Computes the mean cross-entropy of a batch against local labels and its gradient.
///
/// The logits must already be restricted to the label space the local labels index into.
pub fn cross_entropy(logits: ArrayView2<f32>, local_labels: &[usize]) -> (f32, Array2<f32>) {
    let batch = local_labels.len().max(1) as f32;
    let mut grad = softmax(logits);
    let mut loss = 0.;
    for (mut row, &label) in grad.rows_mut().into_iter().zip(local_labels) {
        loss -= row[label].max(f32::MIN_POSITIVE).ln();
        row[label] -= 1.;
    }
    grad.mapv_inplace(|g| g / batch);
    (loss / batch, grad)
}

/// Computes the cross-entropy of the logits sliced to the task window.
///
/// Returns the mean loss and the gradient with respect to the full logits; columns outside of the
/// window get a zero gradient.
///
/// # Errors
/// Fails if the window does not fit into the head, if a label can't be mapped into the window, or
/// if the number of labels does not match the batch.
pub fn windowed_cross_entropy(
    logits: ArrayView2<f32>,
    labels: &[usize],
    window: TaskWindow,
    scheme: LabelScheme,
) -> Result<(f32, Array2<f32>), LossError> {
    if window.end() > logits.ncols() {
        return Err(LossError::WindowOutOfHead {
            start: window.offset,
            end: window.end(),
            classes: logits.ncols(),
        });
    }
    if logits.nrows() != labels.len() {
        return Err(LossError::BatchMismatch {
            logits: logits.nrows(),
            labels: labels.len(),
        });
    }
    let local = labels
        .iter()
        .map(|&label| window.local_label(label, scheme))
        .collect::<Result<Vec<_>, _>>()?;

    let (loss, window_grad) = cross_entropy(logits.slice(s![.., window.range()]), &local);
    let mut grad = Array2::zeros(logits.raw_dim());
    grad.slice_mut(s![.., window.range()]).assign(&window_grad);
    Ok((loss, grad))
}

/// Predicts the global class of every row among the first `classes` outputs of the head.
pub fn predict(logits: ArrayView2<f32>, classes: usize) -> Vec<usize> {
    logits
        .slice(s![.., ..classes.min(logits.ncols())])
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &x)| {
                    if x > best.1 {
                        (i, x)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn test_local_label_offset() {
        let window = TaskWindow::new(10, 5);
        assert_eq!(window.local_label(12, LabelScheme::Offset), Ok(2));
        assert_eq!(
            window.local_label(3, LabelScheme::Offset),
            Err(LossError::LabelOutOfWindow {
                label: 3,
                start: 10,
                end: 15
            })
        );
        assert!(window.local_label(15, LabelScheme::Offset).is_err());
        assert_eq!(window.global_label(2), 12);
    }

    #[test]
    fn test_local_label_modulo() {
        let window = TaskWindow::new(10, 5);
        assert_eq!(window.local_label(12, LabelScheme::Modulo), Ok(2));
        assert_eq!(window.local_label(3, LabelScheme::Modulo), Ok(3));
        assert!(TaskWindow::new(0, 0)
            .local_label(3, LabelScheme::Modulo)
            .is_err());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let probs = softmax(array![[1., 2., 3.], [1000., 1000., 1000.]].view());
        for row in probs.rows() {
            assert!((row.sum() - 1.).abs() < 1e-6);
        }
        assert!((probs[[1, 0]] - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn test_cross_entropy_uniform() {
        let (loss, grad) = cross_entropy(array![[0., 0.]].view(), &[1]);
        assert!((loss - 2_f32.ln()).abs() < 1e-6);
        assert!((grad[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((grad[[0, 1]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_windowed_cross_entropy_masks_other_tasks() {
        let logits = array![[5., 5., 0., 0.], [5., 5., 0., 0.]];
        let (loss, grad) =
            windowed_cross_entropy(logits.view(), &[2, 3], TaskWindow::new(2, 2), LabelScheme::Offset)
                .unwrap();
        assert!((loss - 2_f32.ln()).abs() < 1e-6);
        assert_eq!(grad.column(0), array![0., 0.]);
        assert_eq!(grad.column(1), array![0., 0.]);
        assert!((grad[[0, 2]] + 0.25).abs() < 1e-6);
        assert!((grad[[1, 3]] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_windowed_cross_entropy_errors() {
        let logits = array![[0., 0., 0.]];
        assert!(matches!(
            windowed_cross_entropy(logits.view(), &[0], TaskWindow::new(2, 2), LabelScheme::Offset),
            Err(LossError::WindowOutOfHead { .. })
        ));
        assert!(matches!(
            windowed_cross_entropy(logits.view(), &[0], TaskWindow::new(1, 2), LabelScheme::Offset),
            Err(LossError::LabelOutOfWindow { label: 0, .. })
        ));
        assert!(matches!(
            windowed_cross_entropy(logits.view(), &[1, 2], TaskWindow::new(1, 2), LabelScheme::Offset),
            Err(LossError::BatchMismatch { .. })
        ));
    }

    #[test]
    fn test_predict_restricts_to_seen_classes() {
        let logits = array![[0., 1., 9.], [2., 1., 9.]];
        assert_eq!(predict(logits.view(), 2), vec![1, 0]);
        assert_eq!(predict(logits.view(), 3), vec![2, 2]);
    }
}
