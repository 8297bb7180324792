//! Classification metrics for evaluation results.

use serde::{Deserialize, Serialize};

/// Micro/macro averaged score pair.
///
/// Micro aggregates counts globally before computing the ratio; macro
/// averages per-class scores equally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedScores {
    pub micro: f64,
    #[serde(rename = "macro")]
    pub macro_avg: f64,
}

/// Evaluation result for one dataset split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub accuracy: f64,
    pub precision: AveragedScores,
    pub recall: AveragedScores,
}

/// Compute accuracy plus micro/macro precision and recall from predicted vs.
/// true labels. Zero-division cases contribute 0.0 instead of failing.
pub fn classification_report(
    true_labels: &[usize],
    predicted_labels: &[usize],
    num_classes: usize,
) -> EvalReport {
    let total = true_labels.len();
    let mut true_positives = vec![0usize; num_classes];
    let mut false_positives = vec![0usize; num_classes];
    let mut false_negatives = vec![0usize; num_classes];
    let mut correct = 0usize;

    for (&truth, &predicted) in true_labels.iter().zip(predicted_labels.iter()) {
        if truth == predicted {
            correct += 1;
            true_positives[truth] += 1;
        } else {
            false_positives[predicted] += 1;
            false_negatives[truth] += 1;
        }
    }

    let accuracy = ratio(correct, total);

    let tp_sum: usize = true_positives.iter().sum();
    let fp_sum: usize = false_positives.iter().sum();
    let fn_sum: usize = false_negatives.iter().sum();

    let precision = AveragedScores {
        micro: ratio(tp_sum, tp_sum + fp_sum),
        macro_avg: macro_average(&true_positives, &false_positives),
    };
    let recall = AveragedScores {
        micro: ratio(tp_sum, tp_sum + fn_sum),
        macro_avg: macro_average(&true_positives, &false_negatives),
    };

    EvalReport {
        accuracy,
        precision,
        recall,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn macro_average(true_positives: &[usize], errors: &[usize]) -> f64 {
    if true_positives.is_empty() {
        return 0.0;
    }
    let sum: f64 = true_positives
        .iter()
        .zip(errors.iter())
        .map(|(&tp, &err)| ratio(tp, tp + err))
        .sum();
    sum / true_positives.len() as f64
}
