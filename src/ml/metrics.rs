//! 評価指標
//!
//! テスト用パーティションに対する正解率、マクロ平均の適合率・再現率・F1、
//! 混同行列、ROC曲線を計算する。

use serde::{Deserialize, Serialize};

use crate::ml::NUM_CLASSES;

/// 行 = 正解の数字、列 = 予測した数字
pub type ConfusionMatrix = [[u32; NUM_CLASSES]; NUM_CLASSES];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RocCurve {
    pub fpr: Vec<f64>,
    pub tpr: Vec<f64>,
    /// 各点に対応するしきい値（先頭は最大スコア + 1）
    pub thresholds: Vec<f64>,
    pub auc: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassRocCurve {
    pub digit: u8,
    #[serde(flatten)]
    pub curve: RocCurve,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RocCurves {
    pub per_class: Vec<ClassRocCurve>,
    pub micro_average: Option<RocCurve>,
    pub macro_average: Option<RocCurve>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub digit: u8,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub per_class: Vec<ClassMetrics>,
    pub roc_curves: RocCurves,
}

/// 最大確率のクラスとその確率
pub fn argmax(probabilities: &[f32]) -> (usize, f32) {
    probabilities
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best })
}

pub fn confusion_matrix(y_true: &[u8], y_pred: &[u8]) -> ConfusionMatrix {
    let mut matrix = [[0u32; NUM_CLASSES]; NUM_CLASSES];
    for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
        matrix[t as usize][p as usize] += 1;
    }
    matrix
}

/// 評価レポートを作成
///
/// `probabilities` は `y_true` と同じ順序のクラス確率（各10要素）。
pub fn evaluate(y_true: &[u8], probabilities: &[Vec<f32>]) -> EvaluationReport {
    let y_pred: Vec<u8> = probabilities.iter().map(|p| argmax(p).0 as u8).collect();
    let matrix = confusion_matrix(y_true, &y_pred);

    let correct: u32 = (0..NUM_CLASSES).map(|c| matrix[c][c]).sum();
    let accuracy = if y_true.is_empty() {
        0.0
    } else {
        correct as f64 / y_true.len() as f64
    };

    let per_class = class_metrics(&matrix);
    // 正解または予測に現れたラベルのみでマクロ平均
    let present: Vec<&ClassMetrics> = per_class
        .iter()
        .filter(|m| {
            let c = m.digit as usize;
            m.support > 0 || (0..NUM_CLASSES).any(|t| matrix[t][c] > 0)
        })
        .collect();
    let mean = |f: fn(&ClassMetrics) -> f64| {
        if present.is_empty() {
            0.0
        } else {
            present.iter().map(|m| f(m)).sum::<f64>() / present.len() as f64
        }
    };

    EvaluationReport {
        accuracy,
        precision: mean(|m| m.precision),
        recall: mean(|m| m.recall),
        f1: mean(|m| m.f1),
        confusion_matrix: matrix,
        roc_curves: roc_curves(y_true, probabilities),
        per_class,
    }
}

fn class_metrics(matrix: &ConfusionMatrix) -> Vec<ClassMetrics> {
    (0..NUM_CLASSES)
        .map(|c| {
            let tp = matrix[c][c] as f64;
            let support: u32 = matrix[c].iter().sum();
            let predicted: u32 = (0..NUM_CLASSES).map(|t| matrix[t][c]).sum();

            let precision = ratio(tp, predicted as f64);
            let recall = ratio(tp, support as f64);
            let f1 = ratio(2.0 * precision * recall, precision + recall);

            ClassMetrics {
                digit: c as u8,
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect()
}

/// ゼロ除算は0
fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

pub fn roc_curves(y_true: &[u8], probabilities: &[Vec<f32>]) -> RocCurves {
    let mut per_class = Vec::new();
    for digit in 0..NUM_CLASSES {
        let positives: Vec<bool> = y_true.iter().map(|&t| t as usize == digit).collect();
        let scores: Vec<f32> = probabilities
            .iter()
            .map(|p| p.get(digit).copied().unwrap_or(0.0))
            .collect();
        if let Some(curve) = roc_curve(&positives, &scores) {
            per_class.push(ClassRocCurve {
                digit: digit as u8,
                curve,
            });
        }
    }

    // マイクロ平均: 全クラスの one-vs-rest を平坦化
    let mut flat_positives = Vec::with_capacity(y_true.len() * NUM_CLASSES);
    let mut flat_scores = Vec::with_capacity(y_true.len() * NUM_CLASSES);
    for (&t, p) in y_true.iter().zip(probabilities.iter()) {
        for digit in 0..NUM_CLASSES {
            flat_positives.push(t as usize == digit);
            flat_scores.push(p.get(digit).copied().unwrap_or(0.0));
        }
    }
    let micro_average = roc_curve(&flat_positives, &flat_scores);

    let curves: Vec<&RocCurve> = per_class.iter().map(|c| &c.curve).collect();
    let macro_average = macro_average(&curves);

    RocCurves {
        per_class,
        micro_average,
        macro_average,
    }
}

/// しきい値を下げながら (FPR, TPR) を求める
///
/// 陽性か陰性のどちらかが0件なら曲線は定義できないので `None`。
pub fn roc_curve(positives: &[bool], scores: &[f32]) -> Option<RocCurve> {
    let num_pos = positives.iter().filter(|p| **p).count();
    let num_neg = positives.len() - num_pos;
    if num_pos == 0 || num_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let top = scores[order[0]] as f64;
    let mut fpr = vec![0.0];
    let mut tpr = vec![0.0];
    let mut thresholds = vec![top + 1.0];

    let (mut tp, mut fp) = (0usize, 0usize);
    for (k, &i) in order.iter().enumerate() {
        if positives[i] {
            tp += 1;
        } else {
            fp += 1;
        }
        // 同じスコアはまとめて1点にする
        let last_of_tie = order
            .get(k + 1)
            .map_or(true, |&next| scores[next] != scores[i]);
        if last_of_tie {
            fpr.push(fp as f64 / num_neg as f64);
            tpr.push(tp as f64 / num_pos as f64);
            thresholds.push(scores[i] as f64);
        }
    }

    let auc = trapezoid_auc(&fpr, &tpr);
    Some(RocCurve {
        fpr,
        tpr,
        thresholds,
        auc,
    })
}

/// 全曲線のFPRの和集合上でTPRを補間して平均する
pub fn macro_average(curves: &[&RocCurve]) -> Option<RocCurve> {
    if curves.is_empty() {
        return None;
    }

    let mut grid: Vec<f64> = curves.iter().flat_map(|c| c.fpr.iter().copied()).collect();
    grid.sort_by(|a, b| a.total_cmp(b));
    grid.dedup();

    let tpr: Vec<f64> = grid
        .iter()
        .map(|&x| {
            curves.iter().map(|c| interpolate(x, &c.fpr, &c.tpr)).sum::<f64>() / curves.len() as f64
        })
        .collect();

    let auc = trapezoid_auc(&grid, &tpr);
    Some(RocCurve {
        fpr: grid,
        tpr,
        thresholds: Vec::new(),
        auc,
    })
}

/// 区分線形補間（同じxが複数あるときは最後の点の値）
fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let Some(i) = xs.iter().rposition(|&v| v <= x) else {
        return ys.first().copied().unwrap_or(0.0);
    };
    if xs[i] == x || i + 1 >= xs.len() {
        return ys[i];
    }
    let (x0, x1, y0, y1) = (xs[i], xs[i + 1], ys[i], ys[i + 1]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

pub fn trapezoid_auc(xs: &[f64], ys: &[f64]) -> f64 {
    xs.windows(2)
        .zip(ys.windows(2))
        .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.0)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(digit: usize, confidence: f32) -> Vec<f32> {
        let rest = (1.0 - confidence) / (NUM_CLASSES - 1) as f32;
        (0..NUM_CLASSES)
            .map(|c| if c == digit { confidence } else { rest })
            .collect()
    }

    #[test]
    fn test_perfect_predictions() {
        let y_true = [0u8, 1, 2, 0, 1, 2];
        let probs: Vec<Vec<f32>> = y_true.iter().map(|&d| one_hot(d as usize, 0.9)).collect();
        let report = evaluate(&y_true, &probs);

        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.recall, 1.0);
        assert_eq!(report.f1, 1.0);
        assert_eq!(report.confusion_matrix[0][0], 2);
        // 正解に現れたクラスだけROC曲線がある
        assert_eq!(report.roc_curves.per_class.len(), 3);
        for class in &report.roc_curves.per_class {
            assert!((class.curve.auc - 1.0).abs() < 1e-12);
        }
        let micro = report.roc_curves.micro_average.as_ref().unwrap();
        assert!((micro.auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_confusion_rows_sum_to_support() {
        let y_true = [3u8, 3, 3, 5, 5, 7];
        let preds = [3usize, 5, 3, 5, 7, 7];
        let probs: Vec<Vec<f32>> = preds.iter().map(|&d| one_hot(d, 0.6)).collect();
        let report = evaluate(&y_true, &probs);

        assert_eq!(report.confusion_matrix[3].iter().sum::<u32>(), 3);
        assert_eq!(report.confusion_matrix[5].iter().sum::<u32>(), 2);
        assert_eq!(report.confusion_matrix[7].iter().sum::<u32>(), 1);
        assert_eq!(report.confusion_matrix[3][5], 1);
        assert!((report.accuracy - 4.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn test_macro_precision_ignores_absent_labels() {
        // ラベル0のみ正解、すべて0と予測 → 他のクラスは平均に含めない
        let y_true = [0u8, 0];
        let probs = vec![one_hot(0, 0.8), one_hot(0, 0.7)];
        let report = evaluate(&y_true, &probs);
        assert_eq!(report.precision, 1.0);
        assert_eq!(report.recall, 1.0);
        // 陰性が無いのでROCは定義できない
        assert!(report.roc_curves.per_class.is_empty());
        assert!(report.roc_curves.micro_average.is_some());
    }

    #[test]
    fn test_roc_curve_with_ties() {
        let positives = [true, false, true, false];
        let scores = [0.8, 0.8, 0.4, 0.1];
        let curve = roc_curve(&positives, &scores).unwrap();

        assert_eq!(curve.fpr, vec![0.0, 0.5, 0.5, 1.0]);
        assert_eq!(curve.tpr, vec![0.0, 0.5, 1.0, 1.0]);
        assert_eq!(curve.thresholds.len(), curve.fpr.len());
        assert!((curve.auc - 0.625).abs() < 1e-12);
    }

    #[test]
    fn test_roc_requires_both_classes() {
        assert!(roc_curve(&[true, true], &[0.1, 0.9]).is_none());
        assert!(roc_curve(&[false], &[0.1]).is_none());
    }

    #[test]
    fn test_macro_average_of_identical_curves() {
        let curve = roc_curve(&[true, false, true, false], &[0.9, 0.7, 0.6, 0.2]).unwrap();
        let averaged = macro_average(&[&curve, &curve]).unwrap();
        assert_eq!(averaged.fpr, vec![0.0, 0.5, 1.0]);
        assert_eq!(averaged.tpr, vec![0.5, 1.0, 1.0]);
        assert!((averaged.auc - 0.875).abs() < 1e-12);
    }

    #[test]
    fn test_argmax_first_wins() {
        assert_eq!(argmax(&[0.2, 0.4, 0.4]), (1, 0.4));
    }
}
