//! 特徴量の標準化（平均0、標準偏差1）
//!
//! 学習時に使ったスケーラーは分類器と一緒にアーティファクトへ保存し、
//! 推論時も必ず同じものを適用する。

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    mean: Vec<f32>,
    /// 母標準偏差（分散0の特徴は1.0）
    scale: Vec<f32>,
}

impl FeatureScaler {
    /// 学習用の行だけから平均と標準偏差を求める
    pub fn fit(rows: &[&[f32]]) -> Result<Self> {
        let first = rows
            .first()
            .ok_or_else(|| EngineError::InvalidDataset("cannot fit scaler on zero rows".to_string()))?;
        let num_features = first.len();
        let n = rows.len() as f64;

        let mut sum = vec![0.0f64; num_features];
        for row in rows {
            if row.len() != num_features {
                return Err(EngineError::FeatureMismatch {
                    expected: num_features,
                    actual: row.len(),
                });
            }
            for (acc, v) in sum.iter_mut().zip(row.iter()) {
                *acc += *v as f64;
            }
        }
        let mean: Vec<f64> = sum.into_iter().map(|s| s / n).collect();

        let mut sum_sq = vec![0.0f64; num_features];
        for row in rows {
            for ((acc, v), m) in sum_sq.iter_mut().zip(row.iter()).zip(mean.iter()) {
                let diff = *v as f64 - m;
                *acc += diff * diff;
            }
        }

        let scale = sum_sq
            .into_iter()
            .map(|s| {
                let std = (s / n).sqrt();
                if std > f64::EPSILON {
                    std as f32
                } else {
                    1.0
                }
            })
            .collect();

        Ok(Self {
            mean: mean.into_iter().map(|m| m as f32).collect(),
            scale,
        })
    }

    pub fn num_features(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    pub fn transform(&self, row: &[f32]) -> Result<Vec<f32>> {
        if row.len() != self.mean.len() {
            return Err(EngineError::FeatureMismatch {
                expected: self.mean.len(),
                actual: row.len(),
            });
        }

        Ok(row
            .iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(v, (m, s))| (v - m) / s)
            .collect())
    }

    pub fn transform_rows(&self, rows: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_transform_standardizes() {
        let rows: [&[f32]; 4] = [&[0.0, 5.0], &[1.0, 5.0], &[2.0, 5.0], &[3.0, 5.0]];
        let scaler = FeatureScaler::fit(&rows).unwrap();

        assert!((scaler.mean()[0] - 1.5).abs() < 1e-6);
        // 分散0の特徴はスケール1
        assert_eq!(scaler.scale()[1], 1.0);

        let transformed = scaler.transform_rows(&rows).unwrap();
        let column: Vec<f32> = transformed.iter().map(|r| r[0]).collect();
        let mean: f32 = column.iter().sum::<f32>() / 4.0;
        let var: f32 = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-5);
        assert!(transformed.iter().all(|r| r[1] == 0.0));
    }

    #[test]
    fn test_transform_rejects_wrong_length() {
        let rows: [&[f32]; 1] = [&[1.0, 2.0]];
        let scaler = FeatureScaler::fit(&rows).unwrap();
        assert!(matches!(
            scaler.transform(&[1.0]),
            Err(EngineError::FeatureMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_fit_on_nothing_fails() {
        assert!(FeatureScaler::fit(&[]).is_err());
    }
}
