//! モデルメタデータの定義
//!
//! アーティファクトの metadata.json として保存され、
//! メトリクス取得はここに記録された値だけを返す（再計算しない）。

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ml::metrics::{ClassMetrics, ConfusionMatrix, EvaluationReport, RocCurves};
use crate::ml::training::{GridScore, Hyperparameters};
use crate::ml::NUM_CLASSES;
use crate::preprocess::NUM_FEATURES;

/// アーティファクト形式のバージョン
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - scaler.json: 特徴量の標準化パラメータ
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub format_version: u32,

    /// モデル識別子（保存ファイル名にも使う）
    pub model_identity: String,

    /// 学習完了時刻
    pub trained_at: DateTime<Utc>,

    /// 実際に学習に使ったパラメータ（グリッドサーチ時は選ばれた候補）
    pub hyperparameters: Hyperparameters,

    pub num_features: usize,
    pub num_classes: usize,

    pub train_samples: usize,
    pub test_samples: usize,

    /// テスト用パーティションでの評価結果
    pub evaluation: EvaluationReport,

    /// グリッドサーチの候補スコア（固定パラメータなら空）
    #[serde(default)]
    pub grid_search: Vec<GridScore>,
}

impl ModelMetadata {
    pub fn new(
        model_identity: &str,
        trained_at: DateTime<Utc>,
        hyperparameters: Hyperparameters,
        train_samples: usize,
        test_samples: usize,
        evaluation: EvaluationReport,
        grid_search: Vec<GridScore>,
    ) -> Self {
        Self {
            format_version: ARTIFACT_FORMAT_VERSION,
            model_identity: model_identity.to_string(),
            trained_at,
            hyperparameters,
            num_features: NUM_FEATURES,
            num_classes: NUM_CLASSES,
            train_samples,
            test_samples,
            evaluation,
            grid_search,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;

        if metadata.format_version != ARTIFACT_FORMAT_VERSION {
            anyhow::bail!(
                "Unsupported artifact format version {} (expected {})",
                metadata.format_version,
                ARTIFACT_FORMAT_VERSION
            );
        }
        if metadata.num_features != NUM_FEATURES || metadata.num_classes != NUM_CLASSES {
            anyhow::bail!(
                "Artifact shape {}x{} does not match {}x{}",
                metadata.num_features,
                metadata.num_classes,
                NUM_FEATURES,
                NUM_CLASSES
            );
        }
        Ok(metadata)
    }
}

/// メトリクス取得の応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_identity: String,
    pub trained_at: DateTime<Utc>,
    pub hyperparameters: Hyperparameters,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion_matrix: ConfusionMatrix,
    pub per_class: Vec<ClassMetrics>,
    pub roc_curves: RocCurves,
    pub train_samples: usize,
    pub test_samples: usize,
}

impl From<&ModelMetadata> for ModelMetrics {
    fn from(metadata: &ModelMetadata) -> Self {
        let evaluation = &metadata.evaluation;
        Self {
            model_identity: metadata.model_identity.clone(),
            trained_at: metadata.trained_at,
            hyperparameters: metadata.hyperparameters.clone(),
            accuracy: evaluation.accuracy,
            precision: evaluation.precision,
            recall: evaluation.recall,
            f1: evaluation.f1,
            confusion_matrix: evaluation.confusion_matrix,
            per_class: evaluation.per_class.clone(),
            roc_curves: evaluation.roc_curves.clone(),
            train_samples: metadata.train_samples,
            test_samples: metadata.test_samples,
        }
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    let evaluation = &metadata.evaluation;
    let hp = &metadata.hyperparameters;

    println!("\n=== モデルメタデータ ===");
    println!("識別子: {}", metadata.model_identity);
    println!("学習日時: {}", metadata.trained_at.to_rfc3339());
    println!(
        "モデル: {} (hidden_units={}), epochs={}, batch_size={}, learning_rate={}, seed={}",
        hp.family, hp.hidden_units, hp.num_epochs, hp.batch_size, hp.learning_rate, hp.seed
    );
    println!("サンプル数: 学習 {}, テスト {}", metadata.train_samples, metadata.test_samples);
    println!("Accuracy:  {:.4}", evaluation.accuracy);
    println!("Precision: {:.4}", evaluation.precision);
    println!("Recall:    {:.4}", evaluation.recall);
    println!("F1:        {:.4}", evaluation.f1);

    println!("クラス別:");
    for class in evaluation.per_class.iter().filter(|c| c.support > 0) {
        println!(
            "  {}: precision={:.3} recall={:.3} f1={:.3} support={}",
            class.digit, class.precision, class.recall, class.f1, class.support
        );
    }

    println!("混同行列 (行=正解, 列=予測):");
    for (digit, row) in evaluation.confusion_matrix.iter().enumerate() {
        let cells: Vec<String> = row.iter().map(|c| format!("{:4}", c)).collect();
        println!("  {} |{}", digit, cells.join(""));
    }

    if let Some(micro) = &evaluation.roc_curves.micro_average {
        println!("ROC AUC (micro): {:.4}", micro.auc);
    }
    if let Some(macro_avg) = &evaluation.roc_curves.macro_average {
        println!("ROC AUC (macro): {:.4}", macro_avg.auc);
    }
    for score in &metadata.grid_search {
        println!(
            "  候補 lr={} hidden={} epochs={}: {:.4}",
            score.hyperparameters.learning_rate,
            score.hyperparameters.hidden_units,
            score.hyperparameters.num_epochs,
            score.validation_accuracy
        );
    }
    println!("========================");
}
