//! 学習済みモデルアーティファクト
//!
//! 分類器・スケーラー・メタデータの組。作成後は変更しない。

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::ml::{FeatureScaler, InferenceEngine};
use crate::model::model_metadata::ModelMetadata;
use crate::model::model_storage::{read_archive, write_archive};

#[derive(Debug)]
pub struct ModelArtifact {
    metadata: ModelMetadata,
    scaler: FeatureScaler,
    classifier: InferenceEngine,
}

impl ModelArtifact {
    pub fn new(metadata: ModelMetadata, scaler: FeatureScaler, classifier: InferenceEngine) -> Self {
        Self {
            metadata,
            scaler,
            classifier,
        }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn scaler(&self) -> &FeatureScaler {
        &self.scaler
    }

    pub fn identity(&self) -> &str {
        &self.metadata.model_identity
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.metadata.trained_at
    }

    /// 正規化済み特徴（784要素）からクラス確率を求める
    ///
    /// 学習時と同じスケーラーを通してから分類器に渡す。
    pub fn predict_proba(&self, features: &[f32]) -> Result<Vec<f32>> {
        let scaled = self.scaler.transform(features)?;
        self.classifier.probabilities(&scaled)
    }

    /// tar.gz バイト列に変換
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let model_binary = self.classifier.to_record_bytes()?;
        write_archive(&self.metadata, &self.scaler, &model_binary)
    }

    /// tar.gz バイト列から復元
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let (metadata, scaler, model_binary) = read_archive(bytes)?;

        if scaler.num_features() != metadata.num_features {
            anyhow::bail!(
                "Scaler has {} features but metadata declares {}",
                scaler.num_features(),
                metadata.num_features
            );
        }

        let classifier =
            InferenceEngine::from_record_bytes(model_binary, metadata.hyperparameters.network_config())?;

        Ok(Self::new(metadata, scaler, classifier))
    }
}
