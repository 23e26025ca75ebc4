//! 外部（Web/API層）向けの窓口
//!
//! レジストリ・ライフサイクル・推論をまとめ、状態取得・推論・学習要求・
//! メトリクス取得・エクスポートの5操作を提供する。

use std::sync::Arc;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::dataset::DatasetSource;
use crate::error::Result;
use crate::lifecycle::{LifecycleController, LifecycleSnapshot};
use crate::ml::{Hyperparameters, TrainingPlan};
use crate::model::{ArtifactStore, EngineConfig, FsArtifactStore, ModelMetrics, ModelRegistry};
use crate::predictor::Predictor;
use crate::types::{PredictionRequest, PredictionResult, TrainingJob};

pub struct DigitEngine {
    registry: Arc<ModelRegistry>,
    lifecycle: Arc<LifecycleController>,
    predictor: Predictor,
}

impl DigitEngine {
    /// 保存先・データソース・時計を指定して組み立てる
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn ArtifactStore>,
        source: Arc<dyn DatasetSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::new(store));
        let lifecycle = Arc::new(
            LifecycleController::new(config.model_identity.clone(), registry.clone(), source, clock)
                .with_plan(config.training_plan())
                .with_train_on_start(config.train_on_start),
        );
        let predictor = Predictor::new(lifecycle.clone(), config.max_image_bytes);

        Self {
            registry,
            lifecycle,
            predictor,
        }
    }

    /// 設定ファイルの内容から組み立てる（ファイル保存・システム時計）
    pub fn from_config(config: &EngineConfig) -> Self {
        info!(
            identity = %config.model_identity,
            models_dir = %config.models_dir.display(),
            dataset = %config.dataset.path.display(),
            "Creating engine"
        );
        Self::new(
            config,
            Arc::new(FsArtifactStore::new(config.models_dir.clone())),
            config.dataset.source(),
            Arc::new(SystemClock),
        )
    }

    pub fn identity(&self) -> &str {
        self.lifecycle.identity()
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// 起動（二度目以降は現在のジョブを返すだけ）
    ///
    /// tokio ランタイムの外で学習が必要になると、ジョブは `Failed` になる。
    pub fn start(&self) -> TrainingJob {
        self.lifecycle.start()
    }

    pub fn status(&self) -> TrainingJob {
        self.lifecycle.status()
    }

    pub fn snapshot(&self) -> Arc<LifecycleSnapshot> {
        self.lifecycle.snapshot()
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult> {
        self.predictor.predict(request)
    }

    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        self.predictor.predict_bytes(bytes)
    }

    /// 学習要求（実行中なら実行中のジョブを返す）
    ///
    /// パラメータ指定なしなら設定の計画（グリッドがあればグリッドサーチ）を使う。
    pub fn trigger_training(&self, hyperparameters: Option<Hyperparameters>) -> TrainingJob {
        self.lifecycle
            .trigger_training(hyperparameters.map(TrainingPlan::Fixed))
    }

    pub fn trigger_plan(&self, plan: TrainingPlan) -> TrainingJob {
        self.lifecycle.trigger_training(Some(plan))
    }

    pub fn metrics(&self, identity: &str) -> Result<ModelMetrics> {
        self.registry.metrics(identity)
    }

    pub fn export_artifact(&self, identity: &str) -> Result<Vec<u8>> {
        self.registry.export(identity)
    }

    pub async fn wait_for_training(&self) {
        self.lifecycle.wait_for_training().await
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::InMemorySource;
    use crate::error::EngineError;
    use crate::ml::HyperparameterGrid;
    use crate::model::{MemoryArtifactStore, ModelArtifact};
    use crate::test_support::{digit_png, quick_hyperparameters, synthetic_dataset};
    use crate::types::TrainingStatus;

    fn engine(store: Arc<dyn ArtifactStore>) -> DigitEngine {
        let config = EngineConfig {
            training: quick_hyperparameters(),
            ..EngineConfig::default()
        };
        DigitEngine::new(
            &config,
            store,
            Arc::new(InMemorySource::new(synthetic_dataset(&[1, 3, 8], 12, 42))),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_flow() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let engine = engine(store.clone());

        assert!(matches!(
            engine.export_artifact("softmax"),
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(engine.status().status, TrainingStatus::NotStarted);

        engine.start();
        engine.wait_for_training().await;
        assert!(engine.status().is_ready());

        let result = engine.predict_bytes(&digit_png(8)).unwrap();
        assert_eq!(result.digit, 8);

        let metrics = engine.metrics("softmax").unwrap();
        let rows: u32 = metrics.confusion_matrix.iter().flatten().sum();
        assert_eq!(rows as usize, metrics.test_samples);

        let exported = engine.export_artifact("softmax").unwrap();
        let artifact = ModelArtifact::from_bytes(&exported).unwrap();
        assert_eq!(artifact.metadata().model_identity, "softmax");

        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_with_hyperparameters() {
        let engine = engine(Arc::new(MemoryArtifactStore::new()));
        let job = engine.trigger_training(Some(Hyperparameters {
            num_epochs: 1,
            ..quick_hyperparameters()
        }));
        assert_eq!(job.status, TrainingStatus::InProgress);
        assert_eq!(engine.trigger_training(None).id, job.id);

        engine.wait_for_training().await;
        let metrics = engine.metrics(engine.identity()).unwrap();
        assert_eq!(metrics.hyperparameters.num_epochs, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trigger_grid_plan_records_scores() {
        let engine = engine(Arc::new(MemoryArtifactStore::new()));
        engine.trigger_plan(TrainingPlan::Grid {
            base: Hyperparameters {
                num_epochs: 1,
                ..quick_hyperparameters()
            },
            grid: HyperparameterGrid {
                learning_rates: vec![1e-2, 1e-3],
                ..HyperparameterGrid::default()
            },
        });
        engine.wait_for_training().await;
        assert!(engine.status().is_ready());

        let snapshot = engine.snapshot();
        let metadata = snapshot.artifact.as_ref().unwrap().metadata();
        assert_eq!(metadata.grid_search.len(), 2);
        assert!(metadata
            .grid_search
            .iter()
            .any(|score| score.hyperparameters == metadata.hyperparameters));
    }
}
