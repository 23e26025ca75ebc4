//! モデル推論機能

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
};
use burn_ndarray::{NdArray, NdArrayDevice};
use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::ml::ml_model::{features_to_tensor, DigitNet, DigitNetConfig};
use crate::ml::NUM_CLASSES;

/// 推論用バックエンド（CPU）
pub type InferenceBackend = NdArray;

/// 推論エンジン
///
/// 学習済みネットワークを保持し、スケーリング済み特徴からクラス確率を返す。
/// 各呼び出しはネットワークを複製して使うので、複数スレッドから同時に呼べる。
#[derive(Debug)]
pub struct InferenceEngine {
    model: Mutex<DigitNet<InferenceBackend>>,
    config: DigitNetConfig,
    device: NdArrayDevice,
}

impl InferenceEngine {
    pub fn new(model: DigitNet<InferenceBackend>, config: DigitNetConfig) -> Self {
        Self {
            model: Mutex::new(model),
            config,
            device: NdArrayDevice::default(),
        }
    }

    /// 保存済みの重みから推論エンジンを初期化
    pub fn from_record_bytes(model_binary: Vec<u8>, config: DigitNetConfig) -> anyhow::Result<Self> {
        let device = NdArrayDevice::default();
        let model = config.init::<InferenceBackend>(&device);

        // モデルの重みを復元
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record: <DigitNet<InferenceBackend> as Module<InferenceBackend>>::Record =
            <BinBytesRecorder<FullPrecisionSettings> as Recorder<InferenceBackend>>::load(
                &recorder,
                model_binary,
                &device,
            )
            .map_err(|e| anyhow::anyhow!("Failed to load model weights: {:?}", e))?;

        let model = model.load_record(record);

        Ok(Self {
            model: Mutex::new(model),
            config,
            device,
        })
    }

    /// 重みをバイト列に書き出す
    pub fn to_record_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let record = self.model.lock().clone().into_record();
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        <BinBytesRecorder<FullPrecisionSettings> as Recorder<InferenceBackend>>::record(
            &recorder,
            record,
            (),
        )
        .map_err(|e| anyhow::anyhow!("Failed to serialize model weights: {:?}", e))
    }

    /// 1行分のクラス確率
    pub fn probabilities(&self, features: &[f32]) -> Result<Vec<f32>> {
        let mut rows = self.probabilities_batch(&[features])?;
        rows.pop().ok_or_else(|| {
            EngineError::ProbabilityUnavailable("classifier returned no output".to_string())
        })
    }

    /// 複数行のクラス確率
    pub fn probabilities_batch(&self, rows: &[&[f32]]) -> Result<Vec<Vec<f32>>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        for row in rows {
            if row.len() != self.config.num_features {
                return Err(EngineError::FeatureMismatch {
                    expected: self.config.num_features,
                    actual: row.len(),
                });
            }
        }

        let model = self.model.lock().clone();
        let input = features_to_tensor::<InferenceBackend>(rows, &self.device);
        let flat = model
            .probabilities(input)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| EngineError::ProbabilityUnavailable(format!("{:?}", e)))?;

        if flat.len() != rows.len() * NUM_CLASSES {
            return Err(EngineError::ProbabilityUnavailable(format!(
                "expected {} outputs per row, got {} in total for {} rows",
                NUM_CLASSES,
                flat.len(),
                rows.len()
            )));
        }

        let probabilities: Vec<Vec<f32>> = flat.chunks(NUM_CLASSES).map(|c| c.to_vec()).collect();
        for row in &probabilities {
            check_distribution(row)?;
        }
        Ok(probabilities)
    }
}

/// 有限で合計がほぼ1の確率ベクトルか確認
pub fn check_distribution(probabilities: &[f32]) -> Result<()> {
    if probabilities.len() != NUM_CLASSES {
        return Err(EngineError::ProbabilityUnavailable(format!(
            "expected {} class probabilities, got {}",
            NUM_CLASSES,
            probabilities.len()
        )));
    }
    if probabilities.iter().any(|p| !p.is_finite() || *p < 0.0) {
        return Err(EngineError::ProbabilityUnavailable(
            "classifier produced a non-finite probability".to_string(),
        ));
    }
    let sum: f32 = probabilities.iter().sum();
    if (sum - 1.0).abs() > 1e-3 {
        return Err(EngineError::ProbabilityUnavailable(format!(
            "class probabilities sum to {}",
            sum
        )));
    }
    Ok(())
}
