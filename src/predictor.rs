//! 推論処理
//!
//! 状態確認 → 画像の正規化 → スケーリング → 分類 → 確信度の算出。
//! 1回の呼び出しは開始時点のアーティファクトを最後まで使い続ける。

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::lifecycle::LifecycleController;
use crate::ml::metrics::argmax;
use crate::preprocess::normalize_with_format;
use crate::types::{PredictionRequest, PredictionResult};

pub struct Predictor {
    lifecycle: Arc<LifecycleController>,
    max_image_bytes: usize,
}

impl Predictor {
    pub fn new(lifecycle: Arc<LifecycleController>, max_image_bytes: usize) -> Self {
        Self {
            lifecycle,
            max_image_bytes,
        }
    }

    pub fn predict_bytes(&self, bytes: &[u8]) -> Result<PredictionResult> {
        self.predict(&PredictionRequest::new(bytes.to_vec()))
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<PredictionResult> {
        let started = Instant::now();

        // 学習中・未学習なら待たずに返す
        let snapshot = self.lifecycle.snapshot();
        let artifact = match (&snapshot.artifact, snapshot.job.is_ready()) {
            (Some(artifact), true) => Arc::clone(artifact),
            _ => return Err(EngineError::ServiceNotReady(snapshot.job.clone())),
        };

        if request.bytes.len() > self.max_image_bytes {
            return Err(EngineError::ImageTooLarge {
                size: request.bytes.len(),
                limit: self.max_image_bytes,
            });
        }

        let features = normalize_with_format(&request.bytes, request.format)?;
        let probabilities = artifact.predict_proba(&features)?;
        let (digit, probability) = argmax(&probabilities);

        let result = PredictionResult {
            digit: digit as u8,
            confidence: (probability as f64 * 100.0).clamp(0.0, 100.0),
            processing_time_ms: started.elapsed().as_millis() as u64,
            probabilities,
        };
        debug!(
            digit = result.digit,
            confidence = result.confidence,
            processing_time_ms = result.processing_time_ms,
            "Prediction"
        );
        Ok(result)
    }
}
