//! エンジン全体で共有するエラー定義

use thiserror::Error;

use crate::types::TrainingJob;

/// 推論・学習エンジンのエラー
#[derive(Error, Debug)]
pub enum EngineError {
    /// ラスタ画像としてデコードできない入力
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("image is {size} bytes, limit is {limit} bytes")]
    ImageTooLarge { size: usize, limit: usize },

    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    #[error("invalid hyperparameters: {0}")]
    InvalidHyperparameters(String),

    #[error("training failed: {0}")]
    TrainingFailed(String),

    #[error("training cancelled")]
    Cancelled,

    /// 学習が完了していない（エラーではなく再試行を促す結果）
    #[error("service not ready: {}", .0.message())]
    ServiceNotReady(TrainingJob),

    #[error("not found: {0}")]
    NotFound(String),

    /// 分類器が確率を出力できない場合（固定値で誤魔化さない）
    #[error("classifier cannot produce class probabilities: {0}")]
    ProbabilityUnavailable(String),

    #[error("feature vector has {actual} values, expected {expected}")]
    FeatureMismatch { expected: usize, actual: usize },

    /// 永続化層・アーカイブ形式のエラー
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, EngineError::ServiceNotReady(_))
    }

    /// Web層でのHTTPステータス対応
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::UnsupportedFormat(_)
            | EngineError::ImageTooLarge { .. }
            | EngineError::FeatureMismatch { .. } => 400,
            EngineError::NotFound(_) => 404,
            EngineError::ProbabilityUnavailable(_) => 422,
            EngineError::ServiceNotReady(_) => 503,
            _ => 500,
        }
    }
}
