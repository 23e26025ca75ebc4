//! 手書き数字認識エンジン
//!
//! 学習データの読み込みから学習・評価・保存・読み込み・推論までを扱う。
//! 外部からは [`DigitEngine`] を通して使う。

pub mod clock;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod ml;
pub mod model;
pub mod predictor;
pub mod preprocess;
pub mod types;

#[cfg(test)]
mod test_support;

pub use clock::{Clock, FixedClock, SystemClock};
pub use dataset::{CsvSource, DatasetSource, ImageFolderSource, InMemorySource, LabeledDataset};
pub use engine::DigitEngine;
pub use error::{EngineError, Result};
pub use ml::{Hyperparameters, TrainingPlan};
pub use model::{EngineConfig, ModelArtifact, ModelMetrics};
pub use types::{PredictionRequest, PredictionResult, ProgressHint, TrainingJob, TrainingStatus};
