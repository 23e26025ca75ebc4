pub mod inference;
pub mod metrics;
pub mod ml_model;
pub mod scaler;
pub mod training;

pub use inference::InferenceEngine;
pub use metrics::{ConfusionMatrix, EvaluationReport, RocCurve, RocCurves};
pub use ml_model::{DigitNet, DigitNetConfig, ModelFamily, NUM_CLASSES};
pub use scaler::FeatureScaler;
pub use training::{GridScore, HyperparameterGrid, Hyperparameters, Trainer, TrainingPlan};
