use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 学習ジョブの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    NotStarted,
    InProgress,
    Ready,
    Failed,
}

impl std::fmt::Display for TrainingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrainingStatus::NotStarted => write!(f, "not_started"),
            TrainingStatus::InProgress => write!(f, "in_progress"),
            TrainingStatus::Ready => write!(f, "ready"),
            TrainingStatus::Failed => write!(f, "failed"),
        }
    }
}

/// 学習の進捗（おおよその割合とフェーズ名）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressHint {
    pub percent: u8,
    pub phase: String,
}

impl ProgressHint {
    pub fn new(percent: u8, phase: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            phase: phase.into(),
        }
    }
}

/// 学習ジョブ（ステータス問い合わせの応答にもそのまま使う）
///
/// 値は不変で、状態遷移のたびに新しい値を作る。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    /// 0 はディスクから読み込んだ（学習していない）状態
    pub id: u64,
    pub status: TrainingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_hint: Option<ProgressHint>,
    /// Failed のときだけ存在する
    pub error: Option<String>,
}

impl TrainingJob {
    pub fn not_started() -> Self {
        Self {
            id: 0,
            status: TrainingStatus::NotStarted,
            started_at: None,
            finished_at: None,
            progress_hint: None,
            error: None,
        }
    }

    pub fn in_progress(id: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TrainingStatus::InProgress,
            started_at: Some(started_at),
            finished_at: None,
            progress_hint: Some(ProgressHint::new(0, "queued")),
            error: None,
        }
    }

    /// 永続化済みのアーティファクトを読み込んだ直後の状態
    pub fn loaded(trained_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            status: TrainingStatus::Ready,
            started_at: None,
            finished_at: Some(trained_at),
            progress_hint: None,
            error: None,
        }
    }

    pub fn completed(&self, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: TrainingStatus::Ready,
            finished_at: Some(finished_at),
            progress_hint: Some(ProgressHint::new(100, "ready")),
            error: None,
            ..self.clone()
        }
    }

    pub fn failed(&self, error: impl Into<String>, finished_at: DateTime<Utc>) -> Self {
        Self {
            status: TrainingStatus::Failed,
            finished_at: Some(finished_at),
            error: Some(error.into()),
            ..self.clone()
        }
    }

    pub fn with_progress(&self, hint: ProgressHint) -> Self {
        Self {
            progress_hint: Some(hint),
            ..self.clone()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == TrainingStatus::Ready
    }

    /// ポーリング用のメッセージ
    pub fn message(&self) -> &'static str {
        match self.status {
            TrainingStatus::NotStarted => "Model training has not started yet",
            TrainingStatus::InProgress => "Model is currently training. Please wait...",
            TrainingStatus::Ready => "Model is ready",
            TrainingStatus::Failed => "Model training failed. Please check logs or retry.",
        }
    }
}

/// 推論リクエスト
#[derive(Debug, Clone)]
pub struct PredictionRequest {
    pub bytes: Vec<u8>,
    /// 宣言されたフォーマット（None ならバイト列から推定）
    pub format: Option<image::ImageFormat>,
}

impl PredictionRequest {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, format: None }
    }

    pub fn with_format(mut self, format: image::ImageFormat) -> Self {
        self.format = Some(format);
        self
    }
}

/// 推論結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub digit: u8,
    /// 予測クラスの確率（0〜100）
    pub confidence: f64,
    pub processing_time_ms: u64,
    /// 分類器が返したクラス確率（0〜9の順）
    pub probabilities: Vec<f32>,
}
