//! エンジン設定管理モジュール
//!
//! モデル保存先・データセット・学習パラメータなどをJSON形式で保存・読み込みします。
//! 一部の値は環境変数で上書きできます。

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dataset::{CsvSource, DatasetSource, ImageFolderSource};
use crate::ml::{HyperparameterGrid, Hyperparameters, TrainingPlan};

/// 設定ファイルのパス
pub const ENV_CONFIG_PATH: &str = "DIGIT_ENGINE_CONFIG";
/// モデル保存ディレクトリ
pub const ENV_MODELS_DIR: &str = "DIGIT_ENGINE_MODELS_DIR";
/// データセットのパス
pub const ENV_DATASET: &str = "DIGIT_ENGINE_DATASET";
/// モデル識別子
pub const ENV_MODEL_IDENTITY: &str = "DIGIT_ENGINE_MODEL_IDENTITY";

/// アップロード画像の上限（5MB）
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// データセットの形式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// MNIST形式のCSV（ラベル + 784画素）
    #[default]
    Csv,
    /// `0`〜`9` のサブディレクトリに画像を置いたフォルダ
    ImageFolder,
}

impl std::fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetKind::Csv => write!(f, "CSV"),
            DatasetKind::ImageFolder => write!(f, "image folder"),
        }
    }
}

/// データセット設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatasetSettings {
    pub kind: DatasetKind,
    pub path: PathBuf,
    /// CSVの先頭行がヘッダかどうか
    pub has_headers: bool,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            kind: DatasetKind::Csv,
            path: PathBuf::from("data/mnist_train.csv"),
            has_headers: false,
        }
    }
}

impl DatasetSettings {
    pub fn source(&self) -> Arc<dyn DatasetSource> {
        match self.kind {
            DatasetKind::Csv => Arc::new(CsvSource::new(self.path.clone(), self.has_headers)),
            DatasetKind::ImageFolder => Arc::new(ImageFolderSource::new(self.path.clone())),
        }
    }
}

/// エンジン設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// モデル識別子
    pub model_identity: String,
    /// モデル保存ディレクトリ
    pub models_dir: PathBuf,
    /// データセット設定
    pub dataset: DatasetSettings,
    /// トレーニング設定
    pub training: Hyperparameters,
    /// 指定されていれば学習時にグリッドサーチを行う
    pub grid: Option<HyperparameterGrid>,
    /// 推論に受け付ける画像の最大バイト数
    pub max_image_bytes: usize,
    /// 起動時に保存済みモデルが無ければ学習を始める
    pub train_on_start: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_identity: "softmax".to_string(),
            models_dir: PathBuf::from("models"),
            dataset: DatasetSettings::default(),
            training: Hyperparameters::default(),
            grid: None,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            train_on_start: true,
        }
    }
}

impl EngineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        std::env::var_os(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"))
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// デフォルトパスから設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// どちらの場合も環境変数による上書きを適用する。
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        let mut config = if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    info!(path = %path.display(), "Loaded config file");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %format!("{:#}", e), "Failed to load config file, using defaults");
                    Self::default()
                }
            }
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// `lookup` が返した値で上書きする（空文字は無視）
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = lookup(ENV_MODELS_DIR) {
            self.models_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_DATASET) {
            self.dataset.path = PathBuf::from(path);
        }
        if let Some(identity) = lookup(ENV_MODEL_IDENTITY) {
            self.model_identity = identity;
        }
    }

    /// 既定の学習計画（グリッドがあればグリッドサーチ）
    pub fn training_plan(&self) -> TrainingPlan {
        match &self.grid {
            Some(grid) => TrainingPlan::Grid {
                base: self.training.clone(),
                grid: grid.clone(),
            },
            None => TrainingPlan::Fixed(self.training.clone()),
        }
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== エンジン設定 ===");
        println!("モデル識別子: {}", self.model_identity);
        println!("モデル保存先: {}", self.models_dir.display());
        println!("データセット: {} ({})", self.dataset.path.display(), self.dataset.kind);
        println!("\n--- トレーニング設定 ---");
        println!("モデル: {}", self.training.family);
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        if let Some(ref grid) = self.grid {
            println!("グリッド: {} 候補", grid.candidates(&self.training).len());
        }
        println!("========================\n");
    }
}
