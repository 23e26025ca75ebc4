//! モデル学習
//!
//! データセットを層化分割し、学習用パーティションだけでスケーラーと分類器を
//! 学習して、テスト用パーティションで評価した結果をアーティファクトにまとめる。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use burn::{
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{ElementConversion, Int, Tensor},
};
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::dataset::{stratified_split, LabeledDataset};
use crate::error::{EngineError, Result};
use crate::ml::inference::InferenceEngine;
use crate::ml::metrics::{argmax, evaluate};
use crate::ml::ml_model::{features_to_tensor, DigitNet, DigitNetConfig, ModelFamily};
use crate::ml::scaler::FeatureScaler;
use crate::ml::NUM_CLASSES;
use crate::model::{ModelArtifact, ModelMetadata};
use crate::preprocess::NUM_FEATURES;
use crate::types::ProgressHint;

type TrainBackend = Autodiff<NdArray>;

/// 学習パラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    pub family: ModelFamily,
    /// `Mlp` の隠れ層ユニット数（`Softmax` では無視）
    pub hidden_units: usize,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    /// 学習用パーティションの割合
    pub train_ratio: f32,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Self {
            family: ModelFamily::Softmax,
            hidden_units: 0,
            num_epochs: 10,
            batch_size: 64,
            learning_rate: 1e-3,
            seed: 42,
            train_ratio: 0.8,
        }
    }
}

impl Hyperparameters {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(EngineError::InvalidHyperparameters(msg.to_string()));

        if self.num_epochs == 0 {
            return invalid("num_epochs must be at least 1");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return invalid("learning_rate must be a positive finite number");
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return invalid("train_ratio must be between 0 and 1 (exclusive)");
        }
        if self.family == ModelFamily::Mlp && self.hidden_units == 0 {
            return invalid("mlp requires hidden_units >= 1");
        }
        Ok(())
    }

    /// ネットワーク構成
    pub fn network_config(&self) -> DigitNetConfig {
        let hidden_units = match self.family {
            ModelFamily::Softmax => 0,
            ModelFamily::Mlp => self.hidden_units,
        };
        DigitNetConfig::new(NUM_FEATURES, NUM_CLASSES).with_hidden_units(hidden_units)
    }
}

/// グリッドサーチの探索範囲（空の次元は基準値のまま）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparameterGrid {
    pub learning_rates: Vec<f64>,
    pub hidden_units: Vec<usize>,
    pub num_epochs: Vec<usize>,
}

impl HyperparameterGrid {
    /// 直積で候補を列挙
    pub fn candidates(&self, base: &Hyperparameters) -> Vec<Hyperparameters> {
        let learning_rates = if self.learning_rates.is_empty() {
            vec![base.learning_rate]
        } else {
            self.learning_rates.clone()
        };
        let hidden_units = if self.hidden_units.is_empty() {
            vec![base.hidden_units]
        } else {
            self.hidden_units.clone()
        };
        let num_epochs = if self.num_epochs.is_empty() {
            vec![base.num_epochs]
        } else {
            self.num_epochs.clone()
        };

        let mut candidates = Vec::new();
        for &learning_rate in &learning_rates {
            for &units in &hidden_units {
                for &epochs in &num_epochs {
                    candidates.push(Hyperparameters {
                        learning_rate,
                        hidden_units: units,
                        num_epochs: epochs,
                        ..base.clone()
                    });
                }
            }
        }
        candidates
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainingPlan {
    Fixed(Hyperparameters),
    Grid {
        base: Hyperparameters,
        grid: HyperparameterGrid,
    },
}

impl TrainingPlan {
    pub fn base(&self) -> &Hyperparameters {
        match self {
            TrainingPlan::Fixed(hp) => hp,
            TrainingPlan::Grid { base, .. } => base,
        }
    }

    /// 固定なら設定そのもの、グリッドなら全候補を検証する
    ///
    /// グリッドの基準値そのものは検証しない。
    pub fn validate(&self) -> Result<()> {
        match self {
            TrainingPlan::Fixed(hp) => hp.validate(),
            TrainingPlan::Grid { base, grid } => grid
                .candidates(base)
                .iter()
                .try_for_each(Hyperparameters::validate),
        }
    }
}

/// グリッドサーチの候補ごとの検証スコア
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridScore {
    pub hyperparameters: Hyperparameters,
    pub validation_accuracy: f64,
}

/// 学習の実行者
pub struct Trainer {
    clock: Arc<dyn Clock>,
}

impl Trainer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// 固定パラメータで学習（キャンセル・進捗通知なし）
    pub fn train(
        &self,
        identity: &str,
        dataset: &LabeledDataset,
        hyperparameters: &Hyperparameters,
    ) -> Result<ModelArtifact> {
        let cancel = AtomicBool::new(false);
        self.run(
            identity,
            dataset,
            &TrainingPlan::Fixed(hyperparameters.clone()),
            &cancel,
            &mut |_| {},
        )
    }

    /// 学習・評価を行いアーティファクトを作成
    ///
    /// `cancel` はミニバッチごとに確認し、立っていれば `Cancelled` を返す。
    pub fn run(
        &self,
        identity: &str,
        dataset: &LabeledDataset,
        plan: &TrainingPlan,
        cancel: &AtomicBool,
        progress: &mut dyn FnMut(ProgressHint),
    ) -> Result<ModelArtifact> {
        let base = plan.base();
        plan.validate()?;
        dataset.validate()?;

        progress(ProgressHint::new(5, "splitting"));
        let split = stratified_split(&dataset.labels(), base.train_ratio, base.seed);
        if split.train.is_empty() || split.test.is_empty() {
            return Err(EngineError::InvalidDataset(format!(
                "{} samples cannot be split into train and test partitions",
                dataset.len()
            )));
        }

        let (train_rows, train_labels) = dataset.select(&split.train);
        if distinct_classes(&train_labels) < 2 {
            return Err(EngineError::TrainingFailed(
                "training partition contains a single class".to_string(),
            ));
        }
        info!(
            identity,
            train_samples = train_rows.len(),
            test_samples = split.test.len(),
            "Dataset split"
        );

        let (hyperparameters, grid_scores) = match plan {
            TrainingPlan::Fixed(hp) => (hp.clone(), Vec::new()),
            TrainingPlan::Grid { base, grid } => {
                grid_search(&train_rows, &train_labels, base, grid, cancel, progress)?
            }
        };

        progress(ProgressHint::new(20, "fitting scaler"));
        let scaler = FeatureScaler::fit(&train_rows)?;
        let scaled_train = scaler.transform_rows(&train_rows)?;

        let num_epochs = hyperparameters.num_epochs;
        let network = fit_network(&scaled_train, &train_labels, &hyperparameters, cancel, &mut |epoch, loss| {
            debug!(epoch, loss, "Epoch finished");
            let percent = 20 + (epoch * 65 / num_epochs.max(1)) as u8;
            progress(ProgressHint::new(percent, format!("epoch {}/{}", epoch, num_epochs)));
        })?;
        let classifier = InferenceEngine::new(network, hyperparameters.network_config());

        progress(ProgressHint::new(90, "evaluating"));
        let (test_rows, test_labels) = dataset.select(&split.test);
        let scaled_test = scaler.transform_rows(&test_rows)?;
        let probabilities = classifier.probabilities_batch(&as_slices(&scaled_test))?;
        let evaluation = evaluate(&test_labels, &probabilities);

        info!(
            identity,
            accuracy = evaluation.accuracy,
            f1 = evaluation.f1,
            "Training finished"
        );

        let metadata = ModelMetadata::new(
            identity,
            self.clock.now(),
            hyperparameters,
            train_rows.len(),
            test_rows.len(),
            evaluation,
            grid_scores,
        );
        Ok(ModelArtifact::new(metadata, scaler, classifier))
    }
}

/// 学習用パーティションを再分割して候補を比較する
fn grid_search(
    rows: &[&[f32]],
    labels: &[u8],
    base: &Hyperparameters,
    grid: &HyperparameterGrid,
    cancel: &AtomicBool,
    progress: &mut dyn FnMut(ProgressHint),
) -> Result<(Hyperparameters, Vec<GridScore>)> {
    let candidates = grid.candidates(base);

    let inner = stratified_split(labels, base.train_ratio, base.seed);
    if inner.train.is_empty() || inner.test.is_empty() {
        return Err(EngineError::InvalidDataset(
            "not enough samples to hold out a validation partition for grid search".to_string(),
        ));
    }
    let fit_rows: Vec<&[f32]> = inner.train.iter().map(|&i| rows[i]).collect();
    let fit_labels: Vec<u8> = inner.train.iter().map(|&i| labels[i]).collect();
    let val_rows: Vec<&[f32]> = inner.test.iter().map(|&i| rows[i]).collect();
    let val_labels: Vec<u8> = inner.test.iter().map(|&i| labels[i]).collect();

    let scaler = FeatureScaler::fit(&fit_rows)?;
    let scaled_fit = scaler.transform_rows(&fit_rows)?;
    let scaled_val = scaler.transform_rows(&val_rows)?;

    let mut scores = Vec::with_capacity(candidates.len());
    let mut best: Option<(usize, f64)> = None;
    for (k, candidate) in candidates.iter().enumerate() {
        let percent = 5 + (k * 15 / candidates.len()) as u8;
        progress(ProgressHint::new(percent, format!("grid candidate {}/{}", k + 1, candidates.len())));

        let network = fit_network(&scaled_fit, &fit_labels, candidate, cancel, &mut |_, _| {})?;
        let classifier = InferenceEngine::new(network, candidate.network_config());
        let probabilities = classifier.probabilities_batch(&as_slices(&scaled_val))?;
        let correct = probabilities
            .iter()
            .zip(val_labels.iter())
            .filter(|(p, &label)| argmax(p).0 == label as usize)
            .count();
        let accuracy = correct as f64 / val_labels.len() as f64;

        info!(
            candidate = k + 1,
            learning_rate = candidate.learning_rate,
            hidden_units = candidate.hidden_units,
            num_epochs = candidate.num_epochs,
            accuracy,
            "Grid candidate scored"
        );

        // 同点なら先の候補を残す
        if best.map_or(true, |(_, a)| accuracy > a) {
            best = Some((k, accuracy));
        }
        scores.push(GridScore {
            hyperparameters: candidate.clone(),
            validation_accuracy: accuracy,
        });
    }

    let (best_index, _) = best.ok_or_else(|| {
        EngineError::InvalidHyperparameters("hyperparameter grid produced no candidates".to_string())
    })?;
    Ok((candidates[best_index].clone(), scores))
}

/// ネットワークをミニバッチ勾配法で学習
fn fit_network(
    rows: &[Vec<f32>],
    labels: &[u8],
    hyperparameters: &Hyperparameters,
    cancel: &AtomicBool,
    on_epoch: &mut dyn FnMut(usize, f32),
) -> Result<DigitNet<NdArray>> {
    let device = NdArrayDevice::default();
    let mut model: DigitNet<TrainBackend> = hyperparameters
        .network_config()
        .init_seeded(hyperparameters.seed, &device);
    let mut optim = AdamConfig::new().init::<TrainBackend, DigitNet<TrainBackend>>();
    let mut rng = StdRng::seed_from_u64(hyperparameters.seed);
    let mut order: Vec<usize> = (0..rows.len()).collect();

    for epoch in 1..=hyperparameters.num_epochs {
        order.shuffle(&mut rng);
        let mut loss_sum = 0.0f32;
        let mut batches = 0usize;

        for chunk in order.chunks(hyperparameters.batch_size) {
            if cancel.load(Ordering::Relaxed) {
                return Err(EngineError::Cancelled);
            }

            let batch_rows: Vec<&[f32]> = chunk.iter().map(|&i| rows[i].as_slice()).collect();
            let batch_targets: Vec<i64> = chunk.iter().map(|&i| labels[i] as i64).collect();
            let features = features_to_tensor::<TrainBackend>(&batch_rows, &device);
            let targets = Tensor::<TrainBackend, 1, Int>::from_ints(batch_targets.as_slice(), &device);

            let output = model.forward_classification(features, targets);
            let loss: f32 = output.loss.clone().into_scalar().elem();
            if !loss.is_finite() {
                return Err(EngineError::TrainingFailed(format!(
                    "loss became non-finite in epoch {}",
                    epoch
                )));
            }

            let grads = GradientsParams::from_grads(output.loss.backward(), &model);
            model = optim.step(hyperparameters.learning_rate, model, grads);

            loss_sum += loss;
            batches += 1;
        }

        on_epoch(epoch, loss_sum / batches.max(1) as f32);
    }

    Ok(model.valid())
}

fn distinct_classes(labels: &[u8]) -> usize {
    let mut seen = [false; NUM_CLASSES];
    for &label in labels {
        seen[label as usize] = true;
    }
    seen.iter().filter(|s| **s).count()
}

fn as_slices(rows: &[Vec<f32>]) -> Vec<&[f32]> {
    rows.iter().map(|r| r.as_slice()).collect()
}
