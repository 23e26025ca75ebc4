//! 機械学習モデルの共通定義
//!
//! 手書き数字分類用のネットワークと関連する設定を提供します。

use burn::{
    config::Config,
    module::{Module, Param},
    nn::{loss::CrossEntropyLossConfig, Linear, LinearConfig, Relu},
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// クラス数（数字 0〜9）
pub const NUM_CLASSES: usize = 10;

/// モデルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// 多クラスロジスティック回帰（全結合1層）
    #[default]
    Softmax,
    /// 隠れ層1つ（ReLU）
    Mlp,
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFamily::Softmax => write!(f, "softmax"),
            ModelFamily::Mlp => write!(f, "mlp"),
        }
    }
}

/// モデル設定
#[derive(Config, Debug)]
pub struct DigitNetConfig {
    /// 入力特徴数
    pub num_features: usize,
    /// 分類クラス数
    pub num_classes: usize,
    /// 隠れ層のユニット数（0なら隠れ層なし）
    #[config(default = 0)]
    pub hidden_units: usize,
}

impl DigitNetConfig {
    /// モデルを初期化（重みは保存済みレコードで上書きする前提）
    pub fn init<B: Backend>(&self, device: &B::Device) -> DigitNet<B> {
        let (hidden, d_output_in) = if self.hidden_units > 0 {
            (
                Some(LinearConfig::new(self.num_features, self.hidden_units).init(device)),
                self.hidden_units,
            )
        } else {
            (None, self.num_features)
        };

        DigitNet {
            hidden,
            output: LinearConfig::new(d_output_in, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }

    /// シード固定で初期化（同じシードなら同じ重み）
    pub fn init_seeded<B: Backend>(&self, seed: u64, device: &B::Device) -> DigitNet<B> {
        let mut rng = StdRng::seed_from_u64(seed);

        let (hidden, d_output_in) = if self.hidden_units > 0 {
            (
                Some(seeded_linear(self.num_features, self.hidden_units, &mut rng, device)),
                self.hidden_units,
            )
        } else {
            (None, self.num_features)
        };

        DigitNet {
            hidden,
            output: seeded_linear(d_output_in, self.num_classes, &mut rng, device),
            activation: Relu::new(),
        }
    }
}

/// 一様分布 U(-1/sqrt(d_input), 1/sqrt(d_input)) で初期化した全結合層
fn seeded_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    rng: &mut StdRng,
    device: &B::Device,
) -> Linear<B> {
    let bound = 1.0 / (d_input as f32).sqrt();
    let weight: Vec<f32> = (0..d_input * d_output)
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    let bias: Vec<f32> = (0..d_output).map(|_| rng.gen_range(-bound..bound)).collect();

    Linear {
        weight: Param::from_tensor(
            Tensor::<B, 1>::from_floats(weight.as_slice(), device).reshape([d_input, d_output]),
        ),
        bias: Some(Param::from_tensor(Tensor::<B, 1>::from_floats(
            bias.as_slice(),
            device,
        ))),
    }
}

/// 手書き数字分類モデル
///
/// # アーキテクチャ
/// - (任意) FC: num_features -> hidden_units + ReLU
/// - FC: -> num_classes
/// - Softmax (確率算出時)
#[derive(Module, Debug)]
pub struct DigitNet<B: Backend> {
    hidden: Option<Linear<B>>,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DigitNet<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `features`: スケーリング済み特徴 [batch_size, num_features]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.hidden {
            Some(hidden) => self.activation.forward(hidden.forward(features)),
            None => features,
        };
        self.output.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn probabilities(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        softmax(self.forward(features), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        features: Tensor<B, 2>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(features);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

/// 特徴行をまとめて [rows, num_features] のテンソルにする
pub fn features_to_tensor<B: Backend>(rows: &[&[f32]], device: &B::Device) -> Tensor<B, 2> {
    let num_features = rows.first().map(|r| r.len()).unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * num_features);
    for row in rows {
        flat.extend_from_slice(row);
    }

    Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([rows.len(), num_features])
}
