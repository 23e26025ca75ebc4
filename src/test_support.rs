//! テスト用の共通ヘルパー

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::clock::FixedClock;
use crate::dataset::{DatasetSource, LabeledDataset, LabeledImage};
use crate::error::Result;
use crate::ml::{Hyperparameters, Trainer};
use crate::model::{ArtifactStore, ModelArtifact};
use crate::preprocess::{IMAGE_SIZE, NUM_FEATURES};

pub fn encode_png(img: &DynamicImage) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    img.write_to(&mut cursor, ImageFormat::Png).unwrap();
    cursor.into_inner()
}

/// ラベルごとに重ならない 4x4 セルを点灯させた合成数字
///
/// 7x7 のセルのうち、番号 % 10 == label のセルを使う。
pub fn digit_pattern(label: u8) -> Vec<f32> {
    let mut pixels = vec![0.0f32; NUM_FEATURES];
    let size = IMAGE_SIZE as usize;
    for y in 0..size {
        for x in 0..size {
            let cell = (y / 4) * 7 + x / 4;
            if cell % 10 == label as usize {
                pixels[y * size + x] = 1.0;
            }
        }
    }
    pixels
}

/// 合成数字にノイズを加えたサンプル
pub fn noisy_digit(label: u8, rng: &mut StdRng) -> Vec<f32> {
    digit_pattern(label)
        .into_iter()
        .map(|v| {
            let value = if v > 0.0 { rng.gen_range(0.7..1.0) } else { 0.0 };
            (value + rng.gen_range(0.0..0.2f32)).min(1.0)
        })
        .collect()
}

pub fn synthetic_dataset(labels: &[u8], per_class: usize, seed: u64) -> LabeledDataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::new();
    for _ in 0..per_class {
        for &label in labels {
            samples.push(LabeledImage {
                pixels: noisy_digit(label, &mut rng),
                label,
            });
        }
    }
    LabeledDataset::new(samples)
}

/// 合成数字を PNG にしたもの
pub fn digit_png(label: u8) -> Vec<u8> {
    let pixels = digit_pattern(label);
    let img = GrayImage::from_fn(IMAGE_SIZE, IMAGE_SIZE, |x, y| {
        Luma([(pixels[(y * IMAGE_SIZE + x) as usize] * 255.0) as u8])
    });
    encode_png(&DynamicImage::ImageLuma8(img))
}

/// 合図があるまで読み込みを止めるデータソース
pub struct GatedSource {
    dataset: LabeledDataset,
    gate: Mutex<mpsc::Receiver<()>>,
}

impl GatedSource {
    pub fn new(dataset: LabeledDataset) -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                dataset,
                gate: Mutex::new(rx),
            },
            tx,
        )
    }
}

impl DatasetSource for GatedSource {
    fn load(&self) -> Result<LabeledDataset> {
        let _ = self.gate.lock().recv();
        Ok(self.dataset.clone())
    }

    fn describe(&self) -> String {
        "gated".to_string()
    }
}

/// 読み込み回数を数えるストア
#[derive(Default)]
pub struct CountingStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicUsize,
}

impl CountingStore {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ArtifactStore for CountingStore {
    fn read(&self, identity: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.entries.lock().get(identity).cloned())
    }

    fn write(&self, identity: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.entries.lock().insert(identity.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, identity: &str) -> bool {
        self.entries.lock().contains_key(identity)
    }
}

/// テスト向けの短い学習設定
pub fn quick_hyperparameters() -> Hyperparameters {
    Hyperparameters {
        num_epochs: 3,
        batch_size: 16,
        learning_rate: 1e-2,
        ..Hyperparameters::default()
    }
}

pub fn fixed_time(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

pub fn trained_artifact(identity: &str) -> ModelArtifact {
    trained_artifact_at(identity, fixed_time(0))
}

pub fn trained_artifact_at(identity: &str, trained_at: DateTime<Utc>) -> ModelArtifact {
    let dataset = synthetic_dataset(&[1, 4, 7], 6, 13);
    Trainer::new(Arc::new(FixedClock(trained_at)))
        .train(identity, &dataset, &quick_hyperparameters())
        .unwrap()
}
