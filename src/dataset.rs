//! 学習データセット
//!
//! ラベル付きの 28x28 グレースケール画像（784要素、[0, 1]）を供給します。
//! データの取得元は `DatasetSource` で差し替え可能です。

use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::ml::NUM_CLASSES;
use crate::preprocess::{normalize_file, NUM_FEATURES};

/// ラベル付き画像
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledImage {
    pub pixels: Vec<f32>,
    pub label: u8,
}

/// データセット全体
#[derive(Debug, Clone, Default)]
pub struct LabeledDataset {
    samples: Vec<LabeledImage>,
}

impl LabeledDataset {
    pub fn new(samples: Vec<LabeledImage>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[LabeledImage] {
        &self.samples
    }

    pub fn samples_mut(&mut self) -> &mut [LabeledImage] {
        &mut self.samples
    }

    pub fn labels(&self) -> Vec<u8> {
        self.samples.iter().map(|s| s.label).collect()
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0usize; NUM_CLASSES];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label as usize) {
                *count += 1;
            }
        }
        counts
    }

    /// 指定インデックスの特徴行とラベルを取り出す
    pub fn select(&self, indices: &[usize]) -> (Vec<&[f32]>, Vec<u8>) {
        indices
            .iter()
            .map(|&i| (self.samples[i].pixels.as_slice(), self.samples[i].label))
            .unzip()
    }

    /// 形式チェック（空、要素数、値域、ラベル）
    pub fn validate(&self) -> Result<()> {
        if self.samples.is_empty() {
            return Err(EngineError::InvalidDataset("dataset is empty".to_string()));
        }

        for (i, sample) in self.samples.iter().enumerate() {
            if sample.pixels.len() != NUM_FEATURES {
                return Err(EngineError::InvalidDataset(format!(
                    "sample {} has {} values, expected {}",
                    i,
                    sample.pixels.len(),
                    NUM_FEATURES
                )));
            }
            if sample.label as usize >= NUM_CLASSES {
                return Err(EngineError::InvalidDataset(format!(
                    "sample {} has label {}, expected 0-9",
                    i, sample.label
                )));
            }
            if sample.pixels.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
                return Err(EngineError::InvalidDataset(format!(
                    "sample {} has values outside [0, 1]",
                    i
                )));
            }
        }

        Ok(())
    }
}

/// データセットの取得元
pub trait DatasetSource: Send + Sync {
    fn load(&self) -> Result<LabeledDataset>;

    /// ログ用の説明
    fn describe(&self) -> String;
}

/// メモリ上のデータセット
pub struct InMemorySource {
    dataset: LabeledDataset,
}

impl InMemorySource {
    pub fn new(dataset: LabeledDataset) -> Self {
        Self { dataset }
    }
}

impl DatasetSource for InMemorySource {
    fn load(&self) -> Result<LabeledDataset> {
        Ok(self.dataset.clone())
    }

    fn describe(&self) -> String {
        format!("in-memory ({} samples)", self.dataset.len())
    }
}

/// MNIST形式のCSV（ラベル, 画素0..783 の値は 0〜255）
pub struct CsvSource {
    path: PathBuf,
    has_headers: bool,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>, has_headers: bool) -> Self {
        Self {
            path: path.into(),
            has_headers,
        }
    }
}

impl DatasetSource for CsvSource {
    fn load(&self) -> Result<LabeledDataset> {
        let mut reader = ReaderBuilder::new()
            .has_headers(self.has_headers)
            .from_path(&self.path)
            .map_err(|e| {
                EngineError::InvalidDataset(format!("cannot open {}: {}", self.path.display(), e))
            })?;

        let mut samples = Vec::new();

        for result in reader.records() {
            let record = result.map_err(|e| EngineError::InvalidDataset(e.to_string()))?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            if record.len() != NUM_FEATURES + 1 {
                return Err(EngineError::InvalidDataset(format!(
                    "line {}: {} columns, expected {}",
                    line,
                    record.len(),
                    NUM_FEATURES + 1
                )));
            }

            let label: u8 = record
                .get(0)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| EngineError::InvalidDataset(format!("line {}: bad label", line)))?;

            let mut pixels = Vec::with_capacity(NUM_FEATURES);
            for field in record.iter().skip(1) {
                let value: f32 = field.trim().parse().map_err(|_| {
                    EngineError::InvalidDataset(format!("line {}: bad pixel value '{}'", line, field))
                })?;
                pixels.push(value / 255.0);
            }

            samples.push(LabeledImage { pixels, label });
        }

        info!(path = %self.path.display(), samples = samples.len(), "loaded csv dataset");
        Ok(LabeledDataset::new(samples))
    }

    fn describe(&self) -> String {
        format!("csv {}", self.path.display())
    }
}

/// クラスごとのサブディレクトリ（0〜9）に画像を置いたデータセット
pub struct ImageFolderSource {
    root: PathBuf,
}

impl ImageFolderSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn image_paths(class_dir: &Path) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(class_dir).map_err(|e| {
            EngineError::InvalidDataset(format!("cannot read {}: {}", class_dir.display(), e))
        })?;

        let mut paths = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(ext) = path.extension() {
                let ext_str = ext.to_string_lossy().to_lowercase();
                if ext_str == "png" || ext_str == "jpg" || ext_str == "jpeg" {
                    paths.push(path);
                }
            }
        }

        // read_dir の順序は不定なのでソートして再現性を保つ
        paths.sort();
        Ok(paths)
    }
}

impl DatasetSource for ImageFolderSource {
    fn load(&self) -> Result<LabeledDataset> {
        let mut samples = Vec::new();

        for label in 0..NUM_CLASSES as u8 {
            let class_dir = self.root.join(label.to_string());
            if !class_dir.is_dir() {
                debug!(dir = %class_dir.display(), "class directory missing, skipping");
                continue;
            }

            let paths = Self::image_paths(&class_dir)?;
            debug!(label, count = paths.len(), "collected class images");

            for path in paths {
                match normalize_file(&path) {
                    Ok(pixels) => samples.push(LabeledImage { pixels, label }),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable image"),
                }
            }
        }

        info!(root = %self.root.display(), samples = samples.len(), "loaded image folder dataset");
        Ok(LabeledDataset::new(samples))
    }

    fn describe(&self) -> String {
        format!("image folder {}", self.root.display())
    }
}

/// 学習用・評価用のインデックス
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSplit {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// クラス比率を保った分割
///
/// ラベルとシードだけで決まり、画素値には依存しない。
/// 各クラスは少なくとも1件を学習側に残す。
pub fn stratified_split(labels: &[u8], train_ratio: f32, seed: u64) -> DatasetSplit {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();

    for class in 0..NUM_CLASSES as u8 {
        let mut indices: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, label)| **label == class)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            continue;
        }

        indices.shuffle(&mut rng);

        let n_test = ((indices.len() as f32) * (1.0 - train_ratio)).round() as usize;
        let n_test = n_test.min(indices.len() - 1);

        test.extend_from_slice(&indices[..n_test]);
        train.extend_from_slice(&indices[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();

    DatasetSplit { train, test }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{encode_png, synthetic_dataset};
    use image::{DynamicImage, GrayImage, Luma};
    use std::io::Write;

    #[test]
    fn test_split_is_deterministic_and_disjoint() {
        let dataset = synthetic_dataset(&[0, 1, 2], 20, 7);
        let labels = dataset.labels();

        let a = stratified_split(&labels, 0.8, 42);
        let b = stratified_split(&labels, 0.8, 42);
        assert_eq!(a, b);

        assert_eq!(a.train.len() + a.test.len(), labels.len());
        assert!(a.train.iter().all(|i| !a.test.contains(i)));
        // 各クラス 20件 → 4件ずつ評価用
        assert_eq!(a.test.len(), 12);
        for class in 0..3u8 {
            assert_eq!(a.test.iter().filter(|&&i| labels[i] == class).count(), 4);
        }
    }

    #[test]
    fn test_split_keeps_one_training_row_per_class() {
        let labels = vec![0, 1, 1];
        let split = stratified_split(&labels, 0.1, 1);
        assert!(split.train.contains(&0));
        assert_eq!(split.train.iter().filter(|&&i| labels[i] == 1).count(), 1);
    }

    #[test]
    fn test_split_ignores_pixel_values() {
        let mut dataset = synthetic_dataset(&[3, 5], 10, 1);
        let before = stratified_split(&dataset.labels(), 0.7, 9);
        for sample in dataset.samples_mut() {
            sample.pixels.iter_mut().for_each(|v| *v = 1.0 - *v);
        }
        let after = stratified_split(&dataset.labels(), 0.7, 9);
        assert_eq!(before, after);
    }

    #[test]
    fn test_validate_rejects_bad_rows() {
        assert!(matches!(
            LabeledDataset::default().validate(),
            Err(EngineError::InvalidDataset(_))
        ));

        let short = LabeledDataset::new(vec![LabeledImage {
            pixels: vec![0.0; 10],
            label: 1,
        }]);
        assert!(matches!(short.validate(), Err(EngineError::InvalidDataset(_))));

        let bad_label = LabeledDataset::new(vec![LabeledImage {
            pixels: vec![0.0; NUM_FEATURES],
            label: 12,
        }]);
        assert!(matches!(bad_label.validate(), Err(EngineError::InvalidDataset(_))));

        let out_of_range = LabeledDataset::new(vec![LabeledImage {
            pixels: vec![2.0; NUM_FEATURES],
            label: 1,
        }]);
        assert!(matches!(out_of_range.validate(), Err(EngineError::InvalidDataset(_))));
    }

    #[test]
    fn test_csv_source_scales_pixels() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for label in [3u8, 7u8] {
            let mut row = vec![label.to_string()];
            row.extend((0..NUM_FEATURES).map(|i| if i == 0 { "255".to_string() } else { "0".to_string() }));
            writeln!(file, "{}", row.join(",")).unwrap();
        }

        let dataset = CsvSource::new(file.path(), false).load().unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.labels(), vec![3, 7]);
        assert_eq!(dataset.samples()[0].pixels[0], 1.0);
        assert_eq!(dataset.samples()[0].pixels[1], 0.0);
        dataset.validate().unwrap();
    }

    #[test]
    fn test_csv_source_rejects_short_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1,0,0,0").unwrap();
        let err = CsvSource::new(file.path(), false).load().unwrap_err();
        assert!(matches!(err, EngineError::InvalidDataset(_)));
    }

    #[test]
    fn test_image_folder_source() {
        let dir = tempfile::tempdir().unwrap();
        for label in ["0", "4"] {
            let class_dir = dir.path().join(label);
            std::fs::create_dir_all(&class_dir).unwrap();
            let img = GrayImage::from_pixel(14, 14, Luma([128]));
            std::fs::write(class_dir.join("a.png"), encode_png(&DynamicImage::ImageLuma8(img))).unwrap();
            std::fs::write(class_dir.join("notes.txt"), b"ignored").unwrap();
        }

        let dataset = ImageFolderSource::new(dir.path()).load().unwrap();
        assert_eq!(dataset.labels(), vec![0, 4]);
        dataset.validate().unwrap();
    }
}
