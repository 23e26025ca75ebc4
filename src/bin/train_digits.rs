//! オフライン学習バイナリ
//!
//! 使い方: `train_digits [データセットパス] [保存先ディレクトリ]`
//! データセットがディレクトリなら画像フォルダ、ファイルならCSVとして読む。

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use digit_engine_lib::ml::Trainer;
use digit_engine_lib::model::{print_metadata_info, ArtifactStore, FsArtifactStore};
use digit_engine_lib::{CsvSource, DatasetSource, EngineConfig, ImageFolderSource, SystemClock};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let config = EngineConfig::load_or_default();

    let dataset_path = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.dataset.path.clone());
    let models_dir = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| config.models_dir.clone());

    let source: Box<dyn DatasetSource> = if dataset_path.is_dir() {
        Box::new(ImageFolderSource::new(dataset_path))
    } else {
        Box::new(CsvSource::new(dataset_path, config.dataset.has_headers))
    };

    println!("=== Digit Trainer ===");
    println!("データセット: {}", source.describe());
    println!("保存先: {}\n", models_dir.display());

    let dataset = source.load()?;
    info!(samples = dataset.len(), "Dataset loaded");
    println!("クラス別件数: {:?}", dataset.class_counts());

    let trainer = Trainer::new(Arc::new(SystemClock));
    let cancel = AtomicBool::new(false);
    let artifact = trainer.run(
        &config.model_identity,
        &dataset,
        &config.training_plan(),
        &cancel,
        &mut |hint| info!(percent = hint.percent, phase = %hint.phase, "Training"),
    )?;

    let store = FsArtifactStore::new(models_dir);
    store.write(artifact.identity(), &artifact.to_bytes()?)?;
    let path = store.artifact_path(artifact.identity())?;
    println!("✓ モデルを保存しました: {}", path.display());

    print_metadata_info(artifact.metadata());
    Ok(())
}
