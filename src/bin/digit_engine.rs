//! エンジンを起動して画像を推論するバイナリ
//!
//! 使い方: `digit_engine [画像パス...]`
//! 保存済みモデルが無ければ学習が終わるまで待ってから推論する。

use std::time::Duration;

use anyhow::Context;
use digit_engine_lib::{DigitEngine, EngineConfig, PredictionRequest, TrainingStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let images: Vec<String> = std::env::args().skip(1).collect();

    let config = EngineConfig::load_or_default();
    config.display();

    let engine = DigitEngine::from_config(&config);
    let mut job = engine.start();
    let mut last_phase = String::new();

    // 学習中は進捗を出しながら待つ
    while job.status == TrainingStatus::InProgress {
        if let Some(hint) = &job.progress_hint {
            if hint.phase != last_phase {
                info!(percent = hint.percent, phase = %hint.phase, "Training");
                last_phase = hint.phase.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        job = engine.status();
    }

    match job.status {
        TrainingStatus::Ready => info!(job_id = job.id, "Engine ready"),
        TrainingStatus::Failed => {
            anyhow::bail!("Training failed: {}", job.error.unwrap_or_default());
        }
        _ => {
            warn!(status = %job.status, "No model available");
            return Ok(());
        }
    }

    let metrics = engine.metrics(engine.identity())?;
    println!(
        "accuracy: {:.4}, f1: {:.4} ({} test samples)",
        metrics.accuracy, metrics.f1, metrics.test_samples
    );

    for path in &images {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read image: {}", path))?;
        let request = match image::ImageFormat::from_path(path) {
            Ok(format) => PredictionRequest::new(bytes).with_format(format),
            Err(_) => PredictionRequest::new(bytes),
        };

        match engine.predict(&request) {
            Ok(result) => println!("{}: {}", path, serde_json::to_string(&result)?),
            Err(e) => eprintln!("{}: {}", path, e),
        }
    }

    engine.shutdown().await;
    Ok(())
}
