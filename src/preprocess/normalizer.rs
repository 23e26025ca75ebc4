//! 画像の正規化
//!
//! 任意のラスタ画像を 28x28 グレースケールの特徴ベクトル（784要素、[0, 1]）に変換します。
//! 各段階は独立した関数で、グローバル状態に依存しません。
//!
//! 1. デコード
//! 2. 輝度（単一チャネル）への変換
//! 3. 28x28 へのリサンプル（アスペクト比は保持せず引き伸ばす）
//! 4. 値域を [0, 1] に変換
//! 5. 行優先で平坦化

use std::path::Path;

use image::{imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, ImageFormat, Luma};

use crate::error::{EngineError, Result};

/// モデル入力の一辺のピクセル数
pub const IMAGE_SIZE: u32 = 28;

/// 特徴ベクトルの長さ
pub const NUM_FEATURES: usize = (IMAGE_SIZE * IMAGE_SIZE) as usize;

/// [0, 1] に変換済みの単一チャネル画像
pub type UnitGrid = ImageBuffer<Luma<f32>, Vec<f32>>;

/// バイト列から特徴ベクトルを作成（フォーマットは自動判定）
pub fn normalize(bytes: &[u8]) -> Result<Vec<f32>> {
    normalize_with_format(bytes, None)
}

/// フォーマット指定版
pub fn normalize_with_format(bytes: &[u8], format: Option<ImageFormat>) -> Result<Vec<f32>> {
    let img = decode(bytes, format)?;
    let gray = to_luminance(&img);
    let resized = resample(&gray);
    Ok(flatten(scale_to_unit(&resized)))
}

/// 画像ファイルから特徴ベクトルを作成
pub fn normalize_file(path: &Path) -> Result<Vec<f32>> {
    let bytes = std::fs::read(path).map_err(|e| {
        EngineError::UnsupportedFormat(format!("cannot read {}: {}", path.display(), e))
    })?;
    let format = ImageFormat::from_path(path).ok();
    normalize_with_format(&bytes, format)
}

/// ヘッダからフォーマットを推定
pub fn sniff_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

pub fn decode(bytes: &[u8], format: Option<ImageFormat>) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(EngineError::UnsupportedFormat("image is empty".to_string()));
    }

    let decoded = match format {
        Some(format) => image::load_from_memory_with_format(bytes, format),
        None => image::load_from_memory(bytes),
    };

    decoded.map_err(|e| EngineError::UnsupportedFormat(e.to_string()))
}

/// 多チャネル画像を輝度に変換（単一チャネルならそのまま8bit化）
pub fn to_luminance(img: &DynamicImage) -> GrayImage {
    img.to_luma8()
}

/// 28x28 に引き伸ばす（切り抜きはしない）
pub fn resample(gray: &GrayImage) -> GrayImage {
    if gray.dimensions() == (IMAGE_SIZE, IMAGE_SIZE) {
        return gray.clone();
    }
    image::imageops::resize(gray, IMAGE_SIZE, IMAGE_SIZE, FilterType::Lanczos3)
}

pub fn scale_to_unit(gray: &GrayImage) -> UnitGrid {
    UnitGrid::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as f32 / 255.0])
    })
}

/// 行優先で平坦化
pub fn flatten(grid: UnitGrid) -> Vec<f32> {
    grid.into_raw()
}
