//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（学習パラメータ、評価結果など）
//! - scaler.json     - 特徴量の標準化パラメータ
//! - model.bin       - モデルの重み（バイナリ）

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use tar::{Archive, Builder};
use tracing::debug;

use crate::ml::FeatureScaler;
use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const SCALER_ENTRY: &str = "scaler.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータ・スケーラー・モデルの重みを tar.gz のバイト列にまとめる
///
/// 同じ内容なら同じバイト列になる（更新時刻は0固定）。
pub fn write_archive(
    metadata: &ModelMetadata,
    scaler: &FeatureScaler,
    model_binary: &[u8],
) -> Result<Vec<u8>> {
    // Gzip圧縮を設定
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let metadata_json = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, metadata_json.as_bytes())?;

    let scaler_json =
        serde_json::to_string(scaler).context("Failed to serialize scaler to JSON")?;
    append_entry(&mut tar_builder, SCALER_ENTRY, scaler_json.as_bytes())?;

    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tarアーカイブを完成させる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finish gzip stream")
}

fn append_entry<W: Write>(tar_builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    tar_builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// tar.gz のバイト列からメタデータ・スケーラー・モデルの重みを読み込む
pub fn read_archive(bytes: &[u8]) -> Result<(ModelMetadata, FeatureScaler, Vec<u8>)> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = Archive::new(decoder);

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut scaler_opt: Option<FeatureScaler> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries().context("Failed to read tar.gz archive")? {
        let mut entry = entry.context("Corrupt tar entry")?;
        let name = entry.path()?.to_string_lossy().into_owned();

        match name.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            SCALER_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                scaler_opt = Some(
                    serde_json::from_str(&json_str)
                        .context("Failed to deserialize scaler from JSON")?,
                );
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            other => debug!(entry = other, "Ignoring unknown archive entry"),
        }
    }

    match (metadata_opt, scaler_opt, model_binary_opt) {
        (Some(metadata), Some(scaler), Some(binary)) => Ok((metadata, scaler, binary)),
        (None, _, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None, _) => Err(anyhow::anyhow!("scaler.json not found in tar.gz archive")),
        (_, _, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// モデル識別子として使える文字列か（英数字、`_`、`-` のみ）
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// アーティファクトの保存先
pub trait ArtifactStore: Send + Sync {
    /// 保存されていなければ `Ok(None)`
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>>;

    /// 読み手が書きかけのデータを見ることはない
    fn write(&self, identity: &str, bytes: &[u8]) -> Result<()>;

    fn exists(&self, identity: &str) -> bool;
}

/// `{models_dir}/{identity}_model.tar.gz` に保存するストア
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    models_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn artifact_path(&self, identity: &str) -> Result<PathBuf> {
        if !is_valid_identity(identity) {
            anyhow::bail!("Invalid model identity: {:?}", identity);
        }
        Ok(self.models_dir.join(format!("{}_model.tar.gz", identity)))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(identity)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(format!("Failed to read artifact: {:?}", path)),
        }
    }

    fn write(&self, identity: &str, bytes: &[u8]) -> Result<()> {
        let path = self.artifact_path(identity)?;

        // 親ディレクトリが存在しない場合は作成
        std::fs::create_dir_all(&self.models_dir)
            .context(format!("Failed to create models directory: {:?}", self.models_dir))?;

        // 書き込みごとに別名の一時ファイルへ書いてから置き換える
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}_model.", identity))
            .suffix(".tmp")
            .tempfile_in(&self.models_dir)
            .context(format!("Failed to create temporary file in {:?}", self.models_dir))?;
        tmp.write_all(bytes)
            .context(format!("Failed to write artifact: {:?}", tmp.path()))?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .context(format!("Failed to move artifact into place: {:?}", path))?;

        debug!(path = %path.display(), bytes = bytes.len(), "Artifact written");
        Ok(())
    }

    fn exists(&self, identity: &str) -> bool {
        self.artifact_path(identity)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }
}

/// メモリ上のストア
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(identity).cloned())
    }

    fn write(&self, identity: &str, bytes: &[u8]) -> Result<()> {
        if !is_valid_identity(identity) {
            anyhow::bail!("Invalid model identity: {:?}", identity);
        }
        self.entries
            .write()
            .insert(identity.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, identity: &str) -> bool {
        self.entries.read().contains_key(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::trained_artifact;
    use crate::model::ModelArtifact;

    #[test]
    fn test_archive_round_trip() {
        let artifact = trained_artifact("softmax");
        let bytes = artifact.to_bytes().unwrap();

        let (metadata, scaler, binary) = read_archive(&bytes).unwrap();
        assert_eq!(&metadata, artifact.metadata());
        assert_eq!(&scaler, artifact.scaler());
        assert!(!binary.is_empty());

        // 同じアーティファクトは同じバイト列になる
        assert_eq!(bytes, artifact.to_bytes().unwrap());

        let restored = ModelArtifact::from_bytes(&bytes).unwrap();
        let sample = vec![0.5f32; crate::preprocess::NUM_FEATURES];
        assert_eq!(
            artifact.predict_proba(&sample).unwrap(),
            restored.predict_proba(&sample).unwrap()
        );
    }

    #[test]
    fn test_archive_missing_entry() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = Builder::new(encoder);
        append_entry(&mut builder, MODEL_ENTRY, b"weights").unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let err = read_archive(&bytes).unwrap_err();
        assert!(err.to_string().contains("metadata.json"));
    }

    #[test]
    fn test_corrupt_archive_is_rejected() {
        assert!(read_archive(b"not a gzip stream").is_err());
        assert!(ModelArtifact::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path().join("models"));

        assert!(!store.exists("softmax"));
        assert_eq!(store.read("softmax").unwrap(), None);

        store.write("softmax", b"first").unwrap();
        store.write("softmax", b"second").unwrap();
        assert!(store.exists("softmax"));
        assert_eq!(store.read("softmax").unwrap(), Some(b"second".to_vec()));
        assert!(dir.path().join("models/softmax_model.tar.gz").is_file());

        // 一時ファイルは残らない
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("models"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_writers_do_not_clobber() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FsArtifactStore::new(dir.path().join("models")));

        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 4096]).collect();
        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        store.write("softmax", &payload).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // 最後に書いたどれか1つが丸ごと残る
        let stored = store.read("softmax").unwrap().unwrap();
        assert!(payloads.contains(&stored));
        let leftovers = std::fs::read_dir(dir.path().join("models"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_identity_is_restricted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());

        for identity in ["", "../escape", "a/b", "name.tar", "space here"] {
            assert!(store.write(identity, b"x").is_err(), "{:?}", identity);
            assert!(!store.exists(identity));
        }
        assert!(is_valid_identity("svm_v2-final"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryArtifactStore::new();
        assert_eq!(store.read("softmax").unwrap(), None);
        store.write("softmax", b"bytes").unwrap();
        assert!(store.exists("softmax"));
        assert_eq!(store.read("softmax").unwrap(), Some(b"bytes".to_vec()));
    }
}
