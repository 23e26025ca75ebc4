//! モデルレジストリ
//!
//! 識別子ごとに有効なアーティファクトを1つだけメモリに保持する。
//! 最初の `get` で永続ストアから読み込み、以降はキャッシュを返す。
//! 置き換えは参照の差し替えだけで、配布済みのアーティファクトは変更しない。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::model::artifact::ModelArtifact;
use crate::model::model_metadata::ModelMetrics;
use crate::model::model_storage::{is_valid_identity, ArtifactStore};

pub struct ModelRegistry {
    store: Arc<dyn ArtifactStore>,
    active: RwLock<HashMap<String, Arc<ModelArtifact>>>,
    /// 同じ識別子を並行してデシリアライズしない
    load_lock: Mutex<()>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store,
            active: RwLock::new(HashMap::new()),
            load_lock: Mutex::new(()),
        }
    }

    /// キャッシュ済みのアーティファクト（I/Oなし）
    pub fn cached(&self, identity: &str) -> Option<Arc<ModelArtifact>> {
        self.active.read().get(identity).cloned()
    }

    /// 有効なアーティファクトを取得（未読み込みならストアから読む）
    ///
    /// ストアにも無ければ `NotFound`、壊れていれば `Storage`。
    pub fn get(&self, identity: &str) -> Result<Arc<ModelArtifact>> {
        if let Some(artifact) = self.cached(identity) {
            return Ok(artifact);
        }
        if !is_valid_identity(identity) {
            return Err(EngineError::NotFound(identity.to_string()));
        }

        let _guard = self.load_lock.lock();
        // 待っている間に別スレッドが読み込んだかもしれない
        if let Some(artifact) = self.cached(identity) {
            return Ok(artifact);
        }

        let bytes = self
            .store
            .read(identity)?
            .ok_or_else(|| EngineError::NotFound(identity.to_string()))?;
        let artifact = Arc::new(ModelArtifact::from_bytes(&bytes)?);
        info!(
            identity,
            trained_at = %artifact.trained_at(),
            "Loaded model artifact from storage"
        );

        self.active
            .write()
            .insert(identity.to_string(), artifact.clone());
        Ok(artifact)
    }

    /// 有効なアーティファクトを差し替え、直前のものを返す
    ///
    /// 呼び出し側（ライフサイクル）が完了した学習の順に呼ぶ。学習時刻は比較しない。
    pub fn set(&self, identity: &str, artifact: Arc<ModelArtifact>) -> Option<Arc<ModelArtifact>> {
        let previous = self
            .active
            .write()
            .insert(identity.to_string(), artifact.clone());
        if let Some(ref previous) = previous {
            if previous.trained_at() > artifact.trained_at() {
                warn!(
                    identity,
                    previous = %previous.trained_at(),
                    replacement = %artifact.trained_at(),
                    "Replacing artifact with one that has an earlier timestamp"
                );
            }
        }
        previous
    }

    /// 永続ストアへ書き込む
    pub fn persist(&self, artifact: &ModelArtifact) -> Result<()> {
        let bytes = artifact.to_bytes()?;
        self.store.write(artifact.identity(), &bytes)?;
        Ok(())
    }

    pub fn exists_on_disk(&self, identity: &str) -> bool {
        self.store.exists(identity)
    }

    /// ダウンロード用に永続化済みのバイト列を返す
    pub fn export(&self, identity: &str) -> Result<Vec<u8>> {
        if !is_valid_identity(identity) {
            return Err(EngineError::NotFound(identity.to_string()));
        }
        if let Some(bytes) = self.store.read(identity)? {
            return Ok(bytes);
        }
        // 永続化に失敗していてもメモリ上にあれば書き出せる
        match self.cached(identity) {
            Some(artifact) => Ok(artifact.to_bytes()?),
            None => Err(EngineError::NotFound(identity.to_string())),
        }
    }

    /// 保存済みメタデータから評価指標を返す（再計算しない）
    pub fn metrics(&self, identity: &str) -> Result<ModelMetrics> {
        let artifact = self.get(identity)?;
        Ok(ModelMetrics::from(artifact.metadata()))
    }
}
