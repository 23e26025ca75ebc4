//! 学習ライフサイクルの状態管理
//!
//! `NotStarted → InProgress → Ready`、`InProgress → Failed`、`Failed → InProgress`
//! の遷移を管理する。公開する状態は (TrainingJob, アーティファクト) の組を
//! 不変値として丸ごと差し替えるので、読み手が `Ready` なのにアーティファクトが
//! 無い状態を見ることはない。
//!
//! 学習は `tokio::task::spawn_blocking` 上で実行され、リクエスト処理側は
//! スナップショットを読むだけでブロックしない。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::dataset::DatasetSource;
use crate::error::{EngineError, Result};
use crate::ml::{Hyperparameters, Trainer, TrainingPlan};
use crate::model::{ModelArtifact, ModelRegistry};
use crate::types::{ProgressHint, TrainingJob, TrainingStatus};

/// ある時点の状態とそのとき有効なアーティファクト
#[derive(Debug, Clone)]
pub struct LifecycleSnapshot {
    pub job: TrainingJob,
    pub artifact: Option<Arc<ModelArtifact>>,
}

/// 実行中の学習タスク
struct Worker {
    job_id: u64,
    cancel: Arc<AtomicBool>,
    /// `wait_for_training` が取り出すと None
    handle: Option<JoinHandle<()>>,
}

pub struct LifecycleController {
    identity: String,
    registry: Arc<ModelRegistry>,
    source: Arc<dyn DatasetSource>,
    trainer: Trainer,
    clock: Arc<dyn Clock>,
    default_plan: TrainingPlan,
    train_on_start: bool,
    snapshot: RwLock<Arc<LifecycleSnapshot>>,
    /// 学習タスクを載せるランタイム（None なら呼び出し元のランタイム）
    runtime: Option<Handle>,
    /// 状態の遷移開始（起動・InProgress）はこのロックを持って行う
    worker: Mutex<Option<Worker>>,
    next_job_id: AtomicU64,
}

impl LifecycleController {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<ModelRegistry>,
        source: Arc<dyn DatasetSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: identity.into(),
            registry,
            source,
            trainer: Trainer::new(clock.clone()),
            clock,
            default_plan: TrainingPlan::Fixed(Hyperparameters::default()),
            train_on_start: true,
            snapshot: RwLock::new(Arc::new(LifecycleSnapshot {
                job: TrainingJob::not_started(),
                artifact: None,
            })),
            runtime: None,
            worker: Mutex::new(None),
            next_job_id: AtomicU64::new(1),
        }
    }

    /// 引数なしの学習要求で使う計画
    pub fn with_plan(mut self, plan: TrainingPlan) -> Self {
        self.default_plan = plan;
        self
    }

    pub fn with_train_on_start(mut self, train_on_start: bool) -> Self {
        self.train_on_start = train_on_start;
        self
    }

    /// 学習タスクを指定のランタイムで実行する
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// 起動処理
    ///
    /// 使えるアーティファクトが保存されていれば読み込んで `Ready` にする。
    /// 無い（または壊れている）場合は学習をバックグラウンドで開始する。
    /// `NotStarted` 以外の状態で呼んでも何もせず現在のジョブを返す。
    pub fn start(self: &Arc<Self>) -> TrainingJob {
        let mut worker = self.worker.lock();

        let current = self.snapshot();
        if current.job.status != TrainingStatus::NotStarted {
            return current.job.clone();
        }

        match self.registry.get(&self.identity) {
            Ok(artifact) => {
                let job = TrainingJob::loaded(artifact.trained_at());
                info!(identity = %self.identity, trained_at = %artifact.trained_at(), "Model ready from storage");
                self.publish(LifecycleSnapshot {
                    job: job.clone(),
                    artifact: Some(artifact),
                });
                return job;
            }
            Err(EngineError::NotFound(_)) => {
                info!(identity = %self.identity, "No stored model artifact");
            }
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Stored model artifact is unusable, retraining");
            }
        }

        if self.train_on_start {
            self.spawn_training(&mut worker, &current, None)
        } else {
            current.job.clone()
        }
    }

    /// 現在のジョブ状態（I/Oなし）
    pub fn status(&self) -> TrainingJob {
        self.snapshot().job.clone()
    }

    /// 現在のスナップショット（参照を複製するだけ）
    pub fn snapshot(&self) -> Arc<LifecycleSnapshot> {
        self.snapshot.read().clone()
    }

    /// 学習を開始する
    ///
    /// 既に実行中なら何もせず、実行中のジョブを返す。
    /// `plan` が None なら既定の計画を使う。
    pub fn trigger_training(self: &Arc<Self>, plan: Option<TrainingPlan>) -> TrainingJob {
        let mut worker = self.worker.lock();

        let current = self.snapshot();
        if current.job.status == TrainingStatus::InProgress {
            return current.job.clone();
        }
        self.spawn_training(&mut worker, &current, plan)
    }

    /// InProgress を公開して学習タスクを起動する（`worker` のロック中に呼ぶ）
    ///
    /// tokio ランタイムが無ければ起動せず、その旨の `Failed` ジョブを公開する。
    fn spawn_training(
        self: &Arc<Self>,
        worker: &mut Option<Worker>,
        current: &LifecycleSnapshot,
        plan: Option<TrainingPlan>,
    ) -> TrainingJob {
        let job_id = self.next_job_id.fetch_add(1, Ordering::SeqCst);
        let job = TrainingJob::in_progress(job_id, self.clock.now());

        let runtime = match self.runtime.clone().or_else(|| Handle::try_current().ok()) {
            Some(runtime) => runtime,
            None => {
                error!(identity = %self.identity, job_id, "No tokio runtime to run training on");
                let failed = job.failed(
                    EngineError::TrainingFailed("no tokio runtime available for background training".to_string())
                        .to_string(),
                    self.clock.now(),
                );
                self.publish(LifecycleSnapshot {
                    job: failed.clone(),
                    artifact: current.artifact.clone(),
                });
                return failed;
            }
        };

        // 再学習中も前のアーティファクトは保持する（メトリクス・エクスポート用）
        self.publish(LifecycleSnapshot {
            job: job.clone(),
            artifact: current.artifact.clone(),
        });

        let plan = plan.unwrap_or_else(|| self.default_plan.clone());
        let cancel = Arc::new(AtomicBool::new(false));
        let this = Arc::clone(self);
        let cancel_flag = cancel.clone();
        let handle = runtime.spawn_blocking(move || this.run_training(job_id, &plan, &cancel_flag));

        info!(identity = %self.identity, job_id, "Training scheduled");
        *worker = Some(Worker {
            job_id,
            cancel,
            handle: Some(handle),
        });
        job
    }

    /// 学習タスク本体（ブロッキングスレッド上で実行）
    fn run_training(&self, job_id: u64, plan: &TrainingPlan, cancel: &AtomicBool) {
        let result = catch_unwind(AssertUnwindSafe(|| self.execute(job_id, plan, cancel)))
            .unwrap_or_else(|_| Err(EngineError::TrainingFailed("training task panicked".to_string())));
        let finished_at = self.clock.now();

        match result {
            Ok(artifact) => {
                let artifact = Arc::new(artifact);
                // レジストリに入れてから Ready を公開する
                // 学習時刻に関係なく、完了した学習の結果が常に有効になる
                self.registry.set(&self.identity, artifact.clone());
                self.publish_if_current(job_id, |current| LifecycleSnapshot {
                    job: current.job.completed(finished_at),
                    artifact: Some(artifact.clone()),
                });
                info!(identity = %self.identity, job_id, "Model ready");
            }
            Err(e) => {
                error!(identity = %self.identity, job_id, error = %e, "Training failed");
                let message = e.to_string();
                self.publish_if_current(job_id, |current| LifecycleSnapshot {
                    job: current.job.failed(message.clone(), finished_at),
                    artifact: current.artifact.clone(),
                });
            }
        }
    }

    fn execute(&self, job_id: u64, plan: &TrainingPlan, cancel: &AtomicBool) -> Result<ModelArtifact> {
        self.update_progress(job_id, ProgressHint::new(1, "loading dataset"));
        let dataset = self.source.load()?;
        info!(
            identity = %self.identity,
            job_id,
            source = %self.source.describe(),
            samples = dataset.len(),
            "Dataset loaded"
        );
        if cancel.load(Ordering::Relaxed) {
            return Err(EngineError::Cancelled);
        }

        let artifact = self.trainer.run(&self.identity, &dataset, plan, cancel, &mut |hint| {
            self.update_progress(job_id, hint)
        })?;

        self.update_progress(job_id, ProgressHint::new(95, "persisting"));
        if let Err(e) = self.registry.persist(&artifact) {
            // メモリ上では使えるので Ready にはする
            warn!(identity = %self.identity, job_id, error = %e, "Failed to persist model artifact");
        }
        Ok(artifact)
    }

    fn update_progress(&self, job_id: u64, hint: ProgressHint) {
        self.publish_if_current(job_id, |current| LifecycleSnapshot {
            job: current.job.with_progress(hint.clone()),
            artifact: current.artifact.clone(),
        });
    }

    fn publish(&self, next: LifecycleSnapshot) {
        *self.snapshot.write() = Arc::new(next);
    }

    /// 指定ジョブが実行中の場合だけ状態を更新する
    fn publish_if_current(&self, job_id: u64, next: impl FnOnce(&LifecycleSnapshot) -> LifecycleSnapshot) {
        let mut snapshot = self.snapshot.write();
        if snapshot.job.id == job_id && snapshot.job.status == TrainingStatus::InProgress {
            *snapshot = Arc::new(next(&snapshot));
        }
    }

    /// 実行中の学習に中断を要求する（完了は待たない）
    pub fn cancel(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            info!(identity = %self.identity, job_id = worker.job_id, "Cancelling training");
            worker.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// 実行中の学習が終わるまで待つ
    pub async fn wait_for_training(&self) {
        let handle = {
            let mut worker = self.worker.lock();
            worker.as_mut().and_then(|w| w.handle.take())
        };

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(identity = %self.identity, error = %e, "Training task did not complete");
            }
        }
    }

    /// 学習を中断して終了を待つ
    pub async fn shutdown(&self) {
        self.cancel();
        self.wait_for_training().await;
    }
}
