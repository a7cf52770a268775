//! 流水线门面 - 编排层
//!
//! 接收一批文件（新上传或重新处理请求），建立状态记录，交给调度器执行，
//! 并提供状态/结果查询。
//!
//! 拒绝（`InvalidSubmission` / `InvalidReprocess` / `ConcurrencyViolation`）不会写入任何记录。

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, oneshot};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PipelineError, Result, StoreError};
use crate::infrastructure::{ResultStore, StatusStore, TraceSink};
use crate::models::{
    FileProcessingStatus, RunState, Stage, StageResult, StatusEvent, UploadedFile,
};
use crate::orchestrator::scheduler::{ConcurrencyScheduler, SchedulerStats};
use crate::services::StageAdapters;
use crate::workflow::{PipelineRunner, RunJob, RunOutcome, TraceRecorder};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 批次中的一项
#[derive(Debug, Clone)]
pub enum BatchItem {
    /// 新上传的文件，从 INGEST 开始
    New(UploadedFile),
    /// 重新处理一个 FAILED 文件，从 PARSE 开始
    Reprocess { file_id: String, prioritized: bool },
}

impl BatchItem {
    pub fn reprocess(file_id: impl Into<String>) -> Self {
        BatchItem::Reprocess {
            file_id: file_id.into(),
            prioritized: false,
        }
    }

    pub fn prioritized_reprocess(file_id: impl Into<String>) -> Self {
        BatchItem::Reprocess {
            file_id: file_id.into(),
            prioritized: true,
        }
    }
}

impl From<UploadedFile> for BatchItem {
    fn from(upload: UploadedFile) -> Self {
        BatchItem::New(upload)
    }
}

/// 已接受的运行
#[derive(Debug)]
pub struct AcceptedRun {
    /// 在批次中的位置
    pub index: usize,
    pub file_id: String,
    pub attempt: u32,
    pub resume: Stage,
    outcome: oneshot::Receiver<Result<RunOutcome>>,
}

impl AcceptedRun {
    /// 等待这次运行结束
    pub async fn wait(self) -> Result<RunOutcome> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::RunAborted {
                file_id: self.file_id,
            }),
        }
    }
}

/// 被拒绝的项
#[derive(Debug)]
pub struct RejectedItem {
    pub index: usize,
    pub error: PipelineError,
}

/// `submit_batch` 的回执
#[derive(Debug, Default)]
pub struct BatchReceipt {
    pub accepted: Vec<AcceptedRun>,
    pub rejected: Vec<RejectedItem>,
}

impl BatchReceipt {
    pub fn file_ids(&self) -> Vec<String> {
        self.accepted.iter().map(|run| run.file_id.clone()).collect()
    }

    /// 等待所有已接受的运行结束，顺序与 `accepted` 一致
    pub async fn wait(self) -> Vec<Result<RunOutcome>> {
        join_all(self.accepted.into_iter().map(AcceptedRun::wait)).await
    }
}

/// 流水线门面
pub struct Orchestrator {
    config: Arc<Config>,
    status_store: Arc<dyn StatusStore>,
    result_store: Arc<dyn ResultStore>,
    runner: Arc<PipelineRunner>,
    scheduler: ConcurrencyScheduler,
    events: broadcast::Sender<StatusEvent>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        status_store: Arc<dyn StatusStore>,
        result_store: Arc<dyn ResultStore>,
        adapters: StageAdapters,
        trace_sink: Arc<dyn TraceSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let runner = PipelineRunner::new(
            status_store.clone(),
            result_store.clone(),
            adapters,
            TraceRecorder::new(trace_sink),
            events.clone(),
            config.clone(),
        );

        Ok(Self {
            scheduler: ConcurrencyScheduler::new(config.max_concurrent_files),
            config,
            status_store,
            result_store,
            runner: Arc::new(runner),
            events,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 提交一批文件
    ///
    /// 每一项独立校验；按顺序交给调度器，因此准入顺序即提交顺序。
    pub async fn submit_batch(&self, items: Vec<BatchItem>) -> BatchReceipt {
        let mut receipt = BatchReceipt::default();
        for (index, item) in items.into_iter().enumerate() {
            let submitted = match item {
                BatchItem::New(upload) => self.submit_new(index, upload).await,
                BatchItem::Reprocess {
                    file_id,
                    prioritized,
                } => self.submit_reprocess(index, &file_id, prioritized).await,
            };
            match submitted {
                Ok(run) => receipt.accepted.push(run),
                Err(error) => {
                    warn!("⚠️ 第 {} 项被拒绝: {}", index + 1, error);
                    receipt.rejected.push(RejectedItem { index, error });
                }
            }
        }
        info!(
            "📦 批次已提交: 接受 {} 项, 拒绝 {} 项",
            receipt.accepted.len(),
            receipt.rejected.len()
        );
        receipt
    }

    /// 提交单个新文件
    pub async fn submit_file(&self, upload: UploadedFile) -> Result<AcceptedRun> {
        self.submit_new(0, upload).await
    }

    /// 重新处理单个 FAILED 文件
    pub async fn reprocess(&self, file_id: &str, prioritized: bool) -> Result<AcceptedRun> {
        self.submit_reprocess(0, file_id, prioritized).await
    }

    pub async fn get_status(&self, file_id: &str) -> Result<Option<FileProcessingStatus>> {
        Ok(self.status_store.get_status(file_id).await?)
    }

    /// 最近更新的记录，最多 `status_display_limit` 行
    pub async fn list_status(&self) -> Result<Vec<FileProcessingStatus>> {
        self.list_status_with_limit(self.config.status_display_limit)
            .await
    }

    /// 同上，`limit` 不超过配置的上限
    pub async fn list_status_with_limit(&self, limit: usize) -> Result<Vec<FileProcessingStatus>> {
        let limit = limit.min(self.config.status_display_limit);
        Ok(self.status_store.list_status(limit).await?)
    }

    pub async fn get_results(&self, file_id: &str) -> Result<Vec<StageResult>> {
        Ok(self.result_store.get_results(file_id).await?)
    }

    /// 订阅状态变更（每次状态写入成功后发出）
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    async fn submit_new(&self, index: usize, upload: UploadedFile) -> Result<AcceptedRun> {
        self.validate_upload(&upload)?;

        let file_id = uuid::Uuid::new_v4().to_string();
        let row =
            FileProcessingStatus::new_pending(&file_id, &upload.filename, upload.size_bytes());
        let stored = self.status_store.insert_status(row).await?;
        self.emit(&stored);

        info!(
            "[文件 {}] 📄 已登记 {} ({} 字节)",
            file_id,
            upload.filename,
            upload.size_bytes()
        );

        let job = RunJob {
            file_id,
            attempt: stored.attempt,
            resume: Stage::Ingest,
            content: Some(Arc::new(upload.content)),
        };
        Ok(self.schedule(index, job, false))
    }

    async fn submit_reprocess(
        &self,
        index: usize,
        file_id: &str,
        prioritized: bool,
    ) -> Result<AcceptedRun> {
        let current = self.status_store.get_status(file_id).await?.ok_or_else(|| {
            PipelineError::invalid_reprocess(file_id, None, "文件不存在")
        })?;

        match current.run_state {
            RunState::Failed => {}
            RunState::Running => {
                return Err(PipelineError::ConcurrencyViolation {
                    file_id: file_id.to_string(),
                })
            }
            state => {
                return Err(PipelineError::invalid_reprocess(
                    file_id,
                    Some(state),
                    format!("只有 FAILED 的文件可以重新处理，当前为 {}", state),
                ))
            }
        }

        // 重新处理从 PARSE 开始，必须已有 INGEST 结果
        let results = self.result_store.get_results(file_id).await?;
        if !results.iter().any(|r| r.stage == Stage::Ingest) {
            return Err(PipelineError::invalid_reprocess(
                file_id,
                Some(RunState::Failed),
                "文件没有 INGEST 结果，需要重新上传",
            ));
        }

        let next = current.prepare_reprocess(Stage::REPROCESS_RESUME);
        let stored = match self
            .status_store
            .compare_and_set(current.version(), next)
            .await
        {
            Ok(stored) => stored,
            Err(StoreError::Conflict { found, .. }) if found.run_state == RunState::Running => {
                return Err(PipelineError::ConcurrencyViolation {
                    file_id: file_id.to_string(),
                })
            }
            Err(StoreError::Conflict { found, .. }) => {
                return Err(PipelineError::invalid_reprocess(
                    file_id,
                    Some(found.run_state),
                    format!("状态已变为 {}", found),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        self.emit(&stored);

        info!(
            "[文件 {}] 🔁 重新处理，第 {} 次尝试，从 {} 开始{}",
            file_id,
            stored.attempt,
            Stage::REPROCESS_RESUME,
            if prioritized { "（优先）" } else { "" }
        );

        let job = RunJob {
            file_id: file_id.to_string(),
            attempt: stored.attempt,
            resume: Stage::REPROCESS_RESUME,
            content: None,
        };
        Ok(self.schedule(index, job, prioritized))
    }

    fn validate_upload(&self, upload: &UploadedFile) -> Result<()> {
        let reject = |reason: String| PipelineError::InvalidSubmission {
            filename: upload.filename.clone(),
            reason,
        };

        if upload.filename.trim().is_empty() {
            return Err(reject("文件名为空".to_string()));
        }
        if upload.content.is_empty() {
            return Err(reject("文件内容为空".to_string()));
        }
        if upload.size_bytes() > self.config.max_file_size_bytes() {
            return Err(reject(format!(
                "文件大小 {} 字节超过上限 {} MB",
                upload.size_bytes(),
                self.config.max_file_size_mb
            )));
        }
        let supported_types = &self.config.supported_file_types;
        let supported = upload
            .extension()
            .map(|ext| supported_types.iter().any(|t| t.eq_ignore_ascii_case(&ext)))
            .unwrap_or(false);
        if !supported {
            return Err(reject(format!(
                "不支持的文件类型，支持: {}",
                self.config.supported_file_types.join(", ")
            )));
        }
        Ok(())
    }

    fn schedule(&self, index: usize, job: RunJob, prioritized: bool) -> AcceptedRun {
        let (tx, rx) = oneshot::channel();
        let accepted = AcceptedRun {
            index,
            file_id: job.file_id.clone(),
            attempt: job.attempt,
            resume: job.resume,
            outcome: rx,
        };

        let runner = self.runner.clone();
        self.scheduler.submit(
            async move {
                let outcome = runner.run(job).await;
                let _ = tx.send(outcome);
            },
            prioritized,
        );
        accepted
    }

    fn emit(&self, row: &FileProcessingStatus) {
        let _ = self.events.send(StatusEvent::from(row));
    }
}
