//! 文件处理流程 - 流程层
//!
//! 核心职责：把一个文件按固定顺序跑完五个阶段
//!
//! 每个阶段的步骤：
//! 1. 状态表标记 current_stage（RUNNING）
//! 2. 打开子 span，记录输入
//! 3. 调用适配器（或测试用的强制失败）
//! 4. 成功：写入结果表，记录输出，关闭子 span
//! 5. 失败：关闭子 span，状态表记为 FAILED，关闭父 span，停止

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::broadcast;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::error::{PipelineError, Result, StoreError};
use crate::infrastructure::{ResultStore, RunLog, StatusStore};
use crate::models::{
    latest_per_stage, FailureKind, FileProcessingStatus, RunState, Stage, StageOutput,
    StagePayload, StageResult, StageRunState, StatusEvent, StatusVersion,
};
use crate::services::{StageAdapters, StageInput};
use crate::utils::logging::truncate_text;
use crate::workflow::run_ctx::RunCtx;
use crate::workflow::trace_recorder::{RunTrace, TraceRecorder, PROMPT_PREVIEW_CHARS};

/// 一次待执行的运行
#[derive(Debug, Clone)]
pub struct RunJob {
    pub file_id: String,
    /// 状态表中 PENDING 行的尝试次数
    pub attempt: u32,
    pub resume: Stage,
    /// 原始上传内容，只有从 INGEST 开始时需要
    pub content: Option<Arc<Vec<u8>>>,
}

/// 一次运行尝试的最终结果
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub file_id: String,
    pub attempt: u32,
    pub run_state: RunState,
    pub failed_stage: Option<Stage>,
    pub error_kind: Option<FailureKind>,
    pub error_message: Option<String>,
    pub trace_id: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.run_state == RunState::Succeeded
    }
}

impl From<&FileProcessingStatus> for RunOutcome {
    fn from(row: &FileProcessingStatus) -> Self {
        Self {
            file_id: row.file_id.clone(),
            attempt: row.attempt,
            run_state: row.run_state,
            failed_stage: row.failed_stage,
            error_kind: row.error_kind,
            error_message: row.error_message.clone(),
            trace_id: row.trace_id.clone(),
        }
    }
}

/// 单个文件的状态机
///
/// - 不持有并发资源，并发由调度器控制
/// - 同一文件的状态写入靠状态表的 RUNNING 唯一性串行化
#[derive(Clone)]
pub struct PipelineRunner {
    status_store: Arc<dyn StatusStore>,
    result_store: Arc<dyn ResultStore>,
    adapters: StageAdapters,
    recorder: TraceRecorder,
    events: broadcast::Sender<StatusEvent>,
    config: Arc<Config>,
}

impl PipelineRunner {
    pub fn new(
        status_store: Arc<dyn StatusStore>,
        result_store: Arc<dyn ResultStore>,
        adapters: StageAdapters,
        recorder: TraceRecorder,
        events: broadcast::Sender<StatusEvent>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            status_store,
            result_store,
            adapters,
            recorder,
            events,
            config,
        }
    }

    /// 执行一次运行尝试
    ///
    /// 返回 `Ok` 表示终态（SUCCEEDED / FAILED）已经写入状态表；
    /// 准入失败返回 `ConcurrencyViolation`，不会写入任何记录。
    pub async fn run(&self, job: RunJob) -> Result<RunOutcome> {
        let span = info_span!("process_file", file_id = %job.file_id, attempt = job.attempt);
        self.run_attempt(job).instrument(span).await
    }

    async fn run_attempt(&self, job: RunJob) -> Result<RunOutcome> {
        let current = self
            .status_store
            .get_status(&job.file_id)
            .await
            .map_err(|e| PipelineError::store(job.resume, e))?
            .ok_or_else(|| StoreError::NotFound {
                file_id: job.file_id.clone(),
            })?;

        let ctx = RunCtx::new(&job.file_id, &current.filename, job.attempt, job.resume);
        let (mut row, mut trace, run_log) = self.admit(&ctx, current).await?;

        info!("{} ▶ 开始处理 {}，从 {} 开始", ctx, ctx.filename, ctx.resume);
        run_log
            .info(None, &format!("开始处理 {}，从 {} 开始", ctx.filename, ctx.resume))
            .await;

        let mut prior = match self.load_prior(&ctx).await {
            Ok(prior) => prior,
            Err(err) => return self.fail_run(&ctx, row, trace, &run_log, err).await,
        };

        for stage in Stage::pipeline_from(ctx.resume) {
            let step = self
                .run_stage(&ctx, stage, &mut row, &mut trace, &mut prior, &job, &run_log)
                .instrument(info_span!("stage", stage = %stage))
                .await;
            if let Err(err) = step {
                return self.fail_run(&ctx, row, trace, &run_log, err).await;
            }
        }

        self.finish_success(&ctx, row, trace, &run_log, &prior).await
    }

    /// PENDING → RUNNING，compare-and-set 失败时直接拒绝
    async fn admit(
        &self,
        ctx: &RunCtx,
        current: FileProcessingStatus,
    ) -> Result<(FileProcessingStatus, RunTrace, RunLog)> {
        let run_log = RunLog::open(
            self.config.logs_dir.as_deref(),
            &ctx.run_id,
            &ctx.file_id,
            ctx.attempt,
        )
        .await;

        let mut inputs = Map::new();
        inputs.insert("filename".into(), json!(ctx.filename));
        inputs.insert("file_id".into(), json!(ctx.file_id));
        inputs.insert("file_size_bytes".into(), json!(current.file_size_bytes));
        if let Some(volume_path) = &current.volume_path {
            inputs.insert("volume_path".into(), json!(volume_path));
        }

        let mut attributes = Map::new();
        attributes.insert("file_id".into(), json!(ctx.file_id));
        attributes.insert("attempt".into(), json!(ctx.attempt));
        attributes.insert("run_id".into(), json!(ctx.run_id));
        attributes.insert("resume_stage".into(), json!(ctx.resume));
        attributes.insert("is_reprocess".into(), json!(ctx.is_reprocess()));
        if let Some(path) = run_log.path_string() {
            attributes.insert("log_file_path".into(), json!(path));
        }

        let trace = self
            .recorder
            .start_run(ctx.pipeline_name(), inputs, attributes);

        let mut next = current;
        next.run_state = RunState::Running;
        next.current_stage = ctx.resume;
        next.trace_id = Some(trace.trace_id().to_string());
        next.run_id = Some(ctx.run_id.clone());
        next.log_path = run_log.path_string();
        next.started_at = Some(Utc::now());
        next.finished_at = None;

        let expected = StatusVersion {
            run_state: RunState::Pending,
            attempt: ctx.attempt,
        };
        match self.status_store.compare_and_set(expected, next).await {
            Ok(stored) => {
                self.emit(&stored);
                Ok((stored, trace, run_log))
            }
            Err(StoreError::Conflict { found, .. }) => {
                warn!("{} ⚠️ 准入被拒绝: 期望 {}, 实际 {}", ctx, expected, found);
                trace.abandon();
                Err(PipelineError::ConcurrencyViolation {
                    file_id: ctx.file_id.clone(),
                })
            }
            Err(e) => {
                error!("{} ❌ 准入时状态写入失败: {}", ctx, e);
                trace.abandon();
                Err(PipelineError::store(ctx.resume, e))
            }
        }
    }

    /// 恢复执行时读取前序阶段的最新结果
    async fn load_prior(&self, ctx: &RunCtx) -> Result<BTreeMap<Stage, StageOutput>> {
        let mut prior = BTreeMap::new();
        if ctx.resume == Stage::Ingest {
            return Ok(prior);
        }

        let rows = self
            .result_store
            .get_results(&ctx.file_id)
            .await
            .map_err(|e| PipelineError::store(ctx.resume, e))?;
        let latest = latest_per_stage(&rows);

        for stage in Stage::ALL.into_iter().take_while(|s| *s < ctx.resume) {
            let row = latest.get(&stage).ok_or(PipelineError::MissingPriorResult {
                stage: ctx.resume,
                missing: stage,
            })?;
            prior.insert(stage, row.output());
        }
        Ok(prior)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stage(
        &self,
        ctx: &RunCtx,
        stage: Stage,
        row: &mut FileProcessingStatus,
        trace: &mut RunTrace,
        prior: &mut BTreeMap<Stage, StageOutput>,
        job: &RunJob,
        run_log: &RunLog,
    ) -> Result<()> {
        // a. 标记当前阶段
        let mut marked = row.clone();
        marked.current_stage = stage;
        marked.run_state = RunState::Running;
        *row = self
            .status_store
            .upsert_status(marked)
            .await
            .map_err(|e| PipelineError::store(stage, e))?;
        self.emit(row);

        info!("{} [{}/5] {} 开始", ctx, stage.number(), stage);

        // b. 打开子 span
        let mut span = trace.start_stage(stage, self.stage_inputs(stage, row, prior));

        // c. 调用适配器
        let started = Instant::now();
        let invoked = match self.config.forced_failure_stage() {
            Some(forced) if forced == stage => {
                warn!("{} ⚠️ 测试配置强制 {} 失败", ctx, stage);
                Err(PipelineError::adapter(
                    stage,
                    format!("测试配置强制在 {} 阶段失败", stage),
                ))
            }
            _ => {
                let input = StageInput {
                    file_id: &ctx.file_id,
                    filename: &ctx.filename,
                    content: job.content.as_deref().map(Vec::as_slice),
                    prior,
                    prompt_template: self.config.prompt_for(stage),
                    taxonomy: &self.config.taxonomy,
                };
                self.invoke(stage, &input).await
            }
        };

        let mut output = match invoked {
            Ok(output) => output,
            Err(err) => {
                span.fail(&err.to_string());
                return Err(err);
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        output.metrics.elapsed_ms.get_or_insert(elapsed_ms);

        // d. 结果落盘后才进入下一个阶段
        let result = StageResult {
            file_id: ctx.file_id.clone(),
            stage,
            attempt: ctx.attempt,
            payload: output.payload.clone(),
            metrics: output.metrics.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.result_store.append_result(result).await {
            let err = PipelineError::store(stage, e);
            span.fail(&err.to_string());
            return Err(err);
        }

        span.set_attributes(output.metrics.token_attributes());
        span.set_attribute("elapsed_ms", json!(output.metrics.elapsed_ms));
        span.succeed(output.payload.span_outputs());

        info!(
            "{} [{}/5] ✓ {} 完成 ({} ms)",
            ctx,
            stage.number(),
            stage,
            output.metrics.elapsed_ms.unwrap_or_default()
        );
        run_log
            .info(Some(stage), &format!("{} 完成", stage))
            .await;

        row.stage_states.insert(stage, StageRunState::Completed);
        if let StagePayload::Ingest(p) = &output.payload {
            row.volume_path = Some(p.volume_path.clone());
        }
        prior.insert(stage, output);
        Ok(())
    }

    /// 调用适配器；panic 和返回了错误阶段的结果都按适配器失败处理
    async fn invoke(&self, stage: Stage, input: &StageInput<'_>) -> Result<StageOutput> {
        let adapter = self.adapters.get(stage);
        match AssertUnwindSafe(adapter.run(input)).catch_unwind().await {
            Ok(Ok(output)) if output.payload.stage() == stage => Ok(output),
            Ok(Ok(output)) => Err(PipelineError::adapter(
                stage,
                format!("适配器返回了 {} 阶段的结果", output.payload.stage()),
            )),
            Ok(Err(failure)) => Err(PipelineError::adapter(stage, failure.message)),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "未知错误".to_string());
                Err(PipelineError::adapter(
                    stage,
                    format!("适配器异常退出: {}", message),
                ))
            }
        }
    }

    /// 子 span 的输入字段
    fn stage_inputs(
        &self,
        stage: Stage,
        row: &FileProcessingStatus,
        prior: &BTreeMap<Stage, StageOutput>,
    ) -> Map<String, JsonValue> {
        let mut inputs = Map::new();
        match stage {
            Stage::Ingest => {
                inputs.insert("filename".into(), json!(row.filename));
                inputs.insert("file_size_bytes".into(), json!(row.file_size_bytes));
            }
            Stage::Parse => {
                let volume_path = match prior.get(&Stage::Ingest).map(|o| &o.payload) {
                    Some(StagePayload::Ingest(p)) => Some(p.volume_path.clone()),
                    _ => row.volume_path.clone(),
                };
                inputs.insert("volume_path".into(), json!(volume_path));
            }
            Stage::Categorize | Stage::Extract | Stage::Deidentify => {
                let text_length = match prior.get(&Stage::Parse).map(|o| &o.payload) {
                    Some(StagePayload::Parse(p)) => p.text_length,
                    _ => 0,
                };
                let template = self
                    .config
                    .prompt_for(stage)
                    .map(|t| truncate_text(t, PROMPT_PREVIEW_CHARS));
                inputs.insert("document_text_length".into(), json!(text_length));
                inputs.insert("prompt_template".into(), json!(template));
            }
        }
        inputs
    }

    /// 全部阶段完成：写 SUCCEEDED，再关闭父 span
    async fn finish_success(
        &self,
        ctx: &RunCtx,
        mut row: FileProcessingStatus,
        trace: RunTrace,
        run_log: &RunLog,
        prior: &BTreeMap<Stage, StageOutput>,
    ) -> Result<RunOutcome> {
        for output in prior.values() {
            match &output.payload {
                StagePayload::Ingest(p) => row.volume_path = Some(p.volume_path.clone()),
                StagePayload::Categorize(p) => {
                    row.primary_category = Some(p.primary_category.clone())
                }
                StagePayload::Extract(p) => row.entities_count = Some(p.entities_count),
                StagePayload::Deidentify(p) => row.pii_items_masked = Some(p.pii_items_masked),
                StagePayload::Parse(_) => {}
            }
        }
        row.run_state = RunState::Succeeded;
        row.current_stage = Stage::Deidentify;
        row.finished_at = Some(Utc::now());

        let stored = match self.status_store.upsert_status(row.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                row.run_state = RunState::Running;
                row.finished_at = None;
                let err = PipelineError::store(Stage::Deidentify, e);
                return self.fail_run(ctx, row, trace, run_log, err).await;
            }
        };
        self.emit(&stored);

        let mut outputs = Map::new();
        outputs.insert("status".into(), json!(RunState::Succeeded));
        outputs.insert("primary_category".into(), json!(stored.primary_category));
        outputs.insert("entities_count".into(), json!(stored.entities_count));
        outputs.insert("pii_items_masked".into(), json!(stored.pii_items_masked));
        trace.finish(Ok(outputs)).await;

        info!("{} ✅ 处理完成", ctx);
        run_log.info(None, "处理完成").await;
        Ok(RunOutcome::from(&stored))
    }

    /// 记录失败：先写状态表，再关闭父 span
    async fn fail_run(
        &self,
        ctx: &RunCtx,
        mut row: FileProcessingStatus,
        mut trace: RunTrace,
        run_log: &RunLog,
        err: PipelineError,
    ) -> Result<RunOutcome> {
        let stage = err.stage().unwrap_or(row.current_stage);
        let message = err.to_string();
        error!("{} ❌ {} 阶段失败: {}", ctx, stage, message);
        run_log.error(Some(stage), &message).await;

        row.mark_failed(stage, err.failure_kind(), &message);
        let recorded = self.status_store.upsert_status(row).await;

        trace.set_attribute("failed_stage", json!(stage));
        trace.finish(Err(message)).await;

        match recorded {
            Ok(stored) => {
                self.emit(&stored);
                Ok(RunOutcome::from(&stored))
            }
            Err(e) => {
                error!("{} ❌ 无法记录失败状态: {}", ctx, e);
                Err(PipelineError::store(stage, e))
            }
        }
    }

    fn emit(&self, row: &FileProcessingStatus) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(StatusEvent::from(row));
    }
}
