//! 文件处理状态记录
//!
//! 每个 file_id 一行；重新处理时原地修改，不会新增行。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::stage::{RunState, Stage};

/// 失败类别，便于区分适配器失败和存储失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Adapter,
    Store,
}

/// 单个阶段在当前尝试中的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageRunState {
    Completed,
    Failed,
}

/// 文件处理状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileProcessingStatus {
    pub file_id: String,
    pub filename: String,
    pub file_size_bytes: u64,
    pub volume_path: Option<String>,
    /// 当前尝试的父 trace id
    pub trace_id: Option<String>,
    pub log_path: Option<String>,
    /// 第几次尝试（首次为 1，每次重新处理加 1）
    pub attempt: u32,
    /// 每次尝试唯一，用于日志文件命名
    pub run_id: Option<String>,
    pub current_stage: Stage,
    pub run_state: RunState,
    pub failed_stage: Option<Stage>,
    pub error_message: Option<String>,
    pub error_kind: Option<FailureKind>,
    #[serde(default)]
    pub stage_states: BTreeMap<Stage, StageRunState>,
    pub primary_category: Option<String>,
    pub entities_count: Option<usize>,
    pub pii_items_masked: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileProcessingStatus {
    /// 新上传文件的初始记录（PENDING，从 INGEST 开始）
    pub fn new_pending(
        file_id: impl Into<String>,
        filename: impl Into<String>,
        file_size_bytes: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            file_id: file_id.into(),
            filename: filename.into(),
            file_size_bytes,
            volume_path: None,
            trace_id: None,
            log_path: None,
            attempt: 1,
            run_id: None,
            current_stage: Stage::Ingest,
            run_state: RunState::Pending,
            failed_stage: None,
            error_message: None,
            error_kind: None,
            stage_states: BTreeMap::new(),
            primary_category: None,
            entities_count: None,
            pii_items_masked: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 当前版本，用于 compare-and-set
    pub fn version(&self) -> StatusVersion {
        StatusVersion {
            run_state: self.run_state,
            attempt: self.attempt,
        }
    }

    /// 由 FAILED 记录生成下一次尝试的 PENDING 记录
    ///
    /// 保留 INGEST 的阶段状态和存储路径，清空错误信息和其余阶段状态。
    pub fn prepare_reprocess(&self, resume: Stage) -> Self {
        let mut next = self.clone();
        next.attempt = self.attempt + 1;
        next.run_state = RunState::Pending;
        next.current_stage = resume;
        next.failed_stage = None;
        next.error_message = None;
        next.error_kind = None;
        next.trace_id = None;
        next.log_path = None;
        next.run_id = None;
        next.started_at = None;
        next.finished_at = None;
        next.primary_category = None;
        next.entities_count = None;
        next.pii_items_masked = None;
        next.stage_states.retain(|stage, _| *stage < resume);
        next.updated_at = Utc::now();
        next
    }

    /// 记录一次失败
    pub fn mark_failed(&mut self, stage: Stage, kind: FailureKind, message: impl Into<String>) {
        let now = Utc::now();
        self.run_state = RunState::Failed;
        self.current_stage = stage;
        self.failed_stage = Some(stage);
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        self.stage_states.insert(stage, StageRunState::Failed);
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// compare-and-set 的期望值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub run_state: RunState,
    pub attempt: u32,
}

impl std::fmt::Display for StatusVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.run_state, self.attempt)
    }
}

/// 状态变更通知（每次持久化写入后发出）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub file_id: String,
    pub attempt: u32,
    pub run_state: RunState,
    pub current_stage: Stage,
    pub at: DateTime<Utc>,
}

impl From<&FileProcessingStatus> for StatusEvent {
    fn from(row: &FileProcessingStatus) -> Self {
        Self {
            file_id: row.file_id.clone(),
            attempt: row.attempt,
            run_state: row.run_state,
            current_stage: row.current_stage,
            at: row.updated_at,
        }
    }
}
