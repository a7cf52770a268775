use thiserror::Error;

use crate::models::{FailureKind, RunState, Stage, StatusVersion};

/// 流水线错误类型
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 阶段适配器调用失败（包括测试注入的失败）
    #[error("阶段执行失败 ({stage}): {message}")]
    AdapterFailure { stage: Stage, message: String },

    /// 状态/结果持久化失败
    #[error("存储失败 ({stage}): {source}")]
    StoreFailure {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    /// 同一文件已有一个 RUNNING 的运行
    #[error("文件 {file_id} 正在运行中，拒绝启动新的运行")]
    ConcurrencyViolation { file_id: String },

    /// 只有 FAILED 的文件可以重新处理
    #[error("文件 {file_id} 不能重新处理: {reason}")]
    InvalidReprocess {
        file_id: String,
        state: Option<RunState>,
        reason: String,
    },

    /// 上传文件未通过校验
    #[error("文件 {filename} 提交被拒绝: {reason}")]
    InvalidSubmission { filename: String, reason: String },

    /// 恢复执行时缺少前序阶段结果
    #[error("缺少 {missing} 阶段的结果，无法从 {stage} 开始")]
    MissingPriorResult { stage: Stage, missing: Stage },

    /// 运行任务在给出结果前被丢弃
    #[error("文件 {file_id} 的运行任务异常中止")]
    RunAborted { file_id: String },

    /// 读取状态等非阶段内的存储错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// 失败发生在哪个阶段（仅阶段内失败有值）
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::AdapterFailure { stage, .. }
            | PipelineError::StoreFailure { stage, .. }
            | PipelineError::MissingPriorResult { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// 写入状态记录的失败类别
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::StoreFailure { .. }
            | PipelineError::Store(_)
            | PipelineError::MissingPriorResult { .. } => FailureKind::Store,
            _ => FailureKind::Adapter,
        }
    }

    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            PipelineError::ConcurrencyViolation { .. }
                | PipelineError::InvalidReprocess { .. }
                | PipelineError::InvalidSubmission { .. }
        )
    }
}

/// 存储层错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("记录不存在: {file_id}")]
    NotFound { file_id: String },

    /// compare-and-set 或 RUNNING 唯一性校验失败
    #[error("状态冲突 ({file_id}): 期望 {expected}, 实际 {found}")]
    Conflict {
        file_id: String,
        expected: String,
        found: StatusVersion,
    },

    #[error("记录已存在: {file_id}")]
    AlreadyExists { file_id: String },

    /// 结果只追加，重复键被拒绝
    #[error("结果已存在: {file_id} / {stage} / 第 {attempt} 次尝试")]
    DuplicateResult {
        file_id: String,
        stage: Stage,
        attempt: u32,
    },

    #[error("存储不可用: {0}")]
    Unavailable(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("配置项 {key} 的值 '{value}' 无效: {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("读取配置文件失败 ({path}): {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML 解析失败: {0}")]
    Toml(#[from] toml::de::Error),
}

/// 追踪导出错误（只记录警告，不影响运行状态）
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),
}

// ========== 便捷构造函数 ==========

impl PipelineError {
    pub fn adapter(stage: Stage, message: impl Into<String>) -> Self {
        PipelineError::AdapterFailure {
            stage,
            message: message.into(),
        }
    }

    pub fn store(stage: Stage, source: StoreError) -> Self {
        PipelineError::StoreFailure { stage, source }
    }

    pub fn invalid_reprocess(
        file_id: impl Into<String>,
        state: Option<RunState>,
        reason: impl Into<String>,
    ) -> Self {
        PipelineError::InvalidReprocess {
            file_id: file_id.into(),
            state,
            reason: reason.into(),
        }
    }
}

// ========== Result 类型别名 ==========

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
