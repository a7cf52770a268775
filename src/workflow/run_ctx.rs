//! 运行上下文
//!
//! 封装"我正在处理哪个文件的第几次尝试"这一信息

use std::fmt::Display;

use crate::models::Stage;

/// 单次运行尝试的上下文
#[derive(Debug, Clone)]
pub struct RunCtx {
    pub file_id: String,
    pub filename: String,

    /// 第几次尝试（从 1 开始）
    pub attempt: u32,

    /// 本次尝试唯一的运行 id，用于日志文件名
    pub run_id: String,

    /// 从哪个阶段开始
    pub resume: Stage,
}

impl RunCtx {
    pub fn new(
        file_id: impl Into<String>,
        filename: impl Into<String>,
        attempt: u32,
        resume: Stage,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            filename: filename.into(),
            attempt,
            run_id: uuid::Uuid::new_v4().to_string(),
            resume,
        }
    }

    /// 不是从 INGEST 开始的运行都是重新处理
    pub fn is_reprocess(&self) -> bool {
        self.resume != Stage::Ingest
    }

    /// 父 span 名称
    pub fn pipeline_name(&self) -> &'static str {
        if self.is_reprocess() {
            "reprocess_file_pipeline"
        } else {
            "process_file_pipeline"
        }
    }
}

impl Display for RunCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[文件 {} 第{}次]", self.file_id, self.attempt)
    }
}
