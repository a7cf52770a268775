//! 运行日志写入 - 基础设施层
//!
//! 每次运行尝试一个日志文件：`<logs_dir>/<YYYY-MM-DD>/<run_id>.log`，每行一个 JSON。
//! 写入失败只记警告，不影响运行结果。

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::models::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    level: LogLevel,
    file_id: &'a str,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<Stage>,
    message: &'a str,
}

/// 单次运行的日志文件
#[derive(Debug, Clone)]
pub struct RunLog {
    path: Option<PathBuf>,
    file_id: String,
    attempt: u32,
}

impl RunLog {
    /// 不写文件的日志（未配置 logs_dir）
    pub fn disabled(file_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            path: None,
            file_id: file_id.into(),
            attempt,
        }
    }

    /// 在 `logs_dir` 下按日期创建本次运行的日志文件
    pub async fn open(logs_dir: Option<&str>, run_id: &str, file_id: &str, attempt: u32) -> Self {
        let Some(logs_dir) = logs_dir else {
            return Self::disabled(file_id, attempt);
        };

        let day_dir = Path::new(logs_dir).join(Utc::now().format("%Y-%m-%d").to_string());
        if let Err(e) = tokio::fs::create_dir_all(&day_dir).await {
            warn!(
                "[文件 {}] ⚠️ 无法创建日志目录 {}: {}",
                file_id,
                day_dir.display(),
                e
            );
            return Self::disabled(file_id, attempt);
        }

        Self {
            path: Some(day_dir.join(format!("{}.log", run_id))),
            file_id: file_id.to_string(),
            attempt,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn path_string(&self) -> Option<String> {
        self.path.as_ref().map(|p| p.display().to_string())
    }

    pub async fn info(&self, stage: Option<Stage>, message: &str) {
        self.write(LogLevel::Info, stage, message).await
    }

    pub async fn warn(&self, stage: Option<Stage>, message: &str) {
        self.write(LogLevel::Warn, stage, message).await
    }

    pub async fn error(&self, stage: Option<Stage>, message: &str) {
        self.write(LogLevel::Error, stage, message).await
    }

    /// 追加一行
    pub async fn write(&self, level: LogLevel, stage: Option<Stage>, message: &str) {
        let Some(path) = &self.path else {
            return;
        };

        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            level,
            file_id: &self.file_id,
            attempt: self.attempt,
            stage,
            message,
        };

        if let Err(e) = append_line(path, &line).await {
            warn!(
                "[文件 {}] ⚠️ 写入运行日志失败 ({}): {}",
                self.file_id,
                path.display(),
                e
            );
        }
    }
}

async fn append_line(path: &Path, line: &LogLine<'_>) -> std::io::Result<()> {
    let mut text = serde_json::to_string(line)?;
    text.push('\n');

    debug!("写入运行日志: {} | {}", path.display(), line.message);

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(text.as_bytes()).await?;
    Ok(())
}
