//! 追踪导出 - 基础设施层
//!
//! 只负责把已经结束的 trace 交出去，span 的层级由 workflow 层的 `TraceRecorder` 保证。

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::TraceError;
use crate::models::Trace;

/// trace 导出接口
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// 生成 span / trace 标识
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// 导出一次运行的完整 trace
    async fn export(&self, trace: &Trace) -> Result<(), TraceError>;
}

/// 内存 trace 收集器（测试用）
#[derive(Debug, Default)]
pub struct InMemoryTraceSink {
    traces: Mutex<Vec<Trace>>,
}

impl InMemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 已导出的 trace（按导出顺序）
    pub async fn traces(&self) -> Vec<Trace> {
        self.traces.lock().await.clone()
    }
}

#[async_trait]
impl TraceSink for InMemoryTraceSink {
    async fn export(&self, trace: &Trace) -> Result<(), TraceError> {
        self.traces.lock().await.push(trace.clone());
        Ok(())
    }
}

/// 每行一个 trace 的 JSON lines 文件
pub struct JsonlTraceSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlTraceSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlTraceSink {
    async fn export(&self, trace: &Trace) -> Result<(), TraceError> {
        let mut line = serde_json::to_string(trace)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
