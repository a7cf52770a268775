//! 本地 PARSE：读取存储卷中的文件，按换页符分页

use async_trait::async_trait;
use tracing::debug;

use crate::models::{ParsePayload, Stage, StageOutput, StagePayload};
use crate::services::stage_adapter::{StageAdapter, StageFailure, StageInput};

const PAGE_BREAK: char = '\x0c';

/// 按换页符切分页面，去掉空白页
pub fn split_pages(raw: &str) -> Vec<&str> {
    raw.split(PAGE_BREAK)
        .map(str::trim)
        .filter(|page| !page.is_empty())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct LocalParseAdapter;

impl LocalParseAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageAdapter for LocalParseAdapter {
    fn stage(&self) -> Stage {
        Stage::Parse
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let ingest = input
            .ingest()
            .ok_or_else(|| StageFailure::new(Stage::Parse, "缺少 INGEST 阶段的存储路径"))?;

        let bytes = tokio::fs::read(&ingest.volume_path).await.map_err(|e| {
            StageFailure::new(
                Stage::Parse,
                format!("读取文件失败 ({}): {}", ingest.volume_path, e),
            )
        })?;

        let raw = String::from_utf8_lossy(&bytes);
        let pages = split_pages(&raw);
        if pages.is_empty() {
            return Err(StageFailure::new(Stage::Parse, "文档中没有可解析的文本"));
        }

        let text = pages.join("\n\n");
        debug!(
            "[文件 {}] 解析完成: {} 页, {} 字符",
            input.file_id,
            pages.len(),
            text.chars().count()
        );

        Ok(StageOutput::new(StagePayload::Parse(ParsePayload {
            text_length: text.chars().count(),
            pages_count: pages.len(),
            text,
        })))
    }
}
