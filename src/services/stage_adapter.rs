//! 阶段适配器接口 - 业务能力层
//!
//! 编排层只依赖这个接口，不关心阶段内部如何计算结果。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ConfigError;
use crate::models::{IngestPayload, ParsePayload, Stage, StageOutput, StagePayload};

/// 提示词中文档文本的最大字符数
pub const PROMPT_TEXT_LIMIT: usize = 5000;

/// 适配器返回的失败信号
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

/// 调用适配器时的输入
///
/// INGEST 读取 `content`，其余阶段读取前序阶段的输出。
#[derive(Debug, Clone, Copy)]
pub struct StageInput<'a> {
    pub file_id: &'a str,
    pub filename: &'a str,
    /// 原始上传内容，仅 INGEST 有值
    pub content: Option<&'a [u8]>,
    pub prior: &'a BTreeMap<Stage, StageOutput>,
    pub prompt_template: Option<&'a str>,
    pub taxonomy: &'a [String],
}

impl<'a> StageInput<'a> {
    /// 某个前序阶段的输出
    pub fn previous(&self, stage: Stage) -> Option<&'a StagePayload> {
        self.prior.get(&stage).map(|output| &output.payload)
    }

    pub fn ingest(&self) -> Option<&'a IngestPayload> {
        match self.previous(Stage::Ingest) {
            Some(StagePayload::Ingest(p)) => Some(p),
            _ => None,
        }
    }

    pub fn parsed(&self) -> Option<&'a ParsePayload> {
        match self.previous(Stage::Parse) {
            Some(StagePayload::Parse(p)) => Some(p),
            _ => None,
        }
    }

    /// PARSE 产出的文档文本
    pub fn document_text(&self) -> Option<&'a str> {
        self.parsed().map(|p| p.text.as_str())
    }

    /// 需要文档文本的阶段使用；缺少时返回失败
    pub fn require_text(&self, stage: Stage) -> Result<&'a str, StageFailure> {
        self.document_text()
            .ok_or_else(|| StageFailure::new(stage, "缺少 PARSE 阶段的文档文本"))
    }

    /// 把文档文本和分类表填入提示词模板
    pub fn render_prompt(&self, document_text: &str) -> Option<String> {
        let template = self.prompt_template?;
        let text: String = document_text.chars().take(PROMPT_TEXT_LIMIT).collect();
        Some(
            template
                .replace("{taxonomy}", &self.taxonomy.join("\n"))
                .replace("{document_text}", &text),
        )
    }
}

/// 单个阶段的实现
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// 该适配器负责的阶段
    fn stage(&self) -> Stage;

    /// 执行一次；每次调用最多一次尝试
    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure>;
}

/// 五个阶段的适配器集合
#[derive(Clone)]
pub struct StageAdapters {
    adapters: [Arc<dyn StageAdapter>; 5],
}

impl StageAdapters {
    /// 按阶段顺序传入；适配器声明的阶段必须与位置一致
    pub fn new(
        ingest: Arc<dyn StageAdapter>,
        parse: Arc<dyn StageAdapter>,
        categorize: Arc<dyn StageAdapter>,
        extract: Arc<dyn StageAdapter>,
        deidentify: Arc<dyn StageAdapter>,
    ) -> Result<Self, ConfigError> {
        let adapters = [ingest, parse, categorize, extract, deidentify];
        for (expected, adapter) in Stage::ALL.iter().zip(adapters.iter()) {
            if adapter.stage() != *expected {
                return Err(ConfigError::InvalidValue {
                    key: format!("adapters.{}", expected.key()),
                    value: adapter.stage().to_string(),
                    expected: format!("{} 阶段的适配器", expected),
                });
            }
        }
        Ok(Self { adapters })
    }

    pub fn get(&self, stage: Stage) -> &Arc<dyn StageAdapter> {
        &self.adapters[stage as usize]
    }
}

impl std::fmt::Debug for StageAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<Stage> = self.adapters.iter().map(|a| a.stage()).collect();
        f.debug_struct("StageAdapters").field("stages", &stages).finish()
    }
}
