//! 离线参考实现
//!
//! 不依赖外部推理服务，让程序在本地可以完整运行。编排层不依赖这里的任何类型。

pub mod categorize;
pub mod deidentify;
pub mod extract;
pub mod ingest;
pub mod parse;

use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::error::ConfigError;
use crate::models::StageMetrics;
use crate::services::stage_adapter::StageAdapters;

pub use categorize::KeywordCategorizeAdapter;
pub use deidentify::RegexDeidentifyAdapter;
pub use extract::RegexExtractAdapter;
pub use ingest::{sanitize_filename, LocalIngestAdapter};
pub use parse::LocalParseAdapter;

/// 粗略估算 token 数（约 4 个字符一个 token）
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// 由提示词和输出估算用量；没有提示词时不记录 token
pub(crate) fn estimate_metrics<T: Serialize>(prompt: Option<&str>, output: &T) -> StageMetrics {
    let Some(prompt) = prompt else {
        return StageMetrics::default();
    };
    let completion = serde_json::to_string(output).unwrap_or_default();
    StageMetrics::with_tokens(estimate_tokens(prompt), estimate_tokens(&completion))
}

/// 五个本地适配器
pub fn local_adapters(config: &Config) -> Result<StageAdapters, ConfigError> {
    StageAdapters::new(
        Arc::new(LocalIngestAdapter::new(&config.volume_path)),
        Arc::new(LocalParseAdapter::new()),
        Arc::new(KeywordCategorizeAdapter::new()),
        Arc::new(RegexExtractAdapter::new()),
        Arc::new(RegexDeidentifyAdapter::new()),
    )
}
