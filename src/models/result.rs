//! 阶段结果
//!
//! `StageResult` 只追加不覆盖，每个 (file_id, stage, attempt) 一行。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::models::stage::Stage;

/// span 上最多记录的实体 / PII 条目数
pub const SPAN_ITEMS_LIMIT: usize = 5;

/// INGEST 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestPayload {
    pub original_filename: String,
    pub safe_filename: String,
    pub volume_path: String,
    pub size_bytes: u64,
    pub file_hash_sha256: String,
}

/// PARSE 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsePayload {
    pub text: String,
    pub text_length: usize,
    pub pages_count: usize,
}

/// CATEGORIZE 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizePayload {
    pub primary_category: String,
    pub primary_confidence: f64,
    pub justification: String,
    pub secondary_category: Option<String>,
    pub secondary_confidence: Option<f64>,
}

/// 抽取出的实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub value: String,
    pub confidence: f64,
}

/// EXTRACT 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractPayload {
    pub entities_count: usize,
    pub entities: Vec<Entity>,
}

/// 脱敏处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaskStrategy {
    Redact,
    Mask,
    Generalize,
}

/// 被脱敏的 PII 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiiItem {
    #[serde(rename = "type")]
    pub pii_type: String,
    pub value: String,
    pub strategy: MaskStrategy,
    pub replacement: String,
}

/// DEIDENTIFY 结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeidentifyPayload {
    pub pii_items_masked: usize,
    pub pii_items: Vec<PiiItem>,
    pub masked_text: String,
}

/// 各阶段的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagePayload {
    Ingest(IngestPayload),
    Parse(ParsePayload),
    Categorize(CategorizePayload),
    Extract(ExtractPayload),
    Deidentify(DeidentifyPayload),
}

impl StagePayload {
    /// 该结果属于哪个阶段
    pub fn stage(&self) -> Stage {
        match self {
            StagePayload::Ingest(_) => Stage::Ingest,
            StagePayload::Parse(_) => Stage::Parse,
            StagePayload::Categorize(_) => Stage::Categorize,
            StagePayload::Extract(_) => Stage::Extract,
            StagePayload::Deidentify(_) => Stage::Deidentify,
        }
    }

    /// 子 span 上记录的输出字段
    pub fn span_outputs(&self) -> Map<String, JsonValue> {
        let value = match self {
            StagePayload::Ingest(p) => json!({
                "volume_path": p.volume_path,
                "file_hash_sha256": p.file_hash_sha256,
            }),
            StagePayload::Parse(p) => json!({
                "text_length": p.text_length,
                "pages_count": p.pages_count,
            }),
            StagePayload::Categorize(p) => json!({
                "primary_category": p.primary_category,
                "confidence": p.primary_confidence,
            }),
            StagePayload::Extract(p) => json!({
                "entities_count": p.entities_count,
                "entities": &p.entities[..p.entities.len().min(SPAN_ITEMS_LIMIT)],
            }),
            StagePayload::Deidentify(p) => json!({
                "pii_items_masked": p.pii_items_masked,
                "pii_items": &p.pii_items[..p.pii_items.len().min(SPAN_ITEMS_LIMIT)],
            }),
        };
        match value {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// 阶段的成本/用量数据
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub elapsed_ms: Option<u64>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl StageMetrics {
    /// 由提示词和生成 token 数构造
    pub fn with_tokens(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            elapsed_ms: None,
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            total_tokens: Some(prompt_tokens + completion_tokens),
        }
    }

    /// 作为 span 属性记录的 token 字段（未知的字段不记录）
    pub fn token_attributes(&self) -> Map<String, JsonValue> {
        let mut attrs = Map::new();
        if let Some(v) = self.prompt_tokens {
            attrs.insert("prompt_tokens".into(), json!(v));
        }
        if let Some(v) = self.completion_tokens {
            attrs.insert("completion_tokens".into(), json!(v));
        }
        if let Some(v) = self.total_tokens {
            attrs.insert("total_tokens".into(), json!(v));
        }
        attrs
    }
}

/// 适配器成功时的输出
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub payload: StagePayload,
    pub metrics: StageMetrics,
}

impl StageOutput {
    pub fn new(payload: StagePayload) -> Self {
        Self {
            payload,
            metrics: StageMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: StageMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// 结果表中的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub file_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub payload: StagePayload,
    pub metrics: StageMetrics,
    pub created_at: DateTime<Utc>,
}

impl StageResult {
    /// 行的唯一键
    pub fn key(&self) -> (String, Stage, u32) {
        (self.file_id.clone(), self.stage, self.attempt)
    }

    pub fn output(&self) -> StageOutput {
        StageOutput {
            payload: self.payload.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// 每个阶段取 attempt 最大的一行作为展示用的权威结果
pub fn latest_per_stage(rows: &[StageResult]) -> BTreeMap<Stage, &StageResult> {
    let mut latest: BTreeMap<Stage, &StageResult> = BTreeMap::new();
    for row in rows {
        match latest.get(&row.stage) {
            Some(existing) if existing.attempt >= row.attempt => {}
            _ => {
                latest.insert(row.stage, row);
            }
        }
    }
    latest
}
