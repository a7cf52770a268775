//! 本地 EXTRACT：正则抽取结构化实体

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use crate::models::{Entity, ExtractPayload, Stage, StageOutput, StagePayload};
use crate::services::local::estimate_metrics;
use crate::services::stage_adapter::{StageAdapter, StageFailure, StageInput};

static RE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid email regex")
});
static RE_SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("valid ssn regex"));
static RE_PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(?\b\d{3}\)?[ .\-]\d{3}[ .\-]\d{4}\b").expect("valid phone regex")
});
static RE_AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\s?\d{1,3}(?:,\d{3})*(?:\.\d{2})?").expect("valid amount regex")
});
static RE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4})\b").expect("valid date regex")
});

/// 实体类型、正则和固定置信度
fn patterns() -> [(&'static str, &'static Regex, f64); 5] {
    [
        ("email", &*RE_EMAIL, 0.95),
        ("ssn_tax_id", &*RE_SSN, 0.9),
        ("phone", &*RE_PHONE, 0.85),
        ("amount", &*RE_AMOUNT, 0.9),
        ("date", &*RE_DATE, 0.8),
    ]
}

/// 按出现类型顺序抽取实体，同类型同值只保留一次
pub fn extract_entities(text: &str) -> Vec<Entity> {
    let mut seen = HashSet::new();
    let mut entities = Vec::new();
    for (entity_type, regex, confidence) in patterns() {
        for m in regex.find_iter(text) {
            let value = m.as_str().trim().to_string();
            if seen.insert((entity_type, value.clone())) {
                entities.push(Entity {
                    entity_type: entity_type.to_string(),
                    value,
                    confidence,
                });
            }
        }
    }
    entities
}

#[derive(Debug, Clone, Default)]
pub struct RegexExtractAdapter;

impl RegexExtractAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageAdapter for RegexExtractAdapter {
    fn stage(&self) -> Stage {
        Stage::Extract
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let text = input.require_text(Stage::Extract)?;
        let entities = extract_entities(text);
        let payload = ExtractPayload {
            entities_count: entities.len(),
            entities,
        };
        let metrics = estimate_metrics(input.render_prompt(text).as_deref(), &payload);
        Ok(StageOutput::new(StagePayload::Extract(payload)).with_metrics(metrics))
    }
}
