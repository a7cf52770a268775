//! 本地 DEIDENTIFY：识别 PII 并打码

use async_trait::async_trait;

use crate::models::{DeidentifyPayload, MaskStrategy, PiiItem, Stage, StageOutput, StagePayload};
use crate::services::local::estimate_metrics;
use crate::services::local::extract::extract_entities;
use crate::services::stage_adapter::{StageAdapter, StageFailure, StageInput};

const REDACTED: &str = "[REDACTED]";

/// 某类实体是否属于 PII，以及处理方式
fn strategy_for(entity_type: &str) -> Option<MaskStrategy> {
    match entity_type {
        "ssn_tax_id" => Some(MaskStrategy::Redact),
        "email" | "phone" => Some(MaskStrategy::Mask),
        "date" => Some(MaskStrategy::Generalize),
        _ => None,
    }
}

/// 日期只保留年份：`2024-03-15` -> `2024`，`3/15/24` -> `24`
fn generalize_date(value: &str) -> Option<String> {
    let parts: Vec<&str> = value.split(['-', '/']).collect();
    let year = parts
        .iter()
        .find(|p| p.len() == 4)
        .or_else(|| parts.last())?;
    if parts.len() < 3 || !year.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(year.to_string())
}

/// 保留末尾 `keep` 个字母数字字符，其余字母数字换成 `*`
fn mask_tail(value: &str, keep: usize) -> String {
    let total = value.chars().filter(|c| c.is_alphanumeric()).count();
    let mut seen = 0;
    value
        .chars()
        .map(|c| {
            if !c.is_alphanumeric() {
                return c;
            }
            seen += 1;
            if seen > total.saturating_sub(keep) {
                c
            } else {
                '*'
            }
        })
        .collect()
}

fn replacement(entity_type: &str, value: &str, strategy: MaskStrategy) -> String {
    match (strategy, entity_type) {
        (MaskStrategy::Mask, "email") => match value.split_once('@') {
            Some((local, domain)) => {
                let first: String = local.chars().take(1).collect();
                format!("{}***@{}", first, domain)
            }
            None => REDACTED.to_string(),
        },
        (MaskStrategy::Mask, _) => mask_tail(value, 4),
        (MaskStrategy::Generalize, _) => {
            generalize_date(value).unwrap_or_else(|| "[DATE]".to_string())
        }
        _ => REDACTED.to_string(),
    }
}

/// 识别 PII 并返回打码后的文本
pub fn deidentify_text(text: &str) -> (Vec<PiiItem>, String) {
    let mut masked = text.to_string();
    let mut items = Vec::new();
    for entity in extract_entities(text) {
        let Some(strategy) = strategy_for(&entity.entity_type) else {
            continue;
        };
        let replacement = replacement(&entity.entity_type, &entity.value, strategy);
        masked = masked.replace(&entity.value, &replacement);
        items.push(PiiItem {
            pii_type: entity.entity_type,
            value: entity.value,
            strategy,
            replacement,
        });
    }
    (items, masked)
}

#[derive(Debug, Clone, Default)]
pub struct RegexDeidentifyAdapter;

impl RegexDeidentifyAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageAdapter for RegexDeidentifyAdapter {
    fn stage(&self) -> Stage {
        Stage::Deidentify
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let text = input.require_text(Stage::Deidentify)?;
        let (pii_items, masked_text) = deidentify_text(text);
        let payload = DeidentifyPayload {
            pii_items_masked: pii_items.len(),
            pii_items,
            masked_text,
        };
        let metrics = estimate_metrics(input.render_prompt(text).as_deref(), &payload);
        Ok(StageOutput::new(StagePayload::Deidentify(payload)).with_metrics(metrics))
    }
}
