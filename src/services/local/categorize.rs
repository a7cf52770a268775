//! 本地 CATEGORIZE：按关键词给分类表打分

use async_trait::async_trait;

use crate::models::{CategorizePayload, Stage, StageOutput, StagePayload};
use crate::services::local::estimate_metrics;
use crate::services::stage_adapter::{StageAdapter, StageFailure, StageInput};

const UNKNOWN_CATEGORY: &str = "Unknown";

/// 分类名（小写）对应的关键词；分类名本身也算一个关键词
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("loan application", &["loan", "borrower", "mortgage", "applicant", "collateral"]),
    (
        "financial statement",
        &["balance sheet", "income statement", "cash flow", "net income", "revenue"],
    ),
    ("investment document", &["portfolio", "securities", "dividend", "fund", "shares"]),
    ("credit report", &["credit score", "credit history", "delinquen", "fico", "tradeline"]),
    (
        "banking statement",
        &["account statement", "deposit", "withdrawal", "opening balance", "closing balance"],
    ),
    ("tax document", &["irs", "w-2", "1099", "tax return", "withholding"]),
    ("insurance policy", &["policy number", "premium", "insured", "coverage", "beneficiary"]),
    ("compliance document", &["compliance", "regulation", "audit", "kyc", "aml"]),
    (
        "contract agreement",
        &["agreement", "party", "hereby", "terms and conditions", "termination"],
    ),
];

fn keywords_for(category: &str) -> &'static [&'static str] {
    let key = category.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, words)| *words)
        .unwrap_or(&[])
}

/// 每个分类的命中次数，顺序与分类表一致
pub fn score_categories(text: &str, taxonomy: &[String]) -> Vec<(String, usize)> {
    let lower = text.to_lowercase();
    taxonomy
        .iter()
        .map(|category| {
            let own = lower.matches(&category.to_lowercase()).count();
            let hits: usize = keywords_for(category)
                .iter()
                .map(|word| lower.matches(word).count())
                .sum();
            (category.clone(), own + hits)
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct KeywordCategorizeAdapter;

impl KeywordCategorizeAdapter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StageAdapter for KeywordCategorizeAdapter {
    fn stage(&self) -> Stage {
        Stage::Categorize
    }

    async fn run(&self, input: &StageInput<'_>) -> Result<StageOutput, StageFailure> {
        let text = input.require_text(Stage::Categorize)?;
        if input.taxonomy.is_empty() {
            return Err(StageFailure::new(Stage::Categorize, "分类表为空"));
        }

        let mut scores = score_categories(text, input.taxonomy);
        let total: usize = scores.iter().map(|(_, s)| s).sum();
        // 稳定排序，同分时保持分类表顺序
        scores.sort_by(|a, b| b.1.cmp(&a.1));

        let confidence = |score: usize| {
            if total == 0 {
                0.0
            } else {
                (score as f64 / total as f64 * 100.0).round() / 100.0
            }
        };

        let payload = match scores.as_slice() {
            [(primary, score), rest @ ..] if *score > 0 => {
                let secondary = rest.first().filter(|(_, s)| *s > 0);
                CategorizePayload {
                    primary_category: primary.clone(),
                    primary_confidence: confidence(*score),
                    justification: format!("命中 {} 个相关关键词", score),
                    secondary_category: secondary.map(|(name, _)| name.clone()),
                    secondary_confidence: secondary.map(|(_, s)| confidence(*s)),
                }
            }
            _ => CategorizePayload {
                primary_category: UNKNOWN_CATEGORY.to_string(),
                primary_confidence: 0.0,
                justification: "未命中任何分类关键词".to_string(),
                secondary_category: None,
                secondary_confidence: None,
            },
        };

        let metrics = estimate_metrics(input.render_prompt(text).as_deref(), &payload);
        Ok(StageOutput::new(StagePayload::Categorize(payload)).with_metrics(metrics))
    }
}
