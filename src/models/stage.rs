//! 流水线阶段与运行状态
//!
//! 五个阶段的顺序是固定的：INGEST → PARSE → CATEGORIZE → EXTRACT → DEIDENTIFY

use phf::phf_map;
use serde::{Deserialize, Serialize};

use crate::models::trace::SpanKind;

/// 阶段名（小写）到阶段的静态映射，用于解析配置和环境变量
static STAGE_NAMES: phf::Map<&'static str, Stage> = phf_map! {
    "ingest" => Stage::Ingest,
    "parse" => Stage::Parse,
    "categorize" => Stage::Categorize,
    "categorise" => Stage::Categorize,
    "extract" => Stage::Extract,
    "deidentify" => Stage::Deidentify,
    "de-identify" => Stage::Deidentify,
    "de_identify" => Stage::Deidentify,
};

/// 处理阶段
///
/// 派生的 `Ord` 即流水线顺序，状态机依赖这一点判断单调推进。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// 上传原始文件到存储卷
    Ingest,
    /// 解析文本和页面
    Parse,
    /// 文档分类
    Categorize,
    /// 实体抽取
    Extract,
    /// 敏感信息脱敏
    Deidentify,
}

impl Stage {
    /// 固定的执行顺序
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::Parse,
        Stage::Categorize,
        Stage::Extract,
        Stage::Deidentify,
    ];

    /// 重新处理的起始阶段（永远不重复 INGEST）
    pub const REPROCESS_RESUME: Stage = Stage::Parse;

    /// 阶段序号（从 1 开始）
    pub fn number(self) -> usize {
        self as usize + 1
    }

    /// 小写名称，用于日志、文件名和 span 名
    pub fn key(self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Parse => "parse",
            Stage::Categorize => "categorize",
            Stage::Extract => "extract",
            Stage::Deidentify => "deidentify",
        }
    }

    /// 子 span 的类型
    pub fn span_kind(self) -> SpanKind {
        match self {
            Stage::Ingest => SpanKind::Chain,
            Stage::Parse => SpanKind::Parser,
            Stage::Categorize => SpanKind::Llm,
            Stage::Extract => SpanKind::Retriever,
            Stage::Deidentify => SpanKind::Llm,
        }
    }

    /// 子 span 名称，例如 `stage_3_categorize`
    pub fn span_name(self) -> String {
        format!("stage_{}_{}", self.number(), self.key())
    }

    /// 从 `resume` 开始（含）到 DEIDENTIFY 的阶段序列
    pub fn pipeline_from(resume: Stage) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().skip(resume as usize)
    }

    /// 大小写不敏感地解析阶段名
    pub fn from_name(name: &str) -> Option<Self> {
        STAGE_NAMES.get(name.trim().to_lowercase().as_str()).copied()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key().to_uppercase())
    }
}

/// 单次运行的整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}
