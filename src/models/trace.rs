//! 追踪数据：一次运行 = 一个父 span + 按顺序排列的阶段子 span

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// span 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanKind {
    Chain,
    Parser,
    Llm,
    Retriever,
}

/// span 结束状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpanStatus {
    /// 尚未关闭
    Unset,
    Ok,
    Error(String),
}

/// 单个 span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub inputs: Map<String, JsonValue>,
    pub outputs: Map<String, JsonValue>,
    pub attributes: Map<String, JsonValue>,
    pub status: SpanStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Span {
    pub fn is_closed(&self) -> bool {
        self.end_time.is_some()
    }
}

/// 一次运行尝试的完整追踪
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub trace_id: String,
    pub root: Span,
    /// 按打开顺序排列；任意时刻最多一个未关闭
    pub children: Vec<Span>,
}

impl Trace {
    /// 检查层级形状：子 span 都挂在父 span 下、互不重叠、且都在父 span 结束前结束
    pub fn is_well_nested(&self) -> bool {
        let Some(root_end) = self.root.end_time else {
            return false;
        };

        let mut previous_end = self.root.start_time;
        for child in &self.children {
            let Some(end) = child.end_time else {
                return false;
            };
            if child.parent_id.as_deref() != Some(self.root.span_id.as_str())
                || child.start_time < previous_end
                || end < child.start_time
                || end > root_end
            {
                return false;
            }
            previous_end = end;
        }
        true
    }

    /// 子 span 名称（按顺序）
    pub fn child_names(&self) -> Vec<&str> {
        self.children.iter().map(|s| s.name.as_str()).collect()
    }
}
