//! 追踪记录 - 流程层
//!
//! 一次运行一个父 span，阶段子 span 按顺序挂在下面。
//! `StageSpan` 可变借用 `RunTrace`，所以同一时刻只能有一个子 span 打开，
//! 而且父 span 只有在子 span 关闭后才能结束。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::infrastructure::TraceSink;
use crate::models::{Span, SpanKind, SpanStatus, Stage, Trace};

/// 提示词模板在 span 上最多记录的字符数
pub const PROMPT_PREVIEW_CHARS: usize = 200;

/// 不早于 `after` 的当前时间
fn now_after(after: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(after)
}

/// trace 构建器
#[derive(Clone)]
pub struct TraceRecorder {
    sink: Arc<dyn TraceSink>,
}

impl TraceRecorder {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }

    /// 打开父 span（CHAIN）
    pub fn start_run(
        &self,
        name: &str,
        inputs: Map<String, JsonValue>,
        attributes: Map<String, JsonValue>,
    ) -> RunTrace {
        let trace_id = self.sink.next_id();
        let root = Span {
            span_id: self.sink.next_id(),
            parent_id: None,
            name: name.to_string(),
            kind: SpanKind::Chain,
            inputs,
            outputs: Map::new(),
            attributes,
            status: SpanStatus::Unset,
            start_time: Utc::now(),
            end_time: None,
        };
        debug!("打开父 span: {} ({})", name, trace_id);

        RunTrace {
            sink: self.sink.clone(),
            trace: Trace {
                trace_id,
                root,
                children: Vec::new(),
            },
        }
    }
}

/// 正在构建的一次运行的 trace
pub struct RunTrace {
    sink: Arc<dyn TraceSink>,
    trace: Trace,
}

impl RunTrace {
    pub fn trace_id(&self) -> &str {
        &self.trace.trace_id
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.trace.root.attributes.insert(key.to_string(), value.into());
    }

    /// 打开阶段子 span，inputs 在调用适配器之前记录
    pub fn start_stage(&mut self, stage: Stage, inputs: Map<String, JsonValue>) -> StageSpan<'_> {
        let start_after = self
            .trace
            .children
            .last()
            .and_then(|s| s.end_time)
            .unwrap_or(self.trace.root.start_time);

        let mut attributes = Map::new();
        attributes.insert("stage".into(), JsonValue::from(stage.key()));

        self.trace.children.push(Span {
            span_id: self.sink.next_id(),
            parent_id: Some(self.trace.root.span_id.clone()),
            name: stage.span_name(),
            kind: stage.span_kind(),
            inputs,
            outputs: Map::new(),
            attributes,
            status: SpanStatus::Unset,
            start_time: now_after(start_after),
            end_time: None,
        });

        StageSpan {
            run: self,
            closed: false,
        }
    }

    /// 关闭父 span 并导出；导出失败只记警告
    pub async fn finish(mut self, outcome: Result<Map<String, JsonValue>, String>) -> Trace {
        let last_end = self
            .trace
            .children
            .last()
            .and_then(|s| s.end_time)
            .unwrap_or(self.trace.root.start_time);

        let root = &mut self.trace.root;
        match outcome {
            Ok(outputs) => {
                root.outputs = outputs;
                root.status = SpanStatus::Ok;
            }
            Err(message) => {
                root.outputs.insert("error".into(), JsonValue::from(message.as_str()));
                root.status = SpanStatus::Error(message);
            }
        }
        root.end_time = Some(now_after(last_end));

        if let Err(e) = self.sink.export(&self.trace).await {
            warn!("⚠️ trace {} 导出失败: {}", self.trace.trace_id, e);
        }
        self.trace
    }

    /// 丢弃未开始的运行（不导出）
    pub fn abandon(self) {
        debug!("丢弃 trace: {}", self.trace.trace_id);
    }

    fn current_child(&mut self) -> Option<&mut Span> {
        self.trace.children.last_mut().filter(|s| s.end_time.is_none())
    }
}

/// 打开中的阶段子 span
///
/// 未显式关闭就被丢弃时按错误关闭。
pub struct StageSpan<'a> {
    run: &'a mut RunTrace,
    closed: bool,
}

impl StageSpan<'_> {
    pub fn set_attribute(&mut self, key: &str, value: impl Into<JsonValue>) {
        if let Some(span) = self.run.current_child() {
            span.attributes.insert(key.to_string(), value.into());
        }
    }

    pub fn set_attributes(&mut self, attributes: Map<String, JsonValue>) {
        if let Some(span) = self.run.current_child() {
            span.attributes.extend(attributes);
        }
    }

    /// 记录输出并成功关闭
    pub fn succeed(mut self, outputs: Map<String, JsonValue>) {
        self.close(Ok(outputs));
    }

    /// 记录错误并关闭
    pub fn fail(mut self, message: &str) {
        self.close(Err(message.to_string()));
    }

    fn close(&mut self, outcome: Result<Map<String, JsonValue>, String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(span) = self.run.current_child() {
            match outcome {
                Ok(outputs) => {
                    span.outputs = outputs;
                    span.status = SpanStatus::Ok;
                }
                Err(message) => {
                    span.outputs.insert("error".into(), JsonValue::from(message.as_str()));
                    span.status = SpanStatus::Error(message);
                }
            }
            span.end_time = Some(now_after(span.start_time));
        }
    }
}

impl Drop for StageSpan<'_> {
    fn drop(&mut self) {
        self.close(Err("阶段未正常结束".to_string()));
    }
}
