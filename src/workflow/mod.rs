//! 流程层（Workflow Layer）
//!
//! 定义"一个文件"的完整处理流程：
//!
//! - `RunCtx` - 上下文封装（file_id + attempt + run_id）
//! - `TraceRecorder` - 父 span / 子 span 的层级构建
//! - `PipelineRunner` - 五个阶段的状态机

pub mod pipeline_runner;
pub mod run_ctx;
pub mod trace_recorder;

pub use pipeline_runner::{PipelineRunner, RunJob, RunOutcome};
pub use run_ctx::RunCtx;
pub use trace_recorder::{RunTrace, StageSpan, TraceRecorder};
