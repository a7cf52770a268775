//! # Docflow Pipeline
//!
//! 五阶段文档处理流水线的编排器
//!
//! 每个上传的文件依次经过 INGEST → PARSE → CATEGORIZE → EXTRACT → DEIDENTIFY，
//! 最多 N 个文件同时处理；每次运行都有持久的状态记录、每个阶段的结果记录，
//! 以及一棵父 span + 五个子 span 的 trace。
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有持久化资源，只暴露能力
//! - `StatusStore` / `ResultStore` - 状态表和结果表（内存 / 文件）
//! - `TraceSink` - trace 导出
//! - `RunLog` - 每次运行的日志文件
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，每个阶段一个适配器
//! - `StageAdapter` - 阶段适配器接口
//! - `services::local` - 不依赖 AI 服务的本地实现
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个文件"的完整处理流程
//! - `RunCtx` - 上下文封装（file_id + attempt）
//! - `TraceRecorder` - 父子 span 的构建
//! - `PipelineRunner` - 单文件状态机
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/scheduler` - 有界并发调度
//! - `orchestrator/pipeline_orchestrator` - 批量提交、重新处理、查询
//! - `orchestrator/batch_processor` - 命令行批处理
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{PipelineError, Result};
pub use models::{FileProcessingStatus, RunState, Stage, StageResult, UploadedFile};
pub use orchestrator::{App, BatchItem, BatchReceipt, Orchestrator};
pub use services::{StageAdapter, StageAdapters};
pub use workflow::{PipelineRunner, RunOutcome};
