//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量提交和并发调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 命令行批处理
//! - 管理应用生命周期（初始化、运行）
//! - 扫描输入目录，整批提交
//! - 输出全局统计信息
//!
//! ### `pipeline_orchestrator` - 流水线门面
//! - 校验上传 / 重新处理请求
//! - 登记状态记录，交给调度器
//! - 状态和结果查询、状态事件订阅
//!
//! ### `scheduler` - 并发调度器
//! - 最多 N 个运行同时执行，其余排队
//! - 槽位释放后立即派发下一个
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<UploadedFile>)
//!     ↓
//! pipeline_orchestrator + scheduler (准入与并发)
//!     ↓
//! workflow::PipelineRunner (处理单个文件)
//!     ↓
//! services (能力层：五个阶段适配器)
//!     ↓
//! infrastructure (状态表 / 结果表 / trace / 运行日志)
//! ```

pub mod batch_processor;
pub mod pipeline_orchestrator;
pub mod scheduler;

// 重新导出主要类型
pub use batch_processor::{App, ProcessingStats};
pub use pipeline_orchestrator::{AcceptedRun, BatchItem, BatchReceipt, Orchestrator, RejectedItem};
pub use scheduler::{ConcurrencyScheduler, SchedulerStats, DEFAULT_MAX_CONCURRENT};
