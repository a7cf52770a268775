//! 基础设施层（Infrastructure Layer）
//!
//! 持有共享、持久的资源，只暴露能力：
//!
//! - `status_store` / `result_store` - 状态表与结果表的接口和内存实现
//! - `file_store` - 文件持久化实现
//! - `trace_sink` - trace 导出
//! - `run_log` - 每次运行的日志文件

pub mod file_store;
pub mod result_store;
pub mod run_log;
pub mod status_store;
pub mod trace_sink;

pub use file_store::{FileResultStore, FileStatusStore};
pub use result_store::{InMemoryResultStore, ResultStore};
pub use run_log::{LogLevel, RunLog};
pub use status_store::{InMemoryStatusStore, StatusStore};
pub use trace_sink::{InMemoryTraceSink, JsonlTraceSink, TraceSink};
