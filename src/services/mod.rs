//! 业务能力层（Services Layer）
//!
//! - `stage_adapter` - 阶段适配器接口和注册表
//! - `local` - 离线参考适配器

pub mod local;
pub mod stage_adapter;

pub use local::local_adapters;
pub use stage_adapter::{StageAdapter, StageAdapters, StageFailure, StageInput};
