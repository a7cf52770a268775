//! 批量文件处理器 - 编排层
//!
//! ## 职责
//!
//! 本模块是命令行程序的入口，负责一次批量处理的完整生命周期。
//!
//! ## 核心功能
//!
//! 1. **应用初始化**：选择存储（文件 / 内存）、trace 导出、阶段适配器
//! 2. **批量加载**：扫描输入目录中所有支持类型的文件
//! 3. **提交与等待**：整批交给 `Orchestrator`，并发由调度器控制
//! 4. **重新处理**：可选地对失败的文件从 PARSE 重新处理一次
//! 5. **全局统计**：汇总成功 / 失败数量

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::infrastructure::{
    FileResultStore, FileStatusStore, InMemoryResultStore, InMemoryStatusStore, JsonlTraceSink,
    ResultStore, StatusStore,
};
use crate::models::{load_all_uploads, Stage};
use crate::orchestrator::pipeline_orchestrator::{BatchItem, Orchestrator};
use crate::services::local_adapters;
use crate::utils::logging::{log_files_loaded, log_startup, print_final_stats};
use crate::workflow::RunOutcome;

/// 应用主结构
pub struct App {
    orchestrator: Orchestrator,
}

/// 处理统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingStats {
    pub success: usize,
    pub failed: usize,
    pub rejected: usize,
    pub total: usize,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> Result<Self> {
        log_startup(&config);

        let (status_store, result_store): (Arc<dyn StatusStore>, Arc<dyn ResultStore>) =
            match &config.state_dir {
                Some(dir) => {
                    info!("💾 状态目录: {}", dir);
                    (
                        Arc::new(FileStatusStore::open(dir).await?),
                        Arc::new(FileResultStore::open(dir).await?),
                    )
                }
                None => {
                    info!("💾 未配置状态目录，使用内存存储");
                    (
                        Arc::new(InMemoryStatusStore::new()),
                        Arc::new(InMemoryResultStore::new()),
                    )
                }
            };

        let trace_sink = Arc::new(JsonlTraceSink::new(&config.traces_file));
        let adapters = local_adapters(&config)?;
        let orchestrator =
            Orchestrator::new(config, status_store, result_store, adapters, trace_sink)?;

        Ok(Self { orchestrator })
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// 运行应用主逻辑
    pub async fn run(&self) -> Result<ProcessingStats> {
        let config = self.orchestrator.config();

        info!("\n📁 正在扫描待处理的文件...");
        let uploads = load_all_uploads(&config.input_folder, &config.supported_file_types).await?;
        if uploads.is_empty() {
            warn!("⚠️ 没有找到待处理的文件，程序结束");
            return Ok(ProcessingStats::default());
        }
        log_files_loaded(uploads.len(), config.max_concurrent_files);

        let items = uploads.into_iter().map(BatchItem::New).collect();
        let (mut stats, failed) = self.process_batch(items).await;

        if config.reprocess_failed {
            // 只重新处理本批失败的文件；INGEST 失败的没有可恢复的结果
            let retry_ids: Vec<String> = failed
                .iter()
                .filter(|o| o.failed_stage != Some(Stage::Ingest))
                .map(|o| o.file_id.clone())
                .collect();
            if !retry_ids.is_empty() {
                info!("\n🔁 重新处理 {} 个失败的文件", retry_ids.len());
                let items = retry_ids.into_iter().map(BatchItem::reprocess).collect();
                let (retry, _) = self.process_batch(items).await;
                stats.fold_retry(&retry);
            }
        }

        print_final_stats(&stats, config.traces_file.as_str());
        Ok(stats)
    }

    /// 提交一批并等待全部结束，返回统计和失败的运行
    async fn process_batch(&self, items: Vec<BatchItem>) -> (ProcessingStats, Vec<RunOutcome>) {
        let receipt = self.orchestrator.submit_batch(items).await;
        let mut stats = ProcessingStats {
            rejected: receipt.rejected.len(),
            total: receipt.accepted.len() + receipt.rejected.len(),
            ..Default::default()
        };

        let mut failed = Vec::new();
        for outcome in receipt.wait().await {
            match outcome {
                Ok(outcome) if outcome.is_success() => stats.success += 1,
                Ok(outcome) => {
                    log_failure(&outcome);
                    stats.failed += 1;
                    failed.push(outcome);
                }
                Err(e) => {
                    error!("❌ 运行异常: {}", e);
                    stats.failed += 1;
                }
            }
        }
        (stats, failed)
    }
}

impl ProcessingStats {
    /// 合并重新处理的结果：重新处理的文件先从失败中移出，再按新结果计入
    fn fold_retry(&mut self, retry: &ProcessingStats) {
        self.failed = self.failed.saturating_sub(retry.total) + retry.failed + retry.rejected;
        self.success += retry.success;
    }
}

fn log_failure(outcome: &RunOutcome) {
    match outcome.failed_stage {
        Some(stage) => error!(
            "[文件 {}] ❌ 在 {} 阶段失败: {}",
            outcome.file_id,
            stage,
            outcome.error_message.as_deref().unwrap_or("未知错误")
        ),
        None => error!("[文件 {}] ❌ 处理失败", outcome.file_id),
    }
}
