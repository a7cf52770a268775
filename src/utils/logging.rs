/// 日志工具模块
///
/// 提供日志格式化和输出的辅助函数
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::orchestrator::ProcessingStats;

/// 初始化日志
///
/// `RUST_LOG` 优先；否则 `verbose` 为 true 时输出 debug 级别。重复调用不会生效。
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docflow_pipeline={}", default_level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// 记录程序启动信息
pub fn log_startup(config: &Config) {
    info!("{}", "=".repeat(60));
    info!("🚀 程序启动 - 文档处理流水线");
    info!("📊 最大并发数: {}", config.max_concurrent_files);
    if let Some(stage) = config.forced_failure_stage() {
        info!("🧪 测试模式: 强制 {} 阶段失败", stage);
    }
    info!("{}", "=".repeat(60));
}

/// 记录文件加载信息
///
/// # 参数
/// - `total`: 文件总数
/// - `max_concurrent`: 最大并发数
pub fn log_files_loaded(total: usize, max_concurrent: usize) {
    info!("✓ 找到 {} 个待处理的文件", total);
    info!("📋 最多同时处理 {} 个，其余排队", max_concurrent);
}

/// 打印最终统计信息
pub fn print_final_stats(stats: &ProcessingStats, traces_file: &str) {
    info!("\n{}", "=".repeat(60));
    info!("📊 全部处理完成统计");
    info!(
        "完成时间: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!("{}", "=".repeat(60));
    info!("✅ 成功: {}/{}", stats.success, stats.total);
    info!("❌ 失败: {}", stats.failed);
    if stats.rejected > 0 {
        info!("🚫 拒绝: {}", stats.rejected);
    }
    info!("{}", "=".repeat(60));
    info!("\ntrace 已保存至: {}", traces_file);
}

/// 截断长文本用于日志显示
///
/// # 参数
/// - `text`: 原始文本
/// - `max_len`: 最大长度
///
/// # 返回
/// 返回截断后的文本
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        text.chars().take(max_len).collect::<String>() + "..."
    } else {
        text.to_string()
    }
}
