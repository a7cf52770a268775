use anyhow::Result;
use docflow_pipeline::utils::logging;
use docflow_pipeline::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置：DOCFLOW_CONFIG 指向 TOML 文件时优先使用
    let config = match std::env::var("DOCFLOW_CONFIG") {
        Ok(path) if !path.trim().is_empty() => Config::from_toml_file(std::path::Path::new(&path))?,
        _ => Config::from_env(),
    };
    config.validate()?;

    // 初始化日志
    logging::init(config.verbose_logging);

    // 初始化并运行应用
    let stats = App::initialize(config).await?.run().await?;
    if stats.failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}
