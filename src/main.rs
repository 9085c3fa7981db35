use anyhow::Context;
use ftpmirror_lib::core::{BackupEngine, GzipCompressor};
use ftpmirror_lib::ftp::TcpFtpDialer;
use ftpmirror_lib::{logging, BackupConfig};
use std::path::Path;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ftpmirror.json".to_string());
    let config = BackupConfig::load(Path::new(&config_path))
        .with_context(|| format!("读取配置 {} 失败", config_path))?;

    logging::init_logging(&config.log, config.verbose);

    info!(
        "开始备份 {} -> {}@{}:{}{}",
        config.local_root,
        config.server.username,
        config.server.host,
        config.server.port,
        config.remote_root
    );

    let dialer = TcpFtpDialer;
    let engine = BackupEngine::new(&config, &dialer, &GzipCompressor);
    let report = engine.run();
    info!("运行报告: {}", serde_json::to_string(&report)?);

    if !report.success {
        anyhow::bail!(
            "备份失败: {}",
            report.last_error.as_deref().unwrap_or("未知错误")
        );
    }
    Ok(())
}
