use anyhow::{bail, Context, Result};
use clap::{crate_version, App, Arg};
use resumable_uploader::{
    config::LogConfig, logging, FileBlob, UploadEvent, UploadManager, UploadStatus,
    UploaderConfig,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/uploader.toml";

/// 加载日志配置
///
/// 日志系统初始化前无法输出日志，单独读取 [log] 段，失败时返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("resumable-uploader")
        .version(crate_version!())
        .about("Chunked, resumable file uploader.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("path")
                .takes_value(true)
                .help("Config file path (default: config/uploader.toml)"),
        )
        .arg(
            Arg::with_name("endpoint")
                .short("e")
                .long("endpoint")
                .value_name("url")
                .takes_value(true)
                .help("Override the upload endpoint"),
        )
        .arg(
            Arg::with_name("list-resumable")
                .long("list-resumable")
                .help("List stored resume records and exit"),
        )
        .arg(
            Arg::with_name("files")
                .multiple(true)
                .help("Files to upload"),
        )
        .get_matches();

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);

    // 🔥 先初始化日志系统（必须保持 log_guard 存活）
    let log_config = load_log_config(config_path).await;
    let log_guard = logging::init_logging(&log_config);

    info!("Resumable Uploader v{} 启动中...", crate_version!());

    let mut config = UploaderConfig::load_or_default(config_path).await;
    if let Some(endpoint) = matches.value_of("endpoint") {
        config.request.endpoint = endpoint.to_string();
    }

    let manager = UploadManager::from_config(config).context("创建上传管理器失败")?;

    if matches.is_present("list-resumable") {
        let records = manager.get_resumable_files_data()?;
        if records.is_empty() {
            println!("没有可续传的记录");
        }
        for record in records {
            println!(
                "{}\t{} bytes\tuuid={}\t剩余 {}/{} 个分片\t{}",
                record.name,
                record.size,
                record.uuid,
                record.remaining_parts,
                record.total_parts,
                record.last_updated.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    }

    let paths: Vec<&str> = matches
        .values_of("files")
        .map(|values| values.collect())
        .unwrap_or_default();
    if paths.is_empty() {
        bail!("未指定要上传的文件");
    }

    let mut events = manager.subscribe();

    for path in &paths {
        let blob = FileBlob::open(*path)
            .await
            .with_context(|| format!("打开文件失败: {}", path))?;
        let name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path)
            .to_string();
        let id = manager.add(Arc::new(blob), name)?;
        if manager.status(id) == Some(UploadStatus::Rejected) {
            let reason = manager
                .file_info(id)
                .and_then(|info| info.error)
                .unwrap_or_default();
            warn!("文件 {} 被拒绝: {}", path, reason);
        }
    }

    if manager.upload_all() == 0 {
        bail!("没有可上传的文件");
    }

    let (succeeded, failed) = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号, 暂停可续传的上传");
                for file in manager.files() {
                    if file.status.is_active() && !manager.pause(file.id) {
                        manager.cancel(file.id);
                    }
                }
                bail!("上传已中断");
            }
            event = events.recv() => match event {
                Ok(UploadEvent::AllComplete { succeeded, failed }) => break (succeeded, failed),
                Ok(UploadEvent::Progress { file_id, uploaded_bytes, total_bytes }) => {
                    let percent = if total_bytes == 0 {
                        100.0
                    } else {
                        uploaded_bytes as f64 / total_bytes as f64 * 100.0
                    };
                    info!("文件 {} 进度: {:.1}% ({}/{} bytes)", file_id, percent, uploaded_bytes, total_bytes);
                }
                Ok(UploadEvent::Resume { file_id, completed_parts, total_parts }) => {
                    info!("文件 {} 从断点继续: 已完成 {}/{} 个分片", file_id, completed_parts, total_parts);
                }
                Ok(UploadEvent::Complete { file_id, success: false, error }) => {
                    error!("文件 {} 上传失败: {}", file_id, error.unwrap_or_default());
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("事件接收滞后, 跳过 {} 条", skipped),
                Err(RecvError::Closed) => bail!("事件通道已关闭"),
            },
        }
    };

    for file in manager.files() {
        match file.status {
            UploadStatus::UploadSuccessful => println!("✓ {}\t{}", file.name, file.uuid),
            UploadStatus::UploadFailed => println!(
                "✗ {}\t{}",
                file.name,
                file.error.unwrap_or_default()
            ),
            UploadStatus::Rejected => println!(
                "- {}\t{}",
                file.name,
                file.error.unwrap_or_default()
            ),
            _ => {}
        }
    }

    info!(
        "上传结束: 成功 {} 个, 失败 {} 个",
        succeeded.len(),
        failed.len()
    );

    if !failed.is_empty() {
        drop(log_guard);
        std::process::exit(1);
    }
    Ok(())
}
