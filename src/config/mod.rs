// 配置管理模块

use crate::error::{UploaderError, UploaderResult};
use crate::transport::{CorsConfig, HttpMethod, TransportCapability};
use crate::uploader::chunk::DEFAULT_PART_SIZE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// 上传器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// 全局最大连接数（整文件请求与分片请求共享）
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 上传请求配置
    #[serde(default)]
    pub request: RequestConfig,
    /// 分片配置
    #[serde(default)]
    pub chunking: ChunkingConfig,
    /// 断点续传配置
    #[serde(default)]
    pub resume: ResumeConfig,
    /// 重试配置
    #[serde(default)]
    pub retry: RetryConfig,
    /// 跨域配置
    #[serde(default)]
    pub cors: CorsSettings,
    /// 删除请求配置
    #[serde(default)]
    pub delete_file: DeleteFileConfig,
    /// 提交校验配置
    #[serde(default)]
    pub validation: ValidationConfig,
    /// 断点记录存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

fn default_max_connections() -> usize {
    3
}

// ============================================================================
// 日志
// ============================================================================

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大字节数（默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

// ============================================================================
// 上传请求
// ============================================================================

/// 上传请求配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// 上传端点
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// 请求方法（POST 或 PUT）
    #[serde(default = "default_request_method")]
    pub method: HttpMethod,
    /// 每个请求附带的静态参数
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// 参数放入请求体（否则放入查询串）
    #[serde(default = "default_true")]
    pub params_in_body: bool,
    /// 自定义请求头
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    /// 使用 multipart 编码（否则发送原始字节流）
    #[serde(default = "default_true")]
    pub force_multipart: bool,
    /// multipart 文件字段名
    #[serde(default = "default_input_name")]
    pub input_name: String,
    /// UUID 参数名
    #[serde(default = "default_uuid_name")]
    pub uuid_name: String,
    /// 文件名参数名
    #[serde(default = "default_filename_param")]
    pub filename_param: String,
    /// 文件总大小参数名
    #[serde(default = "default_total_file_size_name")]
    pub total_file_size_name: String,
    /// 请求超时（秒，0 表示不限制）
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/server/upload".to_string()
}

fn default_request_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_input_name() -> String {
    "qqfile".to_string()
}

fn default_uuid_name() -> String {
    "qquuid".to_string()
}

fn default_filename_param() -> String {
    "qqfilename".to_string()
}

fn default_total_file_size_name() -> String {
    "qqtotalfilesize".to_string()
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            method: default_request_method(),
            params: HashMap::new(),
            params_in_body: true,
            custom_headers: HashMap::new(),
            force_multipart: true,
            input_name: default_input_name(),
            uuid_name: default_uuid_name(),
            filename_param: default_filename_param(),
            total_file_size_name: default_total_file_size_name(),
            timeout_secs: 0,
        }
    }
}

// ============================================================================
// 分片
// ============================================================================

/// 分片参数名
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkParamNames {
    #[serde(default = "default_part_index_name")]
    pub part_index: String,
    #[serde(default = "default_part_byte_offset_name")]
    pub part_byte_offset: String,
    #[serde(default = "default_chunk_size_name")]
    pub chunk_size: String,
    #[serde(default = "default_total_parts_name")]
    pub total_parts: String,
    /// 续传标记参数名
    #[serde(default = "default_resuming_name")]
    pub resuming: String,
}

fn default_part_index_name() -> String {
    "qqpartindex".to_string()
}

fn default_part_byte_offset_name() -> String {
    "qqpartbyteoffset".to_string()
}

fn default_chunk_size_name() -> String {
    "qqchunksize".to_string()
}

fn default_total_parts_name() -> String {
    "qqtotalparts".to_string()
}

fn default_resuming_name() -> String {
    "qqresume".to_string()
}

impl Default for ChunkParamNames {
    fn default() -> Self {
        Self {
            part_index: default_part_index_name(),
            part_byte_offset: default_part_byte_offset_name(),
            chunk_size: default_chunk_size_name(),
            total_parts: default_total_parts_name(),
            resuming: default_resuming_name(),
        }
    }
}

/// 分片配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// 是否启用分片上传
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 同一文件的分片是否并发上传
    #[serde(default)]
    pub concurrent: bool,
    /// 即使只有一个分片也走分片流程
    #[serde(default)]
    pub mandatory: bool,
    /// 分片大小（字节，默认 2MB）
    #[serde(default = "default_part_size")]
    pub part_size: u64,
    /// 所有分片完成后的合并端点（不配置时以最后一个分片的响应作为结果）
    #[serde(default)]
    pub success_endpoint: Option<String>,
    /// 分片参数名
    #[serde(default)]
    pub param_names: ChunkParamNames,
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrent: false,
            mandatory: false,
            part_size: default_part_size(),
            success_endpoint: None,
            param_names: ChunkParamNames::default(),
        }
    }
}

// ============================================================================
// 断点续传
// ============================================================================

/// 断点续传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// 是否启用断点续传
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 断点记录过期天数（默认 7 天）
    #[serde(default = "default_record_expire_days")]
    pub record_expire_days: u32,
    /// 存储键命名空间
    #[serde(default = "default_resume_namespace")]
    pub namespace: String,
    /// 追加到所有文件指纹中的自定义键
    #[serde(default)]
    pub custom_keys: Vec<String>,
}

fn default_record_expire_days() -> u32 {
    7
}

fn default_resume_namespace() -> String {
    "qq".to_string()
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record_expire_days: default_record_expire_days(),
            namespace: default_resume_namespace(),
            custom_keys: Vec::new(),
        }
    }
}

// ============================================================================
// 重试
// ============================================================================

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 是否自动重试
    #[serde(default = "default_true")]
    pub enable_auto: bool,
    /// 最大自动重试次数
    #[serde(default = "default_max_auto_attempts")]
    pub max_auto_attempts: u32,
    /// 自动重试间隔（秒）
    #[serde(default = "default_auto_attempt_delay_secs")]
    pub auto_attempt_delay_secs: u64,
    /// 响应中表示"禁止重试"的字段名
    #[serde(default = "default_prevent_retry_property")]
    pub prevent_retry_property: String,
}

fn default_max_auto_attempts() -> u32 {
    3
}

fn default_auto_attempt_delay_secs() -> u64 {
    5
}

fn default_prevent_retry_property() -> String {
    "preventRetry".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enable_auto: true,
            max_auto_attempts: default_max_auto_attempts(),
            auto_attempt_delay_secs: default_auto_attempt_delay_secs(),
            prevent_retry_property: default_prevent_retry_property(),
        }
    }
}

// ============================================================================
// 跨域
// ============================================================================

/// 跨域配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsSettings {
    /// 请求是否跨域
    #[serde(default)]
    pub expected: bool,
    /// 跨域请求是否携带凭据
    #[serde(default)]
    pub send_credentials: bool,
    /// 旧式跨域传输（无法读取响应状态码，完成即视为成功）
    #[serde(default)]
    pub legacy_status_blind: bool,
}

impl CorsSettings {
    pub fn to_cors_config(&self) -> CorsConfig {
        CorsConfig {
            expected: self.expected,
            send_credentials: self.send_credentials,
            capability: if self.legacy_status_blind {
                TransportCapability::StatusBlind
            } else {
                TransportCapability::Standard
            },
        }
    }
}

// ============================================================================
// 删除请求
// ============================================================================

/// 删除请求配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteFileConfig {
    /// 是否启用删除
    #[serde(default)]
    pub enabled: bool,
    /// 删除端点（UUID 作为路径后缀）
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// 请求方法（DELETE，或 POST 加 X-HTTP-Method-Override）
    #[serde(default = "default_delete_method")]
    pub method: HttpMethod,
    /// 附带的静态参数
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// 自定义请求头
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
}

fn default_delete_method() -> HttpMethod {
    HttpMethod::Delete
}

impl Default for DeleteFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_endpoint(),
            method: default_delete_method(),
            params: HashMap::new(),
            custom_headers: HashMap::new(),
        }
    }
}

// ============================================================================
// 提交校验
// ============================================================================

/// 提交校验配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// 允许的扩展名（不区分大小写，空表示不限制）
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// 最大文件大小（字节，0 表示不限制）
    #[serde(default)]
    pub size_limit: u64,
    /// 最小文件大小（字节）
    #[serde(default)]
    pub min_size_limit: u64,
    /// 会话内最多提交的文件数（0 表示不限制）
    #[serde(default)]
    pub item_limit: usize,
    /// 是否允许空文件
    #[serde(default)]
    pub allow_empty: bool,
}

// ============================================================================
// 断点存储
// ============================================================================

/// 断点记录存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 本地文件（跨进程恢复）
    File,
    /// 进程内存
    Memory,
}

/// 断点存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    /// 文件存储目录
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::File
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("resume")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            dir: default_storage_dir(),
        }
    }
}

// ============================================================================
// 加载与校验
// ============================================================================

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            request: RequestConfig::default(),
            chunking: ChunkingConfig::default(),
            resume: ResumeConfig::default(),
            retry: RetryConfig::default(),
            cors: CorsSettings::default(),
            delete_file: DeleteFileConfig::default(),
            validation: ValidationConfig::default(),
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl UploaderConfig {
    /// 校验配置
    pub fn validate(&self) -> UploaderResult<()> {
        if self.max_connections == 0 {
            return Err(UploaderError::InvalidConfig(
                "max_connections 必须大于 0".to_string(),
            ));
        }
        if self.request.endpoint.trim().is_empty() {
            return Err(UploaderError::InvalidConfig("上传端点不能为空".to_string()));
        }
        if !matches!(self.request.method, HttpMethod::Post | HttpMethod::Put) {
            return Err(UploaderError::InvalidConfig(format!(
                "上传请求方法只能是 POST 或 PUT，当前: {}",
                self.request.method
            )));
        }
        if self.chunking.enabled && self.chunking.part_size == 0 {
            return Err(UploaderError::InvalidConfig(
                "分片大小必须大于 0".to_string(),
            ));
        }
        if self.delete_file.enabled
            && !matches!(self.delete_file.method, HttpMethod::Delete | HttpMethod::Post)
        {
            return Err(UploaderError::InvalidConfig(format!(
                "删除请求方法只能是 DELETE 或 POST，当前: {}",
                self.delete_file.method
            )));
        }
        if self.validation.size_limit > 0 && self.validation.min_size_limit > self.validation.size_limit
        {
            return Err(UploaderError::InvalidConfig(format!(
                "最小文件大小 {} 大于最大文件大小 {}",
                self.validation.min_size_limit, self.validation.size_limit
            )));
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: UploaderConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}
