// Resumable Uploader Library
// 分片、可续传、并发受限的上传客户端核心库

// 配置管理模块
pub mod config;

// 错误类型
pub mod error;

// 日志初始化
pub mod logging;

// 请求传输模块
pub mod transport;

// 上传引擎模块
pub mod uploader;

// 断点续传持久化模块
pub mod persistence;

// 🔥 公共模块（Deferred 等）
pub mod common;

// 导出常用类型
pub use common::Deferred;
pub use config::UploaderConfig;
pub use error::{UploaderError, UploaderResult};
pub use persistence::{FileKvStore, KvStore, MemoryKvStore, ResumableFile, ResumeStore};
pub use transport::{HttpBackend, HttpMethod, RequestSender, ReqwestBackend, UploadResponse};
pub use uploader::{
    AddOptions, BlobSource, ConnectionBudget, FileBlob, FileId, MemoryBlob, ProxyBlob,
    UploadEvent, UploadManager, UploadStatus,
};
