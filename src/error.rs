// 上传引擎错误类型
//
// 配置类错误（重复请求ID、方法不允许等）在调用时同步返回，不参与重试；
// 传输/协议错误作为数据（RequestFailure / UploadResponse）流入重试决策。

use crate::uploader::FileId;
use thiserror::Error;

/// 上传引擎错误
#[derive(Debug, Error)]
pub enum UploaderError {
    /// 请求 ID 已在队列或传输中
    #[error("请求ID重复: {0}")]
    DuplicateRequest(String),

    /// 请求方法不在允许列表中
    #[error("请求方法不允许: {0}")]
    MethodNotAllowed(String),

    /// 文件不存在
    #[error("文件不存在: {0}")]
    UnknownFile(FileId),

    /// 配置无效
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 持久化存储错误
    #[error("持久化存储错误: {0}")]
    Storage(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type UploaderResult<T> = std::result::Result<T, UploaderError>;
