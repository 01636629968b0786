// 上传文件记录
//
// 每个提交的文件/数据块对应一条记录，由上传管理器独占；
// 分片引擎与发送器只拿到文件 ID 与分片数据。

use crate::uploader::blob::BlobSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// 会话内唯一的文件 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// 提交中
    Submitting,
    /// 已提交，等待开始
    Submitted,
    /// 排队等待连接额度
    Queued,
    /// 上传中
    Uploading,
    /// 等待重试
    UploadRetrying,
    /// 已暂停
    Paused,
    /// 上传成功
    UploadSuccessful,
    /// 上传失败
    UploadFailed,
    /// 已取消
    Canceled,
    /// 校验未通过
    Rejected,
    /// 删除中
    Deleting,
    /// 已删除
    Deleted,
    /// 删除失败
    DeleteFailed,
}

impl UploadStatus {
    /// 是否为不可再进入上传流程的终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::UploadSuccessful | Self::Canceled | Self::Rejected | Self::Deleted
        )
    }

    /// 是否正在占用传输
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Uploading | Self::UploadRetrying)
    }

    /// 是否已结束（成功/失败/取消等，不会自行继续）
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, Self::UploadFailed | Self::DeleteFailed)
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitting => "submitting",
            Self::Submitted => "submitted",
            Self::Queued => "queued",
            Self::Uploading => "uploading",
            Self::UploadRetrying => "upload_retrying",
            Self::Paused => "paused",
            Self::UploadSuccessful => "upload_successful",
            Self::UploadFailed => "upload_failed",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "delete_failed",
        };
        write!(f, "{}", s)
    }
}

/// 上传文件记录
#[derive(Clone)]
pub struct UploadFile {
    /// 会话内 ID
    pub id: FileId,
    /// 传输 UUID（重试间保持不变，服务器可要求替换）
    pub uuid: String,
    /// 显示名称
    pub name: String,
    /// 文件大小（代理数据生成前未知）
    pub size: Option<u64>,
    /// 状态
    pub status: UploadStatus,
    /// 已确认字节数
    pub uploaded_bytes: u64,
    /// 服务器分配的对象键
    pub key: Option<String>,
    /// 最近一次错误信息
    pub error: Option<String>,
    /// 服务器返回的缩略图地址
    pub thumbnail_url: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 数据源
    pub blob: Arc<dyn BlobSource>,
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("id", &self.id)
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("status", &self.status)
            .field("uploaded_bytes", &self.uploaded_bytes)
            .finish()
    }
}

impl UploadFile {
    pub fn new(id: FileId, name: String, blob: Arc<dyn BlobSource>) -> Self {
        Self {
            id,
            uuid: Uuid::new_v4().to_string(),
            name,
            size: blob.size(),
            status: UploadStatus::Submitting,
            uploaded_bytes: 0,
            key: None,
            error: None,
            thumbnail_url: None,
            created_at: chrono::Utc::now().timestamp(),
            completed_at: None,
            blob,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        match self.size {
            Some(0) | None => 0.0,
            Some(size) => (self.uploaded_bytes as f64 / size as f64) * 100.0,
        }
    }

    /// 标记为成功
    pub fn mark_successful(&mut self) {
        self.status = UploadStatus::UploadSuccessful;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        if let Some(size) = self.size {
            self.uploaded_bytes = size;
        }
        self.error = None;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadStatus::UploadFailed;
        self.error = Some(error);
    }
}

/// 对外暴露的文件快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFileInfo {
    pub id: FileId,
    pub uuid: String,
    pub name: String,
    pub size: Option<u64>,
    pub status: UploadStatus,
    pub uploaded_bytes: u64,
    pub progress: f64,
    pub error: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl From<&UploadFile> for UploadFileInfo {
    fn from(file: &UploadFile) -> Self {
        Self {
            id: file.id,
            uuid: file.uuid.clone(),
            name: file.name.clone(),
            size: file.size,
            status: file.status,
            uploaded_bytes: file.uploaded_bytes,
            progress: file.progress(),
            error: file.error.clone(),
            thumbnail_url: file.thumbnail_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::blob::MemoryBlob;

    fn file(size: usize) -> UploadFile {
        UploadFile::new(
            FileId(1),
            "report.pdf".to_string(),
            Arc::new(MemoryBlob::new(vec![0u8; size])),
        )
    }

    #[test]
    fn test_file_creation() {
        let file = file(1000);
        assert_eq!(file.status, UploadStatus::Submitting);
        assert_eq!(file.size, Some(1000));
        assert_eq!(file.progress(), 0.0);
        assert!(Uuid::parse_str(&file.uuid).is_ok());
    }

    #[test]
    fn test_progress_and_transitions() {
        let mut file = file(1000);
        file.uploaded_bytes = 250;
        assert_eq!(file.progress(), 25.0);

        file.mark_failed("Network error".to_string());
        assert_eq!(file.status, UploadStatus::UploadFailed);
        assert_eq!(file.error.as_deref(), Some("Network error"));

        file.mark_successful();
        assert_eq!(file.status, UploadStatus::UploadSuccessful);
        assert_eq!(file.uploaded_bytes, 1000);
        assert!(file.completed_at.is_some());
        assert!(file.error.is_none());
    }

    #[test]
    fn test_status_classes() {
        assert!(UploadStatus::UploadSuccessful.is_terminal());
        assert!(!UploadStatus::UploadFailed.is_terminal());
        assert!(UploadStatus::UploadFailed.is_settled());
        assert!(UploadStatus::UploadRetrying.is_active());
        assert_eq!(UploadStatus::UploadRetrying.to_string(), "upload_retrying");
    }
}
