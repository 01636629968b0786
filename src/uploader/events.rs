// 上传事件
//
// 管理器通过 tokio broadcast 通道发布事件，订阅方调用 `UploadManager::subscribe()`。
// 进度事件按时间间隔节流，避免事件风暴。

use crate::uploader::task::{FileId, UploadStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认进度事件节流间隔（毫秒）
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 200;

/// 上传事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件已提交
    Submitted {
        file_id: FileId,
        name: String,
        size: Option<u64>,
    },
    /// 状态变更
    StatusChanged {
        file_id: FileId,
        old_status: UploadStatus,
        new_status: UploadStatus,
    },
    /// 进度更新
    Progress {
        file_id: FileId,
        uploaded_bytes: u64,
        total_bytes: u64,
    },
    /// 从断点记录续传
    Resume {
        file_id: FileId,
        completed_parts: usize,
        total_parts: usize,
    },
    /// 单个分片已确认
    ChunkSuccess {
        file_id: FileId,
        part_index: usize,
        total_parts: usize,
    },
    /// 自动重试
    AutoRetry {
        file_id: FileId,
        attempt: u32,
    },
    /// 上传结束（成功或最终失败）
    Complete {
        file_id: FileId,
        success: bool,
        error: Option<String>,
    },
    /// 删除请求结束
    DeleteComplete {
        file_id: FileId,
        success: bool,
    },
    /// 本批次所有文件均已结束
    AllComplete {
        succeeded: Vec<FileId>,
        failed: Vec<FileId>,
    },
}

impl UploadEvent {
    /// 获取文件 ID（批次事件返回 None）
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            UploadEvent::Submitted { file_id, .. }
            | UploadEvent::StatusChanged { file_id, .. }
            | UploadEvent::Progress { file_id, .. }
            | UploadEvent::Resume { file_id, .. }
            | UploadEvent::ChunkSuccess { file_id, .. }
            | UploadEvent::AutoRetry { file_id, .. }
            | UploadEvent::Complete { file_id, .. }
            | UploadEvent::DeleteComplete { file_id, .. } => Some(*file_id),
            UploadEvent::AllComplete { .. } => None,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Submitted { .. } => "submitted",
            UploadEvent::StatusChanged { .. } => "status_changed",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Resume { .. } => "resume",
            UploadEvent::ChunkSuccess { .. } => "chunk_success",
            UploadEvent::AutoRetry { .. } => "auto_retry",
            UploadEvent::Complete { .. } => "complete",
            UploadEvent::DeleteComplete { .. } => "delete_complete",
            UploadEvent::AllComplete { .. } => "all_complete",
        }
    }
}

/// 进度事件节流器
///
/// 距离上次发布超过间隔时 `should_emit()` 返回 true；
/// 使用 CAS 更新时间戳，可跨线程共享
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布事件的时间（相对 origin 的纳秒数 + 1，0 表示从未发布）
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    pub fn default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS))
    }

    pub fn should_emit(&self) -> bool {
        let now = self.origin.elapsed().as_nanos() as u64 + 1;
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != 0 && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::AutoRetry {
            file_id: FileId(3),
            attempt: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"auto_retry""#));
        assert_eq!(event.file_id(), Some(FileId(3)));
        assert_eq!(event.event_type_name(), "auto_retry");

        let parsed: UploadEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_throttler() {
        let throttler = ProgressThrottler::new(Duration::from_secs(60));
        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());

        let throttler = ProgressThrottler::new(Duration::ZERO);
        assert!(throttler.should_emit());
        assert!(throttler.should_emit());
    }
}
