// 上传引擎模块
//
// - 连接预算：整文件槽位 + 分片槽位，等待队列按提交顺序晋升
// - 分片引擎：待上传 / 上传中分片集合，失败回退与暂停折叠
// - 上传管理器：生命周期、自动重试、断点续传、删除

pub mod blob;
pub mod budget;
pub mod chunk;
pub mod engine;
pub mod events;
pub mod manager;
pub mod task;

pub use blob::{BlobSource, FileBlob, MemoryBlob, ProxyBlob};
pub use budget::ConnectionBudget;
pub use chunk::{
    partition, should_chunk, total_parts, ChunkCache, ChunkDescriptor, ChunkingState,
    DEFAULT_PART_SIZE,
};
pub use engine::{ChunkedTransfer, FailureAction, PumpStep, RequestKind};
pub use events::{ProgressThrottler, UploadEvent};
pub use manager::{AddOptions, UploadManager};
pub use task::{FileId, UploadFile, UploadFileInfo, UploadStatus};
