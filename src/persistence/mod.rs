//! 断点续传持久化模块
//!
//! - `store`：键值存储抽象（文件 / 内存）
//! - `resume`：断点续传记录、文件指纹与过期清理
//!
//! ## 文件结构
//!
//! ```text
//! resume/
//! └── {sha256(key)}.json    # 一条断点记录（{"key": ..., "value": ...}）
//! ```

pub mod resume;
pub mod store;

pub use resume::{fingerprint, ResumableFile, ResumeRecord, ResumeStore, RESUME_VERSION};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
