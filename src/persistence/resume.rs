// 断点续传记录
//
// 记录键（文件指纹）：
//   {namespace}resume{version}-{name}-{size}-{chunk_size}-{endpoint}[-{custom_key}...]
//
// 每个分片确认后覆盖写入；合并成功、服务器要求重置、取消或过期清理时删除。

use crate::error::UploaderResult;
use crate::persistence::store::KvStore;
use crate::uploader::chunk::ChunkingState;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 记录格式版本
pub const RESUME_VERSION: &str = "5.0";

/// 断点续传记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// 传输 UUID
    pub uuid: String,
    /// 服务器分配的对象键
    #[serde(default)]
    pub key: Option<String>,
    /// 分片进度
    pub chunking: ChunkingState,
    /// 已确认字节数
    pub loaded: u64,
    /// 分片总数
    #[serde(rename = "totalParts")]
    pub total_parts: usize,
    /// 最后更新时间
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl ResumeRecord {
    /// 分片状态是否与分片总数一致
    pub fn is_valid(&self) -> bool {
        self.chunking.is_valid_for(self.total_parts)
    }

    /// 是否早于保留期限
    pub fn is_expired(&self, now: DateTime<Utc>, expire_days: u32) -> bool {
        now.signed_duration_since(self.last_updated) > Duration::days(expire_days as i64)
    }

    /// 续传用的分片状态：上传中的分片按顺序放回待上传队首
    pub fn resumable_state(&self) -> ChunkingState {
        let mut state = self.chunking.clone();
        state.fold_in_progress();
        state
    }
}

/// 计算文件指纹（存储键）
///
/// # 参数
/// * `namespace` - 命名空间前缀
/// * `name` - 文件名
/// * `size` - 文件大小
/// * `chunk_size` - 分片大小
/// * `endpoint` - 上传端点
/// * `custom_keys` - 调用方附加的键
pub fn fingerprint(
    namespace: &str,
    name: &str,
    size: u64,
    chunk_size: u64,
    endpoint: &str,
    custom_keys: &[String],
) -> String {
    let mut key = format!(
        "{}{}-{}-{}-{}",
        key_prefix(namespace),
        name,
        size,
        chunk_size,
        endpoint
    );
    for custom in custom_keys {
        key.push('-');
        key.push_str(custom);
    }
    key
}

fn key_prefix(namespace: &str) -> String {
    format!("{}resume{}-", namespace, RESUME_VERSION)
}

/// 可续传的记录（对外查询用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumableFile {
    /// 存储键
    pub storage_key: String,
    pub name: String,
    pub size: u64,
    pub uuid: String,
    pub key: Option<String>,
    /// 剩余分片数
    pub remaining_parts: usize,
    pub total_parts: usize,
    pub last_updated: DateTime<Utc>,
}

/// 断点续传存储
#[derive(Clone)]
pub struct ResumeStore {
    store: Arc<dyn KvStore>,
    namespace: String,
    expire_days: u32,
}

impl std::fmt::Debug for ResumeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeStore")
            .field("namespace", &self.namespace)
            .field("expire_days", &self.expire_days)
            .finish()
    }
}

impl ResumeStore {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>, expire_days: u32) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            expire_days,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 计算文件的存储键
    pub fn key_for(
        &self,
        name: &str,
        size: u64,
        chunk_size: u64,
        endpoint: &str,
        custom_keys: &[String],
    ) -> String {
        fingerprint(&self.namespace, name, size, chunk_size, endpoint, custom_keys)
    }

    /// 读取记录
    ///
    /// 无法解析、分片状态不一致或已过期的记录会被删除并视为不存在
    pub fn load(&self, key: &str) -> UploaderResult<Option<ResumeRecord>> {
        let Some(raw) = self.store.get(key)? else {
            return Ok(None);
        };

        let record: ResumeRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("断点记录无法解析，删除: key={}, 错误: {}", key, e);
                self.store.remove(key)?;
                return Ok(None);
            }
        };

        if !record.is_valid() {
            warn!("断点记录分片状态无效，删除: key={}", key);
            self.store.remove(key)?;
            return Ok(None);
        }

        if record.is_expired(Utc::now(), self.expire_days) {
            debug!("断点记录已过期，删除: key={}", key);
            self.store.remove(key)?;
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// 写入记录（同键覆盖）
    pub fn persist(&self, key: &str, record: &ResumeRecord) -> UploaderResult<()> {
        let value = serde_json::to_string(record)?;
        self.store.set(key, &value)?;
        debug!(
            "已保存断点记录: key={}, 剩余分片={}, 上传中={}",
            key,
            record.chunking.remaining.len(),
            record.chunking.in_progress.len()
        );
        Ok(())
    }

    /// 删除记录
    pub fn remove(&self, key: &str) -> UploaderResult<()> {
        self.store.remove(key)?;
        debug!("已删除断点记录: key={}", key);
        Ok(())
    }

    /// 清理过期与无法解析的记录
    ///
    /// # 返回
    /// 删除的记录数
    pub fn sweep_expired(&self) -> UploaderResult<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for key in self.store.keys(&key_prefix(&self.namespace))? {
            let Some(raw) = self.store.get(&key)? else {
                continue;
            };

            let expired = match serde_json::from_str::<ResumeRecord>(&raw) {
                Ok(record) => {
                    let age = now.signed_duration_since(record.last_updated);
                    if record.is_expired(now, self.expire_days) {
                        debug!("断点记录过期: key={}, 已存在 {} 天", key, age.num_days());
                        true
                    } else {
                        false
                    }
                }
                Err(e) => {
                    warn!("断点记录无法解析: key={}, 错误: {}", key, e);
                    true
                }
            };

            if expired {
                self.store.remove(&key)?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(
                "清理过期断点记录完成: 删除 {} 条 (保留天数={})",
                removed, self.expire_days
            );
        }

        Ok(removed)
    }

    /// 列出可续传的记录
    ///
    /// # 参数
    /// * `in_use` - 当前会话中已被使用的 UUID
    pub fn resumable_files(&self, in_use: &HashSet<String>) -> UploaderResult<Vec<ResumableFile>> {
        let mut files = Vec::new();

        for key in self.store.keys(&key_prefix(&self.namespace))? {
            let Some(record) = self.load(&key)? else {
                continue;
            };
            if in_use.contains(&record.uuid) {
                continue;
            }
            files.push(ResumableFile {
                storage_key: key,
                remaining_parts: record.chunking.remaining.len() + record.chunking.in_progress.len(),
                total_parts: record.total_parts,
                name: record.name,
                size: record.size,
                uuid: record.uuid,
                key: record.key,
                last_updated: record.last_updated,
            });
        }

        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::{FileKvStore, MemoryKvStore};
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn record(uuid: &str) -> ResumeRecord {
        ResumeRecord {
            name: "video.mp4".to_string(),
            size: 5_000_000,
            uuid: uuid.to_string(),
            key: None,
            chunking: ChunkingState {
                remaining: VecDeque::from(vec![2]),
                in_progress: vec![1],
            },
            loaded: 2_000_000,
            total_parts: 3,
            last_updated: Utc::now(),
        }
    }

    fn memory_store() -> (Arc<MemoryKvStore>, ResumeStore) {
        let kv = Arc::new(MemoryKvStore::new());
        let store = ResumeStore::new(kv.clone(), "qq", 7);
        (kv, store)
    }

    #[test]
    fn test_fingerprint_format() {
        let key = fingerprint("qq", "a.bin", 100, 10, "https://h/up", &[]);
        assert_eq!(key, "qqresume5.0-a.bin-100-10-https://h/up");

        let key = fingerprint(
            "qq",
            "a.bin",
            100,
            10,
            "https://h/up",
            &["user42".to_string(), "v2".to_string()],
        );
        assert_eq!(key, "qqresume5.0-a.bin-100-10-https://h/up-user42-v2");
    }

    #[test]
    fn test_persist_and_load() {
        let (_, store) = memory_store();
        let key = store.key_for("video.mp4", 5_000_000, 2_000_000, "https://h/up", &[]);

        store.persist(&key, &record("u1")).unwrap();
        let loaded = store.load(&key).unwrap().unwrap();
        assert_eq!(loaded.uuid, "u1");

        let state = loaded.resumable_state();
        assert_eq!(state.remaining, VecDeque::from(vec![1, 2]));
        assert!(state.in_progress.is_empty());
    }

    #[test]
    fn test_resume_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let kv = Arc::new(FileKvStore::new(temp_dir.path()).unwrap());
        let store = ResumeStore::new(kv, "qq", 7);
        let key = store.key_for("video.mp4", 5_000_000, 2_000_000, "https://h/up", &[]);

        let original = record("u1");
        store.persist(&key, &original).unwrap();
        store.persist(&key, &original).unwrap();

        // 重复加载不改变记录
        let first = store.load(&key).unwrap().unwrap();
        let second = store.load(&key).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.resumable_state(), second.resumable_state());
        assert_eq!(first.chunking, original.chunking);
    }

    #[test]
    fn test_invalid_records_are_dropped() {
        let (kv, store) = memory_store();
        kv.set("qqresume5.0-bad", "{not json").unwrap();
        assert!(store.load("qqresume5.0-bad").unwrap().is_none());
        assert!(kv.is_empty());

        let mut broken = record("u1");
        broken.chunking.remaining.push_back(7);
        store.persist("qqresume5.0-broken", &broken).unwrap();
        assert!(store.load("qqresume5.0-broken").unwrap().is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let (kv, store) = memory_store();

        let mut old = record("old");
        old.last_updated = Utc::now() - Duration::days(8);
        store.persist("qqresume5.0-old", &old).unwrap();
        store.persist("qqresume5.0-fresh", &record("fresh")).unwrap();
        kv.set("qqresume5.0-garbage", "???").unwrap();
        kv.set("other-namespace", "???").unwrap();

        assert_eq!(store.sweep_expired().unwrap(), 2);
        assert_eq!(
            kv.keys("").unwrap(),
            vec!["other-namespace", "qqresume5.0-fresh"]
        );
    }

    #[test]
    fn test_resumable_files_skip_in_use() {
        let (_, store) = memory_store();
        store.persist("qqresume5.0-a", &record("u1")).unwrap();
        store.persist("qqresume5.0-b", &record("u2")).unwrap();

        let in_use: HashSet<String> = ["u1".to_string()].into_iter().collect();
        let files = store.resumable_files(&in_use).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].uuid, "u2");
        assert_eq!(files[0].remaining_parts, 2);
        assert_eq!(files[0].storage_key, "qqresume5.0-b");
    }
}
