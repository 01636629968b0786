//! 持久化键值存储
//!
//! 断点记录以字符串键 / JSON 字符串值的形式保存，后端可替换：
//! - `FileKvStore`：每个键一个文件，文件名为键的 SHA-256，写入时先写临时文件再原子重命名
//! - `MemoryKvStore`：进程内存储，用于测试或不需要跨进程恢复的场景
//!
//! ## 文件格式
//!
//! ```json
//! { "key": "upload-resume5.0-a.bin-100-10-https://h/upload", "value": "{...}" }
//! ```

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 存储文件扩展名
const ENTRY_EXTENSION: &str = "json";

/// 持久化键值存储
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> io::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
    fn remove(&self, key: &str) -> io::Result<()>;
    /// 列出以 prefix 开头的所有键
    fn keys(&self, prefix: &str) -> io::Result<Vec<String>>;
}

// ============================================================================
// 内存存储
// ============================================================================

/// 内存键值存储
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// 文件存储
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    value: String,
}

/// 文件键值存储
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    /// 创建文件存储（目录不存在时创建）
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 获取键对应的文件路径：`{dir}/{sha256(key)}.json`
    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION))
    }

    fn load_entry(path: &Path) -> io::Result<StoredEntry> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse store entry: {}", e),
            )
        })
    }
}

/// 确保目录存在
fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> io::Result<Option<String>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }

        match Self::load_entry(&path) {
            Ok(entry) if entry.key == key => Ok(Some(entry.value)),
            Ok(entry) => {
                warn!("存储文件键不匹配: {:?}, 期望={}, 实际={}", path, key, entry.key);
                Ok(None)
            }
            Err(e) => {
                warn!("读取存储文件失败 {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        ensure_dir(&self.dir)?;

        let path = self.entry_path(key);
        // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
        let temp_path = path.with_extension("json.tmp");

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        let entry = StoredEntry {
            key: key.to_string(),
            value: value.to_string(),
        };
        serde_json::to_writer(&mut writer, &entry).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize store entry: {}", e),
            )
        })?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        debug!("已写入存储: {:?} (key={})", path, key);
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        let path = self.entry_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("已删除存储: {:?} (key={})", path, key);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn keys(&self, prefix: &str) -> io::Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut skipped = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != ENTRY_EXTENSION) {
                continue;
            }
            match Self::load_entry(&path) {
                Ok(stored) if stored.key.starts_with(prefix) => keys.push(stored.key),
                Ok(_) => {}
                Err(e) => {
                    warn!("跳过无效存储文件 {:?}: {}", path, e);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("扫描存储完成，跳过 {} 个无效文件", skipped);
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.get("a/1").unwrap(), None);

        store.set("a/1", "one").unwrap();
        store.set("a/2", "two").unwrap();
        store.set("b/1", "other").unwrap();
        store.set("a/1", "uno").unwrap();

        assert_eq!(store.get("a/1").unwrap().as_deref(), Some("uno"));
        assert_eq!(store.keys("a/").unwrap(), vec!["a/1", "a/2"]);

        store.remove("a/1").unwrap();
        store.remove("a/1").unwrap();
        assert_eq!(store.get("a/1").unwrap(), None);
        assert_eq!(store.keys("").unwrap().len(), 2);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryKvStore::new());
    }

    #[test]
    fn test_file_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileKvStore::new(temp_dir.path().join("resume")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_skips_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileKvStore::new(temp_dir.path()).unwrap();
        store.set("k", "v").unwrap();
        fs::write(temp_dir.path().join("broken.json"), "{not json").unwrap();

        assert_eq!(store.keys("").unwrap(), vec!["k"]);
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        FileKvStore::new(temp_dir.path())
            .unwrap()
            .set("upload-resume5.0-x", "{}")
            .unwrap();

        let reopened = FileKvStore::new(temp_dir.path()).unwrap();
        assert_eq!(
            reopened.get("upload-resume5.0-x").unwrap().as_deref(),
            Some("{}")
        );
    }
}
