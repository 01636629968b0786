// 上传数据源
//
// - MemoryBlob：内存数据
// - FileBlob：本地文件，按范围读取
// - ProxyBlob：延迟生成的数据（生成前大小未知），释放槽位时丢弃已生成的数据

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// 上传数据源
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// 当前已知大小（代理数据生成前为 None）
    fn size(&self) -> Option<u64>;

    /// 确保数据可读并返回大小
    async fn materialize(&self) -> Result<u64>;

    /// 读取指定范围
    async fn read_range(&self, range: Range<u64>) -> Result<Bytes>;

    /// 是否为延迟生成的代理数据
    fn is_proxy(&self) -> bool {
        false
    }

    /// 丢弃已生成的数据（仅代理数据有效）
    fn release(&self) {}
}

/// 内存数据
#[derive(Debug, Clone)]
pub struct MemoryBlob {
    data: Bytes,
}

impl MemoryBlob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl BlobSource for MemoryBlob {
    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    async fn materialize(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        slice_bytes(&self.data, range)
    }
}

/// 本地文件
#[derive(Debug, Clone)]
pub struct FileBlob {
    path: PathBuf,
    size: Arc<Mutex<Option<u64>>>,
}

impl FileBlob {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: Arc::new(Mutex::new(None)),
        }
    }

    /// 打开文件并读取大小
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let blob = Self::new(path);
        blob.materialize().await?;
        Ok(blob)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BlobSource for FileBlob {
    fn size(&self) -> Option<u64> {
        *self.size.lock()
    }

    async fn materialize(&self) -> Result<u64> {
        let metadata = tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("读取文件信息失败: {:?}", self.path))?;
        let size = metadata.len();
        *self.size.lock() = Some(size);
        Ok(size)
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        let mut file = File::open(&self.path).await.context("打开上传文件失败")?;

        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .context("文件定位失败")?;

        let len = (range.end - range.start) as usize;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)
            .await
            .context("读取分片数据失败")?;

        debug!(
            "读取文件数据: path={:?}, bytes={}-{}, 大小={} bytes",
            self.path, range.start, range.end, len
        );

        Ok(Bytes::from(buffer))
    }
}

type BlobFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// 延迟生成的代理数据
pub struct ProxyBlob {
    factory: BlobFactory,
    data: Mutex<Option<Bytes>>,
    /// 最近一次生成的大小（数据释放后保留）
    last_size: Mutex<Option<u64>>,
}

impl std::fmt::Debug for ProxyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBlob")
            .field("materialized", &self.data.lock().is_some())
            .field("last_size", &*self.last_size.lock())
            .finish()
    }
}

impl ProxyBlob {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Bytes>> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            data: Mutex::new(None),
            last_size: Mutex::new(None),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.data.lock().is_some()
    }

    async fn bytes(&self) -> Result<Bytes> {
        if let Some(data) = self.data.lock().clone() {
            return Ok(data);
        }
        let data = (self.factory)().await.context("生成代理数据失败")?;
        *self.last_size.lock() = Some(data.len() as u64);
        *self.data.lock() = Some(data.clone());
        Ok(data)
    }
}

#[async_trait]
impl BlobSource for ProxyBlob {
    fn size(&self) -> Option<u64> {
        *self.last_size.lock()
    }

    async fn materialize(&self) -> Result<u64> {
        Ok(self.bytes().await?.len() as u64)
    }

    async fn read_range(&self, range: Range<u64>) -> Result<Bytes> {
        let data = self.bytes().await?;
        slice_bytes(&data, range)
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn release(&self) {
        if self.data.lock().take().is_some() {
            debug!("已丢弃代理数据");
        }
    }
}

fn slice_bytes(data: &Bytes, range: Range<u64>) -> Result<Bytes> {
    let len = data.len() as u64;
    if range.start > range.end || range.end > len {
        anyhow::bail!("读取范围越界: {:?}, 数据大小={}", range, len);
    }
    Ok(data.slice(range.start as usize..range.end as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_memory_blob_range() {
        let blob = MemoryBlob::new(Bytes::from_static(b"0123456789"));
        assert_eq!(blob.size(), Some(10));
        assert_eq!(&blob.read_range(2..5).await.unwrap()[..], b"234");
        assert!(blob.read_range(8..12).await.is_err());
    }

    #[tokio::test]
    async fn test_file_blob_range() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello chunked world").unwrap();

        let blob = FileBlob::open(file.path()).await.unwrap();
        assert_eq!(blob.size(), Some(19));
        assert_eq!(&blob.read_range(6..13).await.unwrap()[..], b"chunked");
    }

    #[tokio::test]
    async fn test_proxy_blob_lazy_and_release() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let blob = ProxyBlob::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            async { Ok(Bytes::from_static(b"generated")) }.boxed()
        });

        assert_eq!(blob.size(), None);
        assert_eq!(blob.materialize().await.unwrap(), 9);
        assert_eq!(&blob.read_range(0..3).await.unwrap()[..], b"gen");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        blob.release();
        assert!(!blob.is_materialized());
        assert_eq!(blob.size(), Some(9));

        blob.read_range(0..1).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
