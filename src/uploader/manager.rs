// 上传管理器
//
// 负责管理会话内的所有上传文件：
// - 提交校验、断点记录查找
// - 连接预算（整文件槽位 + 分片槽位）与等待队列晋升
// - 分片调度（显式 pump 循环）、合并请求
// - 自动重试 / 手动重试 / 暂停 / 继续 / 取消
// - 删除已上传文件
//
// 并发模型：
// - 管理器状态由一把 parking_lot::Mutex 保护，持锁期间不 await
// - 每个 HTTP 请求是一个 tokio 任务，完成后重新进入管理器
// - 被中止的请求从在途表移除，迟到的结果直接丢弃

use crate::config::{StorageBackend, UploaderConfig};
use crate::error::{UploaderError, UploaderResult};
use crate::persistence::{FileKvStore, KvStore, MemoryKvStore, ResumableFile, ResumeStore};
use crate::transport::{
    HttpBackend, HttpMethod, ReqwestBackend, RequestOptions, RequestSender, SenderConfig,
    UploadResponse,
};
use crate::uploader::blob::BlobSource;
use crate::uploader::budget::ConnectionBudget;
use crate::uploader::chunk::{should_chunk, total_parts, ChunkDescriptor, ChunkingState};
use crate::uploader::engine::{
    base_params, chunk_params, finalize_params, interpret, upload_body, ChunkedTransfer,
    FailureAction, PumpStep, RequestKind,
};
use crate::uploader::events::{ProgressThrottler, UploadEvent};
use crate::uploader::task::{FileId, UploadFile, UploadFileInfo, UploadStatus};
use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 提交选项
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// 该文件每个请求附带的参数
    pub params: Vec<(String, String)>,
    /// 追加到断点指纹中的自定义键
    pub resume_keys: Vec<String>,
}

/// 传输方式（文件大小确定后决定）
#[derive(Debug)]
enum Transfer {
    Whole,
    Chunked(ChunkedTransfer),
}

struct FileEntry {
    file: UploadFile,
    params: Vec<(String, String)>,
    resume_keys: Vec<String>,
    transfer: Option<Transfer>,
    /// 在途请求 ID -> 请求类型
    active: HashMap<String, RequestKind>,
    /// 每次开始/暂停/取消时递增，用于丢弃过期的异步结果
    generation: u64,
    /// 自动重试次数
    attempts: u32,
    /// 服务器禁止重试
    retry_forbidden: bool,
    retry_token: Option<CancellationToken>,
    resume_key: Option<String>,
    resume_checked: bool,
    resumable: bool,
    /// 开始上传时发布 Resume 事件
    announce_resume: bool,
    throttler: ProgressThrottler,
}

impl FileEntry {
    fn new(file: UploadFile, options: AddOptions) -> Self {
        Self {
            file,
            params: options.params,
            resume_keys: options.resume_keys,
            transfer: None,
            active: HashMap::new(),
            generation: 0,
            attempts: 0,
            retry_forbidden: false,
            retry_token: None,
            resume_key: None,
            resume_checked: false,
            resumable: true,
            announce_resume: false,
            throttler: ProgressThrottler::default_interval(),
        }
    }

    fn chunked_mut(&mut self) -> Option<&mut ChunkedTransfer> {
        match self.transfer.as_mut() {
            Some(Transfer::Chunked(transfer)) => Some(transfer),
            _ => None,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    files: HashMap<FileId, FileEntry>,
    /// 提交顺序
    order: Vec<FileId>,
    /// 本批次是否有上传开始过（用于 AllComplete）
    batch_active: bool,
}

struct ManagerInner {
    config: UploaderConfig,
    /// 上传请求
    sender: RequestSender,
    /// 合并请求（配置了合并端点时）
    finalize_sender: Option<RequestSender>,
    /// 删除请求（启用删除时）
    delete_sender: Option<RequestSender>,
    budget: Arc<ConnectionBudget>,
    resume: Option<ResumeStore>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<UploadEvent>,
    next_id: AtomicU64,
    request_seq: AtomicU64,
}

/// 上传管理器
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for UploadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadManager")
            .field("endpoint", &self.inner.config.request.endpoint)
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

impl UploadManager {
    /// 创建上传管理器
    ///
    /// 连接预算归管理器独占，账本以本会话的 FileId 为键
    ///
    /// # 参数
    /// * `config` - 上传器配置
    /// * `backend` - HTTP 后端
    /// * `store` - 断点记录存储
    pub fn new(
        config: UploaderConfig,
        backend: Arc<dyn HttpBackend>,
        store: Arc<dyn KvStore>,
    ) -> UploaderResult<Self> {
        config.validate()?;
        let budget = Arc::new(ConnectionBudget::new(config.max_connections));

        let cors = config.cors.to_cors_config();

        let mut upload_config =
            SenderConfig::new(config.request.endpoint.clone(), config.request.method);
        upload_config.max_connections = config.max_connections;
        upload_config.params_in_body = config.request.params_in_body;
        upload_config.custom_headers = config.request.custom_headers.clone();
        upload_config.cors = cors.clone();
        let sender = RequestSender::new(upload_config, backend.clone());

        let finalize_sender = config.chunking.success_endpoint.as_ref().map(|endpoint| {
            let mut finalize_config = SenderConfig::new(endpoint.clone(), HttpMethod::Post);
            finalize_config.max_connections = config.max_connections;
            finalize_config.params_in_body = true;
            finalize_config.custom_headers = config.request.custom_headers.clone();
            finalize_config.cors = cors.clone();
            RequestSender::new(finalize_config, backend.clone())
        });

        let delete_sender = config.delete_file.enabled.then(|| {
            let delete = &config.delete_file;
            let mut delete_config = SenderConfig::new(delete.endpoint.clone(), delete.method);
            delete_config.allowed_methods = vec![HttpMethod::Delete, HttpMethod::Post];
            delete_config.max_connections = config.max_connections;
            delete_config.params_in_body = true;
            delete_config.custom_headers = delete.custom_headers.clone();
            delete_config.cors = cors.clone();
            RequestSender::new(delete_config, backend.clone())
        });

        let resume = config.resume.enabled.then(|| {
            ResumeStore::new(
                store,
                config.resume.namespace.clone(),
                config.resume.record_expire_days,
            )
        });

        if let Some(resume) = &resume {
            if let Err(e) = resume.sweep_expired() {
                warn!("清理过期断点记录失败: {}", e);
            }
        }

        info!(
            "创建上传管理器: 端点={}, 最大连接数={}, 分片={} ({} bytes), 断点续传={}",
            config.request.endpoint,
            config.max_connections,
            config.chunking.enabled,
            config.chunking.part_size,
            config.resume.enabled
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                sender,
                finalize_sender,
                delete_sender,
                budget,
                resume,
                state: Mutex::new(ManagerState::default()),
                events,
                next_id: AtomicU64::new(0),
                request_seq: AtomicU64::new(0),
            }),
        })
    }

    /// 按配置创建（reqwest 后端 + 配置的断点存储）
    pub fn from_config(config: UploaderConfig) -> anyhow::Result<Self> {
        let timeout = (config.request.timeout_secs > 0)
            .then(|| Duration::from_secs(config.request.timeout_secs));
        let backend = Arc::new(ReqwestBackend::new(timeout)?);

        let store: Arc<dyn KvStore> = match config.storage.backend {
            StorageBackend::File => Arc::new(
                FileKvStore::new(&config.storage.dir)
                    .with_context(|| format!("创建断点存储目录失败: {:?}", config.storage.dir))?,
            ),
            StorageBackend::Memory => Arc::new(MemoryKvStore::new()),
        };

        Ok(Self::new(config, backend, store)?)
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.inner.config
    }

    pub fn budget(&self) -> Arc<ConnectionBudget> {
        self.inner.budget.clone()
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: UploadEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.inner.events.send(event);
    }

    // ========================================================================
    // 提交
    // ========================================================================

    /// 提交文件
    pub fn add(&self, blob: Arc<dyn BlobSource>, name: impl Into<String>) -> UploaderResult<FileId> {
        self.add_with_options(blob, name, AddOptions::default())
    }

    /// 提交文件（附带参数与自定义断点键）
    ///
    /// # 返回
    /// 文件 ID。未通过校验的文件状态为 rejected
    pub fn add_with_options(
        &self,
        blob: Arc<dyn BlobSource>,
        name: impl Into<String>,
        options: AddOptions,
    ) -> UploaderResult<FileId> {
        let id = FileId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let name = name.into();
        let file = UploadFile::new(id, name.clone(), blob);
        let size = file.size;

        let mut state = self.inner.state.lock();
        let rejection = self.validate_submission(&state, &name, size);

        state.files.insert(id, FileEntry::new(file, options));
        state.order.push(id);
        self.emit(UploadEvent::Submitted {
            file_id: id,
            name: name.clone(),
            size,
        });

        let Some(entry) = state.files.get_mut(&id) else {
            return Err(UploaderError::UnknownFile(id));
        };

        if let Some(reason) = rejection {
            warn!("文件 {} ({}) 未通过校验: {}", id, name, reason);
            entry.file.error = Some(reason);
            self.set_status(entry, UploadStatus::Rejected);
            return Ok(id);
        }

        self.set_status(entry, UploadStatus::Submitted);
        self.attach_resume_record(&mut state, id);

        info!("文件已提交: id={}, name={}, size={:?}", id, name, size);
        Ok(id)
    }

    fn validate_submission(&self, state: &ManagerState, name: &str, size: Option<u64>) -> Option<String> {
        let validation = &self.inner.config.validation;

        if validation.item_limit > 0 {
            let accepted = state
                .files
                .values()
                .filter(|e| {
                    !matches!(
                        e.file.status,
                        UploadStatus::Rejected | UploadStatus::Canceled | UploadStatus::Deleted
                    )
                })
                .count();
            if accepted >= validation.item_limit {
                return Some(format!("超过文件数量限制 ({})", validation.item_limit));
            }
        }

        if !validation.allowed_extensions.is_empty() {
            let extension = name
                .rsplit_once('.')
                .map(|(_, ext)| ext.to_lowercase())
                .unwrap_or_default();
            let allowed = validation
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.trim_start_matches('.').to_lowercase() == extension);
            if !allowed {
                return Some(format!("不允许的文件类型: {}", name));
            }
        }

        if let Some(size) = size {
            if size == 0 && !validation.allow_empty {
                return Some(format!("文件为空: {}", name));
            }
            if validation.size_limit > 0 && size > validation.size_limit {
                return Some(format!(
                    "文件过大: {} bytes (上限 {} bytes)",
                    size, validation.size_limit
                ));
            }
            if size < validation.min_size_limit {
                return Some(format!(
                    "文件过小: {} bytes (下限 {} bytes)",
                    size, validation.min_size_limit
                ));
            }
        }

        None
    }

    fn chunking_applies(&self, size: u64) -> bool {
        let chunking = &self.inner.config.chunking;
        chunking.enabled && should_chunk(size, chunking.part_size, chunking.mandatory)
    }

    /// 已有的传输方式是否与当前大小不符（分片数或是否分片发生变化）
    fn plan_outdated(&self, transfer: Option<&Transfer>, size: u64) -> bool {
        let chunked = self.chunking_applies(size);
        match transfer {
            None => false,
            Some(Transfer::Whole) => chunked,
            Some(Transfer::Chunked(transfer)) => {
                let expected = total_parts(size, self.inner.config.chunking.part_size).max(1);
                !chunked || transfer.total_parts() != expected
            }
        }
    }

    /// 查找并采用断点记录（每个文件只查找一次）
    fn attach_resume_record(&self, state: &mut ManagerState, id: FileId) {
        let config = &self.inner.config;
        let Some(store) = &self.inner.resume else {
            return;
        };

        let (key, size) = {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if entry.resume_checked {
                return;
            }
            let Some(size) = entry.file.size else {
                return;
            };
            entry.resume_checked = true;
            if !self.chunking_applies(size) {
                return;
            }

            let mut custom_keys = config.resume.custom_keys.clone();
            custom_keys.extend(entry.resume_keys.iter().cloned());
            let key = store.key_for(
                &entry.file.name,
                size,
                config.chunking.part_size,
                &config.request.endpoint,
                &custom_keys,
            );
            entry.resume_key = Some(key.clone());
            (key, size)
        };

        let record = match store.load(&key) {
            Ok(record) => record,
            Err(e) => {
                warn!("读取断点记录失败: key={}, 错误: {}", key, e);
                None
            }
        };
        let Some(record) = record else {
            return;
        };

        let collides = state
            .files
            .iter()
            .any(|(other, e)| *other != id && e.file.uuid == record.uuid);

        let Some(entry) = state.files.get_mut(&id) else {
            return;
        };

        if collides {
            warn!(
                "断点记录的 UUID {} 已被当前会话中的其他文件使用, 文件 {} 不可续传",
                record.uuid, id
            );
            entry.resumable = false;
            return;
        }

        if record.size != size || record.total_parts != total_parts(size, config.chunking.part_size) {
            debug!("断点记录与文件不匹配, 忽略: key={}", key);
            return;
        }

        info!(
            "找到断点记录: 文件 {} ({}), uuid={}, 已完成 {}/{} 个分片",
            id,
            entry.file.name,
            record.uuid,
            record.chunking.completed_count(record.total_parts),
            record.total_parts
        );
        entry.file.uuid = record.uuid.clone();
        entry.file.key = record.key.clone();
        entry.file.uploaded_bytes = record.loaded;
        entry.transfer = Some(Transfer::Chunked(ChunkedTransfer::from_record(
            &record,
            config.chunking.part_size,
        )));
        entry.announce_resume = true;
    }

    // ========================================================================
    // 状态
    // ========================================================================

    fn set_status(&self, entry: &mut FileEntry, new_status: UploadStatus) {
        let old_status = entry.file.status;
        entry.file.status = new_status;
        self.notify_status(entry, old_status);
    }

    fn notify_status(&self, entry: &FileEntry, old_status: UploadStatus) {
        let new_status = entry.file.status;
        if old_status == new_status {
            return;
        }
        debug!("文件 {} 状态变更: {} -> {}", entry.file.id, old_status, new_status);
        self.emit(UploadEvent::StatusChanged {
            file_id: entry.file.id,
            old_status,
            new_status,
        });
    }

    pub fn status(&self, id: FileId) -> Option<UploadStatus> {
        self.inner.state.lock().files.get(&id).map(|e| e.file.status)
    }

    pub fn uuid(&self, id: FileId) -> Option<String> {
        self.inner
            .state
            .lock()
            .files
            .get(&id)
            .map(|e| e.file.uuid.clone())
    }

    pub fn file_info(&self, id: FileId) -> Option<UploadFileInfo> {
        self.inner
            .state
            .lock()
            .files
            .get(&id)
            .map(|e| UploadFileInfo::from(&e.file))
    }

    /// 按提交顺序返回所有文件
    pub fn files(&self) -> Vec<UploadFileInfo> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.files.get(id))
            .map(|e| UploadFileInfo::from(&e.file))
            .collect()
    }

    /// 分片进度（未分片或尚未开始时为 None）
    pub fn chunking_state(&self, id: FileId) -> Option<ChunkingState> {
        let state = self.inner.state.lock();
        match state.files.get(&id)?.transfer.as_ref()? {
            Transfer::Chunked(transfer) => Some(transfer.state.clone()),
            Transfer::Whole => None,
        }
    }

    /// 文件是否存在且仍有效（未被拒绝、取消或删除）
    pub fn is_valid(&self, id: FileId) -> bool {
        self.status(id).map_or(false, |status| {
            !matches!(
                status,
                UploadStatus::Rejected | UploadStatus::Canceled | UploadStatus::Deleted
            )
        })
    }

    /// 文件是否可以断点续传
    pub fn is_resumable(&self, id: FileId) -> bool {
        if self.inner.resume.is_none() {
            return false;
        }
        let state = self.inner.state.lock();
        let Some(entry) = state.files.get(&id) else {
            return false;
        };
        if !entry.resumable {
            return false;
        }
        match &entry.transfer {
            Some(Transfer::Chunked(_)) => true,
            Some(Transfer::Whole) => false,
            None => entry
                .file
                .size
                .map_or(self.inner.config.chunking.enabled, |size| {
                    self.chunking_applies(size)
                }),
        }
    }

    /// 列出存储中可续传、且未被当前会话使用的记录
    pub fn get_resumable_files_data(&self) -> UploaderResult<Vec<ResumableFile>> {
        let Some(store) = &self.inner.resume else {
            return Ok(Vec::new());
        };
        let in_use: HashSet<String> = self
            .inner
            .state
            .lock()
            .files
            .values()
            .map(|e| e.file.uuid.clone())
            .collect();
        store.resumable_files(&in_use)
    }

    // ========================================================================
    // 上传控制
    // ========================================================================

    /// 开始上传已提交的文件
    pub fn upload(&self, id: FileId) -> UploaderResult<()> {
        let mut state = self.inner.state.lock();
        let status = state
            .files
            .get(&id)
            .map(|e| e.file.status)
            .ok_or(UploaderError::UnknownFile(id))?;
        if status != UploadStatus::Submitted {
            debug!("文件 {} 状态为 {}, 忽略上传请求", id, status);
            return Ok(());
        }
        self.upload_or_queue(&mut state, id);
        Ok(())
    }

    /// 开始上传所有已提交的文件
    ///
    /// # 返回
    /// 开始（或进入等待）的文件数
    pub fn upload_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        let submitted: Vec<FileId> = state
            .order
            .iter()
            .copied()
            .filter(|id| {
                state
                    .files
                    .get(id)
                    .map_or(false, |e| e.file.status == UploadStatus::Submitted)
            })
            .collect();
        for id in &submitted {
            self.upload_or_queue(&mut state, *id);
        }
        info!("批量上传: {} 个文件", submitted.len());
        submitted.len()
    }

    /// 暂停上传（仅分片上传且启用断点续传时可用）
    pub fn pause(&self, id: FileId) -> bool {
        let mut state = self.inner.state.lock();
        let resume_enabled = self.inner.resume.is_some();
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return false;
            };
            if !entry.file.status.is_active() {
                debug!("文件 {} 状态为 {}, 无法暂停", id, entry.file.status);
                return false;
            }
            if !resume_enabled || entry.chunked_mut().is_none() {
                warn!("文件 {} 未分片上传或未启用断点续传, 无法暂停", id);
                return false;
            }

            if let Some(token) = entry.retry_token.take() {
                token.cancel();
            }
            self.abort_active(entry);
            entry.generation += 1;
            if let Some(transfer) = entry.chunked_mut() {
                transfer.fold_for_pause();
            }
            self.set_status(entry, UploadStatus::Paused);
            self.persist_resume(entry);
            info!("文件 {} 已暂停", id);
        }
        self.release_slot(&mut state, id, false);
        true
    }

    /// 继续已暂停的上传
    pub fn continue_upload(&self, id: FileId) -> bool {
        let mut state = self.inner.state.lock();
        match state.files.get(&id) {
            Some(entry) if entry.file.status == UploadStatus::Paused => {}
            _ => return false,
        }
        info!("继续上传文件 {}", id);
        self.upload_or_queue(&mut state, id);
        true
    }

    /// 手动重试失败的上传（重置自动重试计数）
    pub fn retry(&self, id: FileId) -> bool {
        let mut state = self.inner.state.lock();
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return false;
            };
            if entry.file.status != UploadStatus::UploadFailed {
                return false;
            }
            if entry.retry_forbidden {
                warn!("服务器禁止重试文件 {}", id);
                return false;
            }
            entry.attempts = 0;
            entry.file.error = None;
        }
        info!("手动重试文件 {}", id);
        self.upload_or_queue(&mut state, id);
        true
    }

    /// 取消上传
    pub fn cancel(&self, id: FileId) -> bool {
        let mut state = self.inner.state.lock();
        self.cancel_locked(&mut state, id, false)
    }

    /// 取消所有上传（释放槽位时不晋升等待文件）
    pub fn cancel_all(&self) -> usize {
        let mut state = self.inner.state.lock();
        let ids = state.order.clone();
        let canceled = ids
            .into_iter()
            .filter(|id| self.cancel_locked(&mut state, *id, true))
            .count();
        info!("已取消 {} 个上传", canceled);
        canceled
    }

    /// 取消并移除文件
    pub fn expunge(&self, id: FileId) -> UploaderResult<()> {
        let mut state = self.inner.state.lock();
        if !state.files.contains_key(&id) {
            return Err(UploaderError::UnknownFile(id));
        }
        self.cancel_locked(&mut state, id, false);
        if let Some(entry) = state.files.remove(&id) {
            entry.file.blob.release();
        }
        state.order.retain(|f| *f != id);
        debug!("文件 {} 已移除", id);
        Ok(())
    }

    /// 取消所有上传并清空会话
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.batch_active = false;
        let ids = state.order.clone();
        for id in ids {
            self.cancel_locked(&mut state, id, true);
        }
        for entry in state.files.values() {
            entry.file.blob.release();
        }
        state.files.clear();
        state.order.clear();
        state.batch_active = false;
        drop(state);

        self.inner.budget.reset();
        info!("上传管理器已重置");
    }

    fn cancel_locked(&self, state: &mut ManagerState, id: FileId, suppress_promotion: bool) -> bool {
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return false;
            };
            if entry.file.status.is_settled() || entry.file.status == UploadStatus::Deleting {
                return false;
            }
            if let Some(token) = entry.retry_token.take() {
                token.cancel();
            }
            self.abort_active(entry);
            entry.generation += 1;
            if let Some(transfer) = entry.chunked_mut() {
                transfer.cache.clear();
            }
            self.remove_resume(entry);
            self.set_status(entry, UploadStatus::Canceled);
            info!("文件 {} 已取消", id);
        }
        self.release_slot(state, id, suppress_promotion);
        self.check_all_complete(state);
        true
    }

    /// 申请整文件槽位，成功则开始上传，否则进入等待
    fn upload_or_queue(&self, state: &mut ManagerState, id: FileId) {
        if self.inner.budget.open(id, None) {
            self.start(state, id);
        } else if let Some(entry) = state.files.get_mut(&id) {
            info!("文件 {} 等待连接槽位", id);
            self.set_status(entry, UploadStatus::Queued);
            state.batch_active = true;
        }
    }

    /// 开始一次上传尝试（调用方已获得整文件槽位）
    fn start(&self, state: &mut ManagerState, id: FileId) {
        let Some(entry) = state.files.get_mut(&id) else {
            self.inner.budget.free(id, true);
            return;
        };

        entry.generation += 1;
        let generation = entry.generation;
        if let Some(token) = entry.retry_token.take() {
            token.cancel();
        }
        if let Some(transfer) = entry.chunked_mut() {
            transfer.begin_attempt();
        }
        self.set_status(entry, UploadStatus::Uploading);
        state.batch_active = true;

        // 确定文件大小（代理数据在此生成）
        let blob = entry.file.blob.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            let result = blob.materialize().await;
            manager.on_prepared(id, generation, result);
        });
    }

    fn on_prepared(&self, id: FileId, generation: u64, result: anyhow::Result<u64>) {
        let mut state = self.inner.state.lock();

        let needs_plan = {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if entry.generation != generation || entry.file.status != UploadStatus::Uploading {
                debug!("丢弃文件 {} 过期的准备结果", id);
                return;
            }
            match result {
                Ok(size) => {
                    entry.file.size = Some(size);
                    if self.plan_outdated(entry.transfer.as_ref(), size) {
                        info!("文件 {} 大小变为 {} bytes, 丢弃原有分片进度并重新规划", id, size);
                        self.remove_resume(entry);
                        entry.transfer = None;
                        entry.resume_key = None;
                        entry.resume_checked = false;
                        entry.announce_resume = false;
                        entry.file.uploaded_bytes = 0;
                    }
                    entry.transfer.is_none()
                }
                Err(e) => {
                    error!("读取文件 {} 失败: {:#}", id, e);
                    self.fail(
                        &mut state,
                        id,
                        UploadResponse::failure(Some(format!("读取文件失败: {:#}", e))),
                    );
                    return;
                }
            }
        };

        if needs_plan {
            self.attach_resume_record(&mut state, id);
        }

        let Some(entry) = state.files.get_mut(&id) else {
            return;
        };
        let size = entry.file.size.unwrap_or(0);
        if entry.transfer.is_none() {
            let part_size = self.inner.config.chunking.part_size;
            entry.transfer = Some(if self.chunking_applies(size) {
                let transfer = ChunkedTransfer::new(size, part_size);
                info!(
                    "文件 {} 分片上传: 大小={} bytes, 分片大小={} bytes, 分片数={}",
                    id,
                    size,
                    part_size,
                    transfer.total_parts()
                );
                Transfer::Chunked(transfer)
            } else {
                debug!("文件 {} 整文件上传: 大小={} bytes", id, size);
                Transfer::Whole
            });
        }

        if entry.announce_resume {
            entry.announce_resume = false;
            if let Some(Transfer::Chunked(transfer)) = &entry.transfer {
                let total = transfer.total_parts();
                self.emit(UploadEvent::Resume {
                    file_id: id,
                    completed_parts: transfer.state.completed_count(total),
                    total_parts: total,
                });
            }
        }

        self.pump(&mut state, id);
    }

    // ========================================================================
    // 请求调度
    // ========================================================================

    fn pump(&self, state: &mut ManagerState, id: FileId) {
        let finished = match state.files.get_mut(&id) {
            Some(entry) => self.pump_entry(entry),
            None => None,
        };
        if let Some(response) = finished {
            self.complete_success(state, id, response);
        }
    }

    /// 在预算允许时连续派发分片
    ///
    /// # 返回
    /// 所有分片完成且未配置合并端点时，返回最后一个分片的响应作为最终结果
    fn pump_entry(&self, entry: &mut FileEntry) -> Option<UploadResponse> {
        if entry.file.status != UploadStatus::Uploading || entry.file.size.is_none() {
            return None;
        }
        let id = entry.file.id;
        let concurrent = self.inner.config.chunking.concurrent;

        if matches!(entry.transfer, Some(Transfer::Whole)) {
            if entry.active.is_empty() {
                self.dispatch(entry, RequestKind::Whole);
            }
            return None;
        }

        loop {
            let step = match &entry.transfer {
                Some(Transfer::Chunked(transfer)) => transfer.peek_next(concurrent),
                _ => return None,
            };

            match step {
                PumpStep::Dispatch(index) => {
                    if !self.inner.budget.open(id, Some(index)) {
                        debug!("连接额度不足, 文件 {} 分片 #{} 等待", id, index);
                        break;
                    }
                    if let Some(transfer) = entry.chunked_mut() {
                        transfer.take(index);
                    }
                    self.dispatch(entry, RequestKind::Chunk(index));
                }
                PumpStep::Finalize => {
                    let size = entry.file.size.unwrap_or(0);
                    let has_finalize = self.inner.finalize_sender.is_some();
                    let transfer = entry.chunked_mut()?;
                    if has_finalize {
                        transfer.mark_finalizing();
                        info!("文件 {} 所有分片已确认, 发送合并请求", id);
                        self.dispatch(entry, RequestKind::Finalize);
                        break;
                    }
                    if let Some(response) = transfer.take_last_response() {
                        transfer.mark_finalizing();
                        return Some(response);
                    }
                    // 断点记录中分片已全部确认，但本会话没有可用的服务器响应
                    let last = transfer.reopen_last_part(size);
                    info!("文件 {} 没有分片响应可作为最终结果, 重新上传分片 #{}", id, last);
                }
                PumpStep::Idle => break,
            }
        }
        None
    }

    /// 登记在途请求并启动请求任务
    fn dispatch(&self, entry: &mut FileEntry, kind: RequestKind) {
        let id = entry.file.id;
        let seq = self.inner.request_seq.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("{}:{}:{}", id, kind.label(), seq);
        entry.active.insert(request_id.clone(), kind);

        let size = entry.file.size.unwrap_or(0);
        let (range, cached) = match kind {
            RequestKind::Whole => (Some(0..size), None),
            RequestKind::Chunk(index) => match &entry.transfer {
                Some(Transfer::Chunked(transfer)) => (
                    Some(transfer.descriptor(index, size).range()),
                    transfer.cache.get(index),
                ),
                _ => (None, None),
            },
            RequestKind::Finalize => (None, None),
        };

        debug!("派发请求: {} (文件 {})", request_id, id);

        let blob = entry.file.blob.clone();
        let manager = self.clone();
        tokio::spawn(async move {
            manager
                .run_request(id, request_id, kind, range, cached, blob)
                .await;
        });
    }

    async fn run_request(
        self,
        id: FileId,
        request_id: String,
        kind: RequestKind,
        range: Option<Range<u64>>,
        cached: Option<Bytes>,
        blob: Arc<dyn BlobSource>,
    ) {
        let data = match (kind, range) {
            (RequestKind::Finalize, _) | (_, None) => None,
            (RequestKind::Chunk(index), Some(range)) if range.start == range.end => {
                warn!("文件 {} 分片 #{} 大小为 0, 不发送", id, index);
                self.on_request_done(
                    id,
                    &request_id,
                    kind,
                    Err(UploadResponse::failure(Some(format!(
                        "分片 #{} 大小为 0",
                        index
                    )))),
                );
                return;
            }
            (_, Some(range)) => match cached {
                Some(data) => Some(data),
                None => match blob.read_range(range).await {
                    Ok(data) => Some(data),
                    Err(e) => {
                        error!("读取文件 {} 数据失败: {:#}", id, e);
                        self.on_request_done(
                            id,
                            &request_id,
                            kind,
                            Err(UploadResponse::failure(Some(format!("读取文件失败: {:#}", e)))),
                        );
                        return;
                    }
                },
            },
        };

        let sent = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if !entry.active.contains_key(&request_id) {
                debug!("请求 {} 已中止, 不再发送", request_id);
                return;
            }
            if let (RequestKind::Chunk(index), Some(data)) = (kind, &data) {
                if let Some(transfer) = entry.chunked_mut() {
                    transfer.cache.insert(index, data.clone());
                }
            }
            let (sender, options) = self.build_options(entry, kind, data);
            sender.send(&request_id, options)
        };

        let outcome = match sent {
            Ok(deferred) => interpret(
                deferred.wait().await,
                &self.inner.config.retry.prevent_retry_property,
            ),
            Err(e) => {
                error!("发送请求 {} 失败: {}", request_id, e);
                Err(UploadResponse::failure(Some(e.to_string())))
            }
        };

        self.on_request_done(id, &request_id, kind, outcome);
    }

    fn build_options(
        &self,
        entry: &FileEntry,
        kind: RequestKind,
        data: Option<Bytes>,
    ) -> (RequestSender, RequestOptions) {
        let config = &self.inner.config;
        let file = &entry.file;
        let size = file.size.unwrap_or(0);

        match kind {
            RequestKind::Whole => (
                self.inner.sender.clone(),
                RequestOptions {
                    params: base_params(config, &entry.params, &file.uuid, &file.name, size),
                    body: upload_body(config, &file.name, data.unwrap_or_default()),
                    ..Default::default()
                },
            ),
            RequestKind::Chunk(index) => {
                let (chunk, resumed) = match &entry.transfer {
                    Some(Transfer::Chunked(transfer)) => {
                        (transfer.descriptor(index, size), transfer.is_resumed())
                    }
                    _ => (
                        ChunkDescriptor::compute(size, config.chunking.part_size, index, 1),
                        false,
                    ),
                };
                (
                    self.inner.sender.clone(),
                    RequestOptions {
                        params: chunk_params(
                            config,
                            &entry.params,
                            &chunk,
                            &file.uuid,
                            &file.name,
                            size,
                            resumed,
                        ),
                        body: upload_body(config, &file.name, data.unwrap_or_default()),
                        ..Default::default()
                    },
                )
            }
            RequestKind::Finalize => {
                let parts = match &entry.transfer {
                    Some(Transfer::Chunked(transfer)) => transfer.total_parts(),
                    _ => 1,
                };
                (
                    self.finalize_sender().clone(),
                    RequestOptions {
                        method: Some(HttpMethod::Post),
                        params: finalize_params(
                            config,
                            &entry.params,
                            &file.uuid,
                            &file.name,
                            size,
                            parts,
                            file.key.as_deref(),
                        ),
                        ..Default::default()
                    },
                )
            }
        }
    }

    fn finalize_sender(&self) -> &RequestSender {
        self.inner
            .finalize_sender
            .as_ref()
            .unwrap_or(&self.inner.sender)
    }

    /// 中止文件的所有在途请求
    fn abort_active(&self, entry: &mut FileEntry) {
        for (request_id, kind) in entry.active.drain() {
            let sender = match kind {
                RequestKind::Finalize => self.finalize_sender(),
                _ => &self.inner.sender,
            };
            sender.abort(&request_id);
            debug!("已中止请求: {}", request_id);
        }
    }

    fn on_request_done(
        &self,
        id: FileId,
        request_id: &str,
        kind: RequestKind,
        outcome: Result<UploadResponse, UploadResponse>,
    ) {
        let mut state = self.inner.state.lock();
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if entry.active.remove(request_id).is_none() {
                debug!("丢弃已中止请求的结果: {}", request_id);
                return;
            }
            if entry.file.status != UploadStatus::Uploading {
                debug!("文件 {} 状态为 {}, 丢弃请求结果", id, entry.file.status);
                return;
            }
        }

        match (kind, outcome) {
            (RequestKind::Whole, Ok(response)) | (RequestKind::Finalize, Ok(response)) => {
                self.complete_success(&mut state, id, response)
            }
            (RequestKind::Whole, Err(response)) => self.fail(&mut state, id, response),
            (RequestKind::Chunk(index), Ok(response)) => {
                self.chunk_succeeded(&mut state, id, index, response)
            }
            (RequestKind::Chunk(index), Err(response)) => {
                self.chunk_failed(&mut state, id, index, response)
            }
            (RequestKind::Finalize, Err(response)) => {
                warn!("文件 {} 合并请求失败: {}", id, response.error_message());
                if let Some(transfer) = state.files.get_mut(&id).and_then(|e| e.chunked_mut()) {
                    transfer.clear_finalizing();
                }
                self.fail(&mut state, id, response)
            }
        }
    }

    fn chunk_succeeded(
        &self,
        state: &mut ManagerState,
        id: FileId,
        index: usize,
        response: UploadResponse,
    ) {
        self.inner.budget.close_chunk(id, index);

        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            let size = entry.file.size.unwrap_or(0);
            let new_uuid = response.new_uuid.clone();
            let key = response.key.clone();

            let Some(transfer) = entry.chunked_mut() else {
                return;
            };
            let chunk = transfer.descriptor(index, size);
            let total = transfer.total_parts();
            transfer.on_success(index, chunk.size, response);
            let loaded = transfer.loaded();

            if let Some(new_uuid) = new_uuid {
                info!("服务器要求替换文件 {} 的 UUID: {} -> {}", id, entry.file.uuid, new_uuid);
                entry.file.uuid = new_uuid;
            }
            if key.is_some() {
                entry.file.key = key;
            }
            entry.file.uploaded_bytes = loaded;
            self.persist_resume(entry);

            self.emit(UploadEvent::ChunkSuccess {
                file_id: id,
                part_index: index,
                total_parts: total,
            });
            if entry.throttler.should_emit() || loaded >= size {
                self.emit(UploadEvent::Progress {
                    file_id: id,
                    uploaded_bytes: loaded,
                    total_bytes: size,
                });
            }
        }

        self.pump(state, id);
    }

    fn chunk_failed(
        &self,
        state: &mut ManagerState,
        id: FileId,
        index: usize,
        response: UploadResponse,
    ) {
        self.inner.budget.close_chunk(id, index);

        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            let Some(transfer) = entry.chunked_mut() else {
                return;
            };
            if transfer.on_failure(index, response.reset) == FailureAction::Ignored {
                debug!("文件 {} 分片 #{} 失败已忽略（本次尝试已失败）", id, index);
                return;
            }

            warn!(
                "文件 {} 分片 #{} 上传失败: {}",
                id,
                index,
                response.error_message()
            );

            // 同一文件的其余分片全部中止，槽位释放（保留整文件槽位）
            self.abort_active(entry);
            self.inner.budget.close_chunks(id);

            if response.reset {
                entry.file.uploaded_bytes = 0;
                self.remove_resume(entry);
            } else {
                self.persist_resume(entry);
            }
        }

        self.fail(state, id, response);
    }

    /// 重试决策：自动重试或进入最终失败
    fn fail(&self, state: &mut ManagerState, id: FileId, response: UploadResponse) {
        let retry = &self.inner.config.retry;
        let message = response.error_message();

        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if response.prevent_retry {
                entry.retry_forbidden = true;
            }
            entry.file.error = Some(message.clone());

            let can_auto_retry = retry.enable_auto
                && entry.attempts < retry.max_auto_attempts
                && !entry.retry_forbidden
                && entry.file.status != UploadStatus::Paused;

            if can_auto_retry {
                entry.attempts += 1;
                let attempt = entry.attempts;
                warn!(
                    "文件 {} 上传失败: {}, {} 秒后第 {} 次自动重试",
                    id, message, retry.auto_attempt_delay_secs, attempt
                );
                self.set_status(entry, UploadStatus::UploadRetrying);
                self.emit(UploadEvent::AutoRetry {
                    file_id: id,
                    attempt,
                });

                let token = CancellationToken::new();
                entry.retry_token = Some(token.clone());
                let generation = entry.generation;
                let delay = Duration::from_secs(retry.auto_attempt_delay_secs);
                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => manager.on_retry_timer(id, generation),
                    }
                });
                return;
            }

            error!("文件 {} 上传失败: {}", id, message);
            let old_status = entry.file.status;
            entry.file.mark_failed(message.clone());
            self.notify_status(entry, old_status);
        }

        self.release_slot(state, id, false);
        self.emit(UploadEvent::Complete {
            file_id: id,
            success: false,
            error: Some(message),
        });
        self.check_all_complete(state);
    }

    fn on_retry_timer(&self, id: FileId, generation: u64) {
        let mut state = self.inner.state.lock();
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if entry.generation != generation || entry.file.status != UploadStatus::UploadRetrying {
                return;
            }
            entry.retry_token = None;
            info!("文件 {} 开始第 {} 次自动重试", id, entry.attempts);
        }

        if self.inner.budget.is_open(id) || self.inner.budget.open(id, None) {
            self.start(&mut state, id);
        } else if let Some(entry) = state.files.get_mut(&id) {
            self.set_status(entry, UploadStatus::Queued);
        }
    }

    fn complete_success(&self, state: &mut ManagerState, id: FileId, response: UploadResponse) {
        {
            let Some(entry) = state.files.get_mut(&id) else {
                return;
            };
            if entry.file.status != UploadStatus::Uploading {
                return;
            }
            if let Some(new_uuid) = response.new_uuid {
                entry.file.uuid = new_uuid;
            }
            if response.key.is_some() {
                entry.file.key = response.key;
            }
            if response.thumbnail_url.is_some() {
                entry.file.thumbnail_url = response.thumbnail_url;
            }

            let old_status = entry.file.status;
            entry.file.mark_successful();
            self.notify_status(entry, old_status);

            if let Some(transfer) = entry.chunked_mut() {
                transfer.cache.clear();
            }
            self.remove_resume(entry);

            info!("文件 {} ({}) 上传成功", id, entry.file.name);
            self.emit(UploadEvent::Progress {
                file_id: id,
                uploaded_bytes: entry.file.uploaded_bytes,
                total_bytes: entry.file.size.unwrap_or(0),
            });
        }

        self.release_slot(state, id, false);
        self.emit(UploadEvent::Complete {
            file_id: id,
            success: true,
            error: None,
        });
        self.check_all_complete(state);
    }

    /// 释放文件的全部额度并启动被晋升的等待文件
    fn release_slot(&self, state: &mut ManagerState, id: FileId, suppress_promotion: bool) {
        let promoted = self.inner.budget.free(id, suppress_promotion);
        if let Some(entry) = state.files.get(&id) {
            if entry.file.blob.is_proxy() {
                entry.file.blob.release();
            }
        }

        let mut queue: VecDeque<FileId> = promoted.into();
        while let Some(next) = queue.pop_front() {
            let queued = state
                .files
                .get(&next)
                .map_or(false, |e| e.file.status == UploadStatus::Queued);
            if queued {
                info!("文件 {} 获得连接槽位, 开始上传", next);
                self.start(state, next);
            } else {
                queue.extend(self.inner.budget.free(next, false));
            }
        }
    }

    fn check_all_complete(&self, state: &mut ManagerState) {
        if !state.batch_active {
            return;
        }
        let pending = state.files.values().any(|e| {
            matches!(
                e.file.status,
                UploadStatus::Queued | UploadStatus::Uploading | UploadStatus::UploadRetrying
            )
        });
        if pending {
            return;
        }
        state.batch_active = false;

        let with_status = |status: UploadStatus| -> Vec<FileId> {
            state
                .order
                .iter()
                .copied()
                .filter(|id| state.files.get(id).map_or(false, |e| e.file.status == status))
                .collect()
        };
        let succeeded = with_status(UploadStatus::UploadSuccessful);
        let failed = with_status(UploadStatus::UploadFailed);

        info!(
            "本批次上传结束: 成功 {} 个, 失败 {} 个",
            succeeded.len(),
            failed.len()
        );
        self.emit(UploadEvent::AllComplete { succeeded, failed });
    }

    // ========================================================================
    // 断点记录
    // ========================================================================

    fn persist_resume(&self, entry: &FileEntry) {
        let (Some(store), Some(key)) = (&self.inner.resume, &entry.resume_key) else {
            return;
        };
        if !entry.resumable {
            return;
        }
        let (Some(Transfer::Chunked(transfer)), Some(size)) = (&entry.transfer, entry.file.size)
        else {
            return;
        };
        let record = transfer.to_record(
            &entry.file.name,
            size,
            &entry.file.uuid,
            entry.file.key.as_deref(),
        );
        if let Err(e) = store.persist(key, &record) {
            warn!("保存断点记录失败: key={}, 错误: {}", key, e);
        }
    }

    fn remove_resume(&self, entry: &FileEntry) {
        let (Some(store), Some(key)) = (&self.inner.resume, &entry.resume_key) else {
            return;
        };
        if !entry.resumable {
            return;
        }
        if let Err(e) = store.remove(key) {
            warn!("删除断点记录失败: key={}, 错误: {}", key, e);
        }
    }

    // ========================================================================
    // 删除
    // ========================================================================

    /// 删除已上传的文件
    ///
    /// # 返回
    /// 是否已发出删除请求（文件不处于可删除状态时返回 false）
    pub fn delete_file(&self, id: FileId) -> UploaderResult<bool> {
        let Some(sender) = &self.inner.delete_sender else {
            return Err(UploaderError::InvalidConfig("未启用删除请求".to_string()));
        };
        let config = &self.inner.config;

        let (request_id, options) = {
            let mut state = self.inner.state.lock();
            let entry = state
                .files
                .get_mut(&id)
                .ok_or(UploaderError::UnknownFile(id))?;
            if !matches!(
                entry.file.status,
                UploadStatus::UploadSuccessful | UploadStatus::DeleteFailed
            ) {
                debug!("文件 {} 状态为 {}, 无法删除", id, entry.file.status);
                return Ok(false);
            }
            self.set_status(entry, UploadStatus::Deleting);

            let delete = &config.delete_file;
            let mut params: Vec<(String, String)> = delete
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            params.sort();
            params.push((config.request.uuid_name.clone(), entry.file.uuid.clone()));

            let mut headers = HashMap::new();
            if delete.method == HttpMethod::Post {
                headers.insert("X-HTTP-Method-Override".to_string(), "DELETE".to_string());
            }

            let seq = self.inner.request_seq.fetch_add(1, Ordering::Relaxed);
            (
                format!("{}:delete:{}", id, seq),
                RequestOptions {
                    method: Some(delete.method),
                    params,
                    headers,
                    path_suffix: Some(entry.file.uuid.clone()),
                    ..Default::default()
                },
            )
        };

        info!("删除文件 {}: 请求 {}", id, request_id);
        let deferred = match sender.send(&request_id, options) {
            Ok(deferred) => deferred,
            Err(e) => {
                self.on_delete_done(id, false);
                return Err(e);
            }
        };

        let manager = self.clone();
        tokio::spawn(async move {
            let success = match deferred.wait().await {
                Ok(_) => true,
                Err(failure) => {
                    warn!("删除文件 {} 失败: {}", id, failure.message);
                    false
                }
            };
            manager.on_delete_done(id, success);
        });

        Ok(true)
    }

    fn on_delete_done(&self, id: FileId, success: bool) {
        let mut state = self.inner.state.lock();
        let Some(entry) = state.files.get_mut(&id) else {
            return;
        };
        if entry.file.status != UploadStatus::Deleting {
            return;
        }
        let status = if success {
            UploadStatus::Deleted
        } else {
            UploadStatus::DeleteFailed
        };
        self.set_status(entry, status);
        self.emit(UploadEvent::DeleteComplete {
            file_id: id,
            success,
        });
    }
}
