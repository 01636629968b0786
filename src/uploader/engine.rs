// 分片上传引擎
//
// 单个文件一次分片传输的状态机，不做任何 IO：
// - 管理器在持有状态锁时调用 peek_next / take 取出下一个分片并发送
// - 分片确认后 on_success 累计字节、丢弃缓存，全部完成时返回 true
// - 同一次尝试中只有第一个失败会交给重试决策，之后的失败直接丢弃
//
// 另外负责构建上传、分片、合并请求的参数与请求体。

use crate::config::UploaderConfig;
use crate::persistence::ResumeRecord;
use crate::transport::{FailureKind, HttpResponse, RequestBody, RequestFailure, UploadResponse};
use crate::uploader::chunk::{total_parts, ChunkCache, ChunkDescriptor, ChunkingState};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};

/// 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// 整文件上传
    Whole,
    /// 单个分片
    Chunk(usize),
    /// 所有分片完成后的合并请求
    Finalize,
}

impl RequestKind {
    /// 用于请求 ID 的标签
    pub fn label(&self) -> String {
        match self {
            RequestKind::Whole => "whole".to_string(),
            RequestKind::Chunk(index) => format!("part{}", index),
            RequestKind::Finalize => "finalize".to_string(),
        }
    }
}

/// pump 循环的下一步
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpStep {
    /// 发送指定分片
    Dispatch(usize),
    /// 所有分片已确认，执行合并
    Finalize,
    /// 暂无可做的事
    Idle,
}

/// 分片失败的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// 本次尝试的第一个失败：中止其余分片，交给重试决策
    HandOff,
    /// 本次尝试已失败过，忽略
    Ignored,
}

/// 单个文件的分片传输
#[derive(Debug)]
pub struct ChunkedTransfer {
    part_size: u64,
    total_parts: usize,
    /// 分片进度
    pub state: ChunkingState,
    /// 分片数据缓存
    pub cache: ChunkCache,
    /// 已确认字节数
    loaded: u64,
    /// 是否从断点记录恢复
    resumed: bool,
    /// 本次尝试已失败，后续失败忽略
    ignore_failure: bool,
    /// 合并中（避免重复发起）
    finalizing: bool,
    /// 最近一个分片的响应（未配置合并端点时作为最终结果）
    last_response: Option<UploadResponse>,
}

impl ChunkedTransfer {
    /// 创建全新分片传输
    pub fn new(file_size: u64, part_size: u64) -> Self {
        let total = total_parts(file_size, part_size).max(1);
        Self {
            part_size,
            total_parts: total,
            state: ChunkingState::new(total),
            cache: ChunkCache::default(),
            loaded: 0,
            resumed: false,
            ignore_failure: false,
            finalizing: false,
            last_response: None,
        }
    }

    /// 从断点记录恢复（上传中的分片放回待上传队首）
    pub fn from_record(record: &ResumeRecord, part_size: u64) -> Self {
        Self {
            part_size,
            total_parts: record.total_parts,
            state: record.resumable_state(),
            cache: ChunkCache::default(),
            loaded: record.loaded,
            resumed: true,
            ignore_failure: false,
            finalizing: false,
            last_response: None,
        }
    }

    pub fn total_parts(&self) -> usize {
        self.total_parts
    }

    pub fn loaded(&self) -> u64 {
        self.loaded
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// 新一次尝试开始
    pub fn begin_attempt(&mut self) {
        self.ignore_failure = false;
        self.finalizing = false;
    }

    /// 按当前文件大小计算分片
    pub fn descriptor(&self, index: usize, file_size: u64) -> ChunkDescriptor {
        ChunkDescriptor::compute(file_size, self.part_size, index, self.total_parts)
    }

    /// 查看下一步（不修改状态）
    ///
    /// # 参数
    /// * `concurrent` - 是否允许同一文件多个分片同时在途
    pub fn peek_next(&self, concurrent: bool) -> PumpStep {
        if self.state.is_done() {
            return if self.finalizing {
                PumpStep::Idle
            } else {
                PumpStep::Finalize
            };
        }
        if self.ignore_failure {
            return PumpStep::Idle;
        }
        match self.state.remaining.front() {
            Some(index) if concurrent || self.state.in_progress.is_empty() => {
                PumpStep::Dispatch(*index)
            }
            _ => PumpStep::Idle,
        }
    }

    /// 取出分片并标记为上传中
    pub fn take(&mut self, index: usize) -> bool {
        if self.state.remaining.front() != Some(&index) {
            return false;
        }
        self.state.next();
        true
    }

    /// 标记进入合并阶段
    pub fn mark_finalizing(&mut self) {
        self.finalizing = true;
    }

    /// 合并失败后允许再次合并
    pub fn clear_finalizing(&mut self) {
        self.finalizing = false;
    }

    /// 分片确认
    ///
    /// # 返回
    /// 所有分片是否均已确认
    pub fn on_success(&mut self, index: usize, size: u64, response: UploadResponse) -> bool {
        if self.state.complete(index) {
            self.loaded += size;
        }
        self.cache.remove(index);
        self.last_response = Some(response);
        debug!(
            "分片 #{} 已确认, 剩余 {} 个, 上传中 {} 个",
            index,
            self.state.remaining.len(),
            self.state.in_progress.len()
        );
        self.state.is_done()
    }

    /// 分片失败
    ///
    /// # 参数
    /// * `index` - 失败的分片
    /// * `reset` - 服务器要求丢弃进度并从第一个分片重新开始
    pub fn on_failure(&mut self, index: usize, reset: bool) -> FailureAction {
        self.cache.remove(index);

        if self.ignore_failure {
            self.state.requeue(index);
            return FailureAction::Ignored;
        }

        if reset {
            info!("服务器要求重置分片进度, 从分片 #0 重新开始");
            self.restart();
        } else if !self.state.in_progress.contains(&index) {
            self.state.requeue(index);
        }

        // 失败分片与其余上传中分片一起按索引顺序放回队首
        self.ignore_failure = true;
        self.state.fold_in_progress();
        FailureAction::HandOff
    }

    /// 丢弃所有进度，从第一个分片重新开始
    pub fn restart(&mut self) {
        self.state = ChunkingState::new(self.total_parts);
        self.cache.clear();
        self.loaded = 0;
        self.resumed = false;
        self.finalizing = false;
        self.last_response = None;
    }

    /// 暂停：上传中的分片放回待上传，清空缓存
    pub fn fold_for_pause(&mut self) {
        self.state.fold_in_progress();
        self.cache.clear();
        self.finalizing = false;
    }

    /// 最后一个分片放回待上传队列并扣除其字节数
    ///
    /// 断点记录显示所有分片已确认、但本次会话没有任何分片响应时使用
    ///
    /// # 返回
    /// 被放回的分片索引
    pub fn reopen_last_part(&mut self, file_size: u64) -> usize {
        let last = self.total_parts.saturating_sub(1);
        let chunk = self.descriptor(last, file_size);
        self.loaded = self.loaded.saturating_sub(chunk.size);
        self.state.requeue(last);
        self.finalizing = false;
        last
    }

    pub fn take_last_response(&mut self) -> Option<UploadResponse> {
        self.last_response.take()
    }

    /// 生成断点记录
    pub fn to_record(
        &self,
        name: &str,
        size: u64,
        uuid: &str,
        key: Option<&str>,
    ) -> ResumeRecord {
        ResumeRecord {
            name: name.to_string(),
            size,
            uuid: uuid.to_string(),
            key: key.map(|k| k.to_string()),
            chunking: self.state.clone(),
            loaded: self.loaded,
            total_parts: self.total_parts,
            last_updated: Utc::now(),
        }
    }
}

// ============================================================================
// 请求参数
// ============================================================================

/// 所有上传请求共有的参数：静态参数 + 文件参数 + UUID / 文件名 / 总大小
pub fn base_params(
    config: &UploaderConfig,
    extra: &[(String, String)],
    uuid: &str,
    name: &str,
    file_size: u64,
) -> Vec<(String, String)> {
    let request = &config.request;

    let mut params: Vec<(String, String)> = request
        .params
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    params.sort();
    params.extend(extra.iter().cloned());

    params.push((request.uuid_name.clone(), uuid.to_string()));
    params.push((request.filename_param.clone(), name.to_string()));
    params.push((request.total_file_size_name.clone(), file_size.to_string()));
    params
}

/// 分片请求参数
pub fn chunk_params(
    config: &UploaderConfig,
    extra: &[(String, String)],
    chunk: &ChunkDescriptor,
    uuid: &str,
    name: &str,
    file_size: u64,
    resumed: bool,
) -> Vec<(String, String)> {
    let names = &config.chunking.param_names;

    let mut params = base_params(config, extra, uuid, name, file_size);
    params.push((names.part_index.clone(), chunk.index.to_string()));
    params.push((names.part_byte_offset.clone(), chunk.start.to_string()));
    params.push((names.chunk_size.clone(), chunk.size.to_string()));
    params.push((names.total_parts.clone(), chunk.total_parts.to_string()));
    if resumed {
        params.push((names.resuming.clone(), "true".to_string()));
    }
    params
}

/// 合并请求参数
pub fn finalize_params(
    config: &UploaderConfig,
    extra: &[(String, String)],
    uuid: &str,
    name: &str,
    file_size: u64,
    total_parts: usize,
    key: Option<&str>,
) -> Vec<(String, String)> {
    let mut params = base_params(config, extra, uuid, name, file_size);
    params.push((
        config.chunking.param_names.total_parts.clone(),
        total_parts.to_string(),
    ));
    if let Some(key) = key {
        params.push(("key".to_string(), key.to_string()));
    }
    params
}

/// 上传请求体：multipart 或原始字节流
pub fn upload_body(config: &UploaderConfig, name: &str, data: Bytes) -> RequestBody {
    if config.request.force_multipart {
        RequestBody::Multipart {
            fields: Vec::new(),
            file_field: config.request.input_name.clone(),
            file_name: name.to_string(),
            data,
        }
    } else {
        RequestBody::Raw(data)
    }
}

/// 将传输结果解析为上传响应
///
/// # 返回
/// Ok 表示请求成功且响应 `success` 为 true，否则 Err 携带失败响应
pub fn interpret(
    result: Result<HttpResponse, RequestFailure>,
    prevent_retry_property: &str,
) -> Result<UploadResponse, UploadResponse> {
    match result {
        Ok(http) => {
            let response = UploadResponse::parse(&http.body, prevent_retry_property);
            if response.success {
                Ok(response)
            } else {
                Err(response)
            }
        }
        Err(failure) => {
            let mut response = match &failure.response {
                Some(http) => UploadResponse::parse(&http.body, prevent_retry_property),
                None => UploadResponse::failure(None),
            };
            response.success = false;
            if response.error.is_none() && failure.kind == FailureKind::Transport {
                response.error = Some(failure.message);
            }
            Err(response)
        }
    }
}
