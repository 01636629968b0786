// 限流请求发送器
//
// 功能：
// - 每次调用发送一个逻辑 HTTP 请求，返回 Deferred
// - 同一发送器内最多 max_connections 个请求同时在途，其余按 FIFO 排队
// - 请求完成后自动出队并启动下一个排队请求
// - 按请求方法的成功状态码列表判定成功（旧式跨域传输无法读取状态码，完成即成功）
// - 发送前调用 on_send 钩子，结算后调用 on_complete 钩子（每个 ID 恰好一次）

use crate::common::Deferred;
use crate::error::{UploaderError, UploaderResult};
use crate::transport::backend::{HttpBackend, HttpRequest, HttpResponse};
use crate::transport::request::{
    append_query, is_simple_request, join_path, CorsConfig, HttpMethod, RequestBody,
    RequestOptions, TransportCapability,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 缓存破坏参数名
pub const CACHE_BUST_PARAM: &str = "qqtimestamp";

/// 请求失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 传输层错误（网络错误，没有可用响应）
    Transport,
    /// 状态码不在成功列表中
    Status,
    /// 排队中被取消，从未发送
    Canceled,
    /// 在途中被中止
    Aborted,
}

/// 请求失败
#[derive(Debug, Clone)]
pub struct RequestFailure {
    pub kind: FailureKind,
    /// 服务器响应（传输错误、取消、中止时为 None）
    pub response: Option<HttpResponse>,
    pub message: String,
}

impl RequestFailure {
    fn new(kind: FailureKind, response: Option<HttpResponse>, message: impl Into<String>) -> Self {
        Self {
            kind,
            response,
            message: message.into(),
        }
    }
}

pub type SendHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type CompleteHook = Arc<dyn Fn(&str, Option<&HttpResponse>, bool) + Send + Sync>;

type RequestDeferred = Deferred<HttpResponse, RequestFailure>;

/// 发送器配置
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// 默认端点
    pub endpoint: String,
    /// 默认请求方法
    pub default_method: HttpMethod,
    /// 允许的请求方法
    pub allowed_methods: Vec<HttpMethod>,
    /// 最大同时在途请求数（0 表示不限制）
    pub max_connections: usize,
    /// 参数放入请求体（仅对带请求体的方法生效）
    pub params_in_body: bool,
    /// 每个请求都携带的请求头
    pub custom_headers: HashMap<String, String>,
    /// 跨域配置
    pub cors: CorsConfig,
    /// 按方法覆盖成功状态码
    pub success_codes: HashMap<HttpMethod, Vec<u16>>,
}

impl SenderConfig {
    pub fn new(endpoint: impl Into<String>, default_method: HttpMethod) -> Self {
        Self {
            endpoint: endpoint.into(),
            default_method,
            allowed_methods: vec![default_method],
            max_connections: 0,
            params_in_body: false,
            custom_headers: HashMap::new(),
            cors: CorsConfig::default(),
            success_codes: HashMap::new(),
        }
    }

    fn success_codes_for(&self, method: HttpMethod) -> &[u16] {
        self.success_codes
            .get(&method)
            .map(|codes| codes.as_slice())
            .unwrap_or_else(|| method.default_success_codes())
    }
}

struct PendingRequest {
    method: HttpMethod,
    /// 尚未发送时保存选项，发送后置空
    options: Option<RequestOptions>,
    deferred: RequestDeferred,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct QueueState {
    /// 排队（未发送）的请求 ID，FIFO
    waiting: VecDeque<String>,
    /// 所有排队与在途请求
    requests: HashMap<String, PendingRequest>,
    /// 在途请求数
    in_flight: usize,
}

struct SenderInner {
    config: SenderConfig,
    backend: Arc<dyn HttpBackend>,
    state: Mutex<QueueState>,
    on_send: Option<SendHook>,
    on_complete: Option<CompleteHook>,
}

/// 限流请求发送器
#[derive(Clone)]
pub struct RequestSender {
    inner: Arc<SenderInner>,
}

impl std::fmt::Debug for RequestSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSender")
            .field("endpoint", &self.inner.config.endpoint)
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

impl RequestSender {
    pub fn new(config: SenderConfig, backend: Arc<dyn HttpBackend>) -> Self {
        Self::with_hooks(config, backend, None, None)
    }

    pub fn with_hooks(
        config: SenderConfig,
        backend: Arc<dyn HttpBackend>,
        on_send: Option<SendHook>,
        on_complete: Option<CompleteHook>,
    ) -> Self {
        Self {
            inner: Arc::new(SenderInner {
                config,
                backend,
                state: Mutex::new(QueueState::default()),
                on_send,
                on_complete,
            }),
        }
    }

    pub fn config(&self) -> &SenderConfig {
        &self.inner.config
    }

    /// 发送请求
    ///
    /// # 参数
    /// * `id` - 请求 ID，在排队与在途请求中必须唯一
    /// * `options` - 请求选项
    ///
    /// # 返回
    /// 以响应成功或 RequestFailure 结算的 Deferred；
    /// ID 重复或方法不允许时同步返回错误
    pub fn send(&self, id: &str, options: RequestOptions) -> UploaderResult<RequestDeferred> {
        let config = &self.inner.config;
        let method = options.method.unwrap_or(config.default_method);
        if !config.allowed_methods.contains(&method) {
            return Err(UploaderError::MethodNotAllowed(format!(
                "{} (允许: {:?})",
                method, config.allowed_methods
            )));
        }

        let deferred = RequestDeferred::new();
        let start_now = {
            let mut state = self.inner.state.lock();
            if state.requests.contains_key(id) {
                return Err(UploaderError::DuplicateRequest(id.to_string()));
            }

            let can_start = config.max_connections == 0 || state.in_flight < config.max_connections;
            let mut pending = PendingRequest {
                method,
                options: Some(options),
                deferred: deferred.clone(),
                handle: None,
            };

            let start_now = if can_start {
                state.in_flight += 1;
                pending.options.take().map(|options| (method, options))
            } else {
                state.waiting.push_back(id.to_string());
                debug!("请求排队: id={}, 排队数={}", id, state.waiting.len() + 1);
                None
            };
            state.requests.insert(id.to_string(), pending);
            start_now
        };

        if let Some((method, options)) = start_now {
            self.dispatch(id.to_string(), method, options);
        }

        Ok(deferred)
    }

    /// 取消排队中的请求；在途请求不受影响（需调用 abort）
    pub fn cancel(&self, id: &str) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            match state.waiting.iter().position(|queued| queued == id) {
                Some(pos) => {
                    state.waiting.remove(pos);
                    state.requests.remove(id)
                }
                None => None,
            }
        };

        match removed {
            Some(pending) => {
                debug!("取消排队请求: id={}", id);
                self.settle(
                    id,
                    pending.deferred,
                    Err(RequestFailure::new(FailureKind::Canceled, None, "请求已取消")),
                );
                true
            }
            None => false,
        }
    }

    /// 中止在途请求（排队中的请求等同于 cancel）
    pub fn abort(&self, id: &str) -> bool {
        if self.cancel(id) {
            return true;
        }

        let (removed, next) = {
            let mut state = self.inner.state.lock();
            match state.requests.remove(id) {
                Some(pending) => {
                    state.in_flight = state.in_flight.saturating_sub(1);
                    let next = self.take_next(&mut state);
                    (Some(pending), next)
                }
                None => (None, Vec::new()),
            }
        };

        let Some(pending) = removed else {
            return false;
        };

        if let Some(handle) = pending.handle {
            handle.abort();
        }
        debug!("中止在途请求: id={}", id);
        self.settle(
            id,
            pending.deferred,
            Err(RequestFailure::new(FailureKind::Aborted, None, "请求已中止")),
        );

        for (next_id, method, options) in next {
            self.dispatch(next_id, method, options);
        }
        true
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().in_flight
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state.lock().waiting.len()
    }

    /// 从等待队列取出可以启动的请求（调用方持有锁）
    fn take_next(&self, state: &mut QueueState) -> Vec<(String, HttpMethod, RequestOptions)> {
        let max = self.inner.config.max_connections;
        let mut next = Vec::new();

        while max == 0 || state.in_flight < max {
            let Some(next_id) = state.waiting.pop_front() else {
                break;
            };
            if let Some(pending) = state.requests.get_mut(&next_id) {
                if let Some(options) = pending.options.take() {
                    state.in_flight += 1;
                    next.push((next_id, pending.method, options));
                }
            }
        }

        next
    }

    fn dispatch(&self, id: String, method: HttpMethod, options: RequestOptions) {
        let request = self.build_request(method, options);

        if let Some(hook) = &self.inner.on_send {
            hook(&id);
        }

        debug!("发送请求: id={}, method={}, url={}", id, method, request.url);

        let sender = self.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            let result = sender.inner.backend.execute(request).await;
            sender.complete(&task_id, method, result);
        });

        let mut state = self.inner.state.lock();
        match state.requests.get_mut(&id) {
            Some(pending) => pending.handle = Some(handle),
            // 已完成或已中止
            None => drop(handle),
        }
    }

    fn complete(&self, id: &str, method: HttpMethod, result: anyhow::Result<HttpResponse>) {
        let (removed, next) = {
            let mut state = self.inner.state.lock();
            match state.requests.remove(id) {
                Some(pending) => {
                    state.in_flight = state.in_flight.saturating_sub(1);
                    let next = self.take_next(&mut state);
                    (Some(pending), next)
                }
                None => (None, Vec::new()),
            }
        };

        // 已被中止的请求不再处理
        let Some(pending) = removed else {
            return;
        };

        let outcome = match result {
            Ok(response) => {
                if self.is_success(method, &response) {
                    Ok(response)
                } else {
                    let message = format!("响应状态码 {} 不在成功列表中", response.status);
                    Err(RequestFailure::new(FailureKind::Status, Some(response), message))
                }
            }
            Err(e) => {
                warn!("请求传输失败: id={}, 错误: {:#}", id, e);
                Err(RequestFailure::new(
                    FailureKind::Transport,
                    None,
                    format!("{:#}", e),
                ))
            }
        };

        self.settle(id, pending.deferred, outcome);

        for (next_id, method, options) in next {
            self.dispatch(next_id, method, options);
        }
    }

    fn settle(
        &self,
        id: &str,
        deferred: RequestDeferred,
        outcome: Result<HttpResponse, RequestFailure>,
    ) {
        if let Some(hook) = &self.inner.on_complete {
            match &outcome {
                Ok(response) => hook(id, Some(response), false),
                Err(failure) => hook(id, failure.response.as_ref(), true),
            }
        }

        match outcome {
            Ok(response) => deferred.succeed(response),
            Err(failure) => deferred.fail(failure),
        };
    }

    fn is_success(&self, method: HttpMethod, response: &HttpResponse) -> bool {
        let config = &self.inner.config;
        match config.cors.capability {
            TransportCapability::StatusBlind => true,
            TransportCapability::Standard => {
                config.success_codes_for(method).contains(&response.status)
            }
        }
    }

    fn build_request(&self, method: HttpMethod, options: RequestOptions) -> HttpRequest {
        let config = &self.inner.config;

        let mut url = options
            .endpoint
            .clone()
            .unwrap_or_else(|| config.endpoint.clone());
        if let Some(suffix) = &options.path_suffix {
            url = join_path(&url, suffix);
        }

        let mut params = options.params;
        if options.cache_bust {
            params.push((
                CACHE_BUST_PARAM.to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            ));
        }

        let mut headers: HashMap<String, String> = config.custom_headers.clone();
        headers.extend(options.headers);

        let mut body = if method.has_body() {
            options.body
        } else {
            RequestBody::Empty
        };

        if config.params_in_body && method.has_body() {
            body = match body {
                RequestBody::Empty => RequestBody::Form(params),
                RequestBody::Form(mut fields) => {
                    fields.extend(params);
                    RequestBody::Form(fields)
                }
                RequestBody::Multipart {
                    mut fields,
                    file_field,
                    file_name,
                    data,
                } => {
                    fields.extend(params);
                    RequestBody::Multipart {
                        fields,
                        file_field,
                        file_name,
                        data,
                    }
                }
                raw @ RequestBody::Raw(_) => {
                    // 原始请求体无法携带参数，改放查询串
                    url = append_query(&url, &params);
                    raw
                }
            };
        } else {
            url = append_query(&url, &params);
        }

        let simple = is_simple_request(method, &headers, &body);
        let mut header_list: Vec<(String, String)> = headers.into_iter().collect();
        header_list.sort();

        if method.has_body() {
            if let Some(content_type) = body.content_type() {
                header_list.push(("Content-Type".to_string(), content_type.to_string()));
            }
        }

        if !(config.cors.expected && simple) {
            header_list.push(("X-Requested-With".to_string(), "XMLHttpRequest".to_string()));
            header_list.push(("Cache-Control".to_string(), "no-cache".to_string()));
        }

        HttpRequest {
            method,
            url,
            headers: header_list,
            body,
            with_credentials: config.cors.expected && config.cors.send_credentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// 请求会阻塞到 release 被调用的后端
    struct GatedBackend {
        gate: Notify,
        active: AtomicUsize,
        peak: AtomicUsize,
        status: u16,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl GatedBackend {
        fn new(status: u16) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                status,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpBackend for GatedBackend {
        async fn execute(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
            self.requests.lock().push(request);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.gate.notified().await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(HttpResponse::new(self.status, r#"{"success":true}"#))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl HttpBackend for FailingBackend {
        async fn execute(&self, _request: HttpRequest) -> anyhow::Result<HttpResponse> {
            anyhow::bail!("connection reset")
        }
    }

    fn config(max: usize) -> SenderConfig {
        let mut config = SenderConfig::new("https://example.com/upload", HttpMethod::Post);
        config.allowed_methods = vec![HttpMethod::Post, HttpMethod::Delete];
        config.max_connections = max;
        config
    }

    async fn settle_all(backend: &GatedBackend) {
        for _ in 0..20 {
            backend.gate.notify_waiters();
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_disallowed_method() {
        let backend = GatedBackend::new(200);
        let sender = RequestSender::new(config(1), backend.clone());

        sender.send("a", RequestOptions::default()).unwrap();
        assert!(matches!(
            sender.send("a", RequestOptions::default()),
            Err(UploaderError::DuplicateRequest(_))
        ));

        let options = RequestOptions {
            method: Some(HttpMethod::Put),
            ..Default::default()
        };
        assert!(matches!(
            sender.send("b", options),
            Err(UploaderError::MethodNotAllowed(_))
        ));
        sender.abort("a");
    }

    #[tokio::test]
    async fn test_queue_respects_max_connections() {
        let backend = GatedBackend::new(200);
        let sender = RequestSender::new(config(2), backend.clone());

        let deferreds: Vec<_> = (0..5)
            .map(|i| sender.send(&format!("r{}", i), RequestOptions::default()).unwrap())
            .collect();

        assert_eq!(sender.in_flight_count(), 2);
        assert_eq!(sender.queued_count(), 3);

        while deferreds.iter().any(|d| !d.is_settled()) {
            settle_all(&backend).await;
        }

        assert!(backend.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(sender.in_flight_count(), 0);
        for deferred in deferreds {
            assert!(deferred.wait().await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_cancel_queued_request() {
        let backend = GatedBackend::new(200);
        let completed = Arc::new(Mutex::new(Vec::new()));
        let completed_clone = completed.clone();
        let hook: CompleteHook = Arc::new(move |id, _resp, is_error| {
            completed_clone.lock().push((id.to_string(), is_error));
        });
        let sender = RequestSender::with_hooks(config(1), backend.clone(), None, Some(hook));

        let first = sender.send("first", RequestOptions::default()).unwrap();
        let second = sender.send("second", RequestOptions::default()).unwrap();

        assert!(sender.cancel("second"));
        assert!(!sender.cancel("first"), "在途请求不能通过 cancel 移除");

        let failure = second.wait().await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Canceled);

        while !first.is_settled() {
            settle_all(&backend).await;
        }
        assert_eq!(
            *completed.lock(),
            vec![("second".to_string(), true), ("first".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_status_codes_decide_success() {
        let backend = GatedBackend::new(500);
        let sender = RequestSender::new(config(0), backend.clone());
        let deferred = sender.send("x", RequestOptions::default()).unwrap();
        while !deferred.is_settled() {
            settle_all(&backend).await;
        }
        let failure = deferred.wait().await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Status);
        assert_eq!(failure.response.unwrap().status, 500);

        // 旧式跨域传输无法读取状态码，完成即成功
        let backend = GatedBackend::new(500);
        let mut blind = config(0);
        blind.cors.capability = TransportCapability::StatusBlind;
        let sender = RequestSender::new(blind, backend.clone());
        let deferred = sender.send("y", RequestOptions::default()).unwrap();
        while !deferred.is_settled() {
            settle_all(&backend).await;
        }
        assert!(deferred.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_transport_error() {
        let sender = RequestSender::new(config(1), Arc::new(FailingBackend));
        let failure = sender
            .send("x", RequestOptions::default())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Transport);
        assert!(failure.response.is_none());
    }

    #[tokio::test]
    async fn test_abort_in_flight_promotes_next() {
        let backend = GatedBackend::new(200);
        let sender = RequestSender::new(config(1), backend.clone());

        let first = sender.send("first", RequestOptions::default()).unwrap();
        let second = sender.send("second", RequestOptions::default()).unwrap();
        assert_eq!(sender.queued_count(), 1);

        assert!(sender.abort("first"));
        assert_eq!(first.wait().await.unwrap_err().kind, FailureKind::Aborted);
        assert_eq!(sender.queued_count(), 0);
        assert_eq!(sender.in_flight_count(), 1);

        while !second.is_settled() {
            settle_all(&backend).await;
        }
        assert!(second.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_headers_and_params() {
        let backend = GatedBackend::new(200);
        let mut cfg = config(0);
        cfg.params_in_body = true;
        let sender = RequestSender::new(cfg, backend.clone());

        let options = RequestOptions {
            params: vec![("qquuid".to_string(), "u1".to_string())],
            cache_bust: true,
            path_suffix: Some("u1".to_string()),
            ..Default::default()
        };
        let deferred = sender.send("x", options).unwrap();
        while !deferred.is_settled() {
            settle_all(&backend).await;
        }

        let requests = backend.requests.lock();
        let request = &requests[0];
        assert_eq!(request.url, "https://example.com/upload/u1");
        assert_eq!(request.param("qquuid").as_deref(), Some("u1"));
        assert!(request.param(CACHE_BUST_PARAM).is_some());
        assert_eq!(
            request.header("Content-Type"),
            Some("application/x-www-form-urlencoded")
        );
        assert_eq!(request.header("X-Requested-With"), Some("XMLHttpRequest"));
    }

    #[tokio::test]
    async fn test_simple_cors_request_skips_csrf_headers() {
        let backend = GatedBackend::new(200);
        let mut cfg = config(0);
        cfg.cors.expected = true;
        let sender = RequestSender::new(cfg, backend.clone());

        let deferred = sender.send("x", RequestOptions::default()).unwrap();
        while !deferred.is_settled() {
            settle_all(&backend).await;
        }

        let requests = backend.requests.lock();
        assert_eq!(requests[0].header("X-Requested-With"), None);
    }
}
