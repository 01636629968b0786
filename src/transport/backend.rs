// HTTP 后端
//
// 发送器只负责排队与并发控制，真正的 HTTP 交换交给 HttpBackend：
// 生产环境使用 reqwest，测试使用内存实现。

use crate::transport::request::{HttpMethod, RequestBody};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// 发往后端的完整请求
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    /// 跨域时是否携带凭据
    pub with_credentials: bool,
}

impl HttpRequest {
    /// 查找请求头（不区分大小写）
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 查找参数：依次查找 multipart 字段、表单参数、URL 查询串
    pub fn param(&self, name: &str) -> Option<String> {
        let from_body = match &self.body {
            RequestBody::Multipart { fields, .. } | RequestBody::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone()),
            _ => None,
        };
        from_body.or_else(|| {
            let (_, query) = self.url.split_once('?')?;
            query.split('&').find_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                if k == name {
                    urlencoding::decode(v).ok().map(|v| v.into_owned())
                } else {
                    None
                }
            })
        })
    }
}

/// 后端响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// HTTP 后端抽象
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// 执行请求；Err 表示传输层错误（网络错误、连接中断等，没有可用响应）
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// 基于 reqwest 的后端
#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: Client,
}

impl ReqwestBackend {
    /// 创建后端
    ///
    /// # 参数
    /// * `timeout` - 客户端超时（None 表示沿用 reqwest 默认行为）
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().redirect(reqwest::redirect::Policy::limited(10));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .context("无效的请求方法")?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Raw(data) => builder.body(data),
            RequestBody::Form(params) => builder.form(&params),
            RequestBody::Multipart {
                fields,
                file_field,
                file_name,
                data,
            } => {
                let mut form = multipart::Form::new();
                for (name, value) in fields {
                    form = form.text(name, value);
                }
                let part = multipart::Part::bytes(data.to_vec())
                    .file_name(file_name)
                    .mime_str("application/octet-stream")?;
                builder.multipart(form.part(file_field, part))
            }
        };

        let response = builder.send().await.context("上传请求发送失败")?;
        let status = response.status().as_u16();
        let body = response.text().await.context("读取响应失败")?;

        debug!("请求完成: url={}, status={}, body={}", request.url, status, body);

        Ok(HttpResponse { status, body })
    }
}
