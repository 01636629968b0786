// 请求描述与传输能力
//
// - HttpMethod：允许的请求方法
// - RequestOptions：单次逻辑请求的参数（方法、参数、头、路径后缀、请求体、缓存破坏）
// - TransportCapability：传输能否观察状态码（旧式跨域传输只能判断是否完成）

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 请求方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    /// 是否携带请求体
    pub fn has_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    /// 默认成功状态码
    pub fn default_success_codes(&self) -> &'static [u16] {
        match self {
            HttpMethod::Get => &[200],
            HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => &[200, 201, 202, 203, 204],
            HttpMethod::Delete => &[200, 202, 204],
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 传输能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportCapability {
    /// 标准传输：可读取响应状态码
    #[default]
    Standard,
    /// 旧式跨域传输：无法读取状态码，无传输错误即视为成功
    StatusBlind,
}

/// 请求体
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// 无请求体
    Empty,
    /// multipart 表单：普通字段 + 文件字段
    Multipart {
        fields: Vec<(String, String)>,
        file_field: String,
        file_name: String,
        data: Bytes,
    },
    /// 原始二进制（application/octet-stream）
    Raw(Bytes),
    /// 表单参数（application/x-www-form-urlencoded）
    Form(Vec<(String, String)>),
}

impl RequestBody {
    /// 对应的 Content-Type；multipart 由 HTTP 客户端生成边界
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            RequestBody::Empty | RequestBody::Multipart { .. } => None,
            RequestBody::Raw(_) => Some("application/octet-stream"),
            RequestBody::Form(_) => Some("application/x-www-form-urlencoded"),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Multipart { data, .. } => data.len(),
            RequestBody::Raw(data) => data.len(),
            RequestBody::Form(params) => params.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 单次逻辑请求的选项
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// 请求方法（None 使用发送器默认方法）
    pub method: Option<HttpMethod>,
    /// 参数（按 params_in_body 放入查询串或请求体）
    pub params: Vec<(String, String)>,
    /// 额外请求头
    pub headers: HashMap<String, String>,
    /// 追加到端点路径后的后缀
    pub path_suffix: Option<String>,
    /// 请求体
    pub body: RequestBody,
    /// 是否附加时间戳参数破坏缓存
    pub cache_bust: bool,
    /// 覆盖端点（None 使用发送器默认端点）
    pub endpoint: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: None,
            params: Vec::new(),
            headers: HashMap::new(),
            path_suffix: None,
            body: RequestBody::Empty,
            cache_bust: false,
            endpoint: None,
        }
    }
}

/// 跨域配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsConfig {
    /// 端点是否跨域
    #[serde(default)]
    pub expected: bool,
    /// 跨域请求是否携带凭据
    #[serde(default)]
    pub send_credentials: bool,
    /// 传输能力（显式配置，不做环境探测）
    #[serde(default)]
    pub capability: TransportCapability,
}

/// 判断是否为跨域"简单请求"（无需附加防 CSRF 头）
pub fn is_simple_request(
    method: HttpMethod,
    custom_headers: &HashMap<String, String>,
    body: &RequestBody,
) -> bool {
    let simple_method = matches!(method, HttpMethod::Get | HttpMethod::Post);
    let simple_content_type = !matches!(body, RequestBody::Raw(_));
    simple_method && custom_headers.is_empty() && simple_content_type
}

/// 把参数追加到 URL 查询串
pub fn append_query(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }

    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

/// 拼接端点与路径后缀（保留原有查询串）
pub fn join_path(endpoint: &str, suffix: &str) -> String {
    let suffix = suffix.trim_start_matches('/');
    match endpoint.split_once('?') {
        Some((path, query)) => format!("{}/{}?{}", path.trim_end_matches('/'), suffix, query),
        None => format!("{}/{}", endpoint.trim_end_matches('/'), suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_codes_per_method() {
        assert_eq!(HttpMethod::Get.default_success_codes(), &[200]);
        assert!(HttpMethod::Post.default_success_codes().contains(&204));
        assert!(!HttpMethod::Delete.default_success_codes().contains(&201));
    }

    #[test]
    fn test_append_query() {
        let params = vec![
            ("qquuid".to_string(), "a b".to_string()),
            ("qqpartindex".to_string(), "2".to_string()),
        ];
        assert_eq!(
            append_query("https://example.com/upload", &params),
            "https://example.com/upload?qquuid=a%20b&qqpartindex=2"
        );
        assert_eq!(
            append_query("https://example.com/upload?x=1", &params[1..]),
            "https://example.com/upload?x=1&qqpartindex=2"
        );
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("https://h/files/", "/abc"), "https://h/files/abc");
        assert_eq!(join_path("https://h/files?x=1", "abc"), "https://h/files/abc?x=1");
    }

    #[test]
    fn test_simple_request_detection() {
        let headers = HashMap::new();
        assert!(is_simple_request(HttpMethod::Post, &headers, &RequestBody::Empty));
        assert!(!is_simple_request(
            HttpMethod::Put,
            &headers,
            &RequestBody::Empty
        ));
        assert!(!is_simple_request(
            HttpMethod::Post,
            &headers,
            &RequestBody::Raw(Bytes::from_static(b"x"))
        ));

        let mut custom = HashMap::new();
        custom.insert("X-Token".to_string(), "1".to_string());
        assert!(!is_simple_request(HttpMethod::Get, &custom, &RequestBody::Empty));
    }
}
