// 上传响应解析
//
// 服务器响应体约定为 JSON 对象，至少包含 `success` 布尔字段。
// 在传输边界一次性解析为强类型结构，后续流程不再直接访问原始 JSON。

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::warn;

/// 默认失败信息（服务器未给出错误原因时使用）
pub const DEFAULT_FAILURE_MESSAGE: &str = "Upload failure reason unknown";

/// 解析后的上传响应
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UploadResponse {
    /// 是否成功
    #[serde(default, deserialize_with = "lenient_bool")]
    pub success: bool,
    /// 错误信息
    #[serde(default, deserialize_with = "lenient_string")]
    pub error: Option<String>,
    /// 服务器禁止重试（字段名可配置，解析后从 extra 中取出）
    #[serde(skip)]
    pub prevent_retry: bool,
    /// 服务器要求替换的 UUID
    #[serde(default, rename = "newUuid", deserialize_with = "lenient_string")]
    pub new_uuid: Option<String>,
    /// 缩略图地址
    #[serde(default, rename = "thumbnailUrl", deserialize_with = "lenient_string")]
    pub thumbnail_url: Option<String>,
    /// 服务器要求丢弃断点数据并从头重传
    #[serde(default, deserialize_with = "lenient_bool")]
    pub reset: bool,
    /// 服务器分配的对象键
    #[serde(default, deserialize_with = "lenient_string")]
    pub key: Option<String>,
    /// 其余字段
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UploadResponse {
    /// 解析响应体
    ///
    /// # 参数
    /// * `body` - 响应体文本
    /// * `prevent_retry_property` - "禁止重试" 字段名（可配置）
    ///
    /// 非 JSON 或非对象的响应体解析为失败响应
    pub fn parse(body: &str, prevent_retry_property: &str) -> Self {
        let trimmed = body.trim();
        if trimmed.is_empty() {
            return Self::failure(None);
        }

        let mut response = match serde_json::from_str::<Self>(trimmed) {
            Ok(response) => response,
            Err(e) => {
                warn!("解析响应体失败: {}, body={}", e, trimmed);
                return Self::failure(None);
            }
        };

        if let Some(value) = response.extra.remove(prevent_retry_property) {
            response.prevent_retry = value_as_bool(&value);
        }
        response
    }

    /// 构造失败响应
    pub fn failure(error: Option<String>) -> Self {
        Self {
            success: false,
            error,
            ..Default::default()
        }
    }

    /// 面向用户的错误信息
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string())
    }
}

fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// 布尔字段兼容 "true" 字符串
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_as_bool(&Value::deserialize(deserializer)?))
}

/// 字符串字段兼容数字等其他类型
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_with_extensions() {
        let body = r#"{"success":true,"newUuid":"u-2","thumbnailUrl":"/t.png","size":3}"#;
        let response = UploadResponse::parse(body, "preventRetry");

        assert!(response.success);
        assert_eq!(response.new_uuid.as_deref(), Some("u-2"));
        assert_eq!(response.thumbnail_url.as_deref(), Some("/t.png"));
        assert!(!response.reset);
        assert_eq!(response.extra.get("size"), Some(&Value::from(3)));
    }

    #[test]
    fn test_parse_failure_fields() {
        let body = r#"{"success":false,"error":"disk full","noRetry":true,"reset":true}"#;
        let response = UploadResponse::parse(body, "noRetry");

        assert!(!response.success);
        assert!(response.prevent_retry);
        assert!(response.reset);
        assert_eq!(response.error_message(), "disk full");
        assert!(!response.extra.contains_key("noRetry"));
    }

    #[test]
    fn test_parse_lenient_field_types() {
        let body = r#"{"success":"true","key":42,"preventRetry":"TRUE","error":null}"#;
        let response = UploadResponse::parse(body, "preventRetry");

        assert!(response.success);
        assert!(response.prevent_retry);
        assert_eq!(response.key.as_deref(), Some("42"));
        assert_eq!(response.error, None);
        assert!(response.extra.is_empty());
    }

    #[test]
    fn test_parse_invalid_body() {
        let response = UploadResponse::parse("<html>502</html>", "preventRetry");
        assert!(!response.success);
        assert_eq!(response.error_message(), DEFAULT_FAILURE_MESSAGE);

        let response = UploadResponse::parse("", "preventRetry");
        assert!(!response.success);

        let response = UploadResponse::parse("[1,2]", "preventRetry");
        assert!(!response.success);
    }
}
