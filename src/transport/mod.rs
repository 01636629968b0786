// 请求传输模块
//
// - request：请求选项、方法、跨域与传输能力
// - backend：HTTP 后端抽象（reqwest 实现）
// - sender：按 FIFO 排队、限制在途数量的请求发送器
// - response：上传响应的强类型解析

pub mod backend;
pub mod request;
pub mod response;
pub mod sender;

pub use backend::{HttpBackend, HttpRequest, HttpResponse, ReqwestBackend};
pub use request::{CorsConfig, HttpMethod, RequestBody, RequestOptions, TransportCapability};
pub use response::{UploadResponse, DEFAULT_FAILURE_MESSAGE};
pub use sender::{
    CompleteHook, FailureKind, RequestFailure, RequestSender, SendHook, SenderConfig,
    CACHE_BUST_PARAM,
};
