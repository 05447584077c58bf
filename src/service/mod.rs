// 远端服务模块 - 姿态推理、动作反馈与会话存储
//
// 三个接口共用同一个 HTTP 客户端（复用连接池），统一处理超时、重试和错误信封

pub mod exercise;
pub mod feedback;
pub mod pose;

pub use exercise::{HttpSessionStore, SessionStore, SessionSubmission};
pub use feedback::{FeedbackClient, HttpFeedbackClient};
pub use pose::{HttpInferenceClient, InferenceClient};

use crate::error::ServiceError;
use crate::models::ServiceSettings;
use crate::utils::validation::validate_base_url;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// 重试策略：仅对可重试错误生效，间隔按次数线性增加
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    pub fn from_settings(settings: &ServiceSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_delay_ms),
        }
    }

    /// 执行带重试的操作
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut retry_count = 0;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry_count < self.max_retries => {
                    retry_count += 1;
                    let delay = self.base_delay * retry_count;
                    warn!(
                        "{} 失败 (尝试 {}/{}): {}, 等待 {:?} 后重试...",
                        operation, retry_count, self.max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 共享的服务客户端
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
}

impl ServiceClient {
    /// 根据配置创建客户端
    pub fn new(settings: &ServiceSettings) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_max_idle_per_host(4)
            .build()?;
        Self::with_client(client, settings)
    }

    /// 使用已有的 HTTP 客户端
    pub fn with_client(client: Client, settings: &ServiceSettings) -> Result<Self, ServiceError> {
        validate_base_url(&settings.base_url).map_err(ServiceError::InvalidUrl)?;
        let base_url = Url::parse(settings.base_url.trim())
            .map_err(|e| ServiceError::InvalidUrl(format!("{}: {}", settings.base_url, e)))?;
        Ok(Self {
            client,
            base_url,
            retry: RetryPolicy::from_settings(settings),
        })
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 拼接接口地址，路径段会被正确编码
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ServiceError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// 把 reqwest 错误映射为服务错误（超时单独归类）
pub(crate) fn map_transport(error: reqwest::Error) -> ServiceError {
    if error.is_timeout() {
        ServiceError::Timeout
    } else {
        ServiceError::Transport(error)
    }
}

/// 读取响应并解析 JSON
pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let status = response.status().as_u16();
    let body = response.bytes().await.map_err(map_transport)?;
    decode_body(status, &body)
}

/// 按状态码解析响应体：2xx 解析为目标类型，其它解析 `{detail}` 错误信封
pub(crate) fn decode_body<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T, ServiceError> {
    if !(200..300).contains(&status) {
        let detail = error_detail(body);
        debug!("服务返回错误状态 {}: {}", status, detail);
        return Err(ServiceError::Status { status, detail });
    }

    serde_json::from_slice::<T>(body).map_err(|e| ServiceError::Decode(e.to_string()))
}

/// 提取错误信息，`detail` 可能是字符串，也可能是校验错误数组
fn error_detail(body: &[u8]) -> String {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => match value.get("detail") {
            Some(serde_json::Value::String(detail)) => detail.clone(),
            Some(other) => other.to_string(),
            None => value.to_string(),
        },
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, serde::Deserialize)]
    struct Reply {
        message: String,
    }

    fn settings(base_url: &str) -> ServiceSettings {
        ServiceSettings {
            base_url: base_url.to_string(),
            ..ServiceSettings::default()
        }
    }

    #[test]
    fn test_decode_success_and_error_envelopes() {
        let ok: Reply = decode_body(200, br#"{"message": "Session recorded successfully"}"#).unwrap();
        assert_eq!(ok.message, "Session recorded successfully");

        match decode_body::<Reply>(500, br#"{"detail": "database is locked"}"#) {
            Err(ServiceError::Status { status, detail }) => {
                assert_eq!(status, 500);
                assert_eq!(detail, "database is locked");
            }
            other => panic!("unexpected: {:?}", other),
        }

        match decode_body::<Reply>(502, b"Bad Gateway") {
            Err(ServiceError::Status { detail, .. }) => assert_eq!(detail, "Bad Gateway"),
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            decode_body::<Reply>(200, b"<html>"),
            Err(ServiceError::Decode(_))
        ));
    }

    #[test]
    fn test_validation_detail_is_stringified() {
        let body = br#"{"detail": [{"loc": ["body", "userEmail"], "msg": "field required"}]}"#;
        match decode_body::<Reply>(422, body) {
            Err(ServiceError::Status { status, detail }) => {
                assert_eq!(status, 422);
                assert!(detail.contains("field required"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_joins_and_encodes() {
        let service = ServiceClient::new(&settings("http://localhost:8000")).unwrap();
        assert_eq!(
            service.endpoint(&["pose", "estimate"]).unwrap().as_str(),
            "http://localhost:8000/pose/estimate"
        );

        let nested = ServiceClient::new(&settings("https://coach.example.com/api/")).unwrap();
        assert_eq!(
            nested
                .endpoint(&["exercise", "recent-sessions", "a b@example.com"])
                .unwrap()
                .as_str(),
            "https://coach.example.com/api/exercise/recent-sessions/a%20b@example.com"
        );
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(matches!(
            ServiceClient::new(&settings("ftp://example.com")),
            Err(ServiceError::InvalidUrl(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_max_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        };
        let attempts = AtomicU32::new(0);

        let result: Result<(), ServiceError> = policy
            .run("测试请求", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Timeout) }
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Timeout)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_client_errors() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        let attempts = AtomicU32::new(0);

        let result: Result<(), ServiceError> = policy
            .run("测试请求", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ServiceError::Status {
                        status: 400,
                        detail: "bad".into(),
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        };
        let attempts = AtomicU32::new(0);

        let result = policy
            .run("测试请求", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ServiceError::Status {
                            status: 503,
                            detail: String::new(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }
}
