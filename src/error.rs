// 错误类型定义

use thiserror::Error;

/// 远端服务调用错误
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("网络请求失败: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("请求超时")]
    Timeout,
    #[error("服务返回错误 {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("响应解析失败: {0}")]
    Decode(String),
    #[error("无效的服务地址: {0}")]
    InvalidUrl(String),
}

impl ServiceError {
    /// 是否值得重试（网络错误、超时、5xx）
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => !e.is_decode() && !e.is_builder(),
            Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }

    /// 面向用户的错误描述
    pub fn user_message(&self) -> String {
        match self {
            Self::Status { detail, .. } if !detail.is_empty() => detail.clone(),
            other => other.to_string(),
        }
    }
}

/// 运动教练核心错误
#[derive(Debug, Error)]
pub enum CoachError {
    /// 摄像头被拒绝或不存在，会话无法开始
    #[error("摄像头不可用: {0}")]
    Device(String),
    #[error("姿态推理失败: {0}")]
    Inference(#[source] ServiceError),
    #[error("动作反馈失败: {0}")]
    Feedback(#[source] ServiceError),
    #[error("会话保存失败: {0}")]
    Persist(#[source] ServiceError),
    #[error("会话已在进行中")]
    AlreadyRunning,
    #[error("当前没有进行中的会话")]
    NotRunning,
    /// 上一个会话停止后仍在保存
    #[error("上一个会话仍在保存中")]
    Finalizing,
    #[error("会话控制器不可用")]
    ActorUnavailable,
    #[error("配置错误: {0}")]
    Config(String),
}

pub type CoachResult<T> = Result<T, CoachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ServiceError::Timeout.is_retryable());
        assert!(ServiceError::Status {
            status: 503,
            detail: String::new()
        }
        .is_retryable());
        assert!(!ServiceError::Status {
            status: 404,
            detail: "User not found".into()
        }
        .is_retryable());
        assert!(!ServiceError::Decode("bad json".into()).is_retryable());
    }

    #[test]
    fn test_user_message_prefers_detail() {
        let err = ServiceError::Status {
            status: 500,
            detail: "database is locked".into(),
        };
        assert_eq!(err.user_message(), "database is locked");
        assert_eq!(ServiceError::Timeout.user_message(), "请求超时");
    }
}
