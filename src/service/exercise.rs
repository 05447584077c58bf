// 会话存储接口 - 保存会话与查询最近会话

use super::{map_transport, read_json, ServiceClient};
use crate::error::ServiceError;
use crate::models::{ExerciseType, RecentSession};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// 提交给存储服务的会话
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSubmission {
    pub exercise_type: ExerciseType,
    pub feedback: Vec<String>,
    pub user_email: String,
}

/// 会话存储
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 保存会话（不重试）
    async fn save_session(&self, submission: &SessionSubmission) -> Result<(), ServiceError>;

    /// 查询用户最近的会话
    async fn recent_sessions(&self, user_email: &str) -> Result<Vec<RecentSession>, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct SaveResponse {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecentSessionsResponse {
    #[serde(default)]
    sessions: Vec<RecentSession>,
}

pub struct HttpSessionStore {
    service: Arc<ServiceClient>,
}

impl HttpSessionStore {
    pub fn new(service: Arc<ServiceClient>) -> Self {
        Self { service }
    }

    async fn fetch_recent(&self, user_email: &str) -> Result<Vec<RecentSession>, ServiceError> {
        let url = self
            .service
            .endpoint(&["exercise", "recent-sessions", user_email])?;
        let response = self
            .service
            .http()
            .get(url)
            .send()
            .await
            .map_err(map_transport)?;
        let parsed: RecentSessionsResponse = read_json(response).await?;
        Ok(parsed.sessions)
    }
}

#[async_trait]
impl SessionStore for HttpSessionStore {
    async fn save_session(&self, submission: &SessionSubmission) -> Result<(), ServiceError> {
        let url = self.service.endpoint(&["exercise", "session"])?;
        let response = self
            .service
            .http()
            .post(url)
            .json(submission)
            .send()
            .await
            .map_err(map_transport)?;

        let parsed: SaveResponse = read_json(response).await?;
        info!(
            "会话已提交: {} 条反馈, 服务端返回: {}",
            submission.feedback.len(),
            parsed.message.unwrap_or_default()
        );
        Ok(())
    }

    async fn recent_sessions(&self, user_email: &str) -> Result<Vec<RecentSession>, ServiceError> {
        self.service
            .retry_policy()
            .run("查询最近会话", || self.fetch_recent(user_email))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::decode_body;

    #[test]
    fn test_submission_wire_shape() {
        let submission = SessionSubmission {
            exercise_type: ExerciseType::Squat,
            feedback: vec!["Lower your hips".into()],
            user_email: "u@example.com".into(),
        };
        assert_eq!(
            serde_json::to_value(&submission).unwrap(),
            serde_json::json!({
                "exerciseType": "squat",
                "feedback": ["Lower your hips"],
                "userEmail": "u@example.com"
            })
        );
    }

    #[test]
    fn test_recent_sessions_decoding() {
        let body = br#"{"sessions": [{"exercise_type": "lunge", "summary": "Great work!", "created_at": "2024-05-01T08:00:00"}]}"#;
        let parsed: RecentSessionsResponse = decode_body(200, body).unwrap();
        assert_eq!(parsed.sessions.len(), 1);
        assert_eq!(parsed.sessions[0].exercise_type, "lunge");
        assert!(parsed.sessions[0].created_at_utc().is_some());

        match decode_body::<RecentSessionsResponse>(404, br#"{"detail": "User not found"}"#) {
            Err(ServiceError::Status { status: 404, detail }) => assert_eq!(detail, "User not found"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
