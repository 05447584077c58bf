// 动作反馈接口 - POST /feedback/analyze

use super::{map_transport, read_json, ServiceClient};
use crate::error::ServiceError;
use crate::models::{ExerciseType, FeedbackResult, Keypoint};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 动作反馈客户端
#[async_trait]
pub trait FeedbackClient: Send + Sync {
    async fn analyze(
        &self,
        keypoints: &[Keypoint],
        exercise_type: ExerciseType,
    ) -> Result<FeedbackResult, ServiceError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    keypoints: &'a [Keypoint],
    exercise_type: ExerciseType,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    #[serde(default)]
    feedback: Vec<String>,
}

pub struct HttpFeedbackClient {
    service: Arc<ServiceClient>,
}

impl HttpFeedbackClient {
    pub fn new(service: Arc<ServiceClient>) -> Self {
        Self { service }
    }

    async fn analyze_once(&self, request: &AnalyzeRequest<'_>) -> Result<FeedbackResult, ServiceError> {
        let url = self.service.endpoint(&["feedback", "analyze"])?;
        let response = self
            .service
            .http()
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(map_transport)?;

        let parsed: AnalyzeResponse = read_json(response).await?;
        Ok(FeedbackResult {
            messages: parsed.feedback,
        })
    }
}

#[async_trait]
impl FeedbackClient for HttpFeedbackClient {
    async fn analyze(
        &self,
        keypoints: &[Keypoint],
        exercise_type: ExerciseType,
    ) -> Result<FeedbackResult, ServiceError> {
        let request = AnalyzeRequest {
            keypoints,
            exercise_type,
        };
        self.service
            .retry_policy()
            .run("动作反馈", || self.analyze_once(&request))
            .await
    }
}
