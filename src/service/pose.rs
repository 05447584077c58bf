// 姿态推理接口 - POST /pose/estimate

use super::{map_transport, read_json, ServiceClient};
use crate::capture::Frame;
use crate::error::ServiceError;
use crate::models::{InferenceResult, Keypoint};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::multipart;
use serde::Deserialize;
use std::sync::Arc;
use tracing::trace;

/// 姿态推理客户端
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// 发送一帧，返回关键点和标注图像
    async fn estimate(&self, frame: &Frame) -> Result<InferenceResult, ServiceError>;
}

#[derive(Debug, Deserialize)]
struct EstimateResponse {
    #[serde(default)]
    keypoints: Vec<Keypoint>,
    image: String,
}

impl EstimateResponse {
    fn into_result(self) -> Result<InferenceResult, ServiceError> {
        // 兼容 data URL 形式
        let encoded = match self.image.split_once("base64,") {
            Some((_, data)) => data,
            None => self.image.as_str(),
        };
        let annotated_image = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| ServiceError::Decode(format!("标注图像base64解码失败: {}", e)))?;

        Ok(InferenceResult {
            keypoints: self.keypoints,
            annotated_image,
        })
    }
}

/// 基于 HTTP 的姿态推理客户端
pub struct HttpInferenceClient {
    service: Arc<ServiceClient>,
}

impl HttpInferenceClient {
    pub fn new(service: Arc<ServiceClient>) -> Self {
        Self { service }
    }

    async fn estimate_once(&self, frame: &Frame) -> Result<InferenceResult, ServiceError> {
        let url = self.service.endpoint(&["pose", "estimate"])?;
        let part = multipart::Part::bytes(frame.data.clone())
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .service
            .http()
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(map_transport)?;

        let parsed: EstimateResponse = read_json(response).await?;
        parsed.into_result()
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn estimate(&self, frame: &Frame) -> Result<InferenceResult, ServiceError> {
        let result = self
            .service
            .retry_policy()
            .run("姿态推理", || self.estimate_once(frame))
            .await?;
        trace!(
            "姿态推理完成: {} 个关键点, 标注图像 {} 字节",
            result.keypoints.len(),
            result.annotated_image.len()
        );
        Ok(result)
    }
}
