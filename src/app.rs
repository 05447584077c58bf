//! 应用程序初始化和启动
//!
//! 负责教练服务的完整启动流程，包括：
//! - 配置加载
//! - 远端服务客户端创建
//! - 采集、调度、收尾组件装配
//! - Actor 系统启动

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actors::{SessionControlActor, SessionControlHandle, SessionControlParts};
use crate::auth::{IdentityProvider, SharedIdentity};
use crate::capture::scheduler::{AnalyzeScheduler, SchedulerConfig};
use crate::capture::{CaptureDevice, CaptureSource, FrameSampler};
use crate::error::{CoachResult, ServiceError};
use crate::event_bus::{AppEvent, EventBus};
use crate::logger::LogBroadcaster;
use crate::models::{CoachSettings, CoachStatus, ExerciseType, RecentSession};
use crate::service::{
    FeedbackClient, HttpFeedbackClient, HttpInferenceClient, HttpSessionStore, InferenceClient,
    ServiceClient, SessionStore,
};
use crate::session::{FinalizeOutcome, SessionFinalizer};
use crate::settings::SettingsManager;

/// 远端服务集合
#[derive(Clone)]
pub struct CoachServices {
    pub inference: Arc<dyn InferenceClient>,
    pub feedback: Arc<dyn FeedbackClient>,
    pub store: Arc<dyn SessionStore>,
}

impl CoachServices {
    /// 按配置创建 HTTP 客户端（三个接口共用连接池）
    pub fn http(settings: &CoachSettings) -> Result<Self, ServiceError> {
        let client = Arc::new(ServiceClient::new(&settings.service)?);
        info!("分析服务地址: {}", settings.service.base_url);
        Ok(Self {
            inference: Arc::new(HttpInferenceClient::new(client.clone())),
            feedback: Arc::new(HttpFeedbackClient::new(client.clone())),
            store: Arc::new(HttpSessionStore::new(client)),
        })
    }
}

/// 教练应用
pub struct CoachApp {
    settings: Arc<SettingsManager>,
    event_bus: Arc<EventBus>,
    identity: Arc<SharedIdentity>,
    store: Arc<dyn SessionStore>,
    control: SessionControlHandle,
    actor_task: JoinHandle<()>,
}

impl CoachApp {
    /// 使用 HTTP 服务启动
    pub async fn bootstrap(
        settings: Arc<SettingsManager>,
        device: Arc<dyn CaptureDevice>,
        log_broadcaster: Option<Arc<LogBroadcaster>>,
    ) -> anyhow::Result<Self> {
        let current = settings.get().await;
        let services = CoachServices::http(&current)?;
        Ok(Self::assemble(settings, device, services, log_broadcaster).await)
    }

    /// 装配各组件并启动会话控制 Actor
    pub async fn assemble(
        settings: Arc<SettingsManager>,
        device: Arc<dyn CaptureDevice>,
        services: CoachServices,
        log_broadcaster: Option<Arc<LogBroadcaster>>,
    ) -> Self {
        info!("初始化运动教练...");
        let current = settings.get().await;

        let event_bus = Arc::new(EventBus::new(1000));
        if let Some(broadcaster) = log_broadcaster {
            broadcaster.set_event_bus(event_bus.clone());
        }

        let scheduler = Arc::new(AnalyzeScheduler::new(
            FrameSampler::new(current.analysis.jpeg_quality),
            services.inference,
            services.feedback,
            event_bus.clone(),
            SchedulerConfig::from(&current.analysis),
        ));
        let finalizer = Arc::new(SessionFinalizer::new(
            services.store.clone(),
            event_bus.clone(),
            &current.session,
        ));
        let identity = Arc::new(SharedIdentity::new());

        let (actor, control) = SessionControlActor::new(SessionControlParts {
            capture: CaptureSource::new(device),
            scheduler,
            finalizer,
            identity: identity.clone(),
            event_bus: event_bus.clone(),
            constraints: current.capture,
            placeholders: current.placeholders(),
        });
        let actor_task = tokio::spawn(actor.run());

        info!("运动教练初始化完成");
        Self {
            settings,
            event_bus,
            identity,
            store: services.store,
            control,
            actor_task,
        }
    }

    /// 开始会话
    pub async fn start(&self, exercise_type: ExerciseType) -> CoachResult<String> {
        self.control.start(exercise_type).await
    }

    /// 停止会话并等待收尾
    pub async fn stop(&self) -> CoachResult<FinalizeOutcome> {
        self.control.stop().await
    }

    pub async fn status(&self) -> CoachStatus {
        self.control.status().await
    }

    pub async fn health_check(&self) -> bool {
        self.control.health_check().await
    }

    /// 订阅显示、通知和跳转事件
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    /// 登录流程通过它写入当前用户
    pub fn identity(&self) -> Arc<SharedIdentity> {
        self.identity.clone()
    }

    pub fn settings(&self) -> Arc<SettingsManager> {
        self.settings.clone()
    }

    /// 当前用户最近的会话，未登录时为空
    pub async fn recent_sessions(&self) -> Result<Vec<RecentSession>, ServiceError> {
        match self.identity.current_email() {
            Some(email) => self.store.recent_sessions(&email).await,
            None => Ok(Vec::new()),
        }
    }

    /// 关闭应用，进行中的会话会先收尾
    pub async fn shutdown(self) {
        let Self {
            control,
            actor_task,
            ..
        } = self;
        drop(control);
        if let Err(e) = actor_task.await {
            warn!("会话控制 Actor 退出异常: {}", e);
        }
        info!("运动教练已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserIdentity;
    use crate::capture::{Frame, FrameFeed};
    use crate::models::{FeedbackResult, InferenceResult, Keypoint, SchedulerState};
    use crate::service::SessionSubmission;
    use async_trait::async_trait;
    use image::DynamicImage;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct StubInference;

    #[async_trait]
    impl InferenceClient for StubInference {
        async fn estimate(&self, _frame: &Frame) -> Result<InferenceResult, ServiceError> {
            Ok(InferenceResult {
                keypoints: Vec::new(),
                annotated_image: Vec::new(),
            })
        }
    }

    struct StubFeedback;

    #[async_trait]
    impl FeedbackClient for StubFeedback {
        async fn analyze(
            &self,
            keypoints: &[Keypoint],
            _exercise_type: ExerciseType,
        ) -> Result<FeedbackResult, ServiceError> {
            let messages = if keypoints.is_empty() {
                vec!["Make sure your full body is visible".to_string()]
            } else {
                Vec::new()
            };
            Ok(FeedbackResult { messages })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        saved: Mutex<Vec<SessionSubmission>>,
    }

    #[async_trait]
    impl SessionStore for MemoryStore {
        async fn save_session(&self, submission: &SessionSubmission) -> Result<(), ServiceError> {
            self.saved.lock().unwrap().push(submission.clone());
            Ok(())
        }

        async fn recent_sessions(&self, user_email: &str) -> Result<Vec<RecentSession>, ServiceError> {
            Ok(self
                .saved
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.user_email == user_email)
                .map(|s| RecentSession {
                    exercise_type: s.exercise_type.as_str().to_string(),
                    summary: s.feedback.join("; "),
                    created_at: "2024-05-01T10:00:00".to_string(),
                })
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_in_session_round_trip() {
        let temp_dir = tempdir().unwrap();
        let settings = Arc::new(
            SettingsManager::new(temp_dir.path().join("config.json"))
                .await
                .unwrap(),
        );
        let (device, publisher) = FrameFeed::new();
        let store = Arc::new(MemoryStore::default());
        let services = CoachServices {
            inference: Arc::new(StubInference),
            feedback: Arc::new(StubFeedback),
            store: store.clone(),
        };

        let app = CoachApp::assemble(settings, Arc::new(device), services, None).await;
        assert!(app.health_check().await);
        assert!(app.recent_sessions().await.unwrap().is_empty());

        app.identity()
            .sign_in(UserIdentity {
                email: "u@example.com".into(),
                name: "U".into(),
                picture: String::new(),
            })
            .unwrap();

        app.start(ExerciseType::Plank).await.unwrap();
        publisher.push(DynamicImage::new_rgb8(32, 24));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(app.status().await.state, SchedulerState::Running);

        assert!(app.stop().await.unwrap().is_saved());
        let recent = app.recent_sessions().await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].exercise_type, "plank");
        assert_eq!(recent[0].summary, "Make sure your full body is visible");

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_service_url() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, r#"{"service": {"base_url": "not a url"}}"#).unwrap();

        let settings = Arc::new(SettingsManager::new(path).await.unwrap());
        let (device, _publisher) = FrameFeed::new();
        assert!(CoachApp::bootstrap(settings, Arc::new(device), None).await.is_err());
    }
}
