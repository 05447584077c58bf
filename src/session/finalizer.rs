// 会话收尾 - 提交会话记录、发出通知并跳转到历史页面

use crate::error::CoachError;
use crate::event_bus::{AppEvent, EventBus, NoticeLevel};
use crate::models::{SessionRecord, SessionSettings, SESSION_SAVED_NOTICE};
use crate::service::{SessionStore, SessionSubmission};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// 会话未提交的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 没有任何有效反馈
    NoFeedback,
    /// 未登录
    NoIdentity,
    /// 同一会话已经收尾过
    AlreadyFinalized,
    /// 会话数据丢失（分析任务异常退出）
    SessionLost,
}

impl DropReason {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NoFeedback => "会话没有有效反馈",
            Self::NoIdentity => "用户未登录",
            Self::AlreadyFinalized => "会话已提交过",
            Self::SessionLost => "会话数据丢失",
        }
    }
}

/// 收尾结果
#[derive(Debug)]
pub enum FinalizeOutcome {
    Saved,
    Skipped(DropReason),
    Failed(CoachError),
}

impl FinalizeOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// 已收尾会话跟踪器 - 有界集合，防止内存无限增长
struct FinalizedTracker {
    finished: HashSet<String>,
    queue: VecDeque<String>,
    max_size: usize,
}

impl FinalizedTracker {
    fn new(max_size: usize) -> Self {
        Self {
            finished: HashSet::new(),
            queue: VecDeque::new(),
            max_size,
        }
    }

    /// 记录会话，已存在时返回 false
    fn insert(&mut self, id: &str) -> bool {
        if self.finished.contains(id) {
            return false;
        }

        // 达到最大容量时移除最旧的记录
        if self.queue.len() >= self.max_size {
            if let Some(old) = self.queue.pop_front() {
                self.finished.remove(&old);
            }
        }

        self.finished.insert(id.to_string());
        self.queue.push_back(id.to_string());
        true
    }
}

/// 会话收尾器
pub struct SessionFinalizer {
    store: Arc<dyn SessionStore>,
    event_bus: Arc<EventBus>,
    navigate_delay: Duration,
    history_route: String,
    finalized: Mutex<FinalizedTracker>,
}

impl SessionFinalizer {
    pub fn new(store: Arc<dyn SessionStore>, event_bus: Arc<EventBus>, settings: &SessionSettings) -> Self {
        Self {
            store,
            event_bus,
            navigate_delay: Duration::from_millis(settings.navigate_delay_ms),
            history_route: settings.history_route.clone(),
            finalized: Mutex::new(FinalizedTracker::new(256)),
        }
    }

    /// 收尾一个会话
    ///
    /// 没有反馈或没有登录用户时静默丢弃；提交失败只通知用户，不重试
    pub async fn finalize(&self, record: SessionRecord) -> FinalizeOutcome {
        let first_time = self
            .finalized
            .lock()
            .map(|mut tracker| tracker.insert(&record.id))
            .unwrap_or(true);
        if !first_time {
            return self.drop_session(&record.id, DropReason::AlreadyFinalized);
        }

        if record.feedback.is_empty() {
            return self.drop_session(&record.id, DropReason::NoFeedback);
        }
        let Some(user_email) = record.user_email.clone() else {
            return self.drop_session(&record.id, DropReason::NoIdentity);
        };

        let submission = SessionSubmission {
            exercise_type: record.exercise_type,
            feedback: record.feedback,
            user_email,
        };

        info!(
            "提交会话 {}: {} / {} 条反馈",
            record.id,
            submission.exercise_type,
            submission.feedback.len()
        );

        match self.store.save_session(&submission).await {
            Ok(()) => {
                self.event_bus.publish(AppEvent::Notification {
                    level: NoticeLevel::Success,
                    message: SESSION_SAVED_NOTICE.to_string(),
                });
                self.event_bus.publish(AppEvent::SessionSaved {
                    session_id: record.id,
                });
                self.schedule_navigation();
                FinalizeOutcome::Saved
            }
            Err(e) => {
                error!("会话 {} 保存失败: {}", record.id, e);
                self.event_bus.publish(AppEvent::Notification {
                    level: NoticeLevel::Error,
                    message: format!("Failed to save session: {}", e.user_message()),
                });
                FinalizeOutcome::Failed(CoachError::Persist(e))
            }
        }
    }

    fn drop_session(&self, session_id: &str, reason: DropReason) -> FinalizeOutcome {
        info!("会话 {} 未提交: {}", session_id, reason.describe());
        self.event_bus.publish(AppEvent::SessionDropped {
            session_id: session_id.to_string(),
            reason: reason.describe().to_string(),
        });
        FinalizeOutcome::Skipped(reason)
    }

    /// 延迟后跳转到历史页面
    fn schedule_navigation(&self) {
        let event_bus = self.event_bus.clone();
        let route = self.history_route.clone();
        let delay = self.navigate_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("跳转到历史页面: {}", route);
            event_bus.publish(AppEvent::Navigate { route });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::models::{ExerciseType, RecentSession};
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<SessionSubmission>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl SessionStore for RecordingStore {
        async fn save_session(&self, submission: &SessionSubmission) -> Result<(), ServiceError> {
            self.saved.lock().unwrap().push(submission.clone());
            match &self.fail_with {
                Some(detail) => Err(ServiceError::Status {
                    status: 500,
                    detail: detail.clone(),
                }),
                None => Ok(()),
            }
        }

        async fn recent_sessions(&self, _email: &str) -> Result<Vec<RecentSession>, ServiceError> {
            Ok(Vec::new())
        }
    }

    fn record(feedback: &[&str], email: Option<&str>) -> SessionRecord {
        SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            exercise_type: ExerciseType::Squat,
            feedback: feedback.iter().map(|s| s.to_string()).collect(),
            user_email: email.map(|s| s.to_string()),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        }
    }

    fn finalizer(store: Arc<RecordingStore>, bus: Arc<EventBus>) -> SessionFinalizer {
        SessionFinalizer::new(store, bus, &SessionSettings::default())
    }

    #[tokio::test]
    async fn test_empty_feedback_is_not_submitted() {
        let store = Arc::new(RecordingStore::default());
        let finalizer = finalizer(store.clone(), Arc::new(EventBus::new(16)));

        let outcome = finalizer.finalize(record(&[], Some("u@example.com"))).await;
        assert!(matches!(outcome, FinalizeOutcome::Skipped(DropReason::NoFeedback)));
        assert_eq!(store.saved.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_missing_identity_is_not_submitted() {
        let store = Arc::new(RecordingStore::default());
        let finalizer = finalizer(store.clone(), Arc::new(EventBus::new(16)));

        let outcome = finalizer.finalize(record(&["Lower your hips"], None)).await;
        assert!(matches!(outcome, FinalizeOutcome::Skipped(DropReason::NoIdentity)));
        assert_eq!(store.saved.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_same_session_is_submitted_once() {
        let store = Arc::new(RecordingStore::default());
        let finalizer = finalizer(store.clone(), Arc::new(EventBus::new(16)));
        let session = record(&["Lower your hips"], Some("u@example.com"));

        assert!(finalizer.finalize(session.clone()).await.is_saved());
        assert!(matches!(
            finalizer.finalize(session).await,
            FinalizeOutcome::Skipped(DropReason::AlreadyFinalized)
        ));
        assert_eq!(store.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_notifies_then_navigates_after_delay() {
        let store = Arc::new(RecordingStore::default());
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe();
        let finalizer = finalizer(store.clone(), bus);

        let started = Instant::now();
        let outcome = finalizer
            .finalize(record(&["Lower your hips"], Some("u@example.com")))
            .await;
        assert!(outcome.is_saved());

        let mut saw_notice = false;
        loop {
            match events.recv().await.unwrap() {
                AppEvent::Notification { level, message } => {
                    assert_eq!(level, NoticeLevel::Success);
                    assert_eq!(message, SESSION_SAVED_NOTICE);
                    saw_notice = true;
                }
                AppEvent::Navigate { route } => {
                    assert_eq!(route, "/dashboard");
                    assert!(started.elapsed() >= Duration::from_millis(3000));
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_notice);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_notifies_without_retry_or_navigation() {
        let store = Arc::new(RecordingStore {
            fail_with: Some("database is locked".into()),
            ..RecordingStore::default()
        });
        let bus = Arc::new(EventBus::new(16));
        let mut events = bus.subscribe();
        let finalizer = finalizer(store.clone(), bus);

        let outcome = finalizer
            .finalize(record(&["Lower your hips"], Some("u@example.com")))
            .await;
        assert!(matches!(outcome, FinalizeOutcome::Failed(CoachError::Persist(_))));
        assert_eq!(store.saved.lock().unwrap().len(), 1);

        match events.recv().await.unwrap() {
            AppEvent::Notification { level, message } => {
                assert_eq!(level, NoticeLevel::Error);
                assert_eq!(message, "Failed to save session: database is locked");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, AppEvent::Navigate { .. }));
        }
    }
}
