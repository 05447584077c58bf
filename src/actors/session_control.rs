// Session Control Actor - 串行处理会话的开始与停止
//
// 所有开始/停止命令经由同一个消息队列处理，
// 连续多次停止只会有一次真正执行收尾。
// 会话保存在后台任务中进行，期间仍可应答状态查询和健康检查

use crate::auth::IdentityProvider;
use crate::capture::scheduler::{AnalyzeScheduler, CaptureEndedHook, ExitReason, RunningLoop};
use crate::capture::CaptureSource;
use crate::error::{CoachError, CoachResult};
use crate::event_bus::{AppEvent, EventBus};
use crate::models::{
    CaptureConstraints, CoachStatus, ExerciseType, SchedulerState, DEVICE_ERROR_FEEDBACK,
    INITIAL_FEEDBACK,
};
use crate::session::{DropReason, FinalizeOutcome, SessionContext, SessionFinalizer};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};

/// 会话控制命令
pub enum SessionControlCommand {
    /// 开始会话，成功时返回会话 ID
    Start {
        exercise_type: ExerciseType,
        reply: oneshot::Sender<CoachResult<String>>,
    },

    /// 停止当前会话并收尾
    Stop {
        reply: oneshot::Sender<CoachResult<FinalizeOutcome>>,
    },

    /// 视频流意外结束（由分析循环发出）
    CaptureEnded {
        session_id: String,
    },

    /// 获取状态
    Status {
        reply: oneshot::Sender<CoachStatus>,
    },

    /// 健康检查
    HealthCheck {
        reply: oneshot::Sender<()>,
    },
}

struct ActiveSession {
    id: String,
    exercise_type: ExerciseType,
    running: RunningLoop,
}

/// 已停止、正在后台保存的会话
struct PendingFinalize {
    id: String,
    exercise_type: ExerciseType,
    reply: Option<oneshot::Sender<CoachResult<FinalizeOutcome>>>,
    task: JoinHandle<FinalizeOutcome>,
}

/// 会话控制器依赖的组件
pub struct SessionControlParts {
    pub capture: CaptureSource,
    pub scheduler: Arc<AnalyzeScheduler>,
    pub finalizer: Arc<SessionFinalizer>,
    pub identity: Arc<dyn IdentityProvider>,
    pub event_bus: Arc<EventBus>,
    pub constraints: CaptureConstraints,
    pub placeholders: Vec<String>,
}

/// 会话控制Actor
pub struct SessionControlActor {
    receiver: mpsc::Receiver<SessionControlCommand>,
    // 弱引用，避免 Actor 自己让通道永远不关闭
    self_sender: mpsc::WeakSender<SessionControlCommand>,
    parts: SessionControlParts,
    state: SchedulerState,
    active: Option<ActiveSession>,
    finalizing: Option<PendingFinalize>,
    last_error: Option<String>,
}

/// 等待后台保存完成，没有保存任务时永远挂起
async fn wait_finalize(
    pending: &mut Option<PendingFinalize>,
) -> Result<FinalizeOutcome, JoinError> {
    match pending {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

impl SessionControlActor {
    /// 创建新的Actor
    pub fn new(parts: SessionControlParts) -> (Self, SessionControlHandle) {
        let (sender, receiver) = mpsc::channel(32);
        let actor = Self {
            receiver,
            self_sender: sender.downgrade(),
            parts,
            state: SchedulerState::Idle,
            active: None,
            finalizing: None,
            last_error: None,
        };
        let handle = SessionControlHandle { sender };
        (actor, handle)
    }

    /// 运行Actor
    pub async fn run(mut self) {
        tracing::info!("Session Control Actor 已启动");

        loop {
            tokio::select! {
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                joined = wait_finalize(&mut self.finalizing), if self.finalizing.is_some() => {
                    self.complete_finalize(joined);
                }
            }
        }

        // 所有 Handle 都已释放，仍在进行的会话同样需要收尾
        if self.active.is_some() {
            tracing::info!("Session Control Actor 退出前停止进行中的会话");
            self.stop_session(None).await;
        }
        if self.finalizing.is_some() {
            let joined = wait_finalize(&mut self.finalizing).await;
            self.complete_finalize(joined);
        }

        tracing::info!("Session Control Actor 已停止");
    }

    async fn handle_command(&mut self, cmd: SessionControlCommand) {
        match cmd {
            SessionControlCommand::Start { exercise_type, reply } => {
                let result = self.start_session(exercise_type).await;
                let _ = reply.send(result);
            }

            SessionControlCommand::Stop { reply } => {
                self.stop_session(Some(reply)).await;
            }

            SessionControlCommand::CaptureEnded { session_id } => {
                let is_current = self
                    .active
                    .as_ref()
                    .is_some_and(|active| active.id == session_id);
                if is_current {
                    tracing::warn!("视频流已结束，自动停止会话 {}", session_id);
                    self.last_error = Some("视频流已结束".to_string());
                    self.stop_session(None).await;
                }
            }

            SessionControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }

            SessionControlCommand::HealthCheck { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            tracing::debug!("调度器状态: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.parts.event_bus.publish(AppEvent::StateChanged { state });
        }
    }

    fn status(&self) -> CoachStatus {
        match &self.active {
            Some(active) => {
                let stats = active.running.stats();
                CoachStatus {
                    state: self.state,
                    exercise_type: Some(active.exercise_type),
                    feedback_count: stats.feedback_count,
                    cycles_completed: stats.cycles,
                    last_error: stats.last_error.or_else(|| self.last_error.clone()),
                }
            }
            None => CoachStatus {
                state: self.state,
                exercise_type: self.finalizing.as_ref().map(|pending| pending.exercise_type),
                last_error: self.last_error.clone(),
                ..CoachStatus::default()
            },
        }
    }

    async fn start_session(&mut self, exercise_type: ExerciseType) -> CoachResult<String> {
        if self.active.is_some() {
            return Err(CoachError::AlreadyRunning);
        }
        if let Some(pending) = &self.finalizing {
            tracing::warn!("会话 {} 仍在保存，暂不开始新会话", pending.id);
            return Err(CoachError::Finalizing);
        }

        let stream = match self.parts.capture.acquire(&self.parts.constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                // 摄像头不可用时不进入 Running，也不发出任何网络请求
                tracing::error!("无法打开摄像头: {}", e);
                self.last_error = Some(e.to_string());
                self.parts.event_bus.publish(AppEvent::FeedbackUpdated {
                    messages: vec![DEVICE_ERROR_FEEDBACK.to_string()],
                });
                return Err(e);
            }
        };

        let ctx = SessionContext::new(exercise_type, &self.parts.placeholders);
        let session_id = ctx.id().to_string();

        let weak = self.self_sender.clone();
        let ended_id = session_id.clone();
        let on_capture_ended: CaptureEndedHook = Box::new(move || {
            if let Some(sender) = weak.upgrade() {
                let _ = sender.try_send(SessionControlCommand::CaptureEnded { session_id: ended_id });
            }
        });

        let running = self
            .parts
            .scheduler
            .clone()
            .spawn(stream, ctx, Some(on_capture_ended));

        self.active = Some(ActiveSession {
            id: session_id.clone(),
            exercise_type,
            running,
        });
        self.last_error = None;
        self.set_state(SchedulerState::Running);
        self.parts.event_bus.publish(AppEvent::CaptureStarted {
            session_id: session_id.clone(),
            exercise_type,
        });

        tracing::info!("会话 {} 已开始: {}", session_id, exercise_type.display_name());
        Ok(session_id)
    }

    /// 停止分析并释放摄像头，保存交给后台任务，完成后再回复并回到 Idle
    async fn stop_session(&mut self, reply: Option<oneshot::Sender<CoachResult<FinalizeOutcome>>>) {
        let Some(active) = self.active.take() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(CoachError::NotRunning));
            }
            return;
        };

        self.set_state(SchedulerState::Stopping);

        let exit = active.running.stop().await;
        self.parts.capture.release();
        self.parts.event_bus.publish(AppEvent::CaptureStopped {
            session_id: active.id.clone(),
        });
        self.parts.event_bus.publish(AppEvent::FeedbackUpdated {
            messages: vec![INITIAL_FEEDBACK.to_string()],
        });

        let Some(exit) = exit else {
            let reason = DropReason::SessionLost;
            self.parts.event_bus.publish(AppEvent::SessionDropped {
                session_id: active.id.clone(),
                reason: reason.describe().to_string(),
            });
            self.finish_stop(&active.id, reply, FinalizeOutcome::Skipped(reason));
            return;
        };

        if exit.reason == ExitReason::CaptureEnded {
            tracing::info!("会话 {} 因视频流结束而停止", active.id);
        }
        let record = exit.context.export(self.parts.identity.current_email());
        let finalizer = self.parts.finalizer.clone();
        let task = tokio::spawn(async move { finalizer.finalize(record).await });

        tracing::debug!("会话 {} 已交给后台保存", active.id);
        self.finalizing = Some(PendingFinalize {
            id: active.id,
            exercise_type: active.exercise_type,
            reply,
            task,
        });
    }

    fn complete_finalize(&mut self, joined: Result<FinalizeOutcome, JoinError>) {
        let Some(pending) = self.finalizing.take() else {
            return;
        };

        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("会话 {} 保存任务异常退出: {}", pending.id, e);
                let reason = DropReason::SessionLost;
                self.parts.event_bus.publish(AppEvent::SessionDropped {
                    session_id: pending.id.clone(),
                    reason: reason.describe().to_string(),
                });
                FinalizeOutcome::Skipped(reason)
            }
        };
        self.finish_stop(&pending.id, pending.reply, outcome);
    }

    fn finish_stop(
        &mut self,
        session_id: &str,
        reply: Option<oneshot::Sender<CoachResult<FinalizeOutcome>>>,
        outcome: FinalizeOutcome,
    ) {
        if let FinalizeOutcome::Failed(e) = &outcome {
            self.last_error = Some(e.to_string());
        }

        self.set_state(SchedulerState::Idle);
        tracing::info!("会话 {} 已停止: {:?}", session_id, outcome);
        if let Some(reply) = reply {
            let _ = reply.send(Ok(outcome));
        }
    }
}

/// 会话控制Handle
#[derive(Clone)]
pub struct SessionControlHandle {
    sender: mpsc::Sender<SessionControlCommand>,
}

impl SessionControlHandle {
    /// 开始会话
    pub async fn start(&self, exercise_type: ExerciseType) -> CoachResult<String> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionControlCommand::Start { exercise_type, reply })
            .await
            .map_err(|_| CoachError::ActorUnavailable)?;
        rx.await.map_err(|_| CoachError::ActorUnavailable)?
    }

    /// 停止会话并等待保存完成
    pub async fn stop(&self) -> CoachResult<FinalizeOutcome> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(SessionControlCommand::Stop { reply })
            .await
            .map_err(|_| CoachError::ActorUnavailable)?;
        rx.await.map_err(|_| CoachError::ActorUnavailable)?
    }

    /// 获取状态
    pub async fn status(&self) -> CoachStatus {
        let (reply, rx) = oneshot::channel();
        self.sender.send(SessionControlCommand::Status { reply }).await.ok();
        rx.await.unwrap_or_default()
    }

    /// 健康检查
    pub async fn health_check(&self) -> bool {
        let (reply, rx) = oneshot::channel();

        if self
            .sender
            .send(SessionControlCommand::HealthCheck { reply })
            .await
            .is_err()
        {
            tracing::warn!("Session Control Actor 健康检查失败: 通道已关闭");
            return false;
        }

        match tokio::time::timeout(std::time::Duration::from_secs(5), rx).await {
            Ok(Ok(())) => {
                tracing::debug!("Session Control Actor 健康检查成功");
                true
            }
            Ok(Err(_)) => {
                tracing::warn!("Session Control Actor 健康检查失败: Actor已停止");
                false
            }
            Err(_) => {
                tracing::warn!("Session Control Actor 健康检查失败: 超时(5秒)");
                false
            }
        }
    }
}
