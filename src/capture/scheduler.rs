// 分析调度器 - 负责 采样→姿态推理→（节流的）动作反馈 循环
//
// 每个周期顺序执行，上一周期完全结束后才等待下一个间隔，
// 因此同一时刻最多只有一个推理请求和一个反馈请求在途。
// 停止时丢弃正在进行的周期，迟到的结果不会再写入会话

use super::{Frame, FrameSampler, VideoStream};
use crate::error::CoachError;
use crate::event_bus::{AppEvent, CycleStatus, EventBus, NoticeLevel};
use crate::models::{AnalysisSettings, FeedbackResult, CONNECTION_LOST_NOTICE, CYCLE_ERROR_FEEDBACK};
use crate::service::{FeedbackClient, InferenceClient};
use crate::session::SessionContext;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 调度参数
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// 周期结束到下一周期开始的间隔
    pub tick_interval: Duration,
    /// 反馈请求的最小间隔（按请求开始时间计算）
    pub feedback_throttle: Duration,
    /// 连续失败告警阈值，0 表示不告警
    pub failure_alert_threshold: u32,
}

impl From<&AnalysisSettings> for SchedulerConfig {
    fn from(settings: &AnalysisSettings) -> Self {
        Self {
            tick_interval: Duration::from_millis(settings.tick_interval_ms),
            feedback_throttle: Duration::from_millis(settings.feedback_throttle_ms),
            failure_alert_threshold: settings.failure_alert_threshold,
        }
    }
}

/// 跳过周期的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 视频流尚未解码出画面
    FrameNotReady,
    /// 调度器已停止，结果被丢弃
    Stale,
}

/// 成功周期的摘要
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub keypoint_count: usize,
    /// 被节流时为 None
    pub feedback: Option<FeedbackResult>,
    /// 新收录进会话的反馈条数
    pub merged: usize,
}

/// 单个周期的结果
#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    Failed(CoachError),
}

/// 反馈节流器
#[derive(Debug)]
pub struct FeedbackThrottle {
    interval: Duration,
    last_call: Option<Instant>,
}

impl FeedbackThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_call: None,
        }
    }

    /// 若距上次调用已超过间隔则占用本次调用并返回 true
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_call {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last_call = Some(now);
                true
            }
        }
    }
}

/// 循环内部状态
#[derive(Debug)]
pub struct LoopState {
    pub throttle: FeedbackThrottle,
    pub consecutive_failures: u32,
    pub cycles: u64,
}

impl LoopState {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            throttle: FeedbackThrottle::new(config.feedback_throttle),
            consecutive_failures: 0,
            cycles: 0,
        }
    }
}

/// 循环运行统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub cycles: u64,
    pub feedback_count: usize,
    pub last_error: Option<String>,
}

/// 循环退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// 用户停止
    Cancelled,
    /// 视频流已结束（设备断开等）
    CaptureEnded,
}

/// 循环结束后交还的会话
#[derive(Debug)]
pub struct SchedulerExit {
    pub context: SessionContext,
    pub reason: ExitReason,
    pub cycles: u64,
}

/// 视频流意外结束时的回调
pub type CaptureEndedHook = Box<dyn FnOnce() + Send>;

/// 正在运行的分析循环
pub struct RunningLoop {
    cancel: watch::Sender<bool>,
    stats: watch::Receiver<LoopStats>,
    join: JoinHandle<SchedulerExit>,
}

impl RunningLoop {
    /// 停止调度后续周期
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// 停止并等待循环交还会话
    pub async fn stop(self) -> Option<SchedulerExit> {
        self.cancel();
        match self.join.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!("分析任务异常退出: {}", e);
                None
            }
        }
    }

    pub fn stats(&self) -> LoopStats {
        self.stats.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// 分析调度器
pub struct AnalyzeScheduler {
    sampler: FrameSampler,
    inference: Arc<dyn InferenceClient>,
    feedback: Arc<dyn FeedbackClient>,
    event_bus: Arc<EventBus>,
    config: SchedulerConfig,
}

impl AnalyzeScheduler {
    pub fn new(
        sampler: FrameSampler,
        inference: Arc<dyn InferenceClient>,
        feedback: Arc<dyn FeedbackClient>,
        event_bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        info!(
            "调度器配置: 周期间隔={:?}, 反馈节流={:?}, 告警阈值={}",
            config.tick_interval, config.feedback_throttle, config.failure_alert_threshold
        );
        Self {
            sampler,
            inference,
            feedback,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 截取当前画面，解码缩放和 JPEG 编码放在阻塞线程池中执行
    async fn sample_frame(&self, stream: &Arc<dyn VideoStream>) -> Option<Frame> {
        let sampler = self.sampler;
        let stream = stream.clone();
        match tokio::task::spawn_blocking(move || sampler.sample(stream.as_ref())).await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("采样任务异常退出: {}", e);
                None
            }
        }
    }

    /// 执行一个分析周期
    ///
    /// 每次等待远端结果后都会检查是否已停止，已停止则丢弃结果
    pub async fn run_cycle(
        &self,
        stream: &Arc<dyn VideoStream>,
        ctx: &mut SessionContext,
        state: &mut LoopState,
        cancel: &watch::Receiver<bool>,
    ) -> CycleOutcome {
        let Some(frame) = self.sample_frame(stream).await else {
            return CycleOutcome::Skipped(SkipReason::FrameNotReady);
        };

        let inference = match self.inference.estimate(&frame).await {
            Ok(result) => result,
            Err(e) => return CycleOutcome::Failed(CoachError::Inference(e)),
        };
        drop(frame);

        if *cancel.borrow() {
            debug!("会话 {} 已停止，丢弃迟到的推理结果", ctx.id());
            return CycleOutcome::Skipped(SkipReason::Stale);
        }

        let keypoint_count = inference.keypoints.len();
        self.event_bus.publish(AppEvent::OverlayUpdated {
            session_id: ctx.id().to_string(),
            image: Arc::new(inference.annotated_image),
        });

        if !state.throttle.try_acquire(Instant::now()) {
            trace!("反馈请求被节流");
            return CycleOutcome::Completed(CycleReport {
                keypoint_count,
                feedback: None,
                merged: 0,
            });
        }

        let feedback = match self
            .feedback
            .analyze(&inference.keypoints, ctx.exercise_type())
            .await
        {
            Ok(result) => result,
            Err(e) => return CycleOutcome::Failed(CoachError::Feedback(e)),
        };

        if *cancel.borrow() {
            debug!("会话 {} 已停止，丢弃迟到的反馈结果", ctx.id());
            return CycleOutcome::Skipped(SkipReason::Stale);
        }

        self.event_bus.publish(AppEvent::FeedbackUpdated {
            messages: feedback.messages.clone(),
        });
        let merged = ctx.merge(&feedback.messages);

        CycleOutcome::Completed(CycleReport {
            keypoint_count,
            feedback: Some(feedback),
            merged,
        })
    }

    /// 启动分析循环，会话交由循环独占直到停止
    pub fn spawn(
        self: Arc<Self>,
        stream: Arc<dyn VideoStream>,
        ctx: SessionContext,
        on_capture_ended: Option<CaptureEndedHook>,
    ) -> RunningLoop {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (stats_tx, stats_rx) = watch::channel(LoopStats::default());

        let join = tokio::task::spawn(async move {
            let exit = self.run_loop(stream, ctx, cancel_rx, stats_tx).await;
            if exit.reason == ExitReason::CaptureEnded {
                if let Some(hook) = on_capture_ended {
                    hook();
                }
            }
            exit
        });

        RunningLoop {
            cancel: cancel_tx,
            stats: stats_rx,
            join,
        }
    }

    async fn run_loop(
        &self,
        stream: Arc<dyn VideoStream>,
        mut ctx: SessionContext,
        mut cancel: watch::Receiver<bool>,
        stats: watch::Sender<LoopStats>,
    ) -> SchedulerExit {
        let mut state = LoopState::new(&self.config);
        let cycle_cancel = cancel.clone();
        let mut last_error: Option<String> = None;
        info!("会话 {} 分析循环已启动 ({})", ctx.id(), ctx.exercise_type());

        let reason = loop {
            if *cancel.borrow_and_update() {
                break ExitReason::Cancelled;
            }
            if !stream.is_live() {
                warn!("会话 {} 的视频流已结束", ctx.id());
                break ExitReason::CaptureEnded;
            }

            // 停止信号到达时直接丢弃进行中的周期
            let outcome = tokio::select! {
                biased;
                _ = cancel.changed() => break ExitReason::Cancelled,
                outcome = self.run_cycle(&stream, &mut ctx, &mut state, &cycle_cancel) => outcome,
            };

            if let CycleOutcome::Skipped(SkipReason::Stale) = outcome {
                break ExitReason::Cancelled;
            }
            self.record_outcome(&ctx, &mut state, &outcome);
            if let CycleOutcome::Failed(e) = &outcome {
                last_error = Some(e.to_string());
            }
            stats.send_replace(LoopStats {
                cycles: state.cycles,
                feedback_count: ctx.feedback_count(),
                last_error: last_error.clone(),
            });

            tokio::select! {
                biased;
                _ = cancel.changed() => break ExitReason::Cancelled,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
            }
        };

        info!(
            "会话 {} 分析循环已结束: {:?}, 共 {} 个周期, {} 条反馈",
            ctx.id(),
            reason,
            state.cycles,
            ctx.feedback_count()
        );

        SchedulerExit {
            context: ctx,
            reason,
            cycles: state.cycles,
        }
    }

    /// 处理周期结果：失败显示为临时提示，不中断循环
    fn record_outcome(&self, ctx: &SessionContext, state: &mut LoopState, outcome: &CycleOutcome) {
        state.cycles += 1;
        let session_id = ctx.id().to_string();

        let status = match outcome {
            CycleOutcome::Completed(report) => {
                if state.consecutive_failures > 0 {
                    info!("分析服务已恢复（此前连续失败 {} 次）", state.consecutive_failures);
                }
                state.consecutive_failures = 0;
                trace!(
                    "周期完成: {} 个关键点, 反馈{}",
                    report.keypoint_count,
                    if report.feedback.is_some() { "已更新" } else { "被节流" }
                );
                CycleStatus::Completed
            }
            CycleOutcome::Skipped(reason) => {
                trace!("周期跳过: {:?}", reason);
                CycleStatus::Skipped
            }
            CycleOutcome::Failed(e) => {
                warn!("分析周期失败: {}", e);
                self.event_bus.publish(AppEvent::FeedbackUpdated {
                    messages: vec![CYCLE_ERROR_FEEDBACK.to_string()],
                });

                state.consecutive_failures += 1;
                if self.config.failure_alert_threshold > 0
                    && state.consecutive_failures == self.config.failure_alert_threshold
                {
                    error!("分析服务连续失败 {} 次", state.consecutive_failures);
                    self.event_bus.publish(AppEvent::Notification {
                        level: NoticeLevel::Error,
                        message: CONNECTION_LOST_NOTICE.to_string(),
                    });
                }
                CycleStatus::Failed
            }
        };

        self.event_bus
            .publish(AppEvent::CycleFinished { session_id, status });
    }
}
