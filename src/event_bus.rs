// 事件总线 - 核心循环与显示层之间的通信
//
// 实现发布/订阅模式，画面、反馈、通知和页面跳转都以事件形式发出
// 使用 tokio::sync::broadcast 实现高效的事件分发

use crate::logger::LogMessage;
use crate::models::{ExerciseType, SchedulerState};
use std::sync::Arc;
use tokio::sync::broadcast;

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// 单个分析周期的结果类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    Completed,
    Skipped,
    Failed,
}

/// 应用事件枚举
#[derive(Debug, Clone)]
pub enum AppEvent {
    // --- 采集事件 ---

    /// 会话开始（摄像头已打开）
    CaptureStarted {
        session_id: String,
        exercise_type: ExerciseType,
    },

    /// 会话结束（摄像头已释放）
    CaptureStopped {
        session_id: String,
    },

    /// 调度器状态变化
    StateChanged {
        state: SchedulerState,
    },

    // --- 显示事件 ---

    /// 标注画面更新（只显示最新一帧）
    OverlayUpdated {
        session_id: String,
        image: Arc<Vec<u8>>,
    },

    /// 反馈面板内容更新
    FeedbackUpdated {
        messages: Vec<String>,
    },

    /// 分析周期结束
    CycleFinished {
        session_id: String,
        status: CycleStatus,
    },

    // --- 会话收尾事件 ---

    /// 临时通知
    Notification {
        level: NoticeLevel,
        message: String,
    },

    /// 页面跳转
    Navigate {
        route: String,
    },

    /// 会话已保存
    SessionSaved {
        session_id: String,
    },

    /// 会话未保存（无反馈或未登录）
    SessionDropped {
        session_id: String,
        reason: String,
    },

    // --- 系统事件 ---

    /// 日志转发
    Log(LogMessage),
}

/// 事件总线
///
/// 使用 broadcast channel 实现发布/订阅模式
/// 支持多个订阅者同时接收事件
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    ///
    /// # 参数
    /// - `capacity`: 事件缓冲区大小,建议 100-1000
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件
    ///
    /// 如果没有订阅者,事件会被丢弃(这是正常的)
    pub fn publish(&self, event: AppEvent) {
        // 日志事件本身不再记录日志，避免递归
        let is_log = matches!(event, AppEvent::Log(_));
        match self.sender.send(event) {
            Ok(receiver_count) if !is_log => {
                tracing::trace!("事件已发布，订阅者数量: {}", receiver_count);
            }
            Err(_) if !is_log => {
                tracing::trace!("事件已发布但无订阅者");
            }
            _ => {}
        }
    }

    /// 订阅事件
    ///
    /// 返回一个接收器,可以用 `.recv().await` 接收事件
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// 获取当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
