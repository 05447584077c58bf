// 运动教练 - 摄像头采集与动作反馈循环

// 声明模块
pub mod actors;
pub mod app;
pub mod auth;
pub mod capture;
pub mod error;
pub mod event_bus;
pub mod logger;
pub mod models;
pub mod service;
pub mod session;
pub mod settings;
pub mod utils;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

pub use app::{CoachApp, CoachServices};
pub use error::{CoachError, CoachResult, ServiceError};
pub use event_bus::{AppEvent, EventBus};
pub use models::{CoachSettings, CoachStatus, ExerciseType, SchedulerState};

use auth::UserIdentity;
use capture::FrameDirectoryDevice;
use event_bus::NoticeLevel;
use settings::SettingsManager;

/// 默认配置文件位置
fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("exercise-coach")
        .join("config.json")
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 命令行入口：回放帧目录运行一次会话
///
/// 环境变量：
/// - `COACH_CONFIG`: 配置文件路径
/// - `COACH_FRAMES_DIR`: 帧目录（必填）
/// - `COACH_EXERCISE`: 运动类型，默认 squat
/// - `COACH_USER_EMAIL`: 登录用户，为空时会话不会被保存
/// - `COACH_DURATION_SECS`: 会话时长，默认 10 秒
pub async fn run() -> anyhow::Result<()> {
    let config_path = env_var("COACH_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let settings = Arc::new(
        SettingsManager::new(config_path.clone())
            .await
            .with_context(|| format!("加载配置失败: {:?}", config_path))?,
    );
    let current = settings.get().await;

    // 创建日志广播器
    let log_broadcaster = Arc::new(logger::LogBroadcaster::new());
    logger::init_with_broadcaster(log_broadcaster.clone(), &current.logger)
        .context("初始化日志系统失败")?;

    let frames_dir = env_var("COACH_FRAMES_DIR").context("未设置 COACH_FRAMES_DIR")?;
    let exercise_type = match env_var("COACH_EXERCISE") {
        Some(value) => value.parse::<ExerciseType>().map_err(anyhow::Error::msg)?,
        None => ExerciseType::default(),
    };
    let duration = match env_var("COACH_DURATION_SECS") {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("无效的 COACH_DURATION_SECS: {}", value))?,
        None => 10,
    };

    let device = Arc::new(FrameDirectoryDevice::new(frames_dir));
    let app = CoachApp::bootstrap(settings, device, Some(log_broadcaster)).await?;

    if let Some(email) = env_var("COACH_USER_EMAIL") {
        app.identity()
            .sign_in(UserIdentity {
                email,
                name: String::new(),
                picture: String::new(),
            })
            .map_err(anyhow::Error::msg)?;
    }

    let mut events = app.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AppEvent::FeedbackUpdated { messages }) => {
                    info!("反馈: {}", messages.join(" | "));
                }
                Ok(AppEvent::Notification { level, message }) => match level {
                    NoticeLevel::Success => info!("通知: {}", message),
                    NoticeLevel::Error => warn!("通知: {}", message),
                },
                Ok(AppEvent::Navigate { route }) => info!("跳转: {}", route),
                Ok(AppEvent::SessionDropped { reason, .. }) => info!("会话未保存: {}", reason),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("事件处理落后，跳过 {} 条", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!("开始 {} 会话，持续 {} 秒", exercise_type.display_name(), duration);
    if let Err(e) = app.start(exercise_type).await {
        error!("会话启动失败: {}", e);
        app.shutdown().await;
        printer.abort();
        return Err(e.into());
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => info!("收到中断信号，提前结束会话"),
    }

    let status = app.status().await;
    info!(
        "共完成 {} 个分析周期, 累计 {} 条反馈, 最后错误: {:?}",
        status.cycles_completed, status.feedback_count, status.last_error
    );

    match app.stop().await {
        Ok(outcome) => {
            info!("会话结束: {:?}", outcome);
            if outcome.is_saved() {
                // 等待跳转事件输出
                tokio::time::sleep(Duration::from_millis(current.session.navigate_delay_ms + 100)).await;
            }
        }
        // 视频流提前结束时会话已经自动收尾
        Err(CoachError::NotRunning) => info!("会话已提前结束"),
        Err(e) => error!("停止会话失败: {}", e),
    }

    app.shutdown().await;
    printer.abort();
    Ok(())
}
