// 日志系统 - 控制台 + 按天滚动的文件，并可推送到事件总线

use crate::event_bus::{AppEvent, EventBus};
use crate::models::LoggerSettings;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::field::{Field, Visit};
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// 转发到事件总线的日志
#[derive(Clone, Debug, serde::Serialize)]
pub struct LogMessage {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// 日志转发器
///
/// 日志系统先于事件总线初始化，总线就绪后再通过 `set_event_bus` 接上
#[derive(Default)]
pub struct LogBroadcaster {
    bus: RwLock<Option<Arc<EventBus>>>,
    disabled: AtomicBool,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_event_bus(&self, bus: Arc<EventBus>) {
        if let Ok(mut slot) = self.bus.write() {
            *slot = Some(bus);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.disabled.store(!enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled.load(Ordering::Relaxed)
    }

    fn forward(&self, log: LogMessage) {
        if !self.is_enabled() {
            return;
        }
        let bus = self.bus.read().ok().and_then(|slot| slot.clone());
        if let Some(bus) = bus {
            bus.publish(AppEvent::Log(log));
        }
    }
}

/// 只提取 `message` 字段
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" && self.message.is_none() {
            self.message = Some(format!("{:?}", value));
        }
    }
}

/// 把日志事件推送到事件总线的 Layer
pub struct BusLogLayer {
    broadcaster: Arc<LogBroadcaster>,
}

impl BusLogLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl<S: Subscriber> Layer<S> for BusLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.broadcaster.is_enabled() {
            return;
        }
        let metadata = event.metadata();
        // 事件总线自己的日志不回推，避免循环
        if metadata.target().ends_with("event_bus") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        self.broadcaster.forward(LogMessage {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
        });
    }
}

/// 默认日志目录
pub fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join("Library/Logs/exercise-coach")
    } else if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("exercise-coach").join("logs")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".local/share/exercise-coach/logs")
    }
}

fn parse_level(level: &str) -> tracing::Level {
    level.trim().parse().unwrap_or(tracing::Level::INFO)
}

/// 初始化日志系统（带事件总线推送功能）
pub fn init_with_broadcaster(
    broadcaster: Arc<LogBroadcaster>,
    settings: &LoggerSettings,
) -> Result<(), SetGlobalDefaultError> {
    use tracing_subscriber::fmt::time::LocalTime;
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let log_dir = settings
        .log_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(default_log_dir);

    std::fs::create_dir_all(&log_dir).ok();

    // 配置日志输出到文件（每天轮转）
    let file_appender = tracing_appender::rolling::daily(log_dir.clone(), "coach.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // 保持 guard 在整个程序生命周期
    std::mem::forget(guard);

    let writer = std::io::stdout.and(non_blocking);

    let timer = LocalTime::new(time::macros::format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    ));

    broadcaster.set_enabled(settings.forward_to_bus);
    let bus_layer = BusLogLayer::new(broadcaster);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(parse_level(&settings.level))
        .with_writer(writer)
        .with_timer(timer)
        .with_ansi(cfg!(debug_assertions))
        .finish()
        .with(bus_layer);

    tracing::subscriber::set_global_default(subscriber)?;

    eprintln!("日志文件位置: {:?}", log_dir);
    Ok(())
}
