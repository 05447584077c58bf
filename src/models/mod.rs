// 数据模型模块 - 定义所有的数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 初始提示文本（未开始运动时显示）
pub const INITIAL_FEEDBACK: &str = "Select an exercise and click Start Exercise";
/// 摄像头不可用时的提示文本
pub const DEVICE_ERROR_FEEDBACK: &str =
    "Error accessing webcam. Please make sure you have granted camera permissions.";
/// 单次分析失败时的提示文本
pub const CYCLE_ERROR_FEEDBACK: &str = "Error processing video frame";
/// 连续失败告警文本
pub const CONNECTION_LOST_NOTICE: &str =
    "Lost connection to the analysis service. Please check that it is running.";
/// 保存成功提示
pub const SESSION_SAVED_NOTICE: &str = "Session saved successfully";
/// 反馈服务尚未支持该运动时的回复
pub const UNSUPPORTED_EXERCISE_FEEDBACK: &str = "I'm not familiar with that exercise yet";

/// 运动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExerciseType {
    Squat,
    Lunge,
    ArmRaise,
    Pushup,
    Plank,
}

impl ExerciseType {
    pub const ALL: [ExerciseType; 5] = [
        Self::Squat,
        Self::Lunge,
        Self::ArmRaise,
        Self::Pushup,
        Self::Plank,
    ];

    /// 接口使用的字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Squat => "squat",
            Self::Lunge => "lunge",
            Self::ArmRaise => "armRaise",
            Self::Pushup => "pushup",
            Self::Plank => "plank",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Squat => "Squat",
            Self::Lunge => "Lunge",
            Self::ArmRaise => "Arm Raise",
            Self::Pushup => "Push-up",
            Self::Plank => "Plank",
        }
    }
}

impl Default for ExerciseType {
    fn default() -> Self {
        Self::Squat
    }
}

impl fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExerciseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("未知的运动类型: {}", s))
    }
}

/// 单个关键点，接口格式为 `[x, y]` 或 `[x, y, confidence, ...]`
///
/// 第三个之后的数值保存在 `extra` 中，回传反馈接口时原样写回
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Keypoint {
    pub x: f64,
    pub y: f64,
    pub confidence: Option<f64>,
    pub extra: Vec<f64>,
}

impl Keypoint {
    pub fn new(x: f64, y: f64, confidence: Option<f64>) -> Self {
        Self {
            x,
            y,
            confidence,
            extra: Vec::new(),
        }
    }
}

impl TryFrom<Vec<f64>> for Keypoint {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        match values.as_slice() {
            [x, y] => Ok(Self::new(*x, *y, None)),
            [x, y, confidence, extra @ ..] => Ok(Self {
                x: *x,
                y: *y,
                confidence: Some(*confidence),
                extra: extra.to_vec(),
            }),
            _ => Err(format!("关键点至少需要2个坐标，实际为 {}", values.len())),
        }
    }
}

impl From<Keypoint> for Vec<f64> {
    fn from(point: Keypoint) -> Self {
        let mut values = vec![point.x, point.y];
        // 没有置信度时不会有额外数值
        if let Some(confidence) = point.confidence {
            values.push(confidence);
            values.extend(point.extra);
        }
        values
    }
}

/// 姿态推理结果
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// 关键点序列（未检测到人时为空）
    pub keypoints: Vec<Keypoint>,
    /// 标注后的图像（JPEG）
    pub annotated_image: Vec<u8>,
}

/// 动作反馈结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub messages: Vec<String>,
}

/// 结束后导出的会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub exercise_type: ExerciseType,
    /// 去重后的反馈，按首次出现顺序
    pub feedback: Vec<String>,
    pub user_email: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// 历史会话（仪表盘使用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecentSession {
    pub exercise_type: String,
    pub summary: String,
    /// 服务端返回的原始时间字符串
    pub created_at: String,
}

impl RecentSession {
    /// 解析创建时间，兼容带时区与不带时区两种格式
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&self.created_at) {
            return Some(parsed.with_timezone(&Utc));
        }
        chrono::NaiveDateTime::parse_from_str(&self.created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// 采集约束（期望分辨率）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 850,
            ideal_height: 480,
        }
    }
}

/// 调度器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Stopping,
}

/// 运行状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoachStatus {
    pub state: SchedulerState,
    pub exercise_type: Option<ExerciseType>,
    /// 当前会话已累计的反馈条数
    pub feedback_count: usize,
    pub cycles_completed: u64,
    pub last_error: Option<String>,
}

impl Default for CoachStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            exercise_type: None,
            feedback_count: 0,
            cycles_completed: 0,
            last_error: None,
        }
    }
}

// ==================== 配置 ====================

/// 远端服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// 服务地址
    pub base_url: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 推理/反馈请求的最大重试次数
    pub max_retries: u32,
    /// 重试基础间隔（毫秒），按次数线性增加
    pub retry_delay_ms: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout_secs: 15,
            connect_timeout_secs: 5,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

/// 分析循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisSettings {
    /// 两个周期之间的间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 反馈请求的最小间隔（毫秒）
    pub feedback_throttle_ms: u64,
    /// JPEG质量(1-100)
    pub jpeg_quality: u8,
    /// 连续失败多少次后发出告警
    pub failure_alert_threshold: u32,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            feedback_throttle_ms: 1500,
            jpeg_quality: 80,
            failure_alert_threshold: 5,
        }
    }
}

/// 会话收尾配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// 保存成功后跳转前的等待时间（毫秒）
    pub navigate_delay_ms: u64,
    /// 历史页面路由
    pub history_route: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            navigate_delay_ms: 3000,
            history_route: "/dashboard".to_string(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    pub level: String,
    /// 是否把日志推送到事件总线
    pub forward_to_bus: bool,
    /// 日志目录，为空时使用平台默认目录
    pub log_dir: Option<String>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            forward_to_bus: true,
            log_dir: None,
        }
    }
}

/// 持久化的完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachSettings {
    pub service: ServiceSettings,
    pub analysis: AnalysisSettings,
    pub capture: CaptureConstraints,
    pub session: SessionSettings,
    pub logger: LoggerSettings,
    /// 额外的占位文本（除内置文本外不计入会话反馈）
    pub extra_placeholders: Vec<String>,
}

impl CoachSettings {
    /// 所有占位文本：内置 + 配置
    pub fn placeholders(&self) -> Vec<String> {
        let mut all: Vec<String> = [
            INITIAL_FEEDBACK,
            DEVICE_ERROR_FEEDBACK,
            CYCLE_ERROR_FEEDBACK,
            SESSION_SAVED_NOTICE,
            UNSUPPORTED_EXERCISE_FEEDBACK,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        all.extend(self.extra_placeholders.iter().cloned());
        all
    }
}

/// 配置更新（字段为空表示不修改）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    pub service: Option<ServiceSettings>,
    pub analysis: Option<AnalysisSettings>,
    pub capture: Option<CaptureConstraints>,
    pub session: Option<SessionSettings>,
    pub logger: Option<LoggerSettings>,
    pub extra_placeholders: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exercise_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExerciseType::ArmRaise).unwrap(),
            "\"armRaise\""
        );
        assert_eq!("pushup".parse::<ExerciseType>().unwrap(), ExerciseType::Pushup);
        assert!("jumping".parse::<ExerciseType>().is_err());
    }

    #[test]
    fn test_keypoint_accepts_optional_confidence() {
        let points: Vec<Keypoint> =
            serde_json::from_str("[[10.5, 20.0, 0.9], [1.0, 2.0]]").unwrap();
        assert_eq!(points[0].confidence, Some(0.9));
        assert_eq!(points[1].confidence, None);

        let short: Result<Vec<Keypoint>, _> = serde_json::from_str("[[1.0]]");
        assert!(short.is_err());

        let json = serde_json::to_string(&points).unwrap();
        assert_eq!(json, "[[10.5,20.0,0.9],[1.0,2.0]]");

        // 附加数值（如可见度）需要原样传回
        let wide: Vec<Keypoint> = serde_json::from_str("[[10.0, 20.0, 0.9, 1.0]]").unwrap();
        assert_eq!(wide[0].confidence, Some(0.9));
        assert_eq!(wide[0].extra, vec![1.0]);
        assert_eq!(serde_json::to_string(&wide).unwrap(), "[[10.0,20.0,0.9,1.0]]");
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: CoachSettings =
            serde_json::from_str(r#"{"analysis": {"feedback_throttle_ms": 2000}}"#).unwrap();
        assert_eq!(settings.analysis.feedback_throttle_ms, 2000);
        assert_eq!(settings.analysis.jpeg_quality, 80);
        assert_eq!(settings.service.base_url, "http://localhost:8000");
        assert_eq!(settings.capture.ideal_width, 850);
    }

    #[test]
    fn test_recent_session_time_formats() {
        let naive = RecentSession {
            exercise_type: "squat".into(),
            summary: "Nice".into(),
            created_at: "2024-03-01T10:15:30.123456".into(),
        };
        assert!(naive.created_at_utc().is_some());

        let zoned = RecentSession {
            created_at: "2024-03-01T10:15:30+08:00".into(),
            ..naive
        };
        assert_eq!(
            zoned.created_at_utc().unwrap().to_rfc3339(),
            "2024-03-01T02:15:30+00:00"
        );
    }
}
