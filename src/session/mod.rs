// 会话模块 - 单次运动会话的反馈累积与收尾
//
// SessionContext 在开始时创建并交给调度器独占，停止时由调度器交还，
// 导出后即被消费，不存在全局共享的会话状态

pub mod finalizer;

pub use finalizer::{DropReason, FinalizeOutcome, SessionFinalizer};

use crate::models::{ExerciseType, SessionRecord};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

/// 反馈去重累积器
///
/// 空文本、占位文本和重复文本（大小写敏感的精确匹配）都会被忽略，
/// 其余按首次出现顺序保存
#[derive(Debug, Clone, Default)]
pub struct SessionAggregator {
    placeholders: HashSet<String>,
    seen: HashSet<String>,
    ordered: Vec<String>,
}

impl SessionAggregator {
    pub fn new<I, S>(placeholders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            placeholders: placeholders.into_iter().map(Into::into).collect(),
            seen: HashSet::new(),
            ordered: Vec::new(),
        }
    }

    /// 添加一条反馈，返回是否被收录
    pub fn add(&mut self, message: &str) -> bool {
        if message.trim().is_empty() || self.placeholders.contains(message) {
            return false;
        }
        if !self.seen.insert(message.to_string()) {
            return false;
        }
        self.ordered.push(message.to_string());
        true
    }

    /// 当前反馈（按首次出现顺序）
    pub fn snapshot(&self) -> Vec<String> {
        self.ordered.clone()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// 导出全部反馈，累积器随之消费
    pub fn export(self) -> Vec<String> {
        self.ordered
    }
}

/// 进行中的会话
#[derive(Debug)]
pub struct SessionContext {
    id: String,
    exercise_type: ExerciseType,
    started_at: DateTime<Utc>,
    aggregator: SessionAggregator,
}

impl SessionContext {
    pub fn new(exercise_type: ExerciseType, placeholders: &[String]) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            exercise_type,
            started_at: Utc::now(),
            aggregator: SessionAggregator::new(placeholders.iter().cloned()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn exercise_type(&self) -> ExerciseType {
        self.exercise_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// 合并一批反馈，返回新收录的条数
    pub fn merge(&mut self, messages: &[String]) -> usize {
        let added = messages.iter().filter(|m| self.aggregator.add(m)).count();
        if added > 0 {
            debug!("会话 {} 新增 {} 条反馈，共 {} 条", self.id, added, self.aggregator.len());
        }
        added
    }

    pub fn feedback(&self) -> Vec<String> {
        self.aggregator.snapshot()
    }

    pub fn feedback_count(&self) -> usize {
        self.aggregator.len()
    }

    /// 结束会话并导出记录
    pub fn export(self, user_email: Option<String>) -> SessionRecord {
        SessionRecord {
            id: self.id,
            exercise_type: self.exercise_type,
            feedback: self.aggregator.export(),
            user_email,
            started_at: self.started_at,
            ended_at: Utc::now(),
        }
    }
}
