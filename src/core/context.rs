//! 单次逻辑请求的状态：用户消息、上下文侧通道、配置快照与重试预算

use std::sync::Arc;
use std::time::Duration;

use crate::config::RelaySettings;
use crate::llm::ContextMap;

/// 一次逻辑请求的上下文，由调用方独占，不跨并发请求共享
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub payload: String,
    /// 跨尝试携带的键值侧通道，成功调用返回的更新会合并进来
    pub context: ContextMap,
    pub settings: Arc<RelaySettings>,
    pub trace_id: String,
}

impl RequestContext {
    pub fn new(payload: impl Into<String>, settings: Arc<RelaySettings>) -> Self {
        Self {
            payload: payload.into(),
            context: ContextMap::new(),
            settings,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// 合并远端返回的上下文更新（同名键覆盖）
    pub fn merge(&mut self, updates: ContextMap) {
        self.context.extend(updates);
    }

    /// 为一个候选创建全新的重试预算
    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget::new(self.settings.retry.max_attempts, self.settings.retry.base_delay)
    }
}

/// 单个候选上的重试预算，按候选新建，不复用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    max_attempts: u32,
    base_delay: Duration,
    used: u32,
}

impl RetryBudget {
    /// max_attempts 至少为 1
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            used: 0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    /// 记一次尝试，返回本次尝试的重试序号（从 0 开始）
    pub fn consume(&mut self) -> u32 {
        let index = self.used;
        self.used += 1;
        index
    }

    /// 在 retry_index 失败后是否还能再试
    pub fn allows_retry_after(&self, retry_index: u32) -> bool {
        retry_index + 1 < self.max_attempts
    }
}
