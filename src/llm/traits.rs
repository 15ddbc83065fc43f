//! 远端 Agent 能力抽象
//!
//! 所有后端（OpenAI 兼容 / Scripted Mock）实现 AgentBackend：acquire 获取绑定到某个端点的句柄，
//! 句柄上 invoke 一次远端调用，release 释放。失败统一为 RemoteFailure，由上层分类。

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;

/// 请求上下文中的键值侧通道
pub type ContextMap = BTreeMap<String, serde_json::Value>;

/// 远端失败的结构化提示（由后端尽力填写，None 表示后端无法判断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureHint {
    /// 输入被 guardrail 拒绝
    InputGuardrail,
    /// 输出被 guardrail / 内容策略拒绝
    OutputGuardrail,
    /// 超出内部 turn/step 预算
    MaxTurns,
    /// 模型调用了不存在的工具或产出了无法解析的调用
    ModelBehavior,
    RateLimit,
    /// 连接失败、超时、断流等传输层问题
    Transport,
    /// 调用方配置错误（API Key、模型名等）
    Configuration,
    None,
}

/// 远端调用失败：错误提示、可选 HTTP 状态码、可选请求 ID、可读消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub hint: FailureHint,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(hint: FailureHint, message: impl Into<String>) -> Self {
        Self {
            hint,
            status_code: None,
            request_id: None,
            message: message.into(),
        }
    }

    /// 只有状态码与消息、没有结构化提示的失败
    pub fn http(status_code: u16, message: impl Into<String>) -> Self {
        Self::new(FailureHint::None, message).with_status(status_code)
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{} (status {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteFailure {}

/// 单次远端调用的入参
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub model: &'a str,
    pub endpoint: &'a str,
    pub payload: &'a str,
    pub context: &'a ContextMap,
    pub temperature: f32,
    pub max_tokens: u32,
    pub instructions: &'a str,
    pub enable_guardrails: bool,
    pub trace_id: &'a str,
}

/// 远端调用成功的结果：响应内容 + 需要合并回请求上下文的更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    pub payload: String,
    pub context_updates: ContextMap,
}

impl InvocationOutput {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            context_updates: ContextMap::new(),
        }
    }
}

/// 绑定到单个端点的远端能力句柄，生命周期限定在一次尝试内
#[async_trait]
pub trait AgentHandle: Send {
    async fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvocationOutput, RemoteFailure>;

    /// 释放句柄；必须幂等，且可在 Drop 中调用（不能 await）
    fn release(&mut self);
}

/// 远端能力后端：按端点获取句柄
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn acquire(&self, endpoint: &str) -> Result<Box<dyn AgentHandle>, RemoteFailure>;
}
