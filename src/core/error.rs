//! 错误分类与对外错误
//!
//! - `ErrorKind`：固定的错误分类；
//! - `ClassifiedError`：CallAttemptExecutor 边界处由远端失败转换而来，携带尝试元数据；
//! - `RelayError`：对调用方的唯一错误出口（kind + retriable + details），调用方按 kind 分支，无需字符串匹配。

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    PolicyRejected,
    TurnLimitExceeded,
    BehaviorError,
    TransportError,
    ConfigurationError,
    RateLimited,
    UnknownError,
    /// 所有候选都已尝试且全部失败
    AggregateExhausted,
    /// 调用方取消了本次逻辑请求
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PolicyRejected => "PolicyRejected",
            ErrorKind::TurnLimitExceeded => "TurnLimitExceeded",
            ErrorKind::BehaviorError => "BehaviorError",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::UnknownError => "UnknownError",
            ErrorKind::AggregateExhausted => "AggregateExhausted",
            ErrorKind::Cancelled => "Cancelled",
        }
    }

    /// 该类错误是否值得在同一候选上重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ErrorKind::BehaviorError | ErrorKind::TransportError | ErrorKind::RateLimited
        )
    }

    /// 换模型 / 换端点也会原样复现的错误，出现后不再尝试后续候选
    pub fn halts_fallback(&self) -> bool {
        matches!(
            self,
            ErrorKind::PolicyRejected | ErrorKind::ConfigurationError | ErrorKind::Cancelled
        )
    }

    /// 给调用方的补救建议
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::PolicyRejected => {
                "The request was refused by a content policy; rephrase it so it complies with safety guidelines."
            }
            ErrorKind::TurnLimitExceeded => {
                "The agent hit its turn limit; narrow the request or split it into smaller steps."
            }
            ErrorKind::BehaviorError => {
                "The model produced an invalid tool call; the query may be too complex, try rephrasing it."
            }
            ErrorKind::TransportError => {
                "The backend reported a server error; retry later or split a complex query into simpler ones."
            }
            ErrorKind::ConfigurationError => {
                "Check the API key, the model name and the proxy endpoint configuration."
            }
            ErrorKind::RateLimited => "The backend is rate limiting requests; wait before resubmitting.",
            ErrorKind::UnknownError => "Unexpected failure; check that the MCP proxy is running and retry.",
            ErrorKind::AggregateExhausted => {
                "Every configured model and endpoint failed; check backend availability before resubmitting."
            }
            ErrorKind::Cancelled => "The request was cancelled before it completed.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次尝试的元数据（由执行器在分类后填写）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttemptMeta {
    pub retry_index: u32,
    pub candidate_index: usize,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub status_code: Option<u16>,
    pub request_id: Option<String>,
    /// 原始失败的可读描述
    pub cause: Option<String>,
}

/// 已分类错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub retriable: bool,
    pub meta: AttemptMeta,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: kind.is_retriable(),
            meta: AttemptMeta::default(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    pub fn with_meta(mut self, meta: AttemptMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn at_retry(mut self, retry_index: u32) -> Self {
        self.meta.retry_index = retry_index;
        self
    }

    pub fn at_candidate(mut self, candidate_index: usize, model: &str, endpoint: &str) -> Self {
        self.meta.candidate_index = candidate_index;
        self.meta.model = Some(model.to_string());
        self.meta.endpoint = Some(endpoint.to_string());
        self
    }

    /// 元数据展开为 details 键值
    fn details(&self) -> BTreeMap<String, Value> {
        let mut details = BTreeMap::new();
        let meta = &self.meta;
        details.insert("retry_index".into(), json!(meta.retry_index));
        details.insert("candidate_index".into(), json!(meta.candidate_index));
        if let Some(model) = &meta.model {
            details.insert("model".into(), json!(model));
        }
        if let Some(endpoint) = &meta.endpoint {
            details.insert("endpoint".into(), json!(endpoint));
        }
        if let Some(code) = meta.status_code {
            details.insert("status_code".into(), json!(code));
        }
        if let Some(request_id) = &meta.request_id {
            details.insert("request_id".into(), json!(request_id));
        }
        if let Some(cause) = &meta.cause {
            details.insert("cause".into(), json!(cause));
        }
        details
    }
}

/// 重试协调器的终止状态（区分「重试耗尽」与「遇到不可恢复错误立即停止」）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TerminalState {
    ExhaustedRetriable,
    FailedTerminal,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalState::ExhaustedRetriable => "ExhaustedRetriable",
            TerminalState::FailedTerminal => "FailedTerminal",
        }
    }
}

/// 对调用方暴露的结构化错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
    pub retriable: bool,
    pub details: BTreeMap<String, Value>,
}

impl RelayError {
    /// 单个候选上停止（短路或最后一个候选）时的错误
    pub fn from_classified(err: &ClassifiedError, state: TerminalState, attempts: u32) -> Self {
        let mut details = err.details();
        details.insert("attempts".into(), json!(attempts));
        details.insert("terminal_state".into(), json!(state.as_str()));
        details.insert("suggestion".into(), json!(err.kind.suggestion()));
        Self {
            kind: err.kind,
            message: err.message.clone(),
            retriable: err.retriable,
            details,
        }
    }

    /// 所有候选耗尽：保留最后一个分类错误与尝试过的候选数
    pub fn aggregate(last: &ClassifiedError, candidates_tried: usize, passes: u32) -> Self {
        let mut details = last.details();
        details.insert("candidates_tried".into(), json!(candidates_tried));
        details.insert("passes".into(), json!(passes));
        details.insert("last_error_kind".into(), json!(last.kind.as_str()));
        details.insert("last_error".into(), json!(last.message));
        details.insert(
            "suggestion".into(),
            json!(ErrorKind::AggregateExhausted.suggestion()),
        );
        Self {
            kind: ErrorKind::AggregateExhausted,
            message: format!(
                "all {candidates_tried} candidates failed; last error: {}",
                last
            ),
            retriable: last.retriable,
            details,
        }
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}
