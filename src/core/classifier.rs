//! 错误分类器
//!
//! 将 RemoteFailure 按固定优先级映射为 ClassifiedError。结构化字段（FailureHint、HTTP 状态码）优先；
//! 消息文本匹配只是后端没有给出结构化信息时的兜底。未知错误一律视为不可重试（fail closed）。

use std::sync::LazyLock;

use regex::Regex;

use crate::core::error::{AttemptMeta, ClassifiedError, ErrorKind};
use crate::llm::{FailureHint, RemoteFailure};

/// 明确表示限流的状态码
const RATE_LIMIT_STATUS: u16 = 429;

static SERVER_ERROR_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [
        r"(?i)server_error",
        r"(?i)internal server error",
        r"(?i)bad gateway",
        r"(?i)service unavailable",
        r"(?i)gateway timeout",
        r"(?i)overloaded",
    ];
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
});

static RATE_LIMIT_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    let patterns = [r"(?i)rate.?limit", r"(?i)too many requests"];
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
});

fn matches_any(signatures: &[Regex], message: &str) -> bool {
    signatures.iter().any(|re| re.is_match(message))
}

/// 纯函数式分类器，无状态
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 分类远端失败；返回的元数据只含状态码、请求 ID 与原因，候选与重试序号由执行器补齐
    pub fn classify(&self, failure: &RemoteFailure) -> ClassifiedError {
        let kind = Self::kind_of(failure);
        ClassifiedError::new(kind, failure.message.clone()).with_meta(AttemptMeta {
            status_code: failure.status_code,
            request_id: failure.request_id.clone(),
            cause: Some(failure.to_string()),
            ..AttemptMeta::default()
        })
    }

    fn kind_of(failure: &RemoteFailure) -> ErrorKind {
        match failure.hint {
            FailureHint::InputGuardrail | FailureHint::OutputGuardrail => {
                return ErrorKind::PolicyRejected
            }
            FailureHint::MaxTurns => return ErrorKind::TurnLimitExceeded,
            FailureHint::ModelBehavior => return ErrorKind::BehaviorError,
            _ => {}
        }

        let status = failure.status_code;
        if status.is_some_and(|code| code >= 500)
            || (status.is_none() && failure.hint == FailureHint::Transport)
            || matches_any(&SERVER_ERROR_SIGNATURES, &failure.message)
        {
            return ErrorKind::TransportError;
        }

        if status.is_some_and(|code| (400..500).contains(&code) && code != RATE_LIMIT_STATUS)
            || failure.hint == FailureHint::Configuration
        {
            return ErrorKind::ConfigurationError;
        }

        if status == Some(RATE_LIMIT_STATUS)
            || failure.hint == FailureHint::RateLimit
            || matches_any(&RATE_LIMIT_SIGNATURES, &failure.message)
        {
            return ErrorKind::RateLimited;
        }

        ErrorKind::UnknownError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(failure: RemoteFailure) -> ClassifiedError {
        ErrorClassifier::new().classify(&failure)
    }

    #[test]
    fn test_all_signatures_compile() {
        assert_eq!(SERVER_ERROR_SIGNATURES.len(), 6);
        assert_eq!(RATE_LIMIT_SIGNATURES.len(), 2);
    }

    #[test]
    fn test_guardrail_is_policy_rejected() {
        let err = classify(RemoteFailure::new(FailureHint::InputGuardrail, "tripwire triggered"));
        assert_eq!(err.kind, ErrorKind::PolicyRejected);
        assert!(!err.retriable);

        // guardrail 优先于状态码
        let err = classify(
            RemoteFailure::new(FailureHint::OutputGuardrail, "content filtered").with_status(500),
        );
        assert_eq!(err.kind, ErrorKind::PolicyRejected);
    }

    #[test]
    fn test_turn_limit_and_behavior() {
        let err = classify(RemoteFailure::new(FailureHint::MaxTurns, "max turns (10) exceeded"));
        assert_eq!(err.kind, ErrorKind::TurnLimitExceeded);
        assert!(!err.retriable);

        let err = classify(RemoteFailure::new(FailureHint::ModelBehavior, "tool not found: foo"));
        assert_eq!(err.kind, ErrorKind::BehaviorError);
        assert!(err.retriable);
    }

    #[test]
    fn test_server_errors_are_transport() {
        for code in [500, 502, 503, 504] {
            let err = classify(RemoteFailure::http(code, "upstream failed"));
            assert_eq!(err.kind, ErrorKind::TransportError, "status {code}");
            assert!(err.retriable);
            assert_eq!(err.meta.status_code, Some(code));
        }

        let err = classify(RemoteFailure::new(
            FailureHint::None,
            "Error code: server_error - the server had an error",
        ));
        assert_eq!(err.kind, ErrorKind::TransportError);

        let err = classify(RemoteFailure::new(FailureHint::Transport, "connection reset by peer"));
        assert_eq!(err.kind, ErrorKind::TransportError);
    }

    #[test]
    fn test_client_errors_are_configuration() {
        for code in [400, 401, 403, 404, 422] {
            let err = classify(RemoteFailure::http(code, "bad request"));
            assert_eq!(err.kind, ErrorKind::ConfigurationError, "status {code}");
            assert!(!err.retriable);
        }

        let err = classify(RemoteFailure::new(FailureHint::Configuration, "model does not exist"));
        assert_eq!(err.kind, ErrorKind::ConfigurationError);
    }

    #[test]
    fn test_rate_limit() {
        let err = classify(RemoteFailure::http(429, "slow down"));
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retriable);

        let err = classify(RemoteFailure::new(FailureHint::RateLimit, "quota"));
        assert_eq!(err.kind, ErrorKind::RateLimited);

        let err = classify(RemoteFailure::new(FailureHint::None, "Rate limit reached for requests"));
        assert_eq!(err.kind, ErrorKind::RateLimited);
    }

    #[test]
    fn test_unknown_fails_closed() {
        let err = classify(
            RemoteFailure::new(FailureHint::None, "something odd happened").with_request_id("req_1"),
        );
        assert_eq!(err.kind, ErrorKind::UnknownError);
        assert!(!err.retriable);
        assert_eq!(err.meta.request_id.as_deref(), Some("req_1"));
    }
}
