//! OpenAI 兼容后端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点：候选端点即 API base（如 MCP 代理暴露的兼容接口）。
//! 每次 acquire 建一个绑定到该端点的 Client；instructions 作为 system 消息，非空上下文以 JSON 附加为第二条 system 消息。
//! 错误尽量映射为结构化 FailureHint / 状态码，交给分类器处理。

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, FinishReason,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{
    AgentBackend, AgentHandle, FailureHint, Invocation, InvocationOutput, RemoteFailure,
};

/// OpenAI 兼容后端：持有 API Key，按端点创建句柄
pub struct OpenAiBackend {
    api_key: Option<String>,
}

impl OpenAiBackend {
    /// api_key 为空时读取环境变量 OPENAI_API_KEY
    pub fn new(api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|key| !key.trim().is_empty());
        Self { api_key }
    }
}

#[async_trait]
impl AgentBackend for OpenAiBackend {
    async fn acquire(&self, endpoint: &str) -> Result<Box<dyn AgentHandle>, RemoteFailure> {
        let Some(api_key) = &self.api_key else {
            return Err(RemoteFailure::new(
                FailureHint::Configuration,
                "OPENAI_API_KEY not found in environment variables",
            ));
        };
        let config = OpenAIConfig::new()
            .with_api_base(endpoint)
            .with_api_key(api_key.clone());
        Ok(Box::new(OpenAiHandle {
            client: Some(Client::with_config(config)),
        }))
    }
}

struct OpenAiHandle {
    client: Option<Client<OpenAIConfig>>,
}

impl OpenAiHandle {
    fn messages(invocation: &Invocation<'_>) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages = Vec::with_capacity(3);
        messages.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(invocation.instructions)
                .build()?,
        ));
        if !invocation.context.is_empty() {
            let context = serde_json::to_string(invocation.context).unwrap_or_default();
            messages.push(ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(format!("Conversation context: {context}"))
                    .build()?,
            ));
        }
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(invocation.payload)
                .build()?,
        ));
        Ok(messages)
    }
}

#[async_trait]
impl AgentHandle for OpenAiHandle {
    async fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvocationOutput, RemoteFailure> {
        let Some(client) = &self.client else {
            return Err(RemoteFailure::new(FailureHint::None, "handle already released"));
        };

        let request = CreateChatCompletionRequestArgs::default()
            .model(invocation.model)
            .messages(Self::messages(invocation).map_err(to_failure)?)
            .temperature(invocation.temperature)
            .max_completion_tokens(invocation.max_tokens)
            .build()
            .map_err(to_failure)?;

        tracing::debug!(
            model = invocation.model,
            endpoint = invocation.endpoint,
            trace_id = invocation.trace_id,
            "chat completion request"
        );
        let response = client.chat().create(request).await.map_err(to_failure)?;

        let Some(choice) = response.choices.first() else {
            return Err(RemoteFailure::new(FailureHint::ModelBehavior, "response has no choices")
                .with_request_id(response.id.clone()));
        };
        if matches!(choice.finish_reason, Some(FinishReason::ContentFilter)) {
            return Err(RemoteFailure::new(
                FailureHint::OutputGuardrail,
                "output was blocked by the content filter",
            )
            .with_request_id(response.id.clone()));
        }

        Ok(InvocationOutput::text(
            choice.message.content.clone().unwrap_or_default(),
        ))
    }

    fn release(&mut self) {
        self.client = None;
    }
}

/// OpenAI 错误 → RemoteFailure
fn to_failure(err: OpenAIError) -> RemoteFailure {
    match err {
        OpenAIError::ApiError(api) => {
            let hint = api
                .r#type
                .as_deref()
                .map(hint_for_api_error_type)
                .unwrap_or(FailureHint::None);
            RemoteFailure::new(hint, api.message)
        }
        OpenAIError::Reqwest(e) => {
            let hint = if e.is_timeout() || e.is_connect() {
                FailureHint::Transport
            } else {
                FailureHint::None
            };
            let failure = RemoteFailure::new(hint, e.to_string());
            match e.status() {
                Some(status) => failure.with_status(status.as_u16()),
                None => failure,
            }
        }
        OpenAIError::InvalidArgument(msg) => RemoteFailure::new(FailureHint::Configuration, msg),
        other => RemoteFailure::new(FailureHint::None, other.to_string()),
    }
}

fn hint_for_api_error_type(kind: &str) -> FailureHint {
    match kind {
        "server_error" | "service_unavailable" => FailureHint::Transport,
        "rate_limit_exceeded" | "requests" | "tokens" => FailureHint::RateLimit,
        "invalid_request_error" | "authentication_error" | "permission_error"
        | "not_found_error" | "insufficient_quota" => FailureHint::Configuration,
        _ => FailureHint::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_type_hints() {
        assert_eq!(hint_for_api_error_type("server_error"), FailureHint::Transport);
        assert_eq!(hint_for_api_error_type("rate_limit_exceeded"), FailureHint::RateLimit);
        assert_eq!(
            hint_for_api_error_type("invalid_request_error"),
            FailureHint::Configuration
        );
        assert_eq!(hint_for_api_error_type("something_new"), FailureHint::None);
    }

    #[test]
    fn test_invalid_argument_is_configuration() {
        let failure = to_failure(OpenAIError::InvalidArgument("bad model".into()));
        assert_eq!(failure.hint, FailureHint::Configuration);
        assert_eq!(failure.message, "bad model");
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_acquire() {
        let backend = OpenAiBackend { api_key: None };
        let err = backend.acquire("http://localhost:1/v1").await.err().unwrap();
        assert_eq!(err.hint, FailureHint::Configuration);
    }

    #[tokio::test]
    async fn test_release_drops_client() {
        let backend = OpenAiBackend::new(Some("sk-test"));
        let mut handle = backend.acquire("http://localhost:1/v1").await.unwrap();
        handle.release();
        handle.release();
    }
}
