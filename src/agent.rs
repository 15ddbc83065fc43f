//! Headless Agent 运行时
//!
//! 供上层前端（CLI、聊天机器人、HTTP API）调用：process_message 为每条用户消息生成 trace id、
//! 构建 RequestContext、跑 FallbackOrchestrator，并返回最终回复与更新后的上下文。
//! 前端需要「流式」输出时，AgentReply::into_stream 将完整回复按词切块。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::{self, Stream};
use tokio_util::sync::CancellationToken;

use crate::config::{load_settings, RelaySettings};
use crate::core::{FallbackOrchestrator, RelayError, RequestContext};
use crate::llm::{AgentBackend, ContextMap, OpenAiBackend};

/// 一次成功请求的回复
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    /// 合并了调用方更新与远端更新后的上下文
    pub context: ContextMap,
    pub trace_id: String,
    pub model: String,
    pub endpoint: String,
}

impl AgentReply {
    /// 按空白切分的词块，每块后跟一个空格
    pub fn into_stream(self) -> impl Stream<Item = String> + Send + 'static {
        let chunks: Vec<String> = self
            .text
            .split_whitespace()
            .map(|word| format!("{word} "))
            .collect();
        stream::iter(chunks)
    }
}

/// 持有配置快照与后端，可被多个并发请求共享（请求之间无共享可变状态）
pub struct AgentManager {
    settings: Arc<RelaySettings>,
    orchestrator: FallbackOrchestrator,
}

impl AgentManager {
    pub fn new(settings: Arc<RelaySettings>, backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            settings,
            orchestrator: FallbackOrchestrator::new(backend),
        }
    }

    /// 从配置文件 / 环境变量加载设置，并使用 OpenAI 兼容后端
    pub fn from_config_file(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let settings = load_settings(config_path).context("Failed to load relay settings")?;
        tracing::info!(
            model = %settings.agent.model,
            endpoint = %settings.endpoints.primary,
            "agent manager configured"
        );
        Ok(Self::new(settings, Arc::new(OpenAiBackend::new(None))))
    }

    pub fn settings(&self) -> &Arc<RelaySettings> {
        &self.settings
    }

    /// 处理一条用户消息；context_update 会先合并进本次请求的上下文
    pub async fn process_message(
        &self,
        message: &str,
        context_update: Option<ContextMap>,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, RelayError> {
        let mut ctx = RequestContext::new(message, Arc::clone(&self.settings));
        if let Some(update) = context_update {
            ctx.merge(update);
        }
        tracing::info!(trace_id = %ctx.trace_id, "processing message");

        let response = self.orchestrator.execute(&mut ctx, cancel).await?;
        Ok(AgentReply {
            text: response.payload,
            context: ctx.context,
            trace_id: ctx.trace_id,
            model: response.model,
            endpoint: response.endpoint,
        })
    }
}
