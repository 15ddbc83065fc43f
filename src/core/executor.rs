//! 单次尝试执行器
//!
//! 获取绑定到候选端点的句柄 → 调用一次远端能力 → 释放句柄；失败在此边界转为 ClassifiedError，
//! 上层不再接触原始 RemoteFailure。句柄由 HandleGuard 持有，任何退出路径（含 future 被取消）都会释放。
//! 执行器本身从不重试。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::core::classifier::ErrorClassifier;
use crate::core::context::RequestContext;
use crate::core::error::ClassifiedError;
use crate::llm::{AgentBackend, AgentHandle, Invocation, InvocationOutput, RemoteFailure};

/// 成功的响应
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub payload: String,
    pub model: String,
    pub endpoint: String,
    pub candidate_index: usize,
    pub retry_index: u32,
}

/// 一次尝试的结果：成功响应或已分类错误，二者恰居其一
pub type AttemptOutcome = Result<AgentResponse, ClassifiedError>;

/// 候选在本次请求中的位置
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub index: usize,
    pub model: &'a str,
    pub endpoint: &'a str,
}

/// 句柄守卫：Drop 时释放句柄
pub struct HandleGuard {
    handle: Box<dyn AgentHandle>,
}

impl HandleGuard {
    pub fn new(handle: Box<dyn AgentHandle>) -> Self {
        Self { handle }
    }

    pub async fn invoke(&mut self, invocation: &Invocation<'_>) -> Result<InvocationOutput, RemoteFailure> {
        self.handle.invoke(invocation).await
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.handle.release();
    }
}

pub struct CallAttemptExecutor {
    backend: Arc<dyn AgentBackend>,
    classifier: ErrorClassifier,
}

impl CallAttemptExecutor {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self {
            backend,
            classifier: ErrorClassifier::new(),
        }
    }

    /// 执行一次尝试；成功时把远端返回的上下文更新合并进 ctx
    pub async fn attempt(
        &self,
        candidate: Candidate<'_>,
        retry_index: u32,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let stamp = |err: ClassifiedError| {
            err.at_candidate(candidate.index, candidate.model, candidate.endpoint)
                .at_retry(retry_index)
        };

        if cancel.is_cancelled() {
            return Err(stamp(ClassifiedError::cancelled()));
        }

        tracing::debug!(
            model = candidate.model,
            endpoint = candidate.endpoint,
            retry_index,
            trace_id = %ctx.trace_id,
            "attempt started"
        );

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(stamp(ClassifiedError::cancelled())),
            acquired = self.backend.acquire(candidate.endpoint) => acquired,
        };
        let mut guard = match acquired {
            Ok(handle) => HandleGuard::new(handle),
            Err(failure) => return Err(stamp(self.classifier.classify(&failure))),
        };

        let result = {
            let settings = &ctx.settings.agent;
            let invocation = Invocation {
                model: candidate.model,
                endpoint: candidate.endpoint,
                payload: &ctx.payload,
                context: &ctx.context,
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
                instructions: &settings.instructions,
                enable_guardrails: settings.enable_guardrails,
                trace_id: &ctx.trace_id,
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = guard.invoke(&invocation) => Some(result),
            }
        };
        drop(guard);

        match result {
            None => Err(stamp(ClassifiedError::cancelled())),
            Some(Ok(output)) => {
                ctx.merge(output.context_updates);
                Ok(AgentResponse {
                    payload: output.payload,
                    model: candidate.model.to_string(),
                    endpoint: candidate.endpoint.to_string(),
                    candidate_index: candidate.index,
                    retry_index,
                })
            }
            Some(Err(failure)) => Err(stamp(self.classifier.classify(&failure))),
        }
    }
}
